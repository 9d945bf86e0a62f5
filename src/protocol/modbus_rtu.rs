//! CRC16-checked request/response frames (Modbus RTU subset).
//!
//! Requests are always 8 bytes: `[address, function, startHi, startLo,
//! valueHi, valueLo, crcLo, crcHi]`. Only the four single-item functions used
//! by the flow controllers and the PLC are supported.

/// Read coils (discrete outputs / inputs)
pub const READ_COILS: u8 = 1;
/// Read holding registers
pub const READ_HOLDING_REGISTERS: u8 = 3;
/// Write a single coil
pub const WRITE_SINGLE_COIL: u8 = 5;
/// Write a single holding register
pub const WRITE_SINGLE_REGISTER: u8 = 6;

const COIL_ON: u16 = 0xFF00;
const COIL_OFF: u16 = 0x0000;

/// CRC16 with initial value `0xFFFF` and reflected polynomial `0xA001`.
pub fn crc16(bytes: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in bytes {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Append the CRC of `frame`, low byte first.
pub fn append_crc(frame: &mut Vec<u8>) {
    let [lo, hi] = crc16(frame).to_le_bytes();
    frame.push(lo);
    frame.push(hi);
}

/// True if the trailing two bytes are the CRC of everything before them.
pub fn validate(frame: &[u8]) -> bool {
    if frame.len() < 4 {
        return false;
    }
    let (body, tail) = frame.split_at(frame.len() - 2);
    crc16(body).to_le_bytes() == [tail[0], tail[1]]
}

/// A single request frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    /// Device address
    pub address: u8,
    /// Function code
    pub function: u8,
    /// First register or coil
    pub start: u16,
    /// Item count for reads, value for writes
    pub value: u16,
}

/// Decoded response payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Register words, big-endian on the wire
    Registers(Vec<u16>),
    /// Coil states, unpacked LSB-first
    Coils(Vec<bool>),
    /// Echo of a single write
    Written {
        /// Register or coil written
        start: u16,
        /// Value echoed back
        value: u16,
    },
}

impl Request {
    /// Read `count` holding registers starting at `register`.
    pub fn read_registers(address: u8, register: u16, count: u16) -> Self {
        Self {
            address,
            function: READ_HOLDING_REGISTERS,
            start: register,
            value: count,
        }
    }

    /// Read `count` coils starting at `coil`.
    pub fn read_coils(address: u8, coil: u16, count: u16) -> Self {
        Self {
            address,
            function: READ_COILS,
            start: coil,
            value: count,
        }
    }

    /// Write one holding register.
    pub fn write_register(address: u8, register: u16, value: u16) -> Self {
        Self {
            address,
            function: WRITE_SINGLE_REGISTER,
            start: register,
            value,
        }
    }

    /// Switch one coil on or off.
    pub fn write_coil(address: u8, coil: u16, on: bool) -> Self {
        Self {
            address,
            function: WRITE_SINGLE_COIL,
            start: coil,
            value: if on { COIL_ON } else { COIL_OFF },
        }
    }

    /// Encode with the trailing CRC.
    pub fn encode(&self) -> Vec<u8> {
        let [start_hi, start_lo] = self.start.to_be_bytes();
        let [value_hi, value_lo] = self.value.to_be_bytes();
        let mut frame = vec![
            self.address,
            self.function,
            start_hi,
            start_lo,
            value_hi,
            value_lo,
        ];
        append_crc(&mut frame);
        frame
    }

    /// Expected response length: `5 + byte_count` for reads, an 8-byte echo
    /// for writes.
    pub fn response_len(&self) -> usize {
        match self.function {
            READ_COILS => 5 + self.payload_len(),
            READ_HOLDING_REGISTERS => 5 + self.payload_len(),
            _ => 8,
        }
    }

    fn payload_len(&self) -> usize {
        let count = usize::from(self.value);
        match self.function {
            READ_COILS => count.div_ceil(8),
            READ_HOLDING_REGISTERS => count * 2,
            _ => 0,
        }
    }

    /// Decode a response to this request. Returns `None` on a wrong length,
    /// CRC mismatch, foreign address or function (including exception replies).
    pub fn parse_response(&self, frame: &[u8]) -> Option<Response> {
        if frame.len() != self.response_len() || !validate(frame) {
            return None;
        }
        if frame[0] != self.address || frame[1] != self.function {
            return None;
        }
        match self.function {
            READ_HOLDING_REGISTERS | READ_COILS => {
                let byte_count = usize::from(frame[2]);
                if byte_count != self.payload_len() {
                    return None;
                }
                let payload = &frame[3..3 + byte_count];
                if self.function == READ_HOLDING_REGISTERS {
                    let words = payload
                        .chunks_exact(2)
                        .map(|w| u16::from_be_bytes([w[0], w[1]]))
                        .collect();
                    Some(Response::Registers(words))
                } else {
                    let bits = (0..usize::from(self.value))
                        .map(|i| payload[i / 8] & (1 << (i % 8)) != 0)
                        .collect();
                    Some(Response::Coils(bits))
                }
            }
            _ => Some(Response::Written {
                start: u16::from_be_bytes([frame[2], frame[3]]),
                value: u16::from_be_bytes([frame[4], frame[5]]),
            }),
        }
    }

    /// Decode a single-register read.
    pub fn parse_register(&self, frame: &[u8]) -> Option<u16> {
        match self.parse_response(frame)? {
            Response::Registers(words) => words.first().copied(),
            _ => None,
        }
    }

    /// Decode a coil read, returning the first payload byte (the packed bits of
    /// up to eight coils).
    pub fn parse_coil_byte(&self, frame: &[u8]) -> Option<u8> {
        match self.parse_response(frame)? {
            Response::Coils(_) => Some(frame[3]),
            _ => None,
        }
    }
}

/// Build a response frame the way a device would. Used by simulated devices.
pub fn encode_response(request: &Request, response: &Response) -> Vec<u8> {
    let mut frame = vec![request.address, request.function];
    match response {
        Response::Registers(words) => {
            frame.push((words.len() * 2) as u8);
            for word in words {
                frame.extend_from_slice(&word.to_be_bytes());
            }
        }
        Response::Coils(bits) => {
            let mut packed = vec![0u8; bits.len().div_ceil(8)];
            for (i, _) in bits.iter().enumerate().filter(|(_, on)| **on) {
                packed[i / 8] |= 1 << (i % 8);
            }
            frame.push(packed.len() as u8);
            frame.extend_from_slice(&packed);
        }
        Response::Written { start, value } => {
            frame.extend_from_slice(&start.to_be_bytes());
            frame.extend_from_slice(&value.to_be_bytes());
        }
    }
    append_crc(&mut frame);
    frame
}

/// Decode an 8-byte request frame. Used by simulated devices.
pub fn decode_request(frame: &[u8]) -> Option<Request> {
    if frame.len() != 8 || !validate(frame) {
        return None;
    }
    Some(Request {
        address: frame[0],
        function: frame[1],
        start: u16::from_be_bytes([frame[2], frame[3]]),
        value: u16::from_be_bytes([frame[4], frame[5]]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_matches_reference_frame() {
        // 01 03 00 00 00 0A -> C5 CD
        let frame = Request::read_registers(1, 0, 10).encode();
        assert_eq!(frame, vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x0A, 0xC5, 0xCD]);
    }

    #[test]
    fn write_coil_uses_ff00_for_on() {
        let frame = Request::write_coil(4, 2, true).encode();
        assert_eq!(&frame[..6], &[4, WRITE_SINGLE_COIL, 0, 2, 0xFF, 0x00]);
        let frame = Request::write_coil(4, 2, false).encode();
        assert_eq!(&frame[4..6], &[0, 0]);
    }

    #[test]
    fn response_lengths_follow_function() {
        assert_eq!(Request::read_registers(1, 16, 1).response_len(), 7);
        assert_eq!(Request::read_coils(1, 0, 3).response_len(), 6);
        assert_eq!(Request::read_coils(3, 0, 10).response_len(), 7);
        assert_eq!(Request::write_register(1, 17, 5).response_len(), 8);
        assert_eq!(Request::write_coil(1, 0, true).response_len(), 8);
    }

    #[test]
    fn register_read_decodes_big_endian_word() {
        let request = Request::read_registers(7, 16, 1);
        let frame = encode_response(&request, &Response::Registers(vec![0x0123]));
        assert_eq!(frame.len(), 7);
        assert_eq!(request.parse_register(&frame), Some(0x0123));
    }

    #[test]
    fn coil_read_unpacks_lsb_first() {
        let request = Request::read_coils(3, 0, 10);
        let bits = vec![true, false, false, false, true, true, true, true, false, true];
        let frame = encode_response(&request, &Response::Coils(bits.clone()));
        assert_eq!(request.parse_response(&frame), Some(Response::Coils(bits)));
        assert_eq!(frame[3], 0b1111_0001);
    }

    #[test]
    fn foreign_address_and_short_frames_are_rejected() {
        let request = Request::read_registers(7, 16, 1);
        let other = Request::read_registers(8, 16, 1);
        let frame = encode_response(&other, &Response::Registers(vec![1]));
        assert_eq!(request.parse_register(&frame), None);
        assert_eq!(request.parse_register(&[]), None);
        assert_eq!(request.parse_register(&frame[..5]), None);
    }

    #[test]
    fn exception_reply_yields_none() {
        let request = Request::read_registers(1, 16, 1);
        let mut frame = vec![1, 0x83, 0x02];
        append_crc(&mut frame);
        assert_eq!(request.parse_response(&frame), None);
    }

    #[test]
    fn request_round_trips_through_decoder() {
        let request = Request::write_register(2, 17, 2048);
        assert_eq!(decode_request(&request.encode()), Some(request));
    }
}
