//! Sum-checksum request/response frames for the temperature controller.
//!
//! Request (8 bytes): `[0x80+dev, 0x80+dev, opcode, param, valLo, valHi,
//! sumLo, sumHi]` with `sum = param*256 + opcode + value + dev (mod 65536)`.
//! A read carries value 0.
//!
//! Response (10 bytes): four little-endian words followed by a checksum word.
//! The checksum is the sum of the four words plus the device address, low two
//! bytes. Every response carries the process value, set value, alarm byte and
//! the requested parameter.

/// Read opcode
pub const READ_OPCODE: u8 = 82;
/// Write opcode
pub const WRITE_OPCODE: u8 = 67;
/// Request length
pub const REQUEST_LEN: usize = 8;
/// Response length
pub const RESPONSE_LEN: usize = 10;

/// Program run state (0 run, 1 stop, 2 hold)
pub const PARAM_RUN_STATE: u8 = 27;
/// Current program step, 1-based
pub const PARAM_STEP: u8 = 46;
/// Minutes elapsed in the current step (fixed point)
pub const PARAM_STEP_TIME: u8 = 47;
/// Process value (fixed point)
pub const PARAM_PROCESS_VALUE: u8 = 74;
/// Set value (fixed point)
pub const PARAM_SET_VALUE: u8 = 75;
/// Output value in percent (raw byte)
pub const PARAM_OUTPUT: u8 = 76;
/// First program parameter: step k temperature at `80 + 2k`, minutes at `81 + 2k`
pub const PARAM_PROGRAM_BASE: u8 = 80;
/// Last program parameter
pub const PARAM_PROGRAM_LAST: u8 = 179;

/// Step time that ends a program
pub const END_MARKER_MINUTES: f64 = -121.0;

/// Parameters carried with one implied decimal digit.
pub fn is_fixed_point(param: u8) -> bool {
    (PARAM_PROGRAM_BASE..=PARAM_PROGRAM_LAST).contains(&param)
        || matches!(
            param,
            PARAM_STEP_TIME | PARAM_PROCESS_VALUE | PARAM_SET_VALUE
        )
}

/// Wire representation of a value written to `param`: scaled ×10 for the
/// program table, truncated toward zero, saturated to 16 bits.
pub fn wire_value(param: u8, value: f64) -> i16 {
    let scaled = if (PARAM_PROGRAM_BASE..=PARAM_PROGRAM_LAST).contains(&param) {
        value * 10.0
    } else {
        value
    };
    scaled.trunc().clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16
}

/// Request checksum, `param*256 + opcode + value + dev` reduced mod 65536.
pub fn checksum(dev: u8, opcode: u8, param: u8, value: i16) -> u16 {
    let sum = i32::from(param) * 256 + i32::from(opcode) + i32::from(value) + i32::from(dev);
    sum.rem_euclid(65536) as u16
}

fn encode(dev: u8, opcode: u8, param: u8, value: i16) -> [u8; REQUEST_LEN] {
    let [val_lo, val_hi] = value.to_le_bytes();
    let [sum_lo, sum_hi] = checksum(dev, opcode, param, value).to_le_bytes();
    [
        0x80 + dev,
        0x80 + dev,
        opcode,
        param,
        val_lo,
        val_hi,
        sum_lo,
        sum_hi,
    ]
}

/// Build a read request for `param` on device `dev`.
pub fn read_request(dev: u8, param: u8) -> [u8; REQUEST_LEN] {
    encode(dev, READ_OPCODE, param, 0)
}

/// Build a write request setting `param` on device `dev` to a physical value.
pub fn write_request(dev: u8, param: u8, value: f64) -> [u8; REQUEST_LEN] {
    encode(dev, WRITE_OPCODE, param, wire_value(param, value))
}

/// Alarm flags carried in byte 5 of every response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct Alarms {
    /// High alarm
    pub high: bool,
    /// Low alarm
    pub low: bool,
    /// Positive deviation alarm
    pub deviation_high: bool,
    /// Negative deviation alarm
    pub deviation_low: bool,
    /// Input out of range
    pub out_of_range: bool,
}

impl Alarms {
    /// Unpack the alarm byte.
    pub fn from_byte(byte: u8) -> Self {
        Self {
            high: byte & 0x01 != 0,
            low: byte & 0x02 != 0,
            deviation_high: byte & 0x04 != 0,
            deviation_low: byte & 0x08 != 0,
            out_of_range: byte & 0x10 != 0,
        }
    }

    /// Pack into the alarm byte.
    pub fn to_byte(self) -> u8 {
        u8::from(self.high)
            | u8::from(self.low) << 1
            | u8::from(self.deviation_high) << 2
            | u8::from(self.deviation_low) << 3
            | u8::from(self.out_of_range) << 4
    }

    /// Any alarm raised.
    pub fn any(self) -> bool {
        self.to_byte() != 0
    }
}

/// Decoded response.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reply {
    /// Process value
    pub actual: f64,
    /// Set value
    pub set: f64,
    /// Alarm flags
    pub alarms: Alarms,
    /// Value of the requested parameter
    pub param_value: f64,
}

fn word(frame: &[u8], index: usize) -> u16 {
    u16::from_le_bytes([frame[2 * index], frame[2 * index + 1]])
}

/// True if `frame` is a well-formed response from device `dev`.
pub fn validate(dev: u8, frame: &[u8]) -> bool {
    if frame.len() != RESPONSE_LEN {
        return false;
    }
    let sum: u32 = (0..4).map(|i| u32::from(word(frame, i))).sum::<u32>() + u32::from(dev);
    let [lo, hi, ..] = sum.to_le_bytes();
    [lo, hi] == [frame[8], frame[9]]
}

/// Decode a response to a request for `param`.
pub fn decode(dev: u8, param: u8, frame: &[u8]) -> Option<Reply> {
    if !validate(dev, frame) {
        return None;
    }
    let signed = |i: usize| f64::from(word(frame, i) as i16);
    let param_value = if param == PARAM_OUTPUT {
        f64::from(frame[4])
    } else if is_fixed_point(param) {
        signed(3) / 10.0
    } else {
        signed(3)
    };
    Some(Reply {
        actual: signed(0) / 10.0,
        set: signed(1) / 10.0,
        alarms: Alarms::from_byte(frame[5]),
        param_value,
    })
}

/// Build a response frame the way the controller does. `output` fills byte 4
/// (low byte of word 2) and `param_word` is word 3. Used by simulated devices.
pub fn encode_response(
    dev: u8,
    actual: f64,
    set: f64,
    output: u8,
    alarms: Alarms,
    param_word: i16,
) -> [u8; RESPONSE_LEN] {
    let to_word = |v: f64| ((v * 10.0).round() as i16) as u16;
    let words = [
        to_word(actual),
        to_word(set),
        u16::from_le_bytes([output, alarms.to_byte()]),
        param_word as u16,
    ];
    let mut frame = [0u8; RESPONSE_LEN];
    for (i, w) in words.iter().enumerate() {
        frame[2 * i..2 * i + 2].copy_from_slice(&w.to_le_bytes());
    }
    let sum: u32 = words.iter().map(|w| u32::from(*w)).sum::<u32>() + u32::from(dev);
    let [lo, hi, ..] = sum.to_le_bytes();
    frame[8] = lo;
    frame[9] = hi;
    frame
}

/// A decoded request, as seen by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedRequest {
    /// Device address
    pub dev: u8,
    /// Opcode (read or write)
    pub opcode: u8,
    /// Parameter number
    pub param: u8,
    /// Wire value (0 for reads)
    pub value: i16,
}

/// Decode and check a request frame. Used by simulated devices.
pub fn decode_request(frame: &[u8]) -> Option<DecodedRequest> {
    if frame.len() != REQUEST_LEN || frame[0] != frame[1] || frame[0] < 0x80 {
        return None;
    }
    let dev = frame[0] - 0x80;
    let value = i16::from_le_bytes([frame[4], frame[5]]);
    let sum = u16::from_le_bytes([frame[6], frame[7]]);
    (checksum(dev, frame[2], frame[3], value) == sum).then_some(DecodedRequest {
        dev,
        opcode: frame[2],
        param: frame[3],
        value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_request_layout() {
        let frame = read_request(1, PARAM_PROCESS_VALUE);
        // 74*256 + 82 + 1 = 19027 = 0x4A53
        assert_eq!(frame, [0x81, 0x81, 82, 74, 0, 0, 0x53, 0x4A]);
    }

    #[test]
    fn program_writes_are_fixed_point() {
        let frame = write_request(2, 80, 850.0);
        assert_eq!(i16::from_le_bytes([frame[4], frame[5]]), 8500);
        let end = write_request(2, 81, END_MARKER_MINUTES);
        assert_eq!(i16::from_le_bytes([end[4], end[5]]), -1210);
        // run state is not scaled
        let run = write_request(1, PARAM_RUN_STATE, 1.0);
        assert_eq!(i16::from_le_bytes([run[4], run[5]]), 1);
    }

    #[test]
    fn negative_values_wrap_checksum() {
        // 81*256 + 67 + (-1210) + 2 = 19595
        assert_eq!(checksum(2, WRITE_OPCODE, 81, -1210), 19595);
        assert_eq!(checksum(0, 0, 0, -5), 65531);
    }

    #[test]
    fn decodes_process_value_reply() {
        let frame = encode_response(1, 235.4, 240.0, 37, Alarms::default(), 2354);
        let reply = decode(1, PARAM_PROCESS_VALUE, &frame).unwrap();
        assert_eq!(reply.actual, 235.4);
        assert_eq!(reply.set, 240.0);
        assert_eq!(reply.param_value, 235.4);
    }

    #[test]
    fn output_parameter_reads_raw_byte() {
        let frame = encode_response(1, 20.0, 30.0, 55, Alarms::default(), 0);
        assert_eq!(decode(1, PARAM_OUTPUT, &frame).unwrap().param_value, 55.0);
    }

    #[test]
    fn step_and_state_are_unscaled() {
        let frame = encode_response(2, 20.0, 30.0, 0, Alarms::default(), 3);
        assert_eq!(decode(2, PARAM_STEP, &frame).unwrap().param_value, 3.0);
        assert_eq!(decode(2, PARAM_RUN_STATE, &frame).unwrap().param_value, 3.0);
        assert_eq!(decode(2, PARAM_STEP_TIME, &frame).unwrap().param_value, 0.3);
    }

    #[test]
    fn alarm_bits_round_trip() {
        let alarms = Alarms {
            high: true,
            deviation_low: true,
            ..Default::default()
        };
        assert_eq!(alarms.to_byte(), 0b1001);
        let frame = encode_response(1, 20.0, 30.0, 0, alarms, 0);
        assert_eq!(decode(1, PARAM_SET_VALUE, &frame).unwrap().alarms, alarms);
    }

    #[test]
    fn reply_from_other_device_fails_checksum() {
        let frame = encode_response(1, 20.0, 30.0, 0, Alarms::default(), 0);
        assert!(decode(2, PARAM_PROCESS_VALUE, &frame).is_none());
        assert!(decode(1, PARAM_PROCESS_VALUE, &frame[..9]).is_none());
    }

    #[test]
    fn requests_decode() {
        let frame = write_request(2, 84, 700.0);
        assert_eq!(
            decode_request(&frame),
            Some(DecodedRequest {
                dev: 2,
                opcode: WRITE_OPCODE,
                param: 84,
                value: 7000
            })
        );
        let mut bad = frame;
        bad[6] ^= 1;
        assert_eq!(decode_request(&bad), None);
    }
}
