//! Frame codec properties for both serial protocol families.

use cvd_rig::protocol::aibus::{self, Alarms};
use cvd_rig::protocol::modbus_rtu::{self, Request, Response};
use cvd_rig::protocol::FlowScale;

/// Small deterministic generator so the byte sweeps are reproducible.
fn pseudo_random_bytes(seed: u32, len: usize) -> Vec<u8> {
    let mut state = seed.wrapping_mul(2_654_435_761).max(1);
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state >> 24) as u8
        })
        .collect()
}

// =============================================================================
// CRC16 family
// =============================================================================

#[test]
fn test_crc16_is_deterministic_and_accepts_appended_checksum() {
    for seed in 1..200 {
        let payload = pseudo_random_bytes(seed, 1 + (seed as usize % 30));
        assert_eq!(modbus_rtu::crc16(&payload), modbus_rtu::crc16(&payload));

        let mut frame = payload.clone();
        modbus_rtu::append_crc(&mut frame);
        assert!(modbus_rtu::validate(&frame), "seed {seed} rejected");
        let crc = modbus_rtu::crc16(&payload);
        assert_eq!(frame[frame.len() - 2], (crc & 0xFF) as u8, "low byte first");
        assert_eq!(frame[frame.len() - 1], (crc >> 8) as u8);
    }
}

#[test]
fn test_crc16_rejects_every_single_bit_flip() {
    for seed in 1..40 {
        let mut frame = pseudo_random_bytes(seed, 6);
        modbus_rtu::append_crc(&mut frame);
        for byte in 0..frame.len() {
            for bit in 0..8 {
                let mut corrupted = frame.clone();
                corrupted[byte] ^= 1 << bit;
                assert!(
                    !modbus_rtu::validate(&corrupted),
                    "seed {seed}: flip of byte {byte} bit {bit} accepted"
                );
            }
        }
    }
}

#[test]
fn test_register_read_round_trip_through_device_encoder() {
    let request = Request::read_registers(5, 17, 1);
    let frame = request.encode();
    assert_eq!(frame.len(), 8);
    assert_eq!(modbus_rtu::decode_request(&frame), Some(request));

    let reply = modbus_rtu::encode_response(&request, &Response::Registers(vec![0x0333]));
    assert_eq!(reply.len(), request.response_len());
    assert_eq!(request.parse_register(&reply), Some(0x0333));

    // Reply from another device is not ours.
    let foreign = Request::read_registers(6, 17, 1);
    let other = modbus_rtu::encode_response(&foreign, &Response::Registers(vec![1]));
    assert_eq!(request.parse_register(&other), None);
}

#[test]
fn test_short_modbus_reply_is_rejected() {
    let request = Request::read_coils(1, 0, 4);
    let coils = Response::Coils(vec![true, false, true, true]);
    let reply = modbus_rtu::encode_response(&request, &coils);
    assert_eq!(request.parse_coil_byte(&reply), Some(0b1101));
    assert_eq!(request.parse_response(&reply[..reply.len() - 1]), None);
}

// =============================================================================
// Sum-checksum family
// =============================================================================

#[test]
fn test_sum_checksum_matches_formula() {
    for dev in [1u8, 2, 7] {
        for param in [27u8, 46, 74, 80, 179] {
            let read = aibus::read_request(dev, param);
            let expected = (u32::from(param) * 256 + 82 + u32::from(dev)) % 65536;
            assert_eq!(read[0], 0x80 + dev);
            assert_eq!(read[1], 0x80 + dev);
            assert_eq!(u16::from_le_bytes([read[6], read[7]]), expected as u16);

            for value in [-121.0, 0.0, 1.0, 850.5] {
                let write = aibus::write_request(dev, param, value);
                let wire = aibus::wire_value(param, value);
                let expected = (i64::from(param) * 256 + 67 + i64::from(wire) + i64::from(dev))
                    .rem_euclid(65536);
                assert_eq!(
                    u16::from_le_bytes([write[6], write[7]]),
                    expected as u16,
                    "dev {dev} param {param} value {value}"
                );
            }
        }
    }
}

#[test]
fn test_fixed_point_parameters_scale_by_ten() {
    assert_eq!(aibus::wire_value(80, 850.5), 8505);
    assert_eq!(aibus::wire_value(179, -121.0), -1210);
    assert_eq!(aibus::wire_value(27, 1.0), 1);
    assert!(!aibus::is_fixed_point(180));
}

#[test]
fn test_sum_checksum_rejects_any_one_byte_corruption() {
    let alarms = Alarms {
        high: true,
        ..Default::default()
    };
    let frame = aibus::encode_response(2, 812.3, 850.0, 42, alarms, 8500);
    assert!(aibus::validate(2, &frame));
    assert!(!aibus::validate(1, &frame), "wrong device address accepted");

    for byte in 0..frame.len() {
        for delta in 1..=255u8 {
            let mut corrupted = frame;
            corrupted[byte] = corrupted[byte].wrapping_add(delta);
            assert!(
                !aibus::validate(2, &corrupted),
                "byte {byte} + {delta} accepted"
            );
        }
    }
}

#[test]
fn test_response_fields_decode() {
    let frame = aibus::encode_response(1, 812.3, 850.0, 42, Alarms::default(), 8500);
    let reply = aibus::decode(1, aibus::PARAM_SET_VALUE, &frame).unwrap();
    assert!((reply.actual - 812.3).abs() < 1e-9);
    assert!((reply.set - 850.0).abs() < 1e-9);
    assert!((reply.param_value - 850.0).abs() < 1e-9);
    assert!(!reply.alarms.any());

    let output = aibus::decode(1, aibus::PARAM_OUTPUT, &frame).unwrap();
    assert_eq!(output.param_value, 42.0);

    let run = aibus::encode_response(1, 25.0, 25.0, 0, Alarms::default(), 2);
    assert_eq!(aibus::decode(1, aibus::PARAM_RUN_STATE, &run).unwrap().param_value, 2.0);

    assert!(aibus::decode(1, aibus::PARAM_SET_VALUE, &frame[..9]).is_none());
}

// =============================================================================
// Flow scale
// =============================================================================

#[test]
fn test_flow_scale_round_trip_within_quantization() {
    let scale = FlowScale::new(500.0).unwrap();
    let bound = 0.5 * (500.0 / 4095.0);
    for i in 0..=5000 {
        let value = f64::from(i) * 0.1;
        let decoded = scale.to_physical(scale.to_raw(value));
        assert!(
            (decoded - value).abs() <= bound + 1e-12,
            "{value} decoded as {decoded}"
        );
    }
}

#[test]
fn test_flow_scale_clamps_to_converter_span() {
    let scale = FlowScale::new(500.0).unwrap();
    assert_eq!(scale.to_raw(-3.0), 0);
    assert_eq!(scale.to_raw(900.0), 4095);
    assert_eq!(scale.to_display(4095), 500.0);
    assert!(FlowScale::new(0.0).is_none());
}
