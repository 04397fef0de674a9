mod common;
use common::*;

use lux_bridge::lux::packet::{
    self, checksum, create_read_request, create_write_request, find_matching_response,
    frame_length, parse_response, split_frames, DeviceFunction,
};

#[test]
fn crc_of_frame_with_appended_crc_is_zero() {
    for data in [
        b"hello world".to_vec(),
        vec![0x00, 0x04, 0x41, 0x42],
        (0..=255u8).collect::<Vec<u8>>(),
    ] {
        let mut framed = data.clone();
        framed.extend_from_slice(&checksum(&data).to_le_bytes());
        assert_eq!(checksum(&framed), 0, "crc over data plus its crc must be zero");
    }
}

#[test]
fn read_request_crc_validates() {
    let packet = create_read_request(DeviceFunction::ReadHold, 100, 5, inverter_serial()).unwrap();
    assert_eq!(checksum(&packet), 0);
}

#[test]
fn parse_read_response_round_trip() {
    let values: Vec<u16> = (0..40).map(|i| i * 3).collect();
    let frame = read_response(DeviceFunction::ReadInput, 0, &values, inverter_serial());
    assert_eq!(frame.len(), 97);

    let parsed = parse_response(&frame).unwrap();
    assert!(parsed.crc_ok);
    assert!(!parsed.is_exception());
    assert_eq!(parsed.function, DeviceFunction::ReadInput);
    assert_eq!(parsed.start_register, 0);
    assert_eq!(parsed.register_count, 40);
    assert_eq!(parsed.values, values);
    assert_eq!(parsed.serial, inverter_serial());
}

#[test]
fn parse_write_single_response() {
    let frame = write_single_response(21, 0x0003, inverter_serial());
    let parsed = parse_response(&frame).unwrap();

    assert_eq!(parsed.function, DeviceFunction::WriteSingle);
    assert_eq!(parsed.start_register, 21);
    assert_eq!(parsed.register_count, 1);
    assert_eq!(parsed.values, vec![3]);
}

#[test]
fn parse_write_multi_response_confirms_count() {
    let frame = write_multi_response(64, 4, inverter_serial());
    let parsed = parse_response(&frame).unwrap();

    assert_eq!(parsed.function, DeviceFunction::WriteMulti);
    assert_eq!(parsed.start_register, 64);
    assert_eq!(parsed.register_count, 4);
    assert!(parsed.values.is_empty());
}

#[test]
fn parse_exception_response() {
    let frame = exception_response(DeviceFunction::WriteSingle, 9999, 0x02, inverter_serial());
    let parsed = parse_response(&frame).unwrap();

    assert!(parsed.is_exception());
    assert_eq!(parsed.exception_code, Some(0x02));
    assert_eq!(parsed.function, DeviceFunction::WriteSingle);
    assert_eq!(parsed.start_register, 9999);
}

#[test]
fn crc_mismatch_is_not_fatal() {
    let values = [1u16, 2, 3];
    let mut frame = read_response(DeviceFunction::ReadHold, 10, &values, inverter_serial());
    let last = frame.len() - 1;
    frame[last] ^= 0xFF;

    let parsed = parse_response(&frame).unwrap();
    assert!(!parsed.crc_ok);
    assert_eq!(parsed.values, values);
}

#[test]
fn parse_rejects_structural_garbage() {
    // wrong address
    let mut frame = write_single_response(0, 0, inverter_serial());
    frame[0] = 0x02;
    assert!(parse_response(&frame).is_err());

    // unknown function code
    let mut frame = write_single_response(0, 0, inverter_serial());
    frame[1] = 0x2A;
    assert!(parse_response(&frame).is_err());

    // too short
    assert!(parse_response(&[0x01, 0x03, 0x00]).is_err());
}

#[test]
fn split_consumes_every_frame_byte() {
    let request = create_read_request(DeviceFunction::ReadInput, 0, 40, inverter_serial()).unwrap();
    let reply = write_single_response(7, 1, inverter_serial());
    let ours = read_response(DeviceFunction::ReadHold, 100, &[1, 2, 3, 4, 5], inverter_serial());

    let mut bus = Vec::new();
    bus.extend_from_slice(&request);
    bus.extend_from_slice(&reply);
    bus.extend_from_slice(&ours);

    let frames = split_frames(&bus);
    assert_eq!(frames.len(), 3);
    assert!(frames[0].is_request);
    assert_eq!(frames[0].length, 18);
    assert_eq!(frames[1].offset, 18);
    assert_eq!(frames[2].offset, 36);
    assert_eq!(frames[2].length, 27);
    let consumed: usize = frames.iter().map(|f| f.length).sum();
    assert_eq!(consumed, bus.len());

    // Running the splitter on a prefix yields a prefix of the frame list.
    let prefix_frames = split_frames(&bus[..36]);
    assert_eq!(prefix_frames.len(), 2);
    assert_eq!(prefix_frames[0].offset, frames[0].offset);
    assert_eq!(prefix_frames[1].offset, frames[1].offset);
}

#[test]
fn split_skips_leading_garbage() {
    let ours = read_response(DeviceFunction::ReadHold, 5, &[9], inverter_serial());
    let mut bus = vec![0xDE, 0xAD, 0xBE];
    bus.extend_from_slice(&ours);

    let frames = split_frames(&bus);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].offset, 3);
}

#[test]
fn find_matching_skips_foreign_traffic() {
    let foreign_request =
        create_read_request(DeviceFunction::ReadInput, 0, 40, inverter_serial()).unwrap();
    let foreign_response = write_single_response(7, 1, inverter_serial());
    let ours = read_response(DeviceFunction::ReadHold, 100, &[1, 2, 3, 4, 5], inverter_serial());

    let mut bus = Vec::new();
    bus.extend_from_slice(&foreign_request);
    bus.extend_from_slice(&foreign_response);
    bus.extend_from_slice(&ours);

    let frames = split_frames(&bus);
    let index = find_matching_response(&frames, DeviceFunction::ReadHold, 100).unwrap();
    assert_eq!(index, 2);
    assert_eq!(frames[index].offset, 36);

    assert!(find_matching_response(&frames, DeviceFunction::ReadHold, 101).is_none());
    assert!(find_matching_response(&frames, DeviceFunction::ReadInput, 100).is_none());
}

#[test]
fn find_matching_accepts_exceptions_on_base_function() {
    let frame = exception_response(DeviceFunction::ReadHold, 100, 0x02, inverter_serial());
    let frames = split_frames(&frame);
    assert_eq!(
        find_matching_response(&frames, DeviceFunction::ReadHold, 100),
        Some(0)
    );
}

#[test]
fn write_request_variants() {
    let single = create_write_request(21, &[3], inverter_serial()).unwrap();
    assert_eq!(single.len(), 18);
    assert_eq!(single[1], 0x06);

    let multi = create_write_request(64, &[1, 2], inverter_serial()).unwrap();
    assert_eq!(multi.len(), 17 + 4 + 2);
    assert_eq!(multi[1], 0x10);
    assert_eq!(multi[16], 4);

    assert!(create_write_request(0, &[], inverter_serial()).is_err());
    assert!(create_write_request(0, &vec![0u16; 128], inverter_serial()).is_err());
}

#[test]
fn frame_length_undecidable_on_short_read_header() {
    // A read response needs 15 bytes before its length is known.
    let frame = read_response(DeviceFunction::ReadHold, 0, &[1, 2], inverter_serial());
    assert_eq!(frame_length(&frame[..14]), 0);
    assert_eq!(frame_length(&frame), 21);

    // Requests and write responses are fixed-size from the first two bytes.
    assert_eq!(frame_length(&[packet::DEVICE_ADDR_REQUEST, 0x03]), 18);
    assert_eq!(frame_length(&[packet::DEVICE_ADDR_RESPONSE, 0x86]), 15);
}
