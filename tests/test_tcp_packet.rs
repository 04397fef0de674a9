mod common;
use common::*;

use lux_bridge::lux::packet::{checksum, DeviceFunction};
use lux_bridge::lux::tcp_packet::{build_request, build_response, parse_request};
use lux_bridge::utils::Utils;

#[test]
fn parse_read_request_round_trip() {
    let bytes = build_request(
        DeviceFunction::ReadInput,
        0,
        40,
        &[],
        dongle_serial(),
        inverter_serial(),
    );
    assert_eq!(bytes.len(), 38);

    let request = parse_request(&bytes).unwrap();
    assert_eq!(request.dongle_serial, dongle_serial());
    assert_eq!(request.inverter_serial, inverter_serial());
    assert_eq!(request.function, DeviceFunction::ReadInput);
    assert_eq!(request.start_register, 0);
    assert_eq!(request.register_count, 40);
    assert!(request.write_values.is_empty());
    assert!(!request.is_write());

    // The equivalent bus frame is pre-built and CRC-valid.
    assert_eq!(request.bus_packet.len(), 18);
    assert_eq!(request.bus_packet[1], 0x04);
    assert_eq!(checksum(&request.bus_packet), 0);
}

#[test]
fn parse_write_single_request() {
    let bytes = build_request(
        DeviceFunction::WriteSingle,
        21,
        0x0003,
        &[],
        dongle_serial(),
        inverter_serial(),
    );
    let request = parse_request(&bytes).unwrap();

    assert!(request.is_write());
    assert_eq!(request.function, DeviceFunction::WriteSingle);
    assert_eq!(request.start_register, 21);
    assert_eq!(request.register_count, 1);
    assert_eq!(request.write_values, vec![3]);
    assert_eq!(request.bus_packet.len(), 18);
}

#[test]
fn parse_write_multi_request() {
    let values = [10u16, 20, 30];
    let bytes = build_request(
        DeviceFunction::WriteMulti,
        64,
        values.len() as u16,
        &values,
        dongle_serial(),
        inverter_serial(),
    );
    assert_eq!(bytes.len(), 20 + 17 + 6 + 2);

    let request = parse_request(&bytes).unwrap();
    assert_eq!(request.function, DeviceFunction::WriteMulti);
    assert_eq!(request.register_count, 3);
    assert_eq!(request.write_values, values);
    assert_eq!(request.bus_packet.len(), 17 + 6 + 2);
}

#[test]
fn parse_rejects_malformed_requests() {
    let good = build_request(
        DeviceFunction::ReadHold,
        0,
        1,
        &[],
        dongle_serial(),
        inverter_serial(),
    );

    // too short
    assert!(parse_request(&good[..37]).is_err());

    // bad magic
    let mut bad = good.clone();
    bad[0] = 0xA2;
    assert!(parse_request(&bad).is_err());

    // wrong TCP function byte
    let mut bad = good.clone();
    bad[7] = 0xC1;
    assert!(parse_request(&bad).is_err());

    // corrupted data-frame CRC
    let mut bad = good.clone();
    let last = bad.len() - 1;
    bad[last] ^= 0x55;
    assert!(parse_request(&bad).is_err());

    // register count out of range
    let zero = build_request(
        DeviceFunction::ReadHold,
        0,
        0,
        &[],
        dongle_serial(),
        inverter_serial(),
    );
    assert!(parse_request(&zero).is_err());
    let too_many = build_request(
        DeviceFunction::ReadHold,
        0,
        128,
        &[],
        dongle_serial(),
        inverter_serial(),
    );
    assert!(parse_request(&too_many).is_err());
}

#[test]
fn response_wraps_inverter_bytes_verbatim() {
    // 40-register read: 97 bus bytes in, 117 client bytes out.
    let values: Vec<u16> = (0..40).map(|i| 0x100 + i).collect();
    let raw = read_response(DeviceFunction::ReadInput, 0, &values, inverter_serial());
    assert_eq!(raw.len(), 97);

    let encoded = build_response(&raw, dongle_serial()).unwrap();
    assert_eq!(encoded.len(), 117);

    assert_eq!(&encoded[0..2], &[0xA1, 0x1A]);
    assert_eq!(Utils::u16ify(&encoded, 2), 5, "responses use protocol 5");
    assert_eq!(Utils::u16ify(&encoded, 4), 111, "frame length field");
    assert_eq!(encoded[6], 1);
    assert_eq!(encoded[7], 0xC2);
    assert_eq!(&encoded[8..18], &dongle_serial().data());
    assert_eq!(Utils::u16ify(&encoded, 18), 95, "data frame length");

    // Data frame is the inverter's bytes sans its trailing CRC.
    assert_eq!(&encoded[20..115], &raw[..95]);

    // Fresh CRC over the embedded data frame.
    assert_eq!(Utils::u16ify(&encoded, 115), checksum(&encoded[20..115]));
}

#[test]
fn response_preserves_exception_frames() {
    let raw = exception_response(DeviceFunction::WriteSingle, 9999, 0x02, inverter_serial());
    assert_eq!(raw.len(), 17);

    let encoded = build_response(&raw, dongle_serial()).unwrap();
    assert_eq!(encoded.len(), 37);
    assert_eq!(Utils::u16ify(&encoded, 2), 5);

    // addr, func|0x80, serial, register, exception code
    assert_eq!(&encoded[20..35], &raw[..15]);
    assert_eq!(encoded[21], 0x86);
    assert_eq!(encoded[34], 0x02);
}

#[test]
fn response_rejects_truncated_bus_frames() {
    assert!(build_response(&[0x01], dongle_serial()).is_err());
    assert!(build_response(&[0x01, 0x03, 0x00, 0x00], dongle_serial()).is_err());
}
