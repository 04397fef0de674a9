use crate::prelude::*;

use crate::lux::packet::{self, DeviceFunction, Serial, SERIAL_NUMBER_LENGTH};
use std::convert::TryFrom;

pub const PREFIX: [u8; 2] = [0xA1, 0x1A];
pub const PROTOCOL_REQUEST: u16 = 2;
pub const PROTOCOL_RESPONSE: u16 = 5;
pub const RESERVED: u8 = 1;
pub const FUNC_TRANSLATED: u8 = 194; // 0xC2

pub const MIN_REQUEST_SIZE: usize = 38;

// Absolute byte offsets within a client frame. The data frame starting at 20
// mirrors a bus frame: action byte in place of the address, then function,
// serial, start register, count-or-value.
mod offsets {
    pub const PROTOCOL: usize = 2;
    pub const FRAME_LENGTH: usize = 4;
    pub const TCP_FUNC: usize = 7;
    pub const DONGLE_SERIAL: usize = 8;
    pub const DATA_LENGTH: usize = 18;
    pub const DATA_FRAME: usize = 20;
    pub const MODBUS_FUNC: usize = 21;
    pub const INVERTER_SERIAL: usize = 22;
    pub const START_REG: usize = 32;
    pub const COUNT_OR_VALUE: usize = 34;
    pub const BYTE_COUNT: usize = 36;
    pub const VALUES_START: usize = 37;
}

/// A decoded client request. `bus_packet` is the equivalent bus encoding of
/// the request, built with the serial number the client supplied; the
/// arbiter substitutes the detected inverter serial when it transmits.
#[derive(Clone, Debug, PartialEq)]
pub struct TcpRequest {
    pub dongle_serial: Serial,
    pub inverter_serial: Serial,
    pub function: DeviceFunction,
    pub start_register: u16,
    pub register_count: u16,
    pub write_values: Vec<u16>,
    pub bus_packet: Vec<u8>,
}

impl TcpRequest {
    pub fn is_write(&self) -> bool {
        !self.function.is_read()
    }
}

/// Decode a 38-byte (or longer, for 0x10) client frame.
pub fn parse_request(data: &[u8]) -> Result<TcpRequest> {
    if data.len() < MIN_REQUEST_SIZE {
        bail!("packet too small: got {}, expected {}", data.len(), MIN_REQUEST_SIZE);
    }

    if data[0..2] != PREFIX {
        bail!("invalid prefix: got {:02X} {:02X} (expected A1 1A)", data[0], data[1]);
    }

    let protocol = Utils::u16ify(data, offsets::PROTOCOL);
    let frame_len = Utils::u16ify(data, offsets::FRAME_LENGTH);
    debug!(
        "request: protocol={}, frame_len={}, tcp_func={}",
        protocol,
        frame_len,
        data[offsets::TCP_FUNC]
    );

    if data[offsets::TCP_FUNC] != FUNC_TRANSLATED {
        bail!(
            "unsupported TCP function: got {}, expected {}",
            data[offsets::TCP_FUNC],
            FUNC_TRANSLATED
        );
    }

    let dongle_serial =
        Serial::new(&data[offsets::DONGLE_SERIAL..offsets::DONGLE_SERIAL + SERIAL_NUMBER_LENGTH])?;
    let function = DeviceFunction::try_from(data[offsets::MODBUS_FUNC])
        .map_err(|_| anyhow!("unsupported device function: 0x{:02X}", data[offsets::MODBUS_FUNC]))?;
    let inverter_serial = Serial::new(
        &data[offsets::INVERTER_SERIAL..offsets::INVERTER_SERIAL + SERIAL_NUMBER_LENGTH],
    )?;
    let start_register = Utils::u16ify(data, offsets::START_REG);

    let mut write_values = Vec::new();
    let register_count;
    let data_frame_size;

    match function {
        DeviceFunction::ReadHold | DeviceFunction::ReadInput => {
            register_count = Utils::u16ify(data, offsets::COUNT_OR_VALUE);
            data_frame_size = 18;
        }
        DeviceFunction::WriteSingle => {
            let value = Utils::u16ify(data, offsets::COUNT_OR_VALUE);
            write_values.push(value);
            register_count = 1;
            data_frame_size = 18;
        }
        DeviceFunction::WriteMulti => {
            register_count = Utils::u16ify(data, offsets::COUNT_OR_VALUE);
            if register_count == 0 || register_count > packet::MAX_REGISTERS {
                bail!(
                    "invalid register count for write: {} (max {})",
                    register_count,
                    packet::MAX_REGISTERS
                );
            }

            let byte_count = data[offsets::BYTE_COUNT] as usize;
            if byte_count != register_count as usize * 2 {
                bail!("byte count {} does not match register count {}", byte_count, register_count);
            }

            data_frame_size = 17 + byte_count + 2;
            if data.len() < offsets::DATA_FRAME + data_frame_size {
                bail!(
                    "write multiple packet too small: got {}, need {}",
                    data.len(),
                    offsets::DATA_FRAME + data_frame_size
                );
            }

            for i in 0..register_count as usize {
                write_values.push(Utils::u16ify(data, offsets::VALUES_START + i * 2));
            }
        }
    }

    if register_count == 0 || register_count > packet::MAX_REGISTERS {
        bail!("invalid register count: {} (max {})", register_count, packet::MAX_REGISTERS);
    }

    // The data frame carries its own CRC as its trailing two bytes.
    let crc_offset = offsets::DATA_FRAME + data_frame_size - 2;
    let calculated = packet::checksum(&data[offsets::DATA_FRAME..crc_offset]);
    let received = Utils::u16ify(data, crc_offset);
    if calculated != received {
        bail!("CRC mismatch: calculated=0x{:04X}, received=0x{:04X}", calculated, received);
    }

    let bus_packet = if function.is_read() {
        packet::create_read_request(function, start_register, register_count, inverter_serial)?
    } else {
        packet::create_write_request(start_register, &write_values, inverter_serial)?
    };

    Ok(TcpRequest {
        dongle_serial,
        inverter_serial,
        function,
        start_register,
        register_count,
        write_values,
        bus_packet,
    })
}

/// Wrap a raw bus response into a client frame: protocol 5 header, the bus
/// bytes verbatim minus their trailing CRC, and a fresh CRC over that
/// embedded data frame. Exception responses pass through untouched.
pub fn build_response(bus_response: &[u8], dongle_serial: Serial) -> Result<Vec<u8>> {
    if bus_response.len() < 2 {
        bail!("bus response too small: {} bytes", bus_response.len());
    }

    let func = bus_response[1];
    let is_exception = func & 0x80 != 0;
    let min_size = if is_exception { packet::MIN_EXCEPTION_SIZE } else { packet::MIN_RESPONSE_SIZE };
    if bus_response.len() < min_size {
        bail!(
            "bus response too small: {} bytes (expected at least {})",
            bus_response.len(),
            min_size
        );
    }

    // The embedded data frame is the bus response minus its trailing CRC.
    // A minimum-length exception frame arrives with no CRC attached and is
    // embedded whole.
    let data_frame_size = if is_exception && bus_response.len() == packet::MIN_EXCEPTION_SIZE {
        bus_response.len()
    } else {
        bus_response.len() - 2
    };
    let frame_length = (14 + data_frame_size + 2) as u16;

    let mut out = vec![0u8; 6 + frame_length as usize];
    out[0..2].copy_from_slice(&PREFIX);
    Utils::put_u16(&mut out, offsets::PROTOCOL, PROTOCOL_RESPONSE);
    Utils::put_u16(&mut out, offsets::FRAME_LENGTH, frame_length);
    out[6] = RESERVED;
    out[offsets::TCP_FUNC] = FUNC_TRANSLATED;
    out[offsets::DONGLE_SERIAL..offsets::DONGLE_SERIAL + SERIAL_NUMBER_LENGTH]
        .copy_from_slice(&dongle_serial.data());
    Utils::put_u16(&mut out, offsets::DATA_LENGTH, data_frame_size as u16);

    // Everything the inverter said, address byte included, minus its CRC.
    let data_start = offsets::DATA_FRAME;
    out[data_start..data_start + data_frame_size].copy_from_slice(&bus_response[..data_frame_size]);

    let crc = packet::checksum(&out[data_start..data_start + data_frame_size]);
    Utils::put_u16(&mut out, data_start + data_frame_size, crc);

    debug!("response built: func=0x{:02X} size={}", func, out.len());

    Ok(out)
}

/// Build a client request frame. The inverse of `parse_request`; clients of
/// the bridge normally do this themselves, we need it for probing our own
/// wire format in tests and diagnostics.
pub fn build_request(
    function: DeviceFunction,
    start_register: u16,
    count_or_value: u16,
    values: &[u16],
    dongle_serial: Serial,
    inverter_serial: Serial,
) -> Vec<u8> {
    let data_frame_size: usize = match function {
        DeviceFunction::WriteMulti => 17 + values.len() * 2 + 2,
        _ => 18,
    };

    let mut out = vec![0u8; offsets::DATA_FRAME + data_frame_size];
    out[0..2].copy_from_slice(&PREFIX);
    Utils::put_u16(&mut out, offsets::PROTOCOL, PROTOCOL_REQUEST);
    let frame_length = (out.len() - 6) as u16;
    Utils::put_u16(&mut out, offsets::FRAME_LENGTH, frame_length);
    out[6] = RESERVED;
    out[offsets::TCP_FUNC] = FUNC_TRANSLATED;
    out[offsets::DONGLE_SERIAL..offsets::DONGLE_SERIAL + SERIAL_NUMBER_LENGTH]
        .copy_from_slice(&dongle_serial.data());
    Utils::put_u16(&mut out, offsets::DATA_LENGTH, data_frame_size as u16);

    // data frame: action=0, function, inverter serial, start, count/value
    out[offsets::MODBUS_FUNC] = function.into();
    out[offsets::INVERTER_SERIAL..offsets::INVERTER_SERIAL + SERIAL_NUMBER_LENGTH]
        .copy_from_slice(&inverter_serial.data());
    Utils::put_u16(&mut out, offsets::START_REG, start_register);
    Utils::put_u16(&mut out, offsets::COUNT_OR_VALUE, count_or_value);

    if function == DeviceFunction::WriteMulti {
        out[offsets::BYTE_COUNT] = (values.len() * 2) as u8;
        for (i, value) in values.iter().enumerate() {
            Utils::put_u16(&mut out, offsets::VALUES_START + i * 2, *value);
        }
    }

    let crc_offset = offsets::DATA_FRAME + data_frame_size - 2;
    let crc = packet::checksum(&out[offsets::DATA_FRAME..crc_offset]);
    Utils::put_u16(&mut out, crc_offset, crc);

    out
}
