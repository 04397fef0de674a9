use crate::prelude::*;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::convert::TryFrom;

pub const DEVICE_ADDR_REQUEST: u8 = 0x00;
pub const DEVICE_ADDR_RESPONSE: u8 = 0x01;

pub const SERIAL_NUMBER_LENGTH: usize = 10;
pub const MAX_REGISTERS: u16 = 127;

pub const MIN_REQUEST_SIZE: usize = 18;
pub const MIN_RESPONSE_SIZE: usize = 17;
pub const MIN_EXCEPTION_SIZE: usize = 15;
pub const MAX_RX_BUFFER_SIZE: usize = 1024;

// The inverter stores its own serial number in five input registers.
pub const INVERTER_SN_START_REG: u16 = 115;
pub const INVERTER_SN_REG_COUNT: u16 = 5;

// Byte offsets shared by requests and responses.
mod offsets {
    pub const ADDR: usize = 0;
    pub const FUNC: usize = 1;
    pub const SERIAL_NUM: usize = 2;
    pub const START_REG: usize = 12;
    pub const COUNT_OR_VALUE: usize = 14;
    pub const BYTE_COUNT: usize = 16;
    pub const DATA_START: usize = 17;
    pub const CRC_MIN_PACKET: usize = 16;
    pub const EXCEPTION_CODE: usize = 14;
}

pub fn checksum(data: &[u8]) -> u16 {
    crc16::State::<crc16::MODBUS>::calculate(data)
}

// Serial {{{
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Serial([u8; SERIAL_NUMBER_LENGTH]);

impl Serial {
    pub fn new(bytes: &[u8]) -> Result<Self> {
        Ok(Self(bytes.try_into()?))
    }

    pub fn data(&self) -> [u8; SERIAL_NUMBER_LENGTH] {
        self.0
    }

    pub fn is_unset(&self) -> bool {
        self.0 == [0; SERIAL_NUMBER_LENGTH]
    }
}

impl From<[u8; SERIAL_NUMBER_LENGTH]> for Serial {
    fn from(bytes: [u8; SERIAL_NUMBER_LENGTH]) -> Self {
        Self(bytes)
    }
}

impl std::str::FromStr for Serial {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != SERIAL_NUMBER_LENGTH {
            bail!("serial '{}' must be exactly {} characters", s, SERIAL_NUMBER_LENGTH);
        }

        let mut r: [u8; SERIAL_NUMBER_LENGTH] = Default::default();
        r.copy_from_slice(s.as_bytes());
        Ok(Self(r))
    }
}

impl std::fmt::Display for Serial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl std::fmt::Debug for Serial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
} // }}}

// DeviceFunction {{{
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum DeviceFunction {
    ReadHold = 3,
    ReadInput = 4,
    WriteSingle = 6,
    WriteMulti = 16,
}

impl DeviceFunction {
    pub fn is_read(&self) -> bool {
        matches!(self, DeviceFunction::ReadHold | DeviceFunction::ReadInput)
    }
} // }}}

/// A bus response parsed far enough to be routed. An exception response
/// parses successfully but carries `exception_code`; a CRC mismatch is
/// recorded in `crc_ok` and does not abort the parse.
#[derive(Clone, Debug, PartialEq)]
pub struct ParsedResponse {
    pub function: DeviceFunction,
    pub serial: Serial,
    pub start_register: u16,
    pub register_count: u16,
    pub values: Vec<u16>,
    pub exception_code: Option<u8>,
    pub crc_ok: bool,
}

impl ParsedResponse {
    pub fn is_exception(&self) -> bool {
        self.exception_code.is_some()
    }
}

fn write_serial_field(packet: &mut [u8], serial: Serial) {
    packet[offsets::SERIAL_NUM..offsets::SERIAL_NUM + SERIAL_NUMBER_LENGTH]
        .copy_from_slice(&serial.data());
}

/// Build a read request (function 0x03 or 0x04), 18 bytes:
/// addr, func, serial(10), start(2), count(2), crc(2).
pub fn create_read_request(
    function: DeviceFunction,
    start_register: u16,
    count: u16,
    serial: Serial,
) -> Result<Vec<u8>> {
    if !function.is_read() {
        bail!("not a read function: {:?}", function);
    }
    if count == 0 || count > MAX_REGISTERS {
        bail!("invalid register count: {} (max {})", count, MAX_REGISTERS);
    }

    let mut packet = vec![0u8; MIN_REQUEST_SIZE];
    packet[offsets::ADDR] = DEVICE_ADDR_REQUEST;
    packet[offsets::FUNC] = function.into();
    write_serial_field(&mut packet, serial);
    Utils::put_u16(&mut packet, offsets::START_REG, start_register);
    Utils::put_u16(&mut packet, offsets::COUNT_OR_VALUE, count);

    let crc = checksum(&packet[..offsets::CRC_MIN_PACKET]);
    Utils::put_u16(&mut packet, offsets::CRC_MIN_PACKET, crc);

    Ok(packet)
}

/// Build a write request. One value produces an 18-byte 0x06 frame; more
/// produce a 0x10 frame of `17 + 2N + 2` bytes with a byte-count field.
pub fn create_write_request(
    start_register: u16,
    values: &[u16],
    serial: Serial,
) -> Result<Vec<u8>> {
    if values.is_empty() || values.len() > MAX_REGISTERS as usize {
        bail!("invalid register count: {} (max {})", values.len(), MAX_REGISTERS);
    }

    if values.len() == 1 {
        let mut packet = vec![0u8; MIN_REQUEST_SIZE];
        packet[offsets::ADDR] = DEVICE_ADDR_REQUEST;
        packet[offsets::FUNC] = DeviceFunction::WriteSingle.into();
        write_serial_field(&mut packet, serial);
        Utils::put_u16(&mut packet, offsets::START_REG, start_register);
        Utils::put_u16(&mut packet, offsets::COUNT_OR_VALUE, values[0]);

        let crc = checksum(&packet[..offsets::CRC_MIN_PACKET]);
        Utils::put_u16(&mut packet, offsets::CRC_MIN_PACKET, crc);

        Ok(packet)
    } else {
        let byte_count = values.len() * 2;
        let packet_size = offsets::DATA_START + byte_count + 2;

        let mut packet = vec![0u8; packet_size];
        packet[offsets::ADDR] = DEVICE_ADDR_REQUEST;
        packet[offsets::FUNC] = DeviceFunction::WriteMulti.into();
        write_serial_field(&mut packet, serial);
        Utils::put_u16(&mut packet, offsets::START_REG, start_register);
        Utils::put_u16(&mut packet, offsets::COUNT_OR_VALUE, values.len() as u16);
        packet[offsets::BYTE_COUNT] = byte_count as u8;
        for (i, value) in values.iter().enumerate() {
            Utils::put_u16(&mut packet, offsets::DATA_START + i * 2, *value);
        }

        let crc = checksum(&packet[..packet_size - 2]);
        Utils::put_u16(&mut packet, packet_size - 2, crc);

        Ok(packet)
    }
}

pub fn is_request(data: &[u8]) -> bool {
    !data.is_empty() && data[0] == DEVICE_ADDR_REQUEST
}

fn validate_response(data: &[u8]) -> Result<u8> {
    if data.len() < 2 {
        bail!("response too short: {} bytes", data.len());
    }

    let func = data[offsets::FUNC];
    let min_size = if func & 0x80 != 0 { MIN_EXCEPTION_SIZE } else { MIN_RESPONSE_SIZE };
    if data.len() < min_size {
        bail!("response too short: {} bytes (min {})", data.len(), min_size);
    }

    if data[offsets::ADDR] != DEVICE_ADDR_RESPONSE {
        bail!("invalid response address: 0x{:02X}", data[offsets::ADDR]);
    }

    let base_func = func & 0x7F;
    if DeviceFunction::try_from(base_func).is_err() {
        bail!("invalid function code: 0x{:02X}", func);
    }

    Ok(func)
}

fn parse_exception(data: &[u8], func_byte: u8) -> Result<ParsedResponse> {
    // validate_response guarantees MIN_EXCEPTION_SIZE bytes here
    let function = DeviceFunction::try_from(func_byte & 0x7F).unwrap();
    let serial = Serial::new(&data[offsets::SERIAL_NUM..offsets::SERIAL_NUM + SERIAL_NUMBER_LENGTH])?;
    let start_register = Utils::u16ify(data, offsets::START_REG);
    let code = data[offsets::EXCEPTION_CODE];

    let description = match code {
        0x01 => "Illegal function",
        0x02 => "Illegal data address",
        0x03 => "Illegal data value",
        0x04 => "Slave device failure",
        _ => "Unknown exception",
    };
    error!(
        "inverter exception: func=0x{:02X}, reg={}, code=0x{:02X} ({})",
        func_byte, start_register, code, description
    );

    Ok(ParsedResponse {
        function,
        serial,
        start_register,
        register_count: 0,
        values: Vec::new(),
        exception_code: Some(code),
        crc_ok: true,
    })
}

fn check_crc(data: &[u8], frame_length: usize) -> bool {
    let calculated = checksum(&data[..frame_length - 2]);
    let received = Utils::u16ify(data, frame_length - 2);
    if calculated != received {
        warn!(
            "CRC mismatch: calculated=0x{:04X}, received=0x{:04X}, packet [{} bytes]: {}",
            calculated,
            received,
            data.len(),
            Utils::format_hex(&data[..data.len().min(32)])
        );
        return false;
    }
    true
}

fn parse_read(data: &[u8], function: DeviceFunction) -> Result<ParsedResponse> {
    if data.len() < 15 {
        bail!("read response too short to carry byte count: {} bytes", data.len());
    }

    let serial = Serial::new(&data[offsets::SERIAL_NUM..offsets::SERIAL_NUM + SERIAL_NUMBER_LENGTH])?;
    let start_register = Utils::u16ify(data, offsets::START_REG);

    let byte_count = data[offsets::COUNT_OR_VALUE] as usize;
    let frame_length = 17 + byte_count;
    if data.len() < frame_length {
        bail!(
            "read response too short: got {}, expected {} (byte_count={})",
            data.len(),
            frame_length,
            byte_count
        );
    }

    // A CRC fault is logged, not fatal; the request match downstream decides.
    let crc_ok = check_crc(data, frame_length);

    let register_count = (byte_count / 2) as u16;
    let data_offset = offsets::COUNT_OR_VALUE + 1;
    let values = (0..register_count as usize)
        .map(|i| Utils::u16ify(data, data_offset + i * 2))
        .collect();

    Ok(ParsedResponse {
        function,
        serial,
        start_register,
        register_count,
        values,
        exception_code: None,
        crc_ok,
    })
}

fn parse_write_single(data: &[u8]) -> Result<ParsedResponse> {
    if data.len() < MIN_REQUEST_SIZE {
        bail!("write single response too short: {} bytes", data.len());
    }

    let serial = Serial::new(&data[offsets::SERIAL_NUM..offsets::SERIAL_NUM + SERIAL_NUMBER_LENGTH])?;
    let start_register = Utils::u16ify(data, offsets::START_REG);
    let crc_ok = check_crc(data, MIN_REQUEST_SIZE);
    let value = Utils::u16ify(data, offsets::COUNT_OR_VALUE);

    Ok(ParsedResponse {
        function: DeviceFunction::WriteSingle,
        serial,
        start_register,
        register_count: 1,
        values: vec![value],
        exception_code: None,
        crc_ok,
    })
}

fn parse_write_multi(data: &[u8]) -> Result<ParsedResponse> {
    if data.len() < MIN_REQUEST_SIZE {
        bail!("write multi response too short: {} bytes", data.len());
    }

    let serial = Serial::new(&data[offsets::SERIAL_NUM..offsets::SERIAL_NUM + SERIAL_NUMBER_LENGTH])?;
    let start_register = Utils::u16ify(data, offsets::START_REG);
    let crc_ok = check_crc(data, MIN_REQUEST_SIZE);

    // The response confirms the count only; it echoes no values.
    let register_count = Utils::u16ify(data, offsets::COUNT_OR_VALUE);

    Ok(ParsedResponse {
        function: DeviceFunction::WriteMulti,
        serial,
        start_register,
        register_count,
        values: Vec::new(),
        exception_code: None,
        crc_ok,
    })
}

/// Parse a single response frame. Returns `Err` only when the frame is
/// structurally unusable; exception responses and CRC faults parse.
pub fn parse_response(data: &[u8]) -> Result<ParsedResponse> {
    let func_byte = validate_response(data)?;

    if func_byte & 0x80 != 0 {
        return parse_exception(data, func_byte);
    }

    match DeviceFunction::try_from(func_byte).unwrap() {
        f @ (DeviceFunction::ReadHold | DeviceFunction::ReadInput) => parse_read(data, f),
        DeviceFunction::WriteSingle => parse_write_single(data),
        DeviceFunction::WriteMulti => parse_write_multi(data),
    }
}

/// Length of the frame starting at `frame[0]`, or 0 when it cannot be
/// determined yet from the available bytes.
pub fn frame_length(frame: &[u8]) -> usize {
    if frame.len() < 2 {
        return 0;
    }

    if frame[0] == DEVICE_ADDR_REQUEST {
        return MIN_REQUEST_SIZE;
    }

    if frame[1] & 0x80 != 0 {
        return MIN_EXCEPTION_SIZE;
    }

    match frame[1] & 0x7F {
        0x03 | 0x04 => {
            if frame.len() >= 15 {
                17 + frame[offsets::COUNT_OR_VALUE] as usize
            } else {
                0
            }
        }
        0x06 | 0x10 => MIN_REQUEST_SIZE,
        _ => 0,
    }
}

#[derive(Clone, Debug)]
pub struct FrameInfo {
    pub offset: usize,
    pub length: usize,
    pub is_request: bool,
    pub response: Option<ParsedResponse>,
}

/// Split a receive buffer into frames. A second master on the bus means the
/// buffer can hold its request/response pairs concatenated with ours; each
/// offset is classified by address byte and unknown bytes are skipped one at
/// a time, so the walk always makes progress.
pub fn split_frames(data: &[u8]) -> Vec<FrameInfo> {
    let mut frames = Vec::new();
    let mut offset = 0;

    while offset < data.len() {
        let remaining = &data[offset..];
        if remaining.len() < 2 {
            break;
        }

        match remaining[0] {
            DEVICE_ADDR_REQUEST => {
                let len = frame_length(remaining);
                if len > 0 && len <= remaining.len() {
                    debug!("frame[{}]: request at offset {}, len={}", frames.len(), offset, len);
                    frames.push(FrameInfo {
                        offset,
                        length: len,
                        is_request: true,
                        response: None,
                    });
                    offset += len;
                } else {
                    offset += 1;
                }
            }
            DEVICE_ADDR_RESPONSE => {
                let len = frame_length(remaining);
                if len > 0 && len <= remaining.len() {
                    let response = parse_response(&remaining[..len]).ok();
                    debug!(
                        "frame[{}]: response at offset {}, len={}",
                        frames.len(),
                        offset,
                        len
                    );
                    frames.push(FrameInfo {
                        offset,
                        length: len,
                        is_request: false,
                        response,
                    });
                    offset += len;
                } else {
                    offset += 1;
                }
            }
            _ => offset += 1,
        }
    }

    frames
}

/// Index of the first response whose base function and start register match
/// what we asked for. Exception responses match on their base function, so a
/// rejected request is still recognised as ours.
pub fn find_matching_response(
    frames: &[FrameInfo],
    expected_function: DeviceFunction,
    expected_start: u16,
) -> Option<usize> {
    frames.iter().position(|frame| {
        if frame.is_request {
            return false;
        }
        match &frame.response {
            Some(r) => r.function == expected_function && r.start_register == expected_start,
            None => false,
        }
    })
}
