#![allow(dead_code)]

use lux_bridge::prelude::*;

use lux_bridge::coordinator::Coordinator;
use lux_bridge::guard::GuardManager;
use lux_bridge::lux::packet::{self, DeviceFunction, Serial};
use lux_bridge::rs485::{BusPort, Rs485Arbiter, Rs485Settings};
use lux_bridge::server::Reply;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const DONGLE_SERIAL: &str = "2222222222";
pub const INVERTER_SERIAL: &str = "AB12345678";

pub fn dongle_serial() -> Serial {
    DONGLE_SERIAL.parse().unwrap()
}

pub fn inverter_serial() -> Serial {
    INVERTER_SERIAL.parse().unwrap()
}

// MockPort {{{
#[derive(Default)]
pub struct MockPortState {
    pub written: Vec<Vec<u8>>,
    pub rx: Vec<u8>,
    pub replies: VecDeque<Vec<u8>>,
    pub fail_sends: bool,
}

/// In-memory bus: every transmitted frame is recorded, and either a queued
/// reply is placed on the receive side or the test pushes bytes directly.
#[derive(Clone, Default)]
pub struct MockPort(Arc<Mutex<MockPortState>>);

impl MockPort {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next transmitted frame will be answered with these bytes.
    pub fn queue_reply(&self, bytes: Vec<u8>) {
        self.0.lock().unwrap().replies.push_back(bytes);
    }

    /// Place bytes on the receive side as if another master had spoken.
    pub fn push_rx(&self, bytes: &[u8]) {
        self.0.lock().unwrap().rx.extend_from_slice(bytes);
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        self.0.lock().unwrap().written.clone()
    }

    pub fn written_count(&self) -> usize {
        self.0.lock().unwrap().written.len()
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.0.lock().unwrap().fail_sends = fail;
    }
}

impl BusPort for MockPort {
    fn send(&mut self, frame: &[u8]) -> Result<()> {
        let mut state = self.0.lock().unwrap();
        if state.fail_sends {
            bail!("mock port configured to fail");
        }
        state.written.push(frame.to_vec());
        if let Some(reply) = state.replies.pop_front() {
            state.rx.extend_from_slice(&reply);
        }
        Ok(())
    }

    fn drain(&mut self, sink: &mut Vec<u8>) -> Result<usize> {
        let mut state = self.0.lock().unwrap();
        let n = state.rx.len();
        sink.append(&mut state.rx);
        Ok(n)
    }
} // }}}

// Frame builders {{{
/// Response to a read: addr, func, serial, start, byte count, values, CRC.
pub fn read_response(
    function: DeviceFunction,
    start: u16,
    values: &[u16],
    serial: Serial,
) -> Vec<u8> {
    let byte_count = values.len() * 2;
    let mut frame = vec![0u8; 17 + byte_count];
    frame[0] = 0x01;
    frame[1] = function.into();
    frame[2..12].copy_from_slice(&serial.data());
    frame[12..14].copy_from_slice(&start.to_le_bytes());
    frame[14] = byte_count as u8;
    for (i, value) in values.iter().enumerate() {
        frame[15 + i * 2..17 + i * 2].copy_from_slice(&value.to_le_bytes());
    }
    let crc_offset = frame.len() - 2;
    let crc = packet::checksum(&frame[..crc_offset]);
    frame[crc_offset..].copy_from_slice(&crc.to_le_bytes());
    frame
}

/// Echo of a single-register write: addr, func, serial, register, value, CRC.
pub fn write_single_response(register: u16, value: u16, serial: Serial) -> Vec<u8> {
    let mut frame = vec![0u8; 18];
    frame[0] = 0x01;
    frame[1] = DeviceFunction::WriteSingle.into();
    frame[2..12].copy_from_slice(&serial.data());
    frame[12..14].copy_from_slice(&register.to_le_bytes());
    frame[14..16].copy_from_slice(&value.to_le_bytes());
    let crc = packet::checksum(&frame[..16]);
    frame[16..].copy_from_slice(&crc.to_le_bytes());
    frame
}

/// Confirmation of a multi-register write: echoes start and count.
pub fn write_multi_response(start: u16, count: u16, serial: Serial) -> Vec<u8> {
    let mut frame = vec![0u8; 18];
    frame[0] = 0x01;
    frame[1] = DeviceFunction::WriteMulti.into();
    frame[2..12].copy_from_slice(&serial.data());
    frame[12..14].copy_from_slice(&start.to_le_bytes());
    frame[14..16].copy_from_slice(&count.to_le_bytes());
    let crc = packet::checksum(&frame[..16]);
    frame[16..].copy_from_slice(&crc.to_le_bytes());
    frame
}

/// Exception response: high bit set on the function byte, exception code in
/// place of the byte count.
pub fn exception_response(function: DeviceFunction, register: u16, code: u8, serial: Serial) -> Vec<u8> {
    let func: u8 = function.into();
    let mut frame = vec![0u8; 17];
    frame[0] = 0x01;
    frame[1] = func | 0x80;
    frame[2..12].copy_from_slice(&serial.data());
    frame[12..14].copy_from_slice(&register.to_le_bytes());
    frame[14] = code;
    let crc = packet::checksum(&frame[..15]);
    frame[15..].copy_from_slice(&crc.to_le_bytes());
    frame
}

/// What the inverter answers to the identity probe: its serial number spread
/// over five input registers.
pub fn probe_response(serial_str: &str) -> Vec<u8> {
    let bytes = serial_str.as_bytes();
    assert_eq!(bytes.len(), 10);
    let values: Vec<u16> = (0..5)
        .map(|i| u16::from_le_bytes([bytes[i * 2], bytes[i * 2 + 1]]))
        .collect();
    read_response(
        DeviceFunction::ReadInput,
        packet::INVERTER_SN_START_REG,
        &values,
        Serial::default(),
    )
} // }}}

pub fn test_settings() -> Rs485Settings {
    Rs485Settings {
        response_timeout: Duration::from_millis(40),
        inter_frame_gap: Duration::ZERO,
        probe_backoff_base: Duration::from_millis(30),
        probe_backoff_max: Duration::from_millis(120),
    }
}

// Harness {{{
pub struct Harness {
    pub coordinator: Coordinator,
    pub port: MockPort,
    pub channels: Channels,
    pub guard: GuardManager,
    pub replies: broadcast::Receiver<Reply>,
}

pub fn harness() -> Harness {
    let yaml = r#"
dongle_serial: "2222222222"
rs485:
  device: mock
response_timeout_ms: 40
inter_frame_gap_ms: 0
probe_backoff_base_ms: 30
probe_backoff_max_ms: 120
request_timeout_ms: 200
cache_ttl_ms: 60000
"#;
    let config: Config = serde_yaml::from_str(yaml).unwrap();
    let config = ConfigWrapper::from_config(config);

    let channels = Channels::new();
    let guard = GuardManager::new();
    let port = MockPort::new();
    let arbiter = Rs485Arbiter::new(Box::new(port.clone()), test_settings(), guard.clone());
    let cache = FallbackCache::new(config.cache_max_entries(), config.cache_ttl());

    let replies = channels.to_clients.subscribe();
    let coordinator = Coordinator::new(config, channels.clone(), guard.clone(), arbiter, cache);

    Harness {
        coordinator,
        port,
        channels,
        guard,
        replies,
    }
}

impl Harness {
    /// Let the probe run against a mocked inverter so the link comes up.
    pub fn bring_link_up(&mut self) {
        self.port.queue_reply(probe_response(INVERTER_SERIAL));
        self.coordinator.tick(); // probe goes out, reply lands in rx
        self.coordinator.tick(); // reply framed, serial adopted
        assert!(self.coordinator.arbiter().link_up());
        assert_eq!(
            self.coordinator.arbiter().detected_serial().unwrap(),
            inverter_serial()
        );
    }

    pub fn next_reply(&mut self) -> Reply {
        self.replies.try_recv().expect("expected a reply to the client")
    }

    pub fn expect_sent_bytes(&mut self, client: u64) -> Vec<u8> {
        match self.next_reply() {
            Reply::Send { client: c, bytes } => {
                assert_eq!(c, client);
                bytes
            }
            other => panic!("expected Send to client {}, got {:?}", client, other),
        }
    }

    pub fn expect_close(&mut self, client: u64) {
        match self.next_reply() {
            Reply::Close { client: c } => assert_eq!(c, client),
            other => panic!("expected Close for client {}, got {:?}", client, other),
        }
    }

    pub fn expect_no_reply(&mut self) {
        assert!(self.replies.try_recv().is_err(), "expected no reply");
    }
} // }}}
