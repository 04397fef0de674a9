use crate::prelude::*;

use crate::guard::{Activity, GuardManager, OperationGuard};
use crate::lux::packet::{
    self, DeviceFunction, ParsedResponse, Serial, INVERTER_SN_REG_COUNT, INVERTER_SN_START_REG,
    MAX_RX_BUFFER_SIZE, MIN_EXCEPTION_SIZE, SERIAL_NUMBER_LENGTH,
};
use std::time::{Duration, Instant};

/// The half-duplex bus seam. The arbiter drives whatever sits behind this;
/// production uses a serial port, tests use an in-memory port.
pub trait BusPort: Send {
    /// Transmit one frame, blocking only for the write-and-drain itself.
    fn send(&mut self, frame: &[u8]) -> Result<()>;

    /// Move any bytes the bus has produced into `sink` without waiting for
    /// more. Returns the number of bytes moved.
    fn drain(&mut self, sink: &mut Vec<u8>) -> Result<usize>;
}

// Rs485Port {{{
/// Production port: 8N1 serial with a short read deadline so polling never
/// stalls the tick loop. Direction control, when enabled, toggles RTS around
/// the write with a brief settling delay.
pub struct Rs485Port {
    port: Box<dyn serialport::SerialPort>,
    direction_control: bool,
}

impl Rs485Port {
    pub fn open(device: &str, baud: u32, direction_control: bool) -> Result<Self> {
        info!("opening RS485 port {} at {} baud", device, baud);

        let port = serialport::new(device, baud)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .timeout(Duration::from_millis(15))
            .open()
            .map_err(|err| file_error_with_source!(err, "failed to open {}", device))?;

        let mut rs485 = Self {
            port,
            direction_control,
        };
        if direction_control {
            rs485.set_direction_tx(false)?;
        }

        Ok(rs485)
    }

    fn set_direction_tx(&mut self, tx: bool) -> Result<()> {
        self.port.write_request_to_send(tx)?;
        // transceiver settling time
        std::thread::sleep(Duration::from_micros(10));
        Ok(())
    }
}

impl BusPort for Rs485Port {
    fn send(&mut self, frame: &[u8]) -> Result<()> {
        use std::io::Write;

        if self.direction_control {
            self.set_direction_tx(true)?;
        }

        let result = self.port.write_all(frame).and_then(|_| self.port.flush());

        if self.direction_control {
            self.set_direction_tx(false)?;
        }

        result.map_err(|err| anyhow!("serial write failed: {}", err))
    }

    fn drain(&mut self, sink: &mut Vec<u8>) -> Result<usize> {
        use std::io::Read;

        let available = self.port.bytes_to_read()? as usize;
        if available == 0 {
            return Ok(0);
        }

        let old_len = sink.len();
        sink.resize(old_len + available, 0);
        match self.port.read(&mut sink[old_len..]) {
            Ok(n) => {
                sink.truncate(old_len + n);
                Ok(n)
            }
            Err(err) if err.kind() == std::io::ErrorKind::TimedOut => {
                sink.truncate(old_len);
                Ok(0)
            }
            Err(err) => {
                sink.truncate(old_len);
                Err(anyhow!("serial read failed: {}", err))
            }
        }
    }
} // }}}

#[derive(Clone, Debug, Default)]
pub struct ArbiterStats {
    pub total_requests: u64,
    pub successful_responses: u64,
    pub failed_responses: u64,
    pub timeouts: u64,
    pub ignored_packets: u64,
}

/// Outcome of the most recent bus transaction.
#[derive(Clone, Debug, Default)]
pub struct TransactionOutcome {
    pub success: bool,
    pub response: Option<ParsedResponse>,
    pub error: String,
}

#[derive(Clone, Debug)]
pub struct Rs485Settings {
    pub response_timeout: Duration,
    pub inter_frame_gap: Duration,
    pub probe_backoff_base: Duration,
    pub probe_backoff_max: Duration,
}

impl Default for Rs485Settings {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_millis(1000),
            inter_frame_gap: Duration::from_millis(50),
            probe_backoff_base: Duration::from_secs(5),
            probe_backoff_max: Duration::from_secs(300),
        }
    }
}

/// Owner of the bus. Strict half-duplex: at most one request in flight, a
/// response is delimited by inter-frame silence, and anything a second
/// master says in between is filtered out by frame matching.
pub struct Rs485Arbiter {
    port: Box<dyn BusPort>,
    settings: Rs485Settings,
    guard: GuardManager,

    waiting_response: bool,
    expected_function: DeviceFunction,
    expected_start: u16,
    last_tx_time: Instant,
    last_rx_time: Instant,
    rx_buffer: Vec<u8>,

    last_result: TransactionOutcome,
    last_raw_response: Vec<u8>,

    link_up: bool,
    detected_serial: Option<Serial>,
    probe_pending: bool,
    probe_guard: Option<OperationGuard>,
    next_probe_at: Instant,
    probe_backoff: Duration,

    stats: ArbiterStats,
}

impl Rs485Arbiter {
    pub fn new(port: Box<dyn BusPort>, settings: Rs485Settings, guard: GuardManager) -> Self {
        let now = Instant::now();
        let probe_backoff = settings.probe_backoff_base;

        Self {
            port,
            settings,
            guard,
            waiting_response: false,
            expected_function: DeviceFunction::ReadInput,
            expected_start: 0,
            last_tx_time: now,
            last_rx_time: now,
            rx_buffer: Vec::new(),
            last_result: TransactionOutcome::default(),
            last_raw_response: Vec::new(),
            link_up: false,
            detected_serial: None,
            probe_pending: false,
            probe_guard: None,
            next_probe_at: now,
            probe_backoff,
            stats: ArbiterStats::default(),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.waiting_response
    }

    pub fn link_up(&self) -> bool {
        self.link_up
    }

    pub fn detected_serial(&self) -> Option<Serial> {
        self.detected_serial
    }

    pub fn last_result(&self) -> &TransactionOutcome {
        &self.last_result
    }

    pub fn last_raw_response(&self) -> &[u8] {
        &self.last_raw_response
    }

    pub fn stats(&self) -> &ArbiterStats {
        &self.stats
    }

    fn request_serial(&self) -> Serial {
        // Zeros until the probe has learned the real serial; the inverter
        // answers either way and echoes the field back.
        self.detected_serial.unwrap_or_default()
    }

    /// Dispatch a read. Returns false when a transaction is already in
    /// flight or the link is down (a probe is scheduled in that case).
    pub fn send_read(&mut self, function: DeviceFunction, start: u16, count: u16) -> bool {
        if self.waiting_response {
            warn!("cannot send read: waiting for response");
            return false;
        }

        if !self.link_up {
            warn!("inverter link down, re-probing serial before processing requests");
            self.request_probe();
            return false;
        }

        let packet = match packet::create_read_request(function, start, count, self.request_serial())
        {
            Ok(p) => p,
            Err(err) => {
                error!("failed to build read request: {:#}", err);
                return false;
            }
        };

        info!(
            "TX: {:?} regs={}-{} ({} regs)",
            function,
            start,
            start as u32 + count as u32 - 1,
            count
        );

        self.expected_function = function;
        self.expected_start = start;
        self.transmit(&packet)
    }

    /// Dispatch a write; one value goes out as 0x06, more as 0x10.
    pub fn send_write(&mut self, start: u16, values: &[u16]) -> bool {
        if self.waiting_response {
            warn!("cannot send write: waiting for response");
            return false;
        }

        if !self.link_up {
            warn!("inverter link down, re-probing serial before processing requests");
            self.request_probe();
            return false;
        }

        let packet = match packet::create_write_request(start, values, self.request_serial()) {
            Ok(p) => p,
            Err(err) => {
                error!("failed to build write request: {:#}", err);
                return false;
            }
        };

        info!(
            "TX: write regs={}-{} ({} vals)",
            start,
            start as u32 + values.len() as u32 - 1,
            values.len()
        );

        self.expected_function = if values.len() == 1 {
            DeviceFunction::WriteSingle
        } else {
            DeviceFunction::WriteMulti
        };
        self.expected_start = start;
        self.transmit(&packet)
    }

    fn transmit(&mut self, packet: &[u8]) -> bool {
        debug!("TX raw [{} bytes]: {}", packet.len(), Utils::format_hex(packet));

        if let Err(err) = self.port.send(packet) {
            error!("bus transmit failed: {:#}", err);
            if self.probe_pending {
                self.probe_failed("transmit failed");
            }
            return false;
        }

        self.last_tx_time = Instant::now();
        self.waiting_response = true;
        self.stats.total_requests += 1;
        true
    }

    /// Emit the identity probe: a read of the registers holding the
    /// inverter's own serial number. Cadence is bounded by exponential
    /// backoff; the probe also takes the operation guard so it cannot
    /// overlap a scan or update.
    pub fn request_probe(&mut self) {
        if self.waiting_response {
            warn!("skipping inverter serial probe: waiting for previous response");
            return;
        }

        if Instant::now() < self.next_probe_at {
            return;
        }

        let probe_guard = match self.guard.try_acquire(Activity::LinkProbe, "inverter identity probe") {
            Some(g) => g,
            None => {
                debug!(
                    "skipping inverter serial probe: {} active",
                    self.guard.active_kind().map(|a| a.name()).unwrap_or("?")
                );
                return;
            }
        };

        // assume down until proven otherwise
        self.link_up = false;

        let packet = match packet::create_read_request(
            DeviceFunction::ReadInput,
            INVERTER_SN_START_REG,
            INVERTER_SN_REG_COUNT,
            self.request_serial(),
        ) {
            Ok(p) => p,
            Err(err) => {
                error!("failed to build inverter serial probe request: {:#}", err);
                return;
            }
        };

        info!(
            "probing inverter serial (regs {}-{})...",
            INVERTER_SN_START_REG,
            INVERTER_SN_START_REG + INVERTER_SN_REG_COUNT - 1
        );

        self.probe_pending = true;
        self.probe_guard = Some(probe_guard);
        self.expected_function = DeviceFunction::ReadInput;
        self.expected_start = INVERTER_SN_START_REG;
        if !self.transmit(&packet) {
            self.probe_guard = None;
            self.probe_pending = false;
        }
    }

    /// One pass of the cooperative loop: drain the port, frame on
    /// inter-frame silence, expire the response timer, keep the probe alive.
    pub fn tick(&mut self) {
        self.pump_receive();

        if self.waiting_response && self.last_tx_time.elapsed() > self.settings.response_timeout {
            self.handle_timeout();
        }

        if !self.link_up
            && !self.probe_pending
            && !self.waiting_response
            && Instant::now() >= self.next_probe_at
        {
            self.request_probe();
        }
    }

    /// Force the transaction state back to idle. Used by the coordinator
    /// when its own end-to-end deadline fires first.
    pub fn abort(&mut self) {
        if !self.waiting_response {
            return;
        }

        warn!("aborting in-flight bus transaction");
        self.rx_buffer.clear();
        self.fail_transaction("Aborted");
    }

    fn pump_receive(&mut self) {
        let mut chunk = Vec::new();
        match self.port.drain(&mut chunk) {
            Ok(0) => {}
            Ok(_) => {
                self.rx_buffer.append(&mut chunk);
                self.last_rx_time = Instant::now();
            }
            Err(err) => {
                error!("bus receive failed: {:#}", err);
            }
        }

        if self.rx_buffer.len() > MAX_RX_BUFFER_SIZE {
            warn!("receive buffer overflow ({} bytes), desync", self.rx_buffer.len());
            self.rx_buffer.clear();
            if self.waiting_response {
                self.fail_transaction("Receive buffer overflow");
            }
            return;
        }

        if !self.rx_buffer.is_empty()
            && self.last_rx_time.elapsed() >= self.settings.inter_frame_gap
        {
            self.attempt_framing();
        }
    }

    fn attempt_framing(&mut self) {
        let buffer = std::mem::take(&mut self.rx_buffer);

        if !self.waiting_response {
            debug!(
                "ignoring {} bytes while not waiting for a response: {}",
                buffer.len(),
                Utils::format_hex(&buffer[..buffer.len().min(32)])
            );
            self.stats.ignored_packets += 1;
            return;
        }

        // Fast path: the buffer holds exactly one response frame (an
        // exception may carry two CRC bytes past its minimum length).
        let frame_len = packet::frame_length(&buffer);
        let single = buffer[0] == packet::DEVICE_ADDR_RESPONSE
            && frame_len > 0
            && (frame_len == buffer.len()
                || (frame_len == MIN_EXCEPTION_SIZE && buffer.len() == frame_len + 2));
        if single {
            if let Ok(parsed) = packet::parse_response(&buffer) {
                self.complete_transaction(buffer, parsed);
                return;
            }
        }

        // Shared-bus path: other masters' frames may be concatenated with
        // ours. Locate the response that answers our request.
        let frames = packet::split_frames(&buffer);
        match packet::find_matching_response(&frames, self.expected_function, self.expected_start) {
            Some(index) => {
                let frame = &frames[index];
                if frame.offset > 0 {
                    debug!(
                        "discarding {} leading bytes of unrelated bus traffic",
                        frame.offset
                    );
                }
                let raw = buffer[frame.offset..frame.offset + frame.length].to_vec();
                let parsed = frame.response.clone().expect("matched frame is parsed");
                self.complete_transaction(raw, parsed);
            }
            None if packet::is_request(&buffer) => {
                // Nothing but another master's traffic; our response may
                // still be on its way.
                debug!(
                    "ignoring foreign master traffic ({} bytes): {}",
                    buffer.len(),
                    Utils::format_hex(&buffer[..buffer.len().min(32)])
                );
                self.stats.ignored_packets += 1;
            }
            None => {
                warn!(
                    "RX [{} bytes] - INVALID: {}",
                    buffer.len(),
                    Utils::format_hex(&buffer[..buffer.len().min(32)])
                );
                self.resync(&buffer);
                self.fail_transaction("Invalid response frame");
            }
        }
    }

    /// After garbage, keep any suffix that could be the start of a response
    /// so the next inter-frame gap gets a chance to frame it.
    fn resync(&mut self, buffer: &[u8]) {
        for i in 1..buffer.len().saturating_sub(1) {
            if buffer[i] == packet::DEVICE_ADDR_RESPONSE {
                let base = buffer[i + 1] & 0x7F;
                if matches!(base, 0x03 | 0x04 | 0x06 | 0x10) {
                    self.rx_buffer = buffer[i..].to_vec();
                    debug!("resync: kept {} trailing bytes", self.rx_buffer.len());
                    return;
                }
            }
        }
    }

    fn complete_transaction(&mut self, raw: Vec<u8>, parsed: ParsedResponse) {
        debug!("RX raw [{} bytes]: {}", raw.len(), Utils::format_hex(&raw));
        self.last_raw_response = raw;

        let mut outcome = TransactionOutcome {
            success: true,
            response: Some(parsed.clone()),
            error: String::new(),
        };

        if let Some(code) = parsed.exception_code {
            outcome.success = false;
            outcome.error = format!(
                "Modbus Exception 0x{:02X} (register {})",
                code, parsed.start_register
            );
        } else if parsed.function != self.expected_function {
            outcome.success = false;
            outcome.error = "Response function code mismatch".to_string();
            warn!(
                "response function code mismatch: expected {:?}, got {:?}",
                self.expected_function, parsed.function
            );
        } else if parsed.start_register != self.expected_start {
            outcome.success = false;
            outcome.error = "Response start register mismatch".to_string();
            warn!(
                "response start register mismatch: expected {}, got {}",
                self.expected_start, parsed.start_register
            );
        }

        let is_serial_probe = self.probe_pending
            && parsed.function == DeviceFunction::ReadInput
            && parsed.start_register == INVERTER_SN_START_REG
            && parsed.register_count >= INVERTER_SN_REG_COUNT;

        if outcome.success {
            info!(
                "RX: {:?} OK | {} regs",
                parsed.function, parsed.register_count
            );
            self.stats.successful_responses += 1;

            if is_serial_probe {
                self.adopt_probed_serial(&parsed);
            }
        } else {
            error!("RX: FAIL | {}", outcome.error);
            self.stats.failed_responses += 1;

            if is_serial_probe {
                let error = outcome.error.clone();
                self.probe_failed(&error);
            }
        }

        if self.probe_pending && !is_serial_probe {
            self.probe_pending = false;
            self.probe_guard = None;
        }

        self.last_result = outcome;
        self.waiting_response = false;
    }

    fn adopt_probed_serial(&mut self, parsed: &ParsedResponse) {
        let mut bytes = Vec::with_capacity(SERIAL_NUMBER_LENGTH);
        for value in parsed.values.iter().take(INVERTER_SN_REG_COUNT as usize) {
            bytes.extend_from_slice(&value.to_le_bytes());
        }

        match Serial::new(&bytes[..SERIAL_NUMBER_LENGTH]) {
            Ok(serial) => {
                info!(
                    "inverter serial (regs {}-{}): {}",
                    INVERTER_SN_START_REG,
                    INVERTER_SN_START_REG + INVERTER_SN_REG_COUNT - 1,
                    serial
                );
                self.detected_serial = Some(serial);
                self.link_up = true;
                self.probe_pending = false;
                self.probe_guard = None;
                self.probe_backoff = self.settings.probe_backoff_base;
                self.next_probe_at = Instant::now();
            }
            Err(err) => {
                error!("probe returned malformed serial: {:#}", err);
                self.probe_failed("malformed serial");
            }
        }
    }

    fn probe_failed(&mut self, reason: &str) {
        error!("inverter serial probe failed: {}", reason);
        self.probe_pending = false;
        self.probe_guard = None;
        self.link_up = false;
        self.next_probe_at = Instant::now() + self.probe_backoff;
        self.probe_backoff = (self.probe_backoff * 2).min(self.settings.probe_backoff_max);
    }

    fn fail_transaction(&mut self, error: &str) {
        self.stats.failed_responses += 1;
        self.last_raw_response.clear();
        self.last_result = TransactionOutcome {
            success: false,
            response: None,
            error: error.to_string(),
        };
        self.waiting_response = false;
        if self.probe_pending {
            self.probe_failed(error);
        }
    }

    fn handle_timeout(&mut self) {
        self.stats.timeouts += 1;

        warn!(
            "response timeout ({:?}) | func={:?} start_reg={}",
            self.settings.response_timeout, self.expected_function, self.expected_start
        );
        warn!(
            "  timeout stats: total={}, failed={}, success={}",
            self.stats.timeouts, self.stats.failed_responses, self.stats.successful_responses
        );

        self.rx_buffer.clear();
        self.fail_transaction("Timeout");
    }
}
