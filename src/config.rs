use crate::prelude::*;

use serde::Deserialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default = "Config::default_loglevel")]
    pub loglevel: String,

    #[serde(default = "Config::default_tcp_port")]
    pub tcp_port: u16,

    #[serde(default = "Config::default_max_clients")]
    pub max_clients: usize,

    #[serde(default = "Config::default_client_idle_timeout_secs")]
    pub client_idle_timeout_secs: u64,

    /// 10 ASCII characters, echoed in every response header.
    #[serde(default = "Config::default_dongle_serial")]
    pub dongle_serial: String,

    pub rs485: Rs485,

    #[serde(default = "Config::default_response_timeout_ms")]
    pub response_timeout_ms: u64,

    #[serde(default = "Config::default_inter_frame_gap_ms")]
    pub inter_frame_gap_ms: u64,

    #[serde(default = "Config::default_probe_backoff_base_ms")]
    pub probe_backoff_base_ms: u64,

    #[serde(default = "Config::default_probe_backoff_max_ms")]
    pub probe_backoff_max_ms: u64,

    #[serde(default = "Config::default_cache_max_entries")]
    pub cache_max_entries: usize,

    #[serde(default = "Config::default_cache_ttl_ms")]
    pub cache_ttl_ms: u64,

    #[serde(default = "Config::default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default = "Config::default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

// Rs485 {{{
#[derive(Clone, Debug, Deserialize)]
pub struct Rs485 {
    pub device: String,

    #[serde(default = "Config::default_baud")]
    pub baud: u32,

    /// Toggle RTS around transmissions for transceivers without automatic
    /// direction control.
    #[serde(default)]
    pub direction_control: bool,
}
// }}}

impl Config {
    pub fn new(file: String) -> Result<Self> {
        info!("Reading configuration from {}", file);
        let content = std::fs::read_to_string(&file)
            .map_err(|err| file_error!("error reading {}: {}", file, err))?;

        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;

        info!("Configuration loaded:");
        info!("  TCP port: {}", config.tcp_port);
        info!("  Max clients: {}", config.max_clients);
        info!("  Dongle serial: {}", config.dongle_serial);
        info!("  RS485 device: {} at {} baud", config.rs485.device, config.rs485.baud);
        info!("  Response timeout: {}ms", config.response_timeout_ms);
        info!("  Inter-frame gap: {}ms", config.inter_frame_gap_ms);
        info!("  Cache: {} entries, TTL {}ms", config.cache_max_entries, config.cache_ttl_ms);
        info!("  Log level: {}", config.loglevel);

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.tcp_port == 0 {
            bail!("tcp_port must be non-zero");
        }
        if self.max_clients == 0 {
            bail!("max_clients must be at least 1");
        }
        self.dongle_serial
            .parse::<Serial>()
            .map_err(|err| file_error!("invalid dongle_serial: {}", err))?;
        if self.rs485.device.is_empty() {
            bail!("rs485.device must be set");
        }
        Ok(())
    }

    fn default_loglevel() -> String {
        "info".to_string()
    }
    fn default_tcp_port() -> u16 {
        8000
    }
    fn default_max_clients() -> usize {
        5
    }
    fn default_client_idle_timeout_secs() -> u64 {
        300
    }
    fn default_dongle_serial() -> String {
        "0123456789".to_string()
    }
    fn default_baud() -> u32 {
        19200
    }
    fn default_response_timeout_ms() -> u64 {
        1000
    }
    fn default_inter_frame_gap_ms() -> u64 {
        50
    }
    fn default_probe_backoff_base_ms() -> u64 {
        5000
    }
    fn default_probe_backoff_max_ms() -> u64 {
        300_000
    }
    fn default_cache_max_entries() -> usize {
        10
    }
    fn default_cache_ttl_ms() -> u64 {
        600_000
    }
    fn default_request_timeout_ms() -> u64 {
        2000
    }
    fn default_tick_interval_ms() -> u64 {
        10
    }
}

pub struct ConfigWrapper {
    config: Arc<Mutex<Config>>,
}

impl Clone for ConfigWrapper {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
        }
    }
}

impl ConfigWrapper {
    pub fn new(file: String) -> Result<Self> {
        let config = Config::new(file)?;
        Ok(Self::from_config(config))
    }

    pub fn from_config(config: Config) -> Self {
        Self {
            config: Arc::new(Mutex::new(config)),
        }
    }

    pub fn loglevel(&self) -> String {
        self.config.lock().unwrap().loglevel.clone()
    }

    pub fn tcp_port(&self) -> u16 {
        self.config.lock().unwrap().tcp_port
    }

    pub fn max_clients(&self) -> usize {
        self.config.lock().unwrap().max_clients
    }

    pub fn client_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.config.lock().unwrap().client_idle_timeout_secs)
    }

    pub fn dongle_serial(&self) -> Serial {
        // validated at load time
        self.config.lock().unwrap().dongle_serial.parse().unwrap()
    }

    pub fn rs485_device(&self) -> String {
        self.config.lock().unwrap().rs485.device.clone()
    }

    pub fn rs485_baud(&self) -> u32 {
        self.config.lock().unwrap().rs485.baud
    }

    pub fn rs485_direction_control(&self) -> bool {
        self.config.lock().unwrap().rs485.direction_control
    }

    pub fn rs485_settings(&self) -> crate::rs485::Rs485Settings {
        let config = self.config.lock().unwrap();
        crate::rs485::Rs485Settings {
            response_timeout: Duration::from_millis(config.response_timeout_ms),
            inter_frame_gap: Duration::from_millis(config.inter_frame_gap_ms),
            probe_backoff_base: Duration::from_millis(config.probe_backoff_base_ms),
            probe_backoff_max: Duration::from_millis(config.probe_backoff_max_ms),
        }
    }

    pub fn cache_max_entries(&self) -> usize {
        self.config.lock().unwrap().cache_max_entries
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.config.lock().unwrap().cache_ttl_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.config.lock().unwrap().request_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.config.lock().unwrap().tick_interval_ms)
    }
}
