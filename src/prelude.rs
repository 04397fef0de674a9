pub use anyhow::{anyhow, bail, Result};
pub use log::{debug, error, info, warn};
pub use tokio::sync::broadcast;

pub use crate::cache::{FallbackCache, ReadFingerprint};
pub use crate::channels::Channels;
pub use crate::config::{Config, ConfigWrapper};
pub use crate::coordinator::Coordinator;
pub use crate::guard::GuardManager;
pub use crate::lux::packet::Serial;
pub use crate::options::Options;
pub use crate::server::Listener;
pub use crate::utils::Utils;
pub use crate::{file_error, file_error_with_source};
