pub mod cache;
pub mod channels;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod guard;
pub mod lux;
pub mod options;
pub mod prelude;
pub mod rs485;
pub mod server;
pub mod utils;

use crate::prelude::*;
use crate::rs485::{Rs485Arbiter, Rs485Port};

const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

pub async fn app(mut shutdown: broadcast::Receiver<()>, config: ConfigWrapper) -> Result<()> {
    info!("lux-bridge {} starting", CARGO_PKG_VERSION);

    info!("Initializing channels...");
    let channels = Channels::new();
    let guard = GuardManager::new();

    info!("  Opening RS485 port...");
    let port = Rs485Port::open(
        &config.rs485_device(),
        config.rs485_baud(),
        config.rs485_direction_control(),
    )?;
    let arbiter = Rs485Arbiter::new(Box::new(port), config.rs485_settings(), guard.clone());

    info!("  Creating FallbackCache...");
    let cache = FallbackCache::new(config.cache_max_entries(), config.cache_ttl());

    info!("  Creating Coordinator...");
    let mut coordinator = Coordinator::new(
        config.clone(),
        channels.clone(),
        guard.clone(),
        arbiter,
        cache,
    );

    info!("  Creating TCP listener...");
    let listener = Listener::new(config.clone(), channels.clone());

    info!("Starting components...");
    let coordinator_handle = tokio::spawn(async move {
        if let Err(e) = coordinator.start().await {
            error!("coordinator error: {}", e);
        }
    });

    let listener_handle = tokio::spawn({
        let listener = listener.clone();
        async move {
            if let Err(e) = listener.start().await {
                error!("listener error: {}", e);
            }
        }
    });

    // Relay the shutdown signal onto the component channels; each component
    // drains and returns on its own.
    let shutdown_channels = channels.clone();
    tokio::spawn(async move {
        let _ = shutdown.recv().await;
        info!("initiating shutdown sequence");
        let _ = shutdown_channels
            .from_clients
            .send(server::ChannelData::Shutdown);
        let _ = shutdown_channels.to_clients.send(server::Reply::Shutdown);
    });

    futures::try_join!(coordinator_handle, listener_handle)?;

    info!("Shutdown complete");
    Ok(())
}
