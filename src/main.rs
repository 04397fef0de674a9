use log::{error, info};
use std::error::Error;
use std::io::Write;
use std::time::Duration;
use tokio::sync::broadcast;

use lux_bridge::prelude::*;

const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let options = Options::new();

    let config = ConfigWrapper::new(options.config_file.clone()).unwrap_or_else(|err| {
        // no logging available yet, so eprintln! will have to do
        eprintln!("Error: {:?}", err);
        std::process::exit(255);
    });

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(config.loglevel()))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {} {}] {}",
                chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.module_path().unwrap_or(""),
                record.args()
            )
        })
        .write_style(env_logger::WriteStyle::Never)
        .init();

    info!("Starting lux-bridge {} with config file: {}", CARGO_PKG_VERSION, options.config_file);

    // Create a channel for shutdown signaling
    let (shutdown_tx, _) = broadcast::channel(1);

    // Handle Ctrl+C
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
        info!("Ctrl+C received, initiating shutdown");
        if let Err(e) = shutdown_tx_clone.send(()) {
            error!("Failed to send shutdown signal: {}", e);
        }
    });

    // If a runtime limit is specified, terminate after that duration
    if let Some(time) = options.runtime {
        let shutdown_tx_clone = shutdown_tx.clone();
        tokio::spawn(async move {
            info!("Runtime of {} seconds specified, will terminate automatically", time);
            tokio::time::sleep(Duration::from_secs(time)).await;
            info!("Runtime duration reached, initiating shutdown");
            if let Err(e) = shutdown_tx_clone.send(()) {
                error!("Failed to send shutdown signal: {}", e);
            }
        });
    }

    if let Err(e) = lux_bridge::app(shutdown_tx.subscribe(), config).await {
        error!("Application error: {}", e);
    }

    Ok(())
}
