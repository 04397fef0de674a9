use crate::prelude::*;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

pub type ClientId = u64;

/// A complete client frame is at least this long; shorter buffers keep
/// accumulating.
pub const MIN_FRAME_SIZE: usize = 38;

#[derive(Clone, Debug)]
pub enum ChannelData {
    Request { client: ClientId, bytes: Vec<u8> },
    Shutdown,
}

#[derive(Clone, Debug)]
pub enum Reply {
    Send { client: ClientId, bytes: Vec<u8> },
    Close { client: ClientId },
    Shutdown,
}

/// Accepts up to `max_clients` concurrent sessions. Each session owns an
/// accumulation buffer; once a full frame is buffered it is handed to the
/// coordinator in one shot and the buffer cleared. Session-level errors
/// never take the listener down.
#[derive(Clone)]
pub struct Listener {
    config: ConfigWrapper,
    channels: Channels,
    session_count: Arc<AtomicUsize>,
    next_client_id: Arc<AtomicU64>,
}

impl Listener {
    pub fn new(config: ConfigWrapper, channels: Channels) -> Self {
        Self {
            config,
            channels,
            session_count: Arc::new(AtomicUsize::new(0)),
            next_client_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub async fn start(&self) -> Result<()> {
        let port = self.config.tcp_port();
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|err| file_error_with_source!(err, "cannot bind TCP port {}", port))?;

        info!(
            "TCP server listening on port {} (max {} clients)",
            port,
            self.config.max_clients()
        );

        let mut shutdown = self.channels.to_clients.subscribe();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            warn!("accept failed: {}", err);
                            continue;
                        }
                    };

                    if self.session_count.load(Ordering::SeqCst) >= self.config.max_clients() {
                        warn!("max clients reached, rejecting connection from {}", addr);
                        drop(stream);
                        continue;
                    }

                    let client = self.next_client_id.fetch_add(1, Ordering::SeqCst);
                    let count = self.session_count.clone();
                    count.fetch_add(1, Ordering::SeqCst);
                    info!(
                        "client {} connected from {} (total: {}/{})",
                        client,
                        addr,
                        count.load(Ordering::SeqCst),
                        self.config.max_clients()
                    );

                    let session = Session {
                        client,
                        channels: self.channels.clone(),
                        idle_timeout: self.config.client_idle_timeout(),
                    };
                    tokio::spawn(async move {
                        if let Err(err) = session.run(stream).await {
                            warn!("client {} session ended: {:#}", session.client, err);
                        }
                        count.fetch_sub(1, Ordering::SeqCst);
                        info!("client {} removed (remaining: {})", session.client, count.load(Ordering::SeqCst));
                    });
                }
                reply = shutdown.recv() => {
                    if matches!(reply, Ok(Reply::Shutdown) | Err(broadcast::error::RecvError::Closed)) {
                        info!("TCP server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

struct Session {
    client: ClientId,
    channels: Channels,
    idle_timeout: std::time::Duration,
}

impl Session {
    async fn run(&self, stream: TcpStream) -> Result<()> {
        let (mut reader, mut writer) = stream.into_split();
        let mut replies = self.channels.to_clients.subscribe();
        let mut rx_buffer: Vec<u8> = Vec::with_capacity(MIN_FRAME_SIZE * 2);
        let mut chunk = [0u8; 512];

        loop {
            tokio::select! {
                read = tokio::time::timeout(self.idle_timeout, reader.read(&mut chunk)) => {
                    let n = match read {
                        Err(_) => {
                            warn!("client {} idle timeout", self.client);
                            break;
                        }
                        Ok(Err(err)) => bail!("read error: {}", err),
                        Ok(Ok(0)) => {
                            debug!("client {} disconnected", self.client);
                            break;
                        }
                        Ok(Ok(n)) => n,
                    };

                    rx_buffer.extend_from_slice(&chunk[..n]);
                    debug!(
                        "client {}: received {} bytes (buffer total: {})",
                        self.client,
                        n,
                        rx_buffer.len()
                    );

                    // One request at a time per session: ship the whole
                    // buffer once a full frame is there, then start over.
                    if rx_buffer.len() >= MIN_FRAME_SIZE {
                        let bytes = std::mem::take(&mut rx_buffer);
                        info!(
                            "client {}: forwarding {} bytes to coordinator",
                            self.client,
                            bytes.len()
                        );
                        let _ = self.channels.from_clients.send(ChannelData::Request {
                            client: self.client,
                            bytes,
                        });
                    }
                }
                reply = replies.recv() => match reply {
                    Ok(Reply::Send { client, bytes }) if client == self.client => {
                        writer.write_all(&bytes).await?;
                        debug!("client {}: sent {} bytes", self.client, bytes.len());
                    }
                    Ok(Reply::Close { client }) if client == self.client => {
                        info!("client {}: closing on coordinator request", self.client);
                        break;
                    }
                    Ok(Reply::Shutdown) => break,
                    Ok(_) => {} // some other session's reply
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("client {}: reply channel lagged by {}", self.client, n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        Ok(())
    }
}
