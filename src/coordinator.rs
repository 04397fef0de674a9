use crate::prelude::*;

use crate::cache::ReadFingerprint;
use crate::guard::Activity;
use crate::lux::packet::ParsedResponse;
use crate::lux::tcp_packet::{self, TcpRequest};
use crate::rs485::Rs485Arbiter;
use crate::server::{ChannelData, ClientId, Reply};
use std::time::Instant;

#[derive(Clone, Debug, Default)]
pub struct BridgeStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub busy_rejections: u64,
}

impl BridgeStats {
    pub fn print_summary(&self) {
        info!("Bridge statistics:");
        info!("  Total requests: {}", self.total_requests);
        info!("  Successful: {}", self.successful_requests);
        info!("  Failed: {}", self.failed_requests);
        info!("  Busy rejections: {}", self.busy_rejections);
    }
}

/// The single request the bridge is working on. At most one exists at a
/// time; everything else waits in session buffers.
struct ActiveRequest {
    client: ClientId,
    request: TcpRequest,
    started_at: Instant,
}

/// Orchestrates the pipeline: decode the client frame, arbitrate the bus,
/// validate the reply against the request, wrap it back to the client, and
/// fall back to the last-known-good response when the bus cannot answer.
pub struct Coordinator {
    config: ConfigWrapper,
    channels: Channels,
    guard: GuardManager,
    arbiter: Rs485Arbiter,
    cache: FallbackCache,
    active_request: Option<ActiveRequest>,
    pub stats: BridgeStats,
}

impl Coordinator {
    pub fn new(
        config: ConfigWrapper,
        channels: Channels,
        guard: GuardManager,
        arbiter: Rs485Arbiter,
        cache: FallbackCache,
    ) -> Self {
        Self {
            config,
            channels,
            guard,
            arbiter,
            cache,
            active_request: None,
            stats: BridgeStats::default(),
        }
    }

    pub async fn start(&mut self) -> Result<()> {
        let mut receiver = self.channels.from_clients.subscribe();
        let mut ticker = tokio::time::interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!("coordinator starting");

        loop {
            tokio::select! {
                data = receiver.recv() => match data {
                    Ok(ChannelData::Request { client, bytes }) => {
                        self.process_client_bytes(client, &bytes);
                    }
                    Ok(ChannelData::Shutdown) => break,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("coordinator lagged, dropped {} client messages", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = ticker.tick() => self.tick(),
            }
        }

        self.print_summary();
        Ok(())
    }

    pub fn cache_size(&self) -> usize {
        self.cache.len()
    }

    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    pub fn arbiter(&self) -> &Rs485Arbiter {
        &self.arbiter
    }

    pub fn print_summary(&self) {
        self.stats.print_summary();

        let arbiter = self.arbiter.stats();
        info!("Bus statistics:");
        info!("  Requests: {}", arbiter.total_requests);
        info!("  Responses ok/failed: {}/{}", arbiter.successful_responses, arbiter.failed_responses);
        info!("  Timeouts: {}", arbiter.timeouts);
        info!("  Ignored foreign packets: {}", arbiter.ignored_packets);

        info!("Fallback cache:");
        info!("  Entries: {}", self.cache.len());
        info!(
            "  Hits/misses/invalidations: {}/{}/{}",
            self.cache.hits(),
            self.cache.misses(),
            self.cache.invalidations()
        );
        for entry in self.cache.snapshot() {
            info!(
                "  {} age={:?} hits={} size={}",
                entry.fingerprint, entry.age, entry.hit_count, entry.size
            );
        }
    }

    /// Handle one complete client frame. On success the request is left in
    /// flight; completion happens in `tick()`.
    pub fn process_client_bytes(&mut self, client: ClientId, bytes: &[u8]) {
        self.stats.total_requests += 1;

        debug!(
            "client {} raw (first 40b): {}",
            client,
            Utils::format_hex(&bytes[..bytes.len().min(40)])
        );

        let request = match tcp_packet::parse_request(bytes) {
            Ok(r) => r,
            Err(err) => {
                // Malformed frames get no reply; the session stays open.
                error!("failed to parse client request: {:#}", err);
                self.stats.failed_requests += 1;
                return;
            }
        };

        info!(
            "request #{}: {:?} regs={}-{} ({} regs) from client {}",
            self.stats.total_requests,
            request.function,
            request.start_register,
            request.start_register as u32 + request.register_count as u32 - 1,
            request.register_count,
            client
        );
        debug!("  bus packet: {}", Utils::format_hex(&request.bus_packet));

        // A scan, update, or probe owns the coarse-activity guard; do not
        // touch the bus underneath it.
        if let Some(kind) = self.guard.active_kind() {
            if kind != Activity::TcpRequestHandling {
                warn!("rejecting request: {} in progress", kind.name());
                self.stats.busy_rejections += 1;
                self.stats.failed_requests += 1;
                self.send_error(client, None);
                return;
            }
        }

        let _guard = match self.guard.try_acquire(Activity::TcpRequestHandling, "client request") {
            Some(g) => g,
            None => {
                warn!("rejecting request: guard busy");
                self.stats.busy_rejections += 1;
                self.stats.failed_requests += 1;
                self.send_error(client, None);
                return;
            }
        };

        if self.active_request.is_some() || self.arbiter.is_busy() {
            warn!("already processing a request, rejecting");
            self.stats.busy_rejections += 1;
            self.stats.failed_requests += 1;
            self.send_error(client, None);
            return;
        }

        let sent = if request.is_write() {
            self.arbiter.send_write(request.start_register, &request.write_values)
        } else {
            self.arbiter
                .send_read(request.function, request.start_register, request.register_count)
        };

        if !sent {
            error!("failed to send bus request");
            self.stats.failed_requests += 1;

            if !request.is_write() {
                let fingerprint = Self::fingerprint(&request);
                if let Some(bytes) = self.cache.get(&fingerprint) {
                    self.send(client, bytes);
                    return;
                }
            }

            self.send_error(client, None);
            return;
        }

        self.active_request = Some(ActiveRequest {
            client,
            request,
            started_at: Instant::now(),
        });
    }

    /// One pass of the cooperative loop: advance the arbiter, finish a
    /// completed transaction, enforce the end-to-end deadline.
    pub fn tick(&mut self) {
        self.arbiter.tick();

        if self.active_request.is_none() {
            return;
        }

        if !self.arbiter.is_busy() {
            let active = self.active_request.take().unwrap();
            self.finish_request(active);
            return;
        }

        // Backstop deadline, independent of the arbiter's own response
        // timer, so pathological framing cannot hold a client forever.
        let deadline = self.config.request_timeout();
        if self.active_request.as_ref().unwrap().started_at.elapsed() > deadline {
            warn!("request deadline ({:?}) exceeded, aborting", deadline);
            self.arbiter.abort();
            let active = self.active_request.take().unwrap();
            self.finish_request(active);
        }
    }

    fn finish_request(&mut self, active: ActiveRequest) {
        let outcome = self.arbiter.last_result().clone();
        let elapsed = active.started_at.elapsed();

        if outcome.success {
            let response = outcome.response.as_ref().expect("successful outcome has response");

            if !Self::response_matches(response, &active.request) {
                warn!(
                    "response mismatch (collision?): expected func={:?} start={} count={}, got func={:?} start={} count={}",
                    active.request.function,
                    active.request.start_register,
                    active.request.register_count,
                    response.function,
                    response.start_register,
                    response.register_count
                );
                self.stats.failed_requests += 1;
                self.fall_back(active, false);
                return;
            }

            info!(
                "request OK func={:?} regs={} start={} time={:?}",
                response.function, response.register_count, response.start_register, elapsed
            );

            let raw = self.arbiter.last_raw_response().to_vec();
            match tcp_packet::build_response(&raw, self.config.dongle_serial()) {
                Ok(encoded) => {
                    self.send(active.client, encoded.clone());
                    self.stats.successful_requests += 1;

                    if !active.request.is_write() {
                        self.cache.put(Self::fingerprint(&active.request), encoded);
                    }
                }
                Err(err) => {
                    error!("failed to build client response: {:#}", err);
                    self.stats.failed_requests += 1;
                    self.fall_back(active, false);
                }
            }
        } else {
            error!("bus request failed: {} (after {:?})", outcome.error, elapsed);
            let raw = self.arbiter.last_raw_response();
            if !raw.is_empty() {
                debug!("  raw bus response: {}", Utils::format_hex(raw));
            }

            self.stats.failed_requests += 1;

            // A matching exception is the inverter's own answer; it may be
            // forwarded verbatim once the cache has had its chance.
            let exception_ok = matches!(
                &outcome.response,
                Some(r) if r.is_exception() && Self::exception_matches(r, &active.request)
            );
            self.fall_back(active, exception_ok);
        }
    }

    /// Failure tail: reads are served from the fallback cache when possible;
    /// a matching exception is forwarded verbatim; otherwise the session is
    /// told to close.
    fn fall_back(&mut self, active: ActiveRequest, forward_raw: bool) {
        if !active.request.is_write() {
            let fingerprint = Self::fingerprint(&active.request);
            if let Some(bytes) = self.cache.get(&fingerprint) {
                self.send(active.client, bytes);
                return;
            }
        }

        if forward_raw {
            let raw = self.arbiter.last_raw_response().to_vec();
            self.send_error(active.client, Some(&raw));
        } else {
            self.send_error(active.client, None);
        }
    }

    fn fingerprint(request: &TcpRequest) -> ReadFingerprint {
        ReadFingerprint::new(request.function, request.start_register, request.register_count)
    }

    /// The central correctness contract: a response answers a request iff
    /// function, start register and (for non-exception responses) register
    /// count line up.
    fn response_matches(response: &ParsedResponse, request: &TcpRequest) -> bool {
        if response.function != request.function {
            return false;
        }
        if response.start_register != request.start_register {
            return false;
        }
        if response.is_exception() {
            return true;
        }
        if request.is_write() {
            response.register_count as usize == request.write_values.len()
        } else {
            response.register_count == request.register_count
        }
    }

    fn exception_matches(response: &ParsedResponse, request: &TcpRequest) -> bool {
        response.function == request.function
            && response.start_register == request.start_register
    }

    fn send(&mut self, client: ClientId, bytes: Vec<u8>) {
        debug!("sending {} bytes to client {}", bytes.len(), client);
        let _ = self.channels.to_clients.send(Reply::Send { client, bytes });
    }

    /// No dedicated error frame exists on this wire; forward the inverter's
    /// raw bytes when we have matching ones, otherwise drop the session.
    fn send_error(&mut self, client: ClientId, raw: Option<&[u8]>) {
        if let Some(raw) = raw {
            if !raw.is_empty() {
                match tcp_packet::build_response(raw, self.config.dongle_serial()) {
                    Ok(encoded) => {
                        info!("forwarding exception response to client {} ({} bytes)", client, encoded.len());
                        self.send(client, encoded);
                        return;
                    }
                    Err(err) => {
                        error!("failed to wrap exception response: {:#}", err);
                    }
                }
            }
        }

        warn!("cannot build a proper error response, closing client {}", client);
        let _ = self.channels.to_clients.send(Reply::Close { client });
    }
}
