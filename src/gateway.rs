//! Gateway (WebSocket) driver for one Discord shard.
//!
//! This module owns the WebSocket connection lifecycle:
//!   - connect → receive HELLO → send IDENTIFY (with the shard pair)
//!   - background heartbeat task
//!   - sequence number + session_id tracking
//!   - automatic reconnect + RESUME on disconnect
//!   - gateway send rate limiting (120 events / 60s)
//!
//! Callers get a [`GatewayHandle`]: a stream of [`InboundEvent`]s, a one-shot
//! readiness report, and the heartbeat stats the driver keeps current.
//! Nothing outside this file touches `tokio_tungstenite`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, trace, warn};

use crate::error::TransportError;
use crate::events::{GatewayEvent, InboundEvent};
use crate::transport::{SessionStats, ShardInfo};
use crate::types::{GatewayPayload, Intents};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const DEFAULT_GATEWAY_URL: &str = "wss://gateway.discord.gg/?v=10&encoding=json";

/// Discord allows at most 120 gateway sends per 60 seconds.
const SEND_BUDGET_MAX: u32 = 120;
const SEND_BUDGET_WINDOW: Duration = Duration::from_secs(60);

/// Maximum number of reconnect attempts before giving up.
const MAX_RECONNECT_ATTEMPTS: u32 = 8;

const EVENT_BUFFER: usize = 256;

// ---------------------------------------------------------------------------
// Gateway send rate limiter
// ---------------------------------------------------------------------------

/// Sliding-window rate limiter for outbound gateway messages.
struct SendRateLimiter {
    /// Send instants still inside the window.
    timestamps: Vec<Instant>,
    budget: u32,
    window: Duration,
}

impl SendRateLimiter {
    fn new(budget: u32, window: Duration) -> Self {
        Self {
            timestamps: Vec::with_capacity(budget as usize),
            budget,
            window,
        }
    }

    /// How long the caller should wait before sending, or `None` if it can
    /// send now. Does **not** record the send.
    fn delay(&self) -> Option<Duration> {
        self.delay_at(Instant::now())
    }

    fn delay_at(&self, now: Instant) -> Option<Duration> {
        let mut in_window = self
            .timestamps
            .iter()
            .filter(|&&t| now.duration_since(t) < self.window);

        if (in_window.clone().count() as u32) < self.budget {
            return None;
        }

        // At capacity: wait for the oldest send to leave the window.
        let oldest = in_window.next()?;
        let expires_at = *oldest + self.window;
        (expires_at > now).then(|| expires_at - now)
    }

    /// Record a send at `now` and prune old entries.
    fn record_at(&mut self, now: Instant) {
        self.timestamps
            .retain(|&t| now.duration_since(t) < self.window);
        self.timestamps.push(now);
    }

    fn record(&mut self) {
        self.record_at(Instant::now());
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Options for connecting one shard to the Discord gateway.
#[derive(Clone)]
pub struct GatewayConfig {
    pub token: String,
    pub intents: Intents,
    pub shard: ShardInfo,
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("token", &"<redacted>")
            .field("intents", &self.intents)
            .field("shard", &self.shard)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Internal session state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
struct SessionState {
    /// From the READY event.
    session_id: Option<String>,
    /// Resume URL provided by Discord in the READY event.
    resume_gateway_url: Option<String>,
    /// Last sequence number seen.
    sequence: Option<u64>,
}

impl SessionState {
    fn resume_target(&self) -> Option<(&str, u64)> {
        Some((self.session_id.as_deref()?, self.sequence?))
    }
}

// ---------------------------------------------------------------------------
// WebSocket halves
// ---------------------------------------------------------------------------

type WsSink = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    WsMessage,
>;

type WsStream = futures_util::stream::SplitStream<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
>;

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// A running gateway driver.
pub struct GatewayHandle {
    /// Dispatch events, in the order the gateway delivered them.
    pub events: mpsc::Receiver<InboundEvent>,
    /// Resolves with `Ok` on the first READY, or with the error that kept the
    /// session from ever getting there.
    pub ready: oneshot::Receiver<Result<(), TransportError>>,
    /// Heartbeat bookkeeping, updated by the driver.
    pub stats: Arc<Mutex<SessionStats>>,
    /// Send `true` to close the socket and stop the driver.
    pub shutdown: watch::Sender<bool>,
    /// The driver task; finishes after shutdown or an unrecoverable error.
    pub driver: JoinHandle<()>,
}

/// Spawn the driver for `config.shard` and return its handle.
///
/// The driver keeps reconnecting (resuming when it can) until it is shut
/// down, hits a fatal close code, or runs out of reconnect attempts.
pub fn connect(config: GatewayConfig) -> GatewayHandle {
    let (event_tx, events) = mpsc::channel(EVENT_BUFFER);
    let (ready_tx, ready) = oneshot::channel();
    let (shutdown, shutdown_rx) = watch::channel(false);
    let stats = Arc::new(Mutex::new(SessionStats::default()));

    let driver = Driver {
        config,
        session: Arc::new(Mutex::new(SessionState::default())),
        stats: Arc::clone(&stats),
        event_tx,
        ready: Some(ready_tx),
        shutdown: shutdown_rx,
    };
    let driver = tokio::spawn(driver.run());

    GatewayHandle {
        events,
        ready,
        stats,
        shutdown,
        driver,
    }
}

// ---------------------------------------------------------------------------
// The driver (runs in a spawned task)
// ---------------------------------------------------------------------------

struct Driver {
    config: GatewayConfig,
    session: Arc<Mutex<SessionState>>,
    stats: Arc<Mutex<SessionStats>>,
    event_tx: mpsc::Sender<InboundEvent>,
    ready: Option<oneshot::Sender<Result<(), TransportError>>>,
    shutdown: watch::Receiver<bool>,
}

#[derive(Debug)]
enum DisconnectReason {
    ShouldResume,
    ShouldReidentify,
    Fatal(TransportError),
    EventChannelClosed,
    Shutdown,
}

impl Driver {
    async fn run(mut self) {
        let shard = self.config.shard;
        let mut reconnect_attempts: u32 = 0;

        loop {
            if *self.shutdown.borrow() {
                return;
            }

            let url = {
                let s = self.session.lock().await;
                gateway_url(s.resume_gateway_url.as_deref())
            };
            info!(%shard, url = %url, "connecting to Discord gateway");

            let ws_stream = match tokio_tungstenite::connect_async(url.as_str()).await {
                Ok((stream, _)) => stream,
                Err(e) => {
                    error!(%shard, error = %e, "failed to connect to gateway");
                    if !self.back_off(&mut reconnect_attempts).await {
                        return;
                    }
                    continue;
                }
            };
            debug!(%shard, "WebSocket connected");

            let (ws_write, mut ws_read) = ws_stream.split();
            let ws_write = Arc::new(Mutex::new(ws_write));
            let rate_limiter = Arc::new(Mutex::new(SendRateLimiter::new(
                SEND_BUDGET_MAX,
                SEND_BUDGET_WINDOW,
            )));

            // 1. HELLO
            let heartbeat_interval = match read_hello_from_stream(&mut ws_read).await {
                Ok(interval) => interval,
                Err(e) => {
                    error!(%shard, error = %e, "failed to read HELLO from gateway");
                    if !self.back_off(&mut reconnect_attempts).await {
                        return;
                    }
                    continue;
                }
            };
            debug!(%shard, interval_ms = heartbeat_interval, "received HELLO");

            // 2. IDENTIFY or RESUME
            let resume = {
                let s = self.session.lock().await;
                let payload = s
                    .resume_target()
                    .map(|(session_id, seq)| resume_payload(&self.config.token, session_id, seq));
                payload
            };
            let resuming = resume.is_some();
            let handshake = resume.unwrap_or_else(|| identify_payload(&self.config));
            if let Err(e) = rate_limited_send(&ws_write, &rate_limiter, &handshake).await {
                error!(%shard, error = %e, resuming, "failed to send handshake");
                if !self.back_off(&mut reconnect_attempts).await {
                    return;
                }
                continue;
            }
            info!(%shard, resuming, "sent {}", if resuming { "RESUME" } else { "IDENTIFY" });
            reconnect_attempts = 0;

            // 3. Heartbeat
            let (hb_cancel_tx, hb_cancel_rx) = mpsc::channel::<()>(1);
            let heartbeat_handle = tokio::spawn(heartbeat(
                heartbeat_interval,
                Arc::clone(&ws_write),
                Arc::clone(&rate_limiter),
                Arc::clone(&self.session),
                Arc::clone(&self.stats),
                hb_cancel_rx,
            ));

            // 4. Read loop
            let disconnect_reason = self.read_loop(&mut ws_read, &ws_write, &rate_limiter).await;

            // 5. Cleanup, then decide whether to reconnect
            let _ = hb_cancel_tx.send(()).await;
            heartbeat_handle.abort();

            let close_frame = match disconnect_reason {
                DisconnectReason::Shutdown => Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: "".into(),
                }),
                _ => None,
            };
            {
                let mut w = ws_write.lock().await;
                let _ = w.send(WsMessage::Close(close_frame)).await;
            }

            match disconnect_reason {
                DisconnectReason::ShouldResume => {
                    info!(%shard, "will attempt RESUME");
                }
                DisconnectReason::ShouldReidentify => {
                    info!(%shard, "session invalidated, will re-IDENTIFY");
                    let mut s = self.session.lock().await;
                    s.session_id = None;
                    s.sequence = None;
                }
                DisconnectReason::Fatal(e) => {
                    error!(%shard, error = %e, "fatal gateway error, shutting down");
                    self.report_ready(Err(e));
                    return;
                }
                DisconnectReason::EventChannelClosed => {
                    info!(%shard, "event channel closed, shutting down gateway driver");
                    return;
                }
                DisconnectReason::Shutdown => {
                    info!(%shard, "gateway closed");
                    return;
                }
            }

            if !self.back_off(&mut reconnect_attempts).await {
                return;
            }
        }
    }

    /// Sleep before the next attempt. Returns `false` when the driver should
    /// stop instead (attempts exhausted, or shutdown requested meanwhile).
    async fn back_off(&mut self, attempts: &mut u32) -> bool {
        let shard = self.config.shard;
        *attempts += 1;
        if *attempts > MAX_RECONNECT_ATTEMPTS {
            error!(%shard, "exceeded max reconnect attempts, giving up");
            self.report_ready(Err(TransportError::Gateway(format!(
                "gave up after {} reconnect attempts",
                MAX_RECONNECT_ATTEMPTS
            ))));
            return false;
        }

        let backoff = backoff_delay(*attempts);
        warn!(
            %shard,
            delay_ms = backoff.as_millis() as u64,
            attempt = *attempts,
            "backing off before reconnect"
        );
        tokio::select! {
            _ = tokio::time::sleep(backoff) => true,
            _ = self.shutdown.changed() => false,
        }
    }

    /// Resolve the readiness report, if nobody has yet.
    fn report_ready(&mut self, result: Result<(), TransportError>) {
        if let Some(ready) = self.ready.take() {
            let _ = ready.send(result);
        }
    }

    async fn read_loop(
        &mut self,
        ws_read: &mut WsStream,
        ws_write: &Arc<Mutex<WsSink>>,
        rate_limiter: &Arc<Mutex<SendRateLimiter>>,
    ) -> DisconnectReason {
        let shard = self.config.shard;
        loop {
            let msg = tokio::select! {
                biased;

                _ = self.shutdown.changed() => return DisconnectReason::Shutdown,

                msg = ws_read.next() => msg,
            };

            let msg = match msg {
                Some(Ok(m)) => m,
                Some(Err(e)) => {
                    warn!(%shard, error = %e, "WebSocket read error");
                    return DisconnectReason::ShouldResume;
                }
                None => {
                    info!(%shard, "WebSocket stream ended");
                    return DisconnectReason::ShouldResume;
                }
            };

            let text = match msg {
                WsMessage::Text(text) => text,
                WsMessage::Close(frame) => {
                    let Some(frame) = frame else {
                        warn!(%shard, "WebSocket closed by server without a code");
                        return DisconnectReason::ShouldResume;
                    };
                    let code = u16::from(frame.code);
                    warn!(%shard, close_code = code, reason = %frame.reason.as_str(), "WebSocket closed by server");
                    return classify_close(code, frame.reason.as_str());
                }
                // Ping/Pong/Binary: tungstenite answers pings itself.
                _ => continue,
            };

            let payload: GatewayPayload = match serde_json::from_str(text.as_str()) {
                Ok(p) => p,
                Err(e) => {
                    warn!(%shard, error = %e, "failed to parse gateway payload");
                    continue;
                }
            };

            if let Some(s) = payload.s {
                self.session.lock().await.sequence = Some(s);
            }

            match GatewayEvent::from_payload(payload) {
                GatewayEvent::Dispatch(event) => {
                    if let InboundEvent::Ready(ready) = &event {
                        let mut sess = self.session.lock().await;
                        sess.session_id = Some(ready.session_id.clone());
                        sess.resume_gateway_url = Some(ready.resume_gateway_url.clone());
                        drop(sess);
                        info!(%shard, session_id = %ready.session_id, "gateway READY");
                        self.report_ready(Ok(()));
                    }

                    if self.event_tx.send(event).await.is_err() {
                        info!(%shard, "event channel closed by consumer");
                        return DisconnectReason::EventChannelClosed;
                    }
                }

                GatewayEvent::HeartbeatRequest => {
                    let seq = self.session.lock().await.sequence;
                    let heartbeat = json!({"op": 1, "d": seq});
                    if let Err(e) = rate_limited_send(ws_write, rate_limiter, &heartbeat).await {
                        warn!(%shard, error = %e, "failed to send requested heartbeat");
                    } else {
                        record_heartbeat_sent(&self.stats);
                        debug!(%shard, "sent requested heartbeat");
                    }
                }

                GatewayEvent::HeartbeatAck => {
                    trace!(%shard, "heartbeat acknowledged");
                    record_heartbeat_ack(&self.stats);
                }

                GatewayEvent::Reconnect => {
                    info!(%shard, "gateway requested reconnect (op 7)");
                    return DisconnectReason::ShouldResume;
                }

                GatewayEvent::InvalidSession(resumable) => {
                    warn!(%shard, resumable, "session invalidated (op 9)");
                    // Discord asks for a 1-5 s pause before the next handshake.
                    let pause = Duration::from_secs(if resumable { 2 } else { 3 });
                    tokio::time::sleep(pause).await;
                    return if resumable {
                        DisconnectReason::ShouldResume
                    } else {
                        DisconnectReason::ShouldReidentify
                    };
                }

                GatewayEvent::Unknown { event_name, op } => {
                    trace!(%shard, op, event = ?event_name, "ignoring gateway frame");
                }
            }
        }
    }
}

async fn heartbeat(
    heartbeat_interval: u64,
    ws_write: Arc<Mutex<WsSink>>,
    rate_limiter: Arc<Mutex<SendRateLimiter>>,
    session: Arc<Mutex<SessionState>>,
    stats: Arc<Mutex<SessionStats>>,
    mut cancel: mpsc::Receiver<()>,
) {
    // First beat goes out after `heartbeat_interval * jitter`, jitter in [0, 1).
    let jitter = rand::random::<f64>();
    let first_delay = Duration::from_millis((heartbeat_interval as f64 * jitter) as u64);
    tokio::select! {
        _ = tokio::time::sleep(first_delay) => {}
        _ = cancel.recv() => { return; }
    }

    let mut interval = tokio::time::interval(Duration::from_millis(heartbeat_interval));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let seq = session.lock().await.sequence;
                let beat = json!({"op": 1, "d": seq});

                if let Err(e) = rate_limited_send(&ws_write, &rate_limiter, &beat).await {
                    warn!(error = %e, "heartbeat send failed, stopping heartbeat task");
                    return;
                }
                record_heartbeat_sent(&stats);
                trace!(?seq, "sent heartbeat");
            }
            _ = cancel.recv() => {
                debug!("heartbeat task cancelled");
                return;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

// Stats updates run detached: readers may hold the lock across network
// calls and the read loop must not wait on them.

fn record_heartbeat_sent(stats: &Arc<Mutex<SessionStats>>) {
    let stats = Arc::clone(stats);
    let at = Utc::now();
    tokio::spawn(async move {
        stats.lock().await.last_heartbeat_sent = Some(at);
    });
}

fn record_heartbeat_ack(stats: &Arc<Mutex<SessionStats>>) {
    let stats = Arc::clone(stats);
    let at = Utc::now();
    tokio::spawn(async move {
        stats.lock().await.record_ack(at);
    });
}

/// `resume_url` (from READY) or the default gateway, with the version and
/// encoding query attached.
fn gateway_url(resume_url: Option<&str>) -> String {
    let url = resume_url.unwrap_or(DEFAULT_GATEWAY_URL);
    if url.contains("v=10") {
        url.to_string()
    } else if url.contains('?') {
        format!("{}&v=10&encoding=json", url)
    } else {
        format!("{}/?v=10&encoding=json", url.trim_end_matches('/'))
    }
}

fn identify_payload(config: &GatewayConfig) -> serde_json::Value {
    json!({
        "op": 2,
        "d": {
            "token": config.token,
            "properties": {
                "os": std::env::consts::OS,
                "browser": "safety-jim",
                "device": "safety-jim"
            },
            "intents": config.intents.bits(),
            "shard": [config.shard.index, config.shard.count],
        }
    })
}

fn resume_payload(token: &str, session_id: &str, seq: u64) -> serde_json::Value {
    json!({
        "op": 6,
        "d": {
            "token": token,
            "session_id": session_id,
            "seq": seq,
        }
    })
}

/// Map a server close code to what the driver does next.
fn classify_close(code: u16, reason: &str) -> DisconnectReason {
    let fatal = |what: &str| {
        DisconnectReason::Fatal(TransportError::Fatal {
            code,
            reason: if reason.is_empty() {
                what.to_string()
            } else {
                reason.to_string()
            },
        })
    };

    match code {
        4004 => DisconnectReason::Fatal(TransportError::AuthenticationFailed),
        4010 => fatal("invalid shard"),
        4011 => fatal("sharding required"),
        4012 => fatal("invalid API version"),
        4013 => fatal("invalid intents"),
        4014 => fatal("disallowed intents"),
        // Invalid seq or session timed out.
        4007 | 4009 => DisconnectReason::ShouldReidentify,
        _ => DisconnectReason::ShouldResume,
    }
}

/// Read the HELLO payload and return its heartbeat interval in ms.
async fn read_hello_from_stream(stream: &mut WsStream) -> Result<u64, String> {
    let msg = tokio::time::timeout(Duration::from_secs(30), stream.next())
        .await
        .map_err(|_| "timed out waiting for HELLO".to_string())?
        .ok_or_else(|| "stream ended before HELLO".to_string())?
        .map_err(|e| format!("WS error reading HELLO: {}", e))?;

    let text = match msg {
        WsMessage::Text(t) => t,
        other => return Err(format!("expected text message for HELLO, got {:?}", other)),
    };

    let payload: GatewayPayload =
        serde_json::from_str(text.as_str()).map_err(|e| format!("failed to parse HELLO: {}", e))?;
    hello_interval(&payload)
}

fn hello_interval(payload: &GatewayPayload) -> Result<u64, String> {
    if payload.op != 10 {
        return Err(format!("expected op 10 (HELLO), got op {}", payload.op));
    }

    payload
        .d
        .as_ref()
        .and_then(|d| d.get("heartbeat_interval"))
        .and_then(|v| v.as_u64())
        .ok_or_else(|| "HELLO missing heartbeat_interval".to_string())
}

/// Send a JSON payload on the WebSocket, respecting the send rate limiter.
async fn rate_limited_send(
    ws_write: &Arc<Mutex<WsSink>>,
    rate_limiter: &Arc<Mutex<SendRateLimiter>>,
    payload: &serde_json::Value,
) -> Result<(), String> {
    loop {
        let delay = rate_limiter.lock().await.delay();
        match delay {
            Some(d) => {
                debug!(
                    delay_ms = d.as_millis() as u64,
                    "gateway send rate-limited, waiting"
                );
                tokio::time::sleep(d).await;
            }
            None => break,
        }
    }
    rate_limiter.lock().await.record();

    let text = serde_json::to_string(payload).map_err(|e| e.to_string())?;

    let mut w = ws_write.lock().await;
    w.send(WsMessage::Text(text.into()))
        .await
        .map_err(|e| format!("WS send error: {}", e))
}

/// Exponential backoff with jitter, capped at 60 s.
fn backoff_delay(attempt: u32) -> Duration {
    let base_ms = 1000u64 * 2u64.saturating_pow(attempt.min(6));
    let jitter = (rand::random::<f64>() * 0.5 + 0.75) * base_ms as f64;
    Duration::from_millis(jitter.min(60_000.0) as u64)
}
