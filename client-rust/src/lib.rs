//! pulse Rust client library.
//!
//! Two lines to integrate:
//! ```ignore
//! let mut pulse = PulseClient::init().await;
//! while let Some(event) = pulse.next_event().await { /* ... */ }
//! ```
//!
//! If `PULSE_SERVER` or `PULSE_USER_ID` is absent, `init()` returns a no-op
//! client where all methods silently succeed and no events arrive.

use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

// ═══════════════════════════════════════════════════════════════
// Public types
// ═══════════════════════════════════════════════════════════════

/// Where to connect and who to authenticate as.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PulseConfig {
    pub server_ep: String,
    pub user_id: String,
}

/// Balance change pushed by the server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceUpdate {
    pub user_id: String,
    pub balance: f64,
    pub previous_balance: f64,
    pub change: f64,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
}

/// Notification pushed by the server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub user_id: Option<String>,
    pub title: String,
    pub message: String,
    pub priority: String,
    pub broadcast: bool,
}

/// Anything the server can push.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PulseEvent {
    BalanceUpdated(BalanceUpdate),
    SystemNotification(Notification),
}

#[derive(Debug)]
pub enum PulseError {
    /// PULSE_SERVER / PULSE_USER_ID missing.
    NoConfig,
    /// Channel closed (background task died).
    ChannelClosed,
    /// Serialization error.
    Serialize(String),
}

impl std::fmt::Display for PulseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoConfig => write!(f, "PULSE_SERVER or PULSE_USER_ID not set"),
            Self::ChannelClosed => write!(f, "background task stopped"),
            Self::Serialize(e) => write!(f, "serialize error: {e}"),
        }
    }
}

impl std::error::Error for PulseError {}

// ═══════════════════════════════════════════════════════════════
// Client
// ═══════════════════════════════════════════════════════════════

/// pulse client. Receives balance updates and notifications for one user.
///
/// Internally spawns a background tokio task that owns the WebSocket,
/// authenticates on every (re)connect, and reconnects with exponential
/// backoff + jitter. Events pushed while disconnected are lost.
pub struct PulseClient {
    inner: Option<ClientInner>,
}

struct ClientInner {
    config: PulseConfig,
    tx: mpsc::Sender<Outbound>,
    events: mpsc::Receiver<PulseEvent>,
    connected: Arc<AtomicBool>,
}

/// Requests sent from API methods to the background task.
enum Outbound {
    RequestBalance,
    Shutdown,
}

impl PulseClient {
    /// Read PULSE_SERVER / PULSE_USER_ID from the environment and connect.
    /// Returns a no-op client if either is absent.
    pub async fn init() -> Self {
        match Self::config_from_env() {
            Ok(config) => Self::init_with(config).await,
            Err(e) => {
                debug!("{e}, using no-op client");
                Self { inner: None }
            }
        }
    }

    /// Initialize with explicit config.
    pub async fn init_with(config: PulseConfig) -> Self {
        let connected = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel::<Outbound>(64);
        let (events_tx, events) = mpsc::channel::<PulseEvent>(256);

        let bg_config = config.clone();
        let bg_connected = Arc::clone(&connected);
        tokio::spawn(async move {
            ws_task(bg_config, rx, events_tx, bg_connected).await;
        });

        Self {
            inner: Some(ClientInner {
                config,
                tx,
                events,
                connected,
            }),
        }
    }

    /// Whether this is a real client (not no-op).
    pub fn is_active(&self) -> bool {
        self.inner.is_some()
    }

    /// Whether the WebSocket is currently connected and authenticated.
    pub fn is_connected(&self) -> bool {
        self.inner
            .as_ref()
            .map(|i| i.connected.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    pub fn user_id(&self) -> Option<&str> {
        self.inner.as_ref().map(|i| i.config.user_id.as_str())
    }

    /// Ask for a `balance_updated` for our own user. Dropped silently while
    /// disconnected; nothing is held back for the next connection.
    pub async fn request_balance(&self) -> Result<(), PulseError> {
        let inner = match &self.inner {
            Some(i) => i,
            None => return Ok(()), // no-op client
        };
        // Not queued while disconnected: it would otherwise be replayed after reconnect.
        if !inner.connected.load(Ordering::Relaxed) {
            debug!("balance request dropped (disconnected)");
            return Ok(());
        }
        if inner.tx.try_send(Outbound::RequestBalance).is_err() {
            debug!("balance request dropped (channel full)");
        }
        Ok(())
    }

    /// Next pushed event. `None` for a no-op client or after shutdown.
    pub async fn next_event(&mut self) -> Option<PulseEvent> {
        match &mut self.inner {
            Some(inner) => inner.events.recv().await,
            None => None,
        }
    }

    /// Close the connection and stop the background task.
    pub async fn shutdown(self) -> Result<(), PulseError> {
        if let Some(inner) = &self.inner {
            inner
                .tx
                .send(Outbound::Shutdown)
                .await
                .map_err(|_| PulseError::ChannelClosed)?;
        }
        Ok(())
    }

    // ── Internal ────────────────────────────────────────────

    fn config_from_env() -> Result<PulseConfig, PulseError> {
        let server_ep = env::var("PULSE_SERVER").map_err(|_| PulseError::NoConfig)?;
        let user_id = env::var("PULSE_USER_ID").map_err(|_| PulseError::NoConfig)?;
        Ok(PulseConfig { server_ep, user_id })
    }
}

// ═══════════════════════════════════════════════════════════════
// Background WebSocket task
// ═══════════════════════════════════════════════════════════════

/// Wire protocol: client → server messages.
#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireRequest<'a> {
    Authenticate {
        #[serde(rename = "userId")]
        user_id: &'a str,
    },
    RequestBalance {
        #[serde(rename = "userId")]
        user_id: &'a str,
    },
}

fn encode(req: &WireRequest<'_>) -> Result<Message, PulseError> {
    serde_json::to_string(req)
        .map(|json| Message::Text(json.into()))
        .map_err(|e| PulseError::Serialize(e.to_string()))
}

/// Convert server_ep URL to a ws:// URL suitable for tungstenite.
/// Handles: ws://, wss://, http://, https://
fn normalize_ws_url(ep: &str) -> String {
    let url = ep
        .replace("https://", "wss://")
        .replace("http://", "ws://");
    // Only the path decides; a host like `wsgw` must not count as `/ws`.
    let after_scheme = url.find("://").map(|i| i + 3).unwrap_or(0);
    let path = url[after_scheme..]
        .find('/')
        .map(|i| &url[after_scheme + i..])
        .unwrap_or("");
    if path.trim_end_matches('/').is_empty() {
        format!("{}/ws", url.trim_end_matches('/'))
    } else {
        url
    }
}

/// Background task: owns the WebSocket, handles send/recv, reconnects.
async fn ws_task(
    config: PulseConfig,
    mut rx: mpsc::Receiver<Outbound>,
    events: mpsc::Sender<PulseEvent>,
    connected: Arc<AtomicBool>,
) {
    let ws_url = normalize_ws_url(&config.server_ep);
    let mut attempt: u32 = 0;

    let auth = match encode(&WireRequest::Authenticate {
        user_id: &config.user_id,
    }) {
        Ok(msg) => msg,
        Err(e) => {
            warn!("cannot encode authenticate: {e}");
            return;
        }
    };

    loop {
        // ── Connect ─────────────────────────────────────────
        let ws_stream = match tokio_tungstenite::connect_async(&ws_url).await {
            Ok((stream, _)) => {
                info!(url = %ws_url, "WebSocket connected");
                attempt = 0;
                stream
            }
            Err(e) => {
                warn!(url = %ws_url, attempt, "WebSocket connect failed: {e}");
                connected.store(false, Ordering::Relaxed);
                backoff_sleep(attempt).await;
                attempt = attempt.saturating_add(1);
                continue;
            }
        };

        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        // ── Authenticate ────────────────────────────────────
        // The server sends no ack; a rejected identity just yields no events.
        if let Err(e) = ws_tx.send(auth.clone()).await {
            warn!("failed to send authenticate: {e}");
            connected.store(false, Ordering::Relaxed);
            backoff_sleep(attempt).await;
            attempt = attempt.saturating_add(1);
            continue;
        }
        // Requests queued while the previous connection was dying are stale.
        loop {
            match rx.try_recv() {
                Ok(Outbound::RequestBalance) => continue,
                Ok(Outbound::Shutdown) | Err(mpsc::error::TryRecvError::Disconnected) => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    return;
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
            }
        }
        connected.store(true, Ordering::Relaxed);

        // ── Message loop ────────────────────────────────────
        loop {
            tokio::select! {
                // Outbound requests from API methods.
                msg = rx.recv() => {
                    match msg {
                        Some(Outbound::RequestBalance) => {
                            let req = WireRequest::RequestBalance { user_id: &config.user_id };
                            let frame = match encode(&req) {
                                Ok(frame) => frame,
                                Err(e) => {
                                    warn!("{e}");
                                    continue;
                                }
                            };
                            if let Err(e) = ws_tx.send(frame).await {
                                warn!("send error: {e}");
                                break; // reconnect
                            }
                        }
                        Some(Outbound::Shutdown) | None => {
                            // Shutdown requested, or client dropped.
                            let _ = ws_tx.send(Message::Close(None)).await;
                            connected.store(false, Ordering::Relaxed);
                            return;
                        }
                    }
                }
                // Pushed events from the server.
                frame = ws_rx.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<PulseEvent>(&text) {
                                Ok(event) => {
                                    if events.send(event).await.is_err() {
                                        // Nobody listening any more.
                                        connected.store(false, Ordering::Relaxed);
                                        return;
                                    }
                                }
                                Err(e) => debug!("unrecognized server frame: {e}"),
                            }
                        }
                        Some(Ok(Message::Close(_))) => {
                            info!("server closed connection");
                            break; // reconnect
                        }
                        Some(Ok(_)) => {} // ping/pong/binary
                        Some(Err(e)) => {
                            warn!("ws recv error: {e}");
                            break; // reconnect
                        }
                        None => {
                            info!("ws stream ended");
                            break; // reconnect
                        }
                    }
                }
            }
        }

        // Connection lost — loop back to reconnect.
        connected.store(false, Ordering::Relaxed);
        backoff_sleep(attempt).await;
        attempt = attempt.saturating_add(1);
    }
}

/// Exponential backoff with jitter.
/// delay = min(100ms × 2^attempt, 30s) + random(0, delay × 0.5)
fn backoff_delay(attempt: u32) -> Duration {
    let base_ms = 100u64.saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
    let capped_ms = base_ms.min(30_000);
    let jitter_ms = (rand::random::<f64>() * capped_ms as f64 * 0.5) as u64;
    Duration::from_millis(capped_ms + jitter_ms)
}

async fn backoff_sleep(attempt: u32) {
    let total = backoff_delay(attempt);
    debug!(ms = total.as_millis() as u64, attempt, "backoff sleep");
    tokio::time::sleep(total).await;
}

// ═══════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════
