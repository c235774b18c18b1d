//! Server configuration — all from environment variables.

use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address for WebSocket + REST.
    pub listen_addr: String,
    /// Server instance name, attached to startup logs.
    pub server_instance: String,
    /// Period of the dispatch tick.
    pub dispatch_interval: Duration,
    /// Per-connection, per-tick chance of a system notification.
    pub notification_probability: f64,
    /// Per-connection, per-tick chance of a balance update.
    pub balance_probability: f64,
    /// Outbound queue depth per connection.
    pub send_queue: usize,
    /// Log level filter.
    pub log_level: String,
    /// Emit JSON log lines instead of the human format.
    pub log_json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".into(),
            server_instance: "local".into(),
            dispatch_interval: Duration::from_secs(5),
            notification_probability: 0.10,
            balance_probability: 0.05,
            send_queue: 256,
            log_level: "pulsed=info,tower_http=info".into(),
            log_json: false,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            listen_addr: env::var("LISTEN_ADDR").unwrap_or(defaults.listen_addr),
            server_instance: env::var("SERVER_INSTANCE").unwrap_or_else(|_| hostname()),
            dispatch_interval: parse_var::<u64>("DISPATCH_INTERVAL_MS")
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.dispatch_interval),
            notification_probability: parse_var("NOTIFICATION_PROBABILITY")
                .map(clamp_probability)
                .unwrap_or(defaults.notification_probability),
            balance_probability: parse_var("BALANCE_PROBABILITY")
                .map(clamp_probability)
                .unwrap_or(defaults.balance_probability),
            send_queue: parse_var::<usize>("SEND_QUEUE")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.send_queue),
            log_level: env::var("RUST_LOG").unwrap_or(defaults.log_level),
            log_json: env::var("LOG_FORMAT")
                .map(|v| v.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
        }
    }
}

fn parse_var<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// NaN maps to 0 (never fire).
pub fn clamp_probability(p: f64) -> f64 {
    if p.is_nan() {
        0.0
    } else {
        p.clamp(0.0, 1.0)
    }
}

fn hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".into())
}
