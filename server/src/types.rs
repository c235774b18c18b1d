//! Wire protocol types for pulse.
//!
//! Client → server: authenticate, request_balance.
//! Server → client: balance_updated, system_notification.
//! Frames are JSON text, tagged by `type`; payload fields are camelCase.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use uuid::Uuid;

// ═══════════════════════════════════════════════════════════════
// Identifiers
// ═══════════════════════════════════════════════════════════════

/// Opaque per-session identifier, assigned at connect time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn_{}", self.0)
    }
}

/// User identity handed to clients by the (external) auth layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════
// Client → Server messages
// ═══════════════════════════════════════════════════════════════

/// Top-level envelope from client.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Authenticate(AuthenticateMsg),
    RequestBalance(RequestBalanceMsg),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticateMsg {
    pub user_id: UserId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestBalanceMsg {
    pub user_id: UserId,
}

// ═══════════════════════════════════════════════════════════════
// Server → Client messages
// ═══════════════════════════════════════════════════════════════

/// Top-level envelope to client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    BalanceUpdated(BalanceEvent),
    SystemNotification(NotificationEvent),
}

impl ServerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BalanceUpdated(_) => "balance_updated",
            Self::SystemNotification(_) => "system_notification",
        }
    }
}

/// A balance change pushed to a client.
///
/// `change` is not a field: it is derived from `balance - previous_balance`
/// whenever the event is serialized.
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceEvent {
    pub user_id: UserId,
    pub balance: f64,
    pub previous_balance: f64,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
}

impl BalanceEvent {
    pub fn new(user_id: UserId, reading: BalanceReading) -> Self {
        Self {
            user_id,
            balance: reading.current,
            previous_balance: reading.previous,
            timestamp: Utc::now(),
            reason: reading.reason,
        }
    }

    pub fn change(&self) -> f64 {
        self.balance - self.previous_balance
    }
}

impl Serialize for BalanceEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Wire<'a> {
            user_id: &'a UserId,
            balance: f64,
            previous_balance: f64,
            change: f64,
            timestamp: &'a DateTime<Utc>,
            reason: &'a str,
        }

        Wire {
            user_id: &self.user_id,
            balance: self.balance,
            previous_balance: self.previous_balance,
            change: self.change(),
            timestamp: &self.timestamp,
            reason: &self.reason,
        }
        .serialize(serializer)
    }
}

/// Output of a balance source: the value before and after, and why it moved.
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceReading {
    pub previous: f64,
    pub current: f64,
    pub reason: String,
}

/// A notification pushed to one user, or to everyone when `broadcast` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEvent {
    pub user_id: Option<UserId>,
    pub title: String,
    pub message: String,
    pub priority: Priority,
    pub broadcast: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

// ═══════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════
