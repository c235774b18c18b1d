//! Live connection registry.
//!
//! Maps connection ids to their outbound queue and (once authenticated) the
//! user they speak for. Every lookup against a missing id is a no-op: a
//! connection that has gone away simply stops receiving.

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::types::{ConnectionId, ServerMessage, UserId};

/// Outbound half of a connection's FIFO queue, drained by its writer task.
pub type Outbox = mpsc::Sender<ServerMessage>;

/// Per-connection state. `Closed` is represented by absence from the map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Authenticated(UserId),
}

/// A live transport session.
#[derive(Debug)]
pub struct Connection {
    pub state: ConnectionState,
    outbox: Outbox,
}

impl Connection {
    pub fn user_id(&self) -> Option<&UserId> {
        match &self.state {
            ConnectionState::Authenticated(user_id) => Some(user_id),
            ConnectionState::Connected => None,
        }
    }
}

/// Registry of all live connections.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Connection>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fresh `Connected` entry and return its id.
    pub fn connect(&self, outbox: Outbox) -> ConnectionId {
        let id = ConnectionId::new();
        self.connections.insert(
            id,
            Connection {
                state: ConnectionState::Connected,
                outbox,
            },
        );
        debug!(connection_id = %id, live = self.connections.len(), "connection registered");
        id
    }

    /// Bind a user to a connection. Last write wins; unknown ids are ignored.
    pub fn authenticate(&self, id: ConnectionId, user_id: UserId) {
        match self.connections.get_mut(&id) {
            Some(mut conn) => {
                if let ConnectionState::Authenticated(previous) = &conn.state {
                    if previous != &user_id {
                        info!(connection_id = %id, from = %previous, to = %user_id, "re-authenticated");
                    }
                }
                info!(connection_id = %id, user_id = %user_id, "authenticated");
                conn.state = ConnectionState::Authenticated(user_id);
            }
            None => {
                debug!(connection_id = %id, "authenticate for unknown connection ignored");
            }
        }
    }

    /// The user bound to `id`, if the connection is live and authenticated.
    pub fn user_of(&self, id: ConnectionId) -> Option<UserId> {
        self.connections.get(&id).and_then(|c| c.user_id().cloned())
    }

    /// Remove a connection. Returns whether it was present.
    ///
    /// Dropping the entry drops its outbox, which ends the writer task.
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        let removed = self.connections.remove(&id).is_some();
        if removed {
            debug!(connection_id = %id, live = self.connections.len(), "connection removed");
        }
        removed
    }

    /// Queue a message for one connection. Returns false if it was not delivered.
    pub fn send_to(&self, id: ConnectionId, message: ServerMessage) -> bool {
        // Clone the outbox so the shard lock is released before sending.
        let outbox = match self.connections.get(&id) {
            Some(conn) => conn.outbox.clone(),
            None => return false,
        };
        enqueue(id, &outbox, message)
    }

    /// Queue a message for every connection bound to `user_id`.
    pub fn send_to_user(&self, user_id: &UserId, message: &ServerMessage) -> usize {
        let targets: Vec<(ConnectionId, Outbox)> = self
            .connections
            .iter()
            .filter(|entry| entry.value().user_id() == Some(user_id))
            .map(|entry| (*entry.key(), entry.value().outbox.clone()))
            .collect();

        targets
            .into_iter()
            .filter(|(id, outbox)| enqueue(*id, outbox, message.clone()))
            .count()
    }

    /// Queue a message for every live connection.
    pub fn broadcast(&self, message: &ServerMessage) -> usize {
        let targets: Vec<(ConnectionId, Outbox)> = self
            .connections
            .iter()
            .map(|entry| (*entry.key(), entry.value().outbox.clone()))
            .collect();

        targets
            .into_iter()
            .filter(|(id, outbox)| enqueue(*id, outbox, message.clone()))
            .count()
    }

    /// Point-in-time view of the registry, taken fresh on every call.
    pub fn snapshot(&self) -> Vec<(ConnectionId, ConnectionState)> {
        self.connections
            .iter()
            .map(|entry| (*entry.key(), entry.value().state.clone()))
            .collect()
    }

    /// Number of live connections, authenticated or not.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn authenticated_count(&self) -> usize {
        self.connections
            .iter()
            .filter(|entry| entry.value().user_id().is_some())
            .count()
    }

    /// Drop every connection. Returns how many were closed.
    pub fn close_all(&self) -> usize {
        let ids: Vec<ConnectionId> = self.connections.iter().map(|e| *e.key()).collect();
        ids.into_iter().filter(|id| self.disconnect(*id)).count()
    }
}

fn enqueue(id: ConnectionId, outbox: &Outbox, message: ServerMessage) -> bool {
    match outbox.try_send(message) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(msg)) => {
            warn!(connection_id = %id, kind = msg.kind(), "send queue full, dropping event");
            false
        }
        // Writer already gone; the reader will deregister shortly.
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

// ═══════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::types::{NotificationEvent, Priority};

    fn note(user: &str) -> ServerMessage {
        ServerMessage::SystemNotification(NotificationEvent {
            user_id: Some(UserId::from(user)),
            title: "t".into(),
            message: "m".into(),
            priority: Priority::Low,
            broadcast: false,
        })
    }

    fn connect(registry: &ConnectionRegistry) -> (ConnectionId, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(16);
        (registry.connect(tx), rx)
    }

    #[test]
    fn test_connect_ids_unique() {
        let registry = ConnectionRegistry::new();
        let mut receivers = Vec::new();
        let mut ids = HashSet::new();
        for _ in 0..100 {
            let (id, rx) = connect(&registry);
            receivers.push(rx);
            assert!(ids.insert(id));
        }
        assert_eq!(registry.len(), 100);
    }

    #[test]
    fn test_disconnect_idempotent() {
        let registry = ConnectionRegistry::new();
        let (id, _rx) = connect(&registry);
        let (_other, _rx2) = connect(&registry);

        assert!(registry.disconnect(id));
        let after_once = registry.len();
        assert!(!registry.disconnect(id));
        assert_eq!(registry.len(), after_once);
        assert!(registry.snapshot().iter().all(|(live, _)| *live != id));
    }

    #[test]
    fn test_authenticate_unknown_is_noop() {
        let registry = ConnectionRegistry::new();
        let (id, _rx) = connect(&registry);
        registry.disconnect(id);

        registry.authenticate(id, UserId::from("u1"));
        assert!(registry.is_empty());
        assert_eq!(registry.user_of(id), None);
    }

    #[test]
    fn test_authenticate_last_write_wins() {
        let registry = ConnectionRegistry::new();
        let (id, _rx) = connect(&registry);
        assert_eq!(registry.snapshot(), vec![(id, ConnectionState::Connected)]);

        registry.authenticate(id, UserId::from("u1"));
        registry.authenticate(id, UserId::from("u2"));
        assert_eq!(registry.user_of(id), Some(UserId::from("u2")));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_send_to_dead_connection_is_noop() {
        let registry = ConnectionRegistry::new();
        let (id, mut rx) = connect(&registry);
        registry.disconnect(id);

        assert!(!registry.send_to(id, note("u1")));
        // Outbox dropped with the entry, so the writer side observes closure.
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_send_to_user_reaches_every_device() {
        let registry = ConnectionRegistry::new();
        let (phone, mut phone_rx) = connect(&registry);
        let (laptop, mut laptop_rx) = connect(&registry);
        let (other, mut other_rx) = connect(&registry);
        registry.authenticate(phone, UserId::from("u1"));
        registry.authenticate(laptop, UserId::from("u1"));
        registry.authenticate(other, UserId::from("u2"));

        assert_eq!(registry.send_to_user(&UserId::from("u1"), &note("u1")), 2);
        assert!(phone_rx.try_recv().is_ok());
        assert!(laptop_rx.try_recv().is_ok());
        assert!(other_rx.try_recv().is_err());
    }

    #[test]
    fn test_broadcast_includes_unauthenticated() {
        let registry = ConnectionRegistry::new();
        let (a, mut a_rx) = connect(&registry);
        let (_b, mut b_rx) = connect(&registry);
        registry.authenticate(a, UserId::from("u1"));

        assert_eq!(registry.broadcast(&note("u1")), 2);
        assert!(a_rx.try_recv().is_ok());
        assert!(b_rx.try_recv().is_ok());
    }

    #[test]
    fn test_full_queue_drops() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = mpsc::channel(1);
        let id = registry.connect(tx);

        assert!(registry.send_to(id, note("u1")));
        assert!(!registry.send_to(id, note("u1")));
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_counts_and_close_all() {
        let registry = ConnectionRegistry::new();
        let (a, _a_rx) = connect(&registry);
        let (_b, _b_rx) = connect(&registry);
        let (_c, _c_rx) = connect(&registry);
        registry.authenticate(a, UserId::from("u1"));

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.authenticated_count(), 1);
        assert_eq!(registry.snapshot().len(), 3);

        assert_eq!(registry.close_all(), 3);
        assert!(registry.is_empty());
    }
}
