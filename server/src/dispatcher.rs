//! Event dispatch — pull responses, targeted/broadcast pushes, and the
//! per-tick probabilistic fan-out.

use std::sync::Arc;

use rand::Rng;
use tracing::{debug, info};

use crate::config::clamp_probability;
use crate::registry::{ConnectionRegistry, ConnectionState};
use crate::sources::{BalanceSource, NotificationSource, REASON_REQUESTED};
use crate::types::{BalanceEvent, BalanceReading, ConnectionId, NotificationEvent, ServerMessage, UserId};

/// Per-connection, per-tick firing probabilities.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DispatchPolicy {
    pub notification_probability: f64,
    pub balance_probability: f64,
}

impl DispatchPolicy {
    pub fn new(notification_probability: f64, balance_probability: f64) -> Self {
        Self {
            notification_probability: clamp_probability(notification_probability),
            balance_probability: clamp_probability(balance_probability),
        }
    }
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self::new(0.10, 0.05)
    }
}

/// What one tick delivered.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub connections: usize,
    pub notifications: usize,
    pub balance_updates: usize,
}

pub struct Dispatcher {
    registry: Arc<ConnectionRegistry>,
    balances: Arc<dyn BalanceSource>,
    notifications: Arc<dyn NotificationSource>,
    policy: DispatchPolicy,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        balances: Arc<dyn BalanceSource>,
        notifications: Arc<dyn NotificationSource>,
        policy: DispatchPolicy,
    ) -> Self {
        Self {
            registry,
            balances,
            notifications,
            policy,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Unicast the caller's balance, but only to a connection authenticated
    /// as exactly `user_id`. Returns whether an event was queued.
    pub fn request_balance(&self, id: ConnectionId, user_id: &UserId) -> bool {
        match self.registry.user_of(id) {
            Some(bound) if &bound == user_id => {}
            Some(bound) => {
                info!(connection_id = %id, bound = %bound, requested = %user_id, "balance request for another user dropped");
                return false;
            }
            None => {
                debug!(connection_id = %id, "balance request from unauthenticated or closed connection dropped");
                return false;
            }
        }

        let balance = self.balances.balance(user_id);
        let event = BalanceEvent::new(
            user_id.clone(),
            BalanceReading {
                previous: balance,
                current: balance,
                reason: REASON_REQUESTED.to_string(),
            },
        );
        self.registry.send_to(id, ServerMessage::BalanceUpdated(event))
    }

    /// Deliver a notification: to everyone if `broadcast`, otherwise to every
    /// connection of its user. Returns the number of deliveries.
    pub fn notify(&self, event: NotificationEvent) -> usize {
        if event.broadcast {
            let delivered = self.registry.broadcast(&ServerMessage::SystemNotification(event));
            info!(delivered, "broadcast notification");
            return delivered;
        }

        match event.user_id.clone() {
            Some(user_id) => {
                let delivered = self
                    .registry
                    .send_to_user(&user_id, &ServerMessage::SystemNotification(event));
                debug!(user_id = %user_id, delivered, "targeted notification");
                delivered
            }
            None => {
                debug!("targeted notification without user dropped");
                0
            }
        }
    }

    /// One dispatch tick over a fresh registry snapshot.
    ///
    /// Every live connection gets an independent notification draw and an
    /// independent balance draw, both unicast. Connections that have not
    /// authenticated only take the notification draw (with no `userId`):
    /// there is no user to read a balance for.
    pub fn tick(&self) -> TickReport {
        let snapshot = self.registry.snapshot();
        let mut report = TickReport {
            connections: snapshot.len(),
            ..TickReport::default()
        };
        let mut rng = rand::thread_rng();

        for (id, state) in snapshot {
            let user_id = match state {
                ConnectionState::Authenticated(user_id) => Some(user_id),
                ConnectionState::Connected => None,
            };

            if rng.gen_bool(self.policy.notification_probability) {
                let event = self.notifications.next(user_id.as_ref());
                if self.registry.send_to(id, ServerMessage::SystemNotification(event)) {
                    report.notifications += 1;
                }
            }

            let Some(user_id) = user_id else { continue };
            if rng.gen_bool(self.policy.balance_probability) {
                let event = BalanceEvent::new(user_id.clone(), self.balances.advance(&user_id));
                if self.registry.send_to(id, ServerMessage::BalanceUpdated(event)) {
                    report.balance_updates += 1;
                }
            }
        }

        report
    }
}

// ═══════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::sources::{SimulatedBalances, SimulatedNotifications};
    use crate::types::Priority;

    struct Harness {
        dispatcher: Dispatcher,
        balances: Arc<SimulatedBalances>,
    }

    fn harness(policy: DispatchPolicy) -> Harness {
        let balances = Arc::new(SimulatedBalances::new());
        let dispatcher = Dispatcher::new(
            Arc::new(ConnectionRegistry::new()),
            balances.clone(),
            Arc::new(SimulatedNotifications),
            policy,
        );
        Harness {
            dispatcher,
            balances,
        }
    }

    fn join(
        dispatcher: &Dispatcher,
        user: Option<&str>,
    ) -> (ConnectionId, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(64);
        let id = dispatcher.registry().connect(tx);
        if let Some(user) = user {
            dispatcher.registry().authenticate(id, UserId::from(user));
        }
        (id, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn test_request_balance_matching_user() {
        let h = harness(DispatchPolicy::default());
        h.balances.set(UserId::from("u1"), 1234.56);
        let (id, mut rx) = join(&h.dispatcher, Some("u1"));

        assert!(h.dispatcher.request_balance(id, &UserId::from("u1")));
        let msgs = drain(&mut rx);
        assert_eq!(msgs.len(), 1);
        match &msgs[0] {
            ServerMessage::BalanceUpdated(event) => {
                assert_eq!(event.user_id, UserId::from("u1"));
                assert_eq!(event.balance, 1234.56);
                assert_eq!(event.change(), event.balance - event.previous_balance);
                assert_eq!(event.reason, REASON_REQUESTED);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_request_balance_other_user_dropped() {
        let h = harness(DispatchPolicy::default());
        let (id, mut rx) = join(&h.dispatcher, Some("u1"));

        assert!(!h.dispatcher.request_balance(id, &UserId::from("u2")));
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_request_balance_unauthenticated_dropped() {
        let h = harness(DispatchPolicy::default());
        let (id, mut rx) = join(&h.dispatcher, None);

        assert!(!h.dispatcher.request_balance(id, &UserId::from("u1")));
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_request_balance_is_unicast() {
        let h = harness(DispatchPolicy::default());
        let (a, mut a_rx) = join(&h.dispatcher, Some("u1"));
        let (_b, mut b_rx) = join(&h.dispatcher, Some("u2"));
        // Same user on a second device still only gets what it asks for.
        let (_c, mut c_rx) = join(&h.dispatcher, Some("u1"));

        assert!(h.dispatcher.request_balance(a, &UserId::from("u1")));
        assert_eq!(drain(&mut a_rx).len(), 1);
        assert!(drain(&mut b_rx).is_empty());
        assert!(drain(&mut c_rx).is_empty());
    }

    #[test]
    fn test_request_balance_after_disconnect() {
        let h = harness(DispatchPolicy::default());
        let (id, _rx) = join(&h.dispatcher, Some("u1"));
        let (_other, _other_rx) = join(&h.dispatcher, Some("u2"));
        h.dispatcher.registry().disconnect(id);
        let live = h.dispatcher.registry().len();

        assert!(!h.dispatcher.request_balance(id, &UserId::from("u1")));
        assert_eq!(h.dispatcher.registry().len(), live);
    }

    #[test]
    fn test_tick_forced_notifications_only() {
        let h = harness(DispatchPolicy::new(1.0, 0.0));
        let mut receivers: Vec<_> = (0..5)
            .map(|i| join(&h.dispatcher, Some(format!("u{i}").as_str())).1)
            .collect();

        let report = h.dispatcher.tick();
        assert_eq!(report.connections, 5);
        assert_eq!(report.notifications, 5);
        assert_eq!(report.balance_updates, 0);

        for rx in &mut receivers {
            let msgs = drain(rx);
            assert_eq!(msgs.len(), 1);
            assert!(matches!(msgs[0], ServerMessage::SystemNotification(_)));
        }
    }

    #[test]
    fn test_tick_forced_both_kinds_in_order() {
        let h = harness(DispatchPolicy::new(1.0, 1.0));
        let (_id, mut rx) = join(&h.dispatcher, Some("u1"));

        h.dispatcher.tick();
        let msgs = drain(&mut rx);
        assert_eq!(msgs.len(), 2);
        assert!(matches!(msgs[0], ServerMessage::SystemNotification(_)));
        match &msgs[1] {
            ServerMessage::BalanceUpdated(event) => {
                assert_eq!(event.change(), event.balance - event.previous_balance);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_tick_never_fires_at_zero() {
        let h = harness(DispatchPolicy::new(0.0, 0.0));
        let (_id, mut rx) = join(&h.dispatcher, Some("u1"));
        for _ in 0..20 {
            assert_eq!(h.dispatcher.tick().notifications, 0);
        }
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_tick_notifies_unauthenticated_without_balance() {
        let h = harness(DispatchPolicy::new(1.0, 1.0));
        let (_anon, mut anon_rx) = join(&h.dispatcher, None);
        let (_authed, mut authed_rx) = join(&h.dispatcher, Some("u1"));

        let report = h.dispatcher.tick();
        assert_eq!(report.connections, 2);
        assert_eq!(report.notifications, 2);
        assert_eq!(report.balance_updates, 1);

        let msgs = drain(&mut anon_rx);
        assert_eq!(msgs.len(), 1);
        match &msgs[0] {
            ServerMessage::SystemNotification(event) => {
                assert_eq!(event.user_id, None);
                assert!(!event.broadcast);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(drain(&mut authed_rx).len(), 2);
    }

    #[test]
    fn test_tick_forced_notifications_reach_every_live_connection() {
        let h = harness(DispatchPolicy::new(1.0, 0.0));
        let (_anon, mut anon_rx) = join(&h.dispatcher, None);
        let (_authed, mut authed_rx) = join(&h.dispatcher, Some("u1"));

        let report = h.dispatcher.tick();
        assert_eq!(report.notifications, 2);
        assert_eq!(report.balance_updates, 0);
        for rx in [&mut anon_rx, &mut authed_rx] {
            let msgs = drain(rx);
            assert_eq!(msgs.len(), 1);
            assert!(matches!(msgs[0], ServerMessage::SystemNotification(_)));
        }
    }

    #[test]
    fn test_tick_uses_fresh_snapshot() {
        let h = harness(DispatchPolicy::new(1.0, 0.0));
        let (a, _a_rx) = join(&h.dispatcher, Some("u1"));
        assert_eq!(h.dispatcher.tick().notifications, 1);

        h.dispatcher.registry().disconnect(a);
        let (_b, mut b_rx) = join(&h.dispatcher, Some("u2"));
        let report = h.dispatcher.tick();
        assert_eq!(report.connections, 1);
        assert_eq!(drain(&mut b_rx).len(), 1);
    }

    #[test]
    fn test_notify_broadcast_and_targeted() {
        let h = harness(DispatchPolicy::default());
        let (_a, mut a_rx) = join(&h.dispatcher, Some("u1"));
        let (_b, mut b_rx) = join(&h.dispatcher, Some("u2"));
        let (_c, mut c_rx) = join(&h.dispatcher, None);

        let targeted = NotificationEvent {
            user_id: Some(UserId::from("u2")),
            title: "Split request".into(),
            message: "Dinner, 3 ways".into(),
            priority: Priority::Medium,
            broadcast: false,
        };
        assert_eq!(h.dispatcher.notify(targeted), 1);
        assert!(drain(&mut a_rx).is_empty());
        assert_eq!(drain(&mut b_rx).len(), 1);
        assert!(drain(&mut c_rx).is_empty());

        let everyone = NotificationEvent {
            user_id: None,
            title: "Maintenance".into(),
            message: "Back soon".into(),
            priority: Priority::High,
            broadcast: true,
        };
        assert_eq!(h.dispatcher.notify(everyone), 3);
        assert_eq!(drain(&mut a_rx).len(), 1);
        assert_eq!(drain(&mut b_rx).len(), 1);
        assert_eq!(drain(&mut c_rx).len(), 1);
    }

    #[test]
    fn test_notify_unknown_user() {
        let h = harness(DispatchPolicy::default());
        let event = NotificationEvent {
            user_id: Some(UserId::from("ghost")),
            title: "t".into(),
            message: "m".into(),
            priority: Priority::Low,
            broadcast: false,
        };
        assert_eq!(h.dispatcher.notify(event), 0);
    }
}
