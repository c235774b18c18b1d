//! Event sources consumed by the dispatcher.
//!
//! Balances and notifications come from the wider application. The
//! simulated implementations here stand in for those collaborators: a
//! per-user random walk and a fixed notification catalogue.

use dashmap::DashMap;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::types::{BalanceReading, NotificationEvent, Priority, UserId};

/// Reason attached to pull responses.
pub const REASON_REQUESTED: &str = "balance_request";

/// Provides balances for users.
pub trait BalanceSource: Send + Sync {
    /// Current balance.
    fn balance(&self, user_id: &UserId) -> f64;

    /// Produce the next balance movement for a periodic update.
    fn advance(&self, user_id: &UserId) -> BalanceReading;
}

/// Produces notifications for users.
pub trait NotificationSource: Send + Sync {
    /// `None` for a connection that has not authenticated yet.
    fn next(&self, user_id: Option<&UserId>) -> NotificationEvent;
}

// ═══════════════════════════════════════════════════════════════
// Simulated balances
// ═══════════════════════════════════════════════════════════════

const SEED_MIN: f64 = 1_000.0;
const SEED_MAX: f64 = 6_000.0;
const STEP: f64 = 250.0;

const MOVEMENTS: &[(&str, f64)] = &[
    ("payment_received", 1.0),
    ("refund_processed", 1.0),
    ("split_settled", 1.0),
    ("payment_sent", -1.0),
    ("card_purchase", -1.0),
];

/// In-memory random-walk ledger, one entry per user seen.
#[derive(Debug, Default)]
pub struct SimulatedBalances {
    ledger: DashMap<UserId, f64>,
}

impl SimulatedBalances {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fix a user's balance (tests, fixtures).
    pub fn set(&self, user_id: UserId, balance: f64) {
        self.ledger.insert(user_id, balance);
    }
}

impl BalanceSource for SimulatedBalances {
    fn balance(&self, user_id: &UserId) -> f64 {
        *self
            .ledger
            .entry(user_id.clone())
            .or_insert_with(|| cents(rand::thread_rng().gen_range(SEED_MIN..SEED_MAX)))
    }

    fn advance(&self, user_id: &UserId) -> BalanceReading {
        let mut rng = rand::thread_rng();
        let (reason, sign) = MOVEMENTS
            .choose(&mut rng)
            .copied()
            .unwrap_or(("payment_received", 1.0));
        let amount = cents(rng.gen_range(0.01..STEP));

        let mut entry = self
            .ledger
            .entry(user_id.clone())
            .or_insert_with(|| cents(rng.gen_range(SEED_MIN..SEED_MAX)));
        let previous = *entry;
        let current = cents((previous + sign * amount).max(0.0));
        *entry = current;

        BalanceReading {
            previous,
            current,
            reason: reason.to_string(),
        }
    }
}

fn cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

// ═══════════════════════════════════════════════════════════════
// Simulated notifications
// ═══════════════════════════════════════════════════════════════

const CATALOGUE: &[(&str, &str, Priority)] = &[
    ("Payment received", "You received a new payment.", Priority::Medium),
    ("Split request", "A friend added you to a group expense.", Priority::Medium),
    ("Budget alert", "You have used 80% of this month's budget.", Priority::High),
    ("Security check", "A new device signed in to your account.", Priority::High),
    ("Weekly summary", "Your weekly spending summary is ready.", Priority::Low),
];

/// Picks a random entry from a fixed catalogue. Always targeted.
#[derive(Debug, Default)]
pub struct SimulatedNotifications;

impl NotificationSource for SimulatedNotifications {
    fn next(&self, user_id: Option<&UserId>) -> NotificationEvent {
        let (title, message, priority) = CATALOGUE
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or(CATALOGUE[0]);
        NotificationEvent {
            user_id: user_id.cloned(),
            title: title.to_string(),
            message: message.to_string(),
            priority,
            broadcast: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_balance_seeded_once() {
        let balances = SimulatedBalances::new();
        let user = UserId::from("u1");
        let first = balances.balance(&user);
        assert!((SEED_MIN..SEED_MAX).contains(&first));
        assert_eq!(balances.balance(&user), first);
    }

    #[test]
    fn test_advance_walks_from_previous() {
        let balances = SimulatedBalances::new();
        let user = UserId::from("u1");
        balances.set(user.clone(), 500.0);

        let mut last = 500.0;
        for _ in 0..50 {
            let reading = balances.advance(&user);
            assert_eq!(reading.previous, last);
            assert!(reading.current >= 0.0);
            assert!((reading.current - reading.previous).abs() <= STEP);
            last = reading.current;
        }
        assert_eq!(balances.balance(&user), last);
    }

    #[test]
    fn test_advance_never_negative() {
        let balances = SimulatedBalances::new();
        let user = UserId::from("broke");
        balances.set(user.clone(), 0.0);
        for _ in 0..50 {
            assert!(balances.advance(&user).current >= 0.0);
        }
    }

    #[test]
    fn test_notifications_are_targeted() {
        let user = UserId::from("u9");
        let event = SimulatedNotifications.next(Some(&user));
        assert_eq!(event.user_id, Some(user));
        assert!(!event.broadcast);
        assert!(!event.title.is_empty());

        let anon = SimulatedNotifications.next(None);
        assert_eq!(anon.user_id, None);
        assert!(!anon.broadcast);
    }
}
