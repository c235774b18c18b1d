//! Shared server state — the connection registry and its dispatcher.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::dispatcher::{DispatchPolicy, Dispatcher};
use crate::registry::ConnectionRegistry;
use crate::sources::{BalanceSource, NotificationSource, SimulatedBalances, SimulatedNotifications};

/// Shared state accessible from all handlers.
pub struct AppState {
    /// Live connections keyed by connection id.
    pub registry: Arc<ConnectionRegistry>,
    pub dispatcher: Dispatcher,
    /// Cancelled at teardown; reader loops and the ticker watch it.
    pub shutdown: CancellationToken,
    pub config: Config,
}

impl AppState {
    /// State backed by the simulated balance and notification sources.
    pub fn new(config: Config) -> Arc<Self> {
        Self::with_sources(
            config,
            Arc::new(SimulatedBalances::new()),
            Arc::new(SimulatedNotifications),
        )
    }

    pub fn with_sources(
        config: Config,
        balances: Arc<dyn BalanceSource>,
        notifications: Arc<dyn NotificationSource>,
    ) -> Arc<Self> {
        let registry = Arc::new(ConnectionRegistry::new());
        let policy = DispatchPolicy::new(
            config.notification_probability,
            config.balance_probability,
        );
        let dispatcher = Dispatcher::new(Arc::clone(&registry), balances, notifications, policy);

        Arc::new(Self {
            registry,
            dispatcher,
            shutdown: CancellationToken::new(),
            config,
        })
    }
}
