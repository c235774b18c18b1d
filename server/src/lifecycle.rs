//! Background lifecycle.
//!
//! `Runtime` owns the state and the periodic dispatch task: `init` starts the
//! ticker, `teardown` stops it and closes every live connection.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatcher::Dispatcher;
use crate::state::AppState;

pub struct Runtime {
    state: Arc<AppState>,
    ticker: JoinHandle<()>,
}

impl Runtime {
    pub fn init(state: Arc<AppState>) -> Self {
        let ticker = spawn_periodic_dispatch(
            Arc::clone(&state),
            state.config.dispatch_interval,
            state.shutdown.clone(),
        );
        info!(
            interval_ms = state.config.dispatch_interval.as_millis() as u64,
            "periodic dispatch started"
        );
        Self { state, ticker }
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Stop the ticker, then drop every connection.
    pub async fn teardown(self) {
        self.state.shutdown.cancel();
        if let Err(e) = self.ticker.await {
            warn!("dispatch task ended abnormally: {e}");
        }
        let closed = self.state.registry.close_all();
        info!(closed, "teardown complete");
    }
}

/// Spawn the dispatch ticker. Runs until `cancel` fires.
pub fn spawn_periodic_dispatch(
    state: Arc<AppState>,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately; skip it so the first dispatch is one period in.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => run_tick(&state.dispatcher),
            }
        }
        debug!("periodic dispatch stopped");
    })
}

fn run_tick(dispatcher: &Dispatcher) {
    let report = dispatcher.tick();
    if report.notifications + report.balance_updates > 0 {
        debug!(
            connections = report.connections,
            notifications = report.notifications,
            balance_updates = report.balance_updates,
            "dispatch tick"
        );
    }
}
