//! pulsed — pulse server binary.

use tracing::info;

use pulsed::config::Config;
use pulsed::error::PulseError;
use pulsed::lifecycle::Runtime;
use pulsed::state::AppState;

#[tokio::main]
async fn main() -> Result<(), PulseError> {
    // Load .env if present (local dev).
    let _ = dotenvy::dotenv();

    let config = Config::from_env();

    // Tracing.
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(&config.log_level)
        .with_target(true);
    if config.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!("pulsed starting");
    info!(listen = %config.listen_addr, instance = %config.server_instance);

    // ── Shared state + background tasks ─────────────────────
    let state = AppState::new(config.clone());
    let runtime = Runtime::init(state.clone());

    // ── Routes ──────────────────────────────────────────────
    let app = pulsed::build_router(state.clone());

    // ── Bind & serve ────────────────────────────────────────
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "pulsed listening");

    let shutdown = state.shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("ctrl-c received, shutting down"),
                _ = shutdown.cancelled() => {}
            }
            // Wake reader loops so their connections drain.
            shutdown.cancel();
        })
        .await?;

    runtime.teardown().await;
    info!("pulsed stopped");
    Ok(())
}
