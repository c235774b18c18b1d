//! Watch live events for one user.
//!
//! ```bash
//! PULSE_SERVER=ws://localhost:8080 PULSE_USER_ID=u1 cargo run --example watch
//! ```
//! Without those variables the client is no-op and the example exits.

use std::time::Duration;

use pulse_client::{PulseClient, PulseEvent};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let mut pulse = PulseClient::init().await;
    if !pulse.is_active() {
        println!("pulse inactive (no PULSE_SERVER / PULSE_USER_ID) — nothing to watch");
        return Ok(());
    }

    // Give the background task a moment to connect and authenticate.
    tokio::time::sleep(Duration::from_millis(200)).await;
    pulse.request_balance().await?;

    let watch = async {
        while let Some(event) = pulse.next_event().await {
            match event {
                PulseEvent::BalanceUpdated(b) => println!(
                    "[{}] balance {:.2} ({:+.2}, {})",
                    b.timestamp, b.balance, b.change, b.reason
                ),
                PulseEvent::SystemNotification(n) => {
                    println!("[{}] {}: {}", n.priority, n.title, n.message)
                }
            }
        }
    };
    // Run for a minute, then leave.
    let _ = tokio::time::timeout(Duration::from_secs(60), watch).await;

    pulse.shutdown().await?;
    Ok(())
}
