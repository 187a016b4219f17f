use std::time::Duration;

use tracing::{info, warn};

use courier_core::Courier;

/// Background task that drops expired announcements so they stop
/// occupying storage. Reads already ignore them once they expire.
pub async fn run_sweep_loop(courier: Courier, every: Duration) {
    let mut interval = tokio::time::interval(every);

    loop {
        interval.tick().await;

        match courier.purge_expired_notifications().await {
            Ok(count) => {
                if count > 0 {
                    info!("Sweep: purged {} expired notifications", count);
                }
            }
            Err(e) => {
                warn!("Sweep error: {}", e);
            }
        }
    }
}
