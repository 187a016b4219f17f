use std::time::Duration;

#[derive(Debug, Clone)]
pub struct CourierConfig {
    /// Upper bound for a send to reach `sent` before the caller gets `Timeout`.
    pub send_timeout: Duration,
    /// Lifetime of `system_announcement` notifications.
    pub announcement_ttl: chrono::Duration,
}

impl Default for CourierConfig {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_millis(5000),
            announcement_ttl: chrono::Duration::hours(720),
        }
    }
}
