//! Bounded exponential backoff for engine connection attempts.

use std::time::Duration;

use tracing::warn;

use super::{Connection, EngineError, EngineResult};

/// Retry policy for `connect()`: a fixed attempt budget with exponential
/// delays and symmetrical jitter to avoid synchronized reconnect storms.
#[derive(Clone, Copy, Debug)]
pub struct ConnectRetry {
    pub attempts: u32,
    pub base: Duration,
    pub cap: Duration,
    pub jitter: f64,
}

impl Default for ConnectRetry {
    fn default() -> Self {
        Self {
            attempts: 3,
            base: Duration::from_millis(200),
            cap: Duration::from_secs(2),
            jitter: 0.1,
        }
    }
}

impl ConnectRetry {
    /// Delay before the given attempt (1-based; attempt 1 has no delay).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exp = self.base.as_millis() as f64 * 2f64.powi(attempt as i32 - 2);
        let clamped = exp.min(self.cap.as_millis() as f64);
        let jittered = if self.jitter > 0.0 {
            let spread = clamped * self.jitter;
            (clamped + (rand::random::<f64>() * 2.0 - 1.0) * spread).max(0.0)
        } else {
            clamped
        };
        Duration::from_millis(jittered as u64)
    }

    /// Drive `connect()` until it succeeds or the attempt budget is spent.
    pub async fn connect(&self, connection: &mut Box<dyn Connection>) -> EngineResult<()> {
        let mut last_err = None;
        for attempt in 1..=self.attempts {
            let delay = self.delay_for(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            match connection.connect().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(attempt, error = %e, "engine connect attempt failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or(EngineError::NotConnected))
    }
}
