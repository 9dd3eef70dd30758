//! Exponential backoff with jitter for worker connect attempts.

use std::time::Duration;

use rand::Rng;

use crate::config::WorkerConfig;

/// Delay schedule between attempts to open the duplex connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectBackoff {
    base: Duration,
    max: Duration,
}

impl ConnectBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    ///
    /// Doubles from `base`, capped at `max`, plus up to 10% jitter so workers
    /// started together do not redial in lockstep.
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let factor = 2u32.saturating_pow(attempt - 1);
        let capped = self.base.saturating_mul(factor).min(self.max);

        let jitter_range = capped.as_millis() as u64 / 10;
        let jitter = if jitter_range > 0 {
            rand::thread_rng().gen_range(0..jitter_range)
        } else {
            0
        };

        capped + Duration::from_millis(jitter)
    }
}

impl From<&WorkerConfig> for ConnectBackoff {
    fn from(config: &WorkerConfig) -> Self {
        Self::new(
            Duration::from_millis(config.connect_base_delay_ms),
            Duration::from_millis(config.connect_max_delay_ms),
        )
    }
}
