//! Idle grace and hard ceiling timers of a worker connection.

use std::time::Duration;

use tokio::time::{sleep_until, Instant};

use crate::config::LifecycleConfig;

#[derive(Debug)]
pub struct LifecycleTimers {
    idle_grace: Duration,
    idle_deadline: Option<Instant>,
    hard_deadline: Instant,
}

impl LifecycleTimers {
    /// Start both timers. The idle timer runs until the first request.
    pub fn start(config: &LifecycleConfig) -> Self {
        let now = Instant::now();
        let idle_grace = Duration::from_millis(config.idle_grace_ms);
        Self {
            idle_grace,
            idle_deadline: Some(now + idle_grace),
            hard_deadline: now + Duration::from_millis(config.hard_lifetime_ms),
        }
    }

    /// A request arrived: cancel any pending idle shutdown.
    pub fn cancel_idle(&mut self) {
        self.idle_deadline = None;
    }

    /// The last open stream finished: start the grace period over.
    pub fn arm_idle(&mut self) {
        self.idle_deadline = Some(Instant::now() + self.idle_grace);
    }

    pub fn idle_armed(&self) -> bool {
        self.idle_deadline.is_some()
    }

    pub async fn idle_expired(&self) {
        match self.idle_deadline {
            Some(deadline) => sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }

    pub async fn hard_expired(&self) {
        sleep_until(self.hard_deadline).await
    }
}
