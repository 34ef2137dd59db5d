//! Inbound control-frame budget for one client connection.
//!
//! A connection starts with `burst` frames of credit. Credit comes back at
//! `per_second` frames per second and never exceeds `burst`.

use std::time::{Duration, Instant};

/// Longest retry hint handed back to a throttled client.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct FrameBudget {
    credit: f64,
    burst: f64,
    per_second: f64,
    checked_at: Instant,
}

impl FrameBudget {
    #[must_use]
    pub fn new(burst: u32, per_second: u32) -> Self {
        Self {
            credit: f64::from(burst),
            burst: f64::from(burst),
            per_second: f64::from(per_second),
            checked_at: Instant::now(),
        }
    }

    /// Spend credit for one inbound frame.
    ///
    /// # Errors
    ///
    /// Returns how long the client should wait before its next frame would
    /// be admitted, capped at [`MAX_RETRY_AFTER`].
    pub fn spend(&mut self) -> Result<(), Duration> {
        self.spend_at(Instant::now())
    }

    fn spend_at(&mut self, now: Instant) -> Result<(), Duration> {
        let earned = now.saturating_duration_since(self.checked_at).as_secs_f64() * self.per_second;
        self.credit = (self.credit + earned).min(self.burst);
        self.checked_at = self.checked_at.max(now);
        if self.credit >= 1.0 {
            self.credit -= 1.0;
            return Ok(());
        }
        Err(self.wait())
    }

    fn wait(&self) -> Duration {
        if self.per_second <= 0.0 {
            return MAX_RETRY_AFTER;
        }
        Duration::from_secs_f64((1.0 - self.credit) / self.per_second).min(MAX_RETRY_AFTER)
    }
}
