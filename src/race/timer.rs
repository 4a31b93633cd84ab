//! Race clock
//!
//! Elapsed time is always `now - zero_instant`; samples are never
//! accumulated, so tick jitter cannot drift the clock.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Default)]
pub struct RaceTimer {
    zero: Option<Instant>,
    stopped_at: Option<Instant>,
}

impl RaceTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start counting from `zero`. Restarting discards the previous run.
    pub fn start(&mut self, zero: Instant) {
        self.zero = Some(zero);
        self.stopped_at = None;
    }

    /// Freeze the clock at `now`. Returns the final elapsed time.
    pub fn stop(&mut self, now: Instant) -> Duration {
        if self.is_running() {
            self.stopped_at = Some(now);
        }
        self.elapsed(now)
    }

    pub fn reset(&mut self) {
        self.zero = None;
        self.stopped_at = None;
    }

    pub fn is_running(&self) -> bool {
        self.zero.is_some() && self.stopped_at.is_none()
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        let Some(zero) = self.zero else {
            return Duration::ZERO;
        };
        let end = self.stopped_at.unwrap_or(now);
        end.saturating_duration_since(zero)
    }

    pub fn elapsed_ms(&self, now: Instant) -> u64 {
        self.elapsed(now).as_millis() as u64
    }
}
