//! Consecutive-error circuit breaker for the node watch.

/// Tracks consecutive watch errors against a threshold.
#[derive(Debug, Clone)]
pub struct WatcherHealth {
    consecutive_errors: u32,
    fatal_signaled: bool,
    threshold: u32,
}

impl WatcherHealth {
    pub fn new(threshold: u32) -> Self {
        Self {
            consecutive_errors: 0,
            fatal_signaled: false,
            threshold: threshold.max(1),
        }
    }

    /// Count one transient error. Returns true only for the error that
    /// reaches the threshold; the breaker never trips twice.
    pub fn record_error(&mut self) -> bool {
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);

        if !self.fatal_signaled && self.consecutive_errors >= self.threshold {
            self.fatal_signaled = true;
            return true;
        }
        false
    }

    /// A clean synchronization clears the error streak.
    pub fn record_sync(&mut self) {
        self.consecutive_errors = 0;
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    pub fn fatal_signaled(&self) -> bool {
        self.fatal_signaled
    }
}
