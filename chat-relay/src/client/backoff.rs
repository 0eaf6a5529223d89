use std::time::Duration;

use rand::Rng;

/// Exponential reconnect delays, doubling from `initial` up to `max`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            jitter: true,
        }
    }

    /// Disables the random spread so delays are predictable.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay before reconnect attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let base = self.initial.saturating_mul(1 << exponent).min(self.max);
        if !self.jitter || base.is_zero() {
            return base;
        }

        // Spread retries over [base/2, base] so clients dropped together do
        // not reconnect in lockstep.
        let half = base / 2;
        let spread = rand::thread_rng().gen_range(0..=half.as_millis() as u64);
        half + Duration::from_millis(spread)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(5))
    }
}
