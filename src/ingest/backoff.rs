use rand::Rng;
use std::time::Duration;

/// Exponential backoff for storage outages. Attempts are unbounded: a partition
/// keeps retrying until the store comes back.
#[derive(Debug)]
pub struct ExponentialBackoff {
    initial_delay_ms: u64,
    max_delay_ms: u64,
    current_attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(initial_ms: u64, max_ms: u64) -> Self {
        Self {
            initial_delay_ms: initial_ms,
            max_delay_ms: max_ms.max(initial_ms),
            current_attempt: 0,
        }
    }

    /// Delay before the next attempt, jittered into `[d/2, d]`
    pub fn next_delay(&mut self) -> Duration {
        let ceiling = 2_u64
            .checked_pow(self.current_attempt)
            .and_then(|factor| self.initial_delay_ms.checked_mul(factor))
            .map_or(self.max_delay_ms, |delay| delay.min(self.max_delay_ms));

        let delay = rand::thread_rng().gen_range(ceiling / 2..=ceiling);
        self.current_attempt = self.current_attempt.saturating_add(1);
        Duration::from_millis(delay)
    }

    pub fn attempts(&self) -> u32 {
        self.current_attempt
    }

    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }
}
