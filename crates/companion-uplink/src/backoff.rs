use std::time::Duration;

use rand::Rng;

/// Reconnect delay: starts at `base`, doubles per failure, never exceeds `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        let max = max.max(base);
        Self { base, max, current: base, jitter: true }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        // up to +25%
        let extra = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 4);
        (delay + Duration::from_millis(extra)).min(self.max)
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}
