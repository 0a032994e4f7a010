use std::thread;
use std::time::{Duration, Instant};

/// Bounded exponential backoff for polling loops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// `None` polls until `max_attempts` is reached (or forever).
    pub max_elapsed: Option<Duration>,
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            max_elapsed: None,
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    pub fn with_deadline(max_elapsed: Duration) -> Self {
        Self {
            max_elapsed: Some(max_elapsed),
            ..Self::default()
        }
    }

    /// Delay before attempt `attempt + 1`, where `attempt` starts at 1.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// Calls `probe` until it yields `Some`, sleeping with backoff in between.
    /// Returns `None` once attempts or elapsed time are exhausted.
    pub fn poll<T>(&self, mut probe: impl FnMut(u32) -> Option<T>) -> Option<T> {
        let started = Instant::now();
        let mut attempt = 0u32;
        loop {
            attempt = attempt.saturating_add(1);
            if let Some(value) = probe(attempt) {
                return Some(value);
            }
            if self.max_attempts.is_some_and(|max| attempt >= max) {
                return None;
            }
            let mut delay = self.delay_for(attempt);
            if let Some(limit) = self.max_elapsed {
                let elapsed = started.elapsed();
                if elapsed >= limit {
                    return None;
                }
                // Never sleep past the deadline; one last probe runs at the boundary.
                delay = delay.min(limit - elapsed);
            }
            thread::sleep(delay);
        }
    }
}
