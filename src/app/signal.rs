use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct SignalState {
    set: bool,
    set_count: u64,
}

/// One-shot, resettable readiness event shared between a producing stage and
/// the orchestrating thread.
#[derive(Debug, Default)]
pub struct ReadinessSignal {
    state: Mutex<SignalState>,
    cv: Condvar,
}

impl ReadinessSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        let mut state = self.lock();
        state.set = true;
        state.set_count += 1;
        self.cv.notify_all();
    }

    pub fn clear(&self) {
        self.lock().set = false;
    }

    pub fn is_set(&self) -> bool {
        self.lock().set
    }

    /// Number of times `set` has been called over the signal's lifetime.
    pub fn set_count(&self) -> u64 {
        self.lock().set_count
    }

    pub fn wait(&self) {
        let mut state = self.lock();
        while !state.set {
            state = self
                .cv
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Returns whether the signal was set before `timeout` elapsed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        while !state.set {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (next, _) = self
                .cv
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            state = next;
        }
        true
    }

    fn lock(&self) -> MutexGuard<'_, SignalState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
