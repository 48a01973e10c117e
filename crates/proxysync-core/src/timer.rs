//! Single-shot resync timer.
//!
//! Each arm spawns a sleeping task on the runtime and bumps a generation
//! counter. A firing task only counts if its generation is still current and
//! the timer is still armed, so a cancel that races the expiry wins.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

#[derive(Debug, Default)]
struct TimerState {
    generation: u64,
    armed: bool,
    task: Option<JoinHandle<()>>,
}

/// Cancellable single-shot timer.
#[derive(Debug)]
pub struct ResyncTimer {
    runtime: Handle,
    timeout: Duration,
    state: Mutex<TimerState>,
}

impl ResyncTimer {
    /// Create a disarmed timer.
    #[must_use]
    pub fn new(runtime: Handle, timeout: Duration) -> Self {
        Self {
            runtime,
            timeout,
            state: Mutex::new(TimerState::default()),
        }
    }

    /// Configured expiry.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Arm the timer, replacing any earlier arm.
    ///
    /// `on_fire` receives the generation of this arm and should hand it to
    /// [`fire`](Self::fire) before acting. Returns the generation.
    pub fn arm<F>(&self, on_fire: F) -> u64
    where
        F: FnOnce(u64) + Send + 'static,
    {
        let mut state = self.state.lock();
        if let Some(task) = state.task.take() {
            task.abort();
        }
        state.generation = state.generation.wrapping_add(1);
        state.armed = true;

        let generation = state.generation;
        let timeout = self.timeout;
        state.task = Some(self.runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            on_fire(generation);
        }));
        generation
    }

    /// Disarm the timer. Returns `true` if it was armed; cancelling twice is harmless.
    pub fn cancel(&self) -> bool {
        let mut state = self.state.lock();
        if let Some(task) = state.task.take() {
            task.abort();
        }
        std::mem::replace(&mut state.armed, false)
    }

    /// Claim an expiry.
    ///
    /// Returns `true` exactly once per arm, and only if the timer was not
    /// cancelled or re-armed in the meantime.
    pub fn fire(&self, generation: u64) -> bool {
        let mut state = self.state.lock();
        if !state.armed || state.generation != generation {
            return false;
        }
        state.armed = false;
        state.task = None;
        true
    }

    /// Whether the timer is armed.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.state.lock().armed
    }
}

impl Drop for ResyncTimer {
    fn drop(&mut self) {
        if let Some(task) = self.state.get_mut().task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const TIMEOUT: Duration = Duration::from_secs(60);

    fn counting(timer: &Arc<ResyncTimer>, fired: &Arc<AtomicUsize>) -> u64 {
        let timer_ref = Arc::clone(timer);
        let fired = Arc::clone(fired);
        timer.arm(move |generation| {
            if timer_ref.fire(generation) {
                fired.fetch_add(1, Ordering::SeqCst);
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_timeout() {
        let timer = Arc::new(ResyncTimer::new(Handle::current(), TIMEOUT));
        let fired = Arc::new(AtomicUsize::new(0));

        counting(&timer, &fired);
        tokio::time::sleep(TIMEOUT / 2).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(timer.is_armed());

        tokio::time::sleep(TIMEOUT * 2).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timer.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_firing() {
        let timer = Arc::new(ResyncTimer::new(Handle::current(), TIMEOUT));
        let fired = Arc::new(AtomicUsize::new(0));

        counting(&timer, &fired);
        assert!(timer.cancel());
        assert!(!timer.cancel());

        tokio::time::sleep(TIMEOUT * 2).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_generation_is_ignored() {
        let timer = Arc::new(ResyncTimer::new(Handle::current(), TIMEOUT));

        let first = timer.arm(|_| {});
        let second = timer.arm(|_| {});

        assert!(!timer.fire(first));
        assert!(timer.fire(second));
        assert!(!timer.fire(second));
    }
}
