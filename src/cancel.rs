use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Cooperative cancellation flag shared between a caller and a worker.
///
/// Cancellation is observed at chunk boundaries and interrupts backoff
/// sleeps; an in-flight client call always runs to completion.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    /// Creates a token that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation and wakes any sleeper.
    pub fn cancel(&self) {
        let (flag, wakeup) = &*self.inner;
        *lock(flag) = true;
        wakeup.notify_all();
    }

    /// Returns true once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *lock(&self.inner.0)
    }

    /// Sleeps for `duration` or until cancelled.
    ///
    /// Returns `false` if the token was cancelled before or during the sleep.
    pub fn sleep(&self, duration: Duration) -> bool {
        let (flag, wakeup) = &*self.inner;
        let (cancelled, _) = wakeup
            .wait_timeout_while(lock(flag), duration, |cancelled| !*cancelled)
            .unwrap_or_else(PoisonError::into_inner);
        !*cancelled
    }
}

fn lock(flag: &Mutex<bool>) -> MutexGuard<'_, bool> {
    flag.lock().unwrap_or_else(PoisonError::into_inner)
}
