//! Cooperative cancellation for blocking workers.
//!
//! Long-running units (download attempts, version syncs) receive a
//! [`CancellationToken`] at spawn time. Every sleep, queue wait and I/O loop
//! checks it; cancelling wakes all current waiters immediately, so a worker
//! parked in a backoff sleep reacts without polling.
//!
//! Tokens are cheap to clone and share one flag. [`Deadline`] is the
//! companion for wall-clock bounds (a sync run's hard limit); it composes
//! with a token via [`CancellationToken::wait_timeout`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// A clonable cancellation flag with wakeable waits.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    lock: Mutex<()>,
    condvar: Condvar,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip the flag and wake every waiter. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        let _guard = self.inner.lock.lock().expect("cancel lock poisoned");
        self.inner.condvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Sleep for up to `timeout`, returning early when cancelled.
    /// Returns `true` if the token was cancelled during (or before) the wait.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_cancelled() {
            return true;
        }
        let start = Instant::now();
        let mut guard = self.inner.lock.lock().expect("cancel lock poisoned");
        loop {
            if self.is_cancelled() {
                return true;
            }
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return false;
            }
            let (next, _timed_out) = self
                .inner
                .condvar
                .wait_timeout(guard, timeout - elapsed)
                .expect("cancel lock poisoned");
            guard = next;
        }
    }
}

/// A wall-clock bound derived from a start instant and a budget.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    expires_at: Instant,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            expires_at: Instant::now() + budget,
        }
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    /// Time left, zero once expired.
    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}
