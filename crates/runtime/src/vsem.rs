//! Virtual counting semaphore.
//!
//! A `VSem` is a counting semaphore whose count is signed and may start
//! negative. Starting the count at `-(n-1)` turns the semaphore into an
//! n-party latch: the first `n` releases are required before a single
//! acquire can succeed. Every synchronization object in the runtime (the
//! parallel-for completion latch, task futures, the pool's work counter)
//! is built on this one primitive.
//!
//! # Concurrency
//!
//! One mutex guards the count; one condition variable parks waiters.
//! Spurious wakeups are handled by re-checking the count in a loop, and
//! the timed acquire re-checks against an absolute deadline so a wakeup
//! storm cannot extend the wait.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

pub struct VSem {
    count: Mutex<i32>,
    cv: Condvar,
    /// Upper bound on the count; 0 means unbounded.
    max_count: i32,
}

impl VSem {
    /// Creates an unbounded semaphore. Negative `initial` is the latch idiom.
    pub fn new(initial: i32) -> Self {
        Self::with_max(initial, 0)
    }

    /// Creates a semaphore whose count saturates at `max_count`.
    ///
    /// A release that would push the count past the cap is silently
    /// dropped; the signal is still delivered so a waiter registered in
    /// the meantime is not lost.
    pub fn with_max(initial: i32, max_count: i32) -> Self {
        VSem {
            count: Mutex::new(initial),
            cv: Condvar::new(),
            max_count,
        }
    }

    fn lock(&self) -> MutexGuard<'_, i32> {
        // A panicking work item cannot leave the count in a torn state;
        // recover the guard rather than poisoning every later caller.
        self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks while the count is non-positive, then decrements.
    pub fn acquire(&self) {
        let mut count = self.lock();
        while *count <= 0 {
            count = self.cv.wait(count).unwrap_or_else(PoisonError::into_inner);
        }
        *count -= 1;
    }

    /// Like [`acquire`](Self::acquire), but gives up `seconds` from now.
    ///
    /// Returns `true` if the semaphore was acquired. On timeout the count
    /// is left untouched and `false` is returned; timing out is a normal
    /// result, not an error.
    pub fn acquire_timeout(&self, seconds: f64) -> bool {
        let deadline = Instant::now() + Duration::from_secs_f64(seconds.max(0.0));
        let mut count = self.lock();
        while *count <= 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .cv
                .wait_timeout(count, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            count = guard;
        }
        *count -= 1;
        true
    }

    /// Decrements without blocking. Returns `false` if the count was
    /// non-positive.
    pub fn try_acquire(&self) -> bool {
        let mut count = self.lock();
        if *count > 0 {
            *count -= 1;
            true
        } else {
            false
        }
    }

    /// Increments the count (unless capped) and wakes one waiter.
    pub fn release(&self) {
        let mut count = self.lock();
        if self.max_count == 0 || *count < self.max_count {
            *count += 1;
        }
        self.cv.notify_one();
    }
}
