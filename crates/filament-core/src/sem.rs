//! Counting semaphore with cancellable waits.
//!
//! Built directly on the wait/wake primitive: the count lives in one atomic
//! word that waiters block on. Bit 31 of the word is reserved for the
//! cancellation interrupt sentinel, so a cancelled waiter cannot corrupt
//! the count.

use core::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::clock::{self, Tick};
use crate::thread;
use crate::waitaddr::{self, INTERRUPT_BIT};

/// Bits of the word that carry the count.
const COUNT_MASK: u32 = !INTERRUPT_BIT;

pub struct Semaphore {
    count: AtomicU32,
}

impl Semaphore {
    /// Semaphore with `initial` permits.
    #[must_use]
    pub const fn new(initial: u32) -> Self {
        assert!(initial & INTERRUPT_BIT == 0, "semaphore count out of range");
        Self {
            count: AtomicU32::new(initial),
        }
    }

    /// Release one permit and wake a waiter.
    pub fn post(&self) {
        let previous = self.count.fetch_add(1, Ordering::Release);
        assert!(
            previous & COUNT_MASK != COUNT_MASK,
            "semaphore count overflow"
        );
        waitaddr::wake_one(&self.count);
    }

    /// Acquire one permit, blocking until available. A cancellation point.
    pub fn wait(&self) {
        loop {
            if self.try_wait() {
                return;
            }
            let seen = self.count.load(Ordering::Relaxed);
            if seen & COUNT_MASK != 0 {
                continue;
            }
            thread::wait_address(&self.count, seen);
        }
    }

    /// Acquire one permit without blocking.
    pub fn try_wait(&self) -> bool {
        let mut value = self.count.load(Ordering::Acquire);
        while value & COUNT_MASK != 0 {
            match self.count.compare_exchange_weak(
                value,
                value - 1,
                Ordering::Acquire,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => value = observed,
            }
        }
        false
    }

    /// Acquire one permit before `deadline`. A cancellation point.
    ///
    /// Returns false if the deadline passed without a permit.
    pub fn wait_until(&self, deadline: Tick) -> bool {
        loop {
            if self.try_wait() {
                return true;
            }
            let remaining = deadline - clock::now();
            if remaining <= 0 {
                return false;
            }
            let seen = self.count.load(Ordering::Relaxed);
            if seen & COUNT_MASK != 0 {
                continue;
            }
            thread::wait_address_timeout(
                &self.count,
                seen,
                Duration::from_micros(remaining as u64),
            );
        }
    }

    /// Current permit count (diagnostic only; racy by nature).
    #[must_use]
    pub fn value(&self) -> u32 {
        self.count.load(Ordering::Relaxed) & COUNT_MASK
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ensure_runtime;

    #[test]
    fn post_then_wait_does_not_block() {
        ensure_runtime();
        let sem = Semaphore::new(0);
        sem.post();
        sem.wait();
        assert_eq!(sem.value(), 0);
    }

    #[test]
    fn try_wait_respects_count() {
        ensure_runtime();
        let sem = Semaphore::new(2);
        assert!(sem.try_wait());
        assert!(sem.try_wait());
        assert!(!sem.try_wait());
    }

    #[test]
    fn wait_until_times_out_empty() {
        ensure_runtime();
        let sem = Semaphore::new(0);
        let deadline = clock::now() + 20_000;
        assert!(!sem.wait_until(deadline));
        assert!(clock::now() >= deadline);
    }

    #[test]
    fn wait_until_succeeds_with_permit() {
        ensure_runtime();
        let sem = Semaphore::new(1);
        assert!(sem.wait_until(clock::now() + 20_000));
    }

    #[test]
    fn posts_cross_threads() {
        ensure_runtime();
        let sem = std::sync::Arc::new(Semaphore::new(0));
        let poster = {
            let sem = std::sync::Arc::clone(&sem);
            std::thread::spawn(move || {
                for _ in 0..100 {
                    sem.post();
                }
            })
        };
        for _ in 0..100 {
            sem.wait();
        }
        poster.join().unwrap();
        assert_eq!(sem.value(), 0);
    }
}
