//! Mutual exclusion with dynamic and deferred-static forms.
//!
//! A dynamic [`RtMutex`] passes straight through to the underlying raw lock.
//! The static form is const-constructible so process-wide globals work
//! before any per-object initializer has run: until [`RtMutex::materialize`]
//! upgrades it, locking is driven by a plain `locked` flag and contention
//! counter under the runtime's super-lock and condition variable. After
//! materialization the two forms behave identically.
//!
//! Double-unlock and unlock-while-unlocked are fatal assertions: they mean
//! an invariant is already corrupted and continuing is unsafe.

#![allow(unsafe_code)]

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::RawMutex;
use parking_lot::lock_api::RawMutex as _;

use crate::{runtime, thread};

pub struct RtMutex {
    dynamic: AtomicBool,
    raw: RawMutex,
    /// Dynamic-mode diagnostic: proves unlock calls match lock calls.
    held: AtomicBool,
    /// Static-mode state; both fields are guarded by the super-lock.
    locked: AtomicBool,
    contention: AtomicU32,
}

impl RtMutex {
    /// Dynamic mutex, ready to use.
    #[must_use]
    pub fn new() -> Self {
        Self {
            dynamic: AtomicBool::new(true),
            raw: RawMutex::INIT,
            held: AtomicBool::new(false),
            locked: AtomicBool::new(false),
            contention: AtomicU32::new(0),
        }
    }

    /// Deferred static mutex for globals that may be locked before any
    /// explicit initializer has run (the runtime context itself must be
    /// installed first).
    #[must_use]
    pub const fn new_static() -> Self {
        Self {
            dynamic: AtomicBool::new(false),
            raw: RawMutex::INIT,
            held: AtomicBool::new(false),
            locked: AtomicBool::new(false),
            contention: AtomicU32::new(0),
        }
    }

    /// Upgrade a static mutex to dynamic behavior. Idempotent; fatal if the
    /// mutex is locked or contended at the time of the call.
    pub fn materialize(&self) {
        if self.dynamic.load(Ordering::Acquire) {
            return;
        }
        let rt = runtime::handle();
        let _guard = rt.super_lock.lock();
        assert!(
            !self.locked.load(Ordering::Relaxed),
            "cannot materialize a locked mutex"
        );
        assert_eq!(
            self.contention.load(Ordering::Relaxed),
            0,
            "cannot materialize a contended mutex"
        );
        self.dynamic.store(true, Ordering::Release);
    }

    /// Acquire the lock. Contended acquisition of a dynamic mutex is a
    /// cancellation point; the static path disables cancellation instead (a
    /// static mutex must never be abandoned mid-wait).
    pub fn lock(&self) {
        if !self.dynamic.load(Ordering::Acquire) {
            self.lock_static();
            return;
        }
        if !self.raw.try_lock() {
            thread::test_cancellation_point();
            self.raw.lock();
        }
        assert!(
            !self.held.swap(true, Ordering::Relaxed),
            "lock state corrupted"
        );
    }

    fn lock_static(&self) {
        let saved = thread::save_cancel_state();
        let rt = runtime::handle();
        let mut state = rt.super_lock.lock();
        while self.locked.load(Ordering::Relaxed) {
            self.contention.fetch_add(1, Ordering::Relaxed);
            rt.super_cond.wait(&mut state);
            self.contention.fetch_sub(1, Ordering::Relaxed);
        }
        self.locked.store(true, Ordering::Relaxed);
        drop(state);
        thread::restore_cancel_state(saved);
    }

    /// Try to acquire the lock without blocking.
    #[must_use]
    pub fn try_lock(&self) -> bool {
        if !self.dynamic.load(Ordering::Acquire) {
            let rt = runtime::handle();
            let _state = rt.super_lock.lock();
            if self.locked.load(Ordering::Relaxed) {
                return false;
            }
            self.locked.store(true, Ordering::Relaxed);
            return true;
        }
        if self.raw.try_lock() {
            assert!(
                !self.held.swap(true, Ordering::Relaxed),
                "lock state corrupted"
            );
            true
        } else {
            false
        }
    }

    /// Release the lock. Fatal if the mutex is not locked.
    pub fn unlock(&self) {
        if !self.dynamic.load(Ordering::Acquire) {
            let rt = runtime::handle();
            let state = rt.super_lock.lock();
            assert!(
                self.locked.load(Ordering::Relaxed),
                "unlock of an unlocked mutex"
            );
            self.locked.store(false, Ordering::Relaxed);
            if self.contention.load(Ordering::Relaxed) != 0 {
                // Only worth a broadcast when someone is actually waiting.
                rt.super_cond.notify_all();
            }
            drop(state);
            return;
        }
        assert!(
            self.held.swap(false, Ordering::Relaxed),
            "unlock of an unlocked mutex"
        );
        // SAFETY: the held flag above proves a matching prior lock call.
        unsafe { self.raw.unlock() };
    }

    /// RAII convenience for scoped critical sections.
    pub fn guard(&self) -> RtMutexGuard<'_> {
        self.lock();
        RtMutexGuard { mutex: self }
    }
}

impl Default for RtMutex {
    fn default() -> Self {
        Self::new()
    }
}

pub struct RtMutexGuard<'a> {
    mutex: &'a RtMutex,
}

impl Drop for RtMutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ensure_runtime;

    #[test]
    fn lock_unlock_roundtrip() {
        ensure_runtime();
        let mutex = RtMutex::new();
        mutex.lock();
        mutex.unlock();
        mutex.lock();
        mutex.unlock();
    }

    #[test]
    fn try_lock_reports_contention() {
        ensure_runtime();
        let mutex = RtMutex::new();
        assert!(mutex.try_lock());
        assert!(!mutex.try_lock());
        mutex.unlock();
        assert!(mutex.try_lock());
        mutex.unlock();
    }

    #[test]
    fn static_mutex_works_without_materialization() {
        ensure_runtime();
        static MUTEX: RtMutex = RtMutex::new_static();
        MUTEX.lock();
        assert!(!MUTEX.try_lock());
        MUTEX.unlock();
        assert!(MUTEX.try_lock());
        MUTEX.unlock();
    }

    #[test]
    fn materialize_is_idempotent() {
        ensure_runtime();
        let mutex = RtMutex::new_static();
        mutex.materialize();
        mutex.materialize();
        mutex.lock();
        mutex.unlock();
    }

    #[test]
    fn guard_unlocks_on_drop() {
        ensure_runtime();
        let mutex = RtMutex::new();
        {
            let _guard = mutex.guard();
            assert!(!mutex.try_lock());
        }
        assert!(mutex.try_lock());
        mutex.unlock();
    }
}
