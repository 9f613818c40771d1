//! Wait-on-address primitive with a native futex path and an emulated
//! bucket-pool fallback.
//!
//! The contract is deliberately minimal: [`wait_while_equals`] performs a
//! single check-and-block, with no internal retry. Spurious wakeups are
//! surfaced to the caller, and bucket aliasing in the emulated backend means
//! a wake may unblock unrelated waiters, so callers must always re-validate
//! their condition after any return.
//!
//! The emulated backend follows the futex protocol exactly: the watched
//! value is read and the wait decision made while holding the bucket lock,
//! which is released only inside the condition wait. A waker acquires and
//! releases the same lock before notifying, so a wake issued after the value
//! was mutated can never be lost by a waiter that has not yet slept.
//!
//! The backend is chosen once at runtime initialization by a capability
//! probe; the native path is used for 4-byte sites only.

#![allow(unsafe_code)]

use core::sync::atomic::{AtomicU8, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Outcome of a single wait call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The watched value no longer matched; the call did not block.
    ValueMismatch,
    /// Woken, possibly spuriously. Re-validate the condition.
    Woken,
    /// The timeout elapsed.
    TimedOut,
}

/// Sentinel bit ORed into a watched 32-bit word by the interrupt capability
/// (thread cancellation breaking a blocked wait).
///
/// Words owned by this runtime reserve the bit. For caller-owned words
/// registered through a cancellable wait this is best-effort: a cancelled
/// waiter may leave the bit set, and callers must mask it out of any value
/// they interpret.
pub const INTERRUPT_BIT: u32 = 1 << 31;

mod sealed {
    pub trait Sealed {}
}

/// An atomic word the wait primitive can watch.
pub trait Watchable: sealed::Sealed {
    /// Width of the word in bytes.
    const WIDTH: usize;
    #[doc(hidden)]
    fn address(&self) -> usize;
    #[doc(hidden)]
    fn load_relaxed(&self) -> u64;
}

macro_rules! impl_watchable {
    ($ty:ty, $width:expr) => {
        impl sealed::Sealed for $ty {}
        impl Watchable for $ty {
            const WIDTH: usize = $width;
            fn address(&self) -> usize {
                self as *const $ty as usize
            }
            fn load_relaxed(&self) -> u64 {
                self.load(Ordering::Relaxed) as u64
            }
        }
    };
}

impl_watchable!(AtomicU8, 1);
impl_watchable!(AtomicU16, 2);
impl_watchable!(AtomicU32, 4);
impl_watchable!(AtomicU64, 8);

const BUCKETS: usize = 32;

struct WaitBucket {
    lock: Mutex<()>,
    cond: Condvar,
}

impl WaitBucket {
    const fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WakeBackend {
    NativeFutex,
    Emulated,
}

/// Wait/wake facility, owned by the runtime context.
pub(crate) struct WaitTable {
    backend: WakeBackend,
    buckets: [WaitBucket; BUCKETS],
}

impl WaitTable {
    /// Probe host capabilities and build the table.
    pub(crate) fn probe() -> Self {
        let backend = probe_backend();
        log::debug!(
            "wait/wake backend: {}",
            match backend {
                WakeBackend::NativeFutex => "native futex",
                WakeBackend::Emulated => "emulated bucket pool",
            }
        );
        Self {
            backend,
            buckets: [const { WaitBucket::new() }; BUCKETS],
        }
    }

    fn bucket(&self, addr: usize) -> &WaitBucket {
        &self.buckets[(addr >> 3) % BUCKETS]
    }

    fn native(&self, width: usize) -> bool {
        self.backend == WakeBackend::NativeFutex && width == 4
    }

    /// Block only while the value at `site` still equals `expected`.
    pub(crate) fn wait_while_equals<W: Watchable>(
        &self,
        site: &W,
        expected: u64,
        timeout: Option<Duration>,
    ) -> WaitOutcome {
        if self.native(W::WIDTH) {
            return futex_wait(site.address(), expected as u32, timeout);
        }

        let bucket = self.bucket(site.address());
        let mut guard = bucket.lock.lock();
        if site.load_relaxed() != expected {
            return WaitOutcome::ValueMismatch;
        }
        match timeout {
            Some(delay) => {
                if bucket.cond.wait_for(&mut guard, delay).timed_out() {
                    WaitOutcome::TimedOut
                } else {
                    WaitOutcome::Woken
                }
            }
            None => {
                bucket.cond.wait(&mut guard);
                WaitOutcome::Woken
            }
        }
    }

    pub(crate) fn wake_one_addr(&self, addr: usize, width: usize) {
        if self.native(width) {
            futex_wake(addr, 1);
            return;
        }
        self.emulated_wake(addr);
    }

    pub(crate) fn wake_all_addr(&self, addr: usize, width: usize) {
        if self.native(width) {
            futex_wake(addr, i32::MAX);
            return;
        }
        self.emulated_wake(addr);
    }

    fn emulated_wake(&self, addr: usize) {
        let bucket = self.bucket(addr);
        // The lock is taken for sequencing only: any waiter holding it has
        // either not yet read the value (and will observe the mutation), or
        // is already asleep in the condvar and is woken below.
        drop(bucket.lock.lock());
        // Aliasing: several addresses share a bucket, so wake everyone and
        // let them re-check. A single-waiter wake cannot be distinguished.
        bucket.cond.notify_all();
    }

    /// Break a blocked wait on a registered 32-bit word: OR the sentinel bit
    /// into the value so a pre-sleep comparison fails, then wake everyone.
    pub(crate) fn interrupt(&self, addr: usize) {
        // SAFETY: `addr` is a wait address currently registered by a blocked
        // (or about-to-block) thread; registration outlives the wait call.
        let word = unsafe { &*(addr as *const AtomicU32) };
        word.fetch_or(INTERRUPT_BIT, Ordering::Relaxed);
        self.wake_all_addr(addr, 4);
    }
}

#[cfg(target_os = "linux")]
fn probe_backend() -> WakeBackend {
    let word = AtomicU32::new(0);
    // SAFETY: wake does not dereference the word and there are no waiters.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            &word as *const AtomicU32,
            libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
            1,
        )
    };
    if rc >= 0 {
        WakeBackend::NativeFutex
    } else {
        WakeBackend::Emulated
    }
}

#[cfg(not(target_os = "linux"))]
fn probe_backend() -> WakeBackend {
    WakeBackend::Emulated
}

#[cfg(target_os = "linux")]
fn futex_wait(addr: usize, expected: u32, timeout: Option<Duration>) -> WaitOutcome {
    let ts = timeout.map(|d| libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: d.subsec_nanos() as libc::c_long,
    });
    let ts_ptr = ts
        .as_ref()
        .map_or(std::ptr::null(), |t| t as *const libc::timespec);
    // SAFETY: `addr` points at a live, aligned u32 for the duration of the
    // call; `ts_ptr` is null or a valid timespec.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            addr as *const u32,
            libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
            expected,
            ts_ptr,
        )
    };
    if rc == 0 {
        return WaitOutcome::Woken;
    }
    match std::io::Error::last_os_error().raw_os_error() {
        Some(libc::EAGAIN) => WaitOutcome::ValueMismatch,
        Some(libc::ETIMEDOUT) => WaitOutcome::TimedOut,
        Some(libc::EINTR) => WaitOutcome::Woken,
        // Anything else would break the primitive's correctness assumptions.
        _ => std::process::abort(),
    }
}

#[cfg(target_os = "linux")]
fn futex_wake(addr: usize, count: i32) {
    // SAFETY: wake does not dereference the word.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            addr as *const u32,
            libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
            count,
        )
    };
    if rc < 0 {
        std::process::abort();
    }
}

#[cfg(not(target_os = "linux"))]
fn futex_wait(_addr: usize, _expected: u32, _timeout: Option<Duration>) -> WaitOutcome {
    unreachable!("native futex backend is linux-only")
}

#[cfg(not(target_os = "linux"))]
fn futex_wake(_addr: usize, _count: i32) {
    unreachable!("native futex backend is linux-only")
}

/// Raw single-shot wait: block only while `*site == expected`.
///
/// Not a cancellation point; the cancellable form lives on the thread API.
/// Spurious returns are possible — re-validate the condition.
pub fn wait_while_equals<W: Watchable>(
    site: &W,
    expected: u64,
    timeout: Option<Duration>,
) -> WaitOutcome {
    crate::runtime::handle()
        .wait
        .wait_while_equals(site, expected, timeout)
}

/// Wake one waiter blocked on `site` (possibly more under bucket aliasing).
pub fn wake_one<W: Watchable>(site: &W) {
    crate::runtime::handle()
        .wait
        .wake_one_addr(site.address(), W::WIDTH);
}

/// Wake every waiter blocked on `site`.
pub fn wake_all<W: Watchable>(site: &W) {
    crate::runtime::handle()
        .wait
        .wake_all_addr(site.address(), W::WIDTH);
}
