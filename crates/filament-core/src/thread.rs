//! Threads, cooperative cancellation, and cancellable blocking waits.
//!
//! Every thread spawned here carries a record with a cancellation flag, a
//! LIFO stack of cleanup handlers, and the address it is currently blocked
//! on, if any. Cancellation is cooperative and point-based: a request from
//! any thread only takes effect when the target reaches a cancellation
//! point — the start of every blocking primitive — so no invariant is ever
//! left broken by a mid-critical-section interruption. A target blocked on
//! a registered wait address is woken promptly by the wait primitive's
//! interrupt capability.
//!
//! Delivery unwinds the thread with a private panic payload after running
//! the cleanup handlers most-recently-pushed first; the spawn trampoline
//! catches the payload and records the thread as cancelled.
//!
//! The main thread has no record and is therefore never cancellable.

#![allow(unsafe_code)]

use std::any::Any;
use std::cell::RefCell;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::clock::{self, Tick};
use crate::error::RuntimeError;
use crate::waitaddr::WaitOutcome;
use crate::{runtime, tls};

/// Bit set in `ThreadRecord::exited` once the thread has terminated.
const EXIT_BIT: u32 = 1;

/// Longest single slice a sleeper parks for before re-reading the clock.
const SLEEP_SLICE: Tick = 100_000;

/// Private unwind payload that terminates a cancelled thread.
struct CancelUnwind;

enum Outcome {
    Completed(Box<dyn Any + Send>),
    Cancelled,
    Panicked(Box<dyn Any + Send>),
}

pub(crate) struct ThreadRecord {
    /// Cancellation request; a hint set by any thread, relaxed visibility.
    killed: AtomicBool,
    /// Whether cancellation is currently deliverable; owner thread only.
    killable: AtomicBool,
    /// Join word; doubles as the futex joiners block on.
    exited: AtomicU32,
    /// Parking word for cancellable sleeps; mutated only by interrupt.
    wakeup: AtomicU32,
    /// Address of the `AtomicU32` this thread is blocked on, if any.
    wait_addr: Mutex<Option<usize>>,
    /// LIFO cleanup handlers; pushed and popped by the owner thread.
    cleanups: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
    outcome: Mutex<Option<Outcome>>,
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<ThreadRecord>>> = const { RefCell::new(None) };
}

fn current_record() -> Option<Arc<ThreadRecord>> {
    CURRENT.try_with(|current| current.borrow().clone()).ok().flatten()
}

/// Best-effort scheduling priority applied at thread startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    TimeCritical,
}

#[cfg(target_os = "linux")]
impl Priority {
    fn nice(self) -> libc::c_int {
        match self {
            Priority::Low => 10,
            Priority::Normal => 0,
            Priority::High => -5,
            Priority::TimeCritical => -15,
        }
    }
}

#[cfg(target_os = "linux")]
fn apply_priority(priority: Priority) {
    let nice = priority.nice();
    if nice == 0 {
        return;
    }
    // Raising priority needs privileges; failure is expected and harmless.
    // SAFETY: plain syscall affecting only the calling thread.
    let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, nice) };
    if rc != 0 {
        log::debug!(
            "thread priority {priority:?} not applied: {}",
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn apply_priority(_priority: Priority) {}

/// Options for [`spawn`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SpawnOptions {
    /// Detached threads release their OS join handle immediately; the
    /// record is freed by the thread itself on exit.
    pub detached: bool,
    pub priority: Priority,
}

/// Handle to a spawned thread, parameterized by its result type.
pub struct Thread<T> {
    record: Arc<ThreadRecord>,
    os: Option<std::thread::JoinHandle<()>>,
    _result: PhantomData<fn() -> T>,
}

/// Cancel-capable reference to a thread, usable from any context.
#[derive(Clone)]
pub struct ThreadRef {
    record: Arc<ThreadRecord>,
}

/// Spawn a thread running `entry`.
///
/// The new thread is not cancellable until it has installed its record as
/// current; a `request_cancel` issued before that point is delivered at the
/// thread's first cancellation point.
pub fn spawn<T, F>(options: SpawnOptions, entry: F) -> Result<Thread<T>, RuntimeError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let record = Arc::new(ThreadRecord {
        killed: AtomicBool::new(false),
        killable: AtomicBool::new(false),
        exited: AtomicU32::new(0),
        wakeup: AtomicU32::new(0),
        wait_addr: Mutex::new(None),
        cleanups: Mutex::new(Vec::new()),
        outcome: Mutex::new(None),
    });
    let trampoline_record = Arc::clone(&record);
    let os = std::thread::Builder::new()
        .name("filament-worker".into())
        .spawn(move || run_thread(trampoline_record, options.priority, entry))?;
    let os = if options.detached {
        drop(os);
        None
    } else {
        Some(os)
    };
    Ok(Thread {
        record,
        os,
        _result: PhantomData,
    })
}

fn run_thread<T, F>(record: Arc<ThreadRecord>, priority: Priority, entry: F)
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    CURRENT.with(|current| *current.borrow_mut() = Some(Arc::clone(&record)));
    record.killable.store(true, Ordering::Relaxed);
    apply_priority(priority);

    let result = panic::catch_unwind(AssertUnwindSafe(entry));
    let outcome = match result {
        Ok(value) => Outcome::Completed(Box::new(value)),
        Err(payload) if payload.is::<CancelUnwind>() => Outcome::Cancelled,
        Err(payload) => Outcome::Panicked(payload),
    };
    *record.outcome.lock() = Some(outcome);

    // Destructor sweep runs here, while thread-locals are still intact.
    tls::sweep_current_thread();
    CURRENT.with(|current| *current.borrow_mut() = None);

    record.exited.fetch_or(EXIT_BIT, Ordering::Release);
    if let Some(rt) = runtime::try_handle() {
        rt.wait
            .wake_all_addr(&record.exited as *const AtomicU32 as usize, 4);
    }
}

impl<T: Send + 'static> Thread<T> {
    /// Cancel-capable reference to this thread.
    #[must_use]
    pub fn handle(&self) -> ThreadRef {
        ThreadRef {
            record: Arc::clone(&self.record),
        }
    }

    /// True once the thread has terminated; join will not block.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.record.exited.load(Ordering::Acquire) & EXIT_BIT != 0
    }

    /// Request cooperative cancellation of this thread.
    pub fn request_cancel(&self) {
        cancel_record(&self.record);
    }

    /// Block until the thread exits, then retrieve its result.
    ///
    /// A cancellation point. Returns `None` if the target was cancelled;
    /// re-raises the target's panic payload if it panicked.
    pub fn join(mut self) -> Option<T> {
        assert!(self.os.is_some(), "cannot join a detached thread");
        loop {
            let seen = self.record.exited.load(Ordering::Acquire);
            if seen & EXIT_BIT != 0 {
                break;
            }
            block_on_address(&self.record.exited, seen, None);
        }
        if let Some(os) = self.os.take() {
            let _ = os.join();
        }
        let outcome = self
            .record
            .outcome
            .lock()
            .take()
            .expect("thread exited without recording an outcome");
        match outcome {
            Outcome::Completed(value) => {
                Some(*value.downcast::<T>().expect("thread result type mismatch"))
            }
            Outcome::Cancelled => None,
            Outcome::Panicked(payload) => panic::resume_unwind(payload),
        }
    }
}

impl ThreadRef {
    /// Request cooperative cancellation: set the killed flag and, if the
    /// target is blocked on a registered wait address, interrupt that wait
    /// so it returns promptly instead of waiting for its natural timeout.
    pub fn request_cancel(&self) {
        cancel_record(&self.record);
    }
}

fn cancel_record(record: &ThreadRecord) {
    record.killed.store(true, Ordering::Relaxed);
    let wait_addr = record.wait_addr.lock();
    if let Some(addr) = *wait_addr {
        if let Some(rt) = runtime::try_handle() {
            rt.wait.interrupt(addr);
        }
    }
}

/// Reference to the calling thread, if it was spawned by this runtime.
#[must_use]
pub fn current() -> Option<ThreadRef> {
    current_record().map(|record| ThreadRef { record })
}

/// Number of logical CPUs available to the process.
#[must_use]
pub fn cpu_count() -> usize {
    std::thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(1)
}

/// Deliver a pending cancellation, if any.
///
/// Called internally at the start of every blocking primitive. If the
/// calling thread is killable and a cancellation was requested, this flips
/// killability off (delivery is not re-entrant), runs every installed
/// cleanup handler most-recently-pushed first, and terminates the thread
/// without returning to the caller.
pub fn test_cancellation_point() {
    let Some(record) = current_record() else {
        return;
    };
    if !record.killable.load(Ordering::Relaxed) {
        return;
    }
    if !record.killed.load(Ordering::Relaxed) {
        return;
    }

    record.killable.store(false, Ordering::Relaxed);
    let handlers = std::mem::take(&mut *record.cleanups.lock());
    for handler in handlers.into_iter().rev() {
        handler();
    }
    panic::resume_unwind(Box::new(CancelUnwind));
}

/// Disable cancellation delivery, returning the previous state.
///
/// Brackets sections that must not be interrupted; nesting must be strictly
/// save → ... → restore.
#[must_use = "pass the saved state to restore_cancel_state"]
pub fn save_cancel_state() -> bool {
    let Some(record) = current_record() else {
        return false;
    };
    let state = record.killable.load(Ordering::Relaxed);
    record.killable.store(false, Ordering::Relaxed);
    state
}

/// Restore cancellation delivery saved by [`save_cancel_state`].
pub fn restore_cancel_state(saved: bool) {
    let Some(record) = current_record() else {
        return;
    };
    assert!(
        !record.killable.load(Ordering::Relaxed),
        "unbalanced cancel-state restore"
    );
    record.killable.store(saved, Ordering::Relaxed);
}

/// Install a cleanup handler on the calling thread's stack.
///
/// Handlers run most-recently-pushed first when a cancellation is
/// delivered, and never on normal exit.
pub fn push_cleanup<F: FnOnce() + Send + 'static>(handler: F) {
    let Some(record) = current_record() else {
        return;
    };
    record.cleanups.lock().push(Box::new(handler));
}

/// Remove the most recently pushed cleanup handler, running it if `run`.
pub fn pop_cleanup(run: bool) {
    let Some(record) = current_record() else {
        return;
    };
    let handler = record
        .cleanups
        .lock()
        .pop()
        .expect("cleanup stack underflow");
    if run {
        handler();
    }
}

/// Unregisters the wait address on scope exit, including cancellation
/// unwind, so a later `request_cancel` can never interrupt a stale address.
struct WaitRegistration<'a> {
    record: &'a ThreadRecord,
    addr: usize,
}

impl Drop for WaitRegistration<'_> {
    fn drop(&mut self) {
        let mut wait_addr = self.record.wait_addr.lock();
        assert_eq!(
            wait_addr.take(),
            Some(self.addr),
            "unregistering a wait address that was not registered"
        );
    }
}

fn block_on_address(site: &AtomicU32, expected: u32, timeout: Option<Duration>) -> WaitOutcome {
    let rt = runtime::handle();
    let record = current_record();
    match record.as_deref() {
        Some(record) => {
            let addr = site as *const AtomicU32 as usize;
            {
                let mut wait_addr = record.wait_addr.lock();
                assert!(wait_addr.is_none(), "nested address waits");
                *wait_addr = Some(addr);
            }
            let registration = WaitRegistration { record, addr };
            // A cancel landing before the registration above only set the
            // killed flag; catch it here, unregistered, before blocking.
            // One landing after it will interrupt the registered address.
            if record.killable.load(Ordering::Relaxed) && record.killed.load(Ordering::Relaxed) {
                drop(registration);
                test_cancellation_point();
                unreachable!("pending cancellation was not delivered");
            }
            let outcome = rt.wait.wait_while_equals(site, u64::from(expected), timeout);
            drop(registration);
            test_cancellation_point();
            outcome
        }
        None => rt.wait.wait_while_equals(site, u64::from(expected), timeout),
    }
}

/// Block while `*site == expected`. A cancellation point.
///
/// Spurious returns are possible; re-validate the condition. A cancelled
/// waiter may leave [`crate::waitaddr::INTERRUPT_BIT`] set in the word —
/// callers interpreting the value must mask it out.
pub fn wait_address(site: &AtomicU32, expected: u32) -> WaitOutcome {
    block_on_address(site, expected, None)
}

/// Like [`wait_address`] with a timeout.
pub fn wait_address_timeout(site: &AtomicU32, expected: u32, timeout: Duration) -> WaitOutcome {
    block_on_address(site, expected, Some(timeout))
}

/// Sleep until `deadline`. A cancellation point.
///
/// Sleeps in bounded slices, re-checking cancellation and the clock on each
/// slice; a cancelled sleeper terminates promptly because its parking word
/// is interrupted rather than timed out.
pub fn sleep_until(deadline: Tick) {
    test_cancellation_point();
    loop {
        let delay = deadline - clock::now();
        if delay <= 0 {
            return;
        }
        let slice = Duration::from_micros(delay.min(SLEEP_SLICE) as u64);
        match current_record() {
            Some(record) => {
                let seen = record.wakeup.load(Ordering::Relaxed);
                block_on_address(&record.wakeup, seen, Some(slice));
            }
            None => std::thread::sleep(slice),
        }
    }
}

/// Sleep for `delay` ticks. A cancellation point.
pub fn sleep_for(delay: Tick) {
    sleep_until(clock::now() + delay);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ensure_runtime;

    #[test]
    fn spawn_and_join_returns_value() {
        ensure_runtime();
        let thread = spawn(SpawnOptions::default(), || 40 + 2).unwrap();
        assert_eq!(thread.join(), Some(42));
    }

    #[test]
    fn main_thread_has_no_record() {
        assert!(current().is_none());
        // All cancellation operations are no-ops on the main thread.
        test_cancellation_point();
        let saved = save_cancel_state();
        assert!(!saved);
        restore_cancel_state(saved);
    }

    #[test]
    fn current_is_some_inside_spawned_thread() {
        ensure_runtime();
        let thread = spawn(SpawnOptions::default(), || current().is_some()).unwrap();
        assert_eq!(thread.join(), Some(true));
    }

    #[test]
    fn detached_thread_runs() {
        ensure_runtime();
        let done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&done);
        let options = SpawnOptions {
            detached: true,
            ..SpawnOptions::default()
        };
        let _thread = spawn(options, move || flag.store(true, Ordering::Release)).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !done.load(Ordering::Acquire) {
            assert!(std::time::Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn is_finished_after_join_word_set() {
        ensure_runtime();
        let thread = spawn(SpawnOptions::default(), || ()).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !thread.is_finished() {
            assert!(std::time::Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(thread.join(), Some(()));
    }

    #[test]
    fn cpu_count_is_positive() {
        assert!(cpu_count() >= 1);
    }

    #[test]
    fn sleep_for_waits_roughly_long_enough() {
        ensure_runtime();
        let start = clock::now();
        sleep_for(20_000);
        assert!(clock::now() - start >= 20_000);
    }
}
