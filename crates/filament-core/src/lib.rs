//! # filament-core
//!
//! Portable thread and synchronization runtime with cooperative
//! cancellation: threads, mutexes, address waits, semaphores, thread-local
//! storage, timers, and a select-once monotonic clock, layered on hosts
//! that have no native cancellable blocking calls.
//!
//! Blocking primitives — contended mutex lock, address wait, semaphore
//! wait, join, sleep — are all cancellation points. A cancelled thread
//! unwinds only at such a point, after running its cleanup handlers in
//! reverse push order, so shared state is never left half-mutated.
//!
//! Process-wide state lives in one explicit context: call
//! [`runtime::init`] before any static mutex, thread-local, clock or timer
//! use, and [`runtime::shutdown`] after the last.

#![deny(unsafe_code)]

#[allow(unsafe_code)]
pub mod clock;
pub mod error;
#[allow(unsafe_code)]
pub mod mutex;
pub mod runtime;
pub mod sem;
#[allow(unsafe_code)]
pub mod thread;
pub mod timer;
pub mod tls;
#[allow(unsafe_code)]
pub mod waitaddr;

pub use clock::{CLOCK_FREQ, ClockBackend, Tick, now, select_source};
pub use error::RuntimeError;
pub use mutex::{RtMutex, RtMutexGuard};
pub use runtime::{init, shutdown};
pub use sem::Semaphore;
pub use thread::{
    Priority, SpawnOptions, Thread, ThreadRef, cpu_count, current, pop_cleanup, push_cleanup,
    restore_cancel_state, save_cancel_state, sleep_for, sleep_until, spawn,
    test_cancellation_point, wait_address, wait_address_timeout,
};
pub use timer::{FireTime, Timer};
pub use tls::{TLS_SLOTS_MAX, TlsKey};
pub use waitaddr::{INTERRUPT_BIT, WaitOutcome, Watchable, wait_while_equals, wake_all, wake_one};
