//! Process-wide runtime context.
//!
//! One explicitly constructed context holds every piece of process-scope
//! mutable state: the super-lock and its condition variable (static-mutex
//! machinery and the thread-local slot registry), the wait/wake table, and
//! the clock selection slot.
//!
//! Ordering contract: [`init`] must run before any static mutex,
//! thread-local, clock or timer call; [`shutdown`] must run after the last
//! such call. Per-thread teardown (the thread-local destructor sweep) runs
//! once per exiting OS thread regardless of how the thread was created.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex, RwLock};

use crate::clock::ClockSlot;
use crate::tls::TlsSlot;
use crate::waitaddr::WaitTable;

pub(crate) struct Runtime {
    /// Protects the static-mutex state machine and the slot registry.
    pub(crate) super_lock: Mutex<SuperState>,
    /// Companion condition for contended static mutexes.
    pub(crate) super_cond: Condvar,
    pub(crate) wait: WaitTable,
    pub(crate) clock: ClockSlot,
}

pub(crate) struct SuperState {
    pub(crate) tls_slots: Vec<TlsSlot>,
}

static INSTANCE: RwLock<Option<Arc<Runtime>>> = RwLock::new(None);

/// Install the process-wide runtime context.
///
/// Runs the wait/wake capability probe. Calling twice without an intervening
/// [`shutdown`] is a contract violation.
pub fn init() {
    let mut slot = INSTANCE.write();
    assert!(slot.is_none(), "runtime already initialized");
    let runtime = Runtime {
        super_lock: Mutex::new(SuperState {
            tls_slots: Vec::new(),
        }),
        super_cond: Condvar::new(),
        wait: WaitTable::probe(),
        clock: ClockSlot::new(),
    };
    *slot = Some(Arc::new(runtime));
    log::debug!("runtime context installed");
}

/// Remove the process-wide runtime context.
///
/// Must run after the last static-mutex, thread-local, clock or timer call.
pub fn shutdown() {
    let mut slot = INSTANCE.write();
    let runtime = slot.take().expect("runtime not initialized");
    let live = runtime
        .super_lock
        .lock()
        .tls_slots
        .iter()
        .filter(|slot| slot.in_use)
        .count();
    if live != 0 {
        log::warn!("{live} thread-local slots still registered at shutdown");
    }
    log::debug!("runtime context removed");
}

pub(crate) fn handle() -> Arc<Runtime> {
    INSTANCE
        .read()
        .as_ref()
        .expect("runtime not initialized")
        .clone()
}

pub(crate) fn try_handle() -> Option<Arc<Runtime>> {
    INSTANCE.read().clone()
}
