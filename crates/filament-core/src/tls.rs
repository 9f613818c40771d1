//! Thread-local storage slots with exit destructors.
//!
//! Slots are registered in a process-scope registry under the super-lock so
//! an exiting thread can find every destructor it owes. Values are per
//! thread, zero meaning absent, and a slot's optional destructor runs
//! exactly once per non-zero value at thread exit.
//!
//! The exit sweep re-acquires the super-lock for every pass because a
//! destructor may itself create or delete slots, set values, or spawn and
//! join threads; it loops until a full pass finds nothing left to destroy.
//! The sweep runs for every exiting OS thread via a thread-local drop
//! guard, and eagerly in the spawn trampoline for runtime threads (while
//! their thread-locals are still fully usable).

use std::cell::RefCell;
use std::collections::HashMap;

use crate::error::RuntimeError;
use crate::runtime;

/// Maximum number of live thread-local slots.
pub const TLS_SLOTS_MAX: usize = 1024;

/// Handle to a thread-local storage slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlsKey {
    index: u32,
    generation: u32,
}

pub(crate) struct TlsSlot {
    pub(crate) in_use: bool,
    destructor: Option<fn(u64)>,
    /// Bumped on create so a stale key never matches a recycled slot.
    generation: u32,
}

/// Owns this thread's values; dropping it (thread exit) runs the sweep.
struct SweepOnExit {
    map: RefCell<HashMap<u32, (u32, u64)>>,
}

impl Drop for SweepOnExit {
    fn drop(&mut self) {
        sweep_map(&self.map);
    }
}

thread_local! {
    static VALUES: SweepOnExit = SweepOnExit {
        map: RefCell::new(HashMap::new()),
    };
}

/// Create a slot with an optional exit destructor.
///
/// Exhaustion is reported, never fatal.
pub fn create(destructor: Option<fn(u64)>) -> Result<TlsKey, RuntimeError> {
    let rt = runtime::handle();
    let mut state = rt.super_lock.lock();
    for (index, slot) in state.tls_slots.iter_mut().enumerate() {
        if !slot.in_use {
            slot.in_use = true;
            slot.destructor = destructor;
            slot.generation = slot.generation.wrapping_add(1);
            return Ok(TlsKey {
                index: index as u32,
                generation: slot.generation,
            });
        }
    }
    if state.tls_slots.len() >= TLS_SLOTS_MAX {
        return Err(RuntimeError::TlsExhausted);
    }
    state.tls_slots.push(TlsSlot {
        in_use: true,
        destructor,
        generation: 1,
    });
    Ok(TlsKey {
        index: (state.tls_slots.len() - 1) as u32,
        generation: 1,
    })
}

/// Delete a slot. Does not run destructors; values already set in live
/// threads are skipped at their exit because the generation no longer
/// matches. Deleting an unknown or stale key is fatal.
pub fn delete(key: TlsKey) {
    let rt = runtime::handle();
    let mut state = rt.super_lock.lock();
    let slot = state
        .tls_slots
        .get_mut(key.index as usize)
        .expect("deleting an unknown thread-local slot");
    assert!(
        slot.in_use && slot.generation == key.generation,
        "deleting a stale thread-local key"
    );
    slot.in_use = false;
    slot.destructor = None;
}

/// Set the calling thread's value for `key`. Zero means absent.
pub fn set(key: TlsKey, value: u64) {
    // A failed try_with means this thread-local is mid-teardown; the final
    // sweep already passed and the value is discarded.
    let _ = VALUES.try_with(|tls| {
        tls.map
            .borrow_mut()
            .insert(key.index, (key.generation, value));
    });
}

/// Get the calling thread's value for `key`, zero if absent.
#[must_use]
pub fn get(key: TlsKey) -> u64 {
    VALUES
        .try_with(|tls| {
            tls.map
                .borrow()
                .get(&key.index)
                .filter(|(generation, _)| *generation == key.generation)
                .map(|&(_, value)| value)
                .unwrap_or(0)
        })
        .unwrap_or(0)
}

/// Run the exit sweep for the calling thread.
pub(crate) fn sweep_current_thread() {
    let _ = VALUES.try_with(|tls| sweep_map(&tls.map));
}

fn sweep_map(map: &RefCell<HashMap<u32, (u32, u64)>>) {
    let Some(rt) = runtime::try_handle() else {
        return;
    };
    loop {
        // One destructor per pass: the registry and this thread's values can
        // both change while a destructor runs, so rescan from scratch.
        let mut due = None;
        {
            let state = rt.super_lock.lock();
            let values = map.borrow();
            for (&index, &(generation, value)) in values.iter() {
                if value == 0 {
                    continue;
                }
                let Some(slot) = state.tls_slots.get(index as usize) else {
                    continue;
                };
                if slot.in_use && slot.generation == generation {
                    if let Some(destructor) = slot.destructor {
                        due = Some((index, value, destructor));
                        break;
                    }
                }
            }
        }
        match due {
            Some((index, value, destructor)) => {
                // Clear before calling so the destructor runs exactly once.
                map.borrow_mut().remove(&index);
                destructor(value);
            }
            None => break,
        }
    }
    map.borrow_mut().clear();
}
