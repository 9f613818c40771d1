//! One-shot and periodic timers.
//!
//! Each arming owns a dedicated worker thread that sleeps until the
//! deadline and invokes the callback, so a single timer's periodic firings
//! never overlap. There is no ordering guarantee between two timers.
//!
//! Re-scheduling or disarming cancels the current binding first, waiting
//! for an in-flight callback to finish — do not call `schedule` from inside
//! the timer's own callback.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::clock::{self, Tick};

/// How `schedule` interprets its first-fire value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireTime {
    /// The value is a deadline on the runtime clock.
    Absolute,
    /// The value is a delay from now.
    Relative,
}

/// Longest single wait before the worker re-reads the clock.
const WORKER_SLICE: Tick = 100_000;

struct SchedState {
    /// Bumped on every schedule/disarm; a worker exits when it no longer
    /// matches the generation it was armed with.
    generation: u64,
    worker: Option<JoinHandle<()>>,
}

struct TimerShared {
    callback: Box<dyn Fn() + Send + Sync>,
    sched: Mutex<SchedState>,
    cond: Condvar,
}

pub struct Timer {
    shared: Arc<TimerShared>,
}

impl Timer {
    /// Create an unarmed timer. No OS resource is bound until `schedule`.
    #[must_use]
    pub fn new<F: Fn() + Send + Sync + 'static>(callback: F) -> Self {
        Self {
            shared: Arc::new(TimerShared {
                callback: Box::new(callback),
                sched: Mutex::new(SchedState {
                    generation: 0,
                    worker: None,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// (Re)arm the timer.
    ///
    /// Any existing binding is cancelled first. `value == 0` disarms
    /// without rescheduling. `period == 0` fires once; otherwise the
    /// callback repeats every `period` ticks after the first fire. A
    /// relative first fire in the past fires immediately.
    pub fn schedule(&self, fire: FireTime, value: Tick, period: Tick) {
        let worker = {
            let mut sched = self.shared.sched.lock();
            sched.generation += 1;
            self.shared.cond.notify_all();
            sched.worker.take()
        };
        if let Some(worker) = worker {
            let _ = worker.join();
        }
        if value == 0 {
            return;
        }

        let deadline = match fire {
            FireTime::Absolute => value,
            FireTime::Relative => clock::now().saturating_add(value),
        };
        let period = period.max(0);

        let shared = Arc::clone(&self.shared);
        let mut sched = self.shared.sched.lock();
        let generation = sched.generation;
        let worker = std::thread::Builder::new()
            .name("filament-timer".into())
            .spawn(move || run_worker(shared, generation, deadline, period))
            .expect("timer worker creation failed");
        sched.worker = Some(worker);
    }

    /// Cancel any pending firing without rescheduling.
    pub fn disarm(&self) {
        self.schedule(FireTime::Relative, 0, 0);
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.disarm();
    }
}

fn run_worker(shared: Arc<TimerShared>, generation: u64, mut deadline: Tick, period: Tick) {
    loop {
        {
            let mut sched = shared.sched.lock();
            loop {
                if sched.generation != generation {
                    return;
                }
                let delay = deadline - clock::now();
                if delay <= 0 {
                    break;
                }
                let slice = Duration::from_micros(delay.min(WORKER_SLICE) as u64);
                let _ = shared.cond.wait_for(&mut sched, slice);
            }
        }
        (shared.callback)();
        if period == 0 {
            return;
        }
        deadline += period;
    }
}
