//! Mutual-exclusion stress scenario.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use filament_core::{self as rt, RtMutex, SpawnOptions};
use serde_json::json;

use crate::Report;

/// Spawn `threads` threads each performing `increments` non-atomic
/// increments of one shared counter under one mutex. Any mutual-exclusion
/// failure shows up as a lost update.
pub fn run(threads: usize, increments: usize) -> Report {
    let mutex = Arc::new(RtMutex::new());
    let counter = Arc::new(AtomicU64::new(0));

    let workers: Vec<_> = (0..threads)
        .map(|_| {
            let mutex = Arc::clone(&mutex);
            let counter = Arc::clone(&counter);
            rt::spawn(SpawnOptions::default(), move || {
                for _ in 0..increments {
                    mutex.lock();
                    let value = counter.load(Ordering::Relaxed);
                    counter.store(value + 1, Ordering::Relaxed);
                    mutex.unlock();
                }
            })
            .expect("worker spawn failed")
        })
        .collect();
    for worker in workers {
        worker.join();
    }

    let expected = (threads * increments) as u64;
    let observed = counter.load(Ordering::Relaxed);
    Report {
        scenario: "counter",
        pass: observed == expected,
        details: json!({
            "threads": threads,
            "increments": increments,
            "expected": expected,
            "observed": observed,
        }),
    }
}
