//! Thread-local destructor sweep scenario.

use std::sync::Mutex;

use filament_core::{self as rt, SpawnOptions, tls};
use serde_json::json;

use crate::Report;

static DESTROYED: Mutex<Vec<u64>> = Mutex::new(Vec::new());

fn record(value: u64) {
    DESTROYED.lock().unwrap().push(value);
}

/// Create `slots` slots with destructors, set values in the first `set` of
/// them from a worker thread, and verify exactly those destructors run at
/// its exit.
pub fn run(slots: usize, set: usize) -> Report {
    let set = set.min(slots);
    DESTROYED.lock().unwrap().clear();

    let keys: Vec<_> = (0..slots)
        .map(|_| tls::create(Some(record)).expect("slot creation failed"))
        .collect();

    let worker_keys = keys.clone();
    let worker = rt::spawn(SpawnOptions::default(), move || {
        for (i, key) in worker_keys.iter().take(set).enumerate() {
            tls::set(*key, (i + 1) as u64);
        }
    })
    .expect("worker spawn failed");
    worker.join();

    let mut destroyed = DESTROYED.lock().unwrap().clone();
    destroyed.sort_unstable();
    let expected: Vec<u64> = (1..=set as u64).collect();
    let pass = destroyed == expected;

    for key in keys {
        tls::delete(key);
    }

    Report {
        scenario: "tls-sweep",
        pass,
        details: json!({
            "slots": slots,
            "set": set,
            "destroyed": destroyed,
        }),
    }
}
