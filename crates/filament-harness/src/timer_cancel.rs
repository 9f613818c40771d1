//! Timer cancel-before-fire scenario.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use filament_core::{FireTime, Timer};
use serde_json::json;

use crate::Report;

/// Schedule a one-shot timer `delay_ms` out, cancel it immediately, and
/// verify the callback never executes.
pub fn run(delay_ms: u64) -> Report {
    let fired = Arc::new(AtomicUsize::new(0));
    let count = Arc::clone(&fired);
    let timer = Timer::new(move || {
        count.fetch_add(1, Ordering::SeqCst);
    });

    timer.schedule(FireTime::Relative, (delay_ms * 1000) as i64, 0);
    timer.disarm();
    std::thread::sleep(Duration::from_millis(delay_ms * 3));

    let observed = fired.load(Ordering::SeqCst);
    Report {
        scenario: "timer-cancel",
        pass: observed == 0,
        details: json!({
            "delay_ms": delay_ms,
            "fired": observed,
        }),
    }
}
