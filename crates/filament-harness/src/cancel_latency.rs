//! Cancellation latency scenario.

use std::sync::Arc;
use std::time::{Duration, Instant};

use filament_core::{self as rt, Semaphore, SpawnOptions};
use serde_json::json;

use crate::Report;

/// Per-round bound for a cancelled waiter to terminate.
const PROMPT: Duration = Duration::from_millis(500);

/// Block a thread on an empty semaphore, cancel it, and measure how long
/// the cancel-to-join interval takes. Repeats for `rounds` rounds.
pub fn run(rounds: usize) -> Report {
    let mut latencies_us = Vec::with_capacity(rounds);
    let mut cancelled = 0usize;

    for _ in 0..rounds {
        let sem = Arc::new(Semaphore::new(0));
        let waiter = {
            let sem = Arc::clone(&sem);
            rt::spawn(SpawnOptions::default(), move || sem.wait())
                .expect("waiter spawn failed")
        };
        std::thread::sleep(Duration::from_millis(10));
        let start = Instant::now();
        waiter.request_cancel();
        if waiter.join().is_none() {
            cancelled += 1;
        }
        latencies_us.push(start.elapsed().as_micros() as u64);
    }

    let worst = latencies_us.iter().copied().max().unwrap_or(0);
    let pass = cancelled == rounds && worst < PROMPT.as_micros() as u64;
    Report {
        scenario: "cancel-latency",
        pass,
        details: json!({
            "rounds": rounds,
            "cancelled": cancelled,
            "worst_latency_us": worst,
            "latencies_us": latencies_us,
        }),
    }
}
