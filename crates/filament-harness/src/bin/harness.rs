//! CLI entrypoint for the filament conformance harness.
//!
//! Each subcommand runs one runtime scenario end-to-end and prints a JSON
//! verdict; the exit code reflects the pass flag so CI can gate on it.

use clap::{Parser, Subcommand};

use filament_harness::{cancel_latency, counter, timer_cancel, tls_sweep};

/// Conformance tooling for the filament runtime.
#[derive(Debug, Parser)]
#[command(name = "filament-harness")]
#[command(about = "Conformance and stress harness for the filament runtime")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// N threads × M increments under one mutex; verifies mutual exclusion.
    Counter {
        #[arg(long, default_value_t = 100)]
        threads: usize,
        #[arg(long, default_value_t = 1000)]
        increments: usize,
    },
    /// Cancel threads blocked on a semaphore and report wake latency.
    CancelLatency {
        #[arg(long, default_value_t = 16)]
        rounds: usize,
    },
    /// Schedule a timer and cancel it before it fires.
    TimerCancel {
        /// First-fire delay in milliseconds.
        #[arg(long, default_value_t = 50)]
        delay_ms: u64,
    },
    /// Thread-local destructor sweep exactness.
    TlsSweep {
        #[arg(long, default_value_t = 3)]
        slots: usize,
        /// How many of the slots get a value before thread exit.
        #[arg(long, default_value_t = 2)]
        set: usize,
    },
}

fn main() {
    filament_core::init();
    let cli = Cli::parse();
    let report = match cli.command {
        Command::Counter {
            threads,
            increments,
        } => counter::run(threads, increments),
        Command::CancelLatency { rounds } => cancel_latency::run(rounds),
        Command::TimerCancel { delay_ms } => timer_cancel::run(delay_ms),
        Command::TlsSweep { slots, set } => tls_sweep::run(slots, set),
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&report).expect("report serialization failed")
    );
    std::process::exit(i32::from(!report.pass));
}
