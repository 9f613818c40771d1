//! Scenario implementations for the filament conformance harness.
//!
//! Every scenario returns a [`Report`] with a machine-checkable pass flag
//! and scenario-specific detail values.

use serde::Serialize;

pub mod cancel_latency;
pub mod counter;
pub mod timer_cancel;
pub mod tls_sweep;

#[derive(Debug, Serialize)]
pub struct Report {
    pub scenario: &'static str,
    pub pass: bool,
    pub details: serde_json::Value,
}
