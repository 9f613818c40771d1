//! Benchmark support for the filament runtime.

use std::sync::Once;

/// Install the runtime once for the whole bench process.
pub fn ensure_runtime() {
    static ONCE: Once = Once::new();
    ONCE.call_once(filament_core::init);
}
