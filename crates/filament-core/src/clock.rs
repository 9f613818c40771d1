//! Monotonic clock source, selected once per process.
//!
//! A single tagged backend serves every `now()` call for the process's
//! lifetime. The first call lazily picks the default under a dedicated lock;
//! an explicit [`select_source`] after any serviced call is rejected, since
//! reselection would break the monotonicity guarantee callers rely on.
//!
//! Ticks are microseconds ([`CLOCK_FREQ`] per second).

use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::Mutex;

/// Monotonic tick in microseconds.
pub type Tick = i64;

/// Ticks per second.
pub const CLOCK_FREQ: Tick = 1_000_000;

/// Selectable clock backends.
///
/// `wall` can jump backward with the system clock and is only useful for
/// diagnosing clock problems; everything else is monotone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockBackend {
    /// Time including suspend, where the host distinguishes it.
    Interrupt,
    /// Coarse scheduler-tick resolution, cheapest to read.
    TickCount,
    /// High-resolution monotonic counter (default).
    Perf,
    /// Wall clock.
    Wall,
}

impl ClockBackend {
    /// Configuration name of this backend.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            ClockBackend::Interrupt => "interrupt",
            ClockBackend::TickCount => "tick",
            ClockBackend::Perf => "perf",
            ClockBackend::Wall => "wall",
        }
    }

    /// Parse a configuration name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "interrupt" => Some(ClockBackend::Interrupt),
            "tick" => Some(ClockBackend::TickCount),
            "perf" => Some(ClockBackend::Perf),
            "wall" => Some(ClockBackend::Wall),
            _ => None,
        }
    }

    const fn tag(self) -> u8 {
        match self {
            ClockBackend::Interrupt => 1,
            ClockBackend::TickCount => 2,
            ClockBackend::Perf => 3,
            ClockBackend::Wall => 4,
        }
    }

    fn from_tag(tag: u8) -> Self {
        match tag {
            1 => ClockBackend::Interrupt,
            2 => ClockBackend::TickCount,
            3 => ClockBackend::Perf,
            4 => ClockBackend::Wall,
            _ => unreachable!("invalid clock backend tag"),
        }
    }
}

struct SelectState {
    backend: ClockBackend,
    explicit: bool,
    serviced: bool,
}

/// Selection-once slot, owned by the runtime context.
pub(crate) struct ClockSlot {
    select: Mutex<SelectState>,
    /// 0 until some backend has serviced a call, then `backend.tag()`.
    cached: AtomicU8,
}

impl ClockSlot {
    pub(crate) fn new() -> Self {
        Self {
            select: Mutex::new(SelectState {
                backend: ClockBackend::Perf,
                explicit: false,
                serviced: false,
            }),
            cached: AtomicU8::new(0),
        }
    }

    pub(crate) fn now(&self) -> Tick {
        let tag = self.cached.load(Ordering::Acquire);
        if tag != 0 {
            return read(ClockBackend::from_tag(tag));
        }
        // First call: commit the default under the selection lock so a
        // racing explicit selection cannot change the backend afterwards.
        let backend = {
            let mut state = self.select.lock();
            state.serviced = true;
            self.cached.store(state.backend.tag(), Ordering::Release);
            state.backend
        };
        read(backend)
    }

    pub(crate) fn select(&self, name: &str) {
        let Some(backend) = ClockBackend::from_name(name) else {
            // Configuration error, not recoverable.
            panic!("invalid clock source {name:?}");
        };
        let mut state = self.select.lock();
        if state.explicit {
            return;
        }
        assert!(
            !state.serviced,
            "clock source selected after the clock was already used"
        );
        state.backend = backend;
        state.explicit = true;
        state.serviced = true;
        self.cached.store(backend.tag(), Ordering::Release);
        log::debug!("using {} as clock source", backend.name());
    }
}

#[cfg(target_os = "linux")]
const CLOCK_ID_INTERRUPT: libc::clockid_t = libc::CLOCK_BOOTTIME;
#[cfg(all(unix, not(target_os = "linux")))]
const CLOCK_ID_INTERRUPT: libc::clockid_t = libc::CLOCK_MONOTONIC;
#[cfg(target_os = "linux")]
const CLOCK_ID_TICK: libc::clockid_t = libc::CLOCK_MONOTONIC_COARSE;
#[cfg(all(unix, not(target_os = "linux")))]
const CLOCK_ID_TICK: libc::clockid_t = libc::CLOCK_MONOTONIC;

#[cfg(unix)]
fn read(backend: ClockBackend) -> Tick {
    let id = match backend {
        ClockBackend::Interrupt => CLOCK_ID_INTERRUPT,
        ClockBackend::TickCount => CLOCK_ID_TICK,
        ClockBackend::Perf => libc::CLOCK_MONOTONIC,
        ClockBackend::Wall => libc::CLOCK_REALTIME,
    };
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid out-pointer for the duration of the call.
    let rc = unsafe { libc::clock_gettime(id, &mut ts) };
    if rc != 0 {
        // The runtime's correctness proof assumes the selected clock works.
        std::process::abort();
    }
    (ts.tv_sec as Tick) * CLOCK_FREQ + (ts.tv_nsec as Tick) / 1_000
}

#[cfg(not(unix))]
fn read(backend: ClockBackend) -> Tick {
    use std::sync::OnceLock;
    use std::time::{Instant, SystemTime, UNIX_EPOCH};

    static EPOCH: OnceLock<Instant> = OnceLock::new();
    match backend {
        ClockBackend::Wall => SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as Tick)
            .unwrap_or(0),
        _ => EPOCH.get_or_init(Instant::now).elapsed().as_micros() as Tick,
    }
}

/// Current tick of the selected clock source.
///
/// Non-decreasing across arbitrarily many concurrent callers for the
/// lifetime of one selection.
#[must_use]
pub fn now() -> Tick {
    crate::runtime::handle().clock.now()
}

/// Explicitly select the clock source by configuration name.
///
/// A no-op if an explicit selection already happened. Fatal if `name` is
/// unknown, or if the clock has already serviced a call (selection races
/// are rejected, not resolved).
pub fn select_source(name: &str) {
    crate::runtime::handle().clock.select(name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ensure_runtime;

    #[test]
    fn backend_names_roundtrip() {
        for backend in [
            ClockBackend::Interrupt,
            ClockBackend::TickCount,
            ClockBackend::Perf,
            ClockBackend::Wall,
        ] {
            assert_eq!(ClockBackend::from_name(backend.name()), Some(backend));
        }
        assert_eq!(ClockBackend::from_name("multimedia"), None);
        assert_eq!(ClockBackend::from_name(""), None);
    }

    #[test]
    fn now_is_nondecreasing() {
        ensure_runtime();
        let mut last = now();
        for _ in 0..10_000 {
            let tick = now();
            assert!(tick >= last, "clock went backward: {tick} < {last}");
            last = tick;
        }
    }

    #[test]
    fn now_advances() {
        ensure_runtime();
        let start = now();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(now() > start);
    }
}
