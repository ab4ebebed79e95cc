//! Clock abstraction (spec §4.1).
//!
//! Two modes are supported: [`ClockMode::Wall`] (a monotonic clock shared
//! across threads) and [`ClockMode::Cpu`] (per-thread CPU time). All
//! internal accounting works in raw integer ticks; conversion to seconds
//! happens only at presentation time, in [`Clock::ticks_to_seconds`].

use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Number of ticks the clock reports per second of wall/CPU time.
///
/// Both backends are implemented with nanosecond-resolution sources, so a
/// tick is one nanosecond in both modes. Keeping this fixed means merges
/// across wall and CPU stores would be numerically comparable, even though
/// §4.6 still forbids mixing them (`ClockModeMismatch`).
pub const TICKS_PER_SECOND: u64 = 1_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClockMode {
    Wall,
    Cpu,
}

impl ClockMode {
    pub fn as_tag(self) -> u8 {
        match self {
            ClockMode::Wall => 0,
            ClockMode::Cpu => 1,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(ClockMode::Wall),
            1 => Some(ClockMode::Cpu),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ClockMode::Wall => "wall",
            ClockMode::Cpu => "cpu",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "wall" => Some(ClockMode::Wall),
            "cpu" => Some(ClockMode::Cpu),
            _ => None,
        }
    }
}

/// Information about the active clock's underlying OS facility, mirroring
/// yappi's `get_clock_info()`.
#[derive(Debug, Clone)]
pub struct ClockInfo {
    pub api_name: &'static str,
    pub resolution_seconds: f64,
}

/// Reads "now" in the active clock mode.
///
/// `WALL` is backed by [`std::time::Instant`], which is monotonic and
/// comparable across threads on every platform Rust supports. `CPU` is
/// backed by `clock_gettime(CLOCK_THREAD_CPUTIME_ID, ..)` on unix, which
/// reports time consumed by the calling OS thread specifically (not the
/// process): exactly the per-thread semantics §4.1 requires.
pub struct Clock {
    mode: ClockMode,
    wall_origin: Instant,
}

impl Clock {
    pub fn new(mode: ClockMode) -> Self {
        Self {
            mode,
            wall_origin: Instant::now(),
        }
    }

    pub fn mode(&self) -> ClockMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: ClockMode) {
        self.mode = mode;
        self.wall_origin = Instant::now();
    }

    pub fn tick(&self) -> u64 {
        match self.mode {
            ClockMode::Wall => self.wall_origin.elapsed().as_nanos() as u64,
            ClockMode::Cpu => thread_cpu_time_ns(),
        }
    }

    pub fn info(&self) -> ClockInfo {
        match self.mode {
            ClockMode::Wall => ClockInfo {
                api_name: "std::time::Instant",
                resolution_seconds: instant_resolution_seconds(),
            },
            ClockMode::Cpu => ClockInfo {
                api_name: cpu_clock_api_name(),
                resolution_seconds: cpu_clock_resolution_seconds(),
            },
        }
    }

    pub fn ticks_to_seconds(ticks: u64) -> f64 {
        ticks as f64 / TICKS_PER_SECOND as f64
    }
}

#[cfg(unix)]
fn thread_cpu_time_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid, local `timespec` and `CLOCK_THREAD_CPUTIME_ID`
    // always refers to the calling thread's own CPU clock.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_THREAD_CPUTIME_ID, &mut ts) };
    if rc != 0 {
        return 0;
    }
    ts.tv_sec as u64 * TICKS_PER_SECOND + ts.tv_nsec as u64
}

#[cfg(not(unix))]
fn thread_cpu_time_ns() -> u64 {
    // No portable per-thread CPU clock outside unix; fall back to wall time
    // so the profiler still produces monotonically increasing ticks.
    static FALLBACK_ORIGIN: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    FALLBACK_ORIGIN
        .get_or_init(Instant::now)
        .elapsed()
        .as_nanos() as u64
}

#[cfg(unix)]
fn cpu_clock_api_name() -> &'static str {
    "clock_gettime(CLOCK_THREAD_CPUTIME_ID)"
}

#[cfg(not(unix))]
fn cpu_clock_api_name() -> &'static str {
    "std::time::Instant (no per-thread CPU clock on this platform)"
}

#[cfg(unix)]
fn cpu_clock_resolution_seconds() -> f64 {
    clock_getres_seconds(libc::CLOCK_THREAD_CPUTIME_ID)
}

#[cfg(not(unix))]
fn cpu_clock_resolution_seconds() -> f64 {
    instant_resolution_seconds()
}

#[cfg(unix)]
fn clock_getres_seconds(clock_id: libc::clockid_t) -> f64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid, local `timespec`.
    let rc = unsafe { libc::clock_getres(clock_id, &mut ts) };
    if rc != 0 {
        return 1.0 / TICKS_PER_SECOND as f64;
    }
    ts.tv_sec as f64 + ts.tv_nsec as f64 / TICKS_PER_SECOND as f64
}

fn instant_resolution_seconds() -> f64 {
    #[cfg(unix)]
    {
        clock_getres_seconds(libc::CLOCK_MONOTONIC)
    }
    #[cfg(not(unix))]
    {
        1.0 / TICKS_PER_SECOND as f64
    }
}
