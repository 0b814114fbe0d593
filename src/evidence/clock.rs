//! Independent time sources and sleep-drift measurement.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const PROC_UPTIME: &str = "/proc/uptime";

/// A clock that can be sampled before and after a sleep
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockSource {
    /// CLOCK_MONOTONIC
    Monotonic,
    /// Wall clock (CLOCK_REALTIME)
    Realtime,
    /// sysinfo(2) uptime, whole seconds
    SysinfoUptime,
    /// First field of /proc/uptime, centiseconds
    ProcUptime,
}

impl ClockSource {
    /// Current reading, or `None` when the source cannot be read
    pub fn read(self) -> Option<Duration> {
        match self {
            ClockSource::Monotonic => monotonic_now(),
            ClockSource::Realtime => SystemTime::now().duration_since(UNIX_EPOCH).ok(),
            ClockSource::SysinfoUptime => sysinfo_uptime(),
            ClockSource::ProcUptime => proc_uptime(Path::new(PROC_UPTIME)),
        }
    }

    /// Smallest step the source can express
    pub fn granularity(self) -> Duration {
        match self {
            ClockSource::Monotonic | ClockSource::Realtime => Duration::from_micros(1),
            ClockSource::SysinfoUptime => Duration::from_secs(1),
            ClockSource::ProcUptime => Duration::from_millis(10),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ClockSource::Monotonic => "monotonic",
            ClockSource::Realtime => "realtime",
            ClockSource::SysinfoUptime => "sysinfo_uptime",
            ClockSource::ProcUptime => "proc_uptime",
        }
    }
}

/// Elapsed time reported by two clocks across one blocking sleep
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DriftMeasurement {
    pub requested: Duration,
    pub elapsed_a: Option<Duration>,
    pub elapsed_b: Option<Duration>,
}

impl DriftMeasurement {
    /// Whether either clock advanced less than `requested - tolerance`.
    /// `None` when a clock could not be read.
    pub fn accelerated(&self, tolerance: Duration) -> Option<bool> {
        let floor = self.requested.saturating_sub(tolerance);
        let a = self.elapsed_a?;
        let b = self.elapsed_b?;
        Some(a < floor || b < floor)
    }
}

/// Sample `clock_a` and `clock_b`, sleep for `sleep`, sample again
///
/// Never fails: an unreadable source (or one that went backwards) yields `None`
/// for its delta.
pub fn measure_drift_under_sleep(
    sleep: Duration,
    clock_a: ClockSource,
    clock_b: ClockSource,
) -> DriftMeasurement {
    let start_a = clock_a.read();
    let start_b = clock_b.read();
    std::thread::sleep(sleep);
    let end_a = clock_a.read();
    let end_b = clock_b.read();

    DriftMeasurement {
        requested: sleep,
        elapsed_a: delta(start_a, end_a),
        elapsed_b: delta(start_b, end_b),
    }
}

fn delta(start: Option<Duration>, end: Option<Duration>) -> Option<Duration> {
    end?.checked_sub(start?)
}

fn monotonic_now() -> Option<Duration> {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid out-parameter.
    if unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) } != 0 {
        return None;
    }
    Some(Duration::new(
        u64::try_from(ts.tv_sec).ok()?,
        u32::try_from(ts.tv_nsec).ok()?,
    ))
}

fn sysinfo_uptime() -> Option<Duration> {
    // SAFETY: zeroed sysinfo is a valid out-parameter.
    let mut info: libc::sysinfo = unsafe { std::mem::zeroed() };
    if unsafe { libc::sysinfo(&mut info) } != 0 {
        return None;
    }
    u64::try_from(info.uptime).ok().map(Duration::from_secs)
}

fn proc_uptime(path: &Path) -> Option<Duration> {
    let contents = std::fs::read_to_string(path).ok()?;
    parse_proc_uptime(&contents)
}

/// Parse the first field of /proc/uptime ("12345.67 54321.00")
pub fn parse_proc_uptime(contents: &str) -> Option<Duration> {
    let seconds: f64 = contents.split_whitespace().next()?.parse().ok()?;
    Duration::try_from_secs_f64(seconds).ok()
}
