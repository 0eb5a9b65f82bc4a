/// A monotonic high-resolution timestamp source.
///
/// Only the difference of two readings is meaningful. Implementations are
/// called from the SIGCHLD handler and must be async-signal-safe.
pub trait Clock {
    fn now(&self) -> u64;
}

/// `CLOCK_MONOTONIC_RAW` in nanoseconds. Not subject to NTP slewing, and
/// `clock_gettime` is on the async-signal-safe list.
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> u64 {
        get_clock_value(libc::CLOCK_MONOTONIC_RAW)
    }
}

pub fn get_clock_value(clock_id: libc::clockid_t) -> u64 {
    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    if unsafe { libc::clock_gettime(clock_id, &mut ts) } != 0 {
        return 0;
    }
    (ts.tv_sec as u64 * 1_000_000_000) + ts.tv_nsec as u64
}
