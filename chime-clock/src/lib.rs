//! Monotonic clock reads and frame/time conversions shared by the scheduler.

use nix::sys::time::TimeSpec;
use nix::time::ClockId;

pub fn now() -> TimeSpec {
    nix::time::clock_gettime(ClockId::CLOCK_MONOTONIC_RAW)
        .expect("clock_gettime(CLOCK_MONOTONIC_RAW) failed, are we on Linux?")
}

pub fn zero() -> TimeSpec {
    TimeSpec::new(0, 0)
}

/// Whole milliseconds covered by `frames` at `frame_rate`.
pub fn frames_to_ms(frames: u32, frame_rate: u32) -> i32 {
    if frame_rate == 0 {
        return 0;
    }

    (u64::from(frames) * 1000 / u64::from(frame_rate)) as i32
}

/// Relative time from `now` until `deadline`, clamped at zero for deadlines
/// already in the past.
pub fn until(deadline: TimeSpec, now: TimeSpec) -> TimeSpec {
    if deadline > now {
        deadline - now
    } else {
        zero()
    }
}
