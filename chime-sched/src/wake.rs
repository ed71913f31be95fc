//! Next wake-up selection across stream deadlines and hardware clocks.

use nix::sys::time::TimeSpec;

use crate::elog::{EventLog, EventTag};
use crate::open_dev::{DevIo, OpenDevice};

/// Upper bound on a single sleep.
const MAX_SLEEP_SECS: i64 = 20;

/// Consecutive zero-length sleeps tolerated before the busy-loop signal.
const MAX_CONTINUOUS_ZERO_SLEEP: u32 = 2;

pub(crate) struct WakePlan {
    /// Relative sleep interval, clamped to `[0, 20 s]`.
    pub ts: TimeSpec,
    /// False when nothing holds a deadline; the wait is then unbounded and
    /// only descriptor readiness ends it.
    pub bounded: bool,
}

pub(crate) fn next_wake(
    output: &[OpenDevice],
    input: &mut [OpenDevice],
    dev_io: &mut dyn DevIo,
    elog: &mut EventLog,
    now: TimeSpec,
) -> WakePlan {
    let mut min_ts = now + TimeSpec::new(MAX_SLEEP_SECS, 0);
    let mut wakers = 0;

    for od in output {
        for ds in &od.streams {
            if ds.stream().is_draining() && ds.playback_frames() <= 0 {
                continue;
            }
            if !ds.can_fetch() {
                continue;
            }
            let Some(cb_ts) = ds.next_cb_ts() else {
                continue;
            };

            elog.push(
                EventTag::StreamSleepTime,
                [
                    ds.stream().id().0,
                    cb_ts.tv_sec() as u32,
                    cb_ts.tv_nsec() as u32,
                ],
            );
            if cb_ts < min_ts {
                min_ts = cb_ts;
            }
            wakers += 1;
        }
    }

    for od in output {
        if !od.dev.odev_should_wake() {
            continue;
        }

        if od.wake_ts < min_ts {
            min_ts = od.wake_ts;
        }
        wakers += 1;
    }

    wakers += dev_io.next_input_wake(input, &mut min_ts);

    WakePlan {
        ts: chime_clock::until(min_ts, now),
        bounded: wakers > 0,
    }
}

/// Counts consecutive zero-length sleeps; the signal fires exactly when the
/// streak reaches the limit.
#[derive(Default)]
pub(crate) struct BusyLoopDetector {
    zeros: u32,
}

impl BusyLoopDetector {
    pub fn check(&mut self, ts: TimeSpec) -> bool {
        if ts == chime_clock::zero() {
            self.zeros += 1;
            self.zeros == MAX_CONTINUOUS_ZERO_SLEEP
        } else {
            self.zeros = 0;
            false
        }
    }
}
