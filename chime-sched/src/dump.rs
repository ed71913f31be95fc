//! Bounded copies of worker state returned by `DumpThreadInfo`.

use nix::sys::time::TimeSpec;

use chime_io::{DevStream, DeviceIndex, Direction, StreamId};

use crate::elog::Event;
use crate::open_dev::OpenDevice;

pub const MAX_DEBUG_DEVS: usize = 4;
pub const MAX_DEBUG_STREAMS: usize = 8;

#[derive(Clone, Debug)]
pub struct DeviceDebugInfo {
    pub dev_name: String,
    pub direction: Direction,
    pub buffer_size: u32,
    pub min_buffer_level: u32,
    pub min_cb_level: u32,
    pub max_cb_level: u32,
    pub frame_rate: u32,
    pub num_channels: u32,
    pub est_rate_ratio: f64,
    pub num_underruns: u32,
    pub num_severe_underruns: u32,
    pub highest_hw_level: u32,
}

impl DeviceDebugInfo {
    pub(crate) fn capture(od: &OpenDevice) -> DeviceDebugInfo {
        let fmt = od.dev.ext_format();

        DeviceDebugInfo {
            dev_name: od.dev.info().name,
            direction: od.dev.direction(),
            buffer_size: od.dev.buffer_size(),
            min_buffer_level: od.dev.min_buffer_level(),
            min_cb_level: od.dev.min_cb_level(),
            max_cb_level: od.dev.max_cb_level(),
            frame_rate: fmt.frame_rate,
            num_channels: fmt.num_channels,
            est_rate_ratio: od.dev.est_rate_ratio(),
            num_underruns: od.dev.num_underruns(),
            num_severe_underruns: od.dev.num_severe_underruns(),
            highest_hw_level: od.dev.highest_hw_level(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct StreamDebugInfo {
    pub stream_id: StreamId,
    pub dev_idx: DeviceIndex,
    pub direction: Direction,
    pub buffer_frames: u32,
    pub cb_threshold: u32,
    pub frame_rate: u32,
    pub num_channels: u32,
    pub longest_fetch: TimeSpec,
    pub num_overruns: u32,
    pub effects: u64,
}

impl StreamDebugInfo {
    pub(crate) fn capture(ds: &dyn DevStream, dev_idx: DeviceIndex) -> StreamDebugInfo {
        let stream = ds.stream();
        let fmt = stream.format();

        StreamDebugInfo {
            stream_id: stream.id(),
            dev_idx,
            direction: stream.direction(),
            buffer_frames: stream.buffer_frames(),
            cb_threshold: stream.cb_threshold(),
            frame_rate: fmt.frame_rate,
            num_channels: fmt.num_channels,
            longest_fetch: stream.longest_fetch(),
            num_overruns: stream.num_overruns(),
            effects: stream.processing().map_or(0, |p| p.effects()),
        }
    }
}

/// Controller-owned out-buffer filled by the worker during the dump round
/// trip.
#[derive(Clone, Debug)]
pub struct AudioDebugInfo {
    pub devs: Vec<DeviceDebugInfo>,
    pub streams: Vec<StreamDebugInfo>,
    pub log: Vec<Event>,
    /// Longest wall-time between two successive wakes since the last dump.
    pub longest_wake: TimeSpec,
}

impl AudioDebugInfo {
    pub fn new() -> AudioDebugInfo {
        AudioDebugInfo {
            devs: Vec::new(),
            streams: Vec::new(),
            log: Vec::new(),
            longest_wake: chime_clock::zero(),
        }
    }
}

impl Default for AudioDebugInfo {
    fn default() -> AudioDebugInfo {
        AudioDebugInfo::new()
    }
}
