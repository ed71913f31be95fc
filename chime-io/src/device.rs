use thiserror::Error;

use crate::types::{AudioFormat, DeviceIndex, Direction, RampRequest, StreamId};

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum DeviceError {
    #[error("device is not open")]
    NotOpen,
    #[error("device io failed")]
    Io,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IodevInfo {
    pub idx: DeviceIndex,
    pub name: String,
}

/// Capability set the scheduler requires from a device.
///
/// The scheduler never touches hardware itself; everything it needs from the
/// device layer goes through this trait. Implementations are shared with the
/// controller thread and must tolerate calls from the worker at any time
/// between `AddOpenDev` and `RmOpenDev`.
pub trait Iodev: Send + Sync {
    fn direction(&self) -> Direction;
    fn info(&self) -> IodevInfo;

    fn buffer_size(&self) -> u32;
    fn min_buffer_level(&self) -> u32;
    fn min_cb_level(&self) -> u32;
    fn max_cb_level(&self) -> u32;
    fn ext_format(&self) -> AudioFormat;

    fn is_open(&self) -> bool;

    /// True when the hardware clock itself demands a wake-up, independent of
    /// any stream deadline.
    fn odev_should_wake(&self) -> bool;

    /// Discard buffered capture samples, returning the number flushed.
    fn flush_buffer(&self) -> Result<u32, DeviceError>;

    fn start_ramp(&self, request: RampRequest) -> Result<(), DeviceError>;

    /// Write `frames` frames of silence into the playback buffer.
    fn fill_zeros(&self, frames: u32) -> Result<(), DeviceError>;

    /// Bookkeeping notification that a stream was bound to this device.
    fn attach_stream(&self, stream: StreamId);
    fn detach_stream(&self, stream: StreamId);

    /// Device-side read offset recorded for a bound stream.
    fn stream_offset(&self, stream: StreamId) -> u32;

    /// Record `frames` as already consumed on behalf of a bound stream.
    fn stream_written(&self, stream: StreamId, frames: u32);

    fn num_underruns(&self) -> u32;
    fn num_severe_underruns(&self) -> u32;
    fn highest_hw_level(&self) -> u32;
    fn est_rate_ratio(&self) -> f64;
}
