use std::os::fd::RawFd;
use std::sync::Arc;

use nix::sys::time::TimeSpec;
use thiserror::Error;

use crate::device::Iodev;
use crate::types::{AudioFormat, DeviceIndex, Direction, StreamId};

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("stream could not bind to device {dev}")]
pub struct AttachError {
    pub dev: DeviceIndex,
}

/// Optional per-stream processing chain (echo cancellation and friends).
pub trait Processing: Send + Sync {
    fn set_aec_dump(&self, dev: &dyn Iodev, start: bool, fd: RawFd);

    fn effects(&self) -> u64 {
        0
    }
}

/// A client stream as the scheduler sees it: identity, scheduling knobs and
/// the shared-memory level, but none of the sample plumbing.
pub trait Rstream: Send + Sync {
    fn id(&self) -> StreamId;
    fn direction(&self) -> Direction;
    fn format(&self) -> AudioFormat;

    /// Smallest number of frames the client requires before wake-up.
    fn cb_threshold(&self) -> u32;
    fn buffer_frames(&self) -> u32;

    /// Frames currently sitting in the shared-memory buffer.
    fn frames_queued(&self) -> u32;
    fn num_overruns(&self) -> u32;

    fn is_draining(&self) -> bool;
    fn set_draining(&self, draining: bool);

    /// Read offset recorded against one device, kept aligned across devices
    /// capturing into the same stream.
    fn dev_offset(&self, dev: DeviceIndex) -> u32;
    fn update_dev_offset(&self, offset: u32, dev: DeviceIndex);

    fn longest_fetch(&self) -> TimeSpec;

    fn processing(&self) -> Option<&dyn Processing> {
        None
    }

    /// Build the per-device binding used while this stream is attached to
    /// `dev`. The scheduler owns the returned binding until the stream is
    /// detached.
    fn attach(
        self: Arc<Self>,
        dev_idx: DeviceIndex,
        fmt: AudioFormat,
        dev: &dyn Iodev,
        init_cb_ts: TimeSpec,
    ) -> Result<Box<dyn DevStream>, AttachError>;
}

/// The binding between one stream and one device, carrying the per-device
/// scheduling state the wake planner reads.
pub trait DevStream: Send {
    fn stream(&self) -> &Arc<dyn Rstream>;

    /// Absolute monotonic time this stream next needs servicing, if it has a
    /// schedule at all yet.
    fn next_cb_ts(&self) -> Option<TimeSpec>;

    fn can_fetch(&self) -> bool;

    /// Descriptor to include in the worker's multiplexed wait, if any.
    fn poll_fd(&self) -> Option<RawFd>;

    /// Frames still owed to the device by a draining playback stream.
    fn playback_frames(&self) -> i64;
}
