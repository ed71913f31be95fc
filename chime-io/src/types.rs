use derive_more::Display;

/// Stable identity of a device, assigned by the device layer.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceIndex(pub u32);

/// Stable identity of a client stream.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Output,
    Input,
}

impl Direction {
    pub const COUNT: usize = 2;

    /// Slot in the worker's direction-indexed device lists.
    pub fn index(self) -> usize {
        match self {
            Direction::Output => 0,
            Direction::Input => 1,
        }
    }

    pub fn to_wire(self) -> u32 {
        self.index() as u32
    }

    pub fn from_wire(raw: u32) -> Option<Direction> {
        match raw {
            0 => Some(Direction::Output),
            1 => Some(Direction::Input),
            _ => None,
        }
    }
}

/// Hardware-side sample format a device was configured with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AudioFormat {
    pub frame_rate: u32,
    pub num_channels: u32,
}

/// Gain ramp applied at start/stop to avoid audible artifacts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RampRequest {
    UpUnmute,
    DownMute,
    UpStartPlayback,
}

impl RampRequest {
    pub fn to_wire(self) -> u32 {
        match self {
            RampRequest::UpUnmute => 0,
            RampRequest::DownMute => 1,
            RampRequest::UpStartPlayback => 2,
        }
    }

    pub fn from_wire(raw: u32) -> Option<RampRequest> {
        match raw {
            0 => Some(RampRequest::UpUnmute),
            1 => Some(RampRequest::DownMute),
            2 => Some(RampRequest::UpStartPlayback),
            _ => None,
        }
    }
}
