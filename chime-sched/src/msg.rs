//! Wire format of the control channel.
//!
//! Every command is one `#[repr(C)]` plain-data struct written down the pipe
//! in a single contiguous write: `[length][id][payload..]`, where `length`
//! counts the whole struct including itself. Ownership-transferring commands
//! carry a thin raw pointer produced by `Box::into_raw`; lookup commands
//! address worker state by device index or stream id.

use std::mem::{align_of, size_of};
use std::os::fd::RawFd;

use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert;

use chime_io::{DeviceIndex, Direction, RampRequest, StreamId};

use crate::error::Error;

/// Largest command accepted by the control channel.
pub const MAX_MSG_SIZE: usize = 256;

/// Most devices a single `AddStream` may target.
pub const MAX_ATTACH_DEVS: usize = 16;

/// Sentinel for "no device" in lookup payloads.
pub const NO_DEVICE: u32 = u32::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Zeroable, Pod)]
#[repr(transparent)]
pub struct CommandId(u32);

impl CommandId {
    pub const ADD_OPEN_DEV: CommandId = CommandId(0);
    pub const RM_OPEN_DEV: CommandId = CommandId(1);
    pub const IS_DEV_OPEN: CommandId = CommandId(2);
    pub const ADD_STREAM: CommandId = CommandId(3);
    pub const DISCONNECT_STREAM: CommandId = CommandId(4);
    pub const STOP: CommandId = CommandId(5);
    pub const DUMP_THREAD_INFO: CommandId = CommandId(6);
    pub const DRAIN_STREAM: CommandId = CommandId(7);
    pub const CONFIG_GLOBAL_REMIX: CommandId = CommandId(8);
    pub const DEV_START_RAMP: CommandId = CommandId(9);
    pub const ADD_CALLBACK: CommandId = CommandId(10);
    pub const ENABLE_CALLBACK: CommandId = CommandId(11);
    pub const REMOVE_CALLBACK: CommandId = CommandId(12);
    pub const AEC_DUMP: CommandId = CommandId(13);

    pub fn raw(self) -> u32 {
        self.0
    }
}

#[derive(Clone, Copy, Debug, Zeroable, Pod)]
#[repr(C)]
pub struct MsgHeader {
    pub length: usize,
    pub id: CommandId,
    pub _pad: u32,
}

impl MsgHeader {
    fn new<T>(id: CommandId) -> MsgHeader {
        MsgHeader {
            length: size_of::<T>(),
            id,
            _pad: 0,
        }
    }
}

/// `AddOpenDev`: transfers a `Box<Arc<dyn Iodev>>` to the worker raw.
#[derive(Clone, Copy, Debug, Zeroable, Pod)]
#[repr(C)]
pub struct OpenDevMsg {
    pub header: MsgHeader,
    pub dev: usize,
}

impl OpenDevMsg {
    pub fn new(dev: usize) -> OpenDevMsg {
        OpenDevMsg {
            header: MsgHeader::new::<OpenDevMsg>(CommandId::ADD_OPEN_DEV),
            dev,
        }
    }
}

/// `RmOpenDev` / `IsDevOpen`: addresses a device by index and direction.
#[derive(Clone, Copy, Debug, Zeroable, Pod)]
#[repr(C)]
pub struct DevLookupMsg {
    pub header: MsgHeader,
    pub dev_idx: u32,
    pub direction: u32,
}

impl DevLookupMsg {
    pub fn new(id: CommandId, dev: DeviceIndex, direction: Direction) -> DevLookupMsg {
        DevLookupMsg {
            header: MsgHeader::new::<DevLookupMsg>(id),
            dev_idx: dev.0,
            direction: direction.to_wire(),
        }
    }
}

/// `AddStream`: transfers a `Box<Arc<dyn Rstream>>` plus the target devices.
#[derive(Clone, Copy, Debug, Zeroable, Pod)]
#[repr(C)]
pub struct AddStreamMsg {
    pub header: MsgHeader,
    pub stream: usize,
    pub num_devs: u32,
    pub _pad: u32,
    pub devs: [u32; MAX_ATTACH_DEVS],
}

impl AddStreamMsg {
    pub fn new(stream: usize, devs: &[DeviceIndex]) -> AddStreamMsg {
        let mut msg = AddStreamMsg {
            header: MsgHeader::new::<AddStreamMsg>(CommandId::ADD_STREAM),
            stream,
            num_devs: devs.len() as u32,
            _pad: 0,
            devs: [0; MAX_ATTACH_DEVS],
        };
        for (slot, idx) in msg.devs.iter_mut().zip(devs) {
            *slot = idx.0;
        }
        msg
    }
}

/// `DisconnectStream` / `DrainStream`: addresses a stream already known to
/// the worker, optionally narrowed to one device.
#[derive(Clone, Copy, Debug, Zeroable, Pod)]
#[repr(C)]
pub struct StreamLookupMsg {
    pub header: MsgHeader,
    pub stream_id: u32,
    pub direction: u32,
    pub dev_idx: u32,
    pub _pad: u32,
}

impl StreamLookupMsg {
    pub fn new(
        id: CommandId,
        stream: StreamId,
        direction: Direction,
        dev: Option<DeviceIndex>,
    ) -> StreamLookupMsg {
        StreamLookupMsg {
            header: MsgHeader::new::<StreamLookupMsg>(id),
            stream_id: stream.0,
            direction: direction.to_wire(),
            dev_idx: dev.map_or(NO_DEVICE, |dev| dev.0),
            _pad: 0,
        }
    }
}

/// `DumpThreadInfo`: the controller's out-buffer, written through while the
/// controller blocks on the reply.
#[derive(Clone, Copy, Debug, Zeroable, Pod)]
#[repr(C)]
pub struct DumpMsg {
    pub header: MsgHeader,
    pub info: usize,
}

impl DumpMsg {
    pub fn new(info: usize) -> DumpMsg {
        DumpMsg {
            header: MsgHeader::new::<DumpMsg>(CommandId::DUMP_THREAD_INFO),
            info,
        }
    }
}

/// `ConfigGlobalRemix`: transfers a `Box<RemixConverter>` (or null for
/// "remove"); the reply carries the previous converter back.
#[derive(Clone, Copy, Debug, Zeroable, Pod)]
#[repr(C)]
pub struct ConfigRemixMsg {
    pub header: MsgHeader,
    pub conv: usize,
}

impl ConfigRemixMsg {
    pub fn new(conv: usize) -> ConfigRemixMsg {
        ConfigRemixMsg {
            header: MsgHeader::new::<ConfigRemixMsg>(CommandId::CONFIG_GLOBAL_REMIX),
            conv,
        }
    }
}

#[derive(Clone, Copy, Debug, Zeroable, Pod)]
#[repr(C)]
pub struct StartRampMsg {
    pub header: MsgHeader,
    pub dev_idx: u32,
    pub direction: u32,
    pub request: u32,
    pub _pad: u32,
}

impl StartRampMsg {
    pub fn new(dev: DeviceIndex, direction: Direction, request: RampRequest) -> StartRampMsg {
        StartRampMsg {
            header: MsgHeader::new::<StartRampMsg>(CommandId::DEV_START_RAMP),
            dev_idx: dev.0,
            direction: direction.to_wire(),
            request: request.to_wire(),
            _pad: 0,
        }
    }
}

/// `AddCallback`: transfers a `Box<ThreadCallback>` to the worker raw.
#[derive(Clone, Copy, Debug, Zeroable, Pod)]
#[repr(C)]
pub struct AddCallbackMsg {
    pub header: MsgHeader,
    pub fd: RawFd,
    pub is_write: u32,
    pub handler: usize,
}

impl AddCallbackMsg {
    pub fn new(fd: RawFd, is_write: bool, handler: usize) -> AddCallbackMsg {
        AddCallbackMsg {
            header: MsgHeader::new::<AddCallbackMsg>(CommandId::ADD_CALLBACK),
            fd,
            is_write: is_write as u32,
            handler,
        }
    }
}

#[derive(Clone, Copy, Debug, Zeroable, Pod)]
#[repr(C)]
pub struct EnableCallbackMsg {
    pub header: MsgHeader,
    pub fd: RawFd,
    pub enabled: u32,
}

impl EnableCallbackMsg {
    pub fn new(fd: RawFd, enabled: bool) -> EnableCallbackMsg {
        EnableCallbackMsg {
            header: MsgHeader::new::<EnableCallbackMsg>(CommandId::ENABLE_CALLBACK),
            fd,
            enabled: enabled as u32,
        }
    }
}

#[derive(Clone, Copy, Debug, Zeroable, Pod)]
#[repr(C)]
pub struct RmCallbackMsg {
    pub header: MsgHeader,
    pub fd: RawFd,
    pub _pad: u32,
}

impl RmCallbackMsg {
    pub fn new(fd: RawFd) -> RmCallbackMsg {
        RmCallbackMsg {
            header: MsgHeader::new::<RmCallbackMsg>(CommandId::REMOVE_CALLBACK),
            fd,
            _pad: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, Zeroable, Pod)]
#[repr(C)]
pub struct AecDumpMsg {
    pub header: MsgHeader,
    pub stream_id: u32,
    pub start: u32,
    pub fd: RawFd,
    pub _pad: u32,
}

impl AecDumpMsg {
    pub fn new(stream: StreamId, start: bool, fd: RawFd) -> AecDumpMsg {
        AecDumpMsg {
            header: MsgHeader::new::<AecDumpMsg>(CommandId::AEC_DUMP),
            stream_id: stream.0,
            start: start as u32,
            fd,
            _pad: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, Zeroable, Pod)]
#[repr(C)]
pub struct StopMsg {
    pub header: MsgHeader,
}

impl StopMsg {
    pub fn new() -> StopMsg {
        StopMsg {
            header: MsgHeader::new::<StopMsg>(CommandId::STOP),
        }
    }
}

impl Default for StopMsg {
    fn default() -> StopMsg {
        StopMsg::new()
    }
}

/// Receive buffer for one command, aligned for direct decoding.
#[derive(Clone, Copy)]
#[repr(C, align(8))]
pub struct MsgBuffer(pub [u8; MAX_MSG_SIZE]);

impl MsgBuffer {
    pub fn zeroed() -> MsgBuffer {
        MsgBuffer([0; MAX_MSG_SIZE])
    }

    pub fn header(&self) -> MsgHeader {
        *bytemuck::from_bytes(&self.0[..size_of::<MsgHeader>()])
    }

    /// Decode a whole command; `length` must match the expected struct
    /// exactly or the command is malformed.
    pub fn decode<T: Pod>(&self, length: usize) -> Result<T, Error> {
        if length != size_of::<T>() || length > MAX_MSG_SIZE {
            return Err(Error::InvalidArg);
        }
        Ok(*bytemuck::from_bytes(&self.0[..length]))
    }
}

const_assert!(size_of::<OpenDevMsg>() <= MAX_MSG_SIZE);
const_assert!(size_of::<DevLookupMsg>() <= MAX_MSG_SIZE);
const_assert!(size_of::<AddStreamMsg>() <= MAX_MSG_SIZE);
const_assert!(size_of::<StreamLookupMsg>() <= MAX_MSG_SIZE);
const_assert!(size_of::<DumpMsg>() <= MAX_MSG_SIZE);
const_assert!(size_of::<ConfigRemixMsg>() <= MAX_MSG_SIZE);
const_assert!(size_of::<StartRampMsg>() <= MAX_MSG_SIZE);
const_assert!(size_of::<AddCallbackMsg>() <= MAX_MSG_SIZE);
const_assert!(size_of::<EnableCallbackMsg>() <= MAX_MSG_SIZE);
const_assert!(size_of::<RmCallbackMsg>() <= MAX_MSG_SIZE);
const_assert!(size_of::<AecDumpMsg>() <= MAX_MSG_SIZE);
const_assert!(size_of::<StopMsg>() <= MAX_MSG_SIZE);
const_assert!(align_of::<AddStreamMsg>() <= align_of::<MsgBuffer>());
const_assert!(align_of::<MsgHeader>() <= align_of::<MsgBuffer>());
