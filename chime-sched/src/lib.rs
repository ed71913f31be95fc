//! Real-time audio io scheduler core.
//!
//! One dedicated high-priority worker services every open capture and
//! playback device and the per-stream clients attached to them. Each loop
//! iteration advances device io, picks the next wake-up deadline across all
//! stream and hardware clocks, multiplexes on the control channel plus any
//! registered descriptors, and dispatches whatever became ready.
//!
//! The controller thread drives the worker over a pair of pipes carrying
//! length-prefixed commands. Every command is a strict request/response
//! round trip: once a [`Worker`] method returns, the worker has handled the
//! command and the caller may immediately free whatever it referenced.

mod codec;
mod handle;
mod rt;
mod wake;
mod worker;

pub mod dump;
pub mod elog;
pub mod error;
pub mod msg;
pub mod open_dev;
pub mod registry;

pub use dump::{AudioDebugInfo, DeviceDebugInfo, StreamDebugInfo, MAX_DEBUG_DEVS, MAX_DEBUG_STREAMS};
pub use elog::{Event, EventLog, EventTag, EVENT_LOG_SIZE};
pub use error::Error;
pub use handle::Worker;
pub use open_dev::{detach_stream, DevIo, OpenDevice};
pub use registry::{CallbackDirection, CallbackRegistry, ThreadCallback};
