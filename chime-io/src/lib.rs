pub mod device;
pub mod remix;
pub mod stream;
pub mod types;

pub use device::{DeviceError, Iodev, IodevInfo};
pub use remix::RemixConverter;
pub use stream::{AttachError, DevStream, Processing, Rstream};
pub use types::{AudioFormat, DeviceIndex, Direction, RampRequest, StreamId};
