//! Open devices and the external io pump they are serviced by.

use std::sync::Arc;

use nix::sys::time::TimeSpec;

use chime_io::{DevStream, DeviceIndex, Iodev, RemixConverter, StreamId};

use crate::error::Error;

/// A device currently serviced by the worker.
pub struct OpenDevice {
    pub dev: Arc<dyn Iodev>,
    /// Hardware-clock wake deadline, maintained by the io pump.
    pub wake_ts: TimeSpec,
    /// Bindings in attach order. The first entry holds the canonical read
    /// offset that later attachments on an input device align to.
    pub streams: Vec<Box<dyn DevStream>>,
}

impl OpenDevice {
    pub fn new(dev: Arc<dyn Iodev>) -> OpenDevice {
        OpenDevice {
            dev,
            wake_ts: chime_clock::zero(),
            streams: Vec::new(),
        }
    }

    pub fn idx(&self) -> DeviceIndex {
        self.dev.info().idx
    }

    pub fn has_stream(&self, stream: StreamId) -> bool {
        self.streams.iter().any(|ds| ds.stream().id() == stream)
    }
}

/// The device-io pump the worker drives once per iteration, plus the
/// input-side scheduling and unbinding it owns. Supplied by the device
/// layer; the worker is the only caller.
pub trait DevIo: Send {
    /// Advance io on every open device: fill playback buffers, drain
    /// capture buffers, update hardware wake deadlines.
    fn run(
        &mut self,
        output: &mut [OpenDevice],
        input: &mut [OpenDevice],
        remix: Option<&RemixConverter>,
    );

    /// Fold the input-side wake deadlines into `min_ts`, returning how many
    /// wakers were considered.
    fn next_input_wake(&mut self, input: &mut [OpenDevice], min_ts: &mut TimeSpec) -> usize;

    /// Unbind `stream` from one device, or from every device when `dev` is
    /// `None`.
    fn remove_stream(
        &mut self,
        devs: &mut Vec<OpenDevice>,
        stream: StreamId,
        dev: Option<DeviceIndex>,
    ) -> Result<(), Error> {
        detach_stream(devs, stream, dev)
    }

    /// The loop went through consecutive zero-length sleeps.
    fn busy_loop(&mut self) {
        log::warn!("audio worker busy loop detected");
    }
}

/// Default unbind used by [`DevIo::remove_stream`].
pub fn detach_stream(
    devs: &mut [OpenDevice],
    stream: StreamId,
    dev: Option<DeviceIndex>,
) -> Result<(), Error> {
    for od in devs.iter_mut() {
        if dev.is_some_and(|idx| idx != od.idx()) {
            continue;
        }

        if let Some(pos) = od.streams.iter().position(|ds| ds.stream().id() == stream) {
            od.dev.detach_stream(stream);
            od.streams.remove(pos);
        }
    }

    Ok(())
}
