//! Controller-side handle: lifecycle plus the synchronous command surface.

use std::os::fd::RawFd;
use std::sync::Arc;
use std::thread::JoinHandle;

use bytemuck::Pod;

use chime_io::{DeviceIndex, Iodev, RampRequest, RemixConverter, Rstream, StreamId};

use crate::codec::{control_pair, ControllerPipe};
use crate::dump::AudioDebugInfo;
use crate::error::Error;
use crate::msg::{
    AddCallbackMsg, AddStreamMsg, AecDumpMsg, CommandId, ConfigRemixMsg, DevLookupMsg, DumpMsg,
    EnableCallbackMsg, OpenDevMsg, RmCallbackMsg, StartRampMsg, StopMsg, StreamLookupMsg,
    MAX_ATTACH_DEVS,
};
use crate::open_dev::DevIo;
use crate::registry::{CallbackDirection, ThreadCallback};
use crate::worker::WorkerTask;

enum State {
    Created,
    Started,
    Stopped,
}

/// Handle to the scheduler worker, held by the controller thread.
///
/// Every command is a synchronous round trip: when a method returns, the
/// worker has handled the command, so the caller may immediately release
/// whatever the command referenced. The handle assumes a single controller
/// caller; additional callers must serialize externally.
pub struct Worker {
    pipe: ControllerPipe,
    state: State,
    task: Option<WorkerTask>,
    join: Option<JoinHandle<()>>,
}

impl Worker {
    /// Create the worker detached: pipes and state exist, no thread yet.
    pub fn create(dev_io: Box<dyn DevIo>) -> Result<Worker, Error> {
        let (controller, worker) = control_pair()?;

        Ok(Worker {
            pipe: controller,
            state: State::Created,
            task: Some(WorkerTask::new(worker, dev_io)),
            join: None,
        })
    }

    pub fn start(&mut self) -> Result<(), Error> {
        let task = self.task.take().ok_or(Error::InvalidArg)?;

        let join = std::thread::Builder::new()
            .name("chime-sched".into())
            .spawn(move || task.run())
            .map_err(|err| {
                log::error!("failed to spawn audio worker: {err}");
                Error::OutOfMemory
            })?;

        self.join = Some(join);
        self.state = State::Started;
        Ok(())
    }

    fn ensure_started(&self) -> Result<(), Error> {
        match self.state {
            State::Started => Ok(()),
            State::Created => Err(Error::InvalidArg),
            State::Stopped => Err(Error::Pipe),
        }
    }

    fn post<T: Pod>(&self, msg: &T) -> Result<i32, Error> {
        self.pipe.send(bytemuck::bytes_of(msg))?;
        self.pipe.recv_reply()
    }

    /// Hand a device to the worker. Output devices are prefilled with
    /// `min_buffer_level` frames of silence before they join the loop.
    pub fn add_open_dev(&mut self, dev: &Arc<dyn Iodev>) -> Result<(), Error> {
        self.ensure_started()?;

        let raw = Box::into_raw(Box::new(dev.clone()));
        let msg = OpenDevMsg::new(raw as usize);
        if let Err(err) = self.pipe.send(bytemuck::bytes_of(&msg)) {
            // never reached the worker; reclaim the handle
            drop(unsafe { Box::from_raw(raw) });
            return Err(err);
        }

        self.pipe.recv_reply().map(|_| ())
    }

    pub fn rm_open_dev(&mut self, dev: &Arc<dyn Iodev>) -> Result<(), Error> {
        self.ensure_started()?;
        let msg = DevLookupMsg::new(CommandId::RM_OPEN_DEV, dev.info().idx, dev.direction());
        self.post(&msg).map(|_| ())
    }

    pub fn is_dev_open(&mut self, dev: &Arc<dyn Iodev>) -> Result<bool, Error> {
        self.ensure_started()?;
        let msg = DevLookupMsg::new(CommandId::IS_DEV_OPEN, dev.info().idx, dev.direction());
        Ok(self.post(&msg)? != 0)
    }

    /// Attach `stream` to every open device in `devs`. Unknown devices are
    /// skipped; any real failure rolls back the whole attach.
    pub fn add_stream(
        &mut self,
        stream: &Arc<dyn Rstream>,
        devs: &[DeviceIndex],
    ) -> Result<(), Error> {
        self.ensure_started()?;
        if devs.len() > MAX_ATTACH_DEVS {
            return Err(Error::InvalidArg);
        }

        let raw = Box::into_raw(Box::new(stream.clone()));
        let msg = AddStreamMsg::new(raw as usize, devs);
        if let Err(err) = self.pipe.send(bytemuck::bytes_of(&msg)) {
            drop(unsafe { Box::from_raw(raw) });
            return Err(err);
        }

        self.pipe.recv_reply().map(|_| ())
    }

    /// Detach `stream` from `dev`, or from every device when `dev` is
    /// `None`. Succeeds when the stream isn't attached at all.
    pub fn disconnect_stream(
        &mut self,
        stream: &Arc<dyn Rstream>,
        dev: Option<DeviceIndex>,
    ) -> Result<(), Error> {
        self.ensure_started()?;
        let msg = StreamLookupMsg::new(
            CommandId::DISCONNECT_STREAM,
            stream.id(),
            stream.direction(),
            dev,
        );
        self.post(&msg).map(|_| ())
    }

    /// Begin (or poll) draining of a playback stream. Returns the
    /// milliseconds left until the stream runs dry; 0 means the stream is
    /// gone from the worker and may be freed.
    pub fn drain_stream(&mut self, stream: &Arc<dyn Rstream>) -> Result<i32, Error> {
        self.ensure_started()?;
        let msg = StreamLookupMsg::new(
            CommandId::DRAIN_STREAM,
            stream.id(),
            stream.direction(),
            None,
        );
        self.post(&msg)
    }

    pub fn dump_info(&mut self, info: &mut AudioDebugInfo) -> Result<(), Error> {
        self.ensure_started()?;
        let msg = DumpMsg::new(info as *mut AudioDebugInfo as usize);
        self.post(&msg).map(|_| ())
    }

    /// Install (or clear) the global remix converter, returning the
    /// previously installed one.
    pub fn config_global_remix(
        &mut self,
        conv: Option<Box<RemixConverter>>,
    ) -> Result<Option<Box<RemixConverter>>, Error> {
        self.ensure_started()?;

        let raw = conv.map_or(0, |conv| Box::into_raw(conv) as usize);
        let msg = ConfigRemixMsg::new(raw);
        if let Err(err) = self.pipe.send(bytemuck::bytes_of(&msg)) {
            if raw != 0 {
                drop(unsafe { Box::from_raw(raw as *mut RemixConverter) });
            }
            return Err(err);
        }

        let old = self.pipe.recv_ptr_reply()?;
        Ok(match old {
            0 => None,
            raw => Some(unsafe { Box::from_raw(raw as *mut RemixConverter) }),
        })
    }

    pub fn dev_start_ramp(
        &mut self,
        dev: &Arc<dyn Iodev>,
        request: RampRequest,
    ) -> Result<(), Error> {
        self.ensure_started()?;
        let msg = StartRampMsg::new(dev.info().idx, dev.direction(), request);
        self.post(&msg).map(|_| ())
    }

    pub fn set_aec_dump(&mut self, stream: StreamId, start: bool, fd: RawFd) -> Result<(), Error> {
        self.ensure_started()?;
        let msg = AecDumpMsg::new(stream, start, fd);
        self.post(&msg).map(|_| ())
    }

    /// Run `handler` whenever `fd` becomes readable during the worker's
    /// wait.
    pub fn add_callback(&mut self, fd: RawFd, handler: ThreadCallback) -> Result<(), Error> {
        self.register_callback(fd, CallbackDirection::Read, handler)
    }

    /// Run `handler` whenever `fd` becomes writable during the worker's
    /// wait.
    pub fn add_write_callback(&mut self, fd: RawFd, handler: ThreadCallback) -> Result<(), Error> {
        self.register_callback(fd, CallbackDirection::Write, handler)
    }

    fn register_callback(
        &mut self,
        fd: RawFd,
        direction: CallbackDirection,
        handler: ThreadCallback,
    ) -> Result<(), Error> {
        // before start the registry is still on this side; afterwards the
        // registration has to travel through the worker like everything else
        if let Some(task) = self.task.as_mut() {
            task.registry_mut().add(fd, direction, handler);
            return Ok(());
        }

        self.ensure_started()?;
        let raw = Box::into_raw(Box::new(handler));
        let msg = AddCallbackMsg::new(fd, direction == CallbackDirection::Write, raw as usize);
        if let Err(err) = self.pipe.send(bytemuck::bytes_of(&msg)) {
            drop(unsafe { Box::from_raw(raw) });
            return Err(err);
        }

        self.pipe.recv_reply().map(|_| ())
    }

    pub fn enable_callback(&mut self, fd: RawFd, enabled: bool) -> Result<(), Error> {
        if let Some(task) = self.task.as_mut() {
            task.registry_mut().enable(fd, enabled);
            return Ok(());
        }

        self.ensure_started()?;
        let msg = EnableCallbackMsg::new(fd, enabled);
        self.post(&msg).map(|_| ())
    }

    /// Remove a registered callback through the worker, so the caller may
    /// free the handler's resources once this returns.
    pub fn rm_callback_sync(&mut self, fd: RawFd) -> Result<(), Error> {
        if let Some(task) = self.task.as_mut() {
            task.registry_mut().remove(fd);
            return Ok(());
        }

        self.ensure_started()?;
        let msg = RmCallbackMsg::new(fd);
        self.post(&msg).map(|_| ())
    }

    /// Stop the worker and reclaim its resources. Commands issued after
    /// this fail with [`Error::Pipe`].
    pub fn shutdown(&mut self) {
        if matches!(self.state, State::Started) {
            if let Err(err) = self.post(&StopMsg::new()) {
                log::warn!("failed to stop audio worker cleanly: {err}");
            }
            if let Some(join) = self.join.take() {
                let _ = join.join();
            }
        }

        self.task = None;
        self.state = State::Stopped;
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
