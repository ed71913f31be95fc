//! The worker task: one loop iteration runs device io, plans the next wake,
//! rebuilds the poll set, waits, then dispatches whatever became ready.

use std::os::fd::RawFd;
use std::sync::Arc;

use nix::errno::Errno;
use nix::poll::{ppoll, PollFd, PollFlags};
use nix::sys::time::TimeSpec;

use chime_io::{DeviceIndex, Direction, Iodev, RampRequest, RemixConverter, Rstream, StreamId};

use crate::codec::WorkerPipe;
use crate::dump::{AudioDebugInfo, DeviceDebugInfo, StreamDebugInfo, MAX_DEBUG_DEVS, MAX_DEBUG_STREAMS};
use crate::elog::{EventLog, EventTag};
use crate::error::Error;
use crate::msg::{
    AddCallbackMsg, AddStreamMsg, AecDumpMsg, CommandId, ConfigRemixMsg, DevLookupMsg, DumpMsg,
    EnableCallbackMsg, MsgBuffer, OpenDevMsg, RmCallbackMsg, StartRampMsg, StreamLookupMsg,
    MAX_ATTACH_DEVS, NO_DEVICE,
};
use crate::open_dev::{DevIo, OpenDevice};
use crate::registry::{CallbackDirection, CallbackRegistry, ThreadCallback};
use crate::rt;
use crate::wake::{next_wake, BusyLoopDetector};

/// Initial capacity of the descriptor array.
const POLLFDS_CAPACITY: usize = 32;

enum Flow {
    Continue,
    Stop,
}

pub(crate) struct WorkerTask {
    pipe: WorkerPipe,
    /// Open devices, indexed by `Direction::index()`.
    devs: [Vec<OpenDevice>; Direction::COUNT],
    registry: CallbackRegistry,
    dev_io: Box<dyn DevIo>,
    remix: Option<Box<RemixConverter>>,
    elog: EventLog,
    pollfds: Vec<PollFd<'static>>,
    busy: BusyLoopDetector,
    longest_wake: TimeSpec,
    last_wake: Option<TimeSpec>,
}

// PollFd::new() ties its lifetime to the reference it borrows, but these
// entries are rebuilt from raw fds every loop iteration and stored with a
// 'static lifetime, so we assemble the (repr(transparent)) pollfd directly.
fn pollfd_static(fd: RawFd, events: PollFlags) -> PollFd<'static> {
    let raw = libc::pollfd {
        fd,
        events: events.bits(),
        revents: 0,
    };
    unsafe { std::mem::transmute(raw) }
}

fn revents(fd: &PollFd) -> PollFlags {
    fd.revents().unwrap_or(PollFlags::empty())
}

fn rc_of(result: Result<i32, Error>) -> i32 {
    match result {
        Ok(rc) => rc,
        Err(err) => err.rc(),
    }
}

fn direction_of(raw: u32) -> Result<Direction, Error> {
    Direction::from_wire(raw).ok_or(Error::InvalidArg)
}

impl WorkerTask {
    pub fn new(pipe: WorkerPipe, dev_io: Box<dyn DevIo>) -> WorkerTask {
        WorkerTask {
            pipe,
            devs: [Vec::new(), Vec::new()],
            registry: CallbackRegistry::new(),
            dev_io,
            remix: None,
            elog: EventLog::new(),
            pollfds: Vec::with_capacity(POLLFDS_CAPACITY),
            busy: BusyLoopDetector::default(),
            longest_wake: chime_clock::zero(),
            last_wake: None,
        }
    }

    pub fn registry_mut(&mut self) -> &mut CallbackRegistry {
        &mut self.registry
    }

    /// The worker loop. Returns when `Stop` is handled or the control
    /// channel dies.
    pub fn run(mut self) {
        rt::set_realtime_priority();

        loop {
            {
                let WorkerTask {
                    devs,
                    dev_io,
                    remix,
                    ..
                } = &mut self;
                let [output, input] = devs;
                dev_io.run(output, input, remix.as_deref());
            }

            let now = chime_clock::now();
            let plan = {
                let WorkerTask {
                    devs, dev_io, elog, ..
                } = &mut self;
                let [output, input] = devs;
                next_wake(output, input, dev_io.as_mut(), elog, now)
            };

            if plan.bounded && self.busy.check(plan.ts) {
                self.dev_io.busy_loop();
            }

            self.build_pollset();

            if let Some(last) = self.last_wake {
                let awake = chime_clock::now() - last;
                if awake > self.longest_wake {
                    self.longest_wake = awake;
                }
            }

            self.elog.push(
                EventTag::Sleep,
                [
                    plan.bounded as u32,
                    plan.ts.tv_sec() as u32,
                    plan.ts.tv_nsec() as u32,
                ],
            );

            let timeout = plan.bounded.then_some(plan.ts);
            let rc = ppoll(&mut self.pollfds, timeout, None);
            self.last_wake = Some(chime_clock::now());

            let rc = match rc {
                Ok(rc) => rc,
                Err(Errno::EINTR) => continue,
                Err(err) => {
                    log::error!("ppoll failed: {err}");
                    continue;
                }
            };

            self.elog.push(EventTag::Wake, [rc as u32, 0, 0]);
            if rc <= 0 {
                continue;
            }

            if revents(&self.pollfds[0]).contains(PollFlags::POLLIN) {
                match self.handle_message() {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Stop) => break,
                    Err(err) => {
                        log::error!("control channel failed, stopping worker: {err}");
                        break;
                    }
                }
            }

            let WorkerTask {
                registry,
                pollfds,
                elog,
                ..
            } = &mut self;
            for rec in registry.records_mut() {
                let Some(slot) = rec.slot else {
                    continue;
                };
                if !revents(&pollfds[slot]).intersects(PollFlags::POLLIN | PollFlags::POLLOUT) {
                    continue;
                }

                elog.push(
                    EventTag::IodevCb,
                    [
                        rec.fd as u32,
                        (rec.direction == CallbackDirection::Write) as u32,
                        0,
                    ],
                );
                (rec.handler)();
            }
        }
    }

    /// Rebuild the descriptor array: the control pipe always sits at slot 0,
    /// then enabled callbacks in insertion order, then per-stream fds of
    /// output devices followed by input devices.
    fn build_pollset(&mut self) {
        let WorkerTask {
            pollfds,
            registry,
            devs,
            pipe,
            ..
        } = self;

        pollfds.clear();
        pollfds.push(pollfd_static(pipe.rx_fd(), PollFlags::POLLIN));

        for rec in registry.records_mut() {
            rec.slot = None;
            if !rec.enabled {
                continue;
            }

            let events = match rec.direction {
                CallbackDirection::Read => PollFlags::POLLIN,
                CallbackDirection::Write => PollFlags::POLLOUT,
            };
            rec.slot = Some(pollfds.len());
            pollfds.push(pollfd_static(rec.fd, events));
        }

        for od in devs.iter().flat_map(|list| list.iter()) {
            for ds in &od.streams {
                let Some(fd) = ds.poll_fd() else {
                    continue;
                };
                pollfds.push(pollfd_static(fd, PollFlags::POLLIN));
            }
        }
    }

    /// Read and dispatch one command, then reply. Transport failures are
    /// returned and kill the loop; command failures only travel back to the
    /// controller.
    fn handle_message(&mut self) -> Result<Flow, Error> {
        let mut buf = MsgBuffer::zeroed();
        let length = self.pipe.read_command(&mut buf)?;
        let header = buf.header();

        self.elog.push(EventTag::PbMsg, [header.id.raw(), 0, 0]);

        let rc = match header.id {
            CommandId::ADD_OPEN_DEV => match buf.decode::<OpenDevMsg>(length) {
                Ok(msg) => {
                    // ownership of the device handle crosses the pipe raw
                    let dev = *unsafe { Box::from_raw(msg.dev as *mut Arc<dyn Iodev>) };
                    rc_of(self.add_open_dev(dev))
                }
                Err(err) => err.rc(),
            },
            CommandId::RM_OPEN_DEV => match buf.decode::<DevLookupMsg>(length) {
                Ok(msg) => rc_of(
                    direction_of(msg.direction)
                        .and_then(|dir| self.rm_open_dev(DeviceIndex(msg.dev_idx), dir)),
                ),
                Err(err) => err.rc(),
            },
            CommandId::IS_DEV_OPEN => match buf.decode::<DevLookupMsg>(length) {
                Ok(msg) => rc_of(
                    direction_of(msg.direction)
                        .map(|dir| self.is_dev_open(DeviceIndex(msg.dev_idx), dir)),
                ),
                Err(err) => err.rc(),
            },
            CommandId::ADD_STREAM => match buf.decode::<AddStreamMsg>(length) {
                Ok(msg) => {
                    let stream = *unsafe { Box::from_raw(msg.stream as *mut Arc<dyn Rstream>) };
                    let num_devs = msg.num_devs as usize;

                    if num_devs > MAX_ATTACH_DEVS {
                        Error::InvalidArg.rc()
                    } else {
                        self.elog
                            .push(EventTag::WriteStreamsWait, [stream.id().0, 0, 0]);
                        let devs: Vec<DeviceIndex> =
                            msg.devs[..num_devs].iter().map(|&idx| DeviceIndex(idx)).collect();
                        rc_of(self.add_stream(stream, &devs))
                    }
                }
                Err(err) => err.rc(),
            },
            CommandId::DISCONNECT_STREAM => match buf.decode::<StreamLookupMsg>(length) {
                Ok(msg) => rc_of(direction_of(msg.direction).and_then(|dir| {
                    let dev = (msg.dev_idx != NO_DEVICE).then_some(DeviceIndex(msg.dev_idx));
                    self.disconnect_stream(StreamId(msg.stream_id), dir, dev)
                })),
                Err(err) => err.rc(),
            },
            CommandId::DRAIN_STREAM => match buf.decode::<StreamLookupMsg>(length) {
                Ok(msg) => rc_of(
                    direction_of(msg.direction)
                        .and_then(|dir| self.drain_stream(StreamId(msg.stream_id), dir)),
                ),
                Err(err) => err.rc(),
            },
            CommandId::DUMP_THREAD_INFO => match buf.decode::<DumpMsg>(length) {
                Ok(msg) => {
                    // the controller blocks on our reply, so its out-buffer
                    // stays exclusively ours for the whole round trip
                    let info = unsafe { &mut *(msg.info as *mut AudioDebugInfo) };
                    rc_of(self.dump_thread_info(info))
                }
                Err(err) => err.rc(),
            },
            CommandId::CONFIG_GLOBAL_REMIX => match buf.decode::<ConfigRemixMsg>(length) {
                Ok(msg) => {
                    // the previous converter travels back over the reply so
                    // the controller can free it
                    let old = self
                        .remix
                        .take()
                        .map_or(0, |conv| Box::into_raw(conv) as usize);
                    self.remix = match msg.conv {
                        0 => None,
                        raw => Some(unsafe { Box::from_raw(raw as *mut RemixConverter) }),
                    };
                    self.pipe.send_ptr_response(old)?;
                    return Ok(Flow::Continue);
                }
                Err(err) => {
                    // this command replies pointer-sized even on failure
                    log::warn!("malformed remix command: {err}");
                    self.pipe.send_ptr_response(0)?;
                    return Ok(Flow::Continue);
                }
            },
            CommandId::DEV_START_RAMP => match buf.decode::<StartRampMsg>(length) {
                Ok(msg) => rc_of(direction_of(msg.direction).and_then(|dir| {
                    let request = RampRequest::from_wire(msg.request).ok_or(Error::InvalidArg)?;
                    self.dev_start_ramp(DeviceIndex(msg.dev_idx), dir, request)
                })),
                Err(err) => err.rc(),
            },
            CommandId::ADD_CALLBACK => match buf.decode::<AddCallbackMsg>(length) {
                Ok(msg) => {
                    let handler = *unsafe { Box::from_raw(msg.handler as *mut ThreadCallback) };
                    let direction = if msg.is_write != 0 {
                        CallbackDirection::Write
                    } else {
                        CallbackDirection::Read
                    };
                    self.registry.add(msg.fd, direction, handler);
                    0
                }
                Err(err) => err.rc(),
            },
            CommandId::ENABLE_CALLBACK => match buf.decode::<EnableCallbackMsg>(length) {
                Ok(msg) => {
                    self.registry.enable(msg.fd, msg.enabled != 0);
                    0
                }
                Err(err) => err.rc(),
            },
            CommandId::REMOVE_CALLBACK => match buf.decode::<RmCallbackMsg>(length) {
                Ok(msg) => {
                    self.registry.remove(msg.fd);
                    0
                }
                Err(err) => err.rc(),
            },
            CommandId::AEC_DUMP => match buf.decode::<AecDumpMsg>(length) {
                Ok(msg) => rc_of(self.set_aec_dump(StreamId(msg.stream_id), msg.start != 0, msg.fd)),
                Err(err) => err.rc(),
            },
            CommandId::STOP => {
                self.pipe.send_response(0)?;
                return Ok(Flow::Stop);
            }
            _ => Error::InvalidArg.rc(),
        };

        self.pipe.send_response(rc)?;
        Ok(Flow::Continue)
    }

    fn add_open_dev(&mut self, dev: Arc<dyn Iodev>) -> Result<i32, Error> {
        let direction = dev.direction();
        let info = dev.info();

        if self.devs[direction.index()]
            .iter()
            .any(|od| od.idx() == info.idx)
        {
            return Err(Error::AlreadyExists);
        }

        // pad playback up to the minimum level so the first stream doesn't
        // start against an empty buffer
        if direction == Direction::Output {
            if let Err(err) = dev.fill_zeros(dev.min_buffer_level()) {
                log::warn!("failed to prefill device {}: {err}", info.idx);
            }
        }

        self.elog.push(EventTag::DevAdded, [info.idx.0, 0, 0]);
        self.devs[direction.index()].push(OpenDevice::new(dev));
        Ok(0)
    }

    fn rm_open_dev(&mut self, idx: DeviceIndex, direction: Direction) -> Result<i32, Error> {
        let devs = &mut self.devs[direction.index()];
        let pos = devs
            .iter()
            .position(|od| od.idx() == idx)
            .ok_or(Error::NotFound)?;

        let od = devs.remove(pos);
        for ds in &od.streams {
            od.dev.detach_stream(ds.stream().id());
        }
        Ok(0)
    }

    fn is_dev_open(&self, idx: DeviceIndex, direction: Direction) -> i32 {
        self.devs[direction.index()]
            .iter()
            .any(|od| od.idx() == idx) as i32
    }

    fn add_stream(&mut self, stream: Arc<dyn Rstream>, devs: &[DeviceIndex]) -> Result<i32, Error> {
        self.append_stream(&stream, devs)?;

        self.elog.push(
            EventTag::StreamAdded,
            [
                stream.id().0,
                devs.first().map_or(0, |idx| idx.0),
                devs.len() as u32,
            ],
        );
        Ok(0)
    }

    /// Bind `stream` to every requested device that is open and doesn't
    /// already carry it. Any failure rolls the whole command back.
    fn append_stream(&mut self, stream: &Arc<dyn Rstream>, devs: &[DeviceIndex]) -> Result<(), Error> {
        let direction = stream.direction();
        let id = stream.id();
        let mut result = Ok(());

        for &idx in devs {
            let list = &mut self.devs[direction.index()];
            let Some(od) = list.iter_mut().find(|od| od.idx() == idx) else {
                continue;
            };
            if od.has_stream(id) {
                continue;
            }

            // on a device already playing streams, schedule the newcomer at
            // the earliest existing deadline; too early stacks up the buffer
            // level, too late blocks writes
            let mut init_cb_ts = None;
            if direction == Direction::Output {
                for ds in &od.streams {
                    let Some(ts) = ds.next_cb_ts() else {
                        continue;
                    };
                    if init_cb_ts.map_or(true, |cur| ts < cur) {
                        init_cb_ts = Some(ts);
                    }
                }
            }
            let init_cb_ts = init_cb_ts.unwrap_or_else(chime_clock::now);

            let ds = match stream
                .clone()
                .attach(idx, od.dev.ext_format(), od.dev.as_ref(), init_cb_ts)
            {
                Ok(ds) => ds,
                Err(err) => {
                    log::warn!("binding stream {id} failed: {err}");
                    result = Err(Error::InvalidArg);
                    break;
                }
            };

            // the first capture stream flushes the device so every later
            // reader starts from the same buffer level
            if direction == Direction::Input && od.streams.is_empty() {
                if let Err(err) = od.dev.flush_buffer() {
                    log::warn!("flush before first stream failed on device {idx}: {err}");
                    result = Err(Error::InvalidArg);
                    break;
                }
            }

            od.dev.attach_stream(id);

            // align read offsets with the first attached stream, clamped to
            // the newcomer's callback threshold, so no capture reader starves
            if direction == Direction::Input && !od.streams.is_empty() {
                let first = od.streams[0].stream().clone();

                let offset = od.dev.stream_offset(first.id()).min(stream.cb_threshold());
                od.dev.stream_written(id, offset);

                let offset = first.dev_offset(idx).min(stream.cb_threshold());
                stream.update_dev_offset(offset, idx);
            }

            od.streams.push(ds);
        }

        if result.is_err() {
            for od in &mut self.devs[direction.index()] {
                if let Some(pos) = od.streams.iter().position(|ds| ds.stream().id() == id) {
                    od.dev.detach_stream(id);
                    od.streams.remove(pos);
                }
            }
        }

        result
    }

    fn find_stream(&self, direction: Direction, id: StreamId) -> Option<Arc<dyn Rstream>> {
        self.devs[direction.index()]
            .iter()
            .flat_map(|od| od.streams.iter())
            .find(|ds| ds.stream().id() == id)
            .map(|ds| ds.stream().clone())
    }

    fn disconnect_stream(
        &mut self,
        id: StreamId,
        direction: Direction,
        dev: Option<DeviceIndex>,
    ) -> Result<i32, Error> {
        // disconnecting a stream that isn't attached anywhere is a no-op
        if self.find_stream(direction, id).is_none() {
            return Ok(0);
        }

        let WorkerTask { devs, dev_io, .. } = self;
        dev_io.remove_stream(&mut devs[direction.index()], id, dev)?;
        Ok(0)
    }

    fn drain_stream(&mut self, id: StreamId, direction: Direction) -> Result<i32, Error> {
        let Some(stream) = self.find_stream(direction, id) else {
            return Ok(0);
        };

        let ms = drain_ms_remaining(stream.as_ref());
        if ms == 0 {
            let WorkerTask { devs, dev_io, .. } = self;
            dev_io.remove_stream(&mut devs[direction.index()], id, None)?;
        }
        Ok(ms)
    }

    fn dump_thread_info(&mut self, info: &mut AudioDebugInfo) -> Result<i32, Error> {
        info.devs.clear();
        info.streams.clear();

        let [output, input] = &self.devs;
        for od in output.iter().chain(input.iter()) {
            if info.devs.len() == MAX_DEBUG_DEVS {
                break;
            }
            info.devs.push(DeviceDebugInfo::capture(od));

            for ds in &od.streams {
                if info.streams.len() == MAX_DEBUG_STREAMS {
                    break;
                }
                info.streams.push(StreamDebugInfo::capture(ds.as_ref(), od.idx()));
            }
        }

        info.log = self.elog.snapshot();
        info.longest_wake = self.longest_wake;
        self.longest_wake = chime_clock::zero();
        Ok(0)
    }

    fn dev_start_ramp(
        &mut self,
        idx: DeviceIndex,
        direction: Direction,
        request: RampRequest,
    ) -> Result<i32, Error> {
        // ramping only makes sense on a device we are servicing
        let od = self.devs[direction.index()]
            .iter()
            .find(|od| od.idx() == idx)
            .ok_or(Error::InvalidArg)?;

        match od.dev.start_ramp(request) {
            Ok(()) => Ok(0),
            Err(err) => {
                log::warn!("start ramp failed on device {idx}: {err}");
                Err(Error::InvalidArg)
            }
        }
    }

    fn set_aec_dump(&mut self, id: StreamId, start: bool, fd: RawFd) -> Result<i32, Error> {
        for od in &self.devs[Direction::Input.index()] {
            if !od.dev.is_open() {
                continue;
            }

            for ds in &od.streams {
                let stream = ds.stream();
                if stream.id() != id {
                    continue;
                }
                if let Some(processing) = stream.processing() {
                    processing.set_aec_dump(od.dev.as_ref(), start, fd);
                }
            }
        }
        Ok(0)
    }
}

fn drain_ms_remaining(stream: &dyn Rstream) -> i32 {
    if stream.direction() != Direction::Output {
        return 0;
    }

    let frames = stream.frames_queued();
    if frames == 0 {
        return 0;
    }

    stream.set_draining(true);
    1 + chime_clock::frames_to_ms(frames, stream.format().frame_rate)
}
