//! Fake device/stream/pump implementations backing the worker tests.

use std::collections::{HashMap, HashSet};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use nix::sys::time::TimeSpec;

use chime_io::{
    AttachError, AudioFormat, DevStream, DeviceError, DeviceIndex, Direction, Iodev, IodevInfo,
    Processing, RampRequest, RemixConverter, Rstream, StreamId,
};
use chime_sched::{DevIo, OpenDevice};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Spin until `cond` holds, panicking after half a second.
pub fn wait_for(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_millis(500);
    while !cond() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[derive(Default)]
pub struct FakeDevState {
    pub filled_zeros: Vec<u32>,
    pub attached: Vec<u32>,
    pub detached: Vec<u32>,
    pub ramps: Vec<RampRequest>,
    /// Per-stream device-side read offsets, by stream id.
    pub offsets: HashMap<u32, u32>,
    pub flushes: u32,
}

pub struct FakeDev {
    idx: u32,
    direction: Direction,
    min_buffer_level: u32,
    pub state: Mutex<FakeDevState>,
}

impl FakeDev {
    pub fn new(idx: u32, direction: Direction) -> Arc<FakeDev> {
        FakeDev::with_min_level(idx, direction, 0)
    }

    pub fn with_min_level(idx: u32, direction: Direction, min_buffer_level: u32) -> Arc<FakeDev> {
        Arc::new(FakeDev {
            idx,
            direction,
            min_buffer_level,
            state: Mutex::new(FakeDevState::default()),
        })
    }
}

pub fn as_iodev(dev: &Arc<FakeDev>) -> Arc<dyn Iodev> {
    dev.clone()
}

impl Iodev for FakeDev {
    fn direction(&self) -> Direction {
        self.direction
    }

    fn info(&self) -> IodevInfo {
        IodevInfo {
            idx: DeviceIndex(self.idx),
            name: format!("fake-{}", self.idx),
        }
    }

    fn buffer_size(&self) -> u32 {
        8192
    }

    fn min_buffer_level(&self) -> u32 {
        self.min_buffer_level
    }

    fn min_cb_level(&self) -> u32 {
        480
    }

    fn max_cb_level(&self) -> u32 {
        960
    }

    fn ext_format(&self) -> AudioFormat {
        AudioFormat {
            frame_rate: 48000,
            num_channels: 2,
        }
    }

    fn is_open(&self) -> bool {
        true
    }

    fn odev_should_wake(&self) -> bool {
        false
    }

    fn flush_buffer(&self) -> Result<u32, DeviceError> {
        let mut state = self.state.lock().unwrap();
        state.flushes += 1;
        Ok(0)
    }

    fn start_ramp(&self, request: RampRequest) -> Result<(), DeviceError> {
        self.state.lock().unwrap().ramps.push(request);
        Ok(())
    }

    fn fill_zeros(&self, frames: u32) -> Result<(), DeviceError> {
        self.state.lock().unwrap().filled_zeros.push(frames);
        Ok(())
    }

    fn attach_stream(&self, stream: StreamId) {
        self.state.lock().unwrap().attached.push(stream.0);
    }

    fn detach_stream(&self, stream: StreamId) {
        self.state.lock().unwrap().detached.push(stream.0);
    }

    fn stream_offset(&self, stream: StreamId) -> u32 {
        self.state
            .lock()
            .unwrap()
            .offsets
            .get(&stream.0)
            .copied()
            .unwrap_or(0)
    }

    fn stream_written(&self, stream: StreamId, frames: u32) {
        self.state.lock().unwrap().offsets.insert(stream.0, frames);
    }

    fn num_underruns(&self) -> u32 {
        0
    }

    fn num_severe_underruns(&self) -> u32 {
        0
    }

    fn highest_hw_level(&self) -> u32 {
        0
    }

    fn est_rate_ratio(&self) -> f64 {
        1.0
    }
}

#[derive(Default)]
pub struct FakeProcessing {
    /// (device idx, start, fd) per forwarded call.
    pub calls: Mutex<Vec<(u32, bool, RawFd)>>,
    pub effects: AtomicU64,
}

impl Processing for FakeProcessing {
    fn set_aec_dump(&self, dev: &dyn Iodev, start: bool, fd: RawFd) {
        self.calls.lock().unwrap().push((dev.info().idx.0, start, fd));
    }

    fn effects(&self) -> u64 {
        self.effects.load(Ordering::SeqCst)
    }
}

pub struct FakeStream {
    id: u32,
    direction: Direction,
    cb_threshold: u32,
    pub frames_queued: AtomicU32,
    pub draining: AtomicBool,
    /// Deadline reported by every binding created from this stream.
    pub next_cb_ts: Mutex<Option<TimeSpec>>,
    /// Device indices whose attach should fail.
    pub fail_attach: Mutex<HashSet<u32>>,
    /// Per-device stream-side offsets, by device idx.
    pub dev_offsets: Mutex<HashMap<u32, u32>>,
    /// (device idx, init_cb_ts) per successful attach.
    pub attach_log: Mutex<Vec<(u32, TimeSpec)>>,
    pub processing: Option<Arc<FakeProcessing>>,
}

impl FakeStream {
    fn build(id: u32, direction: Direction, cb_threshold: u32) -> FakeStream {
        FakeStream {
            id,
            direction,
            cb_threshold,
            frames_queued: AtomicU32::new(0),
            draining: AtomicBool::new(false),
            next_cb_ts: Mutex::new(None),
            fail_attach: Mutex::new(HashSet::new()),
            dev_offsets: Mutex::new(HashMap::new()),
            attach_log: Mutex::new(Vec::new()),
            processing: None,
        }
    }

    pub fn new(id: u32, direction: Direction, cb_threshold: u32) -> Arc<FakeStream> {
        Arc::new(FakeStream::build(id, direction, cb_threshold))
    }

    pub fn with_processing(
        id: u32,
        direction: Direction,
        cb_threshold: u32,
        processing: Arc<FakeProcessing>,
    ) -> Arc<FakeStream> {
        let mut stream = FakeStream::build(id, direction, cb_threshold);
        stream.processing = Some(processing);
        Arc::new(stream)
    }
}

pub fn as_rstream(stream: &Arc<FakeStream>) -> Arc<dyn Rstream> {
    stream.clone()
}

impl Rstream for FakeStream {
    fn id(&self) -> StreamId {
        StreamId(self.id)
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn format(&self) -> AudioFormat {
        AudioFormat {
            frame_rate: 48000,
            num_channels: 2,
        }
    }

    fn cb_threshold(&self) -> u32 {
        self.cb_threshold
    }

    fn buffer_frames(&self) -> u32 {
        2 * self.cb_threshold
    }

    fn frames_queued(&self) -> u32 {
        self.frames_queued.load(Ordering::SeqCst)
    }

    fn num_overruns(&self) -> u32 {
        0
    }

    fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    fn set_draining(&self, draining: bool) {
        self.draining.store(draining, Ordering::SeqCst);
    }

    fn dev_offset(&self, dev: DeviceIndex) -> u32 {
        self.dev_offsets
            .lock()
            .unwrap()
            .get(&dev.0)
            .copied()
            .unwrap_or(0)
    }

    fn update_dev_offset(&self, offset: u32, dev: DeviceIndex) {
        self.dev_offsets.lock().unwrap().insert(dev.0, offset);
    }

    fn longest_fetch(&self) -> TimeSpec {
        chime_clock::zero()
    }

    fn processing(&self) -> Option<&dyn Processing> {
        self.processing.as_ref().map(|p| -> &dyn Processing { p.as_ref() })
    }

    fn attach(
        self: Arc<Self>,
        dev_idx: DeviceIndex,
        _fmt: AudioFormat,
        _dev: &dyn Iodev,
        init_cb_ts: TimeSpec,
    ) -> Result<Box<dyn DevStream>, AttachError> {
        if self.fail_attach.lock().unwrap().contains(&dev_idx.0) {
            return Err(AttachError { dev: dev_idx });
        }

        self.attach_log.lock().unwrap().push((dev_idx.0, init_cb_ts));

        let stream: Arc<dyn Rstream> = self.clone();
        Ok(Box::new(FakeDevStream { stream, fake: self }))
    }
}

pub struct FakeDevStream {
    stream: Arc<dyn Rstream>,
    fake: Arc<FakeStream>,
}

impl DevStream for FakeDevStream {
    fn stream(&self) -> &Arc<dyn Rstream> {
        &self.stream
    }

    fn next_cb_ts(&self) -> Option<TimeSpec> {
        *self.fake.next_cb_ts.lock().unwrap()
    }

    fn can_fetch(&self) -> bool {
        true
    }

    fn poll_fd(&self) -> Option<RawFd> {
        None
    }

    fn playback_frames(&self) -> i64 {
        i64::from(self.fake.frames_queued.load(Ordering::SeqCst))
    }
}

#[derive(Default)]
pub struct DevIoShared {
    pub runs: AtomicU32,
    pub busy_loops: AtomicU32,
    /// 1-based run() call that should stall, 0 for never.
    pub slow_run: AtomicU32,
    pub stall_ms: AtomicU32,
    /// Converter pointers observed by run().
    pub remix_seen: Mutex<Vec<usize>>,
}

pub struct FakeDevIo {
    shared: Arc<DevIoShared>,
}

impl FakeDevIo {
    pub fn create() -> (Box<dyn DevIo>, Arc<DevIoShared>) {
        let shared = Arc::new(DevIoShared::default());
        let dev_io = FakeDevIo {
            shared: shared.clone(),
        };
        (Box::new(dev_io), shared)
    }
}

impl DevIo for FakeDevIo {
    fn run(
        &mut self,
        _output: &mut [OpenDevice],
        _input: &mut [OpenDevice],
        remix: Option<&RemixConverter>,
    ) {
        let run = self.shared.runs.fetch_add(1, Ordering::SeqCst) + 1;

        if run == self.shared.slow_run.load(Ordering::SeqCst) {
            let stall = self.shared.stall_ms.load(Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(u64::from(stall)));
        }

        if let Some(conv) = remix {
            let ptr = conv as *const RemixConverter as usize;
            self.shared.remix_seen.lock().unwrap().push(ptr);
        }
    }

    fn next_input_wake(&mut self, _input: &mut [OpenDevice], _min_ts: &mut TimeSpec) -> usize {
        0
    }

    fn busy_loop(&mut self) {
        self.shared.busy_loops.fetch_add(1, Ordering::SeqCst);
    }
}
