//! In-process stand-ins for the encoder and muxer ports.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::encoding::domain::encoder_format::{EncoderFormat, OutputFormat, VideoCodec};
use crate::encoding::domain::video_encoder::{
    BufferFlags, InputSurface, OutputBuffer, OutputEvent, OutputQueue, VideoEncoder,
};
use crate::muxing::domain::encoded_sample::EncodedSample;
use crate::muxing::domain::muxer::Muxer;
use crate::shared::error::BoxError;
use crate::shared::frame::Frame;

pub fn output_format() -> OutputFormat {
    OutputFormat {
        codec: VideoCodec::H264,
        width: 64,
        height: 48,
        frame_rate: 30,
        bit_rate: 12_288,
        extradata: vec![1, 2, 3],
    }
}

pub fn buffer(index: usize, size: usize, pts: i64, key_frame: bool) -> OutputBuffer {
    OutputBuffer {
        index,
        data: vec![0xAB; size],
        presentation_time_us: pts,
        flags: BufferFlags {
            key_frame,
            ..BufferFlags::default()
        },
    }
}

// ── Output queue ──────────────────────────────────────────────────────

/// Replays a fixed list of events, then reports nothing ready.
pub struct ScriptedOutput {
    events: VecDeque<Result<OutputEvent, String>>,
    pub released: Arc<Mutex<Vec<usize>>>,
}

impl ScriptedOutput {
    pub fn new(events: Vec<Result<OutputEvent, String>>) -> Self {
        Self {
            events: events.into(),
            released: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl OutputQueue for ScriptedOutput {
    fn dequeue_output(&mut self, _timeout: Duration) -> Result<OutputEvent, BoxError> {
        match self.events.pop_front() {
            Some(Ok(event)) => Ok(event),
            Some(Err(msg)) => Err(msg.into()),
            None => Ok(OutputEvent::TryAgainLater),
        }
    }

    fn release_output(&mut self, index: usize) -> Result<(), BoxError> {
        self.released.lock().unwrap().push(index);
        Ok(())
    }
}

// ── Muxer ─────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MuxerLog {
    pub path: Option<PathBuf>,
    pub tracks: Vec<OutputFormat>,
    pub started: bool,
    pub samples: Vec<EncodedSample>,
    pub finalized: bool,
    pub finalize_attempted: bool,
}

/// Records every call; can be told to fail writes or finalization.
pub struct RecordingMuxer {
    pub log: Arc<Mutex<MuxerLog>>,
    fail_open: bool,
    fail_writes: bool,
    fail_finalize: bool,
}

impl RecordingMuxer {
    pub fn new() -> Self {
        Self {
            log: Arc::new(Mutex::new(MuxerLog::default())),
            fail_open: false,
            fail_writes: false,
            fail_finalize: false,
        }
    }

    pub fn failing_open() -> Self {
        Self {
            fail_open: true,
            ..Self::new()
        }
    }

    pub fn failing_writes() -> Self {
        Self {
            fail_writes: true,
            ..Self::new()
        }
    }

    pub fn failing_finalize() -> Self {
        Self {
            fail_finalize: true,
            ..Self::new()
        }
    }
}

impl Muxer for RecordingMuxer {
    fn open(&mut self, path: &Path) -> Result<(), BoxError> {
        if self.fail_open {
            return Err("cannot create file".into());
        }
        self.log.lock().unwrap().path = Some(path.to_path_buf());
        Ok(())
    }

    fn add_track(&mut self, format: &OutputFormat) -> Result<usize, BoxError> {
        let mut log = self.log.lock().unwrap();
        if log.started || !log.tracks.is_empty() {
            return Err("track already registered".into());
        }
        log.tracks.push(format.clone());
        Ok(0)
    }

    fn start(&mut self) -> Result<(), BoxError> {
        let mut log = self.log.lock().unwrap();
        if log.tracks.is_empty() || log.started {
            return Err("start out of order".into());
        }
        log.started = true;
        Ok(())
    }

    fn write_sample(&mut self, track_index: usize, sample: &EncodedSample) -> Result<(), BoxError> {
        if self.fail_writes {
            return Err("disk full".into());
        }
        let mut log = self.log.lock().unwrap();
        if !log.started || track_index != 0 {
            return Err("write before start".into());
        }
        log.samples.push(sample.clone());
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), BoxError> {
        let mut log = self.log.lock().unwrap();
        log.finalize_attempted = true;
        if self.fail_finalize {
            return Err("trailer write failed".into());
        }
        log.finalized = log.started;
        Ok(())
    }
}

// ── Encoder ───────────────────────────────────────────────────────────

/// Which encoder step should fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailAt {
    Nothing,
    Configure,
    Start,
    Stop,
    Release,
    SurfaceRelease,
}

#[derive(Default)]
pub struct EncoderLog {
    pub configured: Option<EncoderFormat>,
    pub started: bool,
    pub stopped: bool,
    pub released: bool,
    pub rendered: Vec<Frame>,
    pub end_of_stream_signalled: bool,
    pub surface_released: bool,
}

/// Encoder that turns every rendered frame into one output buffer.
///
/// The format event is queued on start, timestamps advance by one frame
/// period from `base_pts_us`, and end-of-stream is echoed back once the
/// surface signals it.
pub struct FakeEncoder {
    pub log: Arc<Mutex<EncoderLog>>,
    fail_at: FailAt,
    payload_before_format: bool,
    swallow_end_of_stream: bool,
    base_pts_us: i64,
    events: (Sender<OutputEvent>, Receiver<OutputEvent>),
}

impl FakeEncoder {
    pub fn new() -> Self {
        Self {
            log: Arc::new(Mutex::new(EncoderLog::default())),
            fail_at: FailAt::Nothing,
            payload_before_format: false,
            swallow_end_of_stream: false,
            base_pts_us: 5_000_000,
            events: crossbeam_channel::unbounded(),
        }
    }

    pub fn failing_at(fail_at: FailAt) -> Self {
        Self {
            fail_at,
            ..Self::new()
        }
    }

    /// Emits a stray payload buffer before the format event.
    pub fn with_payload_before_format(mut self) -> Self {
        self.payload_before_format = true;
        self
    }

    /// Never reports end of stream, so `stop()` has to time out.
    pub fn never_drains(mut self) -> Self {
        self.swallow_end_of_stream = true;
        self
    }

    fn fail(&self, at: FailAt) -> Result<(), BoxError> {
        if self.fail_at == at {
            return Err(format!("injected failure at {at:?}").into());
        }
        Ok(())
    }
}

impl VideoEncoder for FakeEncoder {
    fn configure(&mut self, format: &EncoderFormat) -> Result<(), BoxError> {
        self.fail(FailAt::Configure)?;
        self.log.lock().unwrap().configured = Some(format.clone());
        Ok(())
    }

    fn create_input_surface(&mut self) -> Result<Arc<dyn InputSurface>, BoxError> {
        Ok(Arc::new(FakeSurface {
            log: self.log.clone(),
            events: self.events.0.clone(),
            next_pts: AtomicI64::new(self.base_pts_us),
            next_index: Mutex::new(0),
            released: AtomicBool::new(false),
            fail_release: self.fail_at == FailAt::SurfaceRelease,
            swallow_end_of_stream: self.swallow_end_of_stream,
        }))
    }

    fn start(&mut self) -> Result<Box<dyn OutputQueue>, BoxError> {
        self.fail(FailAt::Start)?;
        self.log.lock().unwrap().started = true;
        let tx = &self.events.0;
        if self.payload_before_format {
            let _ = tx.send(OutputEvent::Buffer(buffer(99, 16, 0, true)));
        }
        let _ = tx.send(OutputEvent::FormatChanged(output_format()));
        Ok(Box::new(FakeOutput {
            events: self.events.1.clone(),
        }))
    }

    fn stop(&mut self) -> Result<(), BoxError> {
        self.log.lock().unwrap().stopped = true;
        self.fail(FailAt::Stop)
    }

    fn release(&mut self) -> Result<(), BoxError> {
        self.log.lock().unwrap().released = true;
        self.fail(FailAt::Release)
    }
}

struct FakeSurface {
    log: Arc<Mutex<EncoderLog>>,
    events: Sender<OutputEvent>,
    next_pts: AtomicI64,
    next_index: Mutex<usize>,
    released: AtomicBool,
    fail_release: bool,
    swallow_end_of_stream: bool,
}

impl InputSurface for FakeSurface {
    fn render(&self, frame: &Frame) -> Result<(), BoxError> {
        if self.released.load(Ordering::Acquire) {
            return Err("surface released".into());
        }
        self.log.lock().unwrap().rendered.push(frame.clone());
        let pts = self.next_pts.fetch_add(33_333, Ordering::Relaxed);
        let mut index = self.next_index.lock().unwrap();
        let key_frame = *index % 30 == 0;
        let _ = self
            .events
            .send(OutputEvent::Buffer(buffer(*index, 64, pts, key_frame)));
        *index += 1;
        Ok(())
    }

    fn signal_end_of_stream(&self) -> Result<(), BoxError> {
        self.log.lock().unwrap().end_of_stream_signalled = true;
        if !self.swallow_end_of_stream {
            let _ = self.events.send(OutputEvent::EndOfStream);
        }
        Ok(())
    }

    fn release(&self) -> Result<(), BoxError> {
        self.released.store(true, Ordering::Release);
        self.log.lock().unwrap().surface_released = true;
        if self.fail_release {
            return Err("injected surface release failure".into());
        }
        Ok(())
    }
}

struct FakeOutput {
    events: Receiver<OutputEvent>,
}

impl OutputQueue for FakeOutput {
    fn dequeue_output(&mut self, timeout: Duration) -> Result<OutputEvent, BoxError> {
        match self.events.recv_timeout(timeout) {
            Ok(event) => Ok(event),
            Err(RecvTimeoutError::Timeout) => Ok(OutputEvent::TryAgainLater),
            Err(RecvTimeoutError::Disconnected) => Ok(OutputEvent::EndOfStream),
        }
    }

    fn release_output(&mut self, _index: usize) -> Result<(), BoxError> {
        Ok(())
    }
}
