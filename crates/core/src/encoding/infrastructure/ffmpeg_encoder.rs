use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use ffmpeg_next::ffi;

use crate::encoding::domain::encoder_format::{EncoderFormat, OutputFormat};
use crate::encoding::domain::video_encoder::{
    BufferFlags, InputSurface, OutputBuffer, OutputEvent, OutputQueue, VideoEncoder,
};
use crate::shared::constants::{MICROS_PER_SECOND, OUTPUT_BUFFER_COUNT};
use crate::shared::error::BoxError;
use crate::shared::frame::Frame;

/// How often the worker re-checks for shutdown while idle.
const WORKER_POLL: Duration = Duration::from_millis(20);

/// Upper bound on queuing the end-of-stream marker behind pending frames.
const END_OF_STREAM_SEND_TIMEOUT: Duration = Duration::from_millis(500);

enum SurfaceInput {
    Frame { frame: Frame, pts_us: i64 },
    EndOfStream,
}

enum WorkerEvent {
    Output(OutputEvent),
    Failed(String),
}

/// Opened codec plus the RGB → YUV converter feeding it.
struct OpenedEncoder {
    encoder: ffmpeg_next::codec::encoder::video::Encoder,
    scaler: ffmpeg_next::software::scaling::Context,
    output_format: OutputFormat,
}

// Safety: the opened encoder moves to the worker thread once and is only
// touched there afterwards.
unsafe impl Send for OpenedEncoder {}

/// H.264 encoder running on its own thread behind a producer surface.
///
/// Hardware encoders are tried first, then libx264, then whatever H.264
/// encoder ffmpeg was built with. Encoded packets come back through a
/// fixed pool of output buffers; if the consumer stops releasing them the
/// worker stalls, like a real codec would.
pub struct FfmpegEncoder {
    queue_depth: usize,
    opened: Option<OpenedEncoder>,
    input: Option<Receiver<SurfaceInput>>,
    surface: Option<Arc<FfmpegSurface>>,
    shutdown: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    released: bool,
}

impl FfmpegEncoder {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            queue_depth: queue_depth.max(1),
            opened: None,
            input: None,
            surface: None,
            shutdown: Arc::new(AtomicBool::new(false)),
            worker: None,
            released: false,
        }
    }

    fn join_worker(&mut self) -> Result<(), BoxError> {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.worker.take() {
            handle.join().map_err(|_| "encoder worker panicked")?;
        }
        Ok(())
    }
}

impl VideoEncoder for FfmpegEncoder {
    fn configure(&mut self, format: &EncoderFormat) -> Result<(), BoxError> {
        if self.released {
            return Err("encoder already released".into());
        }
        if self.opened.is_some() || self.worker.is_some() {
            return Err("encoder already configured".into());
        }
        ffmpeg_next::init()?;

        let (encoder, name) = open_first_available(format)?;
        let scaler = ffmpeg_next::software::scaling::Context::get(
            ffmpeg_next::format::Pixel::RGB24,
            format.width,
            format.height,
            ffmpeg_next::format::Pixel::YUV420P,
            format.width,
            format.height,
            ffmpeg_next::software::scaling::Flags::BILINEAR,
        )?;

        let output_format = OutputFormat {
            codec: format.codec,
            width: format.width,
            height: format.height,
            frame_rate: format.frame_rate,
            bit_rate: format.bit_rate,
            extradata: extradata(&encoder),
        };
        log::info!(
            "Using H.264 encoder {name}: {}x{} @ {} fps, {} kbit/s, gop {}",
            format.width,
            format.height,
            format.frame_rate,
            format.bit_rate / 1000,
            format.gop_size()
        );

        self.opened = Some(OpenedEncoder {
            encoder,
            scaler,
            output_format,
        });
        Ok(())
    }

    fn create_input_surface(&mut self) -> Result<Arc<dyn InputSurface>, BoxError> {
        let opened = self.opened.as_ref().ok_or("encoder not configured")?;
        if self.surface.is_some() {
            return Err("input surface already created".into());
        }

        let (tx, rx) = crossbeam_channel::bounded(self.queue_depth);
        let surface = Arc::new(FfmpegSurface::new(
            tx,
            opened.output_format.width,
            opened.output_format.height,
        ));
        self.input = Some(rx);
        self.surface = Some(surface.clone());
        Ok(surface)
    }

    fn start(&mut self) -> Result<Box<dyn OutputQueue>, BoxError> {
        if self.worker.is_some() {
            return Err("encoder already started".into());
        }
        let input = self.input.take().ok_or("input surface not created")?;
        let opened = self.opened.take().ok_or("encoder not configured")?;

        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let (free_tx, free_rx) = crossbeam_channel::bounded(OUTPUT_BUFFER_COUNT);
        for index in 0..OUTPUT_BUFFER_COUNT {
            free_tx.send(index)?;
        }

        let worker = EncoderWorker {
            opened,
            input,
            events: events_tx,
            free_slots: free_rx,
            shutdown: self.shutdown.clone(),
        };
        let handle = thread::Builder::new()
            .name("posecam-encoder".to_string())
            .spawn(move || worker.run())?;
        self.worker = Some(handle);

        Ok(Box::new(FfmpegOutputQueue {
            events: events_rx,
            free_slots: free_tx,
            in_flight: HashSet::new(),
            finished: false,
        }))
    }

    fn stop(&mut self) -> Result<(), BoxError> {
        if self.worker.is_none() {
            return Err("encoder not started".into());
        }
        self.join_worker()
    }

    fn release(&mut self) -> Result<(), BoxError> {
        self.released = true;
        let joined = self.join_worker();
        self.opened = None;
        self.input = None;
        self.surface = None;
        joined
    }
}

impl Drop for FfmpegEncoder {
    fn drop(&mut self) {
        let _ = self.join_worker();
    }
}

fn open_first_available(
    format: &EncoderFormat,
) -> Result<(ffmpeg_next::codec::encoder::video::Encoder, String), BoxError> {
    let candidates = format
        .preferred_encoders
        .iter()
        .filter_map(|name| ffmpeg_next::encoder::find_by_name(name))
        .chain(ffmpeg_next::encoder::find(ffmpeg_next::codec::Id::H264));

    let mut tried = Vec::new();
    for codec in candidates {
        let name = codec.name().to_string();
        if tried.contains(&name) {
            continue;
        }
        match open_encoder(codec, format) {
            Ok(encoder) => return Ok((encoder, name)),
            Err(e) => log::debug!("H.264 encoder {name} unavailable: {e}"),
        }
        tried.push(name);
    }

    Err(if tried.is_empty() {
        "no H.264 encoder found in this ffmpeg build".into()
    } else {
        format!("no H.264 encoder could be opened (tried {})", tried.join(", ")).into()
    })
}

fn open_encoder(
    codec: ffmpeg_next::Codec,
    format: &EncoderFormat,
) -> Result<ffmpeg_next::codec::encoder::video::Encoder, ffmpeg_next::Error> {
    let mut ctx = ffmpeg_next::codec::context::Context::new_with_codec(codec)
        .encoder()
        .video()?;

    ctx.set_width(format.width);
    ctx.set_height(format.height);
    ctx.set_format(ffmpeg_next::format::Pixel::YUV420P);
    ctx.set_time_base(ffmpeg_next::Rational(1, MICROS_PER_SECOND as i32));
    ctx.set_frame_rate(Some(ffmpeg_next::Rational(format.frame_rate as i32, 1)));
    ctx.set_bit_rate(format.bit_rate as usize);
    ctx.set_gop(format.gop_size());
    ctx.set_max_b_frames(0);
    // MP4 carries SPS/PPS in the sample description, not in-band.
    ctx.set_flags(ffmpeg_next::codec::Flags::GLOBAL_HEADER);

    let mut opts = ffmpeg_next::Dictionary::new();
    if codec.name() == "libx264" {
        opts.set("preset", "veryfast");
        opts.set("tune", "zerolatency");
    }
    ctx.open_with(opts)
}

fn extradata(encoder: &ffmpeg_next::codec::encoder::video::Encoder) -> Vec<u8> {
    unsafe {
        let ctx = encoder.as_ptr();
        if (*ctx).extradata.is_null() || (*ctx).extradata_size <= 0 {
            return Vec::new();
        }
        std::slice::from_raw_parts((*ctx).extradata, (*ctx).extradata_size as usize).to_vec()
    }
}

// ── Producer surface ──────────────────────────────────────────────────

/// Non-blocking entry point for frames.
///
/// Stamps each frame with a monotonic microsecond clock; timestamps are
/// strictly increasing even if two frames land in the same microsecond.
struct FfmpegSurface {
    input: Sender<SurfaceInput>,
    width: u32,
    height: u32,
    clock: Instant,
    last_pts_us: AtomicI64,
    released: AtomicBool,
}

impl FfmpegSurface {
    fn new(input: Sender<SurfaceInput>, width: u32, height: u32) -> Self {
        Self {
            input,
            width,
            height,
            clock: Instant::now(),
            last_pts_us: AtomicI64::new(-1),
            released: AtomicBool::new(false),
        }
    }

    fn next_pts(&self) -> i64 {
        let now = self.clock.elapsed().as_micros() as i64;
        let previous = self
            .last_pts_us
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        now.max(previous + 1)
    }
}

impl InputSurface for FfmpegSurface {
    fn render(&self, frame: &Frame) -> Result<(), BoxError> {
        if self.released.load(Ordering::Acquire) {
            return Err("input surface released".into());
        }
        if frame.width() != self.width || frame.height() != self.height || frame.channels() != 3 {
            return Err(format!(
                "frame is {}x{}x{}, surface expects {}x{}x3",
                frame.width(),
                frame.height(),
                frame.channels(),
                self.width,
                self.height
            )
            .into());
        }

        let input = SurfaceInput::Frame {
            frame: frame.clone(),
            pts_us: self.next_pts(),
        };
        match self.input.try_send(input) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err("encoder input queue full".into()),
            Err(TrySendError::Disconnected(_)) => Err("encoder is not running".into()),
        }
    }

    fn signal_end_of_stream(&self) -> Result<(), BoxError> {
        if self.released.load(Ordering::Acquire) {
            return Err("input surface released".into());
        }
        self.input
            .send_timeout(SurfaceInput::EndOfStream, END_OF_STREAM_SEND_TIMEOUT)
            .map_err(|e| format!("could not signal end of stream: {e}"))?;
        Ok(())
    }

    fn release(&self) -> Result<(), BoxError> {
        self.released.store(true, Ordering::Release);
        Ok(())
    }
}

// ── Output side ───────────────────────────────────────────────────────

struct FfmpegOutputQueue {
    events: Receiver<WorkerEvent>,
    free_slots: Sender<usize>,
    in_flight: HashSet<usize>,
    finished: bool,
}

impl OutputQueue for FfmpegOutputQueue {
    fn dequeue_output(&mut self, timeout: Duration) -> Result<OutputEvent, BoxError> {
        if self.finished {
            return Ok(OutputEvent::EndOfStream);
        }
        match self.events.recv_timeout(timeout) {
            Ok(WorkerEvent::Output(event)) => {
                match &event {
                    OutputEvent::Buffer(buffer) => {
                        self.in_flight.insert(buffer.index);
                    }
                    OutputEvent::EndOfStream => self.finished = true,
                    _ => {}
                }
                Ok(event)
            }
            Ok(WorkerEvent::Failed(message)) => {
                self.finished = true;
                Err(message.into())
            }
            Err(RecvTimeoutError::Timeout) => Ok(OutputEvent::TryAgainLater),
            Err(RecvTimeoutError::Disconnected) => {
                self.finished = true;
                Err("encoder worker exited before end of stream".into())
            }
        }
    }

    fn release_output(&mut self, index: usize) -> Result<(), BoxError> {
        if !self.in_flight.remove(&index) {
            return Err(format!("output buffer {index} is not outstanding").into());
        }
        // The worker may already be gone; a lost slot no longer matters then.
        let _ = self.free_slots.try_send(index);
        Ok(())
    }
}

// ── Worker ────────────────────────────────────────────────────────────

struct EncoderWorker {
    opened: OpenedEncoder,
    input: Receiver<SurfaceInput>,
    events: Sender<WorkerEvent>,
    free_slots: Receiver<usize>,
    shutdown: Arc<AtomicBool>,
}

impl EncoderWorker {
    fn run(mut self) {
        let format = self.opened.output_format.clone();
        if self
            .events
            .send(WorkerEvent::Output(OutputEvent::FormatChanged(format)))
            .is_err()
        {
            return;
        }

        match self.encode_until_end() {
            Ok(true) => {
                let _ = self.events.send(WorkerEvent::Output(OutputEvent::EndOfStream));
            }
            Ok(false) => log::debug!("Encoder worker stopped before end of stream"),
            Err(e) => {
                log::error!("Encoder worker failed: {e}");
                let _ = self.events.send(WorkerEvent::Failed(e.to_string()));
            }
        }
    }

    /// Returns `true` once the encoder has been flushed, `false` on shutdown.
    fn encode_until_end(&mut self) -> Result<bool, BoxError> {
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return Ok(false);
            }
            match self.input.recv_timeout(WORKER_POLL) {
                Ok(SurfaceInput::Frame { frame, pts_us }) => self.encode(&frame, pts_us)?,
                Ok(SurfaceInput::EndOfStream) | Err(RecvTimeoutError::Disconnected) => {
                    self.opened.encoder.send_eof()?;
                    return self.drain_packets();
                }
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
    }

    fn encode(&mut self, frame: &Frame, pts_us: i64) -> Result<(), BoxError> {
        let width = frame.width();
        let height = frame.height();
        let mut rgb_frame = ffmpeg_next::util::frame::video::Video::new(
            ffmpeg_next::format::Pixel::RGB24,
            width,
            height,
        );

        let stride = rgb_frame.stride(0);
        let row_bytes = width as usize * 3;
        let data = rgb_frame.data_mut(0);
        for (row, src) in frame.data().chunks_exact(row_bytes).enumerate() {
            let dst_start = row * stride;
            data[dst_start..dst_start + row_bytes].copy_from_slice(src);
        }

        let mut yuv_frame = ffmpeg_next::util::frame::video::Video::empty();
        self.opened.scaler.run(&rgb_frame, &mut yuv_frame)?;
        yuv_frame.set_pts(Some(pts_us));

        match self.opened.encoder.send_frame(&yuv_frame) {
            Ok(()) => {}
            Err(ffmpeg_next::Error::Other { errno }) if errno == ffi::EAGAIN => {
                self.drain_packets()?;
                self.opened.encoder.send_frame(&yuv_frame)?;
            }
            Err(e) => return Err(e.into()),
        }
        self.drain_packets()?;
        Ok(())
    }

    /// Hands every ready packet to the consumer. Returns `true` when the
    /// encoder reports it is fully flushed.
    fn drain_packets(&mut self) -> Result<bool, BoxError> {
        let mut packet = ffmpeg_next::Packet::empty();
        loop {
            match self.opened.encoder.receive_packet(&mut packet) {
                Ok(()) => {
                    if !self.emit(&packet)? {
                        return Ok(false);
                    }
                }
                Err(ffmpeg_next::Error::Other { errno }) if errno == ffi::EAGAIN => {
                    return Ok(false)
                }
                Err(ffmpeg_next::Error::Eof) => return Ok(true),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Waits for a free output slot and publishes the packet in it.
    /// Returns `false` if shut down while waiting.
    fn emit(&mut self, packet: &ffmpeg_next::Packet) -> Result<bool, BoxError> {
        let index = loop {
            match self.free_slots.recv_timeout(WORKER_POLL) {
                Ok(index) => break index,
                Err(RecvTimeoutError::Timeout) => {
                    if self.shutdown.load(Ordering::Acquire) {
                        return Ok(false);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return Err("output queue dropped".into()),
            }
        };

        let buffer = OutputBuffer {
            index,
            data: packet.data().map(<[u8]>::to_vec).unwrap_or_default(),
            presentation_time_us: packet.pts().or(packet.dts()).unwrap_or(0),
            flags: BufferFlags {
                key_frame: packet.is_key(),
                ..BufferFlags::default()
            },
        };
        self.events
            .send(WorkerEvent::Output(OutputEvent::Buffer(buffer)))
            .map_err(|_| "output queue dropped")?;
        Ok(true)
    }
}
