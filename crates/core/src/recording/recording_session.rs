use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::compositing::domain::letterbox::compose;
use crate::encoding::domain::encoder_format::EncoderFormat;
use crate::encoding::domain::video_encoder::{InputSurface, OutputQueue, VideoEncoder};
use crate::encoding::infrastructure::ffmpeg_encoder::FfmpegEncoder;
use crate::muxing::domain::muxer::Muxer;
use crate::muxing::infrastructure::ffmpeg_muxer::FfmpegMuxer;
use crate::recording::drain_loop::{DrainExit, DrainLoop, DrainOutcome};
use crate::recording::session_state::{SessionState, SessionStateCell};
use crate::recording::session_stats::{SessionStats, StatsSnapshot};
use crate::shared::error::{BoxError, RecorderError};
use crate::shared::frame::Frame;
use crate::shared::pipeline_config::PipelineConfig;
use crate::shared::session_settings::SessionSettings;

/// State shared between the session, its frame sinks and the drain loop.
struct Shared {
    state: Arc<SessionStateCell>,
    stats: Arc<SessionStats>,
    surface: OnceLock<Arc<dyn InputSurface>>,
    canvas: OnceLock<(u32, u32)>,
}

/// Cheap, cloneable handle the capture thread uses to push frames.
///
/// Never blocks and never fails: frames arriving while the session is not
/// armed or recording are dropped silently.
#[derive(Clone)]
pub struct FrameSink {
    shared: Arc<Shared>,
}

impl FrameSink {
    pub fn submit_frame(&self, frame: &Frame) {
        if !self.shared.state.get().accepts_frames() {
            return;
        }
        let (Some(surface), Some(&(width, height))) =
            (self.shared.surface.get(), self.shared.canvas.get())
        else {
            return;
        };
        if frame.is_empty() || !matches!(frame.channels(), 3 | 4) {
            log::warn!(
                "Dropping frame {} ({}x{}x{})",
                frame.index(),
                frame.width(),
                frame.height(),
                frame.channels()
            );
            return;
        }

        self.shared
            .state
            .transition(SessionState::Armed, SessionState::Recording);

        let composed;
        let frame = if frame.width() == width && frame.height() == height && frame.channels() == 3
        {
            frame
        } else {
            composed = compose(frame, width, height);
            &composed
        };

        match surface.render(frame) {
            Ok(()) => self.shared.stats.frame_submitted(),
            Err(e) => {
                self.shared.stats.frame_rejected();
                log::debug!("Surface rejected frame {}: {e}", frame.index());
            }
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared.state.get()
    }
}

/// What `stop()` did.
#[derive(Clone, Debug, PartialEq)]
pub struct StopReport {
    /// The drain loop finished within the grace period.
    pub drained: bool,
    /// Release steps that failed; teardown carried on past each one.
    pub release_failures: Vec<&'static str>,
    pub stats: StatsSnapshot,
}

/// One recording attempt: composites frames, feeds the encoder, drains its
/// output into the container and tears everything down on `stop()`.
///
/// Single use. `prepare()` and `stop()` belong to one controlling thread;
/// frames may come from any thread through [`FrameSink`].
pub struct RecordingSession {
    encoder: Option<Box<dyn VideoEncoder>>,
    muxer: Option<Box<dyn Muxer>>,
    output: Option<Box<dyn OutputQueue>>,
    settings: SessionSettings,
    shared: Arc<Shared>,
    encoder_started: bool,
    drain: Option<JoinHandle<DrainOutcome>>,
    drained_rx: Option<Receiver<()>>,
    errors_tx: Sender<RecorderError>,
    errors_rx: Receiver<RecorderError>,
}

impl RecordingSession {
    pub fn new(
        encoder: Box<dyn VideoEncoder>,
        muxer: Box<dyn Muxer>,
        settings: SessionSettings,
    ) -> Self {
        let (errors_tx, errors_rx) = crossbeam_channel::unbounded();
        Self {
            encoder: Some(encoder),
            muxer: Some(muxer),
            output: None,
            settings,
            shared: Arc::new(Shared {
                state: Arc::new(SessionStateCell::new(SessionState::Idle)),
                stats: Arc::new(SessionStats::new()),
                surface: OnceLock::new(),
                canvas: OnceLock::new(),
            }),
            encoder_started: false,
            drain: None,
            drained_rx: None,
            errors_tx,
            errors_rx,
        }
    }

    /// Session backed by the ffmpeg encoder and MP4 muxer.
    pub fn ffmpeg(settings: SessionSettings) -> Self {
        let encoder = FfmpegEncoder::new(settings.surface_queue_depth);
        Self::new(Box::new(encoder), Box::new(FfmpegMuxer::new()), settings)
    }

    pub fn state(&self) -> SessionState {
        self.shared.state.get()
    }

    pub fn frame_sink(&self) -> FrameSink {
        FrameSink {
            shared: self.shared.clone(),
        }
    }

    /// Setup failures and drain-loop faults, each published once.
    pub fn errors(&self) -> Receiver<RecorderError> {
        self.errors_rx.clone()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn submit_frame(&self, frame: &Frame) {
        self.frame_sink().submit_frame(frame);
    }

    /// Opens the output, starts the encoder and launches the drain loop.
    ///
    /// On failure everything acquired so far is released, the error is also
    /// published on the error channel, and the session stays `Idle` but can
    /// no longer be prepared.
    pub fn prepare(&mut self, config: PipelineConfig) -> Result<(), RecorderError> {
        let state = self.state();
        if state != SessionState::Idle || self.encoder.is_none() || self.muxer.is_none() {
            return Err(RecorderError::InvalidState {
                expected: "idle",
                actual: if state == SessionState::Idle {
                    "spent"
                } else {
                    state.name()
                },
            });
        }
        if let Err(e) = config.validate().and_then(|()| self.try_prepare(&config)) {
            log::error!("Failed to prepare recording: {e}");
            self.release_resources();
            let cause = match &e {
                RecorderError::Setup { source, .. } => source.to_string(),
                other => other.to_string(),
            };
            let _ = self
                .errors_tx
                .send(RecorderError::setup(&config.output_path, cause));
            return Err(e);
        }

        log::info!(
            "Recording armed: {}x{} @ {} fps -> {}",
            config.target_width,
            config.target_height,
            config.frame_rate,
            config.output_path.display()
        );
        Ok(())
    }

    fn try_prepare(&mut self, config: &PipelineConfig) -> Result<(), RecorderError> {
        let path = &config.output_path;
        let setup = |e: BoxError| RecorderError::setup(path, e);
        let (Some(encoder), Some(muxer)) = (self.encoder.as_mut(), self.muxer.as_mut()) else {
            return Err(RecorderError::InvalidState {
                expected: "idle",
                actual: "spent",
            });
        };

        muxer.open(path).map_err(setup)?;

        let format = EncoderFormat::from_config(config, &self.settings);
        encoder.configure(&format).map_err(setup)?;
        let surface = encoder.create_input_surface().map_err(setup)?;
        let _ = self.shared.surface.set(surface);
        let output = encoder.start().map_err(setup)?;
        self.encoder_started = true;

        let _ = self
            .shared
            .canvas
            .set((config.target_width, config.target_height));
        self.shared.state.set(SessionState::Armed);

        let (drained_tx, drained_rx) = crossbeam_channel::bounded(1);
        let Some(muxer) = self.muxer.take() else {
            return Err(setup("muxer unavailable".into()));
        };
        let drain = DrainLoop::new(
            output,
            muxer,
            self.shared.state.clone(),
            self.shared.stats.clone(),
            self.errors_tx.clone(),
            drained_tx,
            self.settings.poll_timeout(),
            self.settings.backoff(),
        );
        match drain.spawn() {
            Ok(handle) => {
                self.drain = Some(handle);
                self.drained_rx = Some(drained_rx);
                Ok(())
            }
            Err(e) => {
                self.shared.state.set(SessionState::Idle);
                Err(setup(e.into()))
            }
        }
    }

    /// Winds the session down. Idempotent once `Stopped`.
    ///
    /// Waits up to the drain grace period for in-flight frames, then releases
    /// encoder, surface and muxer in that order. Release failures are logged
    /// and never stop later steps.
    pub fn stop(&mut self) -> StopReport {
        let previous = self.shared.state.begin_draining();
        if previous == SessionState::Stopped {
            return StopReport {
                drained: false,
                release_failures: Vec::new(),
                stats: self.stats(),
            };
        }

        if let Some(surface) = self.shared.surface.get() {
            if let Err(e) = surface.signal_end_of_stream() {
                log::warn!("Failed to signal end of input: {e}");
            }
        }

        let drained = self.wait_for_drain();
        self.shared.state.set(SessionState::Stopped);
        self.join_drain();
        let release_failures = self.release_resources();

        if let Some(summary) = self.shared.stats.summary_string() {
            log::info!("\n\n{summary}");
        }

        StopReport {
            drained,
            release_failures,
            stats: self.stats(),
        }
    }

    fn wait_for_drain(&mut self) -> bool {
        let Some(rx) = self.drained_rx.take() else {
            return false;
        };
        let grace = self.settings.drain_grace();
        match rx.recv_timeout(grace) {
            Ok(()) => true,
            Err(RecvTimeoutError::Timeout) => {
                log::warn!("Encoder did not drain within {grace:?}; trailing frames may be lost");
                false
            }
            Err(RecvTimeoutError::Disconnected) => false,
        }
    }

    fn join_drain(&mut self) {
        let Some(handle) = self.drain.take() else {
            return;
        };
        match handle.join() {
            Ok(outcome) => {
                if outcome.exit == DrainExit::Failed {
                    log::warn!("Drain loop had already failed; finalizing what was written");
                }
                self.muxer = Some(outcome.muxer);
                self.output = Some(outcome.output);
            }
            Err(_) => {
                log::error!("Drain thread panicked; output file will not be finalized");
                let _ = self.errors_tx.send(RecorderError::DrainPanicked);
            }
        }
    }

    /// Runs every release step regardless of earlier failures and clears
    /// all handles. Returns the names of the steps that failed.
    fn release_resources(&mut self) -> Vec<&'static str> {
        let mut failures = Vec::new();
        let mut guarded = |name: &'static str, result: Result<(), BoxError>| {
            if let Err(e) = result {
                log::warn!("Failed to {name}: {e}");
                failures.push(name);
            }
        };

        if let Some(mut encoder) = self.encoder.take() {
            if self.encoder_started {
                guarded("stop encoder", encoder.stop());
            }
            guarded("release encoder", encoder.release());
        }
        self.encoder_started = false;
        self.output = None;

        if let Some(surface) = self.shared.surface.get() {
            guarded("release surface", surface.release());
        }

        if let Some(mut muxer) = self.muxer.take() {
            guarded("finalize muxer", muxer.finalize());
        }

        failures
    }

    /// True once every resource handle has been given up.
    pub fn is_released(&self) -> bool {
        self.encoder.is_none()
            && self.muxer.is_none()
            && self.output.is_none()
            && self.drain.is_none()
    }
}

impl Drop for RecordingSession {
    fn drop(&mut self) {
        if self.drain.is_some() || self.encoder_started {
            self.stop();
        }
    }
}
