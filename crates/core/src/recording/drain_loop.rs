use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::Sender;

use crate::encoding::domain::encoder_format::OutputFormat;
use crate::encoding::domain::video_encoder::{OutputBuffer, OutputEvent, OutputQueue};
use crate::muxing::domain::encoded_sample::EncodedSample;
use crate::muxing::domain::muxer::Muxer;
use crate::recording::session_state::{SessionState, SessionStateCell};
use crate::recording::session_stats::SessionStats;
use crate::shared::error::RecorderError;

/// Format-negotiation progress. Samples flow only once `Streaming`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Handshake {
    AwaitingFormat,
    Streaming { track_index: usize },
}

/// Shifts encoder timestamps so the written stream starts at zero.
///
/// The origin is the timestamp of the first accepted sample. Samples that
/// would land before zero or before the previous sample are rejected.
#[derive(Debug, Default)]
pub struct TimestampRebaser {
    origin_us: Option<i64>,
    last_us: Option<i64>,
}

impl TimestampRebaser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rebase(&mut self, timestamp_us: i64) -> Option<i64> {
        let origin = *self.origin_us.get_or_insert(timestamp_us);
        let rebased = timestamp_us - origin;
        if rebased < 0 || self.last_us.is_some_and(|last| rebased < last) {
            return None;
        }
        self.last_us = Some(rebased);
        Some(rebased)
    }

    pub fn origin_us(&self) -> Option<i64> {
        self.origin_us
    }
}

/// Why the drain loop returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrainExit {
    /// The session moved to `Stopped` while output was still possible.
    Stopped,
    EndOfStream,
    Failed,
}

/// Everything the drain thread owned, handed back for teardown.
pub struct DrainOutcome {
    pub muxer: Box<dyn Muxer>,
    pub output: Box<dyn OutputQueue>,
    pub exit: DrainExit,
}

enum Step {
    Continue,
    Idle,
    EndOfStream,
}

/// Continuously moves encoder output into the muxer.
///
/// Runs on its own thread; the muxer is touched from nowhere else while the
/// loop is alive, so writes need no lock.
pub struct DrainLoop {
    output: Box<dyn OutputQueue>,
    muxer: Box<dyn Muxer>,
    state: Arc<SessionStateCell>,
    stats: Arc<SessionStats>,
    errors: Sender<RecorderError>,
    drained: Sender<()>,
    poll_timeout: Duration,
    backoff: Duration,
    handshake: Handshake,
    rebaser: TimestampRebaser,
}

impl DrainLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        output: Box<dyn OutputQueue>,
        muxer: Box<dyn Muxer>,
        state: Arc<SessionStateCell>,
        stats: Arc<SessionStats>,
        errors: Sender<RecorderError>,
        drained: Sender<()>,
        poll_timeout: Duration,
        backoff: Duration,
    ) -> Self {
        Self {
            output,
            muxer,
            state,
            stats,
            errors,
            drained,
            poll_timeout,
            backoff,
            handshake: Handshake::AwaitingFormat,
            rebaser: TimestampRebaser::new(),
        }
    }

    pub fn spawn(self) -> std::io::Result<JoinHandle<DrainOutcome>> {
        thread::Builder::new()
            .name("posecam-drain".to_string())
            .spawn(move || self.run())
    }

    pub fn run(mut self) -> DrainOutcome {
        let exit = loop {
            if self.state.get() == SessionState::Stopped {
                break DrainExit::Stopped;
            }
            match self.step() {
                Ok(Step::Continue) => {}
                Ok(Step::Idle) => thread::sleep(self.backoff),
                Ok(Step::EndOfStream) => {
                    log::debug!("Encoder reported end of stream");
                    break DrainExit::EndOfStream;
                }
                Err(e) => {
                    log::error!("Drain loop stopped on fatal error: {e}");
                    self.state.begin_draining();
                    let _ = self.errors.send(e);
                    break DrainExit::Failed;
                }
            }
        };

        let _ = self.drained.try_send(());
        DrainOutcome {
            muxer: self.muxer,
            output: self.output,
            exit,
        }
    }

    fn step(&mut self) -> Result<Step, RecorderError> {
        let event = self
            .output
            .dequeue_output(self.poll_timeout)
            .map_err(RecorderError::Encoder)?;

        match event {
            OutputEvent::TryAgainLater => Ok(Step::Idle),
            OutputEvent::FormatChanged(format) => {
                self.on_format_changed(&format)?;
                Ok(Step::Continue)
            }
            OutputEvent::Buffer(buffer) => {
                let end_of_stream = buffer.flags.end_of_stream;
                self.on_buffer(buffer)?;
                Ok(if end_of_stream {
                    Step::EndOfStream
                } else {
                    Step::Continue
                })
            }
            OutputEvent::EndOfStream => Ok(Step::EndOfStream),
        }
    }

    fn on_format_changed(&mut self, format: &OutputFormat) -> Result<(), RecorderError> {
        if let Handshake::Streaming { .. } = self.handshake {
            log::warn!("Ignoring repeated output format change");
            return Ok(());
        }

        let track_index = self.muxer.add_track(format).map_err(RecorderError::Muxer)?;
        self.muxer.start().map_err(RecorderError::Muxer)?;
        self.handshake = Handshake::Streaming { track_index };
        log::info!(
            "Output format negotiated: {} {}x{}, track {track_index}",
            format.codec.mime_type(),
            format.width,
            format.height
        );
        Ok(())
    }

    /// Writes the buffer if possible, then always gives it back.
    fn on_buffer(&mut self, buffer: OutputBuffer) -> Result<(), RecorderError> {
        let index = buffer.index;
        let written = self.write_buffer(buffer);
        let released = self
            .output
            .release_output(index)
            .map_err(RecorderError::Encoder);
        written.and(released)
    }

    fn write_buffer(&mut self, buffer: OutputBuffer) -> Result<(), RecorderError> {
        let size = if buffer.flags.codec_config {
            0
        } else {
            buffer.data.len()
        };
        if size == 0 {
            return Ok(());
        }

        let Handshake::Streaming { track_index } = self.handshake else {
            log::warn!("Discarding {size}-byte buffer received before output format");
            self.stats.sample_discarded();
            return Ok(());
        };

        let Some(timestamp_us) = self.rebaser.rebase(buffer.presentation_time_us) else {
            log::warn!(
                "Discarding buffer with out-of-order timestamp {}us",
                buffer.presentation_time_us
            );
            self.stats.sample_discarded();
            return Ok(());
        };

        let sample = EncodedSample {
            payload: buffer.data,
            presentation_time_us: timestamp_us,
            is_key_frame: buffer.flags.key_frame,
            is_config_data: false,
            track_index,
        };
        self.muxer
            .write_sample(track_index, &sample)
            .map_err(RecorderError::Muxer)?;
        self.stats
            .sample_written(sample.size(), sample.is_key_frame, timestamp_us);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::domain::video_encoder::BufferFlags;
    use crate::recording::test_support::{buffer, output_format, MuxerLog, RecordingMuxer, ScriptedOutput};
    use std::sync::Mutex;

    struct Harness {
        state: Arc<SessionStateCell>,
        stats: Arc<SessionStats>,
        muxer_log: Arc<Mutex<MuxerLog>>,
        released: Arc<Mutex<Vec<usize>>>,
        errors: crossbeam_channel::Receiver<RecorderError>,
        drained: crossbeam_channel::Receiver<()>,
    }

    fn run_script(events: Vec<Result<OutputEvent, String>>, muxer: RecordingMuxer) -> (DrainOutcome, Harness) {
        let output = ScriptedOutput::new(events);
        let released = output.released.clone();
        let muxer_log = muxer.log.clone();
        let state = Arc::new(SessionStateCell::new(SessionState::Recording));
        let stats = Arc::new(SessionStats::new());
        let (err_tx, err_rx) = crossbeam_channel::unbounded();
        let (drained_tx, drained_rx) = crossbeam_channel::bounded(1);

        let drain = DrainLoop::new(
            Box::new(output),
            Box::new(muxer),
            state.clone(),
            stats.clone(),
            err_tx,
            drained_tx,
            Duration::from_millis(1),
            Duration::from_millis(1),
        );
        let outcome = drain.run();
        (
            outcome,
            Harness {
                state,
                stats,
                muxer_log,
                released,
                errors: err_rx,
                drained: drained_rx,
            },
        )
    }

    // ── Rebaser ───────────────────────────────────────────────────────

    #[test]
    fn test_rebaser_starts_at_zero() {
        let mut r = TimestampRebaser::new();
        assert_eq!(r.rebase(5_000_000), Some(0));
        assert_eq!(r.rebase(5_033_333), Some(33_333));
        assert_eq!(r.origin_us(), Some(5_000_000));
    }

    #[test]
    fn test_rebaser_allows_equal_timestamps() {
        let mut r = TimestampRebaser::new();
        r.rebase(100);
        assert_eq!(r.rebase(200), Some(100));
        assert_eq!(r.rebase(200), Some(100));
    }

    #[test]
    fn test_rebaser_rejects_going_backwards() {
        let mut r = TimestampRebaser::new();
        r.rebase(1_000);
        r.rebase(2_000);
        assert_eq!(r.rebase(1_500), None);
        assert_eq!(r.rebase(500), None);
        assert_eq!(r.rebase(3_000), Some(2_000));
    }

    // ── Loop ──────────────────────────────────────────────────────────

    #[test]
    fn test_payload_before_format_is_discarded() {
        let events = vec![
            Ok(OutputEvent::Buffer(buffer(0, 10, 1_000, true))),
            Ok(OutputEvent::FormatChanged(output_format())),
            Ok(OutputEvent::Buffer(buffer(1, 10, 2_000, true))),
            Ok(OutputEvent::EndOfStream),
        ];
        let (outcome, h) = run_script(events, RecordingMuxer::new());

        assert_eq!(outcome.exit, DrainExit::EndOfStream);
        let log = h.muxer_log.lock().unwrap();
        assert_eq!(log.samples.len(), 1);
        assert_eq!(log.samples[0].presentation_time_us, 0);
        assert_eq!(*h.released.lock().unwrap(), vec![0, 1]);
        assert_eq!(h.stats.snapshot().samples_discarded, 1);
    }

    #[test]
    fn test_track_registered_once_then_started() {
        let events = vec![
            Ok(OutputEvent::FormatChanged(output_format())),
            Ok(OutputEvent::FormatChanged(output_format())),
            Ok(OutputEvent::EndOfStream),
        ];
        let (_, h) = run_script(events, RecordingMuxer::new());
        let log = h.muxer_log.lock().unwrap();
        assert_eq!(log.tracks.len(), 1);
        assert!(log.started);
    }

    #[test]
    fn test_timestamps_rebased_and_non_decreasing() {
        let events = vec![
            Ok(OutputEvent::FormatChanged(output_format())),
            Ok(OutputEvent::Buffer(buffer(0, 8, 7_000_000, true))),
            Ok(OutputEvent::TryAgainLater),
            Ok(OutputEvent::Buffer(buffer(1, 8, 7_033_333, false))),
            Ok(OutputEvent::Buffer(buffer(2, 8, 7_066_666, false))),
            Ok(OutputEvent::EndOfStream),
        ];
        let (_, h) = run_script(events, RecordingMuxer::new());
        let log = h.muxer_log.lock().unwrap();
        let ts: Vec<i64> = log.samples.iter().map(|s| s.presentation_time_us).collect();
        assert_eq!(ts, vec![0, 33_333, 66_666]);
        assert!(log.samples[0].is_key_frame);
        assert!(log.samples.iter().all(|s| s.track_index == 0));
    }

    #[test]
    fn test_config_and_empty_buffers_are_not_written() {
        let mut config = buffer(0, 30, 0, false);
        config.flags.codec_config = true;
        let events = vec![
            Ok(OutputEvent::FormatChanged(output_format())),
            Ok(OutputEvent::Buffer(config)),
            Ok(OutputEvent::Buffer(buffer(1, 0, 10, false))),
            Ok(OutputEvent::Buffer(buffer(2, 5, 20, true))),
            Ok(OutputEvent::EndOfStream),
        ];
        let (_, h) = run_script(events, RecordingMuxer::new());
        let log = h.muxer_log.lock().unwrap();
        assert_eq!(log.samples.len(), 1);
        assert_eq!(log.samples[0].presentation_time_us, 0);
        assert_eq!(*h.released.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_buffer_released_even_when_write_fails() {
        let events = vec![
            Ok(OutputEvent::FormatChanged(output_format())),
            Ok(OutputEvent::Buffer(buffer(3, 8, 0, true))),
            Ok(OutputEvent::Buffer(buffer(4, 8, 10, false))),
        ];
        let (outcome, h) = run_script(events, RecordingMuxer::failing_writes());

        assert_eq!(outcome.exit, DrainExit::Failed);
        assert_eq!(*h.released.lock().unwrap(), vec![3]);
        let err = h.errors.try_recv().unwrap();
        assert!(matches!(err, RecorderError::Muxer(_)));
        assert!(h.errors.try_recv().is_err(), "error must be published once");
        assert_eq!(h.state.get(), SessionState::Draining);
        assert!(h.drained.try_recv().is_ok());
    }

    #[test]
    fn test_encoder_error_is_fatal() {
        let events = vec![
            Ok(OutputEvent::FormatChanged(output_format())),
            Err("codec fault".to_string()),
            Ok(OutputEvent::Buffer(buffer(0, 8, 0, true))),
        ];
        let (outcome, h) = run_script(events, RecordingMuxer::new());
        assert_eq!(outcome.exit, DrainExit::Failed);
        assert!(matches!(h.errors.try_recv().unwrap(), RecorderError::Encoder(_)));
        assert!(h.muxer_log.lock().unwrap().samples.is_empty());
    }

    #[test]
    fn test_end_of_stream_flag_on_buffer_ends_loop() {
        let mut last = buffer(1, 8, 40, false);
        last.flags = BufferFlags {
            end_of_stream: true,
            ..BufferFlags::default()
        };
        let events = vec![
            Ok(OutputEvent::FormatChanged(output_format())),
            Ok(OutputEvent::Buffer(buffer(0, 8, 0, true))),
            Ok(OutputEvent::Buffer(last)),
            Ok(OutputEvent::Buffer(buffer(2, 8, 80, false))),
        ];
        let (outcome, h) = run_script(events, RecordingMuxer::new());
        assert_eq!(outcome.exit, DrainExit::EndOfStream);
        assert_eq!(h.muxer_log.lock().unwrap().samples.len(), 2);
        assert!(h.drained.try_recv().is_ok());
    }

    #[test]
    fn test_stopped_state_ends_loop() {
        let output = ScriptedOutput::new(Vec::new());
        let state = Arc::new(SessionStateCell::new(SessionState::Recording));
        let (err_tx, _err_rx) = crossbeam_channel::unbounded();
        let (drained_tx, _drained_rx) = crossbeam_channel::bounded(1);
        let drain = DrainLoop::new(
            Box::new(output),
            Box::new(RecordingMuxer::new()),
            state.clone(),
            Arc::new(SessionStats::new()),
            err_tx,
            drained_tx,
            Duration::from_millis(1),
            Duration::from_millis(1),
        );
        let handle = drain.spawn().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        state.set(SessionState::Stopped);
        let outcome = handle.join().unwrap();
        assert_eq!(outcome.exit, DrainExit::Stopped);
    }
}
