use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

/// Counters updated by the frame source and the drain loop.
///
/// Lock-free so the capture thread never waits on the drain thread.
#[derive(Debug)]
pub struct SessionStats {
    frames_submitted: AtomicU64,
    frames_rejected: AtomicU64,
    samples_written: AtomicU64,
    samples_discarded: AtomicU64,
    key_frames: AtomicU64,
    bytes_written: AtomicU64,
    last_timestamp_us: AtomicI64,
    started: Instant,
}

/// Point-in-time copy of [`SessionStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub frames_submitted: u64,
    pub frames_rejected: u64,
    pub samples_written: u64,
    pub samples_discarded: u64,
    pub key_frames: u64,
    pub bytes_written: u64,
    pub last_timestamp_us: i64,
}

impl SessionStats {
    pub fn new() -> Self {
        Self {
            frames_submitted: AtomicU64::new(0),
            frames_rejected: AtomicU64::new(0),
            samples_written: AtomicU64::new(0),
            samples_discarded: AtomicU64::new(0),
            key_frames: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            last_timestamp_us: AtomicI64::new(0),
            started: Instant::now(),
        }
    }

    pub fn frame_submitted(&self) {
        self.frames_submitted.fetch_add(1, Ordering::Relaxed);
    }

    /// A frame reached the surface but the surface refused it.
    pub fn frame_rejected(&self) {
        self.frames_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sample_written(&self, bytes: usize, key_frame: bool, timestamp_us: i64) {
        self.samples_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
        if key_frame {
            self.key_frames.fetch_add(1, Ordering::Relaxed);
        }
        self.last_timestamp_us.store(timestamp_us, Ordering::Relaxed);
    }

    pub fn sample_discarded(&self) {
        self.samples_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_submitted: self.frames_submitted.load(Ordering::Relaxed),
            frames_rejected: self.frames_rejected.load(Ordering::Relaxed),
            samples_written: self.samples_written.load(Ordering::Relaxed),
            samples_discarded: self.samples_discarded.load(Ordering::Relaxed),
            key_frames: self.key_frames.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            last_timestamp_us: self.last_timestamp_us.load(Ordering::Relaxed),
        }
    }

    /// Human-readable report, or `None` if nothing was submitted.
    pub fn summary_string(&self) -> Option<String> {
        let s = self.snapshot();
        if s.frames_submitted == 0 && s.samples_written == 0 {
            return None;
        }

        let elapsed = self.started.elapsed().as_secs_f64();
        let media_secs = s.last_timestamp_us as f64 / 1_000_000.0;
        let mut lines = vec![format!(
            "Recording summary ({} frames submitted, {elapsed:.1}s wall clock):",
            s.frames_submitted
        )];
        lines.push(format!(
            "  samples   : {} written, {} discarded, {} key frames",
            s.samples_written, s.samples_discarded, s.key_frames
        ));
        lines.push(format!("  rejected  : {}", s.frames_rejected));
        lines.push(format!(
            "  output    : {:.1} KiB, {media_secs:.2}s of media",
            s.bytes_written as f64 / 1024.0
        ));
        if media_secs > 0.0 {
            let kbps = s.bytes_written as f64 * 8.0 / media_secs / 1000.0;
            lines.push(format!("  bit rate  : {kbps:.0} kbit/s"));
        }
        Some(lines.join("\n"))
    }
}

impl Default for SessionStats {
    fn default() -> Self {
        Self::new()
    }
}
