use std::time::Duration;

/// Bits per second per pixel of the target canvas.
pub const BIT_RATE_MULTIPLIER: u32 = 4;

/// Seconds between forced key frames.
pub const KEY_FRAME_INTERVAL_SECS: u32 = 1;

/// How long one drain-loop poll waits for encoder output.
pub const DRAIN_POLL_TIMEOUT: Duration = Duration::from_millis(10);

/// Sleep after an empty poll so the drain loop does not spin.
pub const DRAIN_BACKOFF: Duration = Duration::from_millis(2);

/// Upper bound on how long `stop()` waits for in-flight frames to drain.
pub const DRAIN_GRACE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Frames the producer surface queues before it starts dropping.
pub const SURFACE_QUEUE_DEPTH: usize = 4;

/// Encoded output buffers the encoder can hand out before it stalls.
pub const OUTPUT_BUFFER_COUNT: usize = 8;

/// H.264 encoders tried in order; hardware first.
pub const PREFERRED_H264_ENCODERS: &[&str] = &[
    "h264_videotoolbox",
    "h264_nvenc",
    "h264_qsv",
    "h264_amf",
    "libx264",
];

pub const MIN_FRAME_RATE: u32 = 1;
pub const MAX_FRAME_RATE: u32 = 240;

/// Microseconds per second; encoder and sample timestamps use this unit.
pub const MICROS_PER_SECOND: i64 = 1_000_000;
