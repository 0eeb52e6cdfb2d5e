use std::time::Duration;

use crate::encoding::domain::encoder_format::{EncoderFormat, OutputFormat};
use crate::shared::error::BoxError;
use crate::shared::frame::Frame;

/// Flags attached to one encoded output buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferFlags {
    pub key_frame: bool,
    /// Codec setup data rather than a picture.
    pub codec_config: bool,
    pub end_of_stream: bool,
}

/// One encoded unit borrowed from the encoder's output pool.
///
/// Must be handed back through [`OutputQueue::release_output`] or the
/// encoder eventually runs out of buffers and stalls.
#[derive(Debug)]
pub struct OutputBuffer {
    pub index: usize,
    pub data: Vec<u8>,
    pub presentation_time_us: i64,
    pub flags: BufferFlags,
}

/// Result of one poll of the encoder's output side.
#[derive(Debug)]
pub enum OutputEvent {
    /// Nothing ready within the timeout.
    TryAgainLater,
    /// Negotiated output format; arrives once, before any payload.
    FormatChanged(OutputFormat),
    Buffer(OutputBuffer),
    /// The encoder has emitted everything it will emit.
    EndOfStream,
}

/// Drawing target that feeds rendered frames straight into the encoder.
///
/// Shared between the capture thread(s) and the controlling thread, so all
/// methods take `&self`.
pub trait InputSurface: Send + Sync {
    /// Queues a canvas-sized RGB frame. Must not block on encoding.
    fn render(&self, frame: &Frame) -> Result<(), BoxError>;

    /// Tells the encoder no more frames will follow.
    fn signal_end_of_stream(&self) -> Result<(), BoxError>;

    fn release(&self) -> Result<(), BoxError>;
}

/// Output side of a started encoder, owned by the drain loop.
pub trait OutputQueue: Send {
    fn dequeue_output(&mut self, timeout: Duration) -> Result<OutputEvent, BoxError>;

    fn release_output(&mut self, index: usize) -> Result<(), BoxError>;
}

/// Abstracts the video encoder so the session does not depend on a
/// specific codec library or device.
///
/// Call order: `configure → create_input_surface → start → stop → release`.
pub trait VideoEncoder: Send {
    fn configure(&mut self, format: &EncoderFormat) -> Result<(), BoxError>;

    fn create_input_surface(&mut self) -> Result<std::sync::Arc<dyn InputSurface>, BoxError>;

    /// Starts encoding and hands over the output side for draining.
    fn start(&mut self) -> Result<Box<dyn OutputQueue>, BoxError>;

    fn stop(&mut self) -> Result<(), BoxError>;

    fn release(&mut self) -> Result<(), BoxError>;
}
