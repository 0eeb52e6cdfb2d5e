use std::path::Path;

use crate::encoding::domain::encoder_format::OutputFormat;
use crate::muxing::domain::encoded_sample::EncodedSample;
use crate::shared::error::BoxError;

/// Abstracts the container writer so the drain loop can write samples
/// without depending on a specific muxing library.
///
/// Call order: `open → add_track → start → write_sample* → finalize`.
pub trait Muxer: Send {
    fn open(&mut self, path: &Path) -> Result<(), BoxError>;

    /// Registers the single video track. Only valid once, before `start`.
    fn add_track(&mut self, format: &OutputFormat) -> Result<usize, BoxError>;

    fn start(&mut self) -> Result<(), BoxError>;

    fn write_sample(&mut self, track_index: usize, sample: &EncodedSample) -> Result<(), BoxError>;

    /// Writes the container index and closes the file. Skips the trailer
    /// when the writer was never started.
    fn finalize(&mut self) -> Result<(), BoxError>;
}
