use std::path::PathBuf;

use crate::shared::constants::{MAX_FRAME_RATE, MIN_FRAME_RATE};
use crate::shared::error::RecorderError;

/// Fixed parameters of one recording, supplied to `prepare()`.
#[derive(Clone, Debug, PartialEq)]
pub struct PipelineConfig {
    pub target_width: u32,
    pub target_height: u32,
    pub frame_rate: u32,
    pub output_path: PathBuf,
}

impl PipelineConfig {
    pub fn new(
        target_width: u32,
        target_height: u32,
        frame_rate: u32,
        output_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            target_width,
            target_height,
            frame_rate,
            output_path: output_path.into(),
        }
    }

    /// Rejects configurations no H.264 encoder will accept.
    ///
    /// 4:2:0 chroma subsampling needs even dimensions.
    pub fn validate(&self) -> Result<(), RecorderError> {
        if self.target_width == 0 || self.target_height == 0 {
            return Err(RecorderError::InvalidConfig(format!(
                "target size {}x{} must be non-zero",
                self.target_width, self.target_height
            )));
        }
        if self.target_width % 2 != 0 || self.target_height % 2 != 0 {
            return Err(RecorderError::InvalidConfig(format!(
                "target size {}x{} must be even",
                self.target_width, self.target_height
            )));
        }
        if !(MIN_FRAME_RATE..=MAX_FRAME_RATE).contains(&self.frame_rate) {
            return Err(RecorderError::InvalidConfig(format!(
                "frame rate {} outside {MIN_FRAME_RATE}..={MAX_FRAME_RATE}",
                self.frame_rate
            )));
        }
        if self.output_path.as_os_str().is_empty() {
            return Err(RecorderError::InvalidConfig(
                "output path is empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Nominal spacing between frames in microseconds.
    pub fn frame_duration_us(&self) -> i64 {
        crate::shared::constants::MICROS_PER_SECOND / self.frame_rate.max(1) as i64
    }
}
