use crate::shared::pipeline_config::PipelineConfig;
use crate::shared::session_settings::SessionSettings;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VideoCodec {
    H264,
}

impl VideoCodec {
    pub fn mime_type(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "video/avc",
        }
    }
}

/// What the session asks the encoder for.
#[derive(Clone, Debug, PartialEq)]
pub struct EncoderFormat {
    pub codec: VideoCodec,
    pub width: u32,
    pub height: u32,
    pub bit_rate: u64,
    pub frame_rate: u32,
    pub key_frame_interval_secs: u32,
    /// Encoder names to try, in order. Empty means "any H.264 encoder".
    pub preferred_encoders: Vec<String>,
}

impl EncoderFormat {
    /// Bit rate scales with the canvas area.
    pub fn from_config(config: &PipelineConfig, settings: &SessionSettings) -> Self {
        let pixels = config.target_width as u64 * config.target_height as u64;
        Self {
            codec: VideoCodec::H264,
            width: config.target_width,
            height: config.target_height,
            bit_rate: pixels * settings.bit_rate_multiplier as u64,
            frame_rate: config.frame_rate,
            key_frame_interval_secs: settings.key_frame_interval_secs.max(1),
            preferred_encoders: settings.preferred_encoders.clone(),
        }
    }

    /// Frames between forced key frames.
    pub fn gop_size(&self) -> u32 {
        (self.frame_rate * self.key_frame_interval_secs).max(1)
    }
}

/// What the encoder actually produces, reported once before any payload.
#[derive(Clone, Debug, PartialEq)]
pub struct OutputFormat {
    pub codec: VideoCodec,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub bit_rate: u64,
    /// Codec-private setup data (SPS/PPS in avcC form for H.264).
    pub extradata: Vec<u8>,
}
