pub mod encoder_format;
pub mod video_encoder;
