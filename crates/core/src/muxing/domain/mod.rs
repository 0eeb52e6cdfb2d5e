pub mod encoded_sample;
pub mod muxer;
