pub mod compositing;
pub mod encoding;
pub mod muxing;
pub mod recording;
pub mod shared;
