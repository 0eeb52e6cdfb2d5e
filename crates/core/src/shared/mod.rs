pub mod constants;
pub mod error;
pub mod frame;
pub mod pipeline_config;
pub mod session_settings;
