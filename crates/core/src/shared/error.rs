use std::path::PathBuf;

use thiserror::Error;

/// Error type used by the encoder and muxer ports.
///
/// `Send + Sync` so failures can cross from the drain thread back to the
/// controlling thread.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("invalid pipeline config: {0}")]
    InvalidConfig(String),
    #[error("session is {actual}, expected {expected}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },
    #[error("failed to set up recording to {path}: {source}")]
    Setup {
        path: PathBuf,
        #[source]
        source: BoxError,
    },
    #[error("encoder fault: {0}")]
    Encoder(#[source] BoxError),
    #[error("muxer fault: {0}")]
    Muxer(#[source] BoxError),
    #[error("drain thread panicked")]
    DrainPanicked,
}

impl RecorderError {
    /// Wraps any displayable error as a setup failure for `path`.
    pub fn setup(path: impl Into<PathBuf>, source: impl Into<BoxError>) -> Self {
        Self::Setup {
            path: path.into(),
            source: source.into(),
        }
    }
}
