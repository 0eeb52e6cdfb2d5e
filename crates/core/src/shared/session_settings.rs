use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::shared::constants::{
    BIT_RATE_MULTIPLIER, DRAIN_BACKOFF, DRAIN_GRACE_TIMEOUT, DRAIN_POLL_TIMEOUT,
    KEY_FRAME_INTERVAL_SECS, PREFERRED_H264_ENCODERS, SURFACE_QUEUE_DEPTH,
};
use crate::shared::error::BoxError;

/// Tunables shared by every recording session.
///
/// Persisted as JSON; missing fields fall back to the defaults in
/// [`crate::shared::constants`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub poll_timeout_ms: u64,
    pub backoff_ms: u64,
    pub drain_grace_ms: u64,
    pub bit_rate_multiplier: u32,
    pub key_frame_interval_secs: u32,
    pub surface_queue_depth: usize,
    pub preferred_encoders: Vec<String>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            poll_timeout_ms: DRAIN_POLL_TIMEOUT.as_millis() as u64,
            backoff_ms: DRAIN_BACKOFF.as_millis() as u64,
            drain_grace_ms: DRAIN_GRACE_TIMEOUT.as_millis() as u64,
            bit_rate_multiplier: BIT_RATE_MULTIPLIER,
            key_frame_interval_secs: KEY_FRAME_INTERVAL_SECS,
            surface_queue_depth: SURFACE_QUEUE_DEPTH,
            preferred_encoders: PREFERRED_H264_ENCODERS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl SessionSettings {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }

    pub fn load(path: &Path) -> Result<Self, BoxError> {
        let json = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), BoxError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_constants() {
        let s = SessionSettings::default();
        assert_eq!(s.poll_timeout(), DRAIN_POLL_TIMEOUT);
        assert_eq!(s.backoff(), DRAIN_BACKOFF);
        assert_eq!(s.drain_grace(), DRAIN_GRACE_TIMEOUT);
        assert_eq!(s.key_frame_interval_secs, 1);
        assert_eq!(s.preferred_encoders.last().unwrap(), "libx264");
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let settings = SessionSettings {
            drain_grace_ms: 250,
            preferred_encoders: vec!["libx264".to_string()],
            ..SessionSettings::default()
        };
        settings.save(&path).unwrap();
        assert_eq!(SessionSettings::load(&path).unwrap(), settings);
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let parsed: SessionSettings = serde_json::from_str(r#"{"backoff_ms": 7}"#).unwrap();
        assert_eq!(parsed.backoff_ms, 7);
        assert_eq!(parsed.poll_timeout_ms, SessionSettings::default().poll_timeout_ms);
    }

    #[test]
    fn test_load_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(SessionSettings::load(&dir.path().join("absent.json")).is_err());
    }
}
