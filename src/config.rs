//! Configuration for the capture engine: ring format, session policy, detector, output.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::audio::detect::DetectorConfig;
use crate::audio::AudioFormat;
use crate::session::SessionPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Ring store sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RingConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
    pub capacity_secs: u32,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            sample_rate: 8000,
            channels: 1,
            bit_depth: 16,
            capacity_secs: 60,
        }
    }
}

impl RingConfig {
    pub fn format(&self) -> AudioFormat {
        AudioFormat {
            sample_rate: self.sample_rate,
            channels: self.channels,
            bit_depth: self.bit_depth,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub ring: RingConfig,
    pub session: SessionPolicy,
    pub detector: DetectorConfig,
    /// Where the file sink writes recordings.
    pub output_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ring: RingConfig::default(),
            session: SessionPolicy::default(),
            detector: DetectorConfig::default(),
            output_dir: PathBuf::from("recordings"),
        }
    }
}

impl Config {
    /// Load from a JSON file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let ring = &self.ring;
        let policy = &self.session;
        let invalid = |msg: String| -> Result<(), ConfigError> { Err(ConfigError::Invalid(msg)) };

        if ring.sample_rate == 0 || ring.channels == 0 || ring.capacity_secs == 0 {
            return invalid("sample_rate, channels and capacity_secs must be > 0".into());
        }
        if ring.bit_depth != 16 {
            return invalid(format!("bit_depth {} unsupported, only 16", ring.bit_depth));
        }
        let durations = [
            policy.pre_roll_secs,
            policy.max_duration_secs,
            policy.knock_extension_secs,
            policy.duration_ceiling_secs,
        ];
        if durations.iter().any(|d| !d.is_finite() || *d < 0.0) {
            return invalid("session durations must be finite and >= 0".into());
        }
        if policy.max_duration_secs <= 0.0 {
            return invalid("max_duration_secs must be > 0".into());
        }
        if policy.pre_roll_secs > ring.capacity_secs as f64 {
            return invalid(format!(
                "pre_roll_secs {} exceeds ring capacity {}",
                policy.pre_roll_secs, ring.capacity_secs
            ));
        }
        if policy.duration_ceiling_secs < policy.max_duration_secs {
            return invalid("duration_ceiling_secs must be >= max_duration_secs".into());
        }
        if policy.tick_interval_ms == 0 || self.detector.frame_ms == 0 {
            return invalid("tick_interval_ms and detector.frame_ms must be > 0".into());
        }
        if policy.duration_ceiling_secs > ring.capacity_secs as f64 {
            warn!(
                ceiling = policy.duration_ceiling_secs,
                capacity = ring.capacity_secs,
                "sessions may outgrow the ring; long recordings will be partial"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn partial_json_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("knockcap.json");
        std::fs::write(
            &path,
            r#"{"ring":{"sample_rate":16000},"session":{"pre_roll_secs":2.5}}"#,
        )
        .unwrap();
        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.ring.sample_rate, 16000);
        assert_eq!(cfg.ring.capacity_secs, 60);
        assert_eq!(cfg.session.pre_roll_secs, 2.5);
        assert_eq!(cfg.session.max_duration_secs, 30.0);
    }

    #[test]
    fn rejects_bad_values() {
        let mut cfg = Config::default();
        cfg.ring.bit_depth = 24;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));

        let mut cfg = Config::default();
        cfg.session.pre_roll_secs = 61.0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.session.duration_ceiling_secs = 10.0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.session.max_duration_secs = f64::NAN;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = Config::load(Path::new("/nonexistent/knockcap.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
