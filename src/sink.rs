//! Artifact sinks. The controller hands every finalized recording to an
//! [`ArtifactSink`] outside its session lock; encoding and storage live here.

use std::fs;
use std::path::PathBuf;

use hound::{WavSpec, WavWriter};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info};

use crate::artifact::RecordingArtifact;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WAV encoding failed: {0}")]
    Wav(#[from] hound::Error),
    #[error("metadata encoding failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("sink rejected artifact: {0}")]
    Rejected(String),
}

/// Persists finalized recordings. Ownership of the artifact passes to the sink.
pub trait ArtifactSink: Send + Sync {
    fn persist(&self, artifact: RecordingArtifact, samples: Vec<i16>) -> Result<(), SinkError>;
}

/// Writes `<id>.wav` (16-bit PCM) and `<id>.json` (metadata) into a directory.
pub struct WavFileSink {
    dir: PathBuf,
}

impl WavFileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, SinkError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        info!(dir = %dir.display(), "wav sink ready");
        Ok(Self { dir })
    }

    pub fn wav_path(&self, artifact: &RecordingArtifact) -> PathBuf {
        self.dir.join(format!("{}.wav", artifact.id))
    }

    pub fn metadata_path(&self, artifact: &RecordingArtifact) -> PathBuf {
        self.dir.join(format!("{}.json", artifact.id))
    }
}

impl ArtifactSink for WavFileSink {
    fn persist(&self, artifact: RecordingArtifact, samples: Vec<i16>) -> Result<(), SinkError> {
        if artifact.bit_depth != 16 {
            return Err(SinkError::Rejected(format!(
                "unsupported bit depth {}",
                artifact.bit_depth
            )));
        }
        let spec = WavSpec {
            channels: artifact.channels,
            sample_rate: artifact.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let wav_path = self.wav_path(&artifact);
        let mut writer = WavWriter::create(&wav_path, spec)?;
        for s in &samples {
            writer.write_sample(*s)?;
        }
        writer.finalize()?;

        // Metadata goes last so a present sidecar implies a complete WAV.
        let meta_path = self.metadata_path(&artifact);
        fs::write(&meta_path, serde_json::to_vec_pretty(&artifact)?)?;

        debug!(
            id = %artifact.id,
            samples = samples.len(),
            path = %wav_path.display(),
            "artifact written"
        );
        Ok(())
    }
}

/// Keeps artifacts in memory. For embedding hosts that encode elsewhere, and tests.
#[derive(Default)]
pub struct MemorySink {
    stored: Mutex<Vec<(RecordingArtifact, Vec<i16>)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.stored.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.stored.lock().is_empty()
    }

    /// Remove and return everything persisted so far, oldest first.
    pub fn take(&self) -> Vec<(RecordingArtifact, Vec<i16>)> {
        std::mem::take(&mut *self.stored.lock())
    }
}

impl ArtifactSink for MemorySink {
    fn persist(&self, artifact: RecordingArtifact, samples: Vec<i16>) -> Result<(), SinkError> {
        self.stored.lock().push((artifact, samples));
        Ok(())
    }
}
