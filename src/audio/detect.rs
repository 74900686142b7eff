//! Reference knock detector for offline replay.
//! Pipeline: frame → RMS → spike over a moving energy baseline → single/double grouping.
//! Real deployments plug their own classifier in through [`KnockDetector`];
//! the session engine never inspects samples itself.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::knock::{KnockEvent, KnockKind};

/// RMS energy over a frame of PCM samples.
#[inline]
pub fn compute_rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| f64::from(s).powi(2)).sum();
    (sum / samples.len() as f64).sqrt() as f32
}

/// Knock detector trait (model adapter).
pub trait KnockDetector: Send {
    /// Feed one frame that ends at `at`. Returns a knock once it is classified.
    fn process(&mut self, samples: &[i16], at: DateTime<Utc>) -> Option<KnockEvent>;

    /// Emit anything still pending (end of stream).
    fn flush(&mut self) -> Option<KnockEvent>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Frame length fed to the detector.
    pub frame_ms: u32,
    /// RMS must exceed baseline * ratio to count as a spike.
    pub spike_ratio: f32,
    /// Lower bound on the baseline, raw i16 RMS.
    pub noise_floor: f32,
    /// Spikes scoring below this are ignored.
    pub min_confidence: f32,
    /// Second spike within this gap turns a single into a double.
    pub double_gap_ms: u32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            frame_ms: 20,
            spike_ratio: 3.0,
            noise_floor: 100.0,
            min_confidence: 0.1,
            double_gap_ms: 400,
        }
    }
}

struct PendingKnock {
    at: DateTime<Utc>,
    confidence: f32,
}

/// Energy-spike detector. Classifying single vs double needs `double_gap_ms` of
/// lookahead, so a single knock is reported that long after it happened.
pub struct EnergySpikeDetector {
    config: DetectorConfig,
    /// Smoothed energy baseline.
    prev_energy: f32,
    /// Cleared while a spike is in progress so one knock spanning frames counts once.
    armed: bool,
    pending: Option<PendingKnock>,
}

impl EnergySpikeDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            prev_energy: 0.0,
            armed: true,
            pending: None,
        }
    }

    fn double_gap(&self) -> Duration {
        Duration::milliseconds(self.config.double_gap_ms as i64)
    }

    fn score(&self, rms: f32) -> f32 {
        let baseline = self.prev_energy.max(self.config.noise_floor);
        let ratio = self.config.spike_ratio;
        if rms > baseline * ratio {
            ((rms / baseline - ratio) / ratio).clamp(0.0, 1.0)
        } else {
            0.0
        }
    }
}

impl KnockDetector for EnergySpikeDetector {
    fn process(&mut self, samples: &[i16], at: DateTime<Utc>) -> Option<KnockEvent> {
        if samples.is_empty() {
            return None;
        }
        let rms = compute_rms(samples);
        let score = self.score(rms);
        let spike = score > 0.0 && score >= self.config.min_confidence;
        // Exponential moving average for energy tracking
        self.prev_energy = self.prev_energy * 0.9 + rms * 0.1;

        if !spike {
            self.armed = true;
            let gap = self.double_gap();
            if self.pending.as_ref().is_some_and(|p| at - p.at > gap) {
                return self.flush();
            }
            return None;
        }
        if !self.armed {
            return None;
        }
        self.armed = false;

        match self.pending.take() {
            Some(p) if at - p.at <= self.double_gap() => Some(KnockEvent::new(
                p.at,
                p.confidence.max(score),
                KnockKind::Double,
            )),
            Some(p) => {
                self.pending = Some(PendingKnock { at, confidence: score });
                Some(KnockEvent::new(p.at, p.confidence, KnockKind::Single))
            }
            None => {
                self.pending = Some(PendingKnock { at, confidence: score });
                None
            }
        }
    }

    fn flush(&mut self) -> Option<KnockEvent> {
        self.pending
            .take()
            .map(|p| KnockEvent::new(p.at, p.confidence, KnockKind::Single))
    }
}
