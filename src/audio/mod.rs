//! Audio side of the pipeline: sample format, the retention ring, and the reference
//! knock detector used by offline replay.
//! Capture itself is external; producers hand interleaved i16 frames to [`RingStore::write`].

pub mod detect;
pub mod ring_store;

use serde::{Deserialize, Serialize};

pub use ring_store::{RangeError, RingStore};

/// PCM stream format. Samples are always stored as signed 16-bit, interleaved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
}

impl AudioFormat {
    pub fn mono16(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels: 1,
            bit_depth: 16,
        }
    }

    /// Interleaved values per second of audio.
    #[inline]
    pub fn samples_per_sec(&self) -> usize {
        self.sample_rate as usize * self.channels as usize
    }

    /// Seconds of audio represented by `samples` interleaved values.
    #[inline]
    pub fn secs_for(&self, samples: u64) -> f64 {
        samples as f64 / self.samples_per_sec() as f64
    }

    /// Interleaved values covering `secs` of audio, rounded to the nearest whole frame.
    #[inline]
    pub fn samples_for(&self, secs: f64) -> u64 {
        if secs <= 0.0 {
            return 0;
        }
        let frames = (secs * self.sample_rate as f64).round() as u64;
        frames * self.channels as u64
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::mono16(8000)
    }
}
