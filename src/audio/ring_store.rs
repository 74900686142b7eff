//! Sample ring store: fixed pre-allocated circular buffer for interleaved PCM i16.
//! Drop-oldest on overflow. Reads copy out a chronological window so callers never
//! hold a reference into the backing array.

use parking_lot::Mutex;
use thiserror::Error;

use super::AudioFormat;

#[derive(Debug, Error, PartialEq)]
pub enum RangeError {
    #[error("invalid range [{start}, {end}) for capacity {capacity}")]
    InvalidRange { start: f64, end: f64, capacity: f64 },
}

/// Samples copied out of the ring, tagged with their absolute start position.
#[derive(Debug, Clone, PartialEq)]
pub struct Window {
    pub samples: Vec<i16>,
    pub start_pos: u64,
}

struct Inner {
    buffer: Box<[i16]>,
    write_pos: usize,
    total_written: u64,
}

/// Fixed-size ring of the most recent `capacity_secs` of audio. Pre-allocated, never grows.
pub struct RingStore {
    inner: Mutex<Inner>,
    format: AudioFormat,
    capacity_secs: u32,
    capacity: usize,
}

impl RingStore {
    /// Create a store holding `capacity_secs` seconds of `format` audio.
    ///
    /// # Panics
    ///
    /// If the capacity works out to zero samples (zero rate, channels or seconds).
    /// [`Config::validate`](crate::Config::validate) rejects such settings up front.
    pub fn new(format: AudioFormat, capacity_secs: u32) -> Self {
        let capacity = format.samples_per_sec() * capacity_secs as usize;
        assert!(capacity > 0, "ring capacity must be > 0");
        Self {
            inner: Mutex::new(Inner {
                buffer: vec![0i16; capacity].into_boxed_slice(),
                write_pos: 0,
                total_written: 0,
            }),
            format,
            capacity_secs,
            capacity,
        }
    }

    /// Append samples in chronological order, overwriting the oldest data once full.
    /// Returns the total number of samples ever written (write progress).
    pub fn write(&self, samples: &[i16]) -> u64 {
        let mut inner = self.inner.lock();
        // Only the newest `capacity` samples can survive this write.
        let skip = samples.len().saturating_sub(self.capacity);
        let data = &samples[skip..];
        if skip > 0 {
            inner.write_pos = (inner.write_pos + skip) % self.capacity;
        }

        let pos = inner.write_pos;
        let first = data.len().min(self.capacity - pos);
        inner.buffer[pos..pos + first].copy_from_slice(&data[..first]);
        let rest = data.len() - first;
        if rest > 0 {
            inner.buffer[..rest].copy_from_slice(&data[first..]);
        }

        inner.write_pos = (pos + data.len()) % self.capacity;
        inner.total_written += samples.len() as u64;
        inner.total_written
    }

    /// Copy the half-open interval `[start_sec, end_sec)` of the retained span.
    /// `0` is the oldest retained slot and `capacity_secs` the newest.
    pub fn read_range(&self, start_sec: f64, end_sec: f64) -> Result<Vec<i16>, RangeError> {
        let cap_secs = self.capacity_secs as f64;
        let valid = start_sec.is_finite()
            && end_sec.is_finite()
            && 0.0 <= start_sec
            && start_sec <= end_sec
            && end_sec <= cap_secs;
        if !valid {
            return Err(RangeError::InvalidRange {
                start: start_sec,
                end: end_sec,
                capacity: cap_secs,
            });
        }
        // Whole frames only, so interleaved channels never come back shifted.
        let start = (self.format.samples_for(start_sec) as usize).min(self.capacity);
        let end = (self.format.samples_for(end_sec) as usize).min(self.capacity);
        self.read_samples(start, end)
    }

    /// Same contract as [`read_range`](Self::read_range) in sample offsets from the oldest slot.
    pub fn read_samples(&self, start: usize, end: usize) -> Result<Vec<i16>, RangeError> {
        if start > end || end > self.capacity {
            return Err(RangeError::InvalidRange {
                start: start as f64,
                end: end as f64,
                capacity: self.capacity as f64,
            });
        }
        let len = end - start;
        if len == 0 {
            return Ok(Vec::new());
        }

        let inner = self.inner.lock();
        Ok(self.copy_out(&inner, start, len))
    }

    /// Copy the window `[start_pos, end_pos)` given in absolute positions (samples
    /// ever written). The window is shrunk to what is still retained; the returned
    /// [`Window`] says where it actually starts.
    pub fn read_window(&self, start_pos: u64, end_pos: u64) -> Window {
        let inner = self.inner.lock();
        let total = inner.total_written;
        let oldest = total.saturating_sub(self.capacity as u64);
        let end = end_pos.min(total);
        let start = start_pos.max(oldest).min(end);
        if start == end {
            return Window {
                samples: Vec::new(),
                start_pos: start,
            };
        }
        // Offsets count from the oldest physical slot, which sits `capacity` behind `total`.
        let offset = self.capacity - (total - start) as usize;
        let samples = self.copy_out(&inner, offset, (end - start) as usize);
        Window {
            samples,
            start_pos: start,
        }
    }

    fn copy_out(&self, inner: &Inner, start: usize, len: usize) -> Vec<i16> {
        if len == 0 {
            return Vec::new();
        }
        // The oldest slot is the one about to be overwritten.
        let start_idx = (inner.write_pos + start) % self.capacity;
        let end_idx = (inner.write_pos + start + len) % self.capacity;

        let mut out = Vec::with_capacity(len);
        if start_idx < end_idx {
            out.extend_from_slice(&inner.buffer[start_idx..end_idx]);
        } else {
            let tail = self.capacity - start_idx;
            if tail >= len {
                out.extend_from_slice(&inner.buffer[start_idx..start_idx + len]);
            } else {
                out.extend_from_slice(&inner.buffer[start_idx..]);
                out.extend_from_slice(&inner.buffer[..len - tail]);
            }
        }
        out
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn capacity_secs(&self) -> u32 {
        self.capacity_secs
    }

    pub fn capacity_samples(&self) -> usize {
        self.capacity
    }

    /// Samples written since creation, including overwritten ones.
    pub fn total_written(&self) -> u64 {
        self.inner.lock().total_written
    }

    /// Number of slots holding real audio (less than capacity until the first wrap).
    pub fn retained_samples(&self) -> usize {
        let total = self.inner.lock().total_written;
        total.min(self.capacity as u64) as usize
    }
}
