//! Circular reference buffer holding the last `order` samples.
//!
//! Tap `k` is the sample pushed `k` calls ago (tap 0 is the newest). The
//! write index rotates through the storage so a push never moves data.

use crate::error::{DspError, DspResult};

#[derive(Clone, Debug, PartialEq)]
pub struct DelayLine {
    samples: Vec<f64>,
    /// Next slot to overwrite (the oldest sample).
    write: usize,
}

impl DelayLine {
    /// Zeroed delay line. `len` must be non-zero.
    pub fn new(len: usize) -> Self {
        Self {
            samples: vec![0.0; len.max(1)],
            write: 0,
        }
    }

    /// Rebuild from stored parts, e.g. a decoded checkpoint.
    pub fn from_parts(samples: Vec<f64>, write: usize) -> DspResult<Self> {
        if samples.is_empty() {
            return Err(DspError::InvalidConfig("delay line must not be empty"));
        }
        if write >= samples.len() {
            return Err(DspError::InvalidConfig("delay line write index out of range"));
        }
        Ok(Self { samples, write })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn write_index(&self) -> usize {
        self.write
    }

    /// Raw storage in slot order (not tap order).
    pub fn raw(&self) -> &[f64] {
        &self.samples
    }

    /// Overwrite the oldest sample.
    #[inline]
    pub fn push(&mut self, x: f64) {
        self.samples[self.write] = x;
        self.write = (self.write + 1) % self.samples.len();
    }

    /// Sample pushed `k` calls ago. `k` must be below `len()`.
    #[inline]
    pub fn tap(&self, k: usize) -> f64 {
        let n = self.samples.len();
        self.samples[(self.write + n - 1 - k) % n]
    }

    /// Write taps newest-first into `out` (`out.len() == len()`).
    pub fn copy_taps_into(&self, out: &mut [f64]) {
        let n = self.samples.len();
        debug_assert_eq!(out.len(), n);
        // newest sample sits just before the write index
        let newest = (self.write + n - 1) % n;
        let (head, tail) = out.split_at_mut(newest + 1);
        for (dst, src) in head.iter_mut().zip(self.samples[..=newest].iter().rev()) {
            *dst = *src;
        }
        for (dst, src) in tail.iter_mut().zip(self.samples[newest + 1..].iter().rev()) {
            *dst = *src;
        }
    }

    pub fn clear(&mut self) {
        self.samples.fill(0.0);
        self.write = 0;
    }
}
