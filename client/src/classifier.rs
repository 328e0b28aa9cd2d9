//! Tonal alarm detector standing in for a trained sound-event model.
//!
//! Sirens and alarms are dominated by a single strong tone in the low kHz
//! range. The detector scans that band with Goertzel filters and reports how
//! much of the chunk's energy sits in the strongest bin.

use std::f64::consts::TAU;

use anc_dsp::rms;
use anc_engine::{ClassifierError, EmergencyVerdict, NoiseClassifier};

pub struct ToneAlarmClassifier {
    low_hz: f64,
    high_hz: f64,
    step_hz: f64,
    /// Chunks quieter than this are never alarms.
    min_rms: f64,
    /// Tonality at or above which the chunk is flagged.
    tonality: f64,
}

impl Default for ToneAlarmClassifier {
    fn default() -> Self {
        Self {
            low_hz: 500.0,
            high_hz: 3_000.0,
            step_hz: 25.0,
            min_rms: 0.05,
            tonality: 0.5,
        }
    }
}

/// Power of `samples` at `freq`.
fn goertzel(samples: &[f64], freq: f64, sample_rate: f64) -> f64 {
    let coeff = 2.0 * (TAU * freq / sample_rate).cos();
    let (mut s1, mut s2) = (0.0, 0.0);
    for &x in samples {
        let s0 = x + coeff * s1 - s2;
        s2 = s1;
        s1 = s0;
    }
    s1 * s1 + s2 * s2 - coeff * s1 * s2
}

impl ToneAlarmClassifier {
    /// Fraction of the chunk's energy in the strongest band bin, in [0, 1].
    pub fn tonality(&self, samples: &[f64], sample_rate: u32) -> f64 {
        let energy: f64 = samples.iter().map(|x| x * x).sum();
        if energy <= 0.0 || samples.is_empty() {
            return 0.0;
        }
        let fs = sample_rate as f64;
        let nyquist = fs / 2.0;
        let mut best = 0.0f64;
        let mut f = self.low_hz;
        while f <= self.high_hz && f < nyquist {
            best = best.max(goertzel(samples, f, fs));
            f += self.step_hz;
        }
        // a full-scale sinusoid at a bin centre gives (N/2) * energy
        (best / (samples.len() as f64 / 2.0 * energy)).clamp(0.0, 1.0)
    }
}

impl NoiseClassifier for ToneAlarmClassifier {
    fn classify(
        &self,
        samples: &[f64],
        sample_rate: u32,
    ) -> Result<EmergencyVerdict, ClassifierError> {
        if sample_rate == 0 {
            return Err(ClassifierError::Failed("sample rate is zero".into()));
        }
        if rms(samples) < self.min_rms {
            return Ok(EmergencyVerdict::clear());
        }
        let confidence = self.tonality(samples, sample_rate);
        if confidence >= self.tonality {
            Ok(EmergencyVerdict::emergency("alarm", confidence))
        } else {
            Ok(EmergencyVerdict {
                is_emergency: false,
                category: "background".into(),
                confidence: 1.0 - confidence,
            })
        }
    }
}
