//! Anti-noise generation and cancellation measurement.
//!
//! Two modes:
//!   - phase inversion: `anti = -noise * amplitude`
//!   - adaptive: `anti = -y * amplitude` where `y` is the adaptive filter's
//!     estimate of the noise reaching the listener, so `observed + anti`
//!     tends to zero as the filter converges.

use crate::error::{DspError, DspResult};
use crate::filter::AdaptiveFilter;

/// Largest reduction ever reported; used when the residual is numerically zero.
pub const MAX_REDUCTION_DB: f64 = 200.0;

/// Per-sample tolerance for a "perfect" cancellation.
pub const PERFECT_TOLERANCE: f64 = 1e-10;

/// Borrows the session's filter (if any) for the duration of one chunk.
pub struct AntiNoiseGenerator<'f> {
    filter: Option<&'f mut AdaptiveFilter>,
}

impl AntiNoiseGenerator<'static> {
    pub fn phase_inversion() -> Self {
        Self { filter: None }
    }
}

impl<'f> AntiNoiseGenerator<'f> {
    pub fn adaptive(filter: &'f mut AdaptiveFilter) -> Self {
        Self {
            filter: Some(filter),
        }
    }

    pub fn is_adaptive(&self) -> bool {
        self.filter.is_some()
    }

    /// Anti-noise for `noise`. In adaptive mode the filter learns to
    /// reproduce `noise` from itself.
    pub fn generate_anti_noise(
        &mut self,
        noise: &[f64],
        amplitude_match: f64,
    ) -> DspResult<Vec<f64>> {
        match self.filter.as_deref_mut() {
            None => Ok(invert(noise, amplitude_match)),
            Some(filter) => {
                let out = filter.process(noise, noise)?;
                Ok(invert(&out.output, amplitude_match))
            }
        }
    }

    /// Anti-noise for the `observed` signal, using `reference` as the
    /// filter input. Falls back to inverting `observed` without a filter.
    pub fn generate_for(
        &mut self,
        reference: &[f64],
        observed: &[f64],
        amplitude_match: f64,
    ) -> DspResult<Vec<f64>> {
        if reference.len() != observed.len() {
            return Err(DspError::LengthMismatch {
                expected: reference.len(),
                actual: observed.len(),
            });
        }
        match self.filter.as_deref_mut() {
            None => Ok(invert(observed, amplitude_match)),
            Some(filter) => {
                let out = filter.process(reference, observed)?;
                Ok(invert(&out.output, amplitude_match))
            }
        }
    }
}

fn invert(x: &[f64], amplitude: f64) -> Vec<f64> {
    x.iter().map(|v| -v * amplitude).collect()
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CancellationReport {
    pub original_rms: f64,
    pub anti_rms: f64,
    pub result_rms: f64,
    pub reduction_db: f64,
    pub is_perfect: bool,
}

pub fn rms(x: &[f64]) -> f64 {
    if x.is_empty() {
        return 0.0;
    }
    (x.iter().map(|v| v * v).sum::<f64>() / x.len() as f64).sqrt()
}

/// Measure how well `anti` cancels `noise`.
pub fn verify_cancellation(noise: &[f64], anti: &[f64]) -> DspResult<CancellationReport> {
    if noise.len() != anti.len() {
        return Err(DspError::LengthMismatch {
            expected: noise.len(),
            actual: anti.len(),
        });
    }
    let residual: Vec<f64> = noise.iter().zip(anti).map(|(n, a)| n + a).collect();
    let original_rms = rms(noise);
    let result_rms = rms(&residual);

    let reduction_db = if result_rms <= f64::MIN_POSITIVE {
        MAX_REDUCTION_DB
    } else if original_rms <= f64::MIN_POSITIVE {
        -MAX_REDUCTION_DB
    } else {
        (20.0 * (original_rms / result_rms).log10()).clamp(-MAX_REDUCTION_DB, MAX_REDUCTION_DB)
    };

    Ok(CancellationReport {
        original_rms,
        anti_rms: rms(anti),
        result_rms,
        reduction_db,
        is_perfect: residual.iter().all(|r| r.abs() <= PERFECT_TOLERANCE),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::FilterConfig;

    #[test]
    fn inversion_is_exact() {
        let x = [0.5, -0.25, 1e-300, -3.0, 0.0];
        let anti = AntiNoiseGenerator::phase_inversion()
            .generate_anti_noise(&x, 1.0)
            .unwrap();
        for (a, n) in anti.iter().zip(&x) {
            assert_eq!(*a, -*n);
        }
        let r = verify_cancellation(&x, &anti).unwrap();
        assert!(r.is_perfect);
        assert_eq!(r.result_rms, 0.0);
        assert_eq!(r.reduction_db, MAX_REDUCTION_DB);
    }

    #[test]
    fn half_amplitude_gives_six_db() {
        let x: Vec<f64> = (0..480).map(|i| (i as f64 * 0.1).sin()).collect();
        let anti = AntiNoiseGenerator::phase_inversion()
            .generate_anti_noise(&x, 0.5)
            .unwrap();
        let r = verify_cancellation(&x, &anti).unwrap();
        assert!((r.reduction_db - 6.0206).abs() < 1e-3, "{}", r.reduction_db);
        assert!(!r.is_perfect);
        assert!((r.anti_rms / r.original_rms - 0.5).abs() < 1e-12);
    }

    #[test]
    fn silence_in_silence_out() {
        let r = verify_cancellation(&[0.0; 8], &[0.0; 8]).unwrap();
        assert!(r.is_perfect);
        assert_eq!(r.reduction_db, MAX_REDUCTION_DB);
        assert!(verify_cancellation(&[0.0; 3], &[0.0; 2]).is_err());
    }

    #[test]
    fn adaptive_mode_converges_on_self_reference() {
        let mut f = AdaptiveFilter::new(&FilterConfig::nlms(16, 0.5, 1e-6).unwrap());
        let mut generator = AntiNoiseGenerator::adaptive(&mut f);
        assert!(generator.is_adaptive());
        let x: Vec<f64> = (0..4096).map(|i| (i as f64 * 0.37).sin() * 0.3).collect();
        let mut last = None;
        for chunk in x.chunks(512) {
            let anti = generator.generate_anti_noise(chunk, 1.0).unwrap();
            last = Some(verify_cancellation(chunk, &anti).unwrap());
        }
        let r = last.unwrap();
        assert!(r.reduction_db > 40.0, "{}", r.reduction_db);
    }
}
