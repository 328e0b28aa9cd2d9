//! Adaptive FIR filter: LMS, NLMS, RLS and a weighted NLMS/RLS hybrid.
//!
//! `process` walks the chunk one sample at a time:
//!   push reference -> y = w . x -> e = d - y -> algorithm update
//!
//! The output is a pure function of the prior state and the inputs. Inputs
//! containing NaN/Inf are rejected before any state is touched, and a chunk
//! whose arithmetic blows up part-way is rolled back to the state it started
//! from, so non-finite values never reach the weights.

use crate::algorithm::{AlgorithmKind, AlgorithmParams, FilterConfig, NlmsParams};
use crate::delay_line::DelayLine;
use crate::error::{DspError, DspResult};
use crate::rls::{dot, RlsState};

/// Hybrid sub-state: both sub-filters share the delay line but keep their own taps.
#[derive(Clone, Debug, PartialEq)]
pub struct HybridState {
    pub nlms_weight: f64,
    pub rls_weight: f64,
    pub nlms: NlmsParams,
    pub nlms_weights: Vec<f64>,
    pub rls_weights: Vec<f64>,
    pub rls: RlsState,
}

/// Algorithm tag plus whatever per-algorithm state it needs.
#[derive(Clone, Debug, PartialEq)]
pub enum AlgorithmState {
    Lms { step_size: f64 },
    Nlms(NlmsParams),
    Rls(RlsState),
    Hybrid(HybridState),
}

impl AlgorithmState {
    fn new(order: usize, params: &AlgorithmParams) -> Self {
        match *params {
            AlgorithmParams::Lms { step_size } => Self::Lms { step_size },
            AlgorithmParams::Nlms(p) => Self::Nlms(p),
            AlgorithmParams::Rls(p) => Self::Rls(RlsState::new(order, p)),
            AlgorithmParams::Hybrid {
                nlms_weight,
                rls_weight,
                nlms,
                rls,
            } => Self::Hybrid(HybridState {
                nlms_weight,
                rls_weight,
                nlms,
                nlms_weights: vec![0.0; order],
                rls_weights: vec![0.0; order],
                rls: RlsState::new(order, rls),
            }),
        }
    }

    pub fn kind(&self) -> AlgorithmKind {
        match self {
            Self::Lms { .. } => AlgorithmKind::Lms,
            Self::Nlms(_) => AlgorithmKind::Nlms,
            Self::Rls(_) => AlgorithmKind::Rls,
            Self::Hybrid(_) => AlgorithmKind::Hybrid,
        }
    }

    pub fn params(&self) -> AlgorithmParams {
        match self {
            Self::Lms { step_size } => AlgorithmParams::Lms { step_size: *step_size },
            Self::Nlms(p) => AlgorithmParams::Nlms(*p),
            Self::Rls(r) => AlgorithmParams::Rls(r.params),
            Self::Hybrid(h) => AlgorithmParams::Hybrid {
                nlms_weight: h.nlms_weight,
                rls_weight: h.rls_weight,
                nlms: h.nlms,
                rls: h.rls.params,
            },
        }
    }
}

/// Everything that survives between chunks for one session.
///
/// `weights.len() == reference.len() == order`. For the hybrid algorithm
/// `weights` holds the blended taps `a * w_nlms + b * w_rls`.
#[derive(Clone, Debug, PartialEq)]
pub struct FilterState {
    pub weights: Vec<f64>,
    pub reference: DelayLine,
    pub algorithm: AlgorithmState,
    pub iteration_count: u64,
}

impl FilterState {
    pub fn new(cfg: &FilterConfig) -> Self {
        let order = cfg.order();
        Self {
            weights: vec![0.0; order],
            reference: DelayLine::new(order),
            algorithm: AlgorithmState::new(order, cfg.params()),
            iteration_count: 0,
        }
    }

    pub fn order(&self) -> usize {
        self.weights.len()
    }

    pub fn kind(&self) -> AlgorithmKind {
        self.algorithm.kind()
    }

    /// True when this state was built for `cfg` (same order and parameters).
    pub fn matches(&self, cfg: &FilterConfig) -> bool {
        self.order() == cfg.order() && self.algorithm.params() == *cfg.params()
    }

    /// Check the length invariants; used before trusting restored state.
    pub fn validate(&self) -> DspResult<()> {
        let order = self.order();
        if order == 0 {
            return Err(DspError::InvalidConfig("filter order must be non-zero"));
        }
        let check = |actual: usize| {
            if actual == order {
                Ok(())
            } else {
                Err(DspError::LengthMismatch {
                    expected: order,
                    actual,
                })
            }
        };
        check(self.reference.len())?;
        match &self.algorithm {
            AlgorithmState::Rls(r) => check(r.inverse_correlation.dim())?,
            AlgorithmState::Hybrid(h) => {
                check(h.nlms_weights.len())?;
                check(h.rls_weights.len())?;
                check(h.rls.inverse_correlation.dim())?;
            }
            AlgorithmState::Lms { .. } | AlgorithmState::Nlms(_) => {}
        }
        self.algorithm.params().validate()
    }
}

/// Output of one `process` call: filter output `y` and error `e = d - y`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FilterOutput {
    pub output: Vec<f64>,
    pub error: Vec<f64>,
}

pub struct AdaptiveFilter {
    state: FilterState,
    /// Tap vector, newest first.
    taps: Vec<f64>,
    px: Vec<f64>,
    gain: Vec<f64>,
    rls_resets: u64,
}

impl AdaptiveFilter {
    /// Zero weights, zero buffer, `init_scale * I` for RLS.
    pub fn new(cfg: &FilterConfig) -> Self {
        Self::with_state(FilterState::new(cfg))
    }

    /// Adopt previously saved state after checking its invariants.
    pub fn from_state(state: FilterState) -> DspResult<Self> {
        state.validate()?;
        Ok(Self::with_state(state))
    }

    fn with_state(state: FilterState) -> Self {
        let order = state.order();
        Self {
            state,
            taps: vec![0.0; order],
            px: vec![0.0; order],
            gain: vec![0.0; order],
            rls_resets: 0,
        }
    }

    pub fn order(&self) -> usize {
        self.state.order()
    }

    pub fn kind(&self) -> AlgorithmKind {
        self.state.kind()
    }

    pub fn weights(&self) -> &[f64] {
        &self.state.weights
    }

    pub fn reference(&self) -> &DelayLine {
        &self.state.reference
    }

    pub fn iteration_count(&self) -> u64 {
        self.state.iteration_count
    }

    /// Number of inverse-correlation resets since this filter was built.
    pub fn rls_resets(&self) -> u64 {
        self.rls_resets
    }

    pub fn state(&self) -> &FilterState {
        &self.state
    }

    pub fn matches(&self, cfg: &FilterConfig) -> bool {
        self.state.matches(cfg)
    }

    pub fn snapshot(&self) -> FilterState {
        self.state.clone()
    }

    pub fn restore(&mut self, state: FilterState) -> DspResult<()> {
        state.validate()?;
        *self = Self::with_state(state);
        Ok(())
    }

    /// Back to the freshly-built state. The iteration counter is kept.
    pub fn reset(&mut self) {
        let iterations = self.state.iteration_count;
        let params = self.state.algorithm.params();
        let order = self.order();
        self.state.weights.fill(0.0);
        self.state.reference.clear();
        self.state.algorithm = AlgorithmState::new(order, &params);
        self.state.iteration_count = iterations;
    }

    /// Run the filter over one chunk. `reference` and `desired` must have
    /// equal length; an empty chunk is a no-op.
    pub fn process(&mut self, reference: &[f64], desired: &[f64]) -> DspResult<FilterOutput> {
        if reference.len() != desired.len() {
            return Err(DspError::LengthMismatch {
                expected: reference.len(),
                actual: desired.len(),
            });
        }
        if reference.is_empty() {
            return Ok(FilterOutput::default());
        }
        if let Some(index) = first_non_finite(reference).or_else(|| first_non_finite(desired)) {
            return Err(DspError::NonFiniteInput { index });
        }

        let checkpoint = self.state.clone();
        let resets_before = self.rls_resets;
        let mut out = FilterOutput {
            output: Vec::with_capacity(reference.len()),
            error: Vec::with_capacity(reference.len()),
        };

        for (i, (&x, &d)) in reference.iter().zip(desired).enumerate() {
            let (y, e) = self.step(x, d);
            if !y.is_finite() || !e.is_finite() {
                self.state = checkpoint;
                self.rls_resets = resets_before;
                return Err(DspError::Diverged { index: i });
            }
            out.output.push(y);
            out.error.push(e);
        }

        if let AlgorithmState::Hybrid(h) = &self.state.algorithm {
            blend(&mut self.state.weights, h);
        }
        if first_non_finite(&self.state.weights).is_some() {
            self.state = checkpoint;
            self.rls_resets = resets_before;
            return Err(DspError::Diverged {
                index: reference.len() - 1,
            });
        }
        Ok(out)
    }

    fn step(&mut self, x: f64, d: f64) -> (f64, f64) {
        let st = &mut self.state;
        st.reference.push(x);
        st.reference.copy_taps_into(&mut self.taps);
        st.iteration_count += 1;
        let taps = &self.taps;

        match &mut st.algorithm {
            AlgorithmState::Lms { step_size } => {
                let y = dot(&st.weights, taps);
                let e = d - y;
                let step = *step_size * e;
                axpy(&mut st.weights, step, taps);
                (y, e)
            }
            AlgorithmState::Nlms(p) => {
                let y = dot(&st.weights, taps);
                let e = d - y;
                nlms_update(&mut st.weights, taps, e, p);
                (y, e)
            }
            AlgorithmState::Rls(rls) => {
                let y = dot(&st.weights, taps);
                let e = d - y;
                if !rls.update(taps, e, &mut st.weights, &mut self.px, &mut self.gain) {
                    self.rls_resets += 1;
                }
                if rls.check_health(st.iteration_count) {
                    self.rls_resets += 1;
                }
                (y, e)
            }
            AlgorithmState::Hybrid(h) => {
                let y_nlms = dot(&h.nlms_weights, taps);
                let y_rls = dot(&h.rls_weights, taps);
                let y = h.nlms_weight * y_nlms + h.rls_weight * y_rls;
                let e = d - y;

                nlms_update(&mut h.nlms_weights, taps, d - y_nlms, &h.nlms);
                if !h
                    .rls
                    .update(taps, d - y_rls, &mut h.rls_weights, &mut self.px, &mut self.gain)
                {
                    self.rls_resets += 1;
                }
                if h.rls.check_health(st.iteration_count) {
                    self.rls_resets += 1;
                }
                (y, e)
            }
        }
    }
}

fn nlms_update(weights: &mut [f64], taps: &[f64], e: f64, p: &NlmsParams) {
    let power = dot(taps, taps) + p.epsilon;
    axpy(weights, p.step_size * e / power, taps);
}

#[inline]
fn axpy(w: &mut [f64], a: f64, x: &[f64]) {
    for (wi, xi) in w.iter_mut().zip(x) {
        *wi += a * xi;
    }
}

fn blend(out: &mut [f64], h: &HybridState) {
    for ((o, n), r) in out.iter_mut().zip(&h.nlms_weights).zip(&h.rls_weights) {
        *o = h.nlms_weight * n + h.rls_weight * r;
    }
}

fn first_non_finite(xs: &[f64]) -> Option<usize> {
    xs.iter().position(|v| !v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::RlsParams;
    use crate::rls::SquareMatrix;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn noise(seed: u64, n: usize) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n).map(|_| rng.gen_range(-1.0..1.0)).collect()
    }

    #[test]
    fn empty_chunk_is_noop() {
        let mut f = AdaptiveFilter::new(&FilterConfig::nlms(8, 0.5, 1e-6).unwrap());
        let before = f.snapshot();
        let out = f.process(&[], &[]).unwrap();
        assert!(out.output.is_empty() && out.error.is_empty());
        assert_eq!(f.snapshot(), before);
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let mut f = AdaptiveFilter::new(&FilterConfig::lms(4, 0.01).unwrap());
        assert!(matches!(
            f.process(&[0.0; 3], &[0.0; 2]),
            Err(DspError::LengthMismatch { .. })
        ));
        assert_eq!(f.iteration_count(), 0);
    }

    #[test]
    fn nan_input_holds_weights() {
        let cfg = FilterConfig::nlms(8, 0.5, 1e-6).unwrap();
        let mut f = AdaptiveFilter::new(&cfg);
        let x = noise(1, 64);
        f.process(&x, &x).unwrap();
        let before = f.snapshot();

        let mut bad = noise(2, 64);
        bad[10] = f64::NAN;
        let err = f.process(&bad, &x).unwrap_err();
        assert_eq!(err, DspError::NonFiniteInput { index: 10 });
        assert_eq!(f.snapshot(), before);

        let mut bad_desired = x.clone();
        bad_desired[3] = f64::INFINITY;
        assert!(f.process(&x, &bad_desired).is_err());
        assert_eq!(f.snapshot(), before);
    }

    #[test]
    fn divergence_rolls_back() {
        // a huge LMS step on loud input overflows within a few samples
        let mut f = AdaptiveFilter::new(&FilterConfig::lms(4, 1e6).unwrap());
        let x = vec![1e100; 32];
        let before = f.snapshot();
        assert!(matches!(f.process(&x, &x), Err(DspError::Diverged { .. })));
        assert_eq!(f.snapshot(), before);
    }

    #[test]
    fn lms_identifies_gain() {
        let mut f = AdaptiveFilter::new(&FilterConfig::lms(4, 0.05).unwrap());
        let x = noise(3, 20_000);
        let d: Vec<f64> = x.iter().map(|v| 0.5 * v).collect();
        f.process(&x, &d).unwrap();
        assert!((f.weights()[0] - 0.5).abs() < 1e-3, "w0 = {}", f.weights()[0]);
        for w in &f.weights()[1..] {
            assert!(w.abs() < 1e-3);
        }
    }

    #[test]
    fn iteration_count_tracks_samples() {
        let mut f = AdaptiveFilter::new(&FilterConfig::nlms(8, 0.5, 1e-6).unwrap());
        let x = noise(4, 100);
        f.process(&x[..60], &x[..60]).unwrap();
        f.process(&x[60..], &x[60..]).unwrap();
        assert_eq!(f.iteration_count(), 100);
    }

    #[test]
    fn rls_converges_quickly() {
        let cfg = FilterConfig::rls(8, RlsParams::default()).unwrap();
        let mut f = AdaptiveFilter::new(&cfg);
        let x = noise(5, 2_000);
        // desired: 2-sample delay scaled by 0.8
        let d: Vec<f64> = (0..x.len()).map(|i| if i >= 2 { 0.8 * x[i - 2] } else { 0.0 }).collect();
        let out = f.process(&x, &d).unwrap();
        let tail: f64 = out.error[1_500..].iter().map(|e| e * e).sum::<f64>() / 500.0;
        assert!(tail < 1e-8, "residual power {tail}");
        assert!((f.weights()[2] - 0.8).abs() < 1e-4);
    }

    #[test]
    fn rls_reset_on_ill_conditioning() {
        let cfg = FilterConfig::rls(4, RlsParams::default()).unwrap();
        let mut state = FilterState::new(&cfg);
        if let AlgorithmState::Rls(r) = &mut state.algorithm {
            r.inverse_correlation.set(0, 0, 1e13);
        }
        state.iteration_count = 999;
        let mut f = AdaptiveFilter::from_state(state).unwrap();
        f.process(&[0.0], &[0.0]).unwrap();
        assert_eq!(f.rls_resets(), 1);
        match &f.state().algorithm {
            AlgorithmState::Rls(r) => {
                assert_eq!(r.inverse_correlation, SquareMatrix::scaled_identity(4, 100.0))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn hybrid_weights_are_blend_of_sub_filters() {
        let cfg = FilterConfig::hybrid(6, 0.25, 0.75).unwrap();
        let mut f = AdaptiveFilter::new(&cfg);
        let x = noise(6, 500);
        let d: Vec<f64> = (0..x.len())
            .map(|i| if i >= 1 { -0.3 * x[i - 1] } else { 0.0 })
            .collect();
        let out = f.process(&x, &d).unwrap();
        for (i, (y, e)) in out.output.iter().zip(&out.error).enumerate() {
            assert!((y + e - d[i]).abs() < 1e-12);
        }
        let AlgorithmState::Hybrid(h) = &f.state().algorithm else {
            panic!("expected hybrid");
        };
        for k in 0..6 {
            let expect = 0.25 * h.nlms_weights[k] + 0.75 * h.rls_weights[k];
            assert!((f.weights()[k] - expect).abs() < 1e-15);
        }
        assert!((f.weights()[1] + 0.3).abs() < 0.05);
    }

    #[test]
    fn reset_clears_but_keeps_counter() {
        let cfg = FilterConfig::with_kind(4, AlgorithmKind::Hybrid).unwrap();
        let mut f = AdaptiveFilter::new(&cfg);
        let x = noise(7, 50);
        f.process(&x, &x).unwrap();
        f.reset();
        assert!(f.weights().iter().all(|w| *w == 0.0));
        assert_eq!(f.iteration_count(), 50);
        assert!(f.reference().raw().iter().all(|v| *v == 0.0));
    }

    #[test]
    fn from_state_rejects_mismatched_lengths() {
        let cfg = FilterConfig::nlms(8, 0.5, 1e-6).unwrap();
        let mut state = FilterState::new(&cfg);
        state.weights.push(0.0);
        assert!(AdaptiveFilter::from_state(state).is_err());
    }
}
