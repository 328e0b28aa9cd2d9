//! Recursive least squares: inverse-correlation matrix upkeep.
//!
//! P is kept exactly symmetric by computing the rank-one downdate on the
//! upper triangle and mirroring it. Every `health_check_interval` iterations
//! the condition number of P is estimated and P is reset to
//! `init_scale * I` when it exceeds `max_condition` or stops being finite
//! and positive definite.

use tracing::warn;

use crate::algorithm::RlsParams;
use crate::error::{DspError, DspResult};

const POWER_ITERATIONS: usize = 48;

/// Entries beyond this magnitude count as ill-conditioned; P is one
/// forgetting step away from overflowing.
const MAX_ENTRY_MAGNITUDE: f64 = 1e100;

/// Dense row-major `n x n` matrix.
#[derive(Clone, Debug, PartialEq)]
pub struct SquareMatrix {
    n: usize,
    data: Vec<f64>,
}

impl SquareMatrix {
    pub fn scaled_identity(n: usize, scale: f64) -> Self {
        let mut data = vec![0.0; n * n];
        for i in 0..n {
            data[i * n + i] = scale;
        }
        Self { n, data }
    }

    pub fn from_vec(n: usize, data: Vec<f64>) -> DspResult<Self> {
        if data.len() != n * n {
            return Err(DspError::LengthMismatch {
                expected: n * n,
                actual: data.len(),
            });
        }
        Ok(Self { n, data })
    }

    pub fn dim(&self) -> usize {
        self.n
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    #[inline]
    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.data[i * self.n + j]
    }

    #[inline]
    pub fn set(&mut self, i: usize, j: usize, v: f64) {
        self.data[i * self.n + j] = v;
    }

    pub fn mul_vec(&self, x: &[f64], out: &mut [f64]) {
        for (row, o) in self.data.chunks_exact(self.n).zip(out.iter_mut()) {
            *o = dot(row, x);
        }
    }

    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|v| v.is_finite())
    }

    /// Largest `|P[i][j] - P[j][i]|`.
    pub fn max_asymmetry(&self) -> f64 {
        let mut worst = 0.0f64;
        for i in 0..self.n {
            for j in i + 1..self.n {
                worst = worst.max((self.get(i, j) - self.get(j, i)).abs());
            }
        }
        worst
    }

    /// Estimated `lambda_max / lambda_min` for a symmetric matrix.
    ///
    /// `lambda_max` comes from power iteration on P, `lambda_min` from inverse
    /// iteration solved through a Cholesky factorization of P. Infinite when
    /// the matrix is not finite, has runaway entries, or is not positive
    /// definite.
    pub fn condition_estimate(&self) -> f64 {
        if self.data.iter().any(|v| !(v.abs() <= MAX_ENTRY_MAGNITUDE)) {
            return f64::INFINITY;
        }
        let lambda_max = self.dominant_eigenvalue();
        if !(lambda_max > 0.0) {
            return f64::INFINITY;
        }
        match self.smallest_eigenvalue() {
            Some(lambda_min) if lambda_min > 0.0 => lambda_max / lambda_min,
            _ => f64::INFINITY,
        }
    }

    fn dominant_eigenvalue(&self) -> f64 {
        let mut v = start_vector(self.n);
        let mut w = vec![0.0; self.n];
        let mut rayleigh = 0.0;
        for _ in 0..POWER_ITERATIONS {
            self.mul_vec(&v, &mut w);
            rayleigh = dot(&v, &w);
            if normalize(&mut w) == 0.0 {
                return 0.0;
            }
            std::mem::swap(&mut v, &mut w);
        }
        rayleigh
    }

    /// Inverse iteration: power iteration on P^-1, applied by solving with
    /// the Cholesky factor. `None` when P is not positive definite.
    fn smallest_eigenvalue(&self) -> Option<f64> {
        let l = self.cholesky()?;
        let mut v = start_vector(self.n);
        let mut w = vec![0.0; self.n];
        let mut rayleigh = 0.0;
        for _ in 0..POWER_ITERATIONS {
            cholesky_solve(&l, self.n, &v, &mut w);
            // Rayleigh quotient of P^-1 tends to 1 / lambda_min
            rayleigh = dot(&v, &w);
            if normalize(&mut w) == 0.0 {
                return None;
            }
            std::mem::swap(&mut v, &mut w);
        }
        (rayleigh > 0.0 && rayleigh.is_finite()).then(|| 1.0 / rayleigh)
    }

    /// Lower-triangular L with `P = L L^T`, row-major.
    fn cholesky(&self) -> Option<Vec<f64>> {
        let n = self.n;
        let mut l = vec![0.0; n * n];
        for j in 0..n {
            let mut d = self.get(j, j);
            for k in 0..j {
                d -= l[j * n + k] * l[j * n + k];
            }
            if !(d > 0.0) || !d.is_finite() {
                return None;
            }
            let ljj = d.sqrt();
            l[j * n + j] = ljj;
            for i in j + 1..n {
                let mut s = self.get(i, j);
                for k in 0..j {
                    s -= l[i * n + k] * l[j * n + k];
                }
                l[i * n + j] = s / ljj;
            }
        }
        Some(l)
    }
}

/// Solve `L L^T x = b` into `x`.
fn cholesky_solve(l: &[f64], n: usize, b: &[f64], x: &mut [f64]) {
    for i in 0..n {
        let mut s = b[i];
        for k in 0..i {
            s -= l[i * n + k] * x[k];
        }
        x[i] = s / l[i * n + i];
    }
    for i in (0..n).rev() {
        let mut s = x[i];
        for k in i + 1..n {
            s -= l[k * n + i] * x[k];
        }
        x[i] = s / l[i * n + i];
    }
}

/// Fixed start vector keeps the estimate deterministic.
fn start_vector(n: usize) -> Vec<f64> {
    let mut v: Vec<f64> = (0..n).map(|i| 1.0 + i as f64 * 1e-3).collect();
    normalize(&mut v);
    v
}

/// RLS sub-state: parameters plus the inverse-correlation matrix.
#[derive(Clone, Debug, PartialEq)]
pub struct RlsState {
    pub params: RlsParams,
    pub inverse_correlation: SquareMatrix,
}

impl RlsState {
    pub fn new(order: usize, params: RlsParams) -> Self {
        Self {
            params,
            inverse_correlation: SquareMatrix::scaled_identity(order, params.init_scale),
        }
    }

    pub fn reset(&mut self) {
        let n = self.inverse_correlation.dim();
        self.inverse_correlation = SquareMatrix::scaled_identity(n, self.params.init_scale);
    }

    /// One RLS step on tap vector `x` with a priori error `e`, updating
    /// `weights`. `px` and `gain` are caller-owned scratch of length `order`.
    /// Returns false (after resetting P, weights untouched) when the gain
    /// denominator is not finite and positive.
    pub fn update(
        &mut self,
        x: &[f64],
        e: f64,
        weights: &mut [f64],
        px: &mut [f64],
        gain: &mut [f64],
    ) -> bool {
        let lambda = self.params.forgetting_factor;
        self.inverse_correlation.mul_vec(x, px);
        let denom = lambda + dot(x, px);
        if !denom.is_finite() || denom <= 0.0 {
            warn!(denom, "rls gain denominator degenerate; resetting");
            self.reset();
            return false;
        }
        let p = &mut self.inverse_correlation;
        for (g, v) in gain.iter_mut().zip(px.iter()) {
            *g = v / denom;
        }
        for (w, g) in weights.iter_mut().zip(gain.iter()) {
            *w += g * e;
        }
        // P = (P - k (P x)^T) / lambda, symmetric since k = P x / denom
        let n = p.dim();
        let inv_lambda = 1.0 / lambda;
        for i in 0..n {
            for j in i..n {
                let v = (p.get(i, j) - gain[i] * px[j]) * inv_lambda;
                p.set(i, j, v);
                p.set(j, i, v);
            }
        }
        true
    }

    /// Periodic numerical health check. Returns true when P was reset.
    pub fn check_health(&mut self, iteration: u64) -> bool {
        if iteration == 0 || iteration % self.params.health_check_interval != 0 {
            return false;
        }
        let condition = self.inverse_correlation.condition_estimate();
        if condition > self.params.max_condition {
            warn!(
                iteration,
                condition,
                limit = self.params.max_condition,
                "rls inverse correlation ill-conditioned; resetting"
            );
            self.reset();
            return true;
        }
        false
    }
}

#[inline]
pub(crate) fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn normalize(v: &mut [f64]) -> f64 {
    let norm = dot(v, v).sqrt();
    if norm > 0.0 && norm.is_finite() {
        for x in v.iter_mut() {
            *x /= norm;
        }
        norm
    } else {
        0.0
    }
}
