//! Algorithm selection and parameters.
//!
//! The algorithm is chosen once, when a filter is built from a
//! [`FilterConfig`]; the per-sample update then dispatches on the tag held in
//! the filter state.

use std::{fmt, str::FromStr};

use crate::error::{DspError, DspResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AlgorithmKind {
    Lms,
    Nlms,
    Rls,
    Hybrid,
}

impl AlgorithmKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lms => "lms",
            Self::Nlms => "nlms",
            Self::Rls => "rls",
            Self::Hybrid => "hybrid",
        }
    }

    /// Stable tag used in persisted records.
    pub fn tag(self) -> u8 {
        match self {
            Self::Lms => 1,
            Self::Nlms => 2,
            Self::Rls => 3,
            Self::Hybrid => 4,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::Lms),
            2 => Some(Self::Nlms),
            3 => Some(Self::Rls),
            4 => Some(Self::Hybrid),
            _ => None,
        }
    }
}

impl fmt::Display for AlgorithmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlgorithmKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lms" => Ok(Self::Lms),
            "nlms" => Ok(Self::Nlms),
            "rls" => Ok(Self::Rls),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(format!(
                "unknown algorithm '{other}' (expected lms, nlms, rls or hybrid)"
            )),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NlmsParams {
    /// Normalized step size (mu), stable for 0 < mu < 2.
    pub step_size: f64,
    /// Regularization added to the input power so silence never divides by zero.
    pub epsilon: f64,
}

impl Default for NlmsParams {
    fn default() -> Self {
        Self {
            step_size: 0.5,
            epsilon: 1e-6,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RlsParams {
    /// Exponential forgetting factor (lambda), 0 < lambda <= 1.
    pub forgetting_factor: f64,
    /// Inverse-correlation matrix starts (and resets) as `init_scale * I`.
    pub init_scale: f64,
    /// Iterations between condition-number checks.
    pub health_check_interval: u64,
    /// Condition number above which P is reset.
    pub max_condition: f64,
}

impl Default for RlsParams {
    fn default() -> Self {
        Self {
            forgetting_factor: 0.999,
            init_scale: 100.0,
            health_check_interval: 1_000,
            max_condition: 1e10,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AlgorithmParams {
    Lms { step_size: f64 },
    Nlms(NlmsParams),
    Rls(RlsParams),
    Hybrid {
        nlms_weight: f64,
        rls_weight: f64,
        nlms: NlmsParams,
        rls: RlsParams,
    },
}

impl AlgorithmParams {
    pub fn kind(&self) -> AlgorithmKind {
        match self {
            Self::Lms { .. } => AlgorithmKind::Lms,
            Self::Nlms(_) => AlgorithmKind::Nlms,
            Self::Rls(_) => AlgorithmKind::Rls,
            Self::Hybrid { .. } => AlgorithmKind::Hybrid,
        }
    }

    /// Parameters with stock defaults for `kind`.
    pub fn defaults_for(kind: AlgorithmKind) -> Self {
        match kind {
            AlgorithmKind::Lms => Self::Lms { step_size: 0.01 },
            AlgorithmKind::Nlms => Self::Nlms(NlmsParams::default()),
            AlgorithmKind::Rls => Self::Rls(RlsParams::default()),
            AlgorithmKind::Hybrid => Self::Hybrid {
                nlms_weight: 0.5,
                rls_weight: 0.5,
                nlms: NlmsParams::default(),
                rls: RlsParams::default(),
            },
        }
    }

    pub fn validate(&self) -> DspResult<()> {
        match self {
            Self::Lms { step_size } => positive(*step_size, "lms step size must be positive"),
            Self::Nlms(p) => validate_nlms(p),
            Self::Rls(p) => validate_rls(p),
            Self::Hybrid {
                nlms_weight,
                rls_weight,
                nlms,
                rls,
            } => {
                validate_nlms(nlms)?;
                validate_rls(rls)?;
                if !nlms_weight.is_finite() || !rls_weight.is_finite() {
                    return Err(DspError::InvalidConfig("hybrid weights must be finite"));
                }
                if *nlms_weight < 0.0 || *rls_weight < 0.0 || nlms_weight + rls_weight <= 0.0 {
                    return Err(DspError::InvalidConfig(
                        "hybrid weights must be non-negative and not both zero",
                    ));
                }
                Ok(())
            }
        }
    }
}

fn positive(v: f64, msg: &'static str) -> DspResult<()> {
    if v.is_finite() && v > 0.0 {
        Ok(())
    } else {
        Err(DspError::InvalidConfig(msg))
    }
}

fn validate_nlms(p: &NlmsParams) -> DspResult<()> {
    positive(p.step_size, "nlms step size must be positive")?;
    positive(p.epsilon, "nlms epsilon must be positive")
}

fn validate_rls(p: &RlsParams) -> DspResult<()> {
    if !(p.forgetting_factor > 0.0 && p.forgetting_factor <= 1.0) {
        return Err(DspError::InvalidConfig("rls forgetting factor must be in (0, 1]"));
    }
    positive(p.init_scale, "rls init scale must be positive")?;
    if p.health_check_interval == 0 {
        return Err(DspError::InvalidConfig("rls health check interval must be non-zero"));
    }
    if !(p.max_condition > 1.0) {
        return Err(DspError::InvalidConfig("rls condition limit must exceed 1"));
    }
    Ok(())
}

/// Validated filter shape: tap count plus algorithm parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct FilterConfig {
    order: usize,
    params: AlgorithmParams,
}

impl FilterConfig {
    pub fn new(order: usize, params: AlgorithmParams) -> DspResult<Self> {
        if order == 0 {
            return Err(DspError::InvalidConfig("filter order must be non-zero"));
        }
        params.validate()?;
        Ok(Self { order, params })
    }

    /// `kind` with its default parameters.
    pub fn with_kind(order: usize, kind: AlgorithmKind) -> DspResult<Self> {
        Self::new(order, AlgorithmParams::defaults_for(kind))
    }

    pub fn lms(order: usize, step_size: f64) -> DspResult<Self> {
        Self::new(order, AlgorithmParams::Lms { step_size })
    }

    pub fn nlms(order: usize, step_size: f64, epsilon: f64) -> DspResult<Self> {
        Self::new(order, AlgorithmParams::Nlms(NlmsParams { step_size, epsilon }))
    }

    pub fn rls(order: usize, params: RlsParams) -> DspResult<Self> {
        Self::new(order, AlgorithmParams::Rls(params))
    }

    pub fn hybrid(order: usize, nlms_weight: f64, rls_weight: f64) -> DspResult<Self> {
        Self::new(
            order,
            AlgorithmParams::Hybrid {
                nlms_weight,
                rls_weight,
                nlms: NlmsParams::default(),
                rls: RlsParams::default(),
            },
        )
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn kind(&self) -> AlgorithmKind {
        self.params.kind()
    }

    pub fn params(&self) -> &AlgorithmParams {
        &self.params
    }
}

impl Default for FilterConfig {
    /// NLMS, 256 taps.
    fn default() -> Self {
        Self {
            order: 256,
            params: AlgorithmParams::Nlms(NlmsParams::default()),
        }
    }
}
