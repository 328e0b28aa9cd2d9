use std::time::Duration;

use anc_dsp::{AlgorithmKind, AlgorithmParams, FilterConfig, NlmsParams};
use anc_engine::{
    DesiredSource, GateConfig, OnClassifierFailure, OutputSignal, PipelineConfig, SessionConfig,
    SessionId, StoreConfig,
};
use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};

use crate::audio::synthetic::NoiseKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum DesiredMode {
    /// Adapt against the observed (error microphone) signal.
    Observed,
    /// Adapt against a delayed, attenuated copy of the reference.
    Simulated,
    /// Phase inversion only.
    None,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "anc-client", about = "Adaptive noise-cancellation pipeline")]
pub struct Config {
    #[arg(long, env = "ANC_SAMPLE_RATE", default_value_t = 48_000)]
    pub sample_rate: u32,

    #[arg(long, env = "ANC_CHUNK_SIZE", default_value_t = 1_024)]
    pub chunk_size: usize,

    #[arg(long, env = "ANC_QUEUE_CAPACITY", default_value_t = 100)]
    pub queue_capacity: usize,

    /// lms, nlms, rls or hybrid
    #[arg(long, env = "ANC_ALGORITHM", default_value = "nlms")]
    pub algorithm: AlgorithmKind,

    #[arg(long, env = "ANC_ORDER", default_value_t = 256)]
    pub order: usize,

    /// Overrides the algorithm's default step size (LMS/NLMS only).
    #[arg(long, env = "ANC_STEP_SIZE")]
    pub step_size: Option<f64>,

    /// Cancellation strength in [0, 1].
    #[arg(long, env = "ANC_INTENSITY", default_value_t = 1.0)]
    pub intensity: f64,

    #[arg(long, env = "ANC_CONFIDENCE_THRESHOLD", default_value_t = 0.70)]
    pub confidence_threshold: f64,

    /// bypass or cancel
    #[arg(long, env = "ANC_ON_CLASSIFIER_FAILURE", default_value = "bypass")]
    pub on_classifier_failure: OnClassifierFailure,

    #[arg(long, env = "ANC_CLASSIFIER_TIMEOUT_MS", default_value_t = 5)]
    pub classifier_timeout_ms: u64,

    #[arg(long, value_enum, env = "ANC_DESIRED", default_value = "simulated")]
    pub desired: DesiredMode,

    #[arg(long, env = "ANC_PATH_DELAY", default_value_t = 8)]
    pub path_delay: usize,

    #[arg(long, env = "ANC_PATH_GAIN", default_value_t = 0.8)]
    pub path_gain: f64,

    /// residual or anti_noise
    #[arg(long, env = "ANC_OUTPUT_SIGNAL", default_value = "residual")]
    pub output_signal: OutputSignal,

    #[arg(long, value_enum, env = "ANC_SOURCE", default_value = "noise")]
    pub source: NoiseKind,

    /// Seconds between synthetic alarm bursts (alarm source only).
    #[arg(long, env = "ANC_ALARM_EVERY_SECS", default_value_t = 5.0)]
    pub alarm_every_secs: f64,

    /// Stop after this many seconds of synthetic audio; runs until Ctrl-C otherwise.
    #[arg(long, env = "ANC_DURATION_SECS")]
    pub duration_secs: Option<f64>,

    #[arg(long, env = "ANC_SEED", default_value_t = 7)]
    pub seed: u64,

    /// Use the default capture/playback devices instead of the synthetic source.
    #[cfg(feature = "device")]
    #[arg(long, env = "ANC_DEVICE", default_value_t = false)]
    pub device: bool,

    #[arg(long, env = "ANC_SESSION_ID")]
    pub session_id: Option<String>,

    #[arg(long, env = "ANC_IDLE_TTL_SECS", default_value_t = 3_600)]
    pub idle_ttl_secs: u64,

    #[arg(long, env = "ANC_NOTIFY_CAPACITY", default_value_t = 256)]
    pub notify_capacity: usize,

    #[arg(long, env = "ANC_METRICS_LISTEN", default_value = "0.0.0.0:9100")]
    pub metrics_listen: String,

    #[arg(long, env = "ANC_METRICS_NAMESPACE", default_value = "anc")]
    pub metrics_namespace: String,

    /// Disable the Prometheus endpoint.
    #[arg(long, env = "ANC_NO_METRICS", default_value_t = false)]
    pub no_metrics: bool,
}

impl Config {
    pub fn filter(&self) -> Result<FilterConfig> {
        let mut params = AlgorithmParams::defaults_for(self.algorithm);
        if let Some(mu) = self.step_size {
            params = match params {
                AlgorithmParams::Lms { .. } => AlgorithmParams::Lms { step_size: mu },
                AlgorithmParams::Nlms(p) => {
                    AlgorithmParams::Nlms(NlmsParams { step_size: mu, ..p })
                }
                other => {
                    tracing::warn!(algorithm = %self.algorithm.as_str(), "step size ignored");
                    other
                }
            };
        }
        FilterConfig::new(self.order, params).context("invalid filter configuration")
    }

    pub fn session(&self) -> Result<SessionConfig> {
        let id = self
            .session_id
            .as_deref()
            .map(SessionId::from)
            .unwrap_or_default();
        let mut session = SessionConfig::new(id, self.filter()?);
        session.sample_rate = self.sample_rate;
        session.intensity = self.intensity;
        session.desired_source = match self.desired {
            DesiredMode::Observed => DesiredSource::Observed,
            DesiredMode::Simulated => DesiredSource::SimulatedPath {
                delay_samples: self.path_delay,
                gain: self.path_gain,
            },
            DesiredMode::None => DesiredSource::None,
        };
        session.validate().context("invalid session configuration")?;
        Ok(session)
    }

    pub fn gate(&self) -> GateConfig {
        GateConfig {
            confidence_threshold: self.confidence_threshold,
            on_classifier_failure: self.on_classifier_failure,
        }
    }

    pub fn store(&self) -> StoreConfig {
        StoreConfig {
            idle_ttl: Duration::from_secs(self.idle_ttl_secs),
            ..StoreConfig::default()
        }
    }

    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            sample_rate: self.sample_rate,
            chunk_size: self.chunk_size,
            queue_capacity: self.queue_capacity,
            output_signal: self.output_signal,
            ..PipelineConfig::default()
        }
    }

    pub fn classifier_timeout(&self) -> Duration {
        Duration::from_millis(self.classifier_timeout_ms)
    }

    pub fn duration_chunks(&self) -> Option<u64> {
        self.duration_secs
            .map(|s| (s * self.sample_rate as f64 / self.chunk_size.max(1) as f64).ceil() as u64)
    }
}
