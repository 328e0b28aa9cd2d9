//! Per-chunk data model: captured input, processed output, session settings.

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use anc_dsp::FilterConfig;

use crate::errors::{EngineError, EngineResult};
use crate::ids::SessionId;

/// One captured block. Immutable once built.
#[derive(Clone, Debug)]
pub struct AudioChunk {
    seq: u64,
    captured_at: Instant,
    channels: u16,
    reference: Vec<f64>,
    observed: Option<Vec<f64>>,
}

impl AudioChunk {
    pub fn new(seq: u64, reference: Vec<f64>, observed: Option<Vec<f64>>) -> Self {
        Self {
            seq,
            captured_at: Instant::now(),
            channels: 1,
            reference,
            observed,
        }
    }

    pub fn with_channels(mut self, channels: u16) -> Self {
        self.channels = channels;
        self
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn reference(&self) -> &[f64] {
        &self.reference
    }

    pub fn observed(&self) -> Option<&[f64]> {
        self.observed.as_deref()
    }

    pub fn len(&self) -> usize {
        self.reference.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reference.is_empty()
    }
}

/// How a chunk left the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkMode {
    Cancelling,
    Bypassed,
    /// Error path or queue timeout filler.
    Silence,
}

impl ChunkMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cancelling => "cancelling",
            Self::Bypassed => "bypassed",
            Self::Silence => "silence",
        }
    }
}

/// Which of the two processed signals is written to the output device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputSignal {
    /// What the listener hears: heard noise plus anti-noise.
    #[default]
    Residual,
    /// The anti-noise alone, for a speaker that mixes acoustically.
    AntiNoise,
}

impl FromStr for OutputSignal {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "residual" => Ok(Self::Residual),
            "anti-noise" | "anti_noise" | "antinoise" => Ok(Self::AntiNoise),
            other => Err(format!("unknown output signal: {other}")),
        }
    }
}

/// Engine output for one chunk; always as long as the input.
#[derive(Clone, Debug, PartialEq)]
pub struct ProcessedChunk {
    pub seq: u64,
    pub mode: ChunkMode,
    pub samples: Vec<f64>,
    pub anti_noise: Vec<f64>,
    pub latency: Duration,
}

impl ProcessedChunk {
    pub fn silence(seq: u64, len: usize) -> Self {
        Self {
            seq,
            mode: ChunkMode::Silence,
            samples: vec![0.0; len],
            anti_noise: vec![0.0; len],
            latency: Duration::ZERO,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn output(&self, signal: OutputSignal) -> &[f64] {
        match signal {
            OutputSignal::Residual => &self.samples,
            OutputSignal::AntiNoise => &self.anti_noise,
        }
    }
}

/// Where the filter's desired signal `d` comes from.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum DesiredSource {
    /// The chunk's observed (error microphone) signal. Chunks without one
    /// fall back to plain phase inversion of the reference.
    #[default]
    Observed,
    /// Desired is the reference delayed by `delay_samples` and scaled by
    /// `gain`, standing in for the acoustic path when no second microphone
    /// exists.
    SimulatedPath { delay_samples: usize, gain: f64 },
    /// Never adapt; always invert the heard signal.
    None,
}

impl fmt::Display for DesiredSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Observed => f.write_str("observed"),
            Self::SimulatedPath {
                delay_samples,
                gain,
            } => write!(f, "simulated(delay={delay_samples}, gain={gain})"),
            Self::None => f.write_str("none"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub session_id: SessionId,
    pub sample_rate: u32,
    pub channel_count: u16,
    /// Cancellation strength in [0, 1], applied as the anti-noise amplitude.
    pub intensity: f64,
    pub filter: FilterConfig,
    pub desired_source: DesiredSource,
}

impl SessionConfig {
    pub fn new(session_id: SessionId, filter: FilterConfig) -> Self {
        Self {
            session_id,
            sample_rate: 48_000,
            channel_count: 1,
            intensity: 1.0,
            filter,
            desired_source: DesiredSource::default(),
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.sample_rate == 0 {
            return Err(EngineError::Config("sample_rate must be positive".into()));
        }
        if self.channel_count == 0 {
            return Err(EngineError::Config("channel_count must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.intensity) {
            return Err(EngineError::Config(format!(
                "intensity {} outside [0, 1]",
                self.intensity
            )));
        }
        if let DesiredSource::SimulatedPath {
            delay_samples,
            gain,
        } = self.desired_source
        {
            if delay_samples > self.filter.order() {
                return Err(EngineError::Config(format!(
                    "simulated delay {delay_samples} exceeds filter order {}",
                    self.filter.order()
                )));
            }
            if !gain.is_finite() {
                return Err(EngineError::Config("simulated gain must be finite".into()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_config_bounds() {
        let mut cfg = SessionConfig::new("s".into(), FilterConfig::default());
        assert!(cfg.validate().is_ok());

        cfg.intensity = 1.5;
        assert!(cfg.validate().is_err());
        cfg.intensity = f64::NAN;
        assert!(cfg.validate().is_err());
        cfg.intensity = 0.0;
        assert!(cfg.validate().is_ok());

        cfg.desired_source = DesiredSource::SimulatedPath {
            delay_samples: cfg.filter.order() + 1,
            gain: 0.5,
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn output_signal_parses() {
        assert_eq!("residual".parse::<OutputSignal>(), Ok(OutputSignal::Residual));
        assert_eq!("Anti-Noise".parse::<OutputSignal>(), Ok(OutputSignal::AntiNoise));
        assert!("loud".parse::<OutputSignal>().is_err());
    }

    #[test]
    fn silence_keeps_length() {
        let c = ProcessedChunk::silence(7, 32);
        assert_eq!(c.len(), 32);
        assert!(c.samples.iter().chain(&c.anti_noise).all(|v| *v == 0.0));
        assert_eq!(c.mode, ChunkMode::Silence);
    }
}
