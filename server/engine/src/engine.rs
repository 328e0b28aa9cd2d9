//! Per-chunk processing shared by the pipeline and the stateless handler:
//! validate -> gate -> lease filter -> generate anti-noise -> checkpoint.
//!
//! `process` never fails. Every failure becomes the fail-safe output for
//! its kind (silence, or pass-through on bypass) plus a counter.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anc_dsp::{AdaptiveFilter, AntiNoiseGenerator, DspError, DspResult};
use tracing::{debug, warn};

use crate::chunk::{AudioChunk, ChunkMode, DesiredSource, ProcessedChunk, SessionConfig};
use crate::classifier::ClassifierError;
use crate::gate::{EmergencyGate, EmergencyVerdict};
use crate::metrics::{Counter, PipelineMetrics};
use crate::notify::{EventPublisher, NotificationEvent};
use crate::store::SessionFilterStore;

/// Default real-time budget for one chunk.
pub const DEFAULT_DEADLINE: Duration = Duration::from_millis(10);

pub struct ChunkEngine {
    gate: EmergencyGate,
    store: Arc<dyn SessionFilterStore>,
    metrics: Arc<PipelineMetrics>,
    events: Arc<dyn EventPublisher>,
    deadline: Duration,
}

impl ChunkEngine {
    pub fn new(
        gate: EmergencyGate,
        store: Arc<dyn SessionFilterStore>,
        metrics: Arc<PipelineMetrics>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            gate,
            store,
            metrics,
            events,
            deadline: DEFAULT_DEADLINE,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn store(&self) -> &Arc<dyn SessionFilterStore> {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    pub fn process(
        &self,
        session: &SessionConfig,
        chunk: &AudioChunk,
        verdict: Result<&EmergencyVerdict, &ClassifierError>,
    ) -> ProcessedChunk {
        let started = Instant::now();
        let mut out = self.process_inner(session, chunk, verdict);
        out.latency = started.elapsed();

        self.metrics.record_chunk(out.latency);
        if out.latency > self.deadline {
            self.metrics.incr(Counter::DeadlineMiss);
            debug!(
                session = %session.session_id,
                seq = chunk.seq(),
                latency_us = out.latency.as_micros() as u64,
                "chunk over budget"
            );
        }
        out
    }

    fn process_inner(
        &self,
        session: &SessionConfig,
        chunk: &AudioChunk,
        verdict: Result<&EmergencyVerdict, &ClassifierError>,
    ) -> ProcessedChunk {
        let id = &session.session_id;
        let seq = chunk.seq();

        if let Err(why) = validate_input(session, chunk) {
            self.metrics.incr(Counter::InputError);
            warn!(session = %id, seq, why, "rejected input chunk");
            return ProcessedChunk::silence(seq, chunk.len());
        }

        let decision = self.gate.evaluate(id, seq, verdict);
        if decision.reason.is_classifier_failure() {
            self.metrics.incr(Counter::ClassifierFailure);
        }
        if !decision.should_cancel_apply {
            self.metrics.incr(Counter::Bypassed);
            let heard = chunk.observed().unwrap_or(chunk.reference());
            return ProcessedChunk {
                seq,
                mode: ChunkMode::Bypassed,
                samples: heard.to_vec(),
                anti_noise: vec![0.0; heard.len()],
                latency: Duration::ZERO,
            };
        }

        let mut lease = self.store.get_or_create(id, &session.filter);
        let filter = lease.filter_mut();
        let resets_before = filter.rls_resets();
        let result = cancel(filter, session, chunk);
        let resets = filter.rls_resets().saturating_sub(resets_before);
        self.store.checkpoint(lease);

        if resets > 0 {
            self.metrics.add(Counter::NumericalReset, resets);
        }

        match result {
            Ok((heard, anti_noise)) => {
                let samples = heard.iter().zip(&anti_noise).map(|(h, a)| h + a).collect();
                ProcessedChunk {
                    seq,
                    mode: ChunkMode::Cancelling,
                    samples,
                    anti_noise,
                    latency: Duration::ZERO,
                }
            }
            Err(e) => {
                self.metrics.incr(Counter::ProcessingError);
                warn!(session = %id, seq, error = %e, "processing failed; emitting silence");
                self.events
                    .publish(NotificationEvent::processing_error(id.clone(), seq, &e));
                ProcessedChunk::silence(seq, chunk.len())
            }
        }
    }
}

fn validate_input(session: &SessionConfig, chunk: &AudioChunk) -> Result<(), &'static str> {
    if chunk.is_empty() {
        return Err("empty chunk");
    }
    if chunk.channels() != 1 || session.channel_count != 1 {
        return Err("only mono chunks are processed");
    }
    if chunk.reference().iter().any(|v| !v.is_finite()) {
        return Err("non-finite reference sample");
    }
    if let Some(obs) = chunk.observed() {
        if obs.len() != chunk.len() {
            return Err("observed length differs from reference");
        }
        if obs.iter().any(|v| !v.is_finite()) {
            return Err("non-finite observed sample");
        }
    }
    Ok(())
}

/// Returns (heard signal, anti-noise).
fn cancel(
    filter: &mut AdaptiveFilter,
    session: &SessionConfig,
    chunk: &AudioChunk,
) -> DspResult<(Vec<f64>, Vec<f64>)> {
    let reference = chunk.reference();
    let amplitude = session.intensity;

    match session.desired_source {
        DesiredSource::Observed => match chunk.observed() {
            Some(observed) => {
                let anti = AntiNoiseGenerator::adaptive(filter)
                    .generate_for(reference, observed, amplitude)?;
                Ok((observed.to_vec(), anti))
            }
            None => {
                let anti = AntiNoiseGenerator::phase_inversion()
                    .generate_anti_noise(reference, amplitude)?;
                Ok((reference.to_vec(), anti))
            }
        },
        DesiredSource::SimulatedPath {
            delay_samples,
            gain,
        } => {
            let desired = simulated_path(filter, reference, delay_samples, gain)?;
            let anti = AntiNoiseGenerator::adaptive(filter)
                .generate_for(reference, &desired, amplitude)?;
            Ok((desired, anti))
        }
        DesiredSource::None => {
            let heard = chunk.observed().unwrap_or(reference);
            let anti = AntiNoiseGenerator::phase_inversion().generate_anti_noise(heard, amplitude)?;
            Ok((heard.to_vec(), anti))
        }
    }
}

/// `d[i] = gain * x[i - delay]`, reaching back into the filter's delay line
/// for samples from earlier chunks.
fn simulated_path(
    filter: &AdaptiveFilter,
    reference: &[f64],
    delay: usize,
    gain: f64,
) -> DspResult<Vec<f64>> {
    let history = filter.reference();
    if delay > history.len() {
        return Err(DspError::InvalidConfig("simulated delay exceeds filter order"));
    }
    Ok((0..reference.len())
        .map(|i| {
            let x = if i >= delay {
                reference[i - delay]
            } else {
                history.tap(delay - i - 1)
            };
            gain * x
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::GateConfig;
    use crate::ids::SessionId;
    use crate::notify::MemoryPublisher;
    use crate::store::InMemoryFilterStore;
    use anc_dsp::FilterConfig;

    struct Fixture {
        engine: ChunkEngine,
        metrics: Arc<PipelineMetrics>,
        events: Arc<MemoryPublisher>,
        store: Arc<InMemoryFilterStore>,
    }

    fn fixture() -> Fixture {
        let metrics = Arc::new(PipelineMetrics::default());
        let events = Arc::new(MemoryPublisher::default());
        let store = Arc::new(InMemoryFilterStore::default());
        let gate = EmergencyGate::new(GateConfig::default(), events.clone());
        let engine = ChunkEngine::new(gate, store.clone(), metrics.clone(), events.clone())
            .with_deadline(Duration::from_secs(1));
        Fixture {
            engine,
            metrics,
            events,
            store,
        }
    }

    fn session() -> SessionConfig {
        SessionConfig::new(SessionId::from("s"), FilterConfig::nlms(16, 0.5, 1e-6).unwrap())
    }

    fn tone(n: usize, offset: usize) -> Vec<f64> {
        (offset..offset + n).map(|i| (i as f64 * 0.05).sin() * 0.5).collect()
    }

    #[test]
    fn pure_inversion_without_observed() {
        let f = fixture();
        let x = tone(64, 0);
        let chunk = AudioChunk::new(0, x.clone(), None);
        let out = f.engine.process(&session(), &chunk, Ok(&EmergencyVerdict::clear()));
        assert_eq!(out.mode, ChunkMode::Cancelling);
        assert_eq!(out.len(), 64);
        for (a, v) in out.anti_noise.iter().zip(&x) {
            assert_eq!(*a, -*v);
        }
        assert!(out.samples.iter().all(|s| s.abs() < 1e-12));
    }

    #[test]
    fn nan_chunk_becomes_silence_and_keeps_weights() {
        let f = fixture();
        let s = session();
        let x = tone(64, 0);
        f.engine.process(
            &s,
            &AudioChunk::new(0, x.clone(), Some(x.clone())),
            Ok(&EmergencyVerdict::clear()),
        );
        let mut lease = f.store.get_or_create(&s.session_id, &s.filter);
        let before = lease.filter_mut().snapshot();
        f.store.checkpoint(lease);

        let mut bad = tone(64, 64);
        bad[5] = f64::NAN;
        let out = f
            .engine
            .process(&s, &AudioChunk::new(1, bad, Some(x)), Ok(&EmergencyVerdict::clear()));
        assert_eq!(out.mode, ChunkMode::Silence);
        assert_eq!(out.len(), 64);
        assert!(out.samples.iter().all(|v| *v == 0.0));
        assert_eq!(f.metrics.get(Counter::InputError), 1);

        let mut lease = f.store.get_or_create(&s.session_id, &s.filter);
        assert_eq!(lease.filter_mut().snapshot(), before);
    }

    #[test]
    fn diverging_filter_emits_silence_and_reports_once() {
        let f = fixture();
        // a huge LMS step on loud input overflows within a few samples
        let s = SessionConfig::new(SessionId::from("loud"), FilterConfig::lms(4, 1e6).unwrap());
        let x = vec![1e100; 32];
        let chunk = AudioChunk::new(7, x.clone(), Some(x));
        let out = f.engine.process(&s, &chunk, Ok(&EmergencyVerdict::clear()));

        assert_eq!(out.mode, ChunkMode::Silence);
        assert_eq!(out.seq, 7);
        assert_eq!(out.len(), 32);
        assert!(out.samples.iter().all(|v| *v == 0.0));
        assert!(out.anti_noise.iter().all(|v| *v == 0.0));
        assert_eq!(f.metrics.get(Counter::ProcessingError), 1);
        assert_eq!(f.metrics.get(Counter::ChunksProcessed), 1);
        assert_eq!(f.metrics.get(Counter::InputError), 0);

        let events = f.events.take();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), "processing_error");
        match &events[0] {
            NotificationEvent::ProcessingError { session_id, seq, .. } => {
                assert_eq!(session_id, &s.session_id);
                assert_eq!(*seq, 7);
            }
            other => panic!("unexpected event {other:?}"),
        }

        let mut lease = f.store.get_or_create(&s.session_id, &s.filter);
        assert_eq!(
            lease.filter_mut().snapshot(),
            AdaptiveFilter::new(&s.filter).snapshot()
        );
    }

    #[test]
    fn bypass_passes_audio_and_leaves_filter_alone() {
        let f = fixture();
        let s = session();
        let x = tone(32, 0);
        let out = f.engine.process(
            &s,
            &AudioChunk::new(0, x.clone(), Some(x.clone())),
            Ok(&EmergencyVerdict::emergency("fire_alarm", 0.95)),
        );
        assert_eq!(out.mode, ChunkMode::Bypassed);
        assert_eq!(out.samples, x);
        assert!(out.anti_noise.iter().all(|v| *v == 0.0));
        assert_eq!(f.metrics.get(Counter::Bypassed), 1);
        assert_eq!(f.events.len(), 1);
        // nothing was leased, so no session exists yet
        assert_eq!(f.store.stats().created, 0);

        // not sticky
        let out = f
            .engine
            .process(&s, &AudioChunk::new(1, x.clone(), Some(x)), Ok(&EmergencyVerdict::clear()));
        assert_eq!(out.mode, ChunkMode::Cancelling);
    }

    #[test]
    fn classifier_failure_counted_under_both_policies() {
        let f = fixture();
        let x = tone(16, 0);
        let out = f.engine.process(
            &session(),
            &AudioChunk::new(0, x, None),
            Err(&ClassifierError::Unavailable),
        );
        assert_eq!(out.mode, ChunkMode::Bypassed);
        assert_eq!(f.metrics.get(Counter::ClassifierFailure), 1);
    }

    #[test]
    fn intensity_scales_anti_noise() {
        let f = fixture();
        let mut s = session();
        s.intensity = 0.25;
        s.desired_source = DesiredSource::None;
        let x = tone(48, 0);
        let chunk = AudioChunk::new(0, x.clone(), None);
        let out = f.engine.process(&s, &chunk, Ok(&EmergencyVerdict::clear()));
        for (a, v) in out.anti_noise.iter().zip(&x) {
            assert_eq!(*a, -*v * 0.25);
        }
    }

    #[test]
    fn multichannel_is_an_input_error() {
        let f = fixture();
        let out = f.engine.process(
            &session(),
            &AudioChunk::new(0, vec![0.1; 8], None).with_channels(2),
            Ok(&EmergencyVerdict::clear()),
        );
        assert_eq!(out.mode, ChunkMode::Silence);
        assert_eq!(out.len(), 8);
        assert_eq!(f.metrics.get(Counter::InputError), 1);
    }

    #[test]
    fn simulated_path_spans_chunks_and_converges() {
        let f = fixture();
        let mut s = session();
        s.desired_source = DesiredSource::SimulatedPath {
            delay_samples: 3,
            gain: 0.6,
        };
        let mut last = None;
        for k in 0..40 {
            let x = tone(256, k * 256);
            let chunk = AudioChunk::new(k as u64, x, None);
            last = Some(f.engine.process(&s, &chunk, Ok(&EmergencyVerdict::clear())));
        }
        let out = last.unwrap();
        let residual: f64 = out.samples.iter().map(|v| v * v).sum::<f64>() / out.len() as f64;
        assert!(residual < 1e-6, "residual power {residual}");
    }

    #[test]
    fn simulated_desired_uses_history() {
        let cfg = FilterConfig::lms(4, 0.01).unwrap();
        let mut filter = AdaptiveFilter::new(&cfg);
        filter.process(&[1.0, 2.0, 3.0], &[0.0; 3]).unwrap();
        let d = simulated_path(&filter, &[4.0, 5.0, 6.0], 2, 0.5).unwrap();
        assert_eq!(d, vec![1.0, 1.5, 2.0]);
    }
}
