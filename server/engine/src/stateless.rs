//! Per-invocation entry point: one request, one chunk, state round-tripped
//! through the session store (normally a `CachedFilterStore`).

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::chunk::{AudioChunk, ChunkMode, SessionConfig};
use crate::classifier::{ClassifierError, NoiseClassifier};
use crate::engine::ChunkEngine;
use crate::errors::EngineResult;
use crate::gate::{EmergencyGate, EmergencyVerdict, GateConfig};
use crate::ids::SessionId;
use crate::metrics::{MetricsSnapshot, PipelineMetrics, SnapshotExtras};
use crate::notify::EventPublisher;
use crate::store::SessionFilterStore;

#[derive(Clone, Debug)]
pub struct ChunkRequest {
    pub session: SessionConfig,
    pub seq: u64,
    pub reference: Vec<f64>,
    pub observed: Option<Vec<f64>>,
    /// Verdict computed upstream; when absent the handler's classifier runs.
    pub verdict: Option<EmergencyVerdict>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ChunkResponse {
    pub session_id: SessionId,
    pub seq: u64,
    pub mode: ChunkMode,
    pub samples: Vec<f64>,
    pub anti_noise: Vec<f64>,
    pub latency: Duration,
}

pub struct StatelessHandler {
    engine: ChunkEngine,
    classifier: Option<Arc<dyn NoiseClassifier>>,
    events: Arc<dyn EventPublisher>,
}

impl StatelessHandler {
    pub fn new(
        store: Arc<dyn SessionFilterStore>,
        gate_cfg: GateConfig,
        classifier: Option<Arc<dyn NoiseClassifier>>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        let gate = EmergencyGate::new(gate_cfg, events.clone());
        let metrics = Arc::new(PipelineMetrics::default());
        let engine = ChunkEngine::new(gate, store, metrics, events.clone());
        Self {
            engine,
            classifier,
            events,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.engine = self.engine.with_deadline(deadline);
        self
    }

    /// Never fails: errors surface as silence or bypass plus counters.
    pub fn handle(&self, req: ChunkRequest) -> ChunkResponse {
        let ChunkRequest {
            session,
            seq,
            reference,
            observed,
            verdict,
        } = req;
        let chunk = AudioChunk::new(seq, reference, observed).with_channels(session.channel_count);

        let verdict = match verdict {
            Some(v) => Ok(v),
            None => match &self.classifier {
                Some(c) => c.classify(chunk.reference(), session.sample_rate),
                None => Err(ClassifierError::Unavailable),
            },
        };
        let out = self.engine.process(&session, &chunk, verdict.as_ref());
        ChunkResponse {
            session_id: session.session_id,
            seq: out.seq,
            mode: out.mode,
            samples: out.samples,
            anti_noise: out.anti_noise,
            latency: out.latency,
        }
    }

    /// Explicit end-of-session: drop the stored filter.
    pub fn end_session(&self, session: &SessionId) -> EngineResult<()> {
        self.engine.store().evict(session)?;
        info!(%session, "session ended");
        Ok(())
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.engine.metrics().snapshot(SnapshotExtras {
            cache_failures: self.engine.store().stats().cache_failures,
            notifications_dropped: self.events.dropped(),
            ..SnapshotExtras::default()
        })
    }
}
