//! Noise-cancellation engine: emergency gate, per-session filter stores,
//! the threaded real-time pipeline and the stateless per-chunk handler.
//!
//! Numerics live in `anc-dsp`; this crate adds ownership, scheduling and
//! the collaborator boundaries (audio I/O, classifier, cache, notifications,
//! metrics).

pub mod audio_io;
pub mod cache;
pub mod chunk;
pub mod classifier;
pub mod engine;
pub mod errors;
pub mod gate;
pub mod ids;
pub mod metrics;
pub mod notify;
pub mod pipeline;
pub mod queue;
pub mod stateless;
pub mod store;

pub use audio_io::{
    AudioInput, AudioIoError, AudioOutput, CapturedFrame, MemoryOutput, ScriptedInput,
};
pub use cache::{CacheError, FlakyCache, MemoryCache, StateCache};
pub use chunk::{AudioChunk, ChunkMode, DesiredSource, OutputSignal, ProcessedChunk, SessionConfig};
pub use classifier::{
    ClassifierError, NoiseClassifier, StaticClassifier, TimedClassifier, UnavailableClassifier,
};
pub use engine::ChunkEngine;
pub use errors::{EngineError, EngineResult};
pub use gate::{
    decide, BypassDecision, BypassReason, EmergencyGate, EmergencyVerdict, GateConfig,
    OnClassifierFailure,
};
pub use ids::SessionId;
pub use metrics::{
    MetricsSink, MetricsSnapshot, NoopMetricsSink, PipelineMetrics, TracingMetricsSink,
};
pub use notify::{
    EventPublisher, MemoryPublisher, NotificationEvent, NotificationSink, NotifierHandle,
    NullPublisher, TracingSink,
};
pub use pipeline::{Collaborators, PipelineConfig, PipelineOrchestrator, PipelineState};
pub use queue::ChunkQueue;
pub use stateless::{ChunkRequest, ChunkResponse, StatelessHandler};
pub use store::{
    CachedFilterStore, FilterLease, InMemoryFilterStore, LeaseOrigin, SessionFilterStore,
    StoreConfig, StoreStats,
};
