//! Real-time pipeline: producer (capture) -> bounded queue -> consumer
//! (classify, gate, filter, emit), plus a monitor publishing snapshots.
//!
//! State machine: Stopped -> Starting -> Running -> Stopping -> Stopped.
//! `stop()` or a fatal I/O error moves Running to Stopping; `stop()` then
//! drains, joins (bounded), releases the I/O handles and lands in Stopped.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::audio_io::{AudioInput, AudioIoError, AudioOutput};
use crate::chunk::{AudioChunk, OutputSignal, SessionConfig};
use crate::classifier::NoiseClassifier;
use crate::engine::{ChunkEngine, DEFAULT_DEADLINE};
use crate::errors::{EngineError, EngineResult};
use crate::gate::{EmergencyGate, GateConfig};
use crate::metrics::{Counter, MetricsSink, MetricsSnapshot, PipelineMetrics, SnapshotExtras};
use crate::notify::EventPublisher;
use crate::queue::ChunkQueue;
use crate::store::SessionFilterStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PipelineState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl PipelineState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Stopping,
            _ => Self::Stopped,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct StateCell(AtomicU8);

impl StateCell {
    fn get(&self) -> PipelineState {
        PipelineState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn transition(&self, from: PipelineState, to: PipelineState) -> EngineResult<()> {
        match self
            .0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                info!(%from, %to, "pipeline state");
                Ok(())
            }
            Err(actual) => Err(EngineError::InvalidState {
                from: PipelineState::from_u8(actual),
                to,
            }),
        }
    }

    fn force(&self, to: PipelineState) {
        let from = PipelineState::from_u8(self.0.swap(to as u8, Ordering::AcqRel));
        if from != to {
            info!(%from, %to, "pipeline state");
        }
    }
}

/// Default consumer wait, in chunk periods.
pub const POP_TIMEOUT_PERIODS: u32 = 2;

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub sample_rate: u32,
    pub chunk_size: usize,
    pub queue_capacity: usize,
    /// Consumer wait before emitting a silence filler; `None` is
    /// `POP_TIMEOUT_PERIODS` chunk periods.
    pub pop_timeout: Option<Duration>,
    pub monitor_interval: Duration,
    pub join_timeout: Duration,
    /// Consecutive capture (or output) errors that stop the pipeline.
    pub fatal_io_errors: u32,
    pub latency_window: usize,
    pub deadline: Duration,
    pub sweep_interval: Duration,
    pub output_signal: OutputSignal,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            chunk_size: 1_024,
            queue_capacity: 100,
            pop_timeout: None,
            monitor_interval: Duration::from_secs(1),
            join_timeout: Duration::from_secs(3),
            fatal_io_errors: 3,
            latency_window: 256,
            deadline: DEFAULT_DEADLINE,
            sweep_interval: Duration::from_secs(60),
            output_signal: OutputSignal::Residual,
        }
    }
}

impl PipelineConfig {
    pub fn chunk_period(&self) -> Duration {
        Duration::from_secs_f64(self.chunk_size as f64 / self.sample_rate.max(1) as f64)
    }

    pub fn pop_timeout(&self) -> Duration {
        self.pop_timeout
            .unwrap_or_else(|| self.chunk_period() * POP_TIMEOUT_PERIODS)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.sample_rate == 0 || self.chunk_size == 0 {
            return Err(EngineError::Config("sample_rate and chunk_size must be positive".into()));
        }
        if self.queue_capacity == 0 {
            return Err(EngineError::Config("queue_capacity must be positive".into()));
        }
        if self.fatal_io_errors == 0 {
            return Err(EngineError::Config("fatal_io_errors must be positive".into()));
        }
        Ok(())
    }
}

/// Everything the orchestrator talks to, constructed by the caller.
#[derive(Clone)]
pub struct Collaborators {
    pub input: Arc<dyn AudioInput>,
    pub output: Arc<dyn AudioOutput>,
    pub classifier: Arc<dyn NoiseClassifier>,
    pub store: Arc<dyn SessionFilterStore>,
    pub events: Arc<dyn EventPublisher>,
    pub metrics_sink: Arc<dyn MetricsSink>,
}

/// Read-only view used for snapshots from any thread.
#[derive(Clone)]
struct SnapshotSource {
    metrics: Arc<PipelineMetrics>,
    queue: Arc<ChunkQueue>,
    capture_errors: Arc<AtomicU64>,
    store: Arc<dyn SessionFilterStore>,
    events: Arc<dyn EventPublisher>,
}

impl SnapshotSource {
    fn snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot(SnapshotExtras {
            queue_overflows: self.queue.overflow_count(),
            capture_errors: self.capture_errors.load(Ordering::Relaxed),
            cache_failures: self.store.stats().cache_failures,
            notifications_dropped: self.events.dropped(),
            queue_depth: self.queue.len(),
        })
    }
}

struct Workers {
    stop: Arc<AtomicBool>,
    monitor_wake: Sender<()>,
    done: Receiver<&'static str>,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

/// Sends the worker's name when the thread ends, panics included.
struct DoneGuard {
    name: &'static str,
    tx: Sender<&'static str>,
}

impl Drop for DoneGuard {
    fn drop(&mut self) {
        let _ = self.tx.send(self.name);
    }
}

/// Shared between the orchestrator and its workers.
struct Shared {
    cfg: PipelineConfig,
    session: SessionConfig,
    state: StateCell,
    stop: Arc<AtomicBool>,
    capture_finished: AtomicBool,
}

impl Shared {
    /// Move Running -> Stopping and tell every worker to wind down.
    fn escalate(&self, reason: &str) {
        self.stop.store(true, Ordering::Release);
        if self
            .state
            .transition(PipelineState::Running, PipelineState::Stopping)
            .is_ok()
        {
            warn!(reason, "pipeline stopping");
        }
    }
}

pub struct PipelineOrchestrator {
    shared: Arc<Shared>,
    gate_cfg: GateConfig,
    collab: Collaborators,
    source: SnapshotSource,
    workers: Mutex<Option<Workers>>,
}

impl PipelineOrchestrator {
    pub fn new(
        cfg: PipelineConfig,
        session: SessionConfig,
        gate_cfg: GateConfig,
        collab: Collaborators,
    ) -> EngineResult<Self> {
        cfg.validate()?;
        session.validate()?;
        let source = SnapshotSource {
            metrics: Arc::new(PipelineMetrics::new(cfg.latency_window)),
            queue: Arc::new(ChunkQueue::new(cfg.queue_capacity)),
            capture_errors: Arc::new(AtomicU64::new(0)),
            store: collab.store.clone(),
            events: collab.events.clone(),
        };
        Ok(Self {
            shared: Arc::new(Shared {
                cfg,
                session,
                state: StateCell(AtomicU8::new(PipelineState::Stopped as u8)),
                stop: Arc::new(AtomicBool::new(false)),
                capture_finished: AtomicBool::new(false),
            }),
            gate_cfg,
            collab,
            source,
            workers: Mutex::new(None),
        })
    }

    pub fn state(&self) -> PipelineState {
        self.shared.state.get()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.source.snapshot()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.shared.cfg
    }

    pub fn start(&self) -> EngineResult<()> {
        self.shared
            .state
            .transition(PipelineState::Stopped, PipelineState::Starting)?;
        let cfg = &self.shared.cfg;

        if let Err(e) = self.open_io() {
            error!(error = %e, "audio devices unavailable");
            self.shared.state.force(PipelineState::Stopped);
            return Err(e);
        }

        self.shared.stop.store(false, Ordering::Release);
        self.shared.capture_finished.store(false, Ordering::Release);
        self.shared.state.force(PipelineState::Running);

        match self.spawn_workers() {
            Ok(workers) => {
                *self.workers.lock() = Some(workers);
                info!(
                    session = %self.shared.session.session_id,
                    sample_rate = cfg.sample_rate,
                    chunk_size = cfg.chunk_size,
                    queue = cfg.queue_capacity,
                    "pipeline running"
                );
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "failed to spawn pipeline workers");
                self.shared.stop.store(true, Ordering::Release);
                self.close_io();
                self.shared.state.force(PipelineState::Stopped);
                Err(e)
            }
        }
    }

    pub fn stop(&self) -> EngineResult<()> {
        match self.state() {
            PipelineState::Stopped => return Ok(()),
            PipelineState::Starting => {
                return Err(EngineError::InvalidState {
                    from: PipelineState::Starting,
                    to: PipelineState::Stopping,
                })
            }
            PipelineState::Running => {
                // a worker may escalate concurrently; either way we end up Stopping
                let _ = self
                    .shared
                    .state
                    .transition(PipelineState::Running, PipelineState::Stopping);
            }
            PipelineState::Stopping => {}
        }
        self.shared.stop.store(true, Ordering::Release);

        if let Some(workers) = self.workers.lock().take() {
            self.join_workers(workers);
        }
        self.close_io();
        self.shared.state.force(PipelineState::Stopped);
        Ok(())
    }

    /// Block until the pipeline leaves Running or `timeout` passes.
    pub fn wait_while_running(&self, timeout: Duration) -> PipelineState {
        let deadline = Instant::now() + timeout;
        loop {
            let state = self.state();
            if state != PipelineState::Running || Instant::now() >= deadline {
                return state;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn open_io(&self) -> EngineResult<()> {
        let cfg = &self.shared.cfg;
        self.collab.input.open(cfg.sample_rate, cfg.chunk_size)?;
        if let Err(e) = self.collab.output.open(cfg.sample_rate, cfg.chunk_size) {
            self.collab.input.close();
            return Err(e.into());
        }
        Ok(())
    }

    fn close_io(&self) {
        self.collab.input.close();
        self.collab.output.close();
        debug!("audio devices released");
    }

    fn spawn_workers(&self) -> EngineResult<Workers> {
        let (done_tx, done) = unbounded();
        let (monitor_wake, wake_rx) = bounded::<()>(1);
        let mut handles = Vec::with_capacity(3);

        let spawn = |name: &'static str, body: Box<dyn FnOnce() + Send>| {
            let guard = DoneGuard {
                name,
                tx: done_tx.clone(),
            };
            thread::Builder::new().name(format!("anc-{name}")).spawn(move || {
                let _guard = guard;
                body();
            })
        };

        let spawned = (|| -> EngineResult<()> {
            let producer = Producer {
                shared: self.shared.clone(),
                input: self.collab.input.clone(),
                queue: self.source.queue.clone(),
                capture_errors: self.source.capture_errors.clone(),
            };
            handles.push(("producer", spawn("producer", Box::new(move || producer.run()))?));

            let gate = EmergencyGate::new(self.gate_cfg, self.collab.events.clone());
            let consumer = Consumer {
                shared: self.shared.clone(),
                engine: ChunkEngine::new(
                    gate,
                    self.collab.store.clone(),
                    self.source.metrics.clone(),
                    self.collab.events.clone(),
                )
                .with_deadline(self.shared.cfg.deadline),
                classifier: self.collab.classifier.clone(),
                output: self.collab.output.clone(),
                queue: self.source.queue.clone(),
            };
            handles.push(("consumer", spawn("consumer", Box::new(move || consumer.run()))?));

            let monitor = Monitor {
                interval: self.shared.cfg.monitor_interval,
                source: self.source.clone(),
                sink: self.collab.metrics_sink.clone(),
                wake: wake_rx,
            };
            handles.push(("monitor", spawn("monitor", Box::new(move || monitor.run()))?));
            Ok(())
        })();

        let workers = Workers {
            stop: self.shared.stop.clone(),
            monitor_wake,
            done,
            handles,
        };
        match spawned {
            Ok(()) => Ok(workers),
            Err(e) => {
                self.join_workers(workers);
                Err(e)
            }
        }
    }

    fn join_workers(&self, workers: Workers) {
        let Workers {
            stop,
            monitor_wake,
            done,
            handles,
        } = workers;
        stop.store(true, Ordering::Release);
        drop(monitor_wake);

        let deadline = Instant::now() + self.shared.cfg.join_timeout;
        let mut finished = HashSet::new();
        while finished.len() < handles.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match done.recv_timeout(remaining) {
                Ok(name) => {
                    finished.insert(name);
                }
                Err(_) => break,
            }
        }

        for (name, handle) in handles {
            if finished.contains(name) {
                if handle.join().is_err() {
                    error!(thread = name, "pipeline worker panicked");
                }
            } else {
                error!(
                    thread = name,
                    timeout_ms = self.shared.cfg.join_timeout.as_millis() as u64,
                    "pipeline worker did not stop in time; detaching"
                );
            }
        }
    }
}

impl Drop for PipelineOrchestrator {
    fn drop(&mut self) {
        if self.state() != PipelineState::Stopped {
            let _ = self.stop();
        }
    }
}

struct Producer {
    shared: Arc<Shared>,
    input: Arc<dyn AudioInput>,
    queue: Arc<ChunkQueue>,
    capture_errors: Arc<AtomicU64>,
}

impl Producer {
    fn run(self) {
        let channels = self.shared.session.channel_count;
        let threshold = self.shared.cfg.fatal_io_errors;
        let mut seq = 0u64;
        let mut consecutive = 0u32;

        while !self.shared.stop.load(Ordering::Acquire) {
            match self.input.read_chunk() {
                Ok(frame) => {
                    consecutive = 0;
                    let chunk = AudioChunk::new(seq, frame.reference, frame.observed)
                        .with_channels(channels);
                    seq += 1;
                    self.queue.push(chunk);
                }
                Err(AudioIoError::EndOfStream) => {
                    info!(chunks = seq, "capture reached end of stream");
                    break;
                }
                Err(e) => {
                    consecutive += 1;
                    self.capture_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, consecutive, "capture read failed");
                    if consecutive >= threshold {
                        error!(consecutive, "capture failing repeatedly");
                        self.shared.escalate("capture errors");
                        break;
                    }
                }
            }
        }
        self.shared.capture_finished.store(true, Ordering::Release);
        debug!("producer exiting");
    }
}

struct Consumer {
    shared: Arc<Shared>,
    engine: ChunkEngine,
    classifier: Arc<dyn NoiseClassifier>,
    output: Arc<dyn AudioOutput>,
    queue: Arc<ChunkQueue>,
}

impl Consumer {
    fn run(self) {
        let cfg = &self.shared.cfg;
        let pop_timeout = cfg.pop_timeout();
        let mut consecutive_errors = 0u32;
        let mut last_sweep = Instant::now();

        loop {
            let chunk = if self.shared.stop.load(Ordering::Acquire) {
                // drain what was already captured, then leave
                match self.queue.try_pop() {
                    Some(c) => c,
                    None => break,
                }
            } else {
                match self.queue.pop_timeout(pop_timeout) {
                    Some(c) => c,
                    None => {
                        if self.shared.capture_finished.load(Ordering::Acquire)
                            && self.queue.is_empty()
                        {
                            self.shared.escalate("capture finished");
                            break;
                        }
                        // keep the output stream continuous
                        self.engine.metrics().incr(Counter::SilenceFill);
                        let silence = vec![0.0; cfg.chunk_size];
                        if !self.write(&silence, &mut consecutive_errors) {
                            break;
                        }
                        continue;
                    }
                }
            };

            let verdict = self.classifier.classify(chunk.reference(), cfg.sample_rate);
            let processed = self.engine.process(&self.shared.session, &chunk, verdict.as_ref());
            if !self.write(processed.output(cfg.output_signal), &mut consecutive_errors) {
                break;
            }

            if last_sweep.elapsed() >= cfg.sweep_interval {
                self.engine.store().sweep_idle();
                last_sweep = Instant::now();
            }
        }
        debug!("consumer exiting");
    }

    /// False when output failures became fatal.
    fn write(&self, samples: &[f64], consecutive: &mut u32) -> bool {
        match self.output.write_chunk(samples) {
            Ok(()) => {
                *consecutive = 0;
                true
            }
            Err(e) => {
                *consecutive += 1;
                self.engine.metrics().incr(Counter::OutputError);
                warn!(error = %e, consecutive = *consecutive, "output write failed");
                if *consecutive >= self.shared.cfg.fatal_io_errors {
                    error!(consecutive = *consecutive, "output failing repeatedly");
                    self.shared.escalate("output errors");
                    return false;
                }
                true
            }
        }
    }
}

struct Monitor {
    interval: Duration,
    source: SnapshotSource,
    sink: Arc<dyn MetricsSink>,
    wake: Receiver<()>,
}

impl Monitor {
    fn run(self) {
        loop {
            match self.wake.recv_timeout(self.interval) {
                Err(RecvTimeoutError::Timeout) => self.sink.publish(&self.source.snapshot()),
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        // one last publish on the way out
        self.sink.publish(&self.source.snapshot());
        debug!("monitor exiting");
    }
}
