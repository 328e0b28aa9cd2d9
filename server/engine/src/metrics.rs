//! Pipeline counters and latency window.
//!
//! Counters are atomics mutated by the processing side only. Queue overflow
//! and capture errors are counted by the queue and the producer on their own
//! atomics and folded in at snapshot time, so the producer never writes here.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use tracing::info;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Counter {
    ChunksProcessed,
    ProcessingError,
    InputError,
    ClassifierFailure,
    Bypassed,
    SilenceFill,
    OutputError,
    NumericalReset,
    DeadlineMiss,
}

pub struct PipelineMetrics {
    chunks_processed: AtomicU64,
    processing_errors: AtomicU64,
    input_errors: AtomicU64,
    classifier_failures: AtomicU64,
    bypassed: AtomicU64,
    silence_fills: AtomicU64,
    output_errors: AtomicU64,
    numerical_resets: AtomicU64,
    deadline_misses: AtomicU64,
    max_latency_us: AtomicU64,
    window: usize,
    latencies: Mutex<VecDeque<Duration>>,
}

impl PipelineMetrics {
    pub fn new(latency_window: usize) -> Self {
        let window = latency_window.max(1);
        Self {
            chunks_processed: AtomicU64::new(0),
            processing_errors: AtomicU64::new(0),
            input_errors: AtomicU64::new(0),
            classifier_failures: AtomicU64::new(0),
            bypassed: AtomicU64::new(0),
            silence_fills: AtomicU64::new(0),
            output_errors: AtomicU64::new(0),
            numerical_resets: AtomicU64::new(0),
            deadline_misses: AtomicU64::new(0),
            max_latency_us: AtomicU64::new(0),
            window,
            latencies: Mutex::new(VecDeque::with_capacity(window)),
        }
    }

    fn cell(&self, c: Counter) -> &AtomicU64 {
        match c {
            Counter::ChunksProcessed => &self.chunks_processed,
            Counter::ProcessingError => &self.processing_errors,
            Counter::InputError => &self.input_errors,
            Counter::ClassifierFailure => &self.classifier_failures,
            Counter::Bypassed => &self.bypassed,
            Counter::SilenceFill => &self.silence_fills,
            Counter::OutputError => &self.output_errors,
            Counter::NumericalReset => &self.numerical_resets,
            Counter::DeadlineMiss => &self.deadline_misses,
        }
    }

    #[inline]
    pub fn incr(&self, c: Counter) {
        self.add(c, 1);
    }

    #[inline]
    pub fn add(&self, c: Counter, n: u64) {
        self.cell(c).fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self, c: Counter) -> u64 {
        self.cell(c).load(Ordering::Relaxed)
    }

    /// Counts one processed chunk together with its latency. Both land under
    /// the ring lock, so a snapshot never sees the count ahead of the window.
    pub fn record_chunk(&self, latency: Duration) {
        let _ring = self.push_latency(latency);
        self.incr(Counter::ChunksProcessed);
    }

    fn push_latency(&self, latency: Duration) -> MutexGuard<'_, VecDeque<Duration>> {
        self.max_latency_us
            .fetch_max(latency.as_micros() as u64, Ordering::Relaxed);
        let mut ring = self.latencies.lock();
        if ring.len() == self.window {
            ring.pop_front();
        }
        ring.push_back(latency);
        ring
    }

    pub fn snapshot(&self, extra: SnapshotExtras) -> MetricsSnapshot {
        let (chunks_processed, mut recent) = {
            let ring = self.latencies.lock();
            let recent: Vec<u64> = ring.iter().map(|d| d.as_micros() as u64).collect();
            (self.get(Counter::ChunksProcessed), recent)
        };
        let recent_latencies_us = recent.clone();
        let (p50_latency_us, p95_latency_us) = quantiles(&mut recent);

        MetricsSnapshot {
            chunks_processed,
            queue_overflow_count: extra.queue_overflows,
            processing_error_count: self.get(Counter::ProcessingError),
            input_error_count: self.get(Counter::InputError),
            classifier_failure_count: self.get(Counter::ClassifierFailure),
            bypass_count: self.get(Counter::Bypassed),
            silence_fill_count: self.get(Counter::SilenceFill),
            capture_error_count: extra.capture_errors,
            output_error_count: self.get(Counter::OutputError),
            numerical_reset_count: self.get(Counter::NumericalReset),
            deadline_miss_count: self.get(Counter::DeadlineMiss),
            cache_failure_count: extra.cache_failures,
            notifications_dropped: extra.notifications_dropped,
            queue_depth: extra.queue_depth,
            recent_latencies_us,
            p50_latency_us,
            p95_latency_us,
            max_latency_us: self.max_latency_us.load(Ordering::Relaxed),
        }
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Counts owned outside `PipelineMetrics`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SnapshotExtras {
    pub queue_overflows: u64,
    pub capture_errors: u64,
    pub cache_failures: u64,
    pub notifications_dropped: u64,
    pub queue_depth: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub chunks_processed: u64,
    pub queue_overflow_count: u64,
    pub processing_error_count: u64,
    pub input_error_count: u64,
    pub classifier_failure_count: u64,
    pub bypass_count: u64,
    pub silence_fill_count: u64,
    pub capture_error_count: u64,
    pub output_error_count: u64,
    pub numerical_reset_count: u64,
    pub deadline_miss_count: u64,
    pub cache_failure_count: u64,
    pub notifications_dropped: u64,
    pub queue_depth: usize,
    pub recent_latencies_us: Vec<u64>,
    pub p50_latency_us: u64,
    pub p95_latency_us: u64,
    pub max_latency_us: u64,
}

/// (p50, p95) by nearest rank; sorts in place.
pub fn quantiles(samples: &mut [u64]) -> (u64, u64) {
    if samples.is_empty() {
        return (0, 0);
    }
    samples.sort_unstable();
    let at = |pct: usize| samples[((samples.len() * pct) / 100).min(samples.len() - 1)];
    (at(50), at(95))
}

/// Receives periodic snapshots from the monitor thread.
pub trait MetricsSink: Send + Sync {
    fn publish(&self, snapshot: &MetricsSnapshot);
}

pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn publish(&self, _snapshot: &MetricsSnapshot) {}
}

pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn publish(&self, s: &MetricsSnapshot) {
        info!(
            chunks = s.chunks_processed,
            overflows = s.queue_overflow_count,
            errors = s.processing_error_count,
            input_errors = s.input_error_count,
            bypassed = s.bypass_count,
            p50_us = s.p50_latency_us,
            p95_us = s.p95_latency_us,
            max_us = s.max_latency_us,
            deadline_misses = s.deadline_miss_count,
            "pipeline metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn latency_ring_is_bounded() {
        let m = PipelineMetrics::new(4);
        for ms in 1..=10u64 {
            m.record_chunk(Duration::from_millis(ms));
        }
        let s = m.snapshot(SnapshotExtras::default());
        assert_eq!(s.recent_latencies_us, vec![7_000, 8_000, 9_000, 10_000]);
        assert_eq!(s.max_latency_us, 10_000);
        assert_eq!(s.p50_latency_us, 9_000);
        assert_eq!(s.p95_latency_us, 10_000);
    }

    #[test]
    fn counters_and_extras() {
        let m = PipelineMetrics::default();
        m.incr(Counter::ChunksProcessed);
        m.add(Counter::NumericalReset, 3);
        let s = m.snapshot(SnapshotExtras {
            queue_overflows: 5,
            capture_errors: 1,
            queue_depth: 2,
            ..SnapshotExtras::default()
        });
        assert_eq!(s.chunks_processed, 1);
        assert_eq!(s.numerical_reset_count, 3);
        assert_eq!(s.queue_overflow_count, 5);
        assert_eq!(s.capture_error_count, 1);
        assert_eq!(s.queue_depth, 2);
        assert_eq!((s.p50_latency_us, s.p95_latency_us), (0, 0));
    }

    #[test]
    fn snapshot_never_counts_a_chunk_before_its_latency() {
        let m = Arc::new(PipelineMetrics::new(100_000));
        let writers: Vec<_> = (0..4)
            .map(|_| {
                let m = m.clone();
                std::thread::spawn(move || {
                    for us in 0..5_000u64 {
                        m.record_chunk(Duration::from_micros(us));
                    }
                })
            })
            .collect();
        while writers.iter().any(|w| !w.is_finished()) {
            let s = m.snapshot(SnapshotExtras::default());
            assert_eq!(s.chunks_processed, s.recent_latencies_us.len() as u64);
        }
        for w in writers {
            w.join().unwrap();
        }
        let s = m.snapshot(SnapshotExtras::default());
        assert_eq!(s.chunks_processed, 20_000);
        assert_eq!(s.recent_latencies_us.len(), 20_000);
    }

    #[test]
    fn quantiles_nearest_rank() {
        let mut xs: Vec<u64> = (1..=100).rev().collect();
        assert_eq!(quantiles(&mut xs), (51, 96));
        assert_eq!(quantiles(&mut [7]), (7, 7));
    }
}
