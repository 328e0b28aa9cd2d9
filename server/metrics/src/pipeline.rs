use anc_engine::{MetricsSink, MetricsSnapshot};
use metrics::{counter, gauge, histogram};
use parking_lot::Mutex;

/// Publishes engine snapshots under `{ns}_anc_*`.
///
/// Engine counters are cumulative, so they are exported with `absolute`.
/// Latencies of chunks processed since the previous snapshot feed a histogram.
pub struct PrometheusSink {
    ns: String,
    last_chunks: Mutex<u64>,
}

impl PrometheusSink {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            ns: namespace.into(),
            last_chunks: Mutex::new(0),
        }
    }

    fn name(&self, metric: &str) -> String {
        format!("{}_anc_{}", self.ns, metric)
    }

    fn total(&self, metric: &str, v: u64) {
        counter!(self.name(metric)).absolute(v);
    }
}

impl MetricsSink for PrometheusSink {
    fn publish(&self, s: &MetricsSnapshot) {
        self.total("chunks_processed_total", s.chunks_processed);
        self.total("queue_overflow_total", s.queue_overflow_count);
        self.total("processing_errors_total", s.processing_error_count);
        self.total("input_errors_total", s.input_error_count);
        self.total("classifier_failures_total", s.classifier_failure_count);
        self.total("bypassed_total", s.bypass_count);
        self.total("silence_fill_total", s.silence_fill_count);
        self.total("capture_errors_total", s.capture_error_count);
        self.total("output_errors_total", s.output_error_count);
        self.total("numerical_resets_total", s.numerical_reset_count);
        self.total("deadline_miss_total", s.deadline_miss_count);
        self.total("cache_failures_total", s.cache_failure_count);
        self.total("notifications_dropped_total", s.notifications_dropped);

        gauge!(self.name("queue_depth")).set(s.queue_depth as f64);
        gauge!(self.name("latency_p50_seconds")).set(s.p50_latency_us as f64 / 1e6);
        gauge!(self.name("latency_p95_seconds")).set(s.p95_latency_us as f64 / 1e6);
        gauge!(self.name("latency_max_seconds")).set(s.max_latency_us as f64 / 1e6);

        let mut last = self.last_chunks.lock();
        let fresh = s.chunks_processed.saturating_sub(*last) as usize;
        *last = s.chunks_processed;
        let h = histogram!(self.name("chunk_latency_seconds"));
        let skip = s.recent_latencies_us.len().saturating_sub(fresh);
        for us in &s.recent_latencies_us[skip..] {
            h.record(*us as f64 / 1e6);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusBuilder;

    #[test]
    fn exports_counters_and_latency() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let sink = PrometheusSink::new("test");

        metrics::with_local_recorder(&recorder, || {
            sink.publish(&MetricsSnapshot {
                chunks_processed: 3,
                queue_overflow_count: 2,
                bypass_count: 1,
                recent_latencies_us: vec![500, 700, 900],
                p50_latency_us: 700,
                ..MetricsSnapshot::default()
            });
            sink.publish(&MetricsSnapshot {
                chunks_processed: 4,
                queue_overflow_count: 2,
                bypass_count: 1,
                recent_latencies_us: vec![500, 700, 900, 1_100],
                ..MetricsSnapshot::default()
            });
        });

        let text = handle.render();
        assert!(text.contains("test_anc_chunks_processed_total 4"), "{text}");
        assert!(text.contains("test_anc_queue_overflow_total 2"));
        assert!(text.contains("test_anc_bypassed_total 1"));
        // 3 latencies from the first snapshot, 1 new one from the second
        assert!(text.contains("test_anc_chunk_latency_seconds_count 4"), "{text}");
    }
}
