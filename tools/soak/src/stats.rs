use anc_engine::{ChunkMode, MetricsSnapshot, StoreStats};
use serde::Serialize;
use std::time::Duration;

#[derive(Default, Serialize, Clone, Debug, PartialEq)]
pub struct Counters {
    pub chunks: u64,
    pub cancelled: u64,
    pub bypassed: u64,
    pub silenced: u64,
    pub over_budget: u64,
    pub sessions_ended: u64,
    pub end_session_err: u64,
}

impl Counters {
    pub fn record(&mut self, mode: ChunkMode) {
        self.chunks += 1;
        match mode {
            ChunkMode::Cancelling => self.cancelled += 1,
            ChunkMode::Bypassed => self.bypassed += 1,
            ChunkMode::Silence => self.silenced += 1,
        }
    }

    pub fn merge(&mut self, other: &Counters) {
        self.chunks += other.chunks;
        self.cancelled += other.cancelled;
        self.bypassed += other.bypassed;
        self.silenced += other.silenced;
        self.over_budget += other.over_budget;
        self.sessions_ended += other.sessions_ended;
        self.end_session_err += other.end_session_err;
    }
}

#[derive(Default, Serialize, Clone, Debug)]
pub struct Timings {
    /// Engine-measured processing time per chunk.
    pub process_us_p50: u64,
    pub process_us_p95: u64,
    pub process_us_max: u64,
    /// Wall time around the handler call, store round trip included.
    pub roundtrip_us_p50: u64,
    pub roundtrip_us_p95: u64,
    pub roundtrip_us_max: u64,
    pub budget_us: u64,
}

#[derive(Default, Serialize, Clone, Debug)]
pub struct SoakReport {
    pub counters: Counters,
    pub timings: Timings,
    pub engine: MetricsSnapshot,
    pub store: Option<StoreStats>,
    pub injected_cache_failures: u64,
    pub elapsed_ms: u64,
}

/// Samples collected by one worker.
#[derive(Default)]
pub struct WorkerStats {
    pub counters: Counters,
    pub process_us: Vec<u64>,
    pub roundtrip_us: Vec<u64>,
}

/// (p50, p95, max); sorts in place.
pub fn quantiles_us(samples: &mut [u64]) -> (u64, u64, u64) {
    if samples.is_empty() {
        return (0, 0, 0);
    }
    samples.sort_unstable();
    let at = |q: usize| samples[((samples.len() * q) / 100).min(samples.len() - 1)];
    (at(50), at(95), samples[samples.len() - 1])
}

pub fn dur_us(d: Duration) -> u64 {
    d.as_micros() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantiles_of_empty_are_zero() {
        assert_eq!(quantiles_us(&mut []), (0, 0, 0));
    }

    #[test]
    fn quantiles_pick_sorted_ranks() {
        let mut v: Vec<u64> = (1..=100).rev().collect();
        assert_eq!(quantiles_us(&mut v), (51, 96, 100));
        assert_eq!(quantiles_us(&mut [7]), (7, 7, 7));
    }

    #[test]
    fn counters_merge_and_record() {
        let mut a = Counters::default();
        a.record(ChunkMode::Cancelling);
        a.record(ChunkMode::Bypassed);
        let mut b = Counters::default();
        b.record(ChunkMode::Silence);
        b.over_budget = 2;
        a.merge(&b);
        assert_eq!(a.chunks, 3);
        assert_eq!((a.cancelled, a.bypassed, a.silenced, a.over_budget), (1, 1, 1, 2));
    }
}
