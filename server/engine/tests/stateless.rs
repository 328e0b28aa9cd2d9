use std::sync::Arc;
use std::thread;

use anc_dsp::{decode_state, FilterConfig};
use anc_engine::{
    CachedFilterStore, ChunkMode, ChunkRequest, EmergencyVerdict, FlakyCache, GateConfig,
    LeaseOrigin, MemoryCache, MemoryPublisher, NotificationEvent, OnClassifierFailure,
    SessionConfig, SessionFilterStore, SessionId, StateCache, StaticClassifier, StatelessHandler,
    StoreConfig,
};
use rand::{rngs::StdRng, Rng, SeedableRng};

const N: usize = 64;

fn filter() -> FilterConfig {
    FilterConfig::nlms(16, 0.5, 1e-6).unwrap()
}

fn request(session: &str, seq: u64, seed: u64) -> ChunkRequest {
    let mut rng = StdRng::seed_from_u64(seed);
    let reference: Vec<f64> = (0..N).map(|_| rng.gen_range(-0.5..0.5)).collect();
    let observed = reference.iter().map(|v| 0.8 * v).collect();
    ChunkRequest {
        session: SessionConfig::new(SessionId::from(session), filter()),
        seq,
        reference,
        observed: Some(observed),
        verdict: Some(EmergencyVerdict::clear()),
    }
}

fn handler(cache: Arc<dyn StateCache>) -> (StatelessHandler, Arc<CachedFilterStore>) {
    let store = Arc::new(CachedFilterStore::new(cache, StoreConfig::default()));
    let h = StatelessHandler::new(
        store.clone(),
        GateConfig::default(),
        None,
        Arc::new(MemoryPublisher::default()),
    );
    (h, store)
}

fn stored_iterations(cache: &MemoryCache, store: &CachedFilterStore, session: &str) -> u64 {
    let bytes = cache.get(&store.key(&session.into())).unwrap().unwrap();
    decode_state(&bytes).unwrap().iteration_count
}

#[test]
fn same_session_requests_are_serialized() {
    let cache = Arc::new(MemoryCache::new());
    let (h, store) = handler(cache.clone());
    let h = Arc::new(h);

    let threads: Vec<_> = (0..8u64)
        .map(|t| {
            let h = h.clone();
            thread::spawn(move || {
                for i in 0..25u64 {
                    let out = h.handle(request("shared", t * 100 + i, t * 1_000 + i));
                    assert_eq!(out.mode, ChunkMode::Cancelling);
                    assert_eq!(out.samples.len(), N);
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    // no lost updates: every sample of every request advanced the same state
    assert_eq!(stored_iterations(&cache, &store, "shared"), 8 * 25 * N as u64);
    assert_eq!(store.stats().resident_sessions, 0);
}

#[test]
fn sessions_are_independent() {
    let cache = Arc::new(MemoryCache::new());
    let (h, store) = handler(cache.clone());
    let h = Arc::new(h);
    let threads: Vec<_> = ["a", "b", "c"]
        .into_iter()
        .enumerate()
        .map(|(k, id)| {
            let h = h.clone();
            thread::spawn(move || {
                for i in 0..(k as u64 + 1) * 10 {
                    h.handle(request(id, i, i));
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }
    assert_eq!(stored_iterations(&cache, &store, "a"), 10 * N as u64);
    assert_eq!(stored_iterations(&cache, &store, "b"), 20 * N as u64);
    assert_eq!(stored_iterations(&cache, &store, "c"), 30 * N as u64);
}

#[test]
fn state_carries_across_invocations() {
    let cache = Arc::new(MemoryCache::new());
    let (h, _) = handler(cache);
    let mut first = None;
    let mut last = None;
    for seq in 0..60 {
        let out = h.handle(request("conv", seq, seq));
        let power = out.samples.iter().map(|v| v * v).sum::<f64>() / N as f64;
        first.get_or_insert(power);
        last = Some(power);
    }
    // residual shrinks only if the filter survived between invocations
    assert!(last.unwrap() < first.unwrap() * 1e-3, "{first:?} -> {last:?}");
}

#[test]
fn cache_outage_degrades_without_failing_chunks() {
    let cache = Arc::new(FlakyCache::new(MemoryCache::new()));
    let (h, _) = handler(cache.clone());
    h.handle(request("s", 0, 0));
    cache.set_available(false);
    for seq in 1..4 {
        let out = h.handle(request("s", seq, seq));
        assert_eq!(out.mode, ChunkMode::Cancelling);
        assert_eq!(out.samples.len(), N);
    }
    let snap = h.snapshot();
    // a failed load and a failed save per chunk
    assert_eq!(snap.cache_failure_count, 6);
    assert_eq!(snap.processing_error_count, 0);
}

#[test]
fn verdict_resolution_order() {
    let events = Arc::new(MemoryPublisher::default());
    let cache = Arc::new(MemoryCache::new());
    let store = Arc::new(CachedFilterStore::new(cache, StoreConfig::default()));

    // no upstream verdict, no classifier: failure policy decides
    let h = StatelessHandler::new(store.clone(), GateConfig::default(), None, events.clone());
    let mut req = request("s", 0, 0);
    req.verdict = None;
    assert_eq!(h.handle(req.clone()).mode, ChunkMode::Bypassed);
    assert_eq!(h.snapshot().classifier_failure_count, 1);

    let cancel_on_failure = GateConfig {
        on_classifier_failure: OnClassifierFailure::Cancel,
        ..GateConfig::default()
    };
    let h = StatelessHandler::new(store.clone(), cancel_on_failure, None, events.clone());
    assert_eq!(h.handle(req.clone()).mode, ChunkMode::Cancelling);

    // classifier is consulted when the request has no verdict
    let alarm = Arc::new(StaticClassifier(EmergencyVerdict::emergency("siren", 0.9)));
    let h = StatelessHandler::new(
        store.clone(),
        GateConfig::default(),
        Some(alarm),
        events.clone(),
    );
    let out = h.handle(req.clone());
    assert_eq!(out.mode, ChunkMode::Bypassed);
    assert_eq!(out.samples, req.observed.clone().unwrap());

    // an upstream verdict wins over the classifier
    req.verdict = Some(EmergencyVerdict::clear());
    assert_eq!(h.handle(req).mode, ChunkMode::Cancelling);

    let bypasses = events
        .take()
        .into_iter()
        .filter(|e| matches!(e, NotificationEvent::EmergencyBypassed { .. }))
        .count();
    assert_eq!(bypasses, 2);
}

#[test]
fn end_session_starts_over() {
    let cache = Arc::new(MemoryCache::new());
    let (h, store) = handler(cache.clone());
    h.handle(request("s", 0, 0));
    h.end_session(&"s".into()).unwrap();
    assert!(cache.is_empty());

    let mut lease = store.get_or_create(&"s".into(), &filter());
    assert_eq!(lease.origin(), LeaseOrigin::Created);
    assert_eq!(lease.filter_mut().iteration_count(), 0);
    store.checkpoint(lease);
}

#[test]
fn mismatched_record_resets_silently() {
    let cache = Arc::new(MemoryCache::new());
    let (h, store) = handler(cache.clone());
    h.handle(request("s", 0, 0));

    // same session, different order: stored record no longer fits
    let mut req = request("s", 1, 1);
    req.session.filter = FilterConfig::nlms(32, 0.5, 1e-6).unwrap();
    let out = h.handle(req);
    assert_eq!(out.mode, ChunkMode::Cancelling);
    assert_eq!(stored_iterations(&cache, &store, "s"), N as u64);
    assert_eq!(store.stats().fresh_resets, 1);
}
