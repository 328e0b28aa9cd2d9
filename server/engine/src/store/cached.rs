use std::sync::Arc;
use std::time::Instant;

use anc_dsp::{decode_state, encode_state, AdaptiveFilter, FilterConfig};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{
    FilterLease, LeaseOrigin, SessionFilterStore, SessionSlot, StoreConfig, StoreCounters,
    StoreStats,
};
use crate::cache::StateCache;
use crate::errors::EngineResult;
use crate::ids::SessionId;

/// Checkpoints every filter to an external cache and keeps nothing resident
/// between chunks except the per-session lock of sessions in flight.
///
/// Serialization of same-session requests holds within this process; the
/// cache itself is last-writer-wins.
pub struct CachedFilterStore {
    cfg: StoreConfig,
    cache: Arc<dyn StateCache>,
    locks: DashMap<SessionId, Arc<Mutex<SessionSlot>>>,
    counters: StoreCounters,
}

impl CachedFilterStore {
    pub fn new(cache: Arc<dyn StateCache>, cfg: StoreConfig) -> Self {
        Self {
            cfg,
            cache,
            locks: DashMap::new(),
            counters: StoreCounters::default(),
        }
    }

    pub fn key(&self, session: &SessionId) -> String {
        format!("{}{}", self.cfg.key_prefix, session)
    }

    fn load(&self, session: &SessionId, config: &FilterConfig) -> (AdaptiveFilter, LeaseOrigin) {
        let key = self.key(session);
        match self.cache.get(&key) {
            Ok(Some(bytes)) => match decode_state(&bytes).and_then(AdaptiveFilter::from_state) {
                Ok(f) if f.matches(config) => (f, LeaseOrigin::Restored),
                Ok(f) => {
                    warn!(
                        %session,
                        from = %f.kind(),
                        to = %config.kind(),
                        "checkpoint built for another config; starting fresh"
                    );
                    (AdaptiveFilter::new(config), LeaseOrigin::Reconfigured)
                }
                Err(e) => {
                    warn!(
                        %session,
                        error = %e,
                        len = bytes.len(),
                        "discarding unreadable checkpoint"
                    );
                    (AdaptiveFilter::new(config), LeaseOrigin::Discarded)
                }
            },
            // first chunk, or the record expired: a silent reset
            Ok(None) => (AdaptiveFilter::new(config), LeaseOrigin::Created),
            Err(e) => {
                warn!(%session, error = %e, "state cache unavailable; running on a fresh filter");
                (AdaptiveFilter::new(config), LeaseOrigin::Degraded)
            }
        }
    }

    fn release_lock(&self, session: &SessionId) {
        // only the map's own reference left means nobody is waiting
        self.locks.remove_if(session, |_, slot| Arc::strong_count(slot) == 1);
    }
}

impl SessionFilterStore for CachedFilterStore {
    fn get_or_create(&self, session: &SessionId, config: &FilterConfig) -> FilterLease {
        let lock = self.locks.entry(session.clone()).or_default().value().clone();
        let mut slot = lock.lock_arc();
        let (filter, origin) = self.load(session, config);
        self.counters.record(origin);
        slot.filter = Some(filter);
        slot.last_used = Some(Instant::now());
        FilterLease::new(session.clone(), config.clone(), origin, slot)
    }

    fn checkpoint(&self, lease: FilterLease) {
        let (session, mut slot) = lease.into_parts();
        if let Some(filter) = slot.filter.take() {
            let bytes = encode_state(filter.state());
            if let Err(e) = self.cache.set_with_ttl(&self.key(&session), bytes, self.cfg.idle_ttl) {
                self.counters.cache_failure();
                warn!(%session, error = %e, "checkpoint not saved");
            }
        }
        drop(slot);
        self.release_lock(&session);
    }

    fn evict(&self, session: &SessionId) -> EngineResult<()> {
        self.cache.delete(&self.key(session))?;
        self.release_lock(session);
        self.counters.evicted(1);
        debug!(%session, "session checkpoint deleted");
        Ok(())
    }

    fn stats(&self) -> StoreStats {
        self.counters.stats(self.locks.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{FlakyCache, MemoryCache};
    use bytes::Bytes;
    use std::thread;
    use std::time::Duration;

    fn cfg() -> FilterConfig {
        FilterConfig::rls(6, Default::default()).unwrap()
    }

    fn chunk() -> Vec<f64> {
        (0..40).map(|i| ((i * 31) % 17) as f64 / 17.0 - 0.5).collect()
    }

    #[test]
    fn round_trips_through_cache() {
        let cache = Arc::new(MemoryCache::new());
        let store = CachedFilterStore::new(cache.clone(), StoreConfig::default());
        let id = SessionId::from("s");

        let mut lease = store.get_or_create(&id, &cfg());
        assert_eq!(lease.origin(), LeaseOrigin::Created);
        let x = chunk();
        lease.filter_mut().process(&x, &x).unwrap();
        let expected = lease.filter_mut().snapshot();
        store.checkpoint(lease);

        assert_eq!(cache.len(), 1);
        assert_eq!(store.stats().resident_sessions, 0);

        let mut lease = store.get_or_create(&id, &cfg());
        assert_eq!(lease.origin(), LeaseOrigin::Restored);
        assert_eq!(lease.filter_mut().snapshot(), expected);
    }

    #[test]
    fn expired_record_is_silent_reset() {
        let cache = Arc::new(MemoryCache::new());
        let store = CachedFilterStore::new(
            cache,
            StoreConfig {
                idle_ttl: Duration::from_millis(20),
                ..StoreConfig::default()
            },
        );
        let id = SessionId::from("s");
        let mut lease = store.get_or_create(&id, &cfg());
        let x = chunk();
        lease.filter_mut().process(&x, &x).unwrap();
        store.checkpoint(lease);

        thread::sleep(Duration::from_millis(50));
        let mut lease = store.get_or_create(&id, &cfg());
        assert_eq!(lease.origin(), LeaseOrigin::Created);
        assert_eq!(lease.filter_mut().iteration_count(), 0);
    }

    #[test]
    fn corrupt_record_is_replaced() {
        let cache = Arc::new(MemoryCache::new());
        let store = CachedFilterStore::new(cache.clone(), StoreConfig::default());
        let id = SessionId::from("s");
        cache
            .set_with_ttl(
                &store.key(&id),
                Bytes::from_static(b"ANCF\x01garbage"),
                Duration::from_secs(60),
            )
            .unwrap();
        let mut lease = store.get_or_create(&id, &cfg());
        assert_eq!(lease.origin(), LeaseOrigin::Discarded);
        assert_eq!(lease.filter_mut().iteration_count(), 0);
        store.checkpoint(lease);
        // the fresh state overwrote the bad record
        assert!(decode_state(&cache.get(&store.key(&id)).unwrap().unwrap()).is_ok());
    }

    #[test]
    fn unavailable_cache_degrades() {
        let cache = Arc::new(FlakyCache::new(MemoryCache::new()));
        let store = CachedFilterStore::new(cache.clone(), StoreConfig::default());
        cache.set_available(false);

        let mut lease = store.get_or_create(&"s".into(), &cfg());
        assert_eq!(lease.origin(), LeaseOrigin::Degraded);
        let x = chunk();
        assert!(lease.filter_mut().process(&x, &x).is_ok());
        store.checkpoint(lease);

        let stats = store.stats();
        // one failed load, one failed save
        assert_eq!(stats.cache_failures, 2);
        assert!(store.evict(&"s".into()).is_err());
    }
}
