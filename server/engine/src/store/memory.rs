use std::sync::Arc;
use std::time::Instant;

use anc_dsp::{AdaptiveFilter, FilterConfig};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{
    FilterLease, LeaseOrigin, SessionFilterStore, SessionSlot, StoreConfig, StoreCounters,
    StoreStats,
};
use crate::errors::EngineResult;
use crate::ids::SessionId;

/// Filters stay resident between chunks, keyed by session.
pub struct InMemoryFilterStore {
    cfg: StoreConfig,
    sessions: DashMap<SessionId, Arc<Mutex<SessionSlot>>>,
    counters: StoreCounters,
}

impl InMemoryFilterStore {
    pub fn new(cfg: StoreConfig) -> Self {
        Self {
            cfg,
            sessions: DashMap::new(),
            counters: StoreCounters::default(),
        }
    }

    fn slot(&self, session: &SessionId) -> Arc<Mutex<SessionSlot>> {
        // clone out so the map shard is not held while the session lock is
        self.sessions.entry(session.clone()).or_default().value().clone()
    }
}

impl Default for InMemoryFilterStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

impl SessionFilterStore for InMemoryFilterStore {
    fn get_or_create(&self, session: &SessionId, config: &FilterConfig) -> FilterLease {
        let mut slot = self.slot(session).lock_arc();
        let now = Instant::now();
        let idle_expired = slot
            .last_used
            .is_some_and(|t| now.duration_since(t) > self.cfg.idle_ttl);

        let origin = match slot.filter.as_ref() {
            None => LeaseOrigin::Created,
            Some(_) if idle_expired => {
                info!(%session, "session idle past ttl; starting fresh");
                LeaseOrigin::Expired
            }
            Some(f) if !f.matches(config) => {
                warn!(
                    %session,
                    from = %f.kind(),
                    to = %config.kind(),
                    "filter config changed; starting fresh"
                );
                LeaseOrigin::Reconfigured
            }
            Some(_) => LeaseOrigin::Resident,
        };
        if origin.is_fresh() {
            debug!(%session, order = config.order(), kind = %config.kind(), "new filter");
            slot.filter = Some(AdaptiveFilter::new(config));
        }
        self.counters.record(origin);
        slot.last_used = Some(now);
        FilterLease::new(session.clone(), config.clone(), origin, slot)
    }

    fn checkpoint(&self, lease: FilterLease) {
        let (_, mut slot) = lease.into_parts();
        slot.last_used = Some(Instant::now());
    }

    fn evict(&self, session: &SessionId) -> EngineResult<()> {
        if self.sessions.remove(session).is_some() {
            self.counters.evicted(1);
            debug!(%session, "session evicted");
        }
        Ok(())
    }

    fn sweep_idle(&self) -> usize {
        let now = Instant::now();
        let ttl = self.cfg.idle_ttl;
        let before = self.sessions.len();
        // sessions currently leased are busy, not idle
        self.sessions.retain(|_, slot| match slot.try_lock() {
            Some(s) => s.last_used.is_some_and(|t| now.duration_since(t) <= ttl),
            None => true,
        });
        let swept = before.saturating_sub(self.sessions.len());
        if swept > 0 {
            self.counters.evicted(swept as u64);
            info!(swept, "idle sessions swept");
        }
        swept
    }

    fn stats(&self) -> StoreStats {
        self.counters.stats(self.sessions.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn cfg() -> FilterConfig {
        FilterConfig::nlms(8, 0.5, 1e-6).unwrap()
    }

    fn train(lease: &mut FilterLease) {
        let x: Vec<f64> = (0..64).map(|i| (i as f64 * 0.3).sin()).collect();
        lease.filter_mut().process(&x, &x).unwrap();
    }

    #[test]
    fn mutation_persists_between_leases() {
        let store = InMemoryFilterStore::default();
        let id = SessionId::from("a");

        let mut lease = store.get_or_create(&id, &cfg());
        assert_eq!(lease.origin(), LeaseOrigin::Created);
        train(&mut lease);
        let weights = lease.filter_mut().weights().to_vec();
        store.checkpoint(lease);

        let mut again = store.get_or_create(&id, &cfg());
        assert_eq!(again.origin(), LeaseOrigin::Resident);
        assert_eq!(again.filter_mut().weights(), &weights[..]);
        assert_eq!(again.filter_mut().iteration_count(), 64);
    }

    #[test]
    fn ttl_expiry_gives_fresh_state() {
        let store = InMemoryFilterStore::new(StoreConfig {
            idle_ttl: Duration::from_millis(20),
            ..StoreConfig::default()
        });
        let id = SessionId::from("a");
        let mut lease = store.get_or_create(&id, &cfg());
        train(&mut lease);
        store.checkpoint(lease);

        thread::sleep(Duration::from_millis(50));
        let mut lease = store.get_or_create(&id, &cfg());
        assert_eq!(lease.origin(), LeaseOrigin::Expired);
        assert_eq!(lease.filter_mut().iteration_count(), 0);
    }

    #[test]
    fn config_change_gives_fresh_state() {
        let store = InMemoryFilterStore::default();
        let id = SessionId::from("a");
        let mut lease = store.get_or_create(&id, &cfg());
        train(&mut lease);
        store.checkpoint(lease);

        let other = FilterConfig::lms(8, 0.01).unwrap();
        let mut lease = store.get_or_create(&id, &other);
        assert_eq!(lease.origin(), LeaseOrigin::Reconfigured);
        assert_eq!(lease.filter_mut().kind(), other.kind());
    }

    #[test]
    fn same_session_is_single_writer() {
        let store = Arc::new(InMemoryFilterStore::default());
        let id = SessionId::from("shared");
        let lease = store.get_or_create(&id, &cfg());

        let (tx, rx) = crossbeam_channel::bounded(1);
        let s = store.clone();
        let waiter = thread::spawn(move || {
            let lease = s.get_or_create(&SessionId::from("shared"), &cfg());
            tx.send(()).unwrap();
            s.checkpoint(lease);
        });
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        // other sessions are not held up
        let other = store.get_or_create(&SessionId::from("other"), &cfg());
        store.checkpoint(other);

        store.checkpoint(lease);
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        waiter.join().unwrap();
    }

    #[test]
    fn sweep_and_evict() {
        let store = InMemoryFilterStore::new(StoreConfig {
            idle_ttl: Duration::from_millis(20),
            ..StoreConfig::default()
        });
        for id in ["a", "b"] {
            let lease = store.get_or_create(&id.into(), &cfg());
            store.checkpoint(lease);
        }
        thread::sleep(Duration::from_millis(40));
        let keep = store.get_or_create(&"c".into(), &cfg());
        assert_eq!(store.sweep_idle(), 2);
        store.checkpoint(keep);
        assert_eq!(store.stats().resident_sessions, 1);

        store.evict(&"c".into()).unwrap();
        let stats = store.stats();
        assert_eq!(stats.resident_sessions, 0);
        assert_eq!(stats.evicted, 3);
        assert_eq!(stats.created, 3);
    }
}
