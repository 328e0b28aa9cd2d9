//! Per-session filter ownership.
//!
//! `get_or_create` hands out a `FilterLease` that holds the session's lock
//! for as long as it lives, so at most one mutator touches a session's
//! filter at a time; `checkpoint` gives it back. Different sessions never
//! share a lock. Two implementations:
//!   - `InMemoryFilterStore`: filters stay resident between chunks.
//!   - `CachedFilterStore`: every checkpoint serializes the filter to an
//!     external TTL cache and drops it; the next lease restores it.

mod cached;
mod memory;

pub use cached::CachedFilterStore;
pub use memory::InMemoryFilterStore;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anc_dsp::{AdaptiveFilter, FilterConfig};
use parking_lot::{ArcMutexGuard, RawMutex};
use serde::Serialize;

use crate::errors::EngineResult;
use crate::ids::SessionId;

#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Sessions idle for longer than this start over with a fresh filter.
    pub idle_ttl: Duration,
    /// Cache key prefix; the session id is appended.
    pub key_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            idle_ttl: Duration::from_secs(3_600),
            key_prefix: "anc:filter:".to_string(),
        }
    }
}

/// Where the leased filter came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaseOrigin {
    /// First use of the session (or its cache record expired).
    Created,
    /// Kept in memory since the previous chunk.
    Resident,
    /// Deserialized from the external cache.
    Restored,
    /// Previous state was idle past the TTL.
    Expired,
    /// Previous state was built for a different filter config.
    Reconfigured,
    /// Stored record could not be decoded.
    Discarded,
    /// External cache failed; running on a fresh filter.
    Degraded,
}

impl LeaseOrigin {
    pub fn is_fresh(self) -> bool {
        !matches!(self, Self::Resident | Self::Restored)
    }
}

#[derive(Default)]
pub(crate) struct SessionSlot {
    pub(crate) filter: Option<AdaptiveFilter>,
    pub(crate) last_used: Option<Instant>,
}

/// Exclusive access to one session's filter.
pub struct FilterLease {
    session: SessionId,
    config: FilterConfig,
    origin: LeaseOrigin,
    slot: ArcMutexGuard<RawMutex, SessionSlot>,
}

impl FilterLease {
    pub(crate) fn new(
        session: SessionId,
        config: FilterConfig,
        origin: LeaseOrigin,
        slot: ArcMutexGuard<RawMutex, SessionSlot>,
    ) -> Self {
        Self {
            session,
            config,
            origin,
            slot,
        }
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    pub fn origin(&self) -> LeaseOrigin {
        self.origin
    }

    pub fn is_fresh(&self) -> bool {
        self.origin.is_fresh()
    }

    pub fn filter_mut(&mut self) -> &mut AdaptiveFilter {
        let config = &self.config;
        self.slot.filter.get_or_insert_with(|| AdaptiveFilter::new(config))
    }

    pub(crate) fn into_parts(self) -> (SessionId, ArcMutexGuard<RawMutex, SessionSlot>) {
        (self.session, self.slot)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub resident_sessions: usize,
    pub created: u64,
    pub restored: u64,
    pub fresh_resets: u64,
    pub evicted: u64,
    pub cache_failures: u64,
}

#[derive(Default)]
pub(crate) struct StoreCounters {
    created: AtomicU64,
    restored: AtomicU64,
    fresh_resets: AtomicU64,
    evicted: AtomicU64,
    cache_failures: AtomicU64,
}

impl StoreCounters {
    pub(crate) fn record(&self, origin: LeaseOrigin) {
        let c = match origin {
            LeaseOrigin::Created => &self.created,
            LeaseOrigin::Restored => &self.restored,
            LeaseOrigin::Resident => return,
            LeaseOrigin::Degraded => {
                self.cache_failures.fetch_add(1, Ordering::Relaxed);
                &self.fresh_resets
            }
            LeaseOrigin::Expired | LeaseOrigin::Reconfigured | LeaseOrigin::Discarded => {
                &self.fresh_resets
            }
        };
        c.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn cache_failure(&self) {
        self.cache_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn evicted(&self, n: u64) {
        self.evicted.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn stats(&self, resident_sessions: usize) -> StoreStats {
        StoreStats {
            resident_sessions,
            created: self.created.load(Ordering::Relaxed),
            restored: self.restored.load(Ordering::Relaxed),
            fresh_resets: self.fresh_resets.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            cache_failures: self.cache_failures.load(Ordering::Relaxed),
        }
    }
}

pub trait SessionFilterStore: Send + Sync {
    /// Lock the session and return its filter, creating a fresh one when
    /// none exists, it expired, it was built for another config, or the
    /// backing store failed. Never fails.
    fn get_or_create(&self, session: &SessionId, config: &FilterConfig) -> FilterLease;

    /// Persist the leased filter and release the session lock.
    fn checkpoint(&self, lease: FilterLease);

    /// Forget the session.
    fn evict(&self, session: &SessionId) -> EngineResult<()>;

    /// Drop sessions idle past the TTL; returns how many went.
    fn sweep_idle(&self) -> usize {
        0
    }

    fn stats(&self) -> StoreStats;
}
