//! External key-value cache boundary used by the stateless deployment.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CacheError {
    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("operation failed: {0}")]
    Failed(String),
}

pub trait StateCache: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError>;
    fn set_with_ttl(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError>;
    fn delete(&self, key: &str) -> Result<(), CacheError>;
}

struct Entry {
    value: Bytes,
    expires_at: Instant,
}

/// In-process cache with per-key expiry. Expired keys read as absent.
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, Entry>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live (unexpired) keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| e.expires_at > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| e.expires_at > now);
        before - self.entries.len()
    }
}

impl StateCache for MemoryCache {
    fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        let now = Instant::now();
        if let Some(e) = self.entries.get(key) {
            if e.expires_at > now {
                return Ok(Some(e.value.clone()));
            }
        }
        self.entries.remove_if(key, |_, e| e.expires_at <= now);
        Ok(None)
    }

    fn set_with_ttl(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.remove(key);
        Ok(())
    }
}

/// Wraps a `MemoryCache` and fails on demand: while switched off, or on
/// every `fail_one_in`-th call.
pub struct FlakyCache {
    inner: MemoryCache,
    available: AtomicBool,
    fail_one_in: u64,
    calls: AtomicU64,
    failures: AtomicU64,
}

impl FlakyCache {
    pub fn new(inner: MemoryCache) -> Self {
        Self {
            inner,
            available: AtomicBool::new(true),
            fail_one_in: 0,
            calls: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Fail deterministically once every `n` calls (0 disables).
    pub fn with_failure_rate(mut self, n: u64) -> Self {
        self.fail_one_in = n;
        self
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn injected_failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn inner(&self) -> &MemoryCache {
        &self.inner
    }

    fn check(&self) -> Result<(), CacheError> {
        let call = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        let scheduled = self.fail_one_in > 0 && call % self.fail_one_in == 0;
        if !self.available.load(Ordering::SeqCst) || scheduled {
            self.failures.fetch_add(1, Ordering::Relaxed);
            return Err(CacheError::Unavailable("injected failure".into()));
        }
        Ok(())
    }
}

impl StateCache for FlakyCache {
    fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        self.check()?;
        self.inner.get(key)
    }

    fn set_with_ttl(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError> {
        self.check()?;
        self.inner.set_with_ttl(key, value, ttl)
    }

    fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.check()?;
        self.inner.delete(key)
    }
}
