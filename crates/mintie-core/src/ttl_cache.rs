//! Time-bounded key/value store for short-lived state.
//!
//! Entries expire by wall-clock deadline rather than by a background sweep
//! task. The clock is injected so expiry is fully testable without real time
//! passing; callers that want periodic reclamation call [`TtlCache::sweep`].

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use crate::time_utils::{current_unix_timestamp_ms, is_expired_unix_ms};

type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

struct CacheEntry<V> {
    value: V,
    expires_unix_ms: u64,
}

/// Expiring key/value cache keyed by string.
pub struct TtlCache<V> {
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
    clock: Clock,
}

impl<V> TtlCache<V> {
    /// Creates a cache backed by the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(current_unix_timestamp_ms))
    }

    /// Creates a cache with an injected millisecond clock.
    pub fn with_clock(clock: Clock) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Stores `value` under `key` for `ttl_ms` milliseconds. A zero TTL
    /// expires immediately and is never observable.
    pub fn put(&self, key: &str, value: V, ttl_ms: u64) {
        let expires_unix_ms = (self.clock)().saturating_add(ttl_ms);
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_unix_ms,
            },
        );
    }

    /// Removes and returns the live value under `key`, if any. Expired
    /// entries are dropped on the way out.
    pub fn take(&self, key: &str) -> Option<V> {
        let now = (self.clock)();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = entries.remove(key)?;
        if is_expired_unix_ms(Some(entry.expires_unix_ms), now) {
            return None;
        }
        Some(entry.value)
    }

    /// Removes every expired entry and returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let now = (self.clock)();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|_, entry| !is_expired_unix_ms(Some(entry.expires_unix_ms), now));
        before - entries.len()
    }

    /// Number of stored entries, counting ones that have expired but have
    /// not been reclaimed yet.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V: Clone> TtlCache<V> {
    /// Returns a clone of the live value under `key`, dropping it if expired.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = (self.clock)();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(key) {
            Some(entry) if !is_expired_unix_ms(Some(entry.expires_unix_ms), now) => {
                Some(entry.value.clone())
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }
}

impl<V> Default for TtlCache<V> {
    fn default() -> Self {
        Self::new()
    }
}
