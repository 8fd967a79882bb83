//! Response cache keyed by source identity
//!
//! Provides a `ResponseCache` that keeps, per key, the latest response and a
//! backup of the latest success with its own expiry, supporting degraded mode
//! when upstream APIs are unavailable.

use chrono::Duration;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::clock::SharedClock;
use crate::data::Response;

/// Per-key cache state
#[derive(Debug, Default, Clone)]
struct CacheEntry {
    /// Most recent response, success or failure
    current: Option<Response>,
    /// Most recent success, kept for degraded mode
    backup: Option<Response>,
}

/// Thread-safe store of the latest response and backup per key
///
/// Reads share a lock, writes take it exclusively; no operation holds the
/// lock across an upstream call. Entries are created on first `set` and live
/// for the lifetime of the process.
#[derive(Clone)]
pub struct ResponseCache {
    /// Entries keyed by source name or sub-entity key
    entries: Arc<RwLock<HashMap<String, CacheEntry>>>,
    /// Time source for expiry checks and backup windows
    clock: SharedClock,
}

impl ResponseCache {
    /// Creates an empty cache reading time from `clock`
    pub fn new(clock: SharedClock) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            clock,
        }
    }

    /// Returns the current response for `key` if it is still fresh
    ///
    /// Never triggers a fetch.
    pub fn get(&self, key: &str) -> Option<Response> {
        let now = self.clock.now();
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(key)?
            .current
            .as_ref()
            .filter(|response| response.is_fresh_at(now))
            .cloned()
    }

    /// Returns the backup for `key` if its degraded window is still open
    pub fn get_backup(&self, key: &str) -> Option<Response> {
        let now = self.clock.now();
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(key)?
            .backup
            .as_ref()
            .filter(|response| response.is_fresh_at(now))
            .cloned()
    }

    /// Stores `response` as the current value for `key`
    ///
    /// If the response is a success, the backup is also replaced by a copy
    /// that stays servable for `degraded_ttl` from now. Failures and degraded
    /// responses leave the backup untouched.
    ///
    /// # Arguments
    /// * `key` - Source name or sub-entity key
    /// * `response` - The response to store
    /// * `degraded_ttl` - Backup window opened by a success
    pub fn set(&self, key: &str, response: Response, degraded_ttl: Duration) {
        let backup = response
            .is_success()
            .then(|| response.backup(self.clock.now(), degraded_ttl));

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.entry(key.to_string()).or_default();
        entry.current = Some(response);
        if let Some(backup) = backup {
            entry.backup = Some(backup);
        }
    }

    /// Number of keys that have been stored at least once
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether nothing has been stored yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
