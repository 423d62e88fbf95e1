//! In-process [`CacheOperations`] backend.
//!
//! Behaves like a single Redis node: one lock serializes every command, values
//! are strings, integers are parsed on demand and expired keys are invisible.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{CacheError, CacheOperations};

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Shared in-memory cache store.
#[derive(Debug)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
    available: AtomicBool,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: while unavailable every command fails.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Lock the map after dropping `key` if it has expired.
    fn entries(&self, key: &str) -> Result<MutexGuard<'_, HashMap<String, Entry>>, CacheError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable("memory cache is offline".to_string()));
        }
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries
            .get(key)
            .is_some_and(|entry| entry.is_expired(Instant::now()))
        {
            entries.remove(key);
        }
        Ok(entries)
    }

    fn add(&self, key: &str, delta: i64) -> Result<i64, CacheError> {
        let mut entries = self.entries(key)?;
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: "0".to_string(),
            expires_at: None,
        });
        let current: i64 = entry.value.parse().map_err(|_| CacheError::NotAnInteger {
            key: key.to_string(),
        })?;
        let next = current
            .checked_add(delta)
            .ok_or_else(|| CacheError::Overflow {
                key: key.to_string(),
            })?;
        // ttl survives, like INCRBY
        entry.value = next.to_string();
        Ok(next)
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheOperations for MemoryCache {
    async fn increment(&self, key: &str, delta: i64) -> Result<i64, CacheError> {
        self.add(key, delta)
    }

    async fn decrement(&self, key: &str, delta: i64) -> Result<i64, CacheError> {
        let delta = delta.checked_neg().ok_or_else(|| CacheError::Overflow {
            key: key.to_string(),
        })?;
        self.add(key, delta)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        Ok(self.entries(key)?.get(key).map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries(key)?.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.entries(key)?.contains_key(key))
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let mut entries = self.entries(key)?;
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.entries(key)?.remove(key).is_some())
    }
}
