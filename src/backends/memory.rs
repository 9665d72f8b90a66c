//! Memory Backend - Concurrent `DashMap` Storage
//!
//! A process-local backend built on `DashMap`. It offers every optional
//! primitive natively, so an engine over it never falls back to
//! single-item composition.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::adapter::{coerce_integer, same_value};
use crate::capabilities::{Capabilities, CapabilityToken, ValueType};
use crate::traits::{
    BatchBackend, ClearByPrefixBackend, ExtendedBackend, FlushableBackend, SpaceReportingBackend,
    StorageBackend,
};

/// Stored value with expiration tracking
#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn new(value: Value, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|expires_at| Instant::now() > expires_at)
    }
}

/// Counters reported by [`MemoryBackend::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub entries: usize,
}

/// Concurrent in-memory storage using `DashMap`
///
/// **Features**:
/// - Lock-free concurrent reads/writes
/// - Per-item TTL, expired items are dropped on access
/// - Optional item limit; stores of new keys are rejected once it is reached
/// - Native batch, conditional, counter, flush and clear-by-prefix primitives
///
/// **Limitations**:
/// - No eviction policy; call [`cleanup_expired`](Self::cleanup_expired)
///   periodically to reclaim expired items
/// - Space is reported in items, not bytes
///
/// **Example**:
/// ```rust
/// use uniform_cache::backends::MemoryBackend;
/// use uniform_cache::StorageBackend;
/// use std::time::Duration;
///
/// # async fn example() -> anyhow::Result<()> {
/// let backend = MemoryBackend::new();
/// let value = serde_json::json!({"user": "alice"});
///
/// backend.store("user:1", &value, Some(Duration::from_secs(60))).await?;
/// assert_eq!(backend.fetch("user:1").await?, Some(value));
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct MemoryBackend {
    map: DashMap<String, CacheEntry>,
    /// Maximum number of items, `None` for unbounded
    max_items: Option<usize>,
    hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
}

impl MemoryBackend {
    /// Create an unbounded memory backend
    pub fn new() -> Self {
        info!("Initializing memory backend (concurrent HashMap)");
        Self::build(None)
    }

    /// Create a memory backend holding at most `max_items` items
    pub fn with_capacity(max_items: usize) -> Self {
        info!(max_items, "Initializing bounded memory backend");
        Self::build(Some(max_items))
    }

    fn build(max_items: Option<usize>) -> Self {
        Self {
            map: DashMap::new(),
            max_items,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stores: AtomicU64::new(0),
        }
    }

    /// Remove expired entries; returns how many were dropped.
    pub fn cleanup_expired(&self) -> usize {
        let mut removed = 0;
        self.map.retain(|_, entry| {
            if entry.is_expired() {
                removed += 1;
                false
            } else {
                true
            }
        });
        if removed > 0 {
            debug!(count = removed, "[Memory] Cleaned up expired entries");
        }
        removed
    }

    /// Number of stored entries, expired ones included until cleaned up.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    #[must_use]
    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
            entries: self.map.len(),
        }
    }

    /// Whether a write of `key` fits under the item limit.
    ///
    /// Must not be called while holding a map guard.
    fn has_room_for(&self, key: &str) -> bool {
        match self.max_items {
            Some(max) => self.map.len() < max || self.map.contains_key(key),
            None => true,
        }
    }

    fn live(&self, key: &str) -> Option<Value> {
        if let Some(entry) = self.map.get(key) {
            if !entry.is_expired() {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
        }
        self.map.remove_if(key, |_, entry| entry.is_expired());
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Shared body of increment and decrement.
    fn apply_delta(&self, key: &str, delta: i64, ttl: Option<Duration>) -> Option<i64> {
        if !self.has_room_for(key) {
            return None;
        }
        match self.map.entry(key.to_string()) {
            Entry::Occupied(mut occupied) if !occupied.get().is_expired() => {
                let entry = occupied.get_mut();
                let next = coerce_integer(&entry.value).saturating_add(delta);
                entry.value = Value::from(next);
                Some(next)
            }
            Entry::Occupied(mut occupied) => {
                occupied.insert(CacheEntry::new(Value::from(delta), ttl));
                Some(delta)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(CacheEntry::new(Value::from(delta), ttl));
                Some(delta)
            }
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

// ===== Trait Implementations =====

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn fetch(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.live(key))
    }

    async fn store(&self, key: &str, value: &Value, ttl: Option<Duration>) -> Result<bool> {
        if !self.has_room_for(key) {
            debug!(key = %key, "[Memory] Item limit reached, store rejected");
            return Ok(false);
        }
        self.map
            .insert(key.to_string(), CacheEntry::new(value.clone(), ttl));
        self.stores.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, ttl_secs = ?ttl.map(|t| t.as_secs_f64()), "[Memory] Stored key");
        Ok(true)
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        Ok(self
            .map
            .remove(key)
            .is_some_and(|(_, entry)| !entry.is_expired()))
    }

    async fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.map.get(key).is_some_and(|entry| !entry.is_expired()))
    }

    fn init_capabilities(
        &self,
        capabilities: &Capabilities,
        token: &CapabilityToken,
    ) -> crate::error::Result<()> {
        capabilities.set_supported_types(token, ValueType::ALL.map(|ty| (ty.name(), true)))?;
        capabilities.set_ttl_precision(token, 0.05)?;
        capabilities.set_max_key_length(token, 0)?;
        capabilities.set_static_ttl(token, true)?;
        capabilities.set_namespace_is_prefix(token, true)?;
        capabilities.set_namespace_separator(token, ":")?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }

    fn as_batch(&self) -> Option<&dyn BatchBackend> {
        Some(self)
    }

    fn as_extended(&self) -> Option<&dyn ExtendedBackend> {
        Some(self)
    }

    fn as_flushable(&self) -> Option<&dyn FlushableBackend> {
        Some(self)
    }

    fn as_clear_by_prefix(&self) -> Option<&dyn ClearByPrefixBackend> {
        Some(self)
    }

    fn as_space_reporting(&self) -> Option<&dyn SpaceReportingBackend> {
        Some(self)
    }
}

#[async_trait]
impl BatchBackend for MemoryBackend {
    async fn fetch_batch(&self, keys: &[String]) -> Result<HashMap<String, Value>> {
        Ok(keys
            .iter()
            .filter_map(|key| self.live(key).map(|value| (key.clone(), value)))
            .collect())
    }

    async fn contains_batch(&self, keys: &[String]) -> Result<Vec<String>> {
        let mut present = Vec::new();
        for key in keys {
            if self.contains(key).await? {
                present.push(key.clone());
            }
        }
        Ok(present)
    }

    async fn store_batch(
        &self,
        items: &[(String, Value)],
        ttl: Option<Duration>,
    ) -> Result<Vec<String>> {
        let mut failed = Vec::new();
        for (key, value) in items {
            if !self.store(key, value, ttl).await? {
                failed.push(key.clone());
            }
        }
        Ok(failed)
    }

    async fn remove_batch(&self, keys: &[String]) -> Result<Vec<String>> {
        let mut failed = Vec::new();
        for key in keys {
            if !self.remove(key).await? {
                failed.push(key.clone());
            }
        }
        Ok(failed)
    }
}

#[async_trait]
impl ExtendedBackend for MemoryBackend {
    async fn add(&self, key: &str, value: &Value, ttl: Option<Duration>) -> Result<bool> {
        if !self.has_room_for(key) {
            return Ok(false);
        }
        let added = match self.map.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    occupied.insert(CacheEntry::new(value.clone(), ttl));
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(CacheEntry::new(value.clone(), ttl));
                true
            }
        };
        if added {
            self.stores.fetch_add(1, Ordering::Relaxed);
        }
        Ok(added)
    }

    async fn replace(&self, key: &str, value: &Value, ttl: Option<Duration>) -> Result<bool> {
        let replaced = match self.map.entry(key.to_string()) {
            Entry::Occupied(mut occupied) if !occupied.get().is_expired() => {
                occupied.insert(CacheEntry::new(value.clone(), ttl));
                true
            }
            Entry::Occupied(occupied) => {
                occupied.remove();
                false
            }
            Entry::Vacant(_) => false,
        };
        if replaced {
            self.stores.fetch_add(1, Ordering::Relaxed);
        }
        Ok(replaced)
    }

    async fn check_and_set(
        &self,
        token: &Value,
        key: &str,
        value: &Value,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        match self.map.entry(key.to_string()) {
            Entry::Occupied(mut occupied)
                if !occupied.get().is_expired() && same_value(&occupied.get().value, token) =>
            {
                occupied.insert(CacheEntry::new(value.clone(), ttl));
                self.stores.fetch_add(1, Ordering::Relaxed);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn touch(&self, key: &str, ttl: Option<Duration>) -> Result<bool> {
        match self.map.get_mut(key) {
            Some(mut entry) if !entry.is_expired() => {
                entry.expires_at = ttl.map(|ttl| Instant::now() + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn increment(
        &self,
        key: &str,
        delta: i64,
        ttl: Option<Duration>,
    ) -> Result<Option<i64>> {
        Ok(self.apply_delta(key, delta, ttl))
    }

    async fn decrement(
        &self,
        key: &str,
        delta: i64,
        ttl: Option<Duration>,
    ) -> Result<Option<i64>> {
        Ok(self.apply_delta(key, delta.saturating_neg(), ttl))
    }
}

#[async_trait]
impl FlushableBackend for MemoryBackend {
    async fn flush(&self) -> Result<bool> {
        self.map.clear();
        Ok(true)
    }
}

#[async_trait]
impl ClearByPrefixBackend for MemoryBackend {
    async fn clear_by_prefix(&self, prefix: &str) -> Result<bool> {
        let before = self.map.len();
        self.map.retain(|key, _| !key.starts_with(prefix));
        debug!(
            prefix = %prefix,
            removed = before.saturating_sub(self.map.len()),
            "[Memory] Cleared by prefix"
        );
        Ok(true)
    }
}

#[async_trait]
impl SpaceReportingBackend for MemoryBackend {
    async fn total_space(&self) -> Result<u64> {
        Ok(self
            .max_items
            .map_or(u64::MAX, |max| u64::try_from(max).unwrap_or(u64::MAX)))
    }

    async fn available_space(&self) -> Result<u64> {
        let used = u64::try_from(self.map.len()).unwrap_or(u64::MAX);
        Ok(self.total_space().await?.saturating_sub(used))
    }
}
