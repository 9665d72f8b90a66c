//! Common utilities for integration tests
//!
//! This module provides shared test infrastructure including:
//! - Tracing setup
//! - A minimal backend offering only the required primitives, with failure injection
//! - Adapter constructors over both backends
//! - Test data generators

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, bail};
use parking_lot::Mutex;
use serde_json::Value;
use uniform_cache::backends::MemoryBackend;
use uniform_cache::{StorageAdapter, StorageBackend, async_trait};

/// Install a tracing subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Create a test key with unique suffix
pub fn test_key(name: &str) -> String {
    format!("test_{}_{}", name, rand::random::<u32>())
}

/// Backend implementing only `fetch`, `store` and `remove`.
///
/// Every batch or extended operation on an engine over it goes through
/// single-item composition.
#[derive(Default)]
pub struct SimpleBackend {
    items: Mutex<HashMap<String, Value>>,
    failing: Mutex<HashSet<String>>,
    rejecting: Mutex<HashSet<String>>,
    calls: AtomicUsize,
    ttls: Mutex<Vec<Option<Duration>>>,
}

impl SimpleBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every primitive on `storage_key` fail until [`heal`](Self::heal).
    pub fn fail_on(&self, storage_key: &str) {
        self.failing.lock().insert(storage_key.to_string());
    }

    pub fn heal(&self, storage_key: &str) {
        self.failing.lock().remove(storage_key);
    }

    /// Make stores of `storage_key` report `Ok(false)`.
    pub fn reject_on(&self, storage_key: &str) {
        self.rejecting.lock().insert(storage_key.to_string());
    }

    /// Primitive calls received so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// TTL passed to the most recent store
    pub fn last_ttl(&self) -> Option<Option<Duration>> {
        self.ttls.lock().last().copied()
    }

    /// Value under `storage_key`, bypassing the engine
    pub fn raw(&self, storage_key: &str) -> Option<Value> {
        self.items.lock().get(storage_key).cloned()
    }

    /// Stored keys, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.items.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    fn enter(&self, key: &str) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.lock().contains(key) {
            bail!("injected failure on '{key}'");
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for SimpleBackend {
    async fn fetch(&self, key: &str) -> Result<Option<Value>> {
        self.enter(key)?;
        Ok(self.items.lock().get(key).cloned())
    }

    async fn store(&self, key: &str, value: &Value, ttl: Option<Duration>) -> Result<bool> {
        self.enter(key)?;
        self.ttls.lock().push(ttl);
        if self.rejecting.lock().contains(key) {
            return Ok(false);
        }
        self.items.lock().insert(key.to_string(), value.clone());
        Ok(true)
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        self.enter(key)?;
        Ok(self.items.lock().remove(key).is_some())
    }

    fn name(&self) -> &'static str {
        "simple"
    }
}

/// Engine over the native-everything memory backend
pub fn memory_adapter() -> StorageAdapter<MemoryBackend> {
    init_tracing();
    StorageAdapter::new(MemoryBackend::new())
}

/// Engine over the minimal backend
pub fn simple_adapter() -> StorageAdapter<SimpleBackend> {
    init_tracing();
    StorageAdapter::new(SimpleBackend::new())
}

/// Generate test data of various types
pub mod test_data {
    use serde_json::{Value, json};

    pub fn json_user(id: u64) -> Value {
        json!({
            "id": id,
            "name": format!("User {id}"),
            "email": format!("user{id}@example.com"),
            "active": true,
        })
    }

    pub fn json_list(len: usize) -> Value {
        Value::Array((0..len).map(|i| json!(i)).collect())
    }
}
