//! Storage Backend Traits
//!
//! This module defines the contract a concrete storage implementation
//! fulfils so the adapter engine can drive it.
//!
//! # Architecture
//!
//! - `StorageBackend`: required primitives (fetch, store, remove, contains)
//! - `BatchBackend`: optional native batch primitives
//! - `ExtendedBackend`: optional native add/replace/check-and-set/touch/counters
//! - `FlushableBackend`, `ClearByPrefixBackend`, `SpaceReportingBackend`:
//!   optional maintenance and reporting primitives
//!
//! Optional traits are exposed through accessor methods on `StorageBackend`
//! (`as_batch`, `as_extended`, ...). The engine queries them once, at
//! construction, and falls back to composing single-item primitives for
//! anything the backend does not provide.
//!
//! # Example: Custom Backend
//!
//! ```rust,ignore
//! use uniform_cache::{StorageBackend, async_trait};
//! use serde_json::Value;
//! use std::time::Duration;
//! use anyhow::Result;
//!
//! struct MyStore {
//!     // Your implementation
//! }
//!
//! #[async_trait]
//! impl StorageBackend for MyStore {
//!     async fn fetch(&self, key: &str) -> Result<Option<Value>> {
//!         // Your implementation
//!     }
//!
//!     async fn store(&self, key: &str, value: &Value, ttl: Option<Duration>) -> Result<bool> {
//!         // Your implementation
//!     }
//!
//!     async fn remove(&self, key: &str) -> Result<bool> {
//!         // Your implementation
//!     }
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::capabilities::{Capabilities, CapabilityToken};

/// Required primitives of every storage backend.
///
/// A primitive returns `Ok(false)` / `Ok(None)` when the storage semantics
/// reject or miss the item, and `Err` only when it failed to execute.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; the engine may be shared across tasks.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Fetch the value stored under `key`.
    ///
    /// # Returns
    ///
    /// * `Ok(Some(value))` - Item found
    /// * `Ok(None)` - Item missing or expired
    /// * `Err(e)` - Backend failed
    async fn fetch(&self, key: &str) -> Result<Option<Value>>;

    /// Store `value` under `key`, unconditionally overwriting.
    ///
    /// `ttl` is `None` when the item should not expire.
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - Stored
    /// * `Ok(false)` - Rejected by the backend (out of space, too large, ...)
    /// * `Err(e)` - Backend failed
    async fn store(&self, key: &str, value: &Value, ttl: Option<Duration>) -> Result<bool>;

    /// Remove the item under `key`.
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - Item existed and was removed
    /// * `Ok(false)` - Item did not exist
    /// * `Err(e)` - Backend failed
    async fn remove(&self, key: &str) -> Result<bool>;

    /// Check whether an item exists. Defaults to a fetch.
    async fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.fetch(key).await?.is_some())
    }

    /// Backend-specific key normalization (case folding, encoding, ...).
    ///
    /// Runs before the engine validates the key.
    fn normalize_key(&self, key: &str) -> String {
        key.to_string()
    }

    /// Declare this backend's guarantees on the engine's freshly built set.
    ///
    /// Called once, on the first capability query.
    ///
    /// # Errors
    ///
    /// Whatever the capability setters report for invalid values.
    fn init_capabilities(
        &self,
        _capabilities: &Capabilities,
        _token: &CapabilityToken,
    ) -> crate::error::Result<()> {
        Ok(())
    }

    /// Set the engine's capabilities fall back to for attributes it never set.
    ///
    /// Decorating backends return the set of the engine they wrap.
    fn capability_base(&self) -> Option<Arc<Capabilities>> {
        None
    }

    /// Name used in logs and errors.
    fn name(&self) -> &'static str {
        "unknown"
    }

    /// Native batch primitives, if any.
    fn as_batch(&self) -> Option<&dyn BatchBackend> {
        None
    }

    /// Native conditional and counter primitives, if any.
    fn as_extended(&self) -> Option<&dyn ExtendedBackend> {
        None
    }

    /// Flush primitive, if any.
    fn as_flushable(&self) -> Option<&dyn FlushableBackend> {
        None
    }

    /// Clear-by-prefix primitive, if any.
    fn as_clear_by_prefix(&self) -> Option<&dyn ClearByPrefixBackend> {
        None
    }

    /// Space reporting primitives, if any.
    fn as_space_reporting(&self) -> Option<&dyn SpaceReportingBackend> {
        None
    }
}

/// Native batch primitives.
///
/// Keys are storage keys (namespace already applied); result maps use the
/// same keys.
#[async_trait]
pub trait BatchBackend: Send + Sync {
    /// Fetch many items; the map holds found items only.
    async fn fetch_batch(&self, keys: &[String]) -> Result<HashMap<String, Value>>;

    /// Return the keys that exist.
    async fn contains_batch(&self, keys: &[String]) -> Result<Vec<String>>;

    /// Store many items; returns the keys that were **not** stored.
    async fn store_batch(
        &self,
        items: &[(String, Value)],
        ttl: Option<Duration>,
    ) -> Result<Vec<String>>;

    /// Remove many items; returns the keys that were **not** removed.
    async fn remove_batch(&self, keys: &[String]) -> Result<Vec<String>>;
}

/// Native single-item primitives the engine otherwise composes from
/// fetch/store/contains.
#[async_trait]
pub trait ExtendedBackend: Send + Sync {
    /// Store only if `key` is absent.
    async fn add(&self, key: &str, value: &Value, ttl: Option<Duration>) -> Result<bool>;

    /// Store only if `key` is present.
    async fn replace(&self, key: &str, value: &Value, ttl: Option<Duration>) -> Result<bool>;

    /// Store only if the current value equals `token`.
    async fn check_and_set(
        &self,
        token: &Value,
        key: &str,
        value: &Value,
        ttl: Option<Duration>,
    ) -> Result<bool>;

    /// Refresh the expiry of an existing item.
    async fn touch(&self, key: &str, ttl: Option<Duration>) -> Result<bool>;

    /// Add `delta` to the integer under `key` (0 when absent) and return the new value.
    ///
    /// `Ok(None)` when the write was rejected.
    async fn increment(&self, key: &str, delta: i64, ttl: Option<Duration>)
    -> Result<Option<i64>>;

    /// Subtract `delta` from the integer under `key` (0 when absent).
    async fn decrement(&self, key: &str, delta: i64, ttl: Option<Duration>)
    -> Result<Option<i64>>;
}

/// Remove every item.
#[async_trait]
pub trait FlushableBackend: Send + Sync {
    async fn flush(&self) -> Result<bool>;
}

/// Remove every item whose storage key starts with a prefix.
#[async_trait]
pub trait ClearByPrefixBackend: Send + Sync {
    async fn clear_by_prefix(&self, prefix: &str) -> Result<bool>;
}

/// Report storage space, in backend-defined units.
#[async_trait]
pub trait SpaceReportingBackend: Send + Sync {
    async fn total_space(&self) -> Result<u64>;

    async fn available_space(&self) -> Result<u64>;
}

/// Which optional primitives a backend offered when the engine was built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NativeSupport {
    pub batch: bool,
    pub extended: bool,
    pub flush: bool,
    pub clear_by_prefix: bool,
    pub space_reporting: bool,
}

impl NativeSupport {
    /// Probe the optional accessors of `backend`.
    pub fn probe<B: StorageBackend + ?Sized>(backend: &B) -> Self {
        Self {
            batch: backend.as_batch().is_some(),
            extended: backend.as_extended().is_some(),
            flush: backend.as_flushable().is_some(),
            clear_by_prefix: backend.as_clear_by_prefix().is_some(),
            space_reporting: backend.as_space_reporting().is_some(),
        }
    }
}
