//! Adapter Engine
//!
//! [`StorageAdapter`] turns a [`StorageBackend`] into the full operation
//! contract: single-item and batch reads, conditional writes, touch,
//! counters and removal. Every operation follows the same sequence:
//!
//! 1. `readable` / `writable` gate (negative result, pipeline bypassed)
//! 2. key normalization and validation (errors raised immediately)
//! 3. pre-phase listeners (may short-circuit)
//! 4. backend execution, native primitive or single-item composition
//! 5. post-phase listeners, or exception-phase listeners on error
//!
//! # Example
//!
//! ```rust
//! use uniform_cache::{StorageAdapter, backends::MemoryBackend};
//! use serde_json::json;
//!
//! # async fn example() -> uniform_cache::Result<()> {
//! let cache = StorageAdapter::new(MemoryBackend::new());
//!
//! cache.set_item("user:1", json!({"name": "alice"})).await?;
//! assert_eq!(cache.get_item("user:1").await?, Some(json!({"name": "alice"})));
//!
//! assert!(!cache.add_item("user:1", json!("other")).await?);
//! assert_eq!(cache.increment_item("visits", 3).await?, Some(3));
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, HashSet};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::builder::AdapterBuilder;
use crate::capabilities::{Capabilities, CapabilityChange, CapabilityToken};
use crate::context::{Arguments, OpResult, Operation, OperationContext};
use crate::error::{CacheError, Result};
use crate::events::EventManager;
use crate::options::{AdapterOptions, CompiledOptions, compile_key_pattern, validate_ttl};
use crate::plugins::{Plugin, PluginRegistry};
use crate::traits::{NativeSupport, StorageBackend};

/// Capacity of the capability change channel
const CAPABILITY_CHANNEL_CAPACITY: usize = 64;

/// The lazily built capability set together with the token that opens it.
struct CapabilitySlot {
    capabilities: Arc<Capabilities>,
    token: CapabilityToken,
}

/// Generic adapter engine over one storage backend.
pub struct StorageAdapter<B: StorageBackend> {
    backend: B,
    /// Optional primitives, probed once at construction
    native: NativeSupport,
    options: RwLock<CompiledOptions>,
    events: EventManager,
    plugins: PluginRegistry,
    capability_base: Option<Arc<Capabilities>>,
    capabilities: Mutex<Option<Arc<CapabilitySlot>>>,
    capability_changes: broadcast::Sender<CapabilityChange>,
}

impl<B: StorageBackend> std::fmt::Debug for StorageAdapter<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageAdapter")
            .field("backend", &self.backend.name())
            .field("native", &self.native)
            .field("options", &self.options.read().options)
            .field("plugins", &self.plugins)
            .finish_non_exhaustive()
    }
}

impl<B: StorageBackend> StorageAdapter<B> {
    /// Create an adapter with default options.
    pub fn new(backend: B) -> Self {
        Self::assemble(
            backend,
            CompiledOptions {
                options: AdapterOptions::default(),
                key_pattern: None,
            },
            None,
        )
    }

    /// Create an adapter with `options`.
    ///
    /// # Errors
    ///
    /// [`CacheError::InvalidArgument`] for options that fail validation.
    pub fn with_options(backend: B, options: AdapterOptions) -> Result<Self> {
        Self::builder(backend).options(options).build()
    }

    /// Start a builder for `backend`.
    pub fn builder(backend: B) -> AdapterBuilder<B> {
        AdapterBuilder::new(backend)
    }

    pub(crate) fn assemble(
        backend: B,
        options: CompiledOptions,
        capability_base: Option<Arc<Capabilities>>,
    ) -> Self {
        let native = NativeSupport::probe(&backend);
        let capability_base = capability_base.or_else(|| backend.capability_base());
        let (capability_changes, _) = broadcast::channel(CAPABILITY_CHANNEL_CAPACITY);

        info!(
            backend = backend.name(),
            batch = native.batch,
            extended = native.extended,
            "Storage adapter initialized"
        );

        Self {
            backend,
            native,
            options: RwLock::new(options),
            events: EventManager::new(),
            plugins: PluginRegistry::new(),
            capability_base,
            capabilities: Mutex::new(None),
            capability_changes,
        }
    }

    // ===== Accessors =====

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Optional primitives the backend offered at construction.
    pub fn native_support(&self) -> NativeSupport {
        self.native
    }

    /// Listener registry of this engine.
    pub fn events(&self) -> &EventManager {
        &self.events
    }

    /// Snapshot of the current options.
    pub fn options(&self) -> AdapterOptions {
        self.options.read().options.clone()
    }

    // ===== Options =====

    pub fn set_readable(&self, readable: bool) {
        self.options.write().options.readable = readable;
    }

    pub fn set_writable(&self, writable: bool) {
        self.options.write().options.writable = writable;
    }

    /// # Errors
    ///
    /// [`CacheError::InvalidArgument`] when `pattern` does not compile.
    pub fn set_key_pattern(&self, pattern: Option<&str>) -> Result<()> {
        let compiled = compile_key_pattern(pattern)?;
        let mut options = self.options.write();
        options.options.key_pattern = pattern.filter(|p| !p.is_empty()).map(str::to_string);
        options.key_pattern = compiled;
        Ok(())
    }

    /// # Errors
    ///
    /// [`CacheError::InvalidArgument`] for a negative TTL or one outside
    /// the backend's declared bounds.
    pub fn set_ttl(&self, seconds: f64) -> Result<()> {
        self.check_ttl(seconds)?;
        self.options.write().options.ttl = seconds;
        Ok(())
    }

    pub fn set_namespace(&self, namespace: impl Into<String>) {
        self.options.write().options.namespace = namespace.into();
    }

    #[allow(clippy::cast_precision_loss)]
    pub(crate) fn check_ttl(&self, seconds: f64) -> Result<()> {
        validate_ttl(seconds)?;
        if seconds == 0.0 {
            return Ok(());
        }
        let capabilities = self.capabilities()?;
        let (min, max) = (capabilities.min_ttl(), capabilities.max_ttl());
        if min > 0 && seconds < min as f64 {
            return Err(CacheError::invalid(format!(
                "ttl {seconds}s is below the backend minimum of {min}s"
            )));
        }
        if max > 0 && seconds > max as f64 {
            return Err(CacheError::invalid(format!(
                "ttl {seconds}s exceeds the backend maximum of {max}s"
            )));
        }
        Ok(())
    }

    /// `readable` gates read operations, `writable` everything else.
    fn is_enabled(&self, operation: Operation) -> bool {
        let options = self.options.read();
        if operation.is_read() {
            options.options.readable
        } else {
            options.options.writable
        }
    }

    fn is_writable(&self) -> bool {
        self.options.read().options.writable
    }

    fn ttl(&self) -> Option<Duration> {
        self.options.read().options.ttl_duration()
    }

    // ===== Capabilities =====

    fn capability_slot(&self) -> Result<Arc<CapabilitySlot>> {
        let mut slot = self.capabilities.lock();
        if let Some(existing) = slot.as_ref() {
            return Ok(Arc::clone(existing));
        }

        let token = CapabilityToken::new();
        let capabilities = match &self.capability_base {
            Some(base) => Capabilities::with_base(Arc::clone(base), &token),
            None => Capabilities::new(&token),
        };
        self.backend.init_capabilities(&capabilities, &token)?;
        let capabilities = capabilities.with_notifier(self.capability_changes.clone());
        debug!(backend = self.backend.name(), "Capabilities built");

        let created = Arc::new(CapabilitySlot {
            capabilities: Arc::new(capabilities),
            token,
        });
        *slot = Some(Arc::clone(&created));
        Ok(created)
    }

    /// The capability set, built on first use.
    ///
    /// # Errors
    ///
    /// Whatever the backend's `init_capabilities` reports.
    pub fn capabilities(&self) -> Result<Arc<Capabilities>> {
        Ok(Arc::clone(&self.capability_slot()?.capabilities))
    }

    /// Change capabilities as their owner.
    ///
    /// # Errors
    ///
    /// Whatever `update` or the capability setters report.
    pub fn update_capabilities<F>(&self, update: F) -> Result<()>
    where
        F: FnOnce(&Capabilities, &CapabilityToken) -> Result<()>,
    {
        let slot = self.capability_slot()?;
        update(&slot.capabilities, &slot.token)
    }

    /// Receive a [`CapabilityChange`] whenever a setter changes a value.
    pub fn subscribe_capability_changes(&self) -> broadcast::Receiver<CapabilityChange> {
        self.capability_changes.subscribe()
    }

    // ===== Plugins =====

    /// # Errors
    ///
    /// [`CacheError::AlreadyAttached`] when `plugin` is already attached.
    pub fn add_plugin(&self, plugin: Arc<dyn Plugin>, priority: i32) -> Result<()> {
        self.plugins.attach(plugin, &self.events, priority)
    }

    /// Returns `false` when `plugin` was not attached.
    pub fn remove_plugin<P: Plugin + ?Sized>(&self, plugin: &Arc<P>) -> bool {
        self.plugins.detach(plugin, &self.events)
    }

    pub fn has_plugin<P: Plugin + ?Sized>(&self, plugin: &Arc<P>) -> bool {
        self.plugins.contains(plugin)
    }

    /// Attached plugins, in attachment order.
    pub fn plugins(&self) -> Vec<Arc<dyn Plugin>> {
        self.plugins.plugins()
    }

    // ===== Key handling =====

    fn normalize_key(&self, key: &str) -> Result<String> {
        let key = self.backend.normalize_key(key);
        if key.is_empty() {
            return Err(CacheError::invalid("an empty key is not allowed"));
        }
        if let Some(pattern) = &self.options.read().key_pattern {
            if !pattern.is_match(&key) {
                return Err(CacheError::invalid(format!(
                    "key '{key}' does not match pattern '{}'",
                    pattern.as_str()
                )));
            }
        }

        let max_length = self.capabilities()?.max_key_length();
        if let Ok(max_length) = usize::try_from(max_length) {
            let length = self.storage_key(&key)?.len();
            if max_length > 0 && length > max_length {
                return Err(CacheError::invalid(format!(
                    "key '{key}' is {length} bytes long, the backend allows {max_length}"
                )));
            }
        }
        Ok(key)
    }

    /// Normalize a key list, dropping repeats after their first occurrence.
    fn normalize_keys<'a>(&self, keys: impl IntoIterator<Item = &'a str>) -> Result<Vec<String>> {
        let mut seen = HashSet::new();
        let mut normalized = Vec::new();
        for key in keys {
            let key = self.normalize_key(key)?;
            if seen.insert(key.clone()) {
                normalized.push(key);
            }
        }
        if normalized.is_empty() {
            return Err(CacheError::invalid("an empty list of keys is not allowed"));
        }
        Ok(normalized)
    }

    /// Normalize a key/value batch: repeated keys keep their first position
    /// and their last value.
    fn normalize_pairs<K, T>(&self, pairs: impl IntoIterator<Item = (K, T)>) -> Result<Vec<(String, T)>>
    where
        K: AsRef<str>,
    {
        let mut positions: HashMap<String, usize> = HashMap::new();
        let mut normalized: Vec<(String, T)> = Vec::new();
        for (key, value) in pairs {
            let key = self.normalize_key(key.as_ref())?;
            match positions.get(&key) {
                Some(&index) => {
                    if let Some(slot) = normalized.get_mut(index) {
                        slot.1 = value;
                    }
                }
                None => {
                    positions.insert(key.clone(), normalized.len());
                    normalized.push((key, value));
                }
            }
        }
        if normalized.is_empty() {
            return Err(CacheError::invalid("an empty batch is not allowed"));
        }
        Ok(normalized)
    }

    /// Prefix applied to storage keys by the current namespace.
    fn namespace_prefix(&self) -> Result<String> {
        let namespace = self.options.read().options.namespace.clone();
        if namespace.is_empty() {
            return Ok(String::new());
        }
        let capabilities = self.capabilities()?;
        if !capabilities.namespace_is_prefix() {
            return Ok(String::new());
        }
        Ok(format!("{namespace}{}", capabilities.namespace_separator()))
    }

    fn storage_key(&self, key: &str) -> Result<String> {
        Ok(format!("{}{key}", self.namespace_prefix()?))
    }

    // ===== Pipeline =====

    async fn pipeline(&self, context: OperationContext) -> Result<OpResult> {
        debug!(operation = %context.operation(), keys = ?context.keys(), "Running operation");
        let context = match self.events.run_pre(context) {
            ControlFlow::Break(result) => return Ok(result),
            ControlFlow::Continue(context) => context,
        };

        match self.execute(&context).await {
            Ok(result) => Ok(self.events.run_post(context, result)),
            Err(error) => {
                warn!(
                    operation = %context.operation(),
                    backend = self.backend.name(),
                    error = %error,
                    "Operation failed, running exception listeners"
                );
                let fallback = context.negative_result();
                self.events.run_exception(context, error, fallback)
            }
        }
    }

    async fn execute(&self, context: &OperationContext) -> Result<OpResult> {
        let operation = context.operation();
        let ttl = context.ttl().or_else(|| self.ttl());
        let result = match operation {
            Operation::GetItem => OpResult::Value(self.fetch(operation, context.as_key()?).await?),
            Operation::GetItems => OpResult::Values(self.fetch_many(operation, context.as_keys()?).await?),
            Operation::HasItem => OpResult::Flag(self.contains(operation, context.as_key()?).await?),
            Operation::HasItems => OpResult::Keys(self.contains_many(operation, context.as_keys()?).await?),
            Operation::SetItem => {
                let (key, value) = context.as_item()?;
                OpResult::Flag(self.store(operation, key, value, ttl).await?)
            }
            Operation::SetItems => OpResult::Keys(self.store_many(operation, context.as_items()?, ttl).await?),
            Operation::AddItem => {
                let (key, value) = context.as_item()?;
                OpResult::Flag(self.add(operation, key, value, ttl).await?)
            }
            Operation::AddItems => {
                let mut failed = Vec::new();
                for (key, value) in context.as_items()? {
                    if !self.add(operation, key, value, ttl).await? {
                        failed.push(key.clone());
                    }
                }
                OpResult::Keys(failed)
            }
            Operation::ReplaceItem => {
                let (key, value) = context.as_item()?;
                OpResult::Flag(self.replace(operation, key, value, ttl).await?)
            }
            Operation::ReplaceItems => {
                let mut failed = Vec::new();
                for (key, value) in context.as_items()? {
                    if !self.replace(operation, key, value, ttl).await? {
                        failed.push(key.clone());
                    }
                }
                OpResult::Keys(failed)
            }
            Operation::CheckAndSetItem => {
                let (token, key, value) = context.as_check_and_set()?;
                OpResult::Flag(self.check_and_set(operation, token, key, value, ttl).await?)
            }
            Operation::TouchItem => OpResult::Flag(self.touch(operation, context.as_key()?, ttl).await?),
            Operation::TouchItems => {
                let mut failed = Vec::new();
                for key in context.as_keys()? {
                    if !self.touch(operation, key, ttl).await? {
                        failed.push(key.clone());
                    }
                }
                OpResult::Keys(failed)
            }
            Operation::RemoveItem => OpResult::Flag(self.remove(operation, context.as_key()?).await?),
            Operation::RemoveItems => OpResult::Keys(self.remove_many(operation, context.as_keys()?).await?),
            Operation::IncrementItem | Operation::DecrementItem => {
                let (key, delta) = context.as_counter()?;
                OpResult::Counter(self.apply_delta(operation, key, delta, ttl).await?)
            }
            Operation::IncrementItems | Operation::DecrementItems => {
                let mut values = HashMap::new();
                for (key, delta) in context.as_counters()? {
                    if let Some(value) = self.apply_delta(operation, key, *delta, ttl).await? {
                        values.insert(key.clone(), value);
                    }
                }
                OpResult::Counters(values)
            }
        };
        Ok(result)
    }

    // ===== Backend execution =====

    async fn fetch(&self, operation: Operation, key: &str) -> Result<Option<Value>> {
        let storage_key = self.storage_key(key)?;
        self.backend
            .fetch(&storage_key)
            .await
            .map_err(|e| CacheError::backend(operation.as_str(), vec![key.to_string()], e))
    }

    async fn fetch_many(&self, operation: Operation, keys: &[String]) -> Result<HashMap<String, Value>> {
        if let Some(batch) = self.native.batch.then(|| self.backend.as_batch()).flatten() {
            let (storage_keys, by_storage) = self.storage_keys(keys)?;
            let found = batch
                .fetch_batch(&storage_keys)
                .await
                .map_err(|e| CacheError::backend(operation.as_str(), keys.to_vec(), e))?;
            return Ok(found
                .into_iter()
                .filter_map(|(storage_key, value)| {
                    by_storage.get(&storage_key).map(|key| (key.clone(), value))
                })
                .collect());
        }

        let mut found = HashMap::new();
        for key in keys {
            if let Some(value) = self.fetch(operation, key).await? {
                found.insert(key.clone(), value);
            }
        }
        Ok(found)
    }

    async fn contains(&self, operation: Operation, key: &str) -> Result<bool> {
        let storage_key = self.storage_key(key)?;
        self.backend
            .contains(&storage_key)
            .await
            .map_err(|e| CacheError::backend(operation.as_str(), vec![key.to_string()], e))
    }

    async fn contains_many(&self, operation: Operation, keys: &[String]) -> Result<Vec<String>> {
        if let Some(batch) = self.native.batch.then(|| self.backend.as_batch()).flatten() {
            let (storage_keys, by_storage) = self.storage_keys(keys)?;
            let present: HashSet<String> = batch
                .contains_batch(&storage_keys)
                .await
                .map_err(|e| CacheError::backend(operation.as_str(), keys.to_vec(), e))?
                .into_iter()
                .filter_map(|storage_key| by_storage.get(&storage_key).cloned())
                .collect();
            return Ok(keys.iter().filter(|k| present.contains(*k)).cloned().collect());
        }

        let mut present = Vec::new();
        for key in keys {
            if self.contains(operation, key).await? {
                present.push(key.clone());
            }
        }
        Ok(present)
    }

    async fn store(
        &self,
        operation: Operation,
        key: &str,
        value: &Value,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let storage_key = self.storage_key(key)?;
        self.backend
            .store(&storage_key, value, ttl)
            .await
            .map_err(|e| CacheError::backend(operation.as_str(), vec![key.to_string()], e))
    }

    async fn store_many(
        &self,
        operation: Operation,
        items: &[(String, Value)],
        ttl: Option<Duration>,
    ) -> Result<Vec<String>> {
        if let Some(batch) = self.native.batch.then(|| self.backend.as_batch()).flatten() {
            let prefix = self.namespace_prefix()?;
            let by_storage: HashMap<String, String> = items
                .iter()
                .map(|(key, _)| (format!("{prefix}{key}"), key.clone()))
                .collect();
            let storage_items: Vec<(String, Value)> = items
                .iter()
                .map(|(key, value)| (format!("{prefix}{key}"), value.clone()))
                .collect();
            let failed: HashSet<String> = batch
                .store_batch(&storage_items, ttl)
                .await
                .map_err(|e| {
                    let keys = items.iter().map(|(k, _)| k.clone()).collect();
                    CacheError::backend(operation.as_str(), keys, e)
                })?
                .into_iter()
                .filter_map(|storage_key| by_storage.get(&storage_key).cloned())
                .collect();
            return Ok(items
                .iter()
                .filter(|(key, _)| failed.contains(key))
                .map(|(key, _)| key.clone())
                .collect());
        }

        let mut failed = Vec::new();
        for (key, value) in items {
            if !self.store(operation, key, value, ttl).await? {
                failed.push(key.clone());
            }
        }
        Ok(failed)
    }

    async fn add(
        &self,
        operation: Operation,
        key: &str,
        value: &Value,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        if let Some(extended) = self.native.extended.then(|| self.backend.as_extended()).flatten() {
            let storage_key = self.storage_key(key)?;
            return extended
                .add(&storage_key, value, ttl)
                .await
                .map_err(|e| CacheError::backend(operation.as_str(), vec![key.to_string()], e));
        }

        if self.contains(operation, key).await? {
            return Ok(false);
        }
        self.store(operation, key, value, ttl).await
    }

    async fn replace(
        &self,
        operation: Operation,
        key: &str,
        value: &Value,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        if let Some(extended) = self.native.extended.then(|| self.backend.as_extended()).flatten() {
            let storage_key = self.storage_key(key)?;
            return extended
                .replace(&storage_key, value, ttl)
                .await
                .map_err(|e| CacheError::backend(operation.as_str(), vec![key.to_string()], e));
        }

        if !self.contains(operation, key).await? {
            return Ok(false);
        }
        self.store(operation, key, value, ttl).await
    }

    async fn check_and_set(
        &self,
        operation: Operation,
        token: &Value,
        key: &str,
        value: &Value,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        if let Some(extended) = self.native.extended.then(|| self.backend.as_extended()).flatten() {
            let storage_key = self.storage_key(key)?;
            return extended
                .check_and_set(token, &storage_key, value, ttl)
                .await
                .map_err(|e| CacheError::backend(operation.as_str(), vec![key.to_string()], e));
        }

        match self.fetch(operation, key).await? {
            Some(current) if same_value(&current, token) => self.store(operation, key, value, ttl).await,
            _ => Ok(false),
        }
    }

    async fn touch(&self, operation: Operation, key: &str, ttl: Option<Duration>) -> Result<bool> {
        if let Some(extended) = self.native.extended.then(|| self.backend.as_extended()).flatten() {
            let storage_key = self.storage_key(key)?;
            return extended
                .touch(&storage_key, ttl)
                .await
                .map_err(|e| CacheError::backend(operation.as_str(), vec![key.to_string()], e));
        }

        match self.fetch(operation, key).await? {
            Some(current) => self.replace(operation, key, &current, ttl).await,
            None => Ok(false),
        }
    }

    async fn remove(&self, operation: Operation, key: &str) -> Result<bool> {
        let storage_key = self.storage_key(key)?;
        self.backend
            .remove(&storage_key)
            .await
            .map_err(|e| CacheError::backend(operation.as_str(), vec![key.to_string()], e))
    }

    async fn remove_many(&self, operation: Operation, keys: &[String]) -> Result<Vec<String>> {
        if let Some(batch) = self.native.batch.then(|| self.backend.as_batch()).flatten() {
            let (storage_keys, by_storage) = self.storage_keys(keys)?;
            let failed: HashSet<String> = batch
                .remove_batch(&storage_keys)
                .await
                .map_err(|e| CacheError::backend(operation.as_str(), keys.to_vec(), e))?
                .into_iter()
                .filter_map(|storage_key| by_storage.get(&storage_key).cloned())
                .collect();
            return Ok(keys.iter().filter(|k| failed.contains(*k)).cloned().collect());
        }

        let mut failed = Vec::new();
        for key in keys {
            if !self.remove(operation, key).await? {
                failed.push(key.clone());
            }
        }
        Ok(failed)
    }

    /// Increment for `*Increment*` operations, decrement for `*Decrement*` ones.
    async fn apply_delta(
        &self,
        operation: Operation,
        key: &str,
        delta: i64,
        ttl: Option<Duration>,
    ) -> Result<Option<i64>> {
        let decrement = matches!(operation, Operation::DecrementItem | Operation::DecrementItems);

        if let Some(extended) = self.native.extended.then(|| self.backend.as_extended()).flatten() {
            let storage_key = self.storage_key(key)?;
            let outcome = if decrement {
                extended.decrement(&storage_key, delta, ttl).await
            } else {
                extended.increment(&storage_key, delta, ttl).await
            };
            return outcome
                .map_err(|e| CacheError::backend(operation.as_str(), vec![key.to_string()], e));
        }

        let delta = if decrement { delta.saturating_neg() } else { delta };
        let (current, exists) = match self.fetch(operation, key).await? {
            Some(value) => (coerce_integer(&value), true),
            None => (0, false),
        };
        let next = current.saturating_add(delta);
        let stored = if exists {
            self.replace(operation, key, &Value::from(next), ttl).await?
        } else {
            self.add(operation, key, &Value::from(next), ttl).await?
        };
        Ok(stored.then_some(next))
    }

    /// Storage keys for `keys`, plus the reverse mapping.
    fn storage_keys(&self, keys: &[String]) -> Result<(Vec<String>, HashMap<String, String>)> {
        let prefix = self.namespace_prefix()?;
        let storage_keys: Vec<String> = keys.iter().map(|key| format!("{prefix}{key}")).collect();
        let by_storage = storage_keys
            .iter()
            .cloned()
            .zip(keys.iter().cloned())
            .collect();
        Ok((storage_keys, by_storage))
    }

    // ===== Read operations =====

    /// Get an item. `Ok(None)` on a miss.
    ///
    /// # Errors
    ///
    /// Invalid key, or a backend failure not suppressed by an exception listener.
    pub async fn get_item(&self, key: &str) -> Result<Option<Value>> {
        let operation = Operation::GetItem;
        if !self.is_enabled(operation) {
            return Ok(None);
        }
        let key = self.normalize_key(key)?;
        self.pipeline(OperationContext::new(operation, Arguments::Key(key)))
            .await?
            .into_value(operation)
    }

    /// Get many items. The map holds found items only.
    ///
    /// # Errors
    ///
    /// Empty key list or invalid key, or an unsuppressed backend failure.
    pub async fn get_items<'a>(
        &self,
        keys: impl IntoIterator<Item = &'a str>,
    ) -> Result<HashMap<String, Value>> {
        let operation = Operation::GetItems;
        if !self.is_enabled(operation) {
            return Ok(HashMap::new());
        }
        let keys = self.normalize_keys(keys)?;
        self.pipeline(OperationContext::new(operation, Arguments::Keys(keys)))
            .await?
            .into_values(operation)
    }

    /// # Errors
    ///
    /// Invalid key, or an unsuppressed backend failure.
    pub async fn has_item(&self, key: &str) -> Result<bool> {
        let operation = Operation::HasItem;
        if !self.is_enabled(operation) {
            return Ok(false);
        }
        let key = self.normalize_key(key)?;
        self.pipeline(OperationContext::new(operation, Arguments::Key(key)))
            .await?
            .into_flag(operation)
    }

    /// Returns the keys that exist, in first-seen order.
    ///
    /// # Errors
    ///
    /// Empty key list or invalid key, or an unsuppressed backend failure.
    pub async fn has_items<'a>(&self, keys: impl IntoIterator<Item = &'a str>) -> Result<Vec<String>> {
        let operation = Operation::HasItems;
        if !self.is_enabled(operation) {
            return Ok(Vec::new());
        }
        let keys = self.normalize_keys(keys)?;
        self.pipeline(OperationContext::new(operation, Arguments::Keys(keys)))
            .await?
            .into_keys(operation)
    }

    // ===== Write operations =====

    /// Store an item, overwriting any existing value.
    ///
    /// # Errors
    ///
    /// Invalid key, or an unsuppressed backend failure.
    pub async fn set_item(&self, key: &str, value: Value) -> Result<bool> {
        self.single_write(Operation::SetItem, key, value, None).await
    }

    /// Store many items. Returns the keys that were **not** stored.
    ///
    /// Repeated keys collapse to their last value.
    ///
    /// # Errors
    ///
    /// Empty batch or invalid key, or an unsuppressed backend failure.
    pub async fn set_items<K: AsRef<str>>(
        &self,
        items: impl IntoIterator<Item = (K, Value)>,
    ) -> Result<Vec<String>> {
        self.batch_write(Operation::SetItems, items).await
    }

    /// Store an item only if the key does not exist.
    ///
    /// # Errors
    ///
    /// Invalid key, or an unsuppressed backend failure.
    pub async fn add_item(&self, key: &str, value: Value) -> Result<bool> {
        self.single_write(Operation::AddItem, key, value, None).await
    }

    /// Returns the keys that were **not** added.
    ///
    /// # Errors
    ///
    /// Empty batch or invalid key, or an unsuppressed backend failure.
    pub async fn add_items<K: AsRef<str>>(
        &self,
        items: impl IntoIterator<Item = (K, Value)>,
    ) -> Result<Vec<String>> {
        self.batch_write(Operation::AddItems, items).await
    }

    /// Store an item only if the key exists.
    ///
    /// # Errors
    ///
    /// Invalid key, or an unsuppressed backend failure.
    pub async fn replace_item(&self, key: &str, value: Value) -> Result<bool> {
        self.single_write(Operation::ReplaceItem, key, value, None).await
    }

    /// Returns the keys that were **not** replaced.
    ///
    /// # Errors
    ///
    /// Empty batch or invalid key, or an unsuppressed backend failure.
    pub async fn replace_items<K: AsRef<str>>(
        &self,
        items: impl IntoIterator<Item = (K, Value)>,
    ) -> Result<Vec<String>> {
        self.batch_write(Operation::ReplaceItems, items).await
    }

    /// Store `value` only if the current value equals `token`, a value
    /// previously returned by [`get_item`](Self::get_item).
    ///
    /// Values are compared by their canonical JSON serialization. The
    /// comparison and the write are not atomic unless the backend offers a
    /// native primitive.
    ///
    /// # Errors
    ///
    /// Invalid key, or an unsuppressed backend failure.
    pub async fn check_and_set_item(&self, token: &Value, key: &str, value: Value) -> Result<bool> {
        let operation = Operation::CheckAndSetItem;
        if !self.is_enabled(operation) {
            return Ok(false);
        }
        let key = self.normalize_key(key)?;
        let arguments = Arguments::CheckAndSet {
            token: token.clone(),
            key,
            value,
        };
        self.pipeline(OperationContext::new(operation, arguments))
            .await?
            .into_flag(operation)
    }

    /// Refresh an item's expiry. `false` when the item is absent.
    ///
    /// # Errors
    ///
    /// Invalid key, or an unsuppressed backend failure.
    pub async fn touch_item(&self, key: &str) -> Result<bool> {
        let operation = Operation::TouchItem;
        if !self.is_enabled(operation) {
            return Ok(false);
        }
        let key = self.normalize_key(key)?;
        self.pipeline(OperationContext::new(operation, Arguments::Key(key)))
            .await?
            .into_flag(operation)
    }

    /// Returns the keys that were **not** touched.
    ///
    /// # Errors
    ///
    /// Empty key list or invalid key, or an unsuppressed backend failure.
    pub async fn touch_items<'a>(&self, keys: impl IntoIterator<Item = &'a str>) -> Result<Vec<String>> {
        self.batch_key_write(Operation::TouchItems, keys).await
    }

    /// Remove an item. `false` when it did not exist.
    ///
    /// # Errors
    ///
    /// Invalid key, or an unsuppressed backend failure.
    pub async fn remove_item(&self, key: &str) -> Result<bool> {
        let operation = Operation::RemoveItem;
        if !self.is_enabled(operation) {
            return Ok(false);
        }
        let key = self.normalize_key(key)?;
        self.pipeline(OperationContext::new(operation, Arguments::Key(key)))
            .await?
            .into_flag(operation)
    }

    /// Returns the keys that were **not** removed.
    ///
    /// # Errors
    ///
    /// Empty key list or invalid key, or an unsuppressed backend failure.
    pub async fn remove_items<'a>(&self, keys: impl IntoIterator<Item = &'a str>) -> Result<Vec<String>> {
        self.batch_key_write(Operation::RemoveItems, keys).await
    }

    /// Add `delta` to the integer stored under `key` (0 when absent).
    ///
    /// Returns the new value, or `None` when the engine is not writable or
    /// the backend rejected the write.
    ///
    /// # Errors
    ///
    /// Invalid key, or an unsuppressed backend failure.
    pub async fn increment_item(&self, key: &str, delta: i64) -> Result<Option<i64>> {
        self.counter(Operation::IncrementItem, key, delta).await
    }

    /// Returns the new values of the keys that were updated.
    ///
    /// # Errors
    ///
    /// Empty batch or invalid key, or an unsuppressed backend failure.
    pub async fn increment_items<K: AsRef<str>>(
        &self,
        deltas: impl IntoIterator<Item = (K, i64)>,
    ) -> Result<HashMap<String, i64>> {
        self.counters(Operation::IncrementItems, deltas).await
    }

    /// Subtract `delta` from the integer stored under `key` (0 when absent).
    ///
    /// # Errors
    ///
    /// Invalid key, or an unsuppressed backend failure.
    pub async fn decrement_item(&self, key: &str, delta: i64) -> Result<Option<i64>> {
        self.counter(Operation::DecrementItem, key, delta).await
    }

    /// Returns the new values of the keys that were updated.
    ///
    /// # Errors
    ///
    /// Empty batch or invalid key, or an unsuppressed backend failure.
    pub async fn decrement_items<K: AsRef<str>>(
        &self,
        deltas: impl IntoIterator<Item = (K, i64)>,
    ) -> Result<HashMap<String, i64>> {
        self.counters(Operation::DecrementItems, deltas).await
    }

    async fn single_write(
        &self,
        operation: Operation,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        if !self.is_enabled(operation) {
            return Ok(false);
        }
        let key = self.normalize_key(key)?;
        let context = OperationContext::new(operation, Arguments::Item { key, value }).with_ttl(ttl);
        self.pipeline(context).await?.into_flag(operation)
    }

    async fn batch_write<K: AsRef<str>>(
        &self,
        operation: Operation,
        items: impl IntoIterator<Item = (K, Value)>,
    ) -> Result<Vec<String>> {
        if !self.is_enabled(operation) {
            return Ok(unique_keys(items.into_iter().map(|(k, _)| k.as_ref().to_string())));
        }
        let items = self.normalize_pairs(items)?;
        self.pipeline(OperationContext::new(operation, Arguments::Items(items)))
            .await?
            .into_keys(operation)
    }

    async fn batch_key_write<'a>(
        &self,
        operation: Operation,
        keys: impl IntoIterator<Item = &'a str>,
    ) -> Result<Vec<String>> {
        if !self.is_enabled(operation) {
            return Ok(unique_keys(keys.into_iter().map(str::to_string)));
        }
        let keys = self.normalize_keys(keys)?;
        self.pipeline(OperationContext::new(operation, Arguments::Keys(keys)))
            .await?
            .into_keys(operation)
    }

    async fn counter(&self, operation: Operation, key: &str, delta: i64) -> Result<Option<i64>> {
        if !self.is_enabled(operation) {
            return Ok(None);
        }
        let key = self.normalize_key(key)?;
        self.pipeline(OperationContext::new(operation, Arguments::Counter { key, delta }))
            .await?
            .into_counter(operation)
    }

    async fn counters<K: AsRef<str>>(
        &self,
        operation: Operation,
        deltas: impl IntoIterator<Item = (K, i64)>,
    ) -> Result<HashMap<String, i64>> {
        if !self.is_enabled(operation) {
            return Ok(HashMap::new());
        }
        let deltas = self.normalize_pairs(deltas)?;
        self.pipeline(OperationContext::new(operation, Arguments::Counters(deltas)))
            .await?
            .into_counters(operation)
    }

    // ===== Maintenance =====

    fn unsupported(&self, operation: &'static str) -> CacheError {
        CacheError::Unsupported {
            operation,
            backend: self.backend.name(),
        }
    }

    /// Remove every item from the backend.
    ///
    /// # Errors
    ///
    /// [`CacheError::Unsupported`] without a flush primitive, or a backend failure.
    pub async fn flush(&self) -> Result<bool> {
        let Some(flushable) = self.native.flush.then(|| self.backend.as_flushable()).flatten() else {
            return Err(self.unsupported("flush"));
        };
        if !self.is_writable() {
            return Ok(false);
        }
        info!(backend = self.backend.name(), "Flushing storage");
        flushable
            .flush()
            .await
            .map_err(|e| CacheError::backend("flush", Vec::new(), e))
    }

    /// Remove every item stored under `namespace`.
    ///
    /// # Errors
    ///
    /// [`CacheError::InvalidArgument`] for an empty namespace,
    /// [`CacheError::Unsupported`] when namespaces are not key prefixes or
    /// the backend cannot clear by prefix, or a backend failure.
    pub async fn clear_by_namespace(&self, namespace: &str) -> Result<bool> {
        if namespace.is_empty() {
            return Err(CacheError::invalid("an empty namespace is not allowed"));
        }
        let Some(clearable) = self
            .native
            .clear_by_prefix
            .then(|| self.backend.as_clear_by_prefix())
            .flatten()
        else {
            return Err(self.unsupported("clear_by_namespace"));
        };
        let capabilities = self.capabilities()?;
        if !capabilities.namespace_is_prefix() {
            return Err(self.unsupported("clear_by_namespace"));
        }
        if !self.is_writable() {
            return Ok(false);
        }
        let prefix = format!("{namespace}{}", capabilities.namespace_separator());
        clearable
            .clear_by_prefix(&prefix)
            .await
            .map_err(|e| CacheError::backend("clear_by_namespace", vec![prefix.clone()], e))
    }

    /// Remove every item of the current namespace whose key starts with `prefix`.
    ///
    /// # Errors
    ///
    /// [`CacheError::InvalidArgument`] for an empty prefix,
    /// [`CacheError::Unsupported`] without a clear-by-prefix primitive, or a
    /// backend failure.
    pub async fn clear_by_prefix(&self, prefix: &str) -> Result<bool> {
        if prefix.is_empty() {
            return Err(CacheError::invalid("an empty prefix is not allowed"));
        }
        let Some(clearable) = self
            .native
            .clear_by_prefix
            .then(|| self.backend.as_clear_by_prefix())
            .flatten()
        else {
            return Err(self.unsupported("clear_by_prefix"));
        };
        if !self.is_writable() {
            return Ok(false);
        }
        let storage_prefix = self.storage_key(prefix)?;
        clearable
            .clear_by_prefix(&storage_prefix)
            .await
            .map_err(|e| CacheError::backend("clear_by_prefix", vec![storage_prefix.clone()], e))
    }

    /// # Errors
    ///
    /// [`CacheError::Unsupported`] without space reporting, or a backend failure.
    pub async fn total_space(&self) -> Result<u64> {
        let Some(reporting) = self
            .native
            .space_reporting
            .then(|| self.backend.as_space_reporting())
            .flatten()
        else {
            return Err(self.unsupported("total_space"));
        };
        reporting
            .total_space()
            .await
            .map_err(|e| CacheError::backend("total_space", Vec::new(), e))
    }

    /// # Errors
    ///
    /// [`CacheError::Unsupported`] without space reporting, or a backend failure.
    pub async fn available_space(&self) -> Result<u64> {
        let Some(reporting) = self
            .native
            .space_reporting
            .then(|| self.backend.as_space_reporting())
            .flatten()
        else {
            return Err(self.unsupported("available_space"));
        };
        reporting
            .available_space()
            .await
            .map_err(|e| CacheError::backend("available_space", Vec::new(), e))
    }
}

impl<B: StorageBackend> Drop for StorageAdapter<B> {
    fn drop(&mut self) {
        self.plugins.detach_all(&self.events);
    }
}

/// An adapter can itself back another adapter; the outer engine's
/// capabilities then fall back to this one's.
#[async_trait]
impl<B: StorageBackend> StorageBackend for StorageAdapter<B> {
    async fn fetch(&self, key: &str) -> anyhow::Result<Option<Value>> {
        Ok(self.get_item(key).await?)
    }

    async fn store(&self, key: &str, value: &Value, ttl: Option<Duration>) -> anyhow::Result<bool> {
        Ok(self
            .single_write(Operation::SetItem, key, value.clone(), ttl)
            .await?)
    }

    async fn remove(&self, key: &str) -> anyhow::Result<bool> {
        Ok(self.remove_item(key).await?)
    }

    async fn contains(&self, key: &str) -> anyhow::Result<bool> {
        Ok(self.has_item(key).await?)
    }

    fn capability_base(&self) -> Option<Arc<Capabilities>> {
        match self.capabilities() {
            Ok(capabilities) => Some(capabilities),
            Err(error) => {
                warn!(
                    backend = self.backend.name(),
                    error = %error,
                    "Inner capabilities unavailable, outer engine uses defaults"
                );
                None
            }
        }
    }

    fn name(&self) -> &'static str {
        "adapter"
    }
}

/// Caller keys in first-seen order, repeats dropped.
fn unique_keys(keys: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    keys.into_iter().filter(|key| seen.insert(key.clone())).collect()
}

/// Byte-exact comparison of the canonical JSON encoding.
pub(crate) fn same_value(current: &Value, token: &Value) -> bool {
    match (serde_json::to_vec(current), serde_json::to_vec(token)) {
        (Ok(current), Ok(token)) => current == token,
        _ => false,
    }
}

/// Integer view of a stored value used by counters.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn coerce_integer(value: &Value) -> i64 {
    match value {
        Value::Null => 0,
        Value::Bool(flag) => i64::from(*flag),
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_u64().map(|n| i64::try_from(n).unwrap_or(i64::MAX)))
            .or_else(|| number.as_f64().map(|f| f as i64))
            .unwrap_or(0),
        Value::String(text) => {
            let text = text.trim();
            text.parse::<i64>()
                .ok()
                .or_else(|| text.parse::<f64>().ok().map(|f| f as i64))
                .unwrap_or(0)
        }
        Value::Array(items) => i64::from(!items.is_empty()),
        Value::Object(fields) => i64::from(!fields.is_empty()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn counter_coercion() {
        assert_eq!(coerce_integer(&json!(null)), 0);
        assert_eq!(coerce_integer(&json!(true)), 1);
        assert_eq!(coerce_integer(&json!(41)), 41);
        assert_eq!(coerce_integer(&json!(2.9)), 2);
        assert_eq!(coerce_integer(&json!(" 17 ")), 17);
        assert_eq!(coerce_integer(&json!("3.7")), 3);
        assert_eq!(coerce_integer(&json!("abc")), 0);
        assert_eq!(coerce_integer(&json!([])), 0);
        assert_eq!(coerce_integer(&json!({"a": 1})), 1);
        assert_eq!(coerce_integer(&json!(u64::MAX)), i64::MAX);
    }

    #[test]
    fn check_and_set_equality_is_by_serialized_form() {
        assert!(same_value(&json!({"b": 1, "a": [1, 2]}), &json!({"a": [1, 2], "b": 1})));
        assert!(!same_value(&json!(1), &json!(1.0)));
        assert!(!same_value(&json!("1"), &json!(1)));
    }
}
