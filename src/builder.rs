//! Adapter Builder
//!
//! Provides a builder pattern for constructing a [`StorageAdapter`] with
//! options, plugins and an optional capability fallback set.
//!
//! # Example: Default Options
//!
//! ```rust
//! use uniform_cache::{AdapterBuilder, backends::MemoryBackend};
//!
//! let cache = AdapterBuilder::new(MemoryBackend::new()).build()?;
//! # Ok::<(), uniform_cache::CacheError>(())
//! ```
//!
//! # Example: Namespaced Engine with Error Suppression
//!
//! ```rust
//! use std::sync::Arc;
//! use uniform_cache::{AdapterBuilder, backends::MemoryBackend};
//! use uniform_cache::plugins::ExceptionHandler;
//!
//! let cache = AdapterBuilder::new(MemoryBackend::new())
//!     .namespace("sessions")
//!     .ttl(300.0)
//!     .key_pattern("^[a-z0-9:_-]+$")
//!     .with_plugin(Arc::new(ExceptionHandler::new().throw_exceptions(false)), 1)
//!     .build()?;
//! # Ok::<(), uniform_cache::CacheError>(())
//! ```

use std::fmt;
use std::sync::Arc;

use tracing::info;

use crate::adapter::StorageAdapter;
use crate::capabilities::Capabilities;
use crate::error::Result;
use crate::options::{AdapterOptions, CompiledOptions};
use crate::plugins::Plugin;
use crate::traits::StorageBackend;

/// Builder for constructing a [`StorageAdapter`]
///
/// # Default Behavior
///
/// Without further configuration the engine is readable and writable, has no
/// key pattern, no namespace, no TTL and no plugins.
pub struct AdapterBuilder<B: StorageBackend> {
    backend: B,
    options: AdapterOptions,
    capability_base: Option<Arc<Capabilities>>,
    plugins: Vec<(Arc<dyn Plugin>, i32)>,
}

impl<B: StorageBackend> fmt::Debug for AdapterBuilder<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let plugins: Vec<_> = self.plugins.iter().map(|(p, priority)| (p.name(), *priority)).collect();
        f.debug_struct("AdapterBuilder")
            .field("backend", &self.backend.name())
            .field("options", &self.options)
            .field("capability_base", &self.capability_base.is_some())
            .field("plugins", &plugins)
            .finish()
    }
}

impl<B: StorageBackend> AdapterBuilder<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            options: AdapterOptions::default(),
            capability_base: None,
            plugins: Vec::new(),
        }
    }

    /// Replace all options at once
    #[must_use]
    pub fn options(mut self, options: AdapterOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn readable(mut self, readable: bool) -> Self {
        self.options.readable = readable;
        self
    }

    #[must_use]
    pub fn writable(mut self, writable: bool) -> Self {
        self.options.writable = writable;
        self
    }

    /// Regular expression every key must match
    #[must_use]
    pub fn key_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.options.key_pattern = Some(pattern.into());
        self
    }

    /// Default TTL in seconds, 0 for no expiry
    #[must_use]
    pub fn ttl(mut self, seconds: f64) -> Self {
        self.options.ttl = seconds;
        self
    }

    #[must_use]
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.options.namespace = namespace.into();
        self
    }

    /// Capability set the engine's own set falls back to
    ///
    /// Overrides the fallback the backend itself declares.
    #[must_use]
    pub fn capability_base(mut self, base: Arc<Capabilities>) -> Self {
        self.capability_base = Some(base);
        self
    }

    /// Attach `plugin` at `priority` once the engine is built
    #[must_use]
    pub fn with_plugin(mut self, plugin: Arc<dyn Plugin>, priority: i32) -> Self {
        self.plugins.push((plugin, priority));
        self
    }

    /// Build the engine
    ///
    /// # Errors
    ///
    /// * [`CacheError::InvalidArgument`](crate::CacheError::InvalidArgument) -
    ///   invalid options, or a TTL outside the backend's bounds
    /// * [`CacheError::AlreadyAttached`](crate::CacheError::AlreadyAttached) -
    ///   the same plugin instance was added twice
    pub fn build(self) -> Result<StorageAdapter<B>> {
        let compiled = CompiledOptions::compile(self.options)?;
        let ttl = compiled.options.ttl;
        let adapter = StorageAdapter::assemble(self.backend, compiled, self.capability_base);
        adapter.check_ttl(ttl)?;

        for (plugin, priority) in self.plugins {
            adapter.add_plugin(plugin, priority)?;
        }

        info!(
            backend = adapter.backend().name(),
            plugins = adapter.plugins().len(),
            "Storage adapter built"
        );
        Ok(adapter)
    }
}
