//! Uniform Cache
//!
//! One caching API over interchangeable storage backends:
//! - **Adapter Engine**: single-item and batch reads, conditional writes,
//!   touch, counters and removal, with a uniform key-validation contract
//! - **Interception Pipeline**: pre, post and exception listeners per
//!   operation, able to short-circuit, rewrite arguments or replace results
//! - **Capability Set**: the backend's guarantees (TTL bounds, key length,
//!   supported value types, namespace handling), writable only by its owner
//! - **Backend Contract**: three required primitives; batch and extended
//!   operations are composed from them unless the backend offers them natively
//! - **Extension Registry**: plugins bundling listeners, attached once per engine
//!
//! # Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use uniform_cache::{StorageAdapter, backends::MemoryBackend};
//! use uniform_cache::plugins::ExceptionHandler;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> uniform_cache::Result<()> {
//!     let cache = StorageAdapter::builder(MemoryBackend::new())
//!         .namespace("app")
//!         .with_plugin(Arc::new(ExceptionHandler::new().throw_exceptions(false)), 1)
//!         .build()?;
//!
//!     cache.set_items([("a", json!(1)), ("b", json!(2))]).await?;
//!     let found = cache.get_items(["a", "b", "c"]).await?;
//!     assert_eq!(found.len(), 2);
//!
//!     let caps = cache.capabilities()?;
//!     tracing::info!(max_ttl = caps.max_ttl(), "Backend limits");
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! call → gate (readable/writable) → normalize keys → pre listeners
//!      → backend (native or composed) → post listeners
//!                     ↓ error
//!               exception listeners → rethrow or negative result
//! ```

pub mod adapter;
pub mod backends;
pub mod builder;
pub mod capabilities;
pub mod context;
pub mod error;
pub mod events;
pub mod options;
pub mod plugins;
pub mod traits;

pub use adapter::StorageAdapter;
pub use builder::AdapterBuilder;
pub use capabilities::{
    Capabilities, Capability, CapabilityChange, CapabilityToken, CapabilityValue, ValueType,
};
pub use context::{Arguments, OpResult, Operation, OperationContext};
pub use error::{CacheError, Result};
pub use events::{
    EventManager, ExceptionEvent, Listener, ListenerId, Phase, PostEvent, PreEvent,
};
pub use options::AdapterOptions;
pub use plugins::{DEFAULT_PRIORITY, ExceptionHandler, Plugin, PluginRegistry};
pub use traits::{
    BatchBackend, ClearByPrefixBackend, ExtendedBackend, FlushableBackend, NativeSupport,
    SpaceReportingBackend, StorageBackend,
};

// Re-export async_trait for user convenience
pub use async_trait::async_trait;
