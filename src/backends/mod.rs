//! Storage Backend Implementations
//!
//! # Available Backends
//!
//! - **Memory** - Concurrent `DashMap` storage with every optional primitive
//!
//! Other stores plug in by implementing [`StorageBackend`](crate::StorageBackend)
//! and, where they can, the optional traits in [`traits`](crate::traits).
//!
//! # Usage
//!
//! ```rust
//! use uniform_cache::StorageAdapter;
//! use uniform_cache::backends::MemoryBackend;
//!
//! let cache = StorageAdapter::new(MemoryBackend::with_capacity(10_000));
//! assert!(cache.native_support().batch);
//! ```

pub mod memory;

pub use memory::{MemoryBackend, MemoryStats};
