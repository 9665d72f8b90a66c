//! Capability Set tests: defaults, backend declarations, token gating,
//! change notifications and decorator fallback

mod common;

use std::time::Duration;

use common::*;
use serde_json::{Value, json};
use tokio::sync::broadcast::error::TryRecvError;
use uniform_cache::backends::MemoryBackend;
use uniform_cache::{
    CacheError, Capabilities, Capability, CapabilityChange, CapabilityToken, CapabilityValue,
    StorageAdapter, StorageBackend, ValueType, async_trait,
};

/// Minimal backend declaring TTL bounds of 1..=60 seconds.
#[derive(Default)]
struct BoundedBackend {
    inner: SimpleBackend,
}

#[async_trait]
impl StorageBackend for BoundedBackend {
    async fn fetch(&self, key: &str) -> anyhow::Result<Option<Value>> {
        self.inner.fetch(key).await
    }

    async fn store(&self, key: &str, value: &Value, ttl: Option<Duration>) -> anyhow::Result<bool> {
        self.inner.store(key, value, ttl).await
    }

    async fn remove(&self, key: &str) -> anyhow::Result<bool> {
        self.inner.remove(key).await
    }

    fn normalize_key(&self, key: &str) -> String {
        key.to_ascii_lowercase()
    }

    fn init_capabilities(
        &self,
        capabilities: &Capabilities,
        token: &CapabilityToken,
    ) -> uniform_cache::Result<()> {
        capabilities.set_min_ttl(token, 1)?;
        capabilities.set_max_ttl(token, 60)?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "bounded"
    }
}

#[test]
fn test_minimal_backend_reports_defaults() {
    let cache = simple_adapter();
    let caps = cache.capabilities().unwrap();

    assert_eq!(caps.lock_on_expire(), 0);
    assert_eq!(caps.max_key_length(), -1);
    assert_eq!((caps.min_ttl(), caps.max_ttl()), (0, 0));
    assert!(!caps.static_ttl());
    assert!(caps.supports(ValueType::String));
    assert!(!caps.supports(ValueType::Integer));
    assert!(!caps.use_request_time());
    assert!(caps.namespace_is_prefix());
    assert_eq!(caps.namespace_separator(), "");
    assert!(caps.base().is_none());
}

#[test]
fn test_memory_backend_declares_its_guarantees() {
    let cache = memory_adapter();
    let caps = cache.capabilities().unwrap();

    assert!(ValueType::ALL.into_iter().all(|ty| caps.supports(ty)));
    assert!((caps.ttl_precision() - 0.05).abs() < f64::EPSILON);
    assert_eq!(caps.max_key_length(), 0);
    assert!(caps.static_ttl());
    assert_eq!(caps.namespace_separator(), ":");
}

#[test]
fn test_capabilities_are_built_once() {
    let cache = memory_adapter();
    let first = cache.capabilities().unwrap();
    let second = cache.capabilities().unwrap();
    assert!(std::sync::Arc::ptr_eq(&first, &second));
}

#[test]
fn test_foreign_token_cannot_mutate() {
    let cache = memory_adapter();
    let caps = cache.capabilities().unwrap();

    let forged = CapabilityToken::new();
    assert!(matches!(
        caps.set_max_key_length(&forged, 16),
        Err(CacheError::InvalidToken)
    ));
    assert_eq!(caps.max_key_length(), 0);

    cache
        .update_capabilities(|caps, token| caps.set_max_key_length(token, 16))
        .unwrap();
    assert_eq!(caps.max_key_length(), 16);
}

#[test]
fn test_setter_domain_checks() {
    let cache = memory_adapter();
    let result = cache.update_capabilities(|caps, token| caps.set_ttl_precision(token, 0.0));
    assert!(matches!(result, Err(CacheError::InvalidArgument(_))));

    let result = cache.update_capabilities(|caps, token| caps.set_max_key_length(token, -2));
    assert!(matches!(result, Err(CacheError::InvalidArgument(_))));

    let result = cache.update_capabilities(|caps, token| {
        caps.set_supported_types(token, [("string", true), ("resource", true)])
    });
    assert!(matches!(result, Err(CacheError::InvalidArgument(_))));
}

#[test]
fn test_supported_types_table_is_normalized() {
    let cache = memory_adapter();
    cache
        .update_capabilities(|caps, token| {
            caps.set_supported_types(token, [("String", true), ("integer", true)])
        })
        .unwrap();

    let table = cache.capabilities().unwrap().supported_types();
    assert_eq!(table.len(), ValueType::ALL.len());
    assert!(table[&ValueType::String] && table[&ValueType::Integer]);
    assert!(!table[&ValueType::Object]);
}

#[tokio::test]
async fn test_changes_are_broadcast_once() {
    let cache = memory_adapter();
    let mut changes = cache.subscribe_capability_changes();

    cache
        .update_capabilities(|caps, token| caps.set_max_ttl(token, 120))
        .unwrap();
    assert_eq!(
        changes.recv().await.unwrap(),
        CapabilityChange {
            capability: Capability::MaxTtl,
            value: CapabilityValue::Unsigned(120),
        }
    );

    // Same value again: no notification
    cache
        .update_capabilities(|caps, token| caps.set_max_ttl(token, 120))
        .unwrap();
    assert!(matches!(changes.try_recv(), Err(TryRecvError::Empty)));

    cache
        .update_capabilities(|caps, token| caps.set_namespace_separator(token, "/"))
        .unwrap();
    assert_eq!(
        changes.recv().await.unwrap().value,
        CapabilityValue::Text("/".to_string())
    );
}

#[tokio::test]
async fn test_backend_declarations_do_not_notify() {
    let cache = memory_adapter();
    let mut changes = cache.subscribe_capability_changes();
    cache.capabilities().unwrap();
    assert!(matches!(changes.try_recv(), Err(TryRecvError::Empty)));
}

#[test]
fn test_ttl_is_checked_against_bounds() {
    init_tracing();
    let cache = StorageAdapter::new(BoundedBackend::default());

    assert!(cache.set_ttl(30.0).is_ok());
    assert!(cache.set_ttl(0.0).is_ok());
    assert!(matches!(cache.set_ttl(0.5), Err(CacheError::InvalidArgument(_))));
    assert!(matches!(cache.set_ttl(61.0), Err(CacheError::InvalidArgument(_))));
    assert!((cache.options().ttl - 0.0).abs() < f64::EPSILON);

    let built = StorageAdapter::builder(BoundedBackend::default())
        .ttl(120.0)
        .build();
    assert!(matches!(built, Err(CacheError::InvalidArgument(_))));
}

#[tokio::test]
async fn test_backend_normalizes_keys_before_validation() {
    let cache = StorageAdapter::builder(BoundedBackend::default())
        .key_pattern("^[a-z]+$")
        .build()
        .unwrap();

    assert!(cache.set_item("MiXeD", json!(1)).await.unwrap());
    assert_eq!(cache.get_item("mixed").await.unwrap(), Some(json!(1)));
    assert_eq!(cache.backend().inner.keys(), vec!["mixed".to_string()]);
}

#[tokio::test]
async fn test_decorator_falls_back_to_inner_capabilities() {
    init_tracing();
    let inner = StorageAdapter::new(MemoryBackend::new());
    let outer = StorageAdapter::new(inner);

    let caps = outer.capabilities().unwrap();
    assert!(caps.base().is_some());
    assert_eq!(caps.namespace_separator(), ":");
    assert!(caps.static_ttl());

    outer
        .update_capabilities(|caps, token| caps.set_namespace_separator(token, "|"))
        .unwrap();
    assert_eq!(caps.namespace_separator(), "|");
    assert_eq!(
        outer.backend().capabilities().unwrap().namespace_separator(),
        ":"
    );

    // Inner changes show through where the outer set is silent
    outer
        .backend()
        .update_capabilities(|caps, token| caps.set_max_ttl(token, 900))
        .unwrap();
    assert_eq!(caps.max_ttl(), 900);

    outer.set_item("k", json!("v")).await.unwrap();
    assert_eq!(outer.backend().get_item("k").await.unwrap(), Some(json!("v")));
}

#[test]
fn test_builder_capability_base_overrides_backend() {
    let token = CapabilityToken::new();
    let base = std::sync::Arc::new(Capabilities::new(&token));
    base.set_max_key_length(&token, 4).unwrap();

    let cache = StorageAdapter::builder(SimpleBackend::new())
        .capability_base(base)
        .build()
        .unwrap();
    assert_eq!(cache.capabilities().unwrap().max_key_length(), 4);
}

#[tokio::test]
async fn test_decorator_passes_its_ttl_to_the_inner_engine() {
    init_tracing();
    let outer = StorageAdapter::builder(StorageAdapter::new(MemoryBackend::new()))
        .ttl(0.05)
        .build()
        .unwrap();

    assert!(outer.set_item("k", json!(1)).await.unwrap());
    assert_eq!(outer.get_item("k").await.unwrap(), Some(json!(1)));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(outer.get_item("k").await.unwrap(), None);
    assert_eq!(outer.backend().get_item("k").await.unwrap(), None);
}

#[tokio::test]
async fn test_decorator_without_ttl_keeps_inner_ttl() {
    init_tracing();
    let inner = StorageAdapter::builder(SimpleBackend::new())
        .ttl(30.0)
        .build()
        .unwrap();
    let outer = StorageAdapter::new(inner);

    outer.set_item("k", json!(1)).await.unwrap();
    assert_eq!(
        outer.backend().backend().last_ttl(),
        Some(Some(Duration::from_secs(30)))
    );

    outer.set_ttl(5.0).unwrap();
    outer.set_item("k", json!(2)).await.unwrap();
    assert_eq!(
        outer.backend().backend().last_ttl(),
        Some(Some(Duration::from_secs(5)))
    );
}

/// Minimal backend whose capability declaration always fails.
#[derive(Default)]
struct BrokenDeclaration {
    inner: SimpleBackend,
}

#[async_trait]
impl StorageBackend for BrokenDeclaration {
    async fn fetch(&self, key: &str) -> anyhow::Result<Option<Value>> {
        self.inner.fetch(key).await
    }

    async fn store(&self, key: &str, value: &Value, ttl: Option<Duration>) -> anyhow::Result<bool> {
        self.inner.store(key, value, ttl).await
    }

    async fn remove(&self, key: &str) -> anyhow::Result<bool> {
        self.inner.remove(key).await
    }

    fn init_capabilities(
        &self,
        _capabilities: &Capabilities,
        _token: &CapabilityToken,
    ) -> uniform_cache::Result<()> {
        Err(CacheError::invalid("declaration rejected"))
    }
}

#[test]
fn test_decorator_over_broken_inner_uses_defaults() {
    init_tracing();
    let inner = StorageAdapter::new(BrokenDeclaration::default());
    assert!(matches!(inner.capabilities(), Err(CacheError::InvalidArgument(_))));

    let outer = StorageAdapter::new(inner);
    let caps = outer.capabilities().unwrap();
    assert!(caps.base().is_none());
    assert_eq!(caps.max_key_length(), -1);
}
