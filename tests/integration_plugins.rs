//! Extension registry tests

mod common;

use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use common::*;
use parking_lot::Mutex;
use serde_json::json;
use uniform_cache::backends::MemoryBackend;
use uniform_cache::{
    CacheError, DEFAULT_PRIORITY, EventManager, ExceptionHandler, Listener, ListenerId, OpResult,
    Operation, Phase, Plugin, StorageAdapter,
};

/// Answers every `get_item` miss with a fixed value and records its teardown.
struct DefaultValue {
    value: serde_json::Value,
    detached: Arc<AtomicBool>,
}

impl DefaultValue {
    fn new(value: serde_json::Value) -> Self {
        Self {
            value,
            detached: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Plugin for DefaultValue {
    fn name(&self) -> &'static str {
        "default_value"
    }

    fn attach(&self, events: &EventManager, priority: i32) -> Vec<ListenerId> {
        let value = self.value.clone();
        vec![events.attach(
            Operation::GetItem,
            priority,
            Listener::post(move |event| {
                if let OpResult::Value(None) = event.result() {
                    return ControlFlow::Break(OpResult::Value(Some(value.clone())));
                }
                ControlFlow::Continue(())
            }),
        )]
    }

    fn detach(&self, events: &EventManager, listeners: &[ListenerId]) {
        for id in listeners {
            events.detach(*id);
        }
        self.detached.store(true, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_plugin_attach_and_remove() {
    let cache = memory_adapter();
    let plugin = Arc::new(DefaultValue::new(json!("fallback")));

    cache.add_plugin(plugin.clone(), DEFAULT_PRIORITY).unwrap();
    assert!(cache.has_plugin(&plugin));
    assert_eq!(cache.plugins().len(), 1);
    assert_eq!(cache.get_item("missing").await.unwrap(), Some(json!("fallback")));

    assert!(cache.remove_plugin(&plugin));
    assert!(plugin.detached.load(Ordering::SeqCst));
    assert!(!cache.has_plugin(&plugin));
    assert_eq!(cache.get_item("missing").await.unwrap(), None);
    assert!(cache.events().is_empty());
}

#[tokio::test]
async fn test_same_instance_cannot_attach_twice() {
    let cache = memory_adapter();
    let plugin = Arc::new(DefaultValue::new(json!(1)));

    cache.add_plugin(plugin.clone(), 1).unwrap();
    let err = cache.add_plugin(plugin.clone(), 5).unwrap_err();
    assert!(matches!(err, CacheError::AlreadyAttached { plugin: "default_value" }));
    assert_eq!(cache.events().listener_count(Operation::GetItem, Phase::Post), 1);

    // A distinct instance of the same type is a different plugin
    cache.add_plugin(Arc::new(DefaultValue::new(json!(2))), 1).unwrap();
    assert_eq!(cache.plugins().len(), 2);
}

#[tokio::test]
async fn test_removing_unknown_plugin_is_noop() {
    let cache = memory_adapter();
    let plugin = Arc::new(DefaultValue::new(json!(1)));
    assert!(!cache.remove_plugin(&plugin));
    assert!(!plugin.detached.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_plugins_detach_when_engine_drops() {
    let plugin = Arc::new(DefaultValue::new(json!(1)));
    {
        let cache = StorageAdapter::builder(MemoryBackend::new())
            .with_plugin(plugin.clone(), DEFAULT_PRIORITY)
            .build()
            .unwrap();
        assert!(cache.has_plugin(&plugin));
    }
    assert!(plugin.detached.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_builder_rejects_duplicate_plugin() {
    let plugin: Arc<dyn Plugin> = Arc::new(DefaultValue::new(json!(1)));
    let result = StorageAdapter::builder(MemoryBackend::new())
        .with_plugin(Arc::clone(&plugin), 1)
        .with_plugin(plugin, 2)
        .build();
    assert!(matches!(result, Err(CacheError::AlreadyAttached { .. })));
}

#[tokio::test]
async fn test_exception_handler_suppresses_errors() {
    let cache = simple_adapter();
    cache.backend().fail_on("bad");

    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    let handler = Arc::new(
        ExceptionHandler::new()
            .throw_exceptions(false)
            .on_error(move |err| sink.lock().push(err.to_string())),
    );
    cache.add_plugin(handler.clone(), DEFAULT_PRIORITY).unwrap();

    assert_eq!(cache.get_item("bad").await.unwrap(), None);
    assert!(!cache.set_item("bad", json!(1)).await.unwrap());
    assert_eq!(cache.increment_item("bad", 1).await.unwrap(), None);
    assert_eq!(
        cache.remove_items(["bad", "also"]).await.unwrap(),
        vec!["bad".to_string(), "also".to_string()]
    );
    assert_eq!(errors.lock().len(), 4);

    // Validation errors never reach the pipeline
    assert!(cache.get_item("").await.is_err());
    assert_eq!(errors.lock().len(), 4);

    cache.remove_plugin(&handler);
    assert!(cache.get_item("bad").await.is_err());
}

#[tokio::test]
async fn test_exception_handler_can_only_observe() {
    let cache = simple_adapter();
    cache.backend().fail_on("bad");
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    cache
        .add_plugin(
            Arc::new(ExceptionHandler::new().on_error(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
            DEFAULT_PRIORITY,
        )
        .unwrap();

    assert!(cache.has_item("bad").await.is_err());
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_plugin_priority_orders_against_raw_listeners() {
    let cache = memory_adapter();
    cache.events().attach(
        Operation::GetItem,
        100,
        Listener::post(|_| ControlFlow::Break(OpResult::Value(Some(json!("raw"))))),
    );
    cache
        .add_plugin(Arc::new(DefaultValue::new(json!("plugin"))), 1)
        .unwrap();
    assert_eq!(cache.get_item("k").await.unwrap(), Some(json!("raw")));
}
