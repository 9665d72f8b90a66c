//! Extension Registry
//!
//! A [`Plugin`] bundles listeners that add cross-cutting behavior to an
//! engine (exception translation, serialization, clustering, ...). The
//! [`PluginRegistry`] keeps each plugin instance attached at most once and
//! unregisters its listeners on detach or engine teardown.

use std::fmt;
use std::ops::ControlFlow;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::context::Operation;
use crate::error::{CacheError, Result};
use crate::events::{EventManager, Listener, ListenerId};

/// Priority used when the caller has no preference.
pub const DEFAULT_PRIORITY: i32 = 1;

/// Interceptor attached to an engine's pipeline.
pub trait Plugin: Send + Sync {
    /// Name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Register this plugin's listeners and return their ids.
    fn attach(&self, events: &EventManager, priority: i32) -> Vec<ListenerId>;

    /// Unregister the listeners returned by [`attach`](Self::attach).
    fn detach(&self, events: &EventManager, listeners: &[ListenerId]) {
        for id in listeners {
            events.detach(*id);
        }
    }
}

struct PluginEntry {
    plugin: Arc<dyn Plugin>,
    listeners: Vec<ListenerId>,
}

/// Plugins currently attached to one engine, in attachment order.
#[derive(Default)]
pub struct PluginRegistry {
    entries: Mutex<Vec<PluginEntry>>,
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = self.entries.lock().iter().map(|e| e.plugin.name()).collect();
        f.debug_struct("PluginRegistry").field("plugins", &names).finish()
    }
}

fn same_plugin<P: Plugin + ?Sized>(entry: &PluginEntry, plugin: &Arc<P>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(&entry.plugin), Arc::as_ptr(plugin))
}

impl PluginRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `plugin` to `events` at `priority`.
    ///
    /// # Errors
    ///
    /// [`CacheError::AlreadyAttached`] when this instance is already registered.
    pub fn attach(
        &self,
        plugin: Arc<dyn Plugin>,
        events: &EventManager,
        priority: i32,
    ) -> Result<()> {
        let mut entries = self.entries.lock();
        if entries.iter().any(|entry| same_plugin(entry, &plugin)) {
            return Err(CacheError::AlreadyAttached {
                plugin: plugin.name(),
            });
        }

        let listeners = plugin.attach(events, priority);
        info!(
            plugin = plugin.name(),
            priority,
            listeners = listeners.len(),
            "Plugin attached"
        );
        entries.push(PluginEntry { plugin, listeners });
        Ok(())
    }

    /// Detach `plugin`. Returns `false` (and does nothing) when it was not attached.
    pub fn detach<P: Plugin + ?Sized>(&self, plugin: &Arc<P>, events: &EventManager) -> bool {
        let entry = {
            let mut entries = self.entries.lock();
            match entries.iter().position(|entry| same_plugin(entry, plugin)) {
                Some(index) => entries.remove(index),
                None => return false,
            }
        };
        entry.plugin.detach(events, &entry.listeners);
        info!(plugin = entry.plugin.name(), "Plugin detached");
        true
    }

    #[must_use]
    pub fn contains<P: Plugin + ?Sized>(&self, plugin: &Arc<P>) -> bool {
        self.entries
            .lock()
            .iter()
            .any(|entry| same_plugin(entry, plugin))
    }

    /// Attached plugins, in attachment order.
    #[must_use]
    pub fn plugins(&self) -> Vec<Arc<dyn Plugin>> {
        self.entries
            .lock()
            .iter()
            .map(|entry| Arc::clone(&entry.plugin))
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Detach every plugin, most recently attached first.
    pub fn detach_all(&self, events: &EventManager) {
        let entries = std::mem::take(&mut *self.entries.lock());
        for entry in entries.into_iter().rev() {
            entry.plugin.detach(events, &entry.listeners);
            debug!(plugin = entry.plugin.name(), "Plugin detached on teardown");
        }
    }
}

type ErrorCallback = Arc<dyn Fn(&CacheError) + Send + Sync>;

/// Exception-phase plugin: reports errors to a callback and optionally
/// suppresses them so callers receive the operation's negative result.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use uniform_cache::plugins::ExceptionHandler;
///
/// let handler = ExceptionHandler::new()
///     .throw_exceptions(false)
///     .on_error(|err| tracing::warn!(error = %err, "cache error suppressed"));
/// let handler = Arc::new(handler);
/// ```
#[derive(Clone)]
pub struct ExceptionHandler {
    throw_exceptions: bool,
    callback: Option<ErrorCallback>,
}

impl fmt::Debug for ExceptionHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExceptionHandler")
            .field("throw_exceptions", &self.throw_exceptions)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

impl Default for ExceptionHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ExceptionHandler {
    /// Errors still propagate until `throw_exceptions(false)` is set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            throw_exceptions: true,
            callback: None,
        }
    }

    #[must_use]
    pub fn throw_exceptions(mut self, throw: bool) -> Self {
        self.throw_exceptions = throw;
        self
    }

    #[must_use]
    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&CacheError) + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(callback));
        self
    }
}

impl Plugin for ExceptionHandler {
    fn name(&self) -> &'static str {
        "exception_handler"
    }

    fn attach(&self, events: &EventManager, priority: i32) -> Vec<ListenerId> {
        Operation::ALL
            .into_iter()
            .map(|operation| {
                let callback = self.callback.clone();
                let throw = self.throw_exceptions;
                events.attach(
                    operation,
                    priority,
                    Listener::exception(move |event| {
                        if let Some(callback) = &callback {
                            callback(event.error());
                        }
                        if !throw {
                            event.set_throw(false);
                        }
                        ControlFlow::Continue(())
                    }),
                )
            })
            .collect()
    }
}
