//! Interception Pipeline
//!
//! Each engine owns one [`EventManager`]: an ordered registry of listeners
//! keyed by operation and phase. A call runs through three phases:
//!
//! ```text
//! pre ──Break(r)──────────────────────────────► r
//!  │ Continue
//!  ▼
//! execute ──Ok(raw)──► post ──Break(r)────────► r
//!  │                     └─Continue (all)─────► raw (possibly mutated)
//!  └─Err(e)──► exception ──Break(r)───────────► r
//!                └─Continue (all)─► throws? Err(e) : Ok(result)
//! ```
//!
//! Listeners run highest priority first; equal priorities run in attachment
//! order. A listener returning [`ControlFlow::Break`] stops the chain and
//! supplies the final result.

use std::fmt;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::debug;

use crate::context::{OpResult, Operation, OperationContext};
use crate::error::{CacheError, Result};

/// Pipeline phase a listener is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Pre,
    Post,
    Exception,
}

pub type PreListener = Arc<dyn Fn(&mut PreEvent) -> ControlFlow<OpResult> + Send + Sync>;
pub type PostListener = Arc<dyn Fn(&mut PostEvent) -> ControlFlow<OpResult> + Send + Sync>;
pub type ExceptionListener =
    Arc<dyn Fn(&mut ExceptionEvent) -> ControlFlow<OpResult> + Send + Sync>;

/// A callback bound to one phase.
#[derive(Clone)]
pub enum Listener {
    Pre(PreListener),
    Post(PostListener),
    Exception(ExceptionListener),
}

impl Listener {
    pub fn pre<F>(callback: F) -> Self
    where
        F: Fn(&mut PreEvent) -> ControlFlow<OpResult> + Send + Sync + 'static,
    {
        Self::Pre(Arc::new(callback))
    }

    pub fn post<F>(callback: F) -> Self
    where
        F: Fn(&mut PostEvent) -> ControlFlow<OpResult> + Send + Sync + 'static,
    {
        Self::Post(Arc::new(callback))
    }

    pub fn exception<F>(callback: F) -> Self
    where
        F: Fn(&mut ExceptionEvent) -> ControlFlow<OpResult> + Send + Sync + 'static,
    {
        Self::Exception(Arc::new(callback))
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        match self {
            Self::Pre(_) => Phase::Pre,
            Self::Post(_) => Phase::Post,
            Self::Exception(_) => Phase::Exception,
        }
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Listener::{:?}(<callback>)", self.phase())
    }
}

/// Handle returned by [`EventManager::attach`], used to detach the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

/// Pre-phase view: the context, whose arguments listeners may rewrite.
#[derive(Debug)]
pub struct PreEvent {
    context: OperationContext,
}

impl PreEvent {
    #[must_use]
    pub fn context(&self) -> &OperationContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut OperationContext {
        &mut self.context
    }

    #[must_use]
    pub fn operation(&self) -> Operation {
        self.context.operation()
    }
}

/// Post-phase view: the context plus the in-flight result.
#[derive(Debug)]
pub struct PostEvent {
    context: OperationContext,
    result: OpResult,
}

impl PostEvent {
    #[must_use]
    pub fn context(&self) -> &OperationContext {
        &self.context
    }

    #[must_use]
    pub fn operation(&self) -> Operation {
        self.context.operation()
    }

    #[must_use]
    pub fn result(&self) -> &OpResult {
        &self.result
    }

    /// Mutate the carried result in place; later listeners see the change.
    pub fn result_mut(&mut self) -> &mut OpResult {
        &mut self.result
    }
}

/// Exception-phase view: the context, the error and the substitute result.
///
/// The error propagates unless a listener calls [`suppress`](Self::suppress)
/// or [`set_throw`](Self::set_throw)`(false)`.
#[derive(Debug)]
pub struct ExceptionEvent {
    context: OperationContext,
    error: CacheError,
    result: OpResult,
    throw: bool,
}

impl ExceptionEvent {
    #[must_use]
    pub fn context(&self) -> &OperationContext {
        &self.context
    }

    #[must_use]
    pub fn operation(&self) -> Operation {
        self.context.operation()
    }

    #[must_use]
    pub fn error(&self) -> &CacheError {
        &self.error
    }

    #[must_use]
    pub fn result(&self) -> &OpResult {
        &self.result
    }

    pub fn result_mut(&mut self) -> &mut OpResult {
        &mut self.result
    }

    #[must_use]
    pub fn throws(&self) -> bool {
        self.throw
    }

    pub fn set_throw(&mut self, throw: bool) {
        self.throw = throw;
    }

    /// Stop the error and hand `result` to the caller instead.
    pub fn suppress(&mut self, result: OpResult) {
        self.throw = false;
        self.result = result;
    }
}

struct Registration {
    id: ListenerId,
    operation: Operation,
    priority: i32,
    listener: Listener,
}

/// Per-engine listener registry with priority-ordered dispatch.
pub struct EventManager {
    /// Kept sorted: priority descending, then attachment order
    registrations: RwLock<Vec<Registration>>,
    next_id: AtomicU64,
}

impl fmt::Debug for EventManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventManager")
            .field("listeners", &self.registrations.read().len())
            .finish_non_exhaustive()
    }
}

impl Default for EventManager {
    fn default() -> Self {
        Self::new()
    }
}

impl EventManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            registrations: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Register `listener` for `operation` at `priority` (higher runs first).
    pub fn attach(&self, operation: Operation, priority: i32, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut registrations = self.registrations.write();
        let position = registrations
            .iter()
            .position(|r| r.priority < priority)
            .unwrap_or(registrations.len());
        registrations.insert(
            position,
            Registration {
                id,
                operation,
                priority,
                listener,
            },
        );
        id
    }

    /// Remove a listener. Returns `false` when the id is unknown.
    pub fn detach(&self, id: ListenerId) -> bool {
        let mut registrations = self.registrations.write();
        let before = registrations.len();
        registrations.retain(|r| r.id != id);
        registrations.len() != before
    }

    /// Number of listeners bound to `operation` in `phase`.
    #[must_use]
    pub fn listener_count(&self, operation: Operation, phase: Phase) -> usize {
        self.registrations
            .read()
            .iter()
            .filter(|r| r.operation == operation && r.listener.phase() == phase)
            .count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registrations.read().is_empty()
    }

    /// Copy out the listeners for one operation so none run under the lock.
    fn snapshot(&self, operation: Operation, phase: Phase) -> Vec<Listener> {
        self.registrations
            .read()
            .iter()
            .filter(|r| r.operation == operation && r.listener.phase() == phase)
            .map(|r| r.listener.clone())
            .collect()
    }

    /// Run the pre-phase. `Break` carries the short-circuit result.
    pub(crate) fn run_pre(
        &self,
        context: OperationContext,
    ) -> ControlFlow<OpResult, OperationContext> {
        let operation = context.operation();
        let mut event = PreEvent { context };
        for listener in self.snapshot(operation, Phase::Pre) {
            if let Listener::Pre(callback) = listener {
                if let ControlFlow::Break(result) = callback(&mut event) {
                    debug!(operation = %operation, "Pre-phase listener stopped the operation");
                    return ControlFlow::Break(result);
                }
            }
        }
        ControlFlow::Continue(event.context)
    }

    /// Run the post-phase and resolve the final result.
    pub(crate) fn run_post(&self, context: OperationContext, result: OpResult) -> OpResult {
        let operation = context.operation();
        let mut event = PostEvent { context, result };
        for listener in self.snapshot(operation, Phase::Post) {
            if let Listener::Post(callback) = listener {
                if let ControlFlow::Break(replacement) = callback(&mut event) {
                    debug!(operation = %operation, "Post-phase listener replaced the result");
                    return replacement;
                }
            }
        }
        event.result
    }

    /// Run the exception-phase and resolve between the error and a substitute result.
    pub(crate) fn run_exception(
        &self,
        context: OperationContext,
        error: CacheError,
        result: OpResult,
    ) -> Result<OpResult> {
        let operation = context.operation();
        let mut event = ExceptionEvent {
            context,
            error,
            result,
            throw: true,
        };
        for listener in self.snapshot(operation, Phase::Exception) {
            if let Listener::Exception(callback) = listener {
                if let ControlFlow::Break(substitute) = callback(&mut event) {
                    debug!(operation = %operation, "Exception-phase listener substituted a result");
                    return Ok(substitute);
                }
            }
        }
        if event.throw {
            Err(event.error)
        } else {
            debug!(operation = %operation, "Exception suppressed by listener");
            Ok(event.result)
        }
    }
}
