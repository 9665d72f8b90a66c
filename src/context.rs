//! Operation names, per-call context and pipeline results.
//!
//! Every public engine call builds one [`OperationContext`] holding the
//! normalized arguments. The context is moved through the pre, post and
//! exception phases; listeners see it through the phase event and may
//! rewrite argument values before execution. Results travel as [`OpResult`],
//! one variant per result shape.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde_json::Value;

use crate::error::{CacheError, Result};

/// Logical operation name used to route listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    GetItem,
    GetItems,
    HasItem,
    HasItems,
    SetItem,
    SetItems,
    AddItem,
    AddItems,
    ReplaceItem,
    ReplaceItems,
    CheckAndSetItem,
    TouchItem,
    TouchItems,
    RemoveItem,
    RemoveItems,
    IncrementItem,
    IncrementItems,
    DecrementItem,
    DecrementItems,
}

impl Operation {
    /// Every operation routed through the pipeline.
    pub const ALL: [Operation; 19] = [
        Self::GetItem,
        Self::GetItems,
        Self::HasItem,
        Self::HasItems,
        Self::SetItem,
        Self::SetItems,
        Self::AddItem,
        Self::AddItems,
        Self::ReplaceItem,
        Self::ReplaceItems,
        Self::CheckAndSetItem,
        Self::TouchItem,
        Self::TouchItems,
        Self::RemoveItem,
        Self::RemoveItems,
        Self::IncrementItem,
        Self::IncrementItems,
        Self::DecrementItem,
        Self::DecrementItems,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GetItem => "get_item",
            Self::GetItems => "get_items",
            Self::HasItem => "has_item",
            Self::HasItems => "has_items",
            Self::SetItem => "set_item",
            Self::SetItems => "set_items",
            Self::AddItem => "add_item",
            Self::AddItems => "add_items",
            Self::ReplaceItem => "replace_item",
            Self::ReplaceItems => "replace_items",
            Self::CheckAndSetItem => "check_and_set_item",
            Self::TouchItem => "touch_item",
            Self::TouchItems => "touch_items",
            Self::RemoveItem => "remove_item",
            Self::RemoveItems => "remove_items",
            Self::IncrementItem => "increment_item",
            Self::IncrementItems => "increment_items",
            Self::DecrementItem => "decrement_item",
            Self::DecrementItems => "decrement_items",
        }
    }

    /// Read operations are gated by the `readable` option, everything else by `writable`.
    #[must_use]
    pub fn is_read(self) -> bool {
        matches!(
            self,
            Self::GetItem | Self::GetItems | Self::HasItem | Self::HasItems
        )
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized arguments of one call.
///
/// Listeners may rewrite values in place. Replacing the variant with one of
/// a different shape makes the engine reject the call with
/// [`CacheError::InvalidArgument`].
#[derive(Debug, Clone, PartialEq)]
pub enum Arguments {
    Key(String),
    Keys(Vec<String>),
    Item { key: String, value: Value },
    Items(Vec<(String, Value)>),
    CheckAndSet { token: Value, key: String, value: Value },
    Counter { key: String, delta: i64 },
    Counters(Vec<(String, i64)>),
}

impl Arguments {
    /// Every key named by these arguments, in argument order.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        match self {
            Self::Key(key)
            | Self::Item { key, .. }
            | Self::CheckAndSet { key, .. }
            | Self::Counter { key, .. } => vec![key.clone()],
            Self::Keys(keys) => keys.clone(),
            Self::Items(items) => items.iter().map(|(k, _)| k.clone()).collect(),
            Self::Counters(deltas) => deltas.iter().map(|(k, _)| k.clone()).collect(),
        }
    }

    fn shape(&self) -> &'static str {
        match self {
            Self::Key(_) => "key",
            Self::Keys(_) => "keys",
            Self::Item { .. } => "item",
            Self::Items(_) => "items",
            Self::CheckAndSet { .. } => "check-and-set",
            Self::Counter { .. } => "counter",
            Self::Counters(_) => "counters",
        }
    }
}

/// Transient per-call state visible to every pipeline phase.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationContext {
    operation: Operation,
    arguments: Arguments,
    ttl: Option<Duration>,
}

impl OperationContext {
    #[must_use]
    pub fn new(operation: Operation, arguments: Arguments) -> Self {
        Self {
            operation,
            arguments,
            ttl: None,
        }
    }

    /// Expiry for writes made by this call, overriding the engine's `ttl` option.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    #[must_use]
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    #[must_use]
    pub fn operation(&self) -> Operation {
        self.operation
    }

    #[must_use]
    pub fn arguments(&self) -> &Arguments {
        &self.arguments
    }

    pub fn arguments_mut(&mut self) -> &mut Arguments {
        &mut self.arguments
    }

    /// Keys involved in this call.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.arguments.keys()
    }

    pub(crate) fn as_key(&self) -> Result<&str> {
        match &self.arguments {
            Arguments::Key(key) => Ok(key),
            other => Err(shape_mismatch(self.operation, other)),
        }
    }

    pub(crate) fn as_keys(&self) -> Result<&[String]> {
        match &self.arguments {
            Arguments::Keys(keys) => Ok(keys),
            other => Err(shape_mismatch(self.operation, other)),
        }
    }

    pub(crate) fn as_item(&self) -> Result<(&str, &Value)> {
        match &self.arguments {
            Arguments::Item { key, value } => Ok((key, value)),
            other => Err(shape_mismatch(self.operation, other)),
        }
    }

    pub(crate) fn as_items(&self) -> Result<&[(String, Value)]> {
        match &self.arguments {
            Arguments::Items(items) => Ok(items),
            other => Err(shape_mismatch(self.operation, other)),
        }
    }

    pub(crate) fn as_check_and_set(&self) -> Result<(&Value, &str, &Value)> {
        match &self.arguments {
            Arguments::CheckAndSet { token, key, value } => Ok((token, key, value)),
            other => Err(shape_mismatch(self.operation, other)),
        }
    }

    pub(crate) fn as_counter(&self) -> Result<(&str, i64)> {
        match &self.arguments {
            Arguments::Counter { key, delta } => Ok((key, *delta)),
            other => Err(shape_mismatch(self.operation, other)),
        }
    }

    pub(crate) fn as_counters(&self) -> Result<&[(String, i64)]> {
        match &self.arguments {
            Arguments::Counters(deltas) => Ok(deltas),
            other => Err(shape_mismatch(self.operation, other)),
        }
    }

    /// Result reported when the operation is skipped or its error suppressed:
    /// a miss for reads, `false` for single writes and every key for write batches.
    #[must_use]
    pub fn negative_result(&self) -> OpResult {
        match self.operation {
            Operation::GetItem => OpResult::Value(None),
            Operation::GetItems => OpResult::Values(HashMap::new()),
            Operation::HasItems => OpResult::Keys(Vec::new()),
            Operation::HasItem
            | Operation::SetItem
            | Operation::AddItem
            | Operation::ReplaceItem
            | Operation::CheckAndSetItem
            | Operation::TouchItem
            | Operation::RemoveItem => OpResult::Flag(false),
            Operation::SetItems
            | Operation::AddItems
            | Operation::ReplaceItems
            | Operation::TouchItems
            | Operation::RemoveItems => OpResult::Keys(self.keys()),
            Operation::IncrementItem | Operation::DecrementItem => OpResult::Counter(None),
            Operation::IncrementItems | Operation::DecrementItems => {
                OpResult::Counters(HashMap::new())
            }
        }
    }
}

fn shape_mismatch(operation: Operation, arguments: &Arguments) -> CacheError {
    CacheError::invalid(format!(
        "'{operation}' cannot run with {} arguments",
        arguments.shape()
    ))
}

/// Result of one operation as carried through the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum OpResult {
    /// Single read: `None` on miss
    Value(Option<Value>),
    /// Batch read: found entries only
    Values(HashMap<String, Value>),
    /// Single write, existence check or flush
    Flag(bool),
    /// `has_items`: keys found; write batches: keys that did not succeed
    Keys(Vec<String>),
    /// Single counter update: `None` when the write was rejected
    Counter(Option<i64>),
    /// Batch counter update: new values of successful keys
    Counters(HashMap<String, i64>),
}

impl OpResult {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Value(_) => "value",
            Self::Values(_) => "values",
            Self::Flag(_) => "flag",
            Self::Keys(_) => "keys",
            Self::Counter(_) => "counter",
            Self::Counters(_) => "counters",
        }
    }

    pub(crate) fn into_value(self, operation: Operation) -> Result<Option<Value>> {
        match self {
            Self::Value(value) => Ok(value),
            other => Err(result_mismatch(operation, &other)),
        }
    }

    pub(crate) fn into_values(self, operation: Operation) -> Result<HashMap<String, Value>> {
        match self {
            Self::Values(values) => Ok(values),
            other => Err(result_mismatch(operation, &other)),
        }
    }

    pub(crate) fn into_flag(self, operation: Operation) -> Result<bool> {
        match self {
            Self::Flag(flag) => Ok(flag),
            other => Err(result_mismatch(operation, &other)),
        }
    }

    pub(crate) fn into_keys(self, operation: Operation) -> Result<Vec<String>> {
        match self {
            Self::Keys(keys) => Ok(keys),
            other => Err(result_mismatch(operation, &other)),
        }
    }

    pub(crate) fn into_counter(self, operation: Operation) -> Result<Option<i64>> {
        match self {
            Self::Counter(counter) => Ok(counter),
            other => Err(result_mismatch(operation, &other)),
        }
    }

    pub(crate) fn into_counters(self, operation: Operation) -> Result<HashMap<String, i64>> {
        match self {
            Self::Counters(counters) => Ok(counters),
            other => Err(result_mismatch(operation, &other)),
        }
    }
}

fn result_mismatch(operation: Operation, result: &OpResult) -> CacheError {
    CacheError::invalid(format!(
        "listener produced a {} result for '{operation}'",
        result.kind()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_follow_argument_order() {
        let args = Arguments::Items(vec![("b".into(), json!(1)), ("a".into(), json!(2))]);
        assert_eq!(args.keys(), vec!["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn shape_change_is_rejected() {
        let mut ctx = OperationContext::new(Operation::GetItem, Arguments::Key("k".into()));
        *ctx.arguments_mut() = Arguments::Keys(vec!["k".into()]);
        let err = ctx.as_key().unwrap_err();
        assert!(matches!(err, CacheError::InvalidArgument(msg) if msg.contains("get_item")));
    }

    #[test]
    fn negative_result_of_write_batch_lists_every_key() {
        let ctx = OperationContext::new(
            Operation::SetItems,
            Arguments::Items(vec![("a".into(), json!(1)), ("b".into(), json!(2))]),
        );
        assert_eq!(
            ctx.negative_result(),
            OpResult::Keys(vec!["a".to_string(), "b".to_string()])
        );
        let ctx = OperationContext::new(Operation::GetItem, Arguments::Key("a".into()));
        assert_eq!(ctx.negative_result(), OpResult::Value(None));
    }

    #[test]
    fn result_kind_mismatch_is_rejected() {
        let err = OpResult::Flag(true)
            .into_value(Operation::GetItem)
            .unwrap_err();
        assert!(err.to_string().contains("flag"));
        assert_eq!(OpResult::Keys(vec![]).into_keys(Operation::SetItems).unwrap(), Vec::<String>::new());
    }

    #[test]
    fn read_operations_are_classified() {
        let reads: Vec<_> = Operation::ALL.into_iter().filter(|op| op.is_read()).collect();
        assert_eq!(
            reads,
            vec![
                Operation::GetItem,
                Operation::GetItems,
                Operation::HasItem,
                Operation::HasItems
            ]
        );
    }
}
