//! Error types for adapter operations.
//!
//! Validation errors ([`CacheError::InvalidArgument`], [`CacheError::InvalidToken`])
//! are raised before any pipeline phase runs. Backend errors are wrapped in
//! [`CacheError::Backend`] and routed through the exception phase, where a
//! listener may replace them with a result.
//!
//! A cache miss is never an error.

use thiserror::Error;

/// Error raised by the adapter engine, capability set or plugin registry.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Malformed key, malformed capability value or unknown value-type name.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Capability mutation attempted without the owning token.
    #[error("invalid capability token")]
    InvalidToken,

    /// The same plugin instance was attached twice.
    #[error("plugin '{plugin}' is already attached")]
    AlreadyAttached {
        /// Name reported by the plugin
        plugin: &'static str,
    },

    /// The backend has no primitive for this operation.
    #[error("operation '{operation}' is not supported by backend '{backend}'")]
    Unsupported {
        /// Operation name
        operation: &'static str,
        /// Backend name
        backend: &'static str,
    },

    /// A backend primitive failed while executing an operation.
    #[error("backend failure during '{operation}' (keys: {keys:?}): {source}")]
    Backend {
        /// Operation name
        operation: &'static str,
        /// Keys involved in the failed call
        keys: Vec<String>,
        /// Error reported by the backend
        #[source]
        source: anyhow::Error,
    },
}

impl CacheError {
    /// Shorthand for [`CacheError::InvalidArgument`].
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Wrap a backend error with the operation and keys it concerned.
    pub fn backend(operation: &'static str, keys: Vec<String>, source: anyhow::Error) -> Self {
        Self::Backend {
            operation,
            keys,
            source,
        }
    }

    /// Returns `true` for errors raised by input validation.
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::InvalidArgument(_) | Self::InvalidToken)
    }
}

/// A specialized [`Result`](std::result::Result) type for adapter operations.
pub type Result<T> = std::result::Result<T, CacheError>;
