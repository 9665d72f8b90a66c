//! Adapter options
//!
//! Flags and defaults the engine reads at call time. Options deserialize
//! from JSON with every field optional:
//!
//! ```rust
//! use uniform_cache::AdapterOptions;
//!
//! let options = AdapterOptions::from_json(r#"{"namespace": "app", "ttl": 30}"#).unwrap();
//! assert!(options.readable);
//! assert_eq!(options.namespace, "app");
//! ```

use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterOptions {
    /// Reads return a miss without touching the backend when `false`
    pub readable: bool,
    /// Writes return a negative result without touching the backend when `false`
    pub writable: bool,
    /// Regular expression every normalized key must match (empty = none)
    pub key_pattern: Option<String>,
    /// Default time-to-live in seconds (0 = no expiry)
    pub ttl: f64,
    /// Namespace applied to storage keys (empty = none)
    pub namespace: String,
}

impl Default for AdapterOptions {
    fn default() -> Self {
        Self {
            readable: true,
            writable: true,
            key_pattern: None,
            ttl: 0.0,
            namespace: String::new(),
        }
    }
}

impl AdapterOptions {
    /// Parse options from JSON.
    ///
    /// # Errors
    ///
    /// [`CacheError::InvalidArgument`] on malformed JSON or invalid values.
    pub fn from_json(json: &str) -> Result<Self> {
        let options: Self = serde_json::from_str(json)
            .map_err(|e| CacheError::invalid(format!("malformed adapter options: {e}")))?;
        options.validate()?;
        Ok(options)
    }

    /// Check values that can be checked without a capability set.
    ///
    /// # Errors
    ///
    /// [`CacheError::InvalidArgument`] for a negative/non-finite TTL or a
    /// key pattern that does not compile.
    pub fn validate(&self) -> Result<()> {
        validate_ttl(self.ttl)?;
        compile_key_pattern(self.key_pattern.as_deref())?;
        Ok(())
    }

    /// TTL as a duration, `None` when items should not expire.
    #[must_use]
    pub fn ttl_duration(&self) -> Option<Duration> {
        (self.ttl > 0.0).then(|| Duration::from_secs_f64(self.ttl))
    }
}

pub(crate) fn validate_ttl(ttl: f64) -> Result<()> {
    if ttl.is_finite() && ttl >= 0.0 {
        Ok(())
    } else {
        Err(CacheError::invalid(format!(
            "ttl must be a non-negative number of seconds, got {ttl}"
        )))
    }
}

pub(crate) fn compile_key_pattern(pattern: Option<&str>) -> Result<Option<Regex>> {
    match pattern {
        None | Some("") => Ok(None),
        Some(pattern) => Regex::new(pattern)
            .map(Some)
            .map_err(|e| CacheError::invalid(format!("invalid key pattern '{pattern}': {e}"))),
    }
}

/// Options together with the compiled key pattern.
#[derive(Debug, Clone)]
pub(crate) struct CompiledOptions {
    pub(crate) options: AdapterOptions,
    pub(crate) key_pattern: Option<Regex>,
}

impl CompiledOptions {
    pub(crate) fn compile(options: AdapterOptions) -> Result<Self> {
        validate_ttl(options.ttl)?;
        let key_pattern = compile_key_pattern(options.key_pattern.as_deref())?;
        Ok(Self {
            options,
            key_pattern,
        })
    }
}
