//! Capability Set
//!
//! A snapshot of the guarantees a backend actually offers: TTL bounds and
//! precision, key-length limits, supported value types and namespace
//! semantics. Any caller may read it. Only the holder of the matching
//! [`CapabilityToken`] can change it.
//!
//! A set may be linked to a base set (typically the set of an inner engine
//! that a decorator wraps). Attributes never set on the outer set resolve
//! through the base, recursively, ending at the built-in defaults.
//!
//! # Example
//!
//! ```rust
//! use uniform_cache::{Capabilities, CapabilityToken};
//!
//! let token = CapabilityToken::new();
//! let caps = Capabilities::new(&token);
//! assert_eq!(caps.max_key_length(), -1);
//!
//! caps.set_max_key_length(&token, 64).unwrap();
//! assert_eq!(caps.max_key_length(), 64);
//!
//! let foreign = CapabilityToken::new();
//! assert!(caps.set_max_key_length(&foreign, 10).is_err());
//! assert_eq!(caps.max_key_length(), 64);
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{CacheError, Result};

/// Built-in values used when neither the set nor any base set defines an attribute.
pub mod defaults {
    /// Items are never locked on expiry
    pub const LOCK_ON_EXPIRE: i64 = 0;
    /// Key length limit is unknown
    pub const MAX_KEY_LENGTH: i64 = -1;
    /// No lower TTL bound
    pub const MIN_TTL: u64 = 0;
    /// No upper TTL bound
    pub const MAX_TTL: u64 = 0;
    pub const STATIC_TTL: bool = false;
    /// Seconds
    pub const TTL_PRECISION: f64 = 1.0;
    pub const USE_REQUEST_TIME: bool = false;
    pub const NAMESPACE_IS_PREFIX: bool = true;
    pub const NAMESPACE_SEPARATOR: &str = "";
}

/// Kind of value a backend may or may not be able to store natively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Null,
    Boolean,
    Integer,
    Double,
    String,
    Array,
    Object,
}

impl ValueType {
    /// Every known value type, in table order.
    pub const ALL: [ValueType; 7] = [
        Self::Null,
        Self::Boolean,
        Self::Integer,
        Self::Double,
        Self::String,
        Self::Array,
        Self::Object,
    ];

    /// Canonical type name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Boolean => "boolean",
            Self::Integer => "integer",
            Self::Double => "double",
            Self::String => "string",
            Self::Array => "array",
            Self::Object => "object",
        }
    }

    /// Classify a cache value.
    #[must_use]
    pub fn of(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(_) => Self::Boolean,
            serde_json::Value::Number(n) if n.is_f64() => Self::Double,
            serde_json::Value::Number(_) => Self::Integer,
            serde_json::Value::String(_) => Self::String,
            serde_json::Value::Array(_) => Self::Array,
            serde_json::Value::Object(_) => Self::Object,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ValueType {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|ty| ty.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| CacheError::invalid(format!("unknown value type '{s}'")))
    }
}

/// Opaque possession token gating capability mutation.
///
/// Tokens are compared by identity: two tokens created separately never
/// match, even though neither carries any data. Tokens cannot be cloned
/// or serialized.
pub struct CapabilityToken {
    marker: Arc<()>,
}

impl CapabilityToken {
    /// Issue a fresh token.
    #[must_use]
    pub fn new() -> Self {
        Self {
            marker: Arc::new(()),
        }
    }
}

impl Default for CapabilityToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CapabilityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CapabilityToken(..)")
    }
}

/// Capability attribute names carried by change notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    LockOnExpire,
    MaxKeyLength,
    MinTtl,
    MaxTtl,
    StaticTtl,
    SupportedTypes,
    TtlPrecision,
    UseRequestTime,
    NamespaceIsPrefix,
    NamespaceSeparator,
}

impl Capability {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LockOnExpire => "lock_on_expire",
            Self::MaxKeyLength => "max_key_length",
            Self::MinTtl => "min_ttl",
            Self::MaxTtl => "max_ttl",
            Self::StaticTtl => "static_ttl",
            Self::SupportedTypes => "supported_types",
            Self::TtlPrecision => "ttl_precision",
            Self::UseRequestTime => "use_request_time",
            Self::NamespaceIsPrefix => "namespace_is_prefix",
            Self::NamespaceSeparator => "namespace_separator",
        }
    }
}

/// New value carried by a [`CapabilityChange`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CapabilityValue {
    Integer(i64),
    Unsigned(u64),
    Float(f64),
    Bool(bool),
    Text(String),
    Types(BTreeMap<ValueType, bool>),
}

/// Notification emitted when a setter changes a resolved capability value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityChange {
    pub capability: Capability,
    pub value: CapabilityValue,
}

#[derive(Debug, Default, Clone)]
struct Attributes {
    lock_on_expire: Option<i64>,
    max_key_length: Option<i64>,
    min_ttl: Option<u64>,
    max_ttl: Option<u64>,
    static_ttl: Option<bool>,
    supported_types: Option<BTreeMap<ValueType, bool>>,
    ttl_precision: Option<f64>,
    use_request_time: Option<bool>,
    namespace_is_prefix: Option<bool>,
    namespace_separator: Option<String>,
}

/// Capability Set of one engine (or of a decorator wrapping one).
pub struct Capabilities {
    marker: Arc<()>,
    base: Option<Arc<Capabilities>>,
    attributes: RwLock<Attributes>,
    notifier: Option<broadcast::Sender<CapabilityChange>>,
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capabilities")
            .field("lock_on_expire", &self.lock_on_expire())
            .field("max_key_length", &self.max_key_length())
            .field("min_ttl", &self.min_ttl())
            .field("max_ttl", &self.max_ttl())
            .field("static_ttl", &self.static_ttl())
            .field("supported_types", &self.supported_types())
            .field("ttl_precision", &self.ttl_precision())
            .field("use_request_time", &self.use_request_time())
            .field("namespace_is_prefix", &self.namespace_is_prefix())
            .field("namespace_separator", &self.namespace_separator())
            .field("has_base", &self.base.is_some())
            .finish()
    }
}

impl Capabilities {
    /// Create a set bound to `token`, resolving unset attributes to the defaults.
    #[must_use]
    pub fn new(token: &CapabilityToken) -> Self {
        Self {
            marker: Arc::clone(&token.marker),
            base: None,
            attributes: RwLock::new(Attributes::default()),
            notifier: None,
        }
    }

    /// Create a set bound to `token` whose unset attributes resolve through `base`.
    #[must_use]
    pub fn with_base(base: Arc<Capabilities>, token: &CapabilityToken) -> Self {
        Self {
            base: Some(base),
            ..Self::new(token)
        }
    }

    /// Deliver change notifications to `sender`.
    #[must_use]
    pub fn with_notifier(mut self, sender: broadcast::Sender<CapabilityChange>) -> Self {
        self.notifier = Some(sender);
        self
    }

    /// The set this one falls back to.
    #[must_use]
    pub fn base(&self) -> Option<&Arc<Capabilities>> {
        self.base.as_ref()
    }

    // ===== Getters =====

    /// Lock-on-expire window: -1 forever, 0 never, >0 seconds.
    #[must_use]
    pub fn lock_on_expire(&self) -> i64 {
        self.resolve(|a| a.lock_on_expire, Self::lock_on_expire, defaults::LOCK_ON_EXPIRE)
    }

    /// Maximum key length: -1 unknown, 0 unlimited.
    #[must_use]
    pub fn max_key_length(&self) -> i64 {
        self.resolve(|a| a.max_key_length, Self::max_key_length, defaults::MAX_KEY_LENGTH)
    }

    /// Minimum TTL in seconds, 0 when unbounded.
    #[must_use]
    pub fn min_ttl(&self) -> u64 {
        self.resolve(|a| a.min_ttl, Self::min_ttl, defaults::MIN_TTL)
    }

    /// Maximum TTL in seconds, 0 when unbounded.
    #[must_use]
    pub fn max_ttl(&self) -> u64 {
        self.resolve(|a| a.max_ttl, Self::max_ttl, defaults::MAX_TTL)
    }

    /// Whether the TTL is fixed at write time (as opposed to read time).
    #[must_use]
    pub fn static_ttl(&self) -> bool {
        self.resolve(|a| a.static_ttl, Self::static_ttl, defaults::STATIC_TTL)
    }

    /// Full table of supported value types.
    #[must_use]
    pub fn supported_types(&self) -> BTreeMap<ValueType, bool> {
        self.resolve(
            |a| a.supported_types.clone(),
            Self::supported_types,
            default_supported_types(),
        )
    }

    /// Whether values of `ty` are stored natively.
    #[must_use]
    pub fn supports(&self, ty: ValueType) -> bool {
        self.supported_types().get(&ty).copied().unwrap_or(false)
    }

    /// TTL precision in seconds.
    #[must_use]
    pub fn ttl_precision(&self) -> f64 {
        self.resolve(|a| a.ttl_precision, Self::ttl_precision, defaults::TTL_PRECISION)
    }

    /// Whether expiry is measured from request time instead of wall clock.
    #[must_use]
    pub fn use_request_time(&self) -> bool {
        self.resolve(|a| a.use_request_time, Self::use_request_time, defaults::USE_REQUEST_TIME)
    }

    /// Whether a namespace is applied as a key prefix.
    #[must_use]
    pub fn namespace_is_prefix(&self) -> bool {
        self.resolve(
            |a| a.namespace_is_prefix,
            Self::namespace_is_prefix,
            defaults::NAMESPACE_IS_PREFIX,
        )
    }

    /// Separator between namespace and key.
    #[must_use]
    pub fn namespace_separator(&self) -> String {
        self.resolve(
            |a| a.namespace_separator.clone(),
            Self::namespace_separator,
            defaults::NAMESPACE_SEPARATOR.to_string(),
        )
    }

    // ===== Setters =====

    /// # Errors
    ///
    /// [`CacheError::InvalidToken`] for a foreign token,
    /// [`CacheError::InvalidArgument`] for values below -1.
    pub fn set_lock_on_expire(&self, token: &CapabilityToken, seconds: i64) -> Result<()> {
        self.check_token(token)?;
        if seconds < -1 {
            return Err(CacheError::invalid(format!(
                "lock_on_expire must be -1, 0 or positive, got {seconds}"
            )));
        }
        self.apply(
            Capability::LockOnExpire,
            seconds,
            self.lock_on_expire(),
            |a| &mut a.lock_on_expire,
            CapabilityValue::Integer,
        );
        Ok(())
    }

    /// # Errors
    ///
    /// [`CacheError::InvalidToken`] for a foreign token,
    /// [`CacheError::InvalidArgument`] for lengths below -1.
    pub fn set_max_key_length(&self, token: &CapabilityToken, length: i64) -> Result<()> {
        self.check_token(token)?;
        if length < -1 {
            return Err(CacheError::invalid(format!(
                "max_key_length must be >= -1, got {length}"
            )));
        }
        self.apply(
            Capability::MaxKeyLength,
            length,
            self.max_key_length(),
            |a| &mut a.max_key_length,
            CapabilityValue::Integer,
        );
        Ok(())
    }

    /// # Errors
    ///
    /// [`CacheError::InvalidToken`] for a foreign token.
    pub fn set_min_ttl(&self, token: &CapabilityToken, seconds: u64) -> Result<()> {
        self.check_token(token)?;
        self.apply(
            Capability::MinTtl,
            seconds,
            self.min_ttl(),
            |a| &mut a.min_ttl,
            CapabilityValue::Unsigned,
        );
        Ok(())
    }

    /// # Errors
    ///
    /// [`CacheError::InvalidToken`] for a foreign token.
    pub fn set_max_ttl(&self, token: &CapabilityToken, seconds: u64) -> Result<()> {
        self.check_token(token)?;
        self.apply(
            Capability::MaxTtl,
            seconds,
            self.max_ttl(),
            |a| &mut a.max_ttl,
            CapabilityValue::Unsigned,
        );
        Ok(())
    }

    /// # Errors
    ///
    /// [`CacheError::InvalidToken`] for a foreign token.
    pub fn set_static_ttl(&self, token: &CapabilityToken, flag: bool) -> Result<()> {
        self.check_token(token)?;
        self.apply(
            Capability::StaticTtl,
            flag,
            self.static_ttl(),
            |a| &mut a.static_ttl,
            CapabilityValue::Bool,
        );
        Ok(())
    }

    /// Replace the supported value-type table.
    ///
    /// Types missing from `table` are recorded as unsupported.
    ///
    /// # Errors
    ///
    /// [`CacheError::InvalidToken`] for a foreign token,
    /// [`CacheError::InvalidArgument`] for an unknown type name.
    pub fn set_supported_types<I, S>(&self, token: &CapabilityToken, table: I) -> Result<()>
    where
        I: IntoIterator<Item = (S, bool)>,
        S: AsRef<str>,
    {
        self.check_token(token)?;
        let mut normalized: BTreeMap<ValueType, bool> =
            ValueType::ALL.into_iter().map(|ty| (ty, false)).collect();
        for (name, supported) in table {
            let ty: ValueType = name.as_ref().parse()?;
            normalized.insert(ty, supported);
        }
        self.apply(
            Capability::SupportedTypes,
            normalized,
            self.supported_types(),
            |a| &mut a.supported_types,
            CapabilityValue::Types,
        );
        Ok(())
    }

    /// # Errors
    ///
    /// [`CacheError::InvalidToken`] for a foreign token,
    /// [`CacheError::InvalidArgument`] unless `seconds` is finite and positive.
    pub fn set_ttl_precision(&self, token: &CapabilityToken, seconds: f64) -> Result<()> {
        self.check_token(token)?;
        if !seconds.is_finite() || seconds <= 0.0 {
            return Err(CacheError::invalid(format!(
                "ttl_precision must be positive, got {seconds}"
            )));
        }
        self.apply(
            Capability::TtlPrecision,
            seconds,
            self.ttl_precision(),
            |a| &mut a.ttl_precision,
            CapabilityValue::Float,
        );
        Ok(())
    }

    /// # Errors
    ///
    /// [`CacheError::InvalidToken`] for a foreign token.
    pub fn set_use_request_time(&self, token: &CapabilityToken, flag: bool) -> Result<()> {
        self.check_token(token)?;
        self.apply(
            Capability::UseRequestTime,
            flag,
            self.use_request_time(),
            |a| &mut a.use_request_time,
            CapabilityValue::Bool,
        );
        Ok(())
    }

    /// # Errors
    ///
    /// [`CacheError::InvalidToken`] for a foreign token.
    pub fn set_namespace_is_prefix(&self, token: &CapabilityToken, flag: bool) -> Result<()> {
        self.check_token(token)?;
        self.apply(
            Capability::NamespaceIsPrefix,
            flag,
            self.namespace_is_prefix(),
            |a| &mut a.namespace_is_prefix,
            CapabilityValue::Bool,
        );
        Ok(())
    }

    /// # Errors
    ///
    /// [`CacheError::InvalidToken`] for a foreign token.
    pub fn set_namespace_separator(
        &self,
        token: &CapabilityToken,
        separator: impl Into<String>,
    ) -> Result<()> {
        self.check_token(token)?;
        self.apply(
            Capability::NamespaceSeparator,
            separator.into(),
            self.namespace_separator(),
            |a| &mut a.namespace_separator,
            CapabilityValue::Text,
        );
        Ok(())
    }

    // ===== Internals =====

    fn check_token(&self, token: &CapabilityToken) -> Result<()> {
        if Arc::ptr_eq(&self.marker, &token.marker) {
            Ok(())
        } else {
            Err(CacheError::InvalidToken)
        }
    }

    fn resolve<T>(
        &self,
        own: impl FnOnce(&Attributes) -> Option<T>,
        inherited: impl FnOnce(&Capabilities) -> T,
        default: T,
    ) -> T {
        if let Some(value) = own(&*self.attributes.read()) {
            return value;
        }
        match &self.base {
            Some(base) => inherited(base),
            None => default,
        }
    }

    /// Store `value` and notify when it differs from the previously resolved one.
    fn apply<T: PartialEq + Clone>(
        &self,
        capability: Capability,
        value: T,
        current: T,
        slot: impl FnOnce(&mut Attributes) -> &mut Option<T>,
        wrap: impl FnOnce(T) -> CapabilityValue,
    ) {
        *slot(&mut *self.attributes.write()) = Some(value.clone());

        if current == value {
            return;
        }

        debug!(capability = capability.as_str(), "Capability changed");
        if let Some(notifier) = &self.notifier {
            // No subscribers is not an error
            let _ = notifier.send(CapabilityChange {
                capability,
                value: wrap(value),
            });
        }
    }
}

fn default_supported_types() -> BTreeMap<ValueType, bool> {
    ValueType::ALL
        .into_iter()
        .map(|ty| (ty, ty == ValueType::String))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notifying(token: &CapabilityToken) -> (Capabilities, broadcast::Receiver<CapabilityChange>) {
        let (tx, rx) = broadcast::channel(16);
        (Capabilities::new(token).with_notifier(tx), rx)
    }

    #[test]
    fn defaults_apply_without_base() {
        let token = CapabilityToken::new();
        let caps = Capabilities::new(&token);

        assert_eq!(caps.lock_on_expire(), 0);
        assert_eq!(caps.max_key_length(), -1);
        assert_eq!(caps.min_ttl(), 0);
        assert_eq!(caps.max_ttl(), 0);
        assert!(!caps.static_ttl());
        assert!((caps.ttl_precision() - 1.0).abs() < f64::EPSILON);
        assert!(!caps.use_request_time());
        assert!(caps.namespace_is_prefix());
        assert_eq!(caps.namespace_separator(), "");
        assert!(caps.supports(ValueType::String));
        assert!(!caps.supports(ValueType::Object));
    }

    #[test]
    fn foreign_token_is_rejected_and_value_kept() {
        let token = CapabilityToken::new();
        let caps = Capabilities::new(&token);
        caps.set_max_key_length(&token, 64).unwrap();

        let foreign = CapabilityToken::new();
        let err = caps.set_max_key_length(&foreign, 10).unwrap_err();
        assert!(matches!(err, CacheError::InvalidToken));
        assert_eq!(caps.max_key_length(), 64);
    }

    #[test]
    fn token_is_checked_before_domain() {
        let caps = Capabilities::new(&CapabilityToken::new());
        let err = caps
            .set_ttl_precision(&CapabilityToken::new(), -1.0)
            .unwrap_err();
        assert!(matches!(err, CacheError::InvalidToken));
    }

    #[test]
    fn domain_violations_are_invalid_arguments() {
        let token = CapabilityToken::new();
        let caps = Capabilities::new(&token);

        assert!(matches!(
            caps.set_max_key_length(&token, -2),
            Err(CacheError::InvalidArgument(_))
        ));
        assert!(matches!(
            caps.set_lock_on_expire(&token, -5),
            Err(CacheError::InvalidArgument(_))
        ));
        assert!(matches!(
            caps.set_ttl_precision(&token, 0.0),
            Err(CacheError::InvalidArgument(_))
        ));
        assert!(matches!(
            caps.set_ttl_precision(&token, f64::NAN),
            Err(CacheError::InvalidArgument(_))
        ));
        assert!(matches!(
            caps.set_supported_types(&token, [("resource", true)]),
            Err(CacheError::InvalidArgument(_))
        ));
        assert_eq!(caps.max_key_length(), -1);
    }

    #[test]
    fn supported_types_table_is_normalized() {
        let token = CapabilityToken::new();
        let caps = Capabilities::new(&token);
        caps.set_supported_types(&token, [("Integer", true), ("array", true)])
            .unwrap();

        let table = caps.supported_types();
        assert_eq!(table.len(), ValueType::ALL.len());
        assert_eq!(table.get(&ValueType::Integer), Some(&true));
        assert_eq!(table.get(&ValueType::Array), Some(&true));
        // Omitted entries are recorded as unsupported, including the default-supported string
        assert_eq!(table.get(&ValueType::String), Some(&false));
    }

    #[test]
    fn unset_attributes_resolve_through_base() {
        let inner_token = CapabilityToken::new();
        let inner = Arc::new(Capabilities::new(&inner_token));
        inner.set_max_ttl(&inner_token, 3600).unwrap();
        inner.set_namespace_separator(&inner_token, ":").unwrap();

        let outer_token = CapabilityToken::new();
        let outer = Capabilities::with_base(Arc::clone(&inner), &outer_token);
        assert_eq!(outer.max_ttl(), 3600);
        assert_eq!(outer.namespace_separator(), ":");

        outer.set_max_ttl(&outer_token, 60).unwrap();
        assert_eq!(outer.max_ttl(), 60);
        assert_eq!(inner.max_ttl(), 3600);

        // The outer token does not open the base
        assert!(inner.set_max_ttl(&outer_token, 1).is_err());

        // Later base changes remain visible through unset attributes
        inner.set_min_ttl(&inner_token, 5).unwrap();
        assert_eq!(outer.min_ttl(), 5);
    }

    #[test]
    fn change_notifies_once_and_equal_value_is_silent() {
        let token = CapabilityToken::new();
        let (caps, mut rx) = notifying(&token);

        caps.set_max_key_length(&token, -1).unwrap();
        assert!(rx.try_recv().is_err(), "equal value must not notify");

        caps.set_max_key_length(&token, 250).unwrap();
        let change = rx.try_recv().unwrap();
        assert_eq!(change.capability, Capability::MaxKeyLength);
        assert_eq!(change.value, CapabilityValue::Integer(250));
        assert!(rx.try_recv().is_err());

        caps.set_max_key_length(&token, 250).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn equality_is_by_value_for_strings_and_tables() {
        let token = CapabilityToken::new();
        let (caps, mut rx) = notifying(&token);

        caps.set_namespace_separator(&token, String::from("")).unwrap();
        assert!(rx.try_recv().is_err());

        caps.set_supported_types(&token, [("string", true)]).unwrap();
        assert!(rx.try_recv().is_err());

        caps.set_supported_types(&token, [("string", true), ("null", true)])
            .unwrap();
        assert_eq!(
            rx.try_recv().unwrap().capability,
            Capability::SupportedTypes
        );
    }

    #[test]
    fn value_type_classification() {
        assert_eq!(ValueType::of(&serde_json::json!(null)), ValueType::Null);
        assert_eq!(ValueType::of(&serde_json::json!(3)), ValueType::Integer);
        assert_eq!(ValueType::of(&serde_json::json!(3.5)), ValueType::Double);
        assert_eq!(ValueType::of(&serde_json::json!("x")), ValueType::String);
        assert_eq!(ValueType::of(&serde_json::json!([1])), ValueType::Array);
        assert_eq!(ValueType::of(&serde_json::json!({"a": 1})), ValueType::Object);
        assert_eq!("DOUBLE".parse::<ValueType>().unwrap(), ValueType::Double);
    }
}
