//! Descriptor contract
//!
//! A descriptor teaches the engine how to validate, apply and dump one kind
//! of value. Every key is owned by at most one descriptor, chosen by
//! [`Descriptor::key_selector`]. Callbacks the descriptor does not support
//! keep their default implementation, which either returns a neutral answer
//! (no dependencies, no derived values, structural equality) or reports
//! [`DescriptorError::Unimplemented`].
//!
//! ```text
//!            ┌─────────────┐  add / delete / modify  ┌──────────────┐
//! engine ───►│ Descriptor  │────────────────────────►│  southbound  │
//!            └─────────────┘◄────────── dump ────────└──────────────┘
//! ```

use crate::error::DescriptorError;
use crate::metadata::{MetadataMap, NamedMapping};
use crate::status::TxnOperation;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Opaque, descriptor-owned runtime data attached to a non-derived value
pub type Metadata = Arc<dyn Any + Send + Sync>;

/// Predicate over keys
pub type KeySelector = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Build a selector matching every key with the given prefix
pub fn prefix_selector(prefix: impl Into<String>) -> KeySelector {
    let prefix = prefix.into();
    Arc::new(move |key: &str| key.starts_with(&prefix))
}

/// Build a selector matching exactly the given keys
pub fn keys_selector<I, S>(keys: I) -> KeySelector
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let keys: Vec<String> = keys.into_iter().map(Into::into).collect();
    Arc::new(move |key: &str| keys.iter().any(|k| k == key))
}

/// Where a key-value pair comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ValueOrigin {
    /// Origin has to be inferred from history
    #[default]
    Unknown,
    /// Declared by a northbound transaction
    FromNb,
    /// Observed in the southbound, not managed by northbound
    FromSb,
}

impl fmt::Display for ValueOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "UNKNOWN"),
            Self::FromNb => write!(f, "FROM-NB"),
            Self::FromSb => write!(f, "FROM-SB"),
        }
    }
}

/// A key with its value (`None` = deleted / to be deleted)
#[derive(Debug, Clone, PartialEq)]
pub struct KeyValuePair {
    pub key: String,
    pub value: Option<Value>,
}

impl KeyValuePair {
    pub fn new(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
        }
    }

    /// Pair requesting removal of the key
    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: None,
        }
    }
}

/// A key-value pair as dumped from the southbound, or as correlated from
/// the engine's view of it
#[derive(Clone)]
pub struct KvWithMetadata {
    pub key: String,
    pub value: Option<Value>,
    pub metadata: Option<Metadata>,
    pub origin: ValueOrigin,
}

impl KvWithMetadata {
    pub fn new(key: impl Into<String>, value: impl Into<Value>, origin: ValueOrigin) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
            metadata: None,
            origin,
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

impl fmt::Debug for KvWithMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KvWithMetadata")
            .field("key", &self.key)
            .field("value", &self.value)
            .field("has_metadata", &self.metadata.is_some())
            .field("origin", &self.origin)
            .finish()
    }
}

/// What a dependency points at
#[derive(Clone)]
pub enum DependencyTarget {
    /// An exact key that must be present
    Key(String),
    /// Satisfied when at least one present key matches the selector
    AnyOf(KeySelector),
}

impl fmt::Debug for DependencyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(key) => write!(f, "Key({})", key),
            Self::AnyOf(_) => write!(f, "AnyOf(..)"),
        }
    }
}

/// A named reference from a value to the values it needs.
///
/// Dependencies of one value are AND-ed.
#[derive(Debug, Clone)]
pub struct Dependency {
    /// Label, unique among the dependencies of one value
    pub label: String,
    pub target: DependencyTarget,
}

impl Dependency {
    /// Dependency on an exact key
    pub fn on_key(label: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            target: DependencyTarget::Key(key.into()),
        }
    }

    /// Dependency satisfied by any key matching `selector`
    pub fn any_of(label: impl Into<String>, selector: KeySelector) -> Self {
        Self {
            label: label.into(),
            target: DependencyTarget::AnyOf(selector),
        }
    }
}

/// Result of a descriptor dump
pub type DumpResult = Result<Vec<KvWithMetadata>, DescriptorError>;

/// Callbacks and static metadata for one kind of value.
///
/// Only [`name`](Descriptor::name) and
/// [`key_selector`](Descriptor::key_selector) are mandatory.
pub trait Descriptor: Send + Sync {
    /// Unique descriptor name
    fn name(&self) -> &str;

    /// Whether the key belongs to this descriptor
    fn key_selector(&self, key: &str) -> bool;

    /// Shorter label used as the metadata map key
    fn key_label(&self, key: &str) -> String {
        key.to_string()
    }

    /// Common prefix of northbound keys handled by this descriptor
    fn nb_key_prefix(&self) -> Option<&str> {
        None
    }

    /// Sample keys of this key space, used to detect overlapping
    /// descriptors at registration
    fn sample_keys(&self) -> Vec<String> {
        Vec::new()
    }

    /// Whether two values are equivalent (no modification needed)
    fn equivalent(&self, _key: &str, old: &Value, new: &Value) -> bool {
        old == new
    }

    /// Whether values of this descriptor carry metadata
    fn with_metadata(&self) -> bool {
        false
    }

    /// Metadata map to use for this descriptor
    fn metadata_map_factory(&self) -> Arc<dyn MetadataMap> {
        Arc::new(NamedMapping::new(self.name()))
    }

    /// Validate a northbound value before it is applied
    fn validate(&self, _key: &str, _value: &Value) -> Result<(), DescriptorError> {
        Ok(())
    }

    /// Create the value in the southbound
    fn add(&self, _key: &str, _value: &Value) -> Result<Option<Metadata>, DescriptorError> {
        Err(DescriptorError::Unimplemented(TxnOperation::Add))
    }

    /// Remove the value from the southbound
    fn delete(
        &self,
        _key: &str,
        _value: &Value,
        _metadata: Option<&Metadata>,
    ) -> Result<(), DescriptorError> {
        Err(DescriptorError::Unimplemented(TxnOperation::Delete))
    }

    /// Update the value in the southbound
    fn modify(
        &self,
        _key: &str,
        _old: &Value,
        _new: &Value,
        _old_metadata: Option<&Metadata>,
    ) -> Result<Option<Metadata>, DescriptorError> {
        Err(DescriptorError::Unimplemented(TxnOperation::Modify))
    }

    /// Whether a change has to be applied as delete followed by add
    fn modify_with_recreate(
        &self,
        _key: &str,
        _old: &Value,
        _new: &Value,
        _metadata: Option<&Metadata>,
    ) -> bool {
        false
    }

    /// Whether a failed operation is worth retrying
    fn is_retriable_failure(&self, _err: &DescriptorError) -> bool {
        true
    }

    /// Values this value depends on
    fn dependencies(&self, _key: &str, _value: &Value) -> Vec<Dependency> {
        Vec::new()
    }

    /// Values derived from this value
    fn derived_values(&self, _key: &str, _value: &Value) -> Vec<KeyValuePair> {
        Vec::new()
    }

    /// Read the current southbound state of this key space.
    ///
    /// `correlate` holds the values the engine believes to be applied.
    fn dump(&self, _correlate: &[KvWithMetadata]) -> DumpResult {
        Err(DescriptorError::DumpUnimplemented)
    }

    /// Names of descriptors whose dump must run before this one
    fn dump_dependencies(&self) -> Vec<String> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Bare;

    impl Descriptor for Bare {
        fn name(&self) -> &str {
            "bare"
        }

        fn key_selector(&self, key: &str) -> bool {
            key.starts_with("bare/")
        }
    }

    #[test]
    fn test_default_callbacks() {
        let d = Bare;
        let v = Value::from("x");
        assert_eq!(d.key_label("bare/a"), "bare/a");
        assert!(d.equivalent("bare/a", &v, &v));
        assert!(d.validate("bare/a", &v).is_ok());
        assert!(d.dependencies("bare/a", &v).is_empty());
        assert!(matches!(
            d.add("bare/a", &v),
            Err(DescriptorError::Unimplemented(TxnOperation::Add))
        ));
        assert!(matches!(d.dump(&[]), Err(DescriptorError::DumpUnimplemented)));
    }

    #[test]
    fn test_selectors() {
        let by_prefix = prefix_selector("iface/");
        assert!(by_prefix("iface/a"));
        assert!(!by_prefix("route/a"));

        let by_keys = keys_selector(["a", "b"]);
        assert!(by_keys("b"));
        assert!(!by_keys("c"));
    }
}
