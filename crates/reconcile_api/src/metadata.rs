//! Metadata maps
//!
//! Every descriptor owns one map from value label to metadata. The engine
//! writes into it while applying values; everybody else gets a read-only
//! [`MetadataMapView`].

use crate::descriptor::Metadata;
use parking_lot::RwLock;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Label -> metadata map written by the engine.
///
/// Implementations use interior mutability; custom implementations may
/// maintain secondary indices inside `put`/`delete`.
pub trait MetadataMap: Send + Sync {
    /// Name of the map (the descriptor name by default)
    fn name(&self) -> &str;

    /// Metadata stored under the label
    fn get(&self, label: &str) -> Option<Metadata>;

    /// All labels, sorted
    fn labels(&self) -> Vec<String>;

    /// Insert or replace metadata
    fn put(&self, label: &str, metadata: Metadata);

    /// Remove metadata, returning the previous entry
    fn delete(&self, label: &str) -> Option<Metadata>;

    /// Access to the concrete type, for custom indices
    fn as_any(&self) -> &dyn Any;
}

/// Default metadata map: a plain label -> metadata mapping
pub struct NamedMapping {
    name: String,
    items: RwLock<BTreeMap<String, Metadata>>,
}

impl NamedMapping {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            items: RwLock::new(BTreeMap::new()),
        }
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }
}

impl MetadataMap for NamedMapping {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, label: &str) -> Option<Metadata> {
        self.items.read().get(label).cloned()
    }

    fn labels(&self) -> Vec<String> {
        self.items.read().keys().cloned().collect()
    }

    fn put(&self, label: &str, metadata: Metadata) {
        self.items.write().insert(label.to_string(), metadata);
    }

    fn delete(&self, label: &str) -> Option<Metadata> {
        self.items.write().remove(label)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl fmt::Debug for NamedMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedMapping")
            .field("name", &self.name)
            .field("labels", &self.labels())
            .finish()
    }
}

/// Read-only handle on a descriptor's metadata map
#[derive(Clone)]
pub struct MetadataMapView {
    inner: Arc<dyn MetadataMap>,
}

impl MetadataMapView {
    pub fn new(inner: Arc<dyn MetadataMap>) -> Self {
        Self { inner }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn get(&self, label: &str) -> Option<Metadata> {
        self.inner.get(label)
    }

    /// Metadata downcast to the descriptor's concrete type
    pub fn get_as<T: Any + Send + Sync>(&self, label: &str) -> Option<Arc<T>> {
        self.inner.get(label)?.downcast::<T>().ok()
    }

    pub fn labels(&self) -> Vec<String> {
        self.inner.labels()
    }

    pub fn contains(&self, label: &str) -> bool {
        self.inner.get(label).is_some()
    }

    /// Concrete map type, for descriptor-defined secondary indices
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.as_any().downcast_ref::<T>()
    }
}

impl fmt::Debug for MetadataMapView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetadataMapView")
            .field("name", &self.name())
            .field("labels", &self.labels())
            .finish()
    }
}
