//! Node - one key-value pair of the graph

use reconcile_api::{DependencyTarget, KeySelector, Metadata, Value};
use std::fmt;

/// Kind of edge between two nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Relation {
    /// Source needs the target to be available
    DependsOn,
    /// Target is derived from the source
    Derives,
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DependsOn => write!(f, "depends-on"),
            Self::Derives => write!(f, "derives"),
        }
    }
}

/// Edge definition stored on the source node
#[derive(Clone)]
pub struct RelationTarget {
    pub relation: Relation,
    pub label: String,
    pub target: DependencyTarget,
}

impl RelationTarget {
    /// Edge towards an exact key
    pub fn key(relation: Relation, label: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            relation,
            label: label.into(),
            target: DependencyTarget::Key(key.into()),
        }
    }

    /// Edge towards every key matching the selector
    pub fn any_of(relation: Relation, label: impl Into<String>, selector: KeySelector) -> Self {
        Self {
            relation,
            label: label.into(),
            target: DependencyTarget::AnyOf(selector),
        }
    }

    /// Whether the edge points at `key`
    pub fn matches(&self, key: &str) -> bool {
        match &self.target {
            DependencyTarget::Key(target) => target == key,
            DependencyTarget::AnyOf(selector) => selector(key),
        }
    }

    pub fn target_key(&self) -> Option<&str> {
        match &self.target {
            DependencyTarget::Key(key) => Some(key),
            DependencyTarget::AnyOf(_) => None,
        }
    }
}

impl fmt::Debug for RelationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {:?}", self.relation, self.label, self.target)
    }
}

/// A node of the graph.
///
/// Targets and metadata are changed through [`Graph`](crate::Graph) so the
/// reverse index and metadata maps stay consistent.
#[derive(Clone)]
pub struct Node<F> {
    pub(crate) key: String,
    label: String,
    value: Option<Value>,
    pub(crate) metadata: Option<Metadata>,
    pub(crate) metadata_map: Option<String>,
    pub(crate) targets: Vec<RelationTarget>,
    /// Scheduler-defined lifecycle flags
    pub flags: F,
}

impl<F: Default> Node<F> {
    pub(crate) fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            label: key.to_string(),
            value: None,
            metadata: None,
            metadata_map: None,
            targets: Vec::new(),
            flags: F::default(),
        }
    }
}

impl<F> Node<F> {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Label under which metadata is stored (the key by default)
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn set_label(&mut self, label: impl Into<String>) {
        self.label = label.into();
    }

    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub fn set_value(&mut self, value: Option<Value>) {
        self.value = value;
    }

    pub fn metadata(&self) -> Option<&Metadata> {
        self.metadata.as_ref()
    }

    /// Name of the metadata map the node's metadata is mirrored into
    pub fn metadata_map(&self) -> Option<&str> {
        self.metadata_map.as_deref()
    }

    /// Edge definitions of the given relation
    pub fn relation_targets(&self, relation: Relation) -> impl Iterator<Item = &RelationTarget> {
        self.targets.iter().filter(move |t| t.relation == relation)
    }

    pub(crate) fn has_selector_targets(&self) -> bool {
        self.targets
            .iter()
            .any(|t| matches!(t.target, DependencyTarget::AnyOf(_)))
    }
}

impl<F: fmt::Debug> fmt::Debug for Node<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("key", &self.key)
            .field("label", &self.label)
            .field("value", &self.value)
            .field("has_metadata", &self.metadata.is_some())
            .field("flags", &self.flags)
            .field("targets", &self.targets)
            .finish()
    }
}
