//! Graph - nodes, relations and metadata maps
//!
//! Edges are stored on the source node as [`RelationTarget`] definitions
//! and resolved against the current node set on every query, so a target
//! that appears later is picked up without re-declaring the edge. Exact-key
//! edges are indexed by target key; any-of edges are evaluated by scanning.

use crate::node::{Node, Relation, RelationTarget};
use reconcile_api::{Metadata, MetadataMap};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

/// Nodes currently matched by one edge definition
#[derive(Debug)]
pub struct TargetNodes<'a, F> {
    pub label: &'a str,
    pub nodes: Vec<&'a Node<F>>,
}

/// The key-value graph
#[derive(Clone)]
pub struct Graph<F> {
    nodes: BTreeMap<String, Node<F>>,
    /// (relation, target key) -> source keys with an exact-key edge
    key_sources: HashMap<(Relation, String), BTreeSet<String>>,
    /// Source keys having at least one any-of edge
    selector_sources: BTreeSet<String>,
    metadata_maps: HashMap<String, Arc<dyn MetadataMap>>,
    /// Flags of removed nodes, by key
    retired: HashMap<String, F>,
}

impl<F: Clone + Default> Default for Graph<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: Clone + Default> Graph<F> {
    /// Create an empty graph
    pub fn new() -> Self {
        Self {
            nodes: BTreeMap::new(),
            key_sources: HashMap::new(),
            selector_sources: BTreeSet::new(),
            metadata_maps: HashMap::new(),
            retired: HashMap::new(),
        }
    }

    /// Register the metadata map of a descriptor
    pub fn register_metadata_map(&mut self, name: impl Into<String>, map: Arc<dyn MetadataMap>) {
        self.metadata_maps.insert(name.into(), map);
    }

    pub fn metadata_map(&self, name: &str) -> Option<Arc<dyn MetadataMap>> {
        self.metadata_maps.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.nodes.contains_key(key)
    }

    pub fn node(&self, key: &str) -> Option<&Node<F>> {
        self.nodes.get(key)
    }

    pub fn node_mut(&mut self, key: &str) -> Option<&mut Node<F>> {
        self.nodes.get_mut(key)
    }

    /// Get the node, creating an empty one if missing
    pub fn upsert(&mut self, key: &str) -> &mut Node<F> {
        if !self.nodes.contains_key(key) {
            self.retired.remove(key);
        }
        self.nodes
            .entry(key.to_string())
            .or_insert_with(|| Node::new(key))
    }

    /// Remove the node together with its edges and metadata
    pub fn delete(&mut self, key: &str) -> Option<Node<F>> {
        let node = self.nodes.remove(key)?;
        self.unindex(&node);
        if let (Some(map), true) = (self.node_metadata_map(&node), node.metadata.is_some()) {
            map.delete(node.label());
        }
        self.retired.insert(key.to_string(), node.flags.clone());
        Some(node)
    }

    /// Flags of the node, or of its last removed revision
    pub fn last_flags(&self, key: &str) -> Option<&F> {
        match self.nodes.get(key) {
            Some(node) => Some(&node.flags),
            None => self.retired.get(key),
        }
    }

    /// All nodes sorted by key
    pub fn nodes(&self) -> impl Iterator<Item = &Node<F>> {
        self.nodes.values()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    /// Nodes whose flags satisfy the predicate
    pub fn select<P>(&self, predicate: P) -> Vec<&Node<F>>
    where
        P: Fn(&Node<F>) -> bool,
    {
        self.nodes.values().filter(|n| predicate(n)).collect()
    }

    /// Replace edge definitions of a node
    pub fn set_targets(&mut self, key: &str, targets: Vec<RelationTarget>) {
        let Some(node) = self.nodes.get_mut(key) else {
            return;
        };
        let old = std::mem::replace(&mut node.targets, targets);
        let has_selectors = node.has_selector_targets();
        for target in &old {
            if let Some(target_key) = target.target_key() {
                let index_key = (target.relation, target_key.to_string());
                if let Some(sources) = self.key_sources.get_mut(&index_key) {
                    sources.remove(key);
                    if sources.is_empty() {
                        self.key_sources.remove(&index_key);
                    }
                }
            }
        }
        self.selector_sources.remove(key);
        if has_selectors {
            self.selector_sources.insert(key.to_string());
        }
        if let Some(node) = self.nodes.get(key) {
            for target in &node.targets {
                if let Some(target_key) = target.target_key() {
                    self.key_sources
                        .entry((target.relation, target_key.to_string()))
                        .or_default()
                        .insert(key.to_string());
                }
            }
        }
    }

    /// Resolve edges of the given relation into the nodes present now
    pub fn targets(&self, key: &str, relation: Relation) -> Vec<TargetNodes<'_, F>> {
        let Some(node) = self.nodes.get(key) else {
            return Vec::new();
        };
        node.relation_targets(relation)
            .map(|target| {
                let nodes = match target.target_key() {
                    Some(target_key) => self.nodes.get(target_key).into_iter().collect(),
                    None => self
                        .nodes
                        .values()
                        .filter(|n| n.key != key && target.matches(&n.key))
                        .collect(),
                };
                TargetNodes {
                    label: &target.label,
                    nodes,
                }
            })
            .collect()
    }

    /// Nodes with an edge of the given relation pointing at `key`, sorted
    pub fn sources(&self, key: &str, relation: Relation) -> Vec<&Node<F>> {
        let mut keys: BTreeSet<&str> = BTreeSet::new();
        if let Some(exact) = self.key_sources.get(&(relation, key.to_string())) {
            keys.extend(exact.iter().map(String::as_str));
        }
        for source in &self.selector_sources {
            if source == key {
                continue;
            }
            if let Some(node) = self.nodes.get(source) {
                let points_here = node
                    .relation_targets(relation)
                    .any(|t| t.target_key().is_none() && t.matches(key));
                if points_here {
                    keys.insert(source);
                }
            }
        }
        keys.into_iter().filter_map(|k| self.nodes.get(k)).collect()
    }

    /// Mirror the node's metadata into the named metadata map from now on
    pub fn set_metadata_map(&mut self, key: &str, map: &str) {
        if let Some(node) = self.nodes.get_mut(key) {
            node.metadata_map = Some(map.to_string());
        }
    }

    /// Set (or clear) node metadata, keeping the metadata map in sync
    pub fn set_metadata(&mut self, key: &str, metadata: Option<Metadata>) {
        let Some(node) = self.nodes.get_mut(key) else {
            return;
        };
        node.metadata = metadata.clone();
        let label = node.label().to_string();
        let map = node
            .metadata_map
            .as_ref()
            .and_then(|name| self.metadata_maps.get(name));
        match (map, metadata) {
            (Some(map), Some(metadata)) => map.put(&label, metadata),
            (Some(map), None) => {
                map.delete(&label);
            }
            (None, _) => {}
        }
    }

    fn node_metadata_map(&self, node: &Node<F>) -> Option<&Arc<dyn MetadataMap>> {
        node.metadata_map
            .as_ref()
            .and_then(|name| self.metadata_maps.get(name))
    }

    fn unindex(&mut self, node: &Node<F>) {
        for target in &node.targets {
            if let Some(target_key) = target.target_key() {
                let index_key = (target.relation, target_key.to_string());
                if let Some(sources) = self.key_sources.get_mut(&index_key) {
                    sources.remove(&node.key);
                    if sources.is_empty() {
                        self.key_sources.remove(&index_key);
                    }
                }
            }
        }
        self.selector_sources.remove(&node.key);
    }
}

impl<F: fmt::Debug> fmt::Display for Graph<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.nodes.is_empty() {
            return writeln!(f, "<EMPTY>");
        }
        for node in self.nodes.values() {
            writeln!(f, "- key: {}", node.key)?;
            if let Some(value) = node.value() {
                writeln!(f, "  value: {}", value)?;
            }
            if node.label() != node.key {
                writeln!(f, "  label: {}", node.label())?;
            }
            if node.metadata.is_some() {
                writeln!(f, "  metadata: <set>")?;
            }
            writeln!(f, "  flags: {:?}", node.flags)?;
            for target in &node.targets {
                writeln!(f, "  target: {:?}", target)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reconcile_api::{prefix_selector, NamedMapping, Value};

    fn graph() -> Graph<u32> {
        Graph::new()
    }

    #[test]
    fn test_upsert_and_delete() {
        let mut g = graph();
        g.upsert("a").set_value(Some(Value::from(1)));
        g.upsert("a").flags = 7;
        assert_eq!(g.len(), 1);
        assert_eq!(g.node("a").and_then(|n| n.value()), Some(&Value::from(1)));

        let removed = g.delete("a").unwrap();
        assert_eq!(removed.flags, 7);
        assert!(!g.contains("a"));
        assert_eq!(g.last_flags("a"), Some(&7));

        g.upsert("a");
        assert_eq!(g.last_flags("a"), Some(&0));
    }

    #[test]
    fn test_key_targets_resolve_lazily() {
        let mut g = graph();
        g.upsert("rule/x");
        g.set_targets(
            "rule/x",
            vec![RelationTarget::key(Relation::DependsOn, "iface", "iface/a")],
        );

        let targets = g.targets("rule/x", Relation::DependsOn);
        assert_eq!(targets.len(), 1);
        assert!(targets[0].nodes.is_empty());

        g.upsert("iface/a");
        let targets = g.targets("rule/x", Relation::DependsOn);
        assert_eq!(targets[0].nodes.len(), 1);
        assert_eq!(targets[0].label, "iface");

        let sources = g.sources("iface/a", Relation::DependsOn);
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].key(), "rule/x");
        assert!(g.sources("iface/a", Relation::Derives).is_empty());
    }

    #[test]
    fn test_any_of_targets() {
        let mut g = graph();
        g.upsert("route/1");
        g.set_targets(
            "route/1",
            vec![RelationTarget::any_of(
                Relation::DependsOn,
                "some-iface",
                prefix_selector("iface/"),
            )],
        );
        g.upsert("iface/a");
        g.upsert("iface/b");
        g.upsert("acl/1");

        let targets = g.targets("route/1", Relation::DependsOn);
        let keys: Vec<_> = targets[0].nodes.iter().map(|n| n.key()).collect();
        assert_eq!(keys, vec!["iface/a", "iface/b"]);

        assert_eq!(g.sources("iface/b", Relation::DependsOn).len(), 1);
        assert!(g.sources("acl/1", Relation::DependsOn).is_empty());
    }

    #[test]
    fn test_set_targets_reindexes() {
        let mut g = graph();
        g.upsert("b");
        g.set_targets("b", vec![RelationTarget::key(Relation::DependsOn, "x", "a1")]);
        g.upsert("a1");
        g.upsert("a2");
        g.set_targets("b", vec![RelationTarget::key(Relation::DependsOn, "x", "a2")]);

        assert!(g.sources("a1", Relation::DependsOn).is_empty());
        assert_eq!(g.sources("a2", Relation::DependsOn).len(), 1);

        g.delete("b");
        assert!(g.sources("a2", Relation::DependsOn).is_empty());
    }

    #[test]
    fn test_metadata_map_sync() {
        let mut g = graph();
        let map = Arc::new(NamedMapping::new("ifaces"));
        g.register_metadata_map("ifaces", map.clone());

        let node = g.upsert("iface/eth0");
        node.set_label("eth0");
        g.set_metadata_map("iface/eth0", "ifaces");
        g.set_metadata("iface/eth0", Some(Arc::new(5u32)));
        assert_eq!(map.labels(), vec!["eth0".to_string()]);

        g.set_metadata("iface/eth0", None);
        assert!(map.is_empty());

        g.set_metadata("iface/eth0", Some(Arc::new(6u32)));
        g.delete("iface/eth0");
        assert!(map.is_empty());
    }

    #[test]
    fn test_clone_is_independent() {
        let mut g = graph();
        g.upsert("a").flags = 1;
        let mut copy = g.clone();
        copy.upsert("a").flags = 2;
        copy.upsert("b");
        assert_eq!(g.node("a").map(|n| n.flags), Some(1));
        assert!(!g.contains("b"));
    }
}
