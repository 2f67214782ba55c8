//! Graph refresh from descriptor dumps
//!
//! Updates values in the graph to their actual SB state, either for all
//! descriptors (resync, verification) or only for the key spaces of selected
//! keys (values that failed). Descriptors are dumped in dump-dependency order.

use crate::exec::construct_targets;
use crate::flags::{self, SchedGraph};
use crate::queue::KvForTxn;
use crate::registry::Registry;
use reconcile_api::{
    Descriptor, DescriptorError, KeyValuePair, KvWithMetadata, ValueOrigin, ValueState,
};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

/// NB values to correlate with dumps during resync
pub(crate) struct ResyncData<'a> {
    /// Startup resync: correlate with NB values instead of the graph
    pub first: bool,
    pub values: &'a [KvForTxn],
}

/// Refresh the graph; `keys` limits the refresh to the given keys
/// (all keys when `None` or empty)
pub(crate) fn refresh_graph(
    registry: &Registry,
    graph: &mut SchedGraph,
    keys: Option<&BTreeSet<String>>,
    resync: Option<&ResyncData<'_>>,
    verbose: bool,
    updated: &mut BTreeSet<String>,
) {
    let keys = keys.filter(|keys| !keys.is_empty());
    let mut refresher = Refresher {
        registry,
        graph,
        updated,
        refreshed: HashSet::new(),
    };

    for descriptor in registry.ordered() {
        refresher.refresh_descriptor(descriptor, keys, resync, verbose);
    }

    // whatever was not dumped does not exist in SB
    let unrefreshed: Vec<String> = refresher
        .graph
        .keys()
        .filter(|key| !refresher.refreshed.contains(*key))
        .map(str::to_string)
        .collect();
    for key in unrefreshed {
        refresher.refresh_unavail_node(&key);
    }

    if verbose {
        log::debug!("Graph after refresh:\n{}", refresher.graph);
    }
}

struct Refresher<'a> {
    registry: &'a Registry,
    graph: &'a mut SchedGraph,
    updated: &'a mut BTreeSet<String>,
    refreshed: HashSet<String>,
}

impl Refresher<'_> {
    fn refresh_descriptor(
        &mut self,
        descriptor: &Arc<dyn Descriptor>,
        keys: Option<&BTreeSet<String>>,
        resync: Option<&ResyncData<'_>>,
        verbose: bool,
    ) {
        let name = descriptor.name();
        if let Some(keys) = keys {
            if !keys.iter().any(|key| descriptor.key_selector(key)) {
                self.skip_refresh(name, None);
                return;
            }
        }

        let prev_available = flags::correlate_values(self.graph, name);
        let correlate: Vec<KvWithMetadata> = match resync {
            Some(resync) if resync.first => resync
                .values
                .iter()
                .filter(|kv| descriptor.key_selector(&kv.key))
                .map(|kv| KvWithMetadata {
                    key: kv.key.clone(),
                    value: kv.value.clone(),
                    metadata: None,
                    origin: kv.origin,
                })
                .collect(),
            _ => prev_available.clone(),
        };

        let dump = match descriptor.dump(&correlate) {
            Ok(dump) => dump,
            Err(DescriptorError::DumpUnimplemented) => {
                self.skip_refresh(name, None);
                return;
            }
            Err(err) => {
                log::error!("Failed to dump values of {}, refresh skipped: {}", name, err);
                self.skip_refresh(name, None);
                return;
            }
        };
        if verbose {
            log::debug!("Descriptor {} dumped {} item(s): {:?}", name, dump.len(), dump);
        }

        if let Some(keys) = keys {
            self.skip_refresh(name, Some(keys));
        }

        for mut kv in dump {
            if keys.map_or(false, |keys| !keys.contains(&kv.key)) {
                continue;
            }
            if !self.valid_dumped_kv(&kv, descriptor.as_ref()) {
                continue;
            }
            if kv.origin == ValueOrigin::Unknown {
                if let Some(known) = correlate.iter().find(|c| c.key == kv.key) {
                    kv.origin = known.origin;
                }
            }
            if kv.origin == ValueOrigin::Unknown {
                if let Some(last) = self.graph.last_flags(&kv.key) {
                    kv.origin = last.origin();
                }
            }
            if kv.origin == ValueOrigin::Unknown {
                kv.origin = ValueOrigin::FromSb;
            }
            self.refresh_value(kv, descriptor.as_ref());
        }

        // NB values that are gone lose their metadata
        for kv in prev_available {
            if self.refreshed.contains(&kv.key) {
                continue;
            }
            if self.graph.node(&kv.key).map(|n| n.flags.origin()) == Some(ValueOrigin::FromNb) {
                self.graph.set_metadata(&kv.key, None);
            }
        }
    }

    fn valid_dumped_kv(&self, kv: &KvWithMetadata, descriptor: &dyn Descriptor) -> bool {
        let name = descriptor.name();
        if kv.key.is_empty() {
            log::warn!("Descriptor {} dumped value with empty key", name);
            return false;
        }
        if self.refreshed.contains(&kv.key) {
            log::warn!("Descriptor {} dumped {} more than once", name, kv.key);
            return false;
        }
        if kv.value.is_none() {
            log::warn!("Descriptor {} dumped nil value for {}", name, kv.key);
            return false;
        }
        if !descriptor.key_selector(&kv.key) {
            log::warn!("Descriptor {} dumped {} outside of its key space", name, kv.key);
            return false;
        }
        true
    }

    fn refresh_value(&mut self, kv: KvWithMetadata, descriptor: &dyn Descriptor) {
        let key = kv.key.as_str();
        let node = self.graph.upsert(key);
        node.set_label(descriptor.key_label(key));
        node.set_value(kv.value.clone());
        if descriptor.with_metadata() {
            self.graph.set_metadata_map(key, descriptor.name());
            self.graph.set_metadata(key, kv.metadata.clone());
        }
        self.refresh_avail_node(key, kv.origin, false, key);

        let Some(value) = kv.value.as_ref() else {
            return;
        };
        let mut obsolete: BTreeSet<String> = flags::derived_keys(self.graph, key).into_iter().collect();
        let mut derives = descriptor.derived_values(key, value);
        for derived in &derives {
            obsolete.remove(&derived.key);
        }
        // obsolete derived values stay in the relation until refreshed
        derives.extend(obsolete.iter().map(KeyValuePair::delete));

        let dependencies = descriptor.dependencies(key, value);
        self.graph
            .set_targets(key, construct_targets(&dependencies, &derives));

        for derived in derives {
            if obsolete.contains(&derived.key) {
                self.refresh_unavail_node(&derived.key);
                continue;
            }
            self.graph.upsert(&derived.key).set_value(derived.value.clone());
            let dependencies = match (self.registry.for_key(&derived.key), &derived.value) {
                (Some(d), Some(v)) => d.dependencies(&derived.key, v),
                _ => Vec::new(),
            };
            self.graph
                .set_targets(&derived.key, construct_targets(&dependencies, &[]));
            self.refresh_avail_node(&derived.key, kv.origin, true, key);
        }
    }

    /// Refresh a node whose value was dumped
    fn refresh_avail_node(&mut self, key: &str, origin: ValueOrigin, derived: bool, base_key: &str) {
        let descriptor = self.registry.for_key(key).map(|d| d.name().to_string());
        let Some(node) = self.graph.node(key) else {
            return;
        };
        if derived {
            if node.value().is_none() {
                log::warn!("Derived nil value for {}", key);
                self.graph.delete(key);
                return;
            }
            if self.refreshed.contains(key) {
                log::warn!("Derived value {} refreshed more than once", key);
            }
        }

        let Some(node) = self.graph.node_mut(key) else {
            return;
        };
        if node.flags.unavailable {
            self.updated.insert(base_key.to_string());
            node.flags.unavailable = false;
        }
        self.refreshed.insert(key.to_string());

        if node.flags.state == ValueState::NonExistent {
            node.flags.state = if origin == ValueOrigin::FromSb {
                ValueState::Retrieved
            } else {
                ValueState::Found
            };
        }
        if node.flags.state == ValueState::Pending {
            node.flags.state = ValueState::Configured;
        }
        node.flags.descriptor = descriptor;
        node.flags.derived_from = derived.then(|| base_key.to_string());
    }

    /// Refresh a node whose value was not dumped
    fn refresh_unavail_node(&mut self, key: &str) {
        self.refreshed.insert(key.to_string());
        let Some(node) = self.graph.node(key) else {
            return;
        };
        if flags::is_available(node) {
            self.updated.insert(flags::base_key(node));
        }
        let state = node.flags.state;
        if node.flags.origin() == ValueOrigin::FromSb || state == ValueState::Found {
            self.graph.delete(key);
            return;
        }

        let Some(node) = self.graph.node_mut(key) else {
            return;
        };
        node.flags.unavailable = true;
        if state == ValueState::Configured {
            let requested = node
                .flags
                .last_update
                .as_ref()
                .map_or(false, |u| u.value.is_some());
            node.flags.state = if requested {
                ValueState::Missing
            } else {
                ValueState::Removed
            };
        }
    }

    /// Mark values of a descriptor as refreshed without refreshing them
    fn skip_refresh(&mut self, descriptor: &str, except: Option<&BTreeSet<String>>) {
        let skipped: Vec<String> = self
            .graph
            .nodes()
            .filter(|n| n.flags.descriptor.as_deref() == Some(descriptor) && !n.flags.is_derived())
            .filter(|n| except.map_or(true, |except| !except.contains(n.key())))
            .map(|n| n.key().to_string())
            .collect();
        for key in skipped {
            self.refreshed.extend(flags::derived_keys(self.graph, &key));
            self.refreshed.insert(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::LastUpdate;
    use reconcile_api::{DumpResult, TxnOperation, Value};

    struct Dumping {
        dumped: Vec<(&'static str, &'static str)>,
    }

    impl Descriptor for Dumping {
        fn name(&self) -> &str {
            "iface"
        }

        fn key_selector(&self, key: &str) -> bool {
            key.starts_with("iface/")
        }

        fn derived_values(&self, key: &str, _value: &Value) -> Vec<KeyValuePair> {
            vec![KeyValuePair::new(format!("{}/up", key), true)]
        }

        fn dump(&self, _correlate: &[KvWithMetadata]) -> DumpResult {
            Ok(self
                .dumped
                .iter()
                .map(|(k, v)| KvWithMetadata::new(*k, *v, ValueOrigin::Unknown))
                .collect())
        }
    }

    fn registry(dumped: Vec<(&'static str, &'static str)>) -> Registry {
        let mut registry = Registry::new();
        registry
            .register(Arc::new(Dumping { dumped }), std::iter::empty())
            .unwrap();
        registry
    }

    fn configured(graph: &mut SchedGraph, key: &str, value: &str) {
        let node = graph.upsert(key);
        node.set_value(Some(Value::from(value)));
        node.flags.state = ValueState::Configured;
        node.flags.descriptor = Some("iface".into());
        node.flags.last_update = Some(LastUpdate {
            txn_seq: 1,
            op: TxnOperation::Add,
            value: Some(Value::from(value)),
            revert: false,
            retry: None,
        });
    }

    #[test]
    fn test_refresh_found_and_missing() {
        let registry = registry(vec![("iface/new", "x"), ("iface/a", "a")]);
        let mut graph = SchedGraph::new();
        configured(&mut graph, "iface/a", "a");
        configured(&mut graph, "iface/b", "b");
        let mut updated = BTreeSet::new();

        refresh_graph(&registry, &mut graph, None, None, false, &mut updated);

        let new = graph.node("iface/new").unwrap();
        assert_eq!(new.flags.state, ValueState::Retrieved);
        assert_eq!(
            graph.node("iface/new/up").unwrap().flags.derived_from.as_deref(),
            Some("iface/new")
        );
        assert_eq!(graph.node("iface/a").unwrap().flags.state, ValueState::Configured);

        let missing = graph.node("iface/b").unwrap();
        assert_eq!(missing.flags.state, ValueState::Missing);
        assert!(missing.flags.unavailable);
        assert!(updated.contains("iface/b"));
        assert!(!updated.contains("iface/a"));
    }

    #[test]
    fn test_refresh_selected_keys_only() {
        let registry = registry(vec![]);
        let mut graph = SchedGraph::new();
        configured(&mut graph, "iface/a", "a");
        configured(&mut graph, "iface/b", "b");
        let keys: BTreeSet<String> = ["iface/b".to_string()].into();
        let mut updated = BTreeSet::new();

        refresh_graph(&registry, &mut graph, Some(&keys), None, false, &mut updated);

        assert_eq!(graph.node("iface/a").unwrap().flags.state, ValueState::Configured);
        assert_eq!(graph.node("iface/b").unwrap().flags.state, ValueState::Missing);
    }

    #[test]
    fn test_retrieved_value_removed_when_not_dumped() {
        let registry = registry(vec![]);
        let mut graph = SchedGraph::new();
        let node = graph.upsert("iface/sb");
        node.set_value(Some(Value::from("sb")));
        node.flags.state = ValueState::Retrieved;
        node.flags.descriptor = Some("iface".into());
        let mut updated = BTreeSet::new();

        refresh_graph(&registry, &mut graph, None, None, false, &mut updated);
        assert!(!graph.contains("iface/sb"));
    }
}
