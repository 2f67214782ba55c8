//! Per-node lifecycle flags and the queries built on them

use reconcile_api::{
    BaseValueStatus, DescriptorError, KvWithMetadata, RetryPolicy, TxnOperation, Value,
    ValueOrigin, ValueState, ValueStatus,
};
use reconcile_graph::{Graph, Node, Relation};

pub(crate) type SchedGraph = Graph<NodeFlags>;
pub(crate) type SchedNode = Node<NodeFlags>;

/// Last NB-driven (or inherited) change of a value
#[derive(Debug, Clone)]
pub(crate) struct LastUpdate {
    pub txn_seq: u64,
    pub op: TxnOperation,
    /// Value requested by the change, `None` for removal
    pub value: Option<Value>,
    pub revert: bool,
    pub retry: Option<RetryPolicy>,
}

#[derive(Debug, Clone)]
pub(crate) struct NodeError {
    pub error: DescriptorError,
    pub retriable: bool,
}

/// Scheduler bookkeeping attached to every graph node
#[derive(Debug, Clone, Default)]
pub(crate) struct NodeFlags {
    pub state: ValueState,
    pub last_update: Option<LastUpdate>,
    pub error: Option<NodeError>,
    /// Owning descriptor, `None` for properties and unimplemented values
    pub descriptor: Option<String>,
    /// Base key of a derived value
    pub derived_from: Option<String>,
    /// Not applied in SB, does not satisfy dependencies
    pub unavailable: bool,
}

impl NodeFlags {
    pub fn origin(&self) -> ValueOrigin {
        state_to_origin(self.state)
    }

    pub fn is_derived(&self) -> bool {
        self.derived_from.is_some()
    }

    pub fn last_operation(&self) -> TxnOperation {
        match (&self.last_update, self.state) {
            (_, ValueState::Retrieved) | (None, _) => TxnOperation::Undefined,
            (Some(update), _) => update.op,
        }
    }

    pub fn error_string(&self) -> Option<String> {
        self.error.as_ref().map(|e| e.error.to_string())
    }
}

pub(crate) fn state_to_origin(state: ValueState) -> ValueOrigin {
    match state {
        ValueState::NonExistent => ValueOrigin::Unknown,
        ValueState::Retrieved => ValueOrigin::FromSb,
        _ => ValueOrigin::FromNb,
    }
}

pub(crate) fn is_available(node: &SchedNode) -> bool {
    !node.flags.unavailable
}

pub(crate) fn base_key(node: &SchedNode) -> String {
    node.flags
        .derived_from
        .clone()
        .unwrap_or_else(|| node.key().to_string())
}

/// Whether every dependency of the node is satisfied by an applied node.
///
/// Values observed in SB do not have their dependencies checked. A value
/// depending on itself (directly or through a cycle) never becomes ready.
pub(crate) fn is_ready(graph: &SchedGraph, key: &str) -> bool {
    match graph.node(key) {
        Some(node) if node.flags.origin() == ValueOrigin::FromSb => true,
        Some(_) => unmet_dependencies(graph, key).is_empty(),
        None => false,
    }
}

/// States of a value successfully applied (or observed) in SB
pub(crate) fn is_applied_state(state: ValueState) -> bool {
    matches!(
        state,
        ValueState::Configured | ValueState::Retrieved | ValueState::Found
    )
}

/// An available value in a failed state does not satisfy dependencies
pub(crate) fn satisfies_dependency(node: &SchedNode) -> bool {
    is_available(node) && is_applied_state(node.flags.state)
}

/// Labels of dependencies without any satisfying target
pub(crate) fn unmet_dependencies(graph: &SchedGraph, key: &str) -> Vec<String> {
    graph
        .targets(key, Relation::DependsOn)
        .into_iter()
        .filter(|t| !t.nodes.iter().any(|n| satisfies_dependency(n)))
        .map(|t| t.label.to_string())
        .collect()
}

pub(crate) fn derived_keys(graph: &SchedGraph, key: &str) -> Vec<String> {
    graph
        .targets(key, Relation::Derives)
        .into_iter()
        .flat_map(|t| t.nodes.into_iter().map(|n| n.key().to_string()))
        .collect()
}

pub(crate) fn value_details(graph: &SchedGraph, node: &SchedNode) -> Vec<String> {
    match node.flags.state {
        ValueState::Invalid => node
            .flags
            .error
            .as_ref()
            .map(|e| e.error.invalid_fields().to_vec())
            .unwrap_or_default(),
        ValueState::Pending => unmet_dependencies(graph, node.key()),
        _ => Vec::new(),
    }
}

fn single_status(graph: &SchedGraph, node: &SchedNode) -> ValueStatus {
    if node.flags.state == ValueState::NonExistent {
        return ValueStatus {
            key: node.key().to_string(),
            ..Default::default()
        };
    }
    ValueStatus {
        key: node.key().to_string(),
        state: node.flags.state,
        error: node.flags.error_string(),
        last_operation: node.flags.last_operation(),
        details: value_details(graph, node),
    }
}

/// Status of the value under `key` together with its derived values
pub(crate) fn value_status(graph: &SchedGraph, key: &str) -> BaseValueStatus {
    let Some(node) = graph.node(key) else {
        return BaseValueStatus {
            value: ValueStatus {
                key: key.to_string(),
                ..Default::default()
            },
            derived_values: Vec::new(),
        };
    };
    let value = single_status(graph, node);
    let mut derived_values = Vec::new();
    if value.state != ValueState::NonExistent && !node.flags.is_derived() {
        for derived in derived_keys(graph, key) {
            if let Some(derived_node) = graph.node(&derived) {
                derived_values.push(single_status(graph, derived_node));
            }
        }
    }
    BaseValueStatus {
        value,
        derived_values,
    }
}

/// Comparable snapshot of what a status watcher sees
pub(crate) fn status_fingerprint(
    graph: &SchedGraph,
    key: &str,
) -> (ValueState, TxnOperation, Option<String>, Vec<String>) {
    match graph.node(key) {
        Some(node) => {
            let mut details = value_details(graph, node);
            details.sort();
            (
                node.flags.state,
                node.flags.last_operation(),
                node.flags.error_string(),
                details,
            )
        }
        None => (ValueState::NonExistent, TxnOperation::Undefined, None, Vec::new()),
    }
}

/// Non-derived, available values of a descriptor
pub(crate) fn correlate_values(graph: &SchedGraph, descriptor: &str) -> Vec<KvWithMetadata> {
    graph
        .nodes()
        .filter(|n| {
            n.flags.descriptor.as_deref() == Some(descriptor)
                && is_available(n)
                && !n.flags.is_derived()
        })
        .map(to_kv_with_metadata)
        .collect()
}

pub(crate) fn to_kv_with_metadata(node: &SchedNode) -> KvWithMetadata {
    KvWithMetadata {
        key: node.key().to_string(),
        value: node.value().cloned(),
        metadata: node.metadata().cloned(),
        origin: node.flags.origin(),
    }
}

/// Non-derived values declared by NB (anything not retrieved from SB)
pub(crate) fn is_nb_base(node: &SchedNode) -> bool {
    !node.flags.is_derived() && node.flags.state != ValueState::Retrieved
}

/// Non-derived values retrieved from SB
pub(crate) fn is_sb_base(node: &SchedNode) -> bool {
    !node.flags.is_derived() && node.flags.state == ValueState::Retrieved
}

#[cfg(test)]
mod tests {
    use super::*;
    use reconcile_api::{prefix_selector, InvalidValueError};
    use reconcile_graph::RelationTarget;

    fn graph_with_dependency() -> SchedGraph {
        let mut g = SchedGraph::new();
        g.upsert("rule/x").flags.state = ValueState::Pending;
        g.set_targets(
            "rule/x",
            vec![
                RelationTarget::key(Relation::DependsOn, "iface", "iface/a"),
                RelationTarget::any_of(Relation::DependsOn, "some-vrf", prefix_selector("vrf/")),
            ],
        );
        g
    }

    #[test]
    fn test_origin_from_state() {
        assert_eq!(state_to_origin(ValueState::NonExistent), ValueOrigin::Unknown);
        assert_eq!(state_to_origin(ValueState::Retrieved), ValueOrigin::FromSb);
        assert_eq!(state_to_origin(ValueState::Found), ValueOrigin::FromNb);
        assert_eq!(state_to_origin(ValueState::Pending), ValueOrigin::FromNb);
    }

    #[test]
    fn test_readiness() {
        let mut g = graph_with_dependency();
        assert!(!is_ready(&g, "rule/x"));
        assert_eq!(
            unmet_dependencies(&g, "rule/x"),
            vec!["iface".to_string(), "some-vrf".to_string()]
        );

        g.upsert("iface/a").flags.state = ValueState::Configured;
        g.upsert("vrf/1").flags.unavailable = true;
        assert_eq!(unmet_dependencies(&g, "rule/x"), vec!["some-vrf".to_string()]);

        g.upsert("vrf/2").flags.state = ValueState::Retrieved;
        assert!(is_ready(&g, "rule/x"));

        g.upsert("iface/a").flags.unavailable = true;
        assert!(!is_ready(&g, "rule/x"));
        g.upsert("rule/x").flags.state = ValueState::Retrieved;
        assert!(is_ready(&g, "rule/x"));
    }

    #[test]
    fn test_failed_dependency_is_unmet() {
        let mut g = graph_with_dependency();
        g.upsert("vrf/1").flags.state = ValueState::Configured;
        g.upsert("iface/a").flags.state = ValueState::Failed;
        assert_eq!(unmet_dependencies(&g, "rule/x"), vec!["iface".to_string()]);

        g.upsert("iface/a").flags.state = ValueState::Retrying;
        assert!(!is_ready(&g, "rule/x"));

        g.upsert("iface/a").flags.state = ValueState::Found;
        assert!(is_ready(&g, "rule/x"));
    }

    #[test]
    fn test_self_dependency_is_never_ready() {
        let mut g = SchedGraph::new();
        g.upsert("a").flags.unavailable = true;
        g.set_targets("a", vec![RelationTarget::key(Relation::DependsOn, "self", "a")]);
        assert!(!is_ready(&g, "a"));
    }

    #[test]
    fn test_value_status_details() {
        let g = graph_with_dependency();
        let status = value_status(&g, "rule/x");
        assert_eq!(status.state(), ValueState::Pending);
        assert_eq!(status.value.details, vec!["iface", "some-vrf"]);

        let mut g = SchedGraph::new();
        let node = g.upsert("iface/a");
        node.flags.state = ValueState::Invalid;
        node.flags.error = Some(NodeError {
            error: InvalidValueError::new("bad mtu", ["mtu"]).into(),
            retriable: false,
        });
        let status = value_status(&g, "iface/a");
        assert_eq!(status.value.details, vec!["mtu"]);
        assert!(status.value.error.unwrap().contains("bad mtu"));

        assert_eq!(value_status(&g, "missing").state(), ValueState::NonExistent);
    }

    #[test]
    fn test_derived_status_included() {
        let mut g = SchedGraph::new();
        g.upsert("iface/a").flags.state = ValueState::Configured;
        g.set_targets(
            "iface/a",
            vec![RelationTarget::key(Relation::Derives, "iface/a/ip", "iface/a/ip")],
        );
        let derived = g.upsert("iface/a/ip");
        derived.flags.state = ValueState::Configured;
        derived.flags.derived_from = Some("iface/a".into());

        let status = value_status(&g, "iface/a");
        assert_eq!(status.derived_values.len(), 1);
        assert_eq!(status.derived_values[0].key, "iface/a/ip");
        assert_eq!(base_key(g.node("iface/a/ip").unwrap()), "iface/a");
    }
}
