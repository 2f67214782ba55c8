//! Transaction executor
//!
//! Applies the values of a pre-processed transaction to the graph, calling
//! descriptors unless running as a dry run. Every value is applied through
//! [`Executor::apply_value`], which recursively handles derived values and
//! re-evaluates values depending on the one that changed:
//!
//! ```text
//! apply_value ──► apply_add ────┬──► run_updates ──► apply_value (dependents)
//!             ├─► apply_modify ─┤
//!             └─► apply_delete ─┴──► apply_derived ──► apply_value (derived)
//! ```

use crate::flags::{self, LastUpdate, NodeError, SchedGraph};
use crate::queue::{KvForTxn, Transaction};
use crate::refresh;
use crate::registry::Registry;
use reconcile_api::{
    Dependency, Descriptor, DescriptorError, KeyValuePair, RecordedTxnOp, TxnOperation,
    ValueOrigin, ValueState,
};
use reconcile_graph::{Relation, RelationTarget};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

type ApplyResult = Result<(), DescriptorError>;

struct ApplyArgs {
    kv: KvForTxn,
    base_key: String,
    is_retry: bool,
    /// Re-evaluation triggered by a change of a dependency
    is_update: bool,
    is_derived: bool,
}

/// Executes one transaction over the graph
pub(crate) struct Executor<'a> {
    registry: &'a Registry,
    graph: &'a mut SchedGraph,
    txn: &'a Transaction,
    dry_run: bool,
    /// Base keys whose status changed
    updated: &'a mut BTreeSet<String>,
    /// Keys on the current recursion path
    branch: HashSet<String>,
}

impl<'a> Executor<'a> {
    pub fn new(
        registry: &'a Registry,
        graph: &'a mut SchedGraph,
        txn: &'a Transaction,
        dry_run: bool,
        updated: &'a mut BTreeSet<String>,
    ) -> Self {
        Self {
            registry,
            graph,
            txn,
            dry_run,
            updated,
            branch: HashSet::new(),
        }
    }

    /// Apply all values of the transaction, best-effort or with revert on
    /// the first failure
    pub fn execute(mut self) -> Vec<RecordedTxnOp> {
        let txn = self.txn;
        let mut executed = Vec::new();
        let mut prev_values: Vec<KeyValuePair> = Vec::with_capacity(txn.values.len());
        let mut revert = false;

        for kv in &txn.values {
            prev_values.insert(
                0,
                KeyValuePair {
                    key: kv.key.clone(),
                    value: self.graph.node(&kv.key).and_then(|n| n.value().cloned()),
                },
            );
            let args = ApplyArgs {
                kv: kv.clone(),
                base_key: kv.key.clone(),
                is_retry: txn.retry().is_some(),
                is_update: false,
                is_derived: false,
            };
            let result = self.apply_value(&args, &mut executed);
            if result.is_err() && txn.revert_on_failure() && !self.dry_run {
                let failed: BTreeSet<String> = [kv.key.clone()].into();
                refresh::refresh_graph(
                    self.registry,
                    self.graph,
                    Some(&failed),
                    None,
                    true,
                    self.updated,
                );
                revert = true;
                break;
            }
        }

        if revert {
            log::info!("Transaction {} failed, reverting applied values", txn.seq_num);
            for prev in prev_values {
                let args = ApplyArgs {
                    kv: KvForTxn {
                        key: prev.key.clone(),
                        value: prev.value,
                        metadata: None,
                        origin: ValueOrigin::FromNb,
                        is_revert: true,
                    },
                    base_key: prev.key,
                    is_retry: false,
                    is_update: false,
                    is_derived: false,
                };
                // failures of the revert are recorded in the executed ops
                let _ = self.apply_value(&args, &mut executed);
            }
        }

        compress_txn_ops(executed)
    }

    fn apply_value(&mut self, args: &ApplyArgs, executed: &mut Vec<RecordedTxnOp>) -> ApplyResult {
        let key = args.kv.key.clone();
        if !self.branch.insert(key.clone()) {
            return Ok(());
        }
        let result = self.apply_value_in_branch(args, executed);
        self.branch.remove(&key);
        result
    }

    fn apply_value_in_branch(
        &mut self,
        args: &ApplyArgs,
        executed: &mut Vec<RecordedTxnOp>,
    ) -> ApplyResult {
        let key = args.kv.key.as_str();
        self.graph.upsert(key);
        let prev_status = flags::status_fingerprint(self.graph, key);
        let mut op = self.pre_record(args);

        let node = match self.graph.node(key) {
            Some(node) => node,
            None => return Ok(()),
        };
        let prev_update = node.flags.last_update.clone();
        let prev_state = node.flags.state;

        op.operation = if args.is_update {
            match self.update_operation(key) {
                TxnOperation::Undefined => return Ok(()),
                operation => operation,
            }
        } else if args.kv.value.is_none() {
            TxnOperation::Delete
        } else if node.value().is_none() || !flags::is_available(node) {
            TxnOperation::Add
        } else {
            TxnOperation::Modify
        };

        let retry = match self.txn.nb() {
            Some(nb) => nb.retry,
            None => prev_update.as_ref().and_then(|u| u.retry),
        };
        if let Some(node) = self.graph.node_mut(key) {
            node.flags.last_update = Some(LastUpdate {
                txn_seq: self.txn.seq_num,
                op: op.operation,
                value: args.kv.value.clone(),
                revert: args.kv.is_revert,
                retry,
            });
        }

        // already failed within this transaction, refreshed in post-processing
        let failed_in_txn = matches!(prev_state, ValueState::Failed | ValueState::Retrying)
            && !args.kv.is_revert
            && prev_update.as_ref().map(|u| u.txn_seq) == Some(self.txn.seq_num);
        if failed_in_txn {
            let err = self
                .graph
                .node(key)
                .and_then(|n| n.flags.error.as_ref())
                .map(|e| e.error.clone());
            return match err {
                Some(err) => Err(err),
                None => Ok(()),
            };
        }

        let result = match op.operation {
            TxnOperation::Delete => self.apply_delete(args, op, args.is_update, executed),
            TxnOperation::Add => self.apply_add(args, op, executed),
            TxnOperation::Modify => self.apply_modify(args, op, executed),
            TxnOperation::Undefined => Ok(()),
        };

        if !self.dry_run
            && (prev_update.is_none() || flags::status_fingerprint(self.graph, key) != prev_status)
        {
            self.updated.insert(args.base_key.clone());
        }
        result
    }

    fn pre_record(&self, args: &ApplyArgs) -> RecordedTxnOp {
        let key = &args.kv.key;
        let node = self.graph.node(key);
        RecordedTxnOp {
            key: key.clone(),
            prev_value: node.and_then(|n| n.value().cloned()),
            new_value: args.kv.value.clone(),
            prev_state: node.map(|n| n.flags.state).unwrap_or_default(),
            prev_err: node.and_then(|n| n.flags.error_string()),
            is_derived: args.is_derived,
            is_property: args.is_derived && self.registry.for_key(key).is_none(),
            is_revert: args.kv.is_revert,
            is_retry: args.is_retry,
            ..Default::default()
        }
    }

    /// Operation needed after a dependency of the value changed
    fn update_operation(&self, key: &str) -> TxnOperation {
        let available = self.graph.node(key).map_or(false, flags::is_available);
        let ready = flags::is_ready(self.graph, key);
        match (available, ready) {
            (false, true) => TxnOperation::Add,
            (true, false) => TxnOperation::Delete,
            _ => TxnOperation::Undefined,
        }
    }

    fn set_state(&mut self, key: &str, state: ValueState) {
        if let Some(node) = self.graph.node_mut(key) {
            if node.flags.state != state {
                log::debug!("{}: {} -> {}", key, node.flags.state, state);
                node.flags.state = state;
            }
        }
    }

    fn set_unavailable(&mut self, key: &str, unavailable: bool) {
        if let Some(node) = self.graph.node_mut(key) {
            node.flags.unavailable = unavailable;
        }
    }

    fn set_error(&mut self, key: &str, error: Option<NodeError>) {
        if let Some(node) = self.graph.node_mut(key) {
            node.flags.error = error;
        }
    }

    fn is_derived_node(&self, key: &str) -> bool {
        self.graph.node(key).map_or(false, |n| n.flags.is_derived())
    }

    fn apply_delete(
        &mut self,
        args: &ApplyArgs,
        mut op: RecordedTxnOp,
        pending: bool,
        executed: &mut Vec<RecordedTxnOp>,
    ) -> ApplyResult {
        let key = args.kv.key.as_str();
        let Some(node) = self.graph.node(key) else {
            return Ok(());
        };
        if node.value().is_none() {
            // nothing to remove, not even recorded
            self.graph.delete(key);
            return Ok(());
        }

        let mut result = Ok(());
        let mut retriable = false;

        if flags::is_available(node) {
            // unavailable already while removing so that dependents see it gone
            self.set_unavailable(key, true);

            if !args.is_derived {
                let derived: Vec<KvForTxn> = flags::derived_keys(self.graph, key)
                    .into_iter()
                    .map(|derived_key| KvForTxn {
                        key: derived_key,
                        value: None,
                        metadata: None,
                        origin: args.kv.origin,
                        is_revert: args.kv.is_revert,
                    })
                    .collect();
                if let Err(inherited) = self.apply_derived(derived, args, false, executed) {
                    // a derived value failed to be removed, the base stays
                    self.set_unavailable(key, false);
                    return Err(inherited);
                }
            }

            self.run_updates(key, args, executed);

            if !self.dry_run {
                if let Some(descriptor) = self.registry.for_key(key).cloned() {
                    if args.kv.origin != ValueOrigin::FromSb {
                        if let Some(node) = self.graph.node(key) {
                            if let Some(value) = node.value() {
                                result = skip_unimplemented(
                                    descriptor.delete(key, value, node.metadata()),
                                    args.is_derived,
                                );
                            }
                        }
                        if let Err(err) = &result {
                            retriable = is_retriable(descriptor.as_ref(), err);
                        }
                    }
                    if result.is_ok() && !self.is_derived_node(key) && descriptor.with_metadata()
                    {
                        self.graph.set_metadata(key, None);
                    }
                }
            }
        } else {
            // value was not applied, only the state changes
            op.noop = true;
        }

        match &result {
            Ok(()) => {
                self.set_error(key, None);
                if pending {
                    op.new_state = ValueState::Pending;
                    self.set_state(key, ValueState::Pending);
                } else {
                    op.new_state = ValueState::Removed;
                    if args.is_derived {
                        self.graph.delete(key);
                    } else {
                        self.set_state(key, ValueState::Removed);
                    }
                }
            }
            Err(err) => {
                // still applied in SB, a retry has to delete it again
                self.set_unavailable(key, false);
                op.new_err = Some(err.clone());
                op.new_state = self.mark_failed_value(key, args, err.clone(), retriable);
            }
        }
        executed.push(op);
        result
    }

    fn apply_add(
        &mut self,
        args: &ApplyArgs,
        mut op: RecordedTxnOp,
        executed: &mut Vec<RecordedTxnOp>,
    ) -> ApplyResult {
        let key = args.kv.key.as_str();
        let descriptor = self.registry.for_key(key).cloned();
        if let Some(node) = self.graph.node_mut(key) {
            node.set_value(args.kv.value.clone());
            if let Some(descriptor) = &descriptor {
                node.flags.descriptor = Some(descriptor.name().to_string());
                node.set_label(descriptor.key_label(key));
            }
        }

        let unimplemented =
            args.kv.origin == ValueOrigin::FromNb && !args.is_derived && descriptor.is_none();
        if unimplemented {
            if self.graph.node(key).map(|n| n.flags.state) == Some(ValueState::Unimplemented) {
                return Ok(());
            }
            self.set_unavailable(key, true);
            self.set_error(key, None);
            op.noop = true;
            op.new_state = ValueState::Unimplemented;
            self.set_state(key, ValueState::Unimplemented);
            executed.push(op);
            return Ok(());
        }

        if args.is_derived {
            if let Some(node) = self.graph.node_mut(key) {
                node.flags.derived_from = Some(args.base_key.clone());
            }
        }

        if let Err(err) = self.validate(args, descriptor.as_ref()) {
            self.set_unavailable(key, true);
            return self.reject_invalid(key, op, err, executed);
        }

        let derives = self.apply_new_relations(key, descriptor.as_ref(), args, executed)?;

        if !flags::is_ready(self.graph, key) {
            self.set_unavailable(key, true);
            self.set_error(key, None);
            op.new_state = ValueState::Pending;
            op.noop = true;
            self.set_state(key, ValueState::Pending);
            executed.push(op);
            return Ok(());
        }

        if let (false, Some(descriptor)) = (self.dry_run, &descriptor) {
            let added = if args.kv.origin != ValueOrigin::FromSb {
                match args.kv.value.as_ref() {
                    Some(value) => skip_unimplemented(descriptor.add(key, value), args.is_derived),
                    None => Ok(None),
                }
            } else {
                // already present in SB
                Ok(args.kv.metadata.clone())
            };
            match added {
                Ok(metadata) => {
                    if !args.is_derived && descriptor.with_metadata() {
                        self.graph.set_metadata_map(key, descriptor.name());
                        self.graph.set_metadata(key, metadata);
                    }
                }
                Err(err) => {
                    self.set_unavailable(key, true);
                    let retriable = is_retriable(descriptor.as_ref(), &err);
                    op.new_err = Some(err.clone());
                    op.new_state = self.mark_failed_value(key, args, err.clone(), retriable);
                    executed.push(op);
                    return Err(err);
                }
            }
        }

        self.set_error(key, None);
        self.set_unavailable(key, false);
        op.new_state = applied_state(args.kv.origin);
        self.set_state(key, op.new_state);
        executed.push(op);

        self.run_updates(key, args, executed);

        if !args.is_derived {
            let derived = derived_for_txn(derives, args);
            self.apply_derived(derived, args, true, executed)?;
        }
        Ok(())
    }

    fn apply_modify(
        &mut self,
        args: &ApplyArgs,
        mut op: RecordedTxnOp,
        executed: &mut Vec<RecordedTxnOp>,
    ) -> ApplyResult {
        let key = args.kv.key.as_str();
        let descriptor = self.registry.for_key(key).cloned();
        let prev_value = self.graph.node(key).and_then(|n| n.value().cloned());
        if let Some(node) = self.graph.node_mut(key) {
            node.set_value(args.kv.value.clone());
        }

        if let Err(err) = self.validate(args, descriptor.as_ref()) {
            self.set_unavailable(key, true);
            return self.reject_invalid(key, op, err, executed);
        }

        let equivalent = match (&descriptor, &prev_value, &args.kv.value) {
            (Some(descriptor), Some(prev), Some(new)) => descriptor.equivalent(key, prev, new),
            (_, prev, new) => prev == new,
        };

        let recreate = !equivalent
            && args.kv.origin != ValueOrigin::FromSb
            && match (&descriptor, &prev_value, &args.kv.value) {
                (Some(descriptor), Some(prev), Some(new)) => {
                    let metadata = self.graph.node(key).and_then(|n| n.metadata().cloned());
                    descriptor.modify_with_recreate(key, prev, new, metadata.as_ref())
                }
                _ => false,
            };

        if recreate {
            let mut del_op = op.clone();
            del_op.operation = TxnOperation::Delete;
            del_op.new_value = None;
            del_op.is_recreate = true;
            let mut add_op = op;
            add_op.operation = TxnOperation::Add;
            add_op.prev_value = None;
            add_op.is_recreate = true;

            // remove the obsolete revision first
            if let Some(node) = self.graph.node_mut(key) {
                node.set_value(prev_value);
            }
            self.apply_delete(args, del_op, false, executed)?;
            return self.apply_add(args, add_op, executed);
        }

        let derives = self.apply_new_relations(key, descriptor.as_ref(), args, executed)?;

        if !flags::is_ready(self.graph, key) {
            // new dependencies are not met: remove and keep pending with the new value
            if let Some(node) = self.graph.node_mut(key) {
                node.set_value(prev_value);
            }
            let result = self.apply_delete(args, op, true, executed);
            if let Some(node) = self.graph.node_mut(key) {
                node.set_value(args.kv.value.clone());
            }
            return result;
        }

        if let (false, false, Some(descriptor)) = (self.dry_run, equivalent, &descriptor) {
            let modified = if args.kv.origin != ValueOrigin::FromSb {
                match (&prev_value, &args.kv.value) {
                    (Some(prev), Some(new)) => {
                        let metadata = self.graph.node(key).and_then(|n| n.metadata().cloned());
                        skip_unimplemented(
                            descriptor.modify(key, prev, new, metadata.as_ref()),
                            args.is_derived,
                        )
                    }
                    _ => Ok(None),
                }
            } else {
                // already modified in SB
                Ok(args.kv.metadata.clone())
            };
            match modified {
                Ok(metadata) => {
                    if !args.is_derived && descriptor.with_metadata() {
                        self.graph.set_metadata(key, metadata);
                    }
                }
                Err(err) => {
                    let retriable = is_retriable(descriptor.as_ref(), &err);
                    op.new_err = Some(err.clone());
                    op.new_state = self.mark_failed_value(key, args, err.clone(), retriable);
                    executed.push(op);
                    // a failed value no longer satisfies its dependents
                    self.run_updates(key, args, executed);
                    return Err(err);
                }
            }
        }

        self.set_error(key, None);
        self.set_unavailable(key, false);
        op.new_state = applied_state(args.kv.origin);
        self.set_state(key, op.new_state);
        let recovered = !flags::is_applied_state(op.prev_state);

        if !equivalent || op.prev_state != op.new_state {
            // a found value confirmed by NB is not worth recording
            let confirms_in_sync = equivalent
                && op.prev_state == ValueState::Found
                && op.new_state == ValueState::Configured;
            if !confirms_in_sync {
                op.noop = equivalent;
                executed.push(op);
            }
        }

        if recovered {
            // dependents left pending by an earlier failure
            self.run_updates(key, args, executed);
        }

        if !args.is_derived {
            let derived = derived_for_txn(derives, args);
            self.apply_derived(derived, args, true, executed)?;
        }
        Ok(())
    }

    fn validate(&self, args: &ApplyArgs, descriptor: Option<&Arc<dyn Descriptor>>) -> ApplyResult {
        if self.dry_run || args.kv.origin != ValueOrigin::FromNb {
            return Ok(());
        }
        match (descriptor, &args.kv.value) {
            (Some(descriptor), Some(value)) => descriptor.validate(&args.kv.key, value),
            _ => Ok(()),
        }
    }

    fn reject_invalid(
        &mut self,
        key: &str,
        mut op: RecordedTxnOp,
        err: DescriptorError,
        executed: &mut Vec<RecordedTxnOp>,
    ) -> ApplyResult {
        op.new_err = Some(err.clone());
        op.new_state = ValueState::Invalid;
        op.noop = true;
        self.set_state(key, ValueState::Invalid);
        self.set_error(
            key,
            Some(NodeError {
                error: err.clone(),
                retriable: false,
            }),
        );
        executed.push(op);
        Err(err)
    }

    /// Replace relations of the node and remove derived values that are no
    /// longer derived. Returns the derived values of the new revision.
    fn apply_new_relations(
        &mut self,
        key: &str,
        descriptor: Option<&Arc<dyn Descriptor>>,
        args: &ApplyArgs,
        executed: &mut Vec<RecordedTxnOp>,
    ) -> Result<Vec<KeyValuePair>, DescriptorError> {
        let prev_derived: BTreeSet<String> =
            flags::derived_keys(self.graph, key).into_iter().collect();

        let value = self.graph.node(key).and_then(|n| n.value().cloned());
        let (dependencies, derives) = match (descriptor, &value) {
            (Some(descriptor), Some(value)) => {
                let derives = if args.is_derived {
                    Vec::new()
                } else {
                    descriptor.derived_values(key, value)
                };
                (descriptor.dependencies(key, value), derives)
            }
            _ => (Vec::new(), Vec::new()),
        };
        self.graph
            .set_targets(key, construct_targets(&dependencies, &derives));

        if args.is_derived {
            return Ok(derives);
        }

        let new_derived: BTreeSet<&str> = derives.iter().map(|kv| kv.key.as_str()).collect();
        let obsolete: Vec<KvForTxn> = prev_derived
            .into_iter()
            .filter(|k| !new_derived.contains(k.as_str()))
            .map(|k| KvForTxn {
                key: k,
                value: None,
                metadata: None,
                origin: args.kv.origin,
                is_revert: args.kv.is_revert,
            })
            .collect();
        self.apply_derived(obsolete, args, false, executed)?;
        Ok(derives)
    }

    /// Apply derived values of `args.kv`; returns the last error, if any
    fn apply_derived(
        &mut self,
        mut derived: Vec<KvForTxn>,
        args: &ApplyArgs,
        check: bool,
        executed: &mut Vec<RecordedTxnOp>,
    ) -> ApplyResult {
        derived.sort_by(|a, b| a.key.cmp(&b.key));
        let mut last_err = None;
        for kv in derived {
            if check && !self.valid_derived_kv(&kv) {
                continue;
            }
            let derived_args = ApplyArgs {
                kv,
                base_key: args.base_key.clone(),
                is_retry: args.is_retry,
                is_update: false,
                is_derived: true,
            };
            if let Err(err) = self.apply_value(&derived_args, executed) {
                last_err = Some(err);
            }
        }
        match last_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn valid_derived_kv(&self, kv: &KvForTxn) -> bool {
        if kv.value.is_none() {
            log::warn!("Txn {}: derived nil value for key {}", self.txn.seq_num, kv.key);
            return false;
        }
        if let Some(node) = self.graph.node(&kv.key) {
            if !node.flags.is_derived() {
                log::warn!(
                    "Txn {}: skipping derived value {} colliding with a base value",
                    self.txn.seq_num,
                    kv.key
                );
                return false;
            }
        }
        true
    }

    /// Re-evaluate NB values depending on `key`
    fn run_updates(&mut self, key: &str, args: &ApplyArgs, executed: &mut Vec<RecordedTxnOp>) {
        let dependents: Vec<ApplyArgs> = self
            .graph
            .sources(key, Relation::DependsOn)
            .into_iter()
            .filter(|n| n.flags.origin() == ValueOrigin::FromNb)
            .map(|n| {
                let value = match &n.flags.last_update {
                    Some(update) => update.value.clone(),
                    None => n.value().cloned(),
                };
                ApplyArgs {
                    kv: KvForTxn {
                        key: n.key().to_string(),
                        value,
                        metadata: None,
                        origin: ValueOrigin::FromNb,
                        is_revert: args.kv.is_revert,
                    },
                    base_key: flags::base_key(n),
                    is_retry: args.is_retry,
                    is_update: true,
                    is_derived: n.flags.is_derived(),
                }
            })
            .collect();

        for dependent in dependents {
            // failures are recorded with the dependent value
            let _ = self.apply_value(&dependent, executed);
        }
    }

    /// Set the value as failed or, if a retry is allowed, as retrying
    fn mark_failed_value(
        &mut self,
        key: &str,
        args: &ApplyArgs,
        err: DescriptorError,
        retriable: bool,
    ) -> ValueState {
        let mut state = ValueState::Failed;
        let to_be_reverted = self.txn.revert_on_failure() && !args.kv.is_revert;
        if retriable && !to_be_reverted {
            if let Some(node) = self.graph.node(key) {
                let base = flags::base_key(node);
                let retried = self
                    .txn
                    .retry()
                    .filter(|retry| retry.keys.contains_key(&base));
                let attempt = retried.map_or(1, |retry| retry.attempt + 1);
                let policy = node.flags.last_update.as_ref().and_then(|u| u.retry);
                if policy.map_or(false, |p| p.allows_attempt(attempt)) {
                    state = ValueState::Retrying;
                }
            }
        }
        self.set_state(key, state);
        self.set_error(
            key,
            Some(NodeError {
                error: err,
                retriable,
            }),
        );
        state
    }
}

fn is_retriable(descriptor: &dyn Descriptor, err: &DescriptorError) -> bool {
    !err.is_unimplemented() && descriptor.is_retriable_failure(err)
}

/// Derived values may leave SB callbacks unimplemented
fn skip_unimplemented<T: Default>(
    result: Result<T, DescriptorError>,
    is_derived: bool,
) -> Result<T, DescriptorError> {
    match result {
        Err(err) if is_derived && err.is_unimplemented() => Ok(T::default()),
        other => other,
    }
}

fn applied_state(origin: ValueOrigin) -> ValueState {
    if origin == ValueOrigin::FromSb {
        ValueState::Retrieved
    } else {
        ValueState::Configured
    }
}

fn derived_for_txn(derives: Vec<KeyValuePair>, args: &ApplyArgs) -> Vec<KvForTxn> {
    derives
        .into_iter()
        .map(|kv| KvForTxn {
            key: kv.key,
            value: kv.value,
            metadata: None,
            origin: args.kv.origin,
            is_revert: args.kv.is_revert,
        })
        .collect()
}

pub(crate) fn construct_targets(
    dependencies: &[Dependency],
    derives: &[KeyValuePair],
) -> Vec<RelationTarget> {
    let mut targets: Vec<RelationTarget> = dependencies
        .iter()
        .map(|dep| RelationTarget {
            relation: Relation::DependsOn,
            label: dep.label.clone(),
            target: dep.target.clone(),
        })
        .collect();
    targets.extend(
        derives
            .iter()
            .map(|kv| RelationTarget::key(Relation::Derives, kv.key.clone(), kv.key.clone())),
    );
    targets
}

/// Merge intermediate pending Add/Delete operations into the operation of
/// the same key that follows (Add) or precedes (Delete) them
pub(crate) fn compress_txn_ops(executed: Vec<RecordedTxnOp>) -> Vec<RecordedTxnOp> {
    let mut ops = executed;

    let mut adds: Vec<RecordedTxnOp> = Vec::with_capacity(ops.len());
    for i in 0..ops.len() {
        let op = &ops[i];
        let mut merged = false;
        if op.operation == TxnOperation::Add && op.new_state == ValueState::Pending {
            let later = (i + 1..ops.len()).find(|&j| ops[j].key == op.key);
            if let Some(j) = later {
                if ops[j].operation == TxnOperation::Add {
                    let (prev_value, prev_err, prev_state) =
                        (op.prev_value.clone(), op.prev_err.clone(), op.prev_state);
                    ops[j].prev_value = prev_value;
                    ops[j].prev_err = prev_err;
                    ops[j].prev_state = prev_state;
                    merged = true;
                }
            }
        }
        if !merged {
            adds.push(ops[i].clone());
        }
    }

    let mut keep = vec![true; adds.len()];
    for i in (0..adds.len()).rev() {
        if adds[i].operation != TxnOperation::Delete || adds[i].prev_state != ValueState::Pending {
            continue;
        }
        let earlier = (0..i).rev().find(|&j| keep[j] && adds[j].key == adds[i].key);
        if let Some(j) = earlier {
            if adds[j].operation == TxnOperation::Delete {
                let (new_value, new_err, new_state) = (
                    adds[i].new_value.clone(),
                    adds[i].new_err.clone(),
                    adds[i].new_state,
                );
                adds[j].new_value = new_value;
                adds[j].new_err = new_err;
                adds[j].new_state = new_state;
                keep[i] = false;
            }
        }
    }

    adds.into_iter()
        .zip(keep)
        .filter_map(|(op, keep)| keep.then_some(op))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reconcile_api::Value;

    fn op(operation: TxnOperation, key: &str, prev: ValueState, new: ValueState) -> RecordedTxnOp {
        RecordedTxnOp {
            operation,
            key: key.into(),
            prev_state: prev,
            new_state: new,
            ..Default::default()
        }
    }

    #[test]
    fn test_compress_pending_add() {
        let ops = vec![
            op(TxnOperation::Add, "rule/x", ValueState::NonExistent, ValueState::Pending),
            op(TxnOperation::Add, "iface/a", ValueState::NonExistent, ValueState::Configured),
            op(TxnOperation::Add, "rule/x", ValueState::Pending, ValueState::Configured),
        ];
        let compressed = compress_txn_ops(ops);
        assert_eq!(compressed.len(), 2);
        assert_eq!(compressed[0].key, "iface/a");
        assert_eq!(compressed[1].key, "rule/x");
        assert_eq!(compressed[1].prev_state, ValueState::NonExistent);
        assert_eq!(compressed[1].new_state, ValueState::Configured);
    }

    #[test]
    fn test_compress_pending_delete() {
        let ops = vec![
            op(TxnOperation::Delete, "rule/x", ValueState::Configured, ValueState::Pending),
            op(TxnOperation::Delete, "iface/a", ValueState::Configured, ValueState::Removed),
            op(TxnOperation::Delete, "rule/x", ValueState::Pending, ValueState::Removed),
        ];
        let compressed = compress_txn_ops(ops);
        assert_eq!(compressed.len(), 2);
        assert_eq!(compressed[0].key, "rule/x");
        assert_eq!(compressed[0].prev_state, ValueState::Configured);
        assert_eq!(compressed[0].new_state, ValueState::Removed);
        assert_eq!(compressed[1].key, "iface/a");
    }

    #[test]
    fn test_unrelated_ops_untouched() {
        let ops = vec![
            op(TxnOperation::Add, "a", ValueState::NonExistent, ValueState::Pending),
            op(TxnOperation::Modify, "a", ValueState::Pending, ValueState::Configured),
            op(TxnOperation::Delete, "b", ValueState::Pending, ValueState::Removed),
        ];
        assert_eq!(compress_txn_ops(ops).len(), 3);
    }

    #[test]
    fn test_construct_targets() {
        let targets = construct_targets(
            &[Dependency::on_key("iface", "iface/a")],
            &[KeyValuePair::new("iface/a/ip", Value::Null)],
        );
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].relation, Relation::DependsOn);
        assert_eq!(targets[0].label, "iface");
        assert_eq!(targets[1].relation, Relation::Derives);
        assert_eq!(targets[1].target_key(), Some("iface/a/ip"));
    }
}
