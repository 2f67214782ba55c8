//! Transaction consumer
//!
//! Drains the queue on the `reconcile-txn` thread. Every transaction goes
//! through the same steps while holding the transaction lock:
//!
//! 1. pre-processing (sequence number, resync refresh, stale retries and
//!    notifications filtered out)
//! 2. ordering (deletes, recreates, adds, modifies)
//! 3. simulation on a clone of the graph, giving the planned operations
//! 4. execution against the real graph and descriptors
//! 5. recording into the history
//! 6. post-processing (refresh of failed values, retry scheduling,
//!    verification, status updates, result for a blocking committer)

use crate::exec::Executor;
use crate::flags::{self, SchedGraph};
use crate::queue::{KvForTxn, QueueItem, RetryOps, Transaction, TxnArgs};
use crate::refresh::{self, ResyncData};
use crate::registry::Registry;
use crate::Shared;
use crossbeam_channel::{select, Sender};
use reconcile_api::{
    DescriptorError, KeyWithError, RecordedKvPair, RecordedTxn, RecordedTxnOp, ResyncType,
    TransactionError, TxnOperation, ValueOrigin, ValueState, VerificationError,
    VerificationErrorKind,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

pub(crate) struct Processor {
    shared: Arc<Shared>,
    retry_tx: Sender<RetryOps>,
    /// Sequence number of the next transaction
    next_seq: u64,
    resync_count: u64,
}

impl Processor {
    pub fn new(shared: Arc<Shared>, retry_tx: Sender<RetryOps>) -> Self {
        Self {
            shared,
            retry_tx,
            next_seq: 1,
            resync_count: 0,
        }
    }

    /// Process queued items until the scheduler closes
    pub fn run(mut self) {
        let queue = self.shared.queue.receiver().clone();
        let shutdown = self.shared.shutdown.clone();
        loop {
            select! {
                recv(queue) -> item => match item {
                    Ok(QueueItem::Txn(txn)) => {
                        self.process(txn);
                        log::trace!("{} item(s) left in the queue", self.shared.queue.len());
                    }
                    Ok(QueueItem::Barrier(ack)) => {
                        let _ = ack.send(());
                    }
                    Err(_) => break,
                },
                recv(shutdown) -> _ => break,
            }
        }
        log::debug!("Transaction consumer stopped");
    }

    fn process(&mut self, mut txn: Transaction) {
        let shared = Arc::clone(&self.shared);
        let _txn_lock = shared.txn_lock.lock();
        let registry = shared.registry.read();
        let start = SystemTime::now();
        let mut updated = BTreeSet::new();

        txn.seq_num = self.next_seq;
        self.next_seq += 1;

        let skip = self.pre_process(&mut txn, &registry, &mut updated);
        if !skip {
            let values = std::mem::take(&mut txn.values);
            txn.values = order_values(&registry, &shared.graph.read(), values);
        }

        let planned = if skip {
            Vec::new()
        } else {
            let mut simulated = shared.graph.read().clone();
            let mut ignored = BTreeSet::new();
            Executor::new(&registry, &mut simulated, &txn, true, &mut ignored).execute()
        };

        let mut record = pre_record(&txn, planned);
        log::debug!("Transaction #{} ({}) planned:\n{}", txn.seq_num, txn.txn_type(), record);

        let executed = if skip {
            Vec::new()
        } else {
            let mut graph = shared.graph.write();
            Executor::new(&registry, &mut graph, &txn, false, &mut updated).execute()
        };

        record.pre_record = false;
        record.start = start;
        record.stop = SystemTime::now();
        record.executed = executed.clone();
        log::debug!("Transaction #{} executed:\n{:#}", txn.seq_num, record);
        {
            let mut history = shared.history.lock();
            history.append(record);
            log::trace!("History holds {} record(s)", history.len());
        }

        self.post_process(&txn, &registry, &executed, updated);
    }

    /// Returns true when there is nothing to execute
    fn pre_process(
        &mut self,
        txn: &mut Transaction,
        registry: &Registry,
        updated: &mut BTreeSet<String>,
    ) -> bool {
        match &txn.args {
            TxnArgs::Sb => match txn.values.first() {
                Some(kv) => self.filter_notification(registry, &kv.key, txn.seq_num),
                None => true,
            },
            TxnArgs::Nb(nb) if nb.resync.is_resync() => {
                let (resync, verbose) = (nb.resync, nb.verbose);
                self.pre_process_resync(txn, resync, verbose, registry, updated)
            }
            TxnArgs::Nb(_) => false,
            TxnArgs::Retry(retry) => {
                let graph = self.shared.graph.read();
                let mut values = Vec::new();
                for (key, failed_seq) in &retry.keys {
                    let Some(update) = graph.node(key).and_then(|n| n.flags.last_update.as_ref())
                    else {
                        continue;
                    };
                    if update.txn_seq > *failed_seq {
                        // changed since the failure
                        continue;
                    }
                    values.push(KvForTxn {
                        key: key.clone(),
                        value: update.value.clone(),
                        metadata: None,
                        origin: ValueOrigin::FromNb,
                        is_revert: update.revert,
                    });
                }
                drop(graph);
                txn.values = values;
                txn.values.is_empty()
            }
        }
    }

    /// Whether an SB notification should be ignored
    fn filter_notification(&self, registry: &Registry, key: &str, seq_num: u64) -> bool {
        if registry.for_key(key).is_none() {
            log::debug!("Txn {}: ignoring unimplemented notification for {}", seq_num, key);
            return true;
        }
        let graph = self.shared.graph.read();
        if graph.node(key).map(|n| n.flags.origin()) == Some(ValueOrigin::FromNb) {
            log::debug!("Txn {}: ignoring notification for NB-managed {}", seq_num, key);
            return true;
        }
        false
    }

    fn pre_process_resync(
        &mut self,
        txn: &mut Transaction,
        resync: ResyncType,
        verbose: bool,
        registry: &Registry,
        updated: &mut BTreeSet<String>,
    ) -> bool {
        let mut graph = self.shared.graph.write();
        self.resync_count += 1;

        if resync == ResyncType::DownstreamResync {
            // the engine is assumed to be in sync with NB
            for node in graph.nodes().filter(|n| flags::is_nb_base(n)) {
                if let Some(update) = &node.flags.last_update {
                    txn.values.push(KvForTxn {
                        key: node.key().to_string(),
                        value: update.value.clone(),
                        metadata: None,
                        origin: ValueOrigin::FromNb,
                        is_revert: update.revert,
                    });
                }
            }
        }

        let nb_keys: BTreeSet<String> = txn.values.iter().map(|kv| kv.key.clone()).collect();

        if resync != ResyncType::UpstreamResync {
            if verbose {
                log::info!("Graph before refresh:\n{}", *graph);
            }
            let resync_data = ResyncData {
                first: self.resync_count == 1,
                values: &txn.values,
            };
            refresh::refresh_graph(registry, &mut graph, None, Some(&resync_data), verbose, updated);
            if verbose {
                log::info!("Graph after refresh:\n{}", *graph);
            }
        }

        // NB values no longer requested
        let obsolete: Vec<KvForTxn> = graph
            .nodes()
            .filter(|n| flags::is_nb_base(n) && !nb_keys.contains(n.key()))
            .map(|n| KvForTxn::from_nb(n.key(), None))
            .collect();
        txn.values.extend(obsolete);

        // SB values are recorded as they are
        let retrieved: Vec<KvForTxn> = graph
            .nodes()
            .filter(|n| flags::is_sb_base(n) && !nb_keys.contains(n.key()))
            .map(|n| KvForTxn {
                key: n.key().to_string(),
                value: n.value().cloned(),
                metadata: None,
                origin: ValueOrigin::FromSb,
                is_revert: false,
            })
            .collect();
        txn.values.extend(retrieved);

        txn.values.is_empty()
    }

    fn post_process(
        &mut self,
        txn: &Transaction,
        registry: &Registry,
        executed: &[RecordedTxnOp],
        mut updated: BTreeSet<String>,
    ) {
        let verify = self.shared.config.verify_mode;
        let mut to_refresh = BTreeSet::new();
        let mut to_retry = BTreeSet::new();
        let mut verbose = false;
        {
            let graph = self.shared.graph.read();
            for op in executed {
                let Some(node) = graph.node(&op.key) else {
                    continue;
                };
                let base = flags::base_key(node);
                match node.flags.state {
                    ValueState::Unimplemented => continue,
                    ValueState::Failed => {
                        to_refresh.insert(base.clone());
                        verbose = true;
                    }
                    ValueState::Retrying => {
                        to_refresh.insert(base.clone());
                        to_retry.insert(base.clone());
                        verbose = true;
                    }
                    _ => {}
                }
                if verify {
                    to_refresh.insert(base);
                }
            }
        }

        if !to_refresh.is_empty() {
            let mut graph = self.shared.graph.write();
            refresh::refresh_graph(registry, &mut graph, Some(&to_refresh), None, verbose, &mut updated);
            for retry in group_retries(txn, &graph, &to_retry) {
                log::debug!(
                    "Scheduling retry #{} of {} value(s) from txn {} in {:?}",
                    retry.attempt,
                    retry.keys.len(),
                    retry.txn_seq,
                    retry.delay
                );
                if self.retry_tx.send(retry).is_err() {
                    log::warn!("Retry timer stopped, failed values will not be retried");
                }
            }
        }

        let (statuses, removed): (Vec<_>, Vec<_>) = {
            let graph = self.shared.graph.read();
            let statuses: Vec<_> = updated
                .iter()
                .map(|key| flags::value_status(&graph, key))
                .collect();
            let removed = statuses
                .iter()
                .filter(|s| s.state() == ValueState::Removed)
                .map(|s| s.key().to_string())
                .collect();
            (statuses, removed)
        };

        let mut kv_errors = if verify {
            verification_errors(registry, &self.shared.graph.read(), executed)
        } else {
            Vec::new()
        };
        kv_errors.extend(executed.iter().filter_map(|op| {
            op.new_err.as_ref().map(|err| KeyWithError {
                key: op.key.clone(),
                operation: op.operation,
                error: err.clone(),
            })
        }));
        let outcome = if kv_errors.is_empty() {
            Ok(txn.seq_num)
        } else {
            Err(TransactionError::with_kv_errors(txn.seq_num, kv_errors))
        };

        match txn.nb().and_then(|nb| nb.result_tx.as_ref()) {
            Some(result_tx) => {
                if result_tx.try_send(outcome).is_err() {
                    log::warn!("Txn {}: failed to deliver result to the caller", txn.seq_num);
                }
            }
            None => match outcome {
                Ok(seq_num) => log::info!("Transaction {} successful", seq_num),
                Err(err) => log::error!("Transaction {} failed: {}", txn.seq_num, err),
            },
        }

        self.shared.watchers.notify(&statuses);

        // removed values are dropped once watchers were told
        if !removed.is_empty() {
            let mut graph = self.shared.graph.write();
            for key in removed {
                if graph.node(&key).map(|n| n.flags.state) == Some(ValueState::Removed) {
                    graph.delete(&key);
                }
            }
        }
    }
}

/// Sort values by key, then group them as deletes, recreates, adds and modifies
pub(crate) fn order_values(
    registry: &Registry,
    graph: &SchedGraph,
    mut values: Vec<KvForTxn>,
) -> Vec<KvForTxn> {
    values.sort_by(|a, b| a.key.cmp(&b.key));
    let (mut deletes, mut recreates, mut adds, mut modifies) =
        (Vec::new(), Vec::new(), Vec::new(), Vec::new());

    for kv in values {
        let current = graph
            .node(&kv.key)
            .filter(|n| flags::is_available(n))
            .and_then(|n| n.value().map(|v| (v, n.metadata())));
        match (&kv.value, current) {
            (None, _) => deletes.push(kv),
            (Some(new), Some((old, metadata))) => {
                let recreate = registry.for_key(&kv.key).map_or(false, |d| {
                    !d.equivalent(&kv.key, old, new)
                        && d.modify_with_recreate(&kv.key, old, new, metadata)
                });
                if recreate {
                    recreates.push(kv);
                } else {
                    modifies.push(kv);
                }
            }
            (Some(_), None) => adds.push(kv),
        }
    }

    deletes
        .into_iter()
        .chain(recreates)
        .chain(adds)
        .chain(modifies)
        .collect()
}

fn pre_record(txn: &Transaction, planned: Vec<RecordedTxnOp>) -> RecordedTxn {
    let resync_type = txn.resync();
    let values = if resync_type == ResyncType::DownstreamResync {
        Vec::new()
    } else {
        let mut values: Vec<RecordedKvPair> = txn
            .values
            .iter()
            .map(|kv| RecordedKvPair {
                key: kv.key.clone(),
                value: kv.value.clone(),
                origin: kv.origin,
            })
            .collect();
        values.sort_by(|a, b| a.key.cmp(&b.key));
        values
    };
    let now = SystemTime::now();
    RecordedTxn {
        pre_record: true,
        start: now,
        stop: now,
        seq_num: txn.seq_num,
        txn_type: txn.txn_type(),
        resync_type,
        description: txn.nb().and_then(|nb| nb.description.clone()),
        retry_for_txn: txn.retry().map(|r| r.txn_seq),
        retry_attempt: txn.retry().map_or(0, |r| r.attempt),
        values,
        planned,
        executed: Vec::new(),
    }
}

/// Group retrying values by (failing transaction, delay, attempt)
fn group_retries(txn: &Transaction, graph: &SchedGraph, keys: &BTreeSet<String>) -> Vec<RetryOps> {
    let mut groups: BTreeMap<(u64, Duration, u32), BTreeMap<String, u64>> = BTreeMap::new();
    for key in keys {
        let Some(node) = graph.node(key) else {
            continue;
        };
        if node.flags.error.as_ref().map_or(false, |e| !e.retriable) {
            continue;
        }
        let Some(update) = node.flags.last_update.as_ref() else {
            continue;
        };
        let Some(policy) = update.retry else {
            continue;
        };
        let retried = txn.retry().filter(|retry| retry.keys.contains_key(key));
        let delay = policy.next_delay(retried.map(|r| r.delay));
        let attempt = retried.map_or(1, |r| r.attempt + 1);
        let origin_seq = retried.map_or(txn.seq_num, |r| r.txn_seq);
        groups
            .entry((origin_seq, delay, attempt))
            .or_default()
            .insert(key.clone(), update.txn_seq);
    }
    groups
        .into_iter()
        .map(|((txn_seq, delay, attempt), keys)| RetryOps {
            txn_seq,
            keys,
            delay,
            attempt,
        })
        .collect()
}

/// Compare refreshed values with the values last applied by the transaction
fn verification_errors(
    registry: &Registry,
    graph: &SchedGraph,
    executed: &[RecordedTxnOp],
) -> Vec<KeyWithError> {
    let mut errors = Vec::new();
    for op in executed {
        let Some(node) = graph.node(&op.key) else {
            continue;
        };
        let state = node.flags.state;
        if matches!(
            state,
            ValueState::Failed | ValueState::Retrying | ValueState::Unimplemented
        ) {
            // effects are uncertain
            continue;
        }
        let expected = node.flags.last_update.as_ref().and_then(|u| u.value.as_ref());
        let available = flags::is_available(node);
        let expect_absent =
            expected.is_none() || matches!(state, ValueState::Pending | ValueState::Invalid);

        let kind = if expect_absent && available {
            Some(VerificationErrorKind::ExpectedToNotExist)
        } else if expect_absent {
            None
        } else if !available {
            Some(VerificationErrorKind::ExpectedToExist)
        } else {
            match (expected, node.value()) {
                (Some(expected), Some(actual)) => {
                    let equivalent = match registry.for_key(&op.key) {
                        Some(descriptor) => descriptor.equivalent(&op.key, actual, expected),
                        None => actual == expected,
                    };
                    if !equivalent {
                        log::warn!(
                            "Applied value of {} ({}) differs from refreshed value ({})",
                            op.key,
                            expected,
                            actual
                        );
                    }
                    (!equivalent).then_some(VerificationErrorKind::NotEquivalent)
                }
                _ => None,
            }
        };

        if let Some(kind) = kind {
            let operation = match node.flags.last_operation() {
                TxnOperation::Undefined => op.operation,
                operation => operation,
            };
            errors.push(KeyWithError {
                key: op.key.clone(),
                operation,
                error: DescriptorError::from(VerificationError {
                    key: op.key.clone(),
                    kind,
                }),
            });
        }
    }
    errors
}
