//! # Reconcile Kernel
//!
//! The [`Scheduler`] keeps the southbound (SB) in sync with the state
//! requested by the northbound (NB). It orchestrates:
//! - Descriptor registration and key-space ownership
//! - Transaction planning (dry run) and execution
//! - Dependency tracking with pending values restored automatically
//! - Resync against SB dumps
//! - Retry and revert of failed operations
//! - Value status watching and transaction history
//!
//! ## Architecture
//!
//! ```text
//! Txn::commit ──┐
//! SB notify ────┼──► Txn Queue ──► reconcile-txn ──► Descriptors ──► SB
//! Retry timer ──┘                      │
//!       ▲                              ├──► Graph (values, edges, metadata)
//!       └────── failed values ─────────┤
//!                                      └──► History + status watchers
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Single writer** - one transaction is processed at a time
//! 2. **Dependencies first** - a value is added only once its dependencies are available
//! 3. **Derived values follow their base** - never present without it
//! 4. **NB owns its keys** - SB notifications never override NB values

pub mod config;
pub mod error;
mod exec;
mod flags;
mod history;
mod process;
mod queue;
mod refresh;
mod registry;
mod retry;
mod txn;
mod watch;

pub use config::{ConfigError, ConfigResult, SchedulerConfig};
pub use error::{RegistryError, SchedulerError, SchedulerResult};
pub use txn::{cancel_pair, CancelHandle, CancelToken, Txn};

use crossbeam_channel::{bounded, select, Receiver, Sender};
use flags::SchedGraph;
use history::TxnHistory;
use parking_lot::{Mutex, RwLock};
use queue::{KvForTxn, QueueItem, RetryOps, Transaction, TxnArgs, TxnQueue};
use reconcile_api::{
    BaseValueStatus, Descriptor, DescriptorError, KeySelector, KvWithMetadata, Metadata,
    MetadataMapView, RecordedTxn, Value, ValueOrigin, ValueState, View,
};
use registry::Registry;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::SystemTime;
use watch::Watchers;

/// State shared between the scheduler handle and its threads
pub(crate) struct Shared {
    pub config: SchedulerConfig,
    pub registry: RwLock<Registry>,
    pub graph: RwLock<SchedGraph>,
    /// Held while a transaction is processed
    pub txn_lock: Mutex<()>,
    pub history: Mutex<TxnHistory>,
    pub watchers: Watchers,
    pub queue: TxnQueue,
    /// Disconnected when the scheduler closes
    pub shutdown: Receiver<()>,
}

/// The reconcile engine
pub struct Scheduler {
    shared: Arc<Shared>,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Create the scheduler and start its threads
    pub fn new(config: SchedulerConfig) -> SchedulerResult<Self> {
        let (shutdown_tx, shutdown) = bounded(0);
        let (retry_tx, retry_rx) = crossbeam_channel::unbounded::<RetryOps>();

        let shared = Arc::new(Shared {
            registry: RwLock::new(Registry::new()),
            graph: RwLock::new(SchedGraph::new()),
            txn_lock: Mutex::new(()),
            history: Mutex::new(TxnHistory::new(&config)),
            watchers: Watchers::new(),
            queue: TxnQueue::new(config.queue_capacity),
            shutdown,
            config,
        });

        let scheduler = Self {
            shared: Arc::clone(&shared),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            threads: Mutex::new(Vec::new()),
        };

        let consumer_shared = Arc::clone(&shared);
        let consumer = thread::Builder::new()
            .name("reconcile-txn".to_string())
            .spawn(move || process::Processor::new(consumer_shared, retry_tx).run())?;
        scheduler.threads.lock().push(consumer);

        let timer_shared = Arc::clone(&shared);
        let timer = thread::Builder::new()
            .name("reconcile-retry".to_string())
            .spawn(move || retry::run(timer_shared, retry_rx))?;
        scheduler.threads.lock().push(timer);

        log::info!(
            "Scheduler started (queue capacity {})",
            shared.config.queue_capacity
        );
        Ok(scheduler)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    /// Register a descriptor for a new key space
    pub fn register_descriptor(&self, descriptor: Arc<dyn Descriptor>) -> SchedulerResult<()> {
        let _txn = self.shared.txn_lock.lock();
        let mut graph = self.shared.graph.write();
        self.shared
            .registry
            .write()
            .register(descriptor.clone(), graph.keys())?;
        if descriptor.with_metadata() {
            graph.register_metadata_map(descriptor.name(), descriptor.metadata_map_factory());
        }
        log::info!("Descriptor {} registered", descriptor.name());
        Ok(())
    }

    /// NB key prefixes of the registered descriptors
    pub fn registered_nb_key_prefixes(&self) -> Vec<String> {
        self.shared.registry.read().nb_key_prefixes()
    }

    /// Start building a new NB transaction
    pub fn start_nb_transaction(&self) -> Txn {
        Txn::new(Arc::clone(&self.shared))
    }

    /// Report a change that happened in SB without being requested
    pub fn push_sb_notification(
        &self,
        key: impl Into<String>,
        value: Option<Value>,
        metadata: Option<Metadata>,
    ) -> SchedulerResult<()> {
        let txn = Transaction {
            seq_num: 0,
            args: TxnArgs::Sb,
            values: vec![KvForTxn {
                key: key.into(),
                value,
                metadata,
                origin: ValueOrigin::FromSb,
                is_revert: false,
            }],
        };
        self.shared.queue.push(QueueItem::Txn(txn))?;
        Ok(())
    }

    /// Wait until every transaction queued before this call was processed
    pub fn transaction_barrier(&self) -> SchedulerResult<()> {
        if self.shared.queue.is_closed() {
            return Err(SchedulerError::Closed);
        }
        let (ack_tx, ack_rx) = bounded(1);
        select! {
            send(self.shared.queue.sender(), QueueItem::Barrier(ack_tx)) -> res => {
                if res.is_err() {
                    return Err(SchedulerError::Closed);
                }
            }
            recv(self.shared.shutdown) -> _ => return Err(SchedulerError::Closed),
        }
        select! {
            recv(ack_rx) -> res => res.map_err(|_| SchedulerError::Closed),
            recv(self.shared.shutdown) -> _ => Err(SchedulerError::Closed),
        }
    }

    /// Read-only view of the metadata map of a descriptor
    pub fn metadata_map(&self, descriptor: &str) -> Option<MetadataMapView> {
        self.shared
            .graph
            .read()
            .metadata_map(descriptor)
            .map(MetadataMapView::new)
    }

    /// Current status of a value and its derived values
    pub fn value_status(&self, key: &str) -> BaseValueStatus {
        flags::value_status(&self.shared.graph.read(), key)
    }

    /// Deliver status changes of matching non-derived values to `channel`.
    ///
    /// Delivery never blocks the scheduler: updates that do not fit into the
    /// channel are dropped with a warning.
    pub fn watch_value_status(
        &self,
        channel: Sender<BaseValueStatus>,
        selector: Option<KeySelector>,
    ) {
        let _txn = self.shared.txn_lock.lock();
        self.shared.watchers.add(channel, selector);
        log::debug!("Status watcher added ({} total)", self.shared.watchers.len());
    }

    /// Records of transactions started within `[since, until]`
    pub fn transaction_history(
        &self,
        since: Option<SystemTime>,
        until: Option<SystemTime>,
    ) -> Vec<RecordedTxn> {
        self.shared.history.lock().range(since, until)
    }

    pub fn recorded_transaction(&self, seq_num: u64) -> Option<RecordedTxn> {
        self.shared.history.lock().by_seq(seq_num)
    }

    /// Dump values of a descriptor from the given point of view
    pub fn dump_values_by_descriptor(
        &self,
        descriptor: &str,
        view: View,
    ) -> SchedulerResult<Vec<KvWithMetadata>> {
        let handler = self
            .shared
            .registry
            .read()
            .get(descriptor)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownDescriptor(descriptor.to_string()))?;

        match view {
            View::NbView => {
                let graph = self.shared.graph.read();
                Ok(graph
                    .nodes()
                    .filter(|n| {
                        n.flags.descriptor.as_deref() == Some(descriptor) && flags::is_nb_base(n)
                    })
                    .filter_map(|n| {
                        let value = n.flags.last_update.as_ref()?.value.clone()?;
                        Some(KvWithMetadata {
                            key: n.key().to_string(),
                            value: Some(value),
                            metadata: None,
                            origin: ValueOrigin::FromNb,
                        })
                    })
                    .collect())
            }
            View::InternalView => Ok(flags::correlate_values(
                &self.shared.graph.read(),
                descriptor,
            )),
            View::SbView => {
                let _txn = self.shared.txn_lock.lock();
                let correlate = flags::correlate_values(&self.shared.graph.read(), descriptor);
                handler.dump(&correlate).map_err(|err| match err {
                    DescriptorError::DumpUnimplemented => {
                        SchedulerError::DumpNotSupported(descriptor.to_string())
                    }
                    err => SchedulerError::Dump(err),
                })
            }
        }
    }

    /// Like [`dump_values_by_descriptor`](Self::dump_values_by_descriptor),
    /// with the descriptor selected by its NB key prefix
    pub fn dump_values_by_key_prefix(
        &self,
        prefix: &str,
        view: View,
    ) -> SchedulerResult<Vec<KvWithMetadata>> {
        let name = self
            .shared
            .registry
            .read()
            .for_nb_key_prefix(prefix)
            .map(|d| d.name().to_string())
            .ok_or_else(|| SchedulerError::UnknownKeyPrefix(prefix.to_string()))?;
        self.dump_values_by_descriptor(&name, view)
    }

    /// Render the graph for diagnostics
    pub fn graph_dump(&self) -> String {
        let graph = self.shared.graph.read();
        if graph.is_empty() {
            return "<EMPTY>\n".to_string();
        }
        let mut out = String::new();
        for node in graph.nodes() {
            let flags = &node.flags;
            out.push_str(&format!("- key: {} [{}]\n", node.key(), flags.state));
            if let Some(value) = node.value() {
                out.push_str(&format!("  value: {}\n", value));
            }
            if let Some(descriptor) = &flags.descriptor {
                out.push_str(&format!("  descriptor: {}\n", descriptor));
            }
            if let Some(base) = &flags.derived_from {
                out.push_str(&format!("  derived-from: {}\n", base));
            }
            if flags.unavailable {
                out.push_str("  unavailable\n");
            }
            if let Some(err) = flags.error_string() {
                out.push_str(&format!("  error: {}\n", err));
            }
            for target in graph.targets(node.key(), reconcile_graph::Relation::DependsOn) {
                let keys: Vec<&str> = target.nodes.iter().map(|n| n.key()).collect();
                out.push_str(&format!("  depends-on {}: [{}]\n", target.label, keys.join(", ")));
            }
            for target in graph.targets(node.key(), reconcile_graph::Relation::Derives) {
                out.push_str(&format!("  derives: {}\n", target.label));
            }
        }
        out
    }

    /// Number of non-derived values in the given state
    pub fn count_in_state(&self, state: ValueState) -> usize {
        self.shared
            .graph
            .read()
            .nodes()
            .filter(|n| !n.flags.is_derived() && n.flags.state == state)
            .count()
    }

    /// Stop processing; queued transactions are dropped
    pub fn close(&self) {
        if self.shared.queue.is_closed() {
            return;
        }
        self.shared.queue.close();
        self.shutdown_tx.lock().take();

        let handles: Vec<JoinHandle<()>> = self.threads.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                log::error!("Scheduler thread panicked");
            }
        }
        log::info!("Scheduler closed");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.close();
    }
}
