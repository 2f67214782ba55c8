//! NB transactions and wait cancellation

use crate::queue::{KvForTxn, NbTxnArgs, QueueItem, Transaction, TxnArgs, TxnOutcome};
use crate::Shared;
use crossbeam_channel::{bounded, never, select, Receiver, Sender, TryRecvError};
use reconcile_api::{
    CommitOptions, ResyncType, TransactionError, TxnInitError, Value,
};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Create a linked cancel handle and token.
///
/// The token is canceled once the handle is canceled or dropped.
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = bounded(0);
    (CancelHandle { _tx: tx }, CancelToken { rx })
}

/// Cancels the linked [`CancelToken`]s when canceled or dropped
pub struct CancelHandle {
    _tx: Sender<()>,
}

impl CancelHandle {
    pub fn cancel(self) {}
}

/// Bounds how long a blocking commit waits for its result
#[derive(Clone)]
pub struct CancelToken {
    rx: Receiver<()>,
}

impl CancelToken {
    pub fn is_canceled(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }
}

/// A set of NB value changes committed together.
///
/// Setting the same key twice keeps the last value.
pub struct Txn {
    shared: Arc<Shared>,
    values: BTreeMap<String, Option<Value>>,
}

impl Txn {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            values: BTreeMap::new(),
        }
    }

    /// Request the key to have the given value
    pub fn set_value(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.values.insert(key.into(), Some(value.into()));
        self
    }

    /// Request removal of the key
    pub fn delete_value(&mut self, key: impl Into<String>) -> &mut Self {
        self.values.insert(key.into(), None);
        self
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Queue the transaction.
    ///
    /// A blocking commit waits until the transaction is processed and
    /// returns its sequence number; a non-blocking commit returns `None`
    /// as soon as the transaction is queued.
    pub fn commit(self, options: CommitOptions) -> Result<Option<u64>, TransactionError> {
        self.commit_inner(options, None)
    }

    /// Like [`commit`](Self::commit), but stops waiting once `cancel` is
    /// canceled. The transaction itself still runs to completion.
    pub fn commit_with_cancel(
        self,
        options: CommitOptions,
        cancel: &CancelToken,
    ) -> Result<Option<u64>, TransactionError> {
        self.commit_inner(options, Some(cancel))
    }

    fn commit_inner(
        self,
        options: CommitOptions,
        cancel: Option<&CancelToken>,
    ) -> Result<Option<u64>, TransactionError> {
        if options.resync() == ResyncType::DownstreamResync && !self.values.is_empty() {
            return Err(TxnInitError::CombinedDownstreamResyncWithChange.into());
        }
        if options.revert_on_failure() && options.resync().is_resync() {
            return Err(TxnInitError::RevertNotSupportedWithResync.into());
        }

        let blocking = !options.is_non_blocking();
        let (result_tx, result_rx) = if blocking {
            let (tx, rx) = bounded::<TxnOutcome>(1);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let retry = options.retry().map(|policy| {
            if policy.period_ms == 0 {
                self.shared.config.default_retry
            } else {
                policy
            }
        });

        let txn = Transaction {
            seq_num: 0,
            args: TxnArgs::Nb(NbTxnArgs {
                resync: options.resync(),
                verbose: options.verbose_resync(),
                retry,
                revert: options.revert_on_failure(),
                description: options.description().map(str::to_string),
                result_tx,
            }),
            values: self
                .values
                .into_iter()
                .map(|(key, value)| KvForTxn::from_nb(key, value))
                .collect(),
        };
        self.shared.queue.push(QueueItem::Txn(txn))?;

        let Some(result_rx) = result_rx else {
            return Ok(None);
        };
        let cancel_rx = match cancel {
            Some(token) => token.rx.clone(),
            None => never(),
        };
        select! {
            recv(result_rx) -> outcome => match outcome {
                Ok(Ok(seq_num)) => Ok(Some(seq_num)),
                Ok(Err(err)) => Err(err),
                Err(_) => Err(TxnInitError::Closed.into()),
            },
            recv(cancel_rx) -> _ => Err(TxnInitError::WaitCanceled.into()),
            recv(self.shared.shutdown) -> _ => Err(TxnInitError::Closed.into()),
        }
    }
}
