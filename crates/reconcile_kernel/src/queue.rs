//! Transaction queue
//!
//! All transactions (NB commits, SB notifications, retries) and barriers are
//! serialized through one bounded channel drained by the consumer thread.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use reconcile_api::{
    Metadata, ResyncType, RetryPolicy, TransactionError, TxnInitError, TxnType, Value, ValueOrigin,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Result delivered to a blocking committer: the sequence number on success
pub(crate) type TxnOutcome = Result<u64, TransactionError>;

/// Key-value pair to apply within a transaction
#[derive(Clone)]
pub(crate) struct KvForTxn {
    pub key: String,
    pub value: Option<Value>,
    pub metadata: Option<Metadata>,
    pub origin: ValueOrigin,
    pub is_revert: bool,
}

impl KvForTxn {
    pub fn from_nb(key: impl Into<String>, value: Option<Value>) -> Self {
        Self {
            key: key.into(),
            value,
            metadata: None,
            origin: ValueOrigin::FromNb,
            is_revert: false,
        }
    }
}

pub(crate) struct NbTxnArgs {
    pub resync: ResyncType,
    pub verbose: bool,
    pub retry: Option<RetryPolicy>,
    pub revert: bool,
    pub description: Option<String>,
    pub result_tx: Option<Sender<TxnOutcome>>,
}

/// Failed values to re-apply
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RetryOps {
    /// Transaction where the values first failed
    pub txn_seq: u64,
    /// Base key -> sequence number of its last update at the time of failure
    pub keys: BTreeMap<String, u64>,
    pub delay: Duration,
    pub attempt: u32,
}

pub(crate) enum TxnArgs {
    Sb,
    Nb(NbTxnArgs),
    Retry(RetryOps),
}

pub(crate) struct Transaction {
    /// Assigned by the consumer
    pub seq_num: u64,
    pub args: TxnArgs,
    pub values: Vec<KvForTxn>,
}

impl Transaction {
    pub fn txn_type(&self) -> TxnType {
        match self.args {
            TxnArgs::Sb => TxnType::SbNotification,
            TxnArgs::Nb(_) => TxnType::NbTransaction,
            TxnArgs::Retry(_) => TxnType::RetryFailedOps,
        }
    }

    pub fn nb(&self) -> Option<&NbTxnArgs> {
        match &self.args {
            TxnArgs::Nb(nb) => Some(nb),
            _ => None,
        }
    }

    pub fn retry(&self) -> Option<&RetryOps> {
        match &self.args {
            TxnArgs::Retry(retry) => Some(retry),
            _ => None,
        }
    }

    pub fn resync(&self) -> ResyncType {
        self.nb().map(|nb| nb.resync).unwrap_or_default()
    }

    pub fn revert_on_failure(&self) -> bool {
        self.nb().map(|nb| nb.revert).unwrap_or(false)
    }
}

pub(crate) enum QueueItem {
    Txn(Transaction),
    /// Acknowledged once every item queued before it was processed
    Barrier(Sender<()>),
}

/// Bounded multi-producer queue of transactions
pub(crate) struct TxnQueue {
    tx: Sender<QueueItem>,
    rx: Receiver<QueueItem>,
    closed: AtomicBool,
}

impl TxnQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self {
            tx,
            rx,
            closed: AtomicBool::new(false),
        }
    }

    /// Queue without blocking
    pub fn push(&self, item: QueueItem) -> Result<(), TxnInitError> {
        if self.is_closed() {
            return Err(TxnInitError::Closed);
        }
        match self.tx.try_send(item) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(TxnInitError::QueueFull),
            Err(TrySendError::Disconnected(_)) => Err(TxnInitError::Closed),
        }
    }

    pub fn sender(&self) -> &Sender<QueueItem> {
        &self.tx
    }

    pub fn receiver(&self) -> &Receiver<QueueItem> {
        &self.rx
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sb_txn() -> QueueItem {
        QueueItem::Txn(Transaction {
            seq_num: 0,
            args: TxnArgs::Sb,
            values: vec![KvForTxn::from_nb("iface/a", None)],
        })
    }

    #[test]
    fn test_push_full_and_closed() {
        let queue = TxnQueue::new(1);
        assert!(queue.push(sb_txn()).is_ok());
        assert_eq!(queue.push(sb_txn()), Err(TxnInitError::QueueFull));
        assert_eq!(queue.len(), 1);

        queue.close();
        assert_eq!(queue.push(sb_txn()), Err(TxnInitError::Closed));
    }

    #[test]
    fn test_txn_accessors() {
        let txn = Transaction {
            seq_num: 3,
            args: TxnArgs::Nb(NbTxnArgs {
                resync: ResyncType::FullResync,
                verbose: false,
                retry: None,
                revert: false,
                description: None,
                result_tx: None,
            }),
            values: Vec::new(),
        };
        assert_eq!(txn.txn_type(), TxnType::NbTransaction);
        assert_eq!(txn.resync(), ResyncType::FullResync);
        assert!(txn.retry().is_none());
        assert!(!txn.revert_on_failure());
    }
}
