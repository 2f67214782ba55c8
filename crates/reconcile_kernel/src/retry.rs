//! Retry timer
//!
//! Runs on the `reconcile-retry` thread. Retry batches produced by the
//! consumer wait here until their delay elapses and are then queued as
//! `RetryFailedOps` transactions.

use crate::queue::{QueueItem, RetryOps, Transaction, TxnArgs};
use crate::Shared;
use crossbeam_channel::{after, never, select, Receiver};
use reconcile_api::TxnInitError;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Instant;

struct Scheduled {
    due: Instant,
    /// Keeps batches with the same deadline in arrival order
    order: u64,
    ops: RetryOps,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.due, self.order).cmp(&(other.due, other.order))
    }
}

/// Deadline-ordered retry batches
#[derive(Default)]
struct RetryQueue {
    heap: BinaryHeap<Reverse<Scheduled>>,
    next_order: u64,
}

impl RetryQueue {
    fn schedule(&mut self, ops: RetryOps, now: Instant) {
        let scheduled = Scheduled {
            due: now + ops.delay,
            order: self.next_order,
            ops,
        };
        self.next_order += 1;
        self.heap.push(Reverse(scheduled));
    }

    fn next_due(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(s)| s.due)
    }

    /// Remove and return batches due at `now`
    fn pop_due(&mut self, now: Instant) -> Vec<RetryOps> {
        let mut due = Vec::new();
        while self.next_due().map_or(false, |d| d <= now) {
            if let Some(Reverse(scheduled)) = self.heap.pop() {
                due.push(scheduled.ops);
            }
        }
        due
    }

    fn len(&self) -> usize {
        self.heap.len()
    }
}

pub(crate) fn run(shared: Arc<Shared>, retries: Receiver<RetryOps>) {
    let mut queue = RetryQueue::default();
    loop {
        let timer = match queue.next_due() {
            Some(due) => after(due.saturating_duration_since(Instant::now())),
            None => never(),
        };
        select! {
            recv(retries) -> ops => match ops {
                Ok(ops) => queue.schedule(ops, Instant::now()),
                Err(_) => break,
            },
            recv(timer) -> _ => {
                let now = Instant::now();
                for ops in queue.pop_due(now) {
                    let txn = Transaction {
                        seq_num: 0,
                        args: TxnArgs::Retry(ops.clone()),
                        values: Vec::new(),
                    };
                    match shared.queue.push(QueueItem::Txn(txn)) {
                        Ok(()) => {}
                        Err(TxnInitError::QueueFull) => {
                            log::warn!(
                                "Queue full, postponing retry of txn {} by {:?}",
                                ops.txn_seq,
                                ops.delay
                            );
                            queue.schedule(ops, now);
                        }
                        Err(_) => return,
                    }
                }
            },
            recv(shared.shutdown) -> _ => break,
        }
    }
    log::debug!("Retry timer stopped with {} pending batch(es)", queue.len());
}
