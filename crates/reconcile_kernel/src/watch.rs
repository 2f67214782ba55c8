//! Value status watchers

use crossbeam_channel::{Sender, TrySendError};
use parking_lot::RwLock;
use reconcile_api::{BaseValueStatus, KeySelector};

struct Watcher {
    channel: Sender<BaseValueStatus>,
    selector: Option<KeySelector>,
}

impl Watcher {
    fn wants(&self, key: &str) -> bool {
        self.selector.as_ref().map_or(true, |selector| selector(key))
    }
}

/// Subscribers of value status updates.
///
/// Updates are sent without blocking; a full channel loses the update.
#[derive(Default)]
pub(crate) struct Watchers {
    watchers: RwLock<Vec<Watcher>>,
}

impl Watchers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, channel: Sender<BaseValueStatus>, selector: Option<KeySelector>) {
        self.watchers.write().push(Watcher { channel, selector });
    }

    /// Deliver status updates; watchers whose receiver is gone are removed
    pub fn notify(&self, statuses: &[BaseValueStatus]) {
        if statuses.is_empty() {
            return;
        }
        let mut watchers = self.watchers.write();
        watchers.retain(|watcher| {
            for status in statuses.iter().filter(|s| watcher.wants(s.key())) {
                match watcher.channel.try_send(status.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        log::warn!("Dropped status update for watcher: {}", status.value);
                    }
                    Err(TrySendError::Disconnected(_)) => return false,
                }
            }
            true
        });
    }

    pub fn len(&self) -> usize {
        self.watchers.read().len()
    }
}
