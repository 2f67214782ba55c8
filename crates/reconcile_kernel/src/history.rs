//! Transaction history with age and size based retention

use crate::config::SchedulerConfig;
use reconcile_api::RecordedTxn;
use std::time::{Duration, SystemTime};

/// Records of processed transactions (oldest first)
pub(crate) struct TxnHistory {
    enabled: bool,
    records: Vec<RecordedTxn>,
    age_limit: Duration,
    max_records: usize,
    created: SystemTime,
    /// Transactions started this soon after creation are never trimmed
    init_period: Duration,
}

impl TxnHistory {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            enabled: config.record_transaction_history,
            records: Vec::new(),
            age_limit: config.history_age_limit(),
            max_records: config.max_history_records,
            created: SystemTime::now(),
            init_period: config.permanently_recorded_init_period(),
        }
    }

    pub fn append(&mut self, record: RecordedTxn) {
        if !self.enabled {
            return;
        }
        self.records.push(record);
        self.trim(SystemTime::now());
    }

    fn is_permanent(&self, record: &RecordedTxn) -> bool {
        started_within(record, self.created, self.init_period)
    }

    /// Drop records past the age limit, then the oldest ones over the size limit
    pub fn trim(&mut self, now: SystemTime) {
        if let Some(cutoff) = now.checked_sub(self.age_limit) {
            let before = self.records.len();
            let (created, init_period) = (self.created, self.init_period);
            self.records
                .retain(|r| r.start >= cutoff || started_within(r, created, init_period));
            let trimmed = before - self.records.len();
            if trimmed > 0 {
                log::debug!("Trimmed {} transaction record(s) by age", trimmed);
            }
        }

        while self.max_records > 0 && self.records.len() > self.max_records {
            let idx = self
                .records
                .iter()
                .position(|r| !self.is_permanent(r))
                .unwrap_or(0);
            self.records.remove(idx);
        }
    }

    /// Records started within the given window (bounds inclusive)
    pub fn range(&self, since: Option<SystemTime>, until: Option<SystemTime>) -> Vec<RecordedTxn> {
        self.records
            .iter()
            .filter(|r| since.map_or(true, |since| r.start >= since))
            .filter(|r| until.map_or(true, |until| r.start <= until))
            .cloned()
            .collect()
    }

    pub fn by_seq(&self, seq_num: u64) -> Option<RecordedTxn> {
        self.records.iter().find(|r| r.seq_num == seq_num).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}

fn started_within(record: &RecordedTxn, since: SystemTime, period: Duration) -> bool {
    match record.start.duration_since(since) {
        Ok(elapsed) => elapsed < period,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reconcile_api::{ResyncType, TxnType};

    fn record(seq_num: u64, start: SystemTime) -> RecordedTxn {
        RecordedTxn {
            pre_record: false,
            start,
            stop: start,
            seq_num,
            txn_type: TxnType::NbTransaction,
            resync_type: ResyncType::NotResync,
            description: None,
            retry_for_txn: None,
            retry_attempt: 0,
            values: Vec::new(),
            planned: Vec::new(),
            executed: Vec::new(),
        }
    }

    fn history(max_records: usize, init_minutes: u64) -> TxnHistory {
        TxnHistory::new(&SchedulerConfig {
            max_history_records: max_records,
            permanently_recorded_init_period_minutes: init_minutes,
            history_age_limit_minutes: 10,
            ..SchedulerConfig::default()
        })
    }

    #[test]
    fn test_range_and_lookup() {
        let mut h = history(0, 0);
        let t0 = SystemTime::now();
        for seq in 1..=3 {
            h.append(record(seq, t0 + Duration::from_secs(seq)));
        }
        assert_eq!(h.len(), 3);
        assert_eq!(h.range(None, None).len(), 3);

        let window = h.range(Some(t0 + Duration::from_secs(2)), None);
        assert_eq!(window.iter().map(|r| r.seq_num).collect::<Vec<_>>(), vec![2, 3]);
        let window = h.range(None, Some(t0 + Duration::from_secs(2)));
        assert_eq!(window.iter().map(|r| r.seq_num).collect::<Vec<_>>(), vec![1, 2]);

        assert_eq!(h.by_seq(2).map(|r| r.seq_num), Some(2));
        assert!(h.by_seq(9).is_none());
    }

    #[test]
    fn test_trim_by_count_oldest_first() {
        let mut h = history(2, 0);
        let t0 = SystemTime::now();
        for seq in 1..=4 {
            h.append(record(seq, t0 + Duration::from_secs(seq)));
        }
        let seqs: Vec<u64> = h.range(None, None).iter().map(|r| r.seq_num).collect();
        assert_eq!(seqs, vec![3, 4]);
    }

    #[test]
    fn test_trim_by_age_keeps_permanent_records() {
        let now = SystemTime::now();
        let old = now - Duration::from_secs(3600);

        let mut h = history(0, 0);
        h.records.push(record(1, old));
        h.records.push(record(2, now));
        h.trim(now);
        assert_eq!(h.by_seq(1).map(|r| r.seq_num), None);
        assert_eq!(h.len(), 1);

        let mut h = history(0, 60);
        h.created = old - Duration::from_secs(1);
        h.records.push(record(1, old));
        h.records.push(record(2, now));
        h.trim(now);
        assert_eq!(h.len(), 2);
    }

    #[test]
    fn test_disabled_history() {
        let mut h = TxnHistory::new(&SchedulerConfig {
            record_transaction_history: false,
            ..SchedulerConfig::default()
        });
        h.append(record(1, SystemTime::now()));
        assert_eq!(h.len(), 0);
    }
}
