//! Transaction records
//!
//! Every processed transaction leaves a [`RecordedTxn`] behind: its
//! arguments, the plan computed by the dry run and the operations that were
//! actually executed. Records are rendered for humans through `Display`.

use crate::descriptor::ValueOrigin;
use crate::error::DescriptorError;
use crate::options::ResyncType;
use crate::status::{TxnOperation, ValueState};
use crate::value::Value;
use serde::{Serialize, Serializer};
use std::fmt;
use std::time::SystemTime;

/// Source of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TxnType {
    /// Change observed in the southbound
    SbNotification,
    /// Change requested by northbound
    NbTransaction,
    /// Re-execution of failed operations
    RetryFailedOps,
}

impl fmt::Display for TxnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SbNotification => write!(f, "SB notification"),
            Self::NbTransaction => write!(f, "NB transaction"),
            Self::RetryFailedOps => write!(f, "RETRY"),
        }
    }
}

/// Input key-value pair of a transaction
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordedKvPair {
    pub key: String,
    pub value: Option<Value>,
    pub origin: ValueOrigin,
}

/// One planned or executed operation
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecordedTxnOp {
    pub operation: TxnOperation,
    pub key: String,

    pub prev_value: Option<Value>,
    pub new_value: Option<Value>,
    pub prev_state: ValueState,
    pub new_state: ValueState,
    pub prev_err: Option<String>,
    #[serde(serialize_with = "error_as_string")]
    pub new_err: Option<DescriptorError>,
    /// Nothing was executed in the southbound
    pub noop: bool,

    pub is_derived: bool,
    /// Derived value without a descriptor
    pub is_property: bool,
    pub is_revert: bool,
    pub is_retry: bool,
    pub is_recreate: bool,
}

fn error_as_string<S: Serializer>(
    err: &Option<DescriptorError>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match err {
        Some(err) => serializer.serialize_some(&err.to_string()),
        None => serializer.serialize_none(),
    }
}

impl RecordedTxnOp {
    /// Human-readable flags describing the state transition
    pub fn flags(&self) -> Vec<&'static str> {
        use ValueState::*;

        let mut flags = Vec::new();
        if self.is_derived && !self.is_property {
            flags.push("DERIVED");
        }
        if self.is_property {
            flags.push("PROPERTY");
        }
        if self.noop {
            flags.push("NOOP");
        }
        if self.is_revert && !self.is_property {
            flags.push("REVERT");
        }
        if self.is_retry && !self.is_property {
            flags.push("RETRY");
        }
        if self.is_recreate {
            flags.push("RECREATE");
        }
        if self.new_state == Retrieved {
            flags.push("RETRIEVED");
        }
        if self.prev_state == Retrieved && self.new_state != Retrieved {
            flags.push("WAS-RETRIEVED");
        }
        if self.new_state == Unimplemented {
            flags.push("UNIMPLEMENTED");
        }
        if self.prev_state == Unimplemented && self.new_state != Unimplemented {
            flags.push("WAS-UNIMPLEMENTED");
        }
        if self.prev_state == Removed && !self.is_recreate {
            flags.push("ALREADY-REMOVED");
        }
        if self.prev_state == Missing {
            if self.new_state == Removed {
                flags.push("ALREADY-MISSING");
            } else {
                flags.push("WAS-MISSING");
            }
        }
        if self.prev_state == Found {
            flags.push("FOUND");
        }
        match (self.prev_state, self.new_state) {
            (Pending, Pending) => flags.push("STILL-PENDING"),
            (Pending, _) => flags.push("WAS-PENDING"),
            (_, Pending) => flags.push("IS-PENDING"),
            _ => {}
        }
        match (self.prev_state, self.new_state) {
            (Failed, Failed) => flags.push("STILL-FAILING"),
            (Failed, Configured) => flags.push("FIXED"),
            (Failed, _) => {}
            (_, Failed) => flags.push("FAILED"),
            _ => {}
        }
        match (self.prev_state, self.new_state) {
            (Invalid, Invalid) => flags.push("STILL-INVALID"),
            (Invalid, Configured) => flags.push("FIXED"),
            (Invalid, _) => {}
            (_, Invalid) => flags.push("INVALID"),
            _ => {}
        }
        flags
    }

    fn write_indented(&self, f: &mut fmt::Formatter<'_>, index: usize, indent: usize) -> fmt::Result {
        let pad = " ".repeat(indent);
        let pad2 = " ".repeat(indent + 4);
        let flags = self.flags();

        write!(f, "{}", pad)?;
        if index > 0 {
            write!(f, "{}. ", index)?;
        }
        if flags.is_empty() {
            writeln!(f, "{}:", self.operation)?;
        } else {
            writeln!(f, "{} [{}]:", self.operation, flags.join(" "))?;
        }
        writeln!(f, "{}- key: {}", pad2, self.key)?;
        match self.operation {
            TxnOperation::Modify => {
                writeln!(f, "{}- prev-value: {}", pad2, OptValue(&self.prev_value))?;
                writeln!(f, "{}- new-value: {}", pad2, OptValue(&self.new_value))?;
            }
            TxnOperation::Delete => {
                writeln!(f, "{}- value: {}", pad2, OptValue(&self.prev_value))?;
            }
            TxnOperation::Add => {
                writeln!(f, "{}- value: {}", pad2, OptValue(&self.new_value))?;
            }
            TxnOperation::Undefined => {}
        }
        if let Some(err) = &self.prev_err {
            writeln!(f, "{}- prev-error: {}", pad2, err)?;
        }
        if let Some(err) = &self.new_err {
            writeln!(f, "{}- error: {}", pad2, err)?;
        }
        if f.alternate() {
            writeln!(f, "{}- prev-state: {}", pad2, self.prev_state)?;
            writeln!(f, "{}- new-state: {}", pad2, self.new_state)?;
        }
        Ok(())
    }
}

impl fmt::Display for RecordedTxnOp {
    /// `{:#}` additionally prints the state transition
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_indented(f, 0, 0)
    }
}

struct OptValue<'a>(&'a Option<Value>);

impl fmt::Display for OptValue<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(v) => write!(f, "{}", v),
            None => write!(f, "<nil>"),
        }
    }
}

/// Record of one processed transaction
#[derive(Debug, Clone, Serialize)]
pub struct RecordedTxn {
    /// Only arguments and plan are recorded so far
    pub pre_record: bool,

    pub start: SystemTime,
    pub stop: SystemTime,

    pub seq_num: u64,
    pub txn_type: TxnType,
    pub resync_type: ResyncType,
    pub description: Option<String>,
    /// Sequence number of the transaction whose failures are retried
    pub retry_for_txn: Option<u64>,
    pub retry_attempt: u32,
    pub values: Vec<RecordedKvPair>,

    pub planned: Vec<RecordedTxnOp>,
    pub executed: Vec<RecordedTxnOp>,
}

impl RecordedTxn {
    /// Executed operations that ended with an error
    pub fn failed_ops(&self) -> impl Iterator<Item = &RecordedTxnOp> {
        self.executed.iter().filter(|op| op.new_err.is_some())
    }
}

fn write_ops(f: &mut fmt::Formatter<'_>, ops: &[RecordedTxnOp], indent: usize) -> fmt::Result {
    if ops.is_empty() {
        return writeln!(f, "{}<NONE>", " ".repeat(indent));
    }
    for (idx, op) in ops.iter().enumerate() {
        op.write_indented(f, idx + 1, indent)?;
    }
    Ok(())
}

impl fmt::Display for RecordedTxn {
    /// `{:#}` additionally prints state transitions of every operation
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "* transaction arguments:")?;
        writeln!(f, "    - seq-num: {}", self.seq_num)?;
        match (self.txn_type, self.retry_for_txn) {
            (TxnType::NbTransaction, _) if self.resync_type.is_resync() => {
                writeln!(f, "    - type: {}, {}", self.txn_type, self.resync_type)?
            }
            (TxnType::RetryFailedOps, Some(origin)) => writeln!(
                f,
                "    - type: {} (for txn {}, attempt #{})",
                self.txn_type, origin, self.retry_attempt
            )?,
            _ => writeln!(f, "    - type: {}", self.txn_type)?,
        }
        if let Some(description) = &self.description {
            for (idx, line) in description.lines().enumerate() {
                if idx == 0 {
                    writeln!(f, "    - description: {}", line)?;
                } else {
                    writeln!(f, "        {}", line)?;
                }
            }
        }
        if self.resync_type != ResyncType::DownstreamResync {
            if self.values.is_empty() {
                writeln!(f, "    - values: NONE")?;
            } else {
                writeln!(f, "    - values:")?;
            }
            for kv in &self.values {
                if self.resync_type.is_resync() && kv.origin == ValueOrigin::FromSb {
                    continue;
                }
                writeln!(f, "        - key: {}", kv.key)?;
                writeln!(f, "          value: {}", OptValue(&kv.value))?;
            }
        }
        writeln!(f, "* planned operations:")?;
        write_ops(f, &self.planned, 4)?;

        if !self.pre_record {
            match self.stop.duration_since(self.start) {
                Ok(duration) if !self.executed.is_empty() => {
                    writeln!(f, "* executed operations (duration = {:?}):", duration)?
                }
                _ => writeln!(f, "* executed operations:")?,
            }
            write_ops(f, &self.executed, 4)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(prev: ValueState, new: ValueState) -> RecordedTxnOp {
        RecordedTxnOp {
            operation: TxnOperation::Add,
            key: "iface/a".into(),
            new_value: Some(Value::from("up")),
            prev_state: prev,
            new_state: new,
            ..Default::default()
        }
    }

    #[test]
    fn test_op_flags() {
        assert_eq!(op(ValueState::Pending, ValueState::Configured).flags(), vec!["WAS-PENDING"]);
        assert_eq!(op(ValueState::Failed, ValueState::Configured).flags(), vec!["FIXED"]);
        assert_eq!(
            op(ValueState::Pending, ValueState::Pending).flags(),
            vec!["STILL-PENDING"]
        );

        let mut derived = op(ValueState::NonExistent, ValueState::Failed);
        derived.is_derived = true;
        derived.is_retry = true;
        assert_eq!(derived.flags(), vec!["DERIVED", "RETRY", "FAILED"]);
    }

    #[test]
    fn test_op_display() {
        let mut failed = op(ValueState::NonExistent, ValueState::Failed);
        failed.new_err = Some(DescriptorError::msg("link down"));
        let text = failed.to_string();
        assert!(text.starts_with("ADD [FAILED]:"));
        assert!(text.contains("- key: iface/a"));
        assert!(text.contains("- value: \"up\""));
        assert!(text.contains("- error: link down"));
        assert!(!text.contains("new-state"));
        assert!(format!("{:#}", failed).contains("- new-state: FAILED"));
    }

    #[test]
    fn test_serialize_error_as_string() {
        let mut failed = op(ValueState::NonExistent, ValueState::Failed);
        failed.new_err = Some(DescriptorError::msg("link down"));
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["new_err"], serde_json::json!("link down"));
        assert_eq!(json["new_state"], serde_json::json!("Failed"));
    }
}
