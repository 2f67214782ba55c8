//! Value states, operations and status snapshots

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ValueState {
    /// Value is not known to the engine
    #[default]
    NonExistent,
    /// Value was configured but resync found it missing in the southbound
    Missing,
    /// No descriptor covers the key
    Unimplemented,
    /// Value was removed (or never existed)
    Removed,
    /// Value was successfully applied
    Configured,
    /// Value observed in the southbound, not managed by northbound
    Retrieved,
    /// Northbound value found already applied by resync
    Found,
    /// Dependencies are not satisfied
    Pending,
    /// Validation failed
    Invalid,
    /// Last operation failed with no retry scheduled
    Failed,
    /// Last operation failed and a retry is scheduled
    Retrying,
}

impl ValueState {
    /// Whether the state reflects an error
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Retrying | Self::Invalid)
    }
}

impl fmt::Display for ValueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NonExistent => "NONEXISTENT",
            Self::Missing => "MISSING",
            Self::Unimplemented => "UNIMPLEMENTED",
            Self::Removed => "REMOVED",
            Self::Configured => "CONFIGURED",
            Self::Retrieved => "RETRIEVED",
            Self::Found => "FOUND",
            Self::Pending => "PENDING",
            Self::Invalid => "INVALID",
            Self::Failed => "FAILED",
            Self::Retrying => "RETRYING",
        };
        write!(f, "{}", s)
    }
}

/// Operation executed over a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TxnOperation {
    #[default]
    Undefined,
    Add,
    Delete,
    Modify,
}

impl fmt::Display for TxnOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Undefined => "UNDEFINED",
            Self::Add => "ADD",
            Self::Delete => "DELETE",
            Self::Modify => "MODIFY",
        };
        write!(f, "{}", s)
    }
}

/// Status of a single value
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ValueStatus {
    pub key: String,
    pub state: ValueState,
    /// Error of the last operation, empty if it succeeded
    pub error: Option<String>,
    pub last_operation: TxnOperation,
    /// Invalid fields for `Invalid` values, unmet dependency labels for
    /// `Pending` values
    pub details: Vec<String>,
}

/// Status of a non-derived value together with its derived values
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BaseValueStatus {
    pub value: ValueStatus,
    pub derived_values: Vec<ValueStatus>,
}

impl BaseValueStatus {
    /// Shortcut for `self.value.state`
    pub fn state(&self) -> ValueState {
        self.value.state
    }

    pub fn key(&self) -> &str {
        &self.value.key
    }
}

impl fmt::Display for ValueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}", self.key, self.state)?;
        if self.last_operation != TxnOperation::Undefined {
            write!(f, ", last-op={}", self.last_operation)?;
        }
        if let Some(err) = &self.error {
            write!(f, ", error={}", err)?;
        }
        if !self.details.is_empty() {
            write!(f, ", details={}", self.details.join(","))?;
        }
        write!(f, "]")
    }
}
