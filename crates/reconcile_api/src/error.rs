//! Error types shared by descriptors and the engine

use crate::status::TxnOperation;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Error returned by a descriptor callback.
///
/// Cheap to clone so it can be stored in the graph, in status snapshots and
/// in the transaction history.
#[derive(Debug, Clone, Error)]
pub enum DescriptorError {
    #[error("{0} operation is not implemented")]
    Unimplemented(TxnOperation),

    #[error("dump operation is not supported")]
    DumpUnimplemented,

    #[error(transparent)]
    InvalidValue(#[from] InvalidValueError),

    #[error(transparent)]
    Verification(#[from] VerificationError),

    #[error("{0}")]
    Message(String),

    #[error(transparent)]
    Other(Arc<dyn StdError + Send + Sync>),
}

impl DescriptorError {
    /// Error with a plain message
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }

    /// Wrap an arbitrary error
    pub fn other<E: StdError + Send + Sync + 'static>(err: E) -> Self {
        Self::Other(Arc::new(err))
    }

    /// Whether the descriptor lacks the requested callback
    pub fn is_unimplemented(&self) -> bool {
        matches!(self, Self::Unimplemented(_) | Self::DumpUnimplemented)
    }

    /// Access a wrapped error of a concrete type
    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        match self {
            Self::Other(err) => err.downcast_ref::<E>(),
            _ => None,
        }
    }

    /// Invalid fields, if this is a validation error
    pub fn invalid_fields(&self) -> &[String] {
        match self {
            Self::InvalidValue(err) => &err.invalid_fields,
            _ => &[],
        }
    }
}

/// Validation failure naming the offending fields
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason} (invalid fields: {})", .invalid_fields.join(", "))]
pub struct InvalidValueError {
    pub reason: String,
    pub invalid_fields: Vec<String>,
}

impl InvalidValueError {
    pub fn new<I, S>(reason: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            reason: reason.into(),
            invalid_fields: fields.into_iter().map(Into::into).collect(),
        }
    }
}

/// Kind of disagreement between the engine and the southbound
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VerificationErrorKind {
    /// Value applied by the engine is not present in the southbound
    ExpectedToExist,
    /// Value removed by the engine is still present in the southbound
    ExpectedToNotExist,
    /// Southbound holds a value not equivalent to the one applied
    NotEquivalent,
}

impl fmt::Display for VerificationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExpectedToExist => write!(f, "expected to exist"),
            Self::ExpectedToNotExist => write!(f, "expected to not exist"),
            Self::NotEquivalent => write!(f, "not equivalent to the applied value"),
        }
    }
}

/// Post-transaction refresh disagrees with the last applied value
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("verification of {key} failed: value {kind}")]
pub struct VerificationError {
    pub key: String,
    pub kind: VerificationErrorKind,
}

/// Errors preventing a transaction (or the wait for it) from completing
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TxnInitError {
    #[error("downstream resync combined with data-change transaction")]
    CombinedDownstreamResyncWithChange,

    #[error("revert is not supported with resync")]
    RevertNotSupportedWithResync,

    #[error("transaction queue is full")]
    QueueFull,

    #[error("scheduler was closed")]
    Closed,

    #[error("waiting for transaction to finish was canceled")]
    WaitCanceled,
}

/// Failure of one value within a transaction
#[derive(Debug, Clone)]
pub struct KeyWithError {
    pub key: String,
    pub operation: TxnOperation,
    pub error: DescriptorError,
}

impl fmt::Display for KeyWithError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.key, self.operation, self.error)
    }
}

/// Aggregated error of one transaction.
///
/// Holds either the initialization error or the per-key errors, never both.
#[derive(Debug, Clone)]
pub struct TransactionError {
    /// Sequence number, if the transaction was processed
    pub seq_num: Option<u64>,
    init_error: Option<TxnInitError>,
    kv_errors: Vec<KeyWithError>,
}

impl TransactionError {
    pub fn init(err: TxnInitError) -> Self {
        Self {
            seq_num: None,
            init_error: Some(err),
            kv_errors: Vec::new(),
        }
    }

    pub fn with_kv_errors(seq_num: u64, kv_errors: Vec<KeyWithError>) -> Self {
        Self {
            seq_num: Some(seq_num),
            init_error: None,
            kv_errors,
        }
    }

    pub fn init_error(&self) -> Option<&TxnInitError> {
        self.init_error.as_ref()
    }

    pub fn kv_errors(&self) -> &[KeyWithError] {
        &self.kv_errors
    }

    /// Error recorded for the given key
    pub fn error_for(&self, key: &str) -> Option<&KeyWithError> {
        self.kv_errors.iter().find(|e| e.key == key)
    }
}

impl From<TxnInitError> for TransactionError {
    fn from(err: TxnInitError) -> Self {
        Self::init(err)
    }
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(err) = &self.init_error {
            return write!(f, "transaction initialization error: {}", err);
        }
        write!(f, "failed to apply {} value(s): ", self.kv_errors.len())?;
        for (i, kv) in self.kv_errors.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}", kv)?;
        }
        Ok(())
    }
}

impl StdError for TransactionError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match &self.init_error {
            Some(err) => Some(err),
            None => self.kv_errors.first().map(|kv| &kv.error as &(dyn StdError + 'static)),
        }
    }
}
