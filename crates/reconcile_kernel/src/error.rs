//! Scheduler error types

use reconcile_api::{DescriptorError, TxnInitError};
use thiserror::Error;

/// Errors raised while registering descriptors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("descriptor {0} is already registered")]
    DuplicateDescriptor(String),

    #[error("key {key} is matched by both {existing} and {new}")]
    OverlappingKeySpace {
        key: String,
        existing: String,
        new: String,
    },

    #[error("dump dependencies of {0} form a cycle")]
    DumpDependencyCycle(String),
}

/// Errors from scheduler operations other than commits
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler was closed")]
    Closed,

    #[error("transaction queue is full")]
    QueueFull,

    #[error("waiting was canceled")]
    WaitCanceled,

    #[error("descriptor {0} is not registered")]
    UnknownDescriptor(String),

    #[error("no descriptor registered for key prefix {0}")]
    UnknownKeyPrefix(String),

    #[error("descriptor {0} does not support dump")]
    DumpNotSupported(String),

    #[error("dump failed: {0}")]
    Dump(DescriptorError),

    #[error("registration failed: {0}")]
    Registry(#[from] RegistryError),

    #[error("failed to spawn thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl From<TxnInitError> for SchedulerError {
    fn from(err: TxnInitError) -> Self {
        match err {
            TxnInitError::QueueFull => Self::QueueFull,
            TxnInitError::WaitCanceled => Self::WaitCanceled,
            _ => Self::Closed,
        }
    }
}

/// Result type for scheduler operations
pub type SchedulerResult<T> = Result<T, SchedulerError>;
