//! # Reconcile API - data model and descriptor contract
//!
//! This crate holds everything shared between the reconcile engine and
//! the plugins registered against it. Plugins implement [`Descriptor`]
//! for one kind of value; callers build transactions out of keys and
//! [`Value`]s and commit them with [`CommitOptions`].
//!
//! ## Architecture
//!
//! ```text
//! NB caller ──► Txn + CommitOptions ──► Scheduler ──► Descriptor ──► SB
//!                                          │
//!                       ValueStatus ◄──────┴──────► RecordedTxn
//! ```
//!
//! ## Key Concepts
//!
//! - **Key**: unique string identifying one value
//! - **Descriptor**: callbacks teaching the engine about one key space
//! - **Dependency**: a value needs another key (or any-of a key set) first
//! - **Derived value**: value computed from a base value, sharing its lifecycle
//! - **Metadata**: descriptor-owned runtime data of a configured value

pub mod descriptor;
pub mod error;
pub mod metadata;
pub mod options;
pub mod record;
pub mod status;
pub mod value;

pub use descriptor::{
    keys_selector, prefix_selector, Dependency, DependencyTarget, Descriptor, DumpResult,
    KeySelector, KeyValuePair, KvWithMetadata, Metadata, ValueOrigin,
};
pub use error::{
    DescriptorError, InvalidValueError, KeyWithError, TransactionError, TxnInitError,
    VerificationError, VerificationErrorKind,
};
pub use metadata::{MetadataMap, MetadataMapView, NamedMapping};
pub use options::{CommitOptions, CommitOptionsBuilder, ResyncType, RetryPolicy, View};
pub use record::{RecordedKvPair, RecordedTxn, RecordedTxnOp, TxnType};
pub use status::{BaseValueStatus, TxnOperation, ValueState, ValueStatus};
pub use value::Value;
