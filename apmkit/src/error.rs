//! Error types shared across the instrumentation core.
//!
//! Configuration and validation problems surface at the call site that caused
//! them. State machine violations surface at the call site and leave the
//! transaction unchanged. Harvest and export failures are logged and counted
//! inside the harvest cycle rather than bubbling into instrumented code.

use std::sync::mpsc::{RecvTimeoutError, SendError};
use std::sync::PoisonError;
use thiserror::Error;

use crate::segment::SegmentKind;

/// Errors raised while registering or configuring an application.
#[derive(Error, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// Application names identify the aggregation target and cannot be blank.
    #[error("application name must not be empty")]
    EmptyName,

    /// A zero harvest interval would spin the ticker thread.
    #[error("harvest interval must be greater than zero")]
    InvalidHarvestInterval,

    /// A zero transaction timeout would reap transactions as they open.
    #[error("transaction timeout must be greater than zero")]
    InvalidTransactionTimeout,
}

/// Errors raised when an operation is attempted in the wrong lifecycle state.
///
/// A failed operation is a no-op: the transaction and its segment stack are
/// exactly as they were before the call.
#[derive(Error, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum StateError {
    /// The transaction was already closed; close succeeds exactly once.
    #[error("transaction already closed")]
    AlreadyClosed,

    /// The popped handle was not the top of the segment stack.
    #[error("segment popped out of order (expected index {expected}, got {got})")]
    OutOfOrderPop {
        /// Arena index of the current stack top.
        expected: usize,
        /// Arena index named by the handle that was passed in.
        got: usize,
    },

    /// The handle's segment already had its end time stamped.
    #[error("segment already finished")]
    SegmentFinished,

    /// The handle was minted by a different transaction.
    #[error("segment handle belongs to a different transaction")]
    MismatchedTransaction,
}

/// Errors raised by segment metadata validation at push time.
#[derive(Error, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ValidationError {
    /// Function segments need a non-empty name.
    #[error("{0:?} segment requires a non-empty name")]
    EmptyName(SegmentKind),

    /// Database segments need a non-empty query text.
    #[error("database segment requires a non-empty query")]
    EmptyQuery,

    /// External segments need an absolute URL with a host component.
    #[error("external segment url is invalid: {0}")]
    InvalidUrl(String),

    /// Memcache segments need a non-empty key.
    #[error("memcache segment requires a non-empty key")]
    EmptyKey,
}

/// Errors returned by harvest exporters.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ExportError {
    /// The payload may succeed on a later attempt; its metrics are merged
    /// back into the engine and its slow traces re-retained for the next
    /// cycle.
    #[error("transient export failure: {0}")]
    Transient(String),

    /// The payload will never be accepted; its metrics are discarded.
    #[error("permanent export failure: {0}")]
    Permanent(String),

    /// The exporter has been shut down and accepts no further payloads.
    #[error("exporter already shutdown")]
    AlreadyShutdown,
}

/// A specialized `Result` type for export operations.
pub type ExportResult = Result<(), ExportError>;

/// Errors raised by harvest scheduling and application shutdown.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HarvestError {
    /// The application has been shut down; shutdown succeeds exactly once.
    #[error("application already shutdown")]
    AlreadyShutdown,

    /// The exporter rejected the harvest payload.
    #[error(transparent)]
    Export(#[from] ExportError),

    /// The ticker thread could not be reached or did not acknowledge.
    #[error("harvest ticker channel failure: {0}")]
    Channel(String),

    /// Other failures propagated from inside the harvest cycle.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl<T> From<PoisonError<T>> for HarvestError {
    fn from(err: PoisonError<T>) -> Self {
        HarvestError::Other(err.to_string().into())
    }
}

impl<T> From<SendError<T>> for HarvestError {
    fn from(err: SendError<T>) -> Self {
        HarvestError::Channel(err.to_string())
    }
}

impl From<RecvTimeoutError> for HarvestError {
    fn from(err: RecvTimeoutError) -> Self {
        HarvestError::Channel(err.to_string())
    }
}

/// Wrapper for errors from any part of the instrumentation core. This gives
/// us a common error type where we _need_ to return errors that may come from
/// various components.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Registration or configuration failed.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// An operation was attempted in the wrong lifecycle state.
    #[error(transparent)]
    State(#[from] StateError),

    /// Segment metadata failed validation.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Harvest scheduling or shutdown failed.
    #[error(transparent)]
    Harvest(#[from] HarvestError),

    /// Other types of failures not covered by the variants above.
    #[error("{0}")]
    Other(String),
}

impl<T> From<PoisonError<T>> for Error {
    fn from(err: PoisonError<T>) -> Self {
        Error::Other(err.to_string())
    }
}
