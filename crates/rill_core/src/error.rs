//! Reactive graph error types

use thiserror::Error;

use crate::value::PropertyKey;

/// Errors raised by graph operations
///
/// A write canceled by a `change` listener is not an error; it is reported
/// as `Ok(false)` by the write that was rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReactiveError {
    /// Write through a read-only surface or read-only property state
    #[error("Cannot assign to read only property '{property}'")]
    ReadOnly { property: PropertyKey },

    /// Observable handle is stale or was disposed
    #[error("Observable is not alive")]
    UnknownObservable,

    /// State handle is stale or was disposed
    #[error("State is not alive")]
    UnknownState,

    /// Computed states are derived and cannot be written
    #[error("Computed state cannot be written")]
    NotWritable,

    /// Value cannot be stored under child tracking
    #[error("Unsupported value for property '{property}': {reason}")]
    UnsupportedValue {
        property: PropertyKey,
        reason: &'static str,
    },
}

/// Result type for graph operations
pub type Result<T> = std::result::Result<T, ReactiveError>;
