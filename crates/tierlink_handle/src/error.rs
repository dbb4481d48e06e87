// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Error types for cache operations.

use std::fmt;

use recoverable::{Recovery, RecoveryInfo};

/// Classifies what went wrong in a cache operation.
///
/// Version conflicts are deliberately absent: they only drive the internal
/// update retry loop and are never surfaced as errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Required settings are missing or contradictory. Raised at construction.
    Configuration,
    /// An argument violates an item or operation invariant.
    InvalidArgument,
    /// Network or timeout failure against a distributed store, after retries.
    TransientStore,
    /// Any other failure reported by a store.
    Store,
    /// The item targeted by an update does not exist.
    NotFound,
    /// A value could not be encoded or decoded.
    Serialization,
    /// A value factory or update function produced no value.
    FactoryReturnedNone,
    /// An optimistic retry loop ran out of attempts.
    RetriesExhausted,
    /// The component was already disposed.
    Disposed,
    /// A value factory was cancelled before producing a value.
    Cancelled,
}

impl ErrorKind {
    /// Returns a short, stable name for this kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::InvalidArgument => "invalid argument",
            Self::TransientStore => "transient store failure",
            Self::Store => "store failure",
            Self::NotFound => "item not found",
            Self::Serialization => "serialization failure",
            Self::FactoryReturnedNone => "factory returned no value",
            Self::RetriesExhausted => "retries exhausted",
            Self::Disposed => "disposed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error from a cache operation.
///
/// Use [`Error::kind`] to branch on the failure class and
/// [`std::error::Error::source()`] to reach the underlying cause.
///
/// # Example
///
/// ```
/// use tierlink_handle::{Error, ErrorKind};
///
/// let error = Error::with_cause(ErrorKind::Store, "connection reset");
/// assert_eq!(error.kind(), ErrorKind::Store);
/// ```
#[ohno::error]
#[display("cache operation failed: {kind}")]
pub struct Error {
    kind: ErrorKind,
}

impl Error {
    /// Creates an error of the given kind without an underlying cause.
    #[must_use]
    pub fn with_kind(kind: ErrorKind) -> Self {
        Self::new(kind)
    }

    /// Creates an error of the given kind wrapping an underlying cause.
    ///
    /// This is the public entry point for handle implementations in other crates.
    pub fn with_cause(kind: ErrorKind, cause: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::caused_by(kind, cause)
    }

    /// Returns the failure class of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Shorthand for an [`ErrorKind::InvalidArgument`] error with a message.
    pub fn invalid_argument(message: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::caused_by(ErrorKind::InvalidArgument, message)
    }

    /// Shorthand for an [`ErrorKind::Configuration`] error with a message.
    pub fn configuration(message: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::caused_by(ErrorKind::Configuration, message)
    }

    /// Returns `true` if retrying the failed operation might succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.kind == ErrorKind::TransientStore
    }
}

impl Recovery for Error {
    fn recovery(&self) -> RecoveryInfo {
        if self.is_transient() {
            RecoveryInfo::retry()
        } else {
            RecoveryInfo::never()
        }
    }
}

/// A specialized [`Result`] type for cache operations.
pub type Result<T> = std::result::Result<T, Error>;
