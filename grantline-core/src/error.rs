//! Error types for the licensing kernel.

use thiserror::Error;

use crate::types::{ObjectKey, ResourceKind};

/// Errors raised by the token engine, the store contract and the reconcilers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LicensingError {
    /// Token is malformed, unverifiable, or outside its validity window.
    #[error("invalid license token: {0}")]
    InvalidToken(String),

    /// Referenced object is absent.
    #[error("{kind} {key} not found")]
    NotFound { kind: ResourceKind, key: ObjectKey },

    /// Stale resource version on update. Retryable.
    #[error("{kind} {key} was modified concurrently")]
    Conflict { kind: ResourceKind, key: ObjectKey },

    /// Create targeted a key that is already taken.
    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: ResourceKind, key: ObjectKey },

    /// Secret backs an active grant but lost its license label.
    #[error("secret {0} backs an active grant but is not labeled as a license")]
    Unlabeled(ObjectKey),

    /// No Free grant satisfies a request. Surfaced through the request message only.
    #[error("no free grant offers {amount} {unit}")]
    NoMatchingGrant { unit: String, amount: u64 },

    /// Key material could not be generated, parsed or encoded.
    #[error("key error: {0}")]
    Key(String),

    /// Any other failure reported by the store backend.
    #[error("store error: {0}")]
    Store(String),

    /// A client wait elapsed before the request settled.
    #[error("timed out waiting for license")]
    Timeout,

    /// No async runtime to run on, or the background task it ran stopped.
    #[error("runtime error: {0}")]
    Runtime(String),
}

impl LicensingError {
    /// Returns true for version conflicts, the only error the retry combinator absorbs.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns false for conditions that need an operator to fix the cluster state.
    #[must_use]
    pub fn is_requeueable(&self) -> bool {
        !matches!(self, Self::Unlabeled(_) | Self::InvalidToken(_) | Self::Key(_))
    }
}

impl From<serde_json::Error> for LicensingError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidToken(format!("malformed payload JSON: {err}"))
    }
}

/// Result type for licensing operations.
pub type LicensingResult<T> = Result<T, LicensingError>;

/// Treats `NotFound` as already resolved.
pub fn ignore_not_found<T>(result: LicensingResult<T>) -> LicensingResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.is_not_found() => Ok(None),
        Err(err) => Err(err),
    }
}
