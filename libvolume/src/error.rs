//! Error types for the volume subsystem.
//!
//! Three layers, each a [`thiserror`] enum:
//!
//! * [`StoreError`] — returned by [`MetadataStore`](crate::store::MetadataStore)
//!   implementations.
//! * [`BackendError`] — returned by
//!   [`StorageBackend`](crate::backend::StorageBackend) verbs.
//! * [`VolumeError`] — the orchestrator-level taxonomy surfaced to callers.

use std::time::Duration;

use thiserror::Error;

/// Errors raised by a metadata store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("volume {0} not found")]
    NotFound(String),

    #[error("volume {0} already exists")]
    AlreadyExists(String),

    /// A conditional update lost against a concurrent writer.
    #[error("volume {0} was modified concurrently")]
    Conflict(String),

    #[error("store request timed out after {0:?}")]
    Timeout(Duration),

    /// The consensus member is shut down or has no leader.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("store internal error: {0}")]
    Internal(String),
}

/// Errors raised by a storage backend.
#[derive(Debug, Error)]
pub enum BackendError {
    /// A required parameter is missing or malformed.
    #[error("invalid parameter {param}: {reason}")]
    InvalidParameter { param: String, reason: String },

    /// A host filesystem or mount operation failed.
    #[error("{op} failed at {path}: {reason}")]
    Operation {
        op: &'static str,
        path: String,
        reason: String,
    },

    /// The configured mechanism is not available on this host.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl BackendError {
    pub fn invalid(param: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            param: param.into(),
            reason: reason.into(),
        }
    }

    pub fn operation<E: std::fmt::Display>(
        op: &'static str,
        path: impl AsRef<std::path::Path>,
        e: E,
    ) -> Self {
        Self::Operation {
            op,
            path: path.as_ref().display().to_string(),
            reason: e.to_string(),
        }
    }
}

/// The lifecycle verb a backend failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendOp {
    Stage,
    Unstage,
    Publish,
    Unpublish,
}

impl std::fmt::Display for BackendOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Stage => "stage",
            Self::Unstage => "unstage",
            Self::Publish => "publish",
            Self::Unpublish => "unpublish",
        })
    }
}

/// Unified error type for volume orchestration.
#[derive(Debug, Error)]
pub enum VolumeError {
    #[error("volume {0} not found")]
    NotFound(String),

    #[error("volume {0} already exists")]
    AlreadyExists(String),

    /// The operation is not allowed in the volume's current state.
    #[error("{0}")]
    Conflict(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("backend {0} is not registered")]
    BackendNotFound(String),

    #[error("backend {0} is already registered")]
    AlreadyRegistered(String),

    #[error("backend {op} failed: {source}")]
    BackendOperationFailed {
        op: BackendOp,
        #[source]
        source: BackendError,
    },

    #[error(transparent)]
    Store(StoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for VolumeError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => Self::NotFound(id),
            StoreError::AlreadyExists(name) => Self::AlreadyExists(name),
            other => Self::Store(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_collapse_into_volume_errors() {
        let err: VolumeError = StoreError::NotFound("v1".into()).into();
        assert!(matches!(err, VolumeError::NotFound(ref id) if id == "v1"));

        let err: VolumeError = StoreError::Timeout(Duration::from_secs(5)).into();
        assert!(matches!(err, VolumeError::Store(StoreError::Timeout(_))));
    }

    #[test]
    fn backend_failure_display() {
        let err = VolumeError::BackendOperationFailed {
            op: BackendOp::Publish,
            source: BackendError::operation("mount", "/mnt/target", "permission denied"),
        };
        assert_eq!(
            err.to_string(),
            "backend publish failed: mount failed at /mnt/target: permission denied"
        );
    }
}
