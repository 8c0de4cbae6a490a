//! CSI error types.
//!
//! All errors in the `libcsi` crate are represented by the [`CsiError`] enum,
//! which derives [`thiserror::Error`] for ergonomic error handling and also
//! implements [`Serialize`]/[`Deserialize`] so errors can travel across the
//! QUIC transport layer.

use libvolume::api::{ClientError, ErrorCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for CSI operations.
///
/// The variants mirror the CSI status codes a caller is expected to act on.
#[derive(Debug, Error, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum CsiError {
    /// The requested volume already exists.
    #[error("volume {0} already exists")]
    VolumeAlreadyExists(String),

    /// The requested volume was not found.
    #[error("volume {0} not found")]
    VolumeNotFound(String),

    /// The volume is in a state that does not allow the operation, e.g. a
    /// delete while it is still published.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// The caller supplied an invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A QUIC / transport-level error.
    #[error("transport error: {0}")]
    TransportError(String),

    /// An unclassified internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CsiError {
    /// Create a [`CsiError::TransportError`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn transport<E: std::fmt::Display>(e: E) -> Self {
        Self::TransportError(e.to_string())
    }

    /// Create a [`CsiError::Internal`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    /// Shorthand for a missing required argument.
    pub fn required(field: &str) -> Self {
        Self::InvalidArgument(format!("{field} is required"))
    }
}

/// Translate a volume-manager failure into the status a CSI caller sees.
impl From<ClientError> for CsiError {
    fn from(e: ClientError) -> Self {
        match &e {
            ClientError::Api { code, message, .. } => match code {
                ErrorCode::NotFound => Self::VolumeNotFound(message.clone()),
                ErrorCode::AlreadyExists => Self::VolumeAlreadyExists(message.clone()),
                ErrorCode::VolumeInUse => Self::FailedPrecondition(message.clone()),
                ErrorCode::InvalidRequest
                | ErrorCode::ValidationError
                | ErrorCode::InvalidBackend => Self::InvalidArgument(message.clone()),
                _ => Self::internal(&e),
            },
            _ => Self::internal(&e),
        }
    }
}
