//! Reconciler error types.

use thiserror::Error;

use crate::clients::ApiError;
use crate::descriptor::{DescriptorError, ResourceRef};
use crate::diff::DiffError;

/// Errors that abort a reconcile operation.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Descriptor failed validation before any remote call.
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(#[from] DescriptorError),

    /// Desired state cannot be reached from the applied state.
    #[error("invalid change: {0}")]
    InvalidChange(#[from] DiffError),

    /// Caller passed state for a different guest.
    #[error("state is for guest {actual}, not {expected}")]
    IdMismatch { expected: u32, actual: u32 },

    #[error("failed to create {target}: {source}")]
    Create {
        target: ResourceRef,
        #[source]
        source: ApiError,
    },

    #[error("failed to update {target}: {source}")]
    Update {
        target: ResourceRef,
        #[source]
        source: ApiError,
    },

    #[error("failed to delete {target} after {attempts} attempt(s): {source}")]
    Delete {
        target: ResourceRef,
        attempts: u32,
        #[source]
        source: ApiError,
    },
}

impl ReconcileError {
    /// Underlying API failure, if any.
    pub fn api_error(&self) -> Option<&ApiError> {
        match self {
            ReconcileError::Create { source, .. }
            | ReconcileError::Update { source, .. }
            | ReconcileError::Delete { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Result type for reconcile operations.
pub type Result<T> = std::result::Result<T, ReconcileError>;
