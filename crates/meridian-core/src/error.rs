//! Shared error kinds for control-plane operations.
//!
//! Subsystems define their own error enums; the variants here are the
//! cross-cutting kinds that travel between crates (a router lookup miss, a
//! registration conflict, a cancelled call).

use thiserror::Error;

/// Errors shared across control-plane subsystems.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A referenced entity does not exist.
    #[error("not found: {kind} {id}")]
    NotFound {
        /// Entity kind (e.g. `node`, `agent`, `binding`).
        kind: &'static str,
        /// The identifier that missed.
        id: String,
    },

    /// The entity already exists and cannot be created again.
    #[error("conflict: {kind} {id} already exists")]
    Conflict {
        /// Entity kind.
        kind: &'static str,
        /// The conflicting identifier.
        id: String,
    },

    /// Invalid input to a public operation.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The caller lacks a required credential or capability.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,
}

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;
