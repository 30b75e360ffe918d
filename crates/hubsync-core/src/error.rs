//! Sync session errors
//!
//! Every variant is local to one peer's session: it never aborts the hub
//! scheduler or affects other peers.
//!
//! | Variant              | Wire kind             | Lifetime                        |
//! |----------------------|-----------------------|---------------------------------|
//! | `Protocol`           | (none, dropped)       | one message                     |
//! | `SchemaMismatch`     | `schema_mismatch`     | until versions align            |
//! | `OwnershipViolation` | `ownership_violation` | until the runner reconnects     |
//! | `Storage`            | `internal_error`      | one batch                       |
//! | `Link`               | (none)                | treated as disconnect           |

use thiserror::Error;

use crate::storage::StorageError;
use crate::sync::link::LinkError;
use crate::sync::message::{ErrorKind, ErrorPayload};

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("schema version mismatch: local {local}, remote {remote}")]
    SchemaMismatch { local: i64, remote: i64 },

    #[error("ownership violation in '{table}': expected host '{expected}', found '{found}'")]
    OwnershipViolation {
        table: String,
        expected: String,
        found: String,
    },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error("peer reported {}: {}", .0.error, .0.message)]
    Remote(ErrorPayload),
}

impl SyncError {
    /// Wire category for this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::SchemaMismatch { .. } => ErrorKind::SchemaMismatch,
            SyncError::OwnershipViolation { .. } => ErrorKind::OwnershipViolation,
            SyncError::Remote(payload) => payload.error,
            SyncError::Protocol(_) | SyncError::Storage(_) | SyncError::Link(_) => {
                ErrorKind::InternalError
            }
        }
    }

    /// Errors that pin a peer until operator intervention or reconnect
    pub fn is_permanent(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::SchemaMismatch | ErrorKind::OwnershipViolation
        )
    }

    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload::new(self.kind(), self.to_string())
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
