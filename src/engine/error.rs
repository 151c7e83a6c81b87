use thiserror::Error;
use ulid::Ulid;

use crate::directory::DirectoryError;
use crate::model::Span;

/// Coarse classification callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    FailedPrecondition,
    PermissionDenied,
    Internal,
}

impl ErrorKind {
    /// Every operation is one self-contained transaction, so storage failures
    /// can be retried as a whole. Nothing else is retryable.
    pub fn is_retryable(self) -> bool {
        self == ErrorKind::Internal
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid time range")]
    InvalidRange,
    #[error("slot duration must be positive")]
    InvalidDuration,
    #[error("invalid recurrence rule: {0}")]
    InvalidRule(String),
    #[error("cannot decode schedule rule: {0}")]
    RuleDecode(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: Ulid },
    #[error("slot is not free")]
    SlotNotFree(Ulid),
    #[error("slot already exists: {0}")]
    SlotExists(Ulid),
    #[error("client has conflicting booking")]
    ClientConflict { slot_id: Ulid, conflicts: Vec<Span> },
    #[error("provider has conflicting booking")]
    ProviderConflict { slot_id: Ulid, conflicts: Vec<Span> },
    #[error("slot {0} still has bookings")]
    SlotHasBookings(Ulid),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("directory lookup failed: {0}")]
    Directory(String),
    #[error("journal error: {0}")]
    Journal(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn not_found(entity: &'static str, id: Ulid) -> Self {
        EngineError::NotFound { entity, id }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidRange
            | EngineError::InvalidDuration
            | EngineError::InvalidArgument(_)
            | EngineError::LimitExceeded(_) => ErrorKind::InvalidArgument,
            EngineError::NotFound { .. } => ErrorKind::NotFound,
            EngineError::InvalidRule(_)
            | EngineError::RuleDecode(_)
            | EngineError::SlotNotFree(_)
            | EngineError::SlotExists(_)
            | EngineError::ClientConflict { .. }
            | EngineError::ProviderConflict { .. }
            | EngineError::SlotHasBookings(_) => ErrorKind::FailedPrecondition,
            EngineError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            EngineError::Directory(_) | EngineError::Journal(_) | EngineError::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }
}

impl From<DirectoryError> for EngineError {
    fn from(e: DirectoryError) -> Self {
        EngineError::Directory(e.to_string())
    }
}
