use thiserror::Error;

/// Errors produced by the synchronization core.
///
/// Every fallible call in the crate returns one of these. None of them are
/// fatal to the process: construction errors mean the input must be fixed,
/// `RequiresManualResolution` means the conflict needs a `UserDecision`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error("Validation error: {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Invalid device id '{0}': must be 1-64 characters of [A-Za-z0-9_-]")]
    InvalidDeviceId(String),

    #[error("Invalid clock: {0}")]
    InvalidClock(String),

    #[error("Payload too large: {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("A conflict needs at least 2 operations, got {0}")]
    InsufficientOperations(usize),

    #[error("Unknown conflict type: {0}")]
    UnknownConflictType(String),

    #[error("Conflict {conflict_id} requires manual resolution: {reason}")]
    RequiresManualResolution { conflict_id: String, reason: String },

    #[error("Transformation failed: {0}")]
    TransformationFailure(String),

    #[error("Conflict not found: {0}")]
    ConflictNotFound(String),

    #[error("Invalid decision: {0}")]
    InvalidDecision(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Sync worker unavailable: {0}")]
    WorkerUnavailable(String),
}

impl SyncError {
    pub(crate) fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        SyncError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Errors that send a conflict down the manual path instead of failing
    /// the apply call.
    pub fn is_escalation(&self) -> bool {
        matches!(
            self,
            SyncError::RequiresManualResolution { .. } | SyncError::TransformationFailure(_)
        )
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
