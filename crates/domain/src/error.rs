use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("not found")]
    NotFound,
    #[error("conflict")]
    Conflict,
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl DomainError {
    /// Store outages are worth retrying; everything else reflects the data.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Stable error codes surfaced in apply results, compile errors and job failures.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidPatchPaths,
    DocNotFound,
    UnsupportedOp,
    AliasBothFields,
    AliasNoTarget,
    ApplyGateBlocked,
    LockContention,
    Exception,
    InvalidPayload,
    UnsupportedJobType,
    IdempotencyInProgress,
    CompileErrors,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidPatchPaths => "INVALID_PATCH_PATHS",
            Self::DocNotFound => "DOC_NOT_FOUND",
            Self::UnsupportedOp => "UNSUPPORTED_OP",
            Self::AliasBothFields => "ALIAS_BOTH_FIELDS",
            Self::AliasNoTarget => "ALIAS_NO_TARGET",
            Self::ApplyGateBlocked => "APPLY_GATE_BLOCKED",
            Self::LockContention => "LOCK_CONTENTION",
            Self::Exception => "EXCEPTION",
            Self::InvalidPayload => "INVALID_PAYLOAD",
            Self::UnsupportedJobType => "UNSUPPORTED_JOB_TYPE",
            Self::IdempotencyInProgress => "IDEMPOTENCY_IN_PROGRESS",
            Self::CompileErrors => "COMPILE_ERRORS",
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::LockContention | Self::Exception | Self::IdempotencyInProgress
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure attributable to a single operation of a plan.
#[derive(Clone, Debug, Error, PartialEq)]
#[error("{code}: {message}")]
pub struct OperationFault {
    pub code: ErrorCode,
    pub target: Option<String>,
    pub message: String,
}

impl OperationFault {
    pub fn new(code: ErrorCode, target: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            code,
            target: target.map(str::to_string),
            message: message.into(),
        }
    }

    pub fn not_found(target: &str, kind: &str) -> Self {
        Self::new(
            ErrorCode::DocNotFound,
            Some(target),
            format!("{kind} '{target}' not found"),
        )
    }
}

impl From<DomainError> for OperationFault {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::NotFound => Self::new(ErrorCode::DocNotFound, None, "document not found"),
            other => Self::new(ErrorCode::Exception, None, other.to_string()),
        }
    }
}
