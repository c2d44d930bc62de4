use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Stable machine-readable codes attached to rejected requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidTransition,
    UnknownStatus,
    WorkshopNotPlanning,
    DeleteBlocked,
    InvalidSchedule,
    InvalidTimezone,
    NamingPolicy,
    DuplicateIdentifier,
    InvalidInput,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidTransition => "INVALID_TRANSITION",
            ErrorCode::UnknownStatus => "UNKNOWN_STATUS",
            ErrorCode::WorkshopNotPlanning => "WORKSHOP_NOT_PLANNING",
            ErrorCode::DeleteBlocked => "DELETE_BLOCKED",
            ErrorCode::InvalidSchedule => "INVALID_SCHEDULE",
            ErrorCode::InvalidTimezone => "INVALID_TIMEZONE",
            ErrorCode::NamingPolicy => "NAMING_POLICY",
            ErrorCode::DuplicateIdentifier => "DUPLICATE_IDENTIFIER",
            ErrorCode::InvalidInput => "INVALID_INPUT",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{code}: {message}")]
    Rejected { code: ErrorCode, message: String },

    #[error("Concurrent modification: {0}")]
    Conflict(String),

    #[error("Infrastructure error: {0}")]
    Infra(#[from] crate::engine::InfraError),

    #[error(transparent)]
    Core(#[from] labs_core::LabsError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl OrchestratorError {
    pub fn rejected(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Rejected {
            code,
            message: message.into(),
        }
    }

    /// The rejection code, if this error is a refused request.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Rejected { code, .. } => Some(*code),
            _ => None,
        }
    }
}
