use std::fmt::{self, Display, Formatter};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LabsError {
    Config(String),
    Io(#[from] std::io::Error),
    Command(String),
    Timeout(String),
    Dependency(String),
    Validation(String),
    Serialization(String),
    Internal(String),
    Other(#[from] anyhow::Error),
}

impl Display for LabsError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            LabsError::Config(s) => write!(f, "Configuration error: {}", s),
            LabsError::Io(e) => write!(f, "I/O error: {}", e),
            LabsError::Command(s) => write!(f, "Command failed: {}", s),
            LabsError::Timeout(s) => write!(f, "Timed out: {}", s),
            LabsError::Dependency(s) => {
                write!(f, "Dependency not found: {}\n\n", s)?;
                write!(f, "Fix:\n")?;
                write!(f, "  • Install the infrastructure tool, or\n")?;
                write!(f, "  • Set provisioning.terraform_binary in labs.yaml")
            }
            LabsError::Validation(s) => write!(f, "Validation error: {}", s),
            LabsError::Serialization(s) => write!(f, "Serialization error: {}", s),
            LabsError::Internal(s) => write!(f, "Internal error: {}", s),
            LabsError::Other(e) => write!(f, "Other error: {}", e),
        }
    }
}

impl From<serde_json::Error> for LabsError {
    fn from(err: serde_json::Error) -> Self {
        LabsError::Serialization(err.to_string())
    }
}

impl LabsError {
    /// True when the failure came from a command exceeding its hard timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, LabsError::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, LabsError>;
