use crate::error::{ErrorCode, OrchestratorError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AttendeeStatus {
    Planning,
    Deploying,
    Active,
    Failed,
    Deleting,
    Deleted,
}

impl AttendeeStatus {
    pub const ALL: [AttendeeStatus; 6] = [
        AttendeeStatus::Planning,
        AttendeeStatus::Deploying,
        AttendeeStatus::Active,
        AttendeeStatus::Failed,
        AttendeeStatus::Deleting,
        AttendeeStatus::Deleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AttendeeStatus::Planning => "planning",
            AttendeeStatus::Deploying => "deploying",
            AttendeeStatus::Active => "active",
            AttendeeStatus::Failed => "failed",
            AttendeeStatus::Deleting => "deleting",
            AttendeeStatus::Deleted => "deleted",
        }
    }

    /// Attendees in these states hold, or are acquiring, live resources.
    pub fn is_busy(&self) -> bool {
        matches!(self, AttendeeStatus::Deploying | AttendeeStatus::Active)
    }
}

impl fmt::Display for AttendeeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttendeeStatus {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| {
                OrchestratorError::rejected(
                    ErrorCode::UnknownStatus,
                    format!("unknown attendee status '{}'", s),
                )
            })
    }
}

/// Access details produced by a successful deployment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub project_id: String,
    #[serde(default)]
    pub project_urn: Option<String>,
    #[serde(default)]
    pub user_urn: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl Credentials {
    /// Copy without the secret, for logs and overviews.
    pub fn redacted(&self) -> Self {
        Self {
            password: None,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attendee {
    pub id: String,
    pub workshop_id: String,
    pub username: String,
    /// Infra-safe form of `username`; the name every provider resource uses.
    pub sanitized_identifier: String,
    pub email: String,
    pub status: AttendeeStatus,
    pub workspace_id: Option<String>,
    pub credentials: Option<Credentials>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAttendee {
    pub username: String,
    pub email: String,
}

impl NewAttendee {
    pub fn new(username: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            email: email.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_states_are_deploying_and_active() {
        let busy: Vec<_> = AttendeeStatus::ALL
            .into_iter()
            .filter(|s| s.is_busy())
            .collect();
        assert_eq!(busy, vec![AttendeeStatus::Deploying, AttendeeStatus::Active]);
    }

    #[test]
    fn redacted_credentials_drop_password() {
        let creds = Credentials {
            project_id: "p-1".into(),
            password: Some("secret".into()),
            ..Default::default()
        };
        let redacted = creds.redacted();
        assert_eq!(redacted.project_id, "p-1");
        assert!(redacted.password.is_none());
        assert!(!serde_json::to_string(&redacted).unwrap().contains("secret"));
    }
}
