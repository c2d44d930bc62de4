use crate::error::{ErrorCode, OrchestratorError, Result};
use chrono::{DateTime, Duration, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum WorkshopStatus {
    Planning,
    Deploying,
    Active,
    Completed,
    Failed,
    Deleting,
    Deleted,
}

impl WorkshopStatus {
    pub const ALL: [WorkshopStatus; 7] = [
        WorkshopStatus::Planning,
        WorkshopStatus::Deploying,
        WorkshopStatus::Active,
        WorkshopStatus::Completed,
        WorkshopStatus::Failed,
        WorkshopStatus::Deleting,
        WorkshopStatus::Deleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkshopStatus::Planning => "planning",
            WorkshopStatus::Deploying => "deploying",
            WorkshopStatus::Active => "active",
            WorkshopStatus::Completed => "completed",
            WorkshopStatus::Failed => "failed",
            WorkshopStatus::Deleting => "deleting",
            WorkshopStatus::Deleted => "deleted",
        }
    }
}

impl fmt::Display for WorkshopStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkshopStatus {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| {
                OrchestratorError::rejected(
                    ErrorCode::UnknownStatus,
                    format!("unknown workshop status '{}'", s),
                )
            })
    }
}

/// When a workshop runs, and the timezone its wall-clock times belong to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// IANA timezone name, e.g. `Europe/Berlin`.
    pub timezone: String,
}

impl Schedule {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>, timezone: impl Into<String>) -> Self {
        Self {
            start,
            end,
            timezone: timezone.into(),
        }
    }

    pub fn tz(&self) -> Result<Tz> {
        self.timezone.parse::<Tz>().map_err(|_| {
            OrchestratorError::rejected(
                ErrorCode::InvalidTimezone,
                format!("'{}' is not a known IANA timezone", self.timezone),
            )
        })
    }

    pub fn validate(&self) -> Result<()> {
        self.tz()?;
        if self.start >= self.end {
            return Err(OrchestratorError::rejected(
                ErrorCode::InvalidSchedule,
                format!(
                    "start {} must be before end {}",
                    self.start.to_rfc3339(),
                    self.end.to_rfc3339()
                ),
            ));
        }
        Ok(())
    }

    pub fn has_ended(&self, now: DateTime<Utc>) -> bool {
        self.end <= now
    }

    /// The instant cleanup becomes due: `delay` of wall-clock time after the
    /// end, counted in the workshop's own timezone.
    ///
    /// Across a DST change the result differs from plain UTC arithmetic. A
    /// wall-clock time that falls into a gap resolves to the first valid
    /// instant after it; an ambiguous one resolves to the earlier offset.
    pub fn cleanup_due_at(&self, delay: Duration) -> Result<DateTime<Utc>> {
        let tz = self.tz()?;
        let local_end = self.end.with_timezone(&tz).naive_local();
        let local_due = local_end + delay;

        let mut probe = local_due;
        for _ in 0..=120 {
            if let Some(due) = tz.from_local_datetime(&probe).earliest() {
                return Ok(due.with_timezone(&Utc));
            }
            probe += Duration::minutes(1);
        }

        // Gaps never exceed two hours in the tz database.
        Ok(self.end + delay)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workshop {
    pub id: String,
    pub name: String,
    pub schedule: Schedule,
    pub status: WorkshopStatus,
    pub cleanup_scheduled_at: Option<DateTime<Utc>>,
    /// Infrastructure template for this workshop's attendees; the configured
    /// default when unset.
    pub template: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewWorkshop {
    pub name: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub timezone: String,
    #[serde(default)]
    pub template: Option<String>,
}

impl NewWorkshop {
    pub fn schedule(&self) -> Schedule {
        Schedule::new(self.start, self.end, self.timezone.clone())
    }
}
