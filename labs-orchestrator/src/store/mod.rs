//! Durable state for workshops, attendees and tasks.
//!
//! Implementations must make every status write a compare-and-set on the
//! expected prior status, and must commit a task's settlement together with
//! the status change it produces.

mod sqlite;

pub use sqlite::SqliteStore;

use crate::attendee::{Attendee, AttendeeStatus, Credentials};
use crate::deployment_log::DeploymentLog;
use crate::error::Result;
use crate::task::{DeploymentTask, Queue, TargetKind, TaskState};
use crate::workshop::{Workshop, WorkshopStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// How an optional column changes alongside a status write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum FieldUpdate<T> {
    #[default]
    Keep,
    Set(T),
    Clear,
}

impl<T: Clone> FieldUpdate<T> {
    pub fn is_keep(&self) -> bool {
        matches!(self, FieldUpdate::Keep)
    }

    /// `None` to leave the column alone, `Some(value)` to overwrite it.
    pub fn binding(&self) -> Option<Option<T>> {
        match self {
            FieldUpdate::Keep => None,
            FieldUpdate::Set(value) => Some(Some(value.clone())),
            FieldUpdate::Clear => Some(None),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttendeePatch {
    pub workspace_id: FieldUpdate<String>,
    pub credentials: FieldUpdate<Credentials>,
    pub last_error: FieldUpdate<String>,
}

/// A compare-and-set status write on one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusChange {
    Workshop {
        id: String,
        from: WorkshopStatus,
        to: WorkshopStatus,
    },
    Attendee {
        id: String,
        from: AttendeeStatus,
        to: AttendeeStatus,
        patch: AttendeePatch,
    },
}

impl StatusChange {
    pub fn workshop(id: impl Into<String>, from: WorkshopStatus, to: WorkshopStatus) -> Self {
        StatusChange::Workshop {
            id: id.into(),
            from,
            to,
        }
    }

    pub fn attendee(id: impl Into<String>, from: AttendeeStatus, to: AttendeeStatus) -> Self {
        StatusChange::Attendee {
            id: id.into(),
            from,
            to,
            patch: AttendeePatch::default(),
        }
    }

    pub fn with_patch(self, patch: AttendeePatch) -> Self {
        match self {
            StatusChange::Attendee { id, from, to, .. } => StatusChange::Attendee {
                id,
                from,
                to,
                patch,
            },
            other => other,
        }
    }
}

#[derive(Debug, Clone)]
pub enum AdmitOutcome {
    /// The task was written and the target moved to its in-progress status.
    Admitted,
    /// A non-terminal task already exists for the target.
    Merged(DeploymentTask),
    /// The target's status changed since it was read.
    Stale,
}

/// Terminal result of a running task.
#[derive(Debug, Clone)]
pub struct Settlement {
    pub task_id: String,
    pub state: TaskState,
    pub last_error: Option<String>,
    pub change: Option<StatusChange>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Settled {
    /// False when the task was no longer running, e.g. redelivered.
    pub task_updated: bool,
    pub status_applied: bool,
    pub cancel_requested: bool,
}

#[derive(Debug, Clone, Default)]
pub struct WorkshopFilter {
    pub status: Option<WorkshopStatus>,
}

#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn insert_workshop(&self, workshop: &Workshop) -> Result<()>;
    async fn get_workshop(&self, id: &str) -> Result<Option<Workshop>>;
    async fn list_workshops(&self, filter: &WorkshopFilter) -> Result<Vec<Workshop>>;

    /// Removes the workshop together with its attendees, their tasks and
    /// their deployment logs.
    async fn delete_workshop(&self, id: &str) -> Result<bool>;

    /// Writes `cleanup_scheduled_at` only if it is still unset.
    async fn set_cleanup_scheduled_at(
        &self,
        id: &str,
        at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Active or completed workshops whose end has passed and which have no
    /// cleanup time yet.
    async fn ended_workshops_without_cleanup(&self, now: DateTime<Utc>) -> Result<Vec<Workshop>>;

    /// Active or completed workshops whose cleanup time has passed and which
    /// have no non-terminal cleanup task.
    async fn due_cleanup_workshops(&self, now: DateTime<Utc>) -> Result<Vec<Workshop>>;

    async fn insert_attendee(&self, attendee: &Attendee) -> Result<()>;
    async fn get_attendee(&self, id: &str) -> Result<Option<Attendee>>;
    async fn list_attendees(&self, workshop_id: &str) -> Result<Vec<Attendee>>;

    /// Compare-and-set; false when the entity is missing or not in `from`.
    async fn apply_status_change(&self, change: &StatusChange, now: DateTime<Utc>)
        -> Result<bool>;

    /// Atomically applies `change` and writes `task`, unless the target
    /// already has a non-terminal task.
    async fn admit_task(
        &self,
        task: &DeploymentTask,
        change: Option<&StatusChange>,
        now: DateTime<Utc>,
    ) -> Result<AdmitOutcome>;

    async fn get_task(&self, id: &str) -> Result<Option<DeploymentTask>>;
    async fn active_task_for_target(
        &self,
        target_type: TargetKind,
        target_id: &str,
    ) -> Result<Option<DeploymentTask>>;
    async fn list_tasks_for_target(
        &self,
        target_type: TargetKind,
        target_id: &str,
    ) -> Result<Vec<DeploymentTask>>;

    /// Moves the oldest due queued task of `queue` to running and counts the
    /// attempt.
    async fn claim_next_task(&self, queue: Queue, now: DateTime<Utc>)
        -> Result<Option<DeploymentTask>>;

    async fn settle_task(&self, settlement: &Settlement, now: DateTime<Utc>) -> Result<Settled>;

    /// Returns a running task to the queue, due at `run_at`.
    async fn reschedule_task(
        &self,
        id: &str,
        run_at: DateTime<Utc>,
        last_error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Deletes a task that has not started, applying `revert` in the same
    /// transaction. `None` if the task was not queued.
    async fn cancel_queued_task(
        &self,
        id: &str,
        revert: Option<&StatusChange>,
        now: DateTime<Utc>,
    ) -> Result<Option<DeploymentTask>>;

    /// Flags a running task so its completion triggers compensation.
    async fn request_task_cancel(&self, id: &str, now: DateTime<Utc>) -> Result<bool>;

    /// Returns running tasks started at or before `started_before` to the
    /// queue, due immediately.
    async fn requeue_running_tasks(
        &self,
        started_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64>;

    async fn append_deployment_log(&self, log: &DeploymentLog) -> Result<()>;

    /// Oldest first.
    async fn list_deployment_logs(&self, target_id: &str) -> Result<Vec<DeploymentLog>>;
}
