use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Workshop,
    Attendee,
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetKind::Workshop => f.write_str("workshop"),
            TargetKind::Attendee => f.write_str("attendee"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Deploy,
    Cleanup,
    Retry,
}

impl TaskKind {
    pub fn queue(&self) -> Queue {
        match self {
            TaskKind::Deploy | TaskKind::Retry => Queue::Provisioning,
            TaskKind::Cleanup => Queue::Cleanup,
        }
    }

    pub fn provisions(&self) -> bool {
        matches!(self, TaskKind::Deploy | TaskKind::Retry)
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Deploy => f.write_str("deploy"),
            TaskKind::Cleanup => f.write_str("cleanup"),
            TaskKind::Retry => f.write_str("retry"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed)
    }
}

/// Independent worker queues, each with its own concurrency ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Queue {
    Provisioning,
    Cleanup,
}

impl Queue {
    pub const ALL: [Queue; 2] = [Queue::Provisioning, Queue::Cleanup];
}

impl fmt::Display for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Queue::Provisioning => f.write_str("provisioning"),
            Queue::Cleanup => f.write_str("cleanup"),
        }
    }
}

/// A request for work against one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRequest {
    pub target_type: TargetKind,
    pub target_id: String,
    pub kind: TaskKind,
}

impl TaskRequest {
    pub fn new(target_type: TargetKind, target_id: impl Into<String>, kind: TaskKind) -> Self {
        Self {
            target_type,
            target_id: target_id.into(),
            kind,
        }
    }

    pub fn attendee(target_id: impl Into<String>, kind: TaskKind) -> Self {
        Self::new(TargetKind::Attendee, target_id, kind)
    }

    pub fn workshop(target_id: impl Into<String>, kind: TaskKind) -> Self {
        Self::new(TargetKind::Workshop, target_id, kind)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentTask {
    pub id: String,
    pub target_type: TargetKind,
    pub target_id: String,
    pub kind: TaskKind,
    pub queue: Queue,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub state: TaskState,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Target status before admission, restored if the task is cancelled
    /// while still queued.
    pub origin_status: Option<String>,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
}

impl DeploymentTask {
    pub fn new(request: &TaskRequest, max_attempts: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            target_type: request.target_type,
            target_id: request.target_id.clone(),
            kind: request.kind,
            queue: request.kind.queue(),
            attempt_count: 0,
            max_attempts: max_attempts.max(1),
            state: TaskState::Queued,
            scheduled_at: now,
            started_at: None,
            finished_at: None,
            last_error: None,
            origin_status: None,
            cancel_requested: false,
            created_at: now,
        }
    }

    pub fn with_origin_status(mut self, status: impl Into<String>) -> Self {
        self.origin_status = Some(status.into());
        self
    }

    /// Whether another attempt may follow the one that just ran.
    pub fn can_retry(&self) -> bool {
        self.attempt_count < self.max_attempts
    }
}

/// Exponential backoff before attempt `attempt + 1`: `base * 2^(attempt-1)`,
/// capped at `max`.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.checked_mul(1u32 << exponent)
        .map_or(max, |delay| delay.min(max))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_queues() {
        assert_eq!(TaskKind::Deploy.queue(), Queue::Provisioning);
        assert_eq!(TaskKind::Retry.queue(), Queue::Provisioning);
        assert_eq!(TaskKind::Cleanup.queue(), Queue::Cleanup);
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let base = Duration::from_secs(30);
        let max = Duration::from_secs(900);
        assert_eq!(backoff_delay(1, base, max), Duration::from_secs(30));
        assert_eq!(backoff_delay(2, base, max), Duration::from_secs(60));
        assert_eq!(backoff_delay(3, base, max), Duration::from_secs(120));
        assert_eq!(backoff_delay(10, base, max), max);
        assert_eq!(backoff_delay(u32::MAX, base, max), max);
    }

    #[test]
    fn new_task_is_queued_with_no_attempts() {
        let now = Utc::now();
        let task = DeploymentTask::new(&TaskRequest::attendee("a1", TaskKind::Cleanup), 3, now);
        assert_eq!(task.state, TaskState::Queued);
        assert_eq!(task.queue, Queue::Cleanup);
        assert_eq!(task.attempt_count, 0);
        assert!(task.can_retry());
    }
}
