//! Per-attempt records of what the infrastructure tool did.

use crate::task::{DeploymentTask, TaskKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum LogPhase {
    Started,
    Completed,
    /// Failed transiently and went back to the queue.
    Retrying,
    Failed,
}

impl fmt::Display for LogPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogPhase::Started => f.write_str("started"),
            LogPhase::Completed => f.write_str("completed"),
            LogPhase::Retrying => f.write_str("retrying"),
            LogPhase::Failed => f.write_str("failed"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentLog {
    pub id: String,
    pub task_id: String,
    pub target_id: String,
    pub kind: TaskKind,
    pub attempt: u32,
    pub phase: LogPhase,
    pub output: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl DeploymentLog {
    pub fn new(task: &DeploymentTask, phase: LogPhase, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_id: task.id.clone(),
            target_id: task.target_id.clone(),
            kind: task.kind,
            attempt: task.attempt_count,
            phase,
            output: None,
            error: None,
            created_at: now,
        }
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        let output = output.into();
        if !output.trim().is_empty() {
            self.output = Some(output);
        }
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}
