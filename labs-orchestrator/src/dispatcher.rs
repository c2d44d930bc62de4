//! Admission of task requests.
//!
//! A request becomes a durable queued task only if its target has no
//! non-terminal task; otherwise it merges into the one in flight. Admission
//! validates the target's transition and moves it to its in-progress status
//! in the same store transaction that writes the task.

use crate::attendee::AttendeeStatus;
use crate::broadcaster::{StatusBroadcaster, StatusEvent};
use crate::clock::Clock;
use crate::error::{ErrorCode, OrchestratorError, Result};
use crate::locks::{TargetKey, TargetLocks};
use crate::state_machine::{check, TransitionContext};
use crate::store::{AdmitOutcome, EntityStore, StatusChange};
use crate::task::{DeploymentTask, Queue, TargetKind, TaskKind, TaskRequest};
use crate::workshop::WorkshopStatus;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info};

/// Wakes idle queue workers when new work is admitted.
#[derive(Debug, Clone, Default)]
pub struct QueueWakeups {
    provisioning: Arc<Notify>,
    cleanup: Arc<Notify>,
}

impl QueueWakeups {
    pub fn get(&self, queue: Queue) -> Arc<Notify> {
        match queue {
            Queue::Provisioning => self.provisioning.clone(),
            Queue::Cleanup => self.cleanup.clone(),
        }
    }

    pub fn notify(&self, queue: Queue) {
        self.get(queue).notify_one();
    }

    pub fn notify_all_queues(&self) {
        for queue in Queue::ALL {
            self.notify(queue);
        }
    }
}

#[derive(Debug, Clone)]
pub enum Admission {
    /// A new task was queued.
    Accepted(DeploymentTask),
    /// The request was absorbed by the task already in flight.
    Merged(DeploymentTask),
}

impl Admission {
    pub fn task(&self) -> &DeploymentTask {
        match self {
            Admission::Accepted(task) | Admission::Merged(task) => task,
        }
    }

    pub fn is_merged(&self) -> bool {
        matches!(self, Admission::Merged(_))
    }
}

struct PlannedChange {
    change: StatusChange,
    origin: String,
    event: StatusEvent,
}

#[derive(Clone)]
pub struct TaskDispatcher {
    store: Arc<dyn EntityStore>,
    locks: TargetLocks,
    clock: Arc<dyn Clock>,
    broadcaster: StatusBroadcaster,
    wakeups: QueueWakeups,
    max_attempts: u32,
}

impl TaskDispatcher {
    pub fn new(
        store: Arc<dyn EntityStore>,
        locks: TargetLocks,
        clock: Arc<dyn Clock>,
        broadcaster: StatusBroadcaster,
        wakeups: QueueWakeups,
        max_attempts: u32,
    ) -> Self {
        Self {
            store,
            locks,
            clock,
            broadcaster,
            wakeups,
            max_attempts,
        }
    }

    /// Admit `request`, or merge it into the target's in-flight task.
    ///
    /// Rejected with `INVALID_TRANSITION` when the target's current status
    /// does not allow the work.
    pub async fn submit(&self, request: TaskRequest) -> Result<Admission> {
        let _guard = self
            .locks
            .lock(TargetKey {
                kind: request.target_type,
                id: request.target_id.clone(),
            })
            .await;

        if let Some(existing) = self
            .store
            .active_task_for_target(request.target_type, &request.target_id)
            .await?
        {
            info!(
                task_id = %existing.id,
                target_id = %request.target_id,
                requested = %request.kind,
                in_flight = %existing.kind,
                "request merged into in-flight task"
            );
            return Ok(Admission::Merged(existing));
        }

        let planned = self.plan_change(&request).await?;
        let now = self.clock.now();
        let task = DeploymentTask::new(&request, self.max_attempts, now)
            .with_origin_status(planned.origin);

        match self.store.admit_task(&task, Some(&planned.change), now).await? {
            AdmitOutcome::Admitted => {
                info!(
                    task_id = %task.id,
                    target = %request.target_type,
                    target_id = %request.target_id,
                    kind = %request.kind,
                    queue = %task.queue,
                    "task admitted"
                );
                self.broadcaster.publish(planned.event);
                self.wakeups.notify(task.queue);
                Ok(Admission::Accepted(task))
            }
            AdmitOutcome::Merged(existing) => {
                debug!(task_id = %existing.id, "admission raced an in-flight task");
                Ok(Admission::Merged(existing))
            }
            AdmitOutcome::Stale => Err(OrchestratorError::Conflict(format!(
                "{} {} changed status during admission",
                request.target_type, request.target_id
            ))),
        }
    }

    /// Queue destruction of a workspace whose attendee is gone or deleted.
    ///
    /// The task carries no status change, so the attendee row (if any) stays
    /// as it is.
    pub async fn submit_teardown(&self, attendee_id: &str) -> Result<Admission> {
        let _guard = self.locks.lock(TargetKey::attendee(attendee_id)).await;

        if let Some(existing) = self
            .store
            .active_task_for_target(TargetKind::Attendee, attendee_id)
            .await?
        {
            return Ok(Admission::Merged(existing));
        }

        let now = self.clock.now();
        let task = DeploymentTask::new(
            &TaskRequest::attendee(attendee_id, TaskKind::Cleanup),
            self.max_attempts,
            now,
        );

        match self.store.admit_task(&task, None, now).await? {
            AdmitOutcome::Admitted => {
                info!(task_id = %task.id, attendee_id, "workspace teardown queued");
                self.wakeups.notify(task.queue);
                Ok(Admission::Accepted(task))
            }
            AdmitOutcome::Merged(existing) => Ok(Admission::Merged(existing)),
            AdmitOutcome::Stale => Err(OrchestratorError::Conflict(format!(
                "attendee {} changed during teardown admission",
                attendee_id
            ))),
        }
    }

    async fn plan_change(&self, request: &TaskRequest) -> Result<PlannedChange> {
        let now = self.clock.now();
        let context = TransitionContext::default();

        match request.target_type {
            TargetKind::Attendee => {
                let attendee = self
                    .store
                    .get_attendee(&request.target_id)
                    .await?
                    .ok_or_else(|| OrchestratorError::NotFound(request.target_id.clone()))?;

                let to = match request.kind {
                    TaskKind::Deploy | TaskKind::Retry => AttendeeStatus::Deploying,
                    TaskKind::Cleanup => AttendeeStatus::Deleting,
                };
                if request.kind == TaskKind::Retry && attendee.status != AttendeeStatus::Failed {
                    return Err(OrchestratorError::rejected(
                        ErrorCode::InvalidTransition,
                        format!(
                            "attendee {} is {}, only failed attendees are retried",
                            attendee.id, attendee.status
                        ),
                    ));
                }
                check(attendee.status, to, &context).into_result(|| {
                    format!(
                        "attendee {} cannot go from {} to {}",
                        attendee.id, attendee.status, to
                    )
                })?;

                Ok(PlannedChange {
                    change: StatusChange::attendee(&attendee.id, attendee.status, to),
                    origin: attendee.status.to_string(),
                    event: StatusEvent::attendee(&attendee.id, &attendee.workshop_id, to, now),
                })
            }
            TargetKind::Workshop => {
                let workshop = self
                    .store
                    .get_workshop(&request.target_id)
                    .await?
                    .ok_or_else(|| OrchestratorError::NotFound(request.target_id.clone()))?;

                let to = match request.kind {
                    TaskKind::Deploy | TaskKind::Retry => WorkshopStatus::Deploying,
                    TaskKind::Cleanup => WorkshopStatus::Deleting,
                };
                check(workshop.status, to, &context).into_result(|| {
                    format!(
                        "workshop {} cannot go from {} to {}",
                        workshop.id, workshop.status, to
                    )
                })?;

                Ok(PlannedChange {
                    change: StatusChange::workshop(&workshop.id, workshop.status, to),
                    origin: workshop.status.to_string(),
                    event: StatusEvent::workshop(&workshop.id, to, now),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::store::SqliteStore;
    use crate::task::TaskState;
    use crate::test_utils::{create_test_db, sample_attendee, sample_workshop};

    async fn dispatcher() -> (TaskDispatcher, Arc<SqliteStore>, String) {
        let store = Arc::new(SqliteStore::new(create_test_db().await));
        let workshop = sample_workshop("Dispatch");
        store.insert_workshop(&workshop).await.unwrap();
        let attendee = sample_attendee(&workshop.id, "anna");
        store.insert_attendee(&attendee).await.unwrap();

        let dispatcher = TaskDispatcher::new(
            store.clone(),
            TargetLocks::new(),
            Arc::new(SystemClock),
            StatusBroadcaster::new(16),
            QueueWakeups::default(),
            3,
        );
        (dispatcher, store, attendee.id)
    }

    #[tokio::test]
    async fn admission_moves_target_to_in_progress() {
        let (dispatcher, store, attendee_id) = dispatcher().await;

        let admission = dispatcher
            .submit(TaskRequest::attendee(&attendee_id, TaskKind::Deploy))
            .await
            .unwrap();
        assert!(!admission.is_merged());
        assert_eq!(admission.task().state, TaskState::Queued);
        assert_eq!(admission.task().origin_status.as_deref(), Some("planning"));

        let attendee = store.get_attendee(&attendee_id).await.unwrap().unwrap();
        assert_eq!(attendee.status, AttendeeStatus::Deploying);
    }

    #[tokio::test]
    async fn duplicate_request_merges() {
        let (dispatcher, _, attendee_id) = dispatcher().await;

        let first = dispatcher
            .submit(TaskRequest::attendee(&attendee_id, TaskKind::Deploy))
            .await
            .unwrap();
        let second = dispatcher
            .submit(TaskRequest::attendee(&attendee_id, TaskKind::Deploy))
            .await
            .unwrap();

        assert!(second.is_merged());
        assert_eq!(first.task().id, second.task().id);
    }

    #[tokio::test]
    async fn concurrent_requests_admit_exactly_one_task() {
        let (dispatcher, store, attendee_id) = dispatcher().await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let dispatcher = dispatcher.clone();
            let id = attendee_id.clone();
            handles.push(tokio::spawn(async move {
                dispatcher
                    .submit(TaskRequest::attendee(id, TaskKind::Deploy))
                    .await
                    .unwrap()
            }));
        }

        let mut accepted = 0;
        for handle in handles {
            if !handle.await.unwrap().is_merged() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 1);

        let tasks = store
            .list_tasks_for_target(TargetKind::Attendee, &attendee_id)
            .await
            .unwrap();
        assert_eq!(tasks.len(), 1);
    }

    #[tokio::test]
    async fn retry_requires_failed_attendee() {
        let (dispatcher, _, attendee_id) = dispatcher().await;

        let err = dispatcher
            .submit(TaskRequest::attendee(&attendee_id, TaskKind::Retry))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::InvalidTransition));
    }

    #[tokio::test]
    async fn teardown_leaves_attendee_status_alone() {
        let (dispatcher, store, _) = dispatcher().await;

        let admission = dispatcher.submit_teardown("ghost").await.unwrap();
        assert!(!admission.is_merged());
        assert_eq!(admission.task().kind, TaskKind::Cleanup);
        assert_eq!(admission.task().queue, Queue::Cleanup);
        assert!(admission.task().origin_status.is_none());

        let again = dispatcher.submit_teardown("ghost").await.unwrap();
        assert!(again.is_merged());
        assert!(store.get_attendee("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_target_is_not_found() {
        let (dispatcher, _, _) = dispatcher().await;
        let err = dispatcher
            .submit(TaskRequest::attendee("nope", TaskKind::Deploy))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound(_)));
    }
}
