//! Task execution and the per-queue worker pools.
//!
//! An attendee's status lock is held only while its status is read and while
//! the task settles. The infrastructure run in between holds the workspace
//! lock instead, so admissions and cancellations for that attendee answer
//! while the tool is still running.

use crate::attendee::{Attendee, AttendeeStatus, Credentials};
use crate::broadcaster::StatusEvent;
use crate::deployment_log::{DeploymentLog, LogPhase};
use crate::engine::{AttendeeSpec, InfraError, RemoteState, WorkspaceManager};
use crate::error::Result;
use crate::locks::TargetKey;
use crate::orchestrator::Orchestrator;
use crate::store::{AttendeePatch, FieldUpdate, Settlement, StatusChange};
use crate::task::{
    backoff_delay, DeploymentTask, Queue, TargetKind, TaskKind, TaskRequest, TaskState,
};
use crate::workshop::WorkshopStatus;
use labs_config::WorkerPoolConfig;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// What a finished infrastructure operation produced.
enum WorkOutcome {
    Deployed {
        workspace_id: String,
        credentials: Credentials,
        output: String,
    },
    Destroyed {
        output: String,
    },
}

/// Work left over once a task has settled and its lock is released.
struct Followup {
    workshop_id: String,
    compensate: Option<String>,
}

fn in_progress_status(kind: TaskKind) -> AttendeeStatus {
    match kind {
        TaskKind::Deploy | TaskKind::Retry => AttendeeStatus::Deploying,
        TaskKind::Cleanup => AttendeeStatus::Deleting,
    }
}

fn succeeded(task: &DeploymentTask, change: Option<StatusChange>) -> Settlement {
    Settlement {
        task_id: task.id.clone(),
        state: TaskState::Succeeded,
        last_error: None,
        change,
    }
}

fn failed(task: &DeploymentTask, message: &str, change: Option<StatusChange>) -> Settlement {
    Settlement {
        task_id: task.id.clone(),
        state: TaskState::Failed,
        last_error: Some(message.to_string()),
        change,
    }
}

impl Orchestrator {
    /// Run a claimed task to a terminal state or back into the queue.
    ///
    /// Errors are logged, not returned: a task whose settlement could not be
    /// written stays running and is redelivered by the stale-task sweep.
    pub(crate) async fn execute(&self, task: DeploymentTask) {
        let result = match task.target_type {
            TargetKind::Workshop => self.execute_workshop_task(&task).await,
            TargetKind::Attendee => self.execute_attendee_task(&task).await,
        };

        let followup = match result {
            Ok(Some(followup)) => followup,
            Ok(None) => return,
            Err(e) => {
                error!(task_id = %task.id, error = %e, "task execution aborted");
                return;
            }
        };

        if let Some(attendee_id) = followup.compensate {
            match self
                .dispatcher
                .submit(TaskRequest::attendee(&attendee_id, TaskKind::Cleanup))
                .await
            {
                Ok(admission) => info!(
                    attendee_id = %attendee_id,
                    task_id = %admission.task().id,
                    "queued cleanup for cancelled deployment"
                ),
                Err(e) => warn!(
                    attendee_id = %attendee_id,
                    error = %e,
                    "could not queue cleanup for cancelled deployment"
                ),
            }
        }

        if let Err(e) = self.refresh_workshop_status(&followup.workshop_id).await {
            warn!(workshop_id = %followup.workshop_id, error = %e, "workshop refresh failed");
        }
    }

    /// Tasks for workshops without attendees carry no infrastructure.
    async fn execute_workshop_task(&self, task: &DeploymentTask) -> Result<Option<Followup>> {
        let _guard = self.locks.lock(TargetKey::workshop(&task.target_id)).await;

        let (from, to) = match task.kind {
            TaskKind::Cleanup => (WorkshopStatus::Deleting, WorkshopStatus::Deleted),
            TaskKind::Deploy | TaskKind::Retry => {
                (WorkshopStatus::Deploying, WorkshopStatus::Active)
            }
        };
        let now = self.now();
        let change = StatusChange::workshop(&task.target_id, from, to);
        let settled = self
            .store
            .settle_task(&succeeded(task, Some(change)), now)
            .await?;

        if settled.status_applied {
            info!(workshop_id = %task.target_id, status = %to, "workshop task completed");
            self.broadcaster
                .publish(StatusEvent::workshop(&task.target_id, to, now));
        } else {
            debug!(task_id = %task.id, "workshop task settled without status change");
        }
        Ok(None)
    }

    async fn execute_attendee_task(&self, task: &DeploymentTask) -> Result<Option<Followup>> {
        let expected = in_progress_status(task.kind);

        let attendee = {
            let _guard = self.locks.lock(TargetKey::attendee(&task.target_id)).await;
            match self.store.get_attendee(&task.target_id).await? {
                Some(attendee) if attendee.status == expected => Some(attendee),
                // Teardown of a workspace nobody owns any more.
                other
                    if task.kind == TaskKind::Cleanup
                        && other
                            .as_ref()
                            .map_or(true, |a| a.status == AttendeeStatus::Deleted) =>
                {
                    None
                }
                other => {
                    let reason = match other {
                        Some(a) => format!("attendee is {}, expected {}", a.status, expected),
                        None => "attendee no longer exists".to_string(),
                    };
                    warn!(
                        task_id = %task.id,
                        attendee_id = %task.target_id,
                        %reason,
                        "dropping task"
                    );
                    self.store
                        .settle_task(&failed(task, &reason, None), self.now())
                        .await?;
                    return Ok(None);
                }
            }
        };
        let Some(attendee) = attendee else {
            self.execute_teardown(task).await?;
            return Ok(None);
        };

        let spec = self.attendee_spec(&attendee).await?;
        info!(
            task_id = %task.id,
            attendee_id = %attendee.id,
            kind = %task.kind,
            attempt = task.attempt_count,
            "running task"
        );
        self.record_log(DeploymentLog::new(task, LogPhase::Started, self.now()))
            .await;

        let outcome = {
            let _workspace = self
                .workspace_locks
                .lock(TargetKey::attendee(&attendee.id))
                .await;
            match self.run_infrastructure(task.kind, &spec).await? {
                Err(err) if err.is_transient() => match self.reverify(task.kind, &spec).await {
                    Some(outcome) => {
                        info!(attendee_id = %attendee.id, "state shows the operation took effect");
                        Ok(outcome)
                    }
                    None => Err(err),
                },
                other => other,
            }
        };

        let _guard = self.locks.lock(TargetKey::attendee(&attendee.id)).await;
        let now = self.now();
        let (settlement, event, log) = match outcome {
            Ok(WorkOutcome::Deployed {
                workspace_id,
                credentials,
                output,
            }) => {
                let change = StatusChange::attendee(&attendee.id, expected, AttendeeStatus::Active)
                    .with_patch(AttendeePatch {
                        workspace_id: FieldUpdate::Set(workspace_id),
                        credentials: FieldUpdate::Set(credentials),
                        last_error: FieldUpdate::Clear,
                    });
                (
                    succeeded(task, Some(change)),
                    StatusEvent::attendee(
                        &attendee.id,
                        &attendee.workshop_id,
                        AttendeeStatus::Active,
                        now,
                    ),
                    DeploymentLog::new(task, LogPhase::Completed, now).with_output(output),
                )
            }
            Ok(WorkOutcome::Destroyed { output }) => {
                let change = StatusChange::attendee(&attendee.id, expected, AttendeeStatus::Deleted)
                    .with_patch(AttendeePatch {
                        workspace_id: FieldUpdate::Clear,
                        credentials: FieldUpdate::Clear,
                        last_error: FieldUpdate::Clear,
                    });
                (
                    succeeded(task, Some(change)),
                    StatusEvent::attendee(
                        &attendee.id,
                        &attendee.workshop_id,
                        AttendeeStatus::Deleted,
                        now,
                    ),
                    DeploymentLog::new(task, LogPhase::Completed, now).with_output(output),
                )
            }
            Err(err) => {
                if err.is_transient() && task.can_retry() && !self.cancel_pending(task).await? {
                    self.reschedule(task, &err).await?;
                    self.record_log(
                        DeploymentLog::new(task, LogPhase::Retrying, now)
                            .with_output(err.output)
                            .with_error(err.message),
                    )
                    .await;
                    return Ok(None);
                }

                error!(
                    task_id = %task.id,
                    attendee_id = %attendee.id,
                    class = %err.class,
                    attempts = task.attempt_count,
                    error = %err.message,
                    "task failed"
                );
                let change = StatusChange::attendee(&attendee.id, expected, AttendeeStatus::Failed)
                    .with_patch(AttendeePatch {
                        last_error: FieldUpdate::Set(err.message.clone()),
                        ..Default::default()
                    });
                (
                    failed(task, &err.message, Some(change)),
                    StatusEvent::attendee(
                        &attendee.id,
                        &attendee.workshop_id,
                        AttendeeStatus::Failed,
                        now,
                    )
                    .with_detail(err.message.clone()),
                    DeploymentLog::new(task, LogPhase::Failed, now)
                        .with_output(err.output)
                        .with_error(err.message),
                )
            }
        };

        let settled = self.store.settle_task(&settlement, now).await?;
        if !settled.task_updated {
            warn!(task_id = %task.id, "task was redelivered before it settled, result discarded");
            return Ok(None);
        }
        if settled.status_applied {
            self.broadcaster.publish(event);
        }
        self.record_log(log).await;
        info!(
            task_id = %task.id,
            attendee_id = %attendee.id,
            state = ?settlement.state,
            "task settled"
        );

        Ok(Some(Followup {
            workshop_id: attendee.workshop_id,
            compensate: (settled.cancel_requested && task.kind.provisions())
                .then(|| attendee.id.clone()),
        }))
    }

    /// Destroy a workspace left behind by a deleted or removed attendee. No
    /// status moves and nothing is announced.
    async fn execute_teardown(&self, task: &DeploymentTask) -> Result<()> {
        info!(
            task_id = %task.id,
            attendee_id = %task.target_id,
            "tearing down orphaned workspace"
        );
        self.record_log(DeploymentLog::new(task, LogPhase::Started, self.now()))
            .await;

        let result = {
            let _workspace = self
                .workspace_locks
                .lock(TargetKey::attendee(&task.target_id))
                .await;
            let engine = Arc::clone(&self.engine);
            let attendee_id = task.target_id.clone();
            tokio::task::spawn_blocking(move || engine.destroy(&attendee_id)).await?
        };

        let now = self.now();
        match result {
            Ok(outcome) => {
                let settled = self.store.settle_task(&succeeded(task, None), now).await?;
                if settled.task_updated {
                    info!(
                        attendee_id = %task.target_id,
                        destroyed = outcome.destroyed,
                        "orphaned workspace removed"
                    );
                    let log = DeploymentLog::new(task, LogPhase::Completed, now)
                        .with_output(outcome.output);
                    self.record_log(log).await;
                }
            }
            Err(err) if err.is_transient() && task.can_retry() => {
                self.reschedule(task, &err).await?;
                self.record_log(
                    DeploymentLog::new(task, LogPhase::Retrying, now)
                        .with_output(err.output)
                        .with_error(err.message),
                )
                .await;
            }
            Err(err) => {
                error!(
                    attendee_id = %task.target_id,
                    class = %err.class,
                    error = %err.message,
                    "orphaned workspace teardown failed"
                );
                let settled = self
                    .store
                    .settle_task(&failed(task, &err.message, None), now)
                    .await?;
                if settled.task_updated {
                    self.record_log(
                        DeploymentLog::new(task, LogPhase::Failed, now)
                            .with_output(err.output)
                            .with_error(err.message),
                    )
                    .await;
                }
            }
        }
        Ok(())
    }

    /// Deployment logs are a record, not part of the lifecycle; a failed
    /// write never fails the task.
    async fn record_log(&self, log: DeploymentLog) {
        if let Err(e) = self.store.append_deployment_log(&log).await {
            warn!(
                task_id = %log.task_id,
                phase = %log.phase,
                error = %e,
                "deployment log not written"
            );
        }
    }

    async fn attendee_spec(&self, attendee: &Attendee) -> Result<AttendeeSpec> {
        let workshop = self.store.get_workshop(&attendee.workshop_id).await?;
        let (workshop_name, template) = match workshop {
            Some(w) => (w.name, w.template),
            None => (String::new(), None),
        };

        Ok(AttendeeSpec {
            attendee_id: attendee.id.clone(),
            workshop_id: attendee.workshop_id.clone(),
            workshop_name,
            identifier: attendee.sanitized_identifier.clone(),
            email: attendee.email.clone(),
            template: template.unwrap_or_else(|| self.settings.default_template.clone()),
        })
    }

    /// The engine shells out and blocks, so it runs off the async workers.
    async fn run_infrastructure(
        &self,
        kind: TaskKind,
        spec: &AttendeeSpec,
    ) -> Result<std::result::Result<WorkOutcome, InfraError>> {
        let engine = Arc::clone(&self.engine);
        let spec = spec.clone();

        let outcome = tokio::task::spawn_blocking(move || match kind {
            TaskKind::Deploy | TaskKind::Retry => {
                engine.deploy(&spec).map(|out| WorkOutcome::Deployed {
                    workspace_id: out.workspace_id,
                    credentials: out.credentials,
                    output: out.output,
                })
            }
            TaskKind::Cleanup => engine
                .destroy(&spec.attendee_id)
                .map(|out| WorkOutcome::Destroyed { output: out.output }),
        })
        .await?;

        Ok(outcome)
    }

    /// After a transient failure, check whether the operation went through
    /// anyway before counting it as failed.
    async fn reverify(&self, kind: TaskKind, spec: &AttendeeSpec) -> Option<WorkOutcome> {
        let engine = Arc::clone(&self.engine);
        let attendee_id = spec.attendee_id.clone();

        let state = tokio::task::spawn_blocking(move || {
            let state = engine.inspect(&attendee_id)?;
            if kind == TaskKind::Cleanup && state == RemoteState::Absent {
                engine.workspaces().remove(&attendee_id)?;
            }
            Ok::<_, InfraError>(state)
        })
        .await;

        match (kind, state) {
            (TaskKind::Deploy | TaskKind::Retry, Ok(Ok(RemoteState::Provisioned(credentials)))) => {
                Some(WorkOutcome::Deployed {
                    workspace_id: WorkspaceManager::workspace_id(&spec.attendee_id),
                    credentials,
                    output: String::new(),
                })
            }
            (TaskKind::Cleanup, Ok(Ok(RemoteState::Absent))) => Some(WorkOutcome::Destroyed {
                output: String::new(),
            }),
            (_, Ok(Err(e))) => {
                debug!(attendee_id = %spec.attendee_id, error = %e, "state inspection failed");
                None
            }
            _ => None,
        }
    }

    async fn cancel_pending(&self, task: &DeploymentTask) -> Result<bool> {
        Ok(self
            .store
            .get_task(&task.id)
            .await?
            .is_some_and(|t| t.cancel_requested))
    }

    async fn reschedule(&self, task: &DeploymentTask, err: &InfraError) -> Result<()> {
        let delay = backoff_delay(
            task.attempt_count,
            self.settings.backoff_base,
            self.settings.backoff_max,
        );
        let jitter_ms = rand::rng().random_range(0..=delay.as_millis() as u64 / 10);
        let delay = delay + Duration::from_millis(jitter_ms);

        let now = self.now();
        let run_at = now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
        self.store
            .reschedule_task(&task.id, run_at, &err.message, now)
            .await?;

        warn!(
            task_id = %task.id,
            attempt = task.attempt_count,
            max_attempts = task.max_attempts,
            retry_in_secs = delay.as_secs(),
            error = %err.message,
            "transient failure, task rescheduled"
        );
        Ok(())
    }
}

/// Bounded workers draining the provisioning and cleanup queues.
pub struct WorkerPool {
    orchestrator: Orchestrator,
    provisioning: usize,
    cleanup: usize,
    poll_interval: Duration,
}

impl WorkerPool {
    pub fn new(orchestrator: Orchestrator, config: &WorkerPoolConfig) -> Self {
        Self {
            orchestrator,
            provisioning: config.provisioning.max(1),
            cleanup: config.cleanup.max(1),
            poll_interval: config.poll_interval(),
        }
    }

    pub fn ceiling(&self, queue: Queue) -> usize {
        match queue {
            Queue::Provisioning => self.provisioning,
            Queue::Cleanup => self.cleanup,
        }
    }

    /// Start one dispatch loop per queue. The loops stop claiming work when
    /// `shutdown` turns true and return once their running tasks finish.
    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        Queue::ALL
            .into_iter()
            .map(|queue| {
                tokio::spawn(run_queue(
                    self.orchestrator.clone(),
                    queue,
                    self.ceiling(queue),
                    self.poll_interval,
                    shutdown.clone(),
                ))
            })
            .collect()
    }
}

async fn run_queue(
    orchestrator: Orchestrator,
    queue: Queue,
    ceiling: usize,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let slots = Arc::new(Semaphore::new(ceiling));
    let wakeup = orchestrator.wakeups.get(queue);
    info!(%queue, ceiling, "queue worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let permit = tokio::select! {
            permit = Arc::clone(&slots).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
        };

        match orchestrator
            .store
            .claim_next_task(queue, orchestrator.now())
            .await
        {
            Ok(Some(task)) => {
                debug!(%queue, task_id = %task.id, "task claimed");
                let orchestrator = orchestrator.clone();
                tokio::spawn(async move {
                    orchestrator.execute(task).await;
                    drop(permit);
                });
                continue;
            }
            Ok(None) => drop(permit),
            Err(e) => {
                drop(permit);
                error!(%queue, error = %e, "failed to claim task");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            _ = wakeup.notified() => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    info!(%queue, "queue worker draining");
    let _ = slots.acquire_many(ceiling as u32).await;
    info!(%queue, "queue worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::store::EntityStore;
    use crate::test_utils::{ScriptedFailure, TestHarness};

    #[tokio::test]
    async fn cancelled_running_deploy_is_compensated() {
        let h = TestHarness::new().await;
        let (_, attendees) = h.workshop_with(&["anna"]).await;
        let anna = &attendees[0];
        h.orchestrator.submit_deployment(&anna.workshop_id).await.unwrap();

        let task = h
            .store
            .claim_next_task(Queue::Provisioning, h.clock.now())
            .await
            .unwrap()
            .unwrap();
        let cancellation = h.orchestrator.cancel_task(&task.id).await.unwrap();
        assert!(matches!(cancellation, crate::Cancellation::Deferred(_)));

        h.orchestrator.execute(task).await;

        // The deploy finished on its own, then a cleanup was queued for it.
        let after = h.store.get_attendee(&anna.id).await.unwrap().unwrap();
        assert_eq!(after.status, AttendeeStatus::Deleting);
        let cleanup = h
            .store
            .active_task_for_target(TargetKind::Attendee, &anna.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cleanup.kind, TaskKind::Cleanup);

        h.drain().await;
        let after = h.store.get_attendee(&anna.id).await.unwrap().unwrap();
        assert_eq!(after.status, AttendeeStatus::Deleted);
        assert!(!h.runner.is_provisioned(&anna.id));
    }

    #[tokio::test]
    async fn cancel_request_stops_transient_retries() {
        let h = TestHarness::new().await;
        let (_, attendees) = h.workshop_with(&["bob"]).await;
        let bob = &attendees[0];
        h.runner
            .fail_apply(
                &bob.id,
                vec![ScriptedFailure::Exit("Error: 503 Service Unavailable".into())],
            );
        h.orchestrator.submit_deployment(&bob.workshop_id).await.unwrap();

        let task = h
            .store
            .claim_next_task(Queue::Provisioning, h.clock.now())
            .await
            .unwrap()
            .unwrap();
        h.orchestrator.cancel_task(&task.id).await.unwrap();
        h.orchestrator.execute(task.clone()).await;

        let settled = h.store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(settled.state, TaskState::Failed);
        let after = h.store.get_attendee(&bob.id).await.unwrap().unwrap();
        assert_eq!(after.status, AttendeeStatus::Deleting);
    }

    #[tokio::test]
    async fn task_for_moved_target_is_dropped() {
        let h = TestHarness::new().await;
        let (_, attendees) = h.workshop_with(&["cleo"]).await;
        let cleo = &attendees[0];
        h.orchestrator.submit_deployment(&cleo.workshop_id).await.unwrap();

        let task = h
            .store
            .claim_next_task(Queue::Provisioning, h.clock.now())
            .await
            .unwrap()
            .unwrap();
        let moved =
            StatusChange::attendee(&cleo.id, AttendeeStatus::Deploying, AttendeeStatus::Failed);
        h.store.apply_status_change(&moved, h.clock.now()).await.unwrap();

        h.orchestrator.execute(task.clone()).await;

        let settled = h.store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(settled.state, TaskState::Failed);
        assert_eq!(h.runner.count(&cleo.id, "apply"), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn admission_and_cancel_answer_while_the_tool_runs() {
        let h = TestHarness::new().await;
        let (_, attendees) = h.workshop_with(&["dora"]).await;
        let dora = attendees[0].clone();
        h.orchestrator.submit_deployment(&dora.workshop_id).await.unwrap();
        h.runner.hold_applies();

        let orchestrator = h.orchestrator.clone();
        let running =
            tokio::spawn(async move { orchestrator.run_next_task(Queue::Provisioning).await });
        tokio::time::timeout(Duration::from_secs(10), async {
            while h.runner.count(&dora.id, "apply") == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("apply never started");

        let admission = tokio::time::timeout(
            Duration::from_secs(1),
            h.orchestrator
                .dispatcher()
                .submit(TaskRequest::attendee(&dora.id, TaskKind::Deploy)),
        )
        .await
        .expect("admission waited for the running apply")
        .unwrap();
        assert!(admission.is_merged());
        assert_eq!(admission.task().state, TaskState::Running);

        let cancellation = tokio::time::timeout(
            Duration::from_secs(1),
            h.orchestrator.cancel_task(&admission.task().id),
        )
        .await
        .expect("cancel waited for the running apply")
        .unwrap();
        assert!(matches!(cancellation, crate::Cancellation::Deferred(_)));

        h.runner.release_applies();
        running.await.unwrap().unwrap();

        let after = h.store.get_attendee(&dora.id).await.unwrap().unwrap();
        assert_eq!(after.status, AttendeeStatus::Deleting);

        h.drain().await;
        let after = h.store.get_attendee(&dora.id).await.unwrap().unwrap();
        assert_eq!(after.status, AttendeeStatus::Deleted);

        let phases: Vec<LogPhase> = h
            .orchestrator
            .deployment_logs(&dora.id)
            .await
            .unwrap()
            .iter()
            .map(|log| log.phase)
            .collect();
        assert_eq!(
            phases,
            vec![
                LogPhase::Started,
                LogPhase::Completed,
                LogPhase::Started,
                LogPhase::Completed
            ]
        );
    }

    #[tokio::test]
    async fn transient_failure_is_logged_before_retry() {
        let h = TestHarness::new().await;
        let (_, attendees) = h.workshop_with(&["emil"]).await;
        let emil = &attendees[0];
        h.runner.fail_apply(
            &emil.id,
            vec![ScriptedFailure::Exit("Error: 429 Too Many Requests".into())],
        );
        h.orchestrator.submit_deployment(&emil.workshop_id).await.unwrap();
        h.orchestrator.run_next_task(Queue::Provisioning).await.unwrap();

        let logs = h.orchestrator.deployment_logs(&emil.id).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[1].phase, LogPhase::Retrying);
        assert!(logs[1].output.as_deref().unwrap_or_default().contains("429"));
        assert!(logs[1].error.is_some());
    }

    #[test]
    fn in_progress_status_follows_kind() {
        assert_eq!(in_progress_status(TaskKind::Deploy), AttendeeStatus::Deploying);
        assert_eq!(in_progress_status(TaskKind::Retry), AttendeeStatus::Deploying);
        assert_eq!(in_progress_status(TaskKind::Cleanup), AttendeeStatus::Deleting);
    }
}
