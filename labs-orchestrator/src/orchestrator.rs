//! The operations surface: workshop management, deployment and cleanup
//! requests, cancellation and state queries.

use crate::attendee::{Attendee, AttendeeStatus, NewAttendee};
use crate::broadcaster::{StatusBroadcaster, StatusEvent};
use crate::clock::{Clock, SystemClock};
use crate::db;
use crate::deployment_log::DeploymentLog;
use crate::dispatcher::{Admission, QueueWakeups, TaskDispatcher};
use crate::engine::ProvisioningEngine;
use crate::error::{ErrorCode, OrchestratorError, Result};
use crate::locks::{TargetKey, TargetLocks};
use crate::scheduler::{LifecycleScheduler, SweepSummary};
use crate::state_machine::{
    check, check_attendee_addition, check_workshop_removal, compute_workshop_state,
    EffectiveState, TransitionContext,
};
use crate::store::{EntityStore, SqliteStore, StatusChange, WorkshopFilter};
use crate::task::{DeploymentTask, Queue, TargetKind, TaskKind, TaskRequest, TaskState};
use crate::worker::WorkerPool;
use crate::workshop::{NewWorkshop, Workshop, WorkshopStatus};
use chrono::Utc;
use labs_config::{LabsConfig, WorkerPoolConfig};
use labs_core::{sanitize_identifier, validate_identifier};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Lifecycle tunables, resolved from configuration.
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub default_template: String,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub cleanup_delay: chrono::Duration,
    pub stale_task_after: chrono::Duration,
    pub prune_orphaned_workspaces: bool,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self::from_config(&LabsConfig::default())
    }
}

impl LifecycleSettings {
    pub fn from_config(config: &LabsConfig) -> Self {
        Self {
            default_template: config.provisioning.default_template.clone(),
            max_attempts: config.provisioning.max_attempts,
            backoff_base: Duration::from_secs(config.provisioning.backoff_base_secs),
            backoff_max: Duration::from_secs(config.provisioning.backoff_max_secs),
            cleanup_delay: chrono::Duration::hours(config.scheduler.cleanup_delay_hours),
            stale_task_after: chrono::Duration::seconds(config.scheduler.stale_task_secs),
            prune_orphaned_workspaces: config.scheduler.prune_orphaned_workspaces,
        }
    }
}

/// Outcome of a deployment or cleanup request.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Submission {
    pub admitted: Vec<DeploymentTask>,
    /// Requests absorbed by tasks already in flight.
    pub merged: Vec<DeploymentTask>,
    /// Attendees whose running task must finish first; follow-up work is
    /// queued when it does.
    pub deferred: Vec<String>,
    /// Attendees with nothing to do in their current status.
    pub skipped: Vec<String>,
}

impl Submission {
    fn record(&mut self, admission: Admission) {
        match admission {
            Admission::Accepted(task) => self.admitted.push(task),
            Admission::Merged(task) => self.merged.push(task),
        }
    }

    pub fn is_noop(&self) -> bool {
        self.admitted.is_empty()
    }
}

#[derive(Debug, Clone)]
pub enum Cancellation {
    /// The task had not started and is gone; its target is back where it was.
    Removed(DeploymentTask),
    /// The task is running; it completes naturally and is then compensated.
    Deferred(DeploymentTask),
    AlreadyFinished(DeploymentTask),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum EntityState {
    Workshop(EffectiveState),
    Attendee { status: AttendeeStatus },
}

#[derive(Debug, Clone, Serialize)]
pub struct AttendeeFailure {
    pub attendee_id: String,
    pub username: String,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkshopOverview {
    pub workshop: Workshop,
    pub effective: EffectiveState,
    pub attendee_counts: BTreeMap<AttendeeStatus, usize>,
    pub failures: Vec<AttendeeFailure>,
    pub tasks_in_flight: usize,
}

/// Effective workshop status. A completed workshop stays completed while
/// its attendees are all still active.
pub(crate) fn effective_state(workshop: &Workshop, attendees: &[Attendee]) -> EffectiveState {
    let statuses: Vec<AttendeeStatus> = attendees.iter().map(|a| a.status).collect();
    let computed = compute_workshop_state(&statuses, workshop.status);
    if workshop.status == WorkshopStatus::Completed && computed.status == WorkshopStatus::Active {
        return EffectiveState {
            status: WorkshopStatus::Completed,
            degraded: false,
        };
    }
    computed
}

#[derive(Clone)]
pub struct Orchestrator {
    pub(crate) store: Arc<dyn EntityStore>,
    pub(crate) engine: Arc<ProvisioningEngine>,
    pub(crate) dispatcher: TaskDispatcher,
    pub(crate) broadcaster: StatusBroadcaster,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) locks: TargetLocks,
    /// Held while the infrastructure tool runs in an attendee's workspace.
    pub(crate) workspace_locks: TargetLocks,
    pub(crate) wakeups: QueueWakeups,
    pub(crate) settings: LifecycleSettings,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn EntityStore>,
        engine: Arc<ProvisioningEngine>,
        clock: Arc<dyn Clock>,
        broadcaster: StatusBroadcaster,
        settings: LifecycleSettings,
    ) -> Self {
        let locks = TargetLocks::new();
        let wakeups = QueueWakeups::default();
        let dispatcher = TaskDispatcher::new(
            store.clone(),
            locks.clone(),
            clock.clone(),
            broadcaster.clone(),
            wakeups.clone(),
            settings.max_attempts,
        );

        Self {
            store,
            engine,
            dispatcher,
            broadcaster,
            clock,
            locks,
            workspace_locks: TargetLocks::new(),
            wakeups,
            settings,
        }
    }

    /// Open the database, apply migrations and locate the infrastructure tool.
    pub async fn from_config(config: &LabsConfig) -> Result<Self> {
        let db_path = &config.database.path;
        if config.database.backup_before_migrate && db_path.exists() {
            let backup = db::backup_database(db_path)?;
            info!(backup = %backup.display(), "database backed up");
        }

        let pool = db::create_pool(db_path).await?;
        db::run_migrations(&pool).await?;

        let engine = ProvisioningEngine::from_config(&config.provisioning)?;

        Ok(Self::new(
            Arc::new(SqliteStore::new(pool)),
            Arc::new(engine),
            Arc::new(SystemClock),
            StatusBroadcaster::new(config.broadcaster.capacity),
            LifecycleSettings::from_config(config),
        ))
    }

    pub fn store(&self) -> &Arc<dyn EntityStore> {
        &self.store
    }

    pub fn engine(&self) -> &Arc<ProvisioningEngine> {
        &self.engine
    }

    pub fn dispatcher(&self) -> &TaskDispatcher {
        &self.dispatcher
    }

    pub fn settings(&self) -> &LifecycleSettings {
        &self.settings
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.broadcaster.subscribe()
    }

    pub fn worker_pool(&self, config: &WorkerPoolConfig) -> WorkerPool {
        WorkerPool::new(self.clone(), config)
    }

    pub fn scheduler(&self, interval: Duration) -> LifecycleScheduler {
        LifecycleScheduler::new(self.clone(), interval)
    }

    async fn require_workshop(&self, id: &str) -> Result<Workshop> {
        self.store
            .get_workshop(id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("workshop {}", id)))
    }

    async fn require_attendee(&self, id: &str) -> Result<Attendee> {
        self.store
            .get_attendee(id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("attendee {}", id)))
    }

    pub async fn create_workshop(&self, request: NewWorkshop) -> Result<Workshop> {
        let name = request.name.trim();
        if name.is_empty() {
            return Err(OrchestratorError::rejected(
                ErrorCode::InvalidInput,
                "workshop name cannot be empty",
            ));
        }
        let schedule = request.schedule();
        schedule.validate()?;
        if let Some(template) = &request.template {
            validate_identifier(template).map_err(|e| {
                OrchestratorError::rejected(ErrorCode::NamingPolicy, e.to_string())
            })?;
        }

        let now = self.clock.now();
        let workshop = Workshop {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            schedule,
            status: WorkshopStatus::Planning,
            cleanup_scheduled_at: None,
            template: request.template,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_workshop(&workshop).await?;

        info!(workshop_id = %workshop.id, name = %workshop.name, "workshop created");
        Ok(workshop)
    }

    pub async fn get_workshop(&self, id: &str) -> Result<Workshop> {
        self.require_workshop(id).await
    }

    pub async fn list_workshops(&self, filter: &WorkshopFilter) -> Result<Vec<Workshop>> {
        self.store.list_workshops(filter).await
    }

    pub async fn get_attendee(&self, id: &str) -> Result<Attendee> {
        self.require_attendee(id).await
    }

    pub async fn list_attendees(&self, workshop_id: &str) -> Result<Vec<Attendee>> {
        self.require_workshop(workshop_id).await?;
        self.store.list_attendees(workshop_id).await
    }

    /// Add an attendee to a workshop that has not been deployed yet.
    pub async fn add_attendee(&self, workshop_id: &str, request: NewAttendee) -> Result<Attendee> {
        let _guard = self.locks.lock(TargetKey::workshop(workshop_id)).await;

        let workshop = self.require_workshop(workshop_id).await?;
        check_attendee_addition(workshop.status).into_result(|| {
            format!(
                "workshop {} is {}, attendees can only join while planning",
                workshop.id, workshop.status
            )
        })?;

        let username = request.username.trim().to_string();
        let email = request.email.trim().to_string();
        if username.is_empty() || !email.contains('@') {
            return Err(OrchestratorError::rejected(
                ErrorCode::InvalidInput,
                "attendee needs a username and a valid email",
            ));
        }

        let identifier = sanitize_identifier(&username);
        validate_identifier(&identifier)
            .map_err(|e| OrchestratorError::rejected(ErrorCode::NamingPolicy, e.to_string()))?;

        let existing = self.store.list_attendees(workshop_id).await?;
        if existing.iter().any(|a| a.sanitized_identifier == identifier) {
            return Err(OrchestratorError::rejected(
                ErrorCode::DuplicateIdentifier,
                format!("identifier '{}' is already used in this workshop", identifier),
            ));
        }

        let now = self.clock.now();
        let attendee = Attendee {
            id: Uuid::new_v4().to_string(),
            workshop_id: workshop.id.clone(),
            username,
            sanitized_identifier: identifier,
            email,
            status: AttendeeStatus::Planning,
            workspace_id: None,
            credentials: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_attendee(&attendee).await?;

        info!(
            workshop_id = %workshop.id,
            attendee_id = %attendee.id,
            identifier = %attendee.sanitized_identifier,
            "attendee added"
        );
        Ok(attendee)
    }

    /// Remove a workshop record with its attendees.
    ///
    /// Rejected with `DELETE_BLOCKED` while any attendee is deploying or
    /// active, or while any of its tasks is in flight.
    pub async fn delete_workshop(&self, id: &str) -> Result<()> {
        let _guard = self.locks.lock(TargetKey::workshop(id)).await;

        let workshop = self.require_workshop(id).await?;
        let attendees = self.store.list_attendees(id).await?;
        let context = TransitionContext {
            busy_attendees: attendees.iter().filter(|a| a.status.is_busy()).count(),
        };
        check_workshop_removal(&context).into_result(|| {
            format!(
                "workshop {} has {} attendees deploying or active",
                workshop.id, context.busy_attendees
            )
        })?;

        let mut in_flight = self
            .store
            .active_task_for_target(TargetKind::Workshop, id)
            .await?
            .is_some();
        for attendee in &attendees {
            if in_flight {
                break;
            }
            in_flight = self
                .store
                .active_task_for_target(TargetKind::Attendee, &attendee.id)
                .await?
                .is_some();
        }
        if in_flight {
            return Err(OrchestratorError::rejected(
                ErrorCode::DeleteBlocked,
                format!("workshop {} has tasks in flight", workshop.id),
            ));
        }

        self.store.delete_workshop(id).await?;
        info!(workshop_id = %id, "workshop deleted");
        Ok(())
    }

    /// Request provisioning for every attendee of a workshop that needs it.
    ///
    /// Planning attendees get a deploy task and failed ones a retry; attendees
    /// already in flight merge. A workshop without attendees is deployed as a
    /// whole.
    pub async fn submit_deployment(&self, workshop_id: &str) -> Result<Submission> {
        let workshop = self.require_workshop(workshop_id).await?;
        if workshop.status != WorkshopStatus::Deploying {
            check(
                workshop.status,
                WorkshopStatus::Deploying,
                &TransitionContext::default(),
            )
            .into_result(|| {
                format!(
                    "workshop {} is {} and cannot be deployed",
                    workshop.id, workshop.status
                )
            })?;
        }

        let attendees = self.store.list_attendees(workshop_id).await?;
        let mut submission = Submission::default();

        if attendees.is_empty() {
            submission.record(
                self.dispatcher
                    .submit(TaskRequest::workshop(workshop_id, TaskKind::Deploy))
                    .await?,
            );
            return Ok(submission);
        }

        for attendee in &attendees {
            let kind = match attendee.status {
                AttendeeStatus::Planning | AttendeeStatus::Deploying => TaskKind::Deploy,
                AttendeeStatus::Failed => TaskKind::Retry,
                _ => {
                    submission.skipped.push(attendee.id.clone());
                    continue;
                }
            };
            self.submit_for_attendee(&mut submission, &attendee.id, kind)
                .await?;
        }

        self.refresh_workshop_status(workshop_id).await?;
        info!(
            workshop_id,
            admitted = submission.admitted.len(),
            merged = submission.merged.len(),
            skipped = submission.skipped.len(),
            "deployment submitted"
        );
        Ok(submission)
    }

    /// Re-trigger deployment for one attendee without touching the others.
    pub async fn submit_attendee_deployment(&self, attendee_id: &str) -> Result<Submission> {
        let attendee = self.require_attendee(attendee_id).await?;
        let kind = match attendee.status {
            AttendeeStatus::Failed => TaskKind::Retry,
            _ => TaskKind::Deploy,
        };

        let mut submission = Submission::default();
        submission.record(
            self.dispatcher
                .submit(TaskRequest::attendee(attendee_id, kind))
                .await?,
        );

        self.refresh_workshop_status(&attendee.workshop_id).await?;
        Ok(submission)
    }

    /// Request teardown of everything a workshop owns.
    ///
    /// Queued deployments are cancelled first; running ones are left to
    /// finish and are cleaned up afterwards.
    pub async fn submit_cleanup(&self, workshop_id: &str) -> Result<Submission> {
        let workshop = self.require_workshop(workshop_id).await?;
        if workshop.status != WorkshopStatus::Deleting {
            check(
                workshop.status,
                WorkshopStatus::Deleting,
                &TransitionContext::default(),
            )
            .into_result(|| {
                format!(
                    "workshop {} is {} and cannot be cleaned up",
                    workshop.id, workshop.status
                )
            })?;
        }

        let attendees = self.store.list_attendees(workshop_id).await?;
        let mut submission = Submission::default();

        if attendees.is_empty() {
            submission.record(
                self.dispatcher
                    .submit(TaskRequest::workshop(workshop_id, TaskKind::Cleanup))
                    .await?,
            );
            return Ok(submission);
        }

        for attendee in &attendees {
            if attendee.status == AttendeeStatus::Deleted {
                submission.skipped.push(attendee.id.clone());
                continue;
            }

            if let Some(task) = self
                .store
                .active_task_for_target(TargetKind::Attendee, &attendee.id)
                .await?
            {
                if task.kind.provisions() {
                    if let Cancellation::Deferred(_) = self.cancel_task(&task.id).await? {
                        submission.deferred.push(attendee.id.clone());
                        continue;
                    }
                }
            }

            self.submit_for_attendee(&mut submission, &attendee.id, TaskKind::Cleanup)
                .await?;
        }

        self.refresh_workshop_status(workshop_id).await?;
        info!(
            workshop_id,
            admitted = submission.admitted.len(),
            merged = submission.merged.len(),
            deferred = submission.deferred.len(),
            "cleanup submitted"
        );
        Ok(submission)
    }

    async fn submit_for_attendee(
        &self,
        submission: &mut Submission,
        attendee_id: &str,
        kind: TaskKind,
    ) -> Result<()> {
        match self
            .dispatcher
            .submit(TaskRequest::attendee(attendee_id, kind))
            .await
        {
            Ok(admission) => submission.record(admission),
            // The attendee moved on since it was listed.
            Err(err) if err.code().is_some() || matches!(err, OrchestratorError::Conflict(_)) => {
                debug!(attendee_id, error = %err, "attendee skipped");
                submission.skipped.push(attendee_id.to_string());
            }
            Err(err) => return Err(err),
        }
        Ok(())
    }

    /// Cancel a task. Queued tasks are removed and their target restored;
    /// running tasks are flagged and compensated once they finish.
    pub async fn cancel_task(&self, task_id: &str) -> Result<Cancellation> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("task {}", task_id)))?;

        let mut workshop_to_refresh = None;
        let cancellation = {
            let _guard = self
                .locks
                .lock(TargetKey {
                    kind: task.target_type,
                    id: task.target_id.clone(),
                })
                .await;

            let task = self
                .store
                .get_task(task_id)
                .await?
                .ok_or_else(|| OrchestratorError::NotFound(format!("task {}", task_id)))?;
            let now = self.clock.now();

            match task.state {
                TaskState::Queued => {
                    let revert = self.revert_change(&task).await?;
                    if let Some((_, _, workshop_id)) = &revert {
                        workshop_to_refresh = Some(workshop_id.clone());
                    }
                    match self
                        .store
                        .cancel_queued_task(&task.id, revert.as_ref().map(|(c, _, _)| c), now)
                        .await?
                    {
                        Some(removed) => {
                            if let Some((_, event, _)) = revert {
                                self.broadcaster.publish(event);
                            }
                            info!(task_id = %removed.id, "queued task cancelled");
                            Cancellation::Removed(removed)
                        }
                        // Claimed by a worker in the meantime.
                        None => {
                            self.store.request_task_cancel(&task.id, now).await?;
                            Cancellation::Deferred(task)
                        }
                    }
                }
                TaskState::Running => {
                    self.store.request_task_cancel(&task.id, now).await?;
                    info!(task_id = %task.id, "cancellation deferred until task completes");
                    Cancellation::Deferred(task)
                }
                TaskState::Succeeded | TaskState::Failed => Cancellation::AlreadyFinished(task),
            }
        };

        if let Some(workshop_id) = workshop_to_refresh {
            self.refresh_workshop_status(&workshop_id).await?;
        }
        Ok(cancellation)
    }

    /// The status write that undoes a queued task's admission, with its
    /// event and the owning workshop.
    async fn revert_change(
        &self,
        task: &DeploymentTask,
    ) -> Result<Option<(StatusChange, StatusEvent, String)>> {
        let Some(origin) = task.origin_status.as_deref() else {
            return Ok(None);
        };
        let now = self.clock.now();

        match task.target_type {
            TargetKind::Attendee => {
                let Ok(origin) = origin.parse::<AttendeeStatus>() else {
                    return Ok(None);
                };
                let Some(attendee) = self.store.get_attendee(&task.target_id).await? else {
                    return Ok(None);
                };
                Ok(Some((
                    StatusChange::attendee(&attendee.id, attendee.status, origin),
                    StatusEvent::attendee(&attendee.id, &attendee.workshop_id, origin, now),
                    attendee.workshop_id,
                )))
            }
            TargetKind::Workshop => {
                let Ok(origin) = origin.parse::<WorkshopStatus>() else {
                    return Ok(None);
                };
                let Some(workshop) = self.store.get_workshop(&task.target_id).await? else {
                    return Ok(None);
                };
                Ok(Some((
                    StatusChange::workshop(&workshop.id, workshop.status, origin),
                    StatusEvent::workshop(&workshop.id, origin, now),
                    workshop.id,
                )))
            }
        }
    }

    /// Run one lifecycle sweep now.
    pub async fn process_due_lifecycle_events(&self) -> SweepSummary {
        LifecycleScheduler::new(self.clone(), Duration::from_secs(1))
            .sweep()
            .await
    }

    /// Current state of a workshop (derived from its attendees) or attendee.
    pub async fn get_effective_state(&self, entity_id: &str) -> Result<EntityState> {
        if let Some(workshop) = self.store.get_workshop(entity_id).await? {
            let attendees = self.store.list_attendees(entity_id).await?;
            return Ok(EntityState::Workshop(effective_state(&workshop, &attendees)));
        }
        if let Some(attendee) = self.store.get_attendee(entity_id).await? {
            return Ok(EntityState::Attendee {
                status: attendee.status,
            });
        }
        Err(OrchestratorError::NotFound(entity_id.to_string()))
    }

    pub async fn workshop_overview(&self, workshop_id: &str) -> Result<WorkshopOverview> {
        let workshop = self.require_workshop(workshop_id).await?;
        let attendees = self.store.list_attendees(workshop_id).await?;

        let mut attendee_counts = BTreeMap::new();
        let mut failures = Vec::new();
        let mut tasks_in_flight = 0;
        for attendee in &attendees {
            *attendee_counts.entry(attendee.status).or_insert(0) += 1;
            if attendee.status == AttendeeStatus::Failed {
                failures.push(AttendeeFailure {
                    attendee_id: attendee.id.clone(),
                    username: attendee.username.clone(),
                    last_error: attendee.last_error.clone(),
                });
            }
            if self
                .store
                .active_task_for_target(TargetKind::Attendee, &attendee.id)
                .await?
                .is_some()
            {
                tasks_in_flight += 1;
            }
        }

        Ok(WorkshopOverview {
            effective: effective_state(&workshop, &attendees),
            workshop,
            attendee_counts,
            failures,
            tasks_in_flight,
        })
    }

    /// What the infrastructure tool did for an attendee, oldest first.
    pub async fn deployment_logs(&self, attendee_id: &str) -> Result<Vec<DeploymentLog>> {
        self.store.list_deployment_logs(attendee_id).await
    }

    /// Return every task left running by a previous process to the queue.
    pub async fn recover_in_flight_tasks(&self) -> Result<u64> {
        let now = self.clock.now();
        let requeued = self.store.requeue_running_tasks(now, now).await?;
        if requeued > 0 {
            warn!(requeued, "requeued tasks interrupted by a previous shutdown");
            self.wakeups.notify_all_queues();
        }
        Ok(requeued)
    }

    /// Claim and execute the next due task of `queue` on the current task.
    pub async fn run_next_task(&self, queue: Queue) -> Result<Option<DeploymentTask>> {
        let Some(task) = self.store.claim_next_task(queue, self.clock.now()).await? else {
            return Ok(None);
        };
        self.execute(task.clone()).await;
        Ok(Some(task))
    }

    /// Persist the workshop status derived from its attendees and announce
    /// it if it changed.
    pub(crate) async fn refresh_workshop_status(
        &self,
        workshop_id: &str,
    ) -> Result<EffectiveState> {
        let _guard = self.locks.lock(TargetKey::workshop(workshop_id)).await;

        let workshop = self.require_workshop(workshop_id).await?;
        let attendees = self.store.list_attendees(workshop_id).await?;
        let effective = effective_state(&workshop, &attendees);

        if effective.status != workshop.status {
            let now = self.clock.now();
            let change = StatusChange::workshop(workshop_id, workshop.status, effective.status);
            if self.store.apply_status_change(&change, now).await? {
                info!(
                    workshop_id,
                    from = %workshop.status,
                    to = %effective.status,
                    degraded = effective.degraded,
                    "workshop status changed"
                );
                self.broadcaster
                    .publish(StatusEvent::workshop(workshop_id, effective.status, now));
            }
        }

        Ok(effective)
    }

    pub(crate) fn now(&self) -> chrono::DateTime<Utc> {
        self.clock.now()
    }
}
