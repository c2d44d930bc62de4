use super::{
    AdmitOutcome, EntityStore, Settled, Settlement, StatusChange, WorkshopFilter,
};
use crate::attendee::{Attendee, AttendeeStatus, Credentials};
use crate::deployment_log::{DeploymentLog, LogPhase};
use crate::error::Result;
use crate::task::{DeploymentTask, Queue, TargetKind, TaskKind, TaskState};
use crate::workshop::{Schedule, Workshop, WorkshopStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, instrument};

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get a reference to the database pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn apply_change(
    conn: &mut SqliteConnection,
    change: &StatusChange,
    now: i64,
) -> Result<bool> {
    let result = match change {
        StatusChange::Workshop { id, from, to } => {
            sqlx::query(
                "UPDATE workshops SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
            )
            .bind(to)
            .bind(now)
            .bind(id)
            .bind(from)
            .execute(&mut *conn)
            .await?
        }
        StatusChange::Attendee {
            id,
            from,
            to,
            patch,
        } => {
            let credentials = match patch.credentials.binding() {
                Some(Some(creds)) => Some(Some(serde_json::to_string(&creds)?)),
                Some(None) => Some(None),
                None => None,
            };
            let workspace_id = patch.workspace_id.binding();
            let last_error = patch.last_error.binding();

            let mut sql = String::from("UPDATE attendees SET status = ?, updated_at = ?");
            if workspace_id.is_some() {
                sql.push_str(", workspace_id = ?");
            }
            if credentials.is_some() {
                sql.push_str(", credentials = ?");
            }
            if last_error.is_some() {
                sql.push_str(", last_error = ?");
            }
            sql.push_str(" WHERE id = ? AND status = ?");

            let mut query = sqlx::query(&sql).bind(to).bind(now);
            if let Some(value) = workspace_id {
                query = query.bind(value);
            }
            if let Some(value) = credentials {
                query = query.bind(value);
            }
            if let Some(value) = last_error {
                query = query.bind(value);
            }
            query.bind(id).bind(from).execute(&mut *conn).await?
        }
    };

    Ok(result.rows_affected() == 1)
}

#[async_trait]
impl EntityStore for SqliteStore {
    async fn insert_workshop(&self, workshop: &Workshop) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workshops (id, name, start_at, end_at, timezone, status, cleanup_scheduled_at, template, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&workshop.id)
        .bind(&workshop.name)
        .bind(workshop.schedule.start.timestamp())
        .bind(workshop.schedule.end.timestamp())
        .bind(&workshop.schedule.timezone)
        .bind(workshop.status)
        .bind(workshop.cleanup_scheduled_at.map(|dt| dt.timestamp()))
        .bind(&workshop.template)
        .bind(workshop.created_at.timestamp())
        .bind(workshop.updated_at.timestamp())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_workshop(&self, id: &str) -> Result<Option<Workshop>> {
        let row = sqlx::query_as::<_, WorkshopRow>("SELECT * FROM workshops WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(Into::into))
    }

    async fn list_workshops(&self, filter: &WorkshopFilter) -> Result<Vec<Workshop>> {
        let mut query = "SELECT * FROM workshops WHERE 1=1".to_string();

        if filter.status.is_some() {
            query.push_str(" AND status = ?");
        }

        query.push_str(" ORDER BY start_at ASC");

        let mut q = sqlx::query_as::<_, WorkshopRow>(&query);

        if let Some(status) = &filter.status {
            q = q.bind(status);
        }

        let rows = q.fetch_all(&self.pool).await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn delete_workshop(&self, id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "DELETE FROM deployment_logs
             WHERE target_id = ? OR target_id IN (SELECT id FROM attendees WHERE workshop_id = ?)",
        )
        .bind(id)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "DELETE FROM deployment_tasks
             WHERE (target_type = 'workshop' AND target_id = ?)
                OR (target_type = 'attendee' AND target_id IN (SELECT id FROM attendees WHERE workshop_id = ?))",
        )
        .bind(id)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM attendees WHERE workshop_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query("DELETE FROM workshops WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(result.rows_affected() == 1)
    }

    async fn set_cleanup_scheduled_at(
        &self,
        id: &str,
        at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE workshops SET cleanup_scheduled_at = ?, updated_at = ?
             WHERE id = ? AND cleanup_scheduled_at IS NULL",
        )
        .bind(at.timestamp())
        .bind(now.timestamp())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn ended_workshops_without_cleanup(&self, now: DateTime<Utc>) -> Result<Vec<Workshop>> {
        let rows = sqlx::query_as::<_, WorkshopRow>(
            "SELECT * FROM workshops
             WHERE status IN ('active', 'completed')
               AND end_at <= ?
               AND cleanup_scheduled_at IS NULL
             ORDER BY end_at ASC",
        )
        .bind(now.timestamp())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn due_cleanup_workshops(&self, now: DateTime<Utc>) -> Result<Vec<Workshop>> {
        let rows = sqlx::query_as::<_, WorkshopRow>(
            "SELECT w.* FROM workshops w
             WHERE w.status IN ('active', 'completed')
               AND w.cleanup_scheduled_at IS NOT NULL
               AND w.cleanup_scheduled_at <= ?
               AND NOT EXISTS (
                   SELECT 1 FROM deployment_tasks t
                   JOIN attendees a ON t.target_type = 'attendee' AND t.target_id = a.id
                   WHERE a.workshop_id = w.id
                     AND t.kind = 'cleanup'
                     AND t.state IN ('queued', 'running'))
               AND NOT EXISTS (
                   SELECT 1 FROM deployment_tasks t
                   WHERE t.target_type = 'workshop'
                     AND t.target_id = w.id
                     AND t.kind = 'cleanup'
                     AND t.state IN ('queued', 'running'))
             ORDER BY w.cleanup_scheduled_at ASC",
        )
        .bind(now.timestamp())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn insert_attendee(&self, attendee: &Attendee) -> Result<()> {
        let credentials = attendee
            .credentials
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO attendees (id, workshop_id, username, sanitized_identifier, email, status, workspace_id, credentials, last_error, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&attendee.id)
        .bind(&attendee.workshop_id)
        .bind(&attendee.username)
        .bind(&attendee.sanitized_identifier)
        .bind(&attendee.email)
        .bind(attendee.status)
        .bind(&attendee.workspace_id)
        .bind(credentials)
        .bind(&attendee.last_error)
        .bind(attendee.created_at.timestamp())
        .bind(attendee.updated_at.timestamp())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_attendee(&self, id: &str) -> Result<Option<Attendee>> {
        let row = sqlx::query_as::<_, AttendeeRow>("SELECT * FROM attendees WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(Into::into))
    }

    async fn list_attendees(&self, workshop_id: &str) -> Result<Vec<Attendee>> {
        let rows = sqlx::query_as::<_, AttendeeRow>(
            "SELECT * FROM attendees WHERE workshop_id = ? ORDER BY created_at ASC, username ASC",
        )
        .bind(workshop_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn apply_status_change(
        &self,
        change: &StatusChange,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        apply_change(&mut conn, change, now.timestamp()).await
    }

    #[instrument(
        skip(self, task, change, now),
        fields(task_id = %task.id, target_id = %task.target_id)
    )]
    async fn admit_task(
        &self,
        task: &DeploymentTask,
        change: Option<&StatusChange>,
        now: DateTime<Utc>,
    ) -> Result<AdmitOutcome> {
        let mut tx = self.pool.begin().await?;

        // Writing the status first takes the write lock up front.
        if let Some(change) = change {
            if !apply_change(&mut tx, change, now.timestamp()).await? {
                tx.rollback().await?;
                return Ok(AdmitOutcome::Stale);
            }
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO deployment_tasks (id, target_type, target_id, kind, queue, attempt_count, max_attempts, state, scheduled_at, origin_status, cancel_requested, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&task.id)
        .bind(task.target_type)
        .bind(&task.target_id)
        .bind(task.kind)
        .bind(task.queue)
        .bind(i64::from(task.attempt_count))
        .bind(i64::from(task.max_attempts))
        .bind(TaskState::Queued)
        .bind(task.scheduled_at.timestamp())
        .bind(&task.origin_status)
        .bind(task.created_at.timestamp())
        .bind(now.timestamp())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await?;
            debug!(target_id = %task.target_id, "task already in flight for target");
            return Ok(
                match self
                    .active_task_for_target(task.target_type, &task.target_id)
                    .await?
                {
                    Some(existing) => AdmitOutcome::Merged(existing),
                    None => AdmitOutcome::Stale,
                },
            );
        }

        tx.commit().await?;

        Ok(AdmitOutcome::Admitted)
    }

    async fn get_task(&self, id: &str) -> Result<Option<DeploymentTask>> {
        let row = sqlx::query_as::<_, TaskRow>("SELECT * FROM deployment_tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(Into::into))
    }

    async fn active_task_for_target(
        &self,
        target_type: TargetKind,
        target_id: &str,
    ) -> Result<Option<DeploymentTask>> {
        let row = sqlx::query_as::<_, TaskRow>(
            "SELECT * FROM deployment_tasks
             WHERE target_type = ? AND target_id = ? AND state IN ('queued', 'running')",
        )
        .bind(target_type)
        .bind(target_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn list_tasks_for_target(
        &self,
        target_type: TargetKind,
        target_id: &str,
    ) -> Result<Vec<DeploymentTask>> {
        let rows = sqlx::query_as::<_, TaskRow>(
            "SELECT * FROM deployment_tasks
             WHERE target_type = ? AND target_id = ?
             ORDER BY created_at ASC",
        )
        .bind(target_type)
        .bind(target_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn claim_next_task(
        &self,
        queue: Queue,
        now: DateTime<Utc>,
    ) -> Result<Option<DeploymentTask>> {
        let row = sqlx::query_as::<_, TaskRow>(
            "UPDATE deployment_tasks
             SET state = 'running', attempt_count = attempt_count + 1, started_at = ?1, updated_at = ?1
             WHERE id = (
                 SELECT id FROM deployment_tasks
                 WHERE queue = ?2 AND state = 'queued' AND scheduled_at <= ?1
                 ORDER BY scheduled_at ASC, created_at ASC
                 LIMIT 1)
               AND state = 'queued'
             RETURNING *",
        )
        .bind(now.timestamp())
        .bind(queue)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    #[instrument(skip(self, settlement, now), fields(task_id = %settlement.task_id))]
    async fn settle_task(&self, settlement: &Settlement, now: DateTime<Utc>) -> Result<Settled> {
        let mut tx = self.pool.begin().await?;

        let row: Option<(bool,)> = sqlx::query_as(
            "UPDATE deployment_tasks
             SET state = ?, last_error = ?, finished_at = ?, updated_at = ?
             WHERE id = ? AND state = 'running'
             RETURNING cancel_requested",
        )
        .bind(settlement.state)
        .bind(&settlement.last_error)
        .bind(now.timestamp())
        .bind(now.timestamp())
        .bind(&settlement.task_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((cancel_requested,)) = row else {
            tx.rollback().await?;
            return Ok(Settled::default());
        };

        let status_applied = match &settlement.change {
            Some(change) => apply_change(&mut tx, change, now.timestamp()).await?,
            None => false,
        };

        tx.commit().await?;

        Ok(Settled {
            task_updated: true,
            status_applied,
            cancel_requested,
        })
    }

    async fn reschedule_task(
        &self,
        id: &str,
        run_at: DateTime<Utc>,
        last_error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE deployment_tasks
             SET state = 'queued', scheduled_at = ?, last_error = ?, started_at = NULL, updated_at = ?
             WHERE id = ? AND state = 'running'",
        )
        .bind(run_at.timestamp())
        .bind(last_error)
        .bind(now.timestamp())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn cancel_queued_task(
        &self,
        id: &str,
        revert: Option<&StatusChange>,
        now: DateTime<Utc>,
    ) -> Result<Option<DeploymentTask>> {
        let mut tx = self.pool.begin().await?;

        let removed = sqlx::query_as::<_, TaskRow>(
            "DELETE FROM deployment_tasks WHERE id = ? AND state = 'queued' RETURNING *",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(removed) = removed else {
            tx.rollback().await?;
            return Ok(None);
        };

        if let Some(change) = revert {
            apply_change(&mut tx, change, now.timestamp()).await?;
        }

        tx.commit().await?;

        Ok(Some(removed.into()))
    }

    async fn request_task_cancel(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE deployment_tasks SET cancel_requested = 1, updated_at = ?
             WHERE id = ? AND state = 'running'",
        )
        .bind(now.timestamp())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn requeue_running_tasks(
        &self,
        started_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE deployment_tasks
             SET state = 'queued', scheduled_at = ?, started_at = NULL, updated_at = ?
             WHERE state = 'running' AND started_at <= ?",
        )
        .bind(now.timestamp())
        .bind(now.timestamp())
        .bind(started_before.timestamp())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn append_deployment_log(&self, log: &DeploymentLog) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO deployment_logs (id, task_id, target_id, kind, attempt, phase, output, error, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&log.id)
        .bind(&log.task_id)
        .bind(&log.target_id)
        .bind(log.kind)
        .bind(i64::from(log.attempt))
        .bind(log.phase)
        .bind(&log.output)
        .bind(&log.error)
        .bind(log.created_at.timestamp())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_deployment_logs(&self, target_id: &str) -> Result<Vec<DeploymentLog>> {
        let rows = sqlx::query_as::<_, DeploymentLogRow>(
            "SELECT * FROM deployment_logs WHERE target_id = ? ORDER BY created_at ASC, rowid ASC",
        )
        .bind(target_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}

// Internal row types for sqlx
#[derive(sqlx::FromRow)]
struct WorkshopRow {
    id: String,
    name: String,
    start_at: i64,
    end_at: i64,
    timezone: String,
    status: WorkshopStatus,
    cleanup_scheduled_at: Option<i64>,
    template: Option<String>,
    created_at: i64,
    updated_at: i64,
}

#[derive(sqlx::FromRow)]
struct AttendeeRow {
    id: String,
    workshop_id: String,
    username: String,
    sanitized_identifier: String,
    email: String,
    status: AttendeeStatus,
    workspace_id: Option<String>,
    credentials: Option<String>,
    last_error: Option<String>,
    created_at: i64,
    updated_at: i64,
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: String,
    target_type: TargetKind,
    target_id: String,
    kind: TaskKind,
    queue: Queue,
    attempt_count: i64,
    max_attempts: i64,
    state: TaskState,
    scheduled_at: i64,
    started_at: Option<i64>,
    finished_at: Option<i64>,
    last_error: Option<String>,
    origin_status: Option<String>,
    cancel_requested: bool,
    created_at: i64,
}

#[derive(sqlx::FromRow)]
struct DeploymentLogRow {
    id: String,
    task_id: String,
    target_id: String,
    kind: TaskKind,
    attempt: i64,
    phase: LogPhase,
    output: Option<String>,
    error: Option<String>,
    created_at: i64,
}

fn timestamp(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_default()
}

fn count(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}

impl From<WorkshopRow> for Workshop {
    fn from(row: WorkshopRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            schedule: Schedule::new(timestamp(row.start_at), timestamp(row.end_at), row.timezone),
            status: row.status,
            cleanup_scheduled_at: row.cleanup_scheduled_at.map(timestamp),
            template: row.template,
            created_at: timestamp(row.created_at),
            updated_at: timestamp(row.updated_at),
        }
    }
}

impl From<AttendeeRow> for Attendee {
    fn from(row: AttendeeRow) -> Self {
        Self {
            id: row.id,
            workshop_id: row.workshop_id,
            username: row.username,
            sanitized_identifier: row.sanitized_identifier,
            email: row.email,
            status: row.status,
            workspace_id: row.workspace_id,
            credentials: row
                .credentials
                .and_then(|s| serde_json::from_str::<Credentials>(&s).ok()),
            last_error: row.last_error,
            created_at: timestamp(row.created_at),
            updated_at: timestamp(row.updated_at),
        }
    }
}

impl From<TaskRow> for DeploymentTask {
    fn from(row: TaskRow) -> Self {
        Self {
            id: row.id,
            target_type: row.target_type,
            target_id: row.target_id,
            kind: row.kind,
            queue: row.queue,
            attempt_count: count(row.attempt_count),
            max_attempts: count(row.max_attempts),
            state: row.state,
            scheduled_at: timestamp(row.scheduled_at),
            started_at: row.started_at.map(timestamp),
            finished_at: row.finished_at.map(timestamp),
            last_error: row.last_error,
            origin_status: row.origin_status,
            cancel_requested: row.cancel_requested,
            created_at: timestamp(row.created_at),
        }
    }
}

impl From<DeploymentLogRow> for DeploymentLog {
    fn from(row: DeploymentLogRow) -> Self {
        Self {
            id: row.id,
            task_id: row.task_id,
            target_id: row.target_id,
            kind: row.kind,
            attempt: count(row.attempt),
            phase: row.phase,
            output: row.output,
            error: row.error,
            created_at: timestamp(row.created_at),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{AttendeePatch, FieldUpdate};
    use crate::task::TaskRequest;
    use crate::test_utils::{create_test_db, sample_attendee, sample_workshop};
    use chrono::Duration;

    async fn store_with_attendee() -> (SqliteStore, Workshop, Attendee) {
        let store = SqliteStore::new(create_test_db().await);
        let workshop = sample_workshop("Cloud 101");
        store.insert_workshop(&workshop).await.unwrap();
        let attendee = sample_attendee(&workshop.id, "max.mustermann");
        store.insert_attendee(&attendee).await.unwrap();
        (store, workshop, attendee)
    }

    fn deploy_task(attendee: &Attendee, now: DateTime<Utc>) -> DeploymentTask {
        DeploymentTask::new(&TaskRequest::attendee(&attendee.id, TaskKind::Deploy), 3, now)
            .with_origin_status(attendee.status.as_str())
    }

    #[tokio::test]
    async fn workshop_round_trips() {
        let store = SqliteStore::new(create_test_db().await);
        let workshop = sample_workshop("Terraform Basics");
        store.insert_workshop(&workshop).await.unwrap();

        let loaded = store.get_workshop(&workshop.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "Terraform Basics");
        assert_eq!(loaded.status, WorkshopStatus::Planning);
        assert_eq!(loaded.schedule.start, workshop.schedule.start);
        assert_eq!(loaded.schedule.timezone, "Europe/Berlin");
        assert!(store.get_workshop("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn status_change_is_compare_and_set() {
        let (store, _, attendee) = store_with_attendee().await;
        let now = Utc::now();

        let change = StatusChange::attendee(
            &attendee.id,
            AttendeeStatus::Planning,
            AttendeeStatus::Deploying,
        );
        assert!(store.apply_status_change(&change, now).await.unwrap());
        // Second write finds the status already moved.
        assert!(!store.apply_status_change(&change, now).await.unwrap());
    }

    #[tokio::test]
    async fn attendee_patch_sets_and_clears_fields() {
        let (store, _, attendee) = store_with_attendee().await;
        let now = Utc::now();

        let to_active = StatusChange::attendee(
            &attendee.id,
            AttendeeStatus::Planning,
            AttendeeStatus::Active,
        )
        .with_patch(AttendeePatch {
            workspace_id: FieldUpdate::Set("attendee-x".into()),
            credentials: FieldUpdate::Set(Credentials {
                project_id: "p-1".into(),
                ..Default::default()
            }),
            last_error: FieldUpdate::Set("old".into()),
        });
        assert!(store.apply_status_change(&to_active, now).await.unwrap());

        let loaded = store.get_attendee(&attendee.id).await.unwrap().unwrap();
        assert_eq!(loaded.workspace_id.as_deref(), Some("attendee-x"));
        assert_eq!(loaded.credentials.unwrap().project_id, "p-1");

        let clear = StatusChange::attendee(
            &attendee.id,
            AttendeeStatus::Active,
            AttendeeStatus::Deleted,
        )
        .with_patch(AttendeePatch {
            credentials: FieldUpdate::Clear,
            last_error: FieldUpdate::Clear,
            ..Default::default()
        });
        assert!(store.apply_status_change(&clear, now).await.unwrap());

        let loaded = store.get_attendee(&attendee.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, AttendeeStatus::Deleted);
        assert!(loaded.credentials.is_none());
        assert!(loaded.last_error.is_none());
        assert_eq!(loaded.workspace_id.as_deref(), Some("attendee-x"));
    }

    #[tokio::test]
    async fn second_admission_merges_into_existing_task() {
        let (store, _, attendee) = store_with_attendee().await;
        let now = Utc::now();

        let change = StatusChange::attendee(
            &attendee.id,
            AttendeeStatus::Planning,
            AttendeeStatus::Deploying,
        );
        let first = deploy_task(&attendee, now);
        assert!(matches!(
            store.admit_task(&first, Some(&change), now).await.unwrap(),
            AdmitOutcome::Admitted
        ));

        let second = deploy_task(&attendee, now);
        match store.admit_task(&second, None, now).await.unwrap() {
            AdmitOutcome::Merged(existing) => assert_eq!(existing.id, first.id),
            other => panic!("expected merge, got {other:?}"),
        }

        let tasks = store
            .list_tasks_for_target(TargetKind::Attendee, &attendee.id)
            .await
            .unwrap();
        assert_eq!(tasks.len(), 1);
    }

    #[tokio::test]
    async fn stale_status_rolls_back_admission() {
        let (store, _, attendee) = store_with_attendee().await;
        let now = Utc::now();

        let wrong = StatusChange::attendee(
            &attendee.id,
            AttendeeStatus::Failed,
            AttendeeStatus::Deploying,
        );
        let task = deploy_task(&attendee, now);
        assert!(matches!(
            store.admit_task(&task, Some(&wrong), now).await.unwrap(),
            AdmitOutcome::Stale
        ));
        assert!(store.get_task(&task.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_respects_queue_and_schedule() {
        let (store, _, attendee) = store_with_attendee().await;
        let now = Utc::now();

        let mut task = deploy_task(&attendee, now);
        task.scheduled_at = now + Duration::seconds(60);
        store.admit_task(&task, None, now).await.unwrap();

        assert!(store.claim_next_task(Queue::Provisioning, now).await.unwrap().is_none());
        assert!(store
            .claim_next_task(Queue::Cleanup, now + Duration::seconds(60))
            .await
            .unwrap()
            .is_none());

        let claimed = store
            .claim_next_task(Queue::Provisioning, now + Duration::seconds(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, task.id);
        assert_eq!(claimed.state, TaskState::Running);
        assert_eq!(claimed.attempt_count, 1);

        // Already running, nothing else queued.
        assert!(store
            .claim_next_task(Queue::Provisioning, now + Duration::seconds(60))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn settlement_commits_task_and_status_together() {
        let (store, _, attendee) = store_with_attendee().await;
        let now = Utc::now();

        let admit = StatusChange::attendee(
            &attendee.id,
            AttendeeStatus::Planning,
            AttendeeStatus::Deploying,
        );
        let task = deploy_task(&attendee, now);
        store.admit_task(&task, Some(&admit), now).await.unwrap();
        store.claim_next_task(Queue::Provisioning, now).await.unwrap();
        assert!(store.request_task_cancel(&task.id, now).await.unwrap());

        let settled = store
            .settle_task(
                &Settlement {
                    task_id: task.id.clone(),
                    state: TaskState::Succeeded,
                    last_error: None,
                    change: Some(StatusChange::attendee(
                        &attendee.id,
                        AttendeeStatus::Deploying,
                        AttendeeStatus::Active,
                    )),
                },
                now,
            )
            .await
            .unwrap();

        assert!(settled.task_updated);
        assert!(settled.status_applied);
        assert!(settled.cancel_requested);

        let stored = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Succeeded);
        assert!(stored.finished_at.is_some());
        assert!(store
            .active_task_for_target(TargetKind::Attendee, &attendee.id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn settling_a_task_that_is_not_running_is_a_no_op() {
        let (store, _, attendee) = store_with_attendee().await;
        let now = Utc::now();
        let task = deploy_task(&attendee, now);
        store.admit_task(&task, None, now).await.unwrap();

        let settled = store
            .settle_task(
                &Settlement {
                    task_id: task.id.clone(),
                    state: TaskState::Failed,
                    last_error: Some("boom".into()),
                    change: None,
                },
                now,
            )
            .await
            .unwrap();
        assert_eq!(settled, Settled::default());
    }

    #[tokio::test]
    async fn cancelling_queued_task_restores_origin_status() {
        let (store, _, attendee) = store_with_attendee().await;
        let now = Utc::now();

        let admit = StatusChange::attendee(
            &attendee.id,
            AttendeeStatus::Planning,
            AttendeeStatus::Deploying,
        );
        let task = deploy_task(&attendee, now);
        store.admit_task(&task, Some(&admit), now).await.unwrap();

        let revert = StatusChange::attendee(
            &attendee.id,
            AttendeeStatus::Deploying,
            AttendeeStatus::Planning,
        );
        let removed = store
            .cancel_queued_task(&task.id, Some(&revert), now)
            .await
            .unwrap();
        assert_eq!(removed.unwrap().id, task.id);
        assert!(store.get_task(&task.id).await.unwrap().is_none());

        let loaded = store.get_attendee(&attendee.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, AttendeeStatus::Planning);
    }

    #[tokio::test]
    async fn requeue_only_touches_stale_running_tasks() {
        let (store, _, attendee) = store_with_attendee().await;
        let started = Utc::now();
        let task = deploy_task(&attendee, started);
        store.admit_task(&task, None, started).await.unwrap();
        store.claim_next_task(Queue::Provisioning, started).await.unwrap();

        let requeued = store
            .requeue_running_tasks(started - Duration::seconds(1), started)
            .await
            .unwrap();
        assert_eq!(requeued, 0);

        let later = started + Duration::hours(3);
        let requeued = store
            .requeue_running_tasks(later - Duration::hours(2), later)
            .await
            .unwrap();
        assert_eq!(requeued, 1);

        let stored = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Queued);
        assert_eq!(stored.attempt_count, 1);
    }

    #[tokio::test]
    async fn cleanup_time_is_written_once() {
        let store = SqliteStore::new(create_test_db().await);
        let workshop = sample_workshop("Once");
        store.insert_workshop(&workshop).await.unwrap();
        let now = Utc::now();

        assert!(store.set_cleanup_scheduled_at(&workshop.id, now, now).await.unwrap());
        assert!(!store
            .set_cleanup_scheduled_at(&workshop.id, now + Duration::hours(1), now)
            .await
            .unwrap());

        let loaded = store.get_workshop(&workshop.id).await.unwrap().unwrap();
        assert_eq!(loaded.cleanup_scheduled_at.unwrap().timestamp(), now.timestamp());
    }

    #[tokio::test]
    async fn deployment_logs_list_in_order() {
        let (store, _, attendee) = store_with_attendee().await;
        let now = Utc::now();
        let task = deploy_task(&attendee, now);

        store
            .append_deployment_log(&DeploymentLog::new(&task, LogPhase::Started, now))
            .await
            .unwrap();
        store
            .append_deployment_log(
                &DeploymentLog::new(&task, LogPhase::Failed, now)
                    .with_output("Error: 503 Service Unavailable")
                    .with_error("apply failed"),
            )
            .await
            .unwrap();

        let logs = store.list_deployment_logs(&attendee.id).await.unwrap();
        let phases: Vec<LogPhase> = logs.iter().map(|l| l.phase).collect();
        assert_eq!(phases, vec![LogPhase::Started, LogPhase::Failed]);
        assert_eq!(logs[1].output.as_deref(), Some("Error: 503 Service Unavailable"));
        assert_eq!(logs[1].error.as_deref(), Some("apply failed"));
        assert!(logs[0].output.is_none());
    }

    #[tokio::test]
    async fn delete_workshop_removes_attendees_and_tasks() {
        let (store, workshop, attendee) = store_with_attendee().await;
        let now = Utc::now();
        let task = deploy_task(&attendee, now);
        store.admit_task(&task, None, now).await.unwrap();
        store
            .append_deployment_log(&DeploymentLog::new(&task, LogPhase::Started, now))
            .await
            .unwrap();

        assert!(store.delete_workshop(&workshop.id).await.unwrap());
        assert!(store.get_attendee(&attendee.id).await.unwrap().is_none());
        assert!(store.get_task(&task.id).await.unwrap().is_none());
        assert!(store.list_deployment_logs(&attendee.id).await.unwrap().is_empty());
        assert!(!store.delete_workshop(&workshop.id).await.unwrap());
    }
}
