//! Shared fixtures for unit and integration tests.

use crate::attendee::{Attendee, AttendeeStatus, NewAttendee};
use crate::broadcaster::StatusBroadcaster;
use crate::clock::ManualClock;
use crate::engine::{InfraRunner, ProvisioningEngine, TemplateRenderer, WorkspaceManager};
use crate::orchestrator::{LifecycleSettings, Orchestrator};
use crate::store::SqliteStore;
use crate::task::Queue;
use crate::workshop::{NewWorkshop, Schedule, Workshop, WorkshopStatus};
use chrono::{DateTime, TimeZone, Utc};
use labs_core::{sanitize_identifier, CommandOutput, LabsError};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

/// Helper to create an in-memory test database with migrations applied
pub async fn create_test_db() -> SqlitePool {
    // A single connection keeps every query on the same in-memory database.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    pool
}

/// Monday morning before the sample workshop starts.
pub fn test_epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 10, 7, 0, 0).unwrap()
}

/// A planning workshop on 2025-03-10, 09:00 to 17:00 UTC, in Berlin time.
pub fn sample_workshop(name: &str) -> Workshop {
    let created = test_epoch();
    Workshop {
        id: Uuid::new_v4().to_string(),
        name: name.to_string(),
        schedule: Schedule::new(
            Utc.with_ymd_and_hms(2025, 3, 10, 9, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 3, 10, 17, 0, 0).unwrap(),
            "Europe/Berlin",
        ),
        status: WorkshopStatus::Planning,
        cleanup_scheduled_at: None,
        template: None,
        created_at: created,
        updated_at: created,
    }
}

pub fn sample_new_workshop(name: &str) -> NewWorkshop {
    let workshop = sample_workshop(name);
    NewWorkshop {
        name: workshop.name,
        start: workshop.schedule.start,
        end: workshop.schedule.end,
        timezone: workshop.schedule.timezone,
        template: None,
    }
}

pub fn sample_attendee(workshop_id: &str, username: &str) -> Attendee {
    let created = test_epoch();
    Attendee {
        id: Uuid::new_v4().to_string(),
        workshop_id: workshop_id.to_string(),
        username: username.to_string(),
        sanitized_identifier: sanitize_identifier(username),
        email: format!("{}@example.com", sanitize_identifier(username)),
        status: AttendeeStatus::Planning,
        workspace_id: None,
        credentials: None,
        last_error: None,
        created_at: created,
        updated_at: created,
    }
}

/// A scripted failure for one infrastructure command.
#[derive(Debug, Clone)]
pub enum ScriptedFailure {
    /// The command exits 1 with this text on stderr.
    Exit(String),
    /// The command exceeds its hard timeout.
    Timeout,
    /// Resources are created, then the command exits 1 with this text.
    ExitAfterCreate(String),
}

#[derive(Debug, Default)]
struct ScriptState {
    calls: Vec<(String, String)>,
    provisioned: HashSet<String>,
    apply_failures: HashMap<String, VecDeque<ScriptedFailure>>,
    destroy_failures: HashMap<String, VecDeque<ScriptedFailure>>,
}

/// An [`InfraRunner`] that pretends to be terraform.
///
/// Resources "exist" for an attendee between a successful `apply` and a
/// successful `destroy`. Failures are queued per attendee and consumed in
/// order.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    state: Mutex<ScriptState>,
    apply_delay: Mutex<Duration>,
    applies_held: Mutex<bool>,
    applies_released: Condvar,
    applies_running: AtomicUsize,
    max_concurrent_applies: AtomicUsize,
}

fn attendee_of(workspace: &Path) -> String {
    workspace
        .file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.trim_start_matches("attendee-").to_string())
        .unwrap_or_default()
}

fn exit(code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> CommandOutput {
    CommandOutput {
        exit_code: Some(code),
        stdout: stdout.into(),
        stderr: stderr.into(),
    }
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn fail_apply(&self, attendee_id: &str, failures: Vec<ScriptedFailure>) {
        self.state()
            .apply_failures
            .entry(attendee_id.to_string())
            .or_default()
            .extend(failures);
    }

    pub fn fail_destroy(&self, attendee_id: &str, failures: Vec<ScriptedFailure>) {
        self.state()
            .destroy_failures
            .entry(attendee_id.to_string())
            .or_default()
            .extend(failures);
    }

    pub fn set_apply_delay(&self, delay: Duration) {
        *self.apply_delay.lock().unwrap_or_else(|e| e.into_inner()) = delay;
    }

    /// Make every `apply` block until [`ScriptedRunner::release_applies`].
    pub fn hold_applies(&self) {
        *self.applies_held.lock().unwrap_or_else(|e| e.into_inner()) = true;
    }

    pub fn release_applies(&self) {
        *self.applies_held.lock().unwrap_or_else(|e| e.into_inner()) = false;
        self.applies_released.notify_all();
    }

    /// How often `command` ran in the attendee's workspace.
    pub fn count(&self, attendee_id: &str, command: &str) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|(id, cmd)| id == attendee_id && cmd == command)
            .count()
    }

    pub fn is_provisioned(&self, attendee_id: &str) -> bool {
        self.state().provisioned.contains(attendee_id)
    }

    pub fn max_concurrent_applies(&self) -> usize {
        self.max_concurrent_applies.load(Ordering::SeqCst)
    }

    fn failure(output: ScriptedFailure, step: &str) -> labs_core::Result<CommandOutput> {
        match output {
            ScriptedFailure::Exit(text) | ScriptedFailure::ExitAfterCreate(text) => {
                Ok(exit(1, "", text))
            }
            ScriptedFailure::Timeout => Err(LabsError::Timeout(format!(
                "terraform {} exceeded its timeout",
                step
            ))),
        }
    }

    fn apply(&self, attendee_id: &str) -> labs_core::Result<CommandOutput> {
        let running = self.applies_running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent_applies.fetch_max(running, Ordering::SeqCst);

        let delay = *self.apply_delay.lock().unwrap_or_else(|e| e.into_inner());
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        {
            let mut held = self.applies_held.lock().unwrap_or_else(|e| e.into_inner());
            while *held {
                held = self
                    .applies_released
                    .wait(held)
                    .unwrap_or_else(|e| e.into_inner());
            }
        }

        let result = {
            let mut state = self.state();
            let failure = state
                .apply_failures
                .get_mut(attendee_id)
                .and_then(VecDeque::pop_front);
            match failure {
                Some(failure) => {
                    if matches!(failure, ScriptedFailure::ExitAfterCreate(_)) {
                        state.provisioned.insert(attendee_id.to_string());
                    }
                    Self::failure(failure, "apply")
                }
                None => {
                    state.provisioned.insert(attendee_id.to_string());
                    Ok(exit(0, "Apply complete! Resources: 3 added.", ""))
                }
            }
        };

        self.applies_running.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn destroy(&self, attendee_id: &str) -> labs_core::Result<CommandOutput> {
        let mut state = self.state();
        let failure = state
            .destroy_failures
            .get_mut(attendee_id)
            .and_then(VecDeque::pop_front);
        match failure {
            Some(failure) => Self::failure(failure, "destroy"),
            None => {
                state.provisioned.remove(attendee_id);
                Ok(exit(0, "Destroy complete! Resources: 3 destroyed.", ""))
            }
        }
    }
}

impl InfraRunner for ScriptedRunner {
    fn run(
        &self,
        workspace: &Path,
        args: &[&str],
        _timeout: Duration,
    ) -> labs_core::Result<CommandOutput> {
        let attendee_id = attendee_of(workspace);
        let command = match args {
            ["state", sub, ..] => format!("state {}", sub),
            [first, ..] => first.to_string(),
            [] => String::new(),
        };
        self.state()
            .calls
            .push((attendee_id.clone(), command.clone()));

        match command.as_str() {
            "apply" => self.apply(&attendee_id),
            "destroy" => self.destroy(&attendee_id),
            "output" => {
                if self.is_provisioned(&attendee_id) {
                    let json = serde_json::json!({
                        "project_id": {"value": format!("proj-{}", attendee_id)},
                        "username": {"value": format!("user-{}", attendee_id)},
                        "password": {"value": "not-a-real-password"},
                    });
                    Ok(exit(0, json.to_string(), ""))
                } else {
                    Ok(exit(0, "{}", ""))
                }
            }
            "state list" => {
                if self.is_provisioned(&attendee_id) {
                    Ok(exit(
                        0,
                        "ovh_cloud_project.attendee\novh_me_identity_user.attendee\n",
                        "",
                    ))
                } else {
                    Ok(exit(0, "", ""))
                }
            }
            _ => Ok(exit(0, "", "")),
        }
    }
}

/// An orchestrator over an in-memory database, a scripted runner, a
/// temporary workspace root and a manual clock.
pub struct TestHarness {
    pub orchestrator: Orchestrator,
    pub clock: Arc<ManualClock>,
    pub runner: Arc<ScriptedRunner>,
    pub store: Arc<SqliteStore>,
    pub workspace_dir: TempDir,
}

impl TestHarness {
    pub async fn new() -> Self {
        Self::with_settings(Self::settings()).await
    }

    /// Defaults with one-second backoff so retries stay easy to reason about.
    pub fn settings() -> LifecycleSettings {
        LifecycleSettings {
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            ..LifecycleSettings::default()
        }
    }

    pub async fn with_settings(settings: LifecycleSettings) -> Self {
        let workspace_dir = TempDir::new().expect("Failed to create workspace dir");
        let runner = Arc::new(ScriptedRunner::new());
        let engine = ProvisioningEngine::new(
            runner.clone(),
            WorkspaceManager::new(workspace_dir.path()),
            TemplateRenderer::new(None),
            Duration::from_secs(60),
        );
        let store = Arc::new(SqliteStore::new(create_test_db().await));
        let clock = Arc::new(ManualClock::new(test_epoch()));

        let orchestrator = Orchestrator::new(
            store.clone(),
            Arc::new(engine),
            clock.clone(),
            StatusBroadcaster::new(1024),
            settings,
        );

        Self {
            orchestrator,
            clock,
            runner,
            store,
            workspace_dir,
        }
    }

    /// Create a workshop and add attendees with the given usernames.
    pub async fn workshop_with(&self, usernames: &[&str]) -> (Workshop, Vec<Attendee>) {
        let workshop = self
            .orchestrator
            .create_workshop(sample_new_workshop("Cloud Foundations"))
            .await
            .expect("Failed to create workshop");

        let mut attendees = Vec::new();
        for username in usernames {
            let attendee = self
                .orchestrator
                .add_attendee(
                    &workshop.id,
                    NewAttendee::new(*username, format!("{}@example.com", username)),
                )
                .await
                .expect("Failed to add attendee");
            attendees.push(attendee);
        }
        (workshop, attendees)
    }

    /// Run every task that is due now, on the calling task, until both
    /// queues are empty. Returns how many tasks ran.
    pub async fn drain(&self) -> usize {
        let mut ran = 0;
        loop {
            let mut progressed = false;
            for queue in Queue::ALL {
                while self
                    .orchestrator
                    .run_next_task(queue)
                    .await
                    .expect("Failed to run task")
                    .is_some()
                {
                    ran += 1;
                    progressed = true;
                }
            }
            if !progressed {
                return ran;
            }
        }
    }
}
