//! Workshop lifecycle orchestration
//!
//! This crate owns the lifecycle of workshops and their attendees: it admits
//! deployment and cleanup requests as durable tasks, runs them against
//! per-attendee terraform workspaces on bounded worker pools, and sweeps for
//! time-driven transitions such as post-workshop cleanup.

pub mod attendee;
pub mod broadcaster;
pub mod clock;
pub mod db;
pub mod deployment_log;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod locks;
pub mod orchestrator;
pub mod scheduler;
pub mod state_machine;
pub mod store;
pub mod task;
pub mod worker;
pub mod workshop;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use attendee::{Attendee, AttendeeStatus, Credentials, NewAttendee};
pub use broadcaster::{StatusBroadcaster, StatusEvent};
pub use clock::{Clock, ManualClock, SystemClock};
pub use deployment_log::{DeploymentLog, LogPhase};
pub use dispatcher::{Admission, TaskDispatcher};
pub use engine::{
    FailureClass, InfraError, InfraRunner, ProvisioningEngine, RemoteState, TerraformRunner,
};
pub use error::{ErrorCode, OrchestratorError, Result};
pub use orchestrator::{
    Cancellation, EntityState, LifecycleSettings, Orchestrator, Submission, WorkshopOverview,
};
pub use scheduler::{LifecycleScheduler, SweepSummary};
pub use state_machine::{
    compute_workshop_state, validate_transition, EffectiveState, EntityKind, TransitionCheck,
    TransitionContext,
};
pub use store::{EntityStore, SqliteStore};
pub use task::{DeploymentTask, Queue, TargetKind, TaskKind, TaskRequest, TaskState};
pub use worker::WorkerPool;
pub use workshop::{NewWorkshop, Schedule, Workshop, WorkshopStatus};
