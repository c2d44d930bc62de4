//! Provisioning engine: drives the infrastructure tool for one attendee.
//!
//! All methods block; async callers run them on the blocking pool.

mod classify;
mod outputs;
mod runner;
pub mod template;
pub mod workspace;

pub use classify::{classify, FailureClass, InfraError, LOG_TAIL_LINES};
pub use labs_core::sanitize_identifier as sanitize;
pub use outputs::parse_credentials;
pub use runner::{InfraRunner, TerraformRunner};
pub use template::{TemplateRenderer, BUILTIN_TEMPLATE};
pub use workspace::{Workspace, WorkspaceManager};

use crate::attendee::Credentials;
use chrono::Utc;
use labs_config::ProvisioningConfig;
use labs_core::CommandOutput;
use rand::distr::Alphanumeric;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Everything the engine needs to know about one attendee.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttendeeSpec {
    pub attendee_id: String,
    pub workshop_id: String,
    pub workshop_name: String,
    /// Already sanitized.
    pub identifier: String,
    pub email: String,
    pub template: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployOutcome {
    pub workspace_id: String,
    pub credentials: Credentials,
    pub reused_workspace: bool,
    /// Tail of the apply output.
    pub output: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DestroyOutcome {
    /// False when there was no initialized workspace to destroy.
    pub destroyed: bool,
    pub output: String,
}

/// What the tool's state says exists for an attendee.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteState {
    Absent,
    /// Some resources exist but the outputs are incomplete.
    Partial,
    Provisioned(Credentials),
}

#[derive(Debug, Clone)]
pub struct ProvisioningEngine {
    runner: Arc<dyn InfraRunner>,
    workspaces: WorkspaceManager,
    templates: TemplateRenderer,
    timeout: Duration,
}

impl ProvisioningEngine {
    pub fn new(
        runner: Arc<dyn InfraRunner>,
        workspaces: WorkspaceManager,
        templates: TemplateRenderer,
        timeout: Duration,
    ) -> Self {
        Self {
            runner,
            workspaces,
            templates,
            timeout,
        }
    }

    pub fn from_config(config: &ProvisioningConfig) -> labs_core::Result<Self> {
        let runner = TerraformRunner::detect(&config.terraform_binary)?
            .with_env(config.env.iter().map(|(k, v)| (k.clone(), v.clone())))
            .with_interrupt_grace(config.interrupt_grace());
        info!(binary = %runner.binary().display(), "using infrastructure tool");

        Ok(Self::new(
            Arc::new(runner),
            WorkspaceManager::new(&config.workspace_dir),
            TemplateRenderer::new(config.templates_dir.clone()),
            config.command_timeout(),
        ))
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    fn run(
        &self,
        workspace: &Workspace,
        step: &str,
        args: &[&str],
    ) -> Result<CommandOutput, InfraError> {
        debug!(workspace = %workspace.id, step, "running infrastructure step");
        let output = self.runner.run(&workspace.path, args, self.timeout)?;
        if !output.success() {
            let err = InfraError::from_output(step, &output);
            warn!(
                workspace = %workspace.id,
                step,
                class = %err.class,
                "infrastructure step failed"
            );
            return Err(err);
        }
        Ok(output)
    }

    /// Reuse a complete workspace or build a new one and initialize it.
    ///
    /// Returns the workspace and whether it was reused.
    pub fn ensure_workspace(&self, spec: &AttendeeSpec) -> Result<(Workspace, bool), InfraError> {
        if let Some(workspace) = self.workspaces.load(&spec.attendee_id)? {
            debug!(workspace = %workspace.id, "reusing workspace");
            return Ok((workspace, true));
        }

        let files = self.templates.render(spec, &generate_password())?;
        let mut workspace = self.workspaces.create(spec, &files, Utc::now())?;
        self.run(&workspace, "init", &["init", "-input=false", "-no-color"])?;
        self.workspaces.mark_initialized(&mut workspace)?;

        Ok((workspace, false))
    }

    pub fn plan(&self, workspace: &Workspace) -> Result<(), InfraError> {
        self.run(
            workspace,
            "plan",
            &["plan", "-input=false", "-no-color", "-parallelism=1", "-out=tfplan"],
        )?;
        Ok(())
    }

    pub fn apply(&self, workspace: &Workspace) -> Result<CommandOutput, InfraError> {
        self.run(
            workspace,
            "apply",
            &[
                "apply",
                "-input=false",
                "-no-color",
                "-auto-approve",
                "-parallelism=1",
                "tfplan",
            ],
        )
    }

    pub fn outputs(&self, workspace: &Workspace) -> Result<Credentials, InfraError> {
        let output = self.run(workspace, "output", &["output", "-json", "-no-color"])?;
        parse_credentials(&output.stdout)
    }

    /// Provision everything the attendee needs. Safe to repeat: an existing
    /// workspace is reused and the tool reconciles against its state.
    #[instrument(skip(self, spec), fields(attendee_id = %spec.attendee_id))]
    pub fn deploy(&self, spec: &AttendeeSpec) -> Result<DeployOutcome, InfraError> {
        let (workspace, reused) = self.ensure_workspace(spec)?;
        self.plan(&workspace)?;
        let applied = self.apply(&workspace)?;
        let credentials = self.outputs(&workspace)?;

        info!(
            attendee_id = %spec.attendee_id,
            project_id = %credentials.project_id,
            "attendee resources provisioned"
        );

        Ok(DeployOutcome {
            workspace_id: workspace.id,
            credentials,
            reused_workspace: reused,
            output: applied.tail(LOG_TAIL_LINES),
        })
    }

    /// Tear down the attendee's resources and remove the workspace.
    ///
    /// A workspace that never finished `init` cannot have created resources
    /// and is just removed.
    #[instrument(skip(self))]
    pub fn destroy(&self, attendee_id: &str) -> Result<DestroyOutcome, InfraError> {
        let Some(workspace) = self.workspaces.load(attendee_id)? else {
            self.workspaces.remove(attendee_id)?;
            debug!(attendee_id, "no initialized workspace, nothing to destroy");
            return Ok(DestroyOutcome::default());
        };

        let output = self.run(
            &workspace,
            "destroy",
            &[
                "destroy",
                "-input=false",
                "-no-color",
                "-auto-approve",
                "-parallelism=1",
            ],
        )?;
        self.workspaces.remove(attendee_id)?;

        info!(attendee_id, "attendee resources destroyed");
        Ok(DestroyOutcome {
            destroyed: true,
            output: output.tail(LOG_TAIL_LINES),
        })
    }

    /// Ask the tool's state what exists right now.
    #[instrument(skip(self))]
    pub fn inspect(&self, attendee_id: &str) -> Result<RemoteState, InfraError> {
        let Some(workspace) = self.workspaces.load(attendee_id)? else {
            return Ok(RemoteState::Absent);
        };

        let listing = self.run(&workspace, "state list", &["state", "list"])?;
        if listing.stdout.trim().is_empty() {
            return Ok(RemoteState::Absent);
        }

        Ok(match self.outputs(&workspace) {
            Ok(credentials) => RemoteState::Provisioned(credentials),
            Err(_) => RemoteState::Partial,
        })
    }
}

fn generate_password() -> String {
    let random: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(18)
        .map(char::from)
        .collect();
    // Guarantees every character class the provider's password policy asks for.
    format!("{}-Lb7", random)
}
