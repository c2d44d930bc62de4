use labs_core::command_stream::{resolve_tool, DEFAULT_INTERRUPT_GRACE};
use labs_core::{run_captured, CommandOutput, CommandSpec};
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Executes infrastructure tool commands inside a workspace.
///
/// Implementations block until the command exits or `timeout` elapses.
pub trait InfraRunner: Send + Sync + Debug {
    fn run(
        &self,
        workspace: &Path,
        args: &[&str],
        timeout: Duration,
    ) -> labs_core::Result<CommandOutput>;
}

#[derive(Debug, Clone)]
pub struct TerraformRunner {
    binary: PathBuf,
    env: Vec<(String, String)>,
    interrupt_grace: Duration,
}

impl TerraformRunner {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            env: Vec::new(),
            interrupt_grace: DEFAULT_INTERRUPT_GRACE,
        }
    }

    /// Resolve `binary` on PATH (or as a path) up front, so a missing tool
    /// fails at startup rather than on the first task.
    pub fn detect(binary: &str) -> labs_core::Result<Self> {
        Ok(Self::new(resolve_tool(binary)?))
    }

    pub fn with_env<I, K, V>(mut self, env: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(env.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// How long terraform gets to write state after a timeout interrupt.
    pub fn with_interrupt_grace(mut self, grace: Duration) -> Self {
        self.interrupt_grace = grace;
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }
}

impl InfraRunner for TerraformRunner {
    fn run(
        &self,
        workspace: &Path,
        args: &[&str],
        timeout: Duration,
    ) -> labs_core::Result<CommandOutput> {
        let mut spec = CommandSpec::new(&self.binary, timeout)
            .interrupt_grace(self.interrupt_grace)
            .args(args.iter().copied())
            .current_dir(workspace)
            .env("TF_IN_AUTOMATION", "1")
            .env("TF_INPUT", "0");
        for (key, value) in &self.env {
            spec = spec.env(key, value);
        }
        run_captured(&spec)
    }
}
