// Standard library
use std::ffi::OsString;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

// External crates
use crate::error::{LabsError, Result};
use duct::{cmd, Handle};
use tracing::{debug, warn};
use which::which;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long an interrupted command may take to shut down cleanly.
pub const DEFAULT_INTERRUPT_GRACE: Duration = Duration::from_secs(60);

/// A fully described external invocation.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub envs: Vec<(String, String)>,
    pub timeout: Duration,
    /// Time between SIGINT and SIGKILL once `timeout` has passed.
    pub interrupt_grace: Duration,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            envs: Vec::new(),
            timeout,
            interrupt_grace: DEFAULT_INTERRUPT_GRACE,
        }
    }

    pub fn interrupt_grace(mut self, grace: Duration) -> Self {
        self.interrupt_grace = grace;
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Human readable command line, used in logs and error messages.
    pub fn display(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// stdout followed by stderr, the way operators read tool output.
    pub fn combined(&self) -> String {
        let mut out = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&self.stderr);
        }
        out
    }

    /// Last `n` lines of combined output for error context.
    pub fn tail(&self, n: usize) -> String {
        let combined = self.combined();
        let lines: Vec<&str> = combined.lines().collect();
        let start = lines.len().saturating_sub(n);
        lines[start..].join("\n")
    }
}

/// Run a command to completion, capturing stdout and stderr separately.
///
/// A non-zero exit is not an error here; callers inspect [`CommandOutput`].
/// Exceeding the hard timeout interrupts the child, kills it if it is still
/// alive after the grace period, and returns [`LabsError::Timeout`].
pub fn run_captured(spec: &CommandSpec) -> Result<CommandOutput> {
    let full_command = spec.display();
    let args: Vec<OsString> = spec.args.iter().map(OsString::from).collect();

    let mut expression = cmd(spec.program.as_os_str(), args)
        .stdout_capture()
        .stderr_capture()
        .unchecked();
    if let Some(dir) = &spec.cwd {
        expression = expression.dir(dir);
    }
    for (key, value) in &spec.envs {
        expression = expression.env(key, value);
    }

    debug!(command = %full_command, "starting external command");

    let handle = expression.start().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            LabsError::Dependency(spec.program.display().to_string())
        } else {
            LabsError::Command(format!("Failed to start '{}': {}", full_command, e))
        }
    })?;

    let start = Instant::now();
    loop {
        if start.elapsed() >= spec.timeout {
            stop(&handle, &full_command, spec.interrupt_grace);
            return Err(LabsError::Timeout(format!(
                "'{}' exceeded {}s",
                full_command,
                spec.timeout.as_secs()
            )));
        }

        match handle.try_wait() {
            Ok(Some(output)) => {
                return Ok(CommandOutput {
                    exit_code: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                });
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(e) => {
                return Err(LabsError::Command(format!(
                    "Error waiting for '{}': {}",
                    full_command, e
                )));
            }
        }
    }
}

/// Interrupt first so tools like terraform can persist state and release
/// their locks, then kill.
fn stop(handle: &Handle, command: &str, grace: Duration) {
    if interrupt(handle) {
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            match handle.try_wait() {
                Ok(Some(_)) => {
                    debug!(command, "command exited after interrupt");
                    return;
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(e) => {
                    warn!(command, error = %e, "error waiting for interrupted command");
                    break;
                }
            }
        }
        warn!(command, grace_secs = grace.as_secs(), "command ignored interrupt, killing it");
    }

    if let Err(e) = handle.kill() {
        warn!(command, error = %e, "failed to kill timed out command");
    }
}

#[cfg(unix)]
fn interrupt(handle: &Handle) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let mut delivered = false;
    for pid in handle.pids() {
        let Ok(raw) = i32::try_from(pid) else {
            continue;
        };
        match kill(Pid::from_raw(raw), Signal::SIGINT) {
            Ok(()) => delivered = true,
            Err(e) => warn!(pid, error = %e, "failed to interrupt command"),
        }
    }
    delivered
}

#[cfg(not(unix))]
fn interrupt(_handle: &Handle) -> bool {
    false
}

/// Resolve a tool on PATH (or an explicit path) to an absolute location.
pub fn resolve_tool(tool: &str) -> Result<PathBuf> {
    which(tool).map_err(|_| LabsError::Dependency(tool.to_string()))
}

/// Checks if a command-line tool is available in the system's PATH.
pub fn is_tool_installed(tool_name: &str) -> bool {
    which(tool_name).is_ok()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn captures_stdout_and_exit_code() {
        let spec = CommandSpec::new("sh", Duration::from_secs(5))
            .args(["-c", "echo hello; echo oops >&2; exit 3"]);
        let output = run_captured(&spec).unwrap();

        assert_eq!(output.exit_code, Some(3));
        assert!(!output.success());
        assert_eq!(output.stdout.trim(), "hello");
        assert_eq!(output.stderr.trim(), "oops");
        assert_eq!(output.combined(), "hello\noops\n");
    }

    #[test]
    fn passes_env_and_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let spec = CommandSpec::new("sh", Duration::from_secs(5))
            .args(["-c", "echo $LABS_TEST_VAR; pwd"])
            .env("LABS_TEST_VAR", "from-env")
            .current_dir(dir.path());
        let output = run_captured(&spec).unwrap();

        assert!(output.success());
        assert!(output.stdout.starts_with("from-env"));
    }

    #[test]
    fn timeout_kills_the_child() {
        let spec = CommandSpec::new("sleep", Duration::from_millis(300))
            .arg("10")
            .interrupt_grace(Duration::from_secs(2));
        let started = Instant::now();
        let err = run_captured(&spec).unwrap_err();

        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn timeout_interrupts_before_killing() {
        let dir = tempfile::tempdir().unwrap();
        let spec = CommandSpec::new("sh", Duration::from_millis(300))
            .args([
                "-c",
                "trap 'echo saved > state; exit 130' INT; while true; do sleep 0.1; done",
            ])
            .current_dir(dir.path())
            .interrupt_grace(Duration::from_secs(5));
        let started = Instant::now();

        let err = run_captured(&spec).unwrap_err();
        assert!(err.is_timeout());
        // The trap ran, so the command got to clean up.
        let saved = std::fs::read_to_string(dir.path().join("state")).unwrap();
        assert_eq!(saved.trim(), "saved");
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn command_ignoring_interrupt_is_killed_after_grace() {
        let spec = CommandSpec::new("sh", Duration::from_millis(200))
            .args(["-c", "trap '' INT; while true; do sleep 0.1; done"])
            .interrupt_grace(Duration::from_millis(300));
        let started = Instant::now();

        let err = run_captured(&spec).unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn bare_program_name_is_looked_up_on_path() {
        let dir = tempfile::tempdir().unwrap();
        let bare = CommandSpec::new("sh", Duration::from_secs(5))
            .args(["-c", "echo found"])
            .current_dir(dir.path());
        assert_eq!(run_captured(&bare).unwrap().stdout.trim(), "found");

        let resolved = CommandSpec::new(which("sh").unwrap(), Duration::from_secs(5))
            .args(["-c", "echo found"]);
        assert_eq!(run_captured(&resolved).unwrap().stdout.trim(), "found");
    }

    #[test]
    fn missing_binary_is_a_dependency_error() {
        let spec = CommandSpec::new("labs-definitely-not-installed", Duration::from_secs(1));
        match run_captured(&spec) {
            Err(LabsError::Dependency(name)) => assert!(name.contains("labs-definitely")),
            other => panic!("expected dependency error, got {:?}", other),
        }
    }

    #[test]
    fn tail_keeps_last_lines() {
        let output = CommandOutput {
            exit_code: Some(1),
            stdout: "a\nb\nc\n".to_string(),
            stderr: "d\n".to_string(),
        };
        assert_eq!(output.tail(2), "c\nd");
    }
}
