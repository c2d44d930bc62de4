use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use labs_core::error::{LabsError, Result};
use labs_logging::LoggingConfig;
use serde::{Deserialize, Serialize};

/// Root of `labs.yaml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LabsConfig {
    pub database: DatabaseConfig,
    pub workers: WorkerPoolConfig,
    pub scheduler: SchedulerConfig,
    pub provisioning: ProvisioningConfig,
    pub broadcaster: BroadcasterConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub backup_before_migrate: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: labs_home().join("labs.db"),
            backup_before_migrate: true,
        }
    }
}

/// Per-queue ceilings on simultaneously running provisioning operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    pub provisioning: usize,
    pub cleanup: usize,
    pub poll_interval_ms: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            provisioning: 4,
            cleanup: 4,
            poll_interval_ms: 1000,
        }
    }
}

impl WorkerPoolConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub interval_secs: u64,
    pub cleanup_delay_hours: i64,
    pub stale_task_secs: i64,
    pub prune_orphaned_workspaces: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 1800, // 30 minutes
            cleanup_delay_hours: 72,
            stale_task_secs: 10800,
            prune_orphaned_workspaces: true,
        }
    }
}

impl SchedulerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    pub terraform_binary: String,
    pub workspace_dir: PathBuf,
    pub templates_dir: Option<PathBuf>,
    pub default_template: String,
    pub command_timeout_secs: u64,
    /// Time terraform gets to save state after a timeout interrupt.
    pub interrupt_grace_secs: u64,
    pub max_attempts: u32,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
    /// Extra environment for the infrastructure tool (provider credentials).
    pub env: BTreeMap<String, String>,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            terraform_binary: "terraform".to_string(),
            workspace_dir: labs_home().join("workspaces"),
            templates_dir: None,
            default_template: "ovh-public-cloud".to_string(),
            command_timeout_secs: 1800,
            interrupt_grace_secs: 60,
            max_attempts: 3,
            backoff_base_secs: 30,
            backoff_max_secs: 900,
            env: BTreeMap::new(),
        }
    }
}

impl ProvisioningConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn interrupt_grace(&self) -> Duration {
        Duration::from_secs(self.interrupt_grace_secs)
    }

    /// Longest a deploy can legitimately run: init, plan, apply and output,
    /// each up to the timeout plus the interrupt grace.
    pub fn worst_case_task_secs(&self) -> u64 {
        DEPLOY_STEPS * (self.command_timeout_secs + self.interrupt_grace_secs)
    }
}

const DEPLOY_STEPS: u64 = 4;

/// Headroom between the longest legitimate task and stale redelivery.
pub const STALE_TASK_MARGIN_SECS: u64 = 300;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcasterConfig {
    pub capacity: usize,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self { capacity: 256 }
    }
}

fn labs_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".labs")
}

impl LabsConfig {
    /// Apply `LABS_*` environment overrides on top of file values.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    pub(crate) fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("LABS_DB_PATH") {
            self.database.path = PathBuf::from(path);
        }
        if let Some(dir) = lookup("LABS_WORKSPACE_DIR") {
            self.provisioning.workspace_dir = PathBuf::from(dir);
        }
        if let Some(binary) = lookup("LABS_TERRAFORM_BINARY") {
            self.provisioning.terraform_binary = binary;
        }
        if let Some(secs) = lookup("LABS_SCHEDULER_INTERVAL").and_then(|s| s.parse().ok()) {
            self.scheduler.interval_secs = secs;
        }
        if let Some(hours) = lookup("LABS_CLEANUP_DELAY_HOURS").and_then(|s| s.parse().ok()) {
            self.scheduler.cleanup_delay_hours = hours;
        }
        if let Some(n) = lookup("LABS_PROVISIONING_WORKERS").and_then(|s| s.parse().ok()) {
            self.workers.provisioning = n;
        }
        if let Some(n) = lookup("LABS_CLEANUP_WORKERS").and_then(|s| s.parse().ok()) {
            self.workers.cleanup = n;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers.provisioning == 0 || self.workers.cleanup == 0 {
            return Err(LabsError::Config(
                "worker ceilings must be at least 1".to_string(),
            ));
        }
        if self.scheduler.interval_secs == 0 {
            return Err(LabsError::Config(
                "scheduler.interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.scheduler.cleanup_delay_hours < 0 {
            return Err(LabsError::Config(
                "scheduler.cleanup_delay_hours cannot be negative".to_string(),
            ));
        }
        if self.provisioning.max_attempts == 0 {
            return Err(LabsError::Config(
                "provisioning.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.provisioning.command_timeout_secs == 0 {
            return Err(LabsError::Config(
                "provisioning.command_timeout_secs must be greater than 0".to_string(),
            ));
        }
        let min_stale = self.provisioning.worst_case_task_secs() + STALE_TASK_MARGIN_SECS;
        if u64::try_from(self.scheduler.stale_task_secs).map_or(true, |secs| secs <= min_stale) {
            return Err(LabsError::Config(format!(
                "scheduler.stale_task_secs must exceed {}s (four steps of command_timeout_secs plus interrupt_grace_secs, plus {}s margin)",
                min_stale, STALE_TASK_MARGIN_SECS
            )));
        }
        if self.provisioning.backoff_base_secs > self.provisioning.backoff_max_secs {
            return Err(LabsError::Config(
                "provisioning.backoff_base_secs exceeds backoff_max_secs".to_string(),
            ));
        }
        if self.broadcaster.capacity == 0 {
            return Err(LabsError::Config(
                "broadcaster.capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_valid() {
        let config = LabsConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scheduler.interval_secs, 1800);
        assert_eq!(config.scheduler.cleanup_delay_hours, 72);
        assert_eq!(config.provisioning.max_attempts, 3);
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let yaml = "workers:\n  provisioning: 2\nscheduler:\n  cleanup_delay_hours: 24\n";
        let config: LabsConfig = serde_yaml_ng::from_str(yaml).unwrap();

        assert_eq!(config.workers.provisioning, 2);
        assert_eq!(config.workers.cleanup, 4);
        assert_eq!(config.scheduler.cleanup_delay_hours, 24);
        assert_eq!(config.scheduler.interval_secs, 1800);
    }

    #[test]
    fn env_overrides_win() {
        let vars: HashMap<&str, &str> = [
            ("LABS_DB_PATH", "/srv/labs/labs.db"),
            ("LABS_PROVISIONING_WORKERS", "8"),
            ("LABS_SCHEDULER_INTERVAL", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut config = LabsConfig::default();
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.database.path, PathBuf::from("/srv/labs/labs.db"));
        assert_eq!(config.workers.provisioning, 8);
        // Unparseable values are ignored.
        assert_eq!(config.scheduler.interval_secs, 1800);
    }

    #[test]
    fn validate_rejects_zero_ceilings() {
        let mut config = LabsConfig::default();
        config.workers.cleanup = 0;
        assert!(config.validate().is_err());

        let mut config = LabsConfig::default();
        config.provisioning.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = LabsConfig::default();
        config.provisioning.backoff_base_secs = 1000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn stale_window_must_outlast_a_running_deploy() {
        let mut config = LabsConfig::default();
        // 4 * (1800 + 60)
        assert_eq!(config.provisioning.worst_case_task_secs(), 7440);

        config.scheduler.stale_task_secs = 7200;
        assert!(config.validate().is_err());

        config.scheduler.stale_task_secs = 7740;
        assert!(config.validate().is_err());

        config.scheduler.stale_task_secs = 7741;
        assert!(config.validate().is_ok());

        config.provisioning.command_timeout_secs = 3600;
        assert!(config.validate().is_err());

        config.scheduler.stale_task_secs = -1;
        assert!(config.validate().is_err());
    }
}
