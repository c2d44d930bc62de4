// Standard library imports
use std::fs;
use std::path::{Path, PathBuf};

// External crate imports
use anyhow::{Context, Result};
use tracing::debug;

// Internal imports
use crate::config::LabsConfig;

pub const CONFIG_FILE_NAME: &str = "labs.yaml";

/// Finds and loads `labs.yaml`.
///
/// Discovery order:
/// 1. **Explicit path:** the `--config` argument, which must exist.
/// 2. **Current Directory:** `labs.yaml` in the working directory.
/// 3. **Global Configuration:** `~/.labs/config.yaml`.
/// 4. **Defaults:** built-in values.
///
/// `LABS_*` environment overrides are applied last and the result is validated.
#[derive(Default)]
pub struct ConfigLoader {
    explicit: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            explicit: Some(path.into()),
        }
    }

    pub fn load(&self) -> Result<LabsConfig> {
        let mut config = match self.locate()? {
            Some(path) => {
                debug!("Loading config from: {}", path.display());
                Self::load_file(&path)?
            }
            None => {
                debug!("No labs.yaml found, using defaults");
                LabsConfig::default()
            }
        };

        config.apply_env_overrides();
        config.validate().context("Invalid configuration")?;
        Ok(config)
    }

    fn locate(&self) -> Result<Option<PathBuf>> {
        if let Some(path) = &self.explicit {
            if !path.exists() {
                anyhow::bail!("Config file not found: {}", path.display());
            }
            return Ok(Some(path.clone()));
        }

        let local = Path::new(CONFIG_FILE_NAME);
        if local.exists() {
            return Ok(Some(local.to_path_buf()));
        }

        if let Some(home) = dirs::home_dir() {
            let global = home.join(".labs").join("config.yaml");
            if global.exists() {
                return Ok(Some(global));
            }
        }

        Ok(None)
    }

    /// Loads and deserializes a `LabsConfig` from a given file path.
    pub fn load_file(path: &Path) -> Result<LabsConfig> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        if contents.trim().is_empty() {
            return Ok(LabsConfig::default());
        }
        serde_yaml_ng::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", path.display()))
    }
}
