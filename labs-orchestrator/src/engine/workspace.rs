//! One isolated working directory per attendee.

use super::classify::InfraError;
use super::template::RenderedFiles;
use super::AttendeeSpec;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const WORKSPACE_PREFIX: &str = "attendee-";
pub const MANIFEST_FILE: &str = "workspace.json";
pub const MAIN_TF: &str = "main.tf";
pub const TFVARS: &str = "terraform.tfvars";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceManifest {
    pub attendee_id: String,
    pub workshop_id: String,
    pub identifier: String,
    pub template: String,
    pub created_at: DateTime<Utc>,
    /// Set once `terraform init` has succeeded.
    pub initialized: bool,
}

#[derive(Debug, Clone)]
pub struct Workspace {
    pub id: String,
    pub path: PathBuf,
    pub manifest: WorkspaceManifest,
}

#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn workspace_id(attendee_id: &str) -> String {
        format!("{}{}", WORKSPACE_PREFIX, attendee_id)
    }

    pub fn path_for(&self, attendee_id: &str) -> Result<PathBuf, InfraError> {
        let safe = !attendee_id.is_empty()
            && attendee_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !safe {
            return Err(InfraError::permanent(format!(
                "attendee id '{}' cannot name a workspace",
                attendee_id
            )));
        }
        Ok(self.root.join(Self::workspace_id(attendee_id)))
    }

    pub fn exists(&self, attendee_id: &str) -> bool {
        self.path_for(attendee_id).is_ok_and(|path| path.is_dir())
    }

    /// A workspace that is complete and initialized for this attendee.
    ///
    /// Directories left half-written by an interrupted run load as `None`.
    pub fn load(&self, attendee_id: &str) -> Result<Option<Workspace>, InfraError> {
        let path = self.path_for(attendee_id)?;
        if !path.is_dir() {
            return Ok(None);
        }

        let manifest = match fs::read_to_string(path.join(MANIFEST_FILE))
            .ok()
            .and_then(|raw| serde_json::from_str::<WorkspaceManifest>(&raw).ok())
        {
            Some(manifest) => manifest,
            None => return Ok(None),
        };

        let complete = manifest.attendee_id == attendee_id
            && manifest.initialized
            && path.join(MAIN_TF).is_file()
            && path.join(TFVARS).is_file();
        if !complete {
            debug!(attendee_id, "workspace present but incomplete");
            return Ok(None);
        }

        Ok(Some(Workspace {
            id: Self::workspace_id(attendee_id),
            path,
            manifest,
        }))
    }

    /// Write a fresh workspace, replacing any partial one.
    pub fn create(
        &self,
        spec: &AttendeeSpec,
        files: &RenderedFiles,
        now: DateTime<Utc>,
    ) -> Result<Workspace, InfraError> {
        let path = self.path_for(&spec.attendee_id)?;
        if path.exists() {
            fs::remove_dir_all(&path)?;
        }
        fs::create_dir_all(&path)?;

        fs::write(path.join(MAIN_TF), &files.main_tf)?;
        fs::write(path.join(TFVARS), &files.tfvars)?;

        let manifest = WorkspaceManifest {
            attendee_id: spec.attendee_id.clone(),
            workshop_id: spec.workshop_id.clone(),
            identifier: spec.identifier.clone(),
            template: spec.template.clone(),
            created_at: now,
            initialized: false,
        };
        write_manifest(&path, &manifest)?;

        info!(
            attendee_id = %spec.attendee_id,
            path = %path.display(),
            "created workspace"
        );

        Ok(Workspace {
            id: Self::workspace_id(&spec.attendee_id),
            path,
            manifest,
        })
    }

    pub fn mark_initialized(&self, workspace: &mut Workspace) -> Result<(), InfraError> {
        workspace.manifest.initialized = true;
        write_manifest(&workspace.path, &workspace.manifest)
    }

    pub fn remove(&self, attendee_id: &str) -> Result<bool, InfraError> {
        let path = self.path_for(attendee_id)?;
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_dir_all(&path)?;
        info!(attendee_id, "removed workspace");
        Ok(true)
    }

    /// Attendee ids of every workspace directory under the root.
    pub fn attendee_ids(&self) -> Result<Vec<String>, InfraError> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }

        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(id) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.strip_prefix(WORKSPACE_PREFIX))
            {
                if !id.is_empty() {
                    ids.push(id.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

fn write_manifest(path: &Path, manifest: &WorkspaceManifest) -> Result<(), InfraError> {
    let raw = serde_json::to_string_pretty(manifest)
        .map_err(|e| InfraError::permanent(format!("workspace manifest: {}", e)))?;
    fs::write(path.join(MANIFEST_FILE), raw)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(attendee_id: &str) -> AttendeeSpec {
        AttendeeSpec {
            attendee_id: attendee_id.into(),
            workshop_id: "w1".into(),
            workshop_name: "Cloud 101".into(),
            identifier: "max".into(),
            email: "max@example.com".into(),
            template: "ovh-public-cloud".into(),
        }
    }

    fn files() -> RenderedFiles {
        RenderedFiles {
            main_tf: "# main".into(),
            tfvars: "username = \"max\"".into(),
        }
    }

    #[test]
    fn uninitialized_workspace_does_not_load() {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(dir.path());

        let mut workspace = manager.create(&spec("a1"), &files(), Utc::now()).unwrap();
        assert_eq!(workspace.id, "attendee-a1");
        assert!(manager.exists("a1"));
        assert!(manager.load("a1").unwrap().is_none());

        manager.mark_initialized(&mut workspace).unwrap();
        let loaded = manager.load("a1").unwrap().unwrap();
        assert_eq!(loaded.manifest.identifier, "max");
    }

    #[test]
    fn missing_files_make_workspace_incomplete() {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(dir.path());

        let mut workspace = manager.create(&spec("a1"), &files(), Utc::now()).unwrap();
        manager.mark_initialized(&mut workspace).unwrap();
        fs::remove_file(workspace.path.join(TFVARS)).unwrap();

        assert!(manager.load("a1").unwrap().is_none());
    }

    #[test]
    fn lists_and_removes_workspaces() {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(dir.path());
        manager.create(&spec("b2"), &files(), Utc::now()).unwrap();
        manager.create(&spec("a1"), &files(), Utc::now()).unwrap();
        fs::create_dir_all(dir.path().join("unrelated")).unwrap();

        assert_eq!(manager.attendee_ids().unwrap(), vec!["a1", "b2"]);
        assert!(manager.remove("a1").unwrap());
        assert!(!manager.remove("a1").unwrap());
        assert_eq!(manager.attendee_ids().unwrap(), vec!["b2"]);
    }

    #[test]
    fn rejects_ids_that_escape_the_root() {
        let manager = WorkspaceManager::new("/tmp/labs");
        assert!(manager.path_for("../etc").is_err());
        assert!(manager.path_for("").is_err());
    }

    #[test]
    fn missing_root_lists_nothing() {
        let manager = WorkspaceManager::new("/nonexistent/labs/workspaces");
        assert!(manager.attendee_ids().unwrap().is_empty());
    }
}
