//! Persisted state layout.
//!
//! Everything DockerPilot writes lives under one config root
//! (`~/.config/dockerpilot` by default):
//!
//! - `servers.json`: encrypted host records
//! - `deployment_history.json`: append-only JSON lines
//! - `configs/deployment-<env>-<container>.yml`: prepared descriptors
//! - `backups/<op-key>-<mount>.tar.gz`: backup archives
//! - `health-checks-defaults.json`: resolver defaults (user-editable)
//! - `health-checks-user.yml`: resolver overrides

use crate::error::Result;
use std::path::{Path, PathBuf};

/// Directory name under the platform config dir.
const APP_DIR: &str = "dockerpilot";

/// Path bundle for the config root.
#[derive(Debug, Clone)]
pub struct ConfigLayout {
    root: PathBuf,
}

impl ConfigLayout {
    /// Layout rooted at the platform config directory.
    pub fn default_root() -> Self {
        let base = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            root: base.join(APP_DIR),
        }
    }

    /// Layout rooted at an explicit directory (tests, overrides).
    pub fn rooted_at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn servers_file(&self) -> PathBuf {
        self.root.join("servers.json")
    }

    pub fn history_file(&self) -> PathBuf {
        self.root.join("deployment_history.json")
    }

    pub fn configs_dir(&self) -> PathBuf {
        self.root.join("configs")
    }

    /// `configs/deployment-<env>-<container>.yml`
    pub fn deployment_config_file(&self, env: &str, container: &str) -> PathBuf {
        self.configs_dir()
            .join(format!("deployment-{env}-{container}.yml"))
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.root.join("backups")
    }

    pub fn health_defaults_file(&self) -> PathBuf {
        self.root.join("health-checks-defaults.json")
    }

    pub fn health_overrides_file(&self) -> PathBuf {
        self.root.join("health-checks-user.yml")
    }

    /// Create the root and subdirectories if absent. Idempotent.
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.configs_dir())?;
        std::fs::create_dir_all(self.backups_dir())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_hang_off_root() {
        let layout = ConfigLayout::rooted_at("/tmp/dp-test");
        assert_eq!(
            layout.servers_file(),
            PathBuf::from("/tmp/dp-test/servers.json")
        );
        assert_eq!(
            layout.deployment_config_file("staging", "grafana"),
            PathBuf::from("/tmp/dp-test/configs/deployment-staging-grafana.yml")
        );
        assert_eq!(layout.backups_dir(), PathBuf::from("/tmp/dp-test/backups"));
    }

    #[test]
    fn ensure_dirs_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = ConfigLayout::rooted_at(tmp.path().join("cfg"));
        layout.ensure_dirs().unwrap();
        layout.ensure_dirs().unwrap();
        assert!(layout.configs_dir().is_dir());
        assert!(layout.backups_dir().is_dir());
    }
}
