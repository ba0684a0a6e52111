//! Normalized deployment descriptors.
//!
//! A [`ContainerDescriptor`] is the full-fidelity, serializable snapshot of a
//! container's runtime configuration: the single input every deployment
//! strategy and the migration engine consume. Descriptors are produced by
//! [`inspect`](crate::descriptor::inspect::inspect), reshaped for a target
//! environment by [`transform`], and round-tripped through YAML by
//! [`yaml`](crate::descriptor::yaml).

pub mod inspect;
pub mod yaml;

mod transform;

pub use transform::transform;

use crate::error::{PilotError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Host paths that require elevated credentials to read.
pub const PRIVILEGED_PATHS: [&str; 7] = [
    "/var/lib/docker",
    "/root",
    "/etc",
    "/proc",
    "/sys",
    "/lib/modules",
    "/boot",
];

/// Host paths that are never backed up (kernel-backed pseudo-filesystems and
/// boot/module trees).
pub const SYSTEM_PATHS: [&str; 4] = ["/proc", "/sys", "/lib/modules", "/boot"];

fn path_is_under(path: &str, root: &str) -> bool {
    path == root || path.starts_with(&format!("{root}/"))
}

/// One mount of a container: a named volume or a host bind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MountSpec {
    Volume {
        name: String,
        mount_path: String,
        read_only: bool,
    },
    Bind {
        host_path: String,
        mount_path: String,
        read_only: bool,
    },
}

impl MountSpec {
    /// Container-side mount path.
    pub fn mount_path(&self) -> &str {
        match self {
            MountSpec::Volume { mount_path, .. } | MountSpec::Bind { mount_path, .. } => mount_path,
        }
    }

    /// Volume name or host path, used in archive names and
    /// backup records.
    pub fn identifier(&self) -> &str {
        match self {
            MountSpec::Volume { name, .. } => name,
            MountSpec::Bind { host_path, .. } => host_path,
        }
    }

    /// True for bind mounts rooted in a path that needs elevated credentials.
    pub fn is_privileged(&self) -> bool {
        match self {
            MountSpec::Volume { .. } => false,
            MountSpec::Bind { host_path, .. } => PRIVILEGED_PATHS
                .iter()
                .any(|root| path_is_under(host_path, root)),
        }
    }

    /// True for bind mounts under /proc, /sys, /lib/modules, or /boot.
    /// These are never backed up.
    pub fn is_system_path(&self) -> bool {
        match self {
            MountSpec::Volume { .. } => false,
            MountSpec::Bind { host_path, .. } => SYSTEM_PATHS
                .iter()
                .any(|root| path_is_under(host_path, root)),
        }
    }
}

/// Pipeline environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Staging,
    Prod,
}

impl Environment {
    pub const ALL: [Environment; 3] = [Environment::Dev, Environment::Staging, Environment::Prod];

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Dev => "dev",
            Environment::Staging => "staging",
            Environment::Prod => "prod",
        }
    }

    /// Fixed per-environment resource bundle.
    pub fn profile(&self) -> EnvironmentProfile {
        match self {
            Environment::Dev => EnvironmentProfile {
                suffix: "-dev",
                cpu: "0.5",
                memory: "512Mi",
                replicas: 1,
            },
            Environment::Staging => EnvironmentProfile {
                suffix: "-staging",
                cpu: "1.0",
                memory: "1Gi",
                replicas: 2,
            },
            Environment::Prod => EnvironmentProfile {
                suffix: "",
                cpu: "2.0",
                memory: "2Gi",
                replicas: 3,
            },
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = PilotError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "staging" => Ok(Environment::Staging),
            "prod" => Ok(Environment::Prod),
            other => Err(PilotError::invalid_descriptor(format!(
                "unknown environment '{other}' (expected dev, staging, or prod)"
            ))),
        }
    }
}

/// The (suffix, cpu, memory, replicas) bundle applied during promotion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvironmentProfile {
    pub suffix: &'static str,
    pub cpu: &'static str,
    pub memory: &'static str,
    pub replicas: u32,
}

/// Normalized, serializable snapshot of a container's runtime configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerDescriptor {
    pub container_name: String,
    pub image_tag: String,
    /// Command override, space-joined.
    pub command: Option<String>,
    /// Entrypoint override, space-joined.
    pub entrypoint: Option<String>,
    /// container port (e.g. "3000") → host port (e.g. "8080").
    pub port_bindings: BTreeMap<String, String>,
    /// `KEY=value` entries in original order.
    pub environment: Vec<String>,
    pub volumes: Vec<MountSpec>,
    pub networks: Vec<String>,
    pub restart_policy: String,
    pub cpu_limit: Option<String>,
    pub memory_limit: Option<String>,
    pub replicas: u32,
    pub labels: BTreeMap<String, String>,
    /// HTTP probe path; `None` means readiness is judged from container
    /// state instead of an HTTP endpoint.
    pub healthcheck_endpoint: Option<String>,
    pub healthcheck_retries: u32,
    /// Per-attempt probe timeout, seconds.
    pub healthcheck_timeout: u64,
}

impl ContainerDescriptor {
    /// Minimal descriptor for a named container and image; everything else
    /// defaulted. Used by tests and as an import base.
    pub fn new(container_name: impl Into<String>, image_tag: impl Into<String>) -> Self {
        Self {
            container_name: container_name.into(),
            image_tag: image_tag.into(),
            command: None,
            entrypoint: None,
            port_bindings: BTreeMap::new(),
            environment: Vec::new(),
            volumes: Vec::new(),
            networks: Vec::new(),
            restart_policy: "no".to_string(),
            cpu_limit: None,
            memory_limit: None,
            replicas: 1,
            labels: BTreeMap::new(),
            healthcheck_endpoint: Some("/health".to_string()),
            healthcheck_retries: 10,
            healthcheck_timeout: 30,
        }
    }

    /// First bound host port, if any. Strategies probe through this.
    pub fn first_host_port(&self) -> Option<u16> {
        self.port_bindings.values().next()?.parse().ok()
    }

    /// Validate the fields every strategy relies on.
    pub fn validate(&self) -> Result<()> {
        if self.container_name.is_empty() {
            return Err(PilotError::missing_field("container_name"));
        }
        if self.image_tag.is_empty() {
            return Err(PilotError::missing_field("image_tag"));
        }
        for (container_port, host_port) in &self.port_bindings {
            for port in [container_port, host_port] {
                if port.parse::<u16>().is_err() {
                    return Err(PilotError::invalid_descriptor(format!(
                        "port '{port}' is not a valid u16"
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn privileged_path_matching_includes_subpaths() {
        let m = MountSpec::Bind {
            host_path: "/var/lib/docker/volumes/foo/_data".to_string(),
            mount_path: "/data".to_string(),
            read_only: false,
        };
        assert!(m.is_privileged());
        assert!(!m.is_system_path());
    }

    #[test]
    fn privileged_path_matching_is_component_wise() {
        // /etcetera is not under /etc
        let m = MountSpec::Bind {
            host_path: "/etcetera/data".to_string(),
            mount_path: "/data".to_string(),
            read_only: false,
        };
        assert!(!m.is_privileged());
    }

    #[test]
    fn system_paths_are_also_privileged() {
        for path in ["/proc/sys", "/sys/fs/cgroup", "/lib/modules", "/boot/efi"] {
            let m = MountSpec::Bind {
                host_path: path.to_string(),
                mount_path: "/x".to_string(),
                read_only: true,
            };
            assert!(m.is_system_path(), "{path} should be a system path");
            assert!(m.is_privileged(), "{path} should be privileged");
        }
    }

    #[test]
    fn named_volumes_are_never_privileged() {
        let m = MountSpec::Volume {
            name: "influx-data".to_string(),
            mount_path: "/var/lib/influxdb2".to_string(),
            read_only: false,
        };
        assert!(!m.is_privileged());
        assert!(!m.is_system_path());
    }

    #[test]
    fn environment_profiles_match_pipeline_table() {
        let staging = Environment::Staging.profile();
        assert_eq!(staging.suffix, "-staging");
        assert_eq!(staging.cpu, "1.0");
        assert_eq!(staging.memory, "1Gi");
        assert_eq!(staging.replicas, 2);

        let prod = Environment::Prod.profile();
        assert_eq!(prod.suffix, "");
        assert_eq!(prod.replicas, 3);
    }

    #[test]
    fn environment_parses_case_insensitively() {
        assert_eq!("DEV".parse::<Environment>().unwrap(), Environment::Dev);
        assert!("qa".parse::<Environment>().is_err());
    }

    #[test]
    fn validate_rejects_bad_ports() {
        let mut desc = ContainerDescriptor::new("web", "web:latest");
        desc.port_bindings
            .insert("80".to_string(), "99999".to_string());
        assert!(desc.validate().is_err());
    }

    #[test]
    fn first_host_port_parses() {
        let mut desc = ContainerDescriptor::new("web", "web:latest");
        desc.port_bindings
            .insert("3000".to_string(), "8080".to_string());
        assert_eq!(desc.first_host_port(), Some(8080));
    }
}
