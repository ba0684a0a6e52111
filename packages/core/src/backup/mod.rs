//! Backup subsystem.
//!
//! Snapshots a container's mounts before promotion. Named volumes and plain
//! bind mounts are archived by an ephemeral helper container; bind mounts
//! under privileged roots need the session's elevation secret and go through
//! `sudo -S` on the host; system paths (/proc, /sys, /lib/modules, /boot)
//! are never backed up and yield `skipped` records.
//!
//! [`classify`] is the pre-flight: callers examine `requires_sudo` and the
//! large-mount warning before starting an operation, instead of the engine
//! prompting mid-flight.

use crate::descriptor::{ContainerDescriptor, MountSpec};
use crate::docker::{volume, DockerClient, HELPER_IMAGE};
use crate::error::{ErrorKind, PilotError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Mounts at or above this size are flagged as large (backup may take very
/// long). Unknown sizes are flagged too.
pub const LARGE_MOUNT_BYTES: u64 = 500 * 1024 * 1024 * 1024;

/// Upper bound for walking a bind mount to estimate its size.
pub const DEFAULT_MAX_WALK: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    Volume,
    Bind,
    Skipped,
}

/// Outcome of backing up (or skipping) one mount.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRecord {
    pub kind: BackupKind,
    pub identifier: String,
    pub archive_path: Option<PathBuf>,
    pub size_bytes: u64,
    pub sha256: Option<String>,
    pub created_at: DateTime<Utc>,
    pub skip_reason: Option<String>,
}

/// One mount's size estimate in the pre-flight report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountSize {
    pub identifier: String,
    /// `None` when the size walk timed out or the daemon had no figure.
    pub size_bytes: Option<u64>,
}

impl MountSize {
    pub fn is_large(&self) -> bool {
        match self.size_bytes {
            Some(size) => size >= LARGE_MOUNT_BYTES,
            None => true,
        }
    }
}

/// Pre-flight classification of a descriptor's mounts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupClassification {
    pub requires_sudo: bool,
    /// Sum of known sizes; `None` when no mount size could be determined.
    pub total_size_bytes: Option<u64>,
    pub large_mounts: Vec<MountSize>,
    pub privileged_paths: Vec<String>,
    pub skipped_system_paths: Vec<String>,
    pub warning: Option<String>,
}

impl BackupClassification {
    pub fn total_size_gb(&self) -> f64 {
        self.total_size_bytes.unwrap_or(0) as f64 / 1024f64.powi(3)
    }

    pub fn total_size_tb(&self) -> f64 {
        self.total_size_bytes.unwrap_or(0) as f64 / 1024f64.powi(4)
    }
}

/// Classification with sizes supplied by the caller. Pure; `classify` wires
/// in the daemon `df` figures and the bounded stat walk.
pub fn classify_with_sizes(
    descriptor: &ContainerDescriptor,
    volume_sizes: &HashMap<String, u64>,
    bind_size: impl Fn(&str) -> Option<u64>,
) -> BackupClassification {
    let mut requires_sudo = false;
    let mut total: u64 = 0;
    let mut any_known = false;
    let mut large_mounts = Vec::new();
    let mut privileged_paths = Vec::new();
    let mut skipped_system_paths = Vec::new();

    for mount in &descriptor.volumes {
        if mount.is_system_path() {
            skipped_system_paths.push(mount.identifier().to_string());
            continue;
        }
        if mount.is_privileged() {
            requires_sudo = true;
            privileged_paths.push(mount.identifier().to_string());
        }

        let size_bytes = match mount {
            MountSpec::Volume { name, .. } => volume_sizes.get(name).copied(),
            MountSpec::Bind { host_path, .. } => bind_size(host_path),
        };
        match size_bytes {
            Some(size) => {
                any_known = true;
                total += size;
            }
            None => {}
        }

        let estimate = MountSize {
            identifier: mount.identifier().to_string(),
            size_bytes,
        };
        if estimate.is_large() {
            large_mounts.push(estimate);
        }
    }

    let total_size_bytes = any_known.then_some(total);
    let warning = (!large_mounts.is_empty()).then(|| {
        format!(
            "{} large or unsized mount(s) detected; backup may take very long",
            large_mounts.len()
        )
    });

    BackupClassification {
        requires_sudo,
        total_size_bytes,
        large_mounts,
        privileged_paths,
        skipped_system_paths,
        warning,
    }
}

/// Stat-walk a directory tree, giving up at `deadline`. `None` on timeout or
/// unreadable root.
fn walk_size(root: &Path, deadline: Instant) -> Option<u64> {
    let mut total: u64 = 0;
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        if Instant::now() >= deadline {
            return None;
        }
        let entries = std::fs::read_dir(&dir).ok()?;
        for entry in entries.flatten() {
            if Instant::now() >= deadline {
                return None;
            }
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            if metadata.is_dir() {
                stack.push(entry.path());
            } else {
                total += metadata.len();
            }
        }
    }
    Some(total)
}

/// Pre-flight a descriptor: sudo requirement, size estimate, large-mount and
/// system-path lists.
pub async fn classify(
    client: &DockerClient,
    descriptor: &ContainerDescriptor,
    max_walk: Duration,
) -> Result<BackupClassification> {
    let volume_sizes = volume::volume_sizes(client).await.unwrap_or_else(|e| {
        warn!(error = %e, "daemon df unavailable; volume sizes unknown");
        HashMap::new()
    });

    // Walk every bind mount within one shared deadline, off the runtime.
    let bind_paths: Vec<String> = descriptor
        .volumes
        .iter()
        .filter(|m| !m.is_system_path())
        .filter_map(|m| match m {
            MountSpec::Bind { host_path, .. } => Some(host_path.clone()),
            MountSpec::Volume { .. } => None,
        })
        .collect();
    let bind_sizes: HashMap<String, Option<u64>> = tokio::task::spawn_blocking(move || {
        let deadline = Instant::now() + max_walk;
        bind_paths
            .into_iter()
            .map(|path| {
                let size = walk_size(Path::new(&path), deadline);
                (path, size)
            })
            .collect()
    })
    .await
    .map_err(|e| PilotError::invariant(format!("size walk panicked: {e}")))?;

    Ok(classify_with_sizes(descriptor, &volume_sizes, |path| {
        bind_sizes.get(path).copied().flatten()
    }))
}

fn archive_name(op_key: &str, mount: &MountSpec) -> String {
    let sanitized: String = mount
        .identifier()
        .trim_start_matches('/')
        .chars()
        .map(|c| if c == '/' { '_' } else { c })
        .collect();
    format!("{op_key}-{sanitized}.tar.gz")
}

fn sha256_of_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(unix)]
fn invoking_uid_gid() -> (u32, u32) {
    use std::os::unix::fs::MetadataExt;
    dirs::home_dir()
        .and_then(|home| std::fs::metadata(home).ok())
        .map(|meta| (meta.uid(), meta.gid()))
        .unwrap_or((0, 0))
}

#[cfg(not(unix))]
fn invoking_uid_gid() -> (u32, u32) {
    (0, 0)
}

fn skipped(mount: &MountSpec, reason: impl Into<String>) -> BackupRecord {
    BackupRecord {
        kind: BackupKind::Skipped,
        identifier: mount.identifier().to_string(),
        archive_path: None,
        size_bytes: 0,
        sha256: None,
        created_at: Utc::now(),
        skip_reason: Some(reason.into()),
    }
}

/// Archive one mount into `archive_dir`.
///
/// Idempotent by archive name: re-running overwrites the previous archive.
pub async fn backup_mount(
    client: &DockerClient,
    mount: &MountSpec,
    archive_dir: &Path,
    op_key: &str,
    elevation_secret: Option<&str>,
) -> Result<BackupRecord> {
    if mount.is_system_path() {
        debug!(mount = mount.identifier(), "system path, backup skipped");
        return Ok(skipped(mount, "system path is not backupable"));
    }

    std::fs::create_dir_all(archive_dir)?;
    let file_name = archive_name(op_key, mount);
    let archive_path = archive_dir.join(&file_name);

    let (kind, helper_outcome) = match mount {
        MountSpec::Volume { name, .. } => {
            let outcome = run_tar_helper(client, &format!("{name}:/volume:ro"), &file_name, archive_dir).await?;
            (BackupKind::Volume, Some(outcome))
        }
        MountSpec::Bind { host_path, .. } if !mount.is_privileged() => {
            let outcome =
                run_tar_helper(client, &format!("{host_path}:/volume:ro"), &file_name, archive_dir)
                    .await?;
            (BackupKind::Bind, Some(outcome))
        }
        MountSpec::Bind { host_path, .. } => {
            let secret = elevation_secret.ok_or_else(|| {
                PilotError::new(
                    ErrorKind::ElevationRequired,
                    format!("backing up {host_path} requires an elevation secret"),
                )
            })?;
            elevated_tar(host_path, &archive_path, secret).await?;
            (BackupKind::Bind, None)
        }
    };

    if let Some(outcome) = helper_outcome {
        if !outcome.success() {
            return Err(PilotError::new(
                ErrorKind::BackupFailed,
                format!(
                    "helper tar for {} exited {}: {}",
                    mount.identifier(),
                    outcome.exit_code,
                    outcome.logs.trim()
                ),
            ));
        }
    }

    let size_bytes = std::fs::metadata(&archive_path)?.len();
    let sha256 = {
        let path = archive_path.clone();
        tokio::task::spawn_blocking(move || sha256_of_file(&path))
            .await
            .map_err(|e| PilotError::invariant(format!("hash task panicked: {e}")))??
    };

    debug!(
        mount = mount.identifier(),
        archive = %archive_path.display(),
        size_bytes,
        "mount backed up"
    );
    Ok(BackupRecord {
        kind,
        identifier: mount.identifier().to_string(),
        archive_path: Some(archive_path),
        size_bytes,
        sha256: Some(sha256),
        created_at: Utc::now(),
        skip_reason: None,
    })
}

/// tar the read-only `/volume` bind into `/backup/<file>` via the helper
/// image, then hand ownership to the invoking user.
async fn run_tar_helper(
    client: &DockerClient,
    source_bind: &str,
    file_name: &str,
    archive_dir: &Path,
) -> Result<crate::docker::EphemeralOutcome> {
    let (uid, gid) = invoking_uid_gid();
    let script = format!(
        "tar -czf /backup/{file_name} -C /volume . && chown {uid}:{gid} /backup/{file_name}"
    );
    let outcome = volume::run_ephemeral(
        client,
        HELPER_IMAGE,
        vec!["sh".to_string(), "-c".to_string(), script],
        vec![
            source_bind.to_string(),
            format!("{}:/backup", archive_dir.display()),
        ],
    )
    .await?;
    Ok(outcome)
}

/// Privileged-path archive through the host's elevation command, feeding the
/// stored secret on stdin.
async fn elevated_tar(host_path: &str, archive_path: &Path, secret: &str) -> Result<()> {
    let host_path = host_path.to_string();
    let archive = archive_path.to_path_buf();
    let secret = secret.to_string();
    let (uid, gid) = invoking_uid_gid();

    let status = tokio::task::spawn_blocking(move || -> Result<std::process::ExitStatus> {
        let mut child = std::process::Command::new("sudo")
            .arg("-S")
            .arg("tar")
            .arg("-czf")
            .arg(&archive)
            .arg("-C")
            .arg(&host_path)
            .arg(".")
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()?;
        if let Some(stdin) = child.stdin.as_mut() {
            stdin.write_all(format!("{secret}\n").as_bytes())?;
        }
        let status = child.wait()?;
        if status.success() {
            let _ = std::process::Command::new("sudo")
                .arg("-S")
                .arg("chown")
                .arg(format!("{uid}:{gid}"))
                .arg(&archive)
                .stdin(std::process::Stdio::null())
                .status();
        }
        Ok(status)
    })
    .await
    .map_err(|e| PilotError::invariant(format!("elevated tar task panicked: {e}")))??;

    if !status.success() {
        return Err(PilotError::new(
            ErrorKind::BackupFailed,
            format!("elevated tar of {archive_path:?} failed with {status}"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::ContainerDescriptor;

    fn descriptor_with(mounts: Vec<MountSpec>) -> ContainerDescriptor {
        let mut desc = ContainerDescriptor::new("app", "app:1");
        desc.volumes = mounts;
        desc
    }

    #[test]
    fn system_paths_never_classify_as_backupable() {
        let desc = descriptor_with(vec![
            MountSpec::Bind {
                host_path: "/proc".to_string(),
                mount_path: "/host/proc".to_string(),
                read_only: true,
            },
            MountSpec::Bind {
                host_path: "/sys/fs/cgroup".to_string(),
                mount_path: "/host/cgroup".to_string(),
                read_only: true,
            },
        ]);
        let report = classify_with_sizes(&desc, &HashMap::new(), |_| Some(0));
        assert_eq!(report.skipped_system_paths.len(), 2);
        assert!(!report.requires_sudo);
        assert!(report.privileged_paths.is_empty());
    }

    #[test]
    fn privileged_bind_requires_sudo() {
        let desc = descriptor_with(vec![MountSpec::Bind {
            host_path: "/var/lib/docker/volumes/foo/_data".to_string(),
            mount_path: "/data".to_string(),
            read_only: false,
        }]);
        let report = classify_with_sizes(&desc, &HashMap::new(), |_| Some(1024));
        assert!(report.requires_sudo);
        assert_eq!(
            report.privileged_paths,
            vec!["/var/lib/docker/volumes/foo/_data"]
        );
    }

    #[test]
    fn large_and_unknown_mounts_are_flagged() {
        let desc = descriptor_with(vec![
            MountSpec::Volume {
                name: "big-data".to_string(),
                mount_path: "/data".to_string(),
                read_only: false,
            },
            MountSpec::Bind {
                host_path: "/srv/unscanned".to_string(),
                mount_path: "/srv".to_string(),
                read_only: false,
            },
        ]);
        let volume_sizes = HashMap::from([("big-data".to_string(), LARGE_MOUNT_BYTES)]);
        let report = classify_with_sizes(&desc, &volume_sizes, |_| None);
        assert_eq!(report.large_mounts.len(), 2);
        assert!(report.warning.is_some());
        // The unknown bind contributes nothing to the known total.
        assert_eq!(report.total_size_bytes, Some(LARGE_MOUNT_BYTES));
    }

    #[test]
    fn small_known_mounts_produce_no_warning() {
        let desc = descriptor_with(vec![MountSpec::Volume {
            name: "small".to_string(),
            mount_path: "/data".to_string(),
            read_only: false,
        }]);
        let volume_sizes = HashMap::from([("small".to_string(), 42u64 * 1024 * 1024)]);
        let report = classify_with_sizes(&desc, &volume_sizes, |_| Some(0));
        assert!(report.large_mounts.is_empty());
        assert!(report.warning.is_none());
        assert!(report.total_size_gb() < 1.0);
    }

    #[test]
    fn archive_names_are_path_safe_and_stable() {
        let bind = MountSpec::Bind {
            host_path: "/srv/app/data".to_string(),
            mount_path: "/data".to_string(),
            read_only: false,
        };
        assert_eq!(archive_name("myapp", &bind), "myapp-srv_app_data.tar.gz");
        let volume = MountSpec::Volume {
            name: "influx-data".to_string(),
            mount_path: "/var/lib/influxdb2".to_string(),
            read_only: false,
        };
        assert_eq!(archive_name("influx", &volume), "influx-influx-data.tar.gz");
    }

    #[test]
    fn walk_size_counts_files() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.bin"), vec![0u8; 1000]).unwrap();
        std::fs::create_dir(tmp.path().join("sub")).unwrap();
        std::fs::write(tmp.path().join("sub/b.bin"), vec![0u8; 500]).unwrap();
        let size = walk_size(tmp.path(), Instant::now() + Duration::from_secs(5));
        assert_eq!(size, Some(1500));
    }

    #[test]
    fn walk_size_times_out_to_none() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.bin"), vec![0u8; 10]).unwrap();
        let size = walk_size(tmp.path(), Instant::now() - Duration::from_secs(1));
        assert_eq!(size, None);
    }

    #[test]
    fn sha256_matches_known_digest() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("x");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(
            sha256_of_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
