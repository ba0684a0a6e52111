//! Cross-host migration.
//!
//! Moves a container (image + config, optionally volume data) from one host
//! to another entirely over the Docker Engine API: the image streams out of
//! the source daemon through the orchestrator into the target daemon, and
//! volume data rides tar streams between helper containers. Bind mounts are
//! copied only when the target host exposes the same path; otherwise the
//! operator is told to move them by hand (non-fatal).

use crate::deploy::history::{DeploymentHistory, DeploymentHistoryEntry, HistoryStatus};
use crate::descriptor::{ContainerDescriptor, MountSpec};
use crate::docker::{container, image, volume, DockerClient, DockerError, HELPER_IMAGE};
use crate::error::{ErrorKind, PilotError};
use crate::health::HealthResolver;
use crate::hosts::AuthenticatedClient;
use crate::progress::{ProgressLease, Stage};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One migration order.
#[derive(Debug, Clone)]
pub struct MigrateRequest {
    pub container_name: String,
    pub source_id: String,
    pub target_id: String,
    pub include_data: bool,
    pub stop_source: bool,
}

enum MigrateEnd {
    Done { final_name: String },
    Cancelled,
    Failed(PilotError),
}

/// Execute a migration under an already-held progress lease.
///
/// Same-host rejection happens before the lease exists (the engine surface
/// checks it so no progress record is ever written for a rejected call).
#[allow(clippy::too_many_arguments)]
pub async fn run(
    lease: ProgressLease,
    request: MigrateRequest,
    source: AuthenticatedClient,
    target: AuthenticatedClient,
    target_probe_host: String,
    resolver: Arc<HealthResolver>,
    history: Arc<DeploymentHistory>,
) {
    let started = Instant::now();
    let cancel = lease.cancellation_token();
    let container_name = request.container_name.clone();

    let end = drive(
        &lease,
        &cancel,
        &request,
        source.docker(),
        target.docker(),
        &target_probe_host,
        &resolver,
    )
    .await;

    let duration_ms = started.elapsed().as_millis() as u64;
    let (status, output) = match &end {
        MigrateEnd::Done { final_name } => (
            HistoryStatus::Success,
            Some(format!(
                "migrated to {} as {final_name}",
                request.target_id
            )),
        ),
        MigrateEnd::Cancelled => (
            HistoryStatus::Failed,
            Some("migration cancelled by operator".to_string()),
        ),
        MigrateEnd::Failed(e) => (HistoryStatus::Failed, Some(e.to_string())),
    };
    if let Err(e) = history.append(&DeploymentHistoryEntry::new(
        "migration",
        &container_name,
        &container_name,
        status,
        duration_ms,
        output,
    )) {
        warn!(error = %e, "failed to append migration history entry");
    }

    match end {
        MigrateEnd::Done { final_name } => {
            info!(container = %container_name, target = %request.target_id, "migration completed");
            lease.complete(format!(
                "{container_name} migrated to {} as {final_name}",
                request.target_id
            ));
        }
        MigrateEnd::Cancelled => {
            info!(container = %container_name, "migration cancelled");
            lease.cancelled(format!("migration of {container_name} cancelled"));
        }
        MigrateEnd::Failed(e) => {
            warn!(container = %container_name, error = %e, "migration failed");
            lease.fail(e.kind(), e.to_string());
        }
    }
}

async fn drive(
    lease: &ProgressLease,
    cancel: &CancellationToken,
    request: &MigrateRequest,
    source: &DockerClient,
    target: &DockerClient,
    target_probe_host: &str,
    resolver: &HealthResolver,
) -> MigrateEnd {
    macro_rules! checkpoint {
        () => {
            if lease.cancel_requested() {
                return MigrateEnd::Cancelled;
            }
        };
    }
    macro_rules! step {
        ($e:expr) => {
            match $e {
                Ok(value) => value,
                Err(e) => return MigrateEnd::Failed(e.into()),
            }
        };
    }

    let name = &request.container_name;
    lease.update(Stage::Starting, 5, format!("inspecting {name} on source"));
    let descriptor = step!(crate::descriptor::inspect::inspect(source, name, resolver).await);

    // Image transfer: save on source, load on target, byte progress mapped
    // onto 10..60%.
    checkpoint!();
    lease.update(
        Stage::Exporting,
        10,
        format!("exporting image {}", descriptor.image_tag),
    );
    let image_total = step!(image::image_size(source, &descriptor.image_tag).await);
    let staging = match tempfile::NamedTempFile::new() {
        Ok(file) => file,
        Err(e) => return MigrateEnd::Failed(e.into()),
    };

    let image_was_present = step!(image::image_exists(target, &descriptor.image_tag).await);
    let save = image::save_image_to_file(source, &descriptor.image_tag, staging.path(), |bytes| {
        let progress = match image_total {
            Some(total) if total > 0 => 10 + ((bytes * 50) / total).min(50) as u8,
            _ => 35,
        };
        lease.update(
            Stage::Exporting,
            progress,
            format!("transferring image ({} MiB)", bytes / (1024 * 1024)),
        );
    });
    tokio::select! {
        _ = cancel.cancelled() => return MigrateEnd::Cancelled,
        result = save => { step!(result); }
    }

    checkpoint!();
    lease.update(Stage::Importing, 60, "loading image on target");
    let load = image::load_image_from_file(target, staging.path());
    tokio::select! {
        _ = cancel.cancelled() => return MigrateEnd::Cancelled,
        result = load => { step!(result); }
    }
    drop(staging);

    if request.include_data {
        lease.update(Stage::MigratingData, 70, "migrating volume data");
        for mount in &descriptor.volumes {
            checkpoint!();
            match mount {
                MountSpec::Volume { name: volume_name, .. } => {
                    match copy_volume(source, target, volume_name, cancel).await {
                        Ok(true) => {}
                        // Cancelled mid-stream; the helpers are already gone
                        // and the source is untouched.
                        Ok(false) => return MigrateEnd::Cancelled,
                        Err(e) => {
                            // Remove nothing: the target volume may hold
                            // partial data the operator can inspect.
                            return MigrateEnd::Failed(PilotError::new(
                                ErrorKind::VolumeCopyFailed,
                                format!("volume {volume_name}: {e}"),
                            ));
                        }
                    }
                }
                MountSpec::Bind { host_path, .. } => {
                    let available = bind_path_exists(target, host_path).await;
                    if !available {
                        // Non-fatal: recorded in the progress message and the
                        // migration proceeds.
                        lease.update(
                            Stage::MigratingData,
                            75,
                            format!(
                                "manual_action_required: bind mount {host_path} does not exist on target"
                            ),
                        );
                    }
                }
            }
        }
    }

    checkpoint!();
    lease.update(Stage::Creating, 90, "creating container on target");
    let (final_name, adjusted) = step!(adjust_for_target(target, &descriptor).await);
    let body = container::create_body_for(&adjusted, None);
    let created = async {
        container::create_container(target, &final_name, body).await?;
        container::start_container(target, &final_name).await
    }
    .await;
    if let Err(e) = created {
        remove_quietly(target, &final_name).await;
        if !image_was_present {
            let _ = image::remove_image(target, &descriptor.image_tag).await;
        }
        return MigrateEnd::Failed(e.into());
    }

    checkpoint!();
    lease.update(Stage::Validating, 95, format!("validating {final_name}"));
    let probe = crate::deploy::probe_for(&adjusted);
    let validated = crate::health::probe::wait_healthy(
        target,
        target_probe_host,
        &final_name,
        adjusted.first_host_port(),
        &probe,
        adjusted.healthcheck_retries,
        adjusted.healthcheck_timeout,
        cancel,
    )
    .await;
    if let Err(e) = validated {
        if lease.cancel_requested() {
            remove_quietly(target, &final_name).await;
            return MigrateEnd::Cancelled;
        }
        return MigrateEnd::Failed(e);
    }

    if request.stop_source {
        lease.update(Stage::CleaningUp, 98, "stopping source container");
        // Stop only; removal is operator policy. The target is already live
        // and validated, so a cancel here just leaves the source running.
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(container = name, "cancelled during source stop; source left running");
            }
            result = container::stop_container(source, name, 10) => {
                if let Err(e) = result {
                    warn!(container = name, error = %e, "failed to stop source container");
                }
            }
        }
    }

    MigrateEnd::Done { final_name }
}

/// Name (and port) adjustment for the target host: a taken name gets the
/// `-migrated-<ts>` suffix, and host ports already bound on the target are
/// released to ephemeral assignment.
async fn adjust_for_target(
    target: &DockerClient,
    descriptor: &ContainerDescriptor,
) -> Result<(String, ContainerDescriptor), DockerError> {
    let mut adjusted = descriptor.clone();

    let final_name = if container::container_exists(target, &descriptor.container_name).await? {
        let with_suffix = format!(
            "{}-migrated-{}",
            descriptor.container_name,
            chrono::Utc::now().timestamp()
        );
        debug!(
            original = %descriptor.container_name,
            renamed = %with_suffix,
            "target name taken, using suffix"
        );
        with_suffix
    } else {
        descriptor.container_name.clone()
    };
    adjusted.container_name = final_name.clone();

    let taken = used_host_ports(target).await?;
    for host_port in adjusted.port_bindings.values_mut() {
        if let Ok(port) = host_port.parse::<u16>() {
            if taken.contains(&port) {
                debug!(port, "host port taken on target, rebinding ephemeral");
                host_port.clear();
            }
        }
    }

    Ok((final_name, adjusted))
}

async fn used_host_ports(client: &DockerClient) -> Result<Vec<u16>, DockerError> {
    let summaries = container::list_containers(client, false, None).await?;
    let mut ports = Vec::new();
    for summary in summaries {
        for port in summary.ports.unwrap_or_default() {
            if let Some(public) = port.public_port {
                ports.push(public as u16);
            }
        }
    }
    Ok(ports)
}

/// Stream one named volume's contents source → target through helper
/// containers, never touching host disk beyond a staging temp file.
///
/// The transfer is a suspension point: the cancel token aborts the streams
/// mid-flight. Returns `Ok(true)` on completion, `Ok(false)` when cancelled;
/// the helper containers are removed on every path.
async fn copy_volume(
    source: &DockerClient,
    target: &DockerClient,
    volume_name: &str,
    cancel: &CancellationToken,
) -> Result<bool, DockerError> {
    debug!(volume = volume_name, "copying volume to target");
    volume::ensure_volume(target, volume_name).await?;

    let source_helper = create_data_helper(source, volume_name).await?;
    let target_helper = create_data_helper(target, volume_name).await?;

    let transfer = async {
        let staging =
            tempfile::NamedTempFile::new().map_err(|e| DockerError::Io(e.to_string()))?;
        container::download_to_file(source, &source_helper, "/volume", staging.path()).await?;
        // The archive carries a top-level `volume/` directory, so extraction
        // at `/` lands inside the mounted target volume.
        container::upload_from_file(target, &target_helper, "/", staging.path()).await?;
        Ok(())
    };
    // Dropping the transfer future closes both streams.
    let outcome = tokio::select! {
        _ = cancel.cancelled() => None,
        result = transfer => Some(result),
    };

    remove_quietly(source, &source_helper).await;
    remove_quietly(target, &target_helper).await;

    match outcome {
        Some(Ok(())) => Ok(true),
        Some(Err(e)) => Err(e),
        None => {
            debug!(volume = volume_name, "volume copy cancelled mid-transfer");
            Ok(false)
        }
    }
}

/// Created (never started) helper with the volume mounted at /volume, as a
/// copy endpoint.
async fn create_data_helper(
    client: &DockerClient,
    volume_name: &str,
) -> Result<String, DockerError> {
    image::pull_image_if_absent(client, HELPER_IMAGE).await?;
    let name = format!("dockerpilot-copy-{}", uuid::Uuid::new_v4().simple());
    let body = bollard::models::ContainerCreateBody {
        image: Some(HELPER_IMAGE.to_string()),
        cmd: Some(vec!["true".to_string()]),
        host_config: Some(bollard::models::HostConfig {
            binds: Some(vec![format!("{volume_name}:/volume")]),
            ..Default::default()
        }),
        ..Default::default()
    };
    container::create_container(client, &name, body).await?;
    Ok(name)
}

/// Does the bind path exist on the target host? Checked through an
/// ephemeral helper since the engine has no shell on the target.
async fn bind_path_exists(target: &DockerClient, host_path: &str) -> bool {
    let outcome = volume::run_ephemeral(
        target,
        HELPER_IMAGE,
        vec![
            "test".to_string(),
            "-e".to_string(),
            "/probe".to_string(),
        ],
        vec![format!("{host_path}:/probe:ro")],
    )
    .await;
    matches!(outcome, Ok(o) if o.success())
}

async fn remove_quietly(client: &DockerClient, name: &str) {
    match container::remove_container(client, name, true).await {
        Ok(()) => {}
        Err(DockerError::NotFound(_)) => {}
        Err(e) => warn!(container = name, error = %e, "cleanup removal failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_carries_all_knobs() {
        let request = MigrateRequest {
            container_name: "nginx".to_string(),
            source_id: "local".to_string(),
            target_id: "prod-1".to_string(),
            include_data: true,
            stop_source: false,
        };
        assert_eq!(request.container_name, "nginx");
        assert!(request.include_data);
        assert!(!request.stop_source);
    }
}
