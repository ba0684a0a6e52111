//! Blue-green deploy.
//!
//! Two color slots alternate; the new color validates on probe ports, gets
//! the old slot's data when volumes diverged, and takes over the live ports
//! in one switch. The superseded color is kept under `<name>-<oldcolor>`
//! for a grace window so an operator can swap names back.

use super::{
    build_or_pull, checkpoint, interruptible, probe_step, published_host_port, sleep_cancellable,
    StageCtx, StepError, StepResult,
};
use crate::deploy::DeployRequest;
use crate::descriptor::{ContainerDescriptor, MountSpec};
use crate::docker::{container, volume, DockerError, HELPER_IMAGE};
use crate::error::{ErrorKind, PilotError};
use crate::progress::Stage;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Label carrying the active color.
pub const COLOR_LABEL: &str = "dockerpilot.color";

/// How long the superseded color is kept for operator rollback.
const ROLLBACK_GRACE: Duration = Duration::from_secs(60);

const STABILIZE: Duration = Duration::from_secs(5);

/// Database families whose config subtree is copied between slots.
const DB_CONFIG_SUBTREES: [(&str, &str); 6] = [
    ("db2", "/database/config/"),
    ("influxdb", "/etc/influxdb2/"),
    ("postgres", "/var/lib/postgresql/data/"),
    ("mysql", "/etc/mysql/"),
    ("mongodb", "/etc/mongo/"),
    ("elasticsearch", "/usr/share/elasticsearch/config/"),
];

fn opposite(color: &str) -> &'static str {
    if color == "blue" {
        "green"
    } else {
        "blue"
    }
}

pub(crate) async fn run(ctx: &StageCtx<'_>, request: &DeployRequest) -> StepResult<()> {
    let descriptor = &request.descriptor;
    let name = &descriptor.container_name;

    // Color determination: the live container's label decides; first deploy
    // goes blue.
    let (old_descriptor, active_color) = match container::inspect_container(ctx.client, name).await
    {
        Ok(info) => {
            let color = info
                .config
                .as_ref()
                .and_then(|c| c.labels.as_ref())
                .and_then(|l| l.get(COLOR_LABEL).cloned())
                .unwrap_or_else(|| "blue".to_string());
            let old =
                crate::descriptor::inspect::descriptor_from_inspect(
                    &info,
                    &crate::health::HealthResolver::built_in(),
                )
                .ok();
            (old, Some(color))
        }
        Err(DockerError::NotFound(_)) => (None, None),
        Err(e) => return Err(e.into()),
    };
    let new_color = active_color.as_deref().map(opposite).unwrap_or("blue");
    let slot_name = format!("{name}-{new_color}");
    info!(
        container = name,
        active = active_color.as_deref().unwrap_or("none"),
        deploying = new_color,
        "blue-green slots determined"
    );

    ctx.stage(
        Stage::Building,
        20,
        format!("building image {}", descriptor.image_tag),
    )?;
    build_or_pull(ctx, descriptor, request.build_context.as_ref()).await?;

    // A stale container may occupy the target slot from an older deploy.
    remove_quietly(ctx, &slot_name).await;

    ctx.stage(Stage::Creating, 35, format!("deploying to {new_color} slot"))?;
    let mut slot_descriptor = descriptor.clone();
    slot_descriptor
        .labels
        .insert(COLOR_LABEL.to_string(), new_color.to_string());
    let probe_ports = super::ephemeral_ports(&slot_descriptor);
    let body = container::create_body_for(&slot_descriptor, Some(&probe_ports));
    container::create_container(ctx.client, &slot_name, body).await?;

    let result = validate_and_switch(
        ctx,
        request,
        &slot_descriptor,
        old_descriptor.as_ref(),
        active_color.as_deref(),
        &slot_name,
        new_color,
    )
    .await;
    if result.is_err() {
        remove_quietly(ctx, &slot_name).await;
    }
    result
}

#[allow(clippy::too_many_arguments)]
async fn validate_and_switch(
    ctx: &StageCtx<'_>,
    request: &DeployRequest,
    slot_descriptor: &ContainerDescriptor,
    old_descriptor: Option<&ContainerDescriptor>,
    active_color: Option<&str>,
    slot_name: &str,
    new_color: &str,
) -> StepResult<()> {
    let descriptor = &request.descriptor;
    let name = &descriptor.container_name;

    container::start_container(ctx.client, slot_name).await?;
    sleep_cancellable(&ctx.cancel, STABILIZE).await?;

    ctx.stage(Stage::Validating, 50, format!("health-probing {slot_name}"))?;
    let probe_port = published_host_port(ctx.client, slot_name).await?;
    probe_step(ctx, slot_name, probe_port, descriptor).await?;

    if request.migrate_data {
        if let Some(old) = old_descriptor {
            ctx.stage(
                Stage::MigratingData,
                65,
                "migrating data into the new slot",
            )?;
            migrate_slot_data(ctx, old, slot_descriptor, name, slot_name).await?;
        }
    }

    // Atomic switch: stop the live container, then take over its ports by
    // recreating the validated slot with the real port map.
    ctx.stage(Stage::Switching, 80, format!("switching live traffic to {new_color}"))?;
    let old_backup_name = active_color.map(|color| format!("{name}-{color}"));
    if let Some(old_backup_name) = &old_backup_name {
        interruptible(
            &ctx.cancel,
            ctx.timeouts.stop_grace + Duration::from_secs(30),
            "live container stop",
            container::stop_container(ctx.client, name, 10),
        )
        .await?;
        remove_stale_slot(ctx, old_backup_name).await;
        container::rename_container(ctx.client, name, old_backup_name).await?;
    }

    container::stop_container(ctx.client, slot_name, 10).await?;
    container::remove_container(ctx.client, slot_name, false).await?;
    let body = container::create_body_for(slot_descriptor, None);
    container::create_container(ctx.client, name, body).await?;
    container::start_container(ctx.client, name).await?;

    // The endpoint is switched and the new container is live; from here on
    // cancellation does not reverse it. It ends the run early as completed,
    // keeping the superseded slot so the operator can roll back by swapping
    // names.
    let tail = async {
        checkpoint(ctx.lease)?;
        probe_step(ctx, name, descriptor.first_host_port(), descriptor).await?;

        ctx.stage(Stage::CleaningUp, 95, "holding rollback grace window")?;
        if let Some(old_backup_name) = &old_backup_name {
            match sleep_cancellable(&ctx.cancel, ROLLBACK_GRACE).await {
                Ok(()) => remove_quietly(ctx, old_backup_name).await,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    };
    match tail.await {
        Err(StepError::Cancelled) => {
            let note = match &old_backup_name {
                Some(kept) => {
                    debug!(
                        container = kept.as_str(),
                        "cancelled after switch, keeping previous slot for post-rollback"
                    );
                    format!("cancel received after switch; {kept} kept for post-rollback")
                }
                None => "cancel received after switch; no previous slot to roll back".to_string(),
            };
            ctx.set_completion_note(note);
            Ok(())
        }
        other => other,
    }
}

/// Copy data between slots where the new descriptor points at different
/// volumes or host paths than the old one. Shared mounts are left alone.
async fn migrate_slot_data(
    ctx: &StageCtx<'_>,
    old: &ContainerDescriptor,
    new: &ContainerDescriptor,
    old_name: &str,
    new_name: &str,
) -> StepResult<()> {
    for mount in &new.volumes {
        checkpoint(ctx.lease)?;
        let old_mount = old
            .volumes
            .iter()
            .find(|m| m.mount_path() == mount.mount_path());
        let Some(old_mount) = old_mount else { continue };
        if old_mount.identifier() == mount.identifier() {
            // Same volume or host path: already shared, nothing to copy.
            continue;
        }

        debug!(
            from = old_mount.identifier(),
            to = mount.identifier(),
            "copying diverged mount data"
        );
        let (source_bind, target_bind) = match (old_mount, mount) {
            (MountSpec::Volume { name: from, .. }, MountSpec::Volume { name: to, .. }) => {
                volume::ensure_volume(ctx.client, to).await?;
                (format!("{from}:/source:ro"), format!("{to}:/target"))
            }
            (MountSpec::Bind { host_path: from, .. }, MountSpec::Bind { host_path: to, .. }) => {
                (format!("{from}:/source:ro"), format!("{to}:/target"))
            }
            // Kind changed between environments; the operator has to move
            // the data by hand.
            _ => {
                return Err(StepError::Failed(PilotError::new(
                    ErrorKind::UnsupportedMount,
                    format!(
                        "mount at {} changed kind between slots",
                        mount.mount_path()
                    ),
                )))
            }
        };

        let outcome = volume::run_ephemeral(
            ctx.client,
            HELPER_IMAGE,
            vec![
                "sh".to_string(),
                "-c".to_string(),
                "cp -a /source/. /target/".to_string(),
            ],
            vec![source_bind, target_bind],
        )
        .await?;
        if !outcome.success() {
            return Err(StepError::Failed(PilotError::new(
                ErrorKind::VolumeCopyFailed,
                format!(
                    "data copy into {} exited {}: {}",
                    mount.identifier(),
                    outcome.exit_code,
                    outcome.logs.trim()
                ),
            )));
        }
    }

    // Known database families also get their config subtree carried over.
    let image = new.image_tag.to_lowercase();
    for (family, subtree) in DB_CONFIG_SUBTREES {
        if !image.contains(family) {
            continue;
        }
        checkpoint(ctx.lease)?;
        debug!(family, subtree, "copying database config subtree");
        let staging = tempfile::NamedTempFile::new()
            .map_err(|e| StepError::Failed(PilotError::from(e)))?;
        match container::download_to_file(ctx.client, old_name, subtree, staging.path()).await {
            Ok(_) => {
                let parent = std::path::Path::new(subtree)
                    .parent()
                    .and_then(|p| p.to_str())
                    .unwrap_or("/");
                container::upload_from_file(ctx.client, new_name, parent, staging.path())
                    .await?;
            }
            Err(DockerError::NotFound(_)) => {
                debug!(subtree, "config subtree absent on the old slot, skipping");
            }
            Err(e) => return Err(e.into()),
        }
        break;
    }

    Ok(())
}

/// An old backup slot from a previous deploy may still hold the target name.
async fn remove_stale_slot(ctx: &StageCtx<'_>, name: &str) {
    remove_quietly(ctx, name).await;
}

async fn remove_quietly(ctx: &StageCtx<'_>, name: &str) {
    match container::remove_container(ctx.client, name, true).await {
        Ok(()) => {}
        Err(DockerError::NotFound(_)) => {}
        Err(e) => warn!(container = name, error = %e, "cleanup removal failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn colors_alternate() {
        assert_eq!(opposite("blue"), "green");
        assert_eq!(opposite("green"), "blue");
        // Anything unexpected falls back to blue.
        assert_eq!(opposite("chartreuse"), "blue");
    }

    #[test]
    fn db_subtrees_cover_known_families() {
        let families: Vec<&str> = DB_CONFIG_SUBTREES.iter().map(|(f, _)| *f).collect();
        for family in ["db2", "influxdb", "postgres", "mysql", "mongodb", "elasticsearch"] {
            assert!(families.contains(&family), "missing {family}");
        }
    }
}
