//! Rolling deploy: zero-downtime single-replica swap via rename.
//!
//! The replacement starts under a temporary name on daemon-assigned probe
//! ports, must pass the health contract, and only then does the old
//! container stop and the names swap. An unhealthy replacement is removed
//! and the old container keeps serving.

use super::{
    build_or_pull, checkpoint, interruptible, probe_step, published_host_port, sleep_cancellable,
    StageCtx, StepError, StepResult,
};
use crate::deploy::DeployRequest;
use crate::docker::{container, DockerError};
use crate::progress::Stage;
use std::time::Duration;
use tracing::{debug, warn};

/// Settle time after starting the replacement before probing.
const STABILIZE: Duration = Duration::from_secs(5);

/// How long the renamed old container is kept before removal.
const OLD_SOAK: Duration = Duration::from_secs(30);

/// Graceful stop window for the old container during the switch.
const SWITCH_STOP_TIMEOUT: i64 = 10;

pub(crate) async fn run(ctx: &StageCtx<'_>, request: &DeployRequest) -> StepResult<()> {
    let descriptor = &request.descriptor;
    let name = &descriptor.container_name;
    let temp_name = format!(
        "{name}-new-{}",
        &uuid::Uuid::new_v4().simple().to_string()[..8]
    );

    ctx.stage(
        Stage::Building,
        20,
        format!("building image {}", descriptor.image_tag),
    )?;
    build_or_pull(ctx, descriptor, request.build_context.as_ref()).await?;

    // Create the replacement on ephemeral probe ports so it can run next to
    // the live container.
    ctx.stage(Stage::Creating, 40, format!("creating {temp_name}"))?;
    let probe_ports = super::ephemeral_ports(descriptor);
    let body = container::create_body_for(descriptor, Some(&probe_ports));
    container::create_container(ctx.client, &temp_name, body).await?;

    let deployed = deploy_and_switch(ctx, request, &temp_name).await;
    if deployed.is_err() {
        // Whatever went wrong, no -new- container may remain.
        remove_quietly(ctx, &temp_name).await;
    }
    deployed
}

async fn deploy_and_switch(
    ctx: &StageCtx<'_>,
    request: &DeployRequest,
    temp_name: &str,
) -> StepResult<()> {
    let descriptor = &request.descriptor;
    let name = &descriptor.container_name;

    container::start_container(ctx.client, temp_name).await?;
    sleep_cancellable(&ctx.cancel, STABILIZE).await?;

    ctx.stage(Stage::Validating, 60, format!("health-probing {temp_name}"))?;
    let probe_port = published_host_port(ctx.client, temp_name).await?;
    if let Err(e) = probe_step(ctx, temp_name, probe_port, descriptor).await {
        // Unhealthy replacement: capture its logs for the operator, tear it
        // down, leave the old container untouched.
        if let Ok(logs) = container::container_logs(ctx.client, temp_name, 50).await {
            if !logs.trim().is_empty() {
                warn!(container = temp_name, "replacement logs:\n{}", logs.trim());
            }
        }
        return Err(e);
    }

    ctx.stage(Stage::Switching, 80, format!("switching traffic to {temp_name}"))?;
    let old_exists = container::container_exists(ctx.client, name).await?;
    let old_backup_name = format!("{name}-old-{}", chrono::Utc::now().timestamp());
    if old_exists {
        interruptible(
            &ctx.cancel,
            Duration::from_secs(SWITCH_STOP_TIMEOUT as u64 + 30),
            "old container stop",
            container::stop_container(ctx.client, name, SWITCH_STOP_TIMEOUT),
        )
        .await?;
        container::rename_container(ctx.client, name, &old_backup_name).await?;
    }

    // The probe instance ran on ephemeral ports; rebind by recreating under
    // the real name with the original port map.
    let rebind = rebind_ports(ctx, request, temp_name).await;
    if let Err(e) = rebind {
        // Roll the rename back so the old container can be restarted by the
        // operator under its own name.
        if old_exists {
            if let Err(undo) =
                container::rename_container(ctx.client, &old_backup_name, name).await
            {
                warn!(error = %undo, "could not restore old container name");
            }
        }
        return Err(e);
    }

    ctx.stage(Stage::CleaningUp, 95, "removing superseded container")?;
    if old_exists {
        // Soak window: the old container stays around for a quick manual
        // rollback. Cancellation here skips the removal so the renamed old
        // container survives for the operator.
        match sleep_cancellable(&ctx.cancel, OLD_SOAK).await {
            Ok(()) => remove_quietly(ctx, &old_backup_name).await,
            Err(StepError::Cancelled) => {
                debug!(container = %old_backup_name, "cancelled during soak, keeping old container");
                return Err(StepError::Cancelled);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Replace the ephemeral-port probe instance with the final container bound
/// to the descriptor's port map.
async fn rebind_ports(
    ctx: &StageCtx<'_>,
    request: &DeployRequest,
    temp_name: &str,
) -> StepResult<()> {
    let descriptor = &request.descriptor;
    let name = &descriptor.container_name;

    container::stop_container(ctx.client, temp_name, SWITCH_STOP_TIMEOUT).await?;
    container::remove_container(ctx.client, temp_name, false).await?;

    let body = container::create_body_for(descriptor, None);
    container::create_container(ctx.client, name, body).await?;
    container::start_container(ctx.client, name).await?;

    checkpoint(ctx.lease)?;
    probe_step(ctx, name, descriptor.first_host_port(), descriptor).await
}

async fn remove_quietly(ctx: &StageCtx<'_>, name: &str) {
    match container::remove_container(ctx.client, name, true).await {
        Ok(()) => {}
        Err(DockerError::NotFound(_)) => {}
        Err(e) => warn!(container = name, error = %e, "cleanup removal failed"),
    }
}
