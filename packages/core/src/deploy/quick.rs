//! Quick deploy: build, swap in place, clean up.
//!
//! Development-grade strategy with a downtime window between stopping the
//! old container and starting the new one. Build failures are fatal with no
//! side effects; a failure after the old container is gone triggers a
//! best-effort re-create from the captured image id.

use super::{build_or_pull, interruptible, probe_step, StageCtx, StepError, StepResult};
use crate::deploy::DeployRequest;
use crate::docker::{container, image};
use crate::progress::Stage;
use tracing::{debug, warn};

pub(crate) async fn run(ctx: &StageCtx<'_>, request: &DeployRequest) -> StepResult<()> {
    let descriptor = &request.descriptor;
    let name = &descriptor.container_name;

    // Capture the old container's image id so cleanup can compare and a
    // failed swap can attempt resurrection.
    ctx.stage(Stage::Starting, 0, format!("checking existing {name}"))?;
    let old_image_id = match container::inspect_container(ctx.client, name).await {
        Ok(info) => info.image,
        Err(crate::docker::DockerError::NotFound(_)) => None,
        Err(e) => return Err(e.into()),
    };

    ctx.stage(
        Stage::Building,
        20,
        format!("building image {}", descriptor.image_tag),
    )?;
    build_or_pull(ctx, descriptor, request.build_context.as_ref()).await?;

    ctx.stage(Stage::Stopping, 50, format!("stopping old {name}"))?;
    let grace = ctx.timeouts.stop_grace;
    let stop = interruptible(
        &ctx.cancel,
        // The stage timeout is the daemon grace window plus slack for the
        // kill path.
        grace + std::time::Duration::from_secs(30),
        "old container stop",
        container::stop_container(ctx.client, name, grace.as_secs() as i64),
    )
    .await;
    match stop {
        Ok(()) => {
            container::remove_container(ctx.client, name, false).await?;
        }
        Err(StepError::Failed(e)) if e.kind() == crate::error::ErrorKind::NotFound => {
            debug!(container = name, "no existing container, first deployment");
        }
        Err(e) => return Err(e),
    }

    ctx.stage(Stage::Creating, 70, format!("creating {name}"))?;
    let body = container::create_body_for(descriptor, None);
    let created = async {
        container::create_container(ctx.client, name, body).await?;
        container::start_container(ctx.client, name).await
    }
    .await;

    if let Err(e) = created {
        // The old container is already gone; try to bring it back from its
        // image. Best effort only; reported, never treated as success.
        if let Some(image_id) = &old_image_id {
            warn!(container = name, error = %e, "create failed, attempting to restore previous container");
            let mut restore = descriptor.clone();
            restore.image_tag = image_id.clone();
            let body = container::create_body_for(&restore, None);
            let restored = async {
                container::create_container(ctx.client, name, body).await?;
                container::start_container(ctx.client, name).await
            }
            .await;
            match restored {
                Ok(()) => warn!(container = name, "previous container restored from {image_id}"),
                Err(restore_err) => {
                    warn!(container = name, error = %restore_err, "restore of previous container failed")
                }
            }
        }
        return Err(e.into());
    }

    if request.cleanup_old_image {
        ctx.stage(Stage::CleaningUp, 85, "removing superseded image")?;
        cleanup_old_image(ctx, descriptor, old_image_id.as_deref()).await;
    }

    ctx.stage(Stage::Validating, 95, format!("health-probing {name}"))?;
    probe_step(ctx, name, descriptor.first_host_port(), descriptor).await?;

    Ok(())
}

/// Remove the previous image when it differs from the new one and no other
/// container references it. Never fatal.
async fn cleanup_old_image(
    ctx: &StageCtx<'_>,
    descriptor: &crate::descriptor::ContainerDescriptor,
    old_image_id: Option<&str>,
) {
    let Some(old_image_id) = old_image_id else {
        return;
    };
    let new_image_id = match image::image_id(ctx.client, &descriptor.image_tag).await {
        Ok(id) => id,
        Err(e) => {
            debug!(error = %e, "could not resolve new image id, skipping cleanup");
            return;
        }
    };
    if new_image_id == old_image_id {
        debug!("image unchanged, no cleanup needed");
        return;
    }
    match container::containers_using_image(ctx.client, old_image_id).await {
        Ok(0) => {
            if let Err(e) = image::remove_image(ctx.client, old_image_id).await {
                debug!(error = %e, "old image removal skipped");
            }
        }
        Ok(count) => debug!(count, "old image still referenced, keeping it"),
        Err(e) => debug!(error = %e, "could not check image references"),
    }
}
