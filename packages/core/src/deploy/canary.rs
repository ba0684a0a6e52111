//! Canary deploy.
//!
//! Deploys `<name>-canary` carrying a traffic-weight label (an external
//! ingress is expected to honor it; the engine does not split traffic
//! itself), observes restarts and probe failures for a fixed window, then
//! either promotes the canary to the real name or removes it.

use super::{
    build_or_pull, checkpoint, interruptible, probe_step, published_host_port, sleep_cancellable,
    StageCtx, StepError, StepResult,
};
use crate::deploy::DeployRequest;
use crate::docker::{container, DockerError};
use crate::health::probe::http_probe_once;
use crate::progress::Stage;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Label an external ingress reads to weight canary traffic.
pub const WEIGHT_LABEL: &str = "dockerpilot.canary-weight";

/// Advisory traffic share encoded in the label.
pub const CANARY_WEIGHT: &str = "5";

/// Observation window before promotion.
const OBSERVE_WINDOW: Duration = Duration::from_secs(30);

/// Sampling interval inside the observation window.
const SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

/// Probe failure share that fails the canary.
const MAX_FAILURE_RATE: f64 = 0.05;

/// Graceful stop window used while promoting.
const PROMOTE_STOP_TIMEOUT: i64 = 10;

pub(crate) async fn run(ctx: &StageCtx<'_>, request: &DeployRequest) -> StepResult<()> {
    let descriptor = &request.descriptor;
    let name = &descriptor.container_name;
    let canary_name = format!("{name}-canary");

    ctx.stage(
        Stage::Building,
        20,
        format!("building image {}", descriptor.image_tag),
    )?;
    build_or_pull(ctx, descriptor, request.build_context.as_ref()).await?;

    // A leftover canary from an earlier attempt is replaced.
    remove_quietly(ctx, &canary_name).await;

    ctx.stage(
        Stage::Creating,
        35,
        format!("deploying canary at {CANARY_WEIGHT}% weight"),
    )?;
    let mut canary_descriptor = descriptor.clone();
    canary_descriptor
        .labels
        .insert(WEIGHT_LABEL.to_string(), CANARY_WEIGHT.to_string());
    let probe_ports = super::ephemeral_ports(&canary_descriptor);
    let body = container::create_body_for(&canary_descriptor, Some(&probe_ports));
    container::create_container(ctx.client, &canary_name, body).await?;

    let result = observe_and_promote(ctx, request, &canary_name).await;
    if result.is_err() {
        remove_quietly(ctx, &canary_name).await;
    }
    result
}

async fn observe_and_promote(
    ctx: &StageCtx<'_>,
    request: &DeployRequest,
    canary_name: &str,
) -> StepResult<()> {
    let descriptor = &request.descriptor;
    let name = &descriptor.container_name;

    container::start_container(ctx.client, canary_name).await?;
    sleep_cancellable(&ctx.cancel, Duration::from_secs(5)).await?;

    ctx.stage(Stage::Validating, 55, "observing canary")?;
    let probe_port = published_host_port(ctx.client, canary_name).await?;
    observe(ctx, descriptor, canary_name, probe_port).await?;

    ctx.stage(Stage::Switching, 80, "promoting canary")?;
    let stop_old = interruptible(
        &ctx.cancel,
        Duration::from_secs(PROMOTE_STOP_TIMEOUT as u64 + 30),
        "old container stop",
        container::stop_container(ctx.client, name, PROMOTE_STOP_TIMEOUT),
    )
    .await;
    match stop_old {
        Ok(()) => container::remove_container(ctx.client, name, false).await?,
        Err(StepError::Failed(e)) if e.kind() == crate::error::ErrorKind::NotFound => {
            debug!(container = name, "no prior container to replace");
        }
        Err(e) => return Err(e),
    }

    // The canary ran on probe ports; promotion recreates it under the real
    // name with the descriptor's port map and without the weight label.
    interruptible(
        &ctx.cancel,
        Duration::from_secs(PROMOTE_STOP_TIMEOUT as u64 + 30),
        "canary stop",
        container::stop_container(ctx.client, canary_name, PROMOTE_STOP_TIMEOUT),
    )
    .await?;
    container::remove_container(ctx.client, canary_name, false).await?;
    let body = container::create_body_for(descriptor, None);
    container::create_container(ctx.client, name, body).await?;
    container::start_container(ctx.client, name).await?;

    checkpoint(ctx.lease)?;
    ctx.stage(Stage::CleaningUp, 95, "validating promoted canary")?;
    probe_step(ctx, name, descriptor.first_host_port(), descriptor).await?;
    info!(container = name, "canary promoted");
    Ok(())
}

/// Watch restarts and probe results for the observation window. Any restart
/// or a failure rate above [`MAX_FAILURE_RATE`] fails the canary.
async fn observe(
    ctx: &StageCtx<'_>,
    descriptor: &crate::descriptor::ContainerDescriptor,
    canary_name: &str,
    probe_port: Option<u16>,
) -> StepResult<()> {
    let samples = (OBSERVE_WINDOW.as_secs() / SAMPLE_INTERVAL.as_secs()).max(1);
    let baseline_restarts = container::inspect_container(ctx.client, canary_name)
        .await?
        .restart_count
        .unwrap_or(0);

    let mut probes = 0u32;
    let mut failures = 0u32;
    for sample in 0..samples {
        checkpoint(ctx.lease)?;

        let info = container::inspect_container(ctx.client, canary_name).await?;
        let restarts = info.restart_count.unwrap_or(0);
        if restarts > baseline_restarts {
            warn!(container = canary_name, restarts, "canary restarted during observation");
            return Err(StepError::Failed(crate::error::PilotError::new(
                crate::error::ErrorKind::ProbeFailed,
                format!("canary restarted {} time(s) during observation", restarts - baseline_restarts),
            )));
        }

        if let (Some(endpoint), Some(port)) = (&descriptor.healthcheck_endpoint, probe_port) {
            probes += 1;
            let healthy = http_probe_once(
                ctx.probe_host,
                port,
                endpoint,
                Duration::from_secs(descriptor.healthcheck_timeout),
            )
            .await;
            if !healthy {
                failures += 1;
            }
        }

        if sample + 1 < samples {
            sleep_cancellable(&ctx.cancel, SAMPLE_INTERVAL).await?;
        }
    }

    if probes > 0 {
        let rate = f64::from(failures) / f64::from(probes);
        if rate > MAX_FAILURE_RATE {
            return Err(StepError::Failed(crate::error::PilotError::new(
                crate::error::ErrorKind::ProbeFailed,
                format!(
                    "canary probe failure rate {:.0}% exceeds {:.0}%",
                    rate * 100.0,
                    MAX_FAILURE_RATE * 100.0
                ),
            )));
        }
    }
    debug!(container = canary_name, probes, failures, "canary observation passed");
    Ok(())
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
    fn weight_label_contract() {
        assert_eq!(WEIGHT_LABEL, "dockerpilot.canary-weight");
        assert_eq!(CANARY_WEIGHT, "5");
    }

    #[test]
    fn observation_samples_cover_window() {
        let samples = OBSERVE_WINDOW.as_secs() / SAMPLE_INTERVAL.as_secs();
        assert_eq!(samples, 6);
    }
}
