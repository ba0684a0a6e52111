//! Deployment engine.
//!
//! Every strategy (quick, rolling, blue-green, canary) runs under the shared
//! driver in this module. The driver acquires nothing itself (the caller
//! hands in a held [`ProgressLease`] and an [`AuthenticatedClient`]); it
//! backs up mounts when the strategy preserves data, executes the strategy's
//! transition sequence, and appends a history entry on the way out.
//!
//! Cancellation is cooperative: [`checkpoint`] is consulted before each
//! stage, and the long suspension points (build, pull, stop, probe loops,
//! soak timers) select against the lease's token.

pub mod history;

mod blue_green;
mod canary;
mod quick;
mod rolling;

use crate::backup::{self, BackupRecord};
use crate::descriptor::ContainerDescriptor;
use crate::docker::{DockerClient, DockerError};
use crate::error::{ErrorKind, PilotError};
use crate::health::HealthProbe;
use crate::hosts::AuthenticatedClient;
use crate::progress::{ProgressLease, Stage};
use history::{DeploymentHistory, DeploymentHistoryEntry, HistoryStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Stage-intrinsic timeouts.
#[derive(Debug, Clone)]
pub struct EngineTimeouts {
    pub build: Duration,
    pub pull: Duration,
    /// Graceful stop window handed to the daemon.
    pub stop_grace: Duration,
}

impl Default for EngineTimeouts {
    fn default() -> Self {
        Self {
            build: Duration::from_secs(20 * 60),
            pull: Duration::from_secs(10 * 60),
            stop_grace: Duration::from_secs(30),
        }
    }
}

/// Deployment strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    Quick,
    Rolling,
    BlueGreen,
    Canary,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Quick => "quick",
            Strategy::Rolling => "rolling",
            Strategy::BlueGreen => "blue-green",
            Strategy::Canary => "canary",
        }
    }

    /// Strategies that snapshot mounts before touching the old container.
    pub fn preserves_data(&self) -> bool {
        !matches!(self, Strategy::Quick)
    }

    /// Default strategy for promoting into an environment: blue-green guards
    /// prod, rolling everywhere else.
    pub fn default_for(env: crate::descriptor::Environment) -> Self {
        match env {
            crate::descriptor::Environment::Prod => Strategy::BlueGreen,
            _ => Strategy::Rolling,
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Strategy {
    type Err = PilotError;

    fn from_str(s: &str) -> std::result::Result<Self, PilotError> {
        match s.to_ascii_lowercase().as_str() {
            "quick" => Ok(Strategy::Quick),
            "rolling" => Ok(Strategy::Rolling),
            "blue-green" | "bluegreen" => Ok(Strategy::BlueGreen),
            "canary" => Ok(Strategy::Canary),
            other => Err(PilotError::new(
                ErrorKind::InvalidDescriptor,
                format!("unknown strategy '{other}' (quick, rolling, blue-green, canary)"),
            )),
        }
    }
}

/// One deployment to execute against a target host.
#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub strategy: Strategy,
    /// Descriptor already transformed for the target environment.
    pub descriptor: ContainerDescriptor,
    /// Directory holding a Dockerfile; absent means the image is prebuilt
    /// and only pulled if missing.
    pub build_context: Option<PathBuf>,
    pub skip_backup: bool,
    /// Quick deploy: remove the superseded image when nothing references it.
    pub cleanup_old_image: bool,
    /// Blue-green: run the volume/config data migration step.
    pub migrate_data: bool,
}

/// Why a strategy step ended early.
pub(crate) enum StepError {
    /// The cancel latch was observed; the strategy has already rolled back
    /// its latest reversible action.
    Cancelled,
    Failed(PilotError),
}

impl From<PilotError> for StepError {
    fn from(e: PilotError) -> Self {
        StepError::Failed(e)
    }
}

impl From<DockerError> for StepError {
    fn from(e: DockerError) -> Self {
        StepError::Failed(e.into())
    }
}

pub(crate) type StepResult<T> = std::result::Result<T, StepError>;

/// Everything a strategy needs for one run.
pub(crate) struct StageCtx<'a> {
    pub client: &'a DockerClient,
    pub lease: &'a ProgressLease,
    pub cancel: CancellationToken,
    pub timeouts: &'a EngineTimeouts,
    /// Address health probes connect to (the target host, `localhost` for
    /// the local daemon).
    pub probe_host: &'a str,
    /// Extra text a strategy attaches to the terminal completed message,
    /// e.g. that the superseded slot was kept for post-rollback.
    pub completion_note: Mutex<Option<String>>,
}

impl StageCtx<'_> {
    /// Stage boundary: observe the cancel latch, then publish the update.
    pub fn stage(&self, stage: Stage, progress: u8, message: impl Into<String>) -> StepResult<()> {
        checkpoint(self.lease)?;
        self.lease.update(stage, progress, message);
        Ok(())
    }

    pub fn set_completion_note(&self, note: impl Into<String>) {
        *self
            .completion_note
            .lock()
            .expect("completion note poisoned") = Some(note.into());
    }
}

/// Cancel checkpoint used between files, phases, and stages.
pub(crate) fn checkpoint(lease: &ProgressLease) -> StepResult<()> {
    if lease.cancel_requested() {
        Err(StepError::Cancelled)
    } else {
        Ok(())
    }
}

/// Run a daemon operation as a suspension point: interruptible by the cancel
/// token and bounded by `limit`. Timeouts map to `failed`, never
/// `cancelled`.
pub(crate) async fn interruptible<T>(
    cancel: &CancellationToken,
    limit: Duration,
    what: &str,
    fut: impl std::future::Future<Output = std::result::Result<T, DockerError>>,
) -> StepResult<T> {
    tokio::select! {
        _ = cancel.cancelled() => Err(StepError::Cancelled),
        result = tokio::time::timeout(limit, fut) => match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(StepError::Failed(e.into())),
            Err(_) => Err(StepError::Failed(PilotError::new(
                ErrorKind::Timeout,
                format!("{what} exceeded {}s", limit.as_secs()),
            ))),
        }
    }
}

/// Sleep that aborts with `Cancelled` when the latch trips.
pub(crate) async fn sleep_cancellable(
    cancel: &CancellationToken,
    duration: Duration,
) -> StepResult<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(StepError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Ensure the descriptor's image exists on the target: build it from the
/// context when one is given, otherwise pull if absent.
pub(crate) async fn build_or_pull(
    ctx: &StageCtx<'_>,
    descriptor: &ContainerDescriptor,
    build_context: Option<&PathBuf>,
) -> StepResult<()> {
    match build_context {
        Some(context) => {
            let tag = descriptor.image_tag.clone();
            interruptible(
                &ctx.cancel,
                ctx.timeouts.build,
                "image build",
                crate::docker::image::build_image(ctx.client, context, &tag, |_| {}),
            )
            .await?;
            Ok(())
        }
        None => {
            interruptible(
                &ctx.cancel,
                ctx.timeouts.pull,
                "image pull",
                crate::docker::image::pull_image_if_absent(ctx.client, &descriptor.image_tag),
            )
            .await
        }
    }
}

/// The probe derived from a descriptor: HTTP on its endpoint, or container
/// state when probing is disabled for the image.
pub(crate) fn probe_for(descriptor: &ContainerDescriptor) -> HealthProbe {
    match &descriptor.healthcheck_endpoint {
        Some(endpoint) => HealthProbe::Http(endpoint.clone()),
        None => HealthProbe::ContainerState,
    }
}

/// Wait for a deployed container to become healthy, as a strategy step.
pub(crate) async fn probe_step(
    ctx: &StageCtx<'_>,
    container_name: &str,
    port: Option<u16>,
    descriptor: &ContainerDescriptor,
) -> StepResult<()> {
    let probe = probe_for(descriptor);
    crate::health::probe::wait_healthy(
        ctx.client,
        ctx.probe_host,
        container_name,
        port,
        &probe,
        descriptor.healthcheck_retries,
        descriptor.healthcheck_timeout,
        &ctx.cancel,
    )
    .await
    .map_err(|e| {
        if ctx.lease.cancel_requested() {
            StepError::Cancelled
        } else {
            StepError::Failed(e)
        }
    })
}

/// Port map that publishes every container port on a daemon-assigned
/// ephemeral host port, for probing before the real switch.
pub(crate) fn ephemeral_ports(descriptor: &ContainerDescriptor) -> BTreeMap<String, String> {
    descriptor
        .port_bindings
        .keys()
        .map(|container_port| (container_port.clone(), String::new()))
        .collect()
}

/// First host port the daemon actually assigned to a running container.
pub(crate) async fn published_host_port(
    client: &DockerClient,
    name: &str,
) -> std::result::Result<Option<u16>, DockerError> {
    let info = crate::docker::container::inspect_container(client, name).await?;
    let Some(ports) = info.network_settings.and_then(|n| n.ports) else {
        return Ok(None);
    };
    for bindings in ports.values().flatten() {
        if let Some(port) = bindings
            .first()
            .and_then(|b| b.host_port.as_deref())
            .and_then(|p| p.parse().ok())
        {
            return Ok(Some(port));
        }
    }
    Ok(None)
}

/// Run the full deployment: optional backup, the strategy, the history
/// entry, and the terminal progress record.
#[allow(clippy::too_many_arguments)]
pub async fn run(
    lease: ProgressLease,
    client: AuthenticatedClient,
    request: DeployRequest,
    history: Arc<DeploymentHistory>,
    backups_dir: PathBuf,
    elevation_secret: Option<String>,
    probe_host: String,
) {
    let started = Instant::now();
    let timeouts = EngineTimeouts::default();
    let descriptor = request.descriptor.clone();
    let container_name = descriptor.container_name.clone();
    let ctx = StageCtx {
        client: client.docker(),
        lease: &lease,
        cancel: lease.cancellation_token(),
        timeouts: &timeouts,
        probe_host: &probe_host,
        completion_note: Mutex::new(None),
    };

    let result = drive(&ctx, &request, &backups_dir, elevation_secret.as_deref()).await;
    let completion_note = ctx
        .completion_note
        .lock()
        .expect("completion note poisoned")
        .take();

    let duration_ms = started.elapsed().as_millis() as u64;
    let (status, output) = match &result {
        Ok(()) => (HistoryStatus::Success, completion_note.clone()),
        Err(StepError::Cancelled) => (
            HistoryStatus::Failed,
            Some("cancelled by operator".to_string()),
        ),
        Err(StepError::Failed(e)) => (HistoryStatus::Failed, Some(e.to_string())),
    };
    if let Err(e) = history.append(&DeploymentHistoryEntry::new(
        request.strategy.as_str(),
        &descriptor.image_tag,
        &container_name,
        status,
        duration_ms,
        output,
    )) {
        warn!(error = %e, "failed to append deployment history entry");
    }

    match result {
        Ok(()) => {
            info!(container = %container_name, strategy = %request.strategy, duration_ms, "deployment completed");
            let mut message = format!(
                "{} deployment of {container_name} completed in {:.1}s",
                request.strategy,
                duration_ms as f64 / 1000.0
            );
            if let Some(note) = completion_note {
                message.push_str(&format!(" ({note})"));
            }
            lease.complete(message);
        }
        Err(StepError::Cancelled) => {
            info!(container = %container_name, "deployment cancelled");
            lease.cancelled(format!("deployment of {container_name} cancelled"));
        }
        Err(StepError::Failed(e)) => {
            warn!(container = %container_name, error = %e, "deployment failed");
            lease.fail(e.kind(), e.to_string());
        }
    }
}

async fn drive(
    ctx: &StageCtx<'_>,
    request: &DeployRequest,
    backups_dir: &std::path::Path,
    elevation_secret: Option<&str>,
) -> StepResult<()> {
    ctx.stage(
        Stage::Starting,
        0,
        format!(
            "starting {} deployment of {}",
            request.strategy, request.descriptor.container_name
        ),
    )?;

    if request.strategy.preserves_data() && !request.skip_backup {
        backup_step(ctx, request, backups_dir, elevation_secret).await?;
    }

    match request.strategy {
        Strategy::Quick => quick::run(ctx, request).await,
        Strategy::Rolling => rolling::run(ctx, request).await,
        Strategy::BlueGreen => blue_green::run(ctx, request).await,
        Strategy::Canary => canary::run(ctx, request).await,
    }
}

/// Back up every backupable mount, observing the cancel latch between
/// files. Parked records stay in scope for rollback until the run ends.
async fn backup_step(
    ctx: &StageCtx<'_>,
    request: &DeployRequest,
    backups_dir: &std::path::Path,
    elevation_secret: Option<&str>,
) -> StepResult<Vec<BackupRecord>> {
    let descriptor = &request.descriptor;
    if descriptor.volumes.is_empty() {
        return Ok(Vec::new());
    }

    ctx.stage(
        Stage::BackingUp,
        5,
        format!("backing up {} mount(s)", descriptor.volumes.len()),
    )?;

    // Fail before any archive work when elevation would be needed mid-way.
    let classification =
        backup::classify(ctx.client, descriptor, backup::DEFAULT_MAX_WALK).await?;
    if classification.requires_sudo && elevation_secret.is_none() {
        return Err(StepError::Failed(PilotError::new(
            ErrorKind::ElevationRequired,
            format!(
                "{} privileged path(s) need an elevation secret",
                classification.privileged_paths.len()
            ),
        )));
    }

    let mut records = Vec::new();
    for mount in &descriptor.volumes {
        checkpoint(ctx.lease)?;
        let record = backup::backup_mount(
            ctx.client,
            mount,
            backups_dir,
            ctx.lease.key(),
            elevation_secret,
        )
        .await?;
        records.push(record);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Environment;

    #[test]
    fn default_strategy_per_environment() {
        assert_eq!(Strategy::default_for(Environment::Prod), Strategy::BlueGreen);
        assert_eq!(
            Strategy::default_for(Environment::Staging),
            Strategy::Rolling
        );
        assert_eq!(Strategy::default_for(Environment::Dev), Strategy::Rolling);
    }

    #[test]
    fn quick_does_not_preserve_data() {
        assert!(!Strategy::Quick.preserves_data());
        assert!(Strategy::Rolling.preserves_data());
        assert!(Strategy::BlueGreen.preserves_data());
        assert!(Strategy::Canary.preserves_data());
    }

    #[test]
    fn timeouts_match_stage_contract() {
        let t = EngineTimeouts::default();
        assert_eq!(t.build, Duration::from_secs(1200));
        assert_eq!(t.pull, Duration::from_secs(600));
        assert_eq!(t.stop_grace, Duration::from_secs(30));
    }

    #[test]
    fn ephemeral_ports_blank_out_host_side() {
        let mut desc = ContainerDescriptor::new("web", "web:1");
        desc.port_bindings
            .insert("80".to_string(), "8080".to_string());
        desc.port_bindings
            .insert("443".to_string(), "8443".to_string());
        let ports = ephemeral_ports(&desc);
        assert_eq!(ports.len(), 2);
        assert!(ports.values().all(String::is_empty));
    }

    #[tokio::test]
    async fn interruptible_times_out_to_failed() {
        let cancel = CancellationToken::new();
        let result: StepResult<()> = interruptible(
            &cancel,
            Duration::from_millis(10),
            "slow op",
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
        )
        .await;
        match result {
            Err(StepError::Failed(e)) => assert_eq!(e.kind(), ErrorKind::Timeout),
            _ => panic!("expected timeout failure"),
        }
    }

    #[tokio::test]
    async fn interruptible_cancels_before_timeout() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: StepResult<()> = interruptible(
            &cancel,
            Duration::from_secs(60),
            "op",
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
        )
        .await;
        assert!(matches!(result, Err(StepError::Cancelled)));
    }
}
