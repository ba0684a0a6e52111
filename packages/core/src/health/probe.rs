//! Probe execution.
//!
//! HTTP probes share one lazily-initialized reqwest client so a busy engine
//! does not exhaust file descriptors; container-state readiness goes through
//! the Docker façade.

use super::HealthProbe;
use crate::docker::{container, DockerClient};
use crate::error::{ErrorKind, PilotError, Result};
use reqwest::Client;
use std::sync::OnceLock;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Delay between probe attempts.
pub const RETRY_DELAY: Duration = Duration::from_secs(2);

/// How long a container must stay running without a restart to count as
/// ready when no HTTP probe applies.
const STATE_SETTLE: Duration = Duration::from_secs(2);

static SHARED_CLIENT: OnceLock<Client> = OnceLock::new();

fn shared_client() -> &'static Client {
    SHARED_CLIENT.get_or_init(|| {
        Client::builder()
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(4)
            .build()
            .expect("failed to build shared HTTP client")
    })
}

/// One HTTP GET; true on a 2xx response within `timeout`.
pub async fn http_probe_once(host: &str, port: u16, endpoint: &str, timeout: Duration) -> bool {
    let url = format!("http://{host}:{port}{endpoint}");
    match shared_client().get(&url).timeout(timeout).send().await {
        Ok(response) => response.status().is_success(),
        Err(_) => false,
    }
}

/// Wait until a freshly deployed container is healthy.
///
/// HTTP probes run `retries` attempts with [`RETRY_DELAY`] between them and
/// `timeout_secs` per attempt. Container-state readiness inspects twice,
/// [`STATE_SETTLE`] apart, and requires running with no restart in between.
/// The loop is a suspension point: a tripped `cancel` token aborts with
/// `probe_failed` so the driver can roll back.
#[allow(clippy::too_many_arguments)]
pub async fn wait_healthy(
    client: &DockerClient,
    host: &str,
    container_name: &str,
    port: Option<u16>,
    probe: &HealthProbe,
    retries: u32,
    timeout_secs: u64,
    cancel: &CancellationToken,
) -> Result<()> {
    let attempts = retries.max(1);
    for attempt in 1..=attempts {
        if cancel.is_cancelled() {
            return Err(PilotError::new(
                ErrorKind::ProbeFailed,
                format!("health probe for {container_name} aborted by cancellation"),
            ));
        }

        let healthy = match probe {
            HealthProbe::Http(endpoint) => match port {
                Some(port) => {
                    http_probe_once(host, port, endpoint, Duration::from_secs(timeout_secs)).await
                }
                // No published port to probe through; fall back to state.
                None => state_ready(client, container_name).await?,
            },
            HealthProbe::ContainerState => state_ready(client, container_name).await?,
        };

        if healthy {
            debug!(container = container_name, attempt, "health probe passed");
            return Ok(());
        }
        debug!(
            container = container_name,
            attempt, attempts, "health probe attempt failed"
        );

        if attempt < attempts {
            tokio::select! {
                _ = tokio::time::sleep(RETRY_DELAY) => {}
                _ = cancel.cancelled() => {
                    return Err(PilotError::new(
                        ErrorKind::ProbeFailed,
                        format!("health probe for {container_name} aborted by cancellation"),
                    ));
                }
            }
        }
    }

    Err(PilotError::new(
        ErrorKind::ProbeFailed,
        format!("{container_name} did not become healthy after {attempts} attempts"),
    ))
}

/// Running for [`STATE_SETTLE`] without a restart.
async fn state_ready(client: &DockerClient, container_name: &str) -> Result<bool> {
    let before = container::inspect_container(client, container_name).await?;
    let running = before
        .state
        .as_ref()
        .and_then(|s| s.running)
        .unwrap_or(false);
    if !running {
        return Ok(false);
    }
    let restarts_before = before.restart_count.unwrap_or(0);

    tokio::time::sleep(STATE_SETTLE).await;

    let after = container::inspect_container(client, container_name).await?;
    let still_running = after
        .state
        .as_ref()
        .and_then(|s| s.running)
        .unwrap_or(false);
    let restarts_after = after.restart_count.unwrap_or(0);
    Ok(still_running && restarts_after == restarts_before)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn probe_against_closed_port_is_unhealthy() {
        // Port 1 on localhost is essentially guaranteed closed.
        let healthy = http_probe_once("localhost", 1, "/health", Duration::from_millis(300)).await;
        assert!(!healthy);
    }

    #[tokio::test]
    async fn shared_client_is_reused() {
        let a = shared_client() as *const Client;
        let b = shared_client() as *const Client;
        assert_eq!(a, b);
    }
}
