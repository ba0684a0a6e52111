//! Volume operations and the ephemeral helper runner.

use super::{container, image, DockerClient, DockerError};
use bollard::models::VolumeCreateRequest;
use std::collections::HashMap;
use tracing::debug;

/// Helper image for data-plane work (tar, cp). Pinned so helper behavior is
/// reproducible across hosts.
pub const HELPER_IMAGE: &str = "alpine:3.20";

pub async fn volume_exists(client: &DockerClient, name: &str) -> Result<bool, DockerError> {
    match client.inner().inspect_volume(name).await {
        Ok(_) => Ok(true),
        Err(bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        }) => Ok(false),
        Err(e) => Err(DockerError::from(e)),
    }
}

/// Create a named volume. Idempotent: the daemon returns the existing volume
/// if one with this name already exists.
pub async fn ensure_volume(client: &DockerClient, name: &str) -> Result<(), DockerError> {
    debug!(host = client.host_label(), volume = name, "ensure volume");
    let options = VolumeCreateRequest {
        name: Some(name.to_string()),
        driver: Some("local".to_string()),
        driver_opts: Some(HashMap::new()),
        labels: Some(HashMap::from([(
            "managed-by".to_string(),
            "dockerpilot".to_string(),
        )])),
        cluster_volume_spec: None,
    };
    client
        .inner()
        .create_volume(options)
        .await
        .map_err(DockerError::from)?;
    Ok(())
}

/// Per-volume disk usage from the daemon's `df` endpoint, in bytes.
/// Volumes the daemon reports no usage for are absent from the map.
pub async fn volume_sizes(client: &DockerClient) -> Result<HashMap<String, u64>, DockerError> {
    let usage = client
        .inner()
        .df(None::<bollard::query_parameters::DataUsageOptions>)
        .await
        .map_err(DockerError::from)?;
    let mut sizes = HashMap::new();
    let volumes = usage
        .volumes_disk_usage
        .and_then(|disk_usage| disk_usage.items)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|item| serde_json::from_value::<bollard::models::Volume>(item).ok());
    for volume in volumes {
        if let Some(size) = volume.usage_data.as_ref().map(|u| u.size) {
            if size >= 0 {
                sizes.insert(volume.name, size as u64);
            }
        }
    }
    Ok(sizes)
}

/// Outcome of one ephemeral helper run.
#[derive(Debug, Clone)]
pub struct EphemeralOutcome {
    pub exit_code: i64,
    pub logs: String,
}

impl EphemeralOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Run a short-lived helper container to completion.
///
/// Pulls the image if absent, runs `cmd` with the given `host:container[:ro]`
/// binds, captures exit code and logs, and removes the container regardless
/// of outcome.
pub async fn run_ephemeral(
    client: &DockerClient,
    image_ref: &str,
    cmd: Vec<String>,
    binds: Vec<String>,
) -> Result<EphemeralOutcome, DockerError> {
    image::pull_image_if_absent(client, image_ref).await?;

    let name = format!("dockerpilot-helper-{}", uuid::Uuid::new_v4().simple());
    debug!(host = client.host_label(), helper = %name, image = image_ref, "run ephemeral helper");

    let body = bollard::models::ContainerCreateBody {
        image: Some(image_ref.to_string()),
        cmd: Some(cmd),
        host_config: Some(bollard::models::HostConfig {
            binds: (!binds.is_empty()).then_some(binds),
            ..Default::default()
        }),
        ..Default::default()
    };

    container::create_container(client, &name, body).await?;

    // From here on the helper must be removed on every path.
    let run = async {
        container::start_container(client, &name).await?;
        let exit_code = container::wait_container(client, &name).await?;
        let logs = container::container_logs(client, &name, 100).await?;
        Ok::<EphemeralOutcome, DockerError>(EphemeralOutcome { exit_code, logs })
    }
    .await;

    if let Err(e) = container::remove_container(client, &name, true).await {
        debug!(helper = %name, error = %e, "failed to remove helper container");
    }

    run
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn helper_image_is_pinned() {
        assert!(HELPER_IMAGE.contains(':'), "helper image must carry a tag");
    }

    #[test]
    fn outcome_success_is_exit_zero() {
        let ok = EphemeralOutcome {
            exit_code: 0,
            logs: String::new(),
        };
        let bad = EphemeralOutcome {
            exit_code: 2,
            logs: String::new(),
        };
        assert!(ok.success());
        assert!(!bad.success());
    }
}
