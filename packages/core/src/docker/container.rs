//! Container lifecycle operations.

use super::{DockerClient, DockerError};
use crate::descriptor::{ContainerDescriptor, MountSpec};
use bollard::models::{
    ContainerCreateBody, ContainerInspectResponse, ContainerSummary, HostConfig, PortBinding,
    PortMap, RestartPolicy, RestartPolicyNameEnum,
};
use bollard::query_parameters::{
    CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogsOptions,
    RemoveContainerOptions, RenameContainerOptions, StartContainerOptions, StopContainerOptions,
    WaitContainerOptions,
};
use futures_util::StreamExt;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Parse a cpu limit like "0.5" into NanoCpus.
pub fn parse_cpu_limit(cpu: &str) -> Option<i64> {
    let value: f64 = cpu.parse().ok()?;
    if value <= 0.0 {
        return None;
    }
    Some((value * 1_000_000_000.0) as i64)
}

/// Parse a memory limit like "512Mi" or "2Gi" into bytes.
pub fn parse_memory_limit(memory: &str) -> Option<i64> {
    let (number, unit) = memory.split_at(memory.len().saturating_sub(2));
    let value: f64 = number.parse().ok()?;
    let factor = match unit {
        "Ki" => 1024.0,
        "Mi" => 1024.0 * 1024.0,
        "Gi" => 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    Some((value * factor) as i64)
}

fn restart_policy_name(policy: &str) -> RestartPolicyNameEnum {
    match policy {
        "always" => RestartPolicyNameEnum::ALWAYS,
        "unless-stopped" => RestartPolicyNameEnum::UNLESS_STOPPED,
        "on-failure" => RestartPolicyNameEnum::ON_FAILURE,
        _ => RestartPolicyNameEnum::NO,
    }
}

/// Build the create body for a descriptor.
///
/// `port_override` replaces the descriptor's container→host port map; pass
/// an empty map to create the container with no published ports (rolling and
/// blue-green validate on probe ports before the switch).
pub fn create_body_for(
    descriptor: &ContainerDescriptor,
    port_override: Option<&BTreeMap<String, String>>,
) -> ContainerCreateBody {
    let ports = port_override.unwrap_or(&descriptor.port_bindings);

    let mut port_bindings: PortMap = HashMap::new();
    let mut exposed_ports = Vec::new();
    for (container_port, host_port) in ports {
        let key = format!("{container_port}/tcp");
        exposed_ports.push(key.clone());
        // An empty host port publishes on a daemon-assigned ephemeral port.
        port_bindings.insert(
            key,
            Some(vec![PortBinding {
                host_ip: None,
                host_port: (!host_port.is_empty()).then(|| host_port.clone()),
            }]),
        );
    }

    let binds: Vec<String> = descriptor
        .volumes
        .iter()
        .map(|mount| {
            let mode = match mount {
                MountSpec::Volume { read_only: true, .. }
                | MountSpec::Bind { read_only: true, .. } => ":ro",
                _ => "",
            };
            format!("{}:{}{mode}", mount.identifier(), mount.mount_path())
        })
        .collect();

    let host_config = HostConfig {
        port_bindings: Some(port_bindings),
        binds: (!binds.is_empty()).then_some(binds),
        restart_policy: Some(RestartPolicy {
            name: Some(restart_policy_name(&descriptor.restart_policy)),
            maximum_retry_count: None,
        }),
        nano_cpus: descriptor.cpu_limit.as_deref().and_then(parse_cpu_limit),
        memory: descriptor
            .memory_limit
            .as_deref()
            .and_then(parse_memory_limit),
        network_mode: descriptor.networks.first().cloned(),
        ..Default::default()
    };

    ContainerCreateBody {
        image: Some(descriptor.image_tag.clone()),
        cmd: descriptor
            .command
            .as_ref()
            .map(|c| c.split_whitespace().map(str::to_string).collect()),
        entrypoint: descriptor
            .entrypoint
            .as_ref()
            .map(|e| e.split_whitespace().map(str::to_string).collect()),
        env: (!descriptor.environment.is_empty()).then(|| descriptor.environment.clone()),
        labels: (!descriptor.labels.is_empty())
            .then(|| descriptor.labels.clone().into_iter().collect()),
        exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
        host_config: Some(host_config),
        ..Default::default()
    }
}

/// Create a container. Returns its id. Does not start it.
pub async fn create_container(
    client: &DockerClient,
    name: &str,
    body: ContainerCreateBody,
) -> Result<String, DockerError> {
    debug!(host = client.host_label(), container = name, "create container");
    let options = CreateContainerOptions {
        name: Some(name.to_string()),
        platform: String::new(),
    };
    let response = client
        .inner()
        .create_container(Some(options), body)
        .await
        .map_err(DockerError::from)?;
    Ok(response.id)
}

pub async fn start_container(client: &DockerClient, name: &str) -> Result<(), DockerError> {
    debug!(host = client.host_label(), container = name, "start container");
    client
        .inner()
        .start_container(name, None::<StartContainerOptions>)
        .await
        .map_err(DockerError::from)
}

/// Stop with a graceful timeout. "Already stopped" is not an error.
pub async fn stop_container(
    client: &DockerClient,
    name: &str,
    timeout_secs: i64,
) -> Result<(), DockerError> {
    debug!(
        host = client.host_label(),
        container = name,
        timeout = timeout_secs,
        "stop container"
    );
    let options = StopContainerOptions {
        signal: None,
        t: Some(timeout_secs as i32),
    };
    match client.inner().stop_container(name, Some(options)).await {
        Ok(()) => Ok(()),
        Err(bollard::errors::Error::DockerResponseServerError {
            status_code: 304, ..
        }) => {
            debug!(container = name, "container was already stopped");
            Ok(())
        }
        Err(e) => Err(DockerError::from(e)),
    }
}

pub async fn remove_container(
    client: &DockerClient,
    name: &str,
    force: bool,
) -> Result<(), DockerError> {
    debug!(
        host = client.host_label(),
        container = name,
        force, "remove container"
    );
    let options = RemoveContainerOptions {
        force,
        v: false,
        link: false,
    };
    client
        .inner()
        .remove_container(name, Some(options))
        .await
        .map_err(DockerError::from)
}

pub async fn rename_container(
    client: &DockerClient,
    name: &str,
    new_name: &str,
) -> Result<(), DockerError> {
    debug!(
        host = client.host_label(),
        from = name,
        to = new_name,
        "rename container"
    );
    client
        .inner()
        .rename_container(
            name,
            RenameContainerOptions {
                name: new_name.to_string(),
            },
        )
        .await
        .map_err(DockerError::from)
}

pub async fn inspect_container(
    client: &DockerClient,
    name: &str,
) -> Result<ContainerInspectResponse, DockerError> {
    client
        .inner()
        .inspect_container(name, None::<InspectContainerOptions>)
        .await
        .map_err(DockerError::from)
}

pub async fn container_exists(client: &DockerClient, name: &str) -> Result<bool, DockerError> {
    match inspect_container(client, name).await {
        Ok(_) => Ok(true),
        Err(DockerError::NotFound(_)) => Ok(false),
        Err(e) => Err(e),
    }
}

pub async fn container_is_running(client: &DockerClient, name: &str) -> Result<bool, DockerError> {
    match inspect_container(client, name).await {
        Ok(info) => Ok(info.state.and_then(|s| s.running).unwrap_or(false)),
        Err(DockerError::NotFound(_)) => Ok(false),
        Err(e) => Err(e),
    }
}

/// List containers, optionally filtered by a name fragment.
pub async fn list_containers(
    client: &DockerClient,
    all: bool,
    name_filter: Option<&str>,
) -> Result<Vec<ContainerSummary>, DockerError> {
    let filters =
        name_filter.map(|name| HashMap::from([("name".to_string(), vec![name.to_string()])]));
    let options = ListContainersOptions {
        all,
        filters,
        ..Default::default()
    };
    client
        .inner()
        .list_containers(Some(options))
        .await
        .map_err(DockerError::from)
}

/// Number of containers (running or not) created from the given image id.
pub async fn containers_using_image(
    client: &DockerClient,
    image_id: &str,
) -> Result<usize, DockerError> {
    let options = ListContainersOptions {
        all: true,
        filters: Some(HashMap::from([(
            "ancestor".to_string(),
            vec![image_id.to_string()],
        )])),
        ..Default::default()
    };
    let list = client
        .inner()
        .list_containers(Some(options))
        .await
        .map_err(DockerError::from)?;
    Ok(list.len())
}

/// Block until the container exits; returns its exit code.
pub async fn wait_container(client: &DockerClient, name: &str) -> Result<i64, DockerError> {
    let mut stream = client
        .inner()
        .wait_container(name, None::<WaitContainerOptions>);
    let mut exit_code = 0;
    while let Some(result) = stream.next().await {
        match result {
            Ok(response) => exit_code = response.status_code,
            // The daemon reports non-zero exits through the error channel
            // with the code attached.
            Err(bollard::errors::Error::DockerContainerWaitError { code, .. }) => {
                exit_code = code;
            }
            Err(e) => return Err(DockerError::from(e)),
        }
    }
    Ok(exit_code)
}

/// Stream a path out of a container (a tar archive) into a local file.
/// Works on created-but-not-started containers, which is how volume data is
/// ferried between hosts.
pub async fn download_to_file(
    client: &DockerClient,
    name: &str,
    container_path: &str,
    file_path: &std::path::Path,
) -> Result<u64, DockerError> {
    use tokio::io::AsyncWriteExt;
    debug!(
        host = client.host_label(),
        container = name,
        path = container_path,
        "download from container"
    );
    let options = bollard::query_parameters::DownloadFromContainerOptions {
        path: container_path.to_string(),
    };
    let mut stream = client.inner().download_from_container(name, Some(options));
    let mut file = tokio::fs::File::create(file_path)
        .await
        .map_err(|e| DockerError::Io(e.to_string()))?;
    let mut total = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(DockerError::from)?;
        total += chunk.len() as u64;
        file.write_all(&chunk)
            .await
            .map_err(|e| DockerError::Io(e.to_string()))?;
    }
    file.flush()
        .await
        .map_err(|e| DockerError::Io(e.to_string()))?;
    Ok(total)
}

/// Stream a local tar archive into a container path.
pub async fn upload_from_file(
    client: &DockerClient,
    name: &str,
    container_path: &str,
    file_path: &std::path::Path,
) -> Result<(), DockerError> {
    debug!(
        host = client.host_label(),
        container = name,
        path = container_path,
        "upload to container"
    );
    let file = tokio::fs::File::open(file_path)
        .await
        .map_err(|e| DockerError::Io(e.to_string()))?;
    let stream = tokio_util::io::ReaderStream::new(file);
    let options = bollard::query_parameters::UploadToContainerOptions {
        path: container_path.to_string(),
        ..Default::default()
    };
    client
        .inner()
        .upload_to_container(name, Some(options), bollard::body_try_stream(stream))
        .await
        .map_err(DockerError::from)
}

/// Fetch the last `tail` lines of combined stdout/stderr.
pub async fn container_logs(
    client: &DockerClient,
    name: &str,
    tail: usize,
) -> Result<String, DockerError> {
    let options = LogsOptions {
        stdout: true,
        stderr: true,
        tail: tail.to_string(),
        ..Default::default()
    };
    let mut stream = client.inner().logs(name, Some(options));
    let mut collected = String::new();
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(output) => collected.push_str(&output.to_string()),
            Err(e) => return Err(DockerError::from(e)),
        }
    }
    Ok(collected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_limits_convert_to_nano_cpus() {
        assert_eq!(parse_cpu_limit("0.5"), Some(500_000_000));
        assert_eq!(parse_cpu_limit("2.0"), Some(2_000_000_000));
        assert_eq!(parse_cpu_limit("garbage"), None);
        assert_eq!(parse_cpu_limit("0"), None);
    }

    #[test]
    fn memory_limits_convert_to_bytes() {
        assert_eq!(parse_memory_limit("512Mi"), Some(512 * 1024 * 1024));
        assert_eq!(parse_memory_limit("1Gi"), Some(1024 * 1024 * 1024));
        assert_eq!(parse_memory_limit("2Gi"), Some(2 * 1024_i64.pow(3)));
        assert_eq!(parse_memory_limit("banana"), None);
    }

    #[test]
    fn create_body_maps_ports_and_mounts() {
        let mut desc = ContainerDescriptor::new("grafana", "grafana/grafana:10.4.0");
        desc.port_bindings
            .insert("3000".to_string(), "8300".to_string());
        desc.volumes.push(MountSpec::Volume {
            name: "grafana-data".to_string(),
            mount_path: "/var/lib/grafana".to_string(),
            read_only: false,
        });
        desc.cpu_limit = Some("1.0".to_string());
        desc.memory_limit = Some("1Gi".to_string());

        let body = create_body_for(&desc, None);
        assert_eq!(body.image.as_deref(), Some("grafana/grafana:10.4.0"));
        let host_config = body.host_config.unwrap();
        let bindings = host_config.port_bindings.unwrap();
        let binding = bindings.get("3000/tcp").unwrap().as_ref().unwrap();
        assert_eq!(binding[0].host_port.as_deref(), Some("8300"));
        assert_eq!(
            host_config.binds.unwrap(),
            vec!["grafana-data:/var/lib/grafana"]
        );
        assert_eq!(host_config.nano_cpus, Some(1_000_000_000));
        assert_eq!(host_config.memory, Some(1024 * 1024 * 1024));
    }

    #[test]
    fn port_override_unbinds_ports() {
        let mut desc = ContainerDescriptor::new("web", "web:1");
        desc.port_bindings
            .insert("80".to_string(), "8080".to_string());
        let none = BTreeMap::new();
        let body = create_body_for(&desc, Some(&none));
        assert!(body.exposed_ports.is_none());
        let host_config = body.host_config.unwrap();
        assert!(host_config.port_bindings.unwrap().is_empty());
    }

    #[test]
    fn read_only_binds_carry_mode() {
        let mut desc = ContainerDescriptor::new("web", "web:1");
        desc.volumes.push(MountSpec::Bind {
            host_path: "/srv/static".to_string(),
            mount_path: "/usr/share/nginx/html".to_string(),
            read_only: true,
        });
        let body = create_body_for(&desc, None);
        assert_eq!(
            body.host_config.unwrap().binds.unwrap(),
            vec!["/srv/static:/usr/share/nginx/html:ro"]
        );
    }

    #[test]
    fn restart_policy_names_map() {
        assert_eq!(
            restart_policy_name("unless-stopped"),
            RestartPolicyNameEnum::UNLESS_STOPPED
        );
        assert_eq!(restart_policy_name("no"), RestartPolicyNameEnum::NO);
        assert_eq!(restart_policy_name("weird"), RestartPolicyNameEnum::NO);
    }
}
