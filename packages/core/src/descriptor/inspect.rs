//! Container introspection.
//!
//! Reads `ContainerInspect` and derives a [`ContainerDescriptor`] in full
//! fidelity: original port bindings, environment order, labels, restart
//! policy, and the complete mount list. Bind mounts keep their absolute host
//! paths; named volumes keep their volume names.

use super::{ContainerDescriptor, MountSpec};
use crate::docker::{container, DockerClient};
use crate::error::{PilotError, Result};
use crate::health::HealthResolver;
use bollard::models::{ContainerInspectResponse, MountPointTypeEnum};
use std::collections::BTreeMap;

/// Render NanoCpus the way limits are written in descriptors ("0.5", "1.0").
fn format_cpu(nano_cpus: i64) -> String {
    let cpus = nano_cpus as f64 / 1_000_000_000.0;
    let rendered = format!("{cpus}");
    if rendered.contains('.') {
        rendered
    } else {
        format!("{cpus:.1}")
    }
}

/// Render a byte limit as "512Mi" / "2Gi".
fn format_memory(bytes: i64) -> String {
    let mib = bytes / (1024 * 1024);
    if mib >= 1024 {
        format!("{}Gi", mib / 1024)
    } else {
        format!("{mib}Mi")
    }
}

/// Inspect a container and derive its descriptor, resolving the health probe
/// for its image.
pub async fn inspect(
    client: &DockerClient,
    container_name: &str,
    resolver: &HealthResolver,
) -> Result<ContainerDescriptor> {
    let response = container::inspect_container(client, container_name).await?;
    descriptor_from_inspect(&response, resolver)
}

/// Pure derivation from an inspect response.
pub fn descriptor_from_inspect(
    response: &ContainerInspectResponse,
    resolver: &HealthResolver,
) -> Result<ContainerDescriptor> {
    let name = response
        .name
        .as_deref()
        .map(|n| n.trim_start_matches('/').to_string())
        .filter(|n| !n.is_empty())
        .ok_or_else(|| PilotError::missing_field("name"))?;

    let config = response
        .config
        .as_ref()
        .ok_or_else(|| PilotError::missing_field("config"))?;

    // Fall back to the image id if the reference is gone (untagged image).
    let image_tag = config
        .image
        .clone()
        .filter(|i| !i.is_empty())
        .or_else(|| response.image.clone())
        .ok_or_else(|| PilotError::missing_field("image"))?;

    let mut descriptor = ContainerDescriptor::new(name, image_tag);

    descriptor.command = config
        .cmd
        .as_ref()
        .filter(|c| !c.is_empty())
        .map(|c| c.join(" "));
    descriptor.entrypoint = config
        .entrypoint
        .as_ref()
        .filter(|e| !e.is_empty())
        .map(|e| e.join(" "));
    descriptor.environment = config.env.clone().unwrap_or_default();
    descriptor.labels = config
        .labels
        .clone()
        .unwrap_or_default()
        .into_iter()
        .collect();

    let mut port_bindings = BTreeMap::new();
    if let Some(ports) = response
        .network_settings
        .as_ref()
        .and_then(|n| n.ports.as_ref())
    {
        for (container_port, bindings) in ports {
            let Some(bindings) = bindings else { continue };
            let Some(host_port) = bindings.first().and_then(|b| b.host_port.clone()) else {
                continue;
            };
            // "3000/tcp" -> "3000"
            let container_port = container_port
                .split('/')
                .next()
                .unwrap_or(container_port)
                .to_string();
            port_bindings.insert(container_port, host_port);
        }
    }
    descriptor.port_bindings = port_bindings;

    let mut volumes = Vec::new();
    for mount in response.mounts.as_deref().unwrap_or_default() {
        let Some(destination) = mount.destination.clone().filter(|d| !d.is_empty()) else {
            continue;
        };
        let read_only = mount.rw.map(|rw| !rw).unwrap_or(false);
        match mount.typ {
            Some(MountPointTypeEnum::VOLUME) => {
                if let Some(name) = mount.name.clone().filter(|n| !n.is_empty()) {
                    volumes.push(MountSpec::Volume {
                        name,
                        mount_path: destination,
                        read_only,
                    });
                }
            }
            Some(MountPointTypeEnum::BIND) => {
                if let Some(source) = mount.source.clone().filter(|s| !s.is_empty()) {
                    volumes.push(MountSpec::Bind {
                        host_path: source,
                        mount_path: destination,
                        read_only,
                    });
                }
            }
            _ => {}
        }
    }
    descriptor.volumes = volumes;

    if let Some(networks) = response
        .network_settings
        .as_ref()
        .and_then(|n| n.networks.as_ref())
    {
        let mut names: Vec<String> = networks.keys().cloned().collect();
        names.sort();
        descriptor.networks = names;
    }

    if let Some(host_config) = &response.host_config {
        if let Some(policy) = host_config
            .restart_policy
            .as_ref()
            .and_then(|p| p.name.as_ref())
        {
            descriptor.restart_policy = policy.to_string();
        }
        descriptor.cpu_limit = host_config
            .nano_cpus
            .filter(|n| *n > 0)
            .map(format_cpu);
        descriptor.memory_limit = host_config.memory.filter(|m| *m > 0).map(format_memory);
    }

    descriptor.healthcheck_endpoint = resolver
        .resolve(&descriptor.image_tag)
        .endpoint()
        .map(str::to_string);

    descriptor.validate()?;
    Ok(descriptor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::{
        ContainerConfig, HostConfig, MountPoint, NetworkSettings, PortBinding, RestartPolicy,
        RestartPolicyNameEnum,
    };
    use std::collections::HashMap;

    fn sample_inspect() -> ContainerInspectResponse {
        ContainerInspectResponse {
            name: Some("/grafana".to_string()),
            config: Some(ContainerConfig {
                image: Some("grafana/grafana:10.4.0".to_string()),
                env: Some(vec![
                    "GF_SECURITY_ADMIN_USER=admin".to_string(),
                    "TZ=Europe/Warsaw".to_string(),
                ]),
                labels: Some(HashMap::from([(
                    "maintainer".to_string(),
                    "ops".to_string(),
                )])),
                ..Default::default()
            }),
            host_config: Some(HostConfig {
                restart_policy: Some(RestartPolicy {
                    name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                    maximum_retry_count: None,
                }),
                nano_cpus: Some(500_000_000),
                memory: Some(512 * 1024 * 1024),
                ..Default::default()
            }),
            mounts: Some(vec![
                MountPoint {
                    typ: Some(MountPointTypeEnum::VOLUME),
                    name: Some("grafana-data".to_string()),
                    destination: Some("/var/lib/grafana".to_string()),
                    rw: Some(true),
                    ..Default::default()
                },
                MountPoint {
                    typ: Some(MountPointTypeEnum::BIND),
                    source: Some("/srv/dashboards".to_string()),
                    destination: Some("/etc/grafana/dashboards".to_string()),
                    rw: Some(false),
                    ..Default::default()
                },
            ]),
            network_settings: Some(NetworkSettings {
                ports: Some(HashMap::from([(
                    "3000/tcp".to_string(),
                    Some(vec![PortBinding {
                        host_ip: Some("0.0.0.0".to_string()),
                        host_port: Some("3000".to_string()),
                    }]),
                )])),
                networks: Some(HashMap::from([(
                    "bridge".to_string(),
                    Default::default(),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn full_fidelity_derivation() {
        let resolver = HealthResolver::built_in();
        let desc = descriptor_from_inspect(&sample_inspect(), &resolver).unwrap();

        assert_eq!(desc.container_name, "grafana");
        assert_eq!(desc.image_tag, "grafana/grafana:10.4.0");
        assert_eq!(
            desc.environment,
            vec!["GF_SECURITY_ADMIN_USER=admin", "TZ=Europe/Warsaw"]
        );
        assert_eq!(
            desc.port_bindings.get("3000").map(String::as_str),
            Some("3000")
        );
        assert_eq!(desc.volumes.len(), 2);
        assert_eq!(
            desc.volumes[0],
            MountSpec::Volume {
                name: "grafana-data".to_string(),
                mount_path: "/var/lib/grafana".to_string(),
                read_only: false,
            }
        );
        assert_eq!(
            desc.volumes[1],
            MountSpec::Bind {
                host_path: "/srv/dashboards".to_string(),
                mount_path: "/etc/grafana/dashboards".to_string(),
                read_only: true,
            }
        );
        assert_eq!(desc.networks, vec!["bridge"]);
        assert_eq!(desc.restart_policy, "unless-stopped");
        assert_eq!(desc.cpu_limit.as_deref(), Some("0.5"));
        assert_eq!(desc.memory_limit.as_deref(), Some("512Mi"));
        assert_eq!(desc.healthcheck_endpoint.as_deref(), Some("/api/health"));
    }

    #[test]
    fn non_http_image_leaves_endpoint_empty() {
        let mut response = sample_inspect();
        response.config.as_mut().unwrap().image = Some("redis:7".to_string());
        let desc =
            descriptor_from_inspect(&response, &HealthResolver::built_in()).unwrap();
        assert_eq!(desc.healthcheck_endpoint, None);
    }

    #[test]
    fn cpu_and_memory_formatting() {
        assert_eq!(format_cpu(500_000_000), "0.5");
        assert_eq!(format_cpu(1_000_000_000), "1.0");
        assert_eq!(format_cpu(2_000_000_000), "2.0");
        assert_eq!(format_memory(512 * 1024 * 1024), "512Mi");
        assert_eq!(format_memory(2 * 1024 * 1024 * 1024), "2Gi");
    }

    #[test]
    fn missing_config_is_typed() {
        let response = ContainerInspectResponse {
            name: Some("/x".to_string()),
            ..Default::default()
        };
        let err =
            descriptor_from_inspect(&response, &HealthResolver::built_in()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::MissingField);
    }
}
