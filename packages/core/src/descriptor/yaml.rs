//! Descriptor file format.
//!
//! Descriptors persist as YAML with a single top-level `deployment:` key.
//! `port_mapping` maps host port to container port, both as strings;
//! `volumes` maps a volume name or host path to either the container path
//! (read-write) or a `{bind, mode}` object. The emission order is fixed so
//! that `from_yaml` followed by `to_yaml` reproduces the input byte for byte
//! on any descriptor this engine creates.

use super::{ContainerDescriptor, MountSpec};
use crate::error::{PilotError, Result};
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;

fn str_value(s: &str) -> Value {
    Value::String(s.to_string())
}

/// Serialize a descriptor to the `deployment:` YAML document.
pub fn to_yaml(descriptor: &ContainerDescriptor) -> Result<String> {
    let mut deployment = Mapping::new();

    deployment.insert(str_value("image_tag"), str_value(&descriptor.image_tag));
    deployment.insert(
        str_value("container_name"),
        str_value(&descriptor.container_name),
    );
    if let Some(command) = &descriptor.command {
        deployment.insert(str_value("command"), str_value(command));
    }
    if let Some(entrypoint) = &descriptor.entrypoint {
        deployment.insert(str_value("entrypoint"), str_value(entrypoint));
    }

    // host port -> container port, ordered by container port internally so
    // re-exports are stable.
    let mut port_mapping = Mapping::new();
    for (container_port, host_port) in &descriptor.port_bindings {
        port_mapping.insert(str_value(host_port), str_value(container_port));
    }
    deployment.insert(str_value("port_mapping"), Value::Mapping(port_mapping));

    let mut environment = Mapping::new();
    for entry in &descriptor.environment {
        let (key, value) = entry.split_once('=').unwrap_or((entry.as_str(), ""));
        environment.insert(str_value(key), str_value(value));
    }
    deployment.insert(str_value("environment"), Value::Mapping(environment));

    let mut volumes = Mapping::new();
    for mount in &descriptor.volumes {
        let (identifier, mount_path, read_only) = match mount {
            MountSpec::Volume {
                name,
                mount_path,
                read_only,
            } => (name, mount_path, *read_only),
            MountSpec::Bind {
                host_path,
                mount_path,
                read_only,
            } => (host_path, mount_path, *read_only),
        };
        let value = if read_only {
            let mut object = Mapping::new();
            object.insert(str_value("bind"), str_value(mount_path));
            object.insert(str_value("mode"), str_value("ro"));
            Value::Mapping(object)
        } else {
            str_value(mount_path)
        };
        volumes.insert(str_value(identifier), value);
    }
    deployment.insert(str_value("volumes"), Value::Mapping(volumes));

    deployment.insert(
        str_value("networks"),
        Value::Sequence(descriptor.networks.iter().map(|n| str_value(n)).collect()),
    );
    deployment.insert(
        str_value("restart_policy"),
        str_value(&descriptor.restart_policy),
    );
    if let Some(cpu) = &descriptor.cpu_limit {
        deployment.insert(str_value("cpu_limit"), str_value(cpu));
    }
    if let Some(memory) = &descriptor.memory_limit {
        deployment.insert(str_value("memory_limit"), str_value(memory));
    }
    deployment.insert(
        str_value("replicas"),
        Value::Number(descriptor.replicas.into()),
    );
    if !descriptor.labels.is_empty() {
        let mut labels = Mapping::new();
        for (key, value) in &descriptor.labels {
            labels.insert(str_value(key), str_value(value));
        }
        deployment.insert(str_value("labels"), Value::Mapping(labels));
    }

    deployment.insert(
        str_value("health_check_endpoint"),
        match &descriptor.healthcheck_endpoint {
            Some(endpoint) => str_value(endpoint),
            None => Value::Null,
        },
    );
    deployment.insert(
        str_value("health_check_timeout"),
        Value::Number(descriptor.healthcheck_timeout.into()),
    );
    deployment.insert(
        str_value("health_check_retries"),
        Value::Number(descriptor.healthcheck_retries.into()),
    );

    let mut document = Mapping::new();
    document.insert(str_value("deployment"), Value::Mapping(deployment));
    Ok(serde_yaml::to_string(&Value::Mapping(document))?)
}

fn require_str(map: &Mapping, key: &str) -> Result<String> {
    map.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| PilotError::missing_field(key))
}

fn optional_str(map: &Mapping, key: &str) -> Option<String> {
    map.get(key).and_then(Value::as_str).map(str::to_string)
}

fn optional_u64(map: &Mapping, key: &str) -> Option<u64> {
    map.get(key).and_then(Value::as_u64)
}

/// Value of a YAML scalar as a string: quoted scalars stay as-is, bare
/// numbers are re-rendered. Port maps written by hand often use bare ints.
fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parse a `deployment:` YAML document back into a descriptor.
pub fn from_yaml(input: &str) -> Result<ContainerDescriptor> {
    let document: Value = serde_yaml::from_str(input)?;
    let deployment = document
        .get("deployment")
        .and_then(Value::as_mapping)
        .ok_or_else(|| PilotError::invalid_descriptor("missing top-level 'deployment' mapping"))?;

    let mut descriptor = ContainerDescriptor::new(
        require_str(deployment, "container_name")?,
        require_str(deployment, "image_tag")?,
    );
    descriptor.command = optional_str(deployment, "command");
    descriptor.entrypoint = optional_str(deployment, "entrypoint");

    let mut port_bindings = BTreeMap::new();
    if let Some(ports) = deployment.get("port_mapping").and_then(Value::as_mapping) {
        for (host, container) in ports {
            let host = scalar_to_string(host)
                .ok_or_else(|| PilotError::invalid_descriptor("port_mapping keys must be scalars"))?;
            let container = scalar_to_string(container).ok_or_else(|| {
                PilotError::invalid_descriptor("port_mapping values must be scalars")
            })?;
            port_bindings.insert(container, host);
        }
    }
    descriptor.port_bindings = port_bindings;

    let mut environment = Vec::new();
    if let Some(env) = deployment.get("environment").and_then(Value::as_mapping) {
        for (key, value) in env {
            let key = scalar_to_string(key)
                .ok_or_else(|| PilotError::invalid_descriptor("environment keys must be scalars"))?;
            let value = scalar_to_string(value).unwrap_or_default();
            environment.push(format!("{key}={value}"));
        }
    }
    descriptor.environment = environment;

    let mut volumes = Vec::new();
    if let Some(mounts) = deployment.get("volumes").and_then(Value::as_mapping) {
        for (identifier, value) in mounts {
            let identifier = scalar_to_string(identifier)
                .ok_or_else(|| PilotError::invalid_descriptor("volume keys must be scalars"))?;
            let (mount_path, read_only) = match value {
                Value::String(path) => (path.clone(), false),
                Value::Mapping(object) => {
                    let bind = require_str(object, "bind")?;
                    let mode = optional_str(object, "mode").unwrap_or_else(|| "rw".to_string());
                    (bind, mode == "ro")
                }
                _ => {
                    return Err(PilotError::invalid_descriptor(format!(
                        "volume '{identifier}' must map to a path or a bind/mode object"
                    )))
                }
            };
            // Absolute keys are host paths; anything else names a volume.
            let mount = if identifier.starts_with('/') {
                MountSpec::Bind {
                    host_path: identifier,
                    mount_path,
                    read_only,
                }
            } else {
                MountSpec::Volume {
                    name: identifier,
                    mount_path,
                    read_only,
                }
            };
            volumes.push(mount);
        }
    }
    descriptor.volumes = volumes;

    if let Some(networks) = deployment.get("networks").and_then(Value::as_sequence) {
        descriptor.networks = networks
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect();
    }
    if let Some(policy) = optional_str(deployment, "restart_policy") {
        descriptor.restart_policy = policy;
    }
    descriptor.cpu_limit = optional_str(deployment, "cpu_limit");
    descriptor.memory_limit = optional_str(deployment, "memory_limit");
    if let Some(replicas) = optional_u64(deployment, "replicas") {
        descriptor.replicas = replicas as u32;
    }
    if let Some(labels) = deployment.get("labels").and_then(Value::as_mapping) {
        descriptor.labels = labels
            .iter()
            .filter_map(|(k, v)| Some((k.as_str()?.to_string(), v.as_str()?.to_string())))
            .collect();
    }

    // An explicit `health_check_endpoint: null` disables HTTP probing; an
    // absent key falls back to the default endpoint.
    descriptor.healthcheck_endpoint = match deployment.get("health_check_endpoint") {
        Some(Value::Null) => None,
        Some(value) => Some(value.as_str().map(str::to_string).ok_or_else(|| {
            PilotError::invalid_descriptor("health_check_endpoint must be a string")
        })?),
        None => descriptor.healthcheck_endpoint,
    };
    if let Some(timeout) = optional_u64(deployment, "health_check_timeout") {
        descriptor.healthcheck_timeout = timeout;
    }
    if let Some(retries) = optional_u64(deployment, "health_check_retries") {
        descriptor.healthcheck_retries = retries as u32;
    }

    descriptor.validate()?;
    Ok(descriptor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{transform, Environment};

    fn sample() -> ContainerDescriptor {
        let mut desc = ContainerDescriptor::new("grafana", "grafana/grafana:10.4.0");
        desc.port_bindings
            .insert("3000".to_string(), "3000".to_string());
        desc.environment
            .push("GF_SECURITY_ADMIN_USER=admin".to_string());
        desc.environment.push("TZ=Europe/Warsaw".to_string());
        desc.volumes.push(MountSpec::Volume {
            name: "grafana-data".to_string(),
            mount_path: "/var/lib/grafana".to_string(),
            read_only: false,
        });
        desc.volumes.push(MountSpec::Bind {
            host_path: "/srv/dashboards".to_string(),
            mount_path: "/etc/grafana/dashboards".to_string(),
            read_only: true,
        });
        desc.networks.push("bridge".to_string());
        desc.restart_policy = "unless-stopped".to_string();
        desc.healthcheck_endpoint = Some("/api/health".to_string());
        desc
    }

    #[test]
    fn round_trip_is_identity() {
        let original = sample();
        let yaml = to_yaml(&original).unwrap();
        let parsed = from_yaml(&yaml).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn re_export_is_byte_identical() {
        let yaml = to_yaml(&sample()).unwrap();
        let reparsed = from_yaml(&yaml).unwrap();
        assert_eq!(to_yaml(&reparsed).unwrap(), yaml);
    }

    #[test]
    fn environment_order_survives() {
        let yaml = to_yaml(&sample()).unwrap();
        let parsed = from_yaml(&yaml).unwrap();
        assert_eq!(
            parsed.environment,
            vec!["GF_SECURITY_ADMIN_USER=admin", "TZ=Europe/Warsaw"]
        );
    }

    #[test]
    fn port_mapping_is_host_to_container() {
        let mut desc = ContainerDescriptor::new("web", "web:1");
        desc.port_bindings
            .insert("3000".to_string(), "8080".to_string());
        let yaml = to_yaml(&desc).unwrap();
        assert!(yaml.contains("'8080': '3000'") || yaml.contains("\"8080\": \"3000\""));
        let parsed = from_yaml(&yaml).unwrap();
        assert_eq!(
            parsed.port_bindings.get("3000").map(String::as_str),
            Some("8080")
        );
    }

    #[test]
    fn explicit_null_endpoint_disables_probe() {
        let yaml =
            "deployment:\n  image_tag: redis:7\n  container_name: cache\n  health_check_endpoint: null\n";
        let parsed = from_yaml(yaml).unwrap();
        assert_eq!(parsed.healthcheck_endpoint, None);
    }

    #[test]
    fn bare_integer_ports_are_accepted() {
        let yaml =
            "deployment:\n  image_tag: web:1\n  container_name: web\n  port_mapping:\n    8080: 80\n";
        let parsed = from_yaml(yaml).unwrap();
        assert_eq!(
            parsed.port_bindings.get("80").map(String::as_str),
            Some("8080")
        );
    }

    #[test]
    fn transformed_descriptor_round_trips() {
        let staged = transform(&sample(), Environment::Staging);
        let yaml = to_yaml(&staged).unwrap();
        let parsed = from_yaml(&yaml).unwrap();
        assert_eq!(parsed, staged);
        assert!(yaml.contains("container_name: grafana-staging"));
        assert!(yaml.contains("health_check_endpoint: /api/health"));
    }

    #[test]
    fn missing_required_fields_are_typed() {
        let yaml = "deployment:\n  image_tag: web:1\n";
        let err = from_yaml(yaml).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::MissingField);
    }
}
