//! Descriptor pipeline: introspection-shaped data through transform and the
//! YAML store must round-trip losslessly.

use dockerpilot_core::descriptor::{transform, yaml, ContainerDescriptor, Environment, MountSpec};

fn grafana_descriptor() -> ContainerDescriptor {
    let mut desc = ContainerDescriptor::new("grafana", "grafana/grafana:10.4.0");
    desc.port_bindings
        .insert("3000".to_string(), "3000".to_string());
    desc.environment
        .push("GF_SECURITY_ADMIN_USER=admin".to_string());
    desc.environment
        .push("GF_INSTALL_PLUGINS=grafana-clock-panel".to_string());
    desc.volumes.push(MountSpec::Volume {
        name: "grafana-data".to_string(),
        mount_path: "/var/lib/grafana".to_string(),
        read_only: false,
    });
    desc.networks.push("bridge".to_string());
    desc.restart_policy = "unless-stopped".to_string();
    desc.healthcheck_endpoint = Some("/api/health".to_string());
    desc
}

#[test]
fn prepare_then_import_equals_direct_transform() {
    let staged = transform(&grafana_descriptor(), Environment::Staging);

    // PrepareConfig writes this YAML; ImportConfig reads it back.
    let written = yaml::to_yaml(&staged).unwrap();
    let imported = yaml::from_yaml(&written).unwrap();

    assert_eq!(imported, staged);
}

#[test]
fn staging_config_carries_profile_values() {
    let staged = transform(&grafana_descriptor(), Environment::Staging);
    let written = yaml::to_yaml(&staged).unwrap();

    assert!(written.contains("container_name: grafana-staging"));
    assert!(written.contains("cpu_limit: '1.0'") || written.contains("cpu_limit: \"1.0\""));
    assert!(written.contains("memory_limit: 1Gi"));
    assert!(written.contains("health_check_endpoint: /api/health"));
}

#[test]
fn reexport_is_byte_identical() {
    let staged = transform(&grafana_descriptor(), Environment::Staging);
    let first = yaml::to_yaml(&staged).unwrap();
    let second = yaml::to_yaml(&yaml::from_yaml(&first).unwrap()).unwrap();
    assert_eq!(first, second);
}

#[test]
fn chained_promotion_is_stable() {
    // dev -> staging -> prod -> staging ends where a direct staging
    // transform would.
    let dev = transform(&grafana_descriptor(), Environment::Dev);
    let staging = transform(&dev, Environment::Staging);
    let prod = transform(&staging, Environment::Prod);
    let back = transform(&prod, Environment::Staging);
    assert_eq!(back, staging);
}

#[test]
fn mount_kinds_survive_the_store() {
    let mut desc = grafana_descriptor();
    desc.volumes.push(MountSpec::Bind {
        host_path: "/srv/provisioning".to_string(),
        mount_path: "/etc/grafana/provisioning".to_string(),
        read_only: true,
    });
    let round = yaml::from_yaml(&yaml::to_yaml(&desc).unwrap()).unwrap();
    assert_eq!(round.volumes, desc.volumes);
}
