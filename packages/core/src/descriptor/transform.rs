//! Environment transforms applied during promotion.

use super::{ContainerDescriptor, Environment};
use tracing::debug;

/// Strip a known environment suffix, if present.
fn strip_env_suffix(name: &str) -> &str {
    for env in Environment::ALL {
        let suffix = env.profile().suffix;
        if !suffix.is_empty() {
            if let Some(base) = name.strip_suffix(suffix) {
                return base;
            }
        }
    }
    name
}

/// Retag `repo:x-ENV` image forms for the target environment. Tags without
/// an environment suffix pass through untouched.
fn retag_for_env(image_tag: &str, target: Environment) -> String {
    let Some((repo, tag)) = image_tag.rsplit_once(':') else {
        return image_tag.to_string();
    };
    let base = strip_env_suffix(tag);
    if base == tag {
        return image_tag.to_string();
    }
    format!("{repo}:{base}{}", target.profile().suffix)
}

/// Apply the target environment's profile to a descriptor.
///
/// Renames the container (strip known suffix, append target suffix), retags
/// suffixed image forms, scales cpu/memory to the profile, and sets replicas.
/// Everything the profile does not cover is preserved as-is.
pub fn transform(descriptor: &ContainerDescriptor, target: Environment) -> ContainerDescriptor {
    let profile = target.profile();
    let base_name = strip_env_suffix(&descriptor.container_name);

    let mut out = descriptor.clone();
    out.container_name = format!("{base_name}{}", profile.suffix);
    out.image_tag = retag_for_env(&descriptor.image_tag, target);
    out.cpu_limit = Some(profile.cpu.to_string());
    out.memory_limit = Some(profile.memory.to_string());
    out.replicas = profile.replicas;

    debug!(
        from = %descriptor.container_name,
        to = %out.container_name,
        env = %target,
        "transformed descriptor"
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dev_to_staging_renames_and_scales() {
        let desc = ContainerDescriptor::new("grafana-dev", "grafana/grafana:10.4.0");
        let out = transform(&desc, Environment::Staging);
        assert_eq!(out.container_name, "grafana-staging");
        assert_eq!(out.cpu_limit.as_deref(), Some("1.0"));
        assert_eq!(out.memory_limit.as_deref(), Some("1Gi"));
        assert_eq!(out.replicas, 2);
        // Unsuffixed image tags are left alone.
        assert_eq!(out.image_tag, "grafana/grafana:10.4.0");
    }

    #[test]
    fn bare_name_gets_target_suffix() {
        let desc = ContainerDescriptor::new("grafana", "grafana/grafana:10.4.0");
        let out = transform(&desc, Environment::Staging);
        assert_eq!(out.container_name, "grafana-staging");
    }

    #[test]
    fn promotion_to_prod_drops_suffix() {
        let desc = ContainerDescriptor::new("myapp-staging", "myapp:latest-staging");
        let out = transform(&desc, Environment::Prod);
        assert_eq!(out.container_name, "myapp");
        assert_eq!(out.image_tag, "myapp:latest");
        assert_eq!(out.cpu_limit.as_deref(), Some("2.0"));
        assert_eq!(out.memory_limit.as_deref(), Some("2Gi"));
        assert_eq!(out.replicas, 3);
    }

    #[test]
    fn suffixed_tag_is_retagged() {
        let desc = ContainerDescriptor::new("myapp-dev", "registry.local/myapp:v3-dev");
        let out = transform(&desc, Environment::Staging);
        assert_eq!(out.image_tag, "registry.local/myapp:v3-staging");
    }

    #[test]
    fn untouched_fields_survive() {
        let mut desc = ContainerDescriptor::new("svc-dev", "svc:1.0");
        desc.environment.push("MODE=fast".to_string());
        desc.port_bindings
            .insert("8080".to_string(), "18080".to_string());
        desc.healthcheck_endpoint = Some("/ready".to_string());
        let out = transform(&desc, Environment::Prod);
        assert_eq!(out.environment, desc.environment);
        assert_eq!(out.port_bindings, desc.port_bindings);
        assert_eq!(out.healthcheck_endpoint.as_deref(), Some("/ready"));
    }
}
