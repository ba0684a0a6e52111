//! Health-check resolution.
//!
//! Maps an image reference to a probe spec through layered configuration:
//!
//! 1. Per-deployment override (an explicit `health_check_endpoint: null` in
//!    the descriptor disables HTTP probing; handled in the descriptor layer).
//! 2. User overrides from `health-checks-user.yml`.
//! 3. Defaults from `health-checks-defaults.json`, seeded with the built-in
//!    table on first run so operators can edit it.
//! 4. A non-HTTP allow-list of image stems whose readiness is judged from
//!    container state (running ≥ 2 s without a restart).
//! 5. The `/health` fallback.
//!
//! Matching is case-insensitive substring on the image name; when several
//! keys match, the longest one wins. The resolver is pure: swapping the
//! JSON/YAML files is a full re-configuration.

pub mod probe;

use crate::config::ConfigLayout;
use crate::error::Result;
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

/// Built-in endpoint table written into `health-checks-defaults.json` when
/// the file does not exist yet.
const BUILT_IN_DEFAULTS: [(&str, &str); 8] = [
    ("qdrant", "/healthz"),
    ("ollama", "/api/version"),
    ("influxdb", "/ready"),
    ("grafana", "/api/health"),
    ("prometheus", "/-/healthy"),
    ("nextcloud", "/status.php"),
    ("elasticsearch", "/_cluster/health"),
    ("homeassistant", "/"),
];

/// Image stems that never get an HTTP probe.
const NON_HTTP_STEMS: [&str; 9] = [
    "ssh",
    "redis",
    "mariadb",
    "mysql",
    "postgresql",
    "mongodb",
    "db2",
    "rabbitmq",
    "kafka",
];

/// Fallback endpoint when nothing else matches.
pub const FALLBACK_ENDPOINT: &str = "/health";

/// How a deployed container's readiness is judged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthProbe {
    /// HTTP GET on this path must return 200.
    Http(String),
    /// No HTTP probe; ready when running ≥ 2 s without a restart.
    ContainerState,
}

impl HealthProbe {
    pub fn endpoint(&self) -> Option<&str> {
        match self {
            HealthProbe::Http(endpoint) => Some(endpoint),
            HealthProbe::ContainerState => None,
        }
    }
}

/// Layered image-name → probe resolver.
#[derive(Debug, Clone, Default)]
pub struct HealthResolver {
    /// User overrides; `None` value means "no HTTP probe".
    overrides: HashMap<String, Option<String>>,
    defaults: HashMap<String, String>,
}

impl HealthResolver {
    /// Resolver with the built-in defaults only.
    pub fn built_in() -> Self {
        Self {
            overrides: HashMap::new(),
            defaults: BUILT_IN_DEFAULTS
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    /// Load from the config root, seeding the defaults file if absent.
    pub fn load(layout: &ConfigLayout) -> Result<Self> {
        let defaults_path = layout.health_defaults_file();
        let defaults = if defaults_path.exists() {
            let raw = std::fs::read_to_string(&defaults_path)?;
            serde_json::from_str(&raw)?
        } else {
            let seeded: HashMap<String, String> = BUILT_IN_DEFAULTS
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            if let Some(parent) = defaults_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&defaults_path, serde_json::to_string_pretty(&seeded)?)?;
            debug!(path = %defaults_path.display(), "seeded health-check defaults");
            seeded
        };

        let overrides = Self::load_overrides(&layout.health_overrides_file())?;
        Ok(Self { overrides, defaults })
    }

    fn load_overrides(path: &Path) -> Result<HashMap<String, Option<String>>> {
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let raw = std::fs::read_to_string(path)?;
        let parsed: HashMap<String, Option<String>> = serde_yaml::from_str(&raw)?;
        Ok(parsed)
    }

    /// Add or replace a user override. `None` disables HTTP probing for
    /// matching images.
    pub fn set_override(&mut self, image_stem: impl Into<String>, endpoint: Option<String>) {
        self.overrides.insert(image_stem.into(), endpoint);
    }

    /// Longest key in `keys` that is a case-insensitive substring of `image`.
    fn longest_match<'a, I>(image: &str, keys: I) -> Option<&'a str>
    where
        I: Iterator<Item = &'a str>,
    {
        keys.filter(|key| image.contains(&key.to_lowercase()))
            .max_by_key(|key| key.len())
    }

    /// Resolve the probe for an image reference.
    pub fn resolve(&self, image: &str) -> HealthProbe {
        let image = image.to_lowercase();

        if let Some(key) = Self::longest_match(&image, self.overrides.keys().map(String::as_str)) {
            return match &self.overrides[key] {
                Some(endpoint) => HealthProbe::Http(endpoint.clone()),
                None => HealthProbe::ContainerState,
            };
        }

        if let Some(key) = Self::longest_match(&image, self.defaults.keys().map(String::as_str)) {
            return HealthProbe::Http(self.defaults[key].clone());
        }

        if NON_HTTP_STEMS.iter().any(|stem| image.contains(stem)) {
            return HealthProbe::ContainerState;
        }

        HealthProbe::Http(FALLBACK_ENDPOINT.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_images_resolve_to_their_endpoints() {
        let resolver = HealthResolver::built_in();
        assert_eq!(
            resolver.resolve("grafana/grafana:10.4.0"),
            HealthProbe::Http("/api/health".to_string())
        );
        assert_eq!(
            resolver.resolve("qdrant/qdrant:latest"),
            HealthProbe::Http("/healthz".to_string())
        );
        assert_eq!(
            resolver.resolve("influxdb:2.7"),
            HealthProbe::Http("/ready".to_string())
        );
    }

    #[test]
    fn unknown_images_fall_back_to_health() {
        let resolver = HealthResolver::built_in();
        assert_eq!(
            resolver.resolve("my-random-app:1.0"),
            HealthProbe::Http("/health".to_string())
        );
    }

    #[test]
    fn non_http_stems_skip_probing() {
        let resolver = HealthResolver::built_in();
        assert_eq!(resolver.resolve("ssh-jump:2.3"), HealthProbe::ContainerState);
        assert_eq!(resolver.resolve("redis:7"), HealthProbe::ContainerState);
        assert_eq!(
            resolver.resolve("bitnami/rabbitmq:3.13"),
            HealthProbe::ContainerState
        );
    }

    #[test]
    fn matching_is_case_insensitive() {
        let resolver = HealthResolver::built_in();
        assert_eq!(
            resolver.resolve("Grafana/Grafana:10"),
            HealthProbe::Http("/api/health".to_string())
        );
    }

    #[test]
    fn longest_key_wins() {
        let mut resolver = HealthResolver::built_in();
        resolver
            .defaults
            .insert("grafana-oss".to_string(), "/oss-health".to_string());
        assert_eq!(
            resolver.resolve("grafana-oss:9"),
            HealthProbe::Http("/oss-health".to_string())
        );
        // Plain grafana still uses the shorter key.
        assert_eq!(
            resolver.resolve("grafana:9"),
            HealthProbe::Http("/api/health".to_string())
        );
    }

    #[test]
    fn user_override_beats_defaults() {
        let mut resolver = HealthResolver::built_in();
        resolver.set_override("grafana", Some("/custom".to_string()));
        assert_eq!(
            resolver.resolve("grafana:10"),
            HealthProbe::Http("/custom".to_string())
        );
    }

    #[test]
    fn null_override_disables_http() {
        let mut resolver = HealthResolver::built_in();
        resolver.set_override("legacy-app", None);
        assert_eq!(
            resolver.resolve("legacy-app:1"),
            HealthProbe::ContainerState
        );
    }

    #[test]
    fn load_seeds_defaults_file() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = ConfigLayout::rooted_at(tmp.path());
        let resolver = HealthResolver::load(&layout).unwrap();
        assert!(layout.health_defaults_file().exists());
        assert_eq!(
            resolver.resolve("prometheus:v2"),
            HealthProbe::Http("/-/healthy".to_string())
        );

        // Edited defaults are picked up on the next load.
        std::fs::write(
            layout.health_defaults_file(),
            r#"{"prometheus": "/custom-metrics-ok"}"#,
        )
        .unwrap();
        let resolver = HealthResolver::load(&layout).unwrap();
        assert_eq!(
            resolver.resolve("prometheus:v2"),
            HealthProbe::Http("/custom-metrics-ok".to_string())
        );
    }

    #[test]
    fn load_reads_user_overrides() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = ConfigLayout::rooted_at(tmp.path());
        std::fs::create_dir_all(layout.root()).unwrap();
        std::fs::write(
            layout.health_overrides_file(),
            "internal-api: /livez\nbatch-worker: null\n",
        )
        .unwrap();
        let resolver = HealthResolver::load(&layout).unwrap();
        assert_eq!(
            resolver.resolve("registry/internal-api:4"),
            HealthProbe::Http("/livez".to_string())
        );
        assert_eq!(
            resolver.resolve("batch-worker:2"),
            HealthProbe::ContainerState
        );
    }
}
