//! Engine surface.
//!
//! [`DockerPilot`] wires the registries together and exposes the operation
//! set the external API layer calls. Async operations (promotions and
//! migrations) acquire their progress lease synchronously, so
//! `already_running` reaches the caller directly, and then run in a
//! spawned task; callers poll [`DockerPilot::get_progress`] or subscribe to
//! the per-key push channel.

use crate::backup::{self, BackupClassification};
use crate::config::ConfigLayout;
use crate::deploy::history::{DeploymentHistory, DeploymentHistoryEntry};
use crate::deploy::{DeployRequest, Strategy};
use crate::descriptor::{transform, yaml, ContainerDescriptor, Environment};
use crate::docker::container;
use crate::error::{ErrorKind, PilotError, Result};
use crate::health::HealthResolver;
use crate::hosts::{AuthSecret, HostRecord, HostRegistry, LOCAL_HOST_ID};
use crate::migrate::MigrateRequest;
use crate::progress::{ProgressRecord, ProgressRegistry};
use crate::session::Session;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

/// Per-container summary inside an environment report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerBrief {
    pub name: String,
    pub image: String,
    pub state: String,
}

/// Snapshot of one pipeline environment on the selected host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentStatus {
    pub environment: Environment,
    pub running: usize,
    pub total: usize,
    pub containers: Vec<ContainerBrief>,
}

/// Knobs for a single promotion.
#[derive(Debug, Clone, Default)]
pub struct PromoteOptions {
    pub skip_backup: bool,
    /// Override the per-environment default (rolling, blue-green for prod).
    pub strategy: Option<Strategy>,
    /// Build the image from this Dockerfile directory instead of pulling.
    pub build_context: Option<std::path::PathBuf>,
}

/// The engine. One instance per process; sessions scope per-operator state.
pub struct DockerPilot {
    layout: ConfigLayout,
    hosts: Arc<HostRegistry>,
    deployments: Arc<ProgressRegistry>,
    migrations: Arc<ProgressRegistry>,
    resolver: Arc<HealthResolver>,
    history: Arc<DeploymentHistory>,
}

impl DockerPilot {
    pub fn new(layout: ConfigLayout) -> Result<Self> {
        layout.ensure_dirs()?;
        let hosts = Arc::new(HostRegistry::load(layout.clone())?);
        let resolver = Arc::new(HealthResolver::load(&layout)?);
        let history = Arc::new(DeploymentHistory::new(layout.history_file()));
        info!(root = %layout.root().display(), "engine initialized");
        Ok(Self {
            layout,
            hosts,
            deployments: ProgressRegistry::new(),
            migrations: ProgressRegistry::new(),
            resolver,
            history,
        })
    }

    pub fn layout(&self) -> &ConfigLayout {
        &self.layout
    }

    // ==================== Hosts ====================

    pub fn list_hosts(&self) -> Vec<HostRecord> {
        self.hosts.list()
    }

    pub fn create_host(&self, record: HostRecord, secret: AuthSecret) -> Result<()> {
        self.hosts.create(record, secret)
    }

    pub fn update_host(
        &self,
        id: &str,
        record: HostRecord,
        secret: Option<AuthSecret>,
    ) -> Result<()> {
        self.hosts.update(id, record, secret)
    }

    pub fn delete_host(&self, id: &str) -> Result<()> {
        self.hosts.delete(id)
    }

    /// Open a connection, ping once, and report the daemon version.
    pub async fn test_host(&self, record: &HostRecord, secret: &AuthSecret) -> Result<String> {
        self.hosts.test(record, secret).await
    }

    pub fn select_host(&self, session: &Session, id: &str) -> Result<()> {
        // Validates existence before the session points at it.
        self.hosts.get(id)?;
        session.select_host(id);
        Ok(())
    }

    /// Address health probes use for the given host id.
    fn probe_host_for(&self, host_id: &str) -> String {
        if host_id == LOCAL_HOST_ID {
            "localhost".to_string()
        } else {
            self.hosts
                .get(host_id)
                .map(|record| record.hostname)
                .unwrap_or_else(|_| "localhost".to_string())
        }
    }

    // ==================== Environments & configs ====================

    /// Containers per environment, classified by name suffix.
    pub async fn inspect_environments(&self, session: &Session) -> Result<Vec<EnvironmentStatus>> {
        let client = self.hosts.resolve(&session.selected_host()).await?;
        let summaries = container::list_containers(client.docker(), true, None)
            .await
            .map_err(PilotError::from)?;

        let mut report: Vec<EnvironmentStatus> = Environment::ALL
            .iter()
            .map(|environment| EnvironmentStatus {
                environment: *environment,
                running: 0,
                total: 0,
                containers: Vec::new(),
            })
            .collect();

        for summary in summaries {
            let name = summary
                .names
                .as_ref()
                .and_then(|n| n.first())
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_default();
            if name.is_empty() || name.starts_with("dockerpilot-") {
                continue;
            }
            let environment = classify_environment(&name);
            let state = summary.state.map(|s| s.to_string()).unwrap_or_default();
            let entry = report
                .iter_mut()
                .find(|e| e.environment == environment)
                .expect("all environments present");
            entry.total += 1;
            if state == "running" {
                entry.running += 1;
            }
            entry.containers.push(ContainerBrief {
                name,
                image: summary.image.unwrap_or_default(),
                state,
            });
        }
        Ok(report)
    }

    /// Introspect a running container, transform it for the target
    /// environment, and persist the YAML descriptor.
    pub async fn prepare_config(
        &self,
        session: &Session,
        container_name: &str,
        target_env: Environment,
    ) -> Result<std::path::PathBuf> {
        let client = self.hosts.resolve(&session.selected_host()).await?;
        let descriptor =
            crate::descriptor::inspect::inspect(client.docker(), container_name, &self.resolver)
                .await?;
        let transformed = transform(&descriptor, target_env);

        let path = self
            .layout
            .deployment_config_file(target_env.as_str(), container_name);
        std::fs::write(&path, yaml::to_yaml(&transformed)?)?;
        info!(container = container_name, env = %target_env, path = %path.display(), "config prepared");
        Ok(path)
    }

    /// Import an externally edited descriptor file and store it under the
    /// canonical config path.
    pub fn import_config(
        &self,
        path: &Path,
        target_env: Environment,
        override_container_name: Option<&str>,
    ) -> Result<ContainerDescriptor> {
        let raw = std::fs::read_to_string(path)?;
        let mut descriptor = yaml::from_yaml(&raw)?;
        if let Some(name) = override_container_name {
            descriptor.container_name = name.to_string();
        }
        let stored = self.layout.deployment_config_file(
            target_env.as_str(),
            base_container_name(&descriptor.container_name),
        );
        std::fs::write(&stored, yaml::to_yaml(&descriptor)?)?;
        info!(path = %stored.display(), "config imported");
        Ok(descriptor)
    }

    // ==================== Backup pre-flight & elevation ====================

    /// Pre-flight for the caller's warning flow: sudo requirement, sizes,
    /// large mounts. The engine never prompts; the caller examines this.
    pub async fn classify_backup(
        &self,
        session: &Session,
        container_name: &str,
    ) -> Result<BackupClassification> {
        let client = self.hosts.resolve(&session.selected_host()).await?;
        let descriptor =
            crate::descriptor::inspect::inspect(client.docker(), container_name, &self.resolver)
                .await?;
        backup::classify(client.docker(), &descriptor, backup::DEFAULT_MAX_WALK).await
    }

    pub fn set_elevation_secret(&self, session: &Session, secret: &str) {
        session.set_elevation_secret(secret);
        debug!("elevation secret stored in session");
    }

    pub fn clear_elevation_secret(&self, session: &Session) {
        session.clear_elevation_secret();
    }

    // ==================== Promotion ====================

    /// Promote one container between environments. Returns as soon as the
    /// operation key is leased; progress continues under `container_name`.
    pub async fn promote_one(
        &self,
        session: &Session,
        from_env: Environment,
        to_env: Environment,
        container_name: &str,
        options: PromoteOptions,
    ) -> Result<()> {
        // One engine operation per container name, across deployments and
        // migrations alike.
        if self.key_active(&self.migrations, container_name) {
            return Err(PilotError::already_running(container_name));
        }

        let descriptor = self
            .source_descriptor(session, from_env, container_name)
            .await?;
        let transformed = transform(&descriptor, to_env);
        let strategy = options
            .strategy
            .unwrap_or_else(|| Strategy::default_for(to_env));

        let lease = self.deployments.begin(
            container_name,
            format!("promoting {container_name} from {from_env} to {to_env}"),
        )?;

        let request = DeployRequest {
            strategy,
            descriptor: transformed,
            build_context: options.build_context,
            skip_backup: options.skip_backup,
            cleanup_old_image: true,
            migrate_data: true,
        };
        let hosts = Arc::clone(&self.hosts);
        let history = Arc::clone(&self.history);
        let host_id = session.selected_host();
        let probe_host = self.probe_host_for(&host_id);
        let backups_dir = self.layout.backups_dir();
        let elevation_secret = session.elevation_secret();

        tokio::spawn(async move {
            let client = match hosts.resolve(&host_id).await {
                Ok(client) => client,
                Err(e) => {
                    lease.fail(e.kind(), e.to_string());
                    return;
                }
            };
            crate::deploy::run(
                lease,
                client,
                request,
                history,
                backups_dir,
                elevation_secret,
                probe_host,
            )
            .await;
        });
        Ok(())
    }

    /// Promote every container that has a prepared config for `from_env`.
    /// Returns the keys started; containers whose key is busy are skipped
    /// with their error.
    pub async fn promote_all(
        &self,
        session: &Session,
        from_env: Environment,
        to_env: Environment,
        skip_backup: bool,
    ) -> Result<Vec<(String, Result<()>)>> {
        let containers = self.prepared_containers(from_env)?;
        if containers.is_empty() {
            return Err(PilotError::new(
                ErrorKind::NotFound,
                format!("no deployment configurations found for {from_env}"),
            ));
        }
        let mut results = Vec::new();
        for name in containers {
            let options = PromoteOptions {
                skip_backup,
                ..PromoteOptions::default()
            };
            let outcome = self
                .promote_one(session, from_env, to_env, &name, options)
                .await;
            results.push((name, outcome));
        }
        Ok(results)
    }

    pub fn cancel(&self, container_name: &str) -> Result<()> {
        if self.deployments.cancel(container_name) {
            Ok(())
        } else {
            Err(PilotError::new(
                ErrorKind::NotFound,
                format!("no active deployment for {container_name}"),
            ))
        }
    }

    pub fn get_progress(&self, container_name: Option<&str>) -> Vec<(String, ProgressRecord)> {
        match container_name {
            Some(name) => self
                .deployments
                .get(name)
                .map(|record| vec![(name.to_string(), record)])
                .unwrap_or_default(),
            None => self.deployments.active(),
        }
    }

    /// Push channel for one deployment key.
    pub fn subscribe_progress(&self, container_name: &str) -> Option<watch::Receiver<ProgressRecord>> {
        self.deployments.subscribe(container_name)
    }

    // ==================== Migration ====================

    /// Migrate a container between hosts. `same_host` is rejected before
    /// any progress record exists.
    pub async fn migrate(&self, request: MigrateRequest) -> Result<()> {
        if request.source_id == request.target_id {
            return Err(PilotError::new(
                ErrorKind::SameHost,
                "source and target hosts must be different",
            ));
        }
        // Both ids must resolve to records before anything is spawned.
        self.hosts.get(&request.source_id)?;
        self.hosts.get(&request.target_id)?;
        if self.key_active(&self.deployments, &request.container_name) {
            return Err(PilotError::already_running(&request.container_name));
        }

        let lease = self.migrations.begin(
            &request.container_name,
            format!(
                "migrating {} from {} to {}",
                request.container_name, request.source_id, request.target_id
            ),
        )?;

        let hosts = Arc::clone(&self.hosts);
        let resolver = Arc::clone(&self.resolver);
        let history = Arc::clone(&self.history);
        let probe_host = self.probe_host_for(&request.target_id);

        tokio::spawn(async move {
            let source = match hosts.resolve(&request.source_id).await {
                Ok(client) => client,
                Err(e) => {
                    lease.fail(e.kind(), e.to_string());
                    return;
                }
            };
            let target = match hosts.resolve(&request.target_id).await {
                Ok(client) => client,
                Err(e) => {
                    lease.fail(e.kind(), e.to_string());
                    return;
                }
            };
            crate::migrate::run(lease, request, source, target, probe_host, resolver, history)
                .await;
        });
        Ok(())
    }

    pub fn migration_progress(
        &self,
        container_name: Option<&str>,
    ) -> Vec<(String, ProgressRecord)> {
        match container_name {
            Some(name) => self
                .migrations
                .get(name)
                .map(|record| vec![(name.to_string(), record)])
                .unwrap_or_default(),
            None => self.migrations.active(),
        }
    }

    pub fn cancel_migration(&self, container_name: &str) -> Result<()> {
        if self.migrations.cancel(container_name) {
            Ok(())
        } else {
            Err(PilotError::new(
                ErrorKind::NotFound,
                format!("no active migration for {container_name}"),
            ))
        }
    }

    // ==================== History ====================

    pub fn deployment_history(&self, limit: usize) -> Result<Vec<DeploymentHistoryEntry>> {
        self.history.recent(limit)
    }

    // ==================== Internals ====================

    /// Whether the other registry already runs an operation under this key.
    fn key_active(&self, registry: &ProgressRegistry, key: &str) -> bool {
        registry
            .get(key)
            .map(|record| !record.stage.is_terminal())
            .unwrap_or(false)
    }

    /// The descriptor a promotion starts from: a prepared config when one
    /// exists, otherwise a live introspection of the source container.
    async fn source_descriptor(
        &self,
        session: &Session,
        from_env: Environment,
        container_name: &str,
    ) -> Result<ContainerDescriptor> {
        let config_path = self
            .layout
            .deployment_config_file(from_env.as_str(), container_name);
        if config_path.exists() {
            let raw = std::fs::read_to_string(&config_path)?;
            return yaml::from_yaml(&raw);
        }

        let client = self.hosts.resolve(&session.selected_host()).await?;
        let source_name = {
            let suffixed = format!("{container_name}{}", from_env.profile().suffix);
            if container::container_exists(client.docker(), container_name)
                .await
                .map_err(PilotError::from)?
            {
                container_name.to_string()
            } else {
                suffixed
            }
        };
        crate::descriptor::inspect::inspect(client.docker(), &source_name, &self.resolver).await
    }

    /// Container names with a prepared config for an environment.
    fn prepared_containers(&self, env: Environment) -> Result<Vec<String>> {
        let prefix = format!("deployment-{}-", env.as_str());
        let mut names = Vec::new();
        let dir = self.layout.configs_dir();
        if !dir.exists() {
            return Ok(names);
        }
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().to_string();
            if let Some(rest) = file_name.strip_prefix(&prefix) {
                if let Some(name) = rest.strip_suffix(".yml") {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Which environment a container name belongs to, by suffix convention.
fn classify_environment(name: &str) -> Environment {
    if name.ends_with("-dev") {
        Environment::Dev
    } else if name.ends_with("-staging") {
        Environment::Staging
    } else {
        Environment::Prod
    }
}

/// Container name with any environment suffix removed.
fn base_container_name(name: &str) -> &str {
    name.strip_suffix("-dev")
        .or_else(|| name.strip_suffix("-staging"))
        .unwrap_or(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pilot() -> (tempfile::TempDir, DockerPilot) {
        let tmp = tempfile::tempdir().unwrap();
        let pilot = DockerPilot::new(ConfigLayout::rooted_at(tmp.path())).unwrap();
        (tmp, pilot)
    }

    #[tokio::test]
    async fn same_host_migration_is_rejected_without_progress() {
        let (_tmp, pilot) = pilot();
        let err = pilot
            .migrate(MigrateRequest {
                container_name: "nginx".to_string(),
                source_id: "local".to_string(),
                target_id: "local".to_string(),
                include_data: false,
                stop_source: false,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SameHost);
        assert!(pilot.migration_progress(Some("nginx")).is_empty());
    }

    #[tokio::test]
    async fn migrate_to_unknown_host_is_typed() {
        let (_tmp, pilot) = pilot();
        let err = pilot
            .migrate(MigrateRequest {
                container_name: "nginx".to_string(),
                source_id: "local".to_string(),
                target_id: "ghost".to_string(),
                include_data: false,
                stop_source: false,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HostNotFound);
    }

    #[test]
    fn environment_classification_by_suffix() {
        assert_eq!(classify_environment("app-dev"), Environment::Dev);
        assert_eq!(classify_environment("app-staging"), Environment::Staging);
        assert_eq!(classify_environment("app"), Environment::Prod);
    }

    #[test]
    fn base_name_strips_env_suffixes() {
        assert_eq!(base_container_name("grafana-staging"), "grafana");
        assert_eq!(base_container_name("grafana-dev"), "grafana");
        assert_eq!(base_container_name("grafana"), "grafana");
    }

    #[test]
    fn cancel_unknown_deployment_is_not_found() {
        let (_tmp, pilot) = pilot();
        assert_eq!(
            pilot.cancel("ghost").unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn prepared_containers_scans_config_dir() {
        let (_tmp, pilot) = pilot();
        let dir = pilot.layout().configs_dir();
        std::fs::write(dir.join("deployment-dev-grafana.yml"), "x").unwrap();
        std::fs::write(dir.join("deployment-dev-influx.yml"), "x").unwrap();
        std::fs::write(dir.join("deployment-staging-grafana.yml"), "x").unwrap();
        assert_eq!(
            pilot.prepared_containers(Environment::Dev).unwrap(),
            vec!["grafana", "influx"]
        );
    }

    #[test]
    fn import_config_round_trips_through_store(
    ) {
        let (tmp, pilot) = pilot();
        let descriptor = ContainerDescriptor::new("grafana-staging", "grafana/grafana:10.4.0");
        let source_path = tmp.path().join("incoming.yml");
        std::fs::write(&source_path, yaml::to_yaml(&descriptor).unwrap()).unwrap();

        let imported = pilot
            .import_config(&source_path, Environment::Staging, None)
            .unwrap();
        assert_eq!(imported, descriptor);
        assert!(pilot
            .layout()
            .deployment_config_file("staging", "grafana")
            .exists());
    }
}
