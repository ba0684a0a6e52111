//! Host registry and authentication.
//!
//! Persists [`HostRecord`]s with encrypted secrets in `servers.json` and
//! resolves a host id to an [`AuthenticatedClient`]: a live Docker Engine
//! API connection, tunneled over SSH for remote hosts. The reserved id
//! `"local"` maps to the platform daemon socket and is never stored.

mod tunnel;

pub mod secrets;

pub use secrets::{AuthKind, AuthSecret};
pub use tunnel::SshTunnel;

use crate::config::ConfigLayout;
use crate::docker::DockerClient;
use crate::error::{ErrorKind, PilotError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info};

/// Reserved id of the implicit local daemon.
pub const LOCAL_HOST_ID: &str = "local";

/// One Docker endpoint, without secret material.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostRecord {
    pub id: String,
    pub name: String,
    pub hostname: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    pub auth_kind: AuthKind,
    #[serde(default)]
    pub description: String,
    pub created_at: DateTime<Utc>,
}

fn default_ssh_port() -> u16 {
    22
}

impl HostRecord {
    /// Synthetic record for the implicit local daemon.
    fn local() -> Self {
        Self {
            id: LOCAL_HOST_ID.to_string(),
            name: "Local daemon".to_string(),
            hostname: String::new(),
            port: 0,
            username: String::new(),
            auth_kind: AuthKind::Password,
            description: "platform-native Docker socket".to_string(),
            created_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }
}

/// On-disk form: the record plus its sealed secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredHost {
    #[serde(flatten)]
    record: HostRecord,
    secret: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ServersFile {
    servers: Vec<StoredHost>,
}

/// Ephemeral, authenticated handle to one host's daemon.
///
/// Owns the SSH tunnel (if remote) and the registry's in-flight guard for
/// the host id; both are released on drop. Never cached across operations.
pub struct AuthenticatedClient {
    client: DockerClient,
    _tunnel: Option<SshTunnel>,
    _guard: Option<InFlightGuard>,
}

impl AuthenticatedClient {
    pub fn docker(&self) -> &DockerClient {
        &self.client
    }

    pub fn host_id(&self) -> &str {
        self.client.host_label()
    }
}

/// Marks a host id as referenced by an in-flight operation, blocking delete.
struct InFlightGuard {
    id: String,
    in_flight: Arc<Mutex<HashMap<String, usize>>>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut map = self.in_flight.lock().expect("in-flight map poisoned");
        if let Some(count) = map.get_mut(&self.id) {
            *count -= 1;
            if *count == 0 {
                map.remove(&self.id);
            }
        }
    }
}

/// Registry of remote hosts, read-mostly behind one RwLock.
pub struct HostRegistry {
    layout: ConfigLayout,
    hosts: RwLock<Vec<StoredHost>>,
    in_flight: Arc<Mutex<HashMap<String, usize>>>,
}

impl HostRegistry {
    /// Load the registry from `servers.json` (empty if absent).
    pub fn load(layout: ConfigLayout) -> Result<Self> {
        let path = layout.servers_file();
        let hosts = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            let file: ServersFile = serde_json::from_str(&raw)?;
            file.servers
        } else {
            Vec::new()
        };
        debug!(count = hosts.len(), "host registry loaded");
        Ok(Self {
            layout,
            hosts: RwLock::new(hosts),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn persist(&self, hosts: &[StoredHost]) -> Result<()> {
        self.layout.ensure_dirs()?;
        let file = ServersFile {
            servers: hosts.to_vec(),
        };
        std::fs::write(
            self.layout.servers_file(),
            serde_json::to_string_pretty(&file)?,
        )?;
        Ok(())
    }

    /// All records, the implicit local one first. No secrets.
    pub fn list(&self) -> Vec<HostRecord> {
        let hosts = self.hosts.read().expect("host registry poisoned");
        let mut records = vec![HostRecord::local()];
        records.extend(hosts.iter().map(|h| h.record.clone()));
        records
    }

    pub fn get(&self, id: &str) -> Result<HostRecord> {
        if id == LOCAL_HOST_ID {
            return Ok(HostRecord::local());
        }
        let hosts = self.hosts.read().expect("host registry poisoned");
        hosts
            .iter()
            .find(|h| h.record.id == id)
            .map(|h| h.record.clone())
            .ok_or_else(|| PilotError::host_not_found(id))
    }

    /// Create a record. The secret is sealed before it touches disk.
    pub fn create(&self, mut record: HostRecord, secret: AuthSecret) -> Result<()> {
        if record.id == LOCAL_HOST_ID {
            return Err(PilotError::new(
                ErrorKind::Conflict,
                "'local' is reserved for the implicit local daemon",
            ));
        }
        record.auth_kind = secret.kind();
        record.created_at = Utc::now();

        let mut hosts = self.hosts.write().expect("host registry poisoned");
        if hosts.iter().any(|h| h.record.id == record.id) {
            return Err(PilotError::new(
                ErrorKind::Conflict,
                format!("host id '{}' already exists", record.id),
            ));
        }
        let id = record.id.clone();
        hosts.push(StoredHost {
            record,
            secret: secrets::seal(&secret)?,
        });
        self.persist(&hosts)?;
        info!(id, "host created");
        Ok(())
    }

    /// Update a record, optionally replacing its secret.
    pub fn update(&self, id: &str, record: HostRecord, secret: Option<AuthSecret>) -> Result<()> {
        let mut hosts = self.hosts.write().expect("host registry poisoned");
        let stored = hosts
            .iter_mut()
            .find(|h| h.record.id == id)
            .ok_or_else(|| PilotError::host_not_found(id))?;

        let created_at = stored.record.created_at;
        stored.record = record;
        stored.record.id = id.to_string();
        stored.record.created_at = created_at;
        if let Some(secret) = secret {
            stored.record.auth_kind = secret.kind();
            stored.secret = secrets::seal(&secret)?;
        }
        self.persist(&hosts)?;
        info!(id, "host updated");
        Ok(())
    }

    /// Delete a record. Refused while any operation holds a client for it.
    pub fn delete(&self, id: &str) -> Result<()> {
        {
            let in_flight = self.in_flight.lock().expect("in-flight map poisoned");
            if in_flight.get(id).copied().unwrap_or(0) > 0 {
                return Err(PilotError::new(
                    ErrorKind::Conflict,
                    format!("host '{id}' is referenced by an in-flight operation"),
                ));
            }
        }
        let mut hosts = self.hosts.write().expect("host registry poisoned");
        let before = hosts.len();
        hosts.retain(|h| h.record.id != id);
        if hosts.len() == before {
            return Err(PilotError::host_not_found(id));
        }
        self.persist(&hosts)?;
        info!(id, "host deleted");
        Ok(())
    }

    /// Test connectivity for a record + secret without storing anything.
    /// Returns the daemon version after one successful ping.
    pub async fn test(&self, record: &HostRecord, secret: &AuthSecret) -> Result<String> {
        let client = Self::connect(record, secret).await?;
        client
            .docker()
            .ping()
            .await
            .map_err(|e| PilotError::new(ErrorKind::DaemonError, e.to_string()))?;
        let version = client
            .docker()
            .server_version()
            .await
            .map_err(|e| PilotError::new(ErrorKind::DaemonError, e.to_string()))?;
        Ok(version)
    }

    /// Resolve a host id to an authenticated client.
    pub async fn resolve(&self, id: &str) -> Result<AuthenticatedClient> {
        let guard = self.mark_in_flight(id);

        if id == LOCAL_HOST_ID {
            let client = DockerClient::connect_local()
                .map_err(|e| PilotError::new(ErrorKind::DaemonUnavailable, e.to_string()))?;
            return Ok(AuthenticatedClient {
                client,
                _tunnel: None,
                _guard: Some(guard),
            });
        }

        let (record, sealed) = {
            let hosts = self.hosts.read().expect("host registry poisoned");
            let stored = hosts
                .iter()
                .find(|h| h.record.id == id)
                .ok_or_else(|| PilotError::host_not_found(id))?;
            (stored.record.clone(), stored.secret.clone())
        };
        let secret = secrets::open(&sealed)?;

        let mut client = Self::connect(&record, &secret).await?;
        client._guard = Some(guard);
        Ok(client)
    }

    async fn connect(record: &HostRecord, secret: &AuthSecret) -> Result<AuthenticatedClient> {
        let hostname = record.hostname.clone();
        let port = record.port;
        let username = record.username.clone();
        let secret = secret.clone();

        // ssh2 is blocking; the handshake and auth run off the runtime.
        let tunnel = tokio::task::spawn_blocking(move || {
            SshTunnel::open(&hostname, port, &username, &secret)
        })
        .await
        .map_err(|e| PilotError::invariant(format!("tunnel task panicked: {e}")))??;

        let client = DockerClient::connect_tcp(&tunnel.local_addr().to_string(), &record.id)
            .map_err(|e| PilotError::new(ErrorKind::DaemonUnavailable, e.to_string()))?;

        Ok(AuthenticatedClient {
            client,
            _tunnel: Some(tunnel),
            _guard: None,
        })
    }

    fn mark_in_flight(&self, id: &str) -> InFlightGuard {
        let mut map = self.in_flight.lock().expect("in-flight map poisoned");
        *map.entry(id.to_string()).or_insert(0) += 1;
        InFlightGuard {
            id: id.to_string(),
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    /// Host ids currently referenced by operations. Exposed for diagnostics.
    pub fn in_flight_ids(&self) -> HashSet<String> {
        self.in_flight
            .lock()
            .expect("in-flight map poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (tempfile::TempDir, HostRegistry) {
        let tmp = tempfile::tempdir().unwrap();
        let layout = ConfigLayout::rooted_at(tmp.path());
        let registry = HostRegistry::load(layout).unwrap();
        (tmp, registry)
    }

    fn sample_record(id: &str) -> HostRecord {
        HostRecord {
            id: id.to_string(),
            name: format!("Host {id}"),
            hostname: "10.0.0.5".to_string(),
            port: 22,
            username: "deploy".to_string(),
            auth_kind: AuthKind::Password,
            description: String::new(),
            created_at: Utc::now(),
        }
    }

    fn sample_secret() -> AuthSecret {
        AuthSecret::Password {
            password: "s3cret".to_string(),
        }
    }

    #[test]
    fn list_always_includes_local_first() {
        let (_tmp, registry) = registry();
        let records = registry.list();
        assert_eq!(records[0].id, LOCAL_HOST_ID);
    }

    #[test]
    fn create_get_delete_round_trip() {
        let (_tmp, registry) = registry();
        registry
            .create(sample_record("prod-1"), sample_secret())
            .unwrap();
        let record = registry.get("prod-1").unwrap();
        assert_eq!(record.hostname, "10.0.0.5");
        registry.delete("prod-1").unwrap();
        assert_eq!(
            registry.get("prod-1").unwrap_err().kind(),
            ErrorKind::HostNotFound
        );
    }

    #[test]
    fn duplicate_id_is_conflict() {
        let (_tmp, registry) = registry();
        registry
            .create(sample_record("prod-1"), sample_secret())
            .unwrap();
        let err = registry
            .create(sample_record("prod-1"), sample_secret())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn local_id_is_reserved() {
        let (_tmp, registry) = registry();
        let err = registry
            .create(sample_record("local"), sample_secret())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn secrets_are_ciphertext_on_disk() {
        let (tmp, registry) = registry();
        registry
            .create(sample_record("prod-1"), sample_secret())
            .unwrap();
        let raw = std::fs::read_to_string(tmp.path().join("servers.json")).unwrap();
        assert!(!raw.contains("s3cret"));
        assert!(raw.contains("prod-1"));
    }

    #[test]
    fn registry_reloads_from_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = ConfigLayout::rooted_at(tmp.path());
        {
            let registry = HostRegistry::load(layout.clone()).unwrap();
            registry
                .create(sample_record("prod-1"), sample_secret())
                .unwrap();
        }
        let registry = HostRegistry::load(layout).unwrap();
        assert!(registry.get("prod-1").is_ok());
    }

    #[test]
    fn delete_refused_while_in_flight() {
        let (_tmp, registry) = registry();
        registry
            .create(sample_record("prod-1"), sample_secret())
            .unwrap();
        let guard = registry.mark_in_flight("prod-1");
        let err = registry.delete("prod-1").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        drop(guard);
        registry.delete("prod-1").unwrap();
    }

    #[test]
    fn update_preserves_created_at_and_id() {
        let (_tmp, registry) = registry();
        registry
            .create(sample_record("prod-1"), sample_secret())
            .unwrap();
        let original = registry.get("prod-1").unwrap();

        let mut changed = sample_record("should-be-ignored");
        changed.hostname = "10.0.0.9".to_string();
        registry.update("prod-1", changed, None).unwrap();

        let updated = registry.get("prod-1").unwrap();
        assert_eq!(updated.id, "prod-1");
        assert_eq!(updated.hostname, "10.0.0.9");
        assert_eq!(updated.created_at, original.created_at);
    }
}
