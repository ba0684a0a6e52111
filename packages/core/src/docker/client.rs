//! Docker client wrapper with connection handling.

use super::DockerError;
use bollard::Docker;
use tracing::debug;

/// Default connection timeout for daemon requests, seconds.
const CONNECT_TIMEOUT_SECS: u64 = 120;

/// Handle to one Docker Engine API endpoint.
///
/// Wraps a [`bollard::Docker`] connection together with a label describing
/// which host it belongs to. Cheap to clone; the underlying connection pool
/// is shared between clones.
#[derive(Clone)]
pub struct DockerClient {
    docker: Docker,
    host_label: String,
}

impl DockerClient {
    /// Connect to the platform-native local daemon (Unix socket on POSIX,
    /// named pipe on Windows).
    pub fn connect_local() -> Result<Self, DockerError> {
        debug!("Connecting to local Docker daemon");
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| DockerError::Unavailable(e.to_string()))?;
        Ok(Self {
            docker,
            host_label: "local".to_string(),
        })
    }

    /// Connect to a daemon over TCP, used for SSH-forwarded endpoints.
    pub fn connect_tcp(address: &str, host_label: &str) -> Result<Self, DockerError> {
        debug!("Connecting to Docker daemon at tcp://{}", address);
        let docker = Docker::connect_with_http(
            &format!("tcp://{address}"),
            CONNECT_TIMEOUT_SECS,
            bollard::API_DEFAULT_VERSION,
        )
        .map_err(|e| DockerError::Unavailable(e.to_string()))?;
        Ok(Self {
            docker,
            host_label: host_label.to_string(),
        })
    }

    /// Raw bollard handle.
    pub fn inner(&self) -> &Docker {
        &self.docker
    }

    /// The host id this client is bound to (`"local"` or a registry id).
    pub fn host_label(&self) -> &str {
        &self.host_label
    }

    /// One round-trip to the daemon. Used by host tests and resolution.
    pub async fn ping(&self) -> Result<(), DockerError> {
        self.docker.ping().await.map_err(DockerError::from)?;
        Ok(())
    }

    /// Daemon version string, e.g. "27.3.1".
    pub async fn server_version(&self) -> Result<String, DockerError> {
        let version = self.docker.version().await.map_err(DockerError::from)?;
        Ok(version.version.unwrap_or_else(|| "unknown".to_string()))
    }
}

impl std::fmt::Debug for DockerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerClient")
            .field("host", &self.host_label)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_shows_host_label_only() {
        // connect_with_local_defaults does not touch the socket until the
        // first request, so constructing the client offline is fine.
        if let Ok(client) = DockerClient::connect_local() {
            let repr = format!("{client:?}");
            assert!(repr.contains("local"));
        }
    }
}
