//! Docker-specific error type.
//!
//! Wraps bollard failures into the small set of daemon error kinds the
//! engine reasons about. HTTP status codes from the daemon are folded here
//! so call sites match on variants, not on status numbers.

use crate::error::{ErrorKind, PilotError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DockerError {
    /// Daemon socket unreachable or transport failure.
    #[error("Docker daemon unavailable: {0}")]
    Unavailable(String),

    /// 404 from the daemon for a container, image, or volume.
    #[error("not found: {0}")]
    NotFound(String),

    /// 409 from the daemon, typically a name already in use.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Registry refused the pull (auth or unknown image).
    #[error("image pull denied: {0}")]
    PullDenied(String),

    /// Image build failed; message carries the build log tail.
    #[error("build failed: {0}")]
    Build(String),

    /// Any other daemon-side error.
    #[error("Docker API error: {0}")]
    Api(String),

    #[error("i/o error: {0}")]
    Io(String),

    #[error("timed out: {0}")]
    Timeout(String),
}

impl DockerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DockerError::Unavailable(_) => ErrorKind::DaemonUnavailable,
            DockerError::NotFound(_) => ErrorKind::NotFound,
            DockerError::Conflict(_) => ErrorKind::Conflict,
            DockerError::PullDenied(_) => ErrorKind::ImagePullDenied,
            DockerError::Build(_) | DockerError::Api(_) => ErrorKind::DaemonError,
            DockerError::Io(_) => ErrorKind::IoError,
            DockerError::Timeout(_) => ErrorKind::Timeout,
        }
    }
}

impl From<bollard::errors::Error> for DockerError {
    fn from(e: bollard::errors::Error) -> Self {
        use bollard::errors::Error as B;
        match e {
            B::DockerResponseServerError {
                status_code: 404,
                message,
            } => DockerError::NotFound(message),
            B::DockerResponseServerError {
                status_code: 409,
                message,
            } => DockerError::Conflict(message),
            B::DockerResponseServerError {
                status_code: 401 | 403,
                message,
            } => DockerError::PullDenied(message),
            B::DockerResponseServerError {
                status_code,
                message,
            } => DockerError::Api(format!("status {status_code}: {message}")),
            B::IOError { err } => DockerError::Unavailable(err.to_string()),
            B::RequestTimeoutError => DockerError::Timeout("daemon request".to_string()),
            other => {
                // Transport-level failures arrive as several bollard variants
                // depending on the connector; classify by message.
                let message = other.to_string();
                let lowered = message.to_lowercase();
                if lowered.contains("connection refused")
                    || lowered.contains("connect error")
                    || lowered.contains("no such file or directory")
                    || lowered.contains("socket")
                {
                    DockerError::Unavailable(message)
                } else {
                    DockerError::Api(message)
                }
            }
        }
    }
}

impl From<DockerError> for PilotError {
    fn from(e: DockerError) -> Self {
        PilotError::new(e.kind(), e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_taxonomy() {
        assert_eq!(DockerError::NotFound("x".into()).kind(), ErrorKind::NotFound);
        assert_eq!(DockerError::Conflict("x".into()).kind(), ErrorKind::Conflict);
        assert_eq!(
            DockerError::Unavailable("x".into()).kind(),
            ErrorKind::DaemonUnavailable
        );
        assert_eq!(
            DockerError::PullDenied("x".into()).kind(),
            ErrorKind::ImagePullDenied
        );
    }

    #[test]
    fn status_codes_fold_into_variants() {
        let e: DockerError = bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "no such container".to_string(),
        }
        .into();
        assert!(matches!(e, DockerError::NotFound(_)));

        let e: DockerError = bollard::errors::Error::DockerResponseServerError {
            status_code: 409,
            message: "name in use".to_string(),
        }
        .into();
        assert!(matches!(e, DockerError::Conflict(_)));
    }

    #[test]
    fn pilot_error_carries_kind() {
        let pe: PilotError = DockerError::Timeout("build".into()).into();
        assert_eq!(pe.kind(), ErrorKind::Timeout);
    }
}
