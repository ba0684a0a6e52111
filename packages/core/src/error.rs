//! Engine error taxonomy.
//!
//! Every fallible operation in the engine returns a [`PilotError`] carrying
//! one of the closed set of [`ErrorKind`]s. Stage drivers match on the kind,
//! record it in the terminal progress message and the history entry, and the
//! external API layer renders `kind` + message without reading logs.

use thiserror::Error;

/// Closed set of error kinds surfaced by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    // Configuration
    InvalidDescriptor,
    MissingField,
    UnsupportedMount,

    // Resolution
    HostNotFound,
    Unreachable,
    AuthRejected,
    TotpRequired,
    TotpInvalid,

    // Daemon
    DaemonUnavailable,
    DaemonError,
    ImagePullDenied,
    Conflict,
    NotFound,
    IoError,
    Timeout,

    // Operation control
    AlreadyRunning,
    SameHost,
    ElevationRequired,

    // Health
    ProbeFailed,
    ProbeTimeout,

    // Backup
    BackupFailed,
    BackupSkippedPrivileged,
    BackupSkippedLarge,

    // Data migration
    VolumeCopyFailed,
    ManualActionRequired,

    // Internal
    InvariantViolation,
}

impl ErrorKind {
    /// Stable wire name, matching the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidDescriptor => "invalid_descriptor",
            ErrorKind::MissingField => "missing_field",
            ErrorKind::UnsupportedMount => "unsupported_mount",
            ErrorKind::HostNotFound => "host_not_found",
            ErrorKind::Unreachable => "unreachable",
            ErrorKind::AuthRejected => "auth_rejected",
            ErrorKind::TotpRequired => "totp_required",
            ErrorKind::TotpInvalid => "totp_invalid",
            ErrorKind::DaemonUnavailable => "daemon_unavailable",
            ErrorKind::DaemonError => "daemon_error",
            ErrorKind::ImagePullDenied => "image_pull_denied",
            ErrorKind::Conflict => "conflict",
            ErrorKind::NotFound => "not_found",
            ErrorKind::IoError => "io_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::AlreadyRunning => "already_running",
            ErrorKind::SameHost => "same_host",
            ErrorKind::ElevationRequired => "elevation_required",
            ErrorKind::ProbeFailed => "probe_failed",
            ErrorKind::ProbeTimeout => "probe_timeout",
            ErrorKind::BackupFailed => "backup_failed",
            ErrorKind::BackupSkippedPrivileged => "backup_skipped_privileged",
            ErrorKind::BackupSkippedLarge => "backup_skipped_large",
            ErrorKind::VolumeCopyFailed => "volume_copy_failed",
            ErrorKind::ManualActionRequired => "manual_action_required",
            ErrorKind::InvariantViolation => "invariant_violation",
        }
    }

    /// `manual_action_required` is recorded in progress and the operation
    /// proceeds; everything else aborts the current stage.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ErrorKind::ManualActionRequired)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Engine error: a kind from the closed taxonomy plus a human message.
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct PilotError {
    kind: ErrorKind,
    message: String,
}

impl PilotError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn invalid_descriptor(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidDescriptor, message)
    }

    pub fn missing_field(field: &str) -> Self {
        Self::new(ErrorKind::MissingField, format!("missing field: {field}"))
    }

    pub fn host_not_found(id: &str) -> Self {
        Self::new(ErrorKind::HostNotFound, format!("host not found: {id}"))
    }

    pub fn already_running(key: &str) -> Self {
        Self::new(
            ErrorKind::AlreadyRunning,
            format!("an operation for '{key}' is already in progress"),
        )
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvariantViolation, message)
    }
}

impl From<std::io::Error> for PilotError {
    fn from(e: std::io::Error) -> Self {
        Self::new(ErrorKind::IoError, e.to_string())
    }
}

impl From<serde_json::Error> for PilotError {
    fn from(e: serde_json::Error) -> Self {
        Self::new(ErrorKind::IoError, format!("json: {e}"))
    }
}

impl From<serde_yaml::Error> for PilotError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::new(ErrorKind::InvalidDescriptor, format!("yaml: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, PilotError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_wire_names_are_snake_case() {
        assert_eq!(ErrorKind::AlreadyRunning.as_str(), "already_running");
        assert_eq!(ErrorKind::SameHost.as_str(), "same_host");
        assert_eq!(
            ErrorKind::BackupSkippedPrivileged.as_str(),
            "backup_skipped_privileged"
        );
    }

    #[test]
    fn serde_matches_as_str() {
        let json = serde_json::to_string(&ErrorKind::ManualActionRequired).unwrap();
        assert_eq!(json, "\"manual_action_required\"");
    }

    #[test]
    fn manual_action_required_is_non_fatal() {
        assert!(!ErrorKind::ManualActionRequired.is_fatal());
        assert!(ErrorKind::VolumeCopyFailed.is_fatal());
    }

    #[test]
    fn display_includes_kind_and_message() {
        let err = PilotError::already_running("grafana");
        assert!(err.to_string().starts_with("already_running:"));
        assert!(err.to_string().contains("grafana"));
    }
}
