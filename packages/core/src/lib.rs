//! # DockerPilot core
//!
//! Engine for deploying, promoting, and migrating Dockerized applications
//! across a dev → staging → prod pipeline and across hosts (the local
//! daemon or SSH-reachable remotes), entirely over the Docker Engine API.
//!
//! The crate is organized around three subsystems:
//!
//! - **Promotion** ([`deploy`]): extracts a running container's state into a
//!   [`descriptor::ContainerDescriptor`], transforms it for the target
//!   environment, optionally backs up its mounts ([`backup`]), and executes
//!   a strategy (quick, rolling, blue-green, canary) with per-stage progress
//!   and cooperative cancellation ([`progress`]).
//! - **Migration** ([`migrate`]): streams a container's image and volume
//!   data from one host's daemon to another's.
//! - **Host abstraction** ([`hosts`]): a registry of SSH-reachable Docker
//!   endpoints with encrypted credentials, resolved on demand into
//!   authenticated clients over the [`docker`] façade.
//!
//! [`pilot::DockerPilot`] ties everything together and is the only type an
//! embedding API layer needs.
//!
//! ## Concurrency
//!
//! Operations serialize per container name through the progress registry's
//! exclusive leases; across names they run in parallel, each owning its own
//! daemon connection. Cancellation is a one-shot latch observed at stage
//! boundaries and inside the long suspension points (builds, pulls, image
//! streams, probe loops).

pub mod backup;
pub mod config;
pub mod deploy;
pub mod descriptor;
pub mod docker;
pub mod error;
pub mod health;
pub mod hosts;
pub mod migrate;
pub mod pilot;
pub mod progress;
pub mod session;

pub use config::ConfigLayout;
pub use deploy::{DeployRequest, Strategy};
pub use descriptor::{ContainerDescriptor, Environment, MountSpec};
pub use error::{ErrorKind, PilotError, Result};
pub use hosts::{AuthKind, AuthSecret, HostRecord};
pub use migrate::MigrateRequest;
pub use pilot::{DockerPilot, PromoteOptions};
pub use progress::{ProgressRecord, Stage};
pub use session::Session;

/// Crate version, surfaced by the CLI.
pub fn get_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
