//! Docker Engine API façade.
//!
//! Everything the engine needs from a daemon, over bollard:
//! - client wrapper with local and TCP (SSH-forwarded) connections
//! - container lifecycle (create/start/stop/remove/rename/inspect/list)
//! - image operations (build/pull/tag/remove/save/load)
//! - volume operations and the ephemeral helper runner
//! - typed daemon errors

mod client;
mod error;

pub mod container;
pub mod image;
pub mod volume;

pub use client::DockerClient;
pub use error::DockerError;
pub use volume::{EphemeralOutcome, HELPER_IMAGE};
