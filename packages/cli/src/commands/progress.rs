//! dockerpilot progress / cancel - observe and stop running operations.

use crate::output;
use anyhow::Result;
use clap::Args;
use dockerpilot_core::DockerPilot;

#[derive(Args)]
pub struct ProgressArgs {
    /// Show only this container's operation
    pub container: Option<String>,

    /// Show migrations instead of deployments
    #[arg(long)]
    pub migrations: bool,
}

#[derive(Args)]
pub struct CancelArgs {
    /// Container whose operation to cancel
    pub container: String,

    /// Cancel a migration instead of a deployment
    #[arg(long)]
    pub migration: bool,
}

pub fn show(pilot: &DockerPilot, args: ProgressArgs) -> Result<()> {
    let records = if args.migrations {
        pilot.migration_progress(args.container.as_deref())
    } else {
        pilot.get_progress(args.container.as_deref())
    };
    if records.is_empty() {
        output::note("no active operations");
        return Ok(());
    }
    for (key, record) in records {
        println!("{}", output::render_record(&key, &record));
    }
    Ok(())
}

pub fn cancel(pilot: &DockerPilot, args: CancelArgs) -> Result<()> {
    if args.migration {
        pilot.cancel_migration(&args.container)?;
    } else {
        pilot.cancel(&args.container)?;
    }
    output::success(&format!(
        "Cancellation requested for {}; the operation stops at its next checkpoint",
        args.container
    ));
    Ok(())
}
