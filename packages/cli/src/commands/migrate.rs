//! dockerpilot migrate - move a container to another host.

use super::{terminal_outcome, wait_for_terminal};
use crate::output;
use anyhow::Result;
use clap::Args;
use dockerpilot_core::{DockerPilot, MigrateRequest};

#[derive(Args)]
pub struct MigrateArgs {
    /// Container to migrate
    pub container: String,

    /// Source host id
    #[arg(long, default_value = "local")]
    pub from: String,

    /// Target host id
    #[arg(long)]
    pub to: String,

    /// Also copy named volume data
    #[arg(long)]
    pub include_data: bool,

    /// Stop the source container after validation
    #[arg(long)]
    pub stop_source: bool,
}

pub async fn run(pilot: &DockerPilot, args: MigrateArgs) -> Result<()> {
    pilot
        .migrate(MigrateRequest {
            container_name: args.container.clone(),
            source_id: args.from.clone(),
            target_id: args.to.clone(),
            include_data: args.include_data,
            stop_source: args.stop_source,
        })
        .await?;

    let bar = output::spinner(&format!(
        "Migrating {} from {} to {}...",
        args.container, args.from, args.to
    ));
    let record = wait_for_terminal(pilot, &args.container, true, &bar).await;
    bar.finish_and_clear();

    match record {
        Some(record) => {
            println!("{}", output::render_record(&args.container, &record));
            terminal_outcome(&record)
        }
        None => {
            output::success(&format!("{} migrated", args.container));
            Ok(())
        }
    }
}
