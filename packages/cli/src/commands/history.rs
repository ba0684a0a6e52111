//! dockerpilot history - deployment journal.

use anyhow::Result;
use clap::Args;
use console::style;
use dockerpilot_core::deploy::history::HistoryStatus;
use dockerpilot_core::DockerPilot;

#[derive(Args)]
pub struct HistoryArgs {
    /// Number of entries to show
    #[arg(long, default_value_t = 10)]
    pub limit: usize,
}

pub fn run(pilot: &DockerPilot, args: HistoryArgs) -> Result<()> {
    let entries = pilot.deployment_history(args.limit)?;
    if entries.is_empty() {
        println!("{}", style("no deployments recorded").dim());
        return Ok(());
    }
    for entry in entries {
        let status = match entry.status {
            HistoryStatus::Success => style("success").green(),
            HistoryStatus::Failed => style("failed").red(),
        };
        println!(
            "{} {:<11} {:<24} {:<32} {status} ({:.1}s)",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.strategy,
            entry.container_name,
            entry.image_tag,
            entry.duration_ms as f64 / 1000.0
        );
        if let Some(output) = &entry.output {
            println!("    {}", style(output).dim());
        }
    }
    Ok(())
}
