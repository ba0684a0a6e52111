//! dockerpilot env - per-environment container status.

use anyhow::Result;
use clap::Args;
use console::style;
use dockerpilot_core::{DockerPilot, Session};

#[derive(Args)]
pub struct EnvArgs {
    /// Show only this environment (dev/staging/prod)
    #[arg(long)]
    pub only: Option<String>,
}

pub async fn run(pilot: &DockerPilot, session: &Session, args: EnvArgs) -> Result<()> {
    let filter: Option<dockerpilot_core::Environment> = match &args.only {
        Some(raw) => Some(raw.parse()?),
        None => None,
    };

    for status in pilot.inspect_environments(session).await? {
        if let Some(only) = filter {
            if status.environment != only {
                continue;
            }
        }
        println!(
            "{}: {}/{} running",
            style(status.environment.as_str().to_uppercase()).bold(),
            status.running,
            status.total
        );
        for container in &status.containers {
            let state = if container.state == "running" {
                style(container.state.as_str()).green()
            } else {
                style(container.state.as_str()).yellow()
            };
            println!("  {:<28} {:<40} {state}", container.name, container.image);
        }
        if status.containers.is_empty() {
            println!("  {}", style("no containers").dim());
        }
    }
    Ok(())
}
