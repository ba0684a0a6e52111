//! dockerpilot promote - move containers up the pipeline.

use super::{terminal_outcome, wait_for_terminal};
use crate::output;
use anyhow::{bail, Result};
use clap::Args;
use console::Term;
use dockerpilot_core::{DockerPilot, Environment, PromoteOptions, Session};

#[derive(Args)]
pub struct PromoteArgs {
    /// Source environment (dev/staging/prod)
    pub from: Environment,

    /// Target environment (dev/staging/prod)
    pub to: Environment,

    /// Container to promote; omit with --all
    pub container: Option<String>,

    /// Promote every container with a prepared config for the source env
    #[arg(long)]
    pub all: bool,

    /// Skip the mount backup step
    #[arg(long)]
    pub skip_backup: bool,

    /// Strategy override (quick/rolling/blue-green/canary)
    #[arg(long)]
    pub strategy: Option<dockerpilot_core::Strategy>,

    /// Build the image from this Dockerfile directory instead of pulling
    #[arg(long)]
    pub build_context: Option<std::path::PathBuf>,

    /// Prompt for an elevation secret before starting (needed for
    /// privileged bind mounts)
    #[arg(long)]
    pub sudo: bool,
}

pub async fn run(pilot: &DockerPilot, session: &Session, args: PromoteArgs) -> Result<()> {
    if args.sudo {
        eprint!("Elevation secret: ");
        let secret = Term::stdout().read_secure_line()?;
        pilot.set_elevation_secret(session, &secret);
    }

    if args.all {
        return promote_all(pilot, session, &args).await;
    }

    let Some(container) = &args.container else {
        bail!("specify a container name or use --all");
    };
    pilot
        .promote_one(
            session,
            args.from,
            args.to,
            container,
            PromoteOptions {
                skip_backup: args.skip_backup,
                strategy: args.strategy,
                build_context: args.build_context.clone(),
            },
        )
        .await?;

    let bar = output::spinner(&format!("Promoting {container}..."));
    let record = wait_for_terminal(pilot, container, false, &bar).await;
    bar.finish_and_clear();

    match record {
        Some(record) => {
            println!("{}", output::render_record(container, &record));
            terminal_outcome(&record)
        }
        None => {
            output::success(&format!("{container} promoted"));
            Ok(())
        }
    }
}

async fn promote_all(pilot: &DockerPilot, session: &Session, args: &PromoteArgs) -> Result<()> {
    let started = pilot
        .promote_all(session, args.from, args.to, args.skip_backup)
        .await?;

    let mut keys = Vec::new();
    for (name, outcome) in started {
        match outcome {
            Ok(()) => keys.push(name),
            Err(e) => output::failure(&format!("{name}: {e}")),
        }
    }
    if keys.is_empty() {
        bail!("no promotions started");
    }

    let bar = output::spinner(&format!("Promoting {} container(s)...", keys.len()));
    let mut failures = 0;
    for key in &keys {
        if let Some(record) = wait_for_terminal(pilot, key, false, &bar).await {
            bar.println(output::render_record(key, &record));
            if terminal_outcome(&record).is_err() {
                failures += 1;
            }
        }
    }
    bar.finish_and_clear();

    if failures > 0 {
        bail!("{failures}/{} promotion(s) failed", keys.len());
    }
    output::success(&format!("Promoted {} container(s)", keys.len()));
    Ok(())
}
