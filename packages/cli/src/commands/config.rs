//! dockerpilot prepare / import / classify - deployment config handling.

use crate::output;
use anyhow::Result;
use clap::Args;
use console::style;
use dockerpilot_core::{DockerPilot, Environment, Session};

#[derive(Args)]
pub struct PrepareArgs {
    /// Running container to snapshot
    pub container: String,

    /// Target environment (dev/staging/prod)
    pub environment: Environment,
}

#[derive(Args)]
pub struct ImportArgs {
    /// Path to the edited YAML descriptor
    pub path: std::path::PathBuf,

    /// Target environment (dev/staging/prod)
    pub environment: Environment,

    /// Override the container name from the file
    #[arg(long)]
    pub name: Option<String>,
}

#[derive(Args)]
pub struct ClassifyArgs {
    /// Container whose mounts get pre-flighted
    pub container: String,
}

pub async fn prepare(pilot: &DockerPilot, session: &Session, args: PrepareArgs) -> Result<()> {
    let path = pilot
        .prepare_config(session, &args.container, args.environment)
        .await?;
    output::success(&format!("Configuration saved to {}", path.display()));
    Ok(())
}

pub fn import(pilot: &DockerPilot, args: ImportArgs) -> Result<()> {
    let descriptor = pilot.import_config(&args.path, args.environment, args.name.as_deref())?;
    output::success(&format!(
        "Imported config for {} ({})",
        descriptor.container_name, descriptor.image_tag
    ));
    Ok(())
}

pub async fn classify(pilot: &DockerPilot, session: &Session, args: ClassifyArgs) -> Result<()> {
    let report = pilot.classify_backup(session, &args.container).await?;

    println!(
        "requires_sudo: {}",
        if report.requires_sudo {
            style("yes").red().to_string()
        } else {
            style("no").green().to_string()
        }
    );
    match report.total_size_bytes {
        Some(_) => println!(
            "estimated size: {:.2} GiB ({:.3} TiB)",
            report.total_size_gb(),
            report.total_size_tb()
        ),
        None => println!("estimated size: unknown"),
    }
    for path in &report.privileged_paths {
        println!("  privileged: {path}");
    }
    for path in &report.skipped_system_paths {
        println!("  skipped (system path): {path}");
    }
    for mount in &report.large_mounts {
        match mount.size_bytes {
            Some(size) => println!(
                "  large: {} ({:.0} GiB)",
                mount.identifier,
                size as f64 / 1024f64.powi(3)
            ),
            None => println!("  large: {} (size unknown)", mount.identifier),
        }
    }
    if let Some(warning) = &report.warning {
        output::failure(warning);
    }
    Ok(())
}
