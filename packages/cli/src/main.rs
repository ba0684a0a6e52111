//! dockerpilot CLI - deploy, promote, and migrate Dockerized applications.

mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use dockerpilot_core::{ConfigLayout, DockerPilot, Session};
use tracing_subscriber::EnvFilter;

/// Deploy, promote, and migrate Dockerized applications
#[derive(Parser)]
#[command(name = "dockerpilot")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Deploy, promote, and migrate Dockerized applications", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Increase verbosity level
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Operate against this host id instead of the local daemon
    #[arg(long, global = true)]
    host: Option<String>,

    /// Config root override (default: platform config dir)
    #[arg(long, global = true)]
    config_root: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage remote hosts
    Hosts {
        #[command(subcommand)]
        command: commands::hosts::HostsCommand,
    },

    /// Show container status per environment
    Env(commands::env::EnvArgs),

    /// Prepare a deployment config from a running container
    Prepare(commands::config::PrepareArgs),

    /// Import an edited deployment config
    Import(commands::config::ImportArgs),

    /// Pre-flight a container's backup (sudo / size warnings)
    Classify(commands::config::ClassifyArgs),

    /// Promote containers between environments
    Promote(commands::promote::PromoteArgs),

    /// Migrate a container to another host
    Migrate(commands::migrate::MigrateArgs),

    /// Cancel a running promotion or migration
    Cancel(commands::progress::CancelArgs),

    /// Show progress of running operations
    Progress(commands::progress::ProgressArgs),

    /// Show deployment history
    History(commands::history::HistoryArgs),
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("dockerpilot_core={default},dockerpilot={default}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let layout = match &cli.config_root {
        Some(root) => ConfigLayout::rooted_at(root),
        None => ConfigLayout::default_root(),
    };
    let pilot = DockerPilot::new(layout)?;
    let session = Session::new();
    if let Some(host) = &cli.host {
        pilot.select_host(&session, host)?;
    }

    match cli.command {
        Commands::Hosts { command } => commands::hosts::run(&pilot, command).await,
        Commands::Env(args) => commands::env::run(&pilot, &session, args).await,
        Commands::Prepare(args) => commands::config::prepare(&pilot, &session, args).await,
        Commands::Import(args) => commands::config::import(&pilot, args),
        Commands::Classify(args) => commands::config::classify(&pilot, &session, args).await,
        Commands::Promote(args) => commands::promote::run(&pilot, &session, args).await,
        Commands::Migrate(args) => commands::migrate::run(&pilot, args).await,
        Commands::Cancel(args) => commands::progress::cancel(&pilot, args),
        Commands::Progress(args) => commands::progress::show(&pilot, args),
        Commands::History(args) => commands::history::run(&pilot, args),
    }
}
