//! dockerpilot hosts - manage remote Docker hosts.

use crate::output;
use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use console::{style, Term};
use dockerpilot_core::{AuthSecret, DockerPilot, HostRecord};

#[derive(Subcommand)]
pub enum HostsCommand {
    /// List registered hosts
    List,
    /// Add a remote host
    Add(HostAddArgs),
    /// Test connectivity to a registered host
    Test(HostTestArgs),
    /// Remove a host
    Remove(HostRemoveArgs),
}

#[derive(Args)]
pub struct HostAddArgs {
    /// Stable id for this host (e.g. "prod-1")
    pub id: String,

    /// SSH hostname or IP address
    pub hostname: String,

    /// SSH username
    #[arg(short, long)]
    pub user: String,

    /// SSH port
    #[arg(short, long, default_value_t = 22)]
    pub port: u16,

    /// Display name (defaults to the id)
    #[arg(long)]
    pub name: Option<String>,

    /// Description
    #[arg(short, long, default_value = "")]
    pub description: String,

    /// Path to an SSH private key (password auth when omitted)
    #[arg(short = 'i', long)]
    pub identity_file: Option<std::path::PathBuf>,

    /// Prompt for a key passphrase
    #[arg(long)]
    pub passphrase: bool,

    /// Prompt for a TOTP seed in addition to the password
    #[arg(long)]
    pub totp: bool,

    /// Skip connection verification
    #[arg(long)]
    pub no_verify: bool,
}

#[derive(Args)]
pub struct HostTestArgs {
    /// Host id to test
    pub id: String,
}

#[derive(Args)]
pub struct HostRemoveArgs {
    /// Host id to remove
    pub id: String,
}

pub async fn run(pilot: &DockerPilot, command: HostsCommand) -> Result<()> {
    match command {
        HostsCommand::List => list(pilot),
        HostsCommand::Add(args) => add(pilot, args).await,
        HostsCommand::Test(args) => test(pilot, args).await,
        HostsCommand::Remove(args) => remove(pilot, args),
    }
}

fn list(pilot: &DockerPilot) -> Result<()> {
    for record in pilot.list_hosts() {
        let target = if record.hostname.is_empty() {
            "platform daemon socket".to_string()
        } else {
            format!("{}@{}:{}", record.username, record.hostname, record.port)
        };
        println!(
            "{:<12} {:<24} {} ({})",
            style(&record.id).cyan().bold(),
            record.name,
            target,
            record.auth_kind
        );
    }
    Ok(())
}

fn read_secret(prompt: &str) -> Result<String> {
    let term = Term::stdout();
    eprint!("{prompt}: ");
    let secret = term.read_secure_line().context("failed to read secret")?;
    Ok(secret)
}

fn read_line(prompt: &str) -> Result<String> {
    let term = Term::stdout();
    eprint!("{prompt}: ");
    let line = term.read_line().context("failed to read input")?;
    Ok(line.trim().to_string())
}

fn build_secret(args: &HostAddArgs) -> Result<AuthSecret> {
    if let Some(key_path) = &args.identity_file {
        let private_key = std::fs::read_to_string(key_path)
            .with_context(|| format!("reading {}", key_path.display()))?;
        if args.passphrase {
            let passphrase = read_secret("Key passphrase")?;
            Ok(AuthSecret::KeyPassphrase {
                private_key,
                passphrase,
            })
        } else {
            Ok(AuthSecret::Key { private_key })
        }
    } else {
        let password = read_secret("SSH password")?;
        if args.totp {
            let totp_seed = read_secret("TOTP seed (base32)")?;
            Ok(AuthSecret::PasswordTotp {
                password,
                totp_seed,
            })
        } else {
            Ok(AuthSecret::Password { password })
        }
    }
}

async fn add(pilot: &DockerPilot, args: HostAddArgs) -> Result<()> {
    let secret = build_secret(&args)?;
    let record = HostRecord {
        id: args.id.clone(),
        name: args.name.clone().unwrap_or_else(|| args.id.clone()),
        hostname: args.hostname.clone(),
        port: args.port,
        username: args.user.clone(),
        auth_kind: secret.kind(),
        description: args.description.clone(),
        created_at: chrono::Utc::now(),
    };

    if !args.no_verify {
        let bar = output::spinner(&format!("Testing connection to {}...", args.hostname));
        match pilot.test_host(&record, &secret).await {
            Ok(version) => {
                bar.finish_with_message(format!(
                    "{} Connected (Docker {version})",
                    style("✓").green()
                ));
            }
            Err(e) => {
                bar.finish_with_message(format!("{} Connection failed", style("✗").red()));
                output::note("Use --no-verify to add the host anyway.");
                bail!("connection verification failed: {e}");
            }
        }
    }

    pilot.create_host(record, secret)?;
    output::success(&format!("Host '{}' added ({})", args.id, args.hostname));
    Ok(())
}

async fn test(pilot: &DockerPilot, args: HostTestArgs) -> Result<()> {
    // Re-prompt for the secret: test never reads stored material silently.
    let record = pilot
        .list_hosts()
        .into_iter()
        .find(|r| r.id == args.id)
        .with_context(|| format!("host '{}' not found", args.id))?;

    use dockerpilot_core::AuthKind;
    let secret = match record.auth_kind {
        AuthKind::Password => AuthSecret::Password {
            password: read_secret("SSH password")?,
        },
        AuthKind::Key => {
            let path = read_line("Path to private key")?;
            AuthSecret::Key {
                private_key: std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {path}"))?,
            }
        }
        AuthKind::KeyPassphrase => {
            let path = read_line("Path to private key")?;
            AuthSecret::KeyPassphrase {
                private_key: std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {path}"))?,
                passphrase: read_secret("Key passphrase")?,
            }
        }
        AuthKind::PasswordTotp => AuthSecret::PasswordTotp {
            password: read_secret("SSH password")?,
            totp_seed: read_secret("TOTP seed (base32)")?,
        },
    };
    let bar = output::spinner(&format!("Testing connection to {}...", record.hostname));
    match pilot.test_host(&record, &secret).await {
        Ok(version) => {
            bar.finish_with_message(format!(
                "{} Connected (Docker {version})",
                style("✓").green()
            ));
            Ok(())
        }
        Err(e) => {
            bar.finish_with_message(format!("{} {e}", style("✗").red()));
            bail!("host test failed");
        }
    }
}

fn remove(pilot: &DockerPilot, args: HostRemoveArgs) -> Result<()> {
    pilot.delete_host(&args.id)?;
    output::success(&format!("Host '{}' removed", args.id));
    Ok(())
}
