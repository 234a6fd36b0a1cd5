//! # ctrl-cli
//!
//! Operator command line for the ctrl control plane:
//! - `ctrl validate-config` - load every configured document and report problems
//! - `ctrl db migrate` - bring the ledger schema up to date
//! - `ctrl policy lint/explain/test` - check a policy before rolling it out
//! - `ctrl requests list/held/status/approve/deny/stale` - work the approval queue
//! - `ctrl audit tail` - read the ledger's event trail

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use ctrl_gateway::CtrlConfig;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ctrl", version, about)]
struct Cli {
    /// Settings file (defaults to ./ctrl.toml; missing means defaults).
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the ctrl version.
    Version,
    /// Load servers, policy and risk documents and report every problem.
    ValidateConfig,
    /// Ledger maintenance.
    Db {
        #[command(subcommand)]
        command: commands::db::DbCommands,
    },
    /// Lint, explain and test policies.
    Policy {
        #[command(subcommand)]
        command: commands::policy::PolicyCommands,
    },
    /// Inspect and resolve intercepted requests.
    Requests {
        #[command(subcommand)]
        command: commands::requests::RequestsCommands,
    },
    /// Read the ledger event trail.
    Audit {
        #[command(subcommand)]
        command: commands::audit::AuditCommands,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing()?;

    // Version works without a readable settings file.
    let config = || CtrlConfig::load(cli.config.as_deref());
    match &cli.command {
        Commands::Version => {
            println!("ctrl {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::ValidateConfig => commands::validate::execute(&config()?),
        Commands::Db { command } => commands::db::execute(command, &config()?),
        Commands::Policy { command } => commands::policy::execute(command, &config()?),
        Commands::Requests { command } => commands::requests::execute(command, &config()?),
        Commands::Audit { command } => commands::audit::execute(command, &config()?),
    }
}

fn init_tracing() -> anyhow::Result<()> {
    // Command output goes to stdout; logs stay on stderr and quiet by default.
    let filter = EnvFilter::from_default_env().add_directive("ctrl_gateway=warn".parse()?);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
    Ok(())
}
