// db.rs - Ledger maintenance subcommands: migrate.

use anyhow::Context;
use clap::Subcommand;
use ctrl_gateway::CtrlConfig;
use ctrl_ledger::Ledger;

#[derive(Subcommand)]
pub enum DbCommands {
    /// Apply pending schema migrations to the ledger.
    Migrate,
}

pub fn execute(cmd: &DbCommands, config: &CtrlConfig) -> anyhow::Result<()> {
    match cmd {
        DbCommands::Migrate => {
            let applied = migrate(config)?;
            if applied.is_empty() {
                println!("Ledger at {} is up to date.", config.db_path.display());
            } else {
                for id in &applied {
                    println!("applied {}", id);
                }
                println!(
                    "Ledger at {} migrated ({} migration(s)).",
                    config.db_path.display(),
                    applied.len()
                );
            }
        }
    }
    Ok(())
}

fn migrate(config: &CtrlConfig) -> anyhow::Result<Vec<String>> {
    let ledger = Ledger::open(&config.db_path)
        .with_context(|| format!("failed to open ledger at {}", config.db_path.display()))?;
    Ok(ledger.migrate()?)
}
