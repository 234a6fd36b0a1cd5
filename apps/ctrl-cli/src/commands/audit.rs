// audit.rs - Audit subcommands: tail.

use clap::Subcommand;
use ctrl_gateway::CtrlConfig;
use ctrl_ledger::EventRecord;

use super::{open_ledger, truncate};

#[derive(Subcommand)]
pub enum AuditCommands {
    /// Show recent ledger events, oldest first.
    Tail {
        /// Number of events to show.
        #[arg(short, default_value = "20")]
        n: usize,
        /// Only events for this request (shows its whole trail).
        #[arg(long)]
        request: Option<String>,
        /// Print one JSON object per line instead of a table.
        #[arg(long)]
        json: bool,
    },
}

pub fn execute(cmd: &AuditCommands, config: &CtrlConfig) -> anyhow::Result<()> {
    match cmd {
        AuditCommands::Tail { n, request, json } => {
            let ledger = open_ledger(config)?;
            let events = match request {
                Some(id) => ledger.events_for(id)?,
                None => ledger.recent_events(Some(*n))?,
            };

            if events.is_empty() {
                println!("No audit events.");
                return Ok(());
            }

            if *json {
                for event in &events {
                    println!("{}", serde_json::to_string(event)?);
                }
                return Ok(());
            }

            println!(
                "{:<6} {:<20} {:<18} {:<38} PAYLOAD",
                "SEQ", "TIMESTAMP", "KIND", "REQUEST"
            );
            println!("{}", "-".repeat(120));
            for event in &events {
                println!("{}", format_event(event));
            }
        }
    }

    Ok(())
}

fn format_event(event: &EventRecord) -> String {
    format!(
        "{:<6} {:<20} {:<18} {:<38} {}",
        event.seq,
        event.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        event.kind,
        event.request_id.as_deref().unwrap_or("-"),
        truncate(&event.payload.to_string(), 60),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testutil::config_in;
    use ctrl_gateway::Gateway;
    use ctrl_risk::ToolCall;
    use tempfile::TempDir;

    #[test]
    fn tail_shows_request_trail() {
        let dir = TempDir::new().unwrap();
        let config = config_in(dir.path());
        let gateway = Gateway::from_config(&config).unwrap();
        let outcome = gateway
            .intercept(ToolCall::new("db", "delete_table", "prod"))
            .unwrap();

        let ledger = open_ledger(&config).unwrap();
        let trail = ledger.events_for(outcome.request_id()).unwrap();
        let lines: Vec<String> = trail.iter().map(format_event).collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].contains("request.created"));
        assert!(lines[3].contains("request.denied"));

        let cmd = AuditCommands::Tail {
            n: 2,
            request: None,
            json: true,
        };
        assert!(execute(&cmd, &config).is_ok());
    }

    #[test]
    fn empty_ledger_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let config = config_in(dir.path());
        let cmd = AuditCommands::Tail {
            n: 10,
            request: Some("missing".to_string()),
            json: false,
        };
        assert!(execute(&cmd, &config).is_ok());
    }
}
