// requests.rs - Request subcommands: list, held, status, approve, deny, stale.
//
// approve and deny go through the same ApprovalCoordinator the daemon uses,
// so a CLI resolution racing an HTTP one still dispatches at most once.

use std::sync::Arc;

use clap::Subcommand;
use ctrl_gateway::{
    load_servers_config, ActionDispatcher, ApprovalCoordinator, CtrlConfig, HttpDispatcher,
    Resolution, ResolveOutcome, ServersConfig, DEFAULT_APPROVER,
};
use ctrl_ledger::{RequestRecord, RequestStatus};

use super::{open_ledger, truncate};

#[derive(Subcommand)]
pub enum RequestsCommands {
    /// List recent requests, newest first.
    List {
        /// Only requests in this status (e.g. held, executed, failed).
        #[arg(long)]
        status: Option<String>,
        /// Maximum rows (default 200, capped at 500).
        #[arg(long)]
        limit: Option<usize>,
    },
    /// List requests waiting for a human decision, oldest first.
    Held,
    /// Show one request, its latest decision and result preview.
    Status {
        id: String,
        #[arg(long)]
        json: bool,
    },
    /// Approve a held request and replay it against its action server.
    Approve {
        id: String,
        /// Name recorded as the approver.
        #[arg(long, default_value = DEFAULT_APPROVER)]
        by: String,
    },
    /// Deny a held request.
    Deny {
        id: String,
        #[arg(long, default_value = DEFAULT_APPROVER)]
        by: String,
    },
    /// Requests stuck in approved or executing past the staleness window.
    Stale,
}

pub fn execute(cmd: &RequestsCommands, config: &CtrlConfig) -> anyhow::Result<()> {
    match cmd {
        RequestsCommands::List { status, limit } => {
            let filter = status
                .as_deref()
                .map(str::parse::<RequestStatus>)
                .transpose()?;
            let rows = open_ledger(config)?.list_requests(filter, *limit)?;
            print_requests(&rows, "No requests.");
        }

        RequestsCommands::Held => {
            let rows = coordinator(config, ServersConfig::default())?.list_held()?;
            print_requests(&rows, "No held requests.");
        }

        RequestsCommands::Status { id, json } => {
            let view = coordinator(config, ServersConfig::default())?.status(id)?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&view)?);
                return Ok(());
            }
            let r = &view.request;
            println!("Request:    {}", r.id);
            println!("Status:     {}", r.status);
            println!("Call:       {}.{} env={}", r.server, r.tool, r.env);
            println!("Actor:      {}", r.actor.as_deref().unwrap_or("-"));
            println!("Created:    {}", r.created_at.format("%Y-%m-%d %H:%M:%S"));
            println!("Updated:    {}", r.updated_at.format("%Y-%m-%d %H:%M:%S"));
            println!("Risk:       {}", risk_label(r));
            println!("Args hash:  {}", r.args_hash);
            println!("Args:       {}", r.args);
            if let Some(d) = &view.latest_decision {
                println!("Decision:   {} ({})", d.decision, d.reason);
                println!(
                    "Policy:     {}",
                    d.matched_policy_id.as_deref().unwrap_or("none")
                );
                if let Some(by) = &d.decided_by {
                    println!("Decided by: {}", by);
                }
            }
            if let Some(preview) = &view.result_preview {
                println!("Result:     {}", preview);
            }
        }

        RequestsCommands::Approve { id, by } => {
            let outcome = resolve(config, id, Resolution::Approve, by)?;
            println!("Approved {} -> {}", outcome.request_id, outcome.status);
            if let Some(preview) = outcome.result_preview {
                println!("Result: {}", preview);
            }
        }

        RequestsCommands::Deny { id, by } => {
            let outcome = resolve(config, id, Resolution::Deny, by)?;
            println!("Denied {} -> {}", outcome.request_id, outcome.status);
        }

        RequestsCommands::Stale => {
            let alerts = coordinator(config, ServersConfig::default())?.stale_alerts()?;
            if alerts.is_empty() {
                println!("No stale requests.");
                return Ok(());
            }
            println!(
                "{:<38} {:<10} {:<24} {:>8}",
                "ID", "STATUS", "CALL", "STUCK(s)"
            );
            println!("{}", "-".repeat(84));
            for alert in &alerts {
                println!(
                    "{:<38} {:<10} {:<24} {:>8}",
                    alert.request_id,
                    alert.status.as_str(),
                    truncate(&format!("{}.{}", alert.server, alert.tool), 24),
                    alert.stuck_secs,
                );
            }
            println!();
            println!("Inspect the action server before re-submitting; ctrl never retries.");
        }
    }

    Ok(())
}

fn coordinator(config: &CtrlConfig, servers: ServersConfig) -> anyhow::Result<ApprovalCoordinator> {
    let dispatcher: Arc<dyn ActionDispatcher> = Arc::new(HttpDispatcher::new(&servers));
    Ok(ApprovalCoordinator::new(open_ledger(config)?, dispatcher)
        .with_dispatch_timeout(config.dispatch_timeout())
        .with_stale_after(config.stale_after()))
}

fn resolve(
    config: &CtrlConfig,
    id: &str,
    resolution: Resolution,
    by: &str,
) -> anyhow::Result<ResolveOutcome> {
    // Only a replay needs to reach an action server.
    let servers = match resolution {
        Resolution::Approve => load_servers_config(&config.servers_path)?,
        Resolution::Deny => ServersConfig::default(),
    };
    let coordinator = coordinator(config, servers)?;
    let rt = tokio::runtime::Runtime::new()?;
    Ok(rt.block_on(coordinator.resolve(id, resolution, by))?)
}

fn risk_label(r: &RequestRecord) -> String {
    match (&r.risk_mode, r.risk_score) {
        (Some(mode), Some(score)) => format!("{} ({})", mode, score),
        (Some(mode), None) => mode.clone(),
        _ => "-".to_string(),
    }
}

fn print_requests(rows: &[RequestRecord], empty: &str) {
    if rows.is_empty() {
        println!("{}", empty);
        return;
    }
    println!(
        "{:<38} {:<20} {:<10} {:<28} {:<6} RISK",
        "ID", "CREATED", "STATUS", "CALL", "ENV"
    );
    println!("{}", "-".repeat(120));
    for r in rows {
        println!(
            "{:<38} {:<20} {:<10} {:<28} {:<6} {}",
            r.id,
            r.created_at.format("%Y-%m-%d %H:%M:%S"),
            r.status.as_str(),
            truncate(&format!("{}.{}", r.server, r.tool), 28),
            r.env,
            risk_label(r),
        );
    }
}
