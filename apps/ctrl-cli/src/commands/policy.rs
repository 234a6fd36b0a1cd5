// policy.rs - Policy subcommands: lint, explain, test.

use std::path::PathBuf;

use anyhow::Context;
use clap::Subcommand;
use ctrl_gateway::{CtrlConfig, EngineSet, Explanation};
use ctrl_policy::{lint, load_fixtures, run_fixtures, LintOptions, LintReport, PolicyConfig};
use ctrl_risk::ToolCall;

#[derive(Subcommand)]
pub enum PolicyCommands {
    /// Check a policy document for errors and suspicious rules.
    Lint {
        /// Policy file (defaults to the configured policy_path).
        #[arg(long)]
        policy: Option<PathBuf>,
    },
    /// Show how a call would be scored and decided, rule by rule.
    Explain {
        #[arg(long)]
        server: String,
        #[arg(long)]
        tool: String,
        /// Environment tag (defaults to the configured default_env).
        #[arg(long)]
        env: Option<String>,
        /// Argument payload as JSON.
        #[arg(long)]
        args: Option<String>,
        #[arg(long)]
        actor: Option<String>,
        #[arg(long)]
        policy: Option<PathBuf>,
        #[arg(long)]
        risk: Option<PathBuf>,
        /// Print the full explanation as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Run YAML policy fixtures and fail if any expectation is not met.
    Test {
        /// Fixture file with a top-level `tests:` list.
        tests: PathBuf,
        #[arg(long)]
        policy: Option<PathBuf>,
        #[arg(long)]
        risk: Option<PathBuf>,
    },
}

pub fn execute(cmd: &PolicyCommands, config: &CtrlConfig) -> anyhow::Result<()> {
    match cmd {
        PolicyCommands::Lint { policy } => {
            let path = policy.clone().unwrap_or_else(|| config.policy_path.clone());
            let report = lint_file(&path, config.approvals.enabled)?;
            for finding in report.warnings() {
                println!("{}", finding);
            }
            for finding in report.errors() {
                println!("{}", finding);
            }
            if report.has_errors() {
                anyhow::bail!("policy lint found {} error(s)", report.errors().count());
            }
            println!("OK");
        }

        PolicyCommands::Explain {
            server,
            tool,
            env,
            args,
            actor,
            policy,
            risk,
            json,
        } => {
            let mut call = ToolCall::new(
                server.as_str(),
                tool.as_str(),
                env.as_deref().unwrap_or(&config.default_env),
            );
            if let Some(raw) = args {
                let parsed: serde_json::Value =
                    serde_json::from_str(raw).context("--args must be valid JSON")?;
                call = call.with_args(parsed);
            }
            if let Some(actor) = actor {
                call = call.with_actor(actor.as_str());
            }

            let engines = load_engines(config, policy.as_ref(), risk.as_ref())?;
            let explanation = engines.explain(&call);
            if *json {
                println!("{}", serde_json::to_string_pretty(&explanation)?);
            } else {
                print_explanation(&explanation);
            }
        }

        PolicyCommands::Test {
            tests,
            policy,
            risk,
        } => {
            let engines = load_engines(config, policy.as_ref(), risk.as_ref())?;
            let fixtures = load_fixtures(tests)?;
            let report = run_fixtures(&fixtures, &engines.policy, &engines.risk);
            for outcome in &report.outcomes {
                println!("{}", outcome);
            }
            println!();
            println!(
                "{} passed, {} failed",
                report.outcomes.len() - report.failures,
                report.failures
            );
            if !report.passed() {
                anyhow::bail!("{} policy fixture(s) failed", report.failures);
            }
            println!("OK");
        }
    }

    Ok(())
}

/// Lint a policy file. Parses without the id check so duplicates are
/// reported as findings rather than a load failure.
fn lint_file(path: &std::path::Path, approvals_enabled: bool) -> anyhow::Result<LintReport> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let config = PolicyConfig::parse(&text)?;
    Ok(lint(&config.policies, &LintOptions { approvals_enabled }))
}

fn load_engines(
    config: &CtrlConfig,
    policy: Option<&PathBuf>,
    risk: Option<&PathBuf>,
) -> anyhow::Result<EngineSet> {
    let mut config = config.clone();
    if let Some(path) = policy {
        config.policy_path = path.clone();
    }
    if let Some(path) = risk {
        config.risk_path = path.clone();
    }
    Ok(EngineSet::load(&config)?)
}

fn print_explanation(explanation: &Explanation) {
    let call = &explanation.call;
    let risk = &explanation.risk;
    let trace = &explanation.trace;
    let decision = &trace.decision;

    println!("Call:              {}.{} env={}", call.server, call.tool, call.env);
    println!("Risk mode:         {} (score {})", risk.mode, risk.score);
    for reason in &risk.reasons {
        println!("  - {}", reason);
    }
    println!();
    for step in &trace.steps {
        let marker = if step.terminal { "*" } else { " " };
        println!("{} {:<32} {}", marker, step.check, step.outcome);
    }
    println!();
    println!("Decision:          {}", decision.verdict);
    println!(
        "Matched policy:    {}",
        decision.matched_policy_id.as_deref().unwrap_or("none")
    );
    println!("Reason:            {}", decision.reason);
    println!(
        "Matched condition: {}",
        decision.condition.as_deref().unwrap_or("none")
    );
    match trace.matched_index {
        Some(index) => println!("Policy order index: {}", index),
        None => println!("Policy order index: none"),
    }
}
