//! cage CLI: run and inspect policy bus deployments.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};

use policy_cage::bus::Bus;
use policy_cage::compile::{parse_formula, parse_query};
use policy_cage::config::{CageConfig, builtin_modules};
use policy_cage::convergence::{RetryPolicy, retry_until};
use policy_cage::policy::PolicyEngine;

#[derive(Parser)]
#[command(name = "cage", version, about = "Service bus with an incremental policy engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a deployment, poll every source once and answer a query.
    Run {
        /// Path to the deployment TOML.
        #[arg(long)]
        config: PathBuf,

        /// Conjunctive query, e.g. `p(x), q(x, y)`.
        #[arg(long)]
        query: Option<String>,

        /// Policy to query. Defaults to the engine's default policy.
        #[arg(long)]
        policy: Option<String>,

        /// How long to wait for source snapshots to arrive.
        #[arg(long, default_value = "2000")]
        wait_ms: u64,
    },

    /// Validate a deployment without starting it.
    Check {
        /// Path to the deployment TOML.
        #[arg(long)]
        config: PathBuf,
    },

    /// Parse a fact, rule or (with --query) a query and print it back.
    Parse {
        text: String,

        /// Parse as a conjunctive query.
        #[arg(long)]
        query: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(3)
                .build(),
        )
    }))
    .ok(); // Ignore error if hook already set (e.g., in tests)

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            query,
            policy,
            wait_ms,
        } => {
            let config = CageConfig::load(&config)?;
            let bus = Bus::with_factories(builtin_modules());
            let engine = config.start(&bus)?;
            config.poll_services(&bus)?;

            let retry = RetryPolicy::within(Duration::from_millis(wait_ms), Duration::from_millis(20));
            retry_until(retry, || sources_arrived(&config, &engine)).await?;

            if let Some(text) = query {
                let policy = policy.unwrap_or_else(|| engine.default_policy());
                let rows = engine.select_text(&policy, &text)?;
                for row in &rows {
                    println!("{}", serde_json::to_string(row).into_diagnostic()?);
                }
                eprintln!("{} row(s) from {policy}", rows.len());
            } else {
                for name in engine.policies() {
                    let rejected = engine.rejections(&name).len();
                    println!("{name}: {:?}, {rejected} rejected", engine.policy_state(&name));
                }
            }
            bus.shutdown().await;
        }

        Commands::Check { config } => {
            let config = CageConfig::load(&config)?;
            config.validate(&builtin_modules())?;
            println!(
                "ok: {} service(s), {} policy(ies), {} rule(s)",
                config.services.len(),
                config.policies.len(),
                config.rules.len()
            );
        }

        Commands::Parse { text, query } => {
            if query {
                let q = parse_query(&text)?;
                println!("{q}");
                println!("variables: {}", q.variables().join(", "));
            } else {
                println!("{}", parse_formula(&text)?);
            }
        }
    }

    Ok(())
}

/// Every configured subscription has delivered at least one snapshot.
fn sources_arrived(config: &CageConfig, engine: &PolicyEngine) -> bool {
    config.policies.iter().all(|p| {
        p.subscribe
            .iter()
            .all(|table| engine.snapshot(&p.name, table).is_some())
    })
}
