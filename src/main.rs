use std::net::IpAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use admission::config::AdmissionConfig;
use admission::ratelimit::{AdmissionGate, Identity, PolicyRegistry, RoleDispatcher};

/// Admission control: inspect policies and evaluate admission checks.
#[derive(Debug, Parser)]
#[command(name = "admission", version, about)]
struct Cli {
    /// YAML configuration file (ADMISSION__* environment variables also apply)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the policy catalogue and role ceilings
    Policies,
    /// Run admission checks for one identity and print each decision
    Check(CheckArgs),
}

#[derive(Debug, Args)]
struct CheckArgs {
    /// Catalogue policy to check against
    #[arg(long, default_value = "general")]
    policy: String,

    /// Select the policy from the identity's role instead of --policy
    #[arg(long)]
    role_based: bool,

    /// Authenticated principal identifier
    #[arg(long)]
    principal: Option<String>,

    /// Caller network address
    #[arg(long)]
    address: Option<IpAddr>,

    /// Caller role label
    #[arg(long)]
    role: Option<String>,

    /// Number of consecutive attempts
    #[arg(long, default_value_t = 1)]
    repeat: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting admission");

    let config = AdmissionConfig::load(cli.config.as_deref())?;
    let registry = PolicyRegistry::from_overrides(&config.policies)?;
    let dispatcher = RoleDispatcher::with_overrides(&registry, &config.roles)?;

    match cli.command {
        Command::Policies => {
            let roles: Vec<_> = dispatcher
                .summaries()
                .into_iter()
                .map(|(role, summary)| json!({ "role": role, "policy": summary }))
                .collect();
            let out = json!({
                "policies": registry.summaries(),
                "roles": roles,
                "default": dispatcher.fallback().name(),
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Command::Check(args) => {
            let gate = AdmissionGate::from_config(&config)?;
            let mut identity = Identity::anonymous();
            if let Some(principal) = args.principal {
                identity = identity.with_principal(principal);
            }
            if let Some(address) = args.address {
                identity = identity.with_address(address);
            }
            if let Some(role) = args.role {
                identity = identity.with_role(role);
            }

            let policy = if args.role_based {
                dispatcher.select_for(&identity)
            } else {
                registry.get_or_general(&args.policy)
            };
            info!(policy = policy.name(), key = %policy.identity_key(&identity), "Checking");

            for attempt in 1..=args.repeat {
                let decision = gate.admit(&policy, &identity).await;
                let line = json!({
                    "attempt": attempt,
                    "policy": policy.name(),
                    "decision": decision,
                    "retry_after_secs": decision.retry_after_secs(),
                    "rejection": decision.rejection(&policy),
                });
                println!("{}", line);
            }

            if gate.fallback_count() > 0 {
                info!(fallbacks = gate.fallback_count(), "Shared store was unavailable");
            }
        }
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
