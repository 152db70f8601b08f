// opsgate - Network Command Execution Gateway
//
// Entry point wiring:
// - CLI interface (serve / check-policy / exec)
// - Gateway API listener
// - Internal metrics listener
// - Periodic rate-bucket reclamation

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use opsgate::config::Config;
use opsgate::gateway::Gateway;
use opsgate::policy::PolicySet;
use opsgate::validator::CommandRequest;
use opsgate::{metrics, metrics_server, server};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

/// opsgate: whitelisted command execution over HTTP
#[derive(Parser, Debug)]
#[command(name = "opsgate")]
#[command(version = "0.1.0")]
#[command(about = "Network command execution gateway", long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Path to the config file (default: XDG config directory)
    #[arg(long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the gateway server
    Serve,
    /// Parse and compile a policy file, then exit
    CheckPolicy {
        /// Path to the policy file (default: from config)
        #[arg(long)]
        path: Option<String>,
    },
    /// Run one command through the local pipeline without the HTTP layer
    Exec {
        /// API key to authenticate as
        #[arg(long)]
        key: String,

        /// Command line, whitespace-split (no shell)
        line: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };

    init_tracing(&config, args.verbose)?;

    info!("opsgate v0.1.0 starting");

    match args.command {
        Some(Commands::Serve) | None => serve(config).await?,
        Some(Commands::CheckPolicy { path }) => {
            let path = path.unwrap_or_else(|| config.policy.path.clone());
            check_policy(&path)?;
        }
        Some(Commands::Exec { key, line }) => exec_once(config, &key, &line).await?,
    }

    Ok(())
}

fn init_tracing(config: &Config, verbose: bool) -> Result<()> {
    let level = if verbose {
        Level::DEBUG
    } else {
        config.log_level()?
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.logging.format.to_lowercase().as_str() {
        "json" => builder.json().init(),
        "pretty" => builder.pretty().init(),
        _ => builder.compact().init(),
    }
    Ok(())
}

async fn serve(config: Config) -> Result<()> {
    metrics::init().context("Failed to initialize metrics")?;

    if config.auth.keys.is_empty() {
        anyhow::bail!(
            "No API keys configured; add [[auth.keys]] entries or set OPSGATE_API_KEY"
        );
    }

    let gateway = Arc::new(Gateway::from_config(&config)?);

    info!(
        keys = config.auth.keys.len(),
        policy = %config.policy.path,
        "gateway assembled"
    );

    // Reclaim idle rate buckets in the background.
    let gc = gateway.clone();
    let idle_ttl = config.rate_limit.idle_ttl_secs.max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(idle_ttl));
        loop {
            interval.tick().await;
            gc.reclaim_rate_buckets();
        }
    });

    // SIGHUP reloads the policy file in place; a bad file keeps the old set.
    #[cfg(unix)]
    {
        let gw = gateway.clone();
        let policy_path = config.policy.path.clone();
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            let Ok(mut hup) = signal(SignalKind::hangup()) else {
                error!("Failed to install SIGHUP handler; policy reload disabled");
                return;
            };
            while hup.recv().await.is_some() {
                match gw.reload_policy(&policy_path) {
                    Ok(rules) => info!(rules, "policy reloaded"),
                    Err(e) => error!("Policy reload failed: {:#}", e),
                }
            }
        });
    }

    if config.metrics.enabled {
        let listen = config.metrics.listen.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics_server::start_metrics_server(&listen).await {
                error!("Metrics server failed: {:#}", e);
            }
        });
    }

    server::serve(gateway, &config.server).await
}

fn check_policy(path: &str) -> Result<()> {
    let set = PolicySet::load_from_path(path)
        .with_context(|| format!("Policy check failed for {}", path))?;
    println!("{}: {} rules OK", path, set.len());
    for name in set.program_names() {
        println!("  {}", name);
    }
    Ok(())
}

async fn exec_once(config: Config, key: &str, line: &str) -> Result<()> {
    metrics::init().ok();

    let gateway = Gateway::from_config(&config)?;
    let request = CommandRequest::parse_line(line).map_err(|e| anyhow::anyhow!("{}", e))?;

    match gateway.handle_execute(Some(key), request).await {
        Ok(response) => {
            if !response.result.stdout.is_empty() {
                print!("{}", response.result.stdout);
            }
            if !response.result.stderr.is_empty() {
                eprint!("{}", response.result.stderr);
            }
            if response.result.timed_out {
                eprintln!("(timed out after {}ms)", response.result.duration_ms);
            }
            std::process::exit(response.result.exit_code.unwrap_or(124));
        }
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    }
}
