use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::task::JoinSet;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use keyrate::config::KeyrateConfig;
use keyrate::ratelimit::{LimiterRegistry, PolicySet};

/// Per-key token-bucket rate limiting.
#[derive(Debug, Parser)]
#[command(name = "keyrate", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Drive a burst of concurrent decisions through the registry
    Probe {
        /// Identifiers to rate limit
        #[arg(short, long = "key", required = true)]
        keys: Vec<String>,

        /// Decisions each worker requests per key
        #[arg(short = 'n', long, default_value_t = 50)]
        requests: u32,

        /// Concurrent workers
        #[arg(short, long, default_value_t = 4)]
        workers: usize,

        /// Pause between a worker's decisions, in milliseconds
        #[arg(long, default_value_t = 0)]
        interval_ms: u64,
    },
    /// Show the policy each identifier resolves to
    Resolve {
        /// Identifiers to resolve
        #[arg(short, long = "key", required = true)]
        keys: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = match &cli.config {
        Some(path) => KeyrateConfig::from_file(path)?,
        None => KeyrateConfig::default(),
    };
    info!(
        capacity = config.registry.capacity,
        rules = config.policies.rules.len(),
        "Configuration loaded"
    );

    match cli.command {
        Command::Probe {
            keys,
            requests,
            workers,
            interval_ms,
        } => {
            let registry = Arc::new(config.registry.build()?);
            let policies = Arc::new(config.policies);
            probe(
                registry,
                policies,
                keys,
                requests,
                workers,
                Duration::from_millis(interval_ms),
            )
            .await?;
        }
        Command::Resolve { keys } => resolve(&config.policies, &keys),
    }

    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[derive(Default)]
struct Tally {
    admitted: AtomicU64,
    denied: AtomicU64,
}

async fn probe(
    registry: Arc<LimiterRegistry>,
    policies: Arc<PolicySet>,
    keys: Vec<String>,
    requests: u32,
    workers: usize,
    interval: Duration,
) -> anyhow::Result<()> {
    if workers == 0 {
        anyhow::bail!("at least one worker is required");
    }

    let keys = Arc::new(keys);
    let tallies: Arc<Vec<Tally>> = Arc::new(keys.iter().map(|_| Tally::default()).collect());

    info!(
        keys = keys.len(),
        workers = workers,
        requests = requests,
        "Starting probe"
    );

    let mut tasks = JoinSet::new();
    for _ in 0..workers {
        let registry = registry.clone();
        let policies = policies.clone();
        let keys = keys.clone();
        let tallies = tallies.clone();

        tasks.spawn(async move {
            for _ in 0..requests {
                for (key, tally) in keys.iter().zip(tallies.iter()) {
                    let limiter = registry.get_or_create(key, policies.resolve(key));
                    if limiter.allow() {
                        tally.admitted.fetch_add(1, Ordering::Relaxed);
                    } else {
                        tally.denied.fetch_add(1, Ordering::Relaxed);
                    }
                }
                if !interval.is_zero() {
                    tokio::time::sleep(interval).await;
                }
            }
        });
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "Probe worker failed");
        }
    }

    for (key, tally) in keys.iter().zip(tallies.iter()) {
        let limiter = registry.get(key);
        info!(
            key = %key,
            admitted = tally.admitted.load(Ordering::Relaxed),
            denied = tally.denied.load(Ordering::Relaxed),
            tokens_left = limiter.as_ref().map(|l| l.tokens()),
            next_permit_in = ?limiter.as_ref().and_then(|l| l.time_until_allowed()),
            "Probe result"
        );
    }
    info!(registered = registry.len(), "Probe finished");

    Ok(())
}

fn resolve(policies: &PolicySet, keys: &[String]) {
    for key in keys {
        let rule = policies.find_rule(key);
        let policy = policies.resolve(key);
        info!(
            key = %key,
            rule = rule.and_then(|r| r.name.as_deref()).unwrap_or("-"),
            prefix = rule.map(|r| r.prefix.as_str()).unwrap_or("<default>"),
            rate = %policy.rate,
            burst = policy.burst,
            "Resolved policy"
        );
    }
}
