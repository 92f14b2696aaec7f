use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use envirolog::agent::Agent;
use envirolog::config::Config;
use envirolog::spool::FileStore;

/// Environmental sensor logger with durable delivery to InfluxDB.
#[derive(Parser)]
#[command(name = "envirolog", about)]
struct Cli {
    /// Path to an optional YAML configuration file. Environment variables
    /// override values from the file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    /// Defaults to the configured log level.
    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
    /// Load and validate the configuration, then exit.
    CheckConfig,
    /// Summarize the on-disk spool without modifying it.
    SpoolStatus,
}

/// Build-time version info.
mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("envirolog {}", version::full());
        return Ok(());
    }

    let cfg = Config::load(cli.config.as_deref()).context("loading configuration")?;

    let level = cli.log_level.as_deref().unwrap_or(&cfg.log_level);
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    match cli.command {
        Some(Command::CheckConfig) => return check_config(&cfg),
        Some(Command::SpoolStatus) => return spool_status(&cfg),
        _ => {}
    }

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        host = %cfg.host_tag,
        "starting envirolog",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(run(cfg))
}

fn check_config(cfg: &Config) -> Result<()> {
    println!("configuration ok");
    println!("  host tag:   {}", cfg.host_tag);
    println!("  interval:   {:?}", cfg.interval);
    println!(
        "  database:   {}:{} ({:?}, {})",
        cfg.database.host, cfg.database.port, cfg.database.api, cfg.database.database_or_bucket,
    );
    println!("  sensors:    {}", cfg.sensors.len());
    match &cfg.spool.path {
        Some(path) => println!(
            "  spool:      {} (max {} entries)",
            path.display(),
            cfg.spool.max_entries
        ),
        None => println!("  spool:      memory only (max {} entries)", cfg.spool.max_entries),
    }
    Ok(())
}

fn spool_status(cfg: &Config) -> Result<()> {
    let Some(path) = &cfg.spool.path else {
        println!("spool is memory only, nothing on disk");
        return Ok(());
    };

    let entries = FileStore::inspect(path)
        .with_context(|| format!("reading spool at {}", path.display()))?;

    println!("spool:    {}", path.display());
    println!("entries:  {} (capacity {})", entries.len(), cfg.spool.max_entries);

    if let (Some(oldest), Some(newest)) = (entries.first(), entries.last()) {
        println!("oldest:   {}", oldest.batch.timestamp.to_rfc3339());
        println!("newest:   {}", newest.batch.timestamp.to_rfc3339());

        let most_attempts = entries.iter().map(|e| e.attempt_count).max().unwrap_or(0);
        println!("attempts: {most_attempts} (max per entry)");
    }

    Ok(())
}

async fn run(cfg: Config) -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("registering SIGTERM handler")?;

    let mut agent = Agent::new(cfg)?;
    agent.start().await?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            match result {
                Ok(()) => tracing::info!("received SIGINT, shutting down"),
                Err(e) => tracing::error!(error = %e, "SIGINT handler failed, shutting down"),
            }
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }

    agent.stop().await?;

    tracing::info!("envirolog stopped");

    Ok(())
}
