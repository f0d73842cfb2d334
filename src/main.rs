//! Entry point: parses CLI flags, initializes logging, loads and validates
//! configuration, builds the Kubernetes client, and hands off to the scheduling loop.
mod calendar;
mod chaos;
mod config;
mod kubernetes;
mod notifications;
mod run_loop;
mod schedule;
mod victim;

use std::path::PathBuf;

use clap::Parser;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use config::Config;
use notifications::NotificationClient;

/// A chaos-engineering scheduler that randomly terminates pods of opted-in Kubernetes
/// workload controllers.
#[derive(Parser, Clone, Debug)]
#[clap(name = "chaos-scheduler", about = "Randomly terminates pods of opted-in workloads")]
struct Opts {
    /// Path to the TOML configuration file.
    #[clap(
        short = 'c',
        long = "config",
        env = "CHAOS_CONFIG_PATH",
        help = "Path to the configuration file"
    )]
    config_path: Option<PathBuf>,

    /// Force dry-run mode regardless of what the config file says.
    #[clap(long = "dry-run", help = "Force dry-run mode, suppressing pod deletions")]
    dry_run: bool,

    /// Raise log verbosity; repeatable (`-v` for debug, `-vv` for trace).
    #[clap(short = 'v', long = "verbose", parse(from_occurrences), help = "Increase log verbosity (-v, -vv)")]
    verbose: u8,

    /// Lower log verbosity; repeatable (`-q` for warn, `-qq` for error).
    #[clap(short = 'q', long = "quiet", parse(from_occurrences), help = "Decrease log verbosity (-q, -qq)")]
    quiet: u8,

    /// Validate configuration and cluster connectivity, then exit without scheduling.
    #[clap(long = "check", help = "Validate configuration and exit")]
    check: bool,
}

impl Opts {
    /// The default log level implied by `-v`/`-q`, used only when `RUST_LOG` isn't set.
    /// `-v`/`-q` are mutually exclusive in effect; verbose wins ties since it is the more
    /// common debugging request.
    fn default_log_level(&self) -> Level {
        if self.verbose >= 2 {
            Level::TRACE
        } else if self.verbose == 1 {
            Level::DEBUG
        } else if self.quiet >= 2 {
            Level::ERROR
        } else if self.quiet == 1 {
            Level::WARN
        } else {
            Level::INFO
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();

    let default_filter = opts.default_log_level().to_string();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .init();

    let mut config = Config::load(opts.config_path.as_deref())
        .map_err(|e| anyhow::anyhow!("invalid configuration: {}", e))?;
    if opts.dry_run {
        config.dry_run = true;
    }
    tracing::info!(dry_run = config.dry_run, timezone = %config.timezone, "configuration loaded");

    let client = kubernetes::build_client(&config).await?;
    kubernetes::verify_client(&client).await?;

    if opts.check {
        tracing::info!("configuration and cluster connectivity verified, exiting");
        return Ok(());
    }

    let notifier = NotificationClient::new()?;

    tokio::select! {
        _ = run_loop::run(config, client, notifier) => unreachable!("run loop never returns"),
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received shutdown signal, exiting");
        }
    }

    Ok(())
}
