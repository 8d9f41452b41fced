use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use telemetron::agent::Agent;
use telemetron::config::{Config, HealthConfig};
use telemetron::export::health::HealthMetrics;
use telemetron::server::Server;
use telemetron::shutdown::{self, JoinedError};
use telemetron::storage::{self, Storage};

/// Metrics agent and collector.
#[derive(Parser)]
#[command(name = "telemetron", about)]
struct Cli {
    /// Path to the YAML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    /// Overrides `log_level` from the config file.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sample local metrics and deliver them to the collector.
    Agent,
    /// Accept metric batches and keep current values.
    Server,
    /// Print version information and exit.
    Version,
}

/// Build-time version info.
mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
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

    if let Command::Version = cli.command {
        println!("telemetron {}", version::full());
        return Ok(());
    }

    let cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => {
            let cfg = Config::default();
            cfg.validate().context("validating default config")?;
            cfg
        }
    };

    let level = cli.log_level.as_deref().unwrap_or(&cfg.log_level);
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting telemetron",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async {
        match cli.command {
            Command::Agent => run_agent(cfg).await,
            Command::Server => run_server(cfg).await,
            Command::Version => Ok(()),
        }
    })
}

/// Starts the health server when enabled.
async fn start_health(cfg: &HealthConfig) -> Result<Option<Arc<HealthMetrics>>> {
    if !cfg.enabled {
        return Ok(None);
    }

    let health = Arc::new(HealthMetrics::new(&cfg.addr).context("creating health metrics")?);
    health
        .start()
        .await
        .context("starting health metrics server")?;

    Ok(Some(health))
}

async fn stop_health(health: Option<Arc<HealthMetrics>>) {
    if let Some(h) = health {
        if let Err(e) = h.stop().await {
            tracing::warn!(error = %e, "stopping health metrics server");
        }
    }
}

/// Cancels `cancel` on SIGINT/SIGTERM.
fn watch_signals(cancel: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            res = shutdown::wait_for_signal() => {
                if let Err(e) = res {
                    tracing::error!(error = %format!("{e:#}"), "signal handling failed");
                }
            }
            _ = cancel.cancelled() => {}
        }
        cancel.cancel();
    });
}

async fn run_agent(cfg: Config) -> Result<()> {
    let health = start_health(&cfg.health).await?;

    let agent = Agent::new(cfg.agent, health.clone()).context("creating agent")?;

    let cancel = CancellationToken::new();
    watch_signals(cancel.clone());

    let result = agent.run(cancel.clone()).await;
    cancel.cancel();

    stop_health(health).await;

    result.context("agent exited with errors")?;

    tracing::info!("telemetron agent stopped");

    Ok(())
}

async fn run_server(cfg: Config) -> Result<()> {
    let health = start_health(&cfg.health).await?;

    let storage = Arc::new(
        storage::open(&cfg.storage, health.clone())
            .await
            .context("opening storage")?,
    );

    let cancel = CancellationToken::new();
    let mut errors = Vec::new();

    match Server::new(&cfg.server, Arc::clone(&storage), health.clone()) {
        Ok(mut server) => match server.start(cancel.clone()).await {
            Ok(_) => {
                watch_signals(cancel.clone());
                cancel.cancelled().await;

                if let Err(e) = server.wait().await {
                    errors.push(e);
                }
            }
            Err(e) => errors.push(e.context("starting collector")),
        },
        Err(e) => errors.push(e.context("creating collector")),
    }
    cancel.cancel();

    if let Err(e) = storage.close().await {
        errors.push(anyhow::Error::new(e).context("closing storage"));
    }

    stop_health(health).await;

    JoinedError(errors)
        .into_result()
        .context("collector exited with errors")?;

    tracing::info!("telemetron server stopped");

    Ok(())
}
