use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use tracker::config::Config;
use tracker::service::TrackerService;

/// Time-spent tracking consumer for activity events.
#[derive(Parser)]
#[command(name = "tracker", about)]
struct Cli {
    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info, injected via RUSTFLAGS or build env.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Target OS.
    pub fn target_os() -> &'static str {
        std::env::consts::OS
    }

    /// Target architecture.
    pub fn target_arch() -> &'static str {
        std::env::consts::ARCH
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            target_os(),
            target_arch(),
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("tracker {}", version::full());
        return Ok(());
    }

    // Configuration comes from the environment.
    let cfg = Config::from_env().context("loading configuration")?;

    // Initialize tracing. DEBUG=true overrides the CLI level.
    let level = if cfg.debug {
        "debug"
    } else {
        cli.log_level.as_str()
    };
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting tracker",
    );

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

async fn run(cfg: Config) -> Result<()> {
    // Set up signal handling.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        let _ = shutdown_tx.send(());
    });

    // Start the service.
    let mut service = TrackerService::new(cfg)?;
    service.start().await?;

    // Wait for a shutdown signal or a fatal pipeline error.
    tokio::select! {
        _ = shutdown_rx => {}
        _ = service.finished() => {
            tracing::error!("pipeline exited, shutting down");
        }
    }

    // Graceful shutdown. Surfaces the pipeline error, if any.
    service.stop().await?;

    Ok(())
}
