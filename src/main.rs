//! Nexus Supervisor - process supervision for the Nexus trader engine.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use nexus_supervisor::config::{ConfigLoader, SupervisorConfig};
use nexus_supervisor::supervisor::Supervisor;

#[derive(Parser)]
#[command(
    name = "nexus-supervisor",
    about = "Supervisor for the Nexus trader engine process",
    version
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Path to a config file (overrides the default search paths).
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build, launch, and supervise the engine until interrupted.
    Run {
        /// Engine executable (overrides the config file).
        #[arg(long)]
        engine: Option<PathBuf>,
        /// Skip the build step.
        #[arg(long)]
        skip_build: bool,
    },
}

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

fn load_config(path: Option<PathBuf>) -> SupervisorConfig {
    let loader = path.map_or_else(ConfigLoader::new, ConfigLoader::with_path);
    match loader.load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Run { engine, skip_build } => {
            let mut config = load_config(cli.config);
            if let Some(engine) = engine {
                config.engine.executable = engine;
            }
            if skip_build {
                config.build.enabled = false;
            }

            tracing::info!(
                executable = %config.engine.executable.display(),
                build = config.build.enabled,
                "Starting engine supervisor"
            );

            let (supervisor, handle) = Supervisor::new(config);
            let session = tokio::spawn(supervisor.run());

            // Watch status changes while the session runs.
            let mut status_rx = handle.subscribe_status();
            let status_task = tokio::spawn(async move {
                while status_rx.changed().await.is_ok() {
                    let status = *status_rx.borrow();
                    tracing::info!(
                        running = status.running,
                        balance = status.cumulative_balance,
                        strategies = status.active_strategies,
                        transformers = status.deployed_transformers,
                        "Engine status"
                    );
                }
            });

            let shutdown_handle = handle.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("Interrupt received, shutting down");
                    shutdown_handle.shutdown();
                }
            });

            match session.await {
                Ok(Ok(result)) => tracing::info!(?result, "Supervisor finished"),
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "Supervisor failed");
                    status_task.abort();
                    std::process::exit(1);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Supervisor task panicked");
                    std::process::exit(1);
                }
            }
            status_task.abort();
        }
    }
}
