use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use cost_plugin_broker::broker::PluginBroker;
use cost_plugin_broker::commands;
use cost_plugin_broker::config;
use cost_plugin_broker::logging;

#[derive(Parser, Debug)]
#[command(name = "cost-plugin-broker")]
#[command(about = "Discover cost plugins and monitor their health", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file (YAML/JSON/TOML)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Override the plugin directory
    #[arg(long, value_name = "DIR", global = true)]
    plugin_dir: Option<PathBuf>,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// List discovered plugins (default)
    List,
    /// Probe plugin health once
    Check {
        /// Only probe this plugin
        name: Option<String>,
        /// Print Prometheus metrics after the checks
        #[arg(long)]
        metrics: bool,
    },
    /// Probe plugins periodically until interrupted
    Watch,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => config::load_from_path(path)
            .await
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => config::load_from_env_or_file()
            .await
            .context("Failed to load configuration")?,
    };
    if let Some(dir) = args.plugin_dir {
        config.plugin_dir = Some(dir);
    }

    let _log_guard = logging::init(&config.logging, args.debug)?;
    if let Some(path) = &args.config {
        info!("Configuration loaded from {}", path.display());
    }

    let broker = PluginBroker::from_config(&config);
    let cancel = CancellationToken::new();

    match args.command.unwrap_or(Command::List) {
        Command::List => commands::run_list(&broker)?,
        Command::Check { name, metrics } => {
            let checking = commands::run_check(&broker, name.as_deref(), metrics, &cancel);
            let unhealthy = tokio::select! {
                result = checking => result?,
                _ = shutdown_signal() => {
                    cancel.cancel();
                    broker.shutdown().await;
                    anyhow::bail!("Interrupted");
                }
            };
            if unhealthy > 0 {
                error!("{} plugin(s) failed health checks", unhealthy);
                std::process::exit(1);
            }
        }
        Command::Watch => {
            let token = cancel.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                info!("Shutdown signal received");
                token.cancel();
            });
            commands::run_watch(&broker, cancel).await?;
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
