mod advertise;
mod bridge;
mod bus;
mod cmd;
mod config;
mod controller;
mod coordinator;
mod discovery;
mod mesh;
mod metrics;
mod orphan;
mod pairing;
mod services;
mod state;
mod status;
mod supervisor;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use common::Credentials;
use mdns_sd::ServiceDaemon;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::advertise::MdnsAdvertiser;
use crate::bus::MqttConnector;
use crate::config::AgentConfig;
use crate::controller::AgentDeps;
use crate::discovery::MdnsBrowser;
use crate::mesh::{Directory, HttpDirectory, MeshError};
use crate::metrics::Metrics;
use crate::pairing::HttpActivator;
use crate::services::CommandServiceControl;
use crate::supervisor::RestartLedger;

#[derive(Debug, Parser)]
#[command(name = "mesh-agent")]
#[command(about = "home automation mesh agent", version)]
struct Cli {
    /// Config file (defaults to <config dir>/mesh-agent/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the node identifier
    #[arg(long, global = true)]
    node_id: Option<String>,

    /// Override the data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Make this node the master regardless of the cloud record
    #[arg(long, global = true, default_value_t = false)]
    force_master: bool,

    /// Run as a single-node mesh without pairing
    #[arg(long, global = true, default_value_t = false)]
    no_cloud: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the agent (default when no subcommand is given)
    Run,
    /// Print persisted mesh info, pairing state and role
    Status,
    /// Delete the stored credentials
    Unpair,
    /// Install the agent as a service (systemd user service by default)
    Install {
        #[arg(long, default_value_t = false)]
        system: bool,
    },
}

fn load_config(cli: &Cli) -> anyhow::Result<AgentConfig> {
    let mut config = AgentConfig::load(cli.config.as_deref())?;
    if let Some(node_id) = &cli.node_id {
        config.node_id = node_id.clone();
    }
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    config.force_master |= cli.force_master;
    config.no_cloud |= cli.no_cloud;
    Ok(config)
}

fn build_deps(config: &AgentConfig) -> anyhow::Result<AgentDeps> {
    let daemon = ServiceDaemon::new().context("starting mdns daemon")?;
    let cloud = config.cloud.clone();
    let board = config.board_type.clone().unwrap_or_else(pairing::default_board_type);

    let activator = HttpActivator::new(
        &cloud.activation_url,
        &config.node_id,
        &board,
        Duration::from_secs(cloud.activation_timeout_secs),
        cloud.allow_self_signed,
    )
    .context("building activation client")?;

    let directory = move |creds: &Credentials| -> Result<Arc<dyn Directory>, MeshError> {
        let directory = HttpDirectory::new(
            &cloud.nodes_url,
            &cloud.sites_url,
            &creds.token,
            Duration::from_secs(cloud.request_timeout_secs),
            cloud.allow_self_signed,
        )?;
        Ok(Arc::new(directory))
    };

    Ok(AgentDeps {
        connector: Arc::new(MqttConnector::new(Duration::from_secs(config.bridge.connect_timeout_secs))),
        browser: Arc::new(MdnsBrowser::new(daemon.clone())),
        advertiser: Arc::new(MdnsAdvertiser::new(
            daemon,
            &config.node_id,
            (config.discovery.service_type.clone(), config.mqtt.advertised_port),
            (config.discovery.setup_service_type.clone(), config.discovery.setup_port),
        )),
        services: Arc::new(CommandServiceControl::new(
            config.orchestrator.start_command.clone(),
            config.orchestrator.stop_command.clone(),
        )),
        activator: Arc::new(activator),
        directory: Box::new(directory),
    })
}

/// Run the agent until shutdown or a requested restart. Returns the exit status.
async fn run_agent(config: AgentConfig) -> anyhow::Result<i32> {
    let metrics = Arc::new(Metrics::new());
    let logs = metrics::new_logs();
    if !config.metrics_addr.is_empty() {
        tokio::spawn(metrics::serve_metrics(metrics.clone(), logs.clone(), config.metrics_addr.clone()));
    }

    let deps = build_deps(&config)?;
    let shutdown = setup_shutdown_handler();
    let reason = tokio::select! {
        result = controller::run(&config, deps, metrics.clone(), logs.clone()) => result?,
        _ = shutdown => {
            info!("Shutdown signal received, stopping agent gracefully");
            return Ok(0);
        }
    };

    let ledger = RestartLedger::new(config.restart_ledger_path(), config.restart.clone());
    supervisor::perform_restart(&reason, &ledger).await
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let code = match run_agent(config).await {
                Ok(code) => code,
                Err(e) => {
                    error!(error=%format!("{e:#}"), "agent failed");
                    return Err(e);
                }
            };
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
        Commands::Status => cmd::status(&config).await,
        Commands::Unpair => cmd::unpair(&config).await,
        #[cfg(unix)]
        Commands::Install { system } => cmd::install(system, cli.config.clone(), &config.restart).await,
        #[cfg(not(unix))]
        Commands::Install { .. } => Err(anyhow::anyhow!("install is only supported on Unix-like systems with systemd")),
    }
}

async fn setup_shutdown_handler() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
