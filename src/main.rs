//! dockconsul - main entry point.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use dockconsul::agent::Agent;
use dockconsul::config::Config;
use dockconsul::error::ConfigError;
use dockconsul::metrics::{self, Metrics};
use dockconsul::registry::ConsulAgent;
use dockconsul::runtime::{ContainerRuntime, DockerRuntime};

/// Reconciles Docker container labels into Consul service registrations.
#[derive(Debug, Parser)]
#[command(name = "dockconsul", version, about)]
struct Cli {
    /// Run a single reconcile cycle and exit.
    #[arg(long)]
    once: bool,

    /// Exit 0 iff the container runtime responds within 2 seconds.
    #[arg(long)]
    healthcheck: bool,

    /// Skip all registry mutations.
    #[arg(long)]
    dry_run: bool,

    /// Docker socket path (overrides DOCKER_SOCK).
    #[arg(long)]
    docker_socket: Option<String>,

    /// Consul HTTP address (overrides CONSUL_HTTP_ADDR).
    #[arg(long)]
    consul_addr: Option<String>,

    /// State file path (overrides STATE_PATH).
    #[arg(long)]
    state: Option<String>,

    /// Metrics bind address (overrides METRICS_ADDR).
    #[arg(long)]
    metrics_addr: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load .env if present
    let _ = dotenvy::dotenv();

    // The healthcheck probe needs nothing beyond the socket path; keep it
    // independent of the full configuration so a broken Consul setting
    // cannot fail container health.
    if cli.healthcheck {
        let socket = cli
            .docker_socket
            .clone()
            .or_else(|| std::env::var("DOCKER_SOCK").ok())
            .or_else(|| std::env::var("DOCKER_SOCKET").ok())
            .unwrap_or_else(|| "/var/run/docker.sock".to_string());
        std::process::exit(if probe_runtime(&socket).await { 0 } else { 1 });
    }

    let mut config = match Config::from_env() {
        Ok(config) => config,
        Err(ConfigError::MissingRequired { key, hint }) => {
            eprintln!("Configuration error: missing required setting '{key}'");
            eprintln!("  {hint}");
            std::process::exit(1);
        }
        Err(e) => return Err(e.into()),
    };
    if let Some(socket) = cli.docker_socket {
        config.docker_socket = socket;
    }
    if let Some(addr) = cli.consul_addr {
        config.consul_addr = addr.trim_end_matches('/').to_string();
    }
    if let Some(path) = cli.state {
        config.state_path = path;
    }
    if let Some(addr) = cli.metrics_addr {
        config.metrics_addr = addr;
    }
    if cli.dry_run {
        config.dry_run = true;
    }

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("dockconsul=info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::info!("starting dockconsul");
    tracing::info!(
        consul = %config.consul_addr,
        docker = %config.docker_socket,
        state = %config.state_path,
        dry_run = config.dry_run,
        sidecar_enabled = config.sidecar.enabled,
        "configuration loaded"
    );

    let metrics = Arc::new(Metrics::new()?);
    tokio::spawn(metrics::serve(config.metrics_addr.clone(), Arc::clone(&metrics)));

    let runtime = Arc::new(DockerRuntime::connect(&config.docker_socket)?);
    let registry = Arc::new(ConsulAgent::new(
        &config.consul_addr,
        &config.consul_token,
        config.dry_run,
    ));

    let agent = Arc::new(Agent::new(config, runtime, registry, metrics).await);

    if cli.once {
        if let Err(e) = agent.run_once().await {
            tracing::error!("reconcile cycle failed: {e}");
        }
        return Ok(());
    }

    agent.run().await;
    tracing::info!("shutdown complete");
    Ok(())
}

/// Whether the container runtime answers a list call within 2 seconds.
async fn probe_runtime(socket: &str) -> bool {
    let Ok(runtime) = DockerRuntime::connect(socket) else {
        return false;
    };
    matches!(
        tokio::time::timeout(Duration::from_secs(2), runtime.list_containers()).await,
        Ok(Ok(_))
    )
}
