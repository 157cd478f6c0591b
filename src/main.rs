use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tollgate::config::TollgateConfig;
use tollgate::grpc::GrpcServer;
use tollgate::ratelimit::{CheckOrchestrator, MemoryEngine, RateLimitRouter};
use tollgate::store::InMemoryStore;

/// Multi-tenant rate limiting service
#[derive(Parser, Debug)]
#[command(name = "tollgate", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the gRPC listen address
    #[arg(long)]
    grpc_addr: Option<SocketAddr>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);
    match args.log_format {
        LogFormat::Text => subscriber.init(),
        LogFormat::Json => subscriber.json().init(),
    }

    info!("Starting Tollgate Rate Limiting Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = TollgateConfig::load(args.config.as_deref())?;
    if let Some(addr) = args.grpc_addr {
        config.server.grpc_addr = addr;
    }
    info!(
        grpc_addr = %config.server.grpc_addr,
        nodes = config.topology.nodes.len(),
        strategy = %config.topology.strategy,
        "Configuration loaded"
    );

    let store = match &config.store.seed_path {
        Some(path) => {
            let store = InMemoryStore::from_seed_file(path)?;
            info!(
                path = %path,
                projects = store.project_count(),
                rules = store.rule_count(),
                "Seeded project store"
            );
            store
        }
        None => InMemoryStore::new(),
    };

    let router = Arc::new(RateLimitRouter::new(
        config.topology.to_topology(),
        Arc::new(MemoryEngine::new()),
    ));

    let max_idle = config.limiter.idle_eviction();
    if let Some(max_idle) = max_idle {
        info!(max_idle_secs = max_idle.as_secs(), "Idle limiter eviction enabled");
    }
    let sweeper = router.spawn_sweeper(config.limiter.sweep_interval(), max_idle);

    let orchestrator = Arc::new(CheckOrchestrator::new(
        Arc::new(store),
        router,
        config.limiter.timeouts(),
    ));

    let grpc_server = GrpcServer::new(config.server.grpc_addr, orchestrator);

    // Run the server with graceful shutdown on Ctrl+C
    grpc_server.serve_with_shutdown(shutdown_signal()).await?;

    sweeper.abort();

    info!("Tollgate Rate Limiting Service stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
