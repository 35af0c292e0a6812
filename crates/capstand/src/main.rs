//! capstand — the Capstan daemon.
//!
//! Single binary that assembles the control plane:
//! - Entity store and work queue (redb)
//! - Reconcile worker (selector-eval, desired-release, verification)
//! - Worker registry + router HTTP endpoints
//! - Release-target gRPC service
//!
//! # Usage
//!
//! ```text
//! capstand serve --port 8420 --grpc-port 8421 --data-dir /var/lib/capstan
//! ```

mod config;

use std::net::SocketAddr;
use std::path::PathBuf;

use capstan_engine::{Dispatcher, ReconcileWorker};
use capstan_queue::WorkQueue;
use capstan_registry::WorkerRegistry;
use capstan_rpc::ReleaseTargetServer;
use capstan_store::Store;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::Config;

#[derive(Parser)]
#[command(name = "capstand", about = "Capstan control-plane daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane (reconcile worker, registry, gRPC).
    Serve {
        /// Port for the registry/router HTTP endpoints.
        #[arg(long, default_value = "8420")]
        port: u16,

        /// Port for the release-target gRPC service.
        #[arg(long, default_value = "8421")]
        grpc_port: u16,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/capstan")]
        data_dir: PathBuf,

        /// Worker id advertised on queue leases.
        #[arg(long)]
        worker_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,capstand=debug,capstan=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            port,
            grpc_port,
            data_dir,
            worker_id,
        } => run_serve(port, grpc_port, data_dir, worker_id).await,
    }
}

async fn run_serve(
    port: u16,
    grpc_port: u16,
    data_dir: PathBuf,
    worker_id: Option<String>,
) -> anyhow::Result<()> {
    info!("Capstan daemon starting");

    let config = Config::from_env();
    std::fs::create_dir_all(&data_dir)?;

    // ── Initialize subsystems ──────────────────────────────────

    let store = Store::open(&data_dir.join("capstan.redb"))?;
    let queue = WorkQueue::open(&data_dir.join("queue.redb"))?;
    info!(path = ?data_dir, "store and queue opened");

    let registry = WorkerRegistry::new(config.heartbeat_timeout);
    info!(
        timeout_secs = config.heartbeat_timeout.as_secs(),
        "worker registry initialized"
    );

    let worker_id = worker_id.unwrap_or_else(|| format!("capstand-{}", std::process::id()));
    let worker = ReconcileWorker::new(
        queue.clone(),
        Dispatcher::new(store.clone(), queue.clone()),
        config.worker_config(worker_id.clone()),
    );
    info!(worker = %worker_id, "reconcile worker initialized");

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker_shutdown = shutdown_rx.clone();
    let sweep_shutdown = shutdown_rx.clone();
    let mut grpc_shutdown = shutdown_rx.clone();

    // ── Start background tasks ─────────────────────────────────

    let worker_handle = tokio::spawn(async move {
        worker.run(worker_shutdown).await;
    });

    // Expired-lease and stale-worker sweep.
    let sweep_queue = queue.clone();
    let sweep_registry = registry.clone();
    let sweep_interval = config.lease;
    let sweep_handle = tokio::spawn(async move {
        let mut shutdown = sweep_shutdown;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(sweep_interval) => {
                    match sweep_queue.reclaim_expired() {
                        Ok(0) => {}
                        Ok(n) => info!(reclaimed = n, "expired leases reclaimed"),
                        Err(e) => warn!(error = %e, "lease reclaim failed"),
                    }
                    let stale = sweep_registry.cleanup_stale_workers();
                    if !stale.is_empty() {
                        info!(removed = stale.len(), "stale workers swept");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    });

    // ── Start gRPC server ──────────────────────────────────────

    let grpc_addr = SocketAddr::from(([0, 0, 0, 0], grpc_port));
    info!(%grpc_addr, "release-target gRPC starting");
    let grpc_handle = tokio::spawn(async move {
        let result = tonic::transport::Server::builder()
            .add_service(ReleaseTargetServer::new().into_service())
            .serve_with_shutdown(grpc_addr, async move {
                let _ = grpc_shutdown.changed().await;
            })
            .await;
        if let Err(e) = result {
            warn!(error = %e, "gRPC server exited with error");
        }
    });

    // ── Start registry HTTP server ─────────────────────────────

    let router = capstan_registry::build_router(registry);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "registry server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on SIGINT or SIGTERM.
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    // Wait for background tasks to drain.
    let _ = worker_handle.await;
    let _ = sweep_handle.await;
    let _ = grpc_handle.await;

    info!("Capstan daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
