//! acp-relay: a relay between terminal clients and containerized agent
//! subprocesses speaking a JSON-RPC Agent Client Protocol.
//!
//! Responsibilities, in startup order: parse CLI flags, load and validate
//! configuration, verify the sandbox engine is reachable, open the
//! persisted session store and reconcile it against the previous process's
//! state, bind the WebSocket and Management API listeners, then serve
//! both concurrently until a shutdown signal arrives.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use acp_relay::config::{AgentMode, CliOverrides, RelayConfig};
use acp_relay::management;
use acp_relay::registry::SessionRegistry;
use acp_relay::router::{PendingRequests, Router};
use acp_relay::sandbox::{CliContainerEngine, SandboxManager};
use acp_relay::storage::Storage;

/// Relay between terminal clients and containerized ACP agent subprocesses.
#[derive(Parser, Debug)]
#[command(name = "acp-relay")]
#[command(version, about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, default_value = "acp-relay.yaml")]
    config: PathBuf,

    /// Override `server.websocket_host`.
    #[arg(long)]
    websocket_host: Option<String>,

    /// Override `server.websocket_port`.
    #[arg(long)]
    websocket_port: Option<u16>,

    /// Override `server.management_host`.
    #[arg(long)]
    management_host: Option<String>,

    /// Override `server.management_port`.
    #[arg(long)]
    management_port: Option<u16>,
}

impl Cli {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            websocket_host: self.websocket_host.clone(),
            websocket_port: self.websocket_port,
            management_host: self.management_host.clone(),
            management_port: self.management_port,
        }
    }
}

/// A startup failure, tagged with the exit code §6 assigns it. Carried
/// inside an `anyhow::Error`'s context chain so `main` can still recover
/// the right exit code after `run` has annotated it with `.context(...)`.
#[derive(Error, Debug)]
enum Fatal {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("sandbox engine unavailable: {0}")]
    EngineUnavailable(String),
    #[error("port bind failure: {0}")]
    PortBind(String),
}

impl Fatal {
    fn exit_code(&self) -> i32 {
        match self {
            Fatal::Config(_) => 1,
            Fatal::EngineUnavailable(_) => 2,
            Fatal::PortBind(_) => 3,
        }
    }
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        let exit_code = err
            .chain()
            .find_map(|cause| cause.downcast_ref::<Fatal>())
            .map(Fatal::exit_code)
            .unwrap_or(1);
        tracing::error!(error = format!("{err:#}"), "fatal error during startup or shutdown");
        eprintln!("acp-relay: {err:#}");
        std::process::exit(exit_code);
    }
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
    );
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = RelayConfig::load(&cli.config, &cli.overrides())
        .map_err(|e| Fatal::Config(e.to_string()))
        .context("loading configuration")?;

    tracing::info!(config = ?cli.config, "loaded configuration");

    let storage = Arc::new(
        Storage::open(std::path::Path::new(&config.database.path))
            .map_err(|e| Fatal::Config(e.to_string()))
            .context("opening session storage")?,
    );

    let sandboxes = Arc::new(SandboxManager::new(Arc::new(CliContainerEngine), config.agent.clone()));
    if config.agent.mode == AgentMode::Container {
        sandboxes
            .ping()
            .await
            .map_err(|e| Fatal::EngineUnavailable(e.to_string()))
            .context("verifying sandbox engine is reachable")?;
    }

    let registry = Arc::new(SessionRegistry::new(
        Arc::clone(&storage),
        Arc::clone(&sandboxes),
        config.server.message_history_limit,
    ));
    let reconciled = registry
        .reconcile_on_startup()
        .await
        .map_err(|e| Fatal::Config(e.to_string()))
        .context("reconciling session storage from a previous process")?;
    if reconciled > 0 {
        tracing::info!(reconciled, "closed stale session rows from a previous process");
    }

    let ws_addr: SocketAddr = format!("{}:{}", config.server.websocket_host, config.server.websocket_port)
        .parse()
        .map_err(|e| Fatal::Config(format!("invalid websocket bind address: {e}")))
        .context("parsing websocket bind address")?;
    let ws_listener = TcpListener::bind(ws_addr)
        .await
        .map_err(|e| Fatal::PortBind(format!("binding websocket listener on {ws_addr}: {e}")))
        .context("binding websocket listener")?;
    tracing::info!(addr = %ws_addr, "websocket listener bound");

    let mgmt_addr: SocketAddr = format!("{}:{}", config.server.management_host, config.server.management_port)
        .parse()
        .map_err(|e| Fatal::Config(format!("invalid management bind address: {e}")))
        .context("parsing management bind address")?;
    let mgmt_listener = TcpListener::bind(mgmt_addr)
        .await
        .map_err(|e| Fatal::PortBind(format!("binding management listener on {mgmt_addr}: {e}")))
        .context("binding management listener")?;
    tracing::info!(addr = %mgmt_addr, "management API listener bound");

    let pending = Arc::new(PendingRequests::new());
    let shutdown = CancellationToken::new();

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        signal_shutdown.cancel();
    });

    let mgmt_router = management::router(Arc::clone(&registry));
    let mgmt_shutdown = shutdown.clone();
    let mgmt_task = tokio::spawn(async move {
        axum::serve(mgmt_listener, mgmt_router)
            .with_graceful_shutdown(async move { mgmt_shutdown.cancelled().await })
            .await
    });

    serve_websockets(ws_listener, Arc::clone(&registry), Arc::clone(&pending), shutdown.clone()).await;

    if let Err(err) = mgmt_task.await {
        tracing::warn!(error = %err, "management API task panicked during shutdown");
    }

    tracing::info!("shutting down active sessions");
    registry.stop_all().await;
    pending.fail_all().await;

    Ok(())
}

/// Accepts WebSocket connections until `shutdown` fires; each connection
/// gets its own `Router::serve` task sharing the process-wide registry and
/// pending-request table (§5 "Global monotonic counter ... lifetime =
/// process").
async fn serve_websockets(
    listener: TcpListener,
    registry: Arc<SessionRegistry>,
    pending: Arc<PendingRequests>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let registry = Arc::clone(&registry);
                        let pending = Arc::clone(&pending);
                        tokio::spawn(async move {
                            match tokio_tungstenite::accept_async(stream).await {
                                Ok(ws) => {
                                    let router = Router::new(registry, pending);
                                    router.serve(ws).await;
                                }
                                Err(err) => {
                                    tracing::warn!(peer = %peer, error = %err, "websocket handshake failed");
                                }
                            }
                        });
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "accepting websocket connection failed");
                    }
                }
            }
            _ = shutdown.cancelled() => {
                tracing::info!("websocket listener shutting down");
                break;
            }
        }
    }
}

/// Waits for either SIGINT (`Ctrl+C`) or, on Unix, SIGTERM.
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
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
        _ = ctrl_c => tracing::info!("received SIGINT, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}
