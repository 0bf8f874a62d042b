#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # llm-tunnel
//!
//! Exposes a loopback LLM runtime to a cloud API through one outbound,
//! persistent WebSocket. The agent dials out and registers; the broker routes
//! HTTP requests for the tenant down that connection and streams the
//! responses back.
//!
//! ## Subcommands
//!
//! - `llm-tunnel broker`: run the cloud-side broker
//! - `llm-tunnel agent`: run the local agent next to the runtime
//! - `llm-tunnel token <tenant>`: mint a registration token with the
//!   configured secret
//!
//! ## Broker API surface
//!
//! | Method | Path                      | Auth            | Description                 |
//! |--------|---------------------------|-----------------|-----------------------------|
//! | GET    | `/api/health`             | No              | Liveness check              |
//! | GET    | `/api/tunnel/register`    | JWT (1st frame) | Agent WS registration       |
//! | GET    | `/api/tunnel/sessions`    | `?token=admin`  | Live sessions and circuits  |
//! | ANY    | `/t/{tenant}/{*path}`     | Bearer api_key  | Relay to the tenant's agent |
//!
//! ## Agent status server (`agent.status_listen`)
//!
//! | Method | Path             | Description                           |
//! |--------|------------------|---------------------------------------|
//! | GET    | `/api/health`    | Client state and tunnel statistics    |
//! | POST   | `/api/outbound`  | Queue a request toward the broker     |
//! | POST   | `/api/token`     | Replace the registration token        |
//!
//! On Unix the agent also re-reads `agent.auth_token` (file and
//! `LLM_TUNNEL_AUTH_TOKEN`) on SIGHUP.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use llm_tunnel::config::Config;
use llm_tunnel::routes::agent_router;
use llm_tunnel::state::AgentState;
use llm_tunnel::tunnel::client::{self, ClientEvent};
use llm_tunnel::tunnel::forwarder::LocalForwarder;
use llm_tunnel::tunnel::health::HealthSupervisor;
use llm_tunnel::tunnel::registry::SessionRegistry;
use llm_tunnel::tunnel::relay::{broker_router, BrokerState};
use llm_tunnel::tunnel::router::TunnelBroker;

/// Session writers get this long to flush the shutdown notice.
const SHUTDOWN_FLUSH: Duration = Duration::from_millis(250);

/// Outbound tunnel between a cloud broker and a local LLM runtime.
#[derive(Parser)]
#[command(name = "llm-tunnel", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the broker: agent registrations plus the tenant HTTP facade.
    Broker {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Run the agent: dial the broker and serve the local runtime.
    Agent {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print a registration token for a tenant, signed with `auth.jwt_secret`.
    Token {
        tenant: String,
        /// Token lifetime in seconds.
        #[arg(long, default_value_t = 86_400)]
        ttl_secs: u64,
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config_path = match &cli.command {
        Commands::Broker { config } | Commands::Agent { config } | Commands::Token { config, .. } => config.clone(),
    };
    let config = match Config::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("llm-tunnel: {e}");
            return ExitCode::from(2);
        }
    };

    match cli.command {
        Commands::Broker { .. } => {
            init_tracing(&config);
            run_broker(config).await
        }
        Commands::Agent { .. } => {
            init_tracing(&config);
            run_agent(config, config_path).await
        }
        Commands::Token { tenant, ttl_secs, .. } => {
            match config.token_validator().issue(&tenant, Duration::from_secs(ttl_secs)) {
                Ok(token) => {
                    println!("{token}");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("llm-tunnel: {e}");
                    ExitCode::FAILURE
                }
            }
        }
    }
}

fn init_tracing(config: &Config) {
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to register SIGTERM");
        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}

async fn run_broker(config: Config) -> ExitCode {
    let settings = match config.broker_settings() {
        Ok(settings) => settings,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(2);
        }
    };
    info!("llm-tunnel broker v{} starting", env!("CARGO_PKG_VERSION"));

    if settings.api_key == "change-me" || settings.admin_key == "change-me" {
        warn!("Using default API or admin key, set LLM_TUNNEL_API_KEY or update config");
    }
    if config.auth.jwt_secret == "change-me" {
        warn!("Using default JWT secret, set LLM_TUNNEL_JWT_SECRET or update config");
    }

    let registry = Arc::new(SessionRegistry::new());
    let broker = TunnelBroker::new(registry.clone(), settings.router);
    let state = BrokerState::new(
        broker,
        config.token_validator(),
        settings.admin_key.clone(),
        settings.registration_timeout,
    );
    let app = broker_router(state.clone(), settings.api_key.clone(), settings.max_body_bytes);

    let sweep_task = HealthSupervisor::new(registry, &settings.heartbeat, settings.sweep_interval).spawn();

    let listener = match TcpListener::bind(&settings.listen).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(listen = %settings.listen, "Failed to bind: {e}");
            return ExitCode::FAILURE;
        }
    };
    info!("Broker listening on {}", settings.listen);

    let shutdown_state = state.clone();
    let shutdown = async move {
        shutdown_signal().await;
        info!("Notifying agents of broker shutdown...");
        shutdown_state.shutdown("broker shutting down").await;
    };

    let served = axum::serve(listener, app).with_graceful_shutdown(shutdown).await;
    sweep_task.abort();
    tokio::time::sleep(SHUTDOWN_FLUSH).await;

    match served {
        Ok(()) => {
            info!("Goodbye");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Server error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_agent(config: Config, config_path: Option<PathBuf>) -> ExitCode {
    let settings = match config.client_settings() {
        Ok(settings) => settings,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(2);
        }
    };
    let forwarder = match LocalForwarder::new(&config.agent.local_url, config.forward_timeout()) {
        Ok(forwarder) => forwarder,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(2);
        }
    };
    info!(
        tenant_id = %settings.tenant_id,
        broker = %settings.url,
        local = %forwarder.base_url(),
        "llm-tunnel agent v{} starting",
        env!("CARGO_PKG_VERSION")
    );

    let client = client::spawn(settings, Arc::new(forwarder));
    let handle = client.handle();

    let status_task = match &config.agent.status_listen {
        Some(listen) => match TcpListener::bind(listen).await {
            Ok(listener) => {
                info!("Agent status server on {listen}");
                let app = agent_router(AgentState {
                    start_time: Instant::now(),
                    client: handle.clone(),
                    local_url: config.agent.local_url.clone(),
                });
                Some(tokio::spawn(async move {
                    if let Err(e) = axum::serve(listener, app).await {
                        warn!("Status server error: {e}");
                    }
                }))
            }
            Err(e) => {
                warn!(listen = %listen, "Status server disabled, failed to bind: {e}");
                None
            }
        },
        None => None,
    };

    #[cfg(unix)]
    let reload_task = Some(spawn_token_reload(config_path, handle.clone()));
    #[cfg(not(unix))]
    let reload_task: Option<tokio::task::JoinHandle<()>> = {
        drop(config_path);
        None
    };

    let mut events = handle.subscribe();
    let gave_up = async move {
        loop {
            match events.recv().await {
                Ok(ClientEvent::ReconnectFailed { attempts }) => return attempts,
                Ok(ClientEvent::AuthFailed { reason }) => {
                    error!(%reason, "Broker rejected the registration token, waiting for a new one (SIGHUP or POST /api/token)");
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return 0,
            }
        }
    };

    let code = tokio::select! {
        () = shutdown_signal() => {
            info!("Closing tunnel...");
            client.shutdown().await;
            ExitCode::SUCCESS
        }
        attempts = gave_up => {
            error!(attempts, "Could not reach the broker, giving up");
            client.join().await;
            ExitCode::FAILURE
        }
    };

    for task in [status_task, reload_task].into_iter().flatten() {
        task.abort();
    }
    info!("Goodbye");
    code
}

/// Re-read the registration token from config and environment on SIGHUP.
#[cfg(unix)]
fn spawn_token_reload(config_path: Option<PathBuf>, handle: client::TunnelClientHandle) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut hangup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
            Ok(signal) => signal,
            Err(e) => {
                warn!("Token reload on SIGHUP disabled: {e}");
                return;
            }
        };
        while hangup.recv().await.is_some() {
            match Config::load(config_path.as_deref()) {
                Ok(config) if !config.agent.auth_token.is_empty() => {
                    info!("Received SIGHUP, registration token reloaded");
                    handle.update_token(config.agent.auth_token);
                }
                Ok(_) => warn!("Received SIGHUP but agent.auth_token is empty"),
                Err(e) => warn!("Received SIGHUP, config reload failed: {e}"),
            }
        }
    })
}
