mod config;
mod error;
mod health;
mod logger;
mod parser;
mod policy;
mod protocol;
mod session;
mod stats;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use config::ProxyConfig;
use health::{HealthState, HealthStatus};
use logger::StructuredLogger;
use policy::PolicyEngine;
use session::Session;
use stats::control::ControlServer;
use stats::StatsCollector;

/// Global counter for generating process-unique session IDs
static SESSION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Graceful shutdown timeout (wait for sessions to close)
const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ProxyConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(parse_log_level(&config.log_level).into())
                .from_env_lossy(),
        )
        .init();

    info!(
        listen = %format!("{}:{}", config.listen_addr, config.listen_port),
        upstream = %format!("{}:{}", config.upstream_addr, config.upstream_port),
        policy = %config.policy_path.display(),
        control_socket = %config.uds_socket_path.display(),
        "starting sqlshield proxy"
    );

    // Initial policy load. On failure the engine starts without a snapshot
    // and blocks everything until a successful SIGHUP reload.
    let initial_policy = match policy::load(&config.policy_path) {
        Ok(cfg) => Some(Arc::new(cfg)),
        Err(e) => {
            warn!(error = %e, "initial policy load failed, all queries will be blocked");
            None
        }
    };

    let engine = Arc::new(PolicyEngine::new(initial_policy));
    let stats = Arc::new(StatsCollector::new());
    let health_state = Arc::new(HealthState::new());
    let audit = StructuredLogger::start(&config.log_path)?;

    let shutdown = CancellationToken::new();

    // Control socket
    {
        let server = ControlServer::new(config.uds_socket_path.clone(), stats.clone());
        let token = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = server.run(token).await {
                error!(error = %e, "control socket failed");
            }
        });
    }

    // Health endpoint
    {
        let state = health_state.clone();
        let token = shutdown.clone();
        let port = config.health_check_port;
        tokio::spawn(async move {
            if let Err(e) = health::serve(port, state, token).await {
                error!(error = %e, "health endpoint failed");
            }
        });
    }

    // SIGHUP -> policy reload; a failed reload keeps the current snapshot
    #[cfg(unix)]
    {
        let engine = engine.clone();
        let policy_path = config.policy_path.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            let mut hup = match signal::unix::signal(signal::unix::SignalKind::hangup()) {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "cannot install SIGHUP handler, hot reload disabled");
                    return;
                }
            };
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    received = hup.recv() => {
                        if received.is_none() {
                            break;
                        }
                        info!(path = %policy_path.display(), "SIGHUP received, reloading policy");
                        match policy::load(&policy_path) {
                            Ok(cfg) => engine.reload(Some(Arc::new(cfg))),
                            Err(e) => {
                                warn!(error = %e, "policy reload failed, keeping current policy");
                            }
                        }
                    }
                }
            }
        });
    }

    let addr = format!("{}:{}", config.listen_addr, config.listen_port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "sqlshield proxy listening");

    let upstream_addr = format!("{}:{}", config.upstream_addr, config.upstream_port);
    let connect_timeout = Duration::from_secs(config.connection_timeout_sec as u64);

    // Track active sessions for graceful shutdown
    let mut sessions: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown_signal() => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }

            accept_result = listener.accept() => {
                let (stream, peer_addr) = match accept_result {
                    Ok(v) => v,
                    Err(e) => {
                        error!(error = %e, "failed to accept connection");
                        continue;
                    }
                };

                // Admission control: saturated proxies go unhealthy and
                // refuse the socket before a session exists
                if config.max_connections > 0 {
                    let active = stats.active_sessions();
                    if active >= config.max_connections as u64 {
                        warn!(
                            max_connections = config.max_connections,
                            "max connections reached, rejecting new connection"
                        );
                        health_state.set_unhealthy(format!(
                            "max_connections ({}) reached",
                            config.max_connections
                        ));
                        drop(stream);
                        continue;
                    }
                    if health_state.status() == HealthStatus::Unhealthy
                        && active < config.max_connections as u64
                    {
                        health_state.set_healthy();
                    }
                }

                let session_id = SESSION_COUNTER.fetch_add(1, Ordering::SeqCst);
                info!(session_id, peer = %peer_addr, "new connection");

                let session = Session::new(
                    session_id,
                    upstream_addr.clone(),
                    connect_timeout,
                    engine.clone(),
                    audit.clone(),
                    stats.clone(),
                    shutdown.child_token(),
                );

                sessions.spawn(async move {
                    match session.run(stream).await {
                        Ok(()) => info!(session_id, "session ended"),
                        Err(e) => warn!(session_id, error = %e, "session ended with error"),
                    }
                });
            }
        }
    }

    // Graceful shutdown: stop advertising, wake every session, drain
    health_state.set_unhealthy("proxy shutting down");
    shutdown.cancel();

    let active_count = sessions.len();
    if active_count > 0 {
        info!(
            active_sessions = active_count,
            timeout_secs = GRACEFUL_SHUTDOWN_TIMEOUT.as_secs(),
            "waiting for active sessions to close"
        );

        let deadline = tokio::time::Instant::now() + GRACEFUL_SHUTDOWN_TIMEOUT;

        loop {
            if sessions.is_empty() {
                info!("all sessions closed gracefully");
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(
                        remaining_sessions = sessions.len(),
                        "graceful shutdown timeout, aborting remaining sessions"
                    );
                    sessions.abort_all();
                    break;
                }

                Some(result) = sessions.join_next() => {
                    if let Err(e) = result {
                        if !e.is_cancelled() {
                            error!(error = %e, "session task panicked");
                        }
                    }
                }
            }
        }
    }

    info!("sqlshield proxy shutdown complete");
    Ok(())
}

fn parse_log_level(level: &str) -> Level {
    match level {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
