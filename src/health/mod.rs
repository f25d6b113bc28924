//! HTTP health endpoint.
//!
//! A load balancer polls `GET /health`; admission control flips the shared
//! state to Unhealthy when the proxy is saturated and back once sessions
//! drain.

use std::sync::{PoisonError, RwLock};

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// Shared health state; `None` reason means healthy.
pub struct HealthState {
    unhealthy_reason: RwLock<Option<String>>,
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            unhealthy_reason: RwLock::new(None),
        }
    }

    pub fn set_healthy(&self) {
        *self
            .unhealthy_reason
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn set_unhealthy(&self, reason: impl Into<String>) {
        *self
            .unhealthy_reason
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(reason.into());
    }

    pub fn status(&self) -> HealthStatus {
        if self
            .unhealthy_reason
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
        {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Healthy
        }
    }

    fn reason(&self) -> Option<String> {
        self.unhealthy_reason
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

fn build_response(state: &HealthState, path: &str) -> Response<Full<Bytes>> {
    let (status, body) = match path {
        "/health" => match state.reason() {
            None => (StatusCode::OK, json!({"status": "ok"}).to_string()),
            Some(reason) => (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({"status": "unhealthy", "reason": reason}).to_string(),
            ),
        },
        _ => (StatusCode::NOT_FOUND, String::from("Not Found")),
    };

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("Connection", "close")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

/// Serve the health endpoint until shutdown.
pub async fn serve(
    port: u16,
    state: Arc<HealthState>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "health endpoint listening");

    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted?,
        };
        debug!(peer = %peer, "health check connection");

        let io = TokioIo::new(stream);
        let state = state.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let state = state.clone();
                async move {
                    Ok::<_, Infallible>(build_response(&state, req.uri().path()))
                }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!(error = %e, "health endpoint connection error");
            }
        });
    }

    info!("health endpoint stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        let state = HealthState::new();
        assert_eq!(state.status(), HealthStatus::Healthy);

        state.set_unhealthy("max_connections (10) reached");
        assert_eq!(state.status(), HealthStatus::Unhealthy);

        state.set_healthy();
        assert_eq!(state.status(), HealthStatus::Healthy);
    }

    #[test]
    fn test_healthy_response_body() {
        let state = HealthState::new();
        let resp = build_response(&state, "/health");
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[test]
    fn test_unhealthy_response_body() {
        let state = HealthState::new();
        state.set_unhealthy("shutting down");
        let resp = build_response(&state, "/health");
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_unknown_path_is_404() {
        let state = HealthState::new();
        let resp = build_response(&state, "/metrics");
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
