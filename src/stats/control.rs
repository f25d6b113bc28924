//! Unix-domain control socket for operational tooling.
//!
//! Request and response are both a 4-byte little-endian body length followed
//! by a JSON object. The socket only reads stats snapshots; it can never
//! mutate proxy state, so a misbehaving client costs at most its own
//! connection.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::StatsCollector;

/// Bodies above this are dropped by closing the connection without a reply.
pub const MAX_BODY_LEN: u32 = 4 * 1024 * 1024;

#[derive(Debug, Deserialize)]
struct ControlRequest {
    #[serde(default)]
    command: String,
}

/// Build the reply for one request body. Returns None when the connection
/// must be closed without replying (zero-length or oversized body are
/// handled by the caller before the body is read).
fn handle_request(body: &[u8], stats: &StatsCollector) -> Vec<u8> {
    let request: ControlRequest = match serde_json::from_slice(body) {
        Ok(r) => r,
        Err(e) => {
            return serde_json::to_vec(&json!({
                "ok": false,
                "error": format!("invalid request: {e}"),
            }))
            .unwrap_or_default();
        }
    };

    let response = match request.command.as_str() {
        "stats" => json!({
            "ok": true,
            "payload": stats.snapshot(),
        }),
        // reserved commands, recognized but not yet served here
        "sessions" | "policy_reload" => json!({
            "ok": false,
            "error": "not implemented",
            "code": 501,
            "command": request.command,
        }),
        other => json!({
            "ok": false,
            "error": format!("unknown command: {other}"),
        }),
    };

    serde_json::to_vec(&response).unwrap_or_default()
}

async fn serve_connection(mut stream: UnixStream, stats: Arc<StatsCollector>) {
    loop {
        let mut len_buf = [0u8; 4];
        if stream.read_exact(&mut len_buf).await.is_err() {
            return;
        }
        let body_len = u32::from_le_bytes(len_buf);

        if body_len == 0 || body_len > MAX_BODY_LEN {
            debug!(body_len, "control request body length out of range, closing");
            return;
        }

        let mut body = vec![0u8; body_len as usize];
        if stream.read_exact(&mut body).await.is_err() {
            return;
        }

        let reply = handle_request(&body, &stats);
        let len = (reply.len() as u32).to_le_bytes();
        if stream.write_all(&len).await.is_err() || stream.write_all(&reply).await.is_err() {
            return;
        }
    }
}

/// Control-socket server. Removes a stale socket file on startup and cleans
/// up on shutdown.
pub struct ControlServer {
    path: PathBuf,
    stats: Arc<StatsCollector>,
}

impl ControlServer {
    pub fn new(path: impl Into<PathBuf>, stats: Arc<StatsCollector>) -> Self {
        Self {
            path: path.into(),
            stats,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let _ = std::fs::remove_file(&self.path);
        let listener = UnixListener::bind(&self.path)?;
        info!(path = %self.path.display(), "control socket listening");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let stats = self.stats.clone();
                            tokio::spawn(serve_connection(stream, stats));
                        }
                        Err(e) => {
                            warn!(error = %e, "control socket accept failed");
                        }
                    }
                }
            }
        }

        let _ = std::fs::remove_file(&self.path);
        info!("control socket stopped");
        Ok(())
    }
}
