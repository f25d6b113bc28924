//! Structured audit logging.
//!
//! Events are serialized as line-delimited JSON and written to the audit log
//! by a background task fed through a bounded channel. The hot path uses
//! `try_send`: under extreme load an event is dropped (and counted in
//! diagnostics) rather than stalling the relay.

use std::io::Write;
use std::path::Path;

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Channel depth; generous enough for bursts without unbounded memory.
const CHANNEL_BUFFER_SIZE: usize = 1024;

/// One audit event, keyed by the `event` field in the JSON output.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    Connection {
        session_id: u64,
        /// "connect" or "disconnect"
        phase: String,
        client_ip: String,
        client_port: u16,
        db_user: String,
        timestamp: String,
    },
    Query {
        session_id: u64,
        db_user: String,
        client_ip: String,
        raw_sql: String,
        command: String,
        tables: Vec<String>,
        action: String,
        timestamp: String,
        duration_us: u64,
    },
    QueryBlocked {
        session_id: u64,
        db_user: String,
        client_ip: String,
        raw_sql: String,
        command: String,
        matched_rule: String,
        reason: String,
        timestamp: String,
        duration_us: u64,
    },
}

/// ISO-8601 timestamp with microsecond precision.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Cloneable handle for submitting audit events.
#[derive(Clone)]
pub struct StructuredLogger {
    tx: mpsc::Sender<AuditEvent>,
}

impl StructuredLogger {
    /// Open the audit log for append and start the writer task.
    pub fn start(path: &Path) -> std::io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        debug!(path = %path.display(), "audit log opened");

        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        tokio::task::spawn_blocking(move || write_events(rx, file));

        Ok(Self { tx })
    }

    /// Submit an event without blocking.
    pub fn log(&self, event: AuditEvent) {
        if self.tx.try_send(event).is_err() {
            warn!("audit log channel full, dropping event");
        }
    }
}

fn write_events(mut rx: mpsc::Receiver<AuditEvent>, file: std::fs::File) {
    let mut writer = std::io::BufWriter::new(file);
    while let Some(event) = rx.blocking_recv() {
        match serde_json::to_vec(&event) {
            Ok(mut line) => {
                line.push(b'\n');
                if let Err(e) = writer.write_all(&line).and_then(|_| writer.flush()) {
                    warn!(error = %e, "audit log write failed");
                }
            }
            Err(e) => warn!(error = %e, "audit event serialization failed"),
        }
    }
    let _ = writer.flush();
}
