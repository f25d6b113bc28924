use chrono::{DateTime, Utc};

/// Session lifecycle.
///
/// Handshaking -> Ready on a successful handshake, Ready <-> ProcessingQuery
/// per command, any state -> Closing on close()/EOF, Closing -> Closed after
/// teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Handshaking,
    Ready,
    ProcessingQuery,
    Closing,
    Closed,
}

/// Per-connection context handed to the parser/policy/logger layers.
/// Populated incrementally: id and timestamp at creation, peer address once
/// the TCP peer is known, user/db when the handshake completes.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub session_id: u64,
    pub client_ip: String,
    pub client_port: u16,
    pub db_user: String,
    pub db_name: String,
    pub connected_at: DateTime<Utc>,
    pub handshake_done: bool,
}

impl SessionContext {
    pub fn new(session_id: u64) -> Self {
        Self {
            session_id,
            client_ip: String::new(),
            client_port: 0,
            db_user: String::new(),
            db_name: String::new(),
            connected_at: Utc::now(),
            handshake_done: false,
        }
    }
}
