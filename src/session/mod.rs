mod state;

pub use state::{SessionContext, SessionState};

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::ParseError;
use crate::logger::{now_timestamp, AuditEvent, StructuredLogger};
use crate::parser::{InjectionDetector, ProcedureDetector, SqlClassifier};
use crate::policy::{PolicyAction, PolicyEngine};
use crate::protocol::handshake::relay_handshake;
use crate::protocol::{extract_command, CommandPacket, CommandType, Packet, PacketCodec};
use crate::stats::StatsCollector;

/// Session errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("handshake failed: {0}")]
    Handshake(#[from] ParseError),

    #[error("upstream connect failed: {0}")]
    UpstreamConnect(String),
}

/// Fires the matching stats close on every exit path.
struct StatsGuard {
    stats: Arc<StatsCollector>,
}

impl Drop for StatsGuard {
    fn drop(&mut self) {
        self.stats.on_connection_close();
    }
}

/// Handle a single client session: handshake relay, then the command loop.
pub struct Session {
    pub id: u64,
    state: SessionState,
    ctx: SessionContext,
    upstream_addr: String,
    connect_timeout: Duration,
    policy: Arc<PolicyEngine>,
    logger: StructuredLogger,
    stats: Arc<StatsCollector>,
    classifier: SqlClassifier,
    injection: InjectionDetector,
    procedures: ProcedureDetector,
    cancel: CancellationToken,
}

impl Session {
    pub fn new(
        id: u64,
        upstream_addr: String,
        connect_timeout: Duration,
        policy: Arc<PolicyEngine>,
        logger: StructuredLogger,
        stats: Arc<StatsCollector>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            state: SessionState::Handshaking,
            ctx: SessionContext::new(id),
            upstream_addr,
            connect_timeout,
            policy,
            logger,
            stats,
            classifier: SqlClassifier::new(),
            injection: InjectionDetector::with_default_patterns(),
            procedures: ProcedureDetector::new(),
            cancel,
        }
    }

    /// Request session shutdown. Idempotent; wakes any read the command
    /// loop is blocked on. The session still runs its close rites.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Run the session over a fresh client connection: resolve the peer,
    /// dial the upstream, then proxy.
    pub async fn run(mut self, client: TcpStream) -> Result<(), SessionError> {
        if let Ok(peer) = client.peer_addr() {
            self.ctx.client_ip = peer.ip().to_string();
            self.ctx.client_port = peer.port();
        }

        let upstream = match tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect(&self.upstream_addr),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return self.reject_upstream_failure(client, e.to_string()).await,
            Err(_) => {
                return self
                    .reject_upstream_failure(client, "connect timed out".to_string())
                    .await
            }
        };

        self.proxy(client, upstream).await
    }

    async fn reject_upstream_failure(
        self,
        client: TcpStream,
        cause: String,
    ) -> Result<(), SessionError> {
        error!(session_id = self.id, error = %cause, "upstream connect failed");
        let mut client = Framed::new(client, PacketCodec);
        let err = Packet::make_error(2003, &format!("Can't connect to MySQL server ({cause})"), 0);
        let _ = client.send(err).await;
        let _ = client.close().await;
        Err(SessionError::UpstreamConnect(cause))
    }

    /// Proxy between an established client and upstream pair. Split out from
    /// `run` so the whole pipeline is exercisable over in-memory streams.
    pub async fn proxy<C, S>(
        mut self,
        client_stream: C,
        upstream_stream: S,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.stats.on_connection_open();
        let _stats_guard = StatsGuard {
            stats: self.stats.clone(),
        };

        let mut client = Framed::new(client_stream, PacketCodec);
        let mut upstream = Framed::new(upstream_stream, PacketCodec);

        self.state = SessionState::Handshaking;
        if let Err(e) = relay_handshake(&mut client, &mut upstream, &mut self.ctx).await {
            warn!(session_id = self.id, error = %e, "handshake failed");
            self.state = SessionState::Closed;
            let _ = client.close().await;
            let _ = upstream.close().await;
            return Err(e.into());
        }

        self.state = SessionState::Ready;
        self.logger.log(AuditEvent::Connection {
            session_id: self.id,
            phase: "connect".to_string(),
            client_ip: self.ctx.client_ip.clone(),
            client_port: self.ctx.client_port,
            db_user: self.ctx.db_user.clone(),
            timestamp: now_timestamp(),
        });
        info!(
            session_id = self.id,
            user = %self.ctx.db_user,
            db = %self.ctx.db_name,
            "handshake done"
        );

        let result = self.command_loop(&mut client, &mut upstream).await;

        debug!(session_id = self.id, last_state = ?self.state, "tearing down session");
        self.state = SessionState::Closed;
        self.logger.log(AuditEvent::Connection {
            session_id: self.id,
            phase: "disconnect".to_string(),
            client_ip: self.ctx.client_ip.clone(),
            client_port: self.ctx.client_port,
            db_user: self.ctx.db_user.clone(),
            timestamp: now_timestamp(),
        });
        info!(
            session_id = self.id,
            connected_ms = (chrono::Utc::now() - self.ctx.connected_at).num_milliseconds(),
            "session closed"
        );

        let _ = client.close().await;
        let _ = upstream.close().await;
        result
    }

    async fn command_loop<C, S>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
        upstream: &mut Framed<S, PacketCodec>,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(session_id = self.id, "session cancelled");
                    self.state = SessionState::Closing;
                    return Ok(());
                }
                next = client.next() => next,
            };

            let packet = match next {
                Some(Ok(p)) => p,
                Some(Err(e)) => {
                    warn!(session_id = self.id, error = %e, "client read error");
                    return Err(e.into());
                }
                None => {
                    debug!(session_id = self.id, "client disconnected");
                    return Ok(());
                }
            };
            debug!(
                session_id = self.id,
                packet_type = ?packet.packet_type(),
                seq = packet.sequence_id,
                "client packet"
            );

            let cmd = match extract_command(&packet) {
                Ok(c) => c,
                Err(e) => {
                    // malformed or unsupported command byte: fail-close
                    warn!(session_id = self.id, error = %e, "rejecting command packet");
                    return Ok(());
                }
            };

            match cmd.command_type {
                CommandType::Quit => {
                    debug!(session_id = self.id, "COM_QUIT received");
                    let _ = upstream.send(packet).await;
                    self.close();
                    return Ok(());
                }

                CommandType::Query => {
                    self.handle_query(client, upstream, packet, &cmd).await?;
                }

                // The policy core only inspects COM_QUERY SQL; relaying the
                // prepared-statement family transparently would bypass it
                // entirely, so these are refused at the wire level.
                CommandType::StmtPrepare | CommandType::StmtExecute | CommandType::StmtReset => {
                    warn!(
                        session_id = self.id,
                        command = ?cmd.command_type,
                        "refusing prepared-statement command"
                    );
                    let err = Packet::make_error(
                        1235,
                        "Prepared statements are not supported by proxy policy enforcement",
                        cmd.sequence_id.wrapping_add(1),
                    );
                    client.send(err).await?;
                }

                _ => {
                    upstream.send(packet).await?;
                    self.relay_server_response(client, upstream, cmd.command_type)
                        .await?;
                }
            }
        }
    }

    async fn handle_query<C, S>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
        upstream: &mut Framed<S, PacketCodec>,
        packet: Packet,
        cmd: &CommandPacket,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.state = SessionState::ProcessingQuery;
        let started = Instant::now();

        let parse_result = self.classifier.parse(&cmd.query);

        let policy_result = match &parse_result {
            Err(e) => {
                warn!(
                    session_id = self.id,
                    error = %e,
                    sql = %truncate_sql(&cmd.query, 200),
                    "SQL rejected by classifier"
                );
                self.policy.evaluate_error(e, &self.ctx)
            }
            Ok(parsed) => {
                debug!(
                    session_id = self.id,
                    command = parsed.command.as_str(),
                    tables = ?parsed.tables,
                    has_where = parsed.has_where_clause,
                    "SQL analyzed"
                );
                let inj = self.injection.check(&cmd.query);
                if inj.detected {
                    warn!(
                        session_id = self.id,
                        pattern = %inj.matched_pattern,
                        reason = %inj.reason,
                        "injection heuristic matched"
                    );
                }
                if let Some(proc_info) = self.procedures.detect(parsed) {
                    debug!(
                        session_id = self.id,
                        procedure_type = ?proc_info.procedure_type,
                        procedure = %proc_info.procedure_name,
                        dynamic = proc_info.is_dynamic_sql,
                        "procedure statement observed"
                    );
                }
                self.policy.evaluate(parsed, &self.ctx)
            }
        };

        let duration = started.elapsed();
        let (command_tag, tables) = match &parse_result {
            Ok(p) => (p.command.as_str().to_string(), p.tables.clone()),
            Err(_) => ("UNKNOWN".to_string(), Vec::new()),
        };

        if policy_result.action == PolicyAction::Block {
            let err = Packet::make_error(
                1045,
                "Access denied by policy",
                cmd.sequence_id.wrapping_add(1),
            );
            client.send(err).await?;

            self.logger.log(AuditEvent::QueryBlocked {
                session_id: self.id,
                db_user: self.ctx.db_user.clone(),
                client_ip: self.ctx.client_ip.clone(),
                raw_sql: cmd.query.clone(),
                command: command_tag,
                matched_rule: policy_result.matched_rule,
                reason: policy_result.reason,
                timestamp: now_timestamp(),
                duration_us: duration.as_micros() as u64,
            });
            self.stats.on_query(true);
            self.state = SessionState::Ready;
            return Ok(());
        }

        upstream.send(packet).await?;
        self.relay_server_response(client, upstream, CommandType::Query)
            .await?;

        self.logger.log(AuditEvent::Query {
            session_id: self.id,
            db_user: self.ctx.db_user.clone(),
            client_ip: self.ctx.client_ip.clone(),
            raw_sql: cmd.query.clone(),
            command: command_tag,
            tables,
            action: policy_result.action.as_str().to_string(),
            timestamp: now_timestamp(),
            duration_us: duration.as_micros() as u64,
        });
        self.stats.on_query(false);
        self.state = SessionState::Ready;
        Ok(())
    }

    /// Relay one complete server response to the client.
    ///
    /// First-packet triage: ERR ends immediately; OK ends unless the request
    /// was COM_STMT_PREPARE (whose OK is followed by parameter and column
    /// metadata sections); a stray EOF ends; anything in 0x01..=0xFC is a
    /// column count opening a result set, relayed through the
    /// column-definitions and rows states until a terminator.
    async fn relay_server_response<C, S>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
        upstream: &mut Framed<S, PacketCodec>,
        request_type: CommandType,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
        S: AsyncRead + AsyncWrite + Unpin,
    {
        #[derive(PartialEq)]
        enum ResponseState {
            ColumnDefs,
            Rows,
        }

        let first = read_upstream(upstream).await?;
        client.send(first.clone()).await?;

        let payload = first.payload.clone();
        if payload.is_empty() {
            return Ok(());
        }

        let first_byte = payload[0];
        if first_byte == 0xFF {
            return Ok(());
        }

        if first_byte == 0x00 {
            if request_type == CommandType::StmtPrepare {
                if payload.len() < 12 {
                    warn!(
                        session_id = self.id,
                        len = payload.len(),
                        "short COM_STMT_PREPARE OK payload"
                    );
                    return Ok(());
                }
                let num_columns = u16::from_le_bytes([payload[5], payload[6]]);
                let num_params = u16::from_le_bytes([payload[7], payload[8]]);
                if num_params > 0 {
                    self.relay_prepare_section(client, upstream, num_params).await?;
                }
                if num_columns > 0 {
                    self.relay_prepare_section(client, upstream, num_columns).await?;
                }
            }
            return Ok(());
        }

        if first_byte == 0xFE && payload.len() < 9 {
            return Ok(());
        }

        if first_byte > 0xFC {
            warn!(
                session_id = self.id,
                first_byte, "unexpected first byte in server response"
            );
            return Ok(());
        }

        let column_count = first_byte;
        let mut column_defs_read: u16 = 0;
        let mut state = ResponseState::ColumnDefs;
        let mut prev_seq = first.sequence_id;

        loop {
            let pkt = read_upstream(upstream).await?;
            client.send(pkt.clone()).await?;

            let payload = &pkt.payload;
            if payload.is_empty() {
                break;
            }
            let byte0 = payload[0];

            // ERR terminates any state
            if byte0 == 0xFF {
                break;
            }

            // a backwards sequence id means a new command's response started
            if pkt.sequence_id < prev_seq && prev_seq != 0xFF {
                warn!(
                    session_id = self.id,
                    prev_seq,
                    seq = pkt.sequence_id,
                    "sequence id reversed, stopping relay"
                );
                break;
            }
            prev_seq = pkt.sequence_id;

            match state {
                ResponseState::ColumnDefs => {
                    if byte0 == 0xFE && payload.len() < 9 {
                        state = ResponseState::Rows;
                    } else {
                        column_defs_read += 1;
                        if column_defs_read > column_count as u16 + 1 {
                            warn!(
                                session_id = self.id,
                                column_defs_read, column_count, "too many column definitions"
                            );
                            break;
                        }
                    }
                }
                ResponseState::Rows => {
                    if byte0 == 0xFE && payload.len() < 9 {
                        break;
                    }
                    // A row whose first column is the empty string also
                    // starts with 0x00; only a packet that fails the row
                    // shape check and passes the OK structural check ends
                    // the result set. The handshake strips
                    // CLIENT_DEPRECATE_EOF so this should never fire, but
                    // the guard stays.
                    if request_type == CommandType::Query
                        && byte0 == 0x00
                        && !is_text_row_packet(payload, column_count)
                        && is_resultset_final_ok(payload)
                    {
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    async fn relay_prepare_section<C, S>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
        upstream: &mut Framed<S, PacketCodec>,
        count: u16,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
        S: AsyncRead + AsyncWrite + Unpin,
    {
        for _ in 0..count {
            let def = read_upstream(upstream).await?;
            client.send(def).await?;
        }
        let term = read_upstream(upstream).await?;
        let term_payload = term.payload.clone();
        client.send(term).await?;
        if !is_metadata_terminator(&term_payload) {
            warn!(
                session_id = self.id,
                first_byte = term_payload.first().copied().unwrap_or(0),
                "unexpected COM_STMT_PREPARE section terminator"
            );
        }
        Ok(())
    }
}

async fn read_upstream<S>(upstream: &mut Framed<S, PacketCodec>) -> Result<Packet, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match upstream.next().await {
        Some(Ok(p)) => Ok(p),
        Some(Err(e)) => Err(e.into()),
        None => Err(SessionError::Protocol(
            "upstream closed mid-response".to_string(),
        )),
    }
}

/// Truncate SQL for logging (avoid huge log entries)
fn truncate_sql(sql: &str, max_len: usize) -> String {
    if sql.len() <= max_len {
        sql.to_string()
    } else {
        let mut end = max_len;
        while !sql.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &sql[..end])
    }
}

/// Parse a MySQL length-encoded integer at `offset`, advancing it.
/// 0xFB (the NULL cell marker) is not a lenenc integer here.
fn parse_lenenc_int(payload: &[u8], offset: &mut usize) -> Option<u64> {
    let &first = payload.get(*offset)?;
    *offset += 1;

    match first {
        0..=0xFA => Some(first as u64),
        0xFC => {
            let bytes = payload.get(*offset..*offset + 2)?;
            *offset += 2;
            Some(u16::from_le_bytes([bytes[0], bytes[1]]) as u64)
        }
        0xFD => {
            let bytes = payload.get(*offset..*offset + 3)?;
            *offset += 3;
            Some(bytes[0] as u64 | (bytes[1] as u64) << 8 | (bytes[2] as u64) << 16)
        }
        0xFE => {
            let bytes = payload.get(*offset..*offset + 8)?;
            *offset += 8;
            let mut v: u64 = 0;
            for (i, b) in bytes.iter().enumerate() {
                v |= (*b as u64) << (8 * i);
            }
            Some(v)
        }
        _ => None,
    }
}

fn consume_lenenc_text_cell(payload: &[u8], offset: &mut usize) -> bool {
    match payload.get(*offset) {
        None => false,
        Some(0xFB) => {
            // NULL cell
            *offset += 1;
            true
        }
        Some(_) => {
            let Some(len) = parse_lenenc_int(payload, offset) else {
                return false;
            };
            let Some(end) = offset.checked_add(len as usize) else {
                return false;
            };
            if end > payload.len() {
                return false;
            }
            *offset = end;
            true
        }
    }
}

/// True when the payload is exactly `column_count` text-protocol cells.
fn is_text_row_packet(payload: &[u8], column_count: u8) -> bool {
    let mut offset = 0;
    for _ in 0..column_count {
        if !consume_lenenc_text_cell(payload, &mut offset) {
            return false;
        }
    }
    offset == payload.len()
}

/// Structural check for a result-set-final OK: 0x00 header, two decodable
/// length-encoded integers, then at least status_flags(2) + warnings(2).
fn is_resultset_final_ok(payload: &[u8]) -> bool {
    if payload.first() != Some(&0x00) {
        return false;
    }
    let mut offset = 1;
    if parse_lenenc_int(payload, &mut offset).is_none() {
        return false;
    }
    if parse_lenenc_int(payload, &mut offset).is_none() {
        return false;
    }
    offset + 4 <= payload.len()
}

fn is_metadata_terminator(payload: &[u8]) -> bool {
    (!payload.is_empty() && payload[0] == 0xFE && payload.len() < 9)
        || is_resultset_final_ok(payload)
}
