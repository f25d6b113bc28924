//! MySQL authentication handshake relay.
//!
//! The branching logic (AuthSwitch/AuthMoreData loops, caching_sha2_password
//! sub-cases, HandshakeResponse41 parsing) lives in pure functions over byte
//! slices so it can be tested without sockets. `relay_handshake` is the thin
//! I/O shell that drives two framed streams and rewrites capability bits.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::error::ParseError;
use crate::session::SessionContext;

use super::codec::PacketCodec;
use super::packet::{capabilities::*, Packet};

/// Upper bound on AuthSwitch/AuthMoreData round trips before the relay
/// declares the exchange malformed.
pub const MAX_ROUND_TRIPS: u32 = 10;

/// Classification of a server packet during the auth phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthResponseType {
    /// 0x00 — handshake complete
    Ok,
    /// 0xFF — authentication failed
    Error,
    /// 0xFE with payload < 9 — handshake failed
    Eof,
    /// 0xFE with payload >= 9 — AuthSwitchRequest (the nine-byte minimum is
    /// the AuthSwitchRequest length floor)
    AuthSwitch,
    /// 0x01 — extra round trip (caching_sha2_password and friends)
    AuthMoreData,
    Unknown,
}

/// States of the handshake relay state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    WaitServerGreeting,
    WaitClientResponse,
    WaitServerAuth,
    WaitClientAuthSwitch,
    WaitServerAuthSwitch,
    WaitClientMoreData,
    WaitServerMoreData,
    Done,
    Failed,
}

/// I/O the shell must perform after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeAction {
    RelayToClient,
    RelayToServer,
    /// Relay the final packet to the client, then finish.
    Complete,
    /// Relay the error/EOF packet to the client, then terminate.
    Terminate,
    /// Terminate without relaying (unclassifiable bytes).
    TerminateNoRelay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeTransition {
    pub next_state: HandshakeState,
    pub action: HandshakeAction,
}

/// Fields the proxy needs out of the client's login packet.
#[derive(Debug, Clone, Default)]
pub struct HandshakeFields {
    pub username: String,
    pub database: String,
}

/// Classify an auth-phase packet by its first byte and length.
pub fn classify_auth_response(payload: &[u8]) -> AuthResponseType {
    let Some(&first) = payload.first() else {
        return AuthResponseType::Unknown;
    };
    match first {
        0x00 => AuthResponseType::Ok,
        0xFF => AuthResponseType::Error,
        0xFE => {
            if payload.len() < 9 {
                AuthResponseType::Eof
            } else {
                AuthResponseType::AuthSwitch
            }
        }
        0x01 => AuthResponseType::AuthMoreData,
        _ => AuthResponseType::Unknown,
    }
}

/// Pure transition function: current state + packet payload -> next state
/// plus the I/O action the shell must take.
///
/// Fail-close rules: nested AuthSwitch, round-trip cap overruns, and packets
/// in terminal states are all errors rather than lenient re-entries.
pub fn process_handshake_packet(
    current_state: HandshakeState,
    payload: &[u8],
    round_trips: u32,
) -> Result<HandshakeTransition, ParseError> {
    use HandshakeAction::*;
    use HandshakeState::*;

    let transition = |next_state, action| Ok(HandshakeTransition { next_state, action });

    match current_state {
        WaitServerGreeting => {
            if payload.is_empty() {
                return Err(ParseError::malformed("empty server greeting", ""));
            }
            // A server may answer the TCP connect with ERR (e.g. host blocked)
            if payload[0] == 0xFF {
                return transition(Failed, Terminate);
            }
            transition(WaitClientResponse, RelayToClient)
        }

        WaitClientResponse => {
            if payload.is_empty() {
                return Err(ParseError::malformed("empty handshake response", ""));
            }
            transition(WaitServerAuth, RelayToServer)
        }

        // The client's reply in an auth sub-exchange is opaque (it may even
        // be empty for an empty password); always forward it.
        WaitClientAuthSwitch => transition(WaitServerAuthSwitch, RelayToServer),
        WaitClientMoreData => transition(WaitServerMoreData, RelayToServer),

        WaitServerAuth | WaitServerAuthSwitch | WaitServerMoreData => {
            let class = classify_auth_response(payload);

            let in_loop = matches!(current_state, WaitServerAuthSwitch | WaitServerMoreData);
            if in_loop
                && matches!(class, AuthResponseType::AuthSwitch | AuthResponseType::AuthMoreData)
                && round_trips >= MAX_ROUND_TRIPS
            {
                return Err(ParseError::malformed(
                    "auth round-trip limit exceeded",
                    format!("round_trips={round_trips}"),
                ));
            }

            match class {
                AuthResponseType::Ok => transition(Done, Complete),
                AuthResponseType::Error => transition(Failed, Terminate),
                AuthResponseType::Eof => transition(Failed, Terminate),
                AuthResponseType::AuthSwitch => {
                    if current_state == WaitServerAuth {
                        transition(WaitClientAuthSwitch, RelayToClient)
                    } else {
                        Err(ParseError::malformed(
                            "nested AuthSwitch during auth exchange",
                            "",
                        ))
                    }
                }
                AuthResponseType::AuthMoreData => {
                    // caching_sha2_password: 0x01 0x03 is "fast auth OK"; the
                    // server speaks next, no client response expected.
                    let fast_auth_ok = matches!(current_state, WaitServerAuth | WaitServerMoreData)
                        && payload.get(1) == Some(&0x03);
                    if fast_auth_ok {
                        transition(WaitServerMoreData, RelayToClient)
                    } else {
                        transition(WaitClientMoreData, RelayToClient)
                    }
                }
                AuthResponseType::Unknown => {
                    if current_state == WaitServerMoreData {
                        // MySQL pushes the RSA public key without an
                        // AuthMoreData header
                        transition(WaitClientMoreData, RelayToClient)
                    } else {
                        transition(Failed, TerminateNoRelay)
                    }
                }
            }
        }

        Done | Failed => Err(ParseError::internal(
            "handshake state machine called in terminal state",
            format!("{current_state:?}"),
        )),
    }
}

/// Extract username and database from a HandshakeResponse41 payload.
///
/// Layout: 4B capability flags, 4B max packet size, 1B charset, 23B reserved,
/// NUL-terminated username, auth_response (framing depends on capability
/// bits), then a NUL-terminated database when CLIENT_CONNECT_WITH_DB is set.
/// Every overrun or missing terminator is a MalformedPacket.
pub fn extract_handshake_response_fields(payload: &[u8]) -> Result<HandshakeFields, ParseError> {
    if payload.len() < 33 {
        return Err(ParseError::malformed(
            "handshake response too short",
            format!("{} bytes, need at least 33", payload.len()),
        ));
    }

    let cap_flags = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);

    let mut pos = 32usize;

    let nul = payload[pos..]
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| ParseError::malformed("username missing null terminator", ""))?;
    let username = String::from_utf8_lossy(&payload[pos..pos + nul]).into_owned();
    pos += nul + 1;

    if cap_flags & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
        let &first = payload
            .get(pos)
            .ok_or_else(|| ParseError::malformed("auth_response length prefix missing", ""))?;
        pos += 1;
        let len = match first {
            0..=0xFA => first as usize,
            0xFC => {
                if pos + 2 > payload.len() {
                    return Err(ParseError::malformed("truncated lenenc auth_response length", ""));
                }
                let v = u16::from_le_bytes([payload[pos], payload[pos + 1]]) as usize;
                pos += 2;
                v
            }
            0xFD => {
                if pos + 3 > payload.len() {
                    return Err(ParseError::malformed("truncated lenenc auth_response length", ""));
                }
                let v = payload[pos] as usize
                    | (payload[pos + 1] as usize) << 8
                    | (payload[pos + 2] as usize) << 16;
                pos += 3;
                v
            }
            // 0xFB (NULL marker) and 0xFE/0xFF have no place here
            _ => {
                return Err(ParseError::malformed(
                    "invalid length-encoded auth_response marker",
                    format!("0x{first:02X}"),
                ))
            }
        };
        if pos + len > payload.len() {
            return Err(ParseError::malformed(
                "auth_response exceeds payload",
                format!("declared {}, available {}", len, payload.len() - pos),
            ));
        }
        pos += len;
    } else if cap_flags & CLIENT_SECURE_CONNECTION != 0 {
        let &len = payload
            .get(pos)
            .ok_or_else(|| ParseError::malformed("auth_response length prefix missing", ""))?;
        pos += 1;
        if pos + len as usize > payload.len() {
            return Err(ParseError::malformed(
                "auth_response exceeds payload",
                format!("declared {}, available {}", len, payload.len() - pos),
            ));
        }
        pos += len as usize;
    } else {
        let nul = payload[pos..]
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| ParseError::malformed("auth_response missing null terminator", ""))?;
        pos += nul + 1;
    }

    let database = if cap_flags & CLIENT_CONNECT_WITH_DB != 0 {
        if pos >= payload.len() {
            return Err(ParseError::malformed("database field missing", ""));
        }
        let nul = payload[pos..]
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| ParseError::malformed("database missing null terminator", ""))?;
        String::from_utf8_lossy(&payload[pos..pos + nul]).into_owned()
    } else {
        String::new()
    };

    Ok(HandshakeFields { username, database })
}

/// Clear the stripped capability bits inside a server greeting payload.
///
/// Walks the Handshake v10 layout: version byte, NUL-terminated server
/// version, connection id (4), auth data part 1 (8), filler (1),
/// capability_flags_1 (2), charset (1), status (2), capability_flags_2 (2).
/// Returns None when the layout cannot be walked; the caller forwards the
/// original bytes unchanged in that case (servers producing unparseable
/// greetings are already broken, dropping the handshake helps nobody).
pub fn strip_greeting_capabilities(payload: &[u8]) -> Option<Vec<u8>> {
    if payload.first() != Some(&0x0A) {
        return None;
    }
    let version_nul = payload[1..].iter().position(|&b| b == 0)?;
    // version byte + version string + NUL + conn id + auth data + filler
    let flags1_off = 1 + version_nul + 1 + 4 + 8 + 1;
    let flags2_off = flags1_off + 2 + 1 + 2;
    if payload.len() < flags2_off + 2 {
        return None;
    }

    let lower_mask = (STRIPPED_CAPABILITIES & 0xFFFF) as u16;
    let upper_mask = (STRIPPED_CAPABILITIES >> 16) as u16;

    let mut out = payload.to_vec();
    let flags1 = u16::from_le_bytes([out[flags1_off], out[flags1_off + 1]]) & !lower_mask;
    out[flags1_off..flags1_off + 2].copy_from_slice(&flags1.to_le_bytes());
    let flags2 = u16::from_le_bytes([out[flags2_off], out[flags2_off + 1]]) & !upper_mask;
    out[flags2_off..flags2_off + 2].copy_from_slice(&flags2.to_le_bytes());
    Some(out)
}

/// Clear the same bits in the first four bytes of a HandshakeResponse so the
/// server sees the client agreeing with what the client was shown.
pub fn strip_response_capabilities(payload: &[u8]) -> Option<Vec<u8>> {
    if payload.len() < 4 {
        return None;
    }
    let mut out = payload.to_vec();
    let flags = u32::from_le_bytes([out[0], out[1], out[2], out[3]]) & !STRIPPED_CAPABILITIES;
    out[..4].copy_from_slice(&flags.to_le_bytes());
    Some(out)
}

fn io_err(what: &str, e: impl std::fmt::Display) -> ParseError {
    ParseError::malformed(format!("handshake {what} failed"), e.to_string())
}

/// Drive the handshake between client and server, stripping capabilities and
/// capturing the login fields. On success `ctx.handshake_done` is set and the
/// session may enter the command loop; on failure the caller must tear the
/// session down.
pub async fn relay_handshake<C, S>(
    client: &mut Framed<C, PacketCodec>,
    server: &mut Framed<S, PacketCodec>,
    ctx: &mut SessionContext,
) -> Result<(), ParseError>
where
    C: AsyncRead + AsyncWrite + Unpin,
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut state = HandshakeState::WaitServerGreeting;
    let mut round_trips: u32 = 0;

    loop {
        let reading_server = matches!(
            state,
            HandshakeState::WaitServerGreeting
                | HandshakeState::WaitServerAuth
                | HandshakeState::WaitServerAuthSwitch
                | HandshakeState::WaitServerMoreData
        );

        let packet = if reading_server {
            server
                .next()
                .await
                .ok_or_else(|| ParseError::malformed("server closed during handshake", ""))?
                .map_err(|e| io_err("read", e))?
        } else {
            client
                .next()
                .await
                .ok_or_else(|| ParseError::malformed("client closed during handshake", ""))?
                .map_err(|e| io_err("read", e))?
        };

        let transition = process_handshake_packet(state, &packet.payload, round_trips)?;

        match transition.action {
            HandshakeAction::RelayToClient => {
                let packet = if state == HandshakeState::WaitServerGreeting {
                    match strip_greeting_capabilities(&packet.payload) {
                        Some(stripped) => Packet::new(packet.sequence_id, Bytes::from(stripped)),
                        None => {
                            warn!(
                                session_id = ctx.session_id,
                                "unparseable server greeting, forwarding unchanged"
                            );
                            packet
                        }
                    }
                } else {
                    round_trips += 1;
                    packet
                };
                client.send(packet).await.map_err(|e| io_err("write", e))?;
            }

            HandshakeAction::RelayToServer => {
                let packet = if state == HandshakeState::WaitClientResponse {
                    let fields = extract_handshake_response_fields(&packet.payload)?;
                    debug!(
                        session_id = ctx.session_id,
                        username = %fields.username,
                        database = %fields.database,
                        "handshake response parsed"
                    );
                    ctx.db_user = fields.username;
                    ctx.db_name = fields.database;
                    match strip_response_capabilities(&packet.payload) {
                        Some(stripped) => Packet::new(packet.sequence_id, Bytes::from(stripped)),
                        None => packet,
                    }
                } else {
                    packet
                };
                server.send(packet).await.map_err(|e| io_err("write", e))?;
            }

            HandshakeAction::Complete => {
                client.send(packet).await.map_err(|e| io_err("write", e))?;
                ctx.handshake_done = true;
                return Ok(());
            }

            HandshakeAction::Terminate => {
                // Surface the server-originated ERR/EOF to the client before
                // giving up; its delivery is best-effort.
                let _ = client.send(packet).await;
                return Err(ParseError::malformed("handshake rejected by server", ""));
            }

            HandshakeAction::TerminateNoRelay => {
                return Err(ParseError::malformed(
                    "unclassifiable packet during handshake",
                    "",
                ));
            }
        }

        state = transition.next_state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ParseErrorKind;

    fn payload_with(first_byte: u8, total: usize) -> Vec<u8> {
        let mut p = vec![0u8; total];
        if total > 0 {
            p[0] = first_byte;
        }
        p
    }

    #[test]
    fn test_classify_auth_response_table() {
        assert_eq!(classify_auth_response(&[0x00, 0, 0]), AuthResponseType::Ok);
        assert_eq!(classify_auth_response(&[0xFF, 0x15, 0x04]), AuthResponseType::Error);
        assert_eq!(classify_auth_response(&payload_with(0xFE, 8)), AuthResponseType::Eof);
        assert_eq!(classify_auth_response(&[0xFE]), AuthResponseType::Eof);
        assert_eq!(
            classify_auth_response(&payload_with(0xFE, 9)),
            AuthResponseType::AuthSwitch
        );
        assert_eq!(
            classify_auth_response(&payload_with(0xFE, 10)),
            AuthResponseType::AuthSwitch
        );
        assert_eq!(classify_auth_response(&[0x01, 0xAA]), AuthResponseType::AuthMoreData);
        assert_eq!(classify_auth_response(&[0x02, 0x00]), AuthResponseType::Unknown);
        assert_eq!(classify_auth_response(&[]), AuthResponseType::Unknown);
    }

    fn step(state: HandshakeState, payload: &[u8], round_trips: u32) -> HandshakeTransition {
        process_handshake_packet(state, payload, round_trips).unwrap()
    }

    #[test]
    fn test_greeting_relays_to_client() {
        let t = step(HandshakeState::WaitServerGreeting, &payload_with(0x0A, 77), 0);
        assert_eq!(t.next_state, HandshakeState::WaitClientResponse);
        assert_eq!(t.action, HandshakeAction::RelayToClient);
    }

    #[test]
    fn test_greeting_err_terminates() {
        let t = step(HandshakeState::WaitServerGreeting, &payload_with(0xFF, 10), 0);
        assert_eq!(t.next_state, HandshakeState::Failed);
        assert_eq!(t.action, HandshakeAction::Terminate);
    }

    #[test]
    fn test_empty_greeting_is_error() {
        let err = process_handshake_packet(HandshakeState::WaitServerGreeting, &[], 0).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::MalformedPacket);
    }

    #[test]
    fn test_client_response_relays_to_server() {
        let t = step(HandshakeState::WaitClientResponse, &payload_with(0x00, 50), 0);
        assert_eq!(t.next_state, HandshakeState::WaitServerAuth);
        assert_eq!(t.action, HandshakeAction::RelayToServer);
    }

    #[test]
    fn test_server_auth_outcomes() {
        let t = step(HandshakeState::WaitServerAuth, &[0x00], 0);
        assert_eq!((t.next_state, t.action), (HandshakeState::Done, HandshakeAction::Complete));

        let t = step(HandshakeState::WaitServerAuth, &payload_with(0xFF, 3), 0);
        assert_eq!((t.next_state, t.action), (HandshakeState::Failed, HandshakeAction::Terminate));

        let t = step(HandshakeState::WaitServerAuth, &payload_with(0xFE, 5), 0);
        assert_eq!((t.next_state, t.action), (HandshakeState::Failed, HandshakeAction::Terminate));

        let t = step(HandshakeState::WaitServerAuth, &payload_with(0xFE, 20), 0);
        assert_eq!(
            (t.next_state, t.action),
            (HandshakeState::WaitClientAuthSwitch, HandshakeAction::RelayToClient)
        );

        let t = step(HandshakeState::WaitServerAuth, &payload_with(0x01, 5), 0);
        assert_eq!(
            (t.next_state, t.action),
            (HandshakeState::WaitClientMoreData, HandshakeAction::RelayToClient)
        );

        let t = step(HandshakeState::WaitServerAuth, &payload_with(0xAB, 2), 0);
        assert_eq!(
            (t.next_state, t.action),
            (HandshakeState::Failed, HandshakeAction::TerminateNoRelay)
        );
    }

    #[test]
    fn test_fast_auth_ok_keeps_server_turn() {
        // 0x01 0x03 = caching_sha2 "fast auth OK": server speaks next
        let t = step(HandshakeState::WaitServerAuth, &[0x01, 0x03], 0);
        assert_eq!(t.next_state, HandshakeState::WaitServerMoreData);
        assert_eq!(t.action, HandshakeAction::RelayToClient);

        let t = step(HandshakeState::WaitServerMoreData, &[0x01, 0x03], 1);
        assert_eq!(t.next_state, HandshakeState::WaitServerMoreData);
    }

    #[test]
    fn test_auth_switch_cycle() {
        let t = step(HandshakeState::WaitClientAuthSwitch, &payload_with(0xAA, 10), 1);
        assert_eq!(
            (t.next_state, t.action),
            (HandshakeState::WaitServerAuthSwitch, HandshakeAction::RelayToServer)
        );

        let t = step(HandshakeState::WaitServerAuthSwitch, &[0x00], 1);
        assert_eq!((t.next_state, t.action), (HandshakeState::Done, HandshakeAction::Complete));

        let t = step(HandshakeState::WaitServerAuthSwitch, &payload_with(0xFF, 3), 1);
        assert_eq!(t.action, HandshakeAction::Terminate);

        // AuthSwitch can chain into the MoreData loop
        let t = step(HandshakeState::WaitServerAuthSwitch, &payload_with(0x01, 5), 1);
        assert_eq!(t.next_state, HandshakeState::WaitClientMoreData);
    }

    #[test]
    fn test_more_data_cycle() {
        let t = step(HandshakeState::WaitClientMoreData, &payload_with(0xBB, 8), 1);
        assert_eq!(
            (t.next_state, t.action),
            (HandshakeState::WaitServerMoreData, HandshakeAction::RelayToServer)
        );

        let t = step(HandshakeState::WaitServerMoreData, &[0x00], 1);
        assert_eq!(t.action, HandshakeAction::Complete);

        let t = step(HandshakeState::WaitServerMoreData, &payload_with(0x01, 5), 2);
        assert_eq!(t.next_state, HandshakeState::WaitClientMoreData);
    }

    #[test]
    fn test_rsa_key_push_tolerated_in_more_data() {
        // MySQL sends the RSA public key without an AuthMoreData header
        let t = step(HandshakeState::WaitServerMoreData, &payload_with(0x2D, 270), 1);
        assert_eq!(
            (t.next_state, t.action),
            (HandshakeState::WaitClientMoreData, HandshakeAction::RelayToClient)
        );
    }

    #[test]
    fn test_round_trip_cap() {
        for state in [HandshakeState::WaitServerMoreData, HandshakeState::WaitServerAuthSwitch] {
            let err =
                process_handshake_packet(state, &payload_with(0x01, 5), MAX_ROUND_TRIPS).unwrap_err();
            assert_eq!(err.kind, ParseErrorKind::MalformedPacket);
        }
        // a final OK still completes even at the cap
        let t = step(HandshakeState::WaitServerMoreData, &[0x00], MAX_ROUND_TRIPS);
        assert_eq!(t.action, HandshakeAction::Complete);
    }

    #[test]
    fn test_nested_auth_switch_fails() {
        for state in [HandshakeState::WaitServerAuthSwitch, HandshakeState::WaitServerMoreData] {
            let err = process_handshake_packet(state, &payload_with(0xFE, 20), 1).unwrap_err();
            assert_eq!(err.kind, ParseErrorKind::MalformedPacket);
        }
    }

    #[test]
    fn test_terminal_states_reject_packets() {
        for state in [HandshakeState::Done, HandshakeState::Failed] {
            let err = process_handshake_packet(state, &[0x00], 0).unwrap_err();
            assert_eq!(err.kind, ParseErrorKind::InternalError);
        }
    }

    // -- HandshakeResponse41 extraction ------------------------------------

    fn build_response(username: &str, db: &str, with_db: bool) -> Vec<u8> {
        // CLIENT_LONG_PASSWORD | CLIENT_PROTOCOL_41 | CLIENT_SECURE_CONNECTION
        let mut cap: u32 = 0x0000_8201;
        if with_db {
            cap |= CLIENT_CONNECT_WITH_DB;
        }
        let mut p = Vec::new();
        p.extend_from_slice(&cap.to_le_bytes());
        p.extend_from_slice(&0x0100_0000u32.to_le_bytes()); // max packet size
        p.push(0x21); // charset
        p.extend_from_slice(&[0u8; 23]);
        p.extend_from_slice(username.as_bytes());
        p.push(0);
        let auth = b"dummy_auth_data";
        p.push(auth.len() as u8);
        p.extend_from_slice(auth);
        if with_db {
            p.extend_from_slice(db.as_bytes());
            p.push(0);
        }
        p
    }

    #[test]
    fn test_extract_fields_normal() {
        let fields = extract_handshake_response_fields(&build_response("testuser", "testdb", true))
            .unwrap();
        assert_eq!(fields.username, "testuser");
        assert_eq!(fields.database, "testdb");
    }

    #[test]
    fn test_extract_fields_without_db() {
        let fields =
            extract_handshake_response_fields(&build_response("alice", "ignored", false)).unwrap();
        assert_eq!(fields.username, "alice");
        assert!(fields.database.is_empty());
    }

    #[test]
    fn test_extract_fields_empty_username() {
        let fields = extract_handshake_response_fields(&build_response("", "mydb", true)).unwrap();
        assert!(fields.username.is_empty());
        assert_eq!(fields.database, "mydb");
    }

    #[test]
    fn test_extract_fields_short_payloads() {
        for len in [0usize, 31, 32] {
            let err = extract_handshake_response_fields(&vec![0u8; len]).unwrap_err();
            assert_eq!(err.kind, ParseErrorKind::MalformedPacket, "len {len}");
        }
    }

    #[test]
    fn test_extract_fields_username_without_terminator() {
        let mut p = vec![0xAAu8; 100];
        p[..4].copy_from_slice(&CLIENT_SECURE_CONNECTION.to_le_bytes());
        let err = extract_handshake_response_fields(&p).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::MalformedPacket);
    }

    #[test]
    fn test_extract_fields_lenenc_fe_rejected() {
        let mut p = Vec::new();
        p.extend_from_slice(&CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA.to_le_bytes());
        p.extend_from_slice(&[0u8; 28]);
        p.extend_from_slice(b"u\0");
        p.push(0xFE);
        p.extend_from_slice(&[0u8; 8]);
        let err = extract_handshake_response_fields(&p).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::MalformedPacket);
    }

    #[test]
    fn test_extract_fields_lenenc_fc() {
        let mut p = Vec::new();
        p.extend_from_slice(&CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA.to_le_bytes());
        p.extend_from_slice(&[0u8; 28]);
        p.extend_from_slice(b"bob\0");
        p.push(0xFC);
        p.extend_from_slice(&3u16.to_le_bytes());
        p.extend_from_slice(&[0x11, 0x22, 0x33]);
        let fields = extract_handshake_response_fields(&p).unwrap();
        assert_eq!(fields.username, "bob");
        assert!(fields.database.is_empty());
    }

    #[test]
    fn test_extract_fields_auth_length_overrun() {
        let mut p = Vec::new();
        p.extend_from_slice(&CLIENT_SECURE_CONNECTION.to_le_bytes());
        p.extend_from_slice(&[0u8; 28]);
        p.extend_from_slice(b"root\0");
        p.push(200); // declares 200 bytes, only 5 follow
        p.extend_from_slice(&[0xAA, 0xBB, 0xCC, 0xDD, 0xEE]);
        let err = extract_handshake_response_fields(&p).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::MalformedPacket);
    }

    #[test]
    fn test_extract_fields_auth_prefix_missing() {
        let mut p = Vec::new();
        p.extend_from_slice(&CLIENT_SECURE_CONNECTION.to_le_bytes());
        p.extend_from_slice(&[0u8; 28]);
        p.extend_from_slice(b"alice\0");
        let err = extract_handshake_response_fields(&p).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::MalformedPacket);
        assert!(err.message.contains("length prefix missing"));
    }

    #[test]
    fn test_extract_fields_db_missing() {
        let mut p = Vec::new();
        p.extend_from_slice(&(CLIENT_SECURE_CONNECTION | CLIENT_CONNECT_WITH_DB).to_le_bytes());
        p.extend_from_slice(&[0u8; 28]);
        p.extend_from_slice(b"root\0");
        p.push(3);
        p.extend_from_slice(&[0xAA, 0xBB, 0xCC]);
        let err = extract_handshake_response_fields(&p).unwrap_err();
        assert!(err.message.contains("database field missing"));
    }

    #[test]
    fn test_extract_fields_db_without_terminator() {
        let mut p = Vec::new();
        p.extend_from_slice(&(CLIENT_SECURE_CONNECTION | CLIENT_CONNECT_WITH_DB).to_le_bytes());
        p.extend_from_slice(&[0u8; 28]);
        p.extend_from_slice(b"u\0");
        p.push(1);
        p.push(0xAA);
        p.extend_from_slice(b"mydb"); // no terminator
        let err = extract_handshake_response_fields(&p).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::MalformedPacket);
    }

    #[test]
    fn test_extract_fields_legacy_auth_without_terminator() {
        let mut p = Vec::new();
        p.extend_from_slice(&0u32.to_le_bytes());
        p.extend_from_slice(&[0u8; 28]);
        p.extend_from_slice(b"u\0");
        p.extend_from_slice(b"abc"); // no terminator
        let err = extract_handshake_response_fields(&p).unwrap_err();
        assert!(err.message.contains("null terminator"));
    }

    // -- capability stripping ----------------------------------------------

    fn build_greeting(cap_flags: u32) -> Vec<u8> {
        let mut p = Vec::new();
        p.push(0x0A);
        p.extend_from_slice(b"8.0.36\0");
        p.extend_from_slice(&42u32.to_le_bytes()); // connection id
        p.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]); // auth data part 1
        p.push(0); // filler
        p.extend_from_slice(&((cap_flags & 0xFFFF) as u16).to_le_bytes());
        p.push(0x21); // charset
        p.extend_from_slice(&2u16.to_le_bytes()); // status
        p.extend_from_slice(&((cap_flags >> 16) as u16).to_le_bytes());
        p.push(21); // auth plugin data len
        p.extend_from_slice(&[0u8; 10]); // reserved
        p.extend_from_slice(&[9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20]);
        p.push(0);
        p.extend_from_slice(b"mysql_native_password\0");
        p
    }

    fn greeting_caps(payload: &[u8]) -> u32 {
        let nul = payload[1..].iter().position(|&b| b == 0).unwrap();
        let f1 = 1 + nul + 1 + 4 + 8 + 1;
        let f2 = f1 + 5;
        u16::from_le_bytes([payload[f1], payload[f1 + 1]]) as u32
            | (u16::from_le_bytes([payload[f2], payload[f2 + 1]]) as u32) << 16
    }

    #[test]
    fn test_strip_greeting_clears_only_target_bits() {
        let advertised =
            CLIENT_SSL | CLIENT_QUERY_ATTRIBUTES | CLIENT_DEPRECATE_EOF | CLIENT_PROTOCOL_41
                | CLIENT_PLUGIN_AUTH | CLIENT_SECURE_CONNECTION;
        let greeting = build_greeting(advertised);
        let stripped = strip_greeting_capabilities(&greeting).unwrap();
        assert_eq!(greeting_caps(&stripped), advertised & !STRIPPED_CAPABILITIES);
        // every byte outside the two flag fields is untouched
        assert_eq!(stripped.len(), greeting.len());
        let nul = greeting[1..].iter().position(|&b| b == 0).unwrap();
        let f1 = 1 + nul + 1 + 4 + 8 + 1;
        let f2 = f1 + 5;
        for (i, (a, b)) in greeting.iter().zip(stripped.iter()).enumerate() {
            if !(i == f1 || i == f1 + 1 || i == f2 || i == f2 + 1) {
                assert_eq!(a, b, "byte {i} changed");
            }
        }
    }

    #[test]
    fn test_strip_greeting_unwalkable_returns_none() {
        assert!(strip_greeting_capabilities(&[]).is_none());
        assert!(strip_greeting_capabilities(&[0x0A, b'8']).is_none());
        // version string never terminated
        assert!(strip_greeting_capabilities(&[0x0A, b'8', b'.', b'0']).is_none());
    }

    #[test]
    fn test_strip_response_capabilities() {
        let caps = CLIENT_SSL | CLIENT_DEPRECATE_EOF | CLIENT_QUERY_ATTRIBUTES | CLIENT_PROTOCOL_41;
        let mut payload = caps.to_le_bytes().to_vec();
        payload.extend_from_slice(&[0u8; 40]);
        let stripped = strip_response_capabilities(&payload).unwrap();
        let flags = u32::from_le_bytes([stripped[0], stripped[1], stripped[2], stripped[3]]);
        assert_eq!(flags, CLIENT_PROTOCOL_41);
        assert!(strip_response_capabilities(&[0x01, 0x02]).is_none());
    }

    // -- I/O shell ----------------------------------------------------------

    use crate::session::SessionContext;
    use tokio::io::AsyncWriteExt;

    async fn write_packet(stream: &mut tokio::io::DuplexStream, seq: u8, payload: &[u8]) {
        let pkt = Packet::new(seq, Bytes::copy_from_slice(payload));
        stream.write_all(&pkt.serialize()).await.unwrap();
    }

    async fn read_packet(stream: &mut tokio::io::DuplexStream) -> (u8, Vec<u8>) {
        use tokio::io::AsyncReadExt;
        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await.unwrap();
        let len = header[0] as usize | (header[1] as usize) << 8 | (header[2] as usize) << 16;
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await.unwrap();
        (header[3], payload)
    }

    #[tokio::test]
    async fn test_relay_handshake_happy_path() {
        let (client_proxy, mut client_peer) = tokio::io::duplex(8192);
        let (server_proxy, mut server_peer) = tokio::io::duplex(8192);

        let relay = tokio::spawn(async move {
            let mut client = Framed::new(client_proxy, PacketCodec);
            let mut server = Framed::new(server_proxy, PacketCodec);
            let mut ctx = SessionContext::new(7);
            relay_handshake(&mut client, &mut server, &mut ctx)
                .await
                .map(|_| ctx)
        });

        let advertised = CLIENT_SSL | CLIENT_DEPRECATE_EOF | CLIENT_PROTOCOL_41
            | CLIENT_SECURE_CONNECTION | CLIENT_PLUGIN_AUTH;
        write_packet(&mut server_peer, 0, &build_greeting(advertised)).await;

        let (_, greeting_seen) = read_packet(&mut client_peer).await;
        assert_eq!(greeting_caps(&greeting_seen), advertised & !STRIPPED_CAPABILITIES);

        write_packet(&mut client_peer, 1, &build_response("testuser", "testdb", true)).await;
        let (_, response_seen) = read_packet(&mut server_peer).await;
        let flags = u32::from_le_bytes([
            response_seen[0],
            response_seen[1],
            response_seen[2],
            response_seen[3],
        ]);
        assert_eq!(flags & STRIPPED_CAPABILITIES, 0);

        write_packet(&mut server_peer, 2, &[0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00]).await;
        let (seq, ok_seen) = read_packet(&mut client_peer).await;
        assert_eq!(seq, 2);
        assert_eq!(ok_seen[0], 0x00);

        let ctx = relay.await.unwrap().unwrap();
        assert!(ctx.handshake_done);
        assert_eq!(ctx.db_user, "testuser");
        assert_eq!(ctx.db_name, "testdb");
    }

    #[tokio::test]
    async fn test_relay_handshake_malformed_response_terminates() {
        let (client_proxy, mut client_peer) = tokio::io::duplex(8192);
        let (server_proxy, mut server_peer) = tokio::io::duplex(8192);

        let relay = tokio::spawn(async move {
            let mut client = Framed::new(client_proxy, PacketCodec);
            let mut server = Framed::new(server_proxy, PacketCodec);
            let mut ctx = SessionContext::new(8);
            relay_handshake(&mut client, &mut server, &mut ctx).await
        });

        write_packet(&mut server_peer, 0, &build_greeting(CLIENT_SECURE_CONNECTION)).await;
        let _ = read_packet(&mut client_peer).await;

        // 32 zero bytes: no room for a NUL-terminated username
        write_packet(&mut client_peer, 1, &[0u8; 32]).await;

        let err = relay.await.unwrap().unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::MalformedPacket);
    }

    #[tokio::test]
    async fn test_relay_handshake_auth_error_forwarded() {
        let (client_proxy, mut client_peer) = tokio::io::duplex(8192);
        let (server_proxy, mut server_peer) = tokio::io::duplex(8192);

        let relay = tokio::spawn(async move {
            let mut client = Framed::new(client_proxy, PacketCodec);
            let mut server = Framed::new(server_proxy, PacketCodec);
            let mut ctx = SessionContext::new(9);
            relay_handshake(&mut client, &mut server, &mut ctx).await
        });

        write_packet(&mut server_peer, 0, &build_greeting(CLIENT_SECURE_CONNECTION)).await;
        let _ = read_packet(&mut client_peer).await;
        write_packet(&mut client_peer, 1, &build_response("baduser", "", false)).await;
        let _ = read_packet(&mut server_peer).await;

        // server rejects the login
        let err_pkt = Packet::make_error(1045, "Access denied for user", 2);
        write_packet(&mut server_peer, 2, &err_pkt.payload).await;

        let (_, forwarded) = read_packet(&mut client_peer).await;
        assert_eq!(forwarded[0], 0xFF);
        assert!(relay.await.unwrap().is_err());
    }
}
