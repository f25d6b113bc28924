use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ParseError;

/// MySQL packet header size: 3 bytes length + 1 byte sequence
pub const PACKET_HEADER_SIZE: usize = 4;
/// Maximum packet payload size (16MB - 1)
pub const MAX_PACKET_SIZE: usize = 0xFF_FF_FF;

/// Packet kind derived from the first payload byte.
///
/// `0x00` doubles as the OK header and the first byte of a
/// `HandshakeResponse`; classification prefers OK, context decides the rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Handshake,
    /// A client login packet has no distinguishing first byte, so byte
    /// classification alone never yields this; handshake state decides
    #[allow(dead_code)]
    HandshakeResponse,
    ComQuery,
    ComQuit,
    Ok,
    Error,
    Eof,
    Unknown,
}

/// MySQL wire protocol packet
#[derive(Debug, Clone)]
pub struct Packet {
    pub sequence_id: u8,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(sequence_id: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            sequence_id,
            payload: payload.into(),
        }
    }

    /// Classify by the first payload byte.
    ///
    /// `0xFE` is an EOF packet only when the payload is shorter than 9 bytes;
    /// at 9 bytes or more it is AuthSwitchRequest-sized and stays Unknown.
    pub fn packet_type(&self) -> PacketType {
        let Some(&first) = self.payload.first() else {
            return PacketType::Unknown;
        };
        match first {
            0xFF => PacketType::Error,
            0xFE => {
                if self.payload.len() < 9 {
                    PacketType::Eof
                } else {
                    PacketType::Unknown
                }
            }
            0x0A => PacketType::Handshake,
            0x03 => PacketType::ComQuery,
            0x01 => PacketType::ComQuit,
            0x00 => PacketType::Ok,
            _ => PacketType::Unknown,
        }
    }

    /// Encode packet to bytes (header + payload)
    pub fn encode(&self, dst: &mut BytesMut) {
        let len = self.payload.len();
        // 3 bytes for length (little endian)
        dst.put_u8((len & 0xFF) as u8);
        dst.put_u8(((len >> 8) & 0xFF) as u8);
        dst.put_u8(((len >> 16) & 0xFF) as u8);
        // 1 byte for sequence id
        dst.put_u8(self.sequence_id);
        // Payload
        dst.extend_from_slice(&self.payload);
    }

    /// Serialize to a standalone buffer.
    ///
    /// Returns an empty vector when the payload exceeds the 3-byte length
    /// field; callers must treat that as an error. Packets produced by
    /// `decode` can never hit this path.
    pub fn serialize(&self) -> Vec<u8> {
        if self.payload.len() > MAX_PACKET_SIZE {
            return Vec::new();
        }
        let mut buf = BytesMut::with_capacity(PACKET_HEADER_SIZE + self.payload.len());
        self.encode(&mut buf);
        buf.to_vec()
    }

    /// Try to decode packet from bytes, returns None if not enough data
    pub fn decode(src: &mut BytesMut) -> Option<Self> {
        if src.len() < PACKET_HEADER_SIZE {
            return None;
        }

        // Read length (3 bytes, little endian)
        let len = src[0] as usize | ((src[1] as usize) << 8) | ((src[2] as usize) << 16);

        let total_len = PACKET_HEADER_SIZE + len;
        if src.len() < total_len {
            return None;
        }

        // Read sequence id
        let sequence_id = src[3];

        // Advance past header
        src.advance(PACKET_HEADER_SIZE);

        // Read payload
        let payload = src.split_to(len).freeze();

        Some(Self {
            sequence_id,
            payload,
        })
    }

    /// Parse a complete packet from a contiguous buffer.
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() < PACKET_HEADER_SIZE {
            return Err(ParseError::malformed(
                "packet too short",
                format!("received {} bytes, need at least 4", data.len()),
            ));
        }

        let len = data[0] as usize | ((data[1] as usize) << 8) | ((data[2] as usize) << 16);
        if data.len() < PACKET_HEADER_SIZE + len {
            return Err(ParseError::malformed(
                "incomplete payload",
                format!("declared length={}, available={}", len, data.len() - 4),
            ));
        }

        Ok(Self {
            sequence_id: data[3],
            payload: Bytes::copy_from_slice(&data[4..4 + len]),
        })
    }

    /// Build a MySQL ERR packet: `[0xFF][code LE][#][HY000][message]`.
    ///
    /// The message is truncated so the total payload fits the 3-byte length
    /// field.
    pub fn make_error(error_code: u16, message: &str, sequence_id: u8) -> Self {
        const SQL_STATE: &[u8; 5] = b"HY000";
        // 1 (0xFF) + 2 (code) + 1 ('#') + 5 (state)
        const FIXED_HEADER_LEN: usize = 9;

        let max_msg_len = MAX_PACKET_SIZE - FIXED_HEADER_LEN;
        let safe_message = if message.len() > max_msg_len {
            &message.as_bytes()[..max_msg_len]
        } else {
            message.as_bytes()
        };

        let mut buf = BytesMut::with_capacity(FIXED_HEADER_LEN + safe_message.len());
        buf.put_u8(0xFF);
        buf.put_u16_le(error_code);
        buf.put_u8(b'#');
        buf.extend_from_slice(SQL_STATE);
        buf.extend_from_slice(safe_message);

        Self {
            sequence_id,
            payload: buf.freeze(),
        }
    }
}

/// MySQL capability flags
#[allow(dead_code)]
pub mod capabilities {
    pub const CLIENT_LONG_PASSWORD: u32 = 1;
    pub const CLIENT_FOUND_ROWS: u32 = 1 << 1;
    pub const CLIENT_LONG_FLAG: u32 = 1 << 2;
    pub const CLIENT_CONNECT_WITH_DB: u32 = 1 << 3;
    pub const CLIENT_NO_SCHEMA: u32 = 1 << 4;
    pub const CLIENT_COMPRESS: u32 = 1 << 5;
    pub const CLIENT_ODBC: u32 = 1 << 6;
    pub const CLIENT_LOCAL_FILES: u32 = 1 << 7;
    pub const CLIENT_IGNORE_SPACE: u32 = 1 << 8;
    pub const CLIENT_PROTOCOL_41: u32 = 1 << 9;
    pub const CLIENT_INTERACTIVE: u32 = 1 << 10;
    pub const CLIENT_SSL: u32 = 1 << 11;
    pub const CLIENT_IGNORE_SIGPIPE: u32 = 1 << 13;
    pub const CLIENT_TRANSACTIONS: u32 = 1 << 14;
    pub const CLIENT_SECURE_CONNECTION: u32 = 1 << 15;
    pub const CLIENT_MULTI_STATEMENTS: u32 = 1 << 16;
    pub const CLIENT_MULTI_RESULTS: u32 = 1 << 17;
    pub const CLIENT_PS_MULTI_RESULTS: u32 = 1 << 18;
    pub const CLIENT_PLUGIN_AUTH: u32 = 1 << 19;
    pub const CLIENT_CONNECT_ATTRS: u32 = 1 << 20;
    pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 1 << 21;
    pub const CLIENT_DEPRECATE_EOF: u32 = 1 << 24;
    pub const CLIENT_QUERY_ATTRIBUTES: u32 = 1 << 27;

    /// Bits the proxy clears during handshake in both directions.
    ///
    /// CLIENT_SSL: the proxy does not speak TLS; advertising it would make
    /// the client send an SSLRequest that mis-parses as a HandshakeResponse.
    /// CLIENT_DEPRECATE_EOF: forces classic EOF-terminated result sets,
    /// which the response relayer understands.
    /// CLIENT_QUERY_ATTRIBUTES: an attribute header before the COM_QUERY
    /// payload would break SQL extraction.
    pub const STRIPPED_CAPABILITIES: u32 =
        CLIENT_SSL | CLIENT_DEPRECATE_EOF | CLIENT_QUERY_ATTRIBUTES;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(data: &[u8]) -> Packet {
        let pkt = Packet::parse(data).unwrap();
        assert_eq!(pkt.serialize(), data);
        pkt
    }

    #[test]
    fn test_parse_serialize_roundtrip() {
        let pkt = roundtrip(&[0x02, 0x00, 0x00, 0x00, 0x03, 0x41]);
        assert_eq!(pkt.sequence_id, 0);
        assert_eq!(pkt.packet_type(), PacketType::ComQuery);
    }

    #[test]
    fn test_parse_empty_payload() {
        let pkt = roundtrip(&[0x00, 0x00, 0x00, 0x02]);
        assert!(pkt.payload.is_empty());
        assert_eq!(pkt.packet_type(), PacketType::Unknown);
    }

    #[test]
    fn test_parse_too_short() {
        let err = Packet::parse(&[0x01, 0x00, 0x00]).unwrap_err();
        assert_eq!(err.kind, crate::error::ParseErrorKind::MalformedPacket);
    }

    #[test]
    fn test_parse_incomplete_payload() {
        let err = Packet::parse(&[0x05, 0x00, 0x00, 0x00, 0x03]).unwrap_err();
        assert_eq!(err.kind, crate::error::ParseErrorKind::MalformedPacket);
    }

    #[test]
    fn test_packet_type_classification() {
        let cases: &[(&[u8], PacketType)] = &[
            (&[0xFF, 0x15, 0x04], PacketType::Error),
            (&[0xFE], PacketType::Eof),
            (&[0xFE, 0, 0, 2, 0], PacketType::Eof),
            (&[0x0A, b'8'], PacketType::Handshake),
            (&[0x03, b'S'], PacketType::ComQuery),
            (&[0x01], PacketType::ComQuit),
            (&[0x00, 0, 0], PacketType::Ok),
            (&[0xAB, 0x01], PacketType::Unknown),
        ];
        for (payload, expected) in cases {
            let pkt = Packet::new(0, Bytes::copy_from_slice(payload));
            assert_eq!(pkt.packet_type(), *expected, "payload {payload:?}");
        }
    }

    #[test]
    fn test_eof_boundary_at_nine_bytes() {
        // 8-byte payload is EOF, 9-byte payload is AuthSwitch-sized Unknown
        let eof = Packet::new(0, Bytes::copy_from_slice(&[0xFE; 8]));
        assert_eq!(eof.packet_type(), PacketType::Eof);
        let auth_switch = Packet::new(0, Bytes::copy_from_slice(&[0xFE; 9]));
        assert_eq!(auth_switch.packet_type(), PacketType::Unknown);
    }

    #[test]
    fn test_serialize_oversized_payload_is_empty() {
        let pkt = Packet::new(0, vec![0u8; MAX_PACKET_SIZE + 1]);
        assert!(pkt.serialize().is_empty());
    }

    #[test]
    fn test_make_error_layout() {
        let pkt = Packet::make_error(1045, "Access denied by policy", 1);
        assert_eq!(pkt.sequence_id, 1);
        assert_eq!(pkt.payload[0], 0xFF);
        assert_eq!(u16::from_le_bytes([pkt.payload[1], pkt.payload[2]]), 1045);
        assert_eq!(pkt.payload[3], b'#');
        assert_eq!(&pkt.payload[4..9], b"HY000");
        assert_eq!(&pkt.payload[9..], b"Access denied by policy");
        assert_eq!(pkt.packet_type(), PacketType::Error);
    }

    #[test]
    fn test_make_error_empty_message() {
        let pkt = Packet::make_error(2000, "", 0);
        assert_eq!(pkt.payload.len(), 9);
        assert_eq!(pkt.payload[0], 0xFF);
    }

    #[test]
    fn test_make_error_truncates_oversized_message() {
        let over = "Y".repeat(MAX_PACKET_SIZE - 9 + 1);
        let pkt = Packet::make_error(1234, &over, 1);
        assert_eq!(pkt.payload.len(), MAX_PACKET_SIZE);
        assert_eq!(pkt.payload[0], 0xFF);
        assert_eq!(pkt.payload[9], b'Y');
        assert!(!pkt.serialize().is_empty());
    }

    #[test]
    fn test_make_error_parses_back() {
        let pkt = Packet::make_error(2003, "upstream down", 5);
        let bytes = pkt.serialize();
        let parsed = Packet::parse(&bytes).unwrap();
        assert_eq!(parsed.sequence_id, 5);
        assert_eq!(parsed.packet_type(), PacketType::Error);
    }

    #[test]
    fn test_decode_partial_returns_none() {
        let mut buf = BytesMut::from(&[0x05, 0x00, 0x00][..]);
        assert!(Packet::decode(&mut buf).is_none());
        let mut buf = BytesMut::from(&[0x05, 0x00, 0x00, 0x01, 0x03][..]);
        assert!(Packet::decode(&mut buf).is_none());
    }

    #[test]
    fn test_decode_consumes_frame() {
        let mut buf = BytesMut::from(&[0x01, 0x00, 0x00, 0x07, 0x0E, 0x02, 0x00, 0x00, 0x00][..]);
        let pkt = Packet::decode(&mut buf).unwrap();
        assert_eq!(pkt.sequence_id, 0x07);
        assert_eq!(pkt.payload.as_ref(), &[0x0E]);
        // next frame header is left in the buffer
        assert_eq!(buf.len(), 4);
    }
}
