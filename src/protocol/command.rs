use crate::error::ParseError;

use super::packet::Packet;

/// Client command bytes the proxy accepts.
///
/// Anything outside this subset is refused at extraction time; the session
/// closes rather than relaying bytes it cannot reason about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandType {
    Quit = 0x01,
    InitDb = 0x02,
    Query = 0x03,
    FieldList = 0x04,
    CreateDb = 0x05,
    DropDb = 0x06,
    Refresh = 0x07,
    Statistics = 0x09,
    ProcessInfo = 0x0A,
    Connect = 0x0B,
    ProcessKill = 0x0C,
    Ping = 0x0E,
    StmtPrepare = 0x16,
    StmtExecute = 0x17,
    StmtClose = 0x19,
    StmtReset = 0x1A,
}

impl CommandType {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(CommandType::Quit),
            0x02 => Some(CommandType::InitDb),
            0x03 => Some(CommandType::Query),
            0x04 => Some(CommandType::FieldList),
            0x05 => Some(CommandType::CreateDb),
            0x06 => Some(CommandType::DropDb),
            0x07 => Some(CommandType::Refresh),
            0x09 => Some(CommandType::Statistics),
            0x0A => Some(CommandType::ProcessInfo),
            0x0B => Some(CommandType::Connect),
            0x0C => Some(CommandType::ProcessKill),
            0x0E => Some(CommandType::Ping),
            0x16 => Some(CommandType::StmtPrepare),
            0x17 => Some(CommandType::StmtExecute),
            0x19 => Some(CommandType::StmtClose),
            0x1A => Some(CommandType::StmtReset),
            _ => None,
        }
    }
}

/// Parsed client command
#[derive(Debug, Clone)]
pub struct CommandPacket {
    pub command_type: CommandType,
    pub sequence_id: u8,
    /// SQL text; non-empty only for `Query`
    pub query: String,
}

/// Map a packet to a `CommandPacket`.
///
/// For COM_QUERY the remaining payload bytes become the SQL string (lossy
/// UTF-8; embedded NULs pass through untouched).
pub fn extract_command(packet: &Packet) -> Result<CommandPacket, ParseError> {
    let payload = &packet.payload;
    if payload.is_empty() {
        return Err(ParseError::malformed("empty payload", ""));
    }

    let cmd_byte = payload[0];
    let command_type = CommandType::from_byte(cmd_byte).ok_or_else(|| {
        ParseError::unsupported_command(format!("unknown command byte: 0x{cmd_byte:02X}"))
    })?;

    let query = if command_type == CommandType::Query && payload.len() > 1 {
        String::from_utf8_lossy(&payload[1..]).into_owned()
    } else {
        String::new()
    };

    Ok(CommandPacket {
        command_type,
        sequence_id: packet.sequence_id,
        query,
    })
}
