pub mod codec;
pub mod command;
pub mod handshake;
pub mod packet;

pub use codec::PacketCodec;
pub use command::{extract_command, CommandPacket, CommandType};
pub use packet::{capabilities, Packet, PacketType};
