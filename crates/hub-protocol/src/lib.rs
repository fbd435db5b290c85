// hub-protocol: wire types and framing for the app messaging hub.
//
// Everything that crosses the WebSocket boundary lives here: identifiers,
// the length-prefixed binary buffer primitives, the codec seam, packet
// types, and the full packet catalog (core + every extension).  The crate
// is I/O-free so both the hub service and test clients can share it.

pub mod app;
pub mod bytebuffer;
pub mod codec;
pub mod identifier;
pub mod packet;
pub mod packets;

pub use app::App;
pub use bytebuffer::{ByteReader, ByteWriter, Flags};
pub use codec::{Codec, CodecError, JsonCodec, RawCodec};
pub use identifier::{Identifier, IdentifierError};
pub use packet::{EndpointType, Packet, PacketMapper, PacketType, ProtocolError, RawPacket};
pub use packets::DisconnectReason;
