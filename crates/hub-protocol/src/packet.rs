//! Packet types, wire framing and the packet-type registry.
//!
//! One WebSocket binary frame carries exactly one packet:
//!
//! ```text
//! u32be type_len | type-key utf-8 | u32be data_len | payload
//! ```
//!
//! The `type-key` is the stringified identifier of the [`PacketType`]; the
//! payload is whatever that type's codec produced.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::bytebuffer::{BufferError, ByteReader, ByteWriter};
use crate::codec::{Codec, CodecError, JsonCodec, Wire, WireCodec};
use crate::identifier::{Identifier, IdentifierError};

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Frame(#[from] BufferError),
    #[error("bad type key: {0}")]
    TypeKey(#[from] IdentifierError),
    #[error("packet type {0} already registered")]
    AlreadyRegistered(Identifier),
    #[error("unknown packet type {0}")]
    UnknownType(String),
    #[error("payload: {0}")]
    Payload(#[from] CodecError),
}

/// A typed packet kind: an identifier plus the payload codec.
pub struct PacketType<T> {
    id: Identifier,
    codec: Arc<dyn Codec<T>>,
}

impl<T> Clone for PacketType<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            codec: Arc::clone(&self.codec),
        }
    }
}

impl<T> PacketType<T> {
    pub fn new(id: Identifier, codec: Arc<dyn Codec<T>>) -> Self {
        Self { id, codec }
    }

    /// JSON payload under `base/name`.
    pub fn json(base: &Identifier, name: &str) -> Self
    where
        T: Serialize + DeserializeOwned + 'static,
    {
        Self::new(base.join(&[name]), Arc::new(JsonCodec::new()))
    }

    /// Hand-written binary payload under `base/name`.
    pub fn binary(base: &Identifier, name: &str) -> Self
    where
        T: Wire + Send + Sync + 'static,
    {
        Self::new(base.join(&[name]), Arc::new(WireCodec::new()))
    }

    pub fn id(&self) -> &Identifier {
        &self.id
    }

    pub fn encode(&self, value: &T) -> Result<RawPacket, CodecError> {
        Ok(RawPacket {
            type_key: self.id.key(),
            data: Bytes::from(self.codec.encode(value)?),
        })
    }

    pub fn decode(&self, raw: &RawPacket) -> Result<T, CodecError> {
        self.codec.decode(&raw.data)
    }

    pub fn codec(&self) -> &Arc<dyn Codec<T>> {
        &self.codec
    }
}

/// A typed request/response pair exposed by a session or the server.
pub struct EndpointType<Req, Res> {
    id: Identifier,
    request: Arc<dyn Codec<Req>>,
    response: Arc<dyn Codec<Res>>,
}

impl<Req, Res> Clone for EndpointType<Req, Res> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            request: Arc::clone(&self.request),
            response: Arc::clone(&self.response),
        }
    }
}

impl<Req, Res> EndpointType<Req, Res> {
    pub fn new(
        id: Identifier,
        request: Arc<dyn Codec<Req>>,
        response: Arc<dyn Codec<Res>>,
    ) -> Self {
        Self {
            id,
            request,
            response,
        }
    }

    pub fn json(base: &Identifier, name: &str) -> Self
    where
        Req: Serialize + DeserializeOwned + 'static,
        Res: Serialize + DeserializeOwned + 'static,
    {
        Self::new(
            base.join(&[name]),
            Arc::new(JsonCodec::new()),
            Arc::new(JsonCodec::new()),
        )
    }

    pub fn id(&self) -> &Identifier {
        &self.id
    }

    pub fn request_codec(&self) -> &Arc<dyn Codec<Req>> {
        &self.request
    }

    pub fn response_codec(&self) -> &Arc<dyn Codec<Res>> {
        &self.response
    }
}

/// A decoded packet paired with its type.
pub struct Packet<T> {
    pub ty: PacketType<T>,
    pub data: T,
}

/// An on-wire packet before/after payload decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPacket {
    pub type_key: String,
    pub data: Bytes,
}

impl RawPacket {
    pub fn to_frame(&self) -> Bytes {
        let mut writer = ByteWriter::new();
        writer.write_string(&self.type_key);
        writer.write_bytes(&self.data);
        writer.finish()
    }

    pub fn from_frame(frame: &[u8]) -> Result<Self, BufferError> {
        let mut reader = ByteReader::new(frame);
        let type_key = reader.read_string()?;
        let data = Bytes::copy_from_slice(reader.read_bytes()?);
        reader.finish()?;
        Ok(Self { type_key, data })
    }
}

/// Bi-directional registry of known packet types.
///
/// The mapper only remembers identifiers; decoding stays typed at the call
/// site.  A frame whose type-key is absent here is an
/// `INVALID_PACKET_TYPE`-grade offense at the session boundary.
#[derive(Default)]
pub struct PacketMapper {
    registered: HashMap<String, Identifier>,
}

impl PacketMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T>(&mut self, ty: &PacketType<T>) -> Result<(), ProtocolError> {
        let key = ty.id().key();
        if self.registered.contains_key(&key) {
            return Err(ProtocolError::AlreadyRegistered(ty.id().clone()));
        }
        self.registered.insert(key, ty.id().clone());
        Ok(())
    }

    pub fn contains(&self, type_key: &str) -> bool {
        self.registered.contains_key(type_key)
    }

    pub fn serialize<T>(&self, packet: &Packet<T>) -> Result<RawPacket, ProtocolError> {
        if !self.contains(&packet.ty.id().key()) {
            return Err(ProtocolError::UnknownType(packet.ty.id().key()));
        }
        Ok(packet.ty.encode(&packet.data)?)
    }

    /// Validates the frame's type-key against the registry.
    pub fn check(&self, raw: &RawPacket) -> Result<&Identifier, ProtocolError> {
        Identifier::from_key(&raw.type_key)?;
        self.registered
            .get(&raw.type_key)
            .ok_or_else(|| ProtocolError::UnknownType(raw.type_key.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packets;

    #[test]
    fn frame_layout_matches_wire_contract() {
        let raw = RawPacket {
            type_key: "core:packet/ready".to_owned(),
            data: Bytes::from_static(b"null"),
        };
        let frame = raw.to_frame();
        // u32be type_len | type | u32be data_len | data
        assert_eq!(&frame[..4], 17u32.to_be_bytes().as_slice());
        assert_eq!(&frame[4..21], b"core:packet/ready");
        assert_eq!(&frame[21..25], 4u32.to_be_bytes().as_slice());
        assert_eq!(&frame[25..], b"null");
        assert_eq!(RawPacket::from_frame(&frame).unwrap(), raw);
    }

    #[test]
    fn frame_rejects_truncation_and_trailing_garbage() {
        let raw = RawPacket {
            type_key: "core:packet/ready".to_owned(),
            data: Bytes::new(),
        };
        let frame = raw.to_frame();
        assert!(RawPacket::from_frame(&frame[..frame.len() - 2]).is_err());
        let mut longer = frame.to_vec();
        longer.push(0xFF);
        assert!(RawPacket::from_frame(&longer).is_err());
    }

    #[test]
    fn mapper_rejects_duplicates_and_unknown_types() {
        let mut mapper = PacketMapper::new();
        mapper.register(&packets::READY).unwrap();
        assert!(mapper.register(&packets::READY).is_err());

        let known = packets::READY.encode(&()).unwrap();
        assert!(mapper.check(&known).is_ok());

        let unknown = RawPacket {
            type_key: "core:packet/nope".to_owned(),
            data: Bytes::new(),
        };
        assert!(matches!(
            mapper.check(&unknown),
            Err(ProtocolError::UnknownType(_))
        ));
    }

    #[test]
    fn typed_round_trip_through_raw_packet() {
        let token = "f00d".to_owned();
        let raw = packets::TOKEN.encode(&token).unwrap();
        assert_eq!(raw.type_key, "core:packet/token");
        assert_eq!(packets::TOKEN.decode(&raw).unwrap(), token);
    }
}
