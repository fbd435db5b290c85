//! Endpoint extension wire types (`ext:endpoint/...`).
//!
//! Calls are correlated by `(endpoint id, caller-local u32 key)`; the reply
//! is either exactly one `receive` or exactly one `error`.

use std::collections::HashMap;
use std::sync::LazyLock;

use serde::{Deserialize, Serialize};

use crate::bytebuffer::{ByteReader, ByteWriter};
use crate::codec::{CodecError, Wire};
use crate::identifier::Identifier;
use crate::packet::PacketType;

use super::ext_id;

fn base() -> Identifier {
    ext_id("endpoint")
}

/// `{endpoint id → optional permission id}` announced by the owning session.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EndpointRegisterPacket {
    pub endpoints: HashMap<Identifier, Option<Identifier>>,
}

/// Call or reply payload: the data leg of the correlation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointDataPacket {
    pub id: Identifier,
    pub key: u32,
    pub data: Vec<u8>,
}

impl Wire for EndpointDataPacket {
    fn write(&self, writer: &mut ByteWriter) {
        writer.write_string(&self.id.key());
        writer.write_u32(self.key);
        writer.write_bytes(&self.data);
    }

    fn read(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        let id = Identifier::from_key(&reader.read_string()?)
            .map_err(|e| CodecError::Invalid(e.to_string()))?;
        let key = reader.read_u32()?;
        let data = reader.read_bytes()?.to_vec();
        Ok(Self { id, key, data })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointErrorPacket {
    pub id: Identifier,
    pub key: u32,
    pub error: String,
}

impl Wire for EndpointErrorPacket {
    fn write(&self, writer: &mut ByteWriter) {
        writer.write_string(&self.id.key());
        writer.write_u32(self.key);
        writer.write_string(&self.error);
    }

    fn read(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        let id = Identifier::from_key(&reader.read_string()?)
            .map_err(|e| CodecError::Invalid(e.to_string()))?;
        let key = reader.read_u32()?;
        let error = reader.read_string()?;
        Ok(Self { id, key, error })
    }
}

pub static ENDPOINT_REGISTER: LazyLock<PacketType<EndpointRegisterPacket>> =
    LazyLock::new(|| PacketType::json(&base(), "register"));
pub static ENDPOINT_CALL: LazyLock<PacketType<EndpointDataPacket>> =
    LazyLock::new(|| PacketType::binary(&base(), "call"));
pub static ENDPOINT_RECEIVE: LazyLock<PacketType<EndpointDataPacket>> =
    LazyLock::new(|| PacketType::binary(&base(), "receive"));
pub static ENDPOINT_ERROR: LazyLock<PacketType<EndpointErrorPacket>> =
    LazyLock::new(|| PacketType::binary(&base(), "error"));
