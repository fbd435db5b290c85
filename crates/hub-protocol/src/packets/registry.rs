//! Registry extension wire types (`ext:registry/...`).
//!
//! A registry is a single observable value per identifier.  The permission
//! triple is a compact flags byte followed by the present identifiers.

use std::sync::LazyLock;

use crate::bytebuffer::{ByteReader, ByteWriter, Flags};
use crate::codec::{CodecError, Wire};
use crate::identifier::Identifier;
use crate::packet::{EndpointType, PacketType};

use super::ext_id;

fn base() -> Identifier {
    ext_id("registry")
}

fn read_id(reader: &mut ByteReader<'_>) -> Result<Identifier, CodecError> {
    Identifier::from_key(&reader.read_string()?).map_err(|e| CodecError::Invalid(e.to_string()))
}

/// Current value (or absence) of one registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryPacket {
    pub id: Identifier,
    pub value: Option<Vec<u8>>,
}

impl Wire for RegistryPacket {
    fn write(&self, writer: &mut ByteWriter) {
        writer.write_string(&self.id.key());
        writer.write_bool(self.value.is_some());
        if let Some(value) = &self.value {
            writer.write_bytes(value);
        }
    }

    fn read(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        let id = read_id(reader)?;
        let value = if reader.read_bool()? {
            Some(reader.read_bytes()?.to_vec())
        } else {
            None
        };
        Ok(Self { id, value })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RegistryPermissions {
    pub all: Option<Identifier>,
    pub read: Option<Identifier>,
    pub write: Option<Identifier>,
}

impl RegistryPermissions {
    fn write_to(&self, writer: &mut ByteWriter) {
        let flags = Flags::new(3)
            .set(0, self.all.is_some())
            .set(1, self.read.is_some())
            .set(2, self.write.is_some());
        writer.write_flags(flags);
        for id in [&self.all, &self.read, &self.write].into_iter().flatten() {
            writer.write_string(&id.key());
        }
    }

    fn read_from(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        let flags = reader.read_flags(3)?;
        let all = flags.get(0).then(|| read_id(reader)).transpose()?;
        let read = flags.get(1).then(|| read_id(reader)).transpose()?;
        let write = flags.get(2).then(|| read_id(reader)).transpose()?;
        Ok(Self { all, read, write })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryRegisterPacket {
    pub id: Identifier,
    pub permissions: RegistryPermissions,
}

impl Wire for RegistryRegisterPacket {
    fn write(&self, writer: &mut ByteWriter) {
        writer.write_string(&self.id.key());
        self.permissions.write_to(writer);
    }

    fn read(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        let id = read_id(reader)?;
        let permissions = RegistryPermissions::read_from(reader)?;
        Ok(Self { id, permissions })
    }
}

pub static REGISTRY_REGISTER: LazyLock<PacketType<RegistryRegisterPacket>> =
    LazyLock::new(|| PacketType::binary(&base(), "register"));
pub static REGISTRY_LISTEN: LazyLock<PacketType<Identifier>> =
    LazyLock::new(|| PacketType::json(&base(), "listen"));
pub static REGISTRY_UPDATE: LazyLock<PacketType<RegistryPacket>> =
    LazyLock::new(|| PacketType::binary(&base(), "update"));

pub static REGISTRY_GET: LazyLock<EndpointType<Identifier, RegistryPacket>> =
    LazyLock::new(|| {
        EndpointType::new(
            base().join(&["get"]),
            std::sync::Arc::new(crate::codec::JsonCodec::new()),
            std::sync::Arc::new(crate::codec::WireCodec::new()),
        )
    });
