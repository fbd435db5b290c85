//! Signal extension wire types (`ext:signal/...`).

use std::sync::LazyLock;

use crate::bytebuffer::{ByteReader, ByteWriter, Flags};
use crate::codec::{CodecError, Wire};
use crate::identifier::Identifier;
use crate::packet::PacketType;

use super::ext_id;

fn base() -> Identifier {
    ext_id("signal")
}

fn read_id(reader: &mut ByteReader<'_>) -> Result<Identifier, CodecError> {
    Identifier::from_key(&reader.read_string()?).map_err(|e| CodecError::Invalid(e.to_string()))
}

/// A notification: the body is opaque to the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalPacket {
    pub id: Identifier,
    pub body: Vec<u8>,
}

impl Wire for SignalPacket {
    fn write(&self, writer: &mut ByteWriter) {
        writer.write_string(&self.id.key());
        writer.write_bytes(&self.body);
    }

    fn read(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        let id = read_id(reader)?;
        let body = reader.read_bytes()?.to_vec();
        Ok(Self { id, body })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SignalPermissions {
    pub all: Option<Identifier>,
    pub listen: Option<Identifier>,
    pub notify: Option<Identifier>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalRegisterPacket {
    pub id: Identifier,
    pub permissions: SignalPermissions,
}

impl Wire for SignalRegisterPacket {
    fn write(&self, writer: &mut ByteWriter) {
        writer.write_string(&self.id.key());
        let flags = Flags::new(3)
            .set(0, self.permissions.all.is_some())
            .set(1, self.permissions.listen.is_some())
            .set(2, self.permissions.notify.is_some());
        writer.write_flags(flags);
        let ids = [
            &self.permissions.all,
            &self.permissions.listen,
            &self.permissions.notify,
        ];
        for id in ids.into_iter().flatten() {
            writer.write_string(&id.key());
        }
    }

    fn read(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        let id = read_id(reader)?;
        let flags = reader.read_flags(3)?;
        let all = flags.get(0).then(|| read_id(reader)).transpose()?;
        let listen = flags.get(1).then(|| read_id(reader)).transpose()?;
        let notify = flags.get(2).then(|| read_id(reader)).transpose()?;
        Ok(Self {
            id,
            permissions: SignalPermissions { all, listen, notify },
        })
    }
}

pub static SIGNAL_REGISTER: LazyLock<PacketType<SignalRegisterPacket>> =
    LazyLock::new(|| PacketType::binary(&base(), "register"));
pub static SIGNAL_LISTEN: LazyLock<PacketType<Identifier>> =
    LazyLock::new(|| PacketType::json(&base(), "listen"));
pub static SIGNAL_NOTIFY: LazyLock<PacketType<SignalPacket>> =
    LazyLock::new(|| PacketType::binary(&base(), "notify"));
