//! Table extension wire types (`ext:table/...`).

use std::sync::LazyLock;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::bytebuffer::{ByteReader, ByteWriter, Flags};
use crate::codec::{CodecError, Wire};
use crate::identifier::Identifier;
use crate::packet::{EndpointType, PacketType};

use super::ext_id;

fn base() -> Identifier {
    ext_id("table")
}

/// Insertion-ordered `key → value` batch.
pub type TableItems = IndexMap<String, Vec<u8>>;

fn write_items(writer: &mut ByteWriter, items: &TableItems) {
    writer.write_u32(u32::try_from(items.len()).expect("too many items"));
    for (key, value) in items {
        writer.write_string(key);
        writer.write_bytes(value);
    }
}

fn read_items(reader: &mut ByteReader<'_>) -> Result<TableItems, CodecError> {
    let count = reader.read_u32()?;
    let mut items = TableItems::with_capacity(count as usize);
    for _ in 0..count {
        let key = reader.read_string()?;
        let value = reader.read_bytes()?.to_vec();
        items.insert(key, value);
    }
    Ok(items)
}

fn read_id(reader: &mut ByteReader<'_>) -> Result<Identifier, CodecError> {
    Identifier::from_key(&reader.read_string()?).map_err(|e| CodecError::Invalid(e.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TablePacket {
    pub id: Identifier,
}

impl Wire for TablePacket {
    fn write(&self, writer: &mut ByteWriter) {
        writer.write_string(&self.id.key());
    }

    fn read(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        Ok(Self { id: read_id(reader)? })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableItemsPacket {
    pub id: Identifier,
    pub items: TableItems,
}

impl Wire for TableItemsPacket {
    fn write(&self, writer: &mut ByteWriter) {
        writer.write_string(&self.id.key());
        write_items(writer, &self.items);
    }

    fn read(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        let id = read_id(reader)?;
        let items = read_items(reader)?;
        Ok(Self { id, items })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableKeysPacket {
    pub id: Identifier,
    pub keys: Vec<String>,
}

impl Wire for TableKeysPacket {
    fn write(&self, writer: &mut ByteWriter) {
        writer.write_string(&self.id.key());
        writer.write_u32(u32::try_from(self.keys.len()).expect("too many keys"));
        for key in &self.keys {
            writer.write_string(key);
        }
    }

    fn read(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        let id = read_id(reader)?;
        let count = reader.read_u32()?;
        let mut keys = Vec::with_capacity(count as usize);
        for _ in 0..count {
            keys.push(reader.read_string()?);
        }
        Ok(Self { id, keys })
    }
}

/// One proxy round: `key` is the per-table batch sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableProxyPacket {
    pub id: Identifier,
    pub key: u32,
    pub items: TableItems,
}

impl Wire for TableProxyPacket {
    fn write(&self, writer: &mut ByteWriter) {
        writer.write_string(&self.id.key());
        writer.write_u32(self.key);
        write_items(writer, &self.items);
    }

    fn read(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        let id = read_id(reader)?;
        let key = reader.read_u32()?;
        let items = read_items(reader)?;
        Ok(Self { id, key, items })
    }
}

/// Windowed fetch request; absent fields are encoded via a flags byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableFetchPacket {
    pub id: Identifier,
    pub before: Option<u32>,
    pub after: Option<u32>,
    pub cursor: Option<String>,
}

impl Wire for TableFetchPacket {
    fn write(&self, writer: &mut ByteWriter) {
        writer.write_string(&self.id.key());
        let flags = Flags::new(3)
            .set(0, self.before.is_some())
            .set(1, self.after.is_some())
            .set(2, self.cursor.is_some());
        writer.write_flags(flags);
        if let Some(before) = self.before {
            writer.write_u32(before);
        }
        if let Some(after) = self.after {
            writer.write_u32(after);
        }
        if let Some(cursor) = &self.cursor {
            writer.write_string(cursor);
        }
    }

    fn read(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        let id = read_id(reader)?;
        let flags = reader.read_flags(3)?;
        let before = flags.get(0).then(|| reader.read_u32()).transpose()?;
        let after = flags.get(1).then(|| reader.read_u32()).transpose()?;
        let cursor = flags.get(2).then(|| reader.read_string()).transpose()?;
        Ok(Self {
            id,
            before,
            after,
            cursor,
        })
    }
}

/// Owner-set table tuning.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TableConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_size: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetConfigPacket {
    pub id: Identifier,
    pub config: TableConfig,
}

impl Wire for SetConfigPacket {
    fn write(&self, writer: &mut ByteWriter) {
        writer.write_string(&self.id.key());
        writer.write_string(&serde_json::to_string(&self.config).expect("config to json"));
    }

    fn read(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        let id = read_id(reader)?;
        let config = serde_json::from_str(&reader.read_string()?)?;
        Ok(Self { id, config })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindPermissionPacket {
    pub id: Identifier,
    pub permission: Identifier,
}

impl Wire for BindPermissionPacket {
    fn write(&self, writer: &mut ByteWriter) {
        writer.write_string(&self.id.key());
        writer.write_string(&self.permission.key());
    }

    fn read(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        let id = read_id(reader)?;
        let permission = read_id(reader)?;
        Ok(Self { id, permission })
    }
}

pub static TABLE_LISTEN: LazyLock<PacketType<Identifier>> =
    LazyLock::new(|| PacketType::json(&base(), "listen"));
pub static TABLE_PROXY_LISTEN: LazyLock<PacketType<Identifier>> =
    LazyLock::new(|| PacketType::json(&base(), "proxy_listen"));
pub static TABLE_PROXY: LazyLock<PacketType<TableProxyPacket>> =
    LazyLock::new(|| PacketType::binary(&base(), "proxy"));
pub static TABLE_CONFIG: LazyLock<PacketType<SetConfigPacket>> =
    LazyLock::new(|| PacketType::binary(&base(), "config"));
pub static TABLE_BIND_PERMISSION: LazyLock<PacketType<BindPermissionPacket>> =
    LazyLock::new(|| PacketType::binary(&base(), "bind_permission"));
pub static TABLE_ITEM_ADD: LazyLock<PacketType<TableItemsPacket>> =
    LazyLock::new(|| PacketType::binary(&base(), "item_add"));
pub static TABLE_ITEM_UPDATE: LazyLock<PacketType<TableItemsPacket>> =
    LazyLock::new(|| PacketType::binary(&base(), "item_update"));
pub static TABLE_ITEM_REMOVE: LazyLock<PacketType<TableItemsPacket>> =
    LazyLock::new(|| PacketType::binary(&base(), "item_remove"));
pub static TABLE_ITEM_CLEAR: LazyLock<PacketType<TablePacket>> =
    LazyLock::new(|| PacketType::binary(&base(), "item_clear"));

pub static TABLE_ITEM_GET: LazyLock<EndpointType<TableKeysPacket, TableItemsPacket>> =
    LazyLock::new(|| {
        EndpointType::new(
            base().join(&["item_get"]),
            std::sync::Arc::new(crate::codec::WireCodec::new()),
            std::sync::Arc::new(crate::codec::WireCodec::new()),
        )
    });
pub static TABLE_FETCH: LazyLock<EndpointType<TableFetchPacket, TableItemsPacket>> =
    LazyLock::new(|| {
        EndpointType::new(
            base().join(&["item_fetch"]),
            std::sync::Arc::new(crate::codec::WireCodec::new()),
            std::sync::Arc::new(crate::codec::WireCodec::new()),
        )
    });
pub static TABLE_FETCH_ALL: LazyLock<EndpointType<TablePacket, TableItemsPacket>> =
    LazyLock::new(|| {
        EndpointType::new(
            base().join(&["item_fetch_all"]),
            std::sync::Arc::new(crate::codec::WireCodec::new()),
            std::sync::Arc::new(crate::codec::WireCodec::new()),
        )
    });
pub static TABLE_SIZE: LazyLock<EndpointType<TablePacket, u64>> = LazyLock::new(|| {
    EndpointType::new(
        base().join(&["item_size"]),
        std::sync::Arc::new(crate::codec::WireCodec::new()),
        std::sync::Arc::new(crate::codec::JsonCodec::new()),
    )
});
