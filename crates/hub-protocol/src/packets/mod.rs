//! The packet catalog.
//!
//! Core packets live under `core:packet/<name>`; each extension's packets
//! live under `ext:<extension>/<name>`.

use std::sync::LazyLock;

use serde::{Deserialize, Serialize};

use crate::app::App;
use crate::identifier::Identifier;
use crate::packet::PacketType;

pub mod dashboard;
pub mod endpoint;
pub mod permission;
pub mod registry;
pub mod server;
pub mod signal;
pub mod table;

pub(crate) fn core_id() -> Identifier {
    Identifier::new("core", ["packet"]).expect("static identifier")
}

pub(crate) fn ext_id(extension: &str) -> Identifier {
    Identifier::new("ext", [extension]).expect("static identifier")
}

/// Why a session was (or is being) disconnected.  `Shutdown` and `Close`
/// are the only non-error reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DisconnectReason {
    Shutdown,
    Close,
    AnotherConnection,
    PermissionDenied,
    InvalidToken,
    InvalidOrigin,
    InvalidVersion,
    InvalidPacket,
    InvalidPacketType,
    InvalidPacketData,
}

impl DisconnectReason {
    pub fn is_error(self) -> bool {
        !matches!(self, Self::Shutdown | Self::Close)
    }
}

/// First packet of every connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectPacket {
    pub app: App,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectPacket {
    pub reason: DisconnectReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

pub static CONNECT: LazyLock<PacketType<ConnectPacket>> =
    LazyLock::new(|| PacketType::json(&core_id(), "connect"));
pub static DISCONNECT: LazyLock<PacketType<DisconnectPacket>> =
    LazyLock::new(|| PacketType::json(&core_id(), "disconnect"));
pub static TOKEN: LazyLock<PacketType<String>> =
    LazyLock::new(|| PacketType::json(&core_id(), "token"));
pub static READY: LazyLock<PacketType<()>> =
    LazyLock::new(|| PacketType::json(&core_id(), "ready"));
