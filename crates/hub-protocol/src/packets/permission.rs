//! Permission extension wire types (`ext:permission/...`).

use std::sync::LazyLock;

use serde::{Deserialize, Serialize};

use crate::identifier::Identifier;
use crate::packet::PacketType;

use super::ext_id;

fn base() -> Identifier {
    ext_id("permission")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionLevel {
    Low,
    Medium,
    High,
}

/// Human-facing description shown by the dashboard when approving.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionMetadata {
    pub level: PermissionLevel,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// A named capability an app can be granted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionType {
    pub id: Identifier,
    pub metadata: PermissionMetadata,
}

pub static PERMISSION_REGISTER: LazyLock<PacketType<Vec<PermissionType>>> =
    LazyLock::new(|| PacketType::json(&base(), "register"));
pub static PERMISSION_REQUIRE: LazyLock<PacketType<Vec<Identifier>>> =
    LazyLock::new(|| PacketType::json(&base(), "require"));
pub static PERMISSION_GRANT: LazyLock<PacketType<Vec<PermissionType>>> =
    LazyLock::new(|| PacketType::json(&base(), "grant"));
