//! Dashboard extension wire types (`ext:dashboard/...`).
//!
//! The dashboard is the single privileged session that arbitrates
//! permission requests and can be asked to open apps.

use std::sync::LazyLock;

use serde::{Deserialize, Serialize};

use crate::app::App;
use crate::bytebuffer::{ByteReader, ByteWriter};
use crate::codec::{CodecError, Wire};
use crate::identifier::Identifier;
use crate::packet::{EndpointType, PacketType};
use crate::packets::permission::PermissionType;

use super::ext_id;

fn base() -> Identifier {
    ext_id("dashboard")
}

/// One queued approval: shown to the dashboard user.
///
/// App and permission payloads travel as embedded JSON strings inside the
/// binary layout so the request survives unknown metadata fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionRequestPacket {
    pub request_id: String,
    pub app: App,
    pub permissions: Vec<PermissionType>,
}

impl Wire for PermissionRequestPacket {
    fn write(&self, writer: &mut ByteWriter) {
        writer.write_string(&self.request_id);
        writer.write_string(&serde_json::to_string(&self.app).expect("app to json"));
        writer.write_string(&serde_json::to_string(&self.permissions).expect("perms to json"));
    }

    fn read(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        let request_id = reader.read_string()?;
        let app = serde_json::from_str(&reader.read_string()?)?;
        let permissions = serde_json::from_str(&reader.read_string()?)?;
        Ok(Self {
            request_id,
            app,
            permissions,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DashboardSetResponse {
    pub success: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenAppStatus {
    Opened,
    AlreadyOpen,
    DashboardNotConnected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenAppResponse {
    pub status: OpenAppStatus,
}

pub static DASHBOARD_PERMISSION_REQUEST: LazyLock<PacketType<PermissionRequestPacket>> =
    LazyLock::new(|| PacketType::binary(&base(), "permission_request"));
pub static DASHBOARD_PERMISSION_ACCEPT: LazyLock<PacketType<String>> =
    LazyLock::new(|| PacketType::json(&base(), "permission_accept"));
pub static DASHBOARD_PERMISSION_DENY: LazyLock<PacketType<String>> =
    LazyLock::new(|| PacketType::json(&base(), "permission_deny"));
pub static DASHBOARD_OPEN_APP: LazyLock<PacketType<App>> =
    LazyLock::new(|| PacketType::json(&base(), "open_app"));

pub static DASHBOARD_SET: LazyLock<EndpointType<Identifier, DashboardSetResponse>> =
    LazyLock::new(|| EndpointType::json(&base(), "set"));
pub static DASHBOARD_OPEN_APP_ENDPOINT: LazyLock<EndpointType<App, OpenAppResponse>> =
    LazyLock::new(|| EndpointType::json(&base(), "open_app"));
