//! Server extension wire types (`ext:server/...`).

use std::sync::LazyLock;

use crate::identifier::Identifier;
use crate::packet::{EndpointType, PacketType};

use super::ext_id;

fn base() -> Identifier {
    ext_id("server")
}

/// Identifier of the live-apps table.
pub fn apps_table_id() -> Identifier {
    base().join(&["apps"])
}

/// Permission bound to the live-apps table.
pub fn apps_read_permission_id() -> Identifier {
    base().join(&["apps", "read"])
}

/// Identifier of the version registry.
pub fn version_registry_id() -> Identifier {
    base().join(&["version"])
}

/// Permission gating the shutdown endpoint.
pub fn shutdown_permission_id() -> Identifier {
    base().join(&["shutdown"])
}

/// App dependencies a session declares; its ready gate waits until each
/// named app is connected and itself ready.
pub static REQUIRE_APPS: LazyLock<PacketType<Vec<Identifier>>> =
    LazyLock::new(|| PacketType::json(&base(), "require_apps"));

/// `restart: bool` request; reply confirms the shutdown was accepted.
pub static SHUTDOWN: LazyLock<EndpointType<bool, bool>> =
    LazyLock::new(|| EndpointType::json(&base(), "shutdown"));
