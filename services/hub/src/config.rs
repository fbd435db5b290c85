//! Runtime configuration resolved in `main` and threaded through the hub.

use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub bind_addr: SocketAddr,
    /// Preconfigured token that grants the dashboard role on handshake.
    pub dashboard_token: Option<String>,
    /// When true, an `Origin` header that does not match the app namespace
    /// disconnects the session instead of being logged.
    pub strict_origin: bool,
    pub data_dir: PathBuf,
}

impl HubConfig {
    pub fn new(bind_addr: SocketAddr, data_dir: PathBuf) -> Self {
        Self {
            bind_addr,
            dashboard_token: None,
            strict_origin: false,
            data_dir,
        }
    }
}
