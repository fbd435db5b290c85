//! The composition root: one [`Hub`] owns the session machinery and every
//! extension.  Components are constructed as pure state in dependency
//! order; background work starts in [`Hub::start`].

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;

use crate::config::HubConfig;
use crate::directories::Directories;
use crate::dispatcher::PacketDispatcher;
use crate::extension::dashboard::{DashboardChannel, DashboardExtension};
use crate::extension::endpoint::EndpointExtension;
use crate::extension::permission::{PermissionError, PermissionManager};
use crate::extension::registry::RegistryExtension;
use crate::extension::server::ServerExtension;
use crate::extension::signal::SignalExtension;
use crate::extension::table::TableExtension;
use crate::network::Network;
use crate::security::{SecurityError, TokenStore};

#[derive(Debug, Error)]
pub enum HubError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("security store: {0}")]
    Security(#[from] SecurityError),
    #[error("permission store: {0}")]
    Permission(#[from] PermissionError),
    #[error("startup: {0}")]
    Startup(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownKind {
    Stop,
    Restart,
}

pub struct Hub {
    pub config: HubConfig,
    pub directories: Directories,
    pub dispatcher: Arc<PacketDispatcher>,
    pub network: Arc<Network>,
    pub security: Arc<TokenStore>,
    pub permissions: Arc<PermissionManager>,
    pub endpoints: Arc<EndpointExtension>,
    pub tables: Arc<TableExtension>,
    pub registries: Arc<RegistryExtension>,
    pub signals: Arc<SignalExtension>,
    pub dashboard: Arc<DashboardExtension>,
    pub server: Arc<ServerExtension>,
    pub http_client: reqwest::Client,
    shutdown: watch::Sender<Option<ShutdownKind>>,
}

impl Hub {
    pub fn new(config: HubConfig) -> Result<Arc<Self>, HubError> {
        let directories = Directories::new(config.data_dir.clone());
        directories.ensure()?;

        let dispatcher = Arc::new(PacketDispatcher::new());
        let network = Arc::new(Network::new());
        network.install(&dispatcher);

        let security = Arc::new(TokenStore::open(&directories.security())?);
        let dashboard_channel = Arc::new(DashboardChannel::new());
        let permissions =
            PermissionManager::open(&directories.permissions(), Arc::clone(&dashboard_channel))?;
        permissions.install(&dispatcher);

        let endpoints = EndpointExtension::new(&dispatcher, Arc::clone(&permissions));
        endpoints.watch(&network);
        let tables = TableExtension::new(
            &dispatcher,
            &endpoints,
            Arc::clone(&permissions),
            directories.tables(),
        );
        let registries = RegistryExtension::new(
            &dispatcher,
            &endpoints,
            Arc::clone(&permissions),
            directories.registry(),
        );
        let signals = SignalExtension::new(&dispatcher, Arc::clone(&permissions));
        let dashboard = DashboardExtension::new(
            &dispatcher,
            &endpoints,
            Arc::clone(&network),
            dashboard_channel,
        );

        let (shutdown, _) = watch::channel(None);
        let server = ServerExtension::new(
            &dispatcher,
            &endpoints,
            &permissions,
            Arc::clone(&network),
            Arc::clone(&tables),
            Arc::clone(&registries),
            shutdown.clone(),
        );

        Ok(Arc::new(Self {
            config,
            directories,
            dispatcher,
            network,
            security,
            permissions,
            endpoints,
            tables,
            registries,
            signals,
            dashboard,
            server,
            http_client: reqwest::Client::new(),
            shutdown,
        }))
    }

    /// Runs the startup hooks (apps table, version registry).
    pub async fn start(&self) -> Result<(), HubError> {
        self.server
            .start(env!("CARGO_PKG_VERSION"))
            .await
            .map_err(HubError::Startup)
    }

    /// Resolves once a shutdown endpoint call arrives; returns its kind.
    pub async fn wait_for_shutdown(&self) -> ShutdownKind {
        let mut rx = self.shutdown.subscribe();
        loop {
            if let Some(kind) = *rx.borrow_and_update() {
                return kind;
            }
            if rx.changed().await.is_err() {
                return ShutdownKind::Stop;
            }
        }
    }

    /// The shutdown kind requested so far, if any.
    pub fn shutdown_requested(&self) -> Option<ShutdownKind> {
        *self.shutdown.subscribe().borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    #[tokio::test]
    async fn hub_constructs_and_starts_on_a_fresh_data_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let config = HubConfig::new(
            "127.0.0.1:0".parse::<SocketAddr>().unwrap(),
            tmp.path().join("data"),
        );
        let hub = Hub::new(config).unwrap();
        hub.start().await.unwrap();
        assert!(hub.shutdown_requested().is_none());

        // The version registry is populated at startup.
        let version = hub
            .registries
            .get_or_create(&hub_protocol::packets::server::version_registry_id())
            .get()
            .await
            .unwrap();
        let version: String = serde_json::from_slice(&version).unwrap();
        assert_eq!(version, env!("CARGO_PKG_VERSION"));
    }
}
