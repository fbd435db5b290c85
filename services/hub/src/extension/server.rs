//! The hub's own surface: the live-apps table, the version registry, the
//! `require_apps` wait gate, and the permissioned shutdown endpoint.

use std::sync::{Arc, OnceLock};

use hub_protocol::packets::permission::{
    PermissionLevel, PermissionMetadata, PermissionType,
};
use hub_protocol::packets::server::{
    apps_read_permission_id, apps_table_id, shutdown_permission_id, version_registry_id,
    REQUIRE_APPS, SHUTDOWN,
};
use hub_protocol::packets::table::TableItems;
use hub_protocol::packets::DisconnectReason;
use hub_protocol::Identifier;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::dispatcher::{HandlerMode, PacketDispatcher};
use crate::extension::endpoint::EndpointExtension;
use crate::extension::permission::PermissionManager;
use crate::extension::registry::RegistryExtension;
use crate::extension::table::{ServerTable, TableExtension};
use crate::network::{Network, SessionEvent};
use crate::session::{ReadyError, Session};
use crate::state::ShutdownKind;

pub struct ServerExtension {
    network: Arc<Network>,
    tables: Arc<TableExtension>,
    registries: Arc<RegistryExtension>,
    apps: OnceLock<Arc<ServerTable>>,
}

impl ServerExtension {
    pub fn new(
        dispatcher: &PacketDispatcher,
        endpoints: &EndpointExtension,
        permissions: &PermissionManager,
        network: Arc<Network>,
        tables: Arc<TableExtension>,
        registries: Arc<RegistryExtension>,
        shutdown: watch::Sender<Option<ShutdownKind>>,
    ) -> Arc<Self> {
        dispatcher.register(&REQUIRE_APPS);

        let extension = Arc::new(Self {
            network,
            tables,
            registries,
            apps: OnceLock::new(),
        });

        let ext = Arc::clone(&extension);
        dispatcher.add_packet_handler(
            &REQUIRE_APPS,
            HandlerMode::Inline,
            move |session, ids: Vec<Identifier>| {
                let ext = Arc::clone(&ext);
                async move { ext.handle_require_apps(&session, ids) }
            },
        );

        permissions.register_permission(PermissionType {
            id: shutdown_permission_id(),
            metadata: PermissionMetadata {
                level: PermissionLevel::High,
                name: "Shut down the hub".to_owned(),
                note: Some("Stops or restarts the hub process".to_owned()),
            },
        });
        permissions.register_permission(PermissionType {
            id: apps_read_permission_id(),
            metadata: PermissionMetadata {
                level: PermissionLevel::Low,
                name: "List connected apps".to_owned(),
                note: Some("Grants access to the live-apps table".to_owned()),
            },
        });
        endpoints.bind_endpoint(
            &SHUTDOWN,
            Some(shutdown_permission_id()),
            move |session, restart: bool| {
                let shutdown = shutdown.clone();
                async move {
                    info!(app = %session.key(), restart, "shutdown requested");
                    let kind = if restart {
                        ShutdownKind::Restart
                    } else {
                        ShutdownKind::Stop
                    };
                    if shutdown.send_replace(Some(kind)).is_some() {
                        return Err("hub is already stopping".to_owned());
                    }
                    Ok(true)
                }
            },
        );

        extension
    }

    /// Opens the apps table and version registry once the stores exist.
    /// The apps table starts empty on every boot and is readable only
    /// through its bound permission.
    pub async fn start(&self, version: &str) -> Result<(), String> {
        let apps = self
            .tables
            .get_or_create(&apps_table_id())
            .map_err(|e| e.to_string())?;
        apps.bind_permission(apps_read_permission_id());
        apps.clear();
        let _ = self.apps.set(apps);
        let encoded = serde_json::to_vec(version).map_err(|e| e.to_string())?;
        self.registries
            .set(&version_registry_id(), encoded)
            .await
            .map_err(|e| e.to_string())?;

        let network = Arc::clone(&self.network);
        let apps = Arc::clone(self.apps.get().expect("apps table just set"));
        let mut events = self.network.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(SessionEvent::Connected(session)) => {
                        let mut items = TableItems::new();
                        match serde_json::to_vec(&session.app) {
                            Ok(encoded) => {
                                items.insert(session.key(), encoded);
                                apps.add(items);
                            }
                            Err(err) => {
                                warn!(app = %session.key(), error = %err, "failed to encode app");
                            }
                        }
                    }
                    Ok(SessionEvent::Disconnected(session)) => {
                        // A reconnecting app may already own the row again.
                        let replaced = network
                            .get(&session.key())
                            .is_some_and(|live| live.serial != session.serial);
                        if !replaced {
                            apps.remove(vec![session.key()]);
                        }
                    }
                    Ok(SessionEvent::Ready(_)) => {}
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }
            }
        });
        Ok(())
    }

    /// Blocks the session at its ready gate until every named app is
    /// connected and itself ready.
    fn handle_require_apps(&self, session: &Arc<Session>, ids: Vec<Identifier>) {
        if ids.is_empty() {
            return;
        }
        let Some(done) = session.add_ready_task("require_apps") else {
            warn!(app = %session.key(), "require_apps after ready");
            return;
        };
        let network = Arc::clone(&self.network);
        let session = Arc::clone(session);
        tokio::spawn(async move {
            let result = wait_for_apps(&network, &session, &ids).await;
            let _ = done.send(result);
        });
    }
}

async fn wait_for_apps(
    network: &Network,
    session: &Arc<Session>,
    ids: &[Identifier],
) -> Result<(), ReadyError> {
    let mut events = network.subscribe();
    let mut closed = session.closed_signal();
    loop {
        let all_ready = ids.iter().all(|id| {
            network
                .get(&id.key())
                .is_some_and(|session| session.is_ready())
        });
        if all_ready {
            return Ok(());
        }
        tokio::select! {
            event = events.recv() => match event {
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => {
                    return Err(ReadyError {
                        reason: DisconnectReason::Shutdown,
                        message: "hub is shutting down".to_owned(),
                    });
                }
            },
            _ = closed.wait_for(|closed| *closed) => {
                return Err(ReadyError {
                    reason: DisconnectReason::Close,
                    message: "session closed while waiting for apps".to_owned(),
                });
            }
        }
    }
}
