//! Single-value observables persisted one blob per identifier.
//!
//! Updates commit (value + file) under a per-registry lock, then fan out to
//! every listener including the writer, so listeners observe updates in
//! commit order and the last write wins.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, RwLock};

use hub_protocol::packets::registry::{
    RegistryPacket, RegistryPermissions, RegistryRegisterPacket, REGISTRY_GET, REGISTRY_LISTEN,
    REGISTRY_REGISTER, REGISTRY_UPDATE,
};
use hub_protocol::packets::DisconnectReason;
use hub_protocol::Identifier;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::error;

use crate::dispatcher::{HandlerMode, PacketDispatcher};
use crate::extension::endpoint::EndpointExtension;
use crate::extension::permission::PermissionManager;
use crate::extension::{attach_slot, live_slots, SessionSlot};
use crate::session::Session;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub struct ServerRegistry {
    id: Identifier,
    path: PathBuf,
    value: Mutex<Option<Vec<u8>>>,
    listeners: StdMutex<Vec<SessionSlot>>,
    permissions: StdMutex<RegistryPermissions>,
}

impl ServerRegistry {
    fn load(id: Identifier, path: PathBuf) -> Self {
        let value = std::fs::read(&path).ok();
        Self {
            id,
            path,
            value: Mutex::new(value),
            listeners: StdMutex::new(Vec::new()),
            permissions: StdMutex::new(RegistryPermissions::default()),
        }
    }

    pub async fn get(&self) -> Option<Vec<u8>> {
        self.value.lock().await.clone()
    }

    fn packet(&self, value: Option<Vec<u8>>) -> RegistryPacket {
        RegistryPacket {
            id: self.id.clone(),
            value,
        }
    }

    /// Commits the new value, then notifies every listener (the writer
    /// included).  Unpersistable updates are not broadcast.
    pub async fn update(&self, value: Option<Vec<u8>>) -> Result<(), RegistryError> {
        let mut slot = self.value.lock().await;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match &value {
            Some(value) => std::fs::write(&self.path, value)?,
            None => match std::fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            },
        }
        *slot = value.clone();
        let packet = self.packet(value);
        let sessions = live_slots(&mut self.listeners.lock().expect("listeners poisoned"));
        for session in sessions {
            let _ = session.send(&REGISTRY_UPDATE, &packet);
        }
        drop(slot);
        Ok(())
    }

    /// Attaches a listener and immediately replays the current value.  The
    /// value lock is held across the attach so the replay cannot race a
    /// concurrent commit.
    pub async fn attach(&self, session: &Arc<Session>) {
        let value = self.value.lock().await;
        attach_slot(
            &mut self.listeners.lock().expect("listeners poisoned"),
            session,
        );
        let _ = session.send(&REGISTRY_UPDATE, &self.packet(value.clone()));
    }

    fn set_permissions(&self, permissions: RegistryPermissions) {
        *self.permissions.lock().expect("permissions poisoned") = permissions;
    }
}

enum Access {
    Read,
    Write,
}

pub struct RegistryExtension {
    registries: RwLock<HashMap<Identifier, Arc<ServerRegistry>>>,
    dir: PathBuf,
    permissions: Arc<PermissionManager>,
}

impl RegistryExtension {
    pub fn new(
        dispatcher: &PacketDispatcher,
        endpoints: &EndpointExtension,
        permissions: Arc<PermissionManager>,
        dir: PathBuf,
    ) -> Arc<Self> {
        dispatcher.register(&REGISTRY_REGISTER);
        dispatcher.register(&REGISTRY_LISTEN);
        dispatcher.register(&REGISTRY_UPDATE);

        let extension = Arc::new(Self {
            registries: RwLock::new(HashMap::new()),
            dir,
            permissions,
        });

        let ext = Arc::clone(&extension);
        dispatcher.add_packet_handler(
            &REGISTRY_REGISTER,
            HandlerMode::Inline,
            move |session, packet: RegistryRegisterPacket| {
                let ext = Arc::clone(&ext);
                async move {
                    if !session.is_dashboard && !packet.id.is_subpath_of(&session.app.identifier) {
                        session.disconnect(
                            DisconnectReason::PermissionDenied,
                            Some(format!(
                                "registry {} is not under app {}",
                                packet.id, session.app.identifier
                            )),
                        );
                        return;
                    }
                    ext.get_or_create(&packet.id).set_permissions(packet.permissions);
                }
            },
        );
        let ext = Arc::clone(&extension);
        dispatcher.add_packet_handler(
            &REGISTRY_LISTEN,
            HandlerMode::Inline,
            move |session, id: Identifier| {
                let ext = Arc::clone(&ext);
                async move {
                    let registry = ext.get_or_create(&id);
                    if ext.check(&session, &registry, &Access::Read) {
                        registry.attach(&session).await;
                    }
                }
            },
        );
        let ext = Arc::clone(&extension);
        dispatcher.add_packet_handler(
            &REGISTRY_UPDATE,
            HandlerMode::Inline,
            move |session, packet: RegistryPacket| {
                let ext = Arc::clone(&ext);
                async move {
                    let registry = ext.get_or_create(&packet.id);
                    if ext.check(&session, &registry, &Access::Write) {
                        if let Err(err) = registry.update(packet.value).await {
                            error!(registry = %packet.id, error = %err, "failed to persist registry");
                        }
                    }
                }
            },
        );

        let ext = Arc::clone(&extension);
        endpoints.bind_endpoint(&REGISTRY_GET, None, move |session, id: Identifier| {
            let ext = Arc::clone(&ext);
            async move {
                let registry = ext.get_or_create(&id);
                if !ext.check(&session, &registry, &Access::Read) {
                    return Err("Permission denied".to_owned());
                }
                let value = registry.get().await;
                Ok(RegistryPacket { id, value })
            }
        });

        extension
    }

    pub fn get_or_create(&self, id: &Identifier) -> Arc<ServerRegistry> {
        if let Some(registry) = self.registries.read().expect("registries poisoned").get(id) {
            return Arc::clone(registry);
        }
        let mut path = self.dir.join(id.sanitized_path());
        path.set_extension("bin");
        let mut registries = self.registries.write().expect("registries poisoned");
        Arc::clone(
            registries
                .entry(id.clone())
                .or_insert_with(|| Arc::new(ServerRegistry::load(id.clone(), path))),
        )
    }

    /// In-process write used by the hub's own registries.
    pub async fn set(&self, id: &Identifier, value: Vec<u8>) -> Result<(), RegistryError> {
        self.get_or_create(id).update(Some(value)).await
    }

    /// Subpath and dashboard auto-pass; a bound triple gates the rest.  An
    /// unset triple leaves the registry open.
    fn check(&self, session: &Arc<Session>, registry: &ServerRegistry, access: &Access) -> bool {
        if registry.id.is_subpath_of(&session.app.identifier) || session.is_dashboard {
            return true;
        }
        let (all, scoped) = {
            let perms = registry.permissions.lock().expect("permissions poisoned");
            let scoped = match access {
                Access::Read => perms.read.clone(),
                Access::Write => perms.write.clone(),
            };
            (perms.all.clone(), scoped)
        };
        let required: Vec<Identifier> = [all, scoped].into_iter().flatten().collect();
        if required.is_empty() {
            return true;
        }
        if required
            .iter()
            .any(|id| self.permissions.has_permission(session, id))
        {
            return true;
        }
        session.disconnect(
            DisconnectReason::PermissionDenied,
            Some(format!("registry {} requires permission", registry.id)),
        );
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extension::dashboard::DashboardChannel;
    use crate::session::{Outbound, OutboundReceiver};
    use hub_protocol::{App, RawPacket};

    fn setup(dir: &std::path::Path) -> Arc<RegistryExtension> {
        let dispatcher = PacketDispatcher::new();
        let permissions =
            PermissionManager::open_in_memory(Arc::new(DashboardChannel::new())).unwrap();
        let endpoints = EndpointExtension::new(&dispatcher, Arc::clone(&permissions));
        RegistryExtension::new(&dispatcher, &endpoints, permissions, dir.to_path_buf())
    }

    fn make_session(key: &str, serial: u64) -> (Arc<Session>, OutboundReceiver) {
        let (session, rx) = Session::new(
            serial,
            App::new(Identifier::from_key(key).unwrap()),
            format!("tok-{serial}"),
            false,
        );
        (Arc::new(session), rx)
    }

    async fn next_update(rx: &mut OutboundReceiver) -> RegistryPacket {
        match rx.recv().await.unwrap() {
            Outbound::Frame(frame) => REGISTRY_UPDATE
                .decode(&RawPacket::from_frame(&frame).unwrap())
                .unwrap(),
            _ => panic!("expected frame"),
        }
    }

    #[tokio::test]
    async fn listen_replays_current_value_and_updates_fan_out() {
        let tmp = tempfile::tempdir().unwrap();
        let ext = setup(tmp.path());
        let id = Identifier::from_key("test.a:x/r").unwrap();
        let registry = ext.get_or_create(&id);
        registry.update(Some(vec![0x01])).await.unwrap();

        let (listener, mut rx) = make_session("test.l:x", 1);
        registry.attach(&listener).await;
        let replay = next_update(&mut rx).await;
        assert_eq!(replay.value, Some(vec![0x01]));

        registry.update(Some(vec![0x02])).await.unwrap();
        let update = next_update(&mut rx).await;
        assert_eq!(update.value, Some(vec![0x02]));

        registry.update(None).await.unwrap();
        let cleared = next_update(&mut rx).await;
        assert_eq!(cleared.value, None);
    }

    #[tokio::test]
    async fn values_persist_across_reload() {
        let tmp = tempfile::tempdir().unwrap();
        let id = Identifier::from_key("test.a:x/r").unwrap();
        {
            let ext = setup(tmp.path());
            ext.set(&id, vec![0x01]).await.unwrap();
        }
        let ext = setup(tmp.path());
        assert_eq!(ext.get_or_create(&id).get().await, Some(vec![0x01]));
    }

    #[tokio::test]
    async fn permission_triple_gates_strangers() {
        let tmp = tempfile::tempdir().unwrap();
        let ext = setup(tmp.path());
        let id = Identifier::from_key("test.a:x/r").unwrap();
        let registry = ext.get_or_create(&id);

        // Open by default.
        let (stranger, _rx) = make_session("test.s:x", 1);
        assert!(ext.check(&stranger, &registry, &Access::Read));

        registry.set_permissions(RegistryPermissions {
            all: None,
            read: Some(Identifier::from_key("test.a:x/read").unwrap()),
            write: Some(Identifier::from_key("test.a:x/write").unwrap()),
        });
        let (stranger, _rx) = make_session("test.s:x", 2);
        assert!(!ext.check(&stranger, &registry, &Access::Write));
        assert!(stranger.is_closed());

        // The owner always passes.
        let (owner, _rx) = make_session("test.a:x", 3);
        assert!(ext.check(&owner, &registry, &Access::Write));

        // A granted reader passes the read gate.
        let (reader, _rx) = make_session("test.s:x", 4);
        ext.permissions
            .grant(
                &reader.token,
                &[Identifier::from_key("test.a:x/read").unwrap()],
            )
            .unwrap();
        assert!(ext.check(&reader, &registry, &Access::Read));
    }
}
