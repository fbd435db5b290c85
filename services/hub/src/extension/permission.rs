//! Permission registry, per-token grant sets, and the dashboard-arbitrated
//! `require` flow.
//!
//! Grants are keyed by session token and persisted in
//! `permissions/permissions.db` as one JSON array of permission keys per
//! token, so an app keeps its grants across reconnects.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use hub_protocol::packets::dashboard::PermissionRequestPacket;
use hub_protocol::packets::permission::{
    PermissionType, PERMISSION_GRANT, PERMISSION_REGISTER, PERMISSION_REQUIRE,
};
use hub_protocol::packets::DisconnectReason;
use hub_protocol::Identifier;
use rusqlite::{params, Connection};
use thiserror::Error;
use tracing::warn;

use crate::dispatcher::{HandlerMode, PacketDispatcher};
use crate::extension::dashboard::DashboardChannel;
use crate::session::{ReadyError, Session};

#[derive(Debug, Error)]
pub enum PermissionError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

pub struct PermissionManager {
    registry: RwLock<HashMap<Identifier, PermissionType>>,
    granted: RwLock<HashMap<String, HashSet<Identifier>>>,
    db: Mutex<Connection>,
    request_seq: AtomicU64,
    dashboard: Arc<DashboardChannel>,
}

impl PermissionManager {
    pub fn open(
        permissions_dir: &Path,
        dashboard: Arc<DashboardChannel>,
    ) -> Result<Arc<Self>, PermissionError> {
        let conn = Connection::open(permissions_dir.join("permissions.db"))?;
        Self::init(conn, dashboard)
    }

    #[cfg(test)]
    pub fn open_in_memory(dashboard: Arc<DashboardChannel>) -> Result<Arc<Self>, PermissionError> {
        Self::init(Connection::open_in_memory()?, dashboard)
    }

    fn init(
        conn: Connection,
        dashboard: Arc<DashboardChannel>,
    ) -> Result<Arc<Self>, PermissionError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS permissions (
                id TEXT PRIMARY KEY,
                value BLOB
            )",
        )?;
        let mut granted: HashMap<String, HashSet<Identifier>> = HashMap::new();
        {
            let mut stmt = conn.prepare("SELECT id, value FROM permissions")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?;
            for row in rows {
                let (token, blob) = row?;
                let keys: Vec<String> = serde_json::from_slice(&blob)?;
                let ids = keys
                    .iter()
                    .filter_map(|key| Identifier::from_key(key).ok())
                    .collect();
                granted.insert(token, ids);
            }
        }
        Ok(Arc::new(Self {
            registry: RwLock::new(HashMap::new()),
            granted: RwLock::new(granted),
            db: Mutex::new(conn),
            request_seq: AtomicU64::new(0),
            dashboard,
        }))
    }

    pub fn install(self: &Arc<Self>, dispatcher: &PacketDispatcher) {
        dispatcher.register(&PERMISSION_REGISTER);
        dispatcher.register(&PERMISSION_REQUIRE);
        dispatcher.register(&PERMISSION_GRANT);

        let manager = Arc::clone(self);
        dispatcher.add_packet_handler(
            &PERMISSION_REGISTER,
            HandlerMode::Inline,
            move |session, permissions: Vec<PermissionType>| {
                let manager = Arc::clone(&manager);
                async move { manager.handle_register(&session, permissions) }
            },
        );
        let manager = Arc::clone(self);
        dispatcher.add_packet_handler(
            &PERMISSION_REQUIRE,
            HandlerMode::Inline,
            move |session, ids: Vec<Identifier>| {
                let manager = Arc::clone(&manager);
                async move { manager.handle_require(&session, ids) }
            },
        );
    }

    fn handle_register(&self, session: &Arc<Session>, permissions: Vec<PermissionType>) {
        for permission in &permissions {
            if !session.is_dashboard && !permission.id.is_subpath_of(&session.app.identifier) {
                warn!(
                    app = %session.key(),
                    permission = %permission.id,
                    "permission registration outside app namespace"
                );
                session.disconnect(
                    DisconnectReason::PermissionDenied,
                    Some(format!(
                        "permission {} is not under app {}",
                        permission.id, session.app.identifier
                    )),
                );
                return;
            }
        }
        let mut registry = self.registry.write().expect("permission registry poisoned");
        for permission in permissions {
            registry.insert(permission.id.clone(), permission);
        }
    }

    /// Installs a ready task that routes any missing permissions through
    /// the dashboard for approval.  Denial disconnects the session.
    fn handle_require(self: &Arc<Self>, session: &Arc<Session>, ids: Vec<Identifier>) {
        let missing: Vec<Identifier> = {
            let granted = self.granted.read().expect("grants poisoned");
            let held = granted.get(&session.token);
            ids.into_iter()
                .filter(|id| {
                    !id.is_subpath_of(&session.app.identifier)
                        && !held.is_some_and(|set| set.contains(id))
                })
                .collect()
        };
        if missing.is_empty() || session.is_dashboard {
            return;
        }
        let Some(done) = session.add_ready_task("permissions") else {
            warn!(app = %session.key(), "permission require after ready");
            return;
        };
        let manager = Arc::clone(self);
        let session = Arc::clone(session);
        tokio::spawn(async move {
            let result = manager.request_grant(&session, &missing).await;
            let _ = done.send(result);
        });
    }

    async fn request_grant(
        &self,
        session: &Arc<Session>,
        ids: &[Identifier],
    ) -> Result<(), ReadyError> {
        let permissions: Vec<PermissionType> = {
            let registry = self.registry.read().expect("permission registry poisoned");
            let mut permissions = Vec::with_capacity(ids.len());
            for id in ids {
                match registry.get(id) {
                    Some(permission) => permissions.push(permission.clone()),
                    None => {
                        return Err(ReadyError {
                            reason: DisconnectReason::PermissionDenied,
                            message: format!("permission {id} is not registered"),
                        });
                    }
                }
            }
            permissions
        };
        let request_id = self.next_request_id();
        let request = PermissionRequestPacket {
            request_id: request_id.clone(),
            app: session.app.clone(),
            permissions: permissions.clone(),
        };
        if self.dashboard.request(request).await {
            let ids: Vec<Identifier> = permissions.iter().map(|p| p.id.clone()).collect();
            if let Err(err) = self.grant(&session.token, &ids) {
                return Err(ReadyError {
                    reason: DisconnectReason::PermissionDenied,
                    message: format!("failed to persist grant: {err}"),
                });
            }
            if !session.is_closed() {
                let _ = session.send(&PERMISSION_GRANT, &permissions);
            }
            Ok(())
        } else {
            Err(ReadyError {
                reason: DisconnectReason::PermissionDenied,
                message: format!("permission request denied (id={request_id})"),
            })
        }
    }

    /// `"{counter}-{unix_nanos}"`, monotonic per hub lifetime.
    fn next_request_id(&self) -> String {
        let counter = self.request_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        format!("{counter}-{nanos}")
    }

    pub fn register_permission(&self, permission: PermissionType) {
        self.registry
            .write()
            .expect("permission registry poisoned")
            .insert(permission.id.clone(), permission);
    }

    pub fn get(&self, id: &Identifier) -> Option<PermissionType> {
        self.registry
            .read()
            .expect("permission registry poisoned")
            .get(id)
            .cloned()
    }

    /// Grants and persists in one short critical section.
    pub fn grant(&self, token: &str, ids: &[Identifier]) -> Result<(), PermissionError> {
        let keys: Vec<String> = {
            let mut granted = self.granted.write().expect("grants poisoned");
            let set = granted.entry(token.to_owned()).or_default();
            for id in ids {
                set.insert(id.clone());
            }
            set.iter().map(Identifier::key).collect()
        };
        let blob = serde_json::to_vec(&keys)?;
        let db = self.db.lock().expect("permission db poisoned");
        db.execute(
            "INSERT OR REPLACE INTO permissions (id, value) VALUES (?1, ?2)",
            params![token, blob],
        )?;
        Ok(())
    }

    /// True iff the id is under the session's app, the session is the
    /// dashboard, or the id is in the session token's grant set.
    pub fn has_permission(&self, session: &Session, id: &Identifier) -> bool {
        if id.is_subpath_of(&session.app.identifier) || session.is_dashboard {
            return true;
        }
        self.granted
            .read()
            .expect("grants poisoned")
            .get(&session.token)
            .is_some_and(|set| set.contains(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hub_protocol::packets::permission::{PermissionLevel, PermissionMetadata};
    use hub_protocol::App;

    fn make_session(key: &str, token: &str, is_dashboard: bool) -> Arc<Session> {
        let (session, _rx) = Session::new(
            1,
            App::new(Identifier::from_key(key).unwrap()),
            token.to_owned(),
            is_dashboard,
        );
        Arc::new(session)
    }

    fn permission(key: &str) -> PermissionType {
        PermissionType {
            id: Identifier::from_key(key).unwrap(),
            metadata: PermissionMetadata {
                level: PermissionLevel::Low,
                name: "Test".to_owned(),
                note: None,
            },
        }
    }

    #[test]
    fn has_permission_triple_rule() {
        let manager =
            PermissionManager::open_in_memory(Arc::new(DashboardChannel::new())).unwrap();
        let owner = make_session("test.a:x", "t1", false);
        let other = make_session("test.b:y", "t2", false);
        let dashboard = make_session("test.d:dash", "t3", true);
        let id = Identifier::from_key("test.a:x/perm").unwrap();

        assert!(manager.has_permission(&owner, &id));
        assert!(!manager.has_permission(&other, &id));
        assert!(manager.has_permission(&dashboard, &id));

        manager.grant("t2", std::slice::from_ref(&id)).unwrap();
        assert!(manager.has_permission(&other, &id));
    }

    #[test]
    fn grants_persist_across_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let id = Identifier::from_key("test.a:x/perm").unwrap();
        {
            let manager =
                PermissionManager::open(tmp.path(), Arc::new(DashboardChannel::new())).unwrap();
            manager.grant("tok", std::slice::from_ref(&id)).unwrap();
        }
        let manager =
            PermissionManager::open(tmp.path(), Arc::new(DashboardChannel::new())).unwrap();
        let session = make_session("test.b:y", "tok", false);
        assert!(manager.has_permission(&session, &id));
    }

    #[test]
    fn foreign_permission_registration_disconnects() {
        let manager =
            PermissionManager::open_in_memory(Arc::new(DashboardChannel::new())).unwrap();
        let session = make_session("test.a:x", "t1", false);
        manager.handle_register(&session, vec![permission("test.b:y/perm")]);
        assert!(session.is_closed());
        assert!(manager.get(&Identifier::from_key("test.b:y/perm").unwrap()).is_none());

        let dashboard = make_session("test.d:dash", "t2", true);
        manager.handle_register(&dashboard, vec![permission("test.b:y/perm")]);
        assert!(!dashboard.is_closed());
        assert!(manager.get(&Identifier::from_key("test.b:y/perm").unwrap()).is_some());
    }

    #[test]
    fn request_ids_are_monotonic() {
        let manager =
            PermissionManager::open_in_memory(Arc::new(DashboardChannel::new())).unwrap();
        let a = manager.next_request_id();
        let b = manager.next_request_id();
        assert!(a.starts_with("1-"));
        assert!(b.starts_with("2-"));
    }
}
