//! Persistent ordered keyed stores with a change stream.
//!
//! Writes are serialized per table by a dedicated worker task: a batch is
//! not offered to proxies until the previous batch committed.  Add/update
//! batches pass through attached proxy sessions in registration order
//! before being persisted and fanned out to listeners.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use hub_protocol::packets::table::{
    BindPermissionPacket, SetConfigPacket, TableConfig, TableFetchPacket, TableItems,
    TableItemsPacket, TablePacket, TableProxyPacket, TABLE_BIND_PERMISSION, TABLE_CONFIG,
    TABLE_FETCH, TABLE_FETCH_ALL, TABLE_ITEM_ADD, TABLE_ITEM_CLEAR, TABLE_ITEM_GET,
    TABLE_ITEM_REMOVE, TABLE_ITEM_UPDATE, TABLE_LISTEN, TABLE_PROXY, TABLE_PROXY_LISTEN,
    TABLE_SIZE,
};
use hub_protocol::packets::DisconnectReason;
use hub_protocol::{Identifier, PacketType};
use indexmap::IndexMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, warn};

use crate::dispatcher::{HandlerMode, PacketDispatcher};
use crate::extension::endpoint::EndpointExtension;
use crate::extension::permission::PermissionManager;
use crate::extension::{attach_slot, live_slots, SessionSlot};
use crate::session::Session;

mod adapter;

pub use adapter::{AdapterError, TableAdapter};

#[derive(Debug, Clone, Copy)]
enum UpsertKind {
    Add,
    Update,
}

enum WriteOp {
    Upsert(UpsertKind, TableItems),
    Remove(Vec<String>),
    Clear,
}

struct PendingProxy {
    key: u32,
    reply: oneshot::Sender<TableItems>,
}

pub struct ServerTable {
    id: Identifier,
    adapter: Mutex<TableAdapter>,
    cache: Mutex<IndexMap<String, Vec<u8>>>,
    cache_size: Mutex<Option<usize>>,
    permission: Mutex<Option<Identifier>>,
    listeners: Mutex<Vec<SessionSlot>>,
    proxies: Mutex<Vec<SessionSlot>>,
    writes: mpsc::UnboundedSender<WriteOp>,
    proxy_seq: AtomicU32,
    pending_proxy: Mutex<Option<PendingProxy>>,
}

impl ServerTable {
    fn new(id: Identifier, adapter: TableAdapter) -> Arc<Self> {
        let (writes, rx) = mpsc::unbounded_channel();
        let table = Arc::new(Self {
            id,
            adapter: Mutex::new(adapter),
            cache: Mutex::new(IndexMap::new()),
            cache_size: Mutex::new(None),
            permission: Mutex::new(None),
            listeners: Mutex::new(Vec::new()),
            proxies: Mutex::new(Vec::new()),
            writes,
            proxy_seq: AtomicU32::new(0),
            pending_proxy: Mutex::new(None),
        });
        tokio::spawn(run_writes(Arc::clone(&table), rx));
        table
    }

    pub fn id(&self) -> &Identifier {
        &self.id
    }

    pub fn permission(&self) -> Option<Identifier> {
        self.permission.lock().expect("permission poisoned").clone()
    }

    pub fn bind_permission(&self, permission: Identifier) {
        *self.permission.lock().expect("permission poisoned") = Some(permission);
    }

    pub fn set_config(&self, config: &TableConfig) {
        *self.cache_size.lock().expect("cache size poisoned") = config.cache_size;
        self.trim_cache();
    }

    pub fn attach_listener(&self, session: &Arc<Session>) {
        attach_slot(
            &mut self.listeners.lock().expect("listeners poisoned"),
            session,
        );
    }

    pub fn attach_proxy(&self, session: &Arc<Session>) {
        attach_slot(&mut self.proxies.lock().expect("proxies poisoned"), session);
    }

    /// Enqueues a write; the worker applies batches strictly in order.
    pub fn add(&self, items: TableItems) {
        let _ = self.writes.send(WriteOp::Upsert(UpsertKind::Add, items));
    }

    pub fn update(&self, items: TableItems) {
        let _ = self.writes.send(WriteOp::Upsert(UpsertKind::Update, items));
    }

    pub fn remove(&self, keys: Vec<String>) {
        let _ = self.writes.send(WriteOp::Remove(keys));
    }

    pub fn clear(&self) {
        let _ = self.writes.send(WriteOp::Clear);
    }

    /// Routes a proxy's transformed batch back into the waiting write.
    pub fn resolve_proxy(&self, key: u32, items: TableItems) -> bool {
        let mut pending = self.pending_proxy.lock().expect("pending proxy poisoned");
        if pending.as_ref().is_some_and(|p| p.key == key) {
            let slot = pending.take().expect("checked above");
            return slot.reply.send(items).is_ok();
        }
        false
    }

    pub fn get_many(&self, keys: &[String]) -> Result<TableItems, AdapterError> {
        let mut items = TableItems::new();
        let mut missing: Vec<String> = Vec::new();
        {
            let cache = self.cache.lock().expect("cache poisoned");
            for key in keys {
                match cache.get(key) {
                    Some(value) => {
                        items.insert(key.clone(), value.clone());
                    }
                    None => missing.push(key.clone()),
                }
            }
        }
        if !missing.is_empty() {
            let fetched = self
                .adapter
                .lock()
                .expect("adapter poisoned")
                .get_many(&missing)?;
            self.populate_cache(&fetched);
            items.extend(fetched);
        }
        Ok(items)
    }

    pub fn fetch(
        &self,
        before: Option<u32>,
        after: Option<u32>,
        cursor: Option<&str>,
    ) -> Result<TableItems, AdapterError> {
        let items = self
            .adapter
            .lock()
            .expect("adapter poisoned")
            .fetch(before, after, cursor)?;
        self.populate_cache(&items);
        Ok(items)
    }

    pub fn fetch_all(&self) -> Result<TableItems, AdapterError> {
        self.adapter.lock().expect("adapter poisoned").fetch_all()
    }

    pub fn size(&self) -> Result<u64, AdapterError> {
        self.adapter.lock().expect("adapter poisoned").size()
    }

    fn populate_cache(&self, items: &TableItems) {
        let mut cache = self.cache.lock().expect("cache poisoned");
        for (key, value) in items {
            cache.insert(key.clone(), value.clone());
        }
        drop(cache);
        self.trim_cache();
    }

    fn trim_cache(&self) {
        let limit = *self.cache_size.lock().expect("cache size poisoned");
        if let Some(limit) = limit {
            let mut cache = self.cache.lock().expect("cache poisoned");
            while cache.len() > limit {
                cache.shift_remove_index(0);
            }
        }
    }

    fn broadcast<T>(&self, ty: &PacketType<T>, packet: &T) {
        let sessions = live_slots(&mut self.listeners.lock().expect("listeners poisoned"));
        for session in sessions {
            let _ = session.send(ty, packet);
        }
    }

    /// Runs one upsert batch through the proxy chain, persists it and fans
    /// it out.  Only called from the write worker, one batch at a time.
    async fn apply_upsert(&self, kind: UpsertKind, mut items: TableItems) {
        let proxies = live_slots(&mut self.proxies.lock().expect("proxies poisoned"));
        for proxy in proxies {
            let key = self.proxy_seq.fetch_add(1, Ordering::Relaxed) + 1;
            let (reply, rx) = oneshot::channel();
            *self.pending_proxy.lock().expect("pending proxy poisoned") =
                Some(PendingProxy { key, reply });
            let packet = TableProxyPacket {
                id: self.id.clone(),
                key,
                items: items.clone(),
            };
            if proxy.send(&TABLE_PROXY, &packet).is_err() {
                // Proxy vanished between snapshot and send; skip it.
                *self.pending_proxy.lock().expect("pending proxy poisoned") = None;
                continue;
            }
            let mut closed = proxy.closed_signal();
            tokio::select! {
                transformed = rx => {
                    if let Ok(transformed) = transformed {
                        items = transformed;
                    }
                }
                _ = closed.wait_for(|closed| *closed) => {
                    warn!(table = %self.id, proxy = %proxy.key(), "proxy disconnected mid-batch");
                }
            }
            *self.pending_proxy.lock().expect("pending proxy poisoned") = None;
            if items.is_empty() {
                return;
            }
        }
        if items.is_empty() {
            return;
        }
        // A batch that cannot be persisted must not be broadcast.
        let persisted = self
            .adapter
            .lock()
            .expect("adapter poisoned")
            .set_many(&items);
        if let Err(err) = persisted {
            error!(table = %self.id, error = %err, "failed to persist batch");
            return;
        }
        self.populate_cache(&items);
        let packet = TableItemsPacket {
            id: self.id.clone(),
            items,
        };
        match kind {
            UpsertKind::Add => self.broadcast(&TABLE_ITEM_ADD, &packet),
            UpsertKind::Update => self.broadcast(&TABLE_ITEM_UPDATE, &packet),
        }
    }

    fn apply_remove(&self, keys: Vec<String>) {
        let removed = match self.adapter.lock().expect("adapter poisoned").get_many(&keys) {
            Ok(removed) => removed,
            Err(err) => {
                error!(table = %self.id, error = %err, "failed to read removal batch");
                return;
            }
        };
        if removed.is_empty() {
            return;
        }
        let deleted: Vec<String> = removed.keys().cloned().collect();
        if let Err(err) = self
            .adapter
            .lock()
            .expect("adapter poisoned")
            .remove_many(&deleted)
        {
            error!(table = %self.id, error = %err, "failed to persist removal");
            return;
        }
        {
            let mut cache = self.cache.lock().expect("cache poisoned");
            for key in &deleted {
                cache.shift_remove(key);
            }
        }
        self.broadcast(
            &TABLE_ITEM_REMOVE,
            &TableItemsPacket {
                id: self.id.clone(),
                items: removed,
            },
        );
    }

    fn apply_clear(&self) {
        if let Err(err) = self.adapter.lock().expect("adapter poisoned").clear() {
            error!(table = %self.id, error = %err, "failed to clear table");
            return;
        }
        self.cache.lock().expect("cache poisoned").clear();
        self.broadcast(
            &TABLE_ITEM_CLEAR,
            &TablePacket {
                id: self.id.clone(),
            },
        );
    }
}

async fn run_writes(table: Arc<ServerTable>, mut rx: mpsc::UnboundedReceiver<WriteOp>) {
    while let Some(op) = rx.recv().await {
        match op {
            WriteOp::Upsert(kind, items) => table.apply_upsert(kind, items).await,
            WriteOp::Remove(keys) => table.apply_remove(keys),
            WriteOp::Clear => table.apply_clear(),
        }
    }
}

pub struct TableExtension {
    tables: RwLock<HashMap<Identifier, Arc<ServerTable>>>,
    dir: PathBuf,
    permissions: Arc<PermissionManager>,
}

impl TableExtension {
    pub fn new(
        dispatcher: &PacketDispatcher,
        endpoints: &EndpointExtension,
        permissions: Arc<PermissionManager>,
        dir: PathBuf,
    ) -> Arc<Self> {
        for ty in [&*TABLE_LISTEN, &*TABLE_PROXY_LISTEN] {
            dispatcher.register(ty);
        }
        dispatcher.register(&TABLE_PROXY);
        dispatcher.register(&TABLE_CONFIG);
        dispatcher.register(&TABLE_BIND_PERMISSION);
        dispatcher.register(&TABLE_ITEM_ADD);
        dispatcher.register(&TABLE_ITEM_UPDATE);
        dispatcher.register(&TABLE_ITEM_REMOVE);
        dispatcher.register(&TABLE_ITEM_CLEAR);

        let extension = Arc::new(Self {
            tables: RwLock::new(HashMap::new()),
            dir,
            permissions,
        });

        let ext = Arc::clone(&extension);
        dispatcher.add_packet_handler(&TABLE_LISTEN, HandlerMode::Inline, move |session, id| {
            let ext = Arc::clone(&ext);
            async move {
                if let Some(table) = ext.checked_table(&session, &id) {
                    table.attach_listener(&session);
                }
            }
        });
        let ext = Arc::clone(&extension);
        dispatcher.add_packet_handler(
            &TABLE_PROXY_LISTEN,
            HandlerMode::Inline,
            move |session, id| {
                let ext = Arc::clone(&ext);
                async move {
                    if let Some(table) = ext.checked_table(&session, &id) {
                        table.attach_proxy(&session);
                    }
                }
            },
        );
        let ext = Arc::clone(&extension);
        dispatcher.add_packet_handler(
            &TABLE_PROXY,
            HandlerMode::Inline,
            move |session, packet: TableProxyPacket| {
                let ext = Arc::clone(&ext);
                async move {
                    if let Some(table) = ext.checked_table(&session, &packet.id) {
                        if !table.resolve_proxy(packet.key, packet.items) {
                            warn!(
                                app = %session.key(),
                                table = %packet.id,
                                key = packet.key,
                                "stale proxy reply"
                            );
                        }
                    }
                }
            },
        );
        let ext = Arc::clone(&extension);
        dispatcher.add_packet_handler(
            &TABLE_CONFIG,
            HandlerMode::Inline,
            move |session, packet: SetConfigPacket| {
                let ext = Arc::clone(&ext);
                async move {
                    if let Some(table) = ext.checked_table(&session, &packet.id) {
                        table.set_config(&packet.config);
                    }
                }
            },
        );
        let ext = Arc::clone(&extension);
        dispatcher.add_packet_handler(
            &TABLE_BIND_PERMISSION,
            HandlerMode::Inline,
            move |session, packet: BindPermissionPacket| {
                let ext = Arc::clone(&ext);
                async move {
                    if let Some(table) = ext.checked_table(&session, &packet.id) {
                        table.bind_permission(packet.permission);
                    }
                }
            },
        );
        let ext = Arc::clone(&extension);
        dispatcher.add_packet_handler(
            &TABLE_ITEM_ADD,
            HandlerMode::Inline,
            move |session, packet: TableItemsPacket| {
                let ext = Arc::clone(&ext);
                async move {
                    if let Some(table) = ext.checked_table(&session, &packet.id) {
                        table.add(packet.items);
                    }
                }
            },
        );
        let ext = Arc::clone(&extension);
        dispatcher.add_packet_handler(
            &TABLE_ITEM_UPDATE,
            HandlerMode::Inline,
            move |session, packet: TableItemsPacket| {
                let ext = Arc::clone(&ext);
                async move {
                    if let Some(table) = ext.checked_table(&session, &packet.id) {
                        table.update(packet.items);
                    }
                }
            },
        );
        let ext = Arc::clone(&extension);
        dispatcher.add_packet_handler(
            &TABLE_ITEM_REMOVE,
            HandlerMode::Inline,
            move |session, packet: TableItemsPacket| {
                let ext = Arc::clone(&ext);
                async move {
                    if let Some(table) = ext.checked_table(&session, &packet.id) {
                        table.remove(packet.items.keys().cloned().collect());
                    }
                }
            },
        );
        let ext = Arc::clone(&extension);
        dispatcher.add_packet_handler(
            &TABLE_ITEM_CLEAR,
            HandlerMode::Inline,
            move |session, packet: TablePacket| {
                let ext = Arc::clone(&ext);
                async move {
                    if let Some(table) = ext.checked_table(&session, &packet.id) {
                        table.clear();
                    }
                }
            },
        );

        let ext = Arc::clone(&extension);
        endpoints.bind_endpoint(&TABLE_ITEM_GET, None, move |session, packet| {
            let ext = Arc::clone(&ext);
            async move {
                let table = ext
                    .checked_table(&session, &packet.id)
                    .ok_or("Permission denied")?;
                let items = table.get_many(&packet.keys).map_err(|e| e.to_string())?;
                Ok(TableItemsPacket {
                    id: packet.id,
                    items,
                })
            }
        });
        let ext = Arc::clone(&extension);
        endpoints.bind_endpoint(
            &TABLE_FETCH,
            None,
            move |session, packet: TableFetchPacket| {
                let ext = Arc::clone(&ext);
                async move {
                    let table = ext
                        .checked_table(&session, &packet.id)
                        .ok_or("Permission denied")?;
                    let items = table
                        .fetch(packet.before, packet.after, packet.cursor.as_deref())
                        .map_err(|e| e.to_string())?;
                    Ok(TableItemsPacket {
                        id: packet.id,
                        items,
                    })
                }
            },
        );
        let ext = Arc::clone(&extension);
        endpoints.bind_endpoint(&TABLE_FETCH_ALL, None, move |session, packet: TablePacket| {
            let ext = Arc::clone(&ext);
            async move {
                let table = ext
                    .checked_table(&session, &packet.id)
                    .ok_or("Permission denied")?;
                let items = table.fetch_all().map_err(|e| e.to_string())?;
                Ok(TableItemsPacket {
                    id: packet.id,
                    items,
                })
            }
        });
        let ext = Arc::clone(&extension);
        endpoints.bind_endpoint(&TABLE_SIZE, None, move |session, packet: TablePacket| {
            let ext = Arc::clone(&ext);
            async move {
                let table = ext
                    .checked_table(&session, &packet.id)
                    .ok_or("Permission denied")?;
                table.size().map_err(|e| e.to_string())
            }
        });

        extension
    }

    /// Opens (or returns) the table, backed by its sqlite store under the
    /// tables directory.
    pub fn get_or_create(&self, id: &Identifier) -> Result<Arc<ServerTable>, AdapterError> {
        if let Some(table) = self.tables.read().expect("tables poisoned").get(id) {
            return Ok(Arc::clone(table));
        }
        let path = self.dir.join(id.sanitized_path());
        if let Some(parent) = path.parent() {
            if let Err(err) = std::fs::create_dir_all(parent) {
                error!(table = %id, error = %err, "failed to create table directory");
            }
        }
        let adapter = TableAdapter::open(&path)?;
        let mut tables = self.tables.write().expect("tables poisoned");
        Ok(Arc::clone(
            tables
                .entry(id.clone())
                .or_insert_with(|| ServerTable::new(id.clone(), adapter)),
        ))
    }

    /// Resolves the table and enforces its permission gate.  Only the
    /// owning app passes outright; everyone else — the dashboard included —
    /// needs a bound permission that `has_permission` accepts, and a table
    /// with no permission set rejects every non-owner.  Violations
    /// disconnect with `PERMISSION_DENIED`.
    fn checked_table(&self, session: &Arc<Session>, id: &Identifier) -> Option<Arc<ServerTable>> {
        let table = match self.get_or_create(id) {
            Ok(table) => table,
            Err(err) => {
                error!(table = %id, error = %err, "failed to open table");
                return None;
            }
        };
        if id.is_subpath_of(&session.app.identifier) {
            return Some(table);
        }
        match table.permission() {
            None => {
                session.disconnect(
                    DisconnectReason::PermissionDenied,
                    Some(format!("table {id} does not have a permission set")),
                );
                None
            }
            Some(permission) => {
                if self.permissions.has_permission(session, &permission) {
                    Some(table)
                } else {
                    session.disconnect(
                        DisconnectReason::PermissionDenied,
                        Some(format!("table {id} requires permission {permission}")),
                    );
                    None
                }
            }
        }
    }
}
