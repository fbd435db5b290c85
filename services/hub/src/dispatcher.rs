//! Fan-out of decoded packets to registered handlers.
//!
//! Every packet type the hub understands is registered here at construction
//! time.  A frame whose type-key has no entry at all gets its sender
//! disconnected with `INVALID_PACKET_TYPE`; a registered type with no
//! handlers is logged and dropped (handlers may be intentionally absent for
//! client-bound packets).

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use hub_protocol::packets::DisconnectReason;
use hub_protocol::{PacketType, RawPacket};
use tracing::warn;

use crate::session::Session;

/// How a handler runs relative to the session's read loop.
///
/// `Inline` handlers run in packet-receive order and must not block on the
/// network; anything long-lived (ready gates, dashboard round-trips, server
/// endpoint bodies) spawns internally or registers as `Spawn`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerMode {
    Inline,
    Spawn,
}

type DynHandler = Arc<dyn Fn(Arc<Session>, Bytes) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Default)]
struct Listeners {
    handlers: Vec<(HandlerMode, DynHandler)>,
}

#[derive(Default)]
pub struct PacketDispatcher {
    entries: RwLock<HashMap<String, Listeners>>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    Handled,
    UnknownType,
}

impl PacketDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a packet type with an empty handler set.  Double
    /// registration is a startup bug.
    pub fn register<T>(&self, ty: &PacketType<T>) {
        let mut entries = self.entries.write().expect("dispatcher poisoned");
        let key = ty.id().key();
        assert!(
            entries.insert(key.clone(), Listeners::default()).is_none(),
            "packet type {key} registered twice"
        );
    }

    /// Appends a typed handler.  The wrapper decodes the payload with the
    /// packet type's codec; a payload that fails to decode disconnects the
    /// sender with `INVALID_PACKET_DATA`.
    pub fn add_packet_handler<T, F, Fut>(&self, ty: &PacketType<T>, mode: HandlerMode, handler: F)
    where
        T: Send + 'static,
        F: Fn(Arc<Session>, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let codec = Arc::clone(ty.codec());
        let key = ty.id().key();
        let type_key = key.clone();
        let wrapped: DynHandler = Arc::new(move |session: Arc<Session>, data: Bytes| {
            match codec.decode(&data) {
                Ok(value) => handler(session, value).boxed(),
                Err(err) => {
                    session.disconnect(
                        DisconnectReason::InvalidPacketData,
                        Some(format!("bad payload for {type_key}: {err}")),
                    );
                    futures_util::future::ready(()).boxed()
                }
            }
        });
        let mut entries = self.entries.write().expect("dispatcher poisoned");
        entries
            .get_mut(&key)
            .unwrap_or_else(|| panic!("packet type {key} not registered"))
            .handlers
            .push((mode, wrapped));
    }

    /// Routes one inbound packet.  Inline handlers are awaited in order;
    /// spawned handlers each get an independent task so a slow one cannot
    /// stall the read loop.
    pub async fn dispatch(&self, session: &Arc<Session>, raw: &RawPacket) -> DispatchOutcome {
        let handlers = {
            let entries = self.entries.read().expect("dispatcher poisoned");
            match entries.get(&raw.type_key) {
                None => return DispatchOutcome::UnknownType,
                Some(entry) => entry.handlers.clone(),
            }
        };
        if handlers.is_empty() {
            warn!(app = %session.key(), type_key = %raw.type_key, "no handlers for packet");
            return DispatchOutcome::Handled;
        }
        for (mode, handler) in handlers {
            match mode {
                HandlerMode::Spawn => {
                    tokio::spawn(handler(Arc::clone(session), raw.data.clone()));
                }
                HandlerMode::Inline => handler(Arc::clone(session), raw.data.clone()).await,
            }
        }
        DispatchOutcome::Handled
    }
}
