//! The typed resource extensions: endpoints, tables, registries, signals,
//! the dashboard role, permissions, and the hub's own app/version surface.

use std::sync::{Arc, Weak};

use crate::session::Session;

pub mod dashboard;
pub mod endpoint;
pub mod permission;
pub mod registry;
pub mod server;
pub mod signal;
pub mod table;

/// A non-owning slot in a listener list.  Dead or superseded sessions are
/// pruned lazily at fan-out time.
pub(crate) struct SessionSlot {
    pub serial: u64,
    pub session: Weak<Session>,
}

impl SessionSlot {
    pub fn new(session: &Arc<Session>) -> Self {
        Self {
            serial: session.serial,
            session: Arc::downgrade(session),
        }
    }

    pub fn live(&self) -> Option<Arc<Session>> {
        self.session.upgrade().filter(|s| !s.is_closed())
    }
}

/// Attaches a session to a listener list, replacing any earlier attachment
/// from the same app.
pub(crate) fn attach_slot(slots: &mut Vec<SessionSlot>, session: &Arc<Session>) {
    slots.retain(|slot| {
        slot.session
            .upgrade()
            .is_some_and(|s| !s.is_closed() && s.key() != session.key())
    });
    slots.push(SessionSlot::new(session));
}

/// Snapshot of live sessions in a listener list, pruning dead slots.
pub(crate) fn live_slots(slots: &mut Vec<SessionSlot>) -> Vec<Arc<Session>> {
    slots.retain(|slot| slot.live().is_some());
    slots.iter().filter_map(SessionSlot::live).collect()
}
