//! Stateless fan-out channels with a listen/notify permission split.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use hub_protocol::packets::signal::{
    SignalPacket, SignalPermissions, SignalRegisterPacket, SIGNAL_LISTEN, SIGNAL_NOTIFY,
    SIGNAL_REGISTER,
};
use hub_protocol::packets::DisconnectReason;
use hub_protocol::Identifier;

use crate::dispatcher::{HandlerMode, PacketDispatcher};
use crate::extension::permission::PermissionManager;
use crate::extension::{attach_slot, live_slots, SessionSlot};
use crate::session::Session;

struct ServerSignal {
    id: Identifier,
    permissions: Mutex<SignalPermissions>,
    listeners: Mutex<Vec<SessionSlot>>,
}

impl ServerSignal {
    fn new(id: Identifier) -> Arc<Self> {
        Arc::new(Self {
            id,
            permissions: Mutex::new(SignalPermissions::default()),
            listeners: Mutex::new(Vec::new()),
        })
    }

    fn notify(&self, body: &[u8]) {
        let packet = SignalPacket {
            id: self.id.clone(),
            body: body.to_vec(),
        };
        let sessions = live_slots(&mut self.listeners.lock().expect("listeners poisoned"));
        for session in sessions {
            let _ = session.send(&SIGNAL_NOTIFY, &packet);
        }
    }
}

enum Access {
    Configure,
    Listen,
    Notify,
}

pub struct SignalExtension {
    signals: RwLock<HashMap<Identifier, Arc<ServerSignal>>>,
    permissions: Arc<PermissionManager>,
}

impl SignalExtension {
    pub fn new(dispatcher: &PacketDispatcher, permissions: Arc<PermissionManager>) -> Arc<Self> {
        dispatcher.register(&SIGNAL_REGISTER);
        dispatcher.register(&SIGNAL_LISTEN);
        dispatcher.register(&SIGNAL_NOTIFY);

        let extension = Arc::new(Self {
            signals: RwLock::new(HashMap::new()),
            permissions,
        });

        let ext = Arc::clone(&extension);
        dispatcher.add_packet_handler(
            &SIGNAL_REGISTER,
            HandlerMode::Inline,
            move |session, packet: SignalRegisterPacket| {
                let ext = Arc::clone(&ext);
                async move {
                    let signal = ext.get_or_create(&packet.id);
                    if ext.check(&session, &signal, &Access::Configure) {
                        *signal.permissions.lock().expect("permissions poisoned") =
                            packet.permissions;
                    }
                }
            },
        );
        let ext = Arc::clone(&extension);
        dispatcher.add_packet_handler(
            &SIGNAL_LISTEN,
            HandlerMode::Inline,
            move |session, id: Identifier| {
                let ext = Arc::clone(&ext);
                async move {
                    let signal = ext.get_or_create(&id);
                    if ext.check(&session, &signal, &Access::Listen) {
                        attach_slot(
                            &mut signal.listeners.lock().expect("listeners poisoned"),
                            &session,
                        );
                    }
                }
            },
        );
        let ext = Arc::clone(&extension);
        dispatcher.add_packet_handler(
            &SIGNAL_NOTIFY,
            HandlerMode::Inline,
            move |session, packet: SignalPacket| {
                let ext = Arc::clone(&ext);
                async move {
                    let signal = ext.get_or_create(&packet.id);
                    if ext.check(&session, &signal, &Access::Notify) {
                        signal.notify(&packet.body);
                    }
                }
            },
        );

        extension
    }

    fn get_or_create(&self, id: &Identifier) -> Arc<ServerSignal> {
        if let Some(signal) = self.signals.read().expect("signals poisoned").get(id) {
            return Arc::clone(signal);
        }
        let mut signals = self.signals.write().expect("signals poisoned");
        Arc::clone(
            signals
                .entry(id.clone())
                .or_insert_with(|| ServerSignal::new(id.clone())),
        )
    }

    /// Subpath of the signal id auto-passes.  Configuring requires `all`;
    /// listening `all` or `listen`; notifying `all` or `notify`.  An unset
    /// triple leaves the signal open.
    fn check(&self, session: &Arc<Session>, signal: &ServerSignal, access: &Access) -> bool {
        if signal.id.is_subpath_of(&session.app.identifier) || session.is_dashboard {
            return true;
        }
        let required: Vec<Identifier> = {
            let perms = signal.permissions.lock().expect("permissions poisoned");
            let scoped = match access {
                Access::Configure => None,
                Access::Listen => perms.listen.clone(),
                Access::Notify => perms.notify.clone(),
            };
            [perms.all.clone(), scoped].into_iter().flatten().collect()
        };
        if matches!(access, Access::Configure) && required.is_empty() {
            // Only the owner (or an `all` holder) may reconfigure.
            session.disconnect(
                DisconnectReason::PermissionDenied,
                Some(format!("signal {} is not under app {}", signal.id, session.app.identifier)),
            );
            return false;
        }
        if required.is_empty()
            || required
                .iter()
                .any(|id| self.permissions.has_permission(session, id))
        {
            return true;
        }
        session.disconnect(
            DisconnectReason::PermissionDenied,
            Some(format!("signal {} requires permission", signal.id)),
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

    fn setup() -> Arc<SignalExtension> {
        let dispatcher = PacketDispatcher::new();
        let permissions =
            PermissionManager::open_in_memory(Arc::new(DashboardChannel::new())).unwrap();
        SignalExtension::new(&dispatcher, permissions)
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

    #[tokio::test]
    async fn notify_fans_out_raw_bodies_to_listeners() {
        let ext = setup();
        let id = Identifier::from_key("test.a:x/ping").unwrap();
        let signal = ext.get_or_create(&id);
        let (listener, mut rx) = make_session("test.l:x", 1);
        attach_slot(&mut signal.listeners.lock().unwrap(), &listener);

        signal.notify(&[1, 2, 3]);
        let frame = match rx.recv().await.unwrap() {
            Outbound::Frame(frame) => frame,
            _ => panic!("expected frame"),
        };
        let packet = SIGNAL_NOTIFY
            .decode(&RawPacket::from_frame(&frame).unwrap())
            .unwrap();
        assert_eq!(packet.body, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn listen_and_notify_permissions_are_split() {
        let ext = setup();
        let id = Identifier::from_key("test.a:x/ping").unwrap();
        let signal = ext.get_or_create(&id);
        *signal.permissions.lock().unwrap() = SignalPermissions {
            all: None,
            listen: Some(Identifier::from_key("test.a:x/can_listen").unwrap()),
            notify: Some(Identifier::from_key("test.a:x/can_notify").unwrap()),
        };

        let (listener, _rx) = make_session("test.s:x", 1);
        ext.permissions
            .grant(
                &listener.token,
                &[Identifier::from_key("test.a:x/can_listen").unwrap()],
            )
            .unwrap();
        assert!(ext.check(&listener, &signal, &Access::Listen));
        assert!(!ext.check(&listener, &signal, &Access::Notify));
        assert!(listener.is_closed());

        // Owner passes everything, including configuration.
        let (owner, _rx) = make_session("test.a:x", 2);
        assert!(ext.check(&owner, &signal, &Access::Configure));

        // A stranger cannot reconfigure an open signal.
        let (stranger, _rx) = make_session("test.s:y", 3);
        let open = ext.get_or_create(&Identifier::from_key("test.a:x/other").unwrap());
        assert!(!ext.check(&stranger, &open, &Access::Configure));
    }
}
