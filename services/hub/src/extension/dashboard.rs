//! The dashboard role: permission-request arbitration and the open-app
//! channel.
//!
//! Exactly one session (authenticated by the preconfigured dashboard token)
//! may claim the role.  Permission requests issued while no dashboard is
//! connected queue up and are flushed when the role is claimed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use hub_protocol::packets::dashboard::{
    DashboardSetResponse, OpenAppResponse, OpenAppStatus, PermissionRequestPacket,
    DASHBOARD_OPEN_APP, DASHBOARD_OPEN_APP_ENDPOINT, DASHBOARD_PERMISSION_ACCEPT,
    DASHBOARD_PERMISSION_DENY, DASHBOARD_PERMISSION_REQUEST, DASHBOARD_SET,
};
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::dispatcher::{HandlerMode, PacketDispatcher};
use crate::extension::endpoint::EndpointExtension;
use crate::network::{Network, SessionEvent};
use crate::session::Session;

/// Shared between the permission manager (which issues requests) and the
/// dashboard extension (which resolves them).
pub struct DashboardChannel {
    session: RwLock<Option<Arc<Session>>>,
    pending: Mutex<HashMap<String, oneshot::Sender<bool>>>,
    queue: Mutex<Vec<PermissionRequestPacket>>,
}

impl Default for DashboardChannel {
    fn default() -> Self {
        Self {
            session: RwLock::new(None),
            pending: Mutex::new(HashMap::new()),
            queue: Mutex::new(Vec::new()),
        }
    }
}

impl DashboardChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<Arc<Session>> {
        self.session.read().expect("dashboard slot poisoned").clone()
    }

    /// Sends the request to the dashboard (or queues it) and awaits the
    /// accept/deny verdict.  A dropped dashboard resolves to deny only when
    /// the request was already lost; queued requests survive role handoff.
    pub async fn request(&self, request: PermissionRequestPacket) -> bool {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending requests poisoned")
            .insert(request.request_id.clone(), tx);
        match self.current() {
            Some(dashboard) if !dashboard.is_closed() => {
                if dashboard
                    .send(&DASHBOARD_PERMISSION_REQUEST, &request)
                    .is_err()
                {
                    self.queue.lock().expect("request queue poisoned").push(request);
                }
            }
            _ => {
                self.queue.lock().expect("request queue poisoned").push(request);
            }
        }
        rx.await.unwrap_or(false)
    }

    /// Resolves one pending request; false when the id is unknown.
    pub fn resolve(&self, request_id: &str, accepted: bool) -> bool {
        let sender = self
            .pending
            .lock()
            .expect("pending requests poisoned")
            .remove(request_id);
        match sender {
            Some(tx) => tx.send(accepted).is_ok(),
            None => false,
        }
    }

    /// Claims the role and flushes every queued request to the new holder.
    pub fn set_session(&self, session: &Arc<Session>) {
        *self.session.write().expect("dashboard slot poisoned") = Some(Arc::clone(session));
        let queued: Vec<PermissionRequestPacket> =
            std::mem::take(&mut *self.queue.lock().expect("request queue poisoned"));
        for request in queued {
            if session.send(&DASHBOARD_PERMISSION_REQUEST, &request).is_err() {
                self.queue.lock().expect("request queue poisoned").push(request);
            }
        }
    }

    pub fn clear_if(&self, serial: u64) {
        let mut slot = self.session.write().expect("dashboard slot poisoned");
        if slot.as_ref().is_some_and(|s| s.serial == serial) {
            *slot = None;
        }
    }
}

pub struct DashboardExtension {
    channel: Arc<DashboardChannel>,
    network: Arc<Network>,
}

impl DashboardExtension {
    pub fn new(
        dispatcher: &PacketDispatcher,
        endpoints: &EndpointExtension,
        network: Arc<Network>,
        channel: Arc<DashboardChannel>,
    ) -> Arc<Self> {
        dispatcher.register(&DASHBOARD_PERMISSION_REQUEST);
        dispatcher.register(&DASHBOARD_PERMISSION_ACCEPT);
        dispatcher.register(&DASHBOARD_PERMISSION_DENY);
        dispatcher.register(&DASHBOARD_OPEN_APP);

        let extension = Arc::new(Self {
            channel,
            network,
        });

        let ext = Arc::clone(&extension);
        dispatcher.add_packet_handler(
            &DASHBOARD_PERMISSION_ACCEPT,
            HandlerMode::Inline,
            move |session, request_id: String| {
                let ext = Arc::clone(&ext);
                async move { ext.handle_verdict(&session, &request_id, true) }
            },
        );
        let ext = Arc::clone(&extension);
        dispatcher.add_packet_handler(
            &DASHBOARD_PERMISSION_DENY,
            HandlerMode::Inline,
            move |session, request_id: String| {
                let ext = Arc::clone(&ext);
                async move { ext.handle_verdict(&session, &request_id, false) }
            },
        );

        let ext = Arc::clone(&extension);
        endpoints.bind_endpoint(&DASHBOARD_SET, None, move |session, _id| {
            let ext = Arc::clone(&ext);
            async move {
                if !session.is_dashboard {
                    return Err("session does not hold the dashboard token".to_owned());
                }
                info!(app = %session.key(), "dashboard role claimed");
                ext.channel.set_session(&session);
                Ok(DashboardSetResponse { success: true })
            }
        });
        let ext = Arc::clone(&extension);
        endpoints.bind_endpoint(&DASHBOARD_OPEN_APP_ENDPOINT, None, move |_session, app| {
            let ext = Arc::clone(&ext);
            async move {
                let status = if ext.network.is_connected(&app.identifier) {
                    OpenAppStatus::AlreadyOpen
                } else {
                    match ext.channel.current() {
                        Some(dashboard) if !dashboard.is_closed() => {
                            if dashboard.send(&DASHBOARD_OPEN_APP, &app).is_ok() {
                                OpenAppStatus::Opened
                            } else {
                                OpenAppStatus::DashboardNotConnected
                            }
                        }
                        _ => OpenAppStatus::DashboardNotConnected,
                    }
                };
                Ok(OpenAppResponse { status })
            }
        });

        let ext = Arc::clone(&extension);
        let mut events = extension.network.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(SessionEvent::Disconnected(session)) => {
                        ext.channel.clear_if(session.serial);
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        extension
    }

    fn handle_verdict(&self, session: &Arc<Session>, request_id: &str, accepted: bool) {
        if !session.is_dashboard {
            warn!(app = %session.key(), "permission verdict from non-dashboard session");
            return;
        }
        if !self.channel.resolve(request_id, accepted) {
            warn!(request_id, "verdict for unknown permission request");
        }
    }
}
