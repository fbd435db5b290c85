//! Typed request/response between apps, plus hub-hosted endpoints.
//!
//! A call is correlated by `(endpoint id, caller-local u32 key)`.  The
//! caller gets exactly one `receive` or exactly one `error` back; an owner
//! that disconnects mid-call produces an error instead of a hang.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock, Weak};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use hub_protocol::packets::endpoint::{
    EndpointDataPacket, EndpointErrorPacket, EndpointRegisterPacket, ENDPOINT_CALL,
    ENDPOINT_ERROR, ENDPOINT_RECEIVE, ENDPOINT_REGISTER,
};
use hub_protocol::packets::DisconnectReason;
use hub_protocol::{EndpointType, Identifier};
use tracing::warn;

use crate::dispatcher::{HandlerMode, PacketDispatcher};
use crate::extension::permission::PermissionManager;
use crate::network::{Network, SessionEvent};
use crate::session::Session;

type ServerHandler =
    Arc<dyn Fn(Arc<Session>, Vec<u8>) -> BoxFuture<'static, Result<Vec<u8>, String>> + Send + Sync>;

enum EndpointTarget {
    /// Owned by a connected session; calls are forwarded to it.
    Session {
        session: Weak<Session>,
        owner_serial: u64,
        owner_key: String,
        permission: Option<Identifier>,
    },
    /// Hosted in-process by the hub itself.
    Server {
        permission: Option<Identifier>,
        handler: ServerHandler,
    },
}

struct CallState {
    caller: Weak<Session>,
    owner_key: String,
}

pub struct EndpointExtension {
    endpoints: RwLock<HashMap<Identifier, EndpointTarget>>,
    calls: Mutex<HashMap<(Identifier, u32), CallState>>,
    permissions: Arc<PermissionManager>,
}

impl EndpointExtension {
    pub fn new(dispatcher: &PacketDispatcher, permissions: Arc<PermissionManager>) -> Arc<Self> {
        dispatcher.register(&ENDPOINT_REGISTER);
        dispatcher.register(&ENDPOINT_CALL);
        dispatcher.register(&ENDPOINT_RECEIVE);
        dispatcher.register(&ENDPOINT_ERROR);

        let extension = Arc::new(Self {
            endpoints: RwLock::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            permissions,
        });

        let ext = Arc::clone(&extension);
        dispatcher.add_packet_handler(
            &ENDPOINT_REGISTER,
            HandlerMode::Inline,
            move |session, packet: EndpointRegisterPacket| {
                let ext = Arc::clone(&ext);
                async move { ext.handle_register(&session, packet) }
            },
        );
        let ext = Arc::clone(&extension);
        dispatcher.add_packet_handler(
            &ENDPOINT_CALL,
            HandlerMode::Inline,
            move |session, packet: EndpointDataPacket| {
                let ext = Arc::clone(&ext);
                async move { ext.handle_call(&session, packet) }
            },
        );
        let ext = Arc::clone(&extension);
        dispatcher.add_packet_handler(
            &ENDPOINT_RECEIVE,
            HandlerMode::Inline,
            move |session, packet: EndpointDataPacket| {
                let ext = Arc::clone(&ext);
                async move { ext.handle_receive(&session, packet) }
            },
        );
        let ext = Arc::clone(&extension);
        dispatcher.add_packet_handler(
            &ENDPOINT_ERROR,
            HandlerMode::Inline,
            move |session, packet: EndpointErrorPacket| {
                let ext = Arc::clone(&ext);
                async move { ext.handle_error(&session, packet) }
            },
        );

        extension
    }

    /// Prunes endpoints and in-flight calls when sessions disconnect.
    pub fn watch(self: &Arc<Self>, network: &Network) {
        let ext = Arc::clone(self);
        let mut events = network.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(SessionEvent::Disconnected(session)) => ext.handle_disconnect(&session),
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Hosts an endpoint in-process.  Double binding is a startup bug.
    pub fn bind_endpoint<Req, Res, F, Fut>(
        &self,
        ty: &EndpointType<Req, Res>,
        permission: Option<Identifier>,
        handler: F,
    ) where
        Req: Send + 'static,
        Res: Send + 'static,
        F: Fn(Arc<Session>, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Res, String>> + Send + 'static,
    {
        let request_codec = Arc::clone(ty.request_codec());
        let response_codec = Arc::clone(ty.response_codec());
        let wrapped: ServerHandler = Arc::new(move |session, data| {
            let request = match request_codec.decode(&data) {
                Ok(request) => request,
                Err(err) => return futures_util::future::ready(Err(err.to_string())).boxed(),
            };
            let fut = handler(session, request);
            let response_codec = Arc::clone(&response_codec);
            async move {
                let response = fut.await?;
                response_codec.encode(&response).map_err(|e| e.to_string())
            }
            .boxed()
        });
        let mut endpoints = self.endpoints.write().expect("endpoints poisoned");
        let previous = endpoints.insert(
            ty.id().clone(),
            EndpointTarget::Server {
                permission,
                handler: wrapped,
            },
        );
        assert!(previous.is_none(), "endpoint {} bound twice", ty.id());
    }

    fn handle_register(&self, session: &Arc<Session>, packet: EndpointRegisterPacket) {
        for id in packet.endpoints.keys() {
            if !session.is_dashboard && !id.is_subpath_of(&session.app.identifier) {
                session.disconnect(
                    DisconnectReason::PermissionDenied,
                    Some(format!(
                        "endpoint {id} is not under app {}",
                        session.app.identifier
                    )),
                );
                return;
            }
        }
        let mut endpoints = self.endpoints.write().expect("endpoints poisoned");
        for (id, permission) in packet.endpoints {
            endpoints.insert(
                id,
                EndpointTarget::Session {
                    session: Arc::downgrade(session),
                    owner_serial: session.serial,
                    owner_key: session.key(),
                    permission,
                },
            );
        }
    }

    fn reply_error(session: &Arc<Session>, id: &Identifier, key: u32, error: String) {
        let _ = session.send(
            &ENDPOINT_ERROR,
            &EndpointErrorPacket {
                id: id.clone(),
                key,
                error,
            },
        );
    }

    fn handle_call(&self, caller: &Arc<Session>, packet: EndpointDataPacket) {
        enum Route {
            Forward(Arc<Session>, String),
            Run(ServerHandler),
        }
        let route = {
            let endpoints = self.endpoints.read().expect("endpoints poisoned");
            match endpoints.get(&packet.id) {
                None => {
                    warn!(app = %caller.key(), endpoint = %packet.id, "call to unknown endpoint");
                    Self::reply_error(
                        caller,
                        &packet.id,
                        packet.key,
                        format!("Endpoint {} not found", packet.id),
                    );
                    return;
                }
                Some(target) => {
                    let permission = match target {
                        EndpointTarget::Session { permission, .. }
                        | EndpointTarget::Server { permission, .. } => permission,
                    };
                    if let Some(permission) = permission {
                        let exempt = packet.id.is_subpath_of(&caller.app.identifier);
                        if !exempt && !self.permissions.has_permission(caller, permission) {
                            warn!(
                                app = %caller.key(),
                                endpoint = %packet.id,
                                "endpoint call without permission"
                            );
                            Self::reply_error(
                                caller,
                                &packet.id,
                                packet.key,
                                format!("Permission denied for endpoint {}", packet.id),
                            );
                            return;
                        }
                    }
                    match target {
                        EndpointTarget::Session {
                            session, owner_key, ..
                        } => match session.upgrade().filter(|s| !s.is_closed()) {
                            Some(owner) => Route::Forward(owner, owner_key.clone()),
                            None => {
                                Self::reply_error(
                                    caller,
                                    &packet.id,
                                    packet.key,
                                    format!("Endpoint {} not found", packet.id),
                                );
                                return;
                            }
                        },
                        EndpointTarget::Server { handler, .. } => Route::Run(Arc::clone(handler)),
                    }
                }
            }
        };
        match route {
            Route::Run(handler) => {
                let caller = Arc::clone(caller);
                tokio::spawn(async move {
                    match handler(Arc::clone(&caller), packet.data).await {
                        Ok(data) => {
                            let _ = caller.send(
                                &ENDPOINT_RECEIVE,
                                &EndpointDataPacket {
                                    id: packet.id,
                                    key: packet.key,
                                    data,
                                },
                            );
                        }
                        Err(error) => Self::reply_error(&caller, &packet.id, packet.key, error),
                    }
                });
            }
            Route::Forward(owner, owner_key) => {
                let correlation = (packet.id.clone(), packet.key);
                {
                    let mut calls = self.calls.lock().expect("calls poisoned");
                    if calls.contains_key(&correlation) {
                        Self::reply_error(
                            caller,
                            &packet.id,
                            packet.key,
                            format!("Call {} already in flight", packet.key),
                        );
                        return;
                    }
                    calls.insert(
                        correlation,
                        CallState {
                            caller: Arc::downgrade(caller),
                            owner_key,
                        },
                    );
                }
                if owner.send(&ENDPOINT_CALL, &packet).is_err() {
                    self.calls
                        .lock()
                        .expect("calls poisoned")
                        .remove(&(packet.id.clone(), packet.key));
                    Self::reply_error(
                        caller,
                        &packet.id,
                        packet.key,
                        format!("Endpoint {} not found", packet.id),
                    );
                }
            }
        }
    }

    fn handle_receive(&self, owner: &Arc<Session>, packet: EndpointDataPacket) {
        let state = self
            .calls
            .lock()
            .expect("calls poisoned")
            .remove(&(packet.id.clone(), packet.key));
        match state {
            Some(state) => {
                if let Some(caller) = state.caller.upgrade() {
                    let _ = caller.send(&ENDPOINT_RECEIVE, &packet);
                }
            }
            None => Self::reply_error(
                owner,
                &packet.id,
                packet.key,
                format!("Endpoint {} not found", packet.id),
            ),
        }
    }

    fn handle_error(&self, owner: &Arc<Session>, packet: EndpointErrorPacket) {
        let state = self
            .calls
            .lock()
            .expect("calls poisoned")
            .remove(&(packet.id.clone(), packet.key));
        match state {
            Some(state) => {
                if let Some(caller) = state.caller.upgrade() {
                    let _ = caller.send(&ENDPOINT_ERROR, &packet);
                }
            }
            None => Self::reply_error(
                owner,
                &packet.id,
                packet.key,
                format!("Endpoint {} not found", packet.id),
            ),
        }
    }

    fn handle_disconnect(&self, session: &Arc<Session>) {
        {
            let mut endpoints = self.endpoints.write().expect("endpoints poisoned");
            endpoints.retain(|_, target| match target {
                EndpointTarget::Session { owner_serial, .. } => *owner_serial != session.serial,
                EndpointTarget::Server { .. } => true,
            });
        }
        let orphaned: Vec<((Identifier, u32), CallState)> = {
            let mut calls = self.calls.lock().expect("calls poisoned");
            let keys: Vec<(Identifier, u32)> = calls
                .iter()
                .filter(|(_, state)| {
                    state.owner_key == session.key() || state.caller.upgrade().is_none()
                })
                .map(|(key, _)| key.clone())
                .collect();
            keys.into_iter()
                .filter_map(|key| calls.remove(&key).map(|state| (key, state)))
                .collect()
        };
        for ((id, key), state) in orphaned {
            if let Some(caller) = state.caller.upgrade().filter(|c| !c.is_closed()) {
                Self::reply_error(&caller, &id, key, format!("Endpoint {id} not found"));
            }
        }
    }
}
