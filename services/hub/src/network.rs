//! WebSocket listener-side machinery: the `/ws` handshake, the session
//! registry, and the per-socket read/write loops.
//!
//! Exactly one session per app identifier is live at a time; a second
//! `CONNECT` with the same identifier evicts the older session with
//! `ANOTHER_CONNECTION` before the newcomer is inserted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use hub_protocol::identifier::namespace_from_host;
use hub_protocol::packets::{self, ConnectPacket, DisconnectPacket, DisconnectReason};
use hub_protocol::{Identifier, RawPacket};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::dispatcher::{DispatchOutcome, HandlerMode, PacketDispatcher};
use crate::session::{Outbound, OutboundReceiver, Session};
use crate::state::Hub;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub enum SessionEvent {
    Connected(Arc<Session>),
    Ready(Arc<Session>),
    Disconnected(Arc<Session>),
}

pub struct Network {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    events: broadcast::Sender<SessionEvent>,
    serial: AtomicU64,
}

impl Default for Network {
    fn default() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            sessions: RwLock::new(HashMap::new()),
            events,
            serial: AtomicU64::new(0),
        }
    }
}

impl Network {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the core packet types and the ready-gate handler.
    pub fn install(self: &Arc<Self>, dispatcher: &PacketDispatcher) {
        dispatcher.register(&packets::CONNECT);
        dispatcher.register(&packets::DISCONNECT);
        dispatcher.register(&packets::TOKEN);
        dispatcher.register(&packets::READY);
        let network = Arc::clone(self);
        dispatcher.add_packet_handler(&packets::READY, HandlerMode::Spawn, move |session, _: ()| {
            let network = Arc::clone(&network);
            async move { run_ready_gate(session, network).await }
        });
    }

    pub fn next_serial(&self) -> u64 {
        self.serial.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn get(&self, key: &str) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .expect("session registry poisoned")
            .get(key)
            .cloned()
    }

    pub fn is_connected(&self, id: &Identifier) -> bool {
        self.get(&id.key()).is_some()
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .expect("session registry poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Inserts a freshly handshaken session, evicting any predecessor with
    /// the same app key first.
    pub fn register(&self, session: &Arc<Session>) {
        let evicted = self
            .sessions
            .write()
            .expect("session registry poisoned")
            .remove(&session.key());
        if let Some(old) = evicted {
            warn!(app = %old.key(), "evicting older session for reconnecting app");
            old.disconnect(
                DisconnectReason::AnotherConnection,
                Some("another connection for this app".to_owned()),
            );
        }
        self.sessions
            .write()
            .expect("session registry poisoned")
            .insert(session.key(), Arc::clone(session));
        info!(app = %session.key(), dashboard = session.is_dashboard, "session connected");
        let _ = self.events.send(SessionEvent::Connected(Arc::clone(session)));
    }

    /// Removes the session after its socket task ends.  The map entry is
    /// only dropped when it still belongs to this session; an evicting
    /// newcomer may already have replaced it.
    pub fn remove(&self, session: &Arc<Session>) {
        {
            let mut sessions = self.sessions.write().expect("session registry poisoned");
            if sessions
                .get(&session.key())
                .is_some_and(|s| s.serial == session.serial)
            {
                sessions.remove(&session.key());
            }
        }
        info!(app = %session.key(), "session disconnected");
        let _ = self
            .events
            .send(SessionEvent::Disconnected(Arc::clone(session)));
    }

    pub fn emit_ready(&self, session: &Arc<Session>) {
        let _ = self.events.send(SessionEvent::Ready(Arc::clone(session)));
    }
}

/// Resolves the ready gate: awaits every installed ready task, then sends
/// `READY` exactly once.  Any failed task disconnects the session with the
/// task's reason.
pub async fn run_ready_gate(session: Arc<Session>, network: Arc<Network>) {
    if session.is_ready() {
        warn!(app = %session.key(), "duplicate READY packet");
        return;
    }
    loop {
        let tasks = session.take_ready_tasks();
        if tasks.is_empty() {
            break;
        }
        for task in tasks {
            match task.rx.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    session.disconnect(err.reason, Some(err.message));
                    return;
                }
                Err(_) => {
                    warn!(app = %session.key(), task = %task.name, "ready task dropped");
                    session.disconnect(
                        DisconnectReason::Close,
                        Some(format!("ready task {} aborted", task.name)),
                    );
                    return;
                }
            }
        }
    }
    session.mark_ready();
    if session.send(&packets::READY, &()).is_ok() {
        network.emit_ready(&session);
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(hub): State<Arc<Hub>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let origin = headers
        .get("origin")
        .and_then(|v| v.to_str().ok())
        .map(ToOwned::to_owned);
    ws.on_upgrade(move |socket| handle_socket(socket, hub, origin))
}

/// Sends a typed `DISCONNECT` on a socket that has no session yet.
async fn reject(socket: &mut WebSocket, reason: DisconnectReason, message: &str) {
    warn!(?reason, message, "rejecting connection during handshake");
    let packet = DisconnectPacket {
        reason,
        message: Some(message.to_owned()),
    };
    if let Ok(raw) = packets::DISCONNECT.encode(&packet) {
        let _ = socket.send(Message::Binary(raw.to_frame())).await;
    }
    let _ = socket.send(Message::Close(None)).await;
}

async fn recv_binary(socket: &mut WebSocket) -> Result<Option<bytes::Bytes>, &'static str> {
    loop {
        match socket.recv().await {
            Some(Ok(Message::Binary(data))) => return Ok(Some(data)),
            Some(Ok(Message::Text(_))) => return Err("text frames are not allowed"),
            Some(Ok(Message::Ping(p))) => {
                let _ = socket.send(Message::Pong(p)).await;
            }
            Some(Ok(Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) | None => return Ok(None),
            Some(Err(_)) => return Ok(None),
        }
    }
}

async fn handle_socket(mut socket: WebSocket, hub: Arc<Hub>, origin: Option<String>) {
    // Handshake: the first packet MUST be CONNECT.
    let first = match tokio::time::timeout(HANDSHAKE_TIMEOUT, recv_binary(&mut socket)).await {
        Ok(Ok(Some(data))) => data,
        Ok(Ok(None)) => return,
        Ok(Err(msg)) => {
            reject(&mut socket, DisconnectReason::InvalidPacket, msg).await;
            return;
        }
        Err(_) => {
            reject(
                &mut socket,
                DisconnectReason::InvalidPacket,
                "handshake timeout",
            )
            .await;
            return;
        }
    };
    let raw = match RawPacket::from_frame(&first) {
        Ok(raw) => raw,
        Err(err) => {
            reject(
                &mut socket,
                DisconnectReason::InvalidPacket,
                &format!("malformed frame: {err}"),
            )
            .await;
            return;
        }
    };
    if raw.type_key != packets::CONNECT.id().key() {
        reject(
            &mut socket,
            DisconnectReason::InvalidPacketType,
            &format!("expected {} first", packets::CONNECT.id()),
        )
        .await;
        return;
    }
    let connect: ConnectPacket = match packets::CONNECT.decode(&raw) {
        Ok(connect) => connect,
        Err(err) => {
            reject(
                &mut socket,
                DisconnectReason::InvalidPacketData,
                &format!("bad connect payload: {err}"),
            )
            .await;
            return;
        }
    };

    // Origin check: the reversed netloc must equal the app namespace.
    if let Some(origin) = origin.as_deref() {
        let host = origin.split_once("://").map_or(origin, |(_, rest)| rest);
        let namespace = namespace_from_host(host.split('/').next().unwrap_or(host));
        if namespace != connect.app.identifier.namespace() {
            if hub.config.strict_origin {
                reject(
                    &mut socket,
                    DisconnectReason::InvalidOrigin,
                    &format!("origin {origin} does not match app namespace"),
                )
                .await;
                return;
            }
            warn!(app = %connect.app.key(), origin, "origin does not match app namespace");
        }
    }

    // Token resolution: dashboard token, a valid persisted token, or a
    // freshly minted one.  The accepted token is echoed back either way.
    let mut is_dashboard = false;
    let token = match connect.token {
        Some(token)
            if hub
                .config
                .dashboard_token
                .as_deref()
                .is_some_and(|dash| dash == token) =>
        {
            is_dashboard = true;
            token
        }
        Some(token) if hub.security.validate(&connect.app, &token).unwrap_or(false) => token,
        _ => match hub.security.mint(&connect.app) {
            Ok(token) => token,
            Err(err) => {
                warn!(app = %connect.app.key(), error = %err, "failed to mint token");
                reject(&mut socket, DisconnectReason::InvalidToken, "token store error").await;
                return;
            }
        },
    };

    let (session, outbound) = Session::new(
        hub.network.next_serial(),
        connect.app,
        token.clone(),
        is_dashboard,
    );
    let session = Arc::new(session);
    let (sink, stream) = socket.split();
    tokio::spawn(write_loop(sink, outbound));

    if session.send(&packets::TOKEN, &token).is_err() {
        return;
    }
    hub.network.register(&session);
    // Echo the canonical app back so the client learns its registered form.
    let echo = ConnectPacket {
        app: session.app.clone(),
        token: None,
    };
    let _ = session.send(&packets::CONNECT, &echo);

    read_loop(stream, &session, &hub).await;

    session.force_close();
    hub.network.remove(&session);
}

async fn read_loop(mut stream: SplitStream<WebSocket>, session: &Arc<Session>, hub: &Arc<Hub>) {
    let mut closed = session.closed_signal();
    loop {
        tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(Message::Binary(data))) => match RawPacket::from_frame(&data) {
                    Ok(raw) => {
                        if hub.dispatcher.dispatch(session, &raw).await == DispatchOutcome::UnknownType {
                            session.disconnect(
                                DisconnectReason::InvalidPacketType,
                                Some(format!("unknown packet type {}", raw.type_key)),
                            );
                        }
                    }
                    Err(err) => {
                        session.disconnect(
                            DisconnectReason::InvalidPacket,
                            Some(format!("malformed frame: {err}")),
                        );
                    }
                },
                Some(Ok(Message::Text(_))) => {
                    session.disconnect(
                        DisconnectReason::InvalidPacket,
                        Some("text frames are not allowed".to_owned()),
                    );
                }
                Some(Ok(Message::Ping(p))) => session.send_pong(p),
                Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(err)) => {
                    warn!(app = %session.key(), error = %err, "transport error");
                    break;
                }
            },
            _ = closed.changed() => break,
        }
    }
}

async fn write_loop(mut sink: SplitSink<WebSocket, Message>, mut outbound: OutboundReceiver) {
    while let Some(item) = outbound.recv().await {
        let result = match item {
            Outbound::Frame(frame) => sink.send(Message::Binary(frame)).await,
            Outbound::Pong(payload) => sink.send(Message::Pong(payload)).await,
            Outbound::Close => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        };
        if result.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hub_protocol::App;

    fn make_session(network: &Network, key: &str) -> Arc<Session> {
        let (session, _rx) = Session::new(
            network.next_serial(),
            App::new(Identifier::from_key(key).unwrap()),
            "tok".to_owned(),
            false,
        );
        Arc::new(session)
    }

    #[tokio::test]
    async fn duplicate_app_evicts_older_session_before_newcomer_is_live() {
        let network = Arc::new(Network::new());
        let mut events = network.subscribe();
        let first = make_session(&network, "test.a:x");
        let second = make_session(&network, "test.a:x");

        network.register(&first);
        network.register(&second);

        assert!(first.is_closed());
        assert!(!second.is_closed());
        let live = network.get("test.a:x").unwrap();
        assert_eq!(live.serial, second.serial);

        // The stale socket task cleaning up must not unregister the newcomer.
        network.remove(&first);
        assert!(network.get("test.a:x").is_some());
        network.remove(&second);
        assert!(network.get("test.a:x").is_none());

        assert!(matches!(
            events.recv().await.unwrap(),
            SessionEvent::Connected(_)
        ));
    }

    #[tokio::test]
    async fn ready_gate_waits_for_tasks_and_sends_ready_once() {
        let network = Arc::new(Network::new());
        let (session, mut rx) = Session::new(
            network.next_serial(),
            App::new(Identifier::from_key("test.a:x").unwrap()),
            "tok".to_owned(),
            false,
        );
        let session = Arc::new(session);
        let tx = session.add_ready_task("test").unwrap();

        let gate = tokio::spawn(run_ready_gate(
            Arc::clone(&session),
            Arc::clone(&network),
        ));
        tx.send(Ok(())).unwrap();
        gate.await.unwrap();

        assert!(session.is_ready());
        let frame = match rx.recv().await.unwrap() {
            Outbound::Frame(frame) => frame,
            _ => panic!("expected frame"),
        };
        assert_eq!(
            RawPacket::from_frame(&frame).unwrap().type_key,
            "core:packet/ready"
        );
    }

    #[tokio::test]
    async fn failed_ready_task_disconnects_with_its_reason() {
        let network = Arc::new(Network::new());
        let (session, _rx) = Session::new(
            network.next_serial(),
            App::new(Identifier::from_key("test.a:x").unwrap()),
            "tok".to_owned(),
            false,
        );
        let session = Arc::new(session);
        let tx = session.add_ready_task("perm").unwrap();
        tx.send(Err(crate::session::ReadyError {
            reason: DisconnectReason::PermissionDenied,
            message: "denied".to_owned(),
        }))
        .unwrap();

        run_ready_gate(Arc::clone(&session), network).await;
        assert!(session.is_closed());
        assert!(!session.is_ready());
    }
}
