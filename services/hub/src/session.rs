//! Per-client session state.
//!
//! A session is created once the handshake succeeds and lives until the
//! transport closes.  All outbound packets funnel through one unbounded
//! channel drained by a single writer task, which preserves per-session
//! send order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use bytes::Bytes;
use hub_protocol::packets::{self, DisconnectPacket, DisconnectReason};
use hub_protocol::{App, PacketType, RawPacket};
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tracing::warn;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session closed")]
    Closed,
    #[error("encode: {0}")]
    Encode(#[from] hub_protocol::CodecError),
}

/// A failed ready task carries the disconnect it maps to.
#[derive(Debug, Clone)]
pub struct ReadyError {
    pub reason: DisconnectReason,
    pub message: String,
}

pub struct ReadyTask {
    pub name: String,
    pub rx: oneshot::Receiver<Result<(), ReadyError>>,
}

/// Items drained by the session's writer task.
pub enum Outbound {
    Frame(Bytes),
    Pong(Bytes),
    Close,
}

pub type OutboundSender = tokio::sync::mpsc::UnboundedSender<Outbound>;
pub type OutboundReceiver = tokio::sync::mpsc::UnboundedReceiver<Outbound>;

pub struct Session {
    /// Process-unique; discriminates a session from its evicted predecessor
    /// holding the same app key.
    pub serial: u64,
    pub app: App,
    pub token: String,
    pub is_dashboard: bool,
    outbound: OutboundSender,
    ready: AtomicBool,
    ready_tasks: Mutex<Vec<ReadyTask>>,
    closed: watch::Sender<bool>,
}

impl Session {
    pub fn new(
        serial: u64,
        app: App,
        token: String,
        is_dashboard: bool,
    ) -> (Self, OutboundReceiver) {
        let (outbound, rx) = tokio::sync::mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        (
            Self {
                serial,
                app,
                token,
                is_dashboard,
                outbound,
                ready: AtomicBool::new(false),
                ready_tasks: Mutex::new(Vec::new()),
                closed,
            },
            rx,
        )
    }

    pub fn key(&self) -> String {
        self.app.key()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// A receiver that flips to `true` when the session goes away.  Used to
    /// abandon waits on a disconnected peer instead of hanging.
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    pub fn send<T>(&self, ty: &PacketType<T>, data: &T) -> Result<(), SessionError> {
        let raw = ty.encode(data)?;
        self.send_raw(&raw)
    }

    pub fn send_raw(&self, raw: &RawPacket) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        self.outbound
            .send(Outbound::Frame(raw.to_frame()))
            .map_err(|_| SessionError::Closed)
    }

    pub fn send_pong(&self, payload: Bytes) {
        let _ = self.outbound.send(Outbound::Pong(payload));
    }

    /// Sends a typed `DISCONNECT` and closes the transport.  Idempotent;
    /// later calls are no-ops.
    pub fn disconnect(&self, reason: DisconnectReason, message: Option<String>) {
        if *self.closed.borrow() {
            return;
        }
        if reason.is_error() {
            warn!(app = %self.key(), ?reason, message = message.as_deref().unwrap_or(""), "disconnecting session");
        }
        let packet = DisconnectPacket { reason, message };
        if let Ok(raw) = packets::DISCONNECT.encode(&packet) {
            let _ = self.outbound.send(Outbound::Frame(raw.to_frame()));
        }
        let _ = self.outbound.send(Outbound::Close);
        let _ = self.closed.send(true);
    }

    /// Marks the transport gone without emitting a packet (peer closed).
    pub fn force_close(&self) {
        let _ = self.closed.send(true);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    /// Installs a ready task; the ready gate resolves only once every
    /// installed task succeeds.  Returns `None` when the session is already
    /// ready (protocol misuse by the client).
    pub fn add_ready_task(&self, name: &str) -> Option<oneshot::Sender<Result<(), ReadyError>>> {
        if self.is_ready() {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        self.ready_tasks
            .lock()
            .expect("ready tasks poisoned")
            .push(ReadyTask {
                name: name.to_owned(),
                rx,
            });
        Some(tx)
    }

    pub fn take_ready_tasks(&self) -> Vec<ReadyTask> {
        std::mem::take(&mut *self.ready_tasks.lock().expect("ready tasks poisoned"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hub_protocol::Identifier;

    fn session() -> (Session, OutboundReceiver) {
        Session::new(
            1,
            App::new(Identifier::from_key("test.a:x").unwrap()),
            "tok".to_owned(),
            false,
        )
    }

    #[tokio::test]
    async fn send_order_is_preserved_in_the_outbound_queue() {
        let (session, mut rx) = session();
        session.send(&packets::TOKEN, &"t1".to_owned()).unwrap();
        session.send(&packets::READY, &()).unwrap();
        let first = match rx.recv().await.unwrap() {
            Outbound::Frame(frame) => RawPacket::from_frame(&frame).unwrap(),
            _ => panic!("expected frame"),
        };
        let second = match rx.recv().await.unwrap() {
            Outbound::Frame(frame) => RawPacket::from_frame(&frame).unwrap(),
            _ => panic!("expected frame"),
        };
        assert_eq!(first.type_key, "core:packet/token");
        assert_eq!(second.type_key, "core:packet/ready");
    }

    #[tokio::test]
    async fn disconnect_emits_typed_packet_then_close_and_is_idempotent() {
        let (session, mut rx) = session();
        session.disconnect(
            DisconnectReason::AnotherConnection,
            Some("evicted".to_owned()),
        );
        session.disconnect(DisconnectReason::Close, None);
        assert!(session.is_closed());
        assert!(session.send(&packets::READY, &()).is_err());

        let frame = match rx.recv().await.unwrap() {
            Outbound::Frame(frame) => frame,
            _ => panic!("expected disconnect frame"),
        };
        let raw = RawPacket::from_frame(&frame).unwrap();
        let packet = packets::DISCONNECT.decode(&raw).unwrap();
        assert_eq!(packet.reason, DisconnectReason::AnotherConnection);
        assert!(matches!(rx.recv().await.unwrap(), Outbound::Close));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn ready_tasks_cannot_be_added_after_ready() {
        let (session, _rx) = session();
        assert!(session.add_ready_task("a").is_some());
        session.mark_ready();
        assert!(session.add_ready_task("b").is_none());
        assert_eq!(session.take_ready_tasks().len(), 1);
    }
}
