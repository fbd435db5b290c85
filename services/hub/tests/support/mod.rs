//! Test harness: a real bound hub plus a minimal wire-level client.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use hub::{Hub, HubConfig};
use hub_protocol::packets::endpoint::{
    EndpointDataPacket, EndpointErrorPacket, ENDPOINT_CALL, ENDPOINT_ERROR, ENDPOINT_RECEIVE,
};
use hub_protocol::packets::{self, ConnectPacket, DisconnectPacket};
use hub_protocol::{App, Identifier, PacketType, RawPacket};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestHub {
    pub addr: SocketAddr,
    pub hub: Arc<Hub>,
    server: tokio::task::JoinHandle<()>,
}

impl TestHub {
    pub async fn spawn(data_dir: PathBuf, dashboard_token: Option<&str>) -> Self {
        let mut config = HubConfig::new("127.0.0.1:0".parse().unwrap(), data_dir);
        config.dashboard_token = dashboard_token.map(ToOwned::to_owned);
        let hub = Hub::new(config).expect("hub init");
        hub.start().await.expect("hub start");
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let router = hub::build_router(Arc::clone(&hub));
        let server = tokio::spawn(async move {
            axum::serve(listener, router).await.expect("serve");
        });
        Self { addr, hub, server }
    }

    /// Simulates a process stop; the data directory survives.
    pub fn stop(self) {
        self.server.abort();
    }
}

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TestApp {
    ws: Ws,
    pub token: String,
}

impl TestApp {
    /// Connects and completes the handshake up to the `TOKEN` echo.
    pub async fn connect(addr: SocketAddr, app_key: &str, token: Option<&str>) -> Self {
        let (mut ws, _) = connect_async(format!("ws://{addr}/ws"))
            .await
            .expect("websocket connect");
        let connect = ConnectPacket {
            app: App::new(Identifier::from_key(app_key).expect("app key")),
            token: token.map(ToOwned::to_owned),
        };
        send_packet(&mut ws, &packets::CONNECT, &connect).await;
        let raw = recv_raw(&mut ws).await.expect("token packet");
        assert_eq!(raw.type_key, packets::TOKEN.id().key(), "first packet");
        let token = packets::TOKEN.decode(&raw).expect("token payload");
        Self { ws, token }
    }

    pub async fn send<T>(&mut self, ty: &PacketType<T>, data: &T) {
        send_packet(&mut self.ws, ty, data).await;
    }

    pub async fn send_frame(&mut self, frame: Vec<u8>) {
        self.ws
            .send(Message::Binary(frame.into()))
            .await
            .expect("send frame");
    }

    pub async fn send_text(&mut self, text: &str) {
        self.ws
            .send(Message::Text(text.to_owned().into()))
            .await
            .expect("send text");
    }

    pub async fn recv(&mut self) -> Option<RawPacket> {
        recv_raw(&mut self.ws).await
    }

    /// Reads until a packet of the given type arrives, discarding others.
    pub async fn recv_type(&mut self, type_key: &str) -> RawPacket {
        tokio::time::timeout(RECV_TIMEOUT, async {
            loop {
                let raw = recv_raw(&mut self.ws)
                    .await
                    .unwrap_or_else(|| panic!("connection closed waiting for {type_key}"));
                if raw.type_key == type_key {
                    return raw;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {type_key}"))
    }

    /// Sends `READY` and waits for the server's `READY`.
    pub async fn ready(&mut self) {
        self.send(&packets::READY, &()).await;
        self.recv_type(&packets::READY.id().key()).await;
    }

    pub async fn expect_disconnect(&mut self) -> DisconnectPacket {
        let raw = self.recv_type(&packets::DISCONNECT.id().key()).await;
        packets::DISCONNECT.decode(&raw).expect("disconnect payload")
    }

    /// Issues an endpoint call and returns `Ok(data)` or `Err(error)`.
    pub async fn call(&mut self, id: &str, key: u32, data: Vec<u8>) -> Result<Vec<u8>, String> {
        let id = Identifier::from_key(id).expect("endpoint id");
        self.send(&ENDPOINT_CALL, &EndpointDataPacket {
            id: id.clone(),
            key,
            data,
        })
        .await;
        self.call_reply(&id, key).await
    }

    /// Waits for the correlated reply to an already-sent call.
    pub async fn call_reply(&mut self, id: &Identifier, key: u32) -> Result<Vec<u8>, String> {
        tokio::time::timeout(RECV_TIMEOUT, async {
            loop {
                let raw = recv_raw(&mut self.ws).await.expect("call reply");
                if raw.type_key == ENDPOINT_RECEIVE.id().key() {
                    let packet = ENDPOINT_RECEIVE.decode(&raw).expect("receive payload");
                    if packet.id == *id && packet.key == key {
                        return Ok(packet.data);
                    }
                } else if raw.type_key == ENDPOINT_ERROR.id().key() {
                    let packet: EndpointErrorPacket =
                        ENDPOINT_ERROR.decode(&raw).expect("error payload");
                    if packet.id == *id && packet.key == key {
                        return Err(packet.error);
                    }
                }
            }
        })
        .await
        .expect("timed out waiting for call reply")
    }
}

async fn send_packet<T>(ws: &mut Ws, ty: &PacketType<T>, data: &T) {
    let raw = ty.encode(data).expect("encode packet");
    ws.send(Message::Binary(raw.to_frame().to_vec().into()))
        .await
        .expect("send packet");
}

async fn recv_raw(ws: &mut Ws) -> Option<RawPacket> {
    loop {
        match tokio::time::timeout(RECV_TIMEOUT, ws.next())
            .await
            .expect("timed out receiving")
        {
            Some(Ok(Message::Binary(data))) => {
                return Some(RawPacket::from_frame(&data).expect("well-formed frame"));
            }
            Some(Ok(Message::Close(_))) | None => return None,
            Some(Ok(_)) => {}
            Some(Err(_)) => return None,
        }
    }
}
