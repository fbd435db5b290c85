//! Handshake, token persistence, duplicate-app eviction and protocol
//! error handling over a real socket.

mod support;

use hub_protocol::packets::{self, DisconnectReason};
use hub_protocol::RawPacket;
use support::{TestApp, TestHub};

#[tokio::test]
async fn handshake_mints_a_token_and_reaches_ready() {
    let tmp = tempfile::tempdir().unwrap();
    let hub = TestHub::spawn(tmp.path().join("data"), None).await;

    let mut app = TestApp::connect(hub.addr, "test.a:x", None).await;
    assert_eq!(app.token.len(), 64, "fresh hex token");

    // The canonical app is echoed back after registration.
    let echo = app.recv_type(&packets::CONNECT.id().key()).await;
    let echo = packets::CONNECT.decode(&echo).unwrap();
    assert_eq!(echo.app.key(), "test.a:x");

    app.ready().await;
}

#[tokio::test]
async fn persisted_token_is_accepted_on_reconnect() {
    let tmp = tempfile::tempdir().unwrap();
    let hub = TestHub::spawn(tmp.path().join("data"), None).await;

    let first = TestApp::connect(hub.addr, "test.a:x", None).await;
    let minted = first.token.clone();
    drop(first);

    let second = TestApp::connect(hub.addr, "test.a:x", Some(&minted)).await;
    assert_eq!(second.token, minted, "validated token is echoed unchanged");

    // An unknown token is replaced rather than rejected.
    drop(second);
    let third = TestApp::connect(hub.addr, "test.a:x", Some("bogus")).await;
    assert_ne!(third.token, "bogus");
    assert_eq!(third.token.len(), 64);
}

#[tokio::test]
async fn duplicate_connect_evicts_the_older_session() {
    let tmp = tempfile::tempdir().unwrap();
    let hub = TestHub::spawn(tmp.path().join("data"), None).await;

    let mut first = TestApp::connect(hub.addr, "test.a:x", None).await;
    first.ready().await;
    let mut second = TestApp::connect(hub.addr, "test.a:x", Some(&first.token)).await;

    let disconnect = first.expect_disconnect().await;
    assert_eq!(disconnect.reason, DisconnectReason::AnotherConnection);

    // The newcomer serves normally.
    second.ready().await;
}

#[tokio::test]
async fn non_connect_first_packet_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let hub = TestHub::spawn(tmp.path().join("data"), None).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", hub.addr))
        .await
        .unwrap();
    use futures_util::{SinkExt, StreamExt};
    let raw = packets::READY.encode(&()).unwrap();
    ws.send(tokio_tungstenite::tungstenite::Message::Binary(
        raw.to_frame().to_vec().into(),
    ))
    .await
    .unwrap();

    loop {
        match ws.next().await {
            Some(Ok(tokio_tungstenite::tungstenite::Message::Binary(data))) => {
                let raw = RawPacket::from_frame(&data).unwrap();
                if raw.type_key == packets::DISCONNECT.id().key() {
                    let packet = packets::DISCONNECT.decode(&raw).unwrap();
                    assert_eq!(packet.reason, DisconnectReason::InvalidPacketType);
                    break;
                }
            }
            Some(Ok(_)) => {}
            _ => panic!("expected a typed disconnect"),
        }
    }
}

#[tokio::test]
async fn unknown_packet_type_disconnects_the_sender() {
    let tmp = tempfile::tempdir().unwrap();
    let hub = TestHub::spawn(tmp.path().join("data"), None).await;

    let mut app = TestApp::connect(hub.addr, "test.a:x", None).await;
    app.ready().await;

    let bogus = RawPacket {
        type_key: "test.a:x/made_up".to_owned(),
        data: bytes::Bytes::new(),
    };
    app.send_frame(bogus.to_frame().to_vec()).await;
    let disconnect = app.expect_disconnect().await;
    assert_eq!(disconnect.reason, DisconnectReason::InvalidPacketType);
}

#[tokio::test]
async fn text_frames_are_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let hub = TestHub::spawn(tmp.path().join("data"), None).await;

    let mut app = TestApp::connect(hub.addr, "test.a:x", None).await;
    app.ready().await;
    app.send_text("{\"nope\":true}").await;
    let disconnect = app.expect_disconnect().await;
    assert_eq!(disconnect.reason, DisconnectReason::InvalidPacket);
}
