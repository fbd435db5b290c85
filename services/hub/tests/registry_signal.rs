//! Registry observation and persistence across restart; signal fan-out
//! with split permissions.

mod support;

use hub_protocol::packets::registry::{
    RegistryPacket, REGISTRY_GET, REGISTRY_LISTEN, REGISTRY_UPDATE,
};
use hub_protocol::packets::signal::{
    SignalPacket, SignalPermissions, SignalRegisterPacket, SIGNAL_LISTEN, SIGNAL_NOTIFY,
    SIGNAL_REGISTER,
};
use hub_protocol::packets::DisconnectReason;
use hub_protocol::Identifier;
use support::{TestApp, TestHub};

fn registry_id() -> Identifier {
    Identifier::from_key("test.a:x/r").unwrap()
}

async fn registry_get(app: &mut TestApp, call_key: u32) -> Option<Vec<u8>> {
    let request = REGISTRY_GET.request_codec().encode(&registry_id()).unwrap();
    let reply = app
        .call(&REGISTRY_GET.id().key(), call_key, request)
        .await
        .unwrap();
    REGISTRY_GET.response_codec().decode(&reply).unwrap().value
}

#[tokio::test]
async fn updates_fan_out_and_survive_restart() {
    let tmp = tempfile::tempdir().unwrap();
    let data_dir = tmp.path().join("data");
    let hub = TestHub::spawn(data_dir.clone(), None).await;

    let mut listener = TestApp::connect(hub.addr, "test.l:x", None).await;
    listener.ready().await;
    listener.send(&REGISTRY_LISTEN, &registry_id()).await;
    // Listen replays the current (absent) value immediately.
    let replay = listener.recv_type(&REGISTRY_UPDATE.id().key()).await;
    assert_eq!(REGISTRY_UPDATE.decode(&replay).unwrap().value, None);

    let mut writer = TestApp::connect(hub.addr, "test.a:x", None).await;
    writer.ready().await;
    writer
        .send(&REGISTRY_UPDATE, &RegistryPacket {
            id: registry_id(),
            value: Some(vec![0x01]),
        })
        .await;

    let update = listener.recv_type(&REGISTRY_UPDATE.id().key()).await;
    assert_eq!(REGISTRY_UPDATE.decode(&update).unwrap().value, Some(vec![0x01]));
    assert_eq!(registry_get(&mut listener, 1).await, Some(vec![0x01]));

    // Restart the hub on the same data directory: the value is still there.
    drop(listener);
    drop(writer);
    hub.stop();
    let hub = TestHub::spawn(data_dir, None).await;
    let mut reader = TestApp::connect(hub.addr, "test.l:x", None).await;
    reader.ready().await;
    assert_eq!(registry_get(&mut reader, 1).await, Some(vec![0x01]));
}

#[tokio::test]
async fn last_write_wins_for_every_listener() {
    let tmp = tempfile::tempdir().unwrap();
    let hub = TestHub::spawn(tmp.path().join("data"), None).await;

    let mut writer = TestApp::connect(hub.addr, "test.a:x", None).await;
    writer.ready().await;
    writer.send(&REGISTRY_LISTEN, &registry_id()).await;
    let _replay = writer.recv_type(&REGISTRY_UPDATE.id().key()).await;

    for value in [vec![0x01], vec![0x02], vec![0x03]] {
        writer
            .send(&REGISTRY_UPDATE, &RegistryPacket {
                id: registry_id(),
                value: Some(value),
            })
            .await;
    }
    // The writer observes its own updates in commit order.
    for expected in [vec![0x01], vec![0x02], vec![0x03]] {
        let update = writer.recv_type(&REGISTRY_UPDATE.id().key()).await;
        assert_eq!(REGISTRY_UPDATE.decode(&update).unwrap().value, Some(expected));
    }
    assert_eq!(registry_get(&mut writer, 1).await, Some(vec![0x03]));
}

#[tokio::test]
async fn signal_fan_out_respects_the_notify_permission() {
    let tmp = tempfile::tempdir().unwrap();
    let hub = TestHub::spawn(tmp.path().join("data"), None).await;
    let signal_id = Identifier::from_key("test.a:x/ping").unwrap();

    let mut owner = TestApp::connect(hub.addr, "test.a:x", None).await;
    owner
        .send(&SIGNAL_REGISTER, &SignalRegisterPacket {
            id: signal_id.clone(),
            permissions: SignalPermissions {
                all: None,
                listen: None,
                notify: Some(Identifier::from_key("test.a:x/can_notify").unwrap()),
            },
        })
        .await;
    // The READY round trip doubles as an ack that the register landed.
    owner.ready().await;

    // Listening is open; notifying is gated.
    let mut listener = TestApp::connect(hub.addr, "test.l:x", None).await;
    listener.ready().await;
    listener.send(&SIGNAL_LISTEN, &signal_id).await;
    // A registry listen after the signal listen acts as an ack: once its
    // replay arrives, the signal attach has been processed too.
    listener
        .send(&REGISTRY_LISTEN, &Identifier::from_key("test.l:x/sync").unwrap())
        .await;
    let _ = listener.recv_type(&REGISTRY_UPDATE.id().key()).await;

    let mut intruder = TestApp::connect(hub.addr, "test.i:x", None).await;
    intruder.ready().await;
    intruder
        .send(&SIGNAL_NOTIFY, &SignalPacket {
            id: signal_id.clone(),
            body: vec![0xFF],
        })
        .await;
    let disconnect = intruder.expect_disconnect().await;
    assert_eq!(disconnect.reason, DisconnectReason::PermissionDenied);

    owner
        .send(&SIGNAL_NOTIFY, &SignalPacket {
            id: signal_id.clone(),
            body: vec![1, 2, 3],
        })
        .await;
    let notified = listener.recv_type(&SIGNAL_NOTIFY.id().key()).await;
    let notified = SIGNAL_NOTIFY.decode(&notified).unwrap();
    assert_eq!(notified.body, vec![1, 2, 3]);
}
