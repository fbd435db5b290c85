//! App-to-app endpoint calls: success, handler error, and owner loss.

mod support;

use std::collections::HashMap;

use hub_protocol::packets::endpoint::{
    EndpointDataPacket, EndpointErrorPacket, EndpointRegisterPacket, ENDPOINT_CALL,
    ENDPOINT_ERROR, ENDPOINT_RECEIVE, ENDPOINT_REGISTER,
};
use hub_protocol::Identifier;
use support::{TestApp, TestHub};

async fn register_echo(owner: &mut TestApp, id: &str) {
    let mut endpoints = HashMap::new();
    endpoints.insert(Identifier::from_key(id).unwrap(), None);
    owner
        .send(&ENDPOINT_REGISTER, &EndpointRegisterPacket { endpoints })
        .await;
}

#[tokio::test]
async fn call_round_trips_through_the_owning_session() {
    let tmp = tempfile::tempdir().unwrap();
    let hub = TestHub::spawn(tmp.path().join("data"), None).await;

    let mut owner = TestApp::connect(hub.addr, "test.a:x", None).await;
    register_echo(&mut owner, "test.a:x/echo").await;
    owner.ready().await;

    let mut caller = TestApp::connect(hub.addr, "test.b:y", None).await;
    caller.ready().await;
    caller
        .send(&ENDPOINT_CALL, &EndpointDataPacket {
            id: Identifier::from_key("test.a:x/echo").unwrap(),
            key: 1,
            data: b"\"hello\"".to_vec(),
        })
        .await;

    // The owner sees the forwarded call and answers it.
    let forwarded = owner.recv_type(&ENDPOINT_CALL.id().key()).await;
    let forwarded = ENDPOINT_CALL.decode(&forwarded).unwrap();
    assert_eq!(forwarded.key, 1);
    assert_eq!(forwarded.data, b"\"hello\"");
    owner
        .send(&ENDPOINT_RECEIVE, &EndpointDataPacket {
            id: forwarded.id,
            key: forwarded.key,
            data: forwarded.data,
        })
        .await;

    let reply = caller
        .call_reply(&Identifier::from_key("test.a:x/echo").unwrap(), 1)
        .await;
    assert_eq!(reply.unwrap(), b"\"hello\"");
}

#[tokio::test]
async fn handler_error_reaches_the_caller_instead_of_a_receive() {
    let tmp = tempfile::tempdir().unwrap();
    let hub = TestHub::spawn(tmp.path().join("data"), None).await;

    let mut owner = TestApp::connect(hub.addr, "test.a:x", None).await;
    register_echo(&mut owner, "test.a:x/echo").await;
    owner.ready().await;

    let mut caller = TestApp::connect(hub.addr, "test.b:y", None).await;
    caller.ready().await;
    caller
        .send(&ENDPOINT_CALL, &EndpointDataPacket {
            id: Identifier::from_key("test.a:x/echo").unwrap(),
            key: 1,
            data: Vec::new(),
        })
        .await;

    let forwarded = owner.recv_type(&ENDPOINT_CALL.id().key()).await;
    let forwarded = ENDPOINT_CALL.decode(&forwarded).unwrap();
    owner
        .send(&ENDPOINT_ERROR, &EndpointErrorPacket {
            id: forwarded.id,
            key: forwarded.key,
            error: "boom".to_owned(),
        })
        .await;

    let reply = caller
        .call_reply(&Identifier::from_key("test.a:x/echo").unwrap(), 1)
        .await;
    assert_eq!(reply.unwrap_err(), "boom");
}

#[tokio::test]
async fn owner_disconnect_fails_the_pending_call() {
    let tmp = tempfile::tempdir().unwrap();
    let hub = TestHub::spawn(tmp.path().join("data"), None).await;

    let mut owner = TestApp::connect(hub.addr, "test.a:x", None).await;
    register_echo(&mut owner, "test.a:x/echo").await;
    owner.ready().await;

    let mut caller = TestApp::connect(hub.addr, "test.b:y", None).await;
    caller.ready().await;
    caller
        .send(&ENDPOINT_CALL, &EndpointDataPacket {
            id: Identifier::from_key("test.a:x/echo").unwrap(),
            key: 7,
            data: Vec::new(),
        })
        .await;
    // Make sure the call was forwarded before the owner goes away.
    let _ = owner.recv_type(&ENDPOINT_CALL.id().key()).await;
    drop(owner);

    let reply = caller
        .call_reply(&Identifier::from_key("test.a:x/echo").unwrap(), 7)
        .await;
    assert!(reply.unwrap_err().contains("not found"));
}

#[tokio::test]
async fn calls_to_unregistered_endpoints_error_immediately() {
    let tmp = tempfile::tempdir().unwrap();
    let hub = TestHub::spawn(tmp.path().join("data"), None).await;

    let mut caller = TestApp::connect(hub.addr, "test.b:y", None).await;
    caller.ready().await;
    let reply = caller.call("test.a:x/none", 1, Vec::new()).await;
    assert!(reply.unwrap_err().contains("not found"));
}
