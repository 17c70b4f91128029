mod common;

use std::sync::Arc;

use axum::body::Bytes;
use common::{OUTBOUND_ID, fast_options, within};
use notify::{Dispatcher, MemoryClient, PeerSpec, Registry, RouteTable};
use proto::{DispatchError, Envelope, NotifyError, msg_id};
use tokio::sync::mpsc;

fn two_peer_registry() -> (Registry, notify::MemoryPeer, notify::MemoryPeer) {
    let (alpha, alpha_peer) = MemoryClient::pair();
    let (beta, beta_peer) = MemoryClient::pair();
    let registry = Registry::initialize(vec![
        PeerSpec::new("alpha", Arc::new(alpha)).with_options(fast_options()),
        PeerSpec::new("beta", Arc::new(beta)).with_options(fast_options()),
    ]);
    (registry, alpha_peer, beta_peer)
}

#[tokio::test]
async fn initialize_connects_every_peer() {
    let (registry, mut alpha, mut beta) = two_peer_registry();
    assert_eq!(registry.names(), vec!["alpha", "beta"]);
    assert_eq!(registry.len(), 2);

    within(alpha.next_stream()).await.expect("alpha stream");
    within(beta.next_stream()).await.expect("beta stream");
    registry.shutdown().await;
}

#[tokio::test]
async fn enqueue_routes_by_peer_name() {
    let (registry, mut alpha, mut beta) = two_peer_registry();

    registry
        .enqueue("beta", Envelope::new(OUTBOUND_ID, b"{\"to\":\"beta\"}".to_vec()))
        .await
        .expect("enqueue");

    assert!(within(beta.next_written()).await.expect("connect").envelope.is_connect());
    let written = within(beta.next_written()).await.expect("written");
    assert_eq!(written.envelope.payload(), b"{\"to\":\"beta\"}");

    assert!(within(alpha.next_written()).await.expect("connect").envelope.is_connect());
    registry.shutdown().await;
}

#[tokio::test]
async fn enqueue_to_unknown_peer_fails() {
    let (registry, _alpha, _beta) = two_peer_registry();
    let err = registry
        .enqueue("gamma", Envelope::new(OUTBOUND_ID, Vec::new()))
        .await
        .expect_err("unknown peer");
    assert!(matches!(err, NotifyError::UnknownConnection(name) if name == "gamma"));
    registry.shutdown().await;
}

#[tokio::test]
async fn inbound_push_reaches_registered_handler() {
    let (registry, mut alpha, _beta) = two_peer_registry();
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    registry
        .register_handler(msg_id::NODE_HEARTBEAT_RESP, move |body: Bytes| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(body);
            }
        })
        .expect("register");

    let stream = within(alpha.next_stream()).await.expect("alpha stream");
    stream.push(Envelope::new(
        msg_id::NODE_HEARTBEAT_RESP,
        b"{\"node\":\"n1\"}".to_vec(),
    ));

    let body = within(rx.recv()).await.expect("handler invoked");
    assert_eq!(&body[..], b"{\"node\":\"n1\"}");
    registry.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handlers_bound_before_start_see_the_first_inbound_envelope() {
    let dispatcher = Arc::new(Dispatcher::new(RouteTable::standard()));
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    dispatcher
        .register_handler(msg_id::NODE_HEARTBEAT_RESP, move |body: Bytes| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(body);
            }
        })
        .expect("register");

    let (client, mut peer) = MemoryClient::pair();
    let registry = Registry::with_dispatcher(
        Arc::clone(&dispatcher),
        vec![PeerSpec::new("early", Arc::new(client)).with_options(fast_options())],
    );
    assert!(Arc::ptr_eq(registry.dispatcher(), &dispatcher));

    let stream = within(peer.next_stream()).await.expect("stream");
    stream.push(Envelope::new(msg_id::NODE_HEARTBEAT_RESP, b"first".to_vec()));

    assert_eq!(&within(rx.recv()).await.expect("handler invoked")[..], b"first");
    registry.shutdown().await;
}

#[tokio::test]
async fn deliver_dispatches_without_a_stream() {
    let registry = Registry::initialize(Vec::new());
    assert!(registry.is_empty());
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    registry
        .register_handler(msg_id::WORKER_HEARTBEAT_RESP, move |body: Bytes| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(body);
            }
        })
        .expect("register");

    registry
        .deliver(msg_id::WORKER_HEARTBEAT_RESP, b"{}".to_vec())
        .await;
    assert_eq!(&within(rx.recv()).await.expect("delivered")[..], b"{}");
}

#[tokio::test]
async fn register_rejects_ids_outside_route_table() {
    let registry = Registry::initialize(Vec::new());
    let err = registry
        .register_handler(msg_id::CONNECT_REQ, || async {})
        .expect_err("connect id has no route");
    assert!(matches!(err, DispatchError::UnknownMsgId(id) if id == msg_id::CONNECT_REQ));
}

#[tokio::test]
async fn shutdown_closes_every_connection() {
    let (registry, _alpha, _beta) = two_peer_registry();
    within(registry.shutdown()).await;

    for name in ["alpha", "beta"] {
        assert!(registry.connection(name).expect("connection").is_shut_down());
        let err = registry
            .enqueue(name, Envelope::new(OUTBOUND_ID, Vec::new()))
            .await
            .expect_err("closed");
        assert!(matches!(err, NotifyError::Closed(_)));
    }
}
