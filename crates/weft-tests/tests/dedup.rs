//! Deduplication through the message history.
//!
//! Every test runs real `MessagesService` instances over the in-memory mesh
//! and checks that a message reaches each peer's subscribers exactly once no
//! matter how many copies arrive.

use std::time::Duration;

use libp2p::PeerId;
use tokio::io::AsyncWriteExt;
use weft_core::types::MessageType;
use weft_network::envelope::content_hash;
use weft_network::MessagesConfig;
use weft_tests::helpers::*;

const WAIT: Duration = Duration::from_secs(2);

async fn send_hello(from: &TestPeer, mesh: &MemoryMesh, to: PeerId) {
    let mut stream = from.raw_stream(mesh, to).await;
    stream
        .write_all(&frame(MessageType::PeerAnnouncement, b"hello"))
        .await
        .unwrap();
    stream.shutdown().await.unwrap();
}

#[tokio::test]
async fn duplicate_flood_across_three_peers() {
    let mesh = MemoryMesh::new();
    let a = TestPeer::spawn(&mesh, fast_config()).await;
    let mut b = TestPeer::spawn(&mesh, fast_config()).await;
    let mut c = TestPeer::spawn(&mesh, fast_config()).await;
    mesh.connect(a.id, b.id);
    mesh.connect(b.id, c.id);
    mesh.connect(a.id, c.id);

    let report = a.service.publish(MessageType::Transaction, b"tx-1".to_vec()).await;
    assert_eq!(report.sent, 2);

    let got_b = b.next_event(WAIT).await.expect("b receives");
    let got_c = c.next_event(WAIT).await.expect("c receives");
    assert_eq!(got_b.hash, got_c.hash);
    assert_eq!(got_b.value, b"tx-1");

    // The copies B and C exchange are dropped.
    settle().await;
    assert!(b.stays_quiet(Duration::from_millis(200)).await);
    assert!(c.stays_quiet(Duration::from_millis(200)).await);

    // A's two sends plus exactly one relay each from B and C.
    assert_eq!(mesh.total_streams(), 4);
    for peer in [&a, &b, &c] {
        assert_eq!(peer.service.history().len(), 1);
    }
}

#[tokio::test]
async fn repeated_delivery_notifies_and_relays_once() {
    let mesh = MemoryMesh::new();
    let a = TestPeer::spawn(&mesh, fast_config()).await;
    let mut b = TestPeer::spawn(&mesh, fast_config()).await;
    let c = TestPeer::spawn(&mesh, fast_config()).await;
    mesh.connect(a.id, b.id);
    mesh.connect(b.id, c.id);

    let payload = frame(MessageType::Block, b"block-7");
    for _ in 0..5 {
        let mut stream = a.raw_stream(&mesh, b.id).await;
        stream.write_all(&payload).await.unwrap();
        stream.shutdown().await.unwrap();
    }

    let got = b.next_event(WAIT).await.expect("b receives");
    assert_eq!(got.kind, MessageType::Block);
    settle().await;
    assert!(b.stays_quiet(Duration::from_millis(200)).await);
    assert_eq!(mesh.streams_opened(b.id, c.id), 1);
}

#[tokio::test]
async fn same_content_on_one_stream_is_one_message() {
    let mesh = MemoryMesh::new();
    let a = TestPeer::spawn(&mesh, fast_config()).await;
    let mut b = TestPeer::spawn(&mesh, fast_config()).await;
    mesh.connect(a.id, b.id);

    let mut stream = a.raw_stream(&mesh, b.id).await;
    let payload = frame(MessageType::Transaction, b"same");
    stream.write_all(&payload).await.unwrap();
    stream.write_all(&payload).await.unwrap();
    stream.shutdown().await.unwrap();

    assert!(b.next_event(WAIT).await.is_some());
    assert!(b.stays_quiet(Duration::from_millis(300)).await);
}

#[tokio::test]
async fn content_is_new_again_after_expiry() {
    let config = MessagesConfig {
        message_expiration: Duration::from_millis(300),
        sweep_interval: Duration::from_millis(50),
        ..fast_config()
    };
    let mesh = MemoryMesh::new();
    let a = TestPeer::spawn(&mesh, config.clone()).await;
    let mut b = TestPeer::spawn(&mesh, config).await;
    mesh.connect(a.id, b.id);

    send_hello(&a, &mesh, b.id).await;
    assert!(b.next_event(WAIT).await.is_some());
    let hash = content_hash(MessageType::PeerAnnouncement, b"hello");
    assert!(b.service.history().has_seen(&hash));

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(!b.service.history().has_seen(&hash));

    send_hello(&a, &mesh, b.id).await;
    assert!(b.next_event(WAIT).await.is_some());
}

#[tokio::test]
async fn kinds_are_distinct_messages() {
    let mesh = MemoryMesh::new();
    let a = TestPeer::spawn(&mesh, fast_config()).await;
    let mut b = TestPeer::spawn(&mesh, fast_config()).await;
    mesh.connect(a.id, b.id);

    a.service.publish(MessageType::Transaction, b"x".to_vec()).await;
    a.service.publish(MessageType::Block, b"x".to_vec()).await;

    let first = b.next_event(WAIT).await.unwrap();
    let second = b.next_event(WAIT).await.unwrap();
    assert_ne!(first.hash, second.hash);
}

#[tokio::test]
async fn republishing_is_suppressed_locally() {
    let mesh = MemoryMesh::new();
    let a = TestPeer::spawn(&mesh, fast_config()).await;
    let b = TestPeer::spawn(&mesh, fast_config()).await;
    mesh.connect(a.id, b.id);

    assert_eq!(a.service.publish(MessageType::Block, b"b".to_vec()).await.sent, 1);
    assert_eq!(a.service.publish(MessageType::Block, b"b".to_vec()).await.attempted(), 0);
    assert_eq!(mesh.streams_opened(a.id, b.id), 1);
}
