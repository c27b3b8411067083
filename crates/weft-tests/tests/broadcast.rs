//! Broadcast sender: target selection, eligibility and failure isolation.

use std::time::Duration;

use weft_core::types::MessageType;
use weft_network::{ConnectionStatus, Envelope, ResourceLimits};
use weft_tests::helpers::*;

const WAIT: Duration = Duration::from_secs(2);

/// A hub peer connected to `n` spokes.
async fn star(n: usize) -> (std::sync::Arc<MemoryMesh>, TestPeer, Vec<TestPeer>) {
    let mesh = MemoryMesh::new();
    let hub = TestPeer::spawn(&mesh, fast_config()).await;
    let mut spokes = Vec::with_capacity(n);
    for _ in 0..n {
        let spoke = TestPeer::spawn(&mesh, fast_config()).await;
        mesh.connect(hub.id, spoke.id);
        spokes.push(spoke);
    }
    (mesh, hub, spokes)
}

#[tokio::test]
async fn reaches_every_connection() {
    let (_mesh, hub, mut spokes) = star(3).await;
    let report = hub.service.publish(MessageType::Block, b"blk".to_vec()).await;
    assert_eq!(report.sent, 3);
    assert_eq!(report.failed + report.skipped, 0);
    for spoke in &mut spokes {
        let env = spoke.next_event(WAIT).await.expect("spoke receives");
        assert_eq!(env.value, b"blk");
    }
}

#[tokio::test]
async fn never_echoes_to_sender() {
    let (mesh, hub, spokes) = star(3).await;
    let origin = &spokes[0];
    let arrived_on = mesh.connection(hub.id, origin.id).unwrap();

    let mut envelope = Envelope::new(MessageType::Transaction, b"from-spoke".to_vec());
    envelope.sender = Some(arrived_on);

    let report = hub.service.broadcast(&envelope).await;
    assert_eq!(report.sent, 2);
    assert_eq!(mesh.streams_opened(hub.id, origin.id), 0);
    assert_eq!(mesh.streams_opened(hub.id, spokes[1].id), 1);
    assert_eq!(mesh.streams_opened(hub.id, spokes[2].id), 1);
}

#[tokio::test]
async fn relayed_message_skips_its_origin() {
    let (mesh, hub, mut spokes) = star(2).await;
    spokes[0]
        .service
        .publish(MessageType::Block, b"relay-me".to_vec())
        .await;

    let env = spokes[1].next_event(WAIT).await.expect("relayed through hub");
    assert_eq!(env.value, b"relay-me");
    assert_eq!(env.sender.as_ref().map(|c| c.peer), Some(hub.id));
    settle().await;
    assert_eq!(mesh.streams_opened(hub.id, spokes[0].id), 0);
    assert!(spokes[0].stays_quiet(Duration::from_millis(100)).await);
}

#[tokio::test]
async fn failing_connection_is_isolated() {
    let (mesh, hub, mut spokes) = star(3).await;
    mesh.set_behaviour(spokes[2].id, PeerBehaviour::Failing);

    let report = hub.service.publish(MessageType::Transaction, b"tx".to_vec()).await;
    assert_eq!(report.sent, 2);
    assert_eq!(report.failed, 1);
    assert!(spokes[0].next_event(WAIT).await.is_some());
    assert!(spokes[1].next_event(WAIT).await.is_some());
}

#[tokio::test]
async fn low_byte_budget_connection_is_skipped() {
    let (mesh, hub, mut spokes) = star(2).await;
    let limited = mesh.connection(hub.id, spokes[1].id).unwrap();
    mesh.set_limits(
        hub.id,
        limited.id,
        ResourceLimits {
            seconds: None,
            bytes: Some(5_000),
        },
    );

    let report = hub.service.publish(MessageType::Block, b"big".to_vec()).await;
    assert_eq!(report.sent, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(mesh.streams_opened(hub.id, spokes[1].id), 0);
    assert!(spokes[0].next_event(WAIT).await.is_some());
    assert!(spokes[1].stays_quiet(Duration::from_millis(200)).await);
}

#[tokio::test]
async fn generous_limits_are_used() {
    let (mesh, hub, spokes) = star(1).await;
    let conn = mesh.connection(hub.id, spokes[0].id).unwrap();
    mesh.set_limits(
        hub.id,
        conn.id,
        ResourceLimits {
            seconds: Some(20_000),
            bytes: Some(1 << 24),
        },
    );
    let report = hub.service.publish(MessageType::Block, b"ok".to_vec()).await;
    assert_eq!(report.sent, 1);
}

#[tokio::test]
async fn closing_connection_is_skipped() {
    let (mesh, hub, spokes) = star(2).await;
    let closing = mesh.connection(hub.id, spokes[0].id).unwrap();
    mesh.set_status(hub.id, closing.id, ConnectionStatus::Closing);

    let report = hub.service.publish(MessageType::Block, b"b".to_vec()).await;
    assert_eq!(report.skipped, 1);
    assert_eq!(report.sent, 1);
    assert_eq!(mesh.streams_opened(hub.id, spokes[0].id), 0);
}

#[tokio::test]
async fn stalled_send_times_out_and_closes_connection() {
    let (mesh, hub, mut spokes) = star(2).await;
    mesh.set_behaviour(spokes[1].id, PeerBehaviour::Stalled);
    let stalled = mesh.connection(hub.id, spokes[1].id).unwrap();

    let started = tokio::time::Instant::now();
    let report = hub.service.publish(MessageType::Block, b"slow".to_vec()).await;
    assert!(started.elapsed() < Duration::from_secs(2));

    assert_eq!(report.sent, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(mesh.status(hub.id, stalled.id), Some(ConnectionStatus::Closing));
    assert!(spokes[0].next_event(WAIT).await.is_some());
}

#[tokio::test]
async fn no_connections_is_empty_report() {
    let (_mesh, hub, _) = star(0).await;
    let report = hub.service.publish(MessageType::Block, b"alone".to_vec()).await;
    assert_eq!(report.attempted(), 0);
}
