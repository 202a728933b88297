use super::*;
use crate::envelope::{Data, EnvelopeType};
use tokio::time::{Duration, Instant, timeout};

async fn assert_has_envelope(rx: &mut mpsc::Receiver<Envelope>) -> Envelope {
    timeout(Duration::from_millis(200), rx.recv())
        .await
        .expect("envelope receive timed out")
        .expect("channel closed")
}

async fn assert_channel_empty(rx: &mut mpsc::Receiver<Envelope>) {
    assert!(
        timeout(Duration::from_millis(80), rx.recv()).await.is_err(),
        "expected channel to remain empty"
    );
}

async fn join_new(registry: &Registry, board_id: Uuid, capacity: usize) -> (Arc<Connection>, OutboundReceiver) {
    let connection = Arc::new(Connection::new(board_id, Uuid::new_v4(), "Ada"));
    let (tx, rx) = outbound_channel(capacity);
    assert!(registry.join(connection.clone(), tx).await);
    (connection, rx)
}

fn ping(board_id: Uuid) -> Envelope {
    Envelope::new(EnvelopeType::CursorMove, board_id, Data::new())
}

#[tokio::test]
async fn join_registers_and_counts() {
    let registry = Registry::new();
    let board_id = Uuid::new_v4();

    let (a, _rx_a) = join_new(&registry, board_id, 8).await;
    let (_b, _rx_b) = join_new(&registry, board_id, 8).await;

    assert_eq!(registry.count(board_id).await, 2);
    assert!(registry.contains(a.id).await);
    assert_eq!(registry.active_boards().await, 1);
}

#[tokio::test]
async fn join_is_idempotent_per_connection_id() {
    let registry = Registry::new();
    let board_id = Uuid::new_v4();
    let (connection, _rx) = join_new(&registry, board_id, 8).await;

    let (tx, _rx2) = outbound_channel(8);
    assert!(!registry.join(connection.clone(), tx).await);
    assert_eq!(registry.count(board_id).await, 1);
}

#[tokio::test]
async fn leave_is_safe_to_repeat_and_reaps_empty_board() {
    let registry = Registry::new();
    let board_id = Uuid::new_v4();
    let (connection, _rx) = join_new(&registry, board_id, 8).await;

    assert!(registry.leave(connection.id).await.is_some());
    assert!(registry.leave(connection.id).await.is_none());
    assert_eq!(registry.count(board_id).await, 0);
    assert_eq!(registry.active_boards().await, 0, "empty hub should be reaped");
}

#[tokio::test]
async fn leave_keeps_hub_while_in_flight_operation_holds_it() {
    let registry = Registry::new();
    let board_id = Uuid::new_v4();
    let (connection, _rx) = join_new(&registry, board_id, 8).await;

    let held = registry.hub(board_id).await.expect("hub should exist");
    registry.leave(connection.id).await;
    assert_eq!(registry.active_boards().await, 1);
    drop(held);
}

#[tokio::test]
async fn releasing_last_handle_reaps_board_emptied_meanwhile() {
    let registry = Registry::new();
    let board_id = Uuid::new_v4();
    let (connection, _rx) = join_new(&registry, board_id, 8).await;

    let held = registry.hub(board_id).await.expect("hub should exist");
    registry.leave(connection.id).await;
    assert_eq!(registry.active_boards().await, 1);

    registry.release(board_id, held).await;
    assert_eq!(registry.active_boards().await, 0);
}

#[tokio::test]
async fn releasing_handle_keeps_board_with_subscribers() {
    let registry = Registry::new();
    let board_id = Uuid::new_v4();
    let (_connection, _rx) = join_new(&registry, board_id, 8).await;

    let held = registry.hub(board_id).await.expect("hub should exist");
    registry.release(board_id, held).await;
    assert_eq!(registry.active_boards().await, 1);
}

#[tokio::test]
async fn broadcast_sends_to_all_except_excluded_connection() {
    let registry = Registry::new();
    let board_id = Uuid::new_v4();
    let (_a, mut rx_a) = join_new(&registry, board_id, 8).await;
    let (b, mut rx_b) = join_new(&registry, board_id, 8).await;
    let (_c, mut rx_c) = join_new(&registry, board_id, 8).await;

    let report = registry.broadcast(board_id, &ping(board_id), Some(b.id)).await;

    assert_eq!(report.delivered, 2);
    assert!(report.evicted.is_empty());
    assert_eq!(assert_has_envelope(&mut rx_a.rx).await.kind, EnvelopeType::CursorMove);
    assert_eq!(assert_has_envelope(&mut rx_c.rx).await.kind, EnvelopeType::CursorMove);
    assert_channel_empty(&mut rx_b.rx).await;
}

#[tokio::test]
async fn broadcast_is_scoped_to_one_board() {
    let registry = Registry::new();
    let board_a = Uuid::new_v4();
    let board_b = Uuid::new_v4();
    let (_a, mut rx_a) = join_new(&registry, board_a, 8).await;
    let (_b, mut rx_b) = join_new(&registry, board_b, 8).await;

    registry.broadcast(board_a, &ping(board_a), None).await;

    assert_has_envelope(&mut rx_a.rx).await;
    assert_channel_empty(&mut rx_b.rx).await;
}

#[tokio::test]
async fn broadcast_to_unknown_board_is_a_no_op() {
    let registry = Registry::new();
    let board_id = Uuid::new_v4();
    let report = registry.broadcast(board_id, &ping(board_id), None).await;
    assert_eq!(report, BroadcastReport::default());
}

#[tokio::test]
async fn stuck_connection_is_evicted_without_blocking_others() {
    let registry = Registry::new();
    let board_id = Uuid::new_v4();

    let mut healthy = Vec::new();
    for _ in 0..4 {
        healthy.push(join_new(&registry, board_id, 16).await);
    }
    // Capacity 1 and never drained.
    let (stuck, stuck_rx) = join_new(&registry, board_id, 1).await;

    let started = Instant::now();
    registry.broadcast(board_id, &ping(board_id), None).await;
    let report = registry.broadcast(board_id, &ping(board_id), None).await;
    assert!(started.elapsed() < Duration::from_millis(100));

    assert_eq!(report.evicted, vec![stuck.id]);
    assert_eq!(report.delivered, 4);
    assert!(!registry.contains(stuck.id).await);
    timeout(Duration::from_millis(200), stuck_rx.evicted.notified())
        .await
        .expect("evicted transport should be signalled");

    for (_connection, rx) in &mut healthy {
        assert_has_envelope(&mut rx.rx).await;
        assert_has_envelope(&mut rx.rx).await;
    }
}

#[tokio::test]
async fn closed_receiver_is_dropped_on_broadcast() {
    let registry = Registry::new();
    let board_id = Uuid::new_v4();
    let (gone, rx) = join_new(&registry, board_id, 8).await;
    let (_live, mut live_rx) = join_new(&registry, board_id, 8).await;
    drop(rx);

    let report = registry.broadcast(board_id, &ping(board_id), None).await;

    assert_eq!(report.evicted, vec![gone.id]);
    assert_eq!(registry.count(board_id).await, 1);
    assert_has_envelope(&mut live_rx.rx).await;
}

#[tokio::test]
async fn rejoin_under_other_board_moves_connection() {
    let registry = Registry::new();
    let board_a = Uuid::new_v4();
    let board_b = Uuid::new_v4();
    let (connection, _rx) = join_new(&registry, board_a, 8).await;

    let moved = Arc::new(Connection {
        id: connection.id,
        board_id: board_b,
        user_id: connection.user_id,
        display_name: connection.display_name.clone(),
        created_at_ms: connection.created_at_ms,
        last_activity_ms: AtomicI64::new(connection.last_activity_ms()),
    });
    let (tx, _rx_b) = outbound_channel(8);
    assert!(registry.join(moved, tx).await);

    assert_eq!(registry.count(board_a).await, 0);
    assert_eq!(registry.count(board_b).await, 1);
}

#[tokio::test]
async fn user_connection_count_tracks_tabs() {
    let registry = Registry::new();
    let board_id = Uuid::new_v4();
    let user_id = Uuid::new_v4();

    let tab_one = Arc::new(Connection::new(board_id, user_id, "Ada"));
    let tab_two = Arc::new(Connection::new(board_id, user_id, "Ada"));
    let (tx1, _rx1) = outbound_channel(8);
    let (tx2, _rx2) = outbound_channel(8);
    registry.join(tab_one.clone(), tx1).await;
    registry.join(tab_two, tx2).await;

    assert_eq!(registry.user_connection_count(board_id, user_id).await, 2);
    registry.leave(tab_one.id).await;
    assert_eq!(registry.user_connection_count(board_id, user_id).await, 1);
}

#[tokio::test]
async fn evict_idle_removes_only_quiet_connections() {
    let registry = Registry::new();
    let board_id = Uuid::new_v4();
    let (quiet, quiet_rx) = join_new(&registry, board_id, 8).await;
    let (active, _active_rx) = join_new(&registry, board_id, 8).await;

    let cutoff = active.last_activity_ms() + 1_000;
    active.touch_at(cutoff + 1);

    let evicted = registry.evict_idle(cutoff).await;

    assert_eq!(evicted.len(), 1);
    assert_eq!(evicted[0].id, quiet.id);
    assert!(registry.contains(active.id).await);
    timeout(Duration::from_millis(200), quiet_rx.evicted.notified())
        .await
        .expect("idle transport should be signalled");
}

#[tokio::test]
async fn touch_never_moves_activity_backwards() {
    let connection = Connection::new(Uuid::new_v4(), Uuid::new_v4(), "Ada");
    let later = connection.last_activity_ms() + 5_000;
    connection.touch_at(later);
    connection.touch_at(later - 1_000);
    assert_eq!(connection.last_activity_ms(), later);
}

#[tokio::test]
async fn send_to_reaches_single_connection() {
    let registry = Registry::new();
    let board_id = Uuid::new_v4();
    let (a, mut rx_a) = join_new(&registry, board_id, 8).await;
    let (_b, mut rx_b) = join_new(&registry, board_id, 8).await;

    assert!(registry.send_to(a.id, ping(board_id)).await);
    assert_has_envelope(&mut rx_a.rx).await;
    assert_channel_empty(&mut rx_b.rx).await;
    assert!(!registry.send_to(Uuid::new_v4(), ping(board_id)).await);
}
