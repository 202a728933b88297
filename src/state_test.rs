use super::test_helpers::*;
use super::*;
use crate::services::presence::PresenceEvent;
use crate::services::registry::{Connection, outbound_channel};
use crate::store::TaskStore;
use tokio::time::{Duration, timeout};

#[test]
fn renderer_follows_fragment_flag() {
    let (state, _stores) = test_app_state();
    assert!(state.renderer.is_none());

    let config = RealtimeConfig { htmx_fragments: true, ..RealtimeConfig::default() };
    let (state, _stores) = test_app_state_with(config);
    assert!(state.renderer.is_some());
}

#[test]
fn with_renderer_enables_fragments() {
    let (state, _stores) = test_app_state();
    let state = state.with_renderer(Arc::new(CardRenderer));
    assert!(state.renderer.is_some());
}

#[tokio::test]
async fn presence_broadcasts_through_shared_registry() {
    let (state, stores) = test_app_state();
    let board = seed_board(&stores).await;

    let ada = Arc::new(Connection::new(board.board_id, uuid::Uuid::new_v4(), "Ada"));
    let bob = Arc::new(Connection::new(board.board_id, uuid::Uuid::new_v4(), "Bob"));
    let (ada_tx, _ada_rx) = outbound_channel(8);
    let (bob_tx, mut bob_rx) = outbound_channel(8);
    state.registry.join(ada.clone(), ada_tx).await;
    state.registry.join(bob, bob_tx).await;

    state
        .presence
        .update_presence(&ada, PresenceEvent::Online { focused_element: None })
        .await
        .expect("online");

    let received = timeout(Duration::from_millis(200), bob_rx.rx.recv())
        .await
        .expect("receive timed out")
        .expect("channel closed");
    assert_eq!(received.user_id, Some(ada.user_id));
}

#[tokio::test]
async fn seed_helpers_build_dense_columns() {
    let (_state, stores) = test_app_state();
    let board = seed_board(&stores).await;
    let first = seed_task(&stores, &board.todo, "first").await;
    let second = seed_task(&stores, &board.todo, "second").await;

    assert_eq!(first.position, 0);
    assert_eq!(second.position, 1);
    assert_eq!(stores.tasks.list_board_tasks(board.board_id).await.expect("list").len(), 2);
}
