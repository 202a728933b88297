use super::*;
use crate::config::RealtimeConfig;
use crate::state::test_helpers::{self, TestStores};
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn serve(state: AppState) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, crate::routes::app(state)).await.expect("serve");
    });
    addr
}

fn request(addr: SocketAddr, board_id: Uuid, header: Option<(&'static str, String)>) -> tungstenite::handshake::client::Request {
    let mut request = format!("ws://{addr}/ws/{board_id}").into_client_request().expect("request");
    if let Some((name, value)) = header {
        request
            .headers_mut()
            .insert(name, HeaderValue::from_str(&value).expect("header value"));
    }
    request
}

async fn connect_with_cookie(addr: SocketAddr, board_id: Uuid, token: &str) -> Client {
    let (client, _response) = connect_async(request(addr, board_id, Some(("cookie", format!("session_token={token}")))))
        .await
        .expect("upgrade");
    client
}

/// Next text envelope, skipping control frames.
async fn recv_envelope(client: &mut Client) -> Value {
    loop {
        let frame = timeout(Duration::from_millis(500), client.next())
            .await
            .expect("envelope receive timed out")
            .expect("stream ended")
            .expect("websocket error");
        if let WsMessage::Text(text) = frame {
            return serde_json::from_str(text.as_str()).expect("envelope json");
        }
    }
}

async fn recv_envelope_of(client: &mut Client, kind: &str) -> Value {
    loop {
        let envelope = recv_envelope(client).await;
        if envelope["type"] == json!(kind) {
            return envelope;
        }
    }
}

async fn send_json(client: &mut Client, body: &Value) {
    client.send(WsMessage::Text(body.to_string().into())).await.expect("send");
}

async fn two_members() -> (AppState, TestStores, Uuid, String, String) {
    let (state, stores) = test_helpers::test_app_state();
    let board = test_helpers::seed_board(&stores).await;
    let (_ada, ada_token) = test_helpers::seed_member(&stores, board.board_id, "Ada").await;
    let (_bob, bob_token) = test_helpers::seed_member(&stores, board.board_id, "Bob").await;
    (state, stores, board.board_id, ada_token, bob_token)
}

#[tokio::test]
async fn upgrade_without_session_is_unauthorized() {
    let (state, _stores, board_id, _ada, _bob) = two_members().await;
    let addr = serve(state).await;

    let err = connect_async(request(addr, board_id, None)).await.expect_err("upgrade should fail");

    let tungstenite::Error::Http(response) = err else {
        panic!("expected http rejection");
    };
    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn upgrade_without_board_access_is_forbidden() {
    let (state, stores) = test_helpers::test_app_state();
    let board = test_helpers::seed_board(&stores).await;
    let (_user, token) = test_helpers::seed_member(&stores, Uuid::new_v4(), "Mallory").await;
    let addr = serve(state).await;

    let err = connect_async(request(addr, board.board_id, Some(("authorization", format!("Bearer {token}")))))
        .await
        .expect_err("upgrade should fail");

    let tungstenite::Error::Http(response) = err else {
        panic!("expected http rejection");
    };
    assert_eq!(response.status(), 403);
}

#[tokio::test]
async fn join_pushes_snapshot_and_announces_online() {
    let (state, stores, board_id, ada_token, bob_token) = two_members().await;
    let addr = serve(state).await;
    let column = stores.tasks.insert_column(board_id, "Backlog").await;
    test_helpers::seed_task(&stores, &column, "triage inbox").await;

    let mut ada = connect_with_cookie(addr, board_id, &ada_token).await;
    let snapshot = recv_envelope(&mut ada).await;
    assert_eq!(snapshot["type"], json!("board_snapshot"));
    assert_eq!(snapshot["data"]["seq"], json!(0));
    assert_eq!(snapshot["data"]["tasks"].as_array().map(Vec::len), Some(1));

    let mut bob = connect_with_cookie(addr, board_id, &bob_token).await;
    let bob_snapshot = recv_envelope(&mut bob).await;
    assert_eq!(bob_snapshot["type"], json!("board_snapshot"));

    let online = recv_envelope(&mut ada).await;
    assert_eq!(online["type"], json!("user_presence"));
    assert_eq!(online["data"]["status"], json!("online"));
    assert_eq!(online["data"]["display_name"], json!("Bob"));
}

#[tokio::test]
async fn move_is_acked_and_broadcast_with_seq() {
    let (state, stores, board_id, ada_token, bob_token) = two_members().await;
    let addr = serve(state).await;
    let todo = stores.tasks.insert_column(board_id, "Later").await;
    let done = stores.tasks.insert_column(board_id, "Shipped").await;
    let task = test_helpers::seed_task(&stores, &todo, "release notes").await;

    let mut ada = connect_with_cookie(addr, board_id, &ada_token).await;
    recv_envelope_of(&mut ada, "board_snapshot").await;
    let mut bob = connect_with_cookie(addr, board_id, &bob_token).await;
    recv_envelope_of(&mut bob, "board_snapshot").await;
    recv_envelope_of(&mut ada, "user_presence").await;

    send_json(
        &mut ada,
        &json!({
            "type": "task_move",
            "board_id": board_id,
            "data": {"task_id": task.id, "version": task.version, "column_id": done.id, "position": 0}
        }),
    )
    .await;

    let ack = recv_envelope_of(&mut ada, "task_move").await;
    let seen = recv_envelope_of(&mut bob, "task_move").await;
    for envelope in [&ack, &seen] {
        assert_eq!(envelope["data"]["op"], json!("moved"));
        assert_eq!(envelope["data"]["seq"], json!(1));
        assert_eq!(envelope["data"]["task"]["column_id"], json!(done.id));
        assert_eq!(envelope["data"]["task"]["version"], json!(task.version + 1));
    }
}

#[tokio::test]
async fn stale_move_gets_conflict_with_current_state() {
    let (state, stores, board_id, ada_token, _bob) = two_members().await;
    let addr = serve(state).await;
    let todo = stores.tasks.insert_column(board_id, "Later").await;
    let done = stores.tasks.insert_column(board_id, "Shipped").await;
    let task = test_helpers::seed_task(&stores, &todo, "release notes").await;

    let mut ada = connect_with_cookie(addr, board_id, &ada_token).await;
    recv_envelope_of(&mut ada, "board_snapshot").await;

    send_json(
        &mut ada,
        &json!({
            "type": "task_move",
            "board_id": board_id,
            "data": {"task_id": task.id, "version": task.version + 7, "column_id": done.id, "position": 0}
        }),
    )
    .await;

    let error = recv_envelope_of(&mut ada, "error").await;
    assert_eq!(error["data"]["code"], json!("E_CONFLICT"));
    assert_eq!(error["data"]["current"]["version"], json!(task.version));
}

#[tokio::test]
async fn closing_last_tab_announces_offline() {
    let (state, _stores, board_id, ada_token, bob_token) = two_members().await;
    let addr = serve(state.clone()).await;

    let mut ada = connect_with_cookie(addr, board_id, &ada_token).await;
    recv_envelope_of(&mut ada, "board_snapshot").await;
    let mut bob = connect_with_cookie(addr, board_id, &bob_token).await;
    recv_envelope_of(&mut bob, "board_snapshot").await;

    bob.close(None).await.expect("close");

    let offline = recv_envelope_of(&mut ada, "user_presence").await;
    let offline = if offline["data"]["status"] == json!("online") {
        recv_envelope_of(&mut ada, "user_presence").await
    } else {
        offline
    };
    assert_eq!(offline["data"]["status"], json!("offline"));
    assert_eq!(state.registry.count(board_id).await, 1);
}

#[tokio::test]
async fn silent_peer_is_dropped_after_heartbeat_timeout() {
    let config = RealtimeConfig {
        heartbeat_interval: Duration::from_millis(20),
        heartbeat_timeout: Duration::from_millis(60),
        ..RealtimeConfig::default()
    };
    let (state, stores) = test_helpers::test_app_state_with(config);
    let board = test_helpers::seed_board(&stores).await;
    let (_ada, token) = test_helpers::seed_member(&stores, board.board_id, "Ada").await;
    let addr = serve(state.clone()).await;

    // Never read: pings go unanswered, so no inbound traffic refreshes activity.
    let _ada = connect_with_cookie(addr, board.board_id, &token).await;

    let deadline = Instant::now() + Duration::from_secs(2);
    while state.registry.count(board.board_id).await > 0 {
        assert!(Instant::now() < deadline, "connection should have been dropped");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
