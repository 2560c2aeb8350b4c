use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tower::ServiceExt;

use chatroom_api::auth::{AppState, decode_token};
use chatroom_gateway::connection;
use chatroom_server::app;
use chatroom_server::config::ServerConfig;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn spawn_server() -> (SocketAddr, Router) {
    let (addr, router, _) = spawn_server_with(connection::HEARTBEAT_INTERVAL).await;
    (addr, router)
}

async fn spawn_server_with(heartbeat: Duration) -> (SocketAddr, Router, AppState) {
    let config = ServerConfig::from_lookup(|key| match key {
        "CHATROOM_CONFIG" => Some("testing".into()),
        _ => None,
    })
    .unwrap();
    let mut state = app::build_state(&config).unwrap();
    Arc::get_mut(&mut state).unwrap().heartbeat_interval = heartbeat;
    let router = app::router(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let served = router.clone();
    tokio::spawn(async move {
        axum::serve(listener, served).await.unwrap();
    });
    (addr, router, state)
}

async fn request(router: &Router, method: Method, uri: &str, token: Option<&str>, body: Value) -> (StatusCode, Value) {
    let mut req = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        req = req.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    let resp = router
        .clone()
        .oneshot(req.body(Body::from(body.to_string())).unwrap())
        .await
        .unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), 1_000_000).await.unwrap();
    let json = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap() };
    (status, json)
}

async fn signup(router: &Router, username: &str) -> String {
    let (status, json) = request(
        router,
        Method::POST,
        "/auth/register",
        None,
        json!({
            "username": username,
            "email": format!("{username}@example.com"),
            "password": "secret1",
            "password2": "secret1",
        }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{json}");
    json["token"].as_str().unwrap().to_string()
}

async fn connect(addr: SocketAddr, token: &str) -> Client {
    let (client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/gateway?token={token}"))
        .await
        .unwrap();
    client
}

/// Next text frame as JSON, or None once the server closes the socket.
async fn next_frame(client: &mut Client) -> Option<Value> {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for a frame");
        match msg {
            Some(Ok(Message::Text(text))) => return Some(serde_json::from_str(&text).unwrap()),
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
            Some(Ok(_)) => continue,
        }
    }
}

/// Read frames up to and including the first of type `kind`.
async fn until(client: &mut Client, kind: &str) -> Vec<Value> {
    let mut frames = Vec::new();
    loop {
        let frame = next_frame(client).await.unwrap_or_else(|| panic!("closed before {kind}"));
        let done = frame["type"] == kind;
        frames.push(frame);
        if done {
            return frames;
        }
    }
}

#[tokio::test]
async fn connection_starts_with_ready_and_lobby() {
    let (addr, router) = spawn_server().await;
    let token = signup(&router, "alice").await;
    let mut client = connect(addr, &token).await;

    let frames = until(&mut client, "RoomJoined").await;
    assert_eq!(frames[0]["type"], "Ready");
    assert_eq!(frames[0]["data"]["username"], "alice");
    assert_eq!(frames[1]["type"], "PresenceUpdate");
    assert_eq!(frames.last().unwrap()["data"]["room_id"], 1);

    let seqs: Vec<u64> = frames.iter().map(|f| f["seq"].as_u64().unwrap()).collect();
    let expected: Vec<u64> = (1..=frames.len() as u64).collect();
    assert_eq!(seqs, expected);
}

#[tokio::test]
async fn http_posts_reach_gateway_clients_in_order() {
    let (addr, router) = spawn_server().await;
    let alice = signup(&router, "alice").await;
    let bob = signup(&router, "bob").await;

    let mut client = connect(addr, &alice).await;
    let last_seq = until(&mut client, "RoomJoined").await.last().unwrap()["seq"]
        .as_u64()
        .unwrap();

    for body in ["one", "two", "three"] {
        let (status, _) = request(&router, Method::POST, "/rooms/1/messages", Some(bob.as_str()), json!({ "body": body })).await;
        assert_eq!(status, StatusCode::CREATED);
    }

    let mut bodies = Vec::new();
    let mut seq = last_seq;
    while bodies.len() < 3 {
        let frame = next_frame(&mut client).await.unwrap();
        let frame_seq = frame["seq"].as_u64().unwrap();
        assert_eq!(frame_seq, seq + 1, "sequence numbers are contiguous");
        seq = frame_seq;
        if frame["type"] == "MessageCreate" {
            assert_eq!(frame["data"]["author_username"], "bob");
            bodies.push(frame["data"]["body"].as_str().unwrap().to_string());
        }
    }
    assert_eq!(bodies, ["one", "two", "three"]);
}

#[tokio::test]
async fn send_message_command_is_acked_and_broadcast() {
    let (addr, router) = spawn_server().await;
    let alice = signup(&router, "alice").await;
    let mut client = connect(addr, &alice).await;
    until(&mut client, "RoomJoined").await;

    let command = json!({
        "type": "SendMessage",
        "data": { "room_id": 1, "body": "hi there", "nonce": "n-1" },
    });
    client.send(Message::Text(command.to_string().into())).await.unwrap();

    let created = until(&mut client, "MessageCreate").await.pop().unwrap();
    assert_eq!(created["data"]["body"], "hi there");

    let ack = until(&mut client, "MessageAck").await.pop().unwrap();
    assert_eq!(ack["data"]["nonce"], "n-1");
    assert_eq!(ack["data"]["id"], created["data"]["id"]);

    let (_, history) = request(&router, Method::GET, "/rooms/1/messages", Some(alice.as_str()), Value::Null).await;
    assert_eq!(history["messages"][0]["body"], "hi there");
}

#[tokio::test]
async fn rejected_command_reports_error_with_nonce() {
    let (addr, router) = spawn_server().await;
    let alice = signup(&router, "alice").await;
    let mut client = connect(addr, &alice).await;
    until(&mut client, "RoomJoined").await;

    let command = json!({
        "type": "SendMessage",
        "data": { "room_id": 77, "body": "hello?", "nonce": "n-2" },
    });
    client.send(Message::Text(command.to_string().into())).await.unwrap();

    let error = until(&mut client, "Error").await.pop().unwrap();
    assert_eq!(error["data"]["code"], "room_not_found");
    assert_eq!(error["data"]["nonce"], "n-2");
}

#[tokio::test]
async fn logout_closes_live_connections() {
    let (addr, router) = spawn_server().await;
    let alice = signup(&router, "alice").await;
    let mut client = connect(addr, &alice).await;
    until(&mut client, "RoomJoined").await;

    let (status, _) = request(&router, Method::POST, "/auth/logout", Some(alice.as_str()), Value::Null).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    while next_frame(&mut client).await.is_some() {}

    // The token no longer opens a gateway connection
    assert!(
        tokio_tungstenite::connect_async(format!("ws://{addr}/gateway?token={alice}"))
            .await
            .is_err()
    );
}

#[tokio::test]
async fn presence_is_announced_to_others() {
    let (addr, router) = spawn_server().await;
    let alice = signup(&router, "alice").await;
    let bob = signup(&router, "bob").await;

    let mut alice_client = connect(addr, &alice).await;
    until(&mut alice_client, "RoomJoined").await;

    let bob_client = connect(addr, &bob).await;
    let online = until(&mut alice_client, "PresenceUpdate").await.pop().unwrap();
    assert_eq!(online["data"]["username"], "bob");
    assert_eq!(online["data"]["online"], true);

    drop(bob_client);
    let offline = until(&mut alice_client, "PresenceUpdate").await.pop().unwrap();
    assert_eq!(offline["data"]["username"], "bob");
    assert_eq!(offline["data"]["online"], false);
}

#[tokio::test]
async fn dead_session_command_gets_error_then_close() {
    let (addr, router, state) = spawn_server_with(connection::HEARTBEAT_INTERVAL).await;
    let alice = signup(&router, "alice").await;
    let mut client = connect(addr, &alice).await;
    until(&mut client, "RoomJoined").await;

    // Drop the session row behind the live connection's back
    let claims = decode_token(&state.jwt_secret, &alice).unwrap();
    state.db.delete_session(&claims.sid).unwrap();

    let command = json!({
        "type": "SendMessage",
        "data": { "room_id": 1, "body": "still here?", "nonce": "n-3" },
    });
    client.send(Message::Text(command.to_string().into())).await.unwrap();

    let error = until(&mut client, "Error").await.pop().unwrap();
    assert_eq!(error["data"]["code"], "invalid_session");
    assert_eq!(error["data"]["nonce"], "n-3");
    assert!(next_frame(&mut client).await.is_none());

    let (_, history) = request(&router, Method::GET, "/rooms/1/messages", Some(alice.as_str()), Value::Null).await;
    assert_eq!(history["error"]["code"], "unauthorized");
}

#[tokio::test]
async fn silent_client_is_dropped_after_two_missed_pongs() {
    let heartbeat = Duration::from_millis(100);
    let (addr, router, state) = spawn_server_with(heartbeat).await;
    let alice = signup(&router, "alice").await;
    let mut client = connect(addr, &alice).await;
    until(&mut client, "RoomJoined").await;
    assert_eq!(state.registry.connection_count().await, 1);

    // Not polling the client means no Pong goes back for the server's Pings
    tokio::time::sleep(heartbeat * 8).await;

    assert_eq!(state.registry.connection_count().await, 0);
    while next_frame(&mut client).await.is_some() {}
}

#[tokio::test]
async fn responsive_client_outlives_several_heartbeats() {
    let heartbeat = Duration::from_millis(100);
    let (addr, router, state) = spawn_server_with(heartbeat).await;
    let alice = signup(&router, "alice").await;
    let mut client = connect(addr, &alice).await;
    until(&mut client, "RoomJoined").await;

    // Keep reading so Pings are answered
    let deadline = tokio::time::Instant::now() + heartbeat * 6;
    while tokio::time::Instant::now() < deadline {
        if let Ok(frame) = tokio::time::timeout(heartbeat / 2, client.next()).await {
            assert!(matches!(frame, Some(Ok(_))), "connection dropped: {frame:?}");
        }
    }

    assert_eq!(state.registry.connection_count().await, 1);
}
