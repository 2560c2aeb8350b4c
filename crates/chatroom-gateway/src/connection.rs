use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tracing::{error, info, warn};

use chatroom_types::events::{Envelope, GatewayCommand, GatewayEvent};
use chatroom_types::models::{LOBBY_ROOM_ID, RoomId, UserId};

use crate::broker::{Broker, BrokerError, Sender};
use crate::registry::{ConnectionId, SessionRegistry};

/// Default heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Identity of an already-authenticated gateway connection.
#[derive(Debug, Clone)]
pub struct ConnectionIdentity {
    pub user_id: UserId,
    pub username: String,
    pub session_id: String,
}

/// Handle a pre-authenticated WebSocket connection.
/// The token was validated at the HTTP upgrade layer, so we go straight to
/// registration and the event loop. A Ping goes out every `heartbeat`.
pub async fn handle_connection(
    socket: WebSocket,
    broker: Broker,
    identity: ConnectionIdentity,
    heartbeat: Duration,
) {
    let registry = broker.registry().clone();
    let (mut sender, mut receiver) = socket.split();

    let registration = registry
        .register(identity.user_id, &identity.username, &identity.session_id)
        .await;
    let conn_id = registration.conn_id;
    let mut delivery = registration.receiver;

    info!(
        "{} ({}) connected to gateway as {}",
        identity.username, identity.user_id, conn_id
    );

    join_room(&registry, conn_id, LOBBY_ROOM_ID).await;

    // Shared flag for heartbeat
    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward the delivery channel -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(heartbeat);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                frame = delivery.recv() => {
                    // None: evicted, revoked, or unregistered
                    let Some(frame) = frame else { break };

                    let text = match serde_json::to_string(&Envelope { seq: frame.seq, event: &frame.event }) {
                        Ok(text) => text,
                        Err(e) => {
                            error!("Failed to encode frame {}: {}", frame.seq, e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }

        let _ = sender.send(Message::Close(None)).await;
    });

    // Read commands from client
    let recv_identity = identity.clone();
    let recv_broker = broker.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => handle_command(&recv_broker, conn_id, &recv_identity, cmd).await,
                    Err(e) => {
                        warn!(
                            "{} ({}) bad command: {} -- raw: {}",
                            recv_identity.username,
                            recv_identity.user_id,
                            e,
                            text.chars().take(200).collect::<String>()
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    registry.unregister(conn_id).await;
    info!("{} ({}) disconnected from gateway", identity.username, identity.user_id);
}

async fn join_room(registry: &SessionRegistry, conn_id: ConnectionId, room_id: RoomId) {
    if registry.join_room(conn_id, room_id).await {
        registry.send_to(conn_id, GatewayEvent::RoomJoined { room_id }).await;
    }
}

async fn handle_command(
    broker: &Broker,
    conn_id: ConnectionId,
    identity: &ConnectionIdentity,
    cmd: GatewayCommand,
) {
    let registry = broker.registry();

    match cmd {
        GatewayCommand::JoinRoom { room_id } => match broker.room_exists(room_id).await {
            Ok(true) => join_room(registry, conn_id, room_id).await,
            Ok(false) => {
                reject(registry, conn_id, &BrokerError::RoomNotFound(room_id), None).await;
            }
            Err(e) => {
                error!("Room lookup failed for {}: {}", room_id, e);
                reject(registry, conn_id, &e, None).await;
            }
        },

        GatewayCommand::LeaveRoom { room_id } => {
            if registry.leave_room(conn_id, room_id).await {
                registry.send_to(conn_id, GatewayEvent::RoomLeft { room_id }).await;
            }
        }

        GatewayCommand::SendMessage { room_id, body, nonce } => {
            let sender = Sender {
                user_id: identity.user_id,
                session_id: identity.session_id.clone(),
            };
            match broker.publish(&sender, room_id, &body).await {
                Ok(message) => {
                    registry
                        .send_to(conn_id, GatewayEvent::MessageAck { nonce, id: message.id })
                        .await;
                }
                Err(BrokerError::InvalidSession) => {
                    warn!(
                        "{} ({}) posted with a dead session, closing",
                        identity.username, identity.user_id
                    );
                    reject(registry, conn_id, &BrokerError::InvalidSession, nonce).await;
                    // Dropping the channel lets the send task flush the error, then close
                    registry.unregister(conn_id).await;
                }
                Err(e) => {
                    if let BrokerError::Store(inner) = &e {
                        error!("Message from {} not stored: {:#}", identity.user_id, inner);
                    }
                    reject(registry, conn_id, &e, nonce).await;
                }
            }
        }

        GatewayCommand::StartTyping { room_id } => {
            if registry.is_member(conn_id, room_id).await {
                registry
                    .deliver_to_room(
                        room_id,
                        GatewayEvent::TypingStart {
                            room_id,
                            user_id: identity.user_id,
                            username: identity.username.clone(),
                        },
                    )
                    .await;
            }
        }
    }
}

async fn reject(registry: &SessionRegistry, conn_id: ConnectionId, err: &BrokerError, nonce: Option<String>) {
    let message = match err {
        BrokerError::Store(_) => "internal error".to_string(),
        other => other.to_string(),
    };
    registry
        .send_to(
            conn_id,
            GatewayEvent::Error {
                code: err.code().to_string(),
                message,
                nonce,
            },
        )
        .await;
}
