use serde::{Deserialize, Serialize};

use crate::models::{Message, MessageId, RoomId, UserId};

/// Events sent over the WebSocket gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Server confirms the connection is authenticated
    Ready { user_id: UserId, username: String },

    /// A new message was persisted in a room
    MessageCreate(Message),

    /// A user came online or went offline
    PresenceUpdate {
        user_id: UserId,
        username: String,
        online: bool,
    },

    /// A user started typing
    TypingStart {
        room_id: RoomId,
        user_id: UserId,
        username: String,
    },

    /// This connection now receives the room's events
    RoomJoined { room_id: RoomId },

    /// This connection no longer receives the room's events
    RoomLeft { room_id: RoomId },

    /// A `SendMessage` command from this connection was persisted
    MessageAck {
        nonce: Option<String>,
        id: MessageId,
    },

    /// A command from this connection was rejected
    Error {
        code: String,
        message: String,
        nonce: Option<String>,
    },
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Start receiving a room's messages
    JoinRoom { room_id: RoomId },

    /// Stop receiving a room's messages
    LeaveRoom { room_id: RoomId },

    /// Post a message; `nonce` is echoed back in the ack or error
    SendMessage {
        room_id: RoomId,
        body: String,
        #[serde(default)]
        nonce: Option<String>,
    },

    /// Indicate typing in a room
    StartTyping { room_id: RoomId },
}

/// Wire frame: the event plus the delivery channel's sequence number.
#[derive(Debug, Serialize)]
pub struct Envelope<'a> {
    pub seq: u64,
    #[serde(flatten)]
    pub event: &'a GatewayEvent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_carries_seq_alongside_tag() {
        let event = GatewayEvent::RoomJoined { room_id: 3 };
        let json = serde_json::to_value(Envelope { seq: 7, event: &event }).unwrap();

        assert_eq!(json["seq"], 7);
        assert_eq!(json["type"], "RoomJoined");
        assert_eq!(json["data"]["room_id"], 3);
    }

    #[test]
    fn send_message_nonce_is_optional() {
        let cmd: GatewayCommand = serde_json::from_str(
            r#"{"type":"SendMessage","data":{"room_id":1,"body":"hi"}}"#,
        )
        .unwrap();

        assert_eq!(
            cmd,
            GatewayCommand::SendMessage {
                room_id: 1,
                body: "hi".into(),
                nonce: None,
            }
        );
    }
}
