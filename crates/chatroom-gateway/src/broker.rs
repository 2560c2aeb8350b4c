//! Accepts posted messages, persists them, and fans them out to the room.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, error};

use chatroom_db::Database;
use chatroom_types::events::GatewayEvent;
use chatroom_types::models::{Message, RoomId, UserId};

use crate::registry::SessionRegistry;

/// Longest accepted message body, in characters.
pub const MAX_BODY_CHARS: usize = 2000;

/// Repository interface the broker persists through.
pub trait MessageStore: Send + Sync + 'static {
    /// Owner of `session_id` if the session exists and has not expired.
    fn session_owner(&self, session_id: &str, now: DateTime<Utc>) -> anyhow::Result<Option<UserId>>;

    fn room_exists(&self, room_id: RoomId) -> anyhow::Result<bool>;

    fn persist_message(
        &self,
        room_id: RoomId,
        author_id: UserId,
        body: &str,
        timestamp: DateTime<Utc>,
    ) -> anyhow::Result<Message>;
}

impl MessageStore for Database {
    fn session_owner(&self, session_id: &str, now: DateTime<Utc>) -> anyhow::Result<Option<UserId>> {
        Ok(self.get_active_session(session_id, now)?.map(|s| s.user_id))
    }

    fn room_exists(&self, room_id: RoomId) -> anyhow::Result<bool> {
        Ok(self.get_room(room_id)?.is_some())
    }

    fn persist_message(
        &self,
        room_id: RoomId,
        author_id: UserId,
        body: &str,
        timestamp: DateTime<Utc>,
    ) -> anyhow::Result<Message> {
        Ok(self.insert_message(room_id, author_id, body, timestamp)?.into())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("message body is empty")]
    EmptyBody,

    #[error("message body exceeds {max} characters")]
    BodyTooLong { max: usize },

    #[error("session is not valid")]
    InvalidSession,

    #[error("room {0} not found")]
    RoomNotFound(RoomId),

    #[error("message store failed: {0}")]
    Store(#[source] anyhow::Error),
}

impl BrokerError {
    /// Stable code sent to gateway clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::EmptyBody => "empty_body",
            Self::BodyTooLong { .. } => "body_too_long",
            Self::InvalidSession => "invalid_session",
            Self::RoomNotFound(_) => "room_not_found",
            Self::Store(_) => "internal",
        }
    }
}

/// Who is posting: the user and the auth session they claim.
#[derive(Debug, Clone)]
pub struct Sender {
    pub user_id: UserId,
    pub session_id: String,
}

#[derive(Clone)]
pub struct Broker {
    store: Arc<dyn MessageStore>,
    registry: SessionRegistry,
    /// Held across persist + fan-out so every channel sees a room's
    /// messages in persistence order.
    publish_lock: Arc<Mutex<()>>,
}

impl Broker {
    pub fn new(store: Arc<dyn MessageStore>, registry: SessionRegistry) -> Self {
        Self {
            store,
            registry,
            publish_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Validate, persist, and fan out a message. Nothing is delivered unless
    /// the message was persisted.
    pub async fn publish(&self, sender: &Sender, room_id: RoomId, body: &str) -> Result<Message, BrokerError> {
        let body = body.trim();
        if body.is_empty() {
            return Err(BrokerError::EmptyBody);
        }
        if body.chars().count() > MAX_BODY_CHARS {
            return Err(BrokerError::BodyTooLong { max: MAX_BODY_CHARS });
        }

        let _order = self.publish_lock.lock().await;

        let store = self.store.clone();
        let session_id = sender.session_id.clone();
        let user_id = sender.user_id;
        let body_owned = body.to_string();

        // Run blocking DB work off the async runtime
        let message = tokio::task::spawn_blocking(move || {
            let now = Utc::now();
            match store.session_owner(&session_id, now).map_err(BrokerError::Store)? {
                Some(owner) if owner == user_id => {}
                _ => return Err(BrokerError::InvalidSession),
            }
            if !store.room_exists(room_id).map_err(BrokerError::Store)? {
                return Err(BrokerError::RoomNotFound(room_id));
            }
            store
                .persist_message(room_id, user_id, &body_owned, now)
                .map_err(BrokerError::Store)
        })
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            BrokerError::Store(anyhow::anyhow!("persist task failed: {e}"))
        })??;

        let delivered = self
            .registry
            .deliver_to_room(room_id, GatewayEvent::MessageCreate(message.clone()))
            .await;

        debug!(
            "Message {} in room {} by {} delivered to {} connection(s)",
            message.id, room_id, user_id, delivered
        );

        Ok(message)
    }

    /// True if the room exists in the store.
    pub async fn room_exists(&self, room_id: RoomId) -> Result<bool, BrokerError> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.room_exists(room_id))
            .await
            .map_err(|e| BrokerError::Store(anyhow::anyhow!("lookup task failed: {e}")))?
            .map_err(BrokerError::Store)
    }
}
