use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use chatroom_types::events::GatewayEvent;
use chatroom_types::models::{RoomId, UserId};

use crate::channel::{DeliveryReceiver, DeliverySender, delivery_channel};

pub type ConnectionId = Uuid;

/// Tracks which authenticated user owns which live connection, and which
/// rooms each connection receives.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    /// Queue depth for each new delivery channel
    capacity: usize,

    /// conn_id -> connection state
    connections: RwLock<HashMap<ConnectionId, ConnectionEntry>>,
}

struct ConnectionEntry {
    user_id: UserId,
    username: String,
    /// Auth session the connection was opened with
    session_id: String,
    rooms: HashSet<RoomId>,
    sender: DeliverySender,
}

/// Handle returned to a newly registered connection.
pub struct Registration {
    pub conn_id: ConnectionId,
    pub receiver: DeliveryReceiver,
}

impl SessionRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                capacity,
                connections: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Register a live connection.
    ///
    /// The new channel starts with `Ready` followed by a `PresenceUpdate` for
    /// every online user (including this one), so those frames always carry
    /// the first sequence numbers. If this is the user's first connection,
    /// everyone else is told they came online.
    pub async fn register(&self, user_id: UserId, username: &str, session_id: &str) -> Registration {
        let conn_id = Uuid::new_v4();
        let (sender, receiver) = delivery_channel(self.inner.capacity);

        let first_for_user = {
            let mut connections = self.inner.connections.write().await;
            let first_for_user = !connections.values().any(|c| c.user_id == user_id);

            let mut snapshot: Vec<GatewayEvent> = vec![GatewayEvent::Ready {
                user_id,
                username: username.to_string(),
            }];
            snapshot.extend(online_from(&connections, Some((user_id, username))).into_iter().map(
                |(uid, uname)| GatewayEvent::PresenceUpdate {
                    user_id: uid,
                    username: uname,
                    online: true,
                },
            ));
            for event in snapshot {
                // Fresh channel: only fails if capacity is smaller than the snapshot
                if let Err(e) = sender.push(Arc::new(event)) {
                    warn!("Connection {} snapshot truncated: {}", conn_id, e);
                    break;
                }
            }

            connections.insert(
                conn_id,
                ConnectionEntry {
                    user_id,
                    username: username.to_string(),
                    session_id: session_id.to_string(),
                    rooms: HashSet::new(),
                    sender,
                },
            );
            first_for_user
        };

        debug!("Registered connection {} for {} ({})", conn_id, username, user_id);

        if first_for_user {
            let event = GatewayEvent::PresenceUpdate {
                user_id,
                username: username.to_string(),
                online: true,
            };
            self.push_where(event, |id, _| *id != conn_id).await;
        }

        Registration { conn_id, receiver }
    }

    /// Remove a connection. Returns true if it was the user's last one.
    pub async fn unregister(&self, conn_id: ConnectionId) -> bool {
        let went_offline = self.remove_connections(vec![conn_id]).await;
        !went_offline.is_empty()
    }

    /// Returns false if the connection is unknown.
    pub async fn join_room(&self, conn_id: ConnectionId, room_id: RoomId) -> bool {
        let mut connections = self.inner.connections.write().await;
        match connections.get_mut(&conn_id) {
            Some(entry) => {
                entry.rooms.insert(room_id);
                true
            }
            None => false,
        }
    }

    /// Returns false if the connection is unknown or was not in the room.
    pub async fn leave_room(&self, conn_id: ConnectionId, room_id: RoomId) -> bool {
        let mut connections = self.inner.connections.write().await;
        connections
            .get_mut(&conn_id)
            .is_some_and(|entry| entry.rooms.remove(&room_id))
    }

    pub async fn is_member(&self, conn_id: ConnectionId, room_id: RoomId) -> bool {
        let connections = self.inner.connections.read().await;
        connections
            .get(&conn_id)
            .is_some_and(|entry| entry.rooms.contains(&room_id))
    }

    /// Push an event to every connection subscribed to `room_id`.
    /// Connections whose channel is full or closed are evicted.
    /// Returns the number of channels that accepted the event.
    pub async fn deliver_to_room(&self, room_id: RoomId, event: GatewayEvent) -> usize {
        self.push_where(event, |_, entry| entry.rooms.contains(&room_id)).await
    }

    /// Push an event to every connection.
    pub async fn broadcast(&self, event: GatewayEvent) -> usize {
        self.push_where(event, |_, _| true).await
    }

    /// Push an event to one connection. Returns false if it was not delivered.
    pub async fn send_to(&self, conn_id: ConnectionId, event: GatewayEvent) -> bool {
        self.push_where(event, |id, _| *id == conn_id).await == 1
    }

    /// Close every connection opened with `session_id` (logout).
    pub async fn revoke_session(&self, session_id: &str) -> usize {
        let ids = self.ids_where(|entry| entry.session_id == session_id).await;
        let count = ids.len();
        if count > 0 {
            info!("Revoking {} connection(s) of session {}", count, session_id);
            self.remove_connections(ids).await;
        }
        count
    }

    /// Close every connection of `user_id` (account deletion).
    pub async fn revoke_user(&self, user_id: UserId) -> usize {
        let ids = self.ids_where(|entry| entry.user_id == user_id).await;
        let count = ids.len();
        if count > 0 {
            info!("Revoking {} connection(s) of user {}", count, user_id);
            self.remove_connections(ids).await;
        }
        count
    }

    /// Distinct online users, sorted by id.
    pub async fn online_users(&self) -> Vec<(UserId, String)> {
        let connections = self.inner.connections.read().await;
        online_from(&connections, None)
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.connections.read().await.len()
    }

    async fn ids_where<F>(&self, filter: F) -> Vec<ConnectionId>
    where
        F: Fn(&ConnectionEntry) -> bool,
    {
        let connections = self.inner.connections.read().await;
        connections
            .iter()
            .filter(|(_, entry)| filter(entry))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Push to every matching connection, then evict the ones that failed.
    async fn push_where<F>(&self, event: GatewayEvent, filter: F) -> usize
    where
        F: Fn(&ConnectionId, &ConnectionEntry) -> bool,
    {
        let (delivered, failed) = self.try_push(Arc::new(event), filter).await;
        if !failed.is_empty() {
            self.remove_connections(failed).await;
        }
        delivered
    }

    async fn try_push<F>(&self, event: Arc<GatewayEvent>, filter: F) -> (usize, Vec<ConnectionId>)
    where
        F: Fn(&ConnectionId, &ConnectionEntry) -> bool,
    {
        let connections = self.inner.connections.read().await;
        let mut delivered = 0;
        let mut failed = Vec::new();

        for (id, entry) in connections.iter().filter(|(id, entry)| filter(id, entry)) {
            match entry.sender.push(event.clone()) {
                Ok(_) => delivered += 1,
                Err(e) => {
                    warn!(
                        "Evicting connection {} of {} ({}): {}",
                        id, entry.username, entry.user_id, e
                    );
                    failed.push(*id);
                }
            }
        }

        (delivered, failed)
    }

    /// Remove connections and announce users that have no connection left.
    /// Announcing can evict more slow connections, so this loops until settled.
    async fn remove_connections(&self, mut pending: Vec<ConnectionId>) -> Vec<UserId> {
        let mut went_offline = Vec::new();

        while !pending.is_empty() {
            let offline: Vec<(UserId, String)> = {
                let mut connections = self.inner.connections.write().await;
                let removed: Vec<ConnectionEntry> =
                    pending.drain(..).filter_map(|id| connections.remove(&id)).collect();

                let mut offline = Vec::new();
                for entry in removed {
                    let still_online = connections.values().any(|c| c.user_id == entry.user_id);
                    if !still_online && !offline.iter().any(|(uid, _)| *uid == entry.user_id) {
                        offline.push((entry.user_id, entry.username));
                    }
                }
                offline
            };

            for (user_id, username) in offline {
                debug!("{} ({}) has no live connections", username, user_id);
                let event = Arc::new(GatewayEvent::PresenceUpdate {
                    user_id,
                    username,
                    online: false,
                });
                let (_, failed) = self.try_push(event, |_, _| true).await;
                pending.extend(failed);
                went_offline.push(user_id);
            }
        }

        went_offline
    }
}

/// Distinct (user_id, username) pairs, optionally including one extra user.
fn online_from(
    connections: &HashMap<ConnectionId, ConnectionEntry>,
    extra: Option<(UserId, &str)>,
) -> Vec<(UserId, String)> {
    let mut users: HashMap<UserId, String> = connections
        .values()
        .map(|entry| (entry.user_id, entry.username.clone()))
        .collect();
    if let Some((user_id, username)) = extra {
        users.entry(user_id).or_insert_with(|| username.to_string());
    }

    let mut users: Vec<(UserId, String)> = users.into_iter().collect();
    users.sort_by_key(|(id, _)| *id);
    users
}
