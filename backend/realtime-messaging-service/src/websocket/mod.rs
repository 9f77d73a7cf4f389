use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{
    mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    RwLock,
};
use uuid::Uuid;

pub mod events;
pub mod gateway;
pub mod pubsub;
pub mod router;

pub use gateway::{Gateway, Session};
pub use router::Router;

/// Identifies one live WebSocket connection on this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Addressing for one fan-out.
///
/// A connection receives the payload once if it is subscribed to `room` or
/// belongs to one of `users` (the personal channels), unless its user is
/// `exclude_user`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FanoutTarget {
    pub room: Option<Uuid>,
    #[serde(default)]
    pub users: Vec<Uuid>,
    pub exclude_user: Option<Uuid>,
}

impl FanoutTarget {
    pub fn room(conversation_id: Uuid) -> Self {
        Self {
            room: Some(conversation_id),
            ..Self::default()
        }
    }

    pub fn users(users: Vec<Uuid>) -> Self {
        Self {
            users,
            ..Self::default()
        }
    }

    pub fn user(user_id: Uuid) -> Self {
        Self::users(vec![user_id])
    }

    pub fn with_users(mut self, users: Vec<Uuid>) -> Self {
        self.users = users;
        self
    }

    pub fn excluding(mut self, user_id: Uuid) -> Self {
        self.exclude_user = Some(user_id);
        self
    }
}

struct Subscriber {
    user_id: Uuid,
    sender: UnboundedSender<String>,
    rooms: HashSet<Uuid>,
}

#[derive(Default)]
struct RegistryState {
    connections: HashMap<ConnectionId, Subscriber>,
    // conversation_id -> subscribed connections
    rooms: HashMap<Uuid, HashSet<ConnectionId>>,
    // user_id -> that user's connections (personal channel)
    users: HashMap<Uuid, HashSet<ConnectionId>>,
}

impl RegistryState {
    fn drop_connection(&mut self, connection_id: ConnectionId) -> Option<Subscriber> {
        let subscriber = self.connections.remove(&connection_id)?;
        for room in &subscriber.rooms {
            if let Some(members) = self.rooms.get_mut(room) {
                members.remove(&connection_id);
                if members.is_empty() {
                    self.rooms.remove(room);
                }
            }
        }
        if let Some(conns) = self.users.get_mut(&subscriber.user_id) {
            conns.remove(&connection_id);
            if conns.is_empty() {
                self.users.remove(&subscriber.user_id);
            }
        }
        Some(subscriber)
    }
}

/// Process-local room membership table.
///
/// Tracks which connections are subscribed to which conversation and which
/// connections belong to which user. Knows nothing about authorization or the
/// cluster; see [`Router`] for that.
#[derive(Default, Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<RegistryState>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection on its user's personal channel.
    pub async fn register(&self, user_id: Uuid) -> (ConnectionId, UnboundedReceiver<String>) {
        let (tx, rx) = unbounded_channel();
        let connection_id = ConnectionId::new();

        let mut guard = self.inner.write().await;
        guard.connections.insert(
            connection_id,
            Subscriber {
                user_id,
                sender: tx,
                rooms: HashSet::new(),
            },
        );
        guard.users.entry(user_id).or_default().insert(connection_id);

        tracing::debug!(
            %connection_id,
            %user_id,
            total = guard.connections.len(),
            "registered connection"
        );
        (connection_id, rx)
    }

    /// Removes the connection and every room subscription it holds.
    /// Returns the rooms it was subscribed to.
    pub async fn unregister(&self, connection_id: ConnectionId) -> Vec<Uuid> {
        let mut guard = self.inner.write().await;
        guard
            .drop_connection(connection_id)
            .map(|s| s.rooms.into_iter().collect())
            .unwrap_or_default()
    }

    /// Returns false when the connection is unknown (already closed).
    pub async fn subscribe(&self, connection_id: ConnectionId, conversation_id: Uuid) -> bool {
        let mut guard = self.inner.write().await;
        let Some(subscriber) = guard.connections.get_mut(&connection_id) else {
            return false;
        };
        subscriber.rooms.insert(conversation_id);
        guard
            .rooms
            .entry(conversation_id)
            .or_default()
            .insert(connection_id);
        true
    }

    pub async fn unsubscribe(&self, connection_id: ConnectionId, conversation_id: Uuid) {
        let mut guard = self.inner.write().await;
        if let Some(subscriber) = guard.connections.get_mut(&connection_id) {
            subscriber.rooms.remove(&conversation_id);
        }
        if let Some(members) = guard.rooms.get_mut(&conversation_id) {
            members.remove(&connection_id);
            if members.is_empty() {
                guard.rooms.remove(&conversation_id);
            }
        }
    }

    /// Sends a payload to one connection. Returns false if it is gone.
    pub async fn send_to(&self, connection_id: ConnectionId, payload: String) -> bool {
        let guard = self.inner.read().await;
        guard
            .connections
            .get(&connection_id)
            .map(|s| s.sender.send(payload).is_ok())
            .unwrap_or(false)
    }

    /// Delivers a payload to every local connection matched by `target`, at
    /// most once per connection. Dead senders are pruned.
    pub async fn deliver(&self, target: &FanoutTarget, payload: &str) -> usize {
        let mut dead = Vec::new();
        let mut delivered = 0;
        {
            let guard = self.inner.read().await;
            let mut recipients: HashSet<ConnectionId> = HashSet::new();
            if let Some(room) = target.room {
                if let Some(members) = guard.rooms.get(&room) {
                    recipients.extend(members.iter().copied());
                }
            }
            for user_id in &target.users {
                if let Some(conns) = guard.users.get(user_id) {
                    recipients.extend(conns.iter().copied());
                }
            }

            for connection_id in recipients {
                let Some(subscriber) = guard.connections.get(&connection_id) else {
                    continue;
                };
                if Some(subscriber.user_id) == target.exclude_user {
                    continue;
                }
                if subscriber.sender.send(payload.to_string()).is_ok() {
                    delivered += 1;
                } else {
                    dead.push(connection_id);
                }
            }
        }

        if !dead.is_empty() {
            let mut guard = self.inner.write().await;
            for connection_id in &dead {
                guard.drop_connection(*connection_id);
            }
            tracing::debug!(cleaned = dead.len(), "pruned dead senders during fan-out");
        }
        delivered
    }

    pub async fn is_subscribed(&self, connection_id: ConnectionId, conversation_id: Uuid) -> bool {
        let guard = self.inner.read().await;
        guard
            .rooms
            .get(&conversation_id)
            .map(|m| m.contains(&connection_id))
            .unwrap_or(false)
    }

    /// Connection count of a conversation room (for debugging/metrics)
    pub async fn subscriber_count(&self, conversation_id: Uuid) -> usize {
        let guard = self.inner.read().await;
        guard.rooms.get(&conversation_id).map(|m| m.len()).unwrap_or(0)
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_deliver_dedupes_room_and_personal_channel() {
        let registry = ConnectionRegistry::new();
        let user = Uuid::new_v4();
        let conv = Uuid::new_v4();
        let (conn, mut rx) = registry.register(user).await;
        registry.subscribe(conn, conv).await;

        let target = FanoutTarget::room(conv).with_users(vec![user]);
        assert_eq!(registry.deliver(&target, "hello").await, 1);
        assert_eq!(rx.recv().await.as_deref(), Some("hello"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_deliver_skips_excluded_user_on_every_device() {
        let registry = ConnectionRegistry::new();
        let sender = Uuid::new_v4();
        let other = Uuid::new_v4();
        let conv = Uuid::new_v4();
        let (phone, mut phone_rx) = registry.register(sender).await;
        let (laptop, mut laptop_rx) = registry.register(sender).await;
        let (peer, mut peer_rx) = registry.register(other).await;
        for conn in [phone, laptop, peer] {
            registry.subscribe(conn, conv).await;
        }

        let delivered = registry
            .deliver(&FanoutTarget::room(conv).excluding(sender), "m")
            .await;

        assert_eq!(delivered, 1);
        assert_eq!(peer_rx.recv().await.as_deref(), Some("m"));
        assert!(phone_rx.try_recv().is_err());
        assert!(laptop_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dead_sender_is_pruned() {
        let registry = ConnectionRegistry::new();
        let conv = Uuid::new_v4();
        let (conn, rx) = registry.register(Uuid::new_v4()).await;
        registry.subscribe(conn, conv).await;
        drop(rx);

        assert_eq!(registry.deliver(&FanoutTarget::room(conv), "x").await, 0);
        assert_eq!(registry.subscriber_count(conv).await, 0);
        assert_eq!(registry.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_unregister_returns_rooms() {
        let registry = ConnectionRegistry::new();
        let conv = Uuid::new_v4();
        let (conn, _rx) = registry.register(Uuid::new_v4()).await;
        registry.subscribe(conn, conv).await;

        assert_eq!(registry.unregister(conn).await, vec![conv]);
        assert!(!registry.subscribe(conn, conv).await);
    }
}
