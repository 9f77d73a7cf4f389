use crate::models::{PresenceEntry, PresenceStatus};
use crate::store::ChatStore;
use crate::websocket::events::ServerEvent;
use crate::websocket::{ConnectionId, FanoutTarget, Router};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

struct PresenceSlot {
    connections: HashSet<ConnectionId>,
    status: PresenceStatus,
    last_seen: DateTime<Utc>,
}

/// Who is reachable on this process.
///
/// Each user's entry is only mutated by the gateway tasks of that user's own
/// connections. Status changes are written to the store in a detached task
/// and never delay the notification.
pub struct PresenceRegistry {
    entries: DashMap<Uuid, PresenceSlot>,
    store: Arc<dyn ChatStore>,
    router: Router,
    interest_limit: usize,
}

impl PresenceRegistry {
    pub fn new(store: Arc<dyn ChatStore>, router: Router, interest_limit: usize) -> Self {
        Self {
            entries: DashMap::new(),
            store,
            router,
            interest_limit,
        }
    }

    /// Returns true when this is the user's first connection.
    pub fn set_online(&self, user_id: Uuid, connection_id: ConnectionId) -> bool {
        let now = Utc::now();
        let mut first = false;
        self.entries
            .entry(user_id)
            .and_modify(|slot| {
                slot.connections.insert(connection_id);
                slot.last_seen = now;
            })
            .or_insert_with(|| {
                first = true;
                PresenceSlot {
                    connections: HashSet::from([connection_id]),
                    status: PresenceStatus::Online,
                    last_seen: now,
                }
            });
        first
    }

    /// No-op for users without a local connection.
    pub fn set_status(&self, user_id: Uuid, status: PresenceStatus) -> Option<PresenceEntry> {
        let mut slot = self.entries.get_mut(&user_id)?;
        slot.status = status;
        slot.last_seen = Utc::now();
        Some(PresenceEntry {
            user_id,
            status,
            last_seen: slot.last_seen,
        })
    }

    /// Drops one connection. Returns true when the user has none left.
    pub fn remove(&self, user_id: Uuid, connection_id: ConnectionId) -> bool {
        let mut offline = false;
        if let Some(mut slot) = self.entries.get_mut(&user_id) {
            slot.connections.remove(&connection_id);
            offline = slot.connections.is_empty();
        }
        if offline {
            self.entries
                .remove_if(&user_id, |_, slot| slot.connections.is_empty());
        }
        offline
    }

    pub fn is_online(&self, user_id: Uuid) -> bool {
        self.entries
            .get(&user_id)
            .map(|slot| !slot.connections.is_empty() && slot.status != PresenceStatus::Offline)
            .unwrap_or(false)
    }

    pub fn get(&self, user_id: Uuid) -> Option<PresenceEntry> {
        self.entries.get(&user_id).map(|slot| PresenceEntry {
            user_id,
            status: slot.status,
            last_seen: slot.last_seen,
        })
    }

    /// Persists the status in the background and notifies every distinct
    /// counterpart across the user's conversations.
    pub async fn publish(&self, entry: PresenceEntry) {
        let store = self.store.clone();
        let persisted = entry.clone();
        tokio::spawn(async move {
            if let Err(e) = store
                .update_presence(persisted.user_id, persisted.status, persisted.last_seen)
                .await
            {
                tracing::warn!(error = %e, user_id = %persisted.user_id, "presence persist failed");
            }
        });

        let parties = self.interested_parties(entry.user_id).await;
        if parties.is_empty() {
            return;
        }
        self.router
            .broadcast(
                FanoutTarget::users(parties),
                &ServerEvent::PresenceUpdate {
                    user_id: entry.user_id,
                    status: entry.status,
                    last_seen: entry.last_seen,
                },
            )
            .await;
    }

    async fn interested_parties(&self, user_id: Uuid) -> Vec<Uuid> {
        let conversations = match self
            .store
            .list_user_conversations(user_id, self.interest_limit)
            .await
        {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, %user_id, "could not resolve presence audience");
                return Vec::new();
            }
        };

        let mut seen = HashSet::new();
        conversations
            .iter()
            .flat_map(|c| c.active_participant_ids())
            .filter(|id| *id != user_id && seen.insert(*id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::websocket::ConnectionRegistry;

    fn registry(store: Arc<MemoryStore>) -> PresenceRegistry {
        let router = Router::new(ConnectionRegistry::new(), store.clone(), None, "test");
        PresenceRegistry::new(store, router, 100)
    }

    #[tokio::test]
    async fn test_multiple_connections_keep_user_online() {
        let presence = registry(Arc::new(MemoryStore::new()));
        let user = Uuid::new_v4();
        let phone = ConnectionId::new();
        let laptop = ConnectionId::new();

        assert!(presence.set_online(user, phone));
        assert!(!presence.set_online(user, laptop));
        assert!(!presence.remove(user, phone));
        assert!(presence.is_online(user));
        assert!(presence.remove(user, laptop));
        assert!(!presence.is_online(user));
        assert!(presence.get(user).is_none());
    }

    #[tokio::test]
    async fn test_set_status_requires_local_connection() {
        let presence = registry(Arc::new(MemoryStore::new()));
        let user = Uuid::new_v4();
        assert!(presence.set_status(user, PresenceStatus::Away).is_none());

        presence.set_online(user, ConnectionId::new());
        let entry = presence.set_status(user, PresenceStatus::Busy).unwrap();
        assert_eq!(entry.status, PresenceStatus::Busy);
    }

    #[tokio::test]
    async fn test_publish_reaches_counterparts_only() {
        let store = Arc::new(MemoryStore::new());
        let alice = store.add_user("alice").await.id;
        let bob = store.add_user("bob").await.id;
        let carol = store.add_user("carol").await.id;
        store.create_group("g", alice, &[bob]).await;

        let registry = ConnectionRegistry::new();
        let router = Router::new(registry.clone(), store.clone(), None, "test");
        let presence = PresenceRegistry::new(store.clone(), router, 100);
        let (_b, mut bob_rx) = registry.register(bob).await;
        let (_c, mut carol_rx) = registry.register(carol).await;

        presence.set_online(alice, ConnectionId::new());
        let entry = presence.get(alice).unwrap();
        presence.publish(entry).await;

        let frame: serde_json::Value =
            serde_json::from_str(&bob_rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["event"], "presence:update");
        assert_eq!(frame["data"]["user_id"], alice.to_string());
        assert!(carol_rx.try_recv().is_err());
    }
}
