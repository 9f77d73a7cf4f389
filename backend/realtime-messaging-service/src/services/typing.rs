use crate::config::TypingConfig;
use crate::websocket::events::ServerEvent;
use crate::websocket::{FanoutTarget, Router};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingUser {
    pub user_id: Uuid,
    pub display_name: String,
    pub started_at: DateTime<Utc>,
}

struct TypingEntry {
    display_name: String,
    // active participants when typing began; stop events go to the same audience
    audience: Vec<Uuid>,
    started_at: DateTime<Utc>,
    last_activity: Instant,
    // the expiry timer only clears the entry if it still owns it
    generation: u64,
    timer: AbortHandle,
}

struct TypingInner {
    // conversation_id -> user_id -> entry
    state: Mutex<HashMap<Uuid, HashMap<Uuid, TypingEntry>>>,
    router: Router,
    config: TypingConfig,
    generation: AtomicU64,
}

/// Ephemeral, self-expiring typing state per conversation.
///
/// `Idle -> Typing` schedules one expiry timer per (conversation, user). A
/// renewed start replaces the timer instead of stacking another one. The
/// periodic [`TypingTracker::sweep`] purges anything the timers missed.
#[derive(Clone)]
pub struct TypingTracker {
    inner: Arc<TypingInner>,
}

impl TypingTracker {
    pub fn new(router: Router, config: TypingConfig) -> Self {
        Self {
            inner: Arc::new(TypingInner {
                state: Mutex::new(HashMap::new()),
                router,
                config,
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Caller must have checked that `user_id` may send to the conversation.
    /// `audience` is its active participant list; members not subscribed to
    /// the room are reached per user. Returns true on the `Idle -> Typing`
    /// transition.
    pub async fn start(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        display_name: &str,
        audience: Vec<Uuid>,
    ) -> bool {
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let timer = self.schedule_expiry(conversation_id, user_id, generation);

        let started = {
            let mut state = self.inner.state.lock().await;
            let users = state.entry(conversation_id).or_default();
            match users.get_mut(&user_id) {
                Some(entry) => {
                    entry.timer.abort();
                    entry.timer = timer;
                    entry.generation = generation;
                    entry.last_activity = Instant::now();
                    entry.audience = audience.clone();
                    false
                }
                None => {
                    users.insert(
                        user_id,
                        TypingEntry {
                            display_name: display_name.to_string(),
                            audience: audience.clone(),
                            started_at: Utc::now(),
                            last_activity: Instant::now(),
                            generation,
                            timer,
                        },
                    );
                    true
                }
            }
        };

        if started {
            self.inner
                .router
                .broadcast(
                    FanoutTarget::room(conversation_id)
                        .with_users(audience)
                        .excluding(user_id),
                    &ServerEvent::TypingStart {
                        conversation_id,
                        user_id,
                        display_name: display_name.to_string(),
                    },
                )
                .await;
        }
        started
    }

    /// Returns true on the `Typing -> Idle` transition.
    pub async fn stop(&self, conversation_id: Uuid, user_id: Uuid) -> bool {
        let removed = {
            let mut state = self.inner.state.lock().await;
            remove_entry(&mut state, conversation_id, user_id)
        };
        match removed {
            Some(entry) => {
                entry.timer.abort();
                self.inner
                    .broadcast_stop(conversation_id, user_id, entry.audience)
                    .await;
                true
            }
            None => false,
        }
    }

    /// Clears every entry owned by the user, e.g. on disconnect.
    pub async fn clear_user(&self, user_id: Uuid) -> usize {
        let cleared: Vec<(Uuid, Vec<Uuid>)> = {
            let mut state = self.inner.state.lock().await;
            let conversations: Vec<Uuid> = state
                .iter()
                .filter(|(_, users)| users.contains_key(&user_id))
                .map(|(conv, _)| *conv)
                .collect();
            conversations
                .into_iter()
                .filter_map(|conv| {
                    remove_entry(&mut state, conv, user_id).map(|entry| {
                        entry.timer.abort();
                        (conv, entry.audience)
                    })
                })
                .collect()
        };

        let count = cleared.len();
        for (conversation_id, audience) in cleared {
            self.inner
                .broadcast_stop(conversation_id, user_id, audience)
                .await;
        }
        count
    }

    /// Purges entries whose last activity is older than the hard expiry and
    /// drops empty conversation maps. Returns how many entries were purged.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let hard_expiry = self.inner.config.hard_expiry;

        let purged: Vec<(Uuid, Uuid, Vec<Uuid>)> = {
            let mut state = self.inner.state.lock().await;
            let mut purged = Vec::new();
            for (conversation_id, users) in state.iter_mut() {
                users.retain(|user_id, entry| {
                    let stale = now.duration_since(entry.last_activity) > hard_expiry;
                    if stale {
                        entry.timer.abort();
                        purged.push((*conversation_id, *user_id, std::mem::take(&mut entry.audience)));
                    }
                    !stale
                });
            }
            state.retain(|_, users| !users.is_empty());
            purged
        };

        let count = purged.len();
        for (conversation_id, user_id, audience) in purged {
            self.inner
                .broadcast_stop(conversation_id, user_id, audience)
                .await;
        }
        if count > 0 {
            tracing::debug!(purged = count, "typing sweep purged stale entries");
        }
        count
    }

    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let tracker = self.clone();
        let period = self.inner.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                tracker.sweep().await;
            }
        })
    }

    pub async fn typing_users(&self, conversation_id: Uuid) -> Vec<TypingUser> {
        let state = self.inner.state.lock().await;
        state
            .get(&conversation_id)
            .map(|users| {
                users
                    .iter()
                    .map(|(user_id, entry)| TypingUser {
                        user_id: *user_id,
                        display_name: entry.display_name.clone(),
                        started_at: entry.started_at,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn tracked_conversations(&self) -> usize {
        self.inner.state.lock().await.len()
    }

    fn schedule_expiry(&self, conversation_id: Uuid, user_id: Uuid, generation: u64) -> AbortHandle {
        let inner = self.inner.clone();
        let idle = self.inner.config.idle_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            inner.expire(conversation_id, user_id, generation).await;
        })
        .abort_handle()
    }
}

impl TypingInner {
    async fn expire(&self, conversation_id: Uuid, user_id: Uuid, generation: u64) {
        let expired = {
            let mut state = self.state.lock().await;
            let owns = state
                .get(&conversation_id)
                .and_then(|users| users.get(&user_id))
                .map(|entry| entry.generation == generation)
                .unwrap_or(false);
            if owns {
                remove_entry(&mut state, conversation_id, user_id)
            } else {
                None
            }
        };
        if let Some(entry) = expired {
            tracing::debug!(%conversation_id, %user_id, "typing expired");
            self.broadcast_stop(conversation_id, user_id, entry.audience)
                .await;
        }
    }

    async fn broadcast_stop(&self, conversation_id: Uuid, user_id: Uuid, audience: Vec<Uuid>) {
        self.router
            .broadcast(
                FanoutTarget::room(conversation_id)
                    .with_users(audience)
                    .excluding(user_id),
                &ServerEvent::TypingStop {
                    conversation_id,
                    user_id,
                },
            )
            .await;
    }
}

fn remove_entry(
    state: &mut HashMap<Uuid, HashMap<Uuid, TypingEntry>>,
    conversation_id: Uuid,
    user_id: Uuid,
) -> Option<TypingEntry> {
    let users = state.get_mut(&conversation_id)?;
    let entry = users.remove(&user_id);
    if users.is_empty() {
        state.remove(&conversation_id);
    }
    entry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::websocket::ConnectionRegistry;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Fixture {
        tracker: TypingTracker,
        conversation_id: Uuid,
        typist: Uuid,
        watcher_rx: UnboundedReceiver<String>,
    }

    async fn fixture(config: TypingConfig) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let registry = ConnectionRegistry::new();
        let router = Router::new(registry.clone(), store, None, "test");
        let conversation_id = Uuid::new_v4();
        let (watcher, watcher_rx) = registry.register(Uuid::new_v4()).await;
        registry.subscribe(watcher, conversation_id).await;
        Fixture {
            tracker: TypingTracker::new(router, config),
            conversation_id,
            typist: Uuid::new_v4(),
            watcher_rx,
        }
    }

    fn event_name(frame: &str) -> String {
        let value: serde_json::Value = serde_json::from_str(frame).unwrap();
        value["event"].as_str().unwrap().to_string()
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_broadcasts_stop() {
        let mut f = fixture(TypingConfig::default()).await;

        assert!(f.tracker.start(f.conversation_id, f.typist, "ann", Vec::new()).await);
        assert_eq!(event_name(&f.watcher_rx.recv().await.unwrap()), "typing:start");

        tokio::time::sleep(Duration::from_millis(3100)).await;
        assert_eq!(event_name(&f.watcher_rx.recv().await.unwrap()), "typing:stop");
        assert!(f.tracker.typing_users(f.conversation_id).await.is_empty());
        assert_eq!(f.tracker.tracked_conversations().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_resets_timer_without_rebroadcast() {
        let mut f = fixture(TypingConfig::default()).await;

        f.tracker.start(f.conversation_id, f.typist, "ann", Vec::new()).await;
        f.watcher_rx.recv().await.unwrap();

        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert!(!f.tracker.start(f.conversation_id, f.typist, "ann", Vec::new()).await);

        // the first timer would have fired at 3000ms
        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert_eq!(f.tracker.typing_users(f.conversation_id).await.len(), 1);
        assert!(f.watcher_rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(event_name(&f.watcher_rx.recv().await.unwrap()), "typing:stop");
        assert!(f.watcher_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_stop_is_idempotent() {
        let mut f = fixture(TypingConfig::default()).await;

        f.tracker.start(f.conversation_id, f.typist, "ann", Vec::new()).await;
        f.watcher_rx.recv().await.unwrap();

        assert!(f.tracker.stop(f.conversation_id, f.typist).await);
        assert!(!f.tracker.stop(f.conversation_id, f.typist).await);
        assert_eq!(event_name(&f.watcher_rx.recv().await.unwrap()), "typing:stop");

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(f.watcher_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_purges_entries_past_hard_expiry() {
        // timers effectively disabled so only the sweep can clear the entry
        let mut f = fixture(TypingConfig {
            idle_timeout: Duration::from_secs(3600),
            hard_expiry: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(10),
        })
        .await;

        f.tracker.start(f.conversation_id, f.typist, "ann", Vec::new()).await;
        f.watcher_rx.recv().await.unwrap();

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(f.tracker.sweep().await, 0);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(f.tracker.sweep().await, 1);
        assert_eq!(event_name(&f.watcher_rx.recv().await.unwrap()), "typing:stop");
        assert_eq!(f.tracker.tracked_conversations().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_audience_outside_room_sees_start_and_expiry() {
        let registry = ConnectionRegistry::new();
        let router = Router::new(registry.clone(), Arc::new(MemoryStore::new()), None, "test");
        let tracker = TypingTracker::new(router, TypingConfig::default());
        let conversation_id = Uuid::new_v4();
        let (typist, member) = (Uuid::new_v4(), Uuid::new_v4());
        let (_, mut member_rx) = registry.register(member).await;

        tracker
            .start(conversation_id, typist, "ann", vec![typist, member])
            .await;
        assert_eq!(event_name(&member_rx.recv().await.unwrap()), "typing:start");

        tokio::time::sleep(Duration::from_millis(3100)).await;
        assert_eq!(event_name(&member_rx.recv().await.unwrap()), "typing:stop");
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_user_on_disconnect() {
        let f = fixture(TypingConfig::default()).await;
        let other_conversation = Uuid::new_v4();

        f.tracker.start(f.conversation_id, f.typist, "ann", Vec::new()).await;
        f.tracker.start(other_conversation, f.typist, "ann", Vec::new()).await;

        assert_eq!(f.tracker.clear_user(f.typist).await, 2);
        assert_eq!(f.tracker.tracked_conversations().await, 0);
    }
}
