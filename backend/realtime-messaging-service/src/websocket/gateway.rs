use crate::config::{Config, RateLimitConfig, TypingConfig};
use crate::error::{AuthFailure, ChatError, ClusterError};
use crate::metrics::ACTIVE_CONNECTIONS;
use crate::models::{PresenceEntry, PresenceStatus};
use crate::services::{
    MessageService, PresenceRegistry, Principal, PrincipalVerifier, RateLimiter, ReceiptTracker,
    TypingTracker, WriteBehindLog,
};
use crate::store::ChatStore;
use crate::websocket::events::{ClientEvent, ServerEvent, ServerInfo};
use crate::websocket::pubsub::{spawn_cluster_listener, ClusterBus};
use crate::websocket::{ConnectionId, ConnectionRegistry, Router};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Tunables of the real-time core.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub node_id: String,
    pub rate_limit: RateLimitConfig,
    pub typing: TypingConfig,
    pub auto_join_limit: usize,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            node_id: Uuid::new_v4().to_string(),
            rate_limit: RateLimitConfig::default(),
            typing: TypingConfig::default(),
            auto_join_limit: 500,
        }
    }
}

impl From<&Config> for GatewaySettings {
    fn from(config: &Config) -> Self {
        Self {
            node_id: config.node_id.clone(),
            rate_limit: config.rate_limit.clone(),
            typing: config.typing.clone(),
            auto_join_limit: config.auto_join_limit,
        }
    }
}

/// One accepted connection.
///
/// Events pushed into `inbound` are processed strictly in order by the
/// connection's own task. Dropping `inbound` ends the task, which then runs
/// disconnect cleanup. Serialized server events arrive on `outbound`.
pub struct Session {
    pub principal: Principal,
    pub connection_id: ConnectionId,
    pub inbound: UnboundedSender<ClientEvent>,
    pub outbound: UnboundedReceiver<String>,
}

struct GatewayInner {
    verifier: Arc<dyn PrincipalVerifier>,
    store: Arc<dyn ChatStore>,
    cluster: Option<Arc<dyn ClusterBus>>,
    router: Router,
    presence: Arc<PresenceRegistry>,
    typing: TypingTracker,
    receipts: ReceiptTracker,
    messages: MessageService,
    server_info: ServerInfo,
    auto_join_limit: usize,
}

/// Owns connection lifecycles and dispatches their events.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

impl Gateway {
    pub fn new(
        settings: GatewaySettings,
        verifier: Arc<dyn PrincipalVerifier>,
        store: Arc<dyn ChatStore>,
        cluster: Option<Arc<dyn ClusterBus>>,
        log: Arc<dyn WriteBehindLog>,
    ) -> Self {
        let registry = ConnectionRegistry::new();
        let router = Router::new(registry, store.clone(), cluster.clone(), &settings.node_id);
        let presence = Arc::new(PresenceRegistry::new(
            store.clone(),
            router.clone(),
            settings.auto_join_limit,
        ));
        let typing = TypingTracker::new(router.clone(), settings.typing.clone());
        let limiter = Arc::new(RateLimiter::new(settings.rate_limit.clone()));
        let receipts = ReceiptTracker::new(store.clone(), router.clone());
        let messages = MessageService::new(
            store.clone(),
            router.clone(),
            presence.clone(),
            typing.clone(),
            limiter,
            log,
        );
        let server_info = ServerInfo {
            node_id: settings.node_id.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            max_sends_per_window: settings.rate_limit.max_sends,
            rate_window_secs: settings.rate_limit.window.as_secs(),
        };

        Self {
            inner: Arc::new(GatewayInner {
                verifier,
                store,
                cluster,
                router,
                presence,
                typing,
                receipts,
                messages,
                server_info,
                auto_join_limit: settings.auto_join_limit,
            }),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        self.inner.router.registry()
    }

    pub fn presence(&self) -> &PresenceRegistry {
        &self.inner.presence
    }

    pub fn typing(&self) -> &TypingTracker {
        &self.inner.typing
    }

    pub fn verifier(&self) -> &Arc<dyn PrincipalVerifier> {
        &self.inner.verifier
    }

    /// Starts the typing sweeper and, with a cluster bus, the fan-out listener.
    pub async fn start_background(&self) -> Result<Vec<JoinHandle<()>>, ClusterError> {
        let mut handles = vec![self.inner.typing.spawn_sweeper()];
        if let Some(bus) = &self.inner.cluster {
            handles.push(
                spawn_cluster_listener(
                    bus.clone(),
                    self.registry().clone(),
                    self.inner.server_info.node_id.clone(),
                )
                .await?,
            );
        }
        Ok(handles)
    }

    /// Authenticates and registers a connection, auto-joins its conversations
    /// and spawns the task that processes its events.
    pub async fn connect(&self, credential: Option<&str>) -> Result<Session, AuthFailure> {
        let principal = self.inner.verifier.resolve(credential).await?;
        let user_id = principal.user_id;

        let (connection_id, outbound) = self.registry().register(user_id).await;
        ACTIVE_CONNECTIONS.inc();
        self.inner
            .router
            .reply(
                connection_id,
                &ServerEvent::ConnectionEstablished {
                    user_id,
                    server_info: self.inner.server_info.clone(),
                },
            )
            .await;

        if self.inner.presence.set_online(user_id, connection_id) {
            if let Some(entry) = self.inner.presence.get(user_id) {
                self.inner.presence.publish(entry).await;
            }
        }

        match self
            .inner
            .store
            .list_user_conversations(user_id, self.inner.auto_join_limit)
            .await
        {
            Ok(conversations) => {
                for conversation in &conversations {
                    self.registry()
                        .subscribe(connection_id, conversation.id)
                        .await;
                }
                tracing::debug!(%user_id, joined = conversations.len(), "auto-joined conversations");
            }
            Err(e) => tracing::warn!(error = %e, %user_id, "auto-join failed"),
        }

        let (inbound, events) = unbounded_channel();
        tokio::spawn(self.clone().run(principal.clone(), connection_id, events));

        tracing::info!(%user_id, %connection_id, "connection established");
        Ok(Session {
            principal,
            connection_id,
            inbound,
            outbound,
        })
    }

    async fn run(
        self,
        principal: Principal,
        connection_id: ConnectionId,
        mut events: UnboundedReceiver<ClientEvent>,
    ) {
        while let Some(event) = events.recv().await {
            self.dispatch(&principal, connection_id, event).await;
        }
        self.disconnect(&principal, connection_id).await;
    }

    async fn dispatch(&self, principal: &Principal, connection_id: ConnectionId, event: ClientEvent) {
        let user_id = principal.user_id;
        let name = event.name();
        tracing::debug!(%user_id, event = name, "inbound event");

        let result: Result<(), ChatError> = match event {
            ClientEvent::JoinConversation { conversation_id } => {
                self.inner
                    .router
                    .join(connection_id, user_id, conversation_id)
                    .await;
                Ok(())
            }
            ClientEvent::LeaveConversation { conversation_id } => {
                self.inner.router.leave(connection_id, conversation_id).await;
                Ok(())
            }
            ClientEvent::OpenDirect { user_id: other } => {
                self.open_direct(user_id, connection_id, other).await
            }
            ClientEvent::TypingStart { conversation_id } => {
                if let Some(audience) = self.typing_audience(user_id, conversation_id).await {
                    self.inner
                        .typing
                        .start(conversation_id, user_id, &principal.display_name, audience)
                        .await;
                } else {
                    tracing::warn!(%user_id, %conversation_id, "dropping unauthorized typing");
                }
                Ok(())
            }
            ClientEvent::TypingStop { conversation_id } => {
                self.inner.typing.stop(conversation_id, user_id).await;
                Ok(())
            }
            ClientEvent::SendMessage(payload) => {
                let client_id = payload.client_id.clone();
                if let Err(e) = self
                    .inner
                    .messages
                    .send(user_id, connection_id, payload)
                    .await
                {
                    tracing::debug!(%user_id, reason = e.reason(), "send rejected");
                    self.inner
                        .router
                        .reply(
                            connection_id,
                            &ServerEvent::MessageError {
                                reason: e.reason().to_string(),
                                message: e.to_string(),
                                client_id,
                            },
                        )
                        .await;
                }
                Ok(())
            }
            ClientEvent::MessageDelivered { message_id } => self
                .inner
                .receipts
                .mark_delivered(message_id, user_id)
                .await
                .map(|_| ()),
            ClientEvent::MessageRead { message_id } => self
                .inner
                .receipts
                .mark_read(message_id, user_id)
                .await
                .map(|_| ()),
            ClientEvent::ConversationRead { conversation_id } => self
                .inner
                .receipts
                .mark_conversation_read(conversation_id, user_id)
                .await
                .map(|_| ()),
            ClientEvent::React { message_id, emoji } => self
                .inner
                .messages
                .react(user_id, message_id, emoji)
                .await
                .map(|_| ()),
            ClientEvent::Edit {
                message_id,
                content,
            } => self
                .inner
                .messages
                .edit(user_id, message_id, content)
                .await
                .map(|_| ()),
            ClientEvent::Delete {
                message_id,
                for_everyone,
            } => {
                self.inner
                    .messages
                    .delete(user_id, message_id, for_everyone)
                    .await
            }
            ClientEvent::PresenceSet { status } => {
                if let Some(entry) = self.inner.presence.set_status(user_id, status) {
                    self.inner.presence.publish(entry).await;
                }
                Ok(())
            }
        };

        if let Err(e) = result {
            tracing::debug!(%user_id, event = name, reason = e.reason(), "request failed");
            self.inner
                .router
                .reply(connection_id, &ServerEvent::request_error(name, &e))
                .await;
        }
    }

    async fn open_direct(
        &self,
        user_id: Uuid,
        connection_id: ConnectionId,
        other: Uuid,
    ) -> Result<(), ChatError> {
        if other == user_id {
            return Err(ChatError::InvalidPayload(
                "cannot open a direct conversation with yourself".into(),
            ));
        }
        if self.inner.store.find_user(other).await?.is_none() {
            return Err(ChatError::NotFound);
        }

        let conversation = self.inner.store.find_or_create_direct(user_id, other).await?;
        self.registry()
            .subscribe(connection_id, conversation.id)
            .await;
        self.inner
            .router
            .reply(connection_id, &ServerEvent::ConversationOpened { conversation })
            .await;
        Ok(())
    }

    /// Active participants of the conversation, or `None` when `user_id`
    /// may not send to it.
    async fn typing_audience(&self, user_id: Uuid, conversation_id: Uuid) -> Option<Vec<Uuid>> {
        match self.inner.store.get_conversation(conversation_id).await {
            Ok(Some(conversation)) if conversation.can_send(user_id) => {
                Some(conversation.active_participant_ids())
            }
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(error = %e, %conversation_id, "conversation lookup failed");
                None
            }
        }
    }

    /// Best-effort cleanup; nothing here can fail the caller.
    async fn disconnect(&self, principal: &Principal, connection_id: ConnectionId) {
        let user_id = principal.user_id;

        self.inner.typing.clear_user(user_id).await;
        self.registry().unregister(connection_id).await;
        ACTIVE_CONNECTIONS.dec();

        if self.inner.presence.remove(user_id, connection_id) {
            self.inner
                .presence
                .publish(PresenceEntry {
                    user_id,
                    status: PresenceStatus::Offline,
                    last_seen: Utc::now(),
                })
                .await;
        }
        tracing::info!(%user_id, %connection_id, "connection closed");
    }
}
