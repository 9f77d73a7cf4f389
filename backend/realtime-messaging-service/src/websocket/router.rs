use crate::metrics::CLUSTER_ENVELOPES_TOTAL;
use crate::store::ChatStore;
use crate::websocket::events::ServerEvent;
use crate::websocket::pubsub::{ClusterBus, FanoutEnvelope};
use crate::websocket::{ConnectionId, ConnectionRegistry, FanoutTarget};
use std::sync::Arc;
use uuid::Uuid;

/// Room membership with authorization, plus scoped broadcast.
///
/// Broadcasts are delivered to local connections first and then relayed
/// through the cluster bus when one is configured.
#[derive(Clone)]
pub struct Router {
    registry: ConnectionRegistry,
    store: Arc<dyn ChatStore>,
    cluster: Option<Arc<dyn ClusterBus>>,
    node_id: Arc<str>,
}

impl Router {
    pub fn new(
        registry: ConnectionRegistry,
        store: Arc<dyn ChatStore>,
        cluster: Option<Arc<dyn ClusterBus>>,
        node_id: &str,
    ) -> Self {
        Self {
            registry,
            store,
            cluster,
            node_id: Arc::from(node_id),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Subscribes the connection if `user_id` is an active participant.
    ///
    /// Refusals are logged and reported as `false`, never surfaced to the
    /// client, so non-participants learn nothing about the conversation.
    pub async fn join(
        &self,
        connection_id: ConnectionId,
        user_id: Uuid,
        conversation_id: Uuid,
    ) -> bool {
        let allowed = match self.store.get_conversation(conversation_id).await {
            Ok(Some(conv)) => conv.can_send(user_id),
            Ok(None) => false,
            Err(e) => {
                tracing::error!(error = %e, %conversation_id, "join lookup failed");
                false
            }
        };
        if !allowed {
            tracing::warn!(%user_id, %conversation_id, "dropping unauthorized join");
            return false;
        }
        self.registry.subscribe(connection_id, conversation_id).await
    }

    pub async fn leave(&self, connection_id: ConnectionId, conversation_id: Uuid) {
        self.registry
            .unsubscribe(connection_id, conversation_id)
            .await;
    }

    /// Fan-out to every matching connection in the cluster.
    pub async fn broadcast(&self, target: FanoutTarget, event: &ServerEvent) {
        let payload = match event.to_json() {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(error = %e, event = event.name(), "failed to encode event");
                return;
            }
        };

        let delivered = self.registry.deliver(&target, &payload).await;
        tracing::debug!(event = event.name(), delivered, "local fan-out");

        if let Some(bus) = &self.cluster {
            let envelope = FanoutEnvelope {
                origin: self.node_id.to_string(),
                target,
                payload,
            };
            match bus.publish(&envelope).await {
                Ok(()) => CLUSTER_ENVELOPES_TOTAL
                    .with_label_values(&["published"])
                    .inc(),
                Err(e) => {
                    tracing::warn!(error = %e, event = event.name(), "cluster publish failed")
                }
            }
        }
    }

    /// Reply to a single connection. Never leaves this process.
    pub async fn reply(&self, connection_id: ConnectionId, event: &ServerEvent) {
        match event.to_json() {
            Ok(payload) => {
                if !self.registry.send_to(connection_id, payload).await {
                    tracing::debug!(%connection_id, event = event.name(), "reply to closed connection");
                }
            }
            Err(e) => tracing::error!(error = %e, event = event.name(), "failed to encode reply"),
        }
    }
}
