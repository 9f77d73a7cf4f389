//! Cluster fan-out adapter.
//!
//! Every broadcast leaving a node is wrapped in a [`FanoutEnvelope`] and
//! published on `<namespace>:fanout`. Each node delivers envelopes from other
//! nodes to its own connections and ignores the ones it published itself.

use crate::error::ClusterError;
use crate::metrics::CLUSTER_ENVELOPES_TOTAL;
use crate::redis_client::RedisClient;
use crate::websocket::{ConnectionRegistry, FanoutTarget};
use async_trait::async_trait;
use futures_util::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanoutEnvelope {
    /// Node id of the publisher.
    pub origin: String,
    pub target: FanoutTarget,
    /// Serialized server event, delivered verbatim.
    pub payload: String,
}

#[async_trait]
pub trait ClusterBus: Send + Sync {
    async fn publish(&self, envelope: &FanoutEnvelope) -> Result<(), ClusterError>;

    /// Stream of every envelope published on the bus, including our own.
    async fn subscribe(&self) -> Result<BoxStream<'static, FanoutEnvelope>, ClusterError>;
}

pub fn fanout_channel(namespace: &str) -> String {
    format!("{namespace}:fanout")
}

/// Redis pub/sub backed bus.
pub struct RedisClusterBus {
    redis: RedisClient,
    channel: String,
}

impl RedisClusterBus {
    pub fn new(redis: RedisClient, namespace: &str) -> Self {
        Self {
            redis,
            channel: fanout_channel(namespace),
        }
    }
}

#[async_trait]
impl ClusterBus for RedisClusterBus {
    async fn publish(&self, envelope: &FanoutEnvelope) -> Result<(), ClusterError> {
        let payload = serde_json::to_string(envelope)?;
        let mut conn = self.redis.manager();
        redis::cmd("PUBLISH")
            .arg(&self.channel)
            .arg(payload)
            .query_async::<_, i64>(&mut conn)
            .await?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, FanoutEnvelope>, ClusterError> {
        // PubSub requires a dedicated connection, not multiplexed
        let mut pubsub = self.redis.pubsub().await?;
        pubsub.subscribe(&self.channel).await?;

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let payload: String = match msg.get_payload() {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(error = %e, "non-text payload on fan-out channel");
                    return None;
                }
            };
            match serde_json::from_str::<FanoutEnvelope>(&payload) {
                Ok(envelope) => Some(envelope),
                Err(e) => {
                    tracing::warn!(error = %e, "dropping malformed fan-out envelope");
                    None
                }
            }
        });
        Ok(stream.boxed())
    }
}

/// In-process bus. Several gateways sharing one instance behave like nodes of
/// a cluster.
#[derive(Clone)]
pub struct LocalClusterBus {
    tx: broadcast::Sender<FanoutEnvelope>,
}

impl LocalClusterBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }
}

impl Default for LocalClusterBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl ClusterBus for LocalClusterBus {
    async fn publish(&self, envelope: &FanoutEnvelope) -> Result<(), ClusterError> {
        // no receivers is not an error: nobody else is listening yet
        let _ = self.tx.send(envelope.clone());
        Ok(())
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, FanoutEnvelope>, ClusterError> {
        let stream = BroadcastStream::new(self.tx.subscribe()).filter_map(|item| async move {
            match item {
                Ok(envelope) => Some(envelope),
                Err(e) => {
                    tracing::warn!(error = %e, "local cluster bus lagged");
                    None
                }
            }
        });
        Ok(stream.boxed())
    }
}

async fn drain(
    mut stream: BoxStream<'static, FanoutEnvelope>,
    registry: &ConnectionRegistry,
    node_id: &str,
) {
    while let Some(envelope) = stream.next().await {
        if envelope.origin == node_id {
            continue;
        }
        CLUSTER_ENVELOPES_TOTAL
            .with_label_values(&["received"])
            .inc();
        registry.deliver(&envelope.target, &envelope.payload).await;
    }
}

/// Subscribes to the bus and spawns the task delivering envelopes published
/// by other nodes to local connections.
///
/// The first subscription happens before this returns, so a failure there is
/// a startup error. Afterwards the task never exits: a lost subscription is
/// re-established after a short backoff.
pub async fn spawn_cluster_listener(
    bus: Arc<dyn ClusterBus>,
    registry: ConnectionRegistry,
    node_id: String,
) -> Result<JoinHandle<()>, ClusterError> {
    let stream = bus.subscribe().await?;
    tracing::info!(%node_id, "cluster fan-out listener subscribed");

    Ok(tokio::spawn(async move {
        drain(stream, &registry, &node_id).await;
        loop {
            tracing::warn!("cluster fan-out stream ended, resubscribing");
            tokio::time::sleep(Duration::from_secs(1)).await;
            match bus.subscribe().await {
                Ok(stream) => drain(stream, &registry, &node_id).await,
                Err(e) => tracing::error!(error = %e, "cluster fan-out subscribe failed"),
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_channel_is_namespaced() {
        assert_eq!(fanout_channel("chat"), "chat:fanout");
    }

    #[tokio::test]
    async fn test_local_bus_delivers_to_subscribers() {
        let bus = LocalClusterBus::default();
        let mut stream = bus.subscribe().await.unwrap();
        let envelope = FanoutEnvelope {
            origin: "node-a".into(),
            target: FanoutTarget::user(Uuid::new_v4()),
            payload: "{}".into(),
        };

        bus.publish(&envelope).await.unwrap();
        assert_eq!(stream.next().await, Some(envelope));
    }
}
