use redis::aio::ConnectionManager;
use redis::{Client, RedisResult};

/// Shared handle to the Redis deployment.
///
/// Commands go through a cloneable [`ConnectionManager`]; pub/sub needs a
/// dedicated connection, opened from the underlying [`Client`].
#[derive(Clone)]
pub struct RedisClient {
    client: Client,
    manager: ConnectionManager,
}

impl RedisClient {
    pub async fn from_url(url: &str) -> RedisResult<Self> {
        let client = Client::open(url)?;
        let manager = ConnectionManager::new(client.clone()).await?;
        Ok(Self { client, manager })
    }

    pub fn manager(&self) -> ConnectionManager {
        self.manager.clone()
    }

    pub async fn pubsub(&self) -> RedisResult<redis::aio::PubSub> {
        self.client.get_async_pubsub().await
    }
}
