#![allow(dead_code)]

use chrono::Utc;
use jsonwebtoken::{encode, EncodingKey, Header};
use realtime_messaging_service::config::JwtKey;
use realtime_messaging_service::services::principal::Claims;
use realtime_messaging_service::services::{JwtPrincipalResolver, MemoryLog};
use realtime_messaging_service::store::{MemoryStore, UserProfile};
use realtime_messaging_service::websocket::events::{ClientEvent, SendMessagePayload};
use realtime_messaging_service::websocket::gateway::GatewaySettings;
use realtime_messaging_service::websocket::pubsub::ClusterBus;
use realtime_messaging_service::websocket::{Gateway, Session};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use uuid::Uuid;

pub const SECRET: &str = "integration-test-secret";
const WAIT: Duration = Duration::from_secs(2);
const QUIET: Duration = Duration::from_millis(200);

pub fn token(user_id: Uuid) -> String {
    token_with_ttl(user_id, 600)
}

pub fn token_with_ttl(user_id: Uuid, ttl_secs: i64) -> String {
    let now = Utc::now().timestamp();
    let claims = Claims {
        sub: user_id.to_string(),
        iat: now,
        exp: now + ttl_secs,
        token_type: Some("access".into()),
        username: None,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub gateway: Gateway,
    pub log: Arc<MemoryLog>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(GatewaySettings::default())
    }

    pub fn with_settings(settings: GatewaySettings) -> Self {
        Self::build(Arc::new(MemoryStore::new()), settings, None)
    }

    /// One node of a cluster sharing `store` and `bus` with its peers.
    pub async fn node(store: Arc<MemoryStore>, bus: Arc<dyn ClusterBus>, node_id: &str) -> Self {
        let settings = GatewaySettings {
            node_id: node_id.to_string(),
            ..GatewaySettings::default()
        };
        let harness = Self::build(store, settings, Some(bus));
        harness.gateway.start_background().await.unwrap();
        harness
    }

    fn build(
        store: Arc<MemoryStore>,
        settings: GatewaySettings,
        cluster: Option<Arc<dyn ClusterBus>>,
    ) -> Self {
        let log = Arc::new(MemoryLog::new());
        let verifier = Arc::new(
            JwtPrincipalResolver::new(&JwtKey::HmacSecret(SECRET.into()), store.clone()).unwrap(),
        );
        let gateway = Gateway::new(settings, verifier, store.clone(), cluster, log.clone());
        Self {
            store,
            gateway,
            log,
        }
    }

    /// Connects `user` and consumes `connection:established`.
    pub async fn connect(&self, user: &UserProfile) -> Client {
        let session = self
            .gateway
            .connect(Some(&token(user.id)))
            .await
            .unwrap();
        let mut client = Client { session };
        let established = client.expect("connection:established").await;
        assert_eq!(established["user_id"], user.id.to_string());
        client
    }
}

pub struct Client {
    pub session: Session,
}

impl Client {
    pub fn send(&self, event: ClientEvent) {
        self.session.inbound.send(event).unwrap();
    }

    pub fn send_text(&self, conversation_id: Uuid, content: &str, client_id: Option<&str>) {
        self.send(text(conversation_id, content, client_id));
    }

    pub async fn next_frame(&mut self, wait: Duration) -> Option<Value> {
        match timeout(wait, self.session.outbound.recv()).await {
            Ok(Some(frame)) => Some(serde_json::from_str(&frame).unwrap()),
            _ => None,
        }
    }

    /// Skips unrelated frames until `event` arrives and returns its data.
    pub async fn expect(&mut self, event: &str) -> Value {
        self.expect_within(event, WAIT).await
    }

    pub async fn expect_within(&mut self, event: &str, wait: Duration) -> Value {
        loop {
            let frame = self
                .next_frame(wait)
                .await
                .unwrap_or_else(|| panic!("timed out waiting for {event}"));
            if frame["event"] == event {
                return frame["data"].clone();
            }
        }
    }

    /// Drains whatever is queued and fails if `event` is among it.
    pub async fn assert_no(&mut self, event: &str) {
        while let Some(frame) = self.next_frame(QUIET).await {
            assert_ne!(frame["event"], event, "unexpected {event}: {frame}");
        }
    }
}

pub fn text(conversation_id: Uuid, content: &str, client_id: Option<&str>) -> ClientEvent {
    ClientEvent::SendMessage(SendMessagePayload {
        conversation_id: conversation_id.to_string(),
        content: Some(content.to_string()),
        attachments: Vec::new(),
        kind: Default::default(),
        reply_to: None,
        client_id: client_id.map(str::to_string),
    })
}
