use crate::config::JwtKey;
use crate::error::{AppError, AuthFailure};
use crate::store::ChatStore;
use async_trait::async_trait;
use jsonwebtoken::{decode, errors::ErrorKind, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Authenticated identity, bound to a connection for its whole lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Principal {
    pub user_id: Uuid,
    pub display_name: String,
    pub verified: bool,
}

/// Access token claims issued by the identity service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID as UUID string)
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
    /// "access" or "refresh"; only access tokens open connections.
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

#[async_trait]
pub trait PrincipalVerifier: Send + Sync {
    async fn resolve(&self, credential: Option<&str>) -> Result<Principal, AuthFailure>;
}

/// Verifies JWTs and resolves the subject against the user store.
pub struct JwtPrincipalResolver {
    key: DecodingKey,
    validation: Validation,
    store: Arc<dyn ChatStore>,
}

impl JwtPrincipalResolver {
    pub fn new(key: &JwtKey, store: Arc<dyn ChatStore>) -> Result<Self, AppError> {
        let (key, algorithm) = match key {
            JwtKey::RsaPublicPem(pem) => (
                DecodingKey::from_rsa_pem(pem.as_bytes())
                    .map_err(|e| AppError::Config(format!("invalid JWT public key: {e}")))?,
                Algorithm::RS256,
            ),
            JwtKey::HmacSecret(secret) => {
                (DecodingKey::from_secret(secret.as_bytes()), Algorithm::HS256)
            }
        };
        let mut validation = Validation::new(algorithm);
        validation.validate_exp = true;

        Ok(Self {
            key,
            validation,
            store,
        })
    }

    fn verify(&self, token: &str) -> Result<Uuid, AuthFailure> {
        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => AuthFailure::ExpiredCredential,
                _ => {
                    tracing::debug!(error = %e, "credential rejected");
                    AuthFailure::MalformedCredential
                }
            }
        })?;

        if data.claims.token_type.as_deref() == Some("refresh") {
            return Err(AuthFailure::MalformedCredential);
        }
        Uuid::parse_str(&data.claims.sub).map_err(|_| AuthFailure::MalformedCredential)
    }
}

#[async_trait]
impl PrincipalVerifier for JwtPrincipalResolver {
    async fn resolve(&self, credential: Option<&str>) -> Result<Principal, AuthFailure> {
        let token = credential
            .map(str::trim)
            .map(|c| c.strip_prefix("Bearer ").unwrap_or(c))
            .filter(|c| !c.is_empty())
            .ok_or(AuthFailure::MissingCredential)?;

        let user_id = self.verify(token)?;

        match self.store.find_user(user_id).await {
            Ok(Some(profile)) => Ok(Principal {
                user_id: profile.id,
                display_name: profile.display_name,
                verified: profile.verified,
            }),
            Ok(None) => Err(AuthFailure::UnknownPrincipal),
            Err(e) => {
                tracing::error!(error = %e, %user_id, "principal lookup failed");
                Err(AuthFailure::UnknownPrincipal)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::Utc;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "unit-test-secret";

    fn token(sub: &str, exp_offset: i64, token_type: &str) -> String {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: sub.to_string(),
            iat: now,
            exp: now + exp_offset,
            token_type: Some(token_type.to_string()),
            username: None,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    async fn resolver() -> (JwtPrincipalResolver, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let resolver =
            JwtPrincipalResolver::new(&JwtKey::HmacSecret(SECRET.into()), store.clone()).unwrap();
        (resolver, store)
    }

    #[tokio::test]
    async fn test_resolves_known_user() {
        let (resolver, store) = resolver().await;
        let alice = store.add_user("alice").await;

        let principal = resolver
            .resolve(Some(&token(&alice.id.to_string(), 600, "access")))
            .await
            .unwrap();
        assert_eq!(principal.user_id, alice.id);
        assert_eq!(principal.display_name, "alice");
    }

    #[tokio::test]
    async fn test_accepts_bearer_prefix() {
        let (resolver, store) = resolver().await;
        let alice = store.add_user("alice").await;
        let credential = format!("Bearer {}", token(&alice.id.to_string(), 600, "access"));

        assert!(resolver.resolve(Some(&credential)).await.is_ok());
    }

    #[tokio::test]
    async fn test_typed_failures() {
        let (resolver, _store) = resolver().await;

        assert_eq!(
            resolver.resolve(None).await,
            Err(AuthFailure::MissingCredential)
        );
        assert_eq!(
            resolver.resolve(Some("  ")).await,
            Err(AuthFailure::MissingCredential)
        );
        assert_eq!(
            resolver.resolve(Some("not-a-jwt")).await,
            Err(AuthFailure::MalformedCredential)
        );
        assert_eq!(
            resolver
                .resolve(Some(&token(&Uuid::new_v4().to_string(), -3600, "access")))
                .await,
            Err(AuthFailure::ExpiredCredential)
        );
        assert_eq!(
            resolver
                .resolve(Some(&token(&Uuid::new_v4().to_string(), 600, "access")))
                .await,
            Err(AuthFailure::UnknownPrincipal)
        );
        assert_eq!(
            resolver
                .resolve(Some(&token(&Uuid::new_v4().to_string(), 600, "refresh")))
                .await,
            Err(AuthFailure::MalformedCredential)
        );
    }
}
