use crate::error::AppError;
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Key material used to verify connection credentials.
#[derive(Debug, Clone)]
pub enum JwtKey {
    /// RS256 public key in PEM format.
    RsaPublicPem(String),
    /// HS256 shared secret.
    HmacSecret(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub max_sends: u32,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_sends: 30,
            window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TypingConfig {
    /// Inactivity after the last `typing:start` before the entry clears itself.
    pub idle_timeout: Duration,
    /// Age past which the periodic sweep purges an entry regardless of timers.
    pub hard_expiry: Duration,
    pub sweep_interval: Duration,
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_millis(3000),
            hard_expiry: Duration::from_millis(5000),
            sweep_interval: Duration::from_millis(10_000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WriteBehindConfig {
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub retry_backoff: Duration,
    /// Idle time after which another consumer's unacknowledged entries are taken over.
    pub claim_idle: Duration,
}

impl Default for WriteBehindConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_millis(10),
            retry_backoff: Duration::from_millis(500),
            claim_idle: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_url: Option<String>,
    pub db_pool_max_size: usize,
    pub redis_url: Option<String>,
    pub jwt_key: JwtKey,
    pub rate_limit: RateLimitConfig,
    pub typing: TypingConfig,
    pub write_behind: WriteBehindConfig,
    pub cluster_namespace: String,
    pub node_id: String,
    /// Upper bound on conversations auto-joined at connect.
    pub auto_join_limit: usize,
    pub log_format: LogFormat,
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_or<T: FromStr>(key: &str, default: T) -> Result<T, AppError> {
    match optional(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| AppError::Config(format!("{key} has an invalid value: {raw}"))),
        None => Ok(default),
    }
}

/// Millisecond duration that must be non-zero.
fn positive_millis(key: &str, default: u64) -> Result<Duration, AppError> {
    match parse_or(key, default)? {
        0 => Err(AppError::Config(format!("{key} must be positive"))),
        ms => Ok(Duration::from_millis(ms)),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        dotenv().ok();

        let jwt_key = match (optional("JWT_PUBLIC_KEY_PEM"), optional("JWT_SECRET")) {
            (Some(pem), _) => JwtKey::RsaPublicPem(pem.replace("\\n", "\n")),
            (None, Some(secret)) => JwtKey::HmacSecret(secret),
            (None, None) => {
                return Err(AppError::Config(
                    "JWT_PUBLIC_KEY_PEM or JWT_SECRET must be set".into(),
                ))
            }
        };

        let log_format = match optional("LOG_FORMAT").as_deref() {
            None | Some("text") => LogFormat::Text,
            Some("json") => LogFormat::Json,
            Some(other) => {
                return Err(AppError::Config(format!(
                    "LOG_FORMAT must be text or json, got {other}"
                )))
            }
        };

        let rate_limit = RateLimitConfig {
            max_sends: parse_or("RATE_LIMIT_MAX_SENDS", 30)?,
            window: Duration::from_secs(parse_or("RATE_LIMIT_WINDOW_SECS", 60)?),
        };
        if rate_limit.max_sends == 0 || rate_limit.window.is_zero() {
            return Err(AppError::Config(
                "rate limit cap and window must be positive".into(),
            ));
        }

        let typing = TypingConfig {
            idle_timeout: positive_millis("TYPING_IDLE_MS", 3000)?,
            hard_expiry: positive_millis("TYPING_HARD_EXPIRY_MS", 5000)?,
            sweep_interval: positive_millis("TYPING_SWEEP_INTERVAL_MS", 10_000)?,
        };

        let write_behind = WriteBehindConfig {
            batch_size: parse_or("WRITE_BEHIND_BATCH_SIZE", 100)?,
            poll_interval: positive_millis("WRITE_BEHIND_POLL_MS", 10)?,
            retry_backoff: positive_millis("WRITE_BEHIND_RETRY_MS", 500)?,
            claim_idle: positive_millis("WRITE_BEHIND_CLAIM_IDLE_MS", 30_000)?,
        };
        if write_behind.batch_size == 0 {
            return Err(AppError::Config(
                "WRITE_BEHIND_BATCH_SIZE must be positive".into(),
            ));
        }

        Ok(Self {
            port: parse_or("PORT", 3000)?,
            database_url: optional("DATABASE_URL"),
            db_pool_max_size: parse_or("DB_POOL_MAX_SIZE", 16)?,
            redis_url: optional("REDIS_URL"),
            jwt_key,
            rate_limit,
            typing,
            write_behind,
            cluster_namespace: optional("CLUSTER_NAMESPACE")
                .unwrap_or_else(|| "realtime-messaging".to_string()),
            node_id: optional("NODE_ID").unwrap_or_else(|| Uuid::new_v4().to_string()),
            auto_join_limit: parse_or("AUTO_JOIN_LIMIT", 500)?,
            log_format,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_or_falls_back_to_default() {
        let value: u32 = parse_or("REALTIME_TEST_UNSET_KEY", 42).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_parse_or_rejects_garbage() {
        env::set_var("REALTIME_TEST_GARBAGE_KEY", "not-a-number");
        let result: Result<u32, _> = parse_or("REALTIME_TEST_GARBAGE_KEY", 1);
        assert!(matches!(result, Err(AppError::Config(_))));
        env::remove_var("REALTIME_TEST_GARBAGE_KEY");
    }

    #[test]
    fn test_positive_millis_rejects_zero() {
        env::set_var("REALTIME_TEST_ZERO_MS", "0");
        assert!(matches!(
            positive_millis("REALTIME_TEST_ZERO_MS", 10),
            Err(AppError::Config(_))
        ));
        env::set_var("REALTIME_TEST_ZERO_MS", "250");
        assert_eq!(
            positive_millis("REALTIME_TEST_ZERO_MS", 10).unwrap(),
            Duration::from_millis(250)
        );
        env::remove_var("REALTIME_TEST_ZERO_MS");
        assert_eq!(
            positive_millis("REALTIME_TEST_ZERO_MS", 10).unwrap(),
            Duration::from_millis(10)
        );
    }

    #[test]
    fn test_zero_sweep_interval_is_a_config_error() {
        env::set_var("JWT_SECRET", "config-test-secret");
        env::set_var("TYPING_SWEEP_INTERVAL_MS", "0");
        let result = Config::from_env();
        env::remove_var("TYPING_SWEEP_INTERVAL_MS");
        env::remove_var("JWT_SECRET");

        match result {
            Err(AppError::Config(message)) => assert!(message.contains("TYPING_SWEEP_INTERVAL_MS")),
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[test]
    fn test_defaults_match_documented_limits() {
        let rate = RateLimitConfig::default();
        assert_eq!(rate.max_sends, 30);
        assert_eq!(rate.window, Duration::from_secs(60));

        let typing = TypingConfig::default();
        assert_eq!(typing.idle_timeout, Duration::from_secs(3));
        assert_eq!(typing.hard_expiry, Duration::from_secs(5));
    }
}
