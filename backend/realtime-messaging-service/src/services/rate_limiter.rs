use crate::config::RateLimitConfig;
use crate::error::ChatError;
use dashmap::DashMap;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// Per-user fixed window send limiter.
///
/// A window starts on the first send after the previous one expired and
/// resets wholesale. Idle windows are not swept; they are replaced lazily.
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: DashMap<Uuid, Window>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
        }
    }

    pub fn check(&self, user_id: Uuid) -> Result<(), ChatError> {
        let now = Instant::now();
        let mut window = self.windows.entry(user_id).or_insert(Window {
            started: now,
            count: 0,
        });

        if now.duration_since(window.started) >= self.config.window {
            *window = Window {
                started: now,
                count: 0,
            };
        }

        window.count += 1;
        if window.count <= self.config.max_sends {
            return Ok(());
        }

        let remaining = self
            .config
            .window
            .saturating_sub(now.duration_since(window.started));
        Err(ChatError::RateLimitExceeded {
            retry_after_secs: remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0),
        })
    }

    pub fn tracked_users(&self) -> usize {
        self.windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn limiter(max_sends: u32, window_secs: u64) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            max_sends,
            window: Duration::from_secs(window_secs),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejects_past_cap_until_window_elapses() {
        let limiter = limiter(3, 60);
        let user = Uuid::new_v4();

        for _ in 0..3 {
            assert!(limiter.check(user).is_ok());
        }
        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(
            limiter.check(user),
            Err(ChatError::RateLimitExceeded {
                retry_after_secs: 40
            })
        );

        tokio::time::advance(Duration::from_secs(40)).await;
        assert!(limiter.check(user).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_users_are_independent() {
        let limiter = limiter(1, 60);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        assert!(limiter.check(a).is_ok());
        assert!(limiter.check(a).is_err());
        assert!(limiter.check(b).is_ok());
        assert_eq!(limiter.tracked_users(), 2);
    }
}
