pub mod message_service;
pub mod presence;
pub mod principal;
pub mod rate_limiter;
pub mod receipts;
pub mod stream_log;
pub mod typing;
pub mod write_behind;

pub use message_service::MessageService;
pub use presence::PresenceRegistry;
pub use principal::{JwtPrincipalResolver, Principal, PrincipalVerifier};
pub use rate_limiter::RateLimiter;
pub use receipts::ReceiptTracker;
pub use stream_log::RedisStreamLog;
pub use typing::TypingTracker;
pub use write_behind::{MemoryLog, WriteBehindLog, WriteBehindWorker};
