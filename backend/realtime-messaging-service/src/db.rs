use deadpool_postgres::{
    Config as DbConfig, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime,
};
use tokio_postgres::NoTls;

const MIGRATION: &str = include_str!("../migrations/0001_realtime_core.sql");

#[derive(Debug, thiserror::Error)]
pub enum DbInitError {
    #[error("create pool: {0}")]
    Create(#[from] deadpool_postgres::CreatePoolError),

    #[error("acquire connection: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("apply migration: {0}")]
    Migrate(#[from] tokio_postgres::Error),
}

/// Builds the pool and applies the schema. The migration is idempotent.
pub async fn init_pool(database_url: &str, max_size: usize) -> Result<Pool, DbInitError> {
    let mut cfg = DbConfig::new();
    cfg.url = Some(database_url.to_string());
    cfg.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    });
    cfg.pool = Some(PoolConfig::new(max_size));

    let pool = cfg.create_pool(Some(Runtime::Tokio1), NoTls)?;
    let client = pool.get().await?;
    client.batch_execute(MIGRATION).await?;
    tracing::info!(max_size, "database pool ready, schema applied");
    Ok(pool)
}
