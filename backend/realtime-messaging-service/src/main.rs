use actix_web::{web, App, HttpServer};
use anyhow::Context;
use realtime_messaging_service::{
    config::Config,
    db, logging, metrics,
    redis_client::RedisClient,
    routes,
    services::{JwtPrincipalResolver, MemoryLog, RedisStreamLog, WriteBehindLog, WriteBehindWorker},
    state::AppState,
    store::{ChatStore, MemoryStore, PgStore},
    websocket::{
        gateway::GatewaySettings,
        pubsub::{ClusterBus, RedisClusterBus},
        Gateway,
    },
};
use std::sync::Arc;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Arc::new(Config::from_env()?);
    logging::init_tracing(cfg.log_format);

    let store: Arc<dyn ChatStore> = match &cfg.database_url {
        Some(url) => {
            let pool = db::init_pool(url, cfg.db_pool_max_size)
                .await
                .context("initialize postgres pool")?;
            Arc::new(PgStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    let (cluster, log): (Option<Arc<dyn ClusterBus>>, Arc<dyn WriteBehindLog>) =
        match &cfg.redis_url {
            Some(url) => {
                let redis = RedisClient::from_url(url)
                    .await
                    .context("connect to redis")?;
                let stream_log =
                    RedisStreamLog::new(redis.clone(), &cfg.cluster_namespace, &cfg.node_id)
                        .with_claim_idle(cfg.write_behind.claim_idle);
                stream_log
                    .ensure_group()
                    .await
                    .context("create write-behind consumer group")?;
                (
                    Some(Arc::new(RedisClusterBus::new(redis, &cfg.cluster_namespace))),
                    Arc::new(stream_log),
                )
            }
            None => {
                tracing::warn!("REDIS_URL not set, running single-node with in-process write-behind log");
                (None, Arc::new(MemoryLog::new()))
            }
        };

    let verifier = Arc::new(JwtPrincipalResolver::new(&cfg.jwt_key, store.clone())?);
    let gateway = Gateway::new(
        GatewaySettings::from(cfg.as_ref()),
        verifier,
        store.clone(),
        cluster,
        log.clone(),
    );
    let _background = gateway
        .start_background()
        .await
        .context("start cluster listener")?;

    let worker = WriteBehindWorker::new(log, store.clone(), cfg.write_behind.clone());
    tokio::spawn(worker.run());

    let state = AppState { gateway, store };

    let bind_addr = format!("0.0.0.0:{}", cfg.port);
    tracing::info!(%bind_addr, node_id = %cfg.node_id, "starting realtime-messaging-service");

    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(routes::wsroute::ws_handler)
            .service(routes::history::get_messages)
            .route("/health", web::get().to(|| async { "OK" }))
            .route("/metrics", web::get().to(metrics::metrics_handler))
    })
    .bind(&bind_addr)
    .with_context(|| format!("bind {bind_addr}"))?
    .run()
    .await
    .context("run http server")?;

    Ok(())
}
