use actix_web::{http::header::ContentType, HttpResponse};
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, TextEncoder};

fn register<T: prometheus::core::Collector + Clone + 'static>(metric: T, name: &str) -> T {
    prometheus::default_registry()
        .register(Box::new(metric.clone()))
        .unwrap_or_else(|e| panic!("failed to register {name}: {e}"));
    metric
}

pub static ACTIVE_CONNECTIONS: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new(
        "realtime_messaging_active_connections",
        "WebSocket connections currently held by this process",
    )
    .expect("failed to create realtime_messaging_active_connections");
    register(gauge, "realtime_messaging_active_connections")
});

pub static MESSAGES_ACCEPTED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "realtime_messaging_messages_accepted_total",
        "Messages persisted and broadcast by the ingestion pipeline",
    )
    .expect("failed to create realtime_messaging_messages_accepted_total");
    register(counter, "realtime_messaging_messages_accepted_total")
});

pub static SEND_REJECTIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "realtime_messaging_send_rejections_total",
            "Sends rejected by the ingestion pipeline, by reason",
        ),
        &["reason"],
    )
    .expect("failed to create realtime_messaging_send_rejections_total");
    register(counter, "realtime_messaging_send_rejections_total")
});

pub static DUPLICATE_SENDS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "realtime_messaging_duplicate_sends_total",
        "Retried sends resolved through the client id replay check",
    )
    .expect("failed to create realtime_messaging_duplicate_sends_total");
    register(counter, "realtime_messaging_duplicate_sends_total")
});

pub static WRITE_BEHIND_FLUSHED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "realtime_messaging_write_behind_flushed_total",
            "Write-behind batches and entries flushed to the store",
        ),
        &["unit"],
    )
    .expect("failed to create realtime_messaging_write_behind_flushed_total");
    register(counter, "realtime_messaging_write_behind_flushed_total")
});

pub static WRITE_BEHIND_FAILURES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "realtime_messaging_write_behind_failures_total",
        "Write-behind batches that failed and were retried",
    )
    .expect("failed to create realtime_messaging_write_behind_failures_total");
    register(counter, "realtime_messaging_write_behind_failures_total")
});

pub static CLUSTER_ENVELOPES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "realtime_messaging_cluster_envelopes_total",
            "Fan-out envelopes exchanged with other nodes",
        ),
        &["direction"],
    )
    .expect("failed to create realtime_messaging_cluster_envelopes_total");
    register(counter, "realtime_messaging_cluster_envelopes_total")
});

pub fn record_rejection(reason: &str) {
    SEND_REJECTIONS_TOTAL.with_label_values(&[reason]).inc();
}

pub fn record_flush(entries: u64) {
    WRITE_BEHIND_FLUSHED_TOTAL
        .with_label_values(&["batches"])
        .inc();
    WRITE_BEHIND_FLUSHED_TOTAL
        .with_label_values(&["entries"])
        .inc_by(entries);
}

pub async fn metrics_handler() -> HttpResponse {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&prometheus::gather(), &mut buffer) {
        return HttpResponse::InternalServerError().body(err.to_string());
    }
    HttpResponse::Ok()
        .content_type(ContentType::plaintext())
        .body(buffer)
}
