//! Metrics instrumentation.
//!
//! Uses the `metrics` crate for backend-agnostic collection; the embedding
//! application chooses the exporter.
//!
//! # Metric Naming Convention
//! - `orm_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms

use std::time::Duration;

use metrics::{counter, histogram};

/// Record one SQL statement with its latency.
pub fn record_sql_statement(pool: &str, operation: &str, duration: Duration) {
    counter!(
        "orm_sql_statements_total",
        "pool" => pool.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
    histogram!(
        "orm_sql_statement_seconds",
        "pool" => pool.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a full flush pass.
pub fn record_flush(entities: usize, duration: Duration, lazy: bool) {
    let mode = if lazy { "lazy" } else { "sync" };
    counter!("orm_flushes_total", "mode" => mode).increment(1);
    histogram!("orm_flush_entities", "mode" => mode).record(entities as f64);
    histogram!("orm_flush_seconds", "mode" => mode).record(duration.as_secs_f64());
}

/// Record a cache lookup outcome per tier.
pub fn record_cache_access(tier: &str, hit: bool) {
    let status = if hit { "hit" } else { "miss" };
    counter!(
        "orm_cache_access_total",
        "tier" => tier.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Record a pipelined remote-cache batch.
pub fn record_pipeline_commands(pool: &str, commands: usize) {
    counter!("orm_redis_pipelines_total", "pool" => pool.to_string()).increment(1);
    histogram!("orm_redis_pipeline_commands", "pool" => pool.to_string())
        .record(commands as f64);
}

/// Record a consumer batch size.
pub fn record_consumer_batch(events: usize) {
    counter!("orm_consumer_events_total").increment(events as u64);
    histogram!("orm_consumer_batch_size").record(events as f64);
}

/// Record a replayed lazy envelope.
pub fn record_lazy_replay(queries: usize) {
    counter!("orm_lazy_replays_total").increment(1);
    histogram!("orm_lazy_replay_queries").record(queries as f64);
}
