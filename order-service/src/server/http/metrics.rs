//! 運用API（観測の入口）
//!
//! - /health: 死活と cache サイズの確認
//! - /metrics: Prometheus テキスト形式のスナップショット
//!
//! メトリクスは各コンポーネントのカウンタをその場で読んで整形する。
//! push 型の集計は持たない。

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use super::AppState;
use crate::breaker::BreakerState;

/// ヘルスチェックレスポンス
#[derive(Serialize)]
pub(super) struct HealthResponse {
    status: &'static str,
    service: &'static str,
    cache_size: usize,
}

/// ヘルスチェック（GET /health）
pub(super) async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "order-service",
        cache_size: state.cache.len(),
    })
}

/// メトリクス（GET /metrics）
/// cache / consumer / dlq / breaker / ratelimit / 読み取りレイテンシを出力
pub(super) async fn handle_metrics(State(state): State<AppState>) -> String {
    let cache = state.cache.stats();
    let consumer = state.consumer_stats.snapshot();
    let dlq = state.dlq.metrics();
    let dlq_processor = crate::dlq::processor_metrics();
    let breaker = state.breaker.snapshot();
    let ratelimit = state.limiter.aggregate();
    let read = state.read_hist.snapshot();

    let breaker_state_gauge = match breaker.state {
        BreakerState::Closed => 0,
        BreakerState::Open => 1,
        BreakerState::HalfOpen => 2,
    };

    format!(
        "# HELP order_cache_size Current number of cached orders\n\
         # TYPE order_cache_size gauge\n\
         order_cache_size {}\n\
         # HELP order_cache_hits_total Cache hits\n\
         # TYPE order_cache_hits_total counter\n\
         order_cache_hits_total {}\n\
         # HELP order_cache_misses_total Cache misses\n\
         # TYPE order_cache_misses_total counter\n\
         order_cache_misses_total {}\n\
         # HELP order_cache_evictions_total Entries evicted by size pressure\n\
         # TYPE order_cache_evictions_total counter\n\
         order_cache_evictions_total {}\n\
         # HELP order_cache_expirations_total Entries expired by TTL\n\
         # TYPE order_cache_expirations_total counter\n\
         order_cache_expirations_total {}\n\
         # HELP order_cache_hit_rate Cache hit rate percentage\n\
         # TYPE order_cache_hit_rate gauge\n\
         order_cache_hit_rate {}\n\
         # HELP order_consumer_processed_total Messages processed successfully\n\
         # TYPE order_consumer_processed_total counter\n\
         order_consumer_processed_total {}\n\
         # HELP order_consumer_failed_total Messages that exhausted processing\n\
         # TYPE order_consumer_failed_total counter\n\
         order_consumer_failed_total {}\n\
         # HELP order_consumer_dead_lettered_total Messages deflected to the DLQ\n\
         # TYPE order_consumer_dead_lettered_total counter\n\
         order_consumer_dead_lettered_total {}\n\
         # HELP order_dlq_enabled DLQ publishing enabled (1/0)\n\
         # TYPE order_dlq_enabled gauge\n\
         order_dlq_enabled {}\n\
         # HELP order_dlq_published_total Envelopes published to the DLQ topic\n\
         # TYPE order_dlq_published_total counter\n\
         order_dlq_published_total {}\n\
         # HELP order_dlq_dropped_total Envelopes dropped because the DLQ is disabled\n\
         # TYPE order_dlq_dropped_total counter\n\
         order_dlq_dropped_total {}\n\
         # HELP order_dlq_errors_total DLQ publish failures\n\
         # TYPE order_dlq_errors_total counter\n\
         order_dlq_errors_total {}\n\
         # HELP order_dlq_envelopes_read_total Envelopes read by the DLQ processor\n\
         # TYPE order_dlq_envelopes_read_total counter\n\
         order_dlq_envelopes_read_total {}\n\
         # HELP order_dlq_envelopes_retried_total Envelopes handed to reprocessing\n\
         # TYPE order_dlq_envelopes_retried_total counter\n\
         order_dlq_envelopes_retried_total {}\n\
         # HELP order_dlq_envelopes_dropped_total Envelopes dropped after max retries\n\
         # TYPE order_dlq_envelopes_dropped_total counter\n\
         order_dlq_envelopes_dropped_total {}\n\
         # HELP order_dlq_decode_errors_total Undecodable DLQ envelopes skipped\n\
         # TYPE order_dlq_decode_errors_total counter\n\
         order_dlq_decode_errors_total {}\n\
         # HELP order_breaker_state Circuit breaker state (0=closed,1=open,2=half-open)\n\
         # TYPE order_breaker_state gauge\n\
         order_breaker_state {}\n\
         # HELP order_breaker_failure_count Consecutive failures observed\n\
         # TYPE order_breaker_failure_count gauge\n\
         order_breaker_failure_count {}\n\
         # HELP order_ratelimit_keys Active rate limiter keys\n\
         # TYPE order_ratelimit_keys gauge\n\
         order_ratelimit_keys {}\n\
         # HELP order_ratelimit_allowed_total Requests admitted by the rate limiter\n\
         # TYPE order_ratelimit_allowed_total counter\n\
         order_ratelimit_allowed_total {}\n\
         # HELP order_ratelimit_denied_total Requests rejected by the rate limiter\n\
         # TYPE order_ratelimit_denied_total counter\n\
         order_ratelimit_denied_total {}\n\
         # HELP order_read_p50_us Order read latency p50 in microseconds\n\
         # TYPE order_read_p50_us gauge\n\
         order_read_p50_us {}\n\
         # HELP order_read_p99_us Order read latency p99 in microseconds\n\
         # TYPE order_read_p99_us gauge\n\
         order_read_p99_us {}\n\
         # HELP order_read_mean_us Order read latency mean in microseconds\n\
         # TYPE order_read_mean_us gauge\n\
         order_read_mean_us {}\n\
         # HELP order_read_max_us Order read latency max in microseconds\n\
         # TYPE order_read_max_us gauge\n\
         order_read_max_us {}\n\
         # HELP order_read_count_total Order read latency sample count\n\
         # TYPE order_read_count_total counter\n\
         order_read_count_total {}\n",
        cache.size,
        cache.hits,
        cache.misses,
        cache.evictions,
        cache.expirations,
        cache.hit_rate,
        consumer.processed,
        consumer.failed,
        consumer.dead_lettered,
        if dlq.enabled { 1 } else { 0 },
        dlq.published,
        dlq.dropped,
        dlq.errors,
        dlq_processor.envelopes_read,
        dlq_processor.envelopes_retried,
        dlq_processor.envelopes_dropped,
        dlq_processor.decode_errors,
        breaker_state_gauge,
        breaker.failure_count,
        ratelimit.keys,
        ratelimit.allowed,
        ratelimit.denied,
        read.percentile(50.0),
        read.percentile(99.0),
        read.mean_micros,
        read.max_micros,
        read.count,
    )
}
