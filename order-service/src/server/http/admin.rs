//! 管理API
//!
//! - GET /stats: cache / breaker / ratelimit / consumer のカウンタを JSON で
//! - POST /reset: ブレーカーとレート制限を初期状態へ戻し、cache の
//!   統計カウンタをゼロにする（cache の中身は消さない）

use axum::extract::State;
use axum::Json;
use serde::Serialize;
use tracing::info;

use super::AppState;

#[derive(Serialize)]
pub(super) struct StatsResponse {
    cache: CacheSection,
    circuit_breaker: BreakerSection,
    rate_limiter: RateLimitSection,
    consumer: ConsumerSection,
}

#[derive(Serialize)]
struct CacheSection {
    size: usize,
    hits: u64,
    misses: u64,
    hit_rate: f64,
    evictions: u64,
    expirations: u64,
}

#[derive(Serialize)]
struct BreakerSection {
    state: &'static str,
    failure_count: u32,
    success_count: u32,
    request_count: u32,
    last_failure_age_ms: Option<u64>,
    next_attempt_in_ms: Option<u64>,
}

#[derive(Serialize)]
struct RateLimitSection {
    keys: usize,
    allowed: u64,
    denied: u64,
}

#[derive(Serialize)]
struct ConsumerSection {
    processed: u64,
    failed: u64,
    dead_lettered: u64,
}

/// 統計取得（GET /stats）
pub(super) async fn handle_stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let cache = state.cache.stats();
    let breaker = state.breaker.snapshot();
    let ratelimit = state.limiter.aggregate();
    let consumer = state.consumer_stats.snapshot();

    Json(StatsResponse {
        cache: CacheSection {
            size: cache.size,
            hits: cache.hits,
            misses: cache.misses,
            hit_rate: cache.hit_rate,
            evictions: cache.evictions,
            expirations: cache.expirations,
        },
        circuit_breaker: BreakerSection {
            state: breaker.state.as_str(),
            failure_count: breaker.failure_count,
            success_count: breaker.success_count,
            request_count: breaker.request_count,
            last_failure_age_ms: breaker.last_failure_age.map(|d| d.as_millis() as u64),
            next_attempt_in_ms: breaker.next_attempt_in.map(|d| d.as_millis() as u64),
        },
        rate_limiter: RateLimitSection {
            keys: ratelimit.keys,
            allowed: ratelimit.allowed,
            denied: ratelimit.denied,
        },
        consumer: ConsumerSection {
            processed: consumer.processed,
            failed: consumer.failed,
            dead_lettered: consumer.dead_lettered,
        },
    })
}

#[derive(Serialize)]
pub(super) struct ResetResponse {
    message: &'static str,
}

/// 保護部品のリセット（POST /reset）
pub(super) async fn handle_reset(State(state): State<AppState>) -> Json<ResetResponse> {
    state.breaker.reset();
    state.limiter.reset_all();
    state.cache.reset_stats();
    state.read_hist.reset();
    info!("protective middleware state reset via admin endpoint");
    Json(ResetResponse {
        message: "circuit breaker, rate limiter and cache stats reset",
    })
}
