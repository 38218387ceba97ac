//! 注文API（読み取り面の中心）
//!
//! GET は cache → store → バックフィルの順で解決する。ストアの失敗は
//! リクエストフィールド付きでログし、クライアントには未存在と同じ 404 を
//! 返す（内部事情を読み取り面に漏らさない）。

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use order_core::latency::now_micros;
use serde::Serialize;
use tracing::{info, warn};

use super::AppState;
use crate::error::AppError;
use crate::order::Order;

#[derive(Serialize)]
pub(super) struct CreateOrderResponse {
    message: &'static str,
    order_uid: String,
}

/// 注文取得（GET /order/{uid}）
pub(super) async fn handle_get_order(
    State(state): State<AppState>,
    Path(uid): Path<String>,
) -> Result<Json<Order>, AppError> {
    let started = now_micros();
    let uid = uid.trim().to_string();
    if uid.is_empty() {
        return Err(AppError::Validation {
            fields: vec!["order uid is required".into()],
        });
    }

    // (i) キャッシュヒットなら即応答
    if let Some(order) = state.cache.get(&uid) {
        state.read_hist.record(now_micros() - started);
        return Ok(Json(order));
    }

    // (ii) ミスはストアへ。成功したらバックフィルして応答。
    match state.repository.get_by_uid(&uid).await {
        Ok(Some(order)) => {
            state.cache.set(order.clone());
            state.read_hist.record(now_micros() - started);
            Ok(Json(order))
        }
        Ok(None) => {
            state.read_hist.record(now_micros() - started);
            Err(AppError::NotFound { uid })
        }
        Err(err) => {
            // ストア障害は未存在と同じ見え方にする。詳細はログ側にだけ残す。
            warn!(order_uid = %uid, error = %err, "store lookup failed, responding 404");
            state.read_hist.record(now_micros() - started);
            Err(AppError::NotFound { uid })
        }
    }
}

/// 注文投入（POST /order）
/// デコードできた注文をキャッシュへ入れて 201 を返す。
pub(super) async fn handle_create_order(
    State(state): State<AppState>,
    payload: Result<Json<Order>, JsonRejection>,
) -> Result<(StatusCode, Json<CreateOrderResponse>), AppError> {
    let Json(order) = payload.map_err(|rejection| AppError::Validation {
        fields: vec![format!("invalid JSON body: {rejection}")],
    })?;

    let order_uid = order.order_uid.clone();
    state.cache.set(order);
    info!(order_uid = %order_uid, "order cached via admin endpoint");

    Ok((
        StatusCode::CREATED,
        Json(CreateOrderResponse {
            message: "Order created successfully",
            order_uid,
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::super::{build_router, AppState};
    use crate::breaker::CircuitBreaker;
    use crate::config::{
        BreakerConfig, DlqConfig, RateLimitAlgorithm, RateLimitConfig,
    };
    use crate::consumer::ConsumerStats;
    use crate::dlq::DlqPublisher;
    use crate::order::Order;
    use crate::ratelimit::RateLimiter;
    use crate::store::memory::MemoryOrderStore;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::Router;
    use http_body_util::BodyExt;
    use order_core::{LatencyHistogram, TtlCache};
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    const FIXTURE: &str = include_str!("../../../testdata/order_v1.json");

    fn fixture_order() -> Order {
        serde_json::from_str(FIXTURE).unwrap()
    }

    struct Harness {
        router: Router,
        cache: Arc<TtlCache<Order>>,
        store: Arc<MemoryOrderStore>,
    }

    fn harness(cached: Vec<Order>, stored: Vec<Order>) -> Harness {
        harness_with_limit(cached, stored, 1_000)
    }

    fn harness_with_limit(cached: Vec<Order>, stored: Vec<Order>, requests: u64) -> Harness {
        let cache = Arc::new(TtlCache::new(100, Duration::from_secs(60)));
        for order in cached {
            cache.set(order);
        }
        cache.reset_stats();
        let store = Arc::new(MemoryOrderStore::with_orders(stored));

        let state = AppState {
            cache: Arc::clone(&cache),
            repository: Arc::clone(&store) as Arc<dyn crate::store::OrderRepository>,
            breaker: Arc::new(CircuitBreaker::new(BreakerConfig {
                failure_threshold: 5,
                success_threshold: 3,
                timeout: Duration::from_millis(100),
                max_requests: 3,
            })),
            limiter: Arc::new(RateLimiter::from_config(&RateLimitConfig {
                requests,
                window: Duration::from_secs(1),
                burst: requests,
                algorithm: RateLimitAlgorithm::TokenBucket,
            })),
            consumer_stats: Arc::new(ConsumerStats::default()),
            dlq: Arc::new(
                DlqPublisher::new(
                    &DlqConfig {
                        enabled: false,
                        topic: "orders-dlq".into(),
                        max_retries: 3,
                    },
                    &["localhost:9092".into()],
                )
                .unwrap(),
            ),
            read_hist: Arc::new(LatencyHistogram::new()),
        };

        Harness {
            router: build_router(state, "web"),
            cache,
            store,
        }
    }

    async fn get(router: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn cache_hit_serves_order_and_counts_hit() {
        let h = harness(vec![fixture_order()], vec![]);

        let (status, body) = get(&h.router, "/order/b563feb7b2b84b6test").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["order_uid"], "b563feb7b2b84b6test");

        let stats = h.cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 0);
    }

    #[tokio::test]
    async fn miss_falls_back_to_store_and_backfills_cache() {
        let h = harness(vec![], vec![fixture_order()]);

        let (status, body) = get(&h.router, "/order/b563feb7b2b84b6test").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["order_uid"], "b563feb7b2b84b6test");
        assert_eq!(h.cache.len(), 1);

        // 2回目はキャッシュヒット
        let (status, _) = get(&h.router, "/order/b563feb7b2b84b6test").await;
        assert_eq!(status, StatusCode::OK);
        let stats = h.cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn unknown_uid_is_404() {
        let h = harness(vec![], vec![]);
        let (status, body) = get(&h.router, "/order/does-not-exist-uid").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "ORDER_NOT_FOUND");
    }

    #[tokio::test]
    async fn blank_uid_is_400() {
        let h = harness(vec![], vec![]);
        let (status, _) = get(&h.router, "/order/%20").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn store_error_surfaces_as_404() {
        let h = harness(vec![], vec![fixture_order()]);
        h.store.fail_reads.store(true, Ordering::SeqCst);

        let (status, _) = get(&h.router, "/order/b563feb7b2b84b6test").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn post_order_caches_and_returns_201() {
        let h = harness(vec![], vec![]);
        let response = h
            .router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/order")
                    .header("content-type", "application/json")
                    .body(Body::from(FIXTURE))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["order_uid"], "b563feb7b2b84b6test");
        assert!(h.cache.get("b563feb7b2b84b6test").is_some());
    }

    #[tokio::test]
    async fn post_bad_json_is_400() {
        let h = harness(vec![], vec![]);
        let response = h
            .router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/order")
                    .header("content-type", "application/json")
                    .body(Body::from("{broken"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn health_is_never_rate_limited() {
        let h = harness_with_limit(vec![fixture_order()], vec![], 1);

        // 保護対象のルートは1発で枠切れになる
        assert_eq!(
            get(&h.router, "/order/b563feb7b2b84b6test").await.0,
            StatusCode::OK
        );
        assert_eq!(
            get(&h.router, "/order/b563feb7b2b84b6test").await.0,
            StatusCode::TOO_MANY_REQUESTS
        );

        // health は制限の外
        for _ in 0..10 {
            let (status, body) = get(&h.router, "/health").await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["status"], "ok");
            assert_eq!(body["service"], "order-service");
        }
    }
}
