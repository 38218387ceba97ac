//! サーキットブレーカーの axum ミドルウェア
//!
//! ステータス 500 以上の応答を失敗として記録し、Open 中は下流ハンドラを
//! 呼ばずに 503 を返す。health / metrics には掛けないこと（入口の
//! ルーター構成側の責務）。

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::warn;

use super::CircuitBreaker;
use crate::error::AppError;

/// `axum::middleware::from_fn_with_state` に渡す入口関数
pub async fn gate(
    State(breaker): State<Arc<CircuitBreaker>>,
    req: Request,
    next: Next,
) -> Response {
    if let Err(state) = breaker.admit() {
        warn!(
            method = %req.method(),
            path = %req.uri().path(),
            state = state.as_str(),
            "request rejected by circuit breaker"
        );
        return AppError::CircuitOpen.into_response();
    }

    let response = next.run(req).await;
    // 5xx は下流障害とみなして失敗カウント
    breaker.record(!response.status().is_server_error());
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerState;
    use crate::config::BreakerConfig;
    use axum::body::Body;
    use axum::http::{Request as HttpRequest, StatusCode};
    use axum::routing::get;
    use axum::Router;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_router(breaker: Arc<CircuitBreaker>, failing: Arc<AtomicBool>, hits: Arc<AtomicU64>) -> Router {
        Router::new()
            .route(
                "/probe",
                get(move || {
                    let failing = Arc::clone(&failing);
                    let hits = Arc::clone(&hits);
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        if failing.load(Ordering::SeqCst) {
                            StatusCode::INTERNAL_SERVER_ERROR
                        } else {
                            StatusCode::OK
                        }
                    }
                }),
            )
            .layer(axum::middleware::from_fn_with_state(breaker, gate))
    }

    async fn hit(router: &Router) -> StatusCode {
        let response = router
            .clone()
            .oneshot(
                HttpRequest::builder()
                    .uri("/probe")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        response.status()
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_three_500s_and_recovers() {
        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig {
            failure_threshold: 3,
            success_threshold: 1,
            timeout: Duration::from_millis(100),
            max_requests: 1,
        }));
        let failing = Arc::new(AtomicBool::new(true));
        let hits = Arc::new(AtomicU64::new(0));
        let router = test_router(Arc::clone(&breaker), Arc::clone(&failing), Arc::clone(&hits));

        // 3連続 500 で Open
        for _ in 0..3 {
            assert_eq!(hit(&router).await, StatusCode::INTERNAL_SERVER_ERROR);
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        // timeout 前の4発目はハンドラに到達せず 503
        assert_eq!(hit(&router).await, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(hits.load(Ordering::SeqCst), 3);

        // timeout 経過後は試験投入が通り、成功すれば Closed に戻る
        tokio::time::advance(Duration::from_millis(101)).await;
        failing.store(false, Ordering::SeqCst);
        assert_eq!(hit(&router).await, StatusCode::OK);
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(hit(&router).await, StatusCode::OK);
    }

    #[tokio::test(start_paused = true)]
    async fn client_errors_do_not_trip_breaker() {
        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig {
            failure_threshold: 1,
            success_threshold: 1,
            timeout: Duration::from_millis(100),
            max_requests: 1,
        }));
        let router = Router::new()
            .route("/missing", get(|| async { StatusCode::NOT_FOUND }))
            .layer(axum::middleware::from_fn_with_state(Arc::clone(&breaker), gate));

        let response = router
            .oneshot(
                HttpRequest::builder()
                    .uri("/missing")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }
}
