//! HTTP サーバー（読み取り面の入口）
//!
//! 位置づけ:
//! - このモジュールは「HTTP入口層」。ルーティングと状態の束ねだけを持ち、
//!   実処理はサブモジュールへ分離する。
//!
//! ハンドラの分類:
//! - ユーザ向け（保護対象。レート制限 → ブレーカー → ハンドラの順に通過）:
//!   - GET /order/{uid}: キャッシュ → ストア → バックフィルの読み取り
//!   - POST /order: 注文をキャッシュへ投入（管理用途）
//! - 運用向け（制限を掛けない。死活確認が絞られては意味がない）:
//!   - GET /health, GET /metrics, GET /stats, POST /reset
//! - それ以外のパスは web/ ディレクトリの静的配信へフォールスルー

mod admin;
mod metrics;
mod orders;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use order_core::{LatencyHistogram, TtlCache};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::timeout::TimeoutLayer;
use tracing::info;

use crate::breaker::CircuitBreaker;
use crate::config::HttpConfig;
use crate::consumer::ConsumerStats;
use crate::dlq::DlqPublisher;
use crate::error::AppError;
use crate::order::Order;
use crate::ratelimit::RateLimiter;
use crate::store::OrderRepository;

use admin::{handle_reset, handle_stats};
use metrics::{handle_health, handle_metrics};
use orders::{handle_create_order, handle_get_order};

/// アプリケーション状態
#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<TtlCache<Order>>,
    pub repository: Arc<dyn OrderRepository>,
    pub breaker: Arc<CircuitBreaker>,
    pub limiter: Arc<RateLimiter>,
    pub consumer_stats: Arc<ConsumerStats>,
    pub dlq: Arc<DlqPublisher>,
    /// GET /order/{uid} の応答時間分布
    pub read_hist: Arc<LatencyHistogram>,
}

/// ルーターを組み立てる。
///
/// ミドルウェアは外側から rate limiter → circuit breaker の順。
/// axum の layer は後から積んだものが外側になるため、積む順は逆になる。
pub fn build_router(state: AppState, static_dir: &str) -> Router {
    let guarded = Router::new()
        .route("/order/{uid}", get(handle_get_order))
        .route("/order", post(handle_create_order))
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state.breaker),
            crate::breaker::middleware::gate,
        ))
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state.limiter),
            crate::ratelimit::middleware::gate,
        ))
        .with_state(state.clone());

    let operational = Router::new()
        .route("/health", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .route("/stats", get(handle_stats))
        .route("/reset", post(handle_reset))
        .with_state(state);

    Router::new()
        .merge(guarded)
        .merge(operational)
        .fallback_service(ServeDir::new(static_dir))
        .layer(CorsLayer::permissive())
}

/// 待ち受けソケットを開く。ポート衝突はここで起動失敗として返る。
pub async fn bind(config: &HttpConfig) -> Result<TcpListener, AppError> {
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| AppError::internal(format!("failed to bind {addr}: {e}")))?;
    info!(
        read_timeout_sec = config.read_timeout.as_secs(),
        write_timeout_sec = config.write_timeout.as_secs(),
        idle_timeout_sec = config.idle_timeout.as_secs(),
        "HTTP server listening on {}", addr
    );
    Ok(listener)
}

/// HTTPサーバーを回し、取り消しで graceful に閉じる。
/// 受付を止めた後、処理中の応答は完了まで待たれる。
pub async fn serve(
    listener: TcpListener,
    config: &HttpConfig,
    state: AppState,
    token: CancellationToken,
) -> Result<(), AppError> {
    let router = build_router(state, &config.static_dir)
        // ハンドラ全体の持ち時間。超過は 408 で切る。
        .layer(TimeoutLayer::new(config.write_timeout));

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { token.cancelled().await })
    .await
    .map_err(|e| AppError::internal(format!("http server error: {e}")))
}
