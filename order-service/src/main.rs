//! Order Service - 注文の取り込みと配信
//!
//! ## 全体フロー（超要約）
//! 1) Kafka consumer が注文 JSON を受信（decode → validate → persist → cache）
//! 2) 処理失敗は指数バックオフで再試行し、使い切ったら DLQ へ退避
//! 3) HTTP は GET /order/{uid} を cache → store → バックフィルで応答
//! 4) 入口は rate limiter → circuit breaker で保護
//! 5) SIGINT/SIGTERM で drain → cancel → 期限付き停止
//!
//! ## 起動方法
//! ```bash
//! HTTP_PORT=8082 cargo run --release -p order-service
//! ```
//!
//! ## 環境変数
//! - `DB_*` / `KAFKA_*` / `HTTP_*` / `CACHE_*` / `RETRY_*` / `DLQ_*`
//!   / `CB_*` / `RATE_LIMIT_*`: config.rs を参照
//! - `RUST_LOG`: ログレベル（デフォルト: info）

mod breaker;
mod config;
mod consumer;
mod dlq;
mod error;
mod lifecycle;
mod order;
mod ratelimit;
mod retry;
mod server;
mod store;
mod validator;

use std::sync::Arc;

use order_core::{LatencyHistogram, TtlCache};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use breaker::CircuitBreaker;
use consumer::{ConsumerStats, MessageProcessor, OrderConsumer};
use dlq::{DlqProcessor, DlqPublisher, LogOnlyReprocessor};
use lifecycle::{
    CacheSweeper, ConsumerService, DlqProcessorService, HttpService, LifecycleManager,
    LimiterSweeper, Service,
};
use ratelimit::RateLimiter;
use retry::RetryExecutor;
use server::http::AppState;
use store::postgres::PgOrderStore;
use store::OrderRepository;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ロギング初期化
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,order_service=debug".into()),
        )
        .init();

    // 設定読み込み。矛盾した値は起動前に落とす（非0終了）。
    let config = config::Config::from_env();
    config.validate()?;
    info!(
        db_host = %config.database.host,
        kafka_brokers = ?config.kafka.brokers,
        http_port = config.http.port,
        cache_max_size = config.cache.max_size,
        "configuration loaded"
    );

    // ストア接続（プールは遅延接続）
    let repository = Arc::new(PgOrderStore::connect(&config.database)?);
    info!("store pool initialized");

    // キャッシュ初期化とウォームロード。
    // 読み込み失敗/期限超過は空キャッシュで進む（起動は落とさない）。
    let cache = Arc::new(TtlCache::new(config.cache.max_size, config.cache.ttl));
    match tokio::time::timeout(config.lifecycle.db_load_timeout, repository.load_all()).await {
        Ok(Ok(orders)) => {
            let loaded = orders.len();
            cache.load_all(orders);
            info!(loaded, "cache warm-loaded from store");
        }
        Ok(Err(err)) => {
            warn!(error = %err, "warm load failed, starting with empty cache");
        }
        Err(_) => {
            warn!(
                timeout_sec = config.lifecycle.db_load_timeout.as_secs(),
                "warm load timed out, starting with empty cache"
            );
        }
    }

    // 保護部品と DLQ
    let circuit_breaker = Arc::new(CircuitBreaker::new(config.breaker.clone()));
    let rate_limiter = Arc::new(RateLimiter::from_config(&config.ratelimit));
    let dlq_publisher = Arc::new(DlqPublisher::new(&config.dlq, &config.kafka.brokers)?);
    info!(enabled = dlq_publisher.is_enabled(), "dlq publisher initialized");

    // consumer パイプライン
    let consumer_stats = Arc::new(ConsumerStats::default());
    let processor = MessageProcessor::new(
        Arc::clone(&repository) as Arc<dyn OrderRepository>,
        Arc::clone(&cache),
        RetryExecutor::new(config.retry.clone()),
        Arc::clone(&dlq_publisher) as Arc<dyn dlq::DeadLetterSink>,
        config.validation.clone(),
        Arc::clone(&consumer_stats),
    );
    let order_consumer = Arc::new(OrderConsumer::new(&config.kafka, processor)?);
    info!(
        topic = %config.kafka.topic,
        group_id = %config.kafka.group_id,
        "kafka consumer initialized"
    );

    let state = AppState {
        cache: Arc::clone(&cache),
        repository: Arc::clone(&repository) as Arc<dyn OrderRepository>,
        breaker: Arc::clone(&circuit_breaker),
        limiter: Arc::clone(&rate_limiter),
        consumer_stats,
        dlq: Arc::clone(&dlq_publisher),
        read_hist: Arc::new(LatencyHistogram::new()),
    };

    // ライフサイクル登録。起動は並列、停止は token 取り消し後に期限付き合流。
    let mut manager = LifecycleManager::new(CancellationToken::new());
    manager.register(Arc::new(CacheSweeper::new(
        Arc::clone(&cache),
        config.cache.cleanup_interval,
    )) as Arc<dyn Service>);
    manager.register(Arc::new(LimiterSweeper::new(
        Arc::clone(&rate_limiter),
        config.ratelimit.window * 2,
    )) as Arc<dyn Service>);
    manager.register(Arc::new(ConsumerService::new(order_consumer)) as Arc<dyn Service>);
    if config.dlq.enabled {
        let processor = DlqProcessor::new(
            &config.dlq,
            &config.kafka.brokers,
            Box::new(LogOnlyReprocessor),
        )?;
        manager.register(Arc::new(DlqProcessorService::new(Arc::new(processor))) as Arc<dyn Service>);
    }
    manager.register(Arc::new(HttpService::new(config.http.clone(), state)) as Arc<dyn Service>);

    manager.start_all().await?;
    info!("order service started");

    shutdown_signal().await;
    info!("shutdown signal received, starting graceful shutdown");

    if let Err(err) = manager
        .stop_all(config.lifecycle.graceful_shutdown_timeout)
        .await
    {
        warn!(error = %err, "graceful shutdown incomplete, waiting briefly before exit");
        tokio::time::sleep(config.lifecycle.shutdown_wait_timeout).await;
    }

    // 常駐タスクが全て合流した後にプールを閉じる
    repository.pool().close();
    info!("order service stopped");
    Ok(())
}

/// SIGINT / SIGTERM のどちらかを待つ
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
