//! サービスライフサイクル管理
//!
//! 常駐タスク（consumer / DLQ processor / HTTP / 掃除役）を Service として
//! 登録し、並列に起動・停止する。
//! - start_all: 全サービスを並列起動し、最初のエラーを返す
//! - stop_all: 共有トークンを取り消してから各 stop を期限付きで待つ。
//!   期限超過はログして先へ進む（プロセス終了を塞がない）
//!
//! 依存の生成順は呼び出し側（main）の責務。ここは起動・停止の束ねだけ。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use order_core::TtlCache;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::consumer::OrderConsumer;
use crate::dlq::DlqProcessor;
use crate::error::AppError;
use crate::order::Order;
use crate::ratelimit::RateLimiter;

#[async_trait]
pub trait Service: Send + Sync {
    fn name(&self) -> &'static str;

    /// 常駐タスクを起動する。起動できたら速やかに戻ること。
    async fn start(&self, token: CancellationToken) -> Result<(), AppError>;

    /// タスクの完了を待つ。呼び出し前に共有トークンは取り消されている。
    async fn stop(&self) -> Result<(), AppError>;
}

pub struct LifecycleManager {
    services: Vec<Arc<dyn Service>>,
    token: CancellationToken,
}

impl LifecycleManager {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            services: Vec::new(),
            token,
        }
    }

    pub fn register(&mut self, service: Arc<dyn Service>) {
        self.services.push(service);
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 全サービスを並列起動する。最初のエラーを返す（他は起動続行）。
    pub async fn start_all(&self) -> Result<(), AppError> {
        let results = futures::future::join_all(self.services.iter().map(|service| {
            let token = self.token.clone();
            async move {
                info!(service = service.name(), "starting service");
                let result = service.start(token).await;
                if let Err(ref err) = result {
                    error!(service = service.name(), error = %err, "service failed to start");
                }
                result
            }
        }))
        .await;

        results.into_iter().find(Result::is_err).unwrap_or(Ok(()))
    }

    /// 取り消しを送り、各サービスの停止を deadline まで待つ。
    /// 最初に観測したエラーを返す。
    pub async fn stop_all(&self, deadline: Duration) -> Result<(), AppError> {
        self.token.cancel();

        let results = futures::future::join_all(self.services.iter().map(|service| async move {
            match tokio::time::timeout(deadline, service.stop()).await {
                Ok(Ok(())) => {
                    info!(service = service.name(), "service stopped");
                    Ok(())
                }
                Ok(Err(err)) => {
                    error!(service = service.name(), error = %err, "service stop failed");
                    Err(err)
                }
                Err(_) => {
                    warn!(service = service.name(), "service stop exceeded deadline");
                    Err(AppError::Timeout {
                        context: format!("stop {}", service.name()),
                    })
                }
            }
        }))
        .await;

        results.into_iter().find(Result::is_err).unwrap_or(Ok(()))
    }
}

/// JoinHandle を保持して stop で合流する共通部品
struct TaskSlot {
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TaskSlot {
    fn new() -> Self {
        Self {
            handle: Mutex::new(None),
        }
    }

    async fn put(&self, handle: JoinHandle<()>) {
        *self.handle.lock().await = Some(handle);
    }

    async fn join(&self, name: &str) -> Result<(), AppError> {
        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            handle
                .await
                .map_err(|e| AppError::internal(format!("{name} task panicked: {e}")))?;
        }
        Ok(())
    }
}

/// キャッシュの定期掃除役
pub struct CacheSweeper {
    cache: Arc<TtlCache<Order>>,
    interval: Duration,
    slot: TaskSlot,
}

impl CacheSweeper {
    pub fn new(cache: Arc<TtlCache<Order>>, interval: Duration) -> Self {
        Self {
            cache,
            interval,
            slot: TaskSlot::new(),
        }
    }
}

#[async_trait]
impl Service for CacheSweeper {
    fn name(&self) -> &'static str {
        "cache-sweeper"
    }

    async fn start(&self, token: CancellationToken) -> Result<(), AppError> {
        let cache = Arc::clone(&self.cache);
        let interval = self.interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // 起動直後の即時 tick は捨てる
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = ticker.tick() => {
                        let removed = cache.purge_expired();
                        if removed > 0 {
                            debug!(removed, "cache sweep removed expired entries");
                        }
                    }
                }
            }
        });
        self.slot.put(handle).await;
        Ok(())
    }

    async fn stop(&self) -> Result<(), AppError> {
        self.slot.join(self.name()).await
    }
}

/// レート制限キーの掃除役（2 window 無通信のキーを回収）
pub struct LimiterSweeper {
    limiter: Arc<RateLimiter>,
    interval: Duration,
    slot: TaskSlot,
}

impl LimiterSweeper {
    pub fn new(limiter: Arc<RateLimiter>, interval: Duration) -> Self {
        Self {
            limiter,
            interval,
            slot: TaskSlot::new(),
        }
    }
}

#[async_trait]
impl Service for LimiterSweeper {
    fn name(&self) -> &'static str {
        "ratelimit-sweeper"
    }

    async fn start(&self, token: CancellationToken) -> Result<(), AppError> {
        let limiter = Arc::clone(&self.limiter);
        let interval = self.interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = ticker.tick() => {
                        let removed = limiter.sweep_idle();
                        if removed > 0 {
                            debug!(removed, "rate limiter sweep removed idle keys");
                        }
                    }
                }
            }
        });
        self.slot.put(handle).await;
        Ok(())
    }

    async fn stop(&self) -> Result<(), AppError> {
        self.slot.join(self.name()).await
    }
}

/// Kafka consumer の常駐化
pub struct ConsumerService {
    consumer: Arc<OrderConsumer>,
    slot: TaskSlot,
}

impl ConsumerService {
    pub fn new(consumer: Arc<OrderConsumer>) -> Self {
        Self {
            consumer,
            slot: TaskSlot::new(),
        }
    }
}

#[async_trait]
impl Service for ConsumerService {
    fn name(&self) -> &'static str {
        "kafka-consumer"
    }

    async fn start(&self, token: CancellationToken) -> Result<(), AppError> {
        let consumer = Arc::clone(&self.consumer);
        let handle = tokio::spawn(async move {
            consumer.run(token).await;
        });
        self.slot.put(handle).await;
        Ok(())
    }

    async fn stop(&self) -> Result<(), AppError> {
        self.slot.join(self.name()).await
    }
}

/// DLQ processor の常駐化
pub struct DlqProcessorService {
    processor: Arc<DlqProcessor>,
    slot: TaskSlot,
}

impl DlqProcessorService {
    pub fn new(processor: Arc<DlqProcessor>) -> Self {
        Self {
            processor,
            slot: TaskSlot::new(),
        }
    }
}

#[async_trait]
impl Service for DlqProcessorService {
    fn name(&self) -> &'static str {
        "dlq-processor"
    }

    async fn start(&self, token: CancellationToken) -> Result<(), AppError> {
        let processor = Arc::clone(&self.processor);
        let handle = tokio::spawn(async move {
            processor.run(token).await;
        });
        self.slot.put(handle).await;
        Ok(())
    }

    async fn stop(&self) -> Result<(), AppError> {
        self.slot.join(self.name()).await
    }
}

/// HTTP サーバーの常駐化。bind は start 内で行い、失敗は起動エラーとして返す。
pub struct HttpService {
    config: crate::config::HttpConfig,
    state: crate::server::http::AppState,
    slot: TaskSlot,
}

impl HttpService {
    pub fn new(config: crate::config::HttpConfig, state: crate::server::http::AppState) -> Self {
        Self {
            config,
            state,
            slot: TaskSlot::new(),
        }
    }
}

#[async_trait]
impl Service for HttpService {
    fn name(&self) -> &'static str {
        "http-server"
    }

    async fn start(&self, token: CancellationToken) -> Result<(), AppError> {
        let listener = crate::server::http::bind(&self.config).await?;
        let config = self.config.clone();
        let state = self.state.clone();
        let handle = tokio::spawn(async move {
            if let Err(err) = crate::server::http::serve(listener, &config, state, token).await {
                error!(error = %err, "http server exited with error");
            }
        });
        self.slot.put(handle).await;
        Ok(())
    }

    async fn stop(&self) -> Result<(), AppError> {
        self.slot.join(self.name()).await
    }
}
