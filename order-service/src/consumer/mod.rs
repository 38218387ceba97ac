//! Kafka consumer worker
//!
//! orders トピックを group 購読し、1メッセージずつ
//! decode → validate → persist → cache の順で処理する。
//! 処理全体は RetryExecutor に包まれ、使い切ったら DLQ へ退避する。
//! DLQ 退避の成否に関わらずメッセージは ack する（処理対象からは外れた）。
//!
//! メッセージ間の順序保証は仮定しない。store の upsert と cache の
//! キー単位ロックにより重複配信は安全。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use order_core::TtlCache;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::{ClientConfig, Message};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{KafkaConfig, ValidationLimits};
use crate::dlq::DeadLetterSink;
use crate::error::AppError;
use crate::order::Order;
use crate::retry::RetryExecutor;
use crate::store::OrderRepository;
use crate::validator;

/// /metrics へ出す処理カウンタ
#[derive(Default)]
pub struct ConsumerStats {
    pub processed: AtomicU64,
    pub failed: AtomicU64,
    pub dead_lettered: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub struct ConsumerMetrics {
    pub processed: u64,
    pub failed: u64,
    pub dead_lettered: u64,
}

impl ConsumerStats {
    pub fn snapshot(&self) -> ConsumerMetrics {
        ConsumerMetrics {
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }
}

/// 1メッセージ分の処理系。broker から切り離してあるのでテストしやすい。
pub struct MessageProcessor {
    repository: Arc<dyn OrderRepository>,
    cache: Arc<TtlCache<Order>>,
    retry: RetryExecutor,
    dlq: Arc<dyn DeadLetterSink>,
    limits: ValidationLimits,
    stats: Arc<ConsumerStats>,
}

impl MessageProcessor {
    pub fn new(
        repository: Arc<dyn OrderRepository>,
        cache: Arc<TtlCache<Order>>,
        retry: RetryExecutor,
        dlq: Arc<dyn DeadLetterSink>,
        limits: ValidationLimits,
        stats: Arc<ConsumerStats>,
    ) -> Self {
        Self {
            repository,
            cache,
            retry,
            dlq,
            limits,
            stats,
        }
    }

    /// メッセージを処理し、ack してよいかを返す。
    /// 取り消しで中断した場合だけ false（未処理のまま再配信させる）。
    pub async fn handle(&self, payload: &[u8], token: &CancellationToken) -> bool {
        let result = self
            .retry
            .execute(token, || self.process(payload))
            .await;

        match result {
            Ok(uid) => {
                self.stats.processed.fetch_add(1, Ordering::Relaxed);
                info!(order_uid = %uid, "order persisted and cached");
                true
            }
            Err(AppError::Cancelled { .. }) => false,
            Err(err) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                error!(error = %err, "message processing failed, deflecting to dlq");
                match self.dlq.publish(payload, &err.to_string()).await {
                    Ok(()) => {
                        self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(dlq_err) => {
                        // DLQ 失敗は元エラーを覆い隠さない。記録して先へ進む。
                        error!(error = %dlq_err, "dlq publish failed, message lost");
                    }
                }
                true
            }
        }
    }

    async fn process(&self, payload: &[u8]) -> Result<String, AppError> {
        let order: Order = serde_json::from_slice(payload).map_err(AppError::Parse)?;
        validator::validate(&order, &self.limits)?;
        self.repository.save(&order).await?;
        let uid = order.order_uid.clone();
        self.cache.set(order);
        Ok(uid)
    }
}

/// broker 購読ループ
pub struct OrderConsumer {
    consumer: StreamConsumer,
    processor: MessageProcessor,
    auto_commit: bool,
}

impl OrderConsumer {
    pub fn new(config: &KafkaConfig, processor: MessageProcessor) -> Result<Self, AppError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", config.brokers.join(","))
            .set("group.id", &config.group_id)
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set(
                "enable.auto.commit",
                if config.enable_auto_commit { "true" } else { "false" },
            )
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            .create()
            .map_err(|e| AppError::broker("create consumer", e))?;
        consumer
            .subscribe(&[config.topic.as_str()])
            .map_err(|e| AppError::broker("subscribe topic", e))?;

        Ok(Self {
            consumer,
            processor,
            auto_commit: config.enable_auto_commit,
        })
    }

    /// 取り消しが来るまでメッセージを読み続ける。
    /// 単発の失敗ではループを抜けない。
    pub async fn run(&self, token: CancellationToken) {
        info!("kafka consumer started");
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("kafka consumer stopping");
                    return;
                }
                received = self.consumer.recv() => {
                    match received {
                        Ok(message) => {
                            let payload = message.payload().unwrap_or_default();
                            let ack = self.processor.handle(payload, &token).await;
                            if ack && !self.auto_commit {
                                if let Err(err) =
                                    self.consumer.commit_message(&message, CommitMode::Async)
                                {
                                    warn!(error = %err, "offset commit failed");
                                }
                            }
                        }
                        Err(err) => {
                            // 読み取りエラーはログして継続（ブローカー再接続は rdkafka 任せ）
                            error!(error = %err, "kafka read error");
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::store::memory::MemoryOrderStore;
    use std::sync::Mutex;
    use std::time::Duration;

    const FIXTURE: &str = include_str!("../../testdata/order_v1.json");

    /// DLQ 退避を捕捉するテストダブル
    #[derive(Default)]
    struct CapturingSink {
        published: Mutex<Vec<(Vec<u8>, String)>>,
    }

    #[async_trait::async_trait]
    impl DeadLetterSink for CapturingSink {
        async fn publish(&self, original: &[u8], reason: &str) -> Result<(), AppError> {
            self.published
                .lock()
                .unwrap()
                .push((original.to_vec(), reason.to_string()));
            Ok(())
        }
    }

    fn recent_order_json() -> String {
        let mut order: Order = serde_json::from_str(FIXTURE).unwrap();
        order.date_created = chrono::Utc::now() - chrono::Duration::hours(1);
        serde_json::to_string(&order).unwrap()
    }

    fn processor(
        store: Arc<MemoryOrderStore>,
        sink: Arc<CapturingSink>,
        max_attempts: u32,
    ) -> (MessageProcessor, Arc<TtlCache<Order>>, Arc<ConsumerStats>) {
        let cache = Arc::new(TtlCache::new(100, Duration::from_secs(60)));
        let stats = Arc::new(ConsumerStats::default());
        let processor = MessageProcessor::new(
            store,
            Arc::clone(&cache),
            RetryExecutor::new(RetryConfig {
                max_attempts,
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(100),
                multiplier: 2.0,
            }),
            sink,
            ValidationLimits::default(),
            Arc::clone(&stats),
        );
        (processor, cache, stats)
    }

    #[tokio::test(start_paused = true)]
    async fn happy_path_persists_caches_and_acks() {
        let store = Arc::new(MemoryOrderStore::new());
        let sink = Arc::new(CapturingSink::default());
        let (processor, cache, stats) = processor(Arc::clone(&store), Arc::clone(&sink), 3);
        let token = CancellationToken::new();

        let ack = processor
            .handle(recent_order_json().as_bytes(), &token)
            .await;

        assert!(ack);
        assert!(store.contains("b563feb7b2b84b6test"));
        assert!(cache.get("b563feb7b2b84b6test").is_some());
        assert_eq!(stats.snapshot().processed, 1);
        assert!(sink.published.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_order_goes_to_dlq_without_store_write() {
        let store = Arc::new(MemoryOrderStore::new());
        let sink = Arc::new(CapturingSink::default());
        let (processor, cache, stats) = processor(Arc::clone(&store), Arc::clone(&sink), 3);
        let token = CancellationToken::new();

        // 金額分解の不変条件を壊す
        let mut order: Order = serde_json::from_str(FIXTURE).unwrap();
        order.date_created = chrono::Utc::now() - chrono::Duration::hours(1);
        order.payment.delivery_cost = 9_999;
        let payload = serde_json::to_vec(&order).unwrap();

        let ack = processor.handle(&payload, &token).await;

        assert!(ack, "poisoned message must still be acked");
        assert!(!store.contains("b563feb7b2b84b6test"));
        assert!(cache.get("b563feb7b2b84b6test").is_none());
        assert_eq!(store.save_calls.load(Ordering::SeqCst), 0);

        let published = sink.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert!(published[0].1.contains("goods_total + delivery_cost"));
        assert_eq!(stats.snapshot().dead_lettered, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unparsable_payload_short_circuits_retry() {
        let store = Arc::new(MemoryOrderStore::new());
        let sink = Arc::new(CapturingSink::default());
        let (processor, _, stats) = processor(Arc::clone(&store), Arc::clone(&sink), 5);
        let token = CancellationToken::new();

        let ack = processor.handle(b"{not json", &token).await;

        assert!(ack);
        assert_eq!(stats.snapshot().failed, 1);
        assert_eq!(sink.published.lock().unwrap().len(), 1);
        assert_eq!(store.save_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_store_failure_is_retried_to_exhaustion() {
        let store = Arc::new(MemoryOrderStore::new());
        store.fail_writes.store(true, Ordering::SeqCst);
        let sink = Arc::new(CapturingSink::default());
        let (processor, _, stats) = processor(Arc::clone(&store), Arc::clone(&sink), 3);
        let token = CancellationToken::new();

        let ack = processor
            .handle(recent_order_json().as_bytes(), &token)
            .await;

        assert!(ack);
        // 3回試してから DLQ
        assert_eq!(store.save_calls.load(Ordering::SeqCst), 3);
        assert_eq!(stats.snapshot().dead_lettered, 1);
        let published = sink.published.lock().unwrap();
        assert!(published[0].1.contains("after 3 attempts"));
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_delivery_is_idempotent() {
        let store = Arc::new(MemoryOrderStore::new());
        let sink = Arc::new(CapturingSink::default());
        let (processor, cache, stats) = processor(Arc::clone(&store), Arc::clone(&sink), 3);
        let token = CancellationToken::new();
        let payload = recent_order_json();

        assert!(processor.handle(payload.as_bytes(), &token).await);
        assert!(processor.handle(payload.as_bytes(), &token).await);

        assert_eq!(stats.snapshot().processed, 2);
        assert!(store.contains("b563feb7b2b84b6test"));
        assert!(cache.get("b563feb7b2b84b6test").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_leaves_message_unacked() {
        let store = Arc::new(MemoryOrderStore::new());
        let sink = Arc::new(CapturingSink::default());
        let (processor, _, stats) = processor(Arc::clone(&store), Arc::clone(&sink), 3);
        let token = CancellationToken::new();
        token.cancel();

        let ack = processor
            .handle(recent_order_json().as_bytes(), &token)
            .await;

        assert!(!ack, "cancelled processing must not ack");
        assert_eq!(stats.snapshot().failed, 0);
        assert!(sink.published.lock().unwrap().is_empty());
    }
}
