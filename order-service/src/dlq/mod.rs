//! Dead letter queue (publisher + processor).
//!
//! Poisoned messages leave the main pipeline wrapped in an envelope that
//! keeps the original bytes, the failure reason and a retry counter.
//! When the DLQ is disabled by configuration the publisher degrades to a
//! log-and-drop no-op so the consumer never blocks on it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{ClientConfig, Message};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::DlqConfig;
use crate::error::AppError;

/// DLQ topic envelope. `original_message` is base64 on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqEnvelope {
    #[serde(with = "base64_bytes")]
    pub original_message: Vec<u8>,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
    pub retry_count: u32,
}

mod base64_bytes {
    use super::{Engine, BASE64};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Capability boundary so the consumer pipeline can swap a test double.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn publish(&self, original: &[u8], reason: &str) -> Result<(), AppError>;
}

#[derive(Default)]
struct PublisherStats {
    published: AtomicU64,
    dropped: AtomicU64,
    errors: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub struct DlqPublisherMetrics {
    pub enabled: bool,
    pub published: u64,
    pub dropped: u64,
    pub errors: u64,
}

pub struct DlqPublisher {
    enabled: bool,
    topic: String,
    producer: Option<FutureProducer>,
    stats: PublisherStats,
}

impl DlqPublisher {
    pub fn new(config: &DlqConfig, brokers: &[String]) -> Result<Self, AppError> {
        let producer = if config.enabled {
            let producer: FutureProducer = ClientConfig::new()
                .set("bootstrap.servers", brokers.join(","))
                .set("acks", "all")
                .set("enable.idempotence", "true")
                .set("linger.ms", "5")
                .create()
                .map_err(|e| AppError::broker("create dlq producer", e))?;
            Some(producer)
        } else {
            None
        };

        Ok(Self {
            enabled: config.enabled,
            topic: config.topic.clone(),
            producer,
            stats: PublisherStats::default(),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn metrics(&self) -> DlqPublisherMetrics {
        DlqPublisherMetrics {
            enabled: self.enabled,
            published: self.stats.published.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            errors: self.stats.errors.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl DeadLetterSink for DlqPublisher {
    async fn publish(&self, original: &[u8], reason: &str) -> Result<(), AppError> {
        let Some(producer) = &self.producer else {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            info!(reason, size = original.len(), "dlq disabled, message dropped");
            return Ok(());
        };

        let envelope = DlqEnvelope {
            original_message: original.to_vec(),
            reason: reason.to_string(),
            timestamp: Utc::now(),
            retry_count: 0,
        };
        let payload = serde_json::to_vec(&envelope)
            .map_err(|e| AppError::broker("encode dlq envelope", e))?;

        match producer
            .send(
                FutureRecord::<(), _>::to(&self.topic).payload(&payload),
                Duration::from_secs(5),
            )
            .await
        {
            Ok(_) => {
                self.stats.published.fetch_add(1, Ordering::Relaxed);
                info!(reason, size = original.len(), "message sent to dlq");
                Ok(())
            }
            Err((err, _)) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                Err(AppError::Dlq {
                    context: format!("publish to {}", self.topic),
                    source: Some(Box::new(err)),
                })
            }
        }
    }
}

/// Hand-off for envelopes that still have retry budget. Opaque to the rest
/// of the pipeline; the default implementation only logs.
#[async_trait]
pub trait Reprocess: Send + Sync {
    async fn reprocess(&self, original: &[u8]) -> Result<(), AppError>;
}

pub struct LogOnlyReprocessor;

#[async_trait]
impl Reprocess for LogOnlyReprocessor {
    async fn reprocess(&self, original: &[u8]) -> Result<(), AppError> {
        info!(size = original.len(), "dlq reprocess requested (log only)");
        Ok(())
    }
}

// Processor counters, exposed on /metrics like the publisher ones.
static DLQ_ENVELOPES_READ: AtomicU64 = AtomicU64::new(0);
static DLQ_ENVELOPES_RETRIED: AtomicU64 = AtomicU64::new(0);
static DLQ_ENVELOPES_DROPPED: AtomicU64 = AtomicU64::new(0);
static DLQ_DECODE_ERRORS: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy)]
pub struct DlqProcessorMetrics {
    pub envelopes_read: u64,
    pub envelopes_retried: u64,
    pub envelopes_dropped: u64,
    pub decode_errors: u64,
}

pub fn processor_metrics() -> DlqProcessorMetrics {
    DlqProcessorMetrics {
        envelopes_read: DLQ_ENVELOPES_READ.load(Ordering::Relaxed),
        envelopes_retried: DLQ_ENVELOPES_RETRIED.load(Ordering::Relaxed),
        envelopes_dropped: DLQ_ENVELOPES_DROPPED.load(Ordering::Relaxed),
        decode_errors: DLQ_DECODE_ERRORS.load(Ordering::Relaxed),
    }
}

/// Reads the DLQ topic with its own consumer group, bumps the retry counter
/// and either drops terminally or hands the payload to the reprocessor.
pub struct DlqProcessor {
    consumer: StreamConsumer,
    max_retries: u32,
    reprocessor: Box<dyn Reprocess>,
}

impl DlqProcessor {
    pub fn new(
        config: &DlqConfig,
        brokers: &[String],
        reprocessor: Box<dyn Reprocess>,
    ) -> Result<Self, AppError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", brokers.join(","))
            .set("group.id", "dlq-processor")
            .set("auto.offset.reset", "earliest")
            .set("enable.auto.commit", "true")
            .create()
            .map_err(|e| AppError::broker("create dlq consumer", e))?;
        consumer
            .subscribe(&[config.topic.as_str()])
            .map_err(|e| AppError::broker("subscribe dlq topic", e))?;

        Ok(Self {
            consumer,
            max_retries: config.max_retries,
            reprocessor,
        })
    }

    pub async fn run(&self, token: CancellationToken) {
        info!("dlq processor started");
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("dlq processor stopping");
                    return;
                }
                received = self.consumer.recv() => {
                    match received {
                        Ok(message) => {
                            let payload = message.payload().unwrap_or_default();
                            self.handle_envelope(payload).await;
                        }
                        Err(err) => {
                            // Broker hiccups are survivable; log and keep reading.
                            error!(error = %err, "dlq read error");
                        }
                    }
                }
            }
        }
    }

    async fn handle_envelope(&self, payload: &[u8]) {
        DLQ_ENVELOPES_READ.fetch_add(1, Ordering::Relaxed);
        let mut envelope: DlqEnvelope = match serde_json::from_slice(payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                DLQ_DECODE_ERRORS.fetch_add(1, Ordering::Relaxed);
                warn!(error = %err, "dlq envelope decode failed, skipping");
                return;
            }
        };

        envelope.retry_count += 1;
        if envelope.retry_count > self.max_retries {
            DLQ_ENVELOPES_DROPPED.fetch_add(1, Ordering::Relaxed);
            warn!(
                reason = %envelope.reason,
                retry_count = envelope.retry_count,
                max_retries = self.max_retries,
                "dlq message exceeded max retries, dropping"
            );
            return;
        }

        DLQ_ENVELOPES_RETRIED.fetch_add(1, Ordering::Relaxed);
        info!(
            reason = %envelope.reason,
            attempt = envelope.retry_count,
            max_retries = self.max_retries,
            "retrying dlq message"
        );
        if let Err(err) = self.reprocessor.reprocess(&envelope.original_message).await {
            error!(error = %err, "dlq reprocess failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_roundtrips_through_json() {
        let envelope = DlqEnvelope {
            original_message: b"{\"order_uid\":\"x\"}".to_vec(),
            reason: "order validation failed: payment: amount must be positive".into(),
            timestamp: Utc::now(),
            retry_count: 2,
        };
        let encoded = serde_json::to_vec(&envelope).unwrap();
        let decoded: DlqEnvelope = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(envelope, decoded);
    }

    #[test]
    fn original_message_is_base64_on_the_wire() {
        let envelope = DlqEnvelope {
            original_message: vec![0xde, 0xad, 0xbe, 0xef],
            reason: "r".into(),
            timestamp: Utc::now(),
            retry_count: 0,
        };
        let value: serde_json::Value =
            serde_json::from_slice(&serde_json::to_vec(&envelope).unwrap()).unwrap();
        assert_eq!(value["original_message"], "3q2+7w==");
    }

    #[tokio::test]
    async fn disabled_publisher_drops_and_counts() {
        let publisher = DlqPublisher::new(
            &DlqConfig {
                enabled: false,
                topic: "orders-dlq".into(),
                max_retries: 3,
            },
            &["localhost:9092".into()],
        )
        .unwrap();

        publisher.publish(b"payload", "some reason").await.unwrap();
        let metrics = publisher.metrics();
        assert!(!metrics.enabled);
        assert_eq!(metrics.dropped, 1);
        assert_eq!(metrics.published, 0);
    }
}
