//! 設定管理
//!
//! 全設定を環境変数から読み込む。`.env` があれば先に取り込む（無くても可）。
//! 粗い時間は `*_SEC`、細かい時間は `*_MS` の接尾辞で受ける。
//! 起動時に `validate()` を通し、矛盾した値はプロセスを落とす
//! （終了コード非0）。既定値はローカル開発でそのまま動く値。

use std::env;
use std::time::Duration;

use thiserror::Error;

/// 設定値の検証エラー。全件をまとめて報告する。
#[derive(Debug, Error)]
#[error("invalid configuration: {}", problems.join("; "))]
pub struct ConfigError {
    pub problems: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub kafka: KafkaConfig,
    pub http: HttpConfig,
    pub cache: CacheConfig,
    pub retry: RetryConfig,
    pub dlq: DlqConfig,
    pub breaker: BreakerConfig,
    pub ratelimit: RateLimitConfig,
    pub lifecycle: LifecycleConfig,
    pub validation: ValidationLimits,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub name: String,
    pub sslmode: String,
    pub max_open_conns: usize,
    pub max_idle_conns: usize,
    pub conn_max_lifetime: Duration,
    /// ストア呼び出し1回あたりの期限
    pub query_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct KafkaConfig {
    pub brokers: Vec<String>,
    pub topic: String,
    pub group_id: String,
    pub auto_offset_reset: String,
    pub enable_auto_commit: bool,
    pub session_timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub port: u16,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub idle_timeout: Duration,
    /// 静的配信のルートディレクトリ
    pub static_dir: String,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub max_size: usize,
    pub ttl: Duration,
    pub cleanup_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

#[derive(Debug, Clone)]
pub struct DlqConfig {
    pub enabled: bool,
    pub topic: String,
    pub max_retries: u32,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout: Duration,
    pub max_requests: u32,
}

/// レート制限のアルゴリズム選択
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitAlgorithm {
    TokenBucket,
    FixedWindow,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub requests: u64,
    pub window: Duration,
    pub burst: u64,
    pub algorithm: RateLimitAlgorithm,
}

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub graceful_shutdown_timeout: Duration,
    pub shutdown_wait_timeout: Duration,
    pub db_load_timeout: Duration,
}

/// validator が使う上限値
#[derive(Debug, Clone)]
pub struct ValidationLimits {
    pub order_uid_min_length: usize,
    pub order_uid_max_length: usize,
    pub track_number_min_length: usize,
    pub track_number_max_length: usize,
    pub max_payment_amount: i64,
    pub max_items_per_order: usize,
    pub max_item_price: i64,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            order_uid_min_length: 10,
            order_uid_max_length: 50,
            track_number_min_length: 5,
            track_number_max_length: 20,
            max_payment_amount: 1_000_000,
            max_items_per_order: 100,
            max_item_price: 100_000,
        }
    }
}

impl Config {
    /// 環境変数から設定を読み込む。
    pub fn from_env() -> Self {
        // .env ファイルがあれば読み込む（無くてもエラーにしない）
        let _ = dotenvy::dotenv();

        Self {
            database: DatabaseConfig {
                host: env_str("DB_HOST", "127.0.0.1"),
                port: env_parse("DB_PORT", 5432),
                user: env_str("DB_USER", "orders_user"),
                password: env_str("DB_PASSWORD", "orders_pass"),
                name: env_str("DB_NAME", "orders_db"),
                sslmode: env_str("DB_SSLMODE", "disable"),
                max_open_conns: env_parse("DB_MAX_OPEN_CONNS", 25),
                max_idle_conns: env_parse("DB_MAX_IDLE_CONNS", 5),
                conn_max_lifetime: secs(env_parse("DB_CONN_MAX_LIFETIME_SEC", 300)),
                query_timeout: secs(env_parse("DB_QUERY_TIMEOUT_SEC", 5)),
            },
            kafka: KafkaConfig {
                brokers: env_str("KAFKA_BROKERS", "localhost:9092")
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
                topic: env_str("KAFKA_TOPIC", "orders"),
                group_id: env_str("KAFKA_GROUP_ID", "order-service"),
                auto_offset_reset: env_str("KAFKA_AUTO_OFFSET_RESET", "earliest"),
                enable_auto_commit: env_bool("KAFKA_ENABLE_AUTO_COMMIT", true),
                session_timeout_ms: env_parse("KAFKA_SESSION_TIMEOUT_MS", 30_000),
            },
            http: HttpConfig {
                port: env_parse("HTTP_PORT", 8082),
                read_timeout: secs(env_parse("HTTP_READ_TIMEOUT_SEC", 30)),
                write_timeout: secs(env_parse("HTTP_WRITE_TIMEOUT_SEC", 30)),
                idle_timeout: secs(env_parse("HTTP_IDLE_TIMEOUT_SEC", 60)),
                static_dir: env_str("HTTP_STATIC_DIR", "web"),
            },
            cache: CacheConfig {
                max_size: env_parse("CACHE_MAX_SIZE", 1000),
                ttl: secs(env_parse("CACHE_TTL_SEC", 3600)),
                cleanup_interval: secs(env_parse("CACHE_CLEANUP_INTERVAL_SEC", 300)),
            },
            retry: RetryConfig {
                max_attempts: env_parse("RETRY_MAX_ATTEMPTS", 3),
                initial_delay: millis(env_parse("RETRY_INITIAL_DELAY_MS", 1_000)),
                max_delay: millis(env_parse("RETRY_MAX_DELAY_MS", 30_000)),
                multiplier: env_parse("RETRY_MULTIPLIER", 2.0),
            },
            dlq: DlqConfig {
                enabled: env_bool("DLQ_ENABLED", true),
                topic: env_str("DLQ_TOPIC", "orders-dlq"),
                max_retries: env_parse("DLQ_MAX_RETRIES", 3),
            },
            breaker: BreakerConfig {
                failure_threshold: env_parse("CB_FAILURE_THRESHOLD", 5),
                success_threshold: env_parse("CB_SUCCESS_THRESHOLD", 3),
                timeout: millis(env_parse("CB_TIMEOUT_MS", 60_000)),
                max_requests: env_parse("CB_MAX_REQUESTS", 3),
            },
            ratelimit: RateLimitConfig {
                requests: env_parse("RATE_LIMIT_REQUESTS", 100),
                window: millis(env_parse("RATE_LIMIT_WINDOW_MS", 60_000)),
                // burst 未指定時は requests と同値
                burst: env_parse("RATE_LIMIT_BURST", 0),
                algorithm: match env_str("RATE_LIMIT_ALGORITHM", "token-bucket").as_str() {
                    "fixed-window" => RateLimitAlgorithm::FixedWindow,
                    _ => RateLimitAlgorithm::TokenBucket,
                },
            },
            lifecycle: LifecycleConfig {
                graceful_shutdown_timeout: secs(env_parse("GRACEFUL_SHUTDOWN_TIMEOUT_SEC", 30)),
                shutdown_wait_timeout: secs(env_parse("SHUTDOWN_WAIT_TIMEOUT_SEC", 5)),
                db_load_timeout: secs(env_parse("DB_LOAD_TIMEOUT_SEC", 10)),
            },
            validation: ValidationLimits {
                order_uid_min_length: env_parse("VALIDATION_ORDER_UID_MIN_LENGTH", 10),
                order_uid_max_length: env_parse("VALIDATION_ORDER_UID_MAX_LENGTH", 50),
                track_number_min_length: env_parse("VALIDATION_TRACK_NUMBER_MIN_LENGTH", 5),
                track_number_max_length: env_parse("VALIDATION_TRACK_NUMBER_MAX_LENGTH", 20),
                max_payment_amount: env_parse("VALIDATION_MAX_PAYMENT_AMOUNT", 1_000_000),
                max_items_per_order: env_parse("VALIDATION_MAX_ITEMS_PER_ORDER", 100),
                max_item_price: env_parse("VALIDATION_MAX_ITEM_PRICE", 100_000),
            },
        }
    }

    /// 設定値の整合性検査。問題を全件集めて返す。
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.database.host.is_empty() {
            problems.push("DB_HOST must not be empty".into());
        }
        if self.database.port == 0 {
            problems.push("DB_PORT must not be 0".into());
        }
        if self.database.max_open_conns == 0 {
            problems.push("DB_MAX_OPEN_CONNS must be positive".into());
        }
        if self.database.max_idle_conns > self.database.max_open_conns {
            problems.push("DB_MAX_IDLE_CONNS must not exceed DB_MAX_OPEN_CONNS".into());
        }
        if !matches!(
            self.database.sslmode.as_str(),
            "disable" | "prefer" | "require"
        ) {
            problems.push(format!(
                "DB_SSLMODE must be disable/prefer/require, got {:?}",
                self.database.sslmode
            ));
        }

        if self.kafka.brokers.is_empty() {
            problems.push("KAFKA_BROKERS must list at least one broker".into());
        }
        if self.kafka.topic.is_empty() {
            problems.push("KAFKA_TOPIC must not be empty".into());
        }
        if self.kafka.group_id.is_empty() {
            problems.push("KAFKA_GROUP_ID must not be empty".into());
        }
        if !matches!(
            self.kafka.auto_offset_reset.as_str(),
            "earliest" | "latest" | "none"
        ) {
            problems.push(format!(
                "KAFKA_AUTO_OFFSET_RESET must be earliest/latest/none, got {:?}",
                self.kafka.auto_offset_reset
            ));
        }

        if self.http.port == 0 {
            problems.push("HTTP_PORT must not be 0".into());
        }

        if self.cache.max_size == 0 {
            problems.push("CACHE_MAX_SIZE must be positive".into());
        }
        if self.cache.ttl.is_zero() {
            problems.push("CACHE_TTL_SEC must be positive".into());
        }
        if self.cache.cleanup_interval.is_zero() {
            problems.push("CACHE_CLEANUP_INTERVAL_SEC must be positive".into());
        }

        if self.retry.max_attempts == 0 {
            problems.push("RETRY_MAX_ATTEMPTS must be positive".into());
        }
        if self.retry.multiplier < 1.0 {
            problems.push("RETRY_MULTIPLIER must be >= 1.0".into());
        }
        if self.retry.max_delay < self.retry.initial_delay {
            problems.push("RETRY_MAX_DELAY_MS must be >= RETRY_INITIAL_DELAY_MS".into());
        }

        if self.dlq.enabled && self.dlq.topic.is_empty() {
            problems.push("DLQ_TOPIC must not be empty when DLQ_ENABLED".into());
        }

        if self.breaker.failure_threshold == 0 {
            problems.push("CB_FAILURE_THRESHOLD must be positive".into());
        }
        if self.breaker.success_threshold == 0 {
            problems.push("CB_SUCCESS_THRESHOLD must be positive".into());
        }
        if self.breaker.max_requests == 0 {
            problems.push("CB_MAX_REQUESTS must be positive".into());
        }
        if self.breaker.timeout.is_zero() {
            problems.push("CB_TIMEOUT_MS must be positive".into());
        }

        if self.ratelimit.requests == 0 {
            problems.push("RATE_LIMIT_REQUESTS must be positive".into());
        }
        if self.ratelimit.window.is_zero() {
            problems.push("RATE_LIMIT_WINDOW_MS must be positive".into());
        }

        if self.validation.order_uid_min_length > self.validation.order_uid_max_length {
            problems.push("VALIDATION_ORDER_UID_MIN_LENGTH exceeds max".into());
        }
        if self.validation.max_items_per_order == 0 {
            problems.push("VALIDATION_MAX_ITEMS_PER_ORDER must be positive".into());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError { problems })
        }
    }
}

impl RateLimitConfig {
    /// burst の実効値。未指定（0）は requests と同じ。
    pub fn effective_burst(&self) -> u64 {
        if self.burst > 0 {
            self.burst
        } else {
            self.requests
        }
    }
}

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

fn millis(n: u64) -> Duration {
    Duration::from_millis(n)
}

fn env_str(key: &str, default: &str) -> String {
    env::var(key).ok().filter(|v| !v.is_empty()).unwrap_or_else(|| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => v == "1" || v.eq_ignore_ascii_case("true"),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        // 既定値はそのまま validate を通る
        Config::from_env()
    }

    #[test]
    fn defaults_are_valid() {
        base_config().validate().expect("default config valid");
    }

    #[test]
    fn zero_cache_size_is_rejected() {
        let mut cfg = base_config();
        cfg.cache.max_size = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.problems.iter().any(|p| p.contains("CACHE_MAX_SIZE")));
    }

    #[test]
    fn retry_delays_must_be_ordered() {
        let mut cfg = base_config();
        cfg.retry.initial_delay = Duration::from_millis(5_000);
        cfg.retry.max_delay = Duration::from_millis(1_000);
        let err = cfg.validate().unwrap_err();
        assert!(err.problems.iter().any(|p| p.contains("RETRY_MAX_DELAY_MS")));
    }

    #[test]
    fn collects_all_problems() {
        let mut cfg = base_config();
        cfg.cache.max_size = 0;
        cfg.breaker.failure_threshold = 0;
        cfg.ratelimit.requests = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.problems.len() >= 3);
    }

    #[test]
    fn env_parse_falls_back_on_garbage() {
        std::env::set_var("CONFIG_TEST_BOGUS_U64", "not-a-number");
        assert_eq!(env_parse("CONFIG_TEST_BOGUS_U64", 7u64), 7);
        std::env::remove_var("CONFIG_TEST_BOGUS_U64");
    }

    #[test]
    fn env_bool_accepts_one_and_true() {
        std::env::set_var("CONFIG_TEST_BOOL_A", "1");
        std::env::set_var("CONFIG_TEST_BOOL_B", "TRUE");
        std::env::set_var("CONFIG_TEST_BOOL_C", "no");
        assert!(env_bool("CONFIG_TEST_BOOL_A", false));
        assert!(env_bool("CONFIG_TEST_BOOL_B", false));
        assert!(!env_bool("CONFIG_TEST_BOOL_C", true));
        std::env::remove_var("CONFIG_TEST_BOOL_A");
        std::env::remove_var("CONFIG_TEST_BOOL_B");
        std::env::remove_var("CONFIG_TEST_BOOL_C");
    }

    #[test]
    fn effective_burst_defaults_to_requests() {
        let mut cfg = base_config();
        cfg.ratelimit.requests = 5;
        cfg.ratelimit.burst = 0;
        assert_eq!(cfg.ratelimit.effective_burst(), 5);
        cfg.ratelimit.burst = 8;
        assert_eq!(cfg.ratelimit.effective_burst(), 8);
    }
}
