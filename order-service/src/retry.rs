//! 指数バックオフ付き再試行
//!
//! k 回目の試行前の待ち時間は min(initial_delay * multiplier^(k-1), max_delay)。
//! 待ちの途中で取り消しが来たら次の試行に入らず即座に戻る。
//! is_permanent なエラー（デコード不能・検証失敗など）は待たずに打ち切る。

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::RetryConfig;
use crate::error::AppError;

pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// op を最大 max_attempts 回まで実行する。
    ///
    /// 使い切った場合は最後のエラーを試行回数付きで包んで返す。
    pub async fn execute<T, F, Fut>(
        &self,
        token: &CancellationToken,
        mut op: F,
    ) -> Result<T, AppError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let max_attempts = self.config.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            if token.is_cancelled() {
                return Err(AppError::Cancelled {
                    context: "retry".into(),
                });
            }

            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_permanent() => return Err(err),
                Err(err) => {
                    if attempt == max_attempts {
                        return Err(AppError::Retry {
                            attempts: max_attempts,
                            source: Box::new(err),
                        });
                    }
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "operation failed, backing off before retry"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = token.cancelled() => {
                            return Err(AppError::Cancelled {
                                context: "retry backoff".into(),
                            });
                        }
                    }
                }
            }
        }

        // max_attempts >= 1 なのでループは必ず return する
        unreachable!("retry loop exited without returning")
    }

    /// attempt 回目の失敗後に挟む待ち時間
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = self.config.multiplier.powi(attempt.saturating_sub(1) as i32);
        let delay = self.config.initial_delay.as_millis() as f64 * factor;
        let capped = delay.min(self.config.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(10_000),
            multiplier: 2.0,
        }
    }

    fn transient() -> AppError {
        AppError::Database {
            context: "save".into(),
            source: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_first_try_without_sleeping() {
        let executor = RetryExecutor::new(config(3));
        let token = CancellationToken::new();
        let started = tokio::time::Instant::now();

        let result: Result<u32, _> = executor.execute(&token, || async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_until_success() {
        let executor = RetryExecutor::new(config(5));
        let token = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let calls_op = Arc::clone(&calls);
        let result = executor
            .execute(&token, move || {
                let calls = Arc::clone(&calls_op);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(transient())
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn sleeps_exponential_backoff_sequence() {
        let executor = RetryExecutor::new(config(3));
        let token = CancellationToken::new();
        let started = tokio::time::Instant::now();

        let result: Result<(), _> = executor
            .execute(&token, || async { Err::<(), _>(transient()) })
            .await;

        // 100ms + 200ms の2回だけ待つ（3回目の失敗後は待たない）
        assert_eq!(started.elapsed(), Duration::from_millis(300));
        match result.unwrap_err() {
            AppError::Retry { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn delay_is_capped_at_max() {
        let executor = RetryExecutor::new(RetryConfig {
            max_attempts: 4,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(150),
            multiplier: 10.0,
        });
        let token = CancellationToken::new();
        let started = tokio::time::Instant::now();

        let _ = executor
            .execute(&token, || async { Err::<(), _>(transient()) })
            .await;

        // 100 + 150 + 150
        assert_eq!(started.elapsed(), Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_error_short_circuits() {
        let executor = RetryExecutor::new(config(5));
        let token = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let calls_op = Arc::clone(&calls);
        let result: Result<(), _> = executor
            .execute(&token, move || {
                let calls = Arc::clone(&calls_op);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(AppError::Validation {
                        fields: vec!["order_uid is required".into()],
                    })
                }
            })
            .await;

        assert!(matches!(result.unwrap_err(), AppError::Validation { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_backoff_stops_retrying() {
        let executor = RetryExecutor::new(config(5));
        let token = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let calls_op = Arc::clone(&calls);
        let result: Result<(), _> = executor
            .execute(&token, move || {
                let calls = Arc::clone(&calls_op);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(transient())
                }
            })
            .await;

        assert!(matches!(result.unwrap_err(), AppError::Cancelled { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pre_cancelled_token_runs_nothing() {
        let executor = RetryExecutor::new(config(3));
        let token = CancellationToken::new();
        token.cancel();

        let result: Result<(), _> = executor
            .execute(&token, || async { panic!("must not run") })
            .await;
        assert!(matches!(result.unwrap_err(), AppError::Cancelled { .. }));
    }
}
