//! サーキットブレーカー
//!
//! Closed / Open / HalfOpen の3状態で下流を保護する。
//! - Closed: 通過。連続失敗が failure_threshold に達したら Open へ
//! - Open: timeout 経過まで全拒否。経過後の最初の入場で HalfOpen へ
//! - HalfOpen: 最大 max_requests 件だけ試験投入。success_threshold 回
//!   成功で Closed、1回でも失敗すれば Open へ戻る
//!
//! 入場判定と結果記録だけをロック内で行い、操作本体はロック外で走る。
//! 入場拒否（Rejected）と操作失敗（Operation）は型で区別され、
//! 呼び出し側が 503 と 5xx を振り分けられる。

pub mod middleware;

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::info;

use crate::config::BreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }
}

/// ブレーカー経由の実行結果エラー
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// 入場拒否。操作は実行されていない。
    #[error("circuit breaker rejected the call ({})", state.as_str())]
    Rejected { state: BreakerState },

    /// 操作は実行されたが失敗した（記録済み）。
    #[error(transparent)]
    Operation(E),
}

/// /stats 向けのスナップショット
#[derive(Debug, Clone)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub failure_count: u32,
    pub success_count: u32,
    pub request_count: u32,
    pub last_failure_age: Option<Duration>,
    pub next_attempt_in: Option<Duration>,
}

struct Inner {
    state: BreakerState,
    failure_count: u32,
    success_count: u32,
    request_count: u32,
    last_failure_at: Option<Instant>,
    next_attempt_at: Option<Instant>,
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                success_count: 0,
                request_count: 0,
                last_failure_at: None,
                next_attempt_at: None,
            }),
        }
    }

    /// 操作をブレーカー越しに実行する。
    pub async fn execute<T, E, F, Fut>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.admit().map_err(|state| BreakerError::Rejected { state })?;
        match op().await {
            Ok(value) => {
                self.record(true);
                Ok(value)
            }
            Err(err) => {
                self.record(false);
                Err(BreakerError::Operation(err))
            }
        }
    }

    /// 入場判定。必要なら Open -> HalfOpen 遷移を行う。
    /// 拒否時はその時点の状態を返す。
    pub fn admit(&self) -> Result<(), BreakerState> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let due = inner
                    .next_attempt_at
                    .map(|at| Instant::now() >= at)
                    .unwrap_or(true);
                if due {
                    transition(&mut inner, BreakerState::HalfOpen);
                    inner.request_count = 0;
                    inner.success_count = 0;
                    Ok(())
                } else {
                    Err(BreakerState::Open)
                }
            }
            BreakerState::HalfOpen => {
                if inner.request_count < self.config.max_requests {
                    Ok(())
                } else {
                    Err(BreakerState::HalfOpen)
                }
            }
        }
    }

    /// 実行結果を記録し、必要な遷移を行う。
    pub fn record(&self, success: bool) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.state {
            BreakerState::Closed => {
                if success {
                    inner.failure_count = 0;
                } else {
                    inner.failure_count += 1;
                    inner.last_failure_at = Some(Instant::now());
                    if inner.failure_count >= self.config.failure_threshold {
                        transition(&mut inner, BreakerState::Open);
                        inner.next_attempt_at = Some(Instant::now() + self.config.timeout);
                    }
                }
            }
            BreakerState::HalfOpen => {
                inner.request_count += 1;
                if success {
                    inner.success_count += 1;
                    if inner.success_count >= self.config.success_threshold {
                        transition(&mut inner, BreakerState::Closed);
                        inner.failure_count = 0;
                        inner.success_count = 0;
                        inner.request_count = 0;
                        inner.next_attempt_at = None;
                    }
                } else {
                    // 試験投入の失敗は即座に再封鎖
                    inner.failure_count += 1;
                    inner.last_failure_at = Some(Instant::now());
                    transition(&mut inner, BreakerState::Open);
                    inner.next_attempt_at = Some(Instant::now() + self.config.timeout);
                }
            }
            // Open で record が呼ばれるのは admit と競合した遅延記録のみ。無視する。
            BreakerState::Open => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        BreakerSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            request_count: inner.request_count,
            last_failure_age: inner.last_failure_at.map(|at| now.duration_since(at)),
            next_attempt_in: inner
                .next_attempt_at
                .and_then(|at| at.checked_duration_since(now)),
        }
    }

    /// 管理APIからの強制リセット
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        transition(&mut inner, BreakerState::Closed);
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.request_count = 0;
        inner.last_failure_at = None;
        inner.next_attempt_at = None;
    }
}

fn transition(inner: &mut Inner, to: BreakerState) {
    if inner.state != to {
        info!(from = inner.state.as_str(), to = to.as_str(), "circuit breaker state change");
        inner.state = to;
    }
}
