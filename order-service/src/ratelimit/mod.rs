//! Per-key rate limiter (token bucket / fixed window).
//!
//! キー（既定はクライアントIP）ごとに流量を絞る。アルゴリズムは構築時に
//! 選択し、以後は同一インターフェースで扱う:
//! - token-bucket: window あたり requests 個のトークンを連続補充。
//!   バースト上限 burst（未指定は requests）まで貯められる
//! - fixed-window: window 境界でカウントをリセットする単純な枠
//!
//! キー状態は DashMap に持ち、バケット内部だけを Mutex で守る。
//! 2 window ぶん触られていないキーは sweep_idle で回収する。

pub mod middleware;

use std::time::Duration;

use dashmap::DashMap;
use std::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{RateLimitAlgorithm, RateLimitConfig};
use crate::error::AppError;

/// allow 間の再試行ポーリング間隔（token bucket の wait 用）
const WAIT_POLL: Duration = Duration::from_millis(10);

/// キー単位の統計
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyStats {
    pub allowed: u64,
    pub denied: u64,
    /// 枠が戻る目安までの残り時間
    pub reset_in: Duration,
}

/// 全キー合算（/metrics 用）
#[derive(Debug, Clone, Default)]
pub struct AggregateStats {
    pub keys: usize,
    pub allowed: u64,
    pub denied: u64,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
    allowed: u64,
    denied: u64,
}

struct WindowState {
    count: u64,
    window_start: Instant,
    last_seen: Instant,
    allowed: u64,
    denied: u64,
}

enum KeyState {
    Bucket(Mutex<BucketState>),
    Window(Mutex<WindowState>),
}

pub struct RateLimiter {
    requests: u64,
    window: Duration,
    burst: u64,
    algorithm: RateLimitAlgorithm,
    keys: DashMap<String, KeyState>,
}

impl RateLimiter {
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self {
            requests: config.requests.max(1),
            window: config.window,
            burst: config.effective_burst().max(1),
            algorithm: config.algorithm,
            keys: DashMap::new(),
        }
    }

    pub fn limit(&self) -> u64 {
        self.requests
    }

    /// 1リクエスト分の枠を取る。枠が無ければ false。
    pub fn allow(&self, key: &str) -> bool {
        let now = Instant::now();
        let entry = self
            .keys
            .entry(key.to_string())
            .or_insert_with(|| self.new_state(now));
        match entry.value() {
            KeyState::Bucket(state) => {
                let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
                refill(&mut state, now, self.requests, self.burst, self.window);
                state.last_seen = now;
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    state.allowed += 1;
                    true
                } else {
                    state.denied += 1;
                    false
                }
            }
            KeyState::Window(state) => {
                let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
                roll_window(&mut state, now, self.window);
                state.last_seen = now;
                if state.count < self.requests {
                    state.count += 1;
                    state.allowed += 1;
                    true
                } else {
                    state.denied += 1;
                    false
                }
            }
        }
    }

    /// 枠が取れるまで待つ。取り消しが来たらその旨のエラーで戻る。
    pub async fn wait(&self, token: &CancellationToken, key: &str) -> Result<(), AppError> {
        loop {
            if self.allow(key) {
                return Ok(());
            }
            let pause = match self.algorithm {
                RateLimitAlgorithm::TokenBucket => WAIT_POLL,
                // fixed window は次の境界まで眠ってよい
                RateLimitAlgorithm::FixedWindow => self.stats(key).reset_in.max(WAIT_POLL),
            };
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = token.cancelled() => {
                    return Err(AppError::Cancelled {
                        context: "rate limiter wait".into(),
                    });
                }
            }
        }
    }

    /// 残り枠の目安（応答ヘッダ用）
    pub fn remaining(&self, key: &str) -> u64 {
        let now = Instant::now();
        match self.keys.get(key).map(|e| match e.value() {
            KeyState::Bucket(state) => {
                let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
                refill(&mut state, now, self.requests, self.burst, self.window);
                state.tokens as u64
            }
            KeyState::Window(state) => {
                let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
                roll_window(&mut state, now, self.window);
                self.requests.saturating_sub(state.count)
            }
        }) {
            Some(n) => n,
            // 未訪問キーは満枠
            None => match self.algorithm {
                RateLimitAlgorithm::TokenBucket => self.burst,
                RateLimitAlgorithm::FixedWindow => self.requests,
            },
        }
    }

    pub fn stats(&self, key: &str) -> KeyStats {
        let now = Instant::now();
        match self.keys.get(key) {
            Some(entry) => match entry.value() {
                KeyState::Bucket(state) => {
                    let state = state.lock().unwrap_or_else(|e| e.into_inner());
                    let since_refill = now.duration_since(state.last_refill);
                    KeyStats {
                        allowed: state.allowed,
                        denied: state.denied,
                        reset_in: self.window.saturating_sub(since_refill),
                    }
                }
                KeyState::Window(state) => {
                    let state = state.lock().unwrap_or_else(|e| e.into_inner());
                    let elapsed = now.duration_since(state.window_start);
                    KeyStats {
                        allowed: state.allowed,
                        denied: state.denied,
                        reset_in: self.window.saturating_sub(elapsed),
                    }
                }
            },
            None => KeyStats {
                allowed: 0,
                denied: 0,
                reset_in: Duration::ZERO,
            },
        }
    }

    pub fn aggregate(&self) -> AggregateStats {
        let mut agg = AggregateStats {
            keys: self.keys.len(),
            ..Default::default()
        };
        for entry in self.keys.iter() {
            match entry.value() {
                KeyState::Bucket(state) => {
                    let state = state.lock().unwrap_or_else(|e| e.into_inner());
                    agg.allowed += state.allowed;
                    agg.denied += state.denied;
                }
                KeyState::Window(state) => {
                    let state = state.lock().unwrap_or_else(|e| e.into_inner());
                    agg.allowed += state.allowed;
                    agg.denied += state.denied;
                }
            }
        }
        agg
    }

    /// キー1件の枠と統計を初期状態へ戻す
    pub fn reset(&self, key: &str) {
        let now = Instant::now();
        if let Some(entry) = self.keys.get(key) {
            match entry.value() {
                KeyState::Bucket(state) => {
                    let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
                    state.tokens = self.requests as f64;
                    state.last_refill = now;
                    state.allowed = 0;
                    state.denied = 0;
                }
                KeyState::Window(state) => {
                    let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
                    state.count = 0;
                    state.window_start = now;
                    state.allowed = 0;
                    state.denied = 0;
                }
            }
        }
    }

    /// 管理APIからの全リセット
    pub fn reset_all(&self) {
        self.keys.clear();
    }

    /// 2 window 以上トラフィックの無いキーを破棄し、件数を返す
    pub fn sweep_idle(&self) -> usize {
        let now = Instant::now();
        let cutoff = self.window * 2;
        let before = self.keys.len();
        self.keys.retain(|_, state| {
            let last_seen = match state {
                KeyState::Bucket(s) => s.lock().unwrap_or_else(|e| e.into_inner()).last_seen,
                KeyState::Window(s) => s.lock().unwrap_or_else(|e| e.into_inner()).last_seen,
            };
            now.duration_since(last_seen) < cutoff
        });
        before - self.keys.len()
    }

    fn new_state(&self, now: Instant) -> KeyState {
        match self.algorithm {
            RateLimitAlgorithm::TokenBucket => KeyState::Bucket(Mutex::new(BucketState {
                tokens: self.burst as f64,
                last_refill: now,
                last_seen: now,
                allowed: 0,
                denied: 0,
            })),
            RateLimitAlgorithm::FixedWindow => KeyState::Window(Mutex::new(WindowState {
                count: 0,
                window_start: now,
                last_seen: now,
                allowed: 0,
                denied: 0,
            })),
        }
    }
}

/// window あたり requests 個のペースで連続補充し、burst を上限にする
fn refill(state: &mut BucketState, now: Instant, requests: u64, burst: u64, window: Duration) {
    let elapsed = now.duration_since(state.last_refill);
    if elapsed.is_zero() {
        return;
    }
    let add = elapsed.as_secs_f64() / window.as_secs_f64() * requests as f64;
    state.tokens = (state.tokens + add).min(burst as f64);
    state.last_refill = now;
}

/// 現在時刻が属する window まで境界を進める（境界の位相は維持する）
fn roll_window(state: &mut WindowState, now: Instant, window: Duration) {
    while now.duration_since(state.window_start) >= window {
        state.window_start += window;
        state.count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn limiter(algorithm: RateLimitAlgorithm, requests: u64, window_ms: u64, burst: u64) -> RateLimiter {
        RateLimiter::from_config(&RateLimitConfig {
            requests,
            window: Duration::from_millis(window_ms),
            burst,
            algorithm,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn token_bucket_allows_burst_then_denies() {
        let rl = limiter(RateLimitAlgorithm::TokenBucket, 5, 1_000, 5);
        for _ in 0..5 {
            assert!(rl.allow("1.2.3.4"));
        }
        for _ in 0..5 {
            assert!(!rl.allow("1.2.3.4"));
        }
        let stats = rl.stats("1.2.3.4");
        assert_eq!(stats.allowed, 5);
        assert_eq!(stats.denied, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn token_bucket_refills_over_time() {
        let rl = limiter(RateLimitAlgorithm::TokenBucket, 5, 1_000, 5);
        for _ in 0..5 {
            assert!(rl.allow("k"));
        }
        assert!(!rl.allow("k"));

        // 1 window 経過で満枠まで戻る
        tokio::time::advance(Duration::from_millis(1_000)).await;
        for _ in 0..5 {
            assert!(rl.allow("k"));
        }
        assert!(!rl.allow("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn token_bucket_keys_are_independent() {
        let rl = limiter(RateLimitAlgorithm::TokenBucket, 2, 1_000, 2);
        assert!(rl.allow("a"));
        assert!(rl.allow("a"));
        assert!(!rl.allow("a"));
        assert!(rl.allow("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn admitted_in_any_window_is_bounded_by_burst_plus_requests() {
        // 不変条件: 任意の window 長の区間で admitted <= burst + requests
        let rl = limiter(RateLimitAlgorithm::TokenBucket, 10, 1_000, 10);
        let mut admitted = 0u64;
        for _ in 0..40 {
            if rl.allow("k") {
                admitted += 1;
            }
            tokio::time::advance(Duration::from_millis(25)).await;
        }
        assert!(admitted <= 20, "admitted {admitted} exceeded burst + requests");
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_window_resets_at_boundary() {
        let rl = limiter(RateLimitAlgorithm::FixedWindow, 3, 1_000, 0);
        for _ in 0..3 {
            assert!(rl.allow("k"));
        }
        assert!(!rl.allow("k"));

        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert!(rl.allow("k"));
        assert_eq!(rl.remaining("k"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_returns_when_token_becomes_available() {
        let rl = limiter(RateLimitAlgorithm::TokenBucket, 10, 100, 1);
        let token = CancellationToken::new();
        assert!(rl.allow("k"));

        let started = tokio::time::Instant::now();
        rl.wait(&token, "k").await.unwrap();
        // 100ms/10 = 10ms でトークンが1つ戻る
        assert!(started.elapsed() >= Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_respects_cancellation() {
        let rl = limiter(RateLimitAlgorithm::FixedWindow, 1, 60_000, 0);
        let token = CancellationToken::new();
        assert!(rl.allow("k"));

        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let err = rl.wait(&token, "k").await.unwrap_err();
        assert!(matches!(err, AppError::Cancelled { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn reset_restores_full_quota() {
        let rl = limiter(RateLimitAlgorithm::TokenBucket, 2, 1_000, 2);
        assert!(rl.allow("k"));
        assert!(rl.allow("k"));
        assert!(!rl.allow("k"));

        rl.reset("k");
        assert!(rl.allow("k"));
        let stats = rl.stats("k");
        assert_eq!(stats.allowed, 1);
        assert_eq!(stats.denied, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_idle_keys_after_two_windows() {
        let rl = limiter(RateLimitAlgorithm::TokenBucket, 5, 1_000, 5);
        assert!(rl.allow("idle"));
        assert!(rl.allow("busy"));

        tokio::time::advance(Duration::from_millis(1_500)).await;
        assert!(rl.allow("busy"));
        tokio::time::advance(Duration::from_millis(700)).await;

        // idle は 2.2s 触られていない。busy は 0.7s 前に活動。
        assert_eq!(rl.sweep_idle(), 1);
        assert_eq!(rl.aggregate().keys, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn aggregate_sums_all_keys() {
        let rl = limiter(RateLimitAlgorithm::TokenBucket, 1, 1_000, 1);
        assert!(rl.allow("a"));
        assert!(!rl.allow("a"));
        assert!(rl.allow("b"));

        let agg = rl.aggregate();
        assert_eq!(agg.keys, 2);
        assert_eq!(agg.allowed, 2);
        assert_eq!(agg.denied, 1);
    }
}
