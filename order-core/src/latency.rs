//! 読み取り経路のレイテンシヒストグラム
//!
//! GET /order/{uid} の応答時間分布をマイクロ秒で観測する。
//! 個々のサンプルは保持せず固定バケットのカウントだけを持つので、
//! 記録は atomic 加算のみでロック無し。
//!
//! バケット境界はキャッシュヒット（数十µs）と DB フォールバック
//! （ミリ秒台）が別のバケットに落ちるように切ってある。

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// プロセス起動からの経過マイクロ秒
#[inline]
pub fn now_micros() -> u64 {
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_micros() as u64
}

const BUCKETS: usize = 9;

/// バケット上限（µs）。最後は番兵。
const BUCKET_BOUNDS: [u64; BUCKETS] = [
    50,        // キャッシュヒットの理想圏
    200,       // ヒット + 直列化
    500,       // サブミリ秒の上限手前
    1_000,     // 1ms
    5_000,     // DB ヒットの通常圏
    20_000,    // DB 遅延
    100_000,   // 要調査
    1_000_000, // 1s。ここに入るのは障害時のみ
    u64::MAX,
];

pub struct LatencyHistogram {
    buckets: [AtomicU64; BUCKETS],
    count: AtomicU64,
    sum_micros: AtomicU64,
    max_micros: AtomicU64,
}

impl LatencyHistogram {
    pub fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_micros: AtomicU64::new(0),
            max_micros: AtomicU64::new(0),
        }
    }

    /// 1サンプルを記録する。
    #[inline]
    pub fn record(&self, micros: u64) {
        let idx = BUCKET_BOUNDS
            .iter()
            .position(|&bound| micros <= bound)
            .unwrap_or(BUCKETS - 1);
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros.fetch_add(micros, Ordering::Relaxed);

        // max は CAS で更新。負けたら相手の方が大きいので再判定。
        let mut current = self.max_micros.load(Ordering::Relaxed);
        while micros > current {
            match self.max_micros.compare_exchange_weak(
                current,
                micros,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn snapshot(&self) -> LatencySnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let sum = self.sum_micros.load(Ordering::Relaxed);
        LatencySnapshot {
            count,
            mean_micros: if count > 0 { sum / count } else { 0 },
            max_micros: self.max_micros.load(Ordering::Relaxed),
            buckets: std::array::from_fn(|i| self.buckets[i].load(Ordering::Relaxed)),
        }
    }

    pub fn reset(&self) {
        for bucket in &self.buckets {
            bucket.store(0, Ordering::Relaxed);
        }
        self.count.store(0, Ordering::Relaxed);
        self.sum_micros.store(0, Ordering::Relaxed);
        self.max_micros.store(0, Ordering::Relaxed);
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct LatencySnapshot {
    pub count: u64,
    pub mean_micros: u64,
    pub max_micros: u64,
    pub buckets: [u64; BUCKETS],
}

impl LatencySnapshot {
    /// 近似パーセンタイル。該当バケットの上限値を返す。
    pub fn percentile(&self, p: f64) -> u64 {
        if self.count == 0 {
            return 0;
        }
        let rank = (self.count as f64 * p / 100.0).ceil() as u64;
        let mut cumulative = 0u64;
        for (i, &n) in self.buckets.iter().enumerate() {
            cumulative += n;
            if cumulative >= rank {
                // 最終バケットは上限が無いので実測 max を返す
                return if i == BUCKETS - 1 {
                    self.max_micros
                } else {
                    BUCKET_BOUNDS[i]
                };
            }
        }
        self.max_micros
    }
}
