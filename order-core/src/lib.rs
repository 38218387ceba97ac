//! Order Core - 読み取りホットパスの基盤部品
//!
//! このクレートはサービスの低遅延経路で使うデータ構造だけを持つ:
//! - 上限付き TTL キャッシュ（cache.rs）
//! - マイクロ秒精度のレイテンシヒストグラム（latency.rs）
//!
//! 非同期ランタイムには依存しない。掃除ループや停止制御などの
//! タスク管理は order-service 側の責務で、ここは純粋な構造体のみ。

pub mod cache;
pub mod latency;

pub use cache::{CacheKey, CacheStats, TtlCache};
pub use latency::{LatencyHistogram, LatencySnapshot};
