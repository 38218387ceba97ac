//! 上限付き TTL キャッシュ
//!
//! 注文を order_uid で引くためのインメモリマップ。次の規約で動く:
//! - `get` は TTL 内のエントリだけを返し、期限切れはその場で破棄する
//! - `set` は上限超過時に「最も古く挿入された」エントリを1件追い出す
//!   （追い出し順は created_at。読み取りは順位に影響しない）
//! - `load_all` は起動時のウォームロード用で、マップ全体を置き換える
//!
//! ## ロック構成（2段階）
//! - 外側 RwLock: マップ形状（挿入/削除/全置換）を守る
//! - エントリ内 RwLock: last_access のみを守る
//!
//! 読み取りは外側を read で取ってエントリの Arc を複製したら即座に手放す。
//! 無関係なキーの読者同士が last_access 更新で競合しないための分割。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

/// キャッシュに入れる値が自分のキーを申告するためのトレイト。
///
/// 値の所有権はキャッシュ側が持ち、取得時は複製を返す。
pub trait CacheKey {
    fn cache_key(&self) -> &str;
}

struct Entry<V> {
    value: V,
    created_at: Instant,
    /// 同時刻挿入のタイブレーク用。小さいほど古い。
    seq: u64,
    /// 診断用。追い出し順位には使わない。
    last_access: RwLock<Instant>,
}

/// 動作カウンタ。Relaxed で十分（観測用途のみ）。
#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

/// カウンタのスナップショット
#[derive(Debug, Clone, PartialEq)]
pub struct CacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    /// hits / (hits + misses) を百分率で。トラフィック無しは 0。
    pub hit_rate: f64,
}

/// 上限付き TTL キャッシュ本体
pub struct TtlCache<V> {
    entries: RwLock<HashMap<String, Arc<Entry<V>>>>,
    max_size: usize,
    ttl: Duration,
    insert_seq: AtomicU64,
    counters: Counters,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_size: max_size.max(1),
            ttl,
            insert_seq: AtomicU64::new(0),
            counters: Counters::default(),
        }
    }

    /// キーで値を引く。TTL 内ならヒット、期限切れは削除してミス扱い。
    pub fn get(&self, key: &str) -> Option<V> {
        let entry = {
            let map = self.entries.read().unwrap_or_else(|e| e.into_inner());
            match map.get(key) {
                Some(e) => Arc::clone(e),
                None => {
                    self.counters.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            }
        };

        // created_at は不変なのでロック不要。期限判定はここで行う。
        if entry.created_at.elapsed() > self.ttl {
            self.remove_if_same(key, entry.seq);
            self.counters.expirations.fetch_add(1, Ordering::Relaxed);
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        // last_access だけをエントリ内ロックで更新。外側ロックは既に手放している。
        *entry.last_access.write().unwrap_or_else(|e| e.into_inner()) = Instant::now();

        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry.value.clone())
    }

    /// 値を挿入/置換する。キーが空なら何もしない。
    ///
    /// 新規キーで上限に達している場合は created_at 最古のエントリを1件追い出す。
    pub fn set(&self, value: V)
    where
        V: CacheKey,
    {
        let key = value.cache_key();
        if key.is_empty() {
            return;
        }
        let key = key.to_string();

        let now = Instant::now();
        let entry = Arc::new(Entry {
            value,
            created_at: now,
            seq: self.insert_seq.fetch_add(1, Ordering::Relaxed),
            last_access: RwLock::new(now),
        });

        let mut map = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if !map.contains_key(&key) && map.len() >= self.max_size {
            self.evict_oldest_locked(&mut map);
        }
        map.insert(key, entry);
    }

    /// マップ全体を与えられた値で置き換える（起動時ウォームロード用）。
    pub fn load_all(&self, values: Vec<V>)
    where
        V: CacheKey,
    {
        let now = Instant::now();
        let mut fresh = HashMap::with_capacity(values.len());
        for value in values {
            let key = value.cache_key();
            if key.is_empty() {
                continue;
            }
            fresh.insert(
                key.to_string(),
                Arc::new(Entry {
                    value,
                    created_at: now,
                    seq: self.insert_seq.fetch_add(1, Ordering::Relaxed),
                    last_access: RwLock::new(now),
                }),
            );
        }

        let mut map = self.entries.write().unwrap_or_else(|e| e.into_inner());
        *map = fresh;
    }

    pub fn delete(&self, key: &str) {
        let mut map = self.entries.write().unwrap_or_else(|e| e.into_inner());
        map.remove(key);
    }

    pub fn clear(&self) {
        let mut map = self.entries.write().unwrap_or_else(|e| e.into_inner());
        map.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 期限切れエントリを一括削除し、削除件数を返す。
    ///
    /// 定期掃除タスクから呼ばれる想定。expirations カウンタも進める。
    pub fn purge_expired(&self) -> usize {
        let mut map = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = map.len();
        map.retain(|_, entry| entry.created_at.elapsed() <= self.ttl);
        let removed = before - map.len();
        if removed > 0 {
            self.counters
                .expirations
                .fetch_add(removed as u64, Ordering::Relaxed);
        }
        removed
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            size: self.len(),
            hits,
            misses,
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            hit_rate: if total > 0 {
                hits as f64 / total as f64 * 100.0
            } else {
                0.0
            },
        }
    }

    pub fn reset_stats(&self) {
        self.counters.hits.store(0, Ordering::Relaxed);
        self.counters.misses.store(0, Ordering::Relaxed);
        self.counters.evictions.store(0, Ordering::Relaxed);
        self.counters.expirations.store(0, Ordering::Relaxed);
    }

    /// get で期限切れを見つけた後の削除。
    /// 外側ロックを取り直す間に同キーへ再挿入されていたら消さない（seq 照合）。
    fn remove_if_same(&self, key: &str, seq: u64) {
        let mut map = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if map.get(key).map(|e| e.seq) == Some(seq) {
            map.remove(key);
        }
    }

    /// created_at 最古（同時刻なら seq 最小）のエントリを1件消す。
    fn evict_oldest_locked(&self, map: &mut HashMap<String, Arc<Entry<V>>>) {
        let oldest = map
            .iter()
            .min_by_key(|(_, e)| (e.created_at, e.seq))
            .map(|(k, _)| k.clone());
        if let Some(key) = oldest {
            map.remove(&key);
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }
}
