//! 注文ストア
//!
//! 永続層の能力境界。consumer と HTTP ハンドラはこのトレイトだけに
//! 依存し、実体（Postgres / テストダブル）は起動時に差し込む。

pub mod postgres;

use async_trait::async_trait;

use crate::error::AppError;
use crate::order::Order;

#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// 全注文を関連エンティティ込みで読み出す（起動時ウォームロード用）
    async fn load_all(&self) -> Result<Vec<Order>, AppError>;

    /// UID で1件引く。存在しなければ None。
    async fn get_by_uid(&self, uid: &str) -> Result<Option<Order>, AppError>;

    /// 集約全体を1トランザクションで保存する。
    /// 既存 UID への再保存は黙って no-op（at-least-once 配信の重複対策）。
    async fn save(&self, order: &Order) -> Result<(), AppError>;
}

#[cfg(test)]
pub mod memory {
    //! テスト用のインメモリ実装。失敗注入付き。

    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MemoryOrderStore {
        orders: Mutex<HashMap<String, Order>>,
        pub fail_reads: AtomicBool,
        pub fail_writes: AtomicBool,
        pub save_calls: AtomicU64,
    }

    impl MemoryOrderStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_orders(orders: Vec<Order>) -> Self {
            let store = Self::default();
            {
                let mut map = store.orders.lock().unwrap();
                for order in orders {
                    map.insert(order.order_uid.clone(), order);
                }
            }
            store
        }

        pub fn contains(&self, uid: &str) -> bool {
            self.orders.lock().unwrap().contains_key(uid)
        }
    }

    #[async_trait]
    impl OrderRepository for MemoryOrderStore {
        async fn load_all(&self) -> Result<Vec<Order>, AppError> {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(AppError::Database {
                    context: "load all orders".into(),
                    source: None,
                });
            }
            Ok(self.orders.lock().unwrap().values().cloned().collect())
        }

        async fn get_by_uid(&self, uid: &str) -> Result<Option<Order>, AppError> {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(AppError::Database {
                    context: "get order by uid".into(),
                    source: None,
                });
            }
            Ok(self.orders.lock().unwrap().get(uid).cloned())
        }

        async fn save(&self, order: &Order) -> Result<(), AppError> {
            self.save_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(AppError::Database {
                    context: "save order".into(),
                    source: None,
                });
            }
            self.orders
                .lock()
                .unwrap()
                .entry(order.order_uid.clone())
                .or_insert_with(|| order.clone());
            Ok(())
        }
    }
}
