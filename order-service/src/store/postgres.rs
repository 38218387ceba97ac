//! Postgres 実装
//!
//! deadpool-postgres のプールを consumer / HTTP で共有する。
//! 保存は orders → delivery → payment → items を1トランザクションで書き、
//! 自然キー（order_uid / payment.transaction）への衝突は DO NOTHING。
//! orders の insert が 0 行なら既に保存済みなので、従属エンティティには
//! 触れずに戻る。items に重複行を作らないための順序依存。
//!
//! 各公開操作には設定値の期限を掛け、超過は Timeout として返す。

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_postgres::{Config as PoolBuilderConfig, ManagerConfig, Pool, RecyclingMethod, Runtime, SslMode};
use tokio_postgres::NoTls;

use super::OrderRepository;
use crate::config::DatabaseConfig;
use crate::error::AppError;
use crate::order::{Delivery, Item, Order, Payment};

pub struct PgOrderStore {
    pool: Pool,
    query_timeout: Duration,
}

impl PgOrderStore {
    /// プールを構築する。接続は遅延で張られるため、ここでは失敗しない
    /// 設定不備のみがエラーになる。
    pub fn connect(config: &DatabaseConfig) -> Result<Self, AppError> {
        let mut cfg = PoolBuilderConfig::new();
        cfg.host = Some(config.host.clone());
        cfg.port = Some(config.port);
        cfg.user = Some(config.user.clone());
        cfg.password = Some(config.password.clone());
        cfg.dbname = Some(config.name.clone());
        cfg.ssl_mode = Some(match config.sslmode.as_str() {
            "require" => SslMode::Require,
            "prefer" => SslMode::Prefer,
            _ => SslMode::Disable,
        });
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        cfg.pool = Some(deadpool_postgres::PoolConfig::new(config.max_open_conns));

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| AppError::database("create connection pool", e))?;
        tracing::info!(
            max_open = config.max_open_conns,
            max_idle = config.max_idle_conns,
            conn_max_lifetime_sec = config.conn_max_lifetime.as_secs(),
            "postgres pool configured"
        );

        Ok(Self {
            pool,
            query_timeout: config.query_timeout,
        })
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    async fn with_timeout<T, F>(&self, context: &str, fut: F) -> Result<T, AppError>
    where
        F: std::future::Future<Output = Result<T, AppError>>,
    {
        match tokio::time::timeout(self.query_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(AppError::Timeout {
                context: context.to_string(),
            }),
        }
    }
}

#[async_trait]
impl OrderRepository for PgOrderStore {
    async fn load_all(&self) -> Result<Vec<Order>, AppError> {
        self.with_timeout("load all orders", async {
            let client = self
                .pool
                .get()
                .await
                .map_err(|e| AppError::database("acquire connection", e))?;

            // 4テーブルを全件読み、メモリ上で order_uid で突き合わせる。
            // JOIN + json_agg より行数が読めるし、型も素直に落ちる。
            let order_rows = client
                .query(
                    "SELECT order_uid, track_number, entry, locale, internal_signature, \
                     customer_id, delivery_service, shardkey, sm_id, date_created, oof_shard \
                     FROM orders",
                    &[],
                )
                .await
                .map_err(|e| AppError::database("query orders", e))?;

            let delivery_rows = client
                .query(
                    "SELECT order_uid, name, phone, zip, city, address, region, email \
                     FROM delivery",
                    &[],
                )
                .await
                .map_err(|e| AppError::database("query delivery", e))?;

            let payment_rows = client
                .query(
                    "SELECT order_uid, transaction, request_id, currency, provider, amount, \
                     payment_dt, bank, delivery_cost, goods_total, custom_fee \
                     FROM payment",
                    &[],
                )
                .await
                .map_err(|e| AppError::database("query payment", e))?;

            let item_rows = client
                .query(
                    "SELECT order_uid, chrt_id, track_number, price, rid, name, sale, size, \
                     total_price, nm_id, brand, status \
                     FROM items ORDER BY id",
                    &[],
                )
                .await
                .map_err(|e| AppError::database("query items", e))?;

            let mut deliveries: HashMap<String, Delivery> = HashMap::new();
            for row in delivery_rows {
                deliveries.insert(row.get("order_uid"), delivery_from_row(&row));
            }

            let mut payments: HashMap<String, Payment> = HashMap::new();
            for row in payment_rows {
                payments.insert(row.get("order_uid"), payment_from_row(&row));
            }

            let mut items: HashMap<String, Vec<Item>> = HashMap::new();
            for row in item_rows {
                items
                    .entry(row.get("order_uid"))
                    .or_default()
                    .push(item_from_row(&row));
            }

            let mut orders = Vec::with_capacity(order_rows.len());
            for row in order_rows {
                let uid: String = row.get("order_uid");
                // delivery/payment が欠けた行は集約として不完全なので飛ばす
                let (Some(delivery), Some(payment)) =
                    (deliveries.remove(&uid), payments.remove(&uid))
                else {
                    continue;
                };
                orders.push(order_from_row(
                    &row,
                    delivery,
                    payment,
                    items.remove(&uid).unwrap_or_default(),
                ));
            }
            Ok(orders)
        })
        .await
    }

    async fn get_by_uid(&self, uid: &str) -> Result<Option<Order>, AppError> {
        self.with_timeout("get order by uid", async {
            let client = self
                .pool
                .get()
                .await
                .map_err(|e| AppError::database("acquire connection", e))?;

            let Some(order_row) = client
                .query_opt(
                    "SELECT order_uid, track_number, entry, locale, internal_signature, \
                     customer_id, delivery_service, shardkey, sm_id, date_created, oof_shard \
                     FROM orders WHERE order_uid = $1",
                    &[&uid],
                )
                .await
                .map_err(|e| AppError::database("query order", e))?
            else {
                return Ok(None);
            };

            let delivery_row = client
                .query_opt(
                    "SELECT order_uid, name, phone, zip, city, address, region, email \
                     FROM delivery WHERE order_uid = $1",
                    &[&uid],
                )
                .await
                .map_err(|e| AppError::database("query delivery", e))?;

            let payment_row = client
                .query_opt(
                    "SELECT order_uid, transaction, request_id, currency, provider, amount, \
                     payment_dt, bank, delivery_cost, goods_total, custom_fee \
                     FROM payment WHERE order_uid = $1",
                    &[&uid],
                )
                .await
                .map_err(|e| AppError::database("query payment", e))?;

            let (Some(delivery_row), Some(payment_row)) = (delivery_row, payment_row) else {
                // 従属行が無い集約は返さない（保存は全行同一トランザクション）
                return Ok(None);
            };

            let item_rows = client
                .query(
                    "SELECT order_uid, chrt_id, track_number, price, rid, name, sale, size, \
                     total_price, nm_id, brand, status \
                     FROM items WHERE order_uid = $1 ORDER BY id",
                    &[&uid],
                )
                .await
                .map_err(|e| AppError::database("query items", e))?;

            Ok(Some(order_from_row(
                &order_row,
                delivery_from_row(&delivery_row),
                payment_from_row(&payment_row),
                item_rows.iter().map(item_from_row).collect(),
            )))
        })
        .await
    }

    async fn save(&self, order: &Order) -> Result<(), AppError> {
        if order.order_uid.is_empty() {
            return Err(AppError::Validation {
                fields: vec!["order_uid is required".into()],
            });
        }

        self.with_timeout("save order", async {
            let mut client = self
                .pool
                .get()
                .await
                .map_err(|e| AppError::database("acquire connection", e))?;
            let tx = client
                .transaction()
                .await
                .map_err(|e| AppError::database("begin transaction", e))?;

            let inserted = tx
                .execute(
                    "INSERT INTO orders (order_uid, track_number, entry, locale, \
                     internal_signature, customer_id, delivery_service, shardkey, sm_id, \
                     date_created, oof_shard) \
                     VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11) \
                     ON CONFLICT (order_uid) DO NOTHING",
                    &[
                        &order.order_uid,
                        &order.track_number,
                        &order.entry,
                        &order.locale,
                        &order.internal_signature,
                        &order.customer_id,
                        &order.delivery_service,
                        &order.shardkey,
                        &order.sm_id,
                        &order.date_created,
                        &order.oof_shard,
                    ],
                )
                .await
                .map_err(|e| AppError::database("insert order", e))?;

            // 既存 UID なら従属エンティティも保存済み。items の重複を避けて終了。
            if inserted == 0 {
                tx.commit()
                    .await
                    .map_err(|e| AppError::database("commit transaction", e))?;
                return Ok(());
            }

            tx.execute(
                "INSERT INTO delivery (order_uid, name, phone, zip, city, address, region, email) \
                 VALUES ($1,$2,$3,$4,$5,$6,$7,$8) \
                 ON CONFLICT (order_uid) DO NOTHING",
                &[
                    &order.order_uid,
                    &order.delivery.name,
                    &order.delivery.phone,
                    &order.delivery.zip,
                    &order.delivery.city,
                    &order.delivery.address,
                    &order.delivery.region,
                    &order.delivery.email,
                ],
            )
            .await
            .map_err(|e| AppError::database("insert delivery", e))?;

            tx.execute(
                "INSERT INTO payment (transaction, order_uid, request_id, currency, provider, \
                 amount, payment_dt, bank, delivery_cost, goods_total, custom_fee) \
                 VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11) \
                 ON CONFLICT (transaction) DO NOTHING",
                &[
                    &order.payment.transaction,
                    &order.order_uid,
                    &order.payment.request_id,
                    &order.payment.currency,
                    &order.payment.provider,
                    &order.payment.amount,
                    &order.payment.payment_dt,
                    &order.payment.bank,
                    &order.payment.delivery_cost,
                    &order.payment.goods_total,
                    &order.payment.custom_fee,
                ],
            )
            .await
            .map_err(|e| AppError::database("insert payment", e))?;

            for item in &order.items {
                tx.execute(
                    "INSERT INTO items (order_uid, chrt_id, track_number, price, rid, name, \
                     sale, size, total_price, nm_id, brand, status) \
                     VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12)",
                    &[
                        &order.order_uid,
                        &item.chrt_id,
                        &item.track_number,
                        &item.price,
                        &item.rid,
                        &item.name,
                        &item.sale,
                        &item.size,
                        &item.total_price,
                        &item.nm_id,
                        &item.brand,
                        &item.status,
                    ],
                )
                .await
                .map_err(|e| AppError::database("insert item", e))?;
            }

            tx.commit()
                .await
                .map_err(|e| AppError::database("commit transaction", e))?;
            Ok(())
        })
        .await
    }
}

fn order_from_row(
    row: &tokio_postgres::Row,
    delivery: Delivery,
    payment: Payment,
    items: Vec<Item>,
) -> Order {
    Order {
        order_uid: row.get("order_uid"),
        track_number: row.get("track_number"),
        entry: row.get("entry"),
        delivery,
        payment,
        items,
        locale: row.get("locale"),
        internal_signature: row.get("internal_signature"),
        customer_id: row.get("customer_id"),
        delivery_service: row.get("delivery_service"),
        shardkey: row.get("shardkey"),
        sm_id: row.get("sm_id"),
        date_created: row.get("date_created"),
        oof_shard: row.get("oof_shard"),
    }
}

fn delivery_from_row(row: &tokio_postgres::Row) -> Delivery {
    Delivery {
        name: row.get("name"),
        phone: row.get("phone"),
        zip: row.get("zip"),
        city: row.get("city"),
        address: row.get("address"),
        region: row.get("region"),
        email: row.get("email"),
    }
}

fn payment_from_row(row: &tokio_postgres::Row) -> Payment {
    Payment {
        transaction: row.get("transaction"),
        request_id: row.get("request_id"),
        currency: row.get("currency"),
        provider: row.get("provider"),
        amount: row.get("amount"),
        payment_dt: row.get("payment_dt"),
        bank: row.get("bank"),
        delivery_cost: row.get("delivery_cost"),
        goods_total: row.get("goods_total"),
        custom_fee: row.get("custom_fee"),
    }
}

fn item_from_row(row: &tokio_postgres::Row) -> Item {
    Item {
        chrt_id: row.get("chrt_id"),
        track_number: row.get("track_number"),
        price: row.get("price"),
        rid: row.get("rid"),
        name: row.get("name"),
        sale: row.get("sale"),
        size: row.get("size"),
        total_price: row.get("total_price"),
        nm_id: row.get("nm_id"),
        brand: row.get("brand"),
        status: row.get("status"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn connect_builds_lazy_pool() {
        // 接続は遅延なので、到達不能ホストでもプール構築は成功する
        let store = PgOrderStore::connect(&DatabaseConfig {
            host: "127.0.0.1".into(),
            port: 5432,
            user: "orders_user".into(),
            password: "orders_pass".into(),
            name: "orders_db".into(),
            sslmode: "disable".into(),
            max_open_conns: 4,
            max_idle_conns: 2,
            conn_max_lifetime: Duration::from_secs(300),
            query_timeout: Duration::from_secs(5),
        });
        assert!(store.is_ok());
    }

    #[tokio::test]
    async fn save_rejects_empty_uid_before_touching_pool() {
        let store = PgOrderStore::connect(&DatabaseConfig {
            host: "127.0.0.1".into(),
            port: 5432,
            user: "u".into(),
            password: "p".into(),
            name: "d".into(),
            sslmode: "disable".into(),
            max_open_conns: 1,
            max_idle_conns: 1,
            conn_max_lifetime: Duration::from_secs(300),
            query_timeout: Duration::from_secs(5),
        })
        .unwrap();

        let mut order: crate::order::Order =
            serde_json::from_str(include_str!("../../testdata/order_v1.json")).unwrap();
        order.order_uid = String::new();

        let err = store.save(&order).await.unwrap_err();
        assert!(matches!(err, AppError::Validation { .. }));
    }
}
