//! 注文バリデーション
//!
//! 形式チェック（文字種・長さ・列挙集合）と業務不変条件
//! （transaction = order_uid、goods_total + delivery_cost = amount、
//! Σ total_price = goods_total）を純関数で検査する。I/O 無し。
//!
//! 失敗は最初の1件で打ち切らず全件を集めて返す。consumer はこの一覧を
//! そのまま DLQ の reason とログに流すので、欠けがあると調査が遅れる。

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use regex::Regex;
use std::sync::OnceLock;

use crate::config::ValidationLimits;
use crate::error::AppError;
use crate::order::{Delivery, Item, Order, Payment};

const VALID_ENTRIES: [&str; 4] = ["WBIL", "WBILMT", "WBILM", "WBILT"];
const VALID_CURRENCIES: [&str; 6] = ["USD", "EUR", "RUB", "GBP", "CNY", "JPY"];
const VALID_PROVIDERS: [&str; 5] = ["wbpay", "stripe", "paypal", "square", "adyen"];
const VALID_LOCALES: [&str; 10] = ["en", "ru", "es", "fr", "de", "it", "pt", "ja", "ko", "zh"];
const VALID_DELIVERY_SERVICES: [&str; 7] = ["meest", "cdek", "dhl", "fedex", "ups", "usps", "ems"];

/// chrt_id / nm_id の上限。これを超える ID は上流の採番バグ。
const MAX_CATALOG_ID: i64 = 999_999_999;

fn uid_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z0-9_-]+$").unwrap())
}

fn track_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Z0-9]+$").unwrap())
}

fn phone_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\+?[1-9]\d{1,14}$").unwrap())
}

fn email_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").unwrap())
}

fn zip_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{5,10}$").unwrap())
}

/// 注文全体を検査し、失敗フィールドの一覧を返す。
pub fn validate(order: &Order, limits: &ValidationLimits) -> Result<(), AppError> {
    let mut failures = Vec::new();

    check_order_uid(&order.order_uid, limits, &mut failures);
    check_track_number(&order.track_number, limits, &mut failures);
    check_entry(&order.entry, &mut failures);
    check_delivery(&order.delivery, &mut failures);
    check_payment(&order.payment, limits, &mut failures);
    check_items(&order.items, limits, &mut failures);
    check_locale(&order.locale, &mut failures);
    check_customer_id(&order.customer_id, &mut failures);
    check_delivery_service(&order.delivery_service, &mut failures);
    check_date_created(order.date_created, &mut failures);
    if order.sm_id <= 0 {
        failures.push("sm_id must be positive".into());
    }
    check_business_rules(order, &mut failures);

    if failures.is_empty() {
        Ok(())
    } else {
        Err(AppError::Validation { fields: failures })
    }
}

fn check_order_uid(uid: &str, limits: &ValidationLimits, out: &mut Vec<String>) {
    if uid.is_empty() {
        out.push("order_uid is required".into());
        return;
    }
    if uid.len() < limits.order_uid_min_length || uid.len() > limits.order_uid_max_length {
        out.push(format!(
            "order_uid length must be between {} and {} characters",
            limits.order_uid_min_length, limits.order_uid_max_length
        ));
    }
    if !uid_re().is_match(uid) {
        out.push("order_uid contains invalid characters".into());
    }
}

fn check_track_number(track: &str, limits: &ValidationLimits, out: &mut Vec<String>) {
    if track.is_empty() {
        out.push("track_number is required".into());
        return;
    }
    if track.len() < limits.track_number_min_length || track.len() > limits.track_number_max_length
    {
        out.push(format!(
            "track_number length must be between {} and {} characters",
            limits.track_number_min_length, limits.track_number_max_length
        ));
    }
    if !track_re().is_match(track) {
        out.push("track_number must contain only uppercase letters and numbers".into());
    }
}

fn check_entry(entry: &str, out: &mut Vec<String>) {
    if entry.is_empty() {
        out.push("entry is required".into());
        return;
    }
    if !VALID_ENTRIES.contains(&entry) {
        out.push(format!(
            "entry must be one of: {}",
            VALID_ENTRIES.join(", ")
        ));
    }
}

fn check_delivery(delivery: &Delivery, out: &mut Vec<String>) {
    if delivery.name.is_empty() {
        out.push("delivery: name is required".into());
    } else if delivery.name.len() < 2 || delivery.name.len() > 100 {
        out.push("delivery: name length must be between 2 and 100 characters".into());
    }

    if delivery.phone.is_empty() {
        out.push("delivery: phone is required".into());
    } else if !phone_re().is_match(&delivery.phone) {
        out.push("delivery: phone format is invalid (must be international format)".into());
    }

    if delivery.email.is_empty() {
        out.push("delivery: email is required".into());
    } else if !email_re().is_match(&delivery.email) {
        out.push("delivery: email format is invalid".into());
    }

    if delivery.address.is_empty() {
        out.push("delivery: address is required".into());
    } else if delivery.address.len() < 5 || delivery.address.len() > 200 {
        out.push("delivery: address length must be between 5 and 200 characters".into());
    }

    if delivery.city.is_empty() {
        out.push("delivery: city is required".into());
    } else if delivery.city.len() < 2 || delivery.city.len() > 50 {
        out.push("delivery: city length must be between 2 and 50 characters".into());
    }

    // zip / region は任意項目。指定時のみ形式を見る。
    if !delivery.zip.is_empty() && !zip_re().is_match(&delivery.zip) {
        out.push("delivery: zip code format is invalid".into());
    }
    if !delivery.region.is_empty() && (delivery.region.len() < 2 || delivery.region.len() > 50) {
        out.push("delivery: region length must be between 2 and 50 characters".into());
    }
}

fn check_payment(payment: &Payment, limits: &ValidationLimits, out: &mut Vec<String>) {
    if payment.transaction.is_empty() {
        out.push("payment: transaction is required".into());
    } else if payment.transaction.len() < limits.order_uid_min_length
        || payment.transaction.len() > limits.order_uid_max_length
    {
        out.push(format!(
            "payment: transaction length must be between {} and {} characters",
            limits.order_uid_min_length, limits.order_uid_max_length
        ));
    }

    if payment.currency.is_empty() {
        out.push("payment: currency is required".into());
    } else if !VALID_CURRENCIES.contains(&payment.currency.as_str()) {
        out.push(format!(
            "payment: currency must be one of: {}",
            VALID_CURRENCIES.join(", ")
        ));
    }

    if payment.provider.is_empty() {
        out.push("payment: provider is required".into());
    } else if !VALID_PROVIDERS.contains(&payment.provider.as_str()) {
        out.push(format!(
            "payment: provider must be one of: {}",
            VALID_PROVIDERS.join(", ")
        ));
    }

    if payment.amount <= 0 {
        out.push("payment: amount must be positive".into());
    } else if payment.amount > limits.max_payment_amount {
        out.push(format!(
            "payment: amount cannot exceed {}",
            limits.max_payment_amount
        ));
    }

    if payment.payment_dt <= 0 {
        out.push("payment: payment_dt must be positive".into());
    } else if let Some(paid_at) = DateTime::from_timestamp(payment.payment_dt, 0) {
        if paid_at > Utc::now() {
            out.push("payment: payment_dt cannot be in the future".into());
        }
    } else {
        out.push("payment: payment_dt is out of range".into());
    }

    if payment.bank.is_empty() {
        out.push("payment: bank is required".into());
    } else if payment.bank.len() < 2 || payment.bank.len() > 20 {
        out.push("payment: bank length must be between 2 and 20 characters".into());
    }

    if payment.delivery_cost < 0 {
        out.push("payment: delivery_cost cannot be negative".into());
    }
    if payment.delivery_cost > payment.amount {
        out.push("payment: delivery_cost cannot exceed total amount".into());
    }
    if payment.goods_total < 0 {
        out.push("payment: goods_total cannot be negative".into());
    }
    if payment.custom_fee < 0 {
        out.push("payment: custom_fee cannot be negative".into());
    }

    // 金額の分解が一致しない注文は後段で必ず破綻するため入口で弾く
    if payment.goods_total + payment.delivery_cost != payment.amount {
        out.push("payment: goods_total + delivery_cost must equal total amount".into());
    }
}

fn check_items(items: &[Item], limits: &ValidationLimits, out: &mut Vec<String>) {
    if items.is_empty() {
        out.push("items: at least one item is required".into());
        return;
    }
    if items.len() > limits.max_items_per_order {
        out.push(format!(
            "items: cannot have more than {} items in order",
            limits.max_items_per_order
        ));
    }

    for (i, item) in items.iter().enumerate() {
        check_item(item, i, limits, out);
    }
}

fn check_item(item: &Item, index: usize, limits: &ValidationLimits, out: &mut Vec<String>) {
    if item.chrt_id <= 0 {
        out.push(format!("items: item[{index}] chrt_id must be positive"));
    } else if item.chrt_id > MAX_CATALOG_ID {
        out.push(format!("items: item[{index}] chrt_id is too large"));
    }

    if item.name.is_empty() {
        out.push(format!("items: item[{index}] name is required"));
    } else if item.name.len() > 200 {
        out.push(format!(
            "items: item[{index}] name length must be between 1 and 200 characters"
        ));
    }

    if item.price < 0 {
        out.push(format!("items: item[{index}] price cannot be negative"));
    } else if item.price > limits.max_item_price {
        out.push(format!(
            "items: item[{index}] price cannot exceed {}",
            limits.max_item_price
        ));
    }

    if item.total_price < 0 {
        out.push(format!("items: item[{index}] total_price cannot be negative"));
    }
    if item.total_price > item.price {
        out.push(format!("items: item[{index}] total_price cannot exceed price"));
    }

    if item.nm_id <= 0 {
        out.push(format!("items: item[{index}] nm_id must be positive"));
    } else if item.nm_id > MAX_CATALOG_ID {
        out.push(format!("items: item[{index}] nm_id is too large"));
    }

    if item.brand.is_empty() {
        out.push(format!("items: item[{index}] brand is required"));
    } else if item.brand.len() > 100 {
        out.push(format!(
            "items: item[{index}] brand length must be between 1 and 100 characters"
        ));
    }

    if item.sale < 0 || item.sale > 100 {
        out.push(format!("items: item[{index}] sale must be between 0 and 100"));
    }
    if item.status < 0 || item.status > 999 {
        out.push(format!(
            "items: item[{index}] status must be between 0 and 999"
        ));
    }
}

fn check_locale(locale: &str, out: &mut Vec<String>) {
    if locale.is_empty() {
        out.push("locale is required".into());
        return;
    }
    if !VALID_LOCALES.contains(&locale) {
        out.push(format!(
            "locale must be one of: {}",
            VALID_LOCALES.join(", ")
        ));
    }
}

fn check_customer_id(customer_id: &str, out: &mut Vec<String>) {
    if customer_id.is_empty() {
        out.push("customer_id is required".into());
        return;
    }
    if customer_id.len() < 3 || customer_id.len() > 20 {
        out.push("customer_id length must be between 3 and 20 characters".into());
    }
    if !uid_re().is_match(customer_id) {
        out.push("customer_id contains invalid characters".into());
    }
}

fn check_delivery_service(service: &str, out: &mut Vec<String>) {
    if service.is_empty() {
        out.push("delivery_service is required".into());
        return;
    }
    if !VALID_DELIVERY_SERVICES.contains(&service) {
        out.push(format!(
            "delivery_service must be one of: {}",
            VALID_DELIVERY_SERVICES.join(", ")
        ));
    }
}

fn check_date_created(date_created: DateTime<Utc>, out: &mut Vec<String>) {
    let now = Utc::now();
    if date_created > now {
        out.push("date_created cannot be in the future".into());
    }
    if date_created < now - ChronoDuration::days(365) {
        out.push("date_created cannot be older than 1 year".into());
    }
}

fn check_business_rules(order: &Order, out: &mut Vec<String>) {
    let items_total: i64 = order.items.iter().map(|i| i.total_price).sum();
    if items_total != order.payment.goods_total {
        out.push(format!(
            "sum of items total_price ({}) does not match payment goods_total ({})",
            items_total, order.payment.goods_total
        ));
    }

    if order.payment.transaction != order.order_uid {
        out.push("payment transaction must match order_uid".into());
    }
}
