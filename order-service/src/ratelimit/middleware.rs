//! レート制限の axum ミドルウェア
//!
//! キーは X-Forwarded-For → X-Real-IP → 接続元アドレスの順で決める。
//! 拒否時は 429 と Retry-After（秒）。許可時は X-RateLimit-* の
//! 参考ヘッダを付けて下流へ流す。

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{SecondsFormat, Utc};
use tracing::warn;

use super::RateLimiter;

#[derive(serde::Serialize)]
struct RateLimitedBody {
    error: &'static str,
    message: &'static str,
    retry_after: u64,
}

/// `axum::middleware::from_fn_with_state` に渡す入口関数
pub async fn gate(
    State(limiter): State<Arc<RateLimiter>>,
    req: Request,
    next: Next,
) -> Response {
    let key = client_key(&req);

    if !limiter.allow(&key) {
        let stats = limiter.stats(&key);
        let retry_after = stats.reset_in.as_secs().max(1);
        warn!(
            key = %key,
            method = %req.method(),
            path = %req.uri().path(),
            denied = stats.denied,
            "rate limit exceeded"
        );
        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            Json(RateLimitedBody {
                error: "Rate limit exceeded",
                message: "Too many requests",
                retry_after,
            }),
        )
            .into_response();
        if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
            response.headers_mut().insert("Retry-After", value);
        }
        return response;
    }

    let limit = limiter.limit();
    let remaining = limiter.remaining(&key);
    let reset_at = Utc::now()
        + chrono::Duration::from_std(limiter.stats(&key).reset_in)
            .unwrap_or_else(|_| chrono::Duration::zero());

    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&limit.to_string()) {
        headers.insert("X-RateLimit-Limit", value);
    }
    if let Ok(value) = HeaderValue::from_str(&remaining.to_string()) {
        headers.insert("X-RateLimit-Remaining", value);
    }
    if let Ok(value) = HeaderValue::from_str(&reset_at.to_rfc3339_opts(SecondsFormat::Secs, true)) {
        headers.insert("X-RateLimit-Reset", value);
    }
    response
}

/// レート制限キーの抽出。プロキシ経由のヘッダを優先する。
fn client_key(req: &Request) -> String {
    if let Some(forwarded) = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        // 多段プロキシでは先頭が元クライアント
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(real_ip) = req.headers().get("x-real-ip").and_then(|v| v.to_str().ok()) {
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
