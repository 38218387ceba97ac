//! サービス共通のエラー型
//!
//! パイプライン全体（consumer / store / HTTP / ミドルウェア）で使う
//! 失敗の分類。各種別は HTTP ステータスと機械可読コードへ正規化され、
//! retry 層は is_permanent で再試行の可否を判定する。
//! 原因エラーは source として保持し、握り潰さない。

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

/// 下位層のエラーを型を問わず保持するための別名
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum AppError {
    /// JSON デコード失敗。再試行しても直らない。
    #[error("failed to parse order document")]
    Parse(#[source] serde_json::Error),

    /// 業務バリデーション失敗。全フィールドの失敗理由を保持する。
    #[error("order validation failed: {}", fields.join("; "))]
    Validation { fields: Vec<String> },

    #[error("order not found: {uid}")]
    NotFound { uid: String },

    /// 期限付き呼び出しの打ち切り。再試行対象。
    #[error("{context} timed out")]
    Timeout { context: String },

    #[error("database error: {context}")]
    Database {
        context: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("broker error: {context}")]
    Broker {
        context: String,
        #[source]
        source: Option<BoxError>,
    },

    /// 将来のキャッシュ障害分類のために予約。現行のキャッシュ操作は失敗しない。
    #[allow(dead_code)]
    #[error("cache error: {context}")]
    Cache { context: String },

    /// retry 予算を使い切った。source は最後の失敗。
    #[error("operation failed after {attempts} attempts")]
    Retry {
        attempts: u32,
        #[source]
        source: Box<AppError>,
    },

    /// DLQ への退避自体の失敗。元エラーを覆い隠さないよう呼び出し側でログのみ。
    #[error("dlq publish failed: {context}")]
    Dlq {
        context: String,
        #[source]
        source: Option<BoxError>,
    },

    /// サーキットブレーカーによる入口拒否
    #[error("circuit breaker is open")]
    CircuitOpen,

    /// 呼び出し元の取り消し。これ以上の試行はしない。
    #[error("{context} cancelled")]
    Cancelled { context: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl AppError {
    pub fn database(context: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Database {
            context: context.into(),
            source: Some(source.into()),
        }
    }

    pub fn broker(context: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Broker {
            context: context.into(),
            source: Some(source.into()),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// HTTP ステータスへの正規化
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Parse(_) | Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::CircuitOpen | Self::Cancelled { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Database { .. }
            | Self::Broker { .. }
            | Self::Cache { .. }
            | Self::Retry { .. }
            | Self::Dlq { .. }
            | Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// 運用ログ/レスポンス用の機械可読コード
    pub fn code(&self) -> &'static str {
        match self {
            Self::Parse(_) => "ORDER_PARSE_FAILED",
            Self::Validation { .. } => "ORDER_VALIDATION_FAILED",
            Self::NotFound { .. } => "ORDER_NOT_FOUND",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Database { .. } => "DATABASE_ERROR",
            Self::Broker { .. } => "BROKER_ERROR",
            Self::Cache { .. } => "CACHE_ERROR",
            Self::Retry { .. } => "RETRY_EXHAUSTED",
            Self::Dlq { .. } => "DLQ_PUBLISH_FAILED",
            Self::CircuitOpen => "CIRCUIT_OPEN",
            Self::Cancelled { .. } => "CANCELLED",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    /// 再試行しても結果が変わらない失敗か。
    /// retry 層はこれが真なら即座に打ち切る。
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::Parse(_) | Self::Validation { .. } | Self::NotFound { .. } | Self::Cancelled { .. }
        )
    }
}

/// クライアント向けエラーボディ。内部詳細は出さない。
#[derive(serde::Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        // 5xx は内部事情を伏せて定型文、4xx は分類メッセージまで返す。
        let message = if status.is_server_error() {
            "internal error".to_string()
        } else {
            self.to_string()
        };
        (
            status,
            Json(ErrorBody {
                error: self.code(),
                message,
            }),
        )
            .into_response()
    }
}
