use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("バリデーションエラー: {0}")]
    Validation(String),

    #[error("ユーザーが見つかりません")]
    UserNotFound,

    #[error("メールアドレスまたはパスワードが正しくありません")]
    CredentialMismatch,

    #[error("このメールアドレスは既に登録されています")]
    EmailAlreadyExists,

    #[error("認証コードが正しくありません")]
    TotpInvalid,

    #[error("二要素認証は既に有効です")]
    TotpAlreadyEnabled,

    #[error("二要素認証の登録が開始されていません")]
    TotpNotPending,

    #[error("認証トークンがありません")]
    TokenMissing,

    #[error("無効なトークンです")]
    TokenInvalid,

    #[error("サーバー設定エラー: {0}")]
    Configuration(String),

    #[error("データベースエラー")]
    Database(#[from] sqlx::Error),

    #[error("内部エラー")]
    Internal(#[from] anyhow::Error),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// 2FAフローに関わるエラーレスポンス
///
/// コード要求の有無（codeRequired）を必ず含める。クライアントはこのフラグで
/// 「チャレンジ」と「拒否」を判別するため、2FA関連の失敗では省略できない。
#[derive(Serialize)]
struct ChallengeErrorResponse {
    #[serde(rename = "codeRequired")]
    code_required: bool,
    error: String,
}

fn plain_error(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
        .into_response()
}

fn rejected_error(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ChallengeErrorResponse {
            code_required: false,
            error: message.to_string(),
        }),
    )
        .into_response()
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match &self {
            Self::Validation(msg) => plain_error(StatusCode::BAD_REQUEST, msg),
            // ユーザー不在とコード不一致は同じステータスで返す
            // （応答の形からアカウントの存在を判別させない）
            Self::UserNotFound => {
                rejected_error(StatusCode::NOT_FOUND, "ユーザーが見つかりません")
            }
            Self::TotpInvalid => {
                rejected_error(StatusCode::NOT_FOUND, "認証コードが正しくありません")
            }
            Self::CredentialMismatch => plain_error(
                StatusCode::FORBIDDEN,
                "メールアドレスまたはパスワードが正しくありません",
            ),
            // 既登録は 408 を返す（既存クライアントが依存している値のため変更不可）
            Self::EmailAlreadyExists => plain_error(
                StatusCode::REQUEST_TIMEOUT,
                "このメールアドレスは既に登録されています",
            ),
            Self::TotpAlreadyEnabled => {
                plain_error(StatusCode::CONFLICT, "二要素認証は既に有効です")
            }
            Self::TotpNotPending => plain_error(
                StatusCode::BAD_REQUEST,
                "二要素認証の登録が開始されていません",
            ),
            Self::TokenMissing => plain_error(StatusCode::FORBIDDEN, "認証トークンがありません"),
            Self::TokenInvalid => plain_error(StatusCode::FORBIDDEN, "無効なトークンです"),
            Self::Configuration(msg) => {
                tracing::error!(detail = %msg, "サーバー設定エラー");
                plain_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "サーバー設定エラーが発生しました",
                )
            }
            Self::Database(e) => {
                tracing::error!(error = ?e, "データベースエラー");
                plain_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "内部エラーが発生しました",
                )
            }
            Self::Internal(e) => {
                tracing::error!(error = ?e, "内部エラー");
                plain_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "内部エラーが発生しました",
                )
            }
        }
    }
}
