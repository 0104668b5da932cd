use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::User;
use crate::services::TotpService;
use crate::services::auth::check_credentials;
use crate::state::AppState;

/// ログインリクエスト
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    /// ユーザー識別子（メールアドレス）
    pub login: String,
    /// ユーザーのパスワード
    pub password: String,
    /// 2FA認証コード（2FA有効ユーザーの2段階目のみ）
    pub code: Option<String>,
}

/// ログイン成功レスポンス
#[derive(Debug, Serialize)]
pub struct LoginGranted {
    pub id: Uuid,
    pub email: String,
    /// このログインで2FAを通過したか
    #[serde(rename = "is2FAon")]
    pub is_2fa_on: bool,
    /// ベアラートークン
    pub token: String,
}

/// 2FAチャレンジレスポンス
///
/// エラーではなくプロトコルの正常な第2ステップ。クライアントは
/// codeRequired フラグでチャレンジと拒否を判別する。
#[derive(Debug, Serialize)]
pub struct CodeChallenge {
    #[serde(rename = "codeRequired")]
    pub code_required: bool,
    /// TOTP発行者名（コンパニオンアプリでの照合用）
    pub issuer: String,
    /// 表示ラベル（発行者:アカウント識別子）
    pub label: String,
}

/// ログインレスポンス
#[derive(Debug)]
pub enum LoginResponse {
    /// 認証成立（200）
    Granted(LoginGranted),
    /// コード提出が必要（401）
    CodeRequired(CodeChallenge),
}

impl IntoResponse for LoginResponse {
    fn into_response(self) -> Response {
        match self {
            Self::Granted(body) => (StatusCode::OK, Json(body)).into_response(),
            Self::CodeRequired(body) => (StatusCode::UNAUTHORIZED, Json(body)).into_response(),
        }
    }
}

/// 2FAゲートの判定結果（トークン発行前）
#[derive(Debug, PartialEq, Eq)]
pub enum GateDecision {
    /// ログイン許可（two_factor: このログインで2FAを通過したか）
    Granted { two_factor: bool },
    /// Active ユーザーがコード未提出。チャレンジを返す
    CodeRequired,
}

/// ログインハンドラー
///
/// POST /login
///
/// 処理フロー:
/// 1. リクエストバリデーション
/// 2. ユーザー検索 + 資格情報チェック（2FA判定より必ず先）
/// 3. 2FAゲート判定（Active のみチャレンジ対象）
/// 4. 許可ならトークンを発行して返却
pub async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> Result<LoginResponse, AppError> {
    // 1. リクエストバリデーション
    validate_login_request(&request)?;

    // 2-3. 資格情報チェック + 2FAゲート判定
    let user = state.user_repo.find_by_email(&request.login).await?;
    let (user, decision) = authorize_login(
        user.as_ref(),
        &request.password,
        request.code.as_deref(),
        &state.totp_service,
    )?;

    match decision {
        GateDecision::CodeRequired => {
            tracing::info!(email = %user.email, "2FAチャレンジ発行");
            Ok(LoginResponse::CodeRequired(CodeChallenge {
                code_required: true,
                issuer: state.totp_service.issuer().to_string(),
                label: state.totp_service.label(&user.email),
            }))
        }
        GateDecision::Granted { two_factor } => {
            // 4. トークン発行
            let token = state.token_service.issue(user.id, &user.email)?;
            tracing::info!(email = %user.email, two_factor = two_factor, "ログイン成功");
            Ok(LoginResponse::Granted(LoginGranted {
                id: user.id,
                email: user.email.clone(),
                is_2fa_on: two_factor,
                token,
            }))
        }
    }
}

/// ログインゲート（資格情報チェック → 2FA判定）
///
/// # Security
/// 資格情報が通らない限り2FA判定には進まない。チャレンジ応答から
/// パスワードの正否やアカウントの存在を探られないようにするため、
/// この順序は崩さないこと。
pub fn authorize_login<'a>(
    user: Option<&'a User>,
    password: &str,
    code: Option<&str>,
    totp: &TotpService,
) -> Result<(&'a User, GateDecision), AppError> {
    let user = check_credentials(user, password)?;
    let decision = decide_second_factor(user, code, totp)?;
    Ok((user, decision))
}

/// 2FAゲート判定（資格情報チェック通過後）
///
/// - Active 以外（Off / Pending）→ パスワードのみで許可
/// - Active かつコード未提出 → チャレンジ
/// - Active かつコード提出 → 検証。不一致はエラー、一致は2FA通過として許可
fn decide_second_factor(
    user: &User,
    code: Option<&str>,
    totp: &TotpService,
) -> Result<GateDecision, AppError> {
    if !user.two_factor_active() {
        return Ok(GateDecision::Granted { two_factor: false });
    }

    let Some(code) = code else {
        return Ok(GateDecision::CodeRequired);
    };

    let encrypted = user.totp_secret_active.as_deref().ok_or_else(|| {
        tracing::error!(email = %user.email, "Active なのに本シークレットが存在しない");
        AppError::Internal(anyhow::anyhow!("active status without active secret"))
    })?;

    let secret = totp.decrypt_secret(encrypted)?;
    if !totp.verify_code(&secret, code)? {
        tracing::warn!(email = %user.email, "2FAコード不一致");
        return Err(AppError::TotpInvalid);
    }

    Ok(GateDecision::Granted { two_factor: true })
}

/// ログインリクエストのバリデーション
fn validate_login_request(request: &LoginRequest) -> Result<(), AppError> {
    // login: 必須、メール形式
    if request.login.trim().is_empty() {
        return Err(AppError::Validation("メールアドレスは必須です".to_string()));
    }

    // 簡易的なメール形式チェック（@ が含まれているか）
    if !request.login.contains('@') {
        return Err(AppError::Validation(
            "有効なメールアドレスを入力してください".to_string(),
        ));
    }

    // password: 必須（長さの下限は登録側に合わせて設けない）
    if request.password.is_empty() {
        return Err(AppError::Validation("パスワードは必須です".to_string()));
    }

    Ok(())
}
