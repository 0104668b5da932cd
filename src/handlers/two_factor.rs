use axum::{Json, extract::State};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::models::User;
use crate::services::{AuthClaims, TotpService};
use crate::state::AppState;

// === 2FA登録開始（QR発行） ===

#[derive(Debug, Serialize)]
pub struct QrCodeResponse {
    /// そのまま <img> の src に使える data URI
    pub image: String,
}

/// POST /getTwoFAQrCode
///
/// 2FA登録を開始する。新しいシークレットを生成して保留状態で保存し、
/// 認証アプリ取り込み用のQRコードを返す。再リクエストは保留シークレットを
/// 無条件に置き換える（古いQRはその時点で失効）。
///
/// # Security
/// - ベアラートークン必須
/// - シークレット平文はレスポンスにもログにも出さない（QR画像のみ）
pub async fn get_two_fa_qr_code(
    State(state): State<AppState>,
    claims: AuthClaims,
) -> Result<Json<QrCodeResponse>, AppError> {
    let user = find_token_user(&state, &claims).await?;

    // 既に有効なユーザーの再登録は解除フローを経ない限り拒否
    if user.two_factor_active() {
        return Err(AppError::TotpAlreadyEnabled);
    }

    // シークレット生成、暗号化して保留列に保存
    let secret = TotpService::generate_secret();
    let encrypted = state.totp_service.encrypt_secret(&secret)?;
    state.user_repo.set_pending_secret(user.id, &encrypted).await?;

    // QRコード生成
    let qr_code = state.totp_service.generate_qr_code(&user.email, &secret)?;

    tracing::info!(user_id = %user.id, "2FA登録開始（保留シークレット発行）");

    Ok(Json(QrCodeResponse {
        image: format!("data:image/png;base64,{}", qr_code),
    }))
}

// === 2FA登録確認（初回コード検証） ===

#[derive(Debug, Deserialize)]
pub struct ConfirmRequest {
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct ConfirmResponse {
    pub enabled: bool,
}

/// POST /registerTwoFA
///
/// 保留シークレットに対して初回コードを検証し、成功したら本シークレットへ
/// 昇格する。昇格は「検証に使った保留値がまだ保存されている場合」だけ成立する
/// 条件付きUPDATEで行うため、並行する確認やQR再発行と競合しても
/// 検証済みでないシークレットが有効化されることはない。
///
/// # Security
/// - ベアラートークン必須
/// - コードはログ出力禁止
pub async fn register_two_fa(
    State(state): State<AppState>,
    claims: AuthClaims,
    Json(request): Json<ConfirmRequest>,
) -> Result<Json<ConfirmResponse>, AppError> {
    // バリデーション
    validate_totp_code(&request.code)?;

    let user = find_token_user(&state, &claims).await?;

    let Some(pending) = user.totp_secret_pending.as_deref() else {
        return Err(AppError::TotpNotPending);
    };

    // 保留シークレットを復号してコード検証
    let secret = state.totp_service.decrypt_secret(pending)?;
    if !state.totp_service.verify_code(&secret, &request.code)? {
        tracing::warn!(user_id = %user.id, "2FA登録確認: コード不一致");
        return Err(AppError::TotpInvalid);
    }

    // 検証した保留値そのものを条件に昇格
    let promoted = state
        .user_repo
        .promote_pending_secret(user.id, pending)
        .await?;
    if !promoted {
        // 別の確認が先に昇格したか、保留が差し替えられていた
        tracing::warn!(user_id = %user.id, "2FA登録確認: 保留シークレットが既に無い");
        return Err(AppError::TotpNotPending);
    }

    tracing::info!(user_id = %user.id, "2FA有効化完了");

    Ok(Json(ConfirmResponse { enabled: true }))
}

// === Helper Functions ===

/// トークンのクレームに対応するユーザーを取得
async fn find_token_user(state: &AppState, claims: &AuthClaims) -> Result<User, AppError> {
    state
        .user_repo
        .find_by_id(claims.sub)
        .await?
        .ok_or(AppError::UserNotFound)
}

/// TOTPコードバリデーション
fn validate_totp_code(code: &str) -> Result<(), AppError> {
    if code.is_empty() {
        return Err(AppError::Validation("認証コードは必須です".to_string()));
    }
    if code.len() != 6 || !code.chars().all(|c| c.is_ascii_digit()) {
        return Err(AppError::Validation(
            "認証コードは6桁の数字で入力してください".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_empty_code() {
        let result = validate_totp_code("");
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_short_code() {
        let result = validate_totp_code("12345");
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_non_digit_code() {
        let result = validate_totp_code("12345a");
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_valid_code() {
        let result = validate_totp_code("123456");
        assert!(result.is_ok());
    }

    #[test]
    fn test_qr_response_is_data_uri() {
        let response = QrCodeResponse {
            image: format!("data:image/png;base64,{}", "QUJD"),
        };
        let value = serde_json::to_value(&response).unwrap();
        let image = value.get("image").and_then(|v| v.as_str()).unwrap();
        assert!(image.starts_with("data:image/png;base64,"));
    }
}
