use argon2::password_hash::SaltString;
use argon2::password_hash::rand_core::OsRng;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};

use crate::error::AppError;
use crate::models::User;

/// パスワードをargon2idでハッシュ化
pub fn hash_password(password: &str) -> Result<String, AppError> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| {
            tracing::error!(error = ?e, "パスワードハッシュ生成エラー");
            AppError::Internal(anyhow::anyhow!("password hash error"))
        })?;
    Ok(hash.to_string())
}

/// パスワードを検証
pub fn verify_password(password: &str, hash: &str) -> Result<bool, AppError> {
    let parsed_hash = PasswordHash::new(hash).map_err(|e| {
        tracing::error!(error = ?e, "パスワードハッシュのパースエラー");
        AppError::Internal(anyhow::anyhow!("password hash parse error"))
    })?;

    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}

/// 資格情報チェック（2FAゲートの前段）
///
/// ユーザー不在とパスワード不一致は別のエラーとして返す（404 / 403）。
/// 2FAの状態に関わらず、このチェックは必ずコード検証より先に行うこと。
/// 資格情報が通らない限りチャレンジは発行されない。
pub fn check_credentials<'a>(user: Option<&'a User>, password: &str) -> Result<&'a User, AppError> {
    let user = user.ok_or(AppError::UserNotFound)?;

    if verify_password(password, &user.password_hash)? {
        Ok(user)
    } else {
        tracing::warn!(email = %user.email, "認証失敗: パスワード不一致");
        Err(AppError::CredentialMismatch)
    }
}
