use axum::{extract::FromRequestParts, http::request::Parts};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

/// ベアラートークンのクレーム
#[derive(Debug, Serialize, Deserialize)]
pub struct AuthClaims {
    /// ユーザーID
    pub sub: Uuid,
    pub email: String,
    /// 発行時刻（UNIX秒）
    pub iat: i64,
    /// 失効時刻（UNIX秒）
    pub exp: i64,
}

#[derive(Clone)]
struct TokenKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

/// ベアラートークンサービス（HS256）
///
/// # Note
/// 署名シークレットは起動時に無くてもサーバーは立ち上がる。
/// 未設定のままトークンの発行・検証に到達したリクエストだけが
/// Configuration エラー（500）になる。
#[derive(Clone)]
pub struct TokenService {
    keys: Option<TokenKeys>,
    ttl_secs: i64,
}

impl TokenService {
    pub fn new(secret: Option<&str>, ttl_secs: i64) -> Self {
        let keys = secret.map(|s| TokenKeys {
            encoding: EncodingKey::from_secret(s.as_bytes()),
            decoding: DecodingKey::from_secret(s.as_bytes()),
        });

        if keys.is_none() {
            tracing::warn!("JWT_SECRET 未設定: トークンを要する操作は 500 を返す");
        }

        Self { keys, ttl_secs }
    }

    fn keys(&self) -> Result<&TokenKeys, AppError> {
        self.keys.as_ref().ok_or_else(|| {
            tracing::error!("JWT_SECRET が未設定のためトークンを処理できない");
            AppError::Configuration("signing secret is not configured".to_string())
        })
    }

    /// トークンを発行
    pub fn issue(&self, user_id: Uuid, email: &str) -> Result<String, AppError> {
        let keys = self.keys()?;
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let claims = AuthClaims {
            sub: user_id,
            email: email.to_string(),
            iat: now,
            exp: now + self.ttl_secs,
        };

        encode(&Header::default(), &claims, &keys.encoding).map_err(|e| {
            tracing::error!(error = ?e, "トークン署名エラー");
            AppError::Internal(anyhow::anyhow!("token signing error"))
        })
    }

    /// トークンを検証してクレームを返す
    pub fn verify(&self, token: &str) -> Result<AuthClaims, AppError> {
        let keys = self.keys()?;
        let data = decode::<AuthClaims>(token, &keys.decoding, &Validation::default())
            .map_err(|e| {
                tracing::warn!(error = ?e, "トークン検証失敗");
                AppError::TokenInvalid
            })?;

        Ok(data.claims)
    }
}

/// Authorization ヘッダーからクレームを取り出すエクストラクター
///
/// # Note
/// - ヘッダーなし → 403 (TokenMissing)
/// - 署名・期限が無効 → 403 (TokenInvalid)
/// - シークレット未設定 → 500 (Configuration)
/// - `Bearer ` プレフィックスは任意（生トークンを送るクライアントも受け付ける）
impl FromRequestParts<AppState> for AuthClaims {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(http::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .ok_or(AppError::TokenMissing)?;

        let token = header.strip_prefix("Bearer ").unwrap_or(header);

        state.token_service.verify(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service_with_secret() -> TokenService {
        TokenService::new(Some("test-secret"), 3600)
    }

    #[test]
    fn test_issue_and_verify_roundtrip() {
        let service = service_with_secret();
        let user_id = Uuid::new_v4();

        let token = service.issue(user_id, "test@example.com").unwrap();
        let claims = service.verify(&token).unwrap();

        assert_eq!(claims.sub, user_id);
        assert_eq!(claims.email, "test@example.com");
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn test_verify_rejects_tampered_token() {
        let service = service_with_secret();
        let token = service.issue(Uuid::new_v4(), "test@example.com").unwrap();

        // 末尾（署名部分）を壊す
        let mut tampered = token.clone();
        tampered.pop();
        tampered.push(if token.ends_with('x') { 'y' } else { 'x' });

        let result = service.verify(&tampered);
        assert!(matches!(result, Err(AppError::TokenInvalid)));
    }

    #[test]
    fn test_verify_rejects_token_from_other_secret() {
        let service = service_with_secret();
        let other = TokenService::new(Some("another-secret"), 3600);

        let token = other.issue(Uuid::new_v4(), "test@example.com").unwrap();
        let result = service.verify(&token);
        assert!(matches!(result, Err(AppError::TokenInvalid)));
    }

    #[test]
    fn test_verify_rejects_expired_token() {
        // 検証側のleeway（60秒）を超えて過去に失効させる
        let expired = TokenService::new(Some("test-secret"), -7200);
        let token = expired.issue(Uuid::new_v4(), "test@example.com").unwrap();

        let result = expired.verify(&token);
        assert!(matches!(result, Err(AppError::TokenInvalid)));
    }

    #[test]
    fn test_missing_secret_is_per_request_error() {
        let service = TokenService::new(None, 3600);

        let issue = service.issue(Uuid::new_v4(), "test@example.com");
        assert!(matches!(issue, Err(AppError::Configuration(_))));

        let verify = service.verify("whatever");
        assert!(matches!(verify, Err(AppError::Configuration(_))));
    }
}
