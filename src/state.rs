use std::sync::Arc;

use secrecy::ExposeSecret;
use sqlx::PgPool;

use crate::config::Config;
use crate::error::AppError;
use crate::repositories::UserRepository;
use crate::services::{TokenService, TotpService};

/// アプリケーション共有状態
///
/// axum の State として全ハンドラーで共有される。
/// Clone は必須（axum が内部で clone するため）。
#[derive(Clone)]
pub struct AppState {
    /// PostgreSQL コネクションプール
    pub db_pool: PgPool,
    /// アプリケーション設定（Arc で共有）
    pub config: Arc<Config>,
    /// ユーザーリポジトリ
    pub user_repo: UserRepository,
    /// TOTPサービス
    pub totp_service: TotpService,
    /// ベアラートークンサービス
    pub token_service: TokenService,
}

impl AppState {
    /// 新しい AppState を作成
    pub fn new(db_pool: PgPool, config: Config) -> Result<Self, AppError> {
        let config = Arc::new(config);
        let user_repo = UserRepository::new(db_pool.clone());
        let totp_service = TotpService::new(
            config.totp_issuer.clone(),
            config.encryption_key.expose_secret(),
            config.totp_skew,
        )?;

        // シークレット未設定でも起動は継続する（該当リクエストのみ500）
        let token_service = TokenService::new(
            config.jwt_secret.as_ref().map(|s| s.expose_secret().as_str()),
            config.jwt_ttl_secs,
        );

        Ok(Self {
            db_pool,
            config,
            user_repo,
            totp_service,
            token_service,
        })
    }
}
