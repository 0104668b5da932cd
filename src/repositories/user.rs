use sqlx::PgPool;
use uuid::Uuid;

use crate::models::User;

#[derive(Clone)]
pub struct UserRepository {
    pool: PgPool,
}

impl UserRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// メールアドレスでユーザーを検索
    ///
    /// # Note
    /// DB セットアップ後は `query_as!` マクロに変更してコンパイル時SQL検証を有効にすること
    pub async fn find_by_email(&self, email: &str) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as::<_, User>(
            r#"
            SELECT id, email, password_hash, two_factor_status,
                   totp_secret_active, totp_secret_pending, created_at, updated_at
            FROM users
            WHERE email = $1
            "#,
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await
    }

    /// ユーザーIDでユーザーを検索
    pub async fn find_by_id(&self, user_id: Uuid) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as::<_, User>(
            r#"
            SELECT id, email, password_hash, two_factor_status,
                   totp_secret_active, totp_secret_pending, created_at, updated_at
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
    }

    /// 新しいユーザーを作成（2FAは Off 状態で開始）
    ///
    /// # Errors
    /// - UNIQUE制約違反時: `sqlx::Error::Database` (constraint = "users_email_key")
    ///   呼び出し側で `AppError::EmailAlreadyExists` に変換すること
    pub async fn create_user(&self, email: &str, password_hash: &str) -> Result<User, sqlx::Error> {
        sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (email, password_hash, two_factor_status)
            VALUES ($1, $2, 'off')
            RETURNING id, email, password_hash, two_factor_status,
                      totp_secret_active, totp_secret_pending, created_at, updated_at
            "#,
        )
        .bind(email)
        .bind(password_hash)
        .fetch_one(&self.pool)
        .await
    }

    /// 保留シークレットを登録し、状態を Pending にする
    ///
    /// # Note
    /// 既存の保留シークレットは無条件に置き換える（QR再発行で古い保留分は失効、
    /// 蓄積しない）。本シークレット（totp_secret_active）には触れない。
    pub async fn set_pending_secret(
        &self,
        user_id: Uuid,
        secret_encrypted: &[u8],
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE users
            SET totp_secret_pending = $2, two_factor_status = 'pending', updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .bind(secret_encrypted)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// 保留シークレットを本シークレットへ昇格し、状態を Active にする
    ///
    /// 昇格は単一の条件付きUPDATEで行う。保留値が検証済みの値と一致する
    /// 行だけが更新されるため、並行する確認リクエストのうち勝者は1つ。
    /// 0行更新（false）は保留シークレットが存在しないか、既に昇格済み・
    /// 差し替え済みであることを意味する。
    pub async fn promote_pending_secret(
        &self,
        user_id: Uuid,
        verified_secret_encrypted: &[u8],
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET totp_secret_active = totp_secret_pending,
                totp_secret_pending = NULL,
                two_factor_status = 'active',
                updated_at = NOW()
            WHERE id = $1 AND totp_secret_pending = $2
            "#,
        )
        .bind(user_id)
        .bind(verified_secret_encrypted)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
