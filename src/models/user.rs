use serde::Serialize;
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// 二要素認証の登録状態
///
/// Off → (QR発行) → Pending → (初回コード確認) → Active
///
/// Pending はログイン時のチャレンジ対象にならない。確認が完了して
/// Active になって初めてコード提出が要求される。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TwoFactorStatus {
    Off,
    Pending,
    Active,
}

/// ユーザーレコード
///
/// # Note
/// totp_secret_active / totp_secret_pending はAES-256-GCM暗号化済み
/// （12バイトnonce + 暗号文）。active は Active 状態のときのみ、
/// pending は Pending 状態のときのみ非NULL。
#[derive(Debug, FromRow, Serialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    #[serde(skip)]
    pub password_hash: String,
    pub two_factor_status: TwoFactorStatus,
    #[serde(skip)]
    pub totp_secret_active: Option<Vec<u8>>,
    #[serde(skip)]
    pub totp_secret_pending: Option<Vec<u8>>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl User {
    /// 2FAが有効（ログイン時にコード提出を要求する）か
    pub fn two_factor_active(&self) -> bool {
        self.two_factor_status == TwoFactorStatus::Active
    }
}
