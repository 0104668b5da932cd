//! ログインフローのクライアント側実装
//!
//! サーバーの2FAゲートに対する「もう一方の端」。資格情報の送信、
//! チャレンジ受信、ペアリング鍵の生成とQR表示、リレー経由での
//! コード受信・復号・自動再送信までを [`orchestrator::LoginSession`] が束ねる。

pub mod api;
pub mod orchestrator;
pub mod pairing;
pub mod relay;

pub use api::{ApiClient, LoginGrant, LoginOutcome, Registration};
pub use orchestrator::{FlowEffect, FlowEvent, FlowState, LoginFlow, LoginSession};
pub use pairing::{KeyGenHandle, PairingKeys, QrPayload};
pub use relay::{RelayChannel, RelayEvent};

/// クライアント側エラー
///
/// # Note
/// Decrypt はサーバーの「コード不一致」とは別物で、コードが手元で
/// 回復できなかったことを意味する。このときフローは完了せず、
/// 再ペアリング（コードの再受信）が許される。
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("入力エラー: {0}")]
    Validation(String),

    #[error("ログイン拒否: {0}")]
    Rejected(String),

    #[error("鍵生成エラー: {0}")]
    KeyGeneration(String),

    #[error("復号エラー: {0}")]
    Decrypt(String),

    #[error("リレー接続エラー: {0}")]
    Relay(String),

    #[error("通信エラー")]
    Transport(#[from] reqwest::Error),
}
