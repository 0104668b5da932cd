use secrecy::SecretBox;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub database_url: SecretBox<String>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,

    // 2FA (TOTP) 設定
    /// TOTP発行者名（認証アプリとペアリングQRに表示される）
    pub totp_issuer: String,
    /// AES-256暗号化キー（Base64エンコード、32バイト）
    pub encryption_key: SecretBox<String>,
    /// TOTP検証で許容する前後ステップ数
    #[serde(default = "default_totp_skew")]
    pub totp_skew: u8,

    // ベアラートークン (JWT) 設定
    /// 署名シークレット（オプション）
    /// 未設定のままトークン操作に到達したリクエストは 500 を返す
    pub jwt_secret: Option<SecretBox<String>>,
    /// トークン有効期間（秒）
    #[serde(default = "default_jwt_ttl_secs")]
    pub jwt_ttl_secs: i64,
}

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_TOTP_SKEW: u8 = 1;
const DEFAULT_JWT_TTL_SECS: i64 = 3600;

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_totp_skew() -> u8 {
    DEFAULT_TOTP_SKEW
}

fn default_jwt_ttl_secs() -> i64 {
    DEFAULT_JWT_TTL_SECS
}

impl Config {
    pub fn load() -> Result<Self, envy::Error> {
        envy::from_env()
    }
}
