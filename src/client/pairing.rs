use rsa::pkcs8::{EncodePublicKey, LineEnding};
use rsa::{Oaep, RsaPrivateKey};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::sync::oneshot;

use super::ClientError;

/// RSA鍵長（ビット）
const RSA_KEY_BITS: usize = 2048;

/// ペアリング用の一時RSA鍵ペア
///
/// # Security
/// - 秘密鍵はこのプロセスのメモリにのみ存在する。シリアライズも送信もしない
/// - 外部に出るのはPEM化した公開鍵だけ（QRペイロード経由）
/// - ログインフローの寿命と同じ。セッションを破棄すれば鍵も消える
pub struct PairingKeys {
    private_key: RsaPrivateKey,
    public_key_pem: String,
}

impl PairingKeys {
    /// 鍵ペアを生成する
    ///
    /// # Note
    /// ブロッキング処理（数百ms〜）。非同期コンテキストからは
    /// [`KeyGenHandle::spawn`] を使うこと。
    pub fn generate() -> Result<Self, ClientError> {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, RSA_KEY_BITS)
            .map_err(|e| ClientError::KeyGeneration(e.to_string()))?;

        let public_key_pem = private_key
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| ClientError::KeyGeneration(e.to_string()))?;

        Ok(Self {
            private_key,
            public_key_pem,
        })
    }

    /// PEM形式（SubjectPublicKeyInfo）の公開鍵
    pub fn public_key_pem(&self) -> &str {
        &self.public_key_pem
    }

    /// リレー経由で届いた暗号文を復号してコード文字列を返す
    ///
    /// RSA-OAEP (SHA-256)。失敗は「コードが手元で回復できなかった」ことを
    /// 意味し、サーバー側の「コード不一致」とは区別される。
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<String, ClientError> {
        let plaintext = self
            .private_key
            .decrypt(Oaep::new::<Sha256>(), ciphertext)
            .map_err(|e| ClientError::Decrypt(e.to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|_| ClientError::Decrypt("decrypted code is not valid utf-8".to_string()))
    }
}

/// バックグラウンド鍵生成のハンドル
///
/// 生成はブロッキングプールへ逃がし、完了はワンショットチャネルで受ける。
/// タスクは切り離して走らせる。ハンドルを途中で破棄した場合、生成は
/// 完走するが結果は受け手がいないため破棄される。
pub struct KeyGenHandle {
    rx: oneshot::Receiver<Result<PairingKeys, ClientError>>,
}

impl KeyGenHandle {
    /// 鍵生成を開始する（非ブロッキング）
    pub fn spawn() -> Self {
        let (tx, rx) = oneshot::channel();
        tokio::task::spawn_blocking(move || {
            // 受け手が既に破棄されていれば結果は捨てられる
            let _ = tx.send(PairingKeys::generate());
        });

        Self { rx }
    }

    /// 完了チャネルへの可変参照（select分岐用）
    ///
    /// # Note
    /// 一度 Ready を返した後に再度ポーリングしないこと
    pub fn completion(&mut self) -> &mut oneshot::Receiver<Result<PairingKeys, ClientError>> {
        &mut self.rx
    }

    /// 完了を待って鍵ペアを受け取る
    pub async fn join(self) -> Result<PairingKeys, ClientError> {
        self.rx
            .await
            .map_err(|_| ClientError::KeyGeneration("keygen task dropped".to_string()))?
    }
}

/// コンパニオンアプリが読み取るQRペイロード
///
/// フィールド名は両端末間の契約（camelCase）。コンパニオンは relayUrl へ
/// 接続し、label/issuer で手元のアカウントを特定し、現在の認証コードを
/// publicKey で暗号化して websocketId 宛に送り返す。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QrPayload {
    pub relay_url: String,
    pub public_key: String,
    pub websocket_id: String,
    pub issuer: String,
    pub label: String,
}

impl QrPayload {
    /// QRに載せるJSON文字列
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::RsaPublicKey;
    use rsa::pkcs8::DecodePublicKey;
    use std::sync::OnceLock;

    // 鍵生成は重いのでテスト間で共有する
    static KEYS: OnceLock<(PairingKeys, PairingKeys)> = OnceLock::new();

    fn test_keys() -> &'static (PairingKeys, PairingKeys) {
        KEYS.get_or_init(|| {
            (
                PairingKeys::generate().unwrap(),
                PairingKeys::generate().unwrap(),
            )
        })
    }

    fn encrypt_for(pem: &str, plaintext: &str) -> Vec<u8> {
        let public_key = RsaPublicKey::from_public_key_pem(pem).unwrap();
        let mut rng = rand::thread_rng();
        public_key
            .encrypt(&mut rng, Oaep::new::<Sha256>(), plaintext.as_bytes())
            .unwrap()
    }

    #[test]
    fn test_public_key_pem_format() {
        let (keys, _) = test_keys();
        assert!(
            keys.public_key_pem()
                .starts_with("-----BEGIN PUBLIC KEY-----")
        );
    }

    #[test]
    fn test_decrypt_roundtrip() {
        let (keys, _) = test_keys();

        // 公開鍵はPEM経由で渡る（コンパニオン側と同じ経路）
        let ciphertext = encrypt_for(keys.public_key_pem(), "123456");
        let code = keys.decrypt(&ciphertext).unwrap();
        assert_eq!(code, "123456");
    }

    #[test]
    fn test_decrypt_with_wrong_key_fails() {
        let (keys, other) = test_keys();

        let ciphertext = encrypt_for(other.public_key_pem(), "123456");
        let result = keys.decrypt(&ciphertext);
        assert!(matches!(result, Err(ClientError::Decrypt(_))));
    }

    #[test]
    fn test_decrypt_garbage_fails() {
        let (keys, _) = test_keys();

        let result = keys.decrypt(&[0u8; 64]);
        assert!(matches!(result, Err(ClientError::Decrypt(_))));
    }

    #[test]
    fn test_qr_payload_field_names() {
        let payload = QrPayload {
            relay_url: "ws://relay.example.com".to_string(),
            public_key: "-----BEGIN PUBLIC KEY-----".to_string(),
            websocket_id: "abc123".to_string(),
            issuer: "TestApp".to_string(),
            label: "TestApp:alice@example.com".to_string(),
        };

        let value = serde_json::to_value(&payload).unwrap();
        // フィールド名はコンパニオンアプリが依存する契約
        assert!(value.get("relayUrl").is_some());
        assert!(value.get("publicKey").is_some());
        assert!(value.get("websocketId").is_some());
        assert!(value.get("issuer").is_some());
        assert!(value.get("label").is_some());
    }

    #[test]
    fn test_qr_payload_json_roundtrip() {
        let payload = QrPayload {
            relay_url: "ws://relay.example.com".to_string(),
            public_key: "pem".to_string(),
            websocket_id: "abc123".to_string(),
            issuer: "TestApp".to_string(),
            label: "TestApp:alice@example.com".to_string(),
        };

        let json = payload.to_json().unwrap();
        let parsed: QrPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, payload);
    }

    #[tokio::test]
    async fn test_keygen_handle_join() {
        let handle = KeyGenHandle::spawn();
        let keys = handle.join().await.unwrap();
        assert!(!keys.public_key_pem().is_empty());
    }
}
