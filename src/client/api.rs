use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ClientError;

/// ログイン成功時にサーバーから受け取るセッション情報
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LoginGrant {
    pub id: Uuid,
    pub email: String,
    /// このログインで2FAを通過したか
    #[serde(rename = "is2FAon")]
    pub is_2fa_on: bool,
    /// ベアラートークン
    pub token: String,
}

/// 登録成功時にサーバーから受け取る情報
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Registration {
    pub id: Uuid,
    pub email: String,
    /// 新規ユーザーの2FAは常に無効で開始
    #[serde(rename = "isTwoFAon")]
    pub is_two_fa_on: bool,
}

/// 1回のログイン要求の結果
///
/// チャレンジ（CodeRequired）はエラーではなくプロトコルの第2ステップ。
/// 拒否（Rejected）だけが失敗として扱われる。
#[derive(Debug, PartialEq)]
pub enum LoginOutcome {
    /// 認証成立（トークン発行済み）
    Granted(LoginGrant),
    /// 2FAコードの提出が必要
    CodeRequired { issuer: String, label: String },
    /// 拒否（資格情報不一致、コード不一致、設定不備など）
    Rejected { status: u16, message: String },
}

#[derive(Debug, Serialize)]
struct LoginBody<'a> {
    login: &'a str,
    password: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct RegisterBody<'a> {
    login: &'a str,
    password: &'a str,
}

/// 認証APIクライアント
#[derive(Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    /// 新しい ApiClient を作成
    ///
    /// # Arguments
    /// * `base_url` - 認証サーバーのベースURL（末尾スラッシュなし）
    pub fn new(base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }

    /// ログイン要求を送信する
    ///
    /// ステータスとボディを [`LoginOutcome`] へ写像して返す。
    /// ネットワーク障害だけが Err になる。
    pub async fn login(
        &self,
        login: &str,
        password: &str,
        code: Option<&str>,
    ) -> Result<LoginOutcome, ClientError> {
        let url = format!("{}/login", self.base_url);

        let response = self
            .client
            .post(&url)
            .json(&LoginBody {
                login,
                password,
                code,
            })
            .send()
            .await?;

        let status = response.status().as_u16();

        if response.status().is_success() {
            let grant: LoginGrant = response.json().await?;
            tracing::debug!(email = %grant.email, "ログイン成立");
            return Ok(LoginOutcome::Granted(grant));
        }

        // 失敗ボディはJSONでないこともあるため寛容にパースする
        let body: serde_json::Value = response.json().await.unwrap_or_default();
        Ok(map_login_failure(status, &body))
    }

    /// 新規ユーザーを登録する
    pub async fn register(&self, login: &str, password: &str) -> Result<Registration, ClientError> {
        let url = format!("{}/register", self.base_url);

        let response = self
            .client
            .post(&url)
            .json(&RegisterBody { login, password })
            .send()
            .await?;

        let status = response.status().as_u16();

        if response.status().is_success() {
            let registration: Registration = response.json().await?;
            tracing::debug!(email = %registration.email, "登録成功");
            return Ok(registration);
        }

        let body: serde_json::Value = response.json().await.unwrap_or_default();
        let message = extract_error_message(&body)
            .unwrap_or_else(|| format!("registration failed (status {status})"));
        Err(ClientError::Rejected(message))
    }
}

/// ログイン失敗レスポンスを判別する
///
/// codeRequired が判別キー。true ならチャレンジ（第2ステップ）、
/// false または欠落なら拒否として扱う。
fn map_login_failure(status: u16, body: &serde_json::Value) -> LoginOutcome {
    if body.get("codeRequired").and_then(|v| v.as_bool()) == Some(true) {
        let issuer = body
            .get("issuer")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let label = body
            .get("label")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        return LoginOutcome::CodeRequired { issuer, label };
    }

    let message = extract_error_message(body)
        .unwrap_or_else(|| format!("login rejected (status {status})"));
    LoginOutcome::Rejected { status, message }
}

fn extract_error_message(body: &serde_json::Value) -> Option<String> {
    body.get("error")
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_challenge_detected_by_code_required_flag() {
        let body = json!({
            "codeRequired": true,
            "issuer": "TestApp",
            "label": "TestApp:alice@example.com"
        });

        let outcome = map_login_failure(401, &body);
        assert_eq!(
            outcome,
            LoginOutcome::CodeRequired {
                issuer: "TestApp".to_string(),
                label: "TestApp:alice@example.com".to_string(),
            }
        );
    }

    #[test]
    fn test_code_required_false_is_rejection() {
        // 404 はユーザー不在とコード不一致の両方で返る
        let body = json!({ "codeRequired": false, "error": "not found" });

        let outcome = map_login_failure(404, &body);
        assert_eq!(
            outcome,
            LoginOutcome::Rejected {
                status: 404,
                message: "not found".to_string(),
            }
        );
    }

    #[test]
    fn test_missing_code_required_is_rejection() {
        let body = json!({ "error": "forbidden" });

        let outcome = map_login_failure(403, &body);
        assert!(matches!(
            outcome,
            LoginOutcome::Rejected { status: 403, .. }
        ));
    }

    #[test]
    fn test_empty_body_rejection_keeps_status() {
        let outcome = map_login_failure(500, &serde_json::Value::Null);
        match outcome {
            LoginOutcome::Rejected { status, message } => {
                assert_eq!(status, 500);
                assert!(message.contains("500"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_grant_parses_contract_fields() {
        let id = Uuid::new_v4();
        let grant: LoginGrant = serde_json::from_value(json!({
            "id": id,
            "email": "alice@example.com",
            "is2FAon": true,
            "token": "jwt-token"
        }))
        .unwrap();

        assert_eq!(grant.id, id);
        assert!(grant.is_2fa_on);
        assert_eq!(grant.token, "jwt-token");
    }

    #[test]
    fn test_registration_parses_contract_fields() {
        // 登録側は isTwoFAon（ログイン側の is2FAon と綴りが異なる）
        let registration: Registration = serde_json::from_value(json!({
            "id": Uuid::new_v4(),
            "email": "alice@example.com",
            "isTwoFAon": false
        }))
        .unwrap();

        assert!(!registration.is_two_fa_on);
    }

    #[test]
    fn test_login_body_omits_absent_code() {
        let body = LoginBody {
            login: "alice@example.com",
            password: "pw123",
            code: None,
        };
        let value = serde_json::to_value(&body).unwrap();
        // 第1段階のリクエストに code キーは現れない
        assert!(value.get("code").is_none());

        let with_code = LoginBody {
            login: "alice@example.com",
            password: "pw123",
            code: Some("123456"),
        };
        let value = serde_json::to_value(&with_code).unwrap();
        assert_eq!(value.get("code"), Some(&json!("123456")));
    }
}
