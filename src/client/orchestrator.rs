//! ログインフローの状態機械と非同期ドライバ
//!
//! 判断はすべて純関数 [`reduce`] に集約する。入出力（HTTP、復号、QR表示、
//! リレー受信、鍵生成）は [`LoginSession::run`] が効果として実行し、
//! 結果をイベントとして還元する。順序依存のロジックが一箇所に集まるため、
//! ネットワークなしで遷移表全体をテストできる。

use std::collections::VecDeque;

use super::ClientError;
use super::api::{ApiClient, LoginGrant, LoginOutcome};
use super::pairing::{KeyGenHandle, PairingKeys, QrPayload};
use super::relay::{RelayChannel, RelayEvent};

/// フローの現在地
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    /// 資格情報の入力待ち
    AwaitingCredentials,
    /// 初回ログインの応答待ち（成立かチャレンジか）
    AwaitingChallengeDecision,
    /// リレー経由のコード配信待ち
    AwaitingRelayCode,
    /// 受信した暗号文を復号中
    Decrypting,
    /// コード付き再ログインの応答待ち
    Submitting,
    /// 完了（以降のイベントはすべて無視）
    Done,
}

/// フローへ入ってくる事実
#[derive(Debug, Clone, PartialEq)]
pub enum FlowEvent {
    CredentialsSubmitted,
    /// サーバーが2FAコードを要求した
    ChallengeReceived { issuer: String, label: String },
    /// ログイン成立
    Granted(LoginGrant),
    /// ログイン拒否（資格情報エラー、コード不一致など）
    Rejected { message: String },
    RelayConnected,
    RelayDisconnected,
    /// リレーがセッションIDを割り当てた
    SessionAssigned(String),
    /// コンパニオンから暗号文が届いた
    CodeDelivered(Vec<u8>),
    /// 鍵ペアの生成が完了した
    KeysReady { public_key_pem: String },
    KeyGenFailed { message: String },
    /// 暗号文の復号に成功した
    CodeDecrypted(String),
    DecryptFailed { message: String },
}

/// フローから出ていく指示
#[derive(Debug, Clone, PartialEq)]
pub enum FlowEffect {
    /// ログインAPIを呼ぶ（code は2巡目のみ Some）
    SubmitLogin { code: Option<String> },
    /// 暗号文を秘密鍵で復号する
    Decrypt(Vec<u8>),
    /// ペアリングQRを表示する
    RenderQr,
    /// 致命的でない問題をユーザーへ通知する
    Notify(String),
    /// フローを失敗として終える
    SurfaceError(String),
    /// フローを成功として終える
    CompleteLogin(Box<LoginGrant>),
}

/// ログインフローの累積状態
///
/// QRペイロードの材料（issuer/label はチャレンジ応答、websocket_id は
/// リレー、public_key_pem は鍵生成タスク由来）は到着順が不定なので、
/// 揃った瞬間を [`reduce`] が検出して一度だけ RenderQr を出す。
#[derive(Debug, Clone)]
pub struct LoginFlow {
    state: FlowState,
    issuer: Option<String>,
    label: Option<String>,
    websocket_id: Option<String>,
    public_key_pem: Option<String>,
    qr_rendered: bool,
}

impl LoginFlow {
    pub fn new() -> Self {
        Self {
            state: FlowState::AwaitingCredentials,
            issuer: None,
            label: None,
            websocket_id: None,
            public_key_pem: None,
            qr_rendered: false,
        }
    }

    pub fn state(&self) -> FlowState {
        self.state
    }
}

impl Default for LoginFlow {
    fn default() -> Self {
        Self::new()
    }
}

/// 状態遷移の純関数
///
/// # Note
/// 重複配信への耐性はここで持つ。復号または再送信の最中に届いた
/// `CodeDelivered` は捨て、復号・再送信サイクルを同時に一つまでに抑える。
pub fn reduce(mut flow: LoginFlow, event: FlowEvent) -> (LoginFlow, Vec<FlowEffect>) {
    // 完了後のフローは何も受け付けない
    if flow.state == FlowState::Done {
        return (flow, vec![]);
    }

    match event {
        FlowEvent::CredentialsSubmitted => {
            if flow.state == FlowState::AwaitingCredentials {
                flow.state = FlowState::AwaitingChallengeDecision;
                return (flow, vec![FlowEffect::SubmitLogin { code: None }]);
            }
            (flow, vec![])
        }
        FlowEvent::Granted(grant) => match flow.state {
            FlowState::AwaitingChallengeDecision | FlowState::Submitting => {
                flow.state = FlowState::Done;
                (flow, vec![FlowEffect::CompleteLogin(Box::new(grant))])
            }
            _ => (flow, vec![]),
        },
        FlowEvent::ChallengeReceived { issuer, label } => match flow.state {
            FlowState::AwaitingChallengeDecision | FlowState::Submitting => {
                flow.state = FlowState::AwaitingRelayCode;
                flow.issuer = Some(issuer);
                flow.label = Some(label);
                let effects = maybe_render_qr(&mut flow);
                (flow, effects)
            }
            _ => (flow, vec![]),
        },
        FlowEvent::Rejected { message } => match flow.state {
            FlowState::AwaitingChallengeDecision | FlowState::Submitting => {
                flow.state = FlowState::AwaitingCredentials;
                (flow, vec![FlowEffect::SurfaceError(message)])
            }
            _ => (flow, vec![]),
        },
        FlowEvent::CodeDelivered(ciphertext) => match flow.state {
            FlowState::AwaitingRelayCode => {
                flow.state = FlowState::Decrypting;
                (flow, vec![FlowEffect::Decrypt(ciphertext)])
            }
            // サイクル進行中の重複配信は捨てる
            _ => (flow, vec![]),
        },
        FlowEvent::CodeDecrypted(code) => match flow.state {
            FlowState::Decrypting => {
                flow.state = FlowState::Submitting;
                (flow, vec![FlowEffect::SubmitLogin { code: Some(code) }])
            }
            _ => (flow, vec![]),
        },
        FlowEvent::DecryptFailed { message } => match flow.state {
            FlowState::Decrypting => {
                // 失敗はフローの終わりではない。再配信を受けられる状態に戻す
                flow.state = FlowState::AwaitingRelayCode;
                (flow, vec![FlowEffect::Notify(message)])
            }
            _ => (flow, vec![]),
        },
        FlowEvent::SessionAssigned(id) => {
            flow.websocket_id = Some(id);
            let effects = maybe_render_qr(&mut flow);
            (flow, effects)
        }
        FlowEvent::KeysReady { public_key_pem } => {
            flow.public_key_pem = Some(public_key_pem);
            let effects = maybe_render_qr(&mut flow);
            (flow, effects)
        }
        FlowEvent::KeyGenFailed { message } => (flow, vec![FlowEffect::Notify(message)]),
        FlowEvent::RelayConnected => (flow, vec![]),
        FlowEvent::RelayDisconnected => match flow.state {
            // コードをリレー経由で待っている間の切断だけが致命的
            FlowState::AwaitingRelayCode | FlowState::Decrypting => {
                flow.state = FlowState::AwaitingCredentials;
                (
                    flow,
                    vec![FlowEffect::SurfaceError(
                        "リレー接続が切断されました".to_string(),
                    )],
                )
            }
            _ => (flow, vec![]),
        },
    }
}

/// QRの材料が揃った最初の一度だけ RenderQr を出す
fn maybe_render_qr(flow: &mut LoginFlow) -> Vec<FlowEffect> {
    if flow.state == FlowState::AwaitingRelayCode
        && !flow.qr_rendered
        && flow.issuer.is_some()
        && flow.websocket_id.is_some()
        && flow.public_key_pem.is_some()
    {
        flow.qr_rendered = true;
        return vec![FlowEffect::RenderQr];
    }
    vec![]
}

fn qr_payload(flow: &LoginFlow, relay_url: &str) -> Option<QrPayload> {
    Some(QrPayload {
        relay_url: relay_url.to_string(),
        public_key: flow.public_key_pem.clone()?,
        websocket_id: flow.websocket_id.clone()?,
        issuer: flow.issuer.clone()?,
        label: flow.label.clone()?,
    })
}

fn validate_credentials(login: &str, password: &str) -> Result<(), ClientError> {
    if login.trim().is_empty() || !login.contains('@') {
        return Err(ClientError::Validation(
            "有効なメールアドレスを入力してください".to_string(),
        ));
    }
    if password.is_empty() {
        return Err(ClientError::Validation(
            "パスワードは必須です".to_string(),
        ));
    }
    Ok(())
}

/// 1回のログイン試行を動かす非同期ドライバ
///
/// リレー接続と鍵生成はログインフォームの表示時点（[`LoginSession::begin`]）
/// で始める。チャレンジが返る頃には両方揃っていることが多く、QR表示までの
/// 待ち時間が短くなる。秘密鍵はこの構造体の外へ出ない。
pub struct LoginSession {
    api: ApiClient,
    relay: RelayChannel,
    keygen: KeyGenHandle,
    relay_url: String,
}

impl LoginSession {
    /// リレーへ接続し、鍵生成を開始する
    pub async fn begin(api_base_url: String, relay_url: String) -> Result<Self, ClientError> {
        let relay = RelayChannel::connect(&relay_url).await?;
        let keygen = KeyGenHandle::spawn();

        Ok(Self {
            api: ApiClient::new(api_base_url),
            relay,
            keygen,
            relay_url,
        })
    }

    /// 資格情報の送信から完了までフローを駆動する
    ///
    /// `on_qr` はペアリングQRの材料が揃った時点で一度だけ呼ばれる。
    /// 成立時はセッション情報を返し、拒否・切断は Err で返る。
    pub async fn run(
        mut self,
        login: &str,
        password: &str,
        mut on_qr: impl FnMut(&QrPayload),
    ) -> Result<LoginGrant, ClientError> {
        validate_credentials(login, password)?;

        let mut flow = LoginFlow::new();
        let mut keys: Option<PairingKeys> = None;
        let mut keys_pending = true;
        let mut queue: VecDeque<FlowEffect> = VecDeque::new();

        let (next, effects) = reduce(flow, FlowEvent::CredentialsSubmitted);
        flow = next;
        queue.extend(effects);

        loop {
            // 溜まった効果を先に消化する。イベント待ちは常に効果ゼロの状態から
            while let Some(effect) = queue.pop_front() {
                match effect {
                    FlowEffect::SubmitLogin { code } => {
                        let outcome = self.api.login(login, password, code.as_deref()).await?;
                        let event = match outcome {
                            LoginOutcome::Granted(grant) => FlowEvent::Granted(grant),
                            LoginOutcome::CodeRequired { issuer, label } => {
                                FlowEvent::ChallengeReceived { issuer, label }
                            }
                            LoginOutcome::Rejected { message, .. } => {
                                FlowEvent::Rejected { message }
                            }
                        };
                        let (next, effects) = reduce(flow, event);
                        flow = next;
                        queue.extend(effects);
                    }
                    FlowEffect::Decrypt(ciphertext) => {
                        let event = match keys.as_ref() {
                            Some(keys) => match keys.decrypt(&ciphertext) {
                                Ok(code) => FlowEvent::CodeDecrypted(code),
                                Err(e) => FlowEvent::DecryptFailed {
                                    message: e.to_string(),
                                },
                            },
                            None => FlowEvent::DecryptFailed {
                                message: "鍵ペアがまだ生成されていません".to_string(),
                            },
                        };
                        let (next, effects) = reduce(flow, event);
                        flow = next;
                        queue.extend(effects);
                    }
                    FlowEffect::RenderQr => {
                        if let Some(payload) = qr_payload(&flow, &self.relay_url) {
                            on_qr(&payload);
                        }
                    }
                    FlowEffect::Notify(message) => {
                        tracing::warn!(message = %message, "ログインフローからの通知");
                    }
                    FlowEffect::SurfaceError(message) => {
                        return Err(ClientError::Rejected(message));
                    }
                    FlowEffect::CompleteLogin(grant) => {
                        return Ok(*grant);
                    }
                }
            }

            let event = tokio::select! {
                event = self.relay.recv() => match event {
                    Some(RelayEvent::Connected) => FlowEvent::RelayConnected,
                    Some(RelayEvent::SessionAssigned(id)) => FlowEvent::SessionAssigned(id),
                    Some(RelayEvent::CodeDelivered(ciphertext)) => {
                        FlowEvent::CodeDelivered(ciphertext)
                    }
                    Some(RelayEvent::Disconnected) | None => FlowEvent::RelayDisconnected,
                },
                // ワンショットは完了後に再ポーリングできないためガードで外す
                result = self.keygen.completion(), if keys_pending => {
                    keys_pending = false;
                    match result {
                        Ok(Ok(generated)) => {
                            let public_key_pem = generated.public_key_pem().to_string();
                            keys = Some(generated);
                            FlowEvent::KeysReady { public_key_pem }
                        }
                        Ok(Err(e)) => FlowEvent::KeyGenFailed {
                            message: e.to_string(),
                        },
                        Err(_) => FlowEvent::KeyGenFailed {
                            message: "鍵生成タスクが中断されました".to_string(),
                        },
                    }
                }
            };

            let (next, effects) = reduce(flow, event);
            flow = next;
            queue.extend(effects);
        }
    }
}
