use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::ClientError;

/// リレーチャネルから届くイベント
///
/// `Connected` / `Disconnected` はトランスポート層の状態遷移で、
/// リーダータスクが生成する。残り二つはワイヤ上のJSONエンベロープ由来。
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    Connected,
    Disconnected,
    /// リレーが割り当てたセッションID（コンパニオンへの宛先になる）
    SessionAssigned(String),
    /// コンパニオンから届いた暗号文（base64デコード済み）
    CodeDelivered(Vec<u8>),
}

/// ワイヤ上のJSONエンベロープ
#[derive(Debug, Deserialize)]
struct RelayFrame {
    event: String,
    #[serde(default)]
    data: String,
}

/// セッションID割り当てフレームの接頭辞
const CONN_ID_PREFIX: &str = "connId|";

/// テキストフレームをイベントへ変換する
///
/// 解釈できないフレーム（未知イベント、接頭辞欠落、壊れたbase64）は
/// None を返し、呼び出し側で破棄される。リレーは共有インフラであり、
/// 他セッション向けのノイズが混ざることを前提にする。
fn parse_frame(text: &str) -> Option<RelayEvent> {
    let frame: RelayFrame = serde_json::from_str(text).ok()?;

    match frame.event.as_str() {
        "message" => {
            let id = frame.data.strip_prefix(CONN_ID_PREFIX)?;
            if id.is_empty() {
                return None;
            }
            Some(RelayEvent::SessionAssigned(id.to_string()))
        }
        "sendCode" => {
            let ciphertext = STANDARD.decode(&frame.data).ok()?;
            if ciphertext.is_empty() {
                return None;
            }
            Some(RelayEvent::CodeDelivered(ciphertext))
        }
        _ => None,
    }
}

/// リレーサーバーへの受信専用チャネル
///
/// 接続後はリーダータスクがフレームを [`RelayEvent`] へ変換して流す。
/// このハンドルを破棄するとリーダータスクも停止する。
pub struct RelayChannel {
    events: mpsc::Receiver<RelayEvent>,
}

impl RelayChannel {
    /// リレーサーバーへ接続し、受信ループを開始する
    pub async fn connect(url: &str) -> Result<Self, ClientError> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| ClientError::Relay(e.to_string()))?;

        tracing::debug!(url = %url, "リレーサーバーへ接続した");

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(reader_task(ws_stream, tx));

        Ok(Self { events: rx })
    }

    /// 次のイベントを待つ。チャネルが閉じたら None
    pub async fn recv(&mut self) -> Option<RelayEvent> {
        self.events.recv().await
    }
}

/// 受信ループ。ソケットかチャネルのどちらかが閉じるまで回る
async fn reader_task(
    mut ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    tx: mpsc::Sender<RelayEvent>,
) {
    if tx.send(RelayEvent::Connected).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            // 受け手が先に消えたら読み続ける意味がない
            _ = tx.closed() => {
                tracing::debug!("リレー受信側が破棄されたためリーダーを停止する");
                break;
            }
            message = ws_stream.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        match parse_frame(text.as_str()) {
                            Some(event) => {
                                if tx.send(event).await.is_err() {
                                    break;
                                }
                            }
                            None => {
                                tracing::warn!(frame = %text, "解釈できないリレーフレームを破棄した");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        let _ = tx.send(RelayEvent::Disconnected).await;
                        break;
                    }
                    // ping/pong/バイナリは無視する
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "リレー受信でエラーが発生した");
                        let _ = tx.send(RelayEvent::Disconnected).await;
                        break;
                    }
                }
            }
        }
    }
}
