//! 基于 WebSocket 的推送通道
//!
//! 每次 `open` 启动一个后台任务负责建连、收发和断线重连。
//! 帧格式为 `{"event": ..., "data": ...}` 的 JSON 文本。

use application::{PushChannel, PushTransport, TransportError, TransportEvent};
use domain::{ClientEvent, Identity, ServerEvent};
use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::backoff::ReconnectPolicy;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket 推送通道
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    url: String,
    token: Option<String>,
    policy: ReconnectPolicy,
}

enum SessionEnd {
    /// 客户端丢弃了出站发送端
    ClientClosed,
    Lost(String),
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>, token: Option<String>, policy: ReconnectPolicy) -> Self {
        Self {
            url: url.into(),
            token,
            policy,
        }
    }

    /// 带身份参数的连接地址
    pub(crate) fn endpoint(&self, identity: &Identity) -> Result<String, TransportError> {
        let mut url = Url::parse(&self.url)
            .map_err(|err| TransportError::Connect(format!("invalid url {}: {err}", self.url)))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("userId", identity.as_str());
            if let Some(token) = &self.token {
                query.append_pair("token", token);
            }
        }
        Ok(url.into())
    }
}

impl PushTransport for WebSocketTransport {
    fn open(&self, identity: &Identity) -> PushChannel {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        match self.endpoint(identity) {
            Ok(endpoint) => {
                tokio::spawn(run(
                    endpoint,
                    self.policy.clone(),
                    event_tx,
                    outbound_rx,
                ));
            }
            Err(err) => {
                warn!(error = %err, "推送通道地址无效");
                let _ = event_tx.send(TransportEvent::Failed {
                    reason: err.to_string(),
                });
            }
        }

        PushChannel {
            events: event_rx,
            outbound: outbound_tx,
        }
    }
}

async fn run(
    endpoint: String,
    policy: ReconnectPolicy,
    events: mpsc::UnboundedSender<TransportEvent>,
    mut outbound: mpsc::UnboundedReceiver<ClientEvent>,
) {
    let mut attempt = 0u32;
    loop {
        let reason = match connect_async(endpoint.as_str()).await {
            Ok((socket, _response)) => {
                info!("推送通道已连接");
                attempt = 0;
                if events.send(TransportEvent::Connected).is_err() {
                    return;
                }
                match pump(socket, &events, &mut outbound).await {
                    SessionEnd::ClientClosed => {
                        debug!("客户端关闭推送通道");
                        return;
                    }
                    SessionEnd::Lost(reason) => reason,
                }
            }
            Err(err) => err.to_string(),
        };

        warn!(reason = %reason, attempt, "推送通道断开");
        if events
            .send(TransportEvent::Disconnected {
                reason: reason.clone(),
            })
            .is_err()
        {
            return;
        }

        attempt += 1;
        if !policy.should_retry(attempt) {
            warn!(attempts = attempt - 1, "推送通道放弃重连");
            let _ = events.send(TransportEvent::Failed { reason });
            return;
        }

        let delay = policy.backoff.jittered_delay_at(attempt);
        debug!(attempt, delay_ms = delay.as_millis() as u64, "等待重连");
        if !wait_or_closed(delay, &mut outbound).await {
            return;
        }
        if events
            .send(TransportEvent::Reconnecting { attempt })
            .is_err()
        {
            return;
        }
    }
}

// 等待退避时间；期间客户端关闭则返回 false
async fn wait_or_closed(
    delay: std::time::Duration,
    outbound: &mut mpsc::UnboundedReceiver<ClientEvent>,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            event = outbound.recv() => match event {
                Some(event) => debug!(event = event.name(), "未连接，丢弃出站事件"),
                None => return false,
            },
        }
    }
}

async fn pump(
    socket: Socket,
    events: &mpsc::UnboundedSender<TransportEvent>,
    outbound: &mut mpsc::UnboundedReceiver<ClientEvent>,
) -> SessionEnd {
    let (mut sink, mut source) = socket.split();
    loop {
        tokio::select! {
            incoming = source.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => {
                            if events.send(TransportEvent::Event(event)).is_err() {
                                let _ = sink.close().await;
                                return SessionEnd::ClientClosed;
                            }
                        }
                        Err(err) => warn!(error = %err, "无法解析推送帧，已忽略"),
                    }
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    let reason = frame
                        .map(|frame| frame.reason.to_string())
                        .filter(|reason| !reason.is_empty())
                        .unwrap_or_else(|| "closed by server".to_owned());
                    return SessionEnd::Lost(reason);
                }
                // ping/pong 由底层自动处理
                Some(Ok(_)) => {}
                Some(Err(err)) => return SessionEnd::Lost(err.to_string()),
                None => return SessionEnd::Lost("stream ended".to_owned()),
            },
            outgoing = outbound.recv() => match outgoing {
                Some(event) => match serde_json::to_string(&event) {
                    Ok(json) => {
                        if let Err(err) = sink.send(WsMessage::Text(json.into())).await {
                            return SessionEnd::Lost(err.to_string());
                        }
                    }
                    Err(err) => warn!(event = event.name(), error = %err, "出站事件序列化失败"),
                },
                None => {
                    let _ = sink.close().await;
                    return SessionEnd::ClientClosed;
                }
            },
        }
    }
}
