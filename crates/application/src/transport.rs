//! 推送通道抽象
//!
//! 传输层自己负责建连、断线重连和退避；同步核心只通过 [`TransportEvent`] 观察结果。

use domain::{ClientEvent, Identity, ServerEvent};
use tokio::sync::mpsc;

/// 传输层上报给连接管理器的事件
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// 已建立（或重新建立）连接
    Connected,
    /// 连接断开，传输层即将按自己的退避策略重连
    Disconnected { reason: String },
    /// 正在重连
    Reconnecting { attempt: u32 },
    /// 放弃重连，不会再有后续事件
    Failed { reason: String },
    /// 服务器推送
    Event(ServerEvent),
}

/// 一次打开得到的双向通道。丢弃 `outbound` 即要求传输层关闭连接。
#[derive(Debug)]
pub struct PushChannel {
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
    pub outbound: mpsc::UnboundedSender<ClientEvent>,
}

pub trait PushTransport: Send + Sync {
    /// 非阻塞地开始建连，必须在 tokio 运行时内调用
    fn open(&self, identity: &Identity) -> PushChannel;
}

/// 内存实现的推送通道（用于测试）
pub mod memory {
    use super::*;
    use parking_lot::Mutex;

    struct RemoteEnd {
        events: mpsc::UnboundedSender<TransportEvent>,
        outbound: mpsc::UnboundedReceiver<ClientEvent>,
    }

    /// 测试一侧扮演服务器：注入事件、读取客户端发出的事件
    #[derive(Default)]
    pub struct MemoryTransport {
        remote: Mutex<Option<RemoteEnd>>,
        opened: Mutex<Vec<Identity>>,
    }

    impl MemoryTransport {
        pub fn new() -> Self {
            Self::default()
        }

        /// 注入一个传输事件；没有打开的通道时返回 false
        pub fn emit(&self, event: TransportEvent) -> bool {
            match self.remote.lock().as_ref() {
                Some(remote) => remote.events.send(event).is_ok(),
                None => false,
            }
        }

        pub fn connect(&self) -> bool {
            self.emit(TransportEvent::Connected)
        }

        pub fn drop_connection(&self, reason: &str) -> bool {
            self.emit(TransportEvent::Disconnected {
                reason: reason.to_owned(),
            })
        }

        pub fn push(&self, event: ServerEvent) -> bool {
            self.emit(TransportEvent::Event(event))
        }

        /// 取走客户端目前为止发出的全部事件
        pub fn drain_outbound(&self) -> Vec<ClientEvent> {
            let mut sent = Vec::new();
            if let Some(remote) = self.remote.lock().as_mut() {
                while let Ok(event) = remote.outbound.try_recv() {
                    sent.push(event);
                }
            }
            sent
        }

        /// 客户端是否已丢弃出站发送端（即已关闭连接）
        pub fn is_closed_by_client(&self) -> bool {
            self.remote
                .lock()
                .as_ref()
                .map(|remote| remote.outbound.is_closed())
                .unwrap_or(true)
        }

        pub fn opened_identities(&self) -> Vec<Identity> {
            self.opened.lock().clone()
        }
    }

    impl PushTransport for MemoryTransport {
        fn open(&self, identity: &Identity) -> PushChannel {
            let (event_tx, event_rx) = mpsc::unbounded_channel();
            let (out_tx, out_rx) = mpsc::unbounded_channel();
            *self.remote.lock() = Some(RemoteEnd {
                events: event_tx,
                outbound: out_rx,
            });
            self.opened.lock().push(identity.clone());
            PushChannel {
                events: event_rx,
                outbound: out_tx,
            }
        }
    }
}
