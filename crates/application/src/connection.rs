//! 推送连接生命周期管理
//!
//! 每个登录身份一条逻辑连接。`open` 不阻塞，状态变化通过订阅观察；
//! 入站事件按到达顺序分发给按事件名注册的处理器。

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use domain::{ClientEvent, EventKind, Identity, ServerEvent};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ApplicationError;
use crate::transport::{PushTransport, TransportEvent};

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// 从未连上就放弃了，与"连上后断开"区分
    Error,
}

pub type EventHandler = Arc<dyn Fn(&ServerEvent) + Send + Sync>;
pub type StateHandler = Arc<dyn Fn(ConnectionState) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    events: HashMap<EventKind, Vec<(u64, EventHandler)>>,
    states: Vec<(u64, StateHandler)>,
}

impl Registry {
    fn allocate(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn remove(&mut self, id: u64) {
        for handlers in self.events.values_mut() {
            handlers.retain(|(handler_id, _)| *handler_id != id);
        }
        self.states.retain(|(handler_id, _)| *handler_id != id);
    }
}

struct Link {
    epoch: u64,
    identity: Identity,
    outbound: mpsc::UnboundedSender<ClientEvent>,
    ever_connected: bool,
    pump: JoinHandle<()>,
}

struct Inner {
    transport: Arc<dyn PushTransport>,
    state: watch::Sender<ConnectionState>,
    registry: Mutex<Registry>,
    link: Mutex<Option<Link>>,
    epochs: Mutex<u64>,
}

/// 订阅句柄，丢弃即退订
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    inner: Weak<Inner>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        drop(self)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.registry.lock().remove(self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// 推送连接管理器
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn PushTransport>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                transport,
                state,
                registry: Mutex::new(Registry::default()),
                link: Mutex::new(None),
                epochs: Mutex::new(0),
            }),
        }
    }

    /// 为身份建立连接；没有身份时拒绝。连接失败不会返回错误，只体现在状态上。
    pub fn open(&self, identity: Option<&Identity>) -> Result<(), ApplicationError> {
        let Some(identity) = identity else {
            warn!("拒绝建立连接：没有登录身份");
            return Err(ApplicationError::NoSession);
        };

        {
            let link = self.inner.link.lock();
            if let Some(link) = link.as_ref() {
                if &link.identity == identity {
                    debug!(identity = %identity, "连接已打开，忽略重复 open");
                    return Ok(());
                }
            }
        }
        // 身份变化时先拆掉旧连接
        self.close();

        let epoch = {
            let mut epochs = self.inner.epochs.lock();
            *epochs += 1;
            *epochs
        };
        Inner::set_state(&self.inner, ConnectionState::Connecting);

        let channel = self.inner.transport.open(identity);
        let pump = tokio::spawn(Inner::pump(
            Arc::downgrade(&self.inner),
            epoch,
            channel.events,
        ));
        *self.inner.link.lock() = Some(Link {
            epoch,
            identity: identity.clone(),
            outbound: channel.outbound,
            ever_connected: false,
            pump,
        });

        info!(identity = %identity, "开始建立推送连接");
        Ok(())
    }

    /// 释放连接，可重复调用
    pub fn close(&self) {
        let link = self.inner.link.lock().take();
        if let Some(link) = link {
            link.pump.abort();
            // 丢弃 outbound 即通知传输层关闭
            drop(link.outbound);
            info!(identity = %link.identity, "推送连接已关闭");
        }
        Inner::set_state(&self.inner, ConnectionState::Disconnected);
    }

    /// 发送出站事件；未连接时是空操作，返回 false
    pub fn send(&self, event: ClientEvent) -> bool {
        if self.state() != ConnectionState::Connected {
            debug!(event = event.name(), "未连接，丢弃出站事件");
            return false;
        }
        let link = self.inner.link.lock();
        match link.as_ref() {
            Some(link) => link.outbound.send(event).is_ok(),
            None => false,
        }
    }

    /// 按事件名订阅入站事件
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        let mut registry = self.inner.registry.lock();
        let id = registry.allocate();
        registry
            .events
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        Subscription {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// 订阅状态变化，处理器在状态切换时同步调用
    pub fn on_state_change<F>(&self, handler: F) -> Subscription
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        let mut registry = self.inner.registry.lock();
        let id = registry.allocate();
        registry.states.push((id, Arc::new(handler)));
        Subscription {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn identity(&self) -> Option<Identity> {
        self.inner
            .link
            .lock()
            .as_ref()
            .map(|link| link.identity.clone())
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.inner
            .registry
            .lock()
            .events
            .get(&kind)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

impl Inner {
    async fn pump(
        weak: Weak<Inner>,
        epoch: u64,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        while let Some(event) = events.recv().await {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if !inner.is_current(epoch) {
                return;
            }
            inner.handle(epoch, event);
        }

        // 传输层结束了通道
        if let Some(inner) = weak.upgrade() {
            if inner.is_current(epoch) {
                debug!("传输通道已结束");
                Inner::set_state(&inner, ConnectionState::Disconnected);
            }
        }
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.link
            .lock()
            .as_ref()
            .map(|link| link.epoch == epoch)
            .unwrap_or(false)
    }

    fn handle(self: &Arc<Self>, epoch: u64, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                let identity = {
                    let mut link = self.link.lock();
                    match link.as_mut() {
                        Some(link) if link.epoch == epoch => {
                            link.ever_connected = true;
                            // 到达 connected 后立即广播自己上线
                            let _ = link
                                .outbound
                                .send(ClientEvent::UserOnline(link.identity.clone()));
                            link.identity.clone()
                        }
                        _ => return,
                    }
                };
                info!(identity = %identity, "推送连接已建立");
                Inner::set_state(self, ConnectionState::Connected);
            }
            TransportEvent::Disconnected { reason } => {
                warn!(reason = %reason, "推送连接断开");
                Inner::set_state(self, ConnectionState::Disconnected);
            }
            TransportEvent::Reconnecting { attempt } => {
                debug!(attempt, "推送连接重连中");
                Inner::set_state(self, ConnectionState::Connecting);
            }
            TransportEvent::Failed { reason } => {
                let ever_connected = self
                    .link
                    .lock()
                    .as_ref()
                    .map(|link| link.ever_connected)
                    .unwrap_or(false);
                warn!(reason = %reason, ever_connected, "推送连接放弃重连");
                let state = if ever_connected {
                    ConnectionState::Disconnected
                } else {
                    ConnectionState::Error
                };
                Inner::set_state(self, state);
            }
            TransportEvent::Event(event) => self.dispatch(&event),
        }
    }

    fn dispatch(&self, event: &ServerEvent) {
        // 复制处理器列表后再调用，处理器内部可以安全地订阅/退订
        let handlers: Vec<EventHandler> = self
            .registry
            .lock()
            .events
            .get(&event.kind())
            .map(|handlers| handlers.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();
        debug!(event = %event.kind(), handlers = handlers.len(), "分发推送事件");
        for handler in handlers {
            handler(event);
        }
    }

    fn set_state(self: &Arc<Self>, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous == state {
            return;
        }
        let handlers: Vec<StateHandler> = self
            .registry
            .lock()
            .states
            .iter()
            .map(|(_, h)| h.clone())
            .collect();
        for handler in handlers {
            handler(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryTransport;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn manager() -> (ConnectionManager, Arc<MemoryTransport>) {
        let transport = Arc::new(MemoryTransport::new());
        (ConnectionManager::new(transport.clone()), transport)
    }

    #[tokio::test]
    async fn refuses_to_open_without_identity() {
        let (manager, transport) = manager();
        let result = manager.open(None);
        assert!(matches!(result, Err(ApplicationError::NoSession)));
        assert!(transport.opened_identities().is_empty());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn announces_self_after_connect() {
        let (manager, transport) = manager();
        let me = Identity::new("u_me");
        manager.open(Some(&me)).unwrap();
        assert_eq!(manager.state(), ConnectionState::Connecting);

        transport.connect();
        settle().await;

        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(transport.drain_outbound(), vec![ClientEvent::UserOnline(me)]);
    }

    #[tokio::test]
    async fn send_is_noop_while_disconnected() {
        let (manager, transport) = manager();
        manager.open(Some(&Identity::new("u1"))).unwrap();

        assert!(!manager.send(ClientEvent::JoinConversation("c1".into())));
        assert!(transport.drain_outbound().is_empty());
    }

    #[tokio::test]
    async fn handlers_run_in_arrival_order_until_unsubscribed() {
        let (manager, transport) = manager();
        manager.open(Some(&Identity::new("u1"))).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let subscription = manager.subscribe(EventKind::UserOnline, move |event| {
            if let ServerEvent::UserOnline(id) = event {
                sink.lock().push(id.to_string());
            }
        });

        transport.push(ServerEvent::UserOnline("a".into()));
        transport.push(ServerEvent::UserOffline("ignored".into()));
        transport.push(ServerEvent::UserOnline("b".into()));
        settle().await;
        assert_eq!(*seen.lock(), vec!["a", "b"]);

        subscription.unsubscribe();
        assert_eq!(manager.handler_count(EventKind::UserOnline), 0);
        transport.push(ServerEvent::UserOnline("c".into()));
        settle().await;
        assert_eq!(seen.lock().len(), 2);
    }

    #[tokio::test]
    async fn failure_before_connect_is_error_state() {
        let (manager, transport) = manager();
        manager.open(Some(&Identity::new("u1"))).unwrap();
        transport.emit(TransportEvent::Failed {
            reason: "refused".into(),
        });
        settle().await;
        assert_eq!(manager.state(), ConnectionState::Error);
    }

    #[tokio::test]
    async fn loss_after_connect_is_disconnected_and_observed() {
        let (manager, transport) = manager();
        let transitions = Arc::new(Mutex::new(Vec::new()));
        let sink = transitions.clone();
        let _guard = manager.on_state_change(move |state| sink.lock().push(state));

        manager.open(Some(&Identity::new("u1"))).unwrap();
        transport.connect();
        transport.drop_connection("network");
        transport.emit(TransportEvent::Reconnecting { attempt: 1 });
        transport.connect();
        settle().await;

        assert_eq!(
            *transitions.lock(),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Disconnected,
                ConnectionState::Connecting,
                ConnectionState::Connected,
            ]
        );
    }

    #[tokio::test]
    async fn close_is_idempotent_and_releases_transport() {
        let (manager, transport) = manager();
        manager.open(Some(&Identity::new("u1"))).unwrap();
        transport.connect();
        settle().await;

        manager.close();
        manager.close();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(transport.is_closed_by_client());

        // 关闭后迟到的事件不会再改变状态
        transport.connect();
        settle().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn reopening_same_identity_is_noop() {
        let (manager, transport) = manager();
        let me = Identity::new("u1");
        manager.open(Some(&me)).unwrap();
        manager.open(Some(&me)).unwrap();
        assert_eq!(transport.opened_identities().len(), 1);

        manager.open(Some(&Identity::new("u2"))).unwrap();
        assert_eq!(transport.opened_identities().len(), 2);
        assert_eq!(manager.identity(), Some(Identity::new("u2")));
    }

    #[tokio::test]
    async fn handler_may_unsubscribe_itself() {
        let (manager, transport) = manager();
        manager.open(Some(&Identity::new("u1"))).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let counter = calls.clone();
        let own = slot.clone();
        let subscription = manager.subscribe(EventKind::UserOffline, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            own.lock().take();
        });
        *slot.lock() = Some(subscription);

        transport.push(ServerEvent::UserOffline("x".into()));
        transport.push(ServerEvent::UserOffline("y".into()));
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
