//! 聊天会话：同步核心的组合根
//!
//! 由 `init(viewer)` 建立、`teardown()` 释放。连接、在线集合是进程级共享的；
//! 消息流和会话级订阅只属于当前选中的会话，切换会话时整体释放。
//!
//! 所有锁都不跨 `.await` 持有，也不嵌套获取。异步步骤完成后只作用于发起时
//! 拿到的那个消息流，此时它可能已经不是当前会话，结果会被自然丢弃。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use chrono::NaiveDate;
use config::SyncConfig;
use domain::{
    ClientEvent, Conversation, ConversationId, EventId, EventKind, Identity, Message,
    MessageContent, ServerEvent, Viewer,
};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::connection::{ConnectionManager, ConnectionState, Subscription};
use crate::directory::ConversationDirectory;
use crate::error::ApplicationError;
use crate::message_stream::{MessageStream, StreamEntry, StreamOp, StreamOutcome, StreamStatus};
use crate::presence::PresenceTracker;
use crate::repository::{ChatApi, SelectionStore};
use crate::transport::PushTransport;
use crate::typing::{TypingIndicatorTracker, TypingSettings, TypingTick};

/// 会话依赖的外部协作者
#[derive(Clone)]
pub struct ChatSessionDependencies {
    pub api: Arc<dyn ChatApi>,
    pub transport: Arc<dyn PushTransport>,
    pub selection_store: Arc<dyn SelectionStore>,
    pub clock: Arc<dyn Clock>,
}

struct Lifecycle {
    viewer: Viewer,
    directory: Arc<Mutex<ConversationDirectory>>,
    subscriptions: Vec<Subscription>,
    timer: JoinHandle<()>,
}

struct ActiveConversation {
    id: ConversationId,
    /// 已加入的推送频道；刷新后会话 id 被合并时会多出一个
    channels: Vec<ConversationId>,
    stream: Arc<Mutex<MessageStream>>,
    subscriptions: Vec<Subscription>,
}

struct SessionInner {
    api: Arc<dyn ChatApi>,
    selection_store: Arc<dyn SelectionStore>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
    connection: ConnectionManager,
    presence: Mutex<PresenceTracker>,
    typing: Mutex<TypingIndicatorTracker>,
    lifecycle: Mutex<Option<Lifecycle>>,
    active: Mutex<Option<ActiveConversation>>,
}

#[derive(Clone)]
pub struct ChatSession {
    inner: Arc<SessionInner>,
}

impl ChatSession {
    pub fn new(deps: ChatSessionDependencies, config: SyncConfig) -> Self {
        let typing = TypingIndicatorTracker::new(TypingSettings::from(&config));
        Self {
            inner: Arc::new(SessionInner {
                api: deps.api,
                selection_store: deps.selection_store,
                clock: deps.clock,
                config,
                connection: ConnectionManager::new(deps.transport),
                presence: Mutex::new(PresenceTracker::new()),
                typing: Mutex::new(typing),
                lifecycle: Mutex::new(None),
                active: Mutex::new(None),
            }),
        }
    }

    /// 身份可用后建立会话；没有身份时拒绝。同一身份重复调用是空操作。
    pub fn init(&self, viewer: Option<Viewer>) -> Result<(), ApplicationError> {
        let Some(viewer) = viewer else {
            warn!("没有登录身份，拒绝初始化聊天会话");
            return Err(ApplicationError::NoSession);
        };

        let current = self
            .inner
            .lifecycle
            .lock()
            .as_ref()
            .map(|lifecycle| lifecycle.viewer.identity.clone());
        match current {
            Some(identity) if identity == viewer.identity => return Ok(()),
            Some(_) => self.teardown(),
            None => {}
        }

        let directory = Arc::new(Mutex::new(ConversationDirectory::new(
            viewer.clone(),
            self.inner.config.dedup_policy,
            self.inner.config.list_ordering,
            self.inner.selection_store.clone(),
        )));
        let subscriptions = self.global_subscriptions(&directory);
        let timer = self.spawn_timer_driver();

        *self.inner.lifecycle.lock() = Some(Lifecycle {
            viewer: viewer.clone(),
            directory,
            subscriptions,
            timer,
        });

        if let Err(err) = self.inner.connection.open(Some(&viewer.identity)) {
            self.teardown();
            return Err(err);
        }
        info!(identity = %viewer.identity, role = ?viewer.role, "聊天会话已初始化");
        Ok(())
    }

    /// 释放会话持有的全部资源，可重复调用
    pub fn teardown(&self) {
        self.inner.release_active();
        let lifecycle = self.inner.lifecycle.lock().take();
        let Some(lifecycle) = lifecycle else {
            self.inner.connection.close();
            return;
        };
        lifecycle.timer.abort();
        drop(lifecycle.subscriptions);
        self.inner.typing.lock().clear();
        self.inner.presence.lock().clear();
        self.inner.connection.close();
        info!(identity = %lifecycle.viewer.identity, "聊天会话已释放");
    }

    fn global_subscriptions(
        &self,
        directory: &Arc<Mutex<ConversationDirectory>>,
    ) -> Vec<Subscription> {
        let connection = &self.inner.connection;
        let mut subscriptions = Vec::with_capacity(4);

        for kind in [EventKind::UserOnline, EventKind::UserOffline] {
            let weak = self.weak();
            subscriptions.push(connection.subscribe(kind, move |event| {
                if let Some(inner) = weak.upgrade() {
                    inner.presence.lock().apply(event);
                }
            }));
        }

        let weak = self.weak();
        let directory = directory.clone();
        subscriptions.push(connection.subscribe(EventKind::NewMessage, move |event| {
            let ServerEvent::NewMessage(message) = event else {
                return;
            };
            let resolved = {
                let mut directory = directory.lock();
                directory.apply_message(message);
                directory.resolve(&message.conversation_id)
            };
            if let (Some(inner), Some(conversation_id)) = (weak.upgrade(), resolved) {
                inner
                    .typing
                    .lock()
                    .on_message_from(&conversation_id, &message.sender_id);
            }
        }));

        let weak = self.weak();
        let seen_connected = AtomicBool::new(false);
        subscriptions.push(connection.on_state_change(move |state| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            inner.presence.lock().on_connection_state(state);
            if state != ConnectionState::Connected {
                return;
            }
            let reconnected = seen_connected.swap(true, Ordering::SeqCst);
            let active = inner
                .active
                .lock()
                .as_ref()
                .map(|active| (active.id.clone(), active.channels.clone()));
            let Some((conversation_id, channels)) = active else {
                return;
            };
            // 连接前或断线期间选中的会话需要重新加入频道
            for channel in channels {
                inner.connection.send(ClientEvent::JoinConversation(channel));
            }
            if reconnected {
                info!(conversation_id = %conversation_id, "重连后重新加载消息");
                let session = ChatSession { inner };
                tokio::spawn(async move {
                    if let Err(err) = session.load_messages().await {
                        warn!(error = %err, "重连后加载消息失败");
                    }
                });
            }
        }));

        subscriptions
    }

    fn spawn_timer_driver(&self) -> JoinHandle<()> {
        let weak = self.weak();
        let period = self.inner.config.timer_tick();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                inner.tick();
            }
        })
    }

    fn weak(&self) -> Weak<SessionInner> {
        Arc::downgrade(&self.inner)
    }

    /// 推进一次计时器（驱动任务每个 tick 调用一次）
    pub fn tick(&self) -> TypingTick {
        self.inner.tick()
    }

    fn directory(&self) -> Result<Arc<Mutex<ConversationDirectory>>, ApplicationError> {
        self.inner
            .lifecycle
            .lock()
            .as_ref()
            .map(|lifecycle| lifecycle.directory.clone())
            .ok_or(ApplicationError::NoSession)
    }

    fn viewer_required(&self) -> Result<Viewer, ApplicationError> {
        self.viewer().ok_or(ApplicationError::NoSession)
    }

    fn active_stream(&self) -> Result<(ConversationId, Arc<Mutex<MessageStream>>), ApplicationError> {
        self.inner
            .active
            .lock()
            .as_ref()
            .map(|active| (active.id.clone(), active.stream.clone()))
            .ok_or(ApplicationError::NotSelected)
    }

    /// 拉取会话列表；没有打开的会话时打开恢复出来的选中项
    pub async fn refresh_conversations(&self) -> Result<(), ApplicationError> {
        let directory = self.directory()?;
        let token = directory.lock().begin_refresh();

        let records = match self.inner.api.list_conversations().await {
            Ok(records) => records,
            Err(err) => {
                warn!(error = %err, "加载会话列表失败");
                return Err(ApplicationError::load("conversations", err));
            }
        };
        let active = self.selected_conversation();
        let (restored, canonical) = {
            let mut directory = directory.lock();
            directory.complete_refresh(token, records);
            let canonical = active.as_ref().and_then(|id| directory.resolve(id));
            (directory.selected().cloned(), canonical)
        };

        match (active, restored, canonical) {
            (None, Some(conversation_id), _) => {
                self.select_conversation(&conversation_id).await?;
            }
            // 当前会话被合并进了另一条记录
            (Some(active), _, Some(canonical)) if active != canonical => {
                self.inner.rebind_active(&active, canonical);
            }
            _ => {}
        }
        Ok(())
    }

    /// 切换到指定会话：释放上一个会话的订阅和计时器，加入新会话并加载历史
    pub async fn select_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<ConversationId, ApplicationError> {
        let directory = self.directory()?;
        let viewer = self.viewer_required()?;
        let resolved = directory.lock().select(conversation_id)?;

        let already_active = self
            .inner
            .active
            .lock()
            .as_ref()
            .map(|active| active.id == resolved)
            .unwrap_or(false);
        if already_active {
            let idle = self
                .active_stream()
                .map(|(_, stream)| stream.lock().status() == StreamStatus::Idle)
                .unwrap_or(false);
            if idle {
                self.load_messages().await?;
            }
            return Ok(resolved);
        }

        self.inner.release_active();

        let stream = Arc::new(Mutex::new(MessageStream::new(resolved.clone())));
        let subscriptions = self.conversation_subscriptions(&resolved, &stream, &directory, &viewer);
        *self.inner.active.lock() = Some(ActiveConversation {
            id: resolved.clone(),
            channels: vec![resolved.clone()],
            stream,
            subscriptions,
        });
        self.inner
            .connection
            .send(ClientEvent::JoinConversation(resolved.clone()));
        info!(conversation_id = %resolved, "已切换会话");

        self.load_messages().await?;
        Ok(resolved)
    }

    fn conversation_subscriptions(
        &self,
        conversation_id: &ConversationId,
        stream: &Arc<Mutex<MessageStream>>,
        directory: &Arc<Mutex<ConversationDirectory>>,
        viewer: &Viewer,
    ) -> Vec<Subscription> {
        let connection = &self.inner.connection;

        let target = conversation_id.clone();
        let messages = stream.clone();
        let lookup = directory.clone();
        let on_message = connection.subscribe(EventKind::NewMessage, move |event| {
            let ServerEvent::NewMessage(message) = event else {
                return;
            };
            // 刷新可能把目标会话合并进别的记录，分发时重新解析双方
            let Some(current) = resolve_same(&lookup, &target, &message.conversation_id) else {
                return;
            };
            let outcome = messages.lock().apply(StreamOp::PushAppend(message.clone()));
            debug!(conversation_id = %current, message_id = %message.id, outcome = ?outcome, "推送消息");
        });

        let target = conversation_id.clone();
        let lookup = directory.clone();
        let me = viewer.identity.clone();
        let weak = self.weak();
        let on_typing = connection.subscribe(EventKind::UserTyping, move |event| {
            let ServerEvent::UserTyping(update) = event else {
                return;
            };
            if update.identity == me {
                return;
            }
            let Some(current) = resolve_same(&lookup, &target, &update.conversation_id) else {
                return;
            };
            if let Some(inner) = weak.upgrade() {
                let now = inner.clock.now();
                inner
                    .typing
                    .lock()
                    .on_remote_typing(&current, &update.identity, update.is_typing, now);
            }
        });

        vec![on_message, on_typing]
    }

    /// 加载当前会话的完整历史。被更新的加载取代时返回 `Stale`。
    pub async fn load_messages(&self) -> Result<StreamOutcome, ApplicationError> {
        let (conversation_id, stream) = self.active_stream()?;
        let token = stream.lock().begin_load();

        match self.inner.api.list_messages(&conversation_id).await {
            Ok(messages) => {
                let count = messages.len();
                let outcome = stream.lock().apply(StreamOp::Load { token, messages });
                debug!(conversation_id = %conversation_id, count, outcome = ?outcome, "消息历史加载完成");
                Ok(outcome)
            }
            Err(err) => {
                let outcome = stream.lock().apply(StreamOp::LoadFailed { token });
                if outcome == StreamOutcome::Stale {
                    return Ok(outcome);
                }
                warn!(conversation_id = %conversation_id, error = %err, "加载消息历史失败");
                Err(ApplicationError::load("messages", err))
            }
        }
    }

    /// 乐观发送：立即显示，成功后原位替换为确认消息，失败则回滚并交回原始输入
    pub async fn send_message(&self, input: &str) -> Result<Message, ApplicationError> {
        let viewer = self.viewer_required()?;
        let (conversation_id, stream) = self.active_stream()?;
        let content = MessageContent::parse(input, self.inner.config.max_message_len)?;

        let now = self.inner.clock.now();
        let local_id = stream
            .lock()
            .append_optimistic(viewer.identity.clone(), content.clone(), now);
        let stop = self.inner.typing.lock().stop_local(&conversation_id);
        if let Some(stop) = stop {
            self.inner.connection.send(stop);
        }

        match self.inner.api.send_message(&conversation_id, &content).await {
            Ok(message) => {
                let outcome = stream.lock().apply(StreamOp::ConfirmReplace {
                    local_id,
                    message: message.clone(),
                });
                if let Ok(directory) = self.directory() {
                    directory.lock().apply_message(&message);
                }
                debug!(
                    conversation_id = %conversation_id,
                    message_id = %message.id,
                    outcome = ?outcome,
                    "消息已确认"
                );
                Ok(message)
            }
            Err(err) => {
                let echoed = {
                    let mut stream = stream.lock();
                    match stream.apply(StreamOp::Rollback { local_id }) {
                        StreamOutcome::AlreadyConfirmed => stream.take_echo(&local_id),
                        _ => None,
                    }
                };
                if let Some(message) = echoed {
                    // 推送回显说明后端已经收到
                    info!(
                        conversation_id = %conversation_id,
                        message_id = %message.id,
                        error = %err,
                        "发送请求失败，但消息已由推送确认"
                    );
                    return Ok(message);
                }
                warn!(conversation_id = %conversation_id, error = %err, "发送失败，已回滚");
                Err(ApplicationError::send(input, err))
            }
        }
    }

    /// 本端输入变化；没有选中会话时返回 false
    pub fn notify_local_typing(&self) -> bool {
        let active = self.inner.active.lock().as_ref().map(|active| active.id.clone());
        let Some(conversation_id) = active else {
            return false;
        };
        let now = self.inner.clock.now();
        let started = self
            .inner
            .typing
            .lock()
            .notify_local_typing(&conversation_id, now);
        if let Some(event) = started {
            self.inner.connection.send(event);
        }
        true
    }

    /// 围绕活动发起会话，合并进目录并选中
    pub async fn start_conversation(
        &self,
        event_id: &EventId,
        counterpart: Option<Identity>,
    ) -> Result<ConversationId, ApplicationError> {
        let directory = self.directory()?;
        let conversation = self
            .inner
            .api
            .start_conversation(event_id, counterpart)
            .await
            .map_err(|err| {
                warn!(event_id = %event_id, error = %err, "发起会话失败");
                ApplicationError::load("conversation", err)
            })?;
        let id = directory.lock().upsert_from_start(conversation);
        info!(event_id = %event_id, conversation_id = %id, "已发起会话");
        self.select_conversation(&id).await
    }

    pub fn viewer(&self) -> Option<Viewer> {
        self.inner
            .lifecycle
            .lock()
            .as_ref()
            .map(|lifecycle| lifecycle.viewer.clone())
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.inner.connection
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection.watch_state()
    }

    pub fn is_online(&self, identity: &Identity) -> bool {
        self.inner.presence.lock().is_online(identity)
    }

    pub fn online_count(&self) -> usize {
        self.inner.presence.lock().online_count()
    }

    pub fn online_users(&self) -> Vec<Identity> {
        self.inner.presence.lock().online_users()
    }

    pub fn is_typing(&self, conversation_id: &ConversationId) -> bool {
        let now = self.inner.clock.now();
        self.inner.typing.lock().is_typing(conversation_id, now)
    }

    pub fn typer(&self, conversation_id: &ConversationId) -> Option<Identity> {
        let now = self.inner.clock.now();
        self.inner.typing.lock().typer(conversation_id, now).cloned()
    }

    pub fn selected_conversation(&self) -> Option<ConversationId> {
        self.inner.active.lock().as_ref().map(|active| active.id.clone())
    }

    /// 当前会话的消息快照
    pub fn messages(&self) -> Vec<StreamEntry> {
        self.active_stream()
            .map(|(_, stream)| stream.lock().snapshot())
            .unwrap_or_default()
    }

    /// 按自然日分组的消息快照
    pub fn messages_by_day(&self) -> Vec<(NaiveDate, Vec<StreamEntry>)> {
        self.active_stream()
            .map(|(_, stream)| {
                stream
                    .lock()
                    .group_by_day()
                    .into_iter()
                    .map(|(day, entries)| (day, entries.into_iter().cloned().collect()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn stream_status(&self) -> Option<StreamStatus> {
        self.active_stream()
            .ok()
            .map(|(_, stream)| stream.lock().status())
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.directory()
            .map(|directory| directory.lock().conversations().to_vec())
            .unwrap_or_default()
    }

    pub fn filter_conversations(&self, query: &str) -> Vec<Conversation> {
        self.directory()
            .map(|directory| {
                directory
                    .lock()
                    .filter(query)
                    .into_iter()
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn conversation(&self, conversation_id: &ConversationId) -> Option<Conversation> {
        self.directory()
            .ok()
            .and_then(|directory| directory.lock().get(conversation_id).cloned())
    }
}

// 两个 id 解析到同一条目录记录时返回该记录 id
fn resolve_same(
    directory: &Mutex<ConversationDirectory>,
    target: &ConversationId,
    incoming: &ConversationId,
) -> Option<ConversationId> {
    let directory = directory.lock();
    let current = directory.resolve(target)?;
    (directory.resolve(incoming).as_ref() == Some(&current)).then_some(current)
}

impl SessionInner {
    fn tick(&self) -> TypingTick {
        let now = self.clock.now();
        let tick = self.typing.lock().poll(now);
        for event in &tick.outbound {
            self.connection.send(event.clone());
        }
        tick
    }

    // 释放当前会话：退订、取消计时器、通知对端停止输入并离开频道
    fn release_active(&self) {
        let active = self.active.lock().take();
        let Some(active) = active else {
            return;
        };
        drop(active.subscriptions);
        let stop = self.typing.lock().cancel_conversation(&active.id);
        if let Some(stop) = stop {
            self.connection.send(stop);
        }
        for channel in active.channels {
            self.connection.send(ClientEvent::LeaveConversation(channel));
        }
        debug!(conversation_id = %active.id, "已释放会话");
    }

    // 当前会话 id 变成了别名：改用合并后的 id，消息流和订阅保持不变
    fn rebind_active(&self, previous: &ConversationId, canonical: ConversationId) {
        let join = {
            let mut active = self.active.lock();
            match active.as_mut() {
                Some(active) if &active.id == previous => {
                    active.id = canonical.clone();
                    let join = !active.channels.contains(&canonical);
                    if join {
                        active.channels.push(canonical.clone());
                    }
                    Some(join)
                }
                _ => None,
            }
        };
        let Some(join) = join else {
            return;
        };
        let stop = self.typing.lock().cancel_conversation(previous);
        if let Some(stop) = stop {
            self.connection.send(stop);
        }
        if join {
            self.connection
                .send(ClientEvent::JoinConversation(canonical.clone()));
        }
        info!(previous = %previous, conversation_id = %canonical, "当前会话已合并到新的记录");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::ApiError;
    use crate::repository::memory::MemorySelectionStore;
    use crate::repository::MockChatApi;
    use crate::transport::memory::MemoryTransport;
    use chrono::{TimeZone, Utc};
    use domain::{MessageId, Participant, ViewerRole};

    fn viewer() -> Viewer {
        Viewer::new(Identity::new("att_1"), "Alice", ViewerRole::Attendee)
    }

    fn conversation() -> Conversation {
        Conversation {
            id: ConversationId::new("c1"),
            organizer: Participant::new("org_1", "Org"),
            participant: Participant::new("att_1", "Alice"),
            events: vec![],
            last_message: None,
            last_message_time: None,
        }
    }

    fn session_with(api: MockChatApi) -> (ChatSession, Arc<MemoryTransport>) {
        let transport = Arc::new(MemoryTransport::new());
        let session = ChatSession::new(
            ChatSessionDependencies {
                api: Arc::new(api),
                transport: transport.clone(),
                selection_store: Arc::new(MemorySelectionStore::new()),
                clock: Arc::new(ManualClock::new(
                    Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap(),
                )),
            },
            SyncConfig::default(),
        );
        (session, transport)
    }

    #[tokio::test]
    async fn init_without_viewer_is_rejected() {
        let (session, transport) = session_with(MockChatApi::new());
        assert!(matches!(session.init(None), Err(ApplicationError::NoSession)));
        assert!(transport.opened_identities().is_empty());
        assert!(matches!(
            session.refresh_conversations().await,
            Err(ApplicationError::NoSession)
        ));
    }

    #[tokio::test]
    async fn send_without_selection_is_rejected() {
        let (session, _) = session_with(MockChatApi::new());
        session.init(Some(viewer())).unwrap();
        assert!(matches!(
            session.send_message("hi").await,
            Err(ApplicationError::NotSelected)
        ));
        assert!(!session.notify_local_typing());
    }

    #[tokio::test]
    async fn failed_send_rolls_back_and_returns_input() {
        let mut api = MockChatApi::new();
        api.expect_list_conversations()
            .returning(|| Ok(vec![conversation()]));
        api.expect_list_messages().returning(|_| Ok(vec![]));
        api.expect_send_message()
            .times(1)
            .returning(|_, _| Err(ApiError::Timeout));

        let (session, _) = session_with(api);
        session.init(Some(viewer())).unwrap();
        session.refresh_conversations().await.unwrap();
        assert_eq!(session.selected_conversation(), Some("c1".into()));

        let err = session.send_message("  see you soon ").await.unwrap_err();
        assert_eq!(err.restorable_content(), Some("  see you soon "));
        assert!(session.messages().is_empty());
    }

    #[tokio::test]
    async fn confirmed_send_replaces_optimistic_entry() {
        let mut api = MockChatApi::new();
        api.expect_list_conversations()
            .returning(|| Ok(vec![conversation()]));
        api.expect_list_messages().returning(|_| Ok(vec![]));
        api.expect_send_message().returning(|conversation_id, content| {
            Ok(Message::new(
                MessageId::new("m1"),
                conversation_id.clone(),
                Identity::new("att_1"),
                content.clone(),
                Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 1).unwrap(),
            ))
        });

        let (session, _) = session_with(api);
        session.init(Some(viewer())).unwrap();
        session.refresh_conversations().await.unwrap();

        let sent = session.send_message("hello").await.unwrap();
        let entries = session.messages();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0], StreamEntry::Confirmed(sent));
        assert_eq!(
            session
                .conversation(&"c1".into())
                .and_then(|c| c.last_message),
            Some("hello".to_owned())
        );
    }

    #[tokio::test]
    async fn failed_load_is_retryable_and_leaves_stream_idle() {
        let mut api = MockChatApi::new();
        api.expect_list_conversations()
            .returning(|| Ok(vec![conversation()]));
        api.expect_list_messages()
            .returning(|_| Err(ApiError::status(503, "unavailable")));

        let (session, _) = session_with(api);
        session.init(Some(viewer())).unwrap();
        let err = session.refresh_conversations().await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(session.stream_status(), Some(StreamStatus::Idle));
        assert!(session.messages().is_empty());
    }

    #[tokio::test]
    async fn teardown_is_idempotent() {
        let (session, transport) = session_with(MockChatApi::new());
        session.init(Some(viewer())).unwrap();
        session.teardown();
        session.teardown();
        assert!(session.viewer().is_none());
        assert!(transport.is_closed_by_client());
        assert_eq!(session.connection().handler_count(EventKind::NewMessage), 0);
    }
}
