//! 输入状态指示
//!
//! 本端：每次输入变化调用 [`TypingIndicatorTracker::notify_local_typing`]，
//! 连续输入时"开始输入"被合并，静默满防抖窗口后恰好发出一次"停止输入"。
//!
//! 远端：每个会话只记录最后一个正在输入的人。每条"开始输入"都会挂一个硬过期，
//! 即使"停止输入"在途中丢失，指示最多也只会残留过期时长。
//!
//! 所有计时都放在同一个 [`ExpiryScheduler`] 里，由调用方传入当前时间驱动。

use std::collections::HashMap;
use std::time::Duration;

use config::SyncConfig;
use domain::{ClientEvent, ConversationId, Identity, Timestamp};
use tracing::debug;

use crate::clock::deadline_after;
use crate::scheduler::ExpiryScheduler;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum TypingTimer {
    LocalStop(ConversationId),
    RemoteExpiry(ConversationId),
}

impl TypingTimer {
    fn conversation_id(&self) -> &ConversationId {
        match self {
            TypingTimer::LocalStop(id) | TypingTimer::RemoteExpiry(id) => id,
        }
    }
}

/// 计时参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypingSettings {
    /// 本端静默多久后发"停止输入"
    pub debounce: Duration,
    /// 持续输入时两次"开始输入"之间的最短间隔
    pub keepalive: Duration,
    /// 远端"开始输入"的硬过期
    pub expiry: Duration,
}

impl Default for TypingSettings {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(1_000),
            keepalive: Duration::from_millis(2_000),
            expiry: Duration::from_millis(3_000),
        }
    }
}

impl From<&SyncConfig> for TypingSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            debounce: config.typing_debounce(),
            keepalive: config.typing_keepalive(),
            expiry: config.typing_expiry(),
        }
    }
}

/// 远端输入条目
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingEntry {
    pub identity: Identity,
    pub expires_at: Timestamp,
}

/// 一次计时推进的结果
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TypingTick {
    /// 需要发出去的本端信号
    pub outbound: Vec<ClientEvent>,
    /// 因硬过期被清除的远端条目所在会话
    pub expired: Vec<ConversationId>,
}

#[derive(Debug)]
pub struct TypingIndicatorTracker {
    settings: TypingSettings,
    remote: HashMap<ConversationId, TypingEntry>,
    // 本端正在输入的会话 -> 最近一次发出"开始输入"的时间
    local: HashMap<ConversationId, Timestamp>,
    timers: ExpiryScheduler<TypingTimer>,
}

impl Default for TypingIndicatorTracker {
    fn default() -> Self {
        Self::new(TypingSettings::default())
    }
}

impl TypingIndicatorTracker {
    pub fn new(settings: TypingSettings) -> Self {
        Self {
            settings,
            remote: HashMap::new(),
            local: HashMap::new(),
            timers: ExpiryScheduler::new(),
        }
    }

    pub fn settings(&self) -> TypingSettings {
        self.settings
    }

    /// 本端输入变化。需要发"开始输入"时返回该事件；同时重置静默计时。
    pub fn notify_local_typing(
        &mut self,
        conversation_id: &ConversationId,
        now: Timestamp,
    ) -> Option<ClientEvent> {
        self.timers.schedule(
            TypingTimer::LocalStop(conversation_id.clone()),
            deadline_after(now, self.settings.debounce),
        );

        let keepalive_due = match self.local.get(conversation_id) {
            None => true,
            Some(last_started) => deadline_after(*last_started, self.settings.keepalive) <= now,
        };
        if !keepalive_due {
            return None;
        }
        self.local.insert(conversation_id.clone(), now);
        Some(ClientEvent::typing(conversation_id.clone(), true))
    }

    /// 本端立即停止输入（例如消息已发送），返回需要发出的"停止输入"
    pub fn stop_local(&mut self, conversation_id: &ConversationId) -> Option<ClientEvent> {
        self.timers
            .cancel(&TypingTimer::LocalStop(conversation_id.clone()));
        self.local
            .remove(conversation_id)
            .map(|_| ClientEvent::typing(conversation_id.clone(), false))
    }

    pub fn is_local_typing(&self, conversation_id: &ConversationId) -> bool {
        self.local.contains_key(conversation_id)
    }

    /// 远端输入信号
    pub fn on_remote_typing(
        &mut self,
        conversation_id: &ConversationId,
        identity: &Identity,
        is_typing: bool,
        now: Timestamp,
    ) -> bool {
        if is_typing {
            let expires_at = deadline_after(now, self.settings.expiry);
            self.remote.insert(
                conversation_id.clone(),
                TypingEntry {
                    identity: identity.clone(),
                    expires_at,
                },
            );
            self.timers.schedule(
                TypingTimer::RemoteExpiry(conversation_id.clone()),
                expires_at,
            );
            return true;
        }

        match self.remote.get(conversation_id) {
            Some(entry) if &entry.identity == identity => {
                self.remote.remove(conversation_id);
                self.timers
                    .cancel(&TypingTimer::RemoteExpiry(conversation_id.clone()));
                true
            }
            Some(entry) => {
                debug!(
                    conversation_id = %conversation_id,
                    typer = %entry.identity,
                    stopped = %identity,
                    "忽略非当前输入者的停止信号"
                );
                false
            }
            None => false,
        }
    }

    /// 收到某人的消息后，他的输入指示没有意义了
    pub fn on_message_from(&mut self, conversation_id: &ConversationId, sender: &Identity) -> bool {
        let is_typer = self
            .remote
            .get(conversation_id)
            .map(|entry| &entry.identity == sender)
            .unwrap_or(false);
        if is_typer {
            self.remote.remove(conversation_id);
            self.timers
                .cancel(&TypingTimer::RemoteExpiry(conversation_id.clone()));
        }
        is_typer
    }

    pub fn is_typing(&self, conversation_id: &ConversationId, now: Timestamp) -> bool {
        self.typer(conversation_id, now).is_some()
    }

    pub fn typer(&self, conversation_id: &ConversationId, now: Timestamp) -> Option<&Identity> {
        self.remote
            .get(conversation_id)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| &entry.identity)
    }

    /// 推进计时：发出到期的"停止输入"，清除到期的远端条目
    pub fn poll(&mut self, now: Timestamp) -> TypingTick {
        let mut tick = TypingTick::default();
        for timer in self.timers.drain_expired(now) {
            match timer {
                TypingTimer::LocalStop(conversation_id) => {
                    if self.local.remove(&conversation_id).is_some() {
                        tick.outbound
                            .push(ClientEvent::typing(conversation_id, false));
                    }
                }
                TypingTimer::RemoteExpiry(conversation_id) => {
                    if self.remote.remove(&conversation_id).is_some() {
                        debug!(conversation_id = %conversation_id, "远端输入指示过期");
                        tick.expired.push(conversation_id);
                    }
                }
            }
        }
        tick
    }

    pub fn next_deadline(&mut self) -> Option<Timestamp> {
        self.timers.next_deadline()
    }

    /// 取消会话的全部计时并清除其状态；本端正在输入时返回一条"停止输入"
    pub fn cancel_conversation(&mut self, conversation_id: &ConversationId) -> Option<ClientEvent> {
        self.timers
            .cancel_where(|timer| timer.conversation_id() == conversation_id);
        self.remote.remove(conversation_id);
        self.local
            .remove(conversation_id)
            .map(|_| ClientEvent::typing(conversation_id.clone(), false))
    }

    pub fn clear(&mut self) {
        self.timers = ExpiryScheduler::new();
        self.remote.clear();
        self.local.clear();
    }
}
