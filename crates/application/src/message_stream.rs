//! 单个会话的消息流
//!
//! 所有变更都表示为 [`StreamOp`]，经 [`MessageStream::apply`] 归约到一个按
//! `(created_at, id)` 排序的有序映射上，去重和排序由容器本身保证。

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::NaiveDate;
use domain::{
    ConversationId, Identity, LocalMessageId, Message, MessageContent, MessageId, Timestamp,
};
use tracing::debug;

/// 乐观发送、尚未得到后端确认的消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    pub local_id: LocalMessageId,
    pub conversation_id: ConversationId,
    pub sender_id: Identity,
    pub content: MessageContent,
    /// 本地时钟给出的临时时间
    pub created_at: Timestamp,
}

impl PendingMessage {
    pub fn new(
        conversation_id: ConversationId,
        sender_id: Identity,
        content: MessageContent,
        created_at: Timestamp,
    ) -> Self {
        Self {
            local_id: LocalMessageId::generate(),
            conversation_id,
            sender_id,
            content,
            created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntryId {
    Pending(LocalMessageId),
    Confirmed(MessageId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEntry {
    Pending(PendingMessage),
    Confirmed(Message),
}

impl StreamEntry {
    pub fn entry_id(&self) -> EntryId {
        match self {
            StreamEntry::Pending(pending) => EntryId::Pending(pending.local_id),
            StreamEntry::Confirmed(message) => EntryId::Confirmed(message.id.clone()),
        }
    }

    pub fn created_at(&self) -> Timestamp {
        match self {
            StreamEntry::Pending(pending) => pending.created_at,
            StreamEntry::Confirmed(message) => message.created_at,
        }
    }

    pub fn sender_id(&self) -> &Identity {
        match self {
            StreamEntry::Pending(pending) => &pending.sender_id,
            StreamEntry::Confirmed(message) => &message.sender_id,
        }
    }

    pub fn content(&self) -> &MessageContent {
        match self {
            StreamEntry::Pending(pending) => &pending.content,
            StreamEntry::Confirmed(message) => &message.content,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, StreamEntry::Pending(_))
    }

    /// 展示用的 id；乐观消息是 `temp-` 前缀的本地 id
    pub fn display_id(&self) -> String {
        match self {
            StreamEntry::Pending(pending) => pending.local_id.to_string(),
            StreamEntry::Confirmed(message) => message.id.to_string(),
        }
    }

    fn sort_key(&self) -> SortKey {
        (self.created_at(), self.display_id())
    }
}

type SortKey = (Timestamp, String);

/// 加载的状态机：idle -> loading -> ready，填充后不再回到 loading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    Idle,
    Loading,
    Ready,
}

/// 一次加载请求的凭证，只有最新凭证的结果会被采用
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadToken(u64);

#[derive(Debug, Clone, PartialEq)]
pub enum StreamOp {
    Load {
        token: LoadToken,
        messages: Vec<Message>,
    },
    LoadFailed {
        token: LoadToken,
    },
    OptimisticAppend(PendingMessage),
    ConfirmReplace {
        local_id: LocalMessageId,
        message: Message,
    },
    PushAppend(Message),
    Rollback {
        local_id: LocalMessageId,
    },
}

impl StreamOp {
    fn name(&self) -> &'static str {
        match self {
            StreamOp::Load { .. } => "load",
            StreamOp::LoadFailed { .. } => "load_failed",
            StreamOp::OptimisticAppend(_) => "optimistic_append",
            StreamOp::ConfirmReplace { .. } => "confirm_replace",
            StreamOp::PushAppend(_) => "push_append",
            StreamOp::Rollback { .. } => "rollback",
        }
    }
}

/// 归约结果。重复抑制和过期结果都是预期内的结果，不是错误。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    Applied,
    /// 已存在相同最终 id 的消息
    DuplicateSuppressed,
    /// 已被更新的加载请求取代
    Stale,
    /// 对当前状态没有意义的操作（例如回滚一个不存在的乐观消息）
    Ignored,
    /// 回滚的乐观消息已被推送回显确认，不应当作发送失败
    AlreadyConfirmed,
}

#[derive(Debug)]
pub struct MessageStream {
    conversation_id: ConversationId,
    status: StreamStatus,
    entries: BTreeMap<SortKey, StreamEntry>,
    index: HashMap<EntryId, SortKey>,
    generation: u64,
    /// 最近一次发起加载以来插入的确认消息，加载完成时这些消息会被保留
    arrived_during_load: HashSet<MessageId>,
    /// 被推送回显替换掉的乐观消息，等待发送请求收尾
    echoed: HashMap<LocalMessageId, Message>,
}

impl MessageStream {
    pub fn new(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            status: StreamStatus::Idle,
            entries: BTreeMap::new(),
            index: HashMap::new(),
            generation: 0,
            arrived_during_load: HashSet::new(),
            echoed: HashMap::new(),
        }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn status(&self) -> StreamStatus {
        self.status
    }

    /// 开始一次加载，之前发出的加载全部作废
    pub fn begin_load(&mut self) -> LoadToken {
        self.generation += 1;
        self.arrived_during_load.clear();
        if self.status == StreamStatus::Idle {
            self.status = StreamStatus::Loading;
        }
        LoadToken(self.generation)
    }

    pub fn apply(&mut self, op: StreamOp) -> StreamOutcome {
        let name = op.name();
        let outcome = match op {
            StreamOp::Load { token, messages } => self.apply_load(token, messages),
            StreamOp::LoadFailed { token } => self.apply_load_failed(token),
            StreamOp::OptimisticAppend(pending) => {
                self.insert(StreamEntry::Pending(pending));
                StreamOutcome::Applied
            }
            StreamOp::ConfirmReplace { local_id, message } => {
                self.remove(&EntryId::Pending(local_id));
                self.echoed.remove(&local_id);
                self.insert_confirmed(message)
            }
            StreamOp::PushAppend(message) => self.apply_push(message),
            StreamOp::Rollback { local_id } => match self.remove(&EntryId::Pending(local_id)) {
                Some(_) => StreamOutcome::Applied,
                None if self.echoed.contains_key(&local_id) => StreamOutcome::AlreadyConfirmed,
                None => StreamOutcome::Ignored,
            },
        };
        if outcome != StreamOutcome::Applied {
            debug!(
                conversation_id = %self.conversation_id,
                op = name,
                outcome = ?outcome,
                "消息流操作未生效"
            );
        }
        outcome
    }

    /// 构造一条乐观消息并立即加入，返回它的本地 id
    pub fn append_optimistic(
        &mut self,
        sender_id: Identity,
        content: MessageContent,
        now: Timestamp,
    ) -> LocalMessageId {
        let pending = PendingMessage::new(self.conversation_id.clone(), sender_id, content, now);
        let local_id = pending.local_id;
        self.apply(StreamOp::OptimisticAppend(pending));
        local_id
    }

    /// 乐观消息被推送回显确认时，取出替换它的那条确认消息
    pub fn take_echo(&mut self, local_id: &LocalMessageId) -> Option<Message> {
        self.echoed.remove(local_id)
    }

    fn apply_load(&mut self, token: LoadToken, messages: Vec<Message>) -> StreamOutcome {
        if token.0 != self.generation {
            return StreamOutcome::Stale;
        }

        // 服务端历史为准；只保留乐观消息和加载期间才到达、历史中还没有的消息
        let previous = std::mem::take(&mut self.entries);
        let arrived = std::mem::take(&mut self.arrived_during_load);
        self.index.clear();
        for message in messages {
            self.insert_confirmed(message);
        }
        for entry in previous.into_values() {
            let keep = match &entry {
                StreamEntry::Pending(_) => true,
                StreamEntry::Confirmed(message) => arrived.contains(&message.id),
            };
            if keep && !self.index.contains_key(&entry.entry_id()) {
                self.insert(entry);
            }
        }
        self.arrived_during_load.clear();
        self.status = StreamStatus::Ready;
        StreamOutcome::Applied
    }

    fn apply_load_failed(&mut self, token: LoadToken) -> StreamOutcome {
        if token.0 != self.generation {
            return StreamOutcome::Stale;
        }
        if self.status != StreamStatus::Loading {
            return StreamOutcome::Ignored;
        }
        // 不留下半截状态，调用方可以直接重试
        self.entries.clear();
        self.index.clear();
        self.status = StreamStatus::Idle;
        StreamOutcome::Applied
    }

    fn apply_push(&mut self, message: Message) -> StreamOutcome {
        if self
            .index
            .contains_key(&EntryId::Confirmed(message.id.clone()))
        {
            return StreamOutcome::DuplicateSuppressed;
        }
        // 推送回显可能比发送请求的响应先到：用它替换最早的同内容乐观消息
        let echo = self
            .entries
            .values()
            .find_map(|entry| match entry {
                StreamEntry::Pending(pending)
                    if pending.sender_id == message.sender_id
                        && pending.content == message.content =>
                {
                    Some(pending.local_id)
                }
                _ => None,
            });
        if let Some(local_id) = echo {
            debug!(local_id = %local_id, message_id = %message.id, "推送回显替换乐观消息");
            self.remove(&EntryId::Pending(local_id));
            self.echoed.insert(local_id, message.clone());
        }
        self.insert_confirmed(message)
    }

    fn insert_confirmed(&mut self, message: Message) -> StreamOutcome {
        if self
            .index
            .contains_key(&EntryId::Confirmed(message.id.clone()))
        {
            return StreamOutcome::DuplicateSuppressed;
        }
        self.arrived_during_load.insert(message.id.clone());
        self.insert(StreamEntry::Confirmed(message));
        StreamOutcome::Applied
    }

    fn insert(&mut self, entry: StreamEntry) {
        let key = entry.sort_key();
        self.index.insert(entry.entry_id(), key.clone());
        self.entries.insert(key, entry);
    }

    fn remove(&mut self, id: &EntryId) -> Option<StreamEntry> {
        let key = self.index.remove(id)?;
        self.entries.remove(&key)
    }

    pub fn entries(&self) -> impl Iterator<Item = &StreamEntry> {
        self.entries.values()
    }

    /// 当前内容的快照
    pub fn snapshot(&self) -> Vec<StreamEntry> {
        self.entries.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.entries.values().filter(|entry| entry.is_pending()).count()
    }

    pub fn contains(&self, message_id: &MessageId) -> bool {
        self.index
            .contains_key(&EntryId::Confirmed(message_id.clone()))
    }

    pub fn last(&self) -> Option<&StreamEntry> {
        self.entries.values().next_back()
    }

    /// 按自然日分组的展示视图（UTC）
    pub fn group_by_day(&self) -> Vec<(NaiveDate, Vec<&StreamEntry>)> {
        let mut groups: Vec<(NaiveDate, Vec<&StreamEntry>)> = Vec::new();
        for entry in self.entries.values() {
            let day = entry.created_at().date_naive();
            match groups.last_mut() {
                Some((current, members)) if *current == day => members.push(entry),
                _ => groups.push((day, vec![entry])),
            }
        }
        groups
    }

    /// 排序、唯一性和索引是否一致
    pub fn is_consistent(&self) -> bool {
        if self.entries.len() != self.index.len() {
            return false;
        }
        let ordered = self
            .entries
            .values()
            .zip(self.entries.values().skip(1))
            .all(|(a, b)| a.sort_key() <= b.sort_key());
        let indexed = self
            .entries
            .iter()
            .all(|(key, entry)| self.index.get(&entry.entry_id()) == Some(key));
        ordered && indexed
    }
}
