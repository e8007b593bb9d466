//! 推送通道上的入站/出站事件

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::message::Message;
use crate::value_objects::{ConversationId, Identity};

/// 对方正在输入的推送负载
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingUpdate {
    pub conversation_id: ConversationId,
    #[serde(alias = "userId")]
    pub identity: Identity,
    pub is_typing: bool,
}

/// 本端输入意图的出站负载，身份由连接本身携带
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingIntent {
    pub conversation_id: ConversationId,
    pub is_typing: bool,
}

/// 服务器推送的事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    /// 新消息
    NewMessage(Message),
    /// 用户上线
    UserOnline(Identity),
    /// 用户下线
    UserOffline(Identity),
    /// 输入状态变化
    UserTyping(TypingUpdate),
}

impl ServerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ServerEvent::NewMessage(_) => EventKind::NewMessage,
            ServerEvent::UserOnline(_) => EventKind::UserOnline,
            ServerEvent::UserOffline(_) => EventKind::UserOffline,
            ServerEvent::UserTyping(_) => EventKind::UserTyping,
        }
    }

    /// 事件所属会话（只有会话级事件才有）
    pub fn conversation_id(&self) -> Option<&ConversationId> {
        match self {
            ServerEvent::NewMessage(message) => Some(&message.conversation_id),
            ServerEvent::UserTyping(update) => Some(&update.conversation_id),
            ServerEvent::UserOnline(_) | ServerEvent::UserOffline(_) => None,
        }
    }
}

/// 入站事件名，用于按名订阅
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    NewMessage,
    UserOnline,
    UserOffline,
    UserTyping,
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::NewMessage => "newMessage",
            EventKind::UserOnline => "userOnline",
            EventKind::UserOffline => "userOffline",
            EventKind::UserTyping => "userTyping",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 客户端发出的事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientEvent {
    /// 加入会话频道
    JoinConversation(ConversationId),
    /// 离开会话频道
    LeaveConversation(ConversationId),
    /// 本端输入状态
    Typing(TypingIntent),
    /// 连接建立后的自我上线广播
    UserOnline(Identity),
}

impl ClientEvent {
    pub fn typing(conversation_id: ConversationId, is_typing: bool) -> Self {
        ClientEvent::Typing(TypingIntent {
            conversation_id,
            is_typing,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::JoinConversation(_) => "joinConversation",
            ClientEvent::LeaveConversation(_) => "leaveConversation",
            ClientEvent::Typing(_) => "typing",
            ClientEvent::UserOnline(_) => "userOnline",
        }
    }
}
