use serde::{Deserialize, Serialize};

use crate::value_objects::{ConversationId, Identity, MessageContent, MessageId, Timestamp};

/// 后端确认过的消息，创建后不可变。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(alias = "_id")]
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: Identity,
    pub content: MessageContent,
    /// 服务端分配的时间，是排序的权威依据
    pub created_at: Timestamp,
}

impl Message {
    pub fn new(
        id: MessageId,
        conversation_id: ConversationId,
        sender_id: Identity,
        content: MessageContent,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id,
            conversation_id,
            sender_id,
            content,
            created_at,
        }
    }
}
