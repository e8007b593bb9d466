use async_trait::async_trait;
use domain::{Conversation, ConversationId, EventId, Identity, Message, MessageContent};

use crate::error::{ApiError, StorageError};

/// 消息后端的请求/响应接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChatApi: Send + Sync {
    // 当前查看者参与的全部会话记录，可能包含同一对方的多条记录
    async fn list_conversations(&self) -> Result<Vec<Conversation>, ApiError>;

    // 会话的完整有序历史
    async fn list_messages(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<Message>, ApiError>;

    // 权威发送，返回带稳定 id 和服务端时间的消息
    async fn send_message(
        &self,
        conversation_id: &ConversationId,
        content: &MessageContent,
    ) -> Result<Message, ApiError>;

    // 围绕某个活动发起会话；对方为空时由后端按活动主办方补全
    async fn start_conversation(
        &self,
        event_id: &EventId,
        counterpart: Option<Identity>,
    ) -> Result<Conversation, ApiError>;
}

/// 持久化最近一次选中的会话 id（只有这一个键）
pub trait SelectionStore: Send + Sync {
    fn load(&self) -> Result<Option<ConversationId>, StorageError>;
    fn save(&self, conversation_id: &ConversationId) -> Result<(), StorageError>;
    fn clear(&self) -> Result<(), StorageError>;
}

/// 内存实现的选择存储（用于测试）
pub mod memory {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Debug, Default)]
    pub struct MemorySelectionStore {
        value: Mutex<Option<ConversationId>>,
    }

    impl MemorySelectionStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_value(conversation_id: ConversationId) -> Self {
            Self {
                value: Mutex::new(Some(conversation_id)),
            }
        }
    }

    impl SelectionStore for MemorySelectionStore {
        fn load(&self) -> Result<Option<ConversationId>, StorageError> {
            Ok(self.value.lock().clone())
        }

        fn save(&self, conversation_id: &ConversationId) -> Result<(), StorageError> {
            *self.value.lock() = Some(conversation_id.clone());
            Ok(())
        }

        fn clear(&self) -> Result<(), StorageError> {
            *self.value.lock() = None;
            Ok(())
        }
    }
}
