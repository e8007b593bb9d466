use domain::{ConversationId, DomainError};
use thiserror::Error;

/// 请求/响应接口的错误
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Transport(String),
    #[error("request timed out")]
    Timeout,
    #[error("unexpected status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("invalid response body: {0}")]
    Decode(String),
}

impl ApiError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }
}

/// 推送通道的错误
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("connection closed")]
    Closed,
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// 本地持久化的错误
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StorageError {
    #[error("storage io failed: {0}")]
    Io(String),
    #[error("stored value is corrupt: {0}")]
    Corrupt(String),
}

#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error("no authenticated identity")]
    NoSession,
    #[error("connection error: {0}")]
    Connection(#[from] TransportError),
    #[error("failed to load {resource}: {source}")]
    Load {
        resource: &'static str,
        source: ApiError,
    },
    /// 发送被拒绝；`content` 是原始输入，调用方据此恢复输入框
    #[error("failed to send message: {source}")]
    Send { content: String, source: ApiError },
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("domain error: {0}")]
    Domain(#[from] DomainError),
    #[error("no conversation selected")]
    NotSelected,
    #[error("unknown conversation {0}")]
    UnknownConversation(ConversationId),
}

impl ApplicationError {
    pub fn load(resource: &'static str, source: ApiError) -> Self {
        Self::Load { resource, source }
    }

    pub fn send(content: impl Into<String>, source: ApiError) -> Self {
        Self::Send {
            content: content.into(),
            source,
        }
    }

    /// 调用方可以原样重试的错误
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ApplicationError::Connection(_)
                | ApplicationError::Load { .. }
                | ApplicationError::Send { .. }
        )
    }

    /// 发送失败时需要回填的输入内容
    pub fn restorable_content(&self) -> Option<&str> {
        match self {
            ApplicationError::Send { content, .. } => Some(content),
            _ => None,
        }
    }
}
