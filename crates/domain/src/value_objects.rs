use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::DomainError;

/// 统一的时间戳类型。
pub type Timestamp = DateTime<Utc>;

/// 后端下发的字符串标识统一用这个宏生成新类型。
macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// 用户身份标识，会话期间保持稳定。
    Identity
);
string_id!(
    /// 会话唯一标识。
    ConversationId
);
string_id!(
    /// 后端分配的消息标识。
    MessageId
);
string_id!(
    /// 活动（订单所属的活动）唯一标识。
    EventId
);

/// 乐观发送时本地生成的临时消息标识，确认前一直使用。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalMessageId(Uuid);

impl LocalMessageId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for LocalMessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "temp-{}", self.0)
    }
}

impl From<Uuid> for LocalMessageId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

/// 经过验证的消息内容。
///
/// 反序列化不做校验：服务端历史按原样接收，只有本地发出的内容走 [`MessageContent::parse`]。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageContent(String);

impl MessageContent {
    /// 默认的最大长度（字符数）。
    pub const DEFAULT_MAX_LEN: usize = 2000;

    pub fn parse(value: impl Into<String>, max_len: usize) -> Result<Self, DomainError> {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(DomainError::validation_error("content", "cannot be empty"));
        }
        if trimmed.chars().count() > max_len {
            return Err(DomainError::validation_error(
                "content",
                format!("exceeds {max_len} characters"),
            ));
        }
        Ok(Self(trimmed.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for MessageContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 查看者在会话中的角色。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewerRole {
    Organizer,
    Attendee,
}

/// 当前登录的查看者。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewer {
    pub identity: Identity,
    pub display_name: String,
    pub role: ViewerRole,
}

impl Viewer {
    pub fn new(identity: Identity, display_name: impl Into<String>, role: ViewerRole) -> Self {
        Self {
            identity,
            display_name: display_name.into(),
            role,
        }
    }
}
