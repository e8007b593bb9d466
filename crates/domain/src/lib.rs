//! 活动聊天同步核心的领域模型
//!
//! 包含身份、会话、消息等核心实体，以及推送通道上收发的事件定义。
//! 这一层不做任何 I/O。

pub mod conversation;
pub mod errors;
pub mod events;
pub mod message;
pub mod value_objects;

// 重新导出常用类型
pub use conversation::*;
pub use errors::*;
pub use events::*;
pub use message::*;
pub use value_objects::*;
