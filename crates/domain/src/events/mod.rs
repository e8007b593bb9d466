//! 推送通道事件定义
//!
//! 包含与消息后端长连接上收发的事件，以 `{"event": ..., "data": ...}` 的 JSON 帧传输。

pub mod push_event;

// 重新导出事件类型
pub use push_event::*;
