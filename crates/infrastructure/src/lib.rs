//! 基础设施层实现。
//!
//! 提供 HTTP 接口、WebSocket 推送通道、本地选择存储等适配器，
//! 实现应用层定义的 [`application::ChatApi`]、[`application::PushTransport`]
//! 和 [`application::SelectionStore`]。

pub mod backoff;
pub mod rest;
pub mod selection_store;
pub mod websocket;

pub use backoff::{Backoff, ReconnectPolicy};
pub use rest::HttpChatApi;
pub use selection_store::FileSelectionStore;
pub use websocket::WebSocketTransport;
