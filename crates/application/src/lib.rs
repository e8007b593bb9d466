//! 应用层实现。
//!
//! 实时会话同步核心：连接生命周期、在线集合、输入指示、消息流对账、
//! 会话目录，以及把它们组合起来的 [`ChatSession`]。
//! 对外部适配器（请求/响应接口、推送通道、本地持久化）只依赖这里定义的抽象。

pub mod clock;
pub mod connection;
pub mod directory;
pub mod error;
pub mod message_stream;
pub mod presence;
pub mod repository;
pub mod scheduler;
pub mod session;
pub mod transport;
pub mod typing;

pub use clock::{Clock, ManualClock, SystemClock};
pub use connection::{ConnectionManager, ConnectionState, Subscription};
pub use directory::{ConversationDirectory, RefreshOutcome, RefreshToken};
pub use error::{ApiError, ApplicationError, StorageError, TransportError};
pub use message_stream::{
    EntryId, LoadToken, MessageStream, PendingMessage, StreamEntry, StreamOp, StreamOutcome,
    StreamStatus,
};
pub use presence::PresenceTracker;
pub use repository::{ChatApi, SelectionStore};
pub use scheduler::ExpiryScheduler;
pub use session::{ChatSession, ChatSessionDependencies};
pub use transport::{PushChannel, PushTransport, TransportEvent};
pub use typing::{TypingEntry, TypingIndicatorTracker, TypingSettings, TypingTick};
