//! 主应用程序入口
//!
//! 加载配置、组装同步核心，然后进入命令行聊天客户端。

mod console;

use std::sync::Arc;

use anyhow::Context;
use application::{ChatSession, ChatSessionDependencies, SystemClock};
use config::{ClientConfig, IdentityConfig, IdentityRole};
use domain::{Identity, Viewer, ViewerRole};
use infrastructure::{FileSelectionStore, HttpChatApi, ReconnectPolicy, WebSocketTransport};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = ClientConfig::load().context("加载配置失败")?;
    tracing::info!(config = %config.sanitize(), "配置已加载");

    let viewer = viewer_from(&config.identity)
        .context("未配置登录身份 (CHAT_IDENTITY__USER_ID)，无法建立聊天会话")?;

    let token = config.identity.token.clone();
    let api = HttpChatApi::from_config(&config.backend, token.clone())
        .context("创建 HTTP 客户端失败")?;
    let transport = WebSocketTransport::new(
        config.backend.ws_url.clone(),
        token,
        ReconnectPolicy::from(&config.reconnect),
    );
    let selection_store = FileSelectionStore::new(&config.storage.selection_path);

    let session = ChatSession::new(
        ChatSessionDependencies {
            api: Arc::new(api),
            transport: Arc::new(transport),
            selection_store: Arc::new(selection_store),
            clock: Arc::new(SystemClock),
        },
        config.sync.clone(),
    );

    session.init(Some(viewer.clone()))?;
    tracing::info!(user_id = %viewer.identity, "聊天会话已初始化");

    let result = console::run(session.clone(), viewer).await;
    session.teardown();
    result
}

/// 把配置中的身份映射为查看者；没有用户 id 即没有会话
fn viewer_from(identity: &IdentityConfig) -> Option<Viewer> {
    let user_id = identity.user_id.as_deref().map(str::trim)?;
    if user_id.is_empty() {
        return None;
    }
    let display_name = if identity.display_name.trim().is_empty() {
        user_id.to_owned()
    } else {
        identity.display_name.trim().to_owned()
    };
    let role = match identity.role {
        IdentityRole::Organizer => ViewerRole::Organizer,
        IdentityRole::Attendee => ViewerRole::Attendee,
    };
    Some(Viewer::new(Identity::new(user_id), display_name, role))
}
