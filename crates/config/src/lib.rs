//! 统一配置中心
//!
//! 提供聊天客户端的全局配置管理，包括：
//! - 后端地址（REST 与推送通道）
//! - 同步核心的计时参数（输入防抖、过期、定时器精度）
//! - 推送通道重连策略
//! - 本地持久化位置
//! - 当前登录身份
//!
//! 加载优先级：内置默认值 -> `CHAT_CONFIG_FILE` 指向的文件 -> `CHAT_*` 环境变量。

use std::time::Duration;

use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

/// 指定配置文件路径的环境变量
pub const CONFIG_FILE_ENV: &str = "CHAT_CONFIG_FILE";
/// 环境变量前缀，嵌套字段用 `__` 分隔，例如 `CHAT_SYNC__TYPING_EXPIRY_MS`
pub const ENV_PREFIX: &str = "CHAT_";

/// 全局客户端配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate, Default)]
pub struct ClientConfig {
    /// 后端地址
    #[serde(default)]
    #[validate(nested)]
    pub backend: BackendConfig,
    /// 同步核心参数
    #[serde(default)]
    #[validate(nested)]
    pub sync: SyncConfig,
    /// 重连策略
    #[serde(default)]
    #[validate(nested)]
    pub reconnect: ReconnectConfig,
    /// 本地存储
    #[serde(default)]
    pub storage: StorageConfig,
    /// 登录身份
    #[serde(default)]
    pub identity: IdentityConfig,
}

/// 后端地址配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BackendConfig {
    #[validate(url)]
    pub http_base_url: String,
    #[validate(url)]
    pub ws_url: String,
    /// 单次 REST 请求超时（毫秒）
    #[validate(range(min = 1))]
    pub request_timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            http_base_url: "http://127.0.0.1:5000".into(),
            ws_url: "ws://127.0.0.1:5000/ws".into(),
            request_timeout_ms: 10_000,
        }
    }
}

impl BackendConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// 按对方身份去重时如何处理重复记录
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DedupPolicy {
    /// 保留第一条，把其余记录的活动合并进来
    #[default]
    MergeEvents,
    /// 保留第一条，其余记录直接丢弃
    DropDuplicates,
}

/// 会话列表的排序方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ListOrdering {
    /// 保持后端返回的顺序
    #[default]
    Backend,
    /// 按最后活动时间倒序
    RecentActivity,
}

/// 同步核心配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_sync_timing"))]
pub struct SyncConfig {
    /// 本地输入静默多久后发出"停止输入"
    #[validate(range(min = 1))]
    pub typing_debounce_ms: u64,
    /// 持续输入时重发"开始输入"的间隔
    pub typing_keepalive_ms: u64,
    /// 远端"开始输入"的硬过期时间
    pub typing_expiry_ms: u64,
    /// 计时器驱动精度
    #[validate(range(min = 1, max = 100))]
    pub timer_tick_ms: u64,
    /// 单条消息最大字符数
    #[validate(range(min = 1))]
    pub max_message_len: usize,
    #[serde(default)]
    pub dedup_policy: DedupPolicy,
    #[serde(default)]
    pub list_ordering: ListOrdering,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            typing_debounce_ms: 1_000,
            typing_keepalive_ms: 2_000,
            typing_expiry_ms: 3_000,
            timer_tick_ms: 50,
            max_message_len: 2_000,
            dedup_policy: DedupPolicy::default(),
            list_ordering: ListOrdering::default(),
        }
    }
}

impl SyncConfig {
    pub fn typing_debounce(&self) -> Duration {
        Duration::from_millis(self.typing_debounce_ms)
    }

    pub fn typing_keepalive(&self) -> Duration {
        Duration::from_millis(self.typing_keepalive_ms)
    }

    pub fn typing_expiry(&self) -> Duration {
        Duration::from_millis(self.typing_expiry_ms)
    }

    pub fn timer_tick(&self) -> Duration {
        Duration::from_millis(self.timer_tick_ms)
    }
}

fn validate_sync_timing(sync: &SyncConfig) -> Result<(), ValidationError> {
    if sync.typing_expiry_ms < sync.typing_debounce_ms {
        return Err(ValidationError::new("typing_expiry_shorter_than_debounce"));
    }
    // 保活间隔必须落在 [防抖窗口, 过期时间) 内，否则对端指示会在持续输入时闪烁
    if sync.typing_keepalive_ms < sync.typing_debounce_ms
        || sync.typing_keepalive_ms >= sync.typing_expiry_ms
    {
        return Err(ValidationError::new("typing_keepalive_out_of_range"));
    }
    Ok(())
}

/// 推送通道重连配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ReconnectConfig {
    #[validate(range(min = 1))]
    pub base_delay_ms: u64,
    #[validate(range(min = 1))]
    pub max_delay_ms: u64,
    /// 0 表示不重连
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 10_000,
            max_attempts: 10,
        }
    }
}

impl ReconnectConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// 本地持久化配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// 最近选中会话的保存文件
    pub selection_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            selection_path: ".event-chat/selection.json".into(),
        }
    }
}

/// 身份角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IdentityRole {
    Organizer,
    #[default]
    Attendee,
}

/// 登录身份，由外部认证流程提供；缺少 `user_id` 即视为没有会话
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IdentityConfig {
    pub user_id: Option<String>,
    #[serde(default)]
    pub display_name: String,
    pub token: Option<String>,
    #[serde(default)]
    pub role: IdentityRole,
}

impl ClientConfig {
    /// 构造带完整优先级链的 figment
    pub fn figment() -> Figment {
        let mut fig = Figment::new().merge(Serialized::defaults(ClientConfig::default()));
        if let Ok(path) = std::env::var(CONFIG_FILE_ENV) {
            if path.ends_with(".yml") || path.ends_with(".yaml") {
                fig = fig.merge(Yaml::file(path));
            } else if path.ends_with(".json") {
                fig = fig.merge(Json::file(path));
            } else {
                fig = fig.merge(Toml::file(path));
            }
        }
        fig.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// 加载并验证配置
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_figment(Self::figment())
    }

    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: ClientConfig = figment.extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    /// 日志用的脱敏表示
    pub fn sanitize(&self) -> String {
        let mut copy = self.clone();
        if copy.identity.token.is_some() {
            copy.identity.token = Some("[REDACTED]".into());
        }
        format!("{:?}", copy)
    }
}

/// 配置错误类型
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
    #[error("invalid configuration: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ClientConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sync.typing_debounce(), Duration::from_secs(1));
        assert_eq!(config.sync.typing_expiry(), Duration::from_secs(3));
        assert!(config.identity.user_id.is_none());
    }

    #[test]
    fn test_expiry_must_cover_debounce() {
        let mut config = ClientConfig::default();
        config.sync.typing_expiry_ms = 500;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_keepalive_must_stay_below_expiry() {
        let mut config = ClientConfig::default();
        config.sync.typing_keepalive_ms = 3_000;
        assert!(config.validate().is_err());

        config.sync.typing_keepalive_ms = 900;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_url_rejected() {
        let mut config = ClientConfig::default();
        config.backend.http_base_url = "not a url".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_coarse_timer_tick_rejected() {
        let mut config = ClientConfig::default();
        config.sync.timer_tick_ms = 500;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "chat.toml",
                r#"
                [backend]
                http_base_url = "https://events.example.com"
                ws_url = "wss://events.example.com/ws"
                request_timeout_ms = 5000

                [sync]
                typing_debounce_ms = 1000
                typing_keepalive_ms = 2000
                typing_expiry_ms = 3000
                timer_tick_ms = 20
                max_message_len = 500
                dedup_policy = "drop_duplicates"
                "#,
            )?;
            jail.set_env(CONFIG_FILE_ENV, "chat.toml");
            jail.set_env("CHAT_IDENTITY__USER_ID", "org_1");
            jail.set_env("CHAT_IDENTITY__ROLE", "organizer");
            jail.set_env("CHAT_SYNC__MAX_MESSAGE_LEN", "800");

            let config = ClientConfig::load().map_err(|e| e.to_string())?;
            assert_eq!(config.backend.http_base_url, "https://events.example.com");
            assert_eq!(config.sync.timer_tick_ms, 20);
            assert_eq!(config.sync.max_message_len, 800);
            assert_eq!(config.sync.dedup_policy, DedupPolicy::DropDuplicates);
            assert_eq!(config.identity.user_id.as_deref(), Some("org_1"));
            assert_eq!(config.identity.role, IdentityRole::Organizer);
            Ok(())
        });
    }

    #[test]
    fn test_sanitize_hides_token() {
        let mut config = ClientConfig::default();
        config.identity.token = Some("secret-bearer".into());
        let text = config.sanitize();
        assert!(!text.contains("secret-bearer"));
        assert!(text.contains("[REDACTED]"));
    }
}
