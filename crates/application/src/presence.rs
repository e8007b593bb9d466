use std::collections::HashSet;

use domain::{Identity, ServerEvent};
use tracing::debug;

use crate::connection::ConnectionState;

/// 在线状态跟踪器
///
/// 只由推送的 `userOnline`/`userOffline` 事件驱动，纯内存、不持久化。
/// 连接一旦离开 connected，整个集合清空：过期的在线状态比没有更糟。
#[derive(Debug, Default)]
pub struct PresenceTracker {
    online: HashSet<Identity>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_online(&mut self, identity: Identity) {
        self.online.insert(identity);
    }

    pub fn on_offline(&mut self, identity: &Identity) {
        self.online.remove(identity);
    }

    /// 处理一条推送事件，非在线状态事件返回 false
    pub fn apply(&mut self, event: &ServerEvent) -> bool {
        match event {
            ServerEvent::UserOnline(identity) => {
                self.on_online(identity.clone());
                true
            }
            ServerEvent::UserOffline(identity) => {
                self.on_offline(identity);
                true
            }
            _ => false,
        }
    }

    pub fn on_connection_state(&mut self, state: ConnectionState) {
        if state != ConnectionState::Connected && !self.online.is_empty() {
            debug!(cleared = self.online.len(), state = ?state, "连接不可用，清空在线集合");
            self.online.clear();
        }
    }

    pub fn is_online(&self, identity: &Identity) -> bool {
        self.online.contains(identity)
    }

    pub fn online_count(&self) -> usize {
        self.online.len()
    }

    /// 排序后的在线用户列表
    pub fn online_users(&self) -> Vec<Identity> {
        let mut users: Vec<_> = self.online.iter().cloned().collect();
        users.sort();
        users
    }

    pub fn clear(&mut self) {
        self.online.clear();
    }
}
