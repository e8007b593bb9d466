use std::time::Duration;

use config::ReconnectConfig;
use rand::Rng;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Backoff {
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    pub fn exponential(base: Duration, max: Duration) -> Self {
        Backoff::Exponential { base, max }
    }

    /// 第 `attempt` 次重试（从 1 开始）的基础等待时间，不超过上限
    pub fn delay_at(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Exponential { base, max } => {
                let exp = std::cmp::min(attempt.saturating_sub(1), 20);
                let factor = 1u32 << exp;
                std::cmp::min(base.saturating_mul(factor), *max)
            }
        }
    }

    /// 加抖动后的等待时间，落在 [delay/2, delay] 内
    pub fn jittered_delay_at(&self, attempt: u32) -> Duration {
        let delay = self.delay_at(attempt);
        let upper = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        let lower = upper / 2;
        if upper == lower {
            return delay;
        }
        Duration::from_millis(rand::rng().random_range(lower..=upper))
    }
}

/// 推送通道的重连策略
#[derive(Clone, Debug)]
pub struct ReconnectPolicy {
    /// 0 表示断开后不再重连
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl ReconnectPolicy {
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(config: &ReconnectConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            backoff: Backoff::exponential(config.base_delay(), config.max_delay()),
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&ReconnectConfig::default())
    }
}
