use crate::sync::remote::RemoteError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 失败原因分类
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum FailureReason {
    /// 网络不可用 - 可重试
    Network,
    /// 请求超时 - 可重试
    Timeout,
    /// 服务端拒绝 - 4xx 不重试，5xx 可重试
    ServerRejection(u16),
    /// 认证过期 - 刷新令牌后重试
    AuthExpired,
    /// 远端配额/限流 - 延迟重试
    QuotaExceeded,
}

impl FailureReason {
    /// 判断是否可以重试
    pub fn is_retryable(&self) -> bool {
        match self {
            FailureReason::Network => true,
            FailureReason::Timeout => true,
            FailureReason::ServerRejection(code) => (500..600).contains(code),
            FailureReason::AuthExpired => true,
            FailureReason::QuotaExceeded => true,
        }
    }
}

impl From<&RemoteError> for FailureReason {
    fn from(error: &RemoteError) -> Self {
        match error {
            RemoteError::Network(_) => FailureReason::Network,
            RemoteError::Timeout => FailureReason::Timeout,
            RemoteError::ServerRejection { status, .. } => FailureReason::ServerRejection(*status),
            RemoteError::AuthExpired => FailureReason::AuthExpired,
            RemoteError::QuotaExceeded => FailureReason::QuotaExceeded,
        }
    }
}

/// 重试策略配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// 最大重试次数，达到后进入 Failed 终态
    pub max_retries: u32,
    /// 基础延迟（毫秒）
    pub base_delay_ms: u64,
    /// 最大延迟（毫秒）
    pub max_delay_ms: u64,
    /// 是否启用指数退避，关闭时每次固定等待 base_delay_ms
    pub exponential_backoff: bool,
    /// 随机抖动因子 (0.0-1.0)，默认 0 保持退避表精确
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 30_000,
            max_delay_ms: 240_000,
            exponential_backoff: true,
            jitter_factor: 0.0,
        }
    }
}

impl RetryPolicy {
    /// 第 `retry_count` 次重试前需要等待的时间
    ///
    /// 首次尝试（retry_count = 0）立即执行；之后为
    /// `min(base × 2^(retry_count-1), max)`
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        if retry_count == 0 {
            return Duration::ZERO;
        }

        let delay_ms = if self.exponential_backoff {
            let exponent = (retry_count - 1).min(31);
            self.base_delay_ms
                .saturating_mul(1u64 << exponent)
                .min(self.max_delay_ms)
        } else {
            self.base_delay_ms
        };

        Duration::from_millis(self.apply_jitter(delay_ms))
    }

    fn apply_jitter(&self, delay_ms: u64) -> u64 {
        if self.jitter_factor <= 0.0 || delay_ms == 0 {
            return delay_ms;
        }
        let jitter = delay_ms as f64 * self.jitter_factor * (rand::random::<f64>() - 0.5);
        (delay_ms as f64 + jitter).max(0.0) as u64
    }

    /// 检查是否应该重试
    pub fn should_retry(&self, retry_count: u32, max_retries: u32, reason: &FailureReason) -> bool {
        retry_count < max_retries && reason.is_retryable()
    }

    /// 计算下次可以出队的时间；不再重试时返回 None
    ///
    /// `retry_count` 为已经递增后的重试次数
    pub fn next_attempt_at(
        &self,
        now_ms: i64,
        retry_count: u32,
        max_retries: u32,
        reason: &FailureReason,
    ) -> Option<i64> {
        if !self.should_retry(retry_count, max_retries, reason) {
            return None;
        }
        let delay_ms = i64::try_from(self.delay_for(retry_count).as_millis()).unwrap_or(i64::MAX);
        Some(now_ms.saturating_add(delay_ms))
    }
}
