use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::VersionError;

/// 重试配置
///
/// 重试次数由每个条目的 `tries` 决定，这里只控制两次尝试之间的退避。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// 初始退避时间（毫秒）
    pub initial_backoff_ms: u64,
    /// 最大退避时间（毫秒）
    pub max_backoff_ms: u64,
    /// 退避倍率
    pub backoff_multiplier: f64,
    /// 添加随机抖动以避免惊群效应
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 500,
            max_backoff_ms: 10_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// 不等待、立即重试（测试使用）
    pub fn immediate() -> Self {
        Self {
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.backoff_multiplier < 1.0 {
            return Err("退避倍率不能小于1".to_string());
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err("初始退避时间不能大于最大退避时间".to_string());
        }
        Ok(())
    }

    /// 第 `attempt` 次失败之后的等待时间（attempt 从 1 开始）
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let base = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(exp);
        let base = (base as u64).min(self.max_backoff_ms);
        let ms = if self.jitter { add_jitter(base) } else { base };
        Duration::from_millis(ms)
    }
}

fn add_jitter(base_ms: u64) -> u64 {
    let jitter_range = (base_ms as f64 * 0.1) as u64; // 10% 抖动
    if jitter_range == 0 {
        return base_ms;
    }
    let jitter = rand::random::<f64>() * jitter_range as f64;
    base_ms + jitter as u64
}

/// 通用的重试执行器：只重试临时错误
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// 执行带重试的异步操作，最多尝试 `tries` 次
    ///
    /// `PermanentHttp`、插件错误等非临时错误立即返回；预算耗尽时返回最后一次的错误。
    pub async fn execute_with_retry<F, Fut, T>(
        &self,
        tries: u32,
        mut operation: F,
        label: &str,
    ) -> Result<T, VersionError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, VersionError>>,
    {
        let tries = tries.max(1);
        let mut attempt = 1;

        loop {
            match operation(attempt).await {
                Ok(result) => {
                    if attempt > 1 {
                        debug!(op = %label, attempt, "第 {} 次尝试后成功", attempt);
                    }
                    return Ok(result);
                }
                Err(error) if error.is_temporary() && attempt < tries => {
                    let delay = self.config.backoff_for(attempt);
                    warn!(
                        op = %label,
                        tries = attempt,
                        max_tries = tries,
                        error = %error,
                        "临时错误，{}毫秒后重试",
                        delay.as_millis()
                    );
                    if !delay.is_zero() {
                        sleep(delay).await;
                    }
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}
