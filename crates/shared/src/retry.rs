//! 重试策略与执行器
//!
//! 用于启动阶段等待 broker/数据库就绪等瞬时故障。只有调用方判定为可重试的错误才会重试，
//! schema 漂移之类的确定性错误直接向上返回。

use std::future::Future;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::NotifyError;

/// 重试策略配置
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 最大重试次数（不含首次执行）
    pub max_retries: u32,
    /// 首次重试前的等待时间
    pub initial_delay: Duration,
    /// 退避时间上限
    pub max_delay: Duration,
    /// 每次重试的退避倍数，1.0 即固定间隔
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    /// 最多重试 3 次，初始等待 1 秒，最大等待 30 秒，倍数 2.0
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// 固定间隔的策略
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
        }
    }

    /// 第 N 次重试的等待时间（attempt 从 0 开始），不超过 max_delay
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let delay_ms = base_ms * self.multiplier.powi(attempt as i32);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// 带重试的异步执行器
pub async fn retry_with_policy<F, Fut, T>(
    policy: &RetryPolicy,
    operation_name: &str,
    is_retryable: impl Fn(&NotifyError) -> bool,
    mut operation: F,
) -> Result<T, NotifyError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, NotifyError>>,
{
    let mut attempt: u32 = 0;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    info!(operation = operation_name, attempt, "操作在重试后成功");
                }
                return Ok(value);
            }
            Err(err) if !is_retryable(&err) => {
                warn!(operation = operation_name, error = %err, "操作失败且不可重试");
                return Err(err);
            }
            Err(err) if !policy.should_retry(attempt) => {
                warn!(
                    operation = operation_name,
                    attempt,
                    max_retries = policy.max_retries,
                    error = %err,
                    "已达最大重试次数，放弃重试"
                );
                return Err(err);
            }
            Err(err) => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    operation = operation_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "操作失败，将在退避后重试"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
