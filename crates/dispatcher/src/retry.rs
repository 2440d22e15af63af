//! 状态写入的有限重试
//!
//! 任务执行结果必须落库，持久化抖动时按指数退避重试若干次。
//! 只有可重试类错误（持久化错误）会触发重试，其余立即返回。

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use webtask_errors::{WebTaskError, WebTaskResult};

/// 重试间隔的随机抖动范围
const JITTER_FACTOR: f64 = 0.1;

/// 按指数退避重试一个异步操作
///
/// `attempts` 是总尝试次数（含首次）。间隔为 base * 2^n 并叠加
/// ±10% 抖动，避免多个派发单元同步重试。
pub async fn retry_with_backoff<T, F, Fut>(
    attempts: u32,
    base_delay: Duration,
    operation: F,
) -> WebTaskResult<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = WebTaskResult<T>>,
{
    let attempts = attempts.max(1);
    let mut last_err = WebTaskError::Internal("重试未执行任何尝试".into());

    for attempt in 0..attempts {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                let delay = backoff_delay(base_delay, attempt);
                debug!("第 {} 次尝试失败，{:?} 后重试: {}", attempt + 1, delay, e);
                tokio::time::sleep(delay).await;
                last_err = e;
            }
            Err(e) => {
                if attempt > 0 {
                    warn!("重试 {} 次后仍失败: {}", attempt, e);
                }
                return Err(e);
            }
        }
    }

    Err(last_err)
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exp = base.as_millis() as f64 * 2f64.powi(attempt as i32);
    let jitter = rand::rng().random_range(-JITTER_FACTOR..=JITTER_FACTOR);
    Duration::from_millis((exp * (1.0 + jitter)).max(1.0) as u64)
}
