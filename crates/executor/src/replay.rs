//! 历史动作回放
//!
//! 任务配置携带 `replay` 段时不走代理推理，而是把既往记录的动作
//! 序列逐步重放。每步有固定重试次数，步间插入固定间隔，
//! `skip_failures` 决定单步最终失败时是跳过还是中止整个回放。

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, warn};

use webtask_domain::ReplayConfig;
use webtask_errors::{WebTaskError, WebTaskResult};

/// 执行单个回放步骤的接口，由浏览器代理一侧实现
#[async_trait]
pub trait StepRunner: Send + Sync {
    async fn run_step(&self, index: usize, step: &Value) -> WebTaskResult<()>;
}

/// 一次回放的结果摘要
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplaySummary {
    pub steps_executed: u32,
    pub steps_skipped: u32,
}

pub struct ReplayExecutor;

impl ReplayExecutor {
    pub async fn replay(
        runner: &dyn StepRunner,
        config: &ReplayConfig,
    ) -> WebTaskResult<ReplaySummary> {
        let delay = Duration::from_millis(config.delay_between_actions_ms);
        let mut executed = 0u32;
        let mut skipped = 0u32;

        for (index, step) in config.history.iter().enumerate() {
            match Self::run_step_with_retries(runner, index, step, config.max_retries).await {
                Ok(()) => executed += 1,
                Err(e) if config.skip_failures => {
                    warn!("回放第 {} 步失败，已跳过: {}", index, e);
                    skipped += 1;
                }
                Err(e) => {
                    warn!("回放第 {} 步失败，中止回放: {}", index, e);
                    return Err(e);
                }
            }

            if index + 1 < config.history.len() && !delay.is_zero() {
                sleep(delay).await;
            }
        }

        Ok(ReplaySummary {
            steps_executed: executed,
            steps_skipped: skipped,
        })
    }

    async fn run_step_with_retries(
        runner: &dyn StepRunner,
        index: usize,
        step: &Value,
        max_retries: u32,
    ) -> WebTaskResult<()> {
        let mut last_err = WebTaskError::execution_error("回放步骤未执行");
        for attempt in 0..=max_retries {
            match runner.run_step(index, step).await {
                Ok(()) => {
                    debug!("回放第 {} 步完成（第 {} 次尝试）", index, attempt + 1);
                    return Ok(());
                }
                Err(e) => {
                    debug!("回放第 {} 步第 {} 次尝试失败: {}", index, attempt + 1, e);
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }
}
