//! 任务执行适配器
//!
//! 串联缓存、会话池和浏览器代理：叠加配置、查缓存、借会话、
//! 带截止时间地运行代理。代理本身运行时间无上界，超时由这里强制。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use crate::cache::{fingerprint, ResultCache};
use crate::pool::SessionPool;
use crate::replay::{ReplayExecutor, StepRunner};
use webtask_config::ExecutorConfig;
use webtask_domain::{AgentExecutor, AgentRunResult, BrowserHandle, ExecutionConfig, Task};
use webtask_errors::{WebTaskError, WebTaskResult};

pub struct TaskExecutorAdapter {
    executor: Arc<dyn AgentExecutor>,
    pool: Arc<SessionPool>,
    cache: Option<ResultCache>,
    config: ExecutorConfig,
}

impl TaskExecutorAdapter {
    pub fn new(
        executor: Arc<dyn AgentExecutor>,
        pool: Arc<SessionPool>,
        config: ExecutorConfig,
    ) -> Self {
        let cache = if config.cache_enabled {
            Some(ResultCache::new(Duration::from_secs(config.cache_ttl_seconds)))
        } else {
            None
        };
        Self {
            executor,
            pool,
            cache,
            config,
        }
    }

    /// 任务实际生效的执行配置：服务级默认值被任务级覆盖项逐字段覆盖
    pub fn effective_config(&self, task: &Task) -> ExecutionConfig {
        let base = ExecutionConfig {
            headless: self.config.headless,
            ..ExecutionConfig::default()
        };
        base.overlay(&task.config)
    }

    /// 执行一个任务
    ///
    /// 缓存命中时不占用会话直接返回。会话借用是 RAII 租约，
    /// 超时和代理报错路径上都会自动归还。
    pub async fn execute(&self, task: &Task) -> WebTaskResult<AgentRunResult> {
        let effective = self.effective_config(task);
        let key = fingerprint(&task.instruction, &effective);

        if let Some(cache) = &self.cache {
            if let Some(cached) = cache.get(&key) {
                let result: AgentRunResult = serde_json::from_value(cached)?;
                info!("任务 {} 命中结果缓存，跳过执行", task.id);
                return Ok(result);
            }
        }

        let lease = self.pool.acquire().await?;
        let deadline = Duration::from_secs(self.task_timeout(task));
        info!(
            "任务 {} 开始执行，会话 {}，截止时间 {:?}",
            task.id,
            lease.session_id(),
            deadline
        );

        let run = self.run_with_strategy(task, lease.handle(), &effective);

        match tokio::time::timeout(deadline, run).await {
            Ok(Ok(result)) => {
                if result.success {
                    if let Some(cache) = &self.cache {
                        cache.put(key, serde_json::to_value(&result)?);
                    }
                }
                Ok(result)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!("任务 {} 执行超过截止时间 {:?}", task.id, deadline);
                // 尽力通知代理中止，失败只记录
                if let Err(e) = self.executor.cancel(task.id).await {
                    warn!("任务 {} 取消请求失败: {}", task.id, e);
                }
                Err(WebTaskError::ExecutionTimeout)
            }
        }
    }

    /// 按配置选择执行策略：携带回放段的任务重放历史，否则交给代理推理
    async fn run_with_strategy(
        &self,
        task: &Task,
        session: &dyn BrowserHandle,
        effective: &ExecutionConfig,
    ) -> WebTaskResult<AgentRunResult> {
        let Some(replay) = &effective.replay else {
            return self
                .executor
                .run(task.id, session, &task.instruction, effective)
                .await;
        };

        // 步进、重试和跳过由回放引擎控制，代理每次只执行一步
        let mut step_config = effective.clone();
        step_config.replay = None;
        step_config.max_steps = 1;
        let runner = AgentStepRunner {
            executor: self.executor.as_ref(),
            session,
            task_id: task.id,
            step_config,
        };

        let summary = ReplayExecutor::replay(&runner, replay).await?;
        info!(
            "任务 {} 回放完成，执行 {} 步，跳过 {} 步",
            task.id, summary.steps_executed, summary.steps_skipped
        );
        Ok(AgentRunResult {
            success: true,
            result: format!(
                "回放完成，执行 {} 步，跳过 {} 步",
                summary.steps_executed, summary.steps_skipped
            ),
            steps_executed: summary.steps_executed,
            videopath: None,
        })
    }

    fn task_timeout(&self, task: &Task) -> u64 {
        if task.timeout_seconds > 0 {
            task.timeout_seconds
        } else {
            self.config.default_timeout_seconds
        }
    }

    pub fn cache_len(&self) -> usize {
        self.cache.as_ref().map(|c| c.len()).unwrap_or(0)
    }

    /// 周期维护入口，剔除过期缓存条目
    pub fn evict_expired_cache(&self) -> usize {
        self.cache.as_ref().map(|c| c.evict_expired()).unwrap_or(0)
    }
}

/// 把回放历史的单个步骤转交给代理执行
struct AgentStepRunner<'a> {
    executor: &'a dyn AgentExecutor,
    session: &'a dyn BrowserHandle,
    task_id: i64,
    step_config: ExecutionConfig,
}

#[async_trait]
impl StepRunner for AgentStepRunner<'_> {
    async fn run_step(&self, index: usize, step: &Value) -> WebTaskResult<()> {
        let instruction = step.to_string();
        let result = self
            .executor
            .run(self.task_id, self.session, &instruction, &self.step_config)
            .await?;
        if result.success {
            Ok(())
        } else {
            Err(WebTaskError::execution_error(format!(
                "回放第 {} 步被代理拒绝: {}",
                index, result.result
            )))
        }
    }
}
