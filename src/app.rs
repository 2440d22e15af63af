use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use webtask_config::AppConfig;
use webtask_dispatcher::{CapacityEstimator, MetricsReporter, SystemResourceProbe, TaskDispatcher};
use webtask_domain::{AgentExecutor, Notifier, SessionFactory, Task, TaskEvent, TaskRepository};
use webtask_errors::WebTaskResult;
use webtask_executor::{
    ProcessAgentExecutor, ProcessSessionFactory, SessionPool, TaskExecutorAdapter,
};
use webtask_infrastructure::{SqliteTaskRepository, WebhookNotifier};

/// 组合根：把存储、会话池、执行适配器、调度器和通知器装配起来
pub struct Application {
    config: AppConfig,
    repository: Arc<dyn TaskRepository>,
    notifier: Arc<dyn Notifier>,
    pool: Arc<SessionPool>,
    adapter: Arc<TaskExecutorAdapter>,
    capacity: Arc<CapacityEstimator>,
}

impl Application {
    /// 按配置构建生产装配：SQLite 存储、进程桥接代理、webhook 通知
    pub async fn new(config: AppConfig) -> Result<Self> {
        let repository = Arc::new(
            SqliteTaskRepository::connect(&config.database)
                .await
                .context("连接任务存储失败")?,
        );
        let notifier = Arc::new(WebhookNotifier::new(config.webhooks.clone()));
        let session_factory = Arc::new(ProcessSessionFactory::new(config.agent.clone()));
        let agent = Arc::new(ProcessAgentExecutor::new(config.agent.clone()));

        Ok(Self::with_components(
            config,
            repository,
            session_factory,
            agent,
            notifier,
        ))
    }

    /// 用注入的组件装配，供测试和嵌入场景使用
    pub fn with_components(
        config: AppConfig,
        repository: Arc<dyn TaskRepository>,
        session_factory: Arc<dyn SessionFactory>,
        agent: Arc<dyn AgentExecutor>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let pool = Arc::new(SessionPool::new(
            config.session_pool.clone(),
            session_factory,
        ));
        let adapter = Arc::new(TaskExecutorAdapter::new(
            agent,
            Arc::clone(&pool),
            config.executor.clone(),
        ));
        let capacity = Arc::new(CapacityEstimator::new(
            config.capacity.clone(),
            Box::new(SystemResourceProbe),
        ));

        Self {
            config,
            repository,
            notifier,
            pool,
            adapter,
            capacity,
        }
    }

    pub fn repository(&self) -> Arc<dyn TaskRepository> {
        Arc::clone(&self.repository)
    }

    /// 任务入队：入库并发出 Queued 事件
    pub async fn submit_task(&self, task: Task) -> WebTaskResult<Task> {
        let stored = self.repository.create(&task).await?;
        info!("任务 {} 已入队，优先级 {}", stored.id, stored.priority);
        self.notifier
            .notify(&TaskEvent::queued(
                stored.id,
                json!({
                    "instruction": stored.instruction,
                    "priority": stored.priority,
                }),
            ))
            .await;
        Ok(stored)
    }

    /// 启动全部后台循环，收到关停信号后逐个收尾
    pub async fn run(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("启动任务调度服务，并发容量 {}", self.capacity.current());

        let capacity_handle = tokio::spawn(
            Arc::clone(&self.capacity).run_refresh_loop(shutdown_rx.resubscribe()),
        );

        let reporter = Arc::new(MetricsReporter::new(
            Arc::clone(&self.repository),
            Arc::clone(&self.notifier),
            Arc::clone(&self.pool),
            Arc::clone(&self.capacity),
            self.config.webhooks.metrics_interval_seconds,
        ));
        let metrics_handle = tokio::spawn(reporter.run(shutdown_rx.resubscribe()));

        let maintenance_handle = tokio::spawn(Self::run_maintenance_loop(
            Arc::clone(&self.pool),
            Arc::clone(&self.adapter),
            Duration::from_secs(self.config.session_pool.reclaim_interval_seconds),
            shutdown_rx.resubscribe(),
        ));

        let dispatcher = Arc::new(TaskDispatcher::new(
            Arc::clone(&self.repository),
            Arc::clone(&self.adapter),
            Arc::clone(&self.notifier),
            Arc::clone(&self.capacity),
            self.config.scheduler.clone(),
        ));
        // 调度循环在当前任务内运行，结束即进入收尾
        dispatcher.run(shutdown_rx).await;

        self.pool.close_all().await;

        for (name, handle) in [
            ("容量刷新", capacity_handle),
            ("指标上报", metrics_handle),
            ("池维护", maintenance_handle),
        ] {
            if let Err(e) = handle.await {
                error!("{}循环退出异常: {}", name, e);
            }
        }

        info!("任务调度服务已停止");
        Ok(())
    }

    /// 会话池回收与缓存清理
    async fn run_maintenance_loop(
        pool: Arc<SessionPool>,
        adapter: Arc<TaskExecutorAdapter>,
        interval: Duration,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        info!("池维护循环启动，间隔 {:?}", interval);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let reclaimed = pool.reclaim_idle().await;
                    let evicted = adapter.evict_expired_cache();
                    if reclaimed > 0 || evicted > 0 {
                        info!("维护完成：回收会话 {}，剔除缓存 {}", reclaimed, evicted);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("池维护循环退出");
                    return;
                }
            }
        }
    }
}

impl Drop for Application {
    fn drop(&mut self) {
        if self.pool.stats().busy_sessions > 0 {
            warn!("应用销毁时仍有占用中的会话");
        }
    }
}
