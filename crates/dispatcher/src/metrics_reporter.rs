//! 周期性运行指标上报
//!
//! 每个周期汇总任务状态分布和会话池状况，作为 metrics 事件
//! 推给通知侧。上报失败不影响调度。

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::capacity::CapacityEstimator;
use webtask_domain::{Notifier, TaskEvent, TaskRepository};
use webtask_errors::WebTaskResult;
use webtask_executor::SessionPool;

pub struct MetricsReporter {
    repository: Arc<dyn TaskRepository>,
    notifier: Arc<dyn Notifier>,
    pool: Arc<SessionPool>,
    capacity: Arc<CapacityEstimator>,
    interval: Duration,
}

impl MetricsReporter {
    pub fn new(
        repository: Arc<dyn TaskRepository>,
        notifier: Arc<dyn Notifier>,
        pool: Arc<SessionPool>,
        capacity: Arc<CapacityEstimator>,
        interval_seconds: u64,
    ) -> Self {
        Self {
            repository,
            notifier,
            pool,
            capacity,
            interval: Duration::from_secs(interval_seconds),
        }
    }

    /// 汇总一次指标并发出 metrics 事件
    pub async fn report_once(&self) -> WebTaskResult<()> {
        let counts = self.repository.count_by_status().await?;
        let pool = self.pool.stats();
        let limit = self.capacity.current();
        let available_slots = limit.saturating_sub(counts.running as usize);
        let probe = self.capacity.probe();

        let event = TaskEvent::metrics(json!({
            "tasks": {
                "pending": counts.pending,
                "running": counts.running,
                "completed": counts.completed,
                "failed": counts.failed,
                "total": counts.total(),
                "available_slots": available_slots,
            },
            "sessions": {
                "total": pool.total_sessions,
                "busy": pool.busy_sessions,
                "created": pool.created_count,
                "reused": pool.reused_count,
            },
            "system": {
                "capacity_limit": limit,
                "cpu_count": probe.cpu_count(),
                "available_memory_mb": probe.available_memory_mb(),
            },
        }));
        self.notifier.notify(&event).await;
        debug!(
            "指标上报完成: pending={} running={} 空余额度 {} 会话 {}/{}",
            counts.pending, counts.running, available_slots, pool.busy_sessions, pool.total_sessions
        );
        Ok(())
    }

    pub async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("指标上报循环启动，间隔 {:?}", self.interval);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    if let Err(e) = self.report_once().await {
                        error!("指标上报失败: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("指标上报循环退出");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capacity::StaticResourceProbe;
    use webtask_config::{CapacityConfig, SessionPoolConfig};
    use webtask_domain::{EventKind, TaskRepository, TaskStatus};
    use webtask_testing_utils::{
        MockNotifier, MockSessionFactory, MockTaskRepository, TaskBuilder,
    };

    fn test_pool() -> Arc<SessionPool> {
        Arc::new(SessionPool::new(
            SessionPoolConfig {
                max_sessions: 2,
                idle_timeout_seconds: 300,
                acquire_poll_interval_ms: 10,
                reclaim_interval_seconds: 60,
            },
            Arc::new(MockSessionFactory::new()),
        ))
    }

    fn test_capacity(limit: usize) -> Arc<CapacityEstimator> {
        Arc::new(CapacityEstimator::new(
            CapacityConfig {
                tasks_per_cpu: 2,
                memory_per_task_mb: 400,
                absolute_cap: 32,
                refresh_interval_seconds: 30,
                static_limit: Some(limit),
            },
            Box::new(StaticResourceProbe {
                cpus: Some(4),
                memory_mb: Some(8000),
            }),
        ))
    }

    #[tokio::test]
    async fn test_report_once_emits_metrics_event() {
        let repository = Arc::new(MockTaskRepository::new());
        let notifier = Arc::new(MockNotifier::new());
        let pool = test_pool();

        repository
            .create(&TaskBuilder::new().build())
            .await
            .unwrap();
        repository
            .create(&TaskBuilder::new().with_status(TaskStatus::Completed).build())
            .await
            .unwrap();
        let lease = pool.acquire().await.unwrap();

        let reporter = MetricsReporter::new(repository, notifier.clone(), pool, test_capacity(4), 30);
        reporter.report_once().await.unwrap();

        let events = notifier.events();
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.kind, EventKind::Metrics);
        assert!(event.task_id.is_none());
        assert_eq!(event.payload["tasks"]["pending"], 1);
        assert_eq!(event.payload["tasks"]["completed"], 1);
        assert_eq!(event.payload["tasks"]["total"], 2);
        assert_eq!(event.payload["sessions"]["busy"], 1);
        drop(lease);
    }

    #[tokio::test]
    async fn test_metrics_payload_reports_slots_and_system_resources() {
        let repository = Arc::new(MockTaskRepository::new());
        let notifier = Arc::new(MockNotifier::new());

        repository
            .create(&TaskBuilder::new().with_status(TaskStatus::Running).build())
            .await
            .unwrap();

        let reporter =
            MetricsReporter::new(repository, notifier.clone(), test_pool(), test_capacity(4), 30);
        reporter.report_once().await.unwrap();

        let events = notifier.events();
        assert_eq!(events.len(), 1);
        let payload = &events[0].payload;
        assert_eq!(payload["tasks"]["available_slots"], 3);
        assert_eq!(payload["system"]["capacity_limit"], 4);
        assert_eq!(payload["system"]["cpu_count"], 4);
        assert_eq!(payload["system"]["available_memory_mb"], 8000);
    }

    #[tokio::test]
    async fn test_run_loop_exits_on_shutdown() {
        let reporter = Arc::new(MetricsReporter::new(
            Arc::new(MockTaskRepository::new()),
            Arc::new(MockNotifier::new()),
            test_pool(),
            test_capacity(2),
            3600,
        ));

        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(reporter.run(rx));
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
