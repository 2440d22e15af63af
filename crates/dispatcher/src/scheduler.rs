//! 任务派发循环
//!
//! 周期从存储拉取 pending 任务，在容量上限内逐个派发为独立的
//! 执行单元。存储是唯一权威状态，内存只维护在途任务集合，
//! 用于准入控制和防止重复派发。

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::capacity::CapacityEstimator;
use crate::retry::retry_with_backoff;
use webtask_config::SchedulerConfig;
use webtask_domain::{Notifier, Task, TaskEvent, TaskRepository};
use webtask_errors::{WebTaskError, WebTaskResult};
use webtask_executor::TaskExecutorAdapter;

pub struct TaskDispatcher {
    repository: Arc<dyn TaskRepository>,
    adapter: Arc<TaskExecutorAdapter>,
    notifier: Arc<dyn Notifier>,
    capacity: Arc<CapacityEstimator>,
    config: SchedulerConfig,
    /// 在途任务 id，准入判定与去重的依据
    in_flight: Arc<Mutex<HashSet<i64>>>,
    /// 在途执行单元的句柄，关停时用于中止
    handles: Mutex<HashMap<i64, JoinHandle<()>>>,
}

/// 执行单元结束时从在途集合移除任务，panic 展开路径同样生效
struct InFlightGuard {
    in_flight: Arc<Mutex<HashSet<i64>>>,
    task_id: i64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.lock().unwrap().remove(&self.task_id);
    }
}

impl TaskDispatcher {
    pub fn new(
        repository: Arc<dyn TaskRepository>,
        adapter: Arc<TaskExecutorAdapter>,
        notifier: Arc<dyn Notifier>,
        capacity: Arc<CapacityEstimator>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            repository,
            adapter,
            notifier,
            capacity,
            config,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            handles: Mutex::new(HashMap::new()),
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().unwrap().len()
    }

    /// 主调度循环，收到关停信号后停止准入并处理在途任务
    pub async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        info!("调度循环启动，轮询间隔 {:?}", poll_interval);

        loop {
            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {
                    if let Err(e) = self.poll_once().await {
                        error!("调度轮询失败: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("调度循环收到关停信号");
                    break;
                }
            }
        }

        self.shutdown().await;
    }

    /// 单次轮询：回收已结束的句柄，按空余容量准入新任务
    pub async fn poll_once(self: &Arc<Self>) -> WebTaskResult<()> {
        self.prune_finished();

        let limit = self.capacity.current();
        let running = self.in_flight_count();
        let free = limit.saturating_sub(running);
        if free == 0 {
            debug!("容量已满（{}/{}），本轮不准入", running, limit);
            return Ok(());
        }

        let batch = free.min(self.config.batch_size as usize) as u32;
        let pending = self.repository.list_pending(batch).await?;
        if pending.is_empty() {
            return Ok(());
        }

        debug!("拉取到 {} 个待执行任务，空余容量 {}", pending.len(), free);
        for task in pending {
            self.dispatch(task);
        }
        Ok(())
    }

    /// 派发一个任务为独立执行单元；已在途的任务直接跳过
    fn dispatch(self: &Arc<Self>, task: Task) {
        let task_id = task.id;
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            if !in_flight.insert(task_id) {
                debug!("任务 {} 已在途，跳过重复派发", task_id);
                return;
            }
        }

        let dispatcher = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let _guard = InFlightGuard {
                in_flight: Arc::clone(&dispatcher.in_flight),
                task_id,
            };
            dispatcher.execute_task(task).await;
        });
        self.handles.lock().unwrap().insert(task_id, handle);
    }

    /// 一个任务的完整执行路径：置 running、执行、落终态、发通知
    async fn execute_task(&self, task: Task) {
        let task_id = task.id;

        // 置 running 失败时任务保持 pending，下轮重新进入
        if let Err(e) = self
            .persist(|| self.repository.set_running(task_id, Utc::now()))
            .await
        {
            match &e {
                WebTaskError::InvalidStateTransition { .. } | WebTaskError::TaskNotFound { .. } => {
                    warn!("任务 {} 不再处于待执行状态，放弃派发: {}", task_id, e);
                }
                _ => error!("任务 {} 置为运行态失败: {}", task_id, e),
            }
            return;
        }

        self.notifier
            .notify(&TaskEvent::started(
                task_id,
                json!({
                    "instruction": task.instruction,
                    "priority": task.priority,
                }),
            ))
            .await;

        match self.adapter.execute(&task).await {
            Ok(result) if result.success => {
                let value = result.to_value();
                info!("任务 {} 执行成功，共 {} 步", task_id, result.steps_executed);
                if let Err(e) = self
                    .persist(|| self.repository.set_completed(task_id, value.clone(), Utc::now()))
                    .await
                {
                    error!("任务 {} 结果落库失败: {}", task_id, e);
                    return;
                }
                self.notifier
                    .notify(&TaskEvent::completed(task_id, value))
                    .await;
            }
            Ok(result) => {
                // 代理正常返回但宣告失败，保留其产出作为部分结果
                let value = result.to_value();
                warn!("任务 {} 执行失败: {}", task_id, result.result);
                self.finalize_failed(&task, &result.result, Some(value)).await;
            }
            Err(e) => {
                warn!("任务 {} 执行出错（{}）: {}", task_id, e.kind(), e);
                self.finalize_failed(&task, &e.to_string(), None).await;
            }
        }
    }

    async fn finalize_failed(
        &self,
        task: &Task,
        error: &str,
        partial_result: Option<serde_json::Value>,
    ) {
        let task_id = task.id;
        if let Err(e) = self
            .persist(|| {
                self.repository
                    .set_failed(task_id, error, partial_result.clone(), Utc::now())
            })
            .await
        {
            error!("任务 {} 失败状态落库失败: {}", task_id, e);
            return;
        }
        let task_data = serde_json::to_value(task).unwrap_or(json!(null));
        self.notifier
            .notify(&TaskEvent::failed(task_id, error, task_data))
            .await;
    }

    async fn persist<T, F, Fut>(&self, operation: F) -> WebTaskResult<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = WebTaskResult<T>>,
    {
        retry_with_backoff(
            self.config.persistence_retry_attempts,
            Duration::from_millis(self.config.persistence_retry_base_ms),
            operation,
        )
        .await
    }

    fn prune_finished(&self) {
        self.handles.lock().unwrap().retain(|_, h| !h.is_finished());
    }

    /// 关停处理：默认中止在途任务并标记为失败，否则等待自然结束
    async fn shutdown(&self) {
        let drained: Vec<(i64, JoinHandle<()>)> = {
            let mut handles = self.handles.lock().unwrap();
            handles.drain().collect()
        };

        if drained.is_empty() {
            info!("调度器关停，无在途任务");
            return;
        }

        if self.config.abort_on_shutdown {
            info!("调度器关停，中止 {} 个在途任务", drained.len());
            for (task_id, handle) in drained {
                handle.abort();
                let _ = handle.await;
                // 任务可能恰好已落终态，状态守卫会拒绝这次写入
                match self
                    .repository
                    .set_failed(task_id, "调度器关停，任务被中止", None, Utc::now())
                    .await
                {
                    Ok(()) => {
                        self.notifier
                            .notify(&TaskEvent::failed(
                                task_id,
                                "调度器关停，任务被中止",
                                json!(null),
                            ))
                            .await;
                    }
                    Err(WebTaskError::InvalidStateTransition { .. }) => {}
                    Err(e) => warn!("任务 {} 关停标记失败: {}", task_id, e),
                }
            }
        } else {
            info!("调度器关停，等待 {} 个在途任务结束", drained.len());
            for (task_id, handle) in drained {
                if let Err(e) = handle.await {
                    warn!("等待任务 {} 结束失败: {}", task_id, e);
                }
            }
        }
    }
}
