//! 核心接口的内存 mock 实现

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use webtask_domain::{
    AgentExecutor, AgentRunResult, BrowserHandle, ExecutionConfig, Notifier, SessionFactory,
    StatusCounts, Task, TaskEvent, TaskRepository, TaskStatus,
};
use webtask_errors::{WebTaskError, WebTaskResult};

/// 内存任务仓储
///
/// 与真实实现一样强制单向状态机：写入方法只作用于
/// 处在合法前置状态的任务。
pub struct MockTaskRepository {
    tasks: Mutex<HashMap<i64, Task>>,
    next_id: AtomicI64,
    fail_writes: AtomicBool,
}

impl MockTaskRepository {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// 让后续状态写入返回可重试的持久化错误
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn status_of(&self, id: i64) -> Option<TaskStatus> {
        self.tasks.lock().unwrap().get(&id).map(|t| t.status)
    }

    pub fn snapshot(&self, id: i64) -> Option<Task> {
        self.tasks.lock().unwrap().get(&id).cloned()
    }

    /// 同步版本的状态统计，便于在非 async 断言里使用
    pub fn counts(&self) -> StatusCounts {
        let tasks = self.tasks.lock().unwrap();
        let mut counts = StatusCounts::default();
        for task in tasks.values() {
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Running => counts.running += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    fn check_fail(&self) -> WebTaskResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(WebTaskError::database_error("写入失败（测试注入）"))
        } else {
            Ok(())
        }
    }
}

impl Default for MockTaskRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskRepository for MockTaskRepository {
    async fn create(&self, task: &Task) -> WebTaskResult<Task> {
        let mut stored = task.clone();
        stored.id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.tasks.lock().unwrap().insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get_by_id(&self, id: i64) -> WebTaskResult<Option<Task>> {
        Ok(self.tasks.lock().unwrap().get(&id).cloned())
    }

    async fn list_pending(&self, limit: u32) -> WebTaskResult<Vec<Task>> {
        let tasks = self.tasks.lock().unwrap();
        let mut pending: Vec<Task> = tasks.values().filter(|t| t.is_pending()).cloned().collect();
        pending.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        pending.truncate(limit as usize);
        Ok(pending)
    }

    async fn set_running(&self, id: i64, started_at: DateTime<Utc>) -> WebTaskResult<()> {
        self.check_fail()?;
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks
            .get_mut(&id)
            .ok_or(WebTaskError::TaskNotFound { id })?;
        task.check_transition(TaskStatus::Running)?;
        task.status = TaskStatus::Running;
        task.started_at = Some(started_at);
        Ok(())
    }

    async fn set_completed(
        &self,
        id: i64,
        result: Value,
        completed_at: DateTime<Utc>,
    ) -> WebTaskResult<()> {
        self.check_fail()?;
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks
            .get_mut(&id)
            .ok_or(WebTaskError::TaskNotFound { id })?;
        task.check_transition(TaskStatus::Completed)?;
        task.status = TaskStatus::Completed;
        task.result = Some(result);
        task.completed_at = Some(completed_at);
        Ok(())
    }

    async fn set_failed(
        &self,
        id: i64,
        error: &str,
        partial_result: Option<Value>,
        completed_at: DateTime<Utc>,
    ) -> WebTaskResult<()> {
        self.check_fail()?;
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks
            .get_mut(&id)
            .ok_or(WebTaskError::TaskNotFound { id })?;
        task.check_transition(TaskStatus::Failed)?;
        task.status = TaskStatus::Failed;
        task.error_message = Some(error.to_string());
        task.result = partial_result;
        task.completed_at = Some(completed_at);
        Ok(())
    }

    async fn delete(&self, id: i64) -> WebTaskResult<bool> {
        Ok(self.tasks.lock().unwrap().remove(&id).is_some())
    }

    async fn count_by_status(&self) -> WebTaskResult<StatusCounts> {
        Ok(self.counts())
    }
}

/// 记录所有收到事件的通知器
pub struct MockNotifier {
    events: Mutex<Vec<TaskEvent>>,
}

impl MockNotifier {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<TaskEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn event_count(&self) -> usize {
        self.events.lock().unwrap().len()
    }
}

impl Default for MockNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for MockNotifier {
    async fn notify(&self, event: &TaskEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// 记录关闭次数的浏览器句柄
pub struct MockBrowserHandle {
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl BrowserHandle for MockBrowserHandle {
    async fn close(&self) -> WebTaskResult<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// 可切换失败模式的会话工厂
pub struct MockSessionFactory {
    fail: AtomicBool,
    created: AtomicUsize,
    closed: Arc<AtomicUsize>,
}

impl MockSessionFactory {
    pub fn new() -> Self {
        Self {
            fail: AtomicBool::new(false),
            created: AtomicUsize::new(0),
            closed: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing() -> Self {
        let factory = Self::new();
        factory.fail.store(true, Ordering::SeqCst);
        factory
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn closed_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Default for MockSessionFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionFactory for MockSessionFactory {
    async fn create(&self) -> WebTaskResult<Box<dyn BrowserHandle>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(WebTaskError::SessionCreation("浏览器启动失败（测试注入）".into()));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockBrowserHandle {
            closed: Arc::clone(&self.closed),
        }))
    }
}

enum ExecutorMode {
    Succeed(String),
    Fail(String),
    Hang,
    /// 每个任务阻塞固定时长后成功
    Delay(std::time::Duration),
}

/// 可编排的浏览器代理
pub struct MockAgentExecutor {
    mode: Mutex<ExecutorMode>,
    success: AtomicBool,
    run_count: AtomicUsize,
    cancel_count: AtomicUsize,
    running_peak: AtomicUsize,
    running_now: AtomicUsize,
}

impl MockAgentExecutor {
    fn with_mode(mode: ExecutorMode) -> Self {
        Self {
            mode: Mutex::new(mode),
            success: AtomicBool::new(true),
            run_count: AtomicUsize::new(0),
            cancel_count: AtomicUsize::new(0),
            running_peak: AtomicUsize::new(0),
            running_now: AtomicUsize::new(0),
        }
    }

    pub fn succeeding<S: Into<String>>(result: S) -> Self {
        Self::with_mode(ExecutorMode::Succeed(result.into()))
    }

    pub fn failing<S: Into<String>>(message: S) -> Self {
        Self::with_mode(ExecutorMode::Fail(message.into()))
    }

    pub fn hanging() -> Self {
        Self::with_mode(ExecutorMode::Hang)
    }

    pub fn delayed(delay: std::time::Duration) -> Self {
        Self::with_mode(ExecutorMode::Delay(delay))
    }

    /// 控制成功返回值里的 success 标志
    pub fn set_success(&self, success: bool) {
        self.success.store(success, Ordering::SeqCst);
    }

    pub fn run_count(&self) -> usize {
        self.run_count.load(Ordering::SeqCst)
    }

    pub fn cancel_count(&self) -> usize {
        self.cancel_count.load(Ordering::SeqCst)
    }

    /// 观测到的最大并发运行数
    pub fn peak_concurrency(&self) -> usize {
        self.running_peak.load(Ordering::SeqCst)
    }

    fn enter(&self) {
        let now = self.running_now.fetch_add(1, Ordering::SeqCst) + 1;
        self.running_peak.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.running_now.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl AgentExecutor for MockAgentExecutor {
    async fn run(
        &self,
        _task_id: i64,
        _session: &dyn BrowserHandle,
        _instruction: &str,
        _config: &ExecutionConfig,
    ) -> WebTaskResult<AgentRunResult> {
        self.run_count.fetch_add(1, Ordering::SeqCst);
        self.enter();

        enum Plan {
            Succeed(String),
            Fail(String),
            Hang,
            Delay(std::time::Duration, String),
        }
        let plan = {
            let mode = self.mode.lock().unwrap();
            match &*mode {
                ExecutorMode::Succeed(s) => Plan::Succeed(s.clone()),
                ExecutorMode::Fail(m) => Plan::Fail(m.clone()),
                ExecutorMode::Hang => Plan::Hang,
                ExecutorMode::Delay(d) => Plan::Delay(*d, "done".to_string()),
            }
        };

        let outcome = match plan {
            Plan::Succeed(result) => Ok(AgentRunResult {
                success: self.success.load(Ordering::SeqCst),
                result,
                steps_executed: 3,
                videopath: None,
            }),
            Plan::Fail(message) => Err(WebTaskError::execution_error(message)),
            Plan::Hang => {
                std::future::pending::<()>().await;
                unreachable!()
            }
            Plan::Delay(delay, result) => {
                tokio::time::sleep(delay).await;
                Ok(AgentRunResult {
                    success: self.success.load(Ordering::SeqCst),
                    result,
                    steps_executed: 3,
                    videopath: None,
                })
            }
        };

        self.leave();
        outcome
    }

    async fn cancel(&self, _task_id: i64) -> WebTaskResult<()> {
        self.cancel_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
