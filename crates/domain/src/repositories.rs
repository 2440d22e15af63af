//! 任务存储抽象
//!
//! 持久化存储是任务状态的唯一事实来源，调度器只通过这个窄接口读写，
//! 不在内存中保留第二份权威状态。

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::entities::{StatusCounts, Task};
use webtask_errors::WebTaskResult;

/// 任务仓储抽象
///
/// 实现必须支持多个派发单元并发调用；状态写入方法只在合法的
/// 单向转换上生效（如 `set_running` 只作用于 pending 任务）。
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn create(&self, task: &Task) -> WebTaskResult<Task>;

    async fn get_by_id(&self, id: i64) -> WebTaskResult<Option<Task>>;

    /// 按优先级降序、创建时间升序返回 pending 任务
    async fn list_pending(&self, limit: u32) -> WebTaskResult<Vec<Task>>;

    async fn set_running(&self, id: i64, started_at: DateTime<Utc>) -> WebTaskResult<()>;

    async fn set_completed(
        &self,
        id: i64,
        result: serde_json::Value,
        completed_at: DateTime<Utc>,
    ) -> WebTaskResult<()>;

    /// 失败可以携带部分结果（如超时前已执行的步骤）
    async fn set_failed(
        &self,
        id: i64,
        error: &str,
        partial_result: Option<serde_json::Value>,
        completed_at: DateTime<Utc>,
    ) -> WebTaskResult<()>;

    /// 管理操作，核心调度流程从不删除任务
    async fn delete(&self, id: i64) -> WebTaskResult<bool>;

    async fn count_by_status(&self) -> WebTaskResult<StatusCounts>;
}
