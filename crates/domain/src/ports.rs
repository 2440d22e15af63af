//! 核心消费的外部协作者接口

use async_trait::async_trait;

use crate::entities::AgentRunResult;
use crate::events::TaskEvent;
use crate::execution::ExecutionConfig;
use webtask_errors::WebTaskResult;

/// 一个存活的浏览器实例，由会话池独占管理
#[async_trait]
pub trait BrowserHandle: Send + Sync {
    /// 会话的可连接地址（如 CDP endpoint），代理据此附着到浏览器
    fn endpoint(&self) -> Option<String> {
        None
    }

    async fn close(&self) -> WebTaskResult<()>;
}

impl std::fmt::Debug for dyn BrowserHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrowserHandle")
            .field("endpoint", &self.endpoint())
            .finish_non_exhaustive()
    }
}

/// 浏览器会话工厂
///
/// 启动失败以 `SessionCreation` 错误返回给 acquire 调用方，
/// 失败的尝试不计入池的占用。
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create(&self) -> WebTaskResult<Box<dyn BrowserHandle>>;
}

/// 浏览器驱动代理，黑盒消费
///
/// 运行时间无上界，截止时间由执行适配器在外层强制；
/// `cancel` 是尽力而为的，代理内部可能无法及时响应。
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn run(
        &self,
        task_id: i64,
        session: &dyn BrowserHandle,
        instruction: &str,
        config: &ExecutionConfig,
    ) -> WebTaskResult<AgentRunResult>;

    async fn cancel(&self, _task_id: i64) -> WebTaskResult<()> {
        Ok(())
    }
}

/// 生命周期事件通知，投递失败不向调用方传播
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &TaskEvent);
}
