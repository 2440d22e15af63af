use thiserror::Error;

#[cfg(test)]
mod tests;

#[derive(Debug, Error)]
pub enum WebTaskError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),
    #[error("数据库操作错误: {0}")]
    DatabaseOperation(String),
    #[error("任务未找到: {id}")]
    TaskNotFound { id: i64 },
    #[error("无效的任务状态转换: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },
    #[error("会话不可用: {0}")]
    SessionUnavailable(String),
    #[error("会话创建失败: {0}")]
    SessionCreation(String),
    #[error("任务执行超时")]
    ExecutionTimeout,
    #[error("任务执行错误: {0}")]
    TaskExecution(String),
    #[error("通知发送失败: {0}")]
    Notification(String),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("无效的任务参数: {0}")]
    InvalidTaskParams(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type WebTaskResult<T> = Result<T, WebTaskError>;

impl WebTaskError {
    pub fn database_error<S: Into<String>>(msg: S) -> Self {
        Self::DatabaseOperation(msg.into())
    }
    pub fn task_not_found(id: i64) -> Self {
        Self::TaskNotFound { id }
    }
    pub fn session_unavailable<S: Into<String>>(msg: S) -> Self {
        Self::SessionUnavailable(msg.into())
    }
    pub fn execution_error<S: Into<String>>(msg: S) -> Self {
        Self::TaskExecution(msg.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn invalid_params<S: Into<String>>(msg: S) -> Self {
        Self::InvalidTaskParams(msg.into())
    }

    /// 持久化类错误允许有限次重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WebTaskError::Database(_) | WebTaskError::DatabaseOperation(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, WebTaskError::ExecutionTimeout)
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WebTaskError::Internal(_) | WebTaskError::Configuration(_)
        )
    }

    /// 错误分类标签，写入任务终态时用于区分失败原因
    pub fn kind(&self) -> &'static str {
        match self {
            WebTaskError::Database(_) | WebTaskError::DatabaseOperation(_) => "persistence",
            WebTaskError::TaskNotFound { .. } => "not_found",
            WebTaskError::InvalidStateTransition { .. } => "state",
            WebTaskError::SessionUnavailable(_) | WebTaskError::SessionCreation(_) => {
                "resource_unavailable"
            }
            WebTaskError::ExecutionTimeout => "timeout",
            WebTaskError::TaskExecution(_) => "execution",
            WebTaskError::Notification(_) => "notification",
            WebTaskError::Serialization(_) => "serialization",
            WebTaskError::Configuration(_) => "configuration",
            WebTaskError::InvalidTaskParams(_) => "invalid_params",
            WebTaskError::Internal(_) => "internal",
        }
    }
}

impl From<serde_json::Error> for WebTaskError {
    fn from(err: serde_json::Error) -> Self {
        WebTaskError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for WebTaskError {
    fn from(err: anyhow::Error) -> Self {
        WebTaskError::Internal(err.to_string())
    }
}
