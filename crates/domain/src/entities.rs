use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::execution::ExecutionOverrides;
use webtask_errors::{WebTaskError, WebTaskResult};

/// 自动化任务
///
/// 由接入层创建为 `Pending` 状态，之后只由调度器在派发和收尾时变更。
/// 状态转换单向：Pending -> Running -> {Completed, Failed}。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: i64,
    /// 自然语言任务指令，交给浏览器代理执行
    pub instruction: String,
    /// 任务级执行配置覆盖，与默认配置叠加后生效
    pub config: ExecutionOverrides,
    /// 数值越大越先被调度，相同优先级按创建时间先进先出
    pub priority: i32,
    pub status: TaskStatus,
    /// 仅在 Completed 后填充
    pub result: Option<serde_json::Value>,
    /// 仅在 Failed 后填充
    pub error_message: Option<String>,
    pub timeout_seconds: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(instruction: String, config: ExecutionOverrides, priority: i32) -> Self {
        Self {
            id: 0,
            instruction,
            config,
            priority,
            status: TaskStatus::Pending,
            result: None,
            error_message: None,
            timeout_seconds: 300,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_timeout(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    pub fn is_pending(&self) -> bool {
        self.status == TaskStatus::Pending
    }

    pub fn is_running(&self) -> bool {
        self.status == TaskStatus::Running
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// 校验状态转换是否合法，非法转换返回错误而不是静默覆盖
    pub fn check_transition(&self, to: TaskStatus) -> WebTaskResult<()> {
        if self.status.can_transition_to(to) {
            Ok(())
        } else {
            Err(WebTaskError::InvalidStateTransition {
                from: self.status.as_str().to_string(),
                to: to.as_str().to_string(),
            })
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// 单向状态机：终态之后不再接受任何转换
    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        matches!(
            (self, to),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> WebTaskResult<Self> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(WebTaskError::Internal(format!("未知任务状态: {other}"))),
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 浏览器代理一次运行的结构化结果
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentRunResult {
    pub success: bool,
    pub result: String,
    pub steps_executed: u32,
    pub videopath: Option<String>,
}

impl AgentRunResult {
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({
            "success": self.success,
            "result": self.result,
            "steps_executed": self.steps_executed,
            "videopath": self.videopath,
        })
    }
}

/// 按状态统计的任务数量，用于周期性指标上报
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
}

impl StatusCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.running + self.completed + self.failed
    }
}
