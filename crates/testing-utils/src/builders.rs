//! 测试数据构造器

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use webtask_domain::{ExecutionOverrides, Task, TaskStatus};

/// 任务构造器，省略的字段使用与入库默认值一致的取值
pub struct TaskBuilder {
    id: i64,
    instruction: String,
    config: ExecutionOverrides,
    priority: i32,
    status: TaskStatus,
    timeout_seconds: u64,
    created_at: DateTime<Utc>,
}

impl TaskBuilder {
    pub fn new() -> Self {
        Self {
            id: 0,
            instruction: "navigate:https://example.com".to_string(),
            config: ExecutionOverrides::default(),
            priority: 0,
            status: TaskStatus::Pending,
            timeout_seconds: 300,
            created_at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.id = id;
        self
    }

    pub fn with_instruction<S: Into<String>>(mut self, instruction: S) -> Self {
        self.instruction = instruction.into();
        self
    }

    pub fn with_config(mut self, config: ExecutionOverrides) -> Self {
        self.config = config;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_timeout(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    /// 将创建时间回拨指定秒数，用于构造先后顺序
    pub fn created_seconds_ago(mut self, seconds: i64) -> Self {
        self.created_at = Utc::now() - Duration::seconds(seconds);
        self
    }

    pub fn build(self) -> Task {
        let mut task = Task::new(self.instruction, self.config, self.priority)
            .with_timeout(self.timeout_seconds);
        task.id = self.id;
        task.status = self.status;
        task.created_at = self.created_at;
        task
    }
}

impl Default for TaskBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// 一条最小可用的回放历史
pub fn sample_history(steps: usize) -> Vec<Value> {
    (0..steps)
        .map(|i| serde_json::json!({"action": "click", "index": i}))
        .collect()
}
