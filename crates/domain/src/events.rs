use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 任务生命周期事件类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Queued,
    Started,
    Completed,
    Failed,
    Metrics,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Queued => "queued",
            EventKind::Started => "started",
            EventKind::Completed => "completed",
            EventKind::Failed => "failed",
            EventKind::Metrics => "metrics",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 通过 webhook 投递的生命周期事件
///
/// 投递是尽力而为的：失败只记录日志，不影响任务结果。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskEvent {
    pub kind: EventKind,
    /// 指标事件没有对应的任务
    pub task_id: Option<i64>,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl TaskEvent {
    pub fn new(kind: EventKind, task_id: Option<i64>, payload: serde_json::Value) -> Self {
        Self {
            kind,
            task_id,
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn queued(task_id: i64, payload: serde_json::Value) -> Self {
        Self::new(EventKind::Queued, Some(task_id), payload)
    }

    pub fn started(task_id: i64, payload: serde_json::Value) -> Self {
        Self::new(EventKind::Started, Some(task_id), payload)
    }

    pub fn completed(task_id: i64, payload: serde_json::Value) -> Self {
        Self::new(EventKind::Completed, Some(task_id), payload)
    }

    pub fn failed(task_id: i64, error: &str, payload: serde_json::Value) -> Self {
        Self::new(
            EventKind::Failed,
            Some(task_id),
            serde_json::json!({ "error": error, "task_data": payload }),
        )
    }

    pub fn metrics(payload: serde_json::Value) -> Self {
        Self::new(EventKind::Metrics, None, payload)
    }
}
