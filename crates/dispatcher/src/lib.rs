//! 任务调度
//!
//! 从任务存储拉取待执行任务，在容量上限内并发派发，
//! 并把生命周期事件推给通知侧。

pub mod capacity;
pub mod metrics_reporter;
pub mod retry;
pub mod scheduler;

pub use capacity::{CapacityEstimator, ResourceProbe, StaticResourceProbe, SystemResourceProbe};
pub use metrics_reporter::MetricsReporter;
pub use retry::retry_with_backoff;
pub use scheduler::TaskDispatcher;
