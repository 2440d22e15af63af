//! 测试工具集
//!
//! 提供核心接口的内存 mock 实现和测试数据构造器，
//! 供各 crate 的单元测试与集成测试复用。

pub mod builders;
pub mod mocks;

pub use builders::{sample_history, TaskBuilder};
pub use mocks::{
    MockAgentExecutor, MockBrowserHandle, MockNotifier, MockSessionFactory, MockTaskRepository,
};
