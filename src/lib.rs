//! 浏览器自动化任务调度服务
//!
//! 二进制入口在 `main.rs`；这里导出组合根与关闭管理器，
//! 供集成测试和嵌入式使用。

pub mod app;
pub mod shutdown;

pub use app::Application;
pub use shutdown::ShutdownManager;
