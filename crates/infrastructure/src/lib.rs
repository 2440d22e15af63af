//! 基础设施实现：SQLite 任务存储与 webhook 通知

pub mod database;
pub mod webhook;

pub use database::SqliteTaskRepository;
pub use webhook::WebhookNotifier;
