pub mod adapter;
pub mod cache;
pub mod pool;
pub mod process;
pub mod replay;

pub use adapter::TaskExecutorAdapter;
pub use cache::{fingerprint, ResultCache};
pub use pool::{PoolStats, SessionLease, SessionPool};
pub use process::{ProcessAgentExecutor, ProcessBrowserSession, ProcessSessionFactory};
pub use replay::{ReplayExecutor, ReplaySummary, StepRunner};
