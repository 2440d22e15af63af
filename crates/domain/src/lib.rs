pub mod entities;
pub mod events;
pub mod execution;
pub mod ports;
pub mod repositories;

pub use entities::*;
pub use events::*;
pub use execution::*;
pub use ports::*;
pub use repositories::*;
pub use webtask_errors::{WebTaskError, WebTaskResult};
