pub mod coprocess;
pub mod log;
pub mod queue;
pub mod spawn;
pub mod task;

pub use coprocess::{subscribe_coprocess_changes, Coprocess, CoprocessChanged};
pub use queue::WRITE_QUEUE_SOFT_LIMIT;
pub use spawn::LaunchSpec;
pub use task::{PtyTask, TaskDelegate, TaskId};
