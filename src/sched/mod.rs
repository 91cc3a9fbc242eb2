mod queue;
mod schedcore;
mod table;
mod task;
mod timed;

pub use schedcore::{Config, OnError, TaskManager, WorkerPanic};
pub use task::{ResumeHint, TaskFn, TaskId, TaskState};
