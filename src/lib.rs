//! User-space cooperative task scheduler.
//!
//! A fixed pool of OS worker threads multiplexes a large population of
//! fine-grained tasks. Tasks are plain closures invoked with a resume hint
//! and returning the state they request next; they yield by returning.
//! Work is submitted either as an immediately-constructed task
//! ([`TaskManager::register_task`]) or as a description admitted later under
//! a population cap ([`TaskManager::register_work`]). State changes,
//! including deadline-driven ones, go through [`TaskManager::set_state`] and
//! friends.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::missing_const_for_fn,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::option_if_let_else,
    clippy::redundant_pub_crate,
    clippy::significant_drop_tightening
)]

pub mod counters;
mod error;
pub mod logging;
mod sched;
mod sync;
mod timer;

pub use error::Error;
pub use sched::{Config, OnError, ResumeHint, TaskFn, TaskId, TaskManager, TaskState, WorkerPanic};
