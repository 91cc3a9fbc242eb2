use std::collections::HashMap;
use std::sync::Arc;

use super::task::{Task, TaskState};

/// Exclusive owner of every live task, keyed by serial number.
///
/// All access goes through the scheduler's table mutex. The population cap
/// lives here because the desperation path mutates it under the same lock as
/// the admissions it gates.
pub(crate) struct TaskTable {
    tasks: HashMap<u64, Arc<Task>>,

    /// Soft cap on the task population; 0 means unbounded.
    max_task_count: usize,
}

impl TaskTable {
    pub(crate) fn new(max_task_count: usize) -> Self {
        Self {
            tasks: HashMap::new(),
            max_task_count,
        }
    }

    /// Returns false iff the serial is already present.
    pub(crate) fn insert(&mut self, task: Arc<Task>) -> bool {
        match self.tasks.entry(task.serial()) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(task);
                true
            }
        }
    }

    /// Erases a task, dropping the table's ownership of it. Only tasks that
    /// reached `Depleted` or `Terminated` are ever handed here.
    pub(crate) fn erase(&mut self, serial: u64) -> bool {
        self.tasks.remove(&serial).is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub(crate) fn max_task_count(&self) -> usize {
        self.max_task_count
    }

    pub(crate) fn grow_max_task_count(&mut self, by: usize) {
        self.max_task_count += by;
    }

    /// Debug dump of all suspended tasks, for diagnosing a stalled scheduler.
    /// Callers hold the table mutex.
    pub(crate) fn log_suspended_tasks(&self) {
        for (serial, task) in &self.tasks {
            if task.state() == TaskState::Suspended {
                log::error!(
                    "suspended task({serial}): {description}",
                    description = task.description()
                );
            }
        }
    }
}
