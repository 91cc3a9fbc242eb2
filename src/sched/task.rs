use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::sync::AtomicEnum;

/// A task entrypoint. Invoked with the resume hint explaining why the task
/// was scheduled; returns the state the task requests for itself next.
pub type TaskFn = Box<dyn FnMut(ResumeHint) -> TaskState + Send + 'static>;

/// Lifecycle state of a task.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash)]
#[repr(u8)]
pub enum TaskState {
    /// Constructed but not yet handed to the scheduler.
    Init,

    /// Eligible to run; enqueued on the ready queue.
    Pending,

    /// Currently executing on some worker. Only the scheduler enters this
    /// state, and only one worker can observe a given task in it.
    Active,

    /// Retained in the table, not runnable until explicitly set pending.
    Suspended,

    /// The task has exhausted its work and requests no further scheduling.
    Depleted,

    /// Finished; pending removal from the table.
    Terminated,
}

impl TaskState {
    pub fn name(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Suspended => "suspended",
            Self::Depleted => "depleted",
            Self::Terminated => "terminated",
        }
    }

    /// Whether a direct transition from `self` to `new` is admissible.
    ///
    /// `Active` is entered only by a dispatching worker, `Terminated` is
    /// absorbing, and `Depleted` can only be torn down.
    pub fn can_transition_to(self, new: Self) -> bool {
        use TaskState::{Active, Depleted, Init, Pending, Suspended, Terminated};
        match self {
            Init => matches!(new, Pending | Active | Suspended),
            Pending => matches!(new, Active | Suspended | Terminated),
            Active => matches!(new, Pending | Suspended | Depleted | Terminated),
            Suspended => matches!(new, Pending | Terminated),
            Depleted => matches!(new, Terminated),
            Terminated => false,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<u8> for TaskState {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Init),
            1 => Ok(Self::Pending),
            2 => Ok(Self::Active),
            3 => Ok(Self::Suspended),
            4 => Ok(Self::Depleted),
            5 => Ok(Self::Terminated),
            _ => Err(()),
        }
    }
}

impl From<TaskState> for u8 {
    fn from(value: TaskState) -> Self {
        value as Self
    }
}

/// One-shot value telling a resumed task *why* it was woken. Consumed by the
/// worker right before the entrypoint runs and passed in as its argument.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
#[repr(u8)]
pub enum ResumeHint {
    /// Woken by an explicit state change (the default).
    WaitSignaled,

    /// Woken because a deadline fired.
    WaitTimeout,

    /// Woken early; the wait was abandoned.
    WaitAbort,
}

impl ResumeHint {
    pub fn name(self) -> &'static str {
        match self {
            Self::WaitSignaled => "wait_signaled",
            Self::WaitTimeout => "wait_timeout",
            Self::WaitAbort => "wait_abort",
        }
    }
}

impl fmt::Display for ResumeHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<u8> for ResumeHint {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::WaitSignaled),
            1 => Ok(Self::WaitTimeout),
            2 => Ok(Self::WaitAbort),
            _ => Err(()),
        }
    }
}

impl From<ResumeHint> for u8 {
    fn from(value: ResumeHint) -> Self {
        value as Self
    }
}

/// A submitted unit of work awaiting admission: the entrypoint, the state the
/// task starts in, and a human-readable description. Ownership moves from the
/// submitter through the new-tasks queue into the table.
pub(crate) struct TaskDescription {
    pub(crate) entry: TaskFn,
    pub(crate) initial_state: TaskState,
    pub(crate) description: String,
}

/// A schedulable unit of work. Owned by the task table; the ready queue holds
/// non-owning handles that are filtered out once stale.
pub(crate) struct Task {
    serial: u64,
    description: String,
    state: AtomicEnum<u8, TaskState>,
    resume_hint: AtomicEnum<u8, ResumeHint>,

    /// The entrypoint. `None` behaves as an immediately-terminated task.
    /// The mutex is uncontended in practice: `Active` guarantees a single
    /// running worker, and nothing else calls into the entry.
    entry: Mutex<Option<TaskFn>>,
}

impl Task {
    pub(crate) fn new(
        serial: u64,
        entry: Option<TaskFn>,
        initial_state: TaskState,
        description: String,
    ) -> Self {
        Self {
            serial,
            description,
            state: AtomicEnum::new(initial_state),
            resume_hint: AtomicEnum::new(ResumeHint::WaitSignaled),
            entry: Mutex::new(entry),
        }
    }

    pub(crate) fn serial(&self) -> u64 {
        self.serial
    }

    pub(crate) fn description(&self) -> &str {
        &self.description
    }

    pub(crate) fn state(&self) -> TaskState {
        self.state.load()
    }

    pub(crate) fn store_state(&self, new: TaskState) {
        self.state.store(new);
    }

    pub(crate) fn compare_exchange_state(
        &self,
        current: TaskState,
        new: TaskState,
    ) -> Result<TaskState, TaskState> {
        self.state.compare_exchange(current, new)
    }

    pub(crate) fn set_resume_hint(&self, hint: ResumeHint) {
        self.resume_hint.store(hint);
    }

    /// Consumes the resume hint, restoring the default.
    pub(crate) fn take_resume_hint(&self) -> ResumeHint {
        self.resume_hint.swap(ResumeHint::WaitSignaled)
    }

    /// Runs the entrypoint once and returns the task's requested next state.
    pub(crate) fn invoke(&self, hint: ResumeHint) -> TaskState {
        let mut entry = self.entry.lock();
        match entry.as_mut() {
            Some(entry) => entry(hint),
            None => TaskState::Terminated,
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("serial", &self.serial)
            .field("description", &self.description)
            .field("state", &self.state.load())
            .finish_non_exhaustive()
    }
}

/// Stable handle to a task. Cheap to clone; survives the task itself.
///
/// The embedded weak reference lets `get_state` and `get_description` answer
/// without touching the table mutex: once the table erases the task, the
/// handle stops upgrading and reads as `terminated` / unknown.
#[derive(Clone)]
pub struct TaskId {
    serial: u64,
    task: Weak<Task>,
}

impl TaskId {
    pub(crate) fn for_task(task: &Arc<Task>) -> Self {
        Self {
            serial: task.serial,
            task: Arc::downgrade(task),
        }
    }

    pub(crate) fn serial(&self) -> u64 {
        self.serial
    }

    pub(crate) fn upgrade(&self) -> Option<Arc<Task>> {
        self.task.upgrade()
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskId({})", self.serial)
    }
}

impl PartialEq for TaskId {
    fn eq(&self, other: &Self) -> bool {
        self.serial == other.serial
    }
}

impl Eq for TaskId {}

impl Hash for TaskId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.serial.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ALL_STATES: [TaskState; 6] = [
        TaskState::Init,
        TaskState::Pending,
        TaskState::Active,
        TaskState::Suspended,
        TaskState::Depleted,
        TaskState::Terminated,
    ];

    #[test]
    fn state_names_match_wire_names() {
        let names: Vec<_> = ALL_STATES.iter().map(|s| s.name()).collect();
        assert_eq!(
            names,
            ["init", "pending", "active", "suspended", "depleted", "terminated"]
        );
    }

    #[test]
    fn transition_matrix() {
        use TaskState::{Active, Depleted, Init, Pending, Suspended, Terminated};

        // rows = from, columns = to, in declaration order of ALL_STATES
        let expected = [
            (Init, [false, true, true, true, false, false]),
            (Pending, [false, false, true, true, false, true]),
            (Active, [false, true, false, true, true, true]),
            (Suspended, [false, true, false, false, false, true]),
            (Depleted, [false, false, false, false, false, true]),
            (Terminated, [false, false, false, false, false, false]),
        ];
        for (from, row) in expected {
            for (to, allowed) in ALL_STATES.iter().zip(row) {
                assert_eq!(
                    from.can_transition_to(*to),
                    allowed,
                    "transition {from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn resume_hint_is_consumed_on_take() {
        let task = Task::new(1, None, TaskState::Suspended, "hinted".to_owned());
        task.set_resume_hint(ResumeHint::WaitTimeout);
        assert_eq!(task.take_resume_hint(), ResumeHint::WaitTimeout);
        assert_eq!(task.take_resume_hint(), ResumeHint::WaitSignaled);
    }

    #[test]
    fn invoke_without_entry_terminates() {
        let task = Task::new(2, None, TaskState::Pending, "empty".to_owned());
        assert_eq!(task.invoke(ResumeHint::WaitSignaled), TaskState::Terminated);
    }

    #[test]
    fn id_stops_upgrading_after_drop() {
        let task = Arc::new(Task::new(3, None, TaskState::Pending, "gone".to_owned()));
        let id = TaskId::for_task(&task);
        assert!(id.upgrade().is_some());
        drop(task);
        assert!(id.upgrade().is_none());
    }

    proptest! {
        #[test]
        fn terminated_is_absorbing(to in 0u8..6) {
            let to = TaskState::try_from(to).unwrap();
            prop_assert!(!TaskState::Terminated.can_transition_to(to));
        }

        #[test]
        fn nothing_reenters_init(from in 0u8..6) {
            let from = TaskState::try_from(from).unwrap();
            prop_assert!(!from.can_transition_to(TaskState::Init));
        }

        #[test]
        fn state_u8_roundtrip(raw in 0u8..6) {
            let state = TaskState::try_from(raw).unwrap();
            prop_assert_eq!(u8::from(state), raw);
        }
    }
}
