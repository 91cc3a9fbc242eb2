//! Timed state transitions: change a task's state at a wall-clock deadline
//! or after a delay.
//!
//! Both operations register a short-lived *wake-timer task* in suspended
//! state and arm a deadline on the timer pool. The timer callback only flips
//! the wake-timer task to pending with hint `WaitTimeout`; the transition
//! itself runs on a worker, inside the wake-timer task, so it goes through
//! the same `set_state` path as every other state change (including the
//! active-target deferral).

use std::time::{Duration, Instant};

use crate::error::Error;

use super::schedcore::TaskManager;
use super::task::{ResumeHint, TaskId, TaskState};

impl TaskManager {
    /// Applies `set_state(id, new_state, hint)` once the given instant has
    /// passed. Returns the id of the wake-timer task.
    ///
    /// The wake-timer task discriminates on its own resume hint: resumed with
    /// `WaitTimeout` (the deadline fired) it applies the requested
    /// transition; resumed any other way — an early wake is an abort — it
    /// releases the target with `Pending` + `WaitAbort` instead. Setting the
    /// wake-timer task `Terminated` before it runs cancels silently: the
    /// late timer callback finds a terminated task and does nothing.
    pub fn set_state_at(
        &self,
        deadline: Instant,
        id: &TaskId,
        new_state: TaskState,
        hint: ResumeHint,
    ) -> Result<TaskId, Error> {
        if new_state == TaskState::Active {
            return Err(Error::bad_parameter(
                "set_state_at",
                format!("invalid new state: {new_state}"),
            ));
        }

        let manager = self.self_ref.clone();
        let target = id.clone();
        let wake_id = self.register_task(
            move |resume| {
                if let Some(manager) = manager.upgrade() {
                    if resume == ResumeHint::WaitTimeout {
                        let _ = manager.set_state(&target, new_state, hint);
                    } else {
                        let _ = manager.set_state(&target, TaskState::Pending, ResumeHint::WaitAbort);
                    }
                }
                TaskState::Terminated
            },
            "wake_timer",
            TaskState::Suspended,
            false,
        )?;

        let manager = self.self_ref.clone();
        let wake = wake_id.clone();
        self.timer_pool.add_timer(deadline, move || {
            if let Some(manager) = manager.upgrade() {
                let _ = manager.set_state(&wake, TaskState::Pending, ResumeHint::WaitTimeout);
            }
        });

        Ok(wake_id)
    }

    /// Applies `set_state(id, new_state, hint)` after the given delay.
    /// Returns the id of the wake-timer task.
    pub fn set_state_after(
        &self,
        delay: Duration,
        id: &TaskId,
        new_state: TaskState,
        hint: ResumeHint,
    ) -> Result<TaskId, Error> {
        self.set_state_at(Instant::now() + delay, id, new_state, hint)
    }
}
