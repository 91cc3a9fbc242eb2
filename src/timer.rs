//! Deadline timer pool backing the scheduler's timed state transitions.
//!
//! One dedicated OS thread sleeps until the earliest armed deadline and fires
//! expired callbacks outside the lock. Callbacks must be fast; they typically
//! just flip a task to pending and wake a waiter.

use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

struct Timer {
    /// Absolute expiration time.
    deadline: Instant,

    /// Callback to run when the timer expires. Runs on the timer thread.
    callback: Box<dyn FnOnce() + Send>,
}

struct TimerState {
    timers: Vec<Timer>,
    running: bool,
}

struct TimerShared {
    state: Mutex<TimerState>,
    cond: Condvar,
}

/// Pool of deadline timers serviced by a single background thread.
pub(crate) struct TimerPool {
    shared: Arc<TimerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TimerPool {
    pub(crate) fn new() -> Self {
        Self {
            shared: Arc::new(TimerShared {
                state: Mutex::new(TimerState {
                    timers: Vec::new(),
                    running: false,
                }),
                cond: Condvar::new(),
            }),
            thread: Mutex::new(None),
        }
    }

    /// Starts the service thread. Idempotent; returns whether the pool is
    /// running afterwards.
    pub(crate) fn run(&self) -> bool {
        let mut thread = self.thread.lock();
        if self.shared.state.lock().running {
            return true;
        }
        // A previous non-blocking stop may have left a handle behind; that
        // thread observes `running == false` and exits, so join it before
        // flipping the flag back on.
        if let Some(old) = thread.take() {
            let _ = old.join();
        }
        self.shared.state.lock().running = true;
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("taskman-timer".to_owned())
            .spawn(move || service_loop(&shared));
        match handle {
            Ok(handle) => {
                *thread = Some(handle);
                true
            }
            Err(err) => {
                log::error!("timer pool: failed to spawn service thread: {err}");
                self.shared.state.lock().running = false;
                false
            }
        }
    }

    /// Stops the service thread, dropping any timers that have not fired.
    pub(crate) fn stop(&self, blocking: bool) {
        {
            let mut state = self.shared.state.lock();
            state.running = false;
            state.timers.clear();
        }
        self.shared.cond.notify_all();
        if blocking {
            let handle = self.thread.lock().take();
            if let Some(handle) = handle {
                let _ = handle.join();
            }
        }
    }

    /// Arms a timer firing at the given instant.
    pub(crate) fn add_timer<F>(&self, deadline: Instant, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        state.timers.push(Timer {
            deadline,
            callback: Box::new(callback),
        });
        // Wake the service thread so it re-computes its sleep target.
        self.shared.cond.notify_all();
    }

    /// Arms a timer firing after the given delay.
    pub(crate) fn add_relative_timer<F>(&self, timeout: Duration, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.add_timer(Instant::now() + timeout, callback);
    }
}

fn service_loop(shared: &TimerShared) {
    loop {
        let expired: Vec<Timer> = {
            let mut state = shared.state.lock();
            if !state.running {
                return;
            }

            let now = Instant::now();
            let mut expired = Vec::new();
            let mut i = 0;
            while i < state.timers.len() {
                if state.timers[i].deadline <= now {
                    expired.push(state.timers.swap_remove(i));
                } else {
                    i += 1;
                }
            }

            if expired.is_empty() {
                match state.timers.iter().map(|t| t.deadline).min() {
                    Some(next) => {
                        let _ = shared.cond.wait_until(&mut state, next);
                    }
                    None => shared.cond.wait(&mut state),
                }
                continue;
            }
            expired
        };

        for timer in expired {
            (timer.callback)();
        }
    }
}
