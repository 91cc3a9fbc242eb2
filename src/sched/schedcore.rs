use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::counters::{CounterFn, CounterRegistry, ManagedCounter};
use crate::error::Error;
use crate::timer::TimerPool;

use super::queue::ItemQueue;
use super::table::TaskTable;
use super::task::{ResumeHint, Task, TaskDescription, TaskId, TaskState};

/// Scheduler tuning knobs. The defaults match a long-running service; tests
/// shrink them to exercise the admission paths.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Cap on the task-table population; 0 disables the cap. The desperation
    /// path may grow it at runtime.
    pub max_task_count: usize,

    /// Smallest batch of descriptions promoted per admission round.
    pub min_add_count: usize,

    /// Largest batch of descriptions promoted per admission round.
    pub max_add_count: usize,

    /// Most table entries erased per cleanup round.
    pub max_delete_count: usize,

    /// Upper bound on one idle wait. Keeps workers responsive to work that
    /// arrived without a wake-up.
    pub idle_wait: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_task_count: 0,
            min_add_count: 10,
            max_add_count: 100,
            max_delete_count: 100,
            idle_wait: Duration::from_millis(5),
        }
    }
}

/// Report handed to the error callback when a worker dies.
#[derive(Debug, Clone)]
pub struct WorkerPanic {
    pub worker_index: usize,
    pub message: String,
}

/// Callback invoked (from the dying worker's thread) when a worker aborts.
pub type OnError = Box<dyn Fn(&WorkerPanic) + Send + Sync>;

/// The task scheduler: multiplexes a population of cooperative tasks onto a
/// fixed pool of worker threads.
///
/// Workers pull from a shared ready queue; the task table owns every live
/// task and is the only mutex-guarded structure. Worker 0 (the master)
/// additionally admits submitted work under the population cap and erases
/// terminated tasks.
pub struct TaskManager {
    config: Config,

    /// Weak self-handle so internal closures (replacement tasks, timer and
    /// counter callbacks) never keep the scheduler alive on their own.
    pub(super) self_ref: Weak<TaskManager>,

    /// The task table; the single heavy lock of the scheduler.
    table: Mutex<TaskTable>,

    /// Idle workers wait here, bounded by `config.idle_wait`.
    cond: Condvar,

    /// Ready queue of runnable task handles. Entries can go stale when a
    /// task is set non-pending after enqueue; they are filtered at dequeue.
    work_items: ItemQueue<Arc<Task>>,

    /// Submitted descriptions awaiting admission.
    new_tasks: ItemQueue<TaskDescription>,

    /// Ids whose table entries await deletion by the master worker.
    terminated_items: ItemQueue<TaskId>,

    running: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
    next_serial: AtomicU64,

    pub(super) timer_pool: TimerPool,
    counters: Arc<CounterRegistry>,
    on_error: Option<OnError>,
}

impl TaskManager {
    pub fn new(config: Config) -> Arc<Self> {
        Self::with_collaborators(config, Arc::new(CounterRegistry::new()), None)
    }

    /// Builds a scheduler sharing an external counter registry and reporting
    /// worker deaths through `on_error`.
    pub fn with_collaborators(
        config: Config,
        counters: Arc<CounterRegistry>,
        on_error: Option<OnError>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            config,
            self_ref: self_ref.clone(),
            table: Mutex::new(TaskTable::new(config.max_task_count)),
            cond: Condvar::new(),
            work_items: ItemQueue::new("work_items"),
            new_tasks: ItemQueue::new("new_tasks"),
            terminated_items: ItemQueue::new("terminated_items"),
            running: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
            next_serial: AtomicU64::new(1),
            timer_pool: TimerPool::new(),
            counters,
            on_error,
        })
    }

    fn next_serial(&self) -> u64 {
        self.next_serial.fetch_add(1, Ordering::Relaxed)
    }

    /// Constructs a task immediately, inserts it into the table, and makes it
    /// runnable iff `initial_state` is pending. Wakes one waiter iff
    /// `run_now`.
    pub fn register_task(
        &self,
        entry: impl FnMut(ResumeHint) -> TaskState + Send + 'static,
        description: &str,
        initial_state: TaskState,
        run_now: bool,
    ) -> Result<TaskId, Error> {
        verify_registration("register_task", description, initial_state)?;
        log::info!(
            "register_task: initial_state({initial_state}), run_now({run_now}), \
             description({description})"
        );

        let task = Arc::new(Task::new(
            self.next_serial(),
            Some(Box::new(entry)),
            initial_state,
            description.to_owned(),
        ));
        let id = TaskId::for_task(&task);

        {
            let mut table = self.table.lock();
            if !table.insert(Arc::clone(&task)) {
                return Err(Error::no_success(
                    "register_task",
                    "could not add new task to the task table",
                ));
            }
        }

        // Only tasks starting out pending go onto the ready queue.
        if initial_state == TaskState::Pending {
            self.work_items.enqueue(task);
        }
        if run_now {
            self.cond.notify_one();
        }
        Ok(id)
    }

    /// Submits a task description; the task itself is realized later by the
    /// admission controller on the master worker.
    pub fn register_work(
        &self,
        entry: impl FnMut(ResumeHint) -> TaskState + Send + 'static,
        description: &str,
        initial_state: TaskState,
        run_now: bool,
    ) -> Result<(), Error> {
        verify_registration("register_work", description, initial_state)?;
        log::info!(
            "register_work: initial_state({initial_state}), run_now({run_now}), \
             description({description})"
        );

        self.new_tasks.enqueue(TaskDescription {
            entry: Box::new(entry),
            initial_state,
            description: description.to_owned(),
        });
        if run_now {
            self.cond.notify_one();
        }
        Ok(())
    }

    /// Changes a task's state, returning the previous state.
    ///
    /// `Active` cannot be forced from outside; only a dispatching worker
    /// enters it. A target that is currently active gets the change applied
    /// by a replacement task after it yields, so state is never stolen out
    /// from under an executing task. A target set pending is enqueued and
    /// one waiter is woken; stale ready-queue entries left behind by the
    /// transition are filtered at dequeue instead of being removed here.
    pub fn set_state(
        &self,
        id: &TaskId,
        new_state: TaskState,
        hint: ResumeHint,
    ) -> Result<TaskState, Error> {
        if new_state == TaskState::Active {
            return Err(Error::bad_parameter(
                "set_state",
                format!("invalid new state: {new_state}"),
            ));
        }

        let Some(task) = id.upgrade() else {
            // The task is gone from the table; it has already terminated.
            return Ok(TaskState::Terminated);
        };

        loop {
            let previous = task.state();

            // nothing to do here if the state doesn't change
            if new_state == previous {
                return Ok(new_state);
            }

            match previous {
                TaskState::Active => {
                    log::info!(
                        "set_state: task({id:?}) is currently active, \
                         scheduling replacement task"
                    );
                    let manager = self.self_ref.clone();
                    let target = id.clone();
                    self.register_work(
                        move |_resume| {
                            if let Some(manager) = manager.upgrade() {
                                let _ = manager.set_state(&target, new_state, hint);
                            }
                            TaskState::Terminated
                        },
                        "set state for active task",
                        TaskState::Pending,
                        true,
                    )?;
                    return Ok(TaskState::Active);
                }
                TaskState::Terminated => {
                    // Terminated while this set_state was pending; nothing
                    // left to do.
                    return Ok(TaskState::Terminated);
                }
                _ => {
                    // Publish the hint first: a worker that wins the dispatch
                    // race right after the exchange must observe it.
                    task.set_resume_hint(hint);
                    if task.compare_exchange_state(previous, new_state).is_ok() {
                        log::info!(
                            "set_state: task({id:?}), description({}), \
                             new state({new_state})",
                            task.description()
                        );
                        if new_state == TaskState::Pending {
                            self.work_items.enqueue(Arc::clone(&task));
                            self.cond.notify_one();
                        }
                        if matches!(new_state, TaskState::Depleted | TaskState::Terminated) {
                            // Cancelled without running again; hand the id to
                            // cleanup so the table can drain.
                            self.terminated_items.enqueue(TaskId::for_task(&task));
                        }
                        return Ok(previous);
                    }
                    // Lost the exchange against a worker or another caller;
                    // re-read and retry.
                }
            }
        }
    }

    /// Lock-free state query; a task no longer live reads as terminated.
    pub fn get_state(&self, id: &TaskId) -> TaskState {
        id.upgrade().map_or(TaskState::Terminated, |task| task.state())
    }

    /// Lock-free description query.
    pub fn get_description(&self, id: &TaskId) -> String {
        id.upgrade().map_or_else(
            || "<unknown>".to_owned(),
            |task| task.description().to_owned(),
        )
    }

    /// Sum of the ready-queue and new-tasks-queue lengths; exposed as the
    /// queue-length performance counter.
    pub fn get_queue_lengths(&self) -> i64 {
        self.work_items.count() + self.new_tasks.count()
    }

    /// Current task-table population. Takes the table mutex.
    pub fn task_count(&self) -> usize {
        self.table.lock().len()
    }

    /// Starts `num_workers` worker threads and the timer pool. Idempotent:
    /// returns `Ok(true)` if the scheduler is already running, `Ok(false)`
    /// if a worker failed to spawn (the scheduler is stopped again then).
    pub fn run(&self, num_workers: usize) -> Result<bool, Error> {
        log::info!("run: creating {num_workers} worker thread(s)");
        if num_workers == 0 {
            return Err(Error::bad_parameter("run", "number of workers is zero"));
        }

        let mut workers = self.workers.lock();
        if !workers.is_empty() || self.running.load(Ordering::Acquire) {
            return Ok(true);
        }

        if !self.timer_pool.run() {
            log::error!("run: failed to start the timer pool");
            return Ok(false);
        }
        self.running.store(true, Ordering::Release);

        for index in 0..num_workers {
            let manager = self.self_ref.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("taskman-worker-{index}"))
                .spawn(move || {
                    if let Some(manager) = manager.upgrade() {
                        manager.tfunc(index);
                    }
                });
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => {
                    log::error!("run: failed to spawn worker {index}: {err}");
                    drop(workers);
                    self.stop(true);
                    return Ok(false);
                }
            }
        }

        log::info!("run: running");
        Ok(true)
    }

    /// Clears the running flag and wakes every idle worker; when `blocking`,
    /// joins all workers and then the timer pool.
    ///
    /// Workers only exit once the task table has drained, so a blocking stop
    /// waits for resident tasks to finish. Tasks suspended forever are
    /// reported through the suspended-task dump at error level.
    pub fn stop(&self, blocking: bool) {
        log::info!("stop: blocking({blocking})");

        let mut workers = self.workers.lock();
        if workers.is_empty() {
            return;
        }

        if self.running.swap(false, Ordering::AcqRel) {
            self.cond.notify_all();
        }

        if blocking {
            for handle in workers.drain(..) {
                // make sure no worker is waiting on the condition
                self.cond.notify_all();
                let _ = handle.join();
            }
        }

        self.timer_pool.stop(blocking);
    }

    /// Worker entry: contains panics and reports them, then logs statistics
    /// from the master.
    fn tfunc(&self, num_thread: usize) {
        log::info!("tfunc({num_thread}): start");

        let result = panic::catch_unwind(AssertUnwindSafe(|| self.tfunc_impl(num_thread)));
        match result {
            Ok(Ok(count)) => {
                log::info!("tfunc({num_thread}): end, executed {count} tasks");
            }
            Ok(Err(error)) => {
                log::error!("tfunc({num_thread}): caught error: {error}, aborted task execution");
                self.report_error(num_thread, error.to_string());
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                log::error!("tfunc({num_thread}): caught panic: {message}, aborted task execution");
                self.report_error(num_thread, message);
            }
        }

        if num_thread == 0 {
            self.work_items.log_statistics();
            self.terminated_items.log_statistics();
            self.new_tasks.log_statistics();
        }
    }

    /// One worker's scheduling loop; returns the number of tasks it ran.
    fn tfunc_impl(&self, num_thread: usize) -> Result<usize, Error> {
        // the worker with index zero is the master
        let is_master = num_thread == 0;
        let mut tasks_run = 0usize;

        let _queue_counters = if is_master {
            self.install_queue_counters(num_thread)
        } else {
            Vec::new()
        };

        loop {
            // Run phase: take the next ready task. Entries whose task is no
            // longer pending are leftovers from a state change and are
            // dropped here.
            if let Some(task) = self.work_items.try_dequeue() {
                let state = task.state();
                log::debug!(
                    "tfunc({num_thread}): task({serial}), description({description}), \
                     old state({state})",
                    serial = task.serial(),
                    description = task.description(),
                );

                if state == TaskState::Pending {
                    // Switch the state to active and back to whatever the
                    // task reports as its next state. The acquisition can
                    // still fail if a state change won the race since the
                    // check above; the entry is stale then.
                    if let Some(mut switch) = SwitchStatus::try_acquire(&task) {
                        let hint = task.take_resume_hint();
                        let next = task.invoke(hint);
                        switch.set_next(next);
                        drop(switch);
                        tasks_run += 1;

                        log::debug!(
                            "tfunc({num_thread}): task({serial}), new state({next})",
                            serial = task.serial(),
                        );

                        if next == TaskState::Pending {
                            self.work_items.enqueue(Arc::clone(&task));
                            self.cond.notify_one();
                        }
                        if matches!(next, TaskState::Depleted | TaskState::Terminated) {
                            // Depleted tasks are torn down like terminated
                            // ones; nothing retains them for inspection.
                            self.terminated_items.enqueue(TaskId::for_task(&task));
                        }
                    }
                }
            }

            // Master maintenance: only the master touches the table here, and
            // only without blocking, so a contended lock never stalls the run
            // phase.
            if is_master {
                if let Some(mut table) = self.table.try_lock() {
                    self.cleanup_terminated(&mut table);
                    self.add_new_if_possible(&mut table)?;
                }
            }

            // Idle phase: either wait (bounded) for work or wind down once
            // the scheduler is stopping and the table has drained.
            let mut terminate = false;
            while self.work_items.is_empty() {
                let Some(mut table) = self.table.try_lock() else {
                    // Another worker holds the lock and is doing maintenance,
                    // which may produce work; go back to the run phase.
                    break;
                };

                log::debug!(
                    "tfunc({num_thread}): queues empty, tasks left: {}",
                    table.len()
                );

                if !self.add_new_always(&mut table)? && !self.running.load(Ordering::Acquire) {
                    // Stopping: each worker drains the terminated queue; the
                    // worker that observes the table empty broadcasts so the
                    // shutdown is never lost.
                    if self.cleanup_terminated(&mut table) {
                        self.cond.notify_all();
                        terminate = true;
                        break;
                    }
                    log::debug!("tfunc({num_thread}): task table not empty");
                } else {
                    self.cleanup_terminated(&mut table);
                }

                // Re-check emptiness under the lock so no wake-up is lost
                // between the check and the wait.
                if self.work_items.is_empty() {
                    if log::log_enabled!(log::Level::Error) && self.new_tasks.is_empty() {
                        table.log_suspended_tasks();
                    }

                    let timed_out = self
                        .cond
                        .wait_for(&mut table, self.config.idle_wait)
                        .timed_out();

                    if self.add_new_always(&mut table)? || timed_out {
                        break;
                    }
                }
            }
            if terminate {
                break;
            }
        }

        Ok(tasks_run)
    }

    /// Registers the queue-length counters from the master worker. Failures
    /// are logged and ignored; the scheduler runs fine without telemetry.
    fn install_queue_counters(&self, num_thread: usize) -> Vec<ManagedCounter> {
        let mut installed = Vec::new();
        for name in ["/queue(threadmanager)/length", "/queue/length"] {
            let manager = self.self_ref.clone();
            let gauge: CounterFn =
                Box::new(move || manager.upgrade().map_or(0, |m| m.get_queue_lengths()));
            match ManagedCounter::install(&self.counters, name, gauge) {
                Ok(counter) => installed.push(counter),
                Err(err) => {
                    log::info!("tfunc({num_thread}): failed to install counter '{name}': {err}");
                }
            }
        }
        installed
    }

    /// Promotes up to `add_count` descriptions (negative means unbounded)
    /// into live tasks. Returns whether any ready work was produced.
    fn add_new(&self, table: &mut TaskTable, add_count: i64) -> Result<bool, Error> {
        if add_count == 0 {
            return Ok(false);
        }

        let mut budget = add_count;
        let mut added = 0u64;
        while budget != 0 {
            let Some(description) = self.new_tasks.try_dequeue() else {
                break;
            };
            budget -= 1;

            let TaskDescription {
                entry,
                initial_state,
                description,
            } = description;
            let task = Arc::new(Task::new(
                self.next_serial(),
                Some(entry),
                initial_state,
                description,
            ));
            if !table.insert(Arc::clone(&task)) {
                return Err(Error::no_success(
                    "add_new",
                    "could not add new task to the task table",
                ));
            }

            if initial_state == TaskState::Pending {
                added += 1;
                self.work_items.enqueue(task);
                self.cond.notify_one();
            }
        }

        if added > 0 {
            log::info!("add_new: added {added} tasks to run queue");
        }
        Ok(added != 0)
    }

    /// Admission under the population cap: promote only while the table has
    /// room for at least `min_add_count` more tasks.
    fn add_new_if_possible(&self, table: &mut TaskTable) -> Result<bool, Error> {
        if self.new_tasks.is_empty() {
            return Ok(false);
        }

        let mut add_count = -1i64; // default is no constraint
        let max_count = table.max_task_count();
        if max_count != 0 {
            let count = table.len();
            if max_count >= count + self.config.min_add_count {
                add_count = (max_count - count) as i64;
                add_count = add_count.max(self.config.min_add_count as i64);
            } else {
                return Ok(false);
            }
        }
        self.add_new(table, add_count)
    }

    /// Admission with the desperation escape hatch: when the ready queue is
    /// empty and the table is full, every resident task is waiting on work
    /// that only new admissions can produce, so the cap is grown rather than
    /// deadlocking.
    fn add_new_always(&self, table: &mut TaskTable) -> Result<bool, Error> {
        if self.new_tasks.is_empty() {
            return Ok(false);
        }

        let mut add_count = -1i64;
        let max_count = table.max_task_count();
        if max_count != 0 {
            let count = table.len();
            if max_count >= count + self.config.min_add_count {
                add_count = (max_count - count) as i64;
                add_count = add_count.max(self.config.min_add_count as i64);
                add_count = add_count.min(self.config.max_add_count as i64);
            } else if self.work_items.is_empty() {
                add_count = self.config.min_add_count as i64;
                table.grow_max_task_count(self.config.min_add_count);
            } else {
                return Ok(false);
            }
        }
        self.add_new(table, add_count)
    }

    /// Erases up to `max_delete_count` tasks whose ids sit in the terminated
    /// queue. Returns whether the table is empty afterwards.
    fn cleanup_terminated(&self, table: &mut TaskTable) -> bool {
        if !self.terminated_items.is_empty() {
            let mut delete_count = self.config.max_delete_count;
            while delete_count > 0 {
                let Some(id) = self.terminated_items.try_dequeue() else {
                    break;
                };
                table.erase(id.serial());
                delete_count -= 1;
            }
        }
        table.is_empty()
    }

    fn report_error(&self, worker_index: usize, message: String) {
        if let Some(on_error) = &self.on_error {
            on_error(&WorkerPanic {
                worker_index,
                message,
            });
        }
    }
}

fn verify_registration(
    function: &'static str,
    description: &str,
    initial_state: TaskState,
) -> Result<(), Error> {
    if !matches!(initial_state, TaskState::Pending | TaskState::Suspended) {
        return Err(Error::bad_parameter(
            function,
            format!("invalid initial state: {initial_state}"),
        ));
    }
    if description.is_empty() {
        return Err(Error::bad_parameter(function, "description is empty"));
    }
    Ok(())
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload.downcast_ref::<&str>().map_or_else(
        || {
            payload
                .downcast_ref::<String>()
                .cloned()
                .unwrap_or_else(|| "unknown panic payload".to_owned())
        },
        |message| (*message).to_owned(),
    )
}

/// Scoped state switch for one run of a task: acquires the task by flipping
/// pending to active, and writes the task's requested next state back on
/// scope exit, including unwinds.
struct SwitchStatus<'a> {
    task: &'a Task,
    next: TaskState,
}

impl<'a> SwitchStatus<'a> {
    /// Fails when a state change won the race since the dequeue check; the
    /// queue entry was stale then.
    fn try_acquire(task: &'a Task) -> Option<Self> {
        task.compare_exchange_state(TaskState::Pending, TaskState::Active)
            .ok()?;
        Some(Self {
            task,
            next: TaskState::Pending,
        })
    }

    fn set_next(&mut self, next: TaskState) {
        self.next = next;
    }
}

impl Drop for SwitchStatus<'_> {
    fn drop(&mut self) {
        self.task.store_state(self.next);
    }
}
