//! End-to-end scheduler scenarios: real worker threads, real timers.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use taskman::counters::CounterRegistry;
use taskman::{Config, OnError, ResumeHint, TaskManager, TaskState, WorkerPanic};

const WAIT: Duration = Duration::from_secs(10);

/// Polls `predicate` until it holds or the deadline passes.
fn wait_for(predicate: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    predicate()
}

#[test]
fn single_pending_task_runs_once_and_is_erased() {
    let mgr = TaskManager::new(Config::default());
    assert!(mgr.run(1).unwrap());

    let runs = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel();
    let runs_in_task = Arc::clone(&runs);
    mgr.register_work(
        move |_resume| {
            runs_in_task.fetch_add(1, Ordering::SeqCst);
            tx.send(()).unwrap();
            TaskState::Terminated
        },
        "t",
        TaskState::Pending,
        true,
    )
    .unwrap();

    rx.recv_timeout(WAIT).unwrap();
    mgr.stop(true);

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(mgr.task_count(), 0);
}

#[test]
fn suspended_task_runs_after_wake() {
    let mgr = TaskManager::new(Config::default());
    assert!(mgr.run(2).unwrap());

    let (tx, rx) = mpsc::channel();
    let id = mgr
        .register_task(
            move |resume| {
                tx.send(resume).unwrap();
                TaskState::Terminated
            },
            "sleeper",
            TaskState::Suspended,
            false,
        )
        .unwrap();

    assert_eq!(mgr.get_state(&id), TaskState::Suspended);

    mgr.set_state(&id, TaskState::Pending, ResumeHint::WaitSignaled)
        .unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), ResumeHint::WaitSignaled);

    // The master erases the terminated task while the scheduler keeps running.
    assert!(wait_for(|| mgr.task_count() == 0));
    assert_eq!(mgr.get_state(&id), TaskState::Terminated);

    mgr.stop(true);
}

#[test]
fn set_state_on_active_task_is_applied_after_yield() {
    let mgr = TaskManager::new(Config::default());
    assert!(mgr.run(1).unwrap());

    let runs = Arc::new(AtomicUsize::new(0));
    let release = Arc::new(AtomicBool::new(false));
    let (entered_tx, entered_rx) = mpsc::channel();

    let runs_in_task = Arc::clone(&runs);
    let release_in_task = Arc::clone(&release);
    let id = mgr
        .register_task(
            move |_resume| {
                if runs_in_task.fetch_add(1, Ordering::SeqCst) == 0 {
                    entered_tx.send(()).unwrap();
                    while !release_in_task.load(Ordering::SeqCst) {
                        thread::yield_now();
                    }
                    TaskState::Suspended
                } else {
                    TaskState::Terminated
                }
            },
            "spinner",
            TaskState::Pending,
            true,
        )
        .unwrap();

    entered_rx.recv_timeout(WAIT).unwrap();
    assert_eq!(mgr.get_state(&id), TaskState::Active);

    // The transition cannot be applied while the task runs; it is deferred to
    // a replacement task and linearized after the yield.
    let previous = mgr
        .set_state(&id, TaskState::Pending, ResumeHint::WaitSignaled)
        .unwrap();
    assert_eq!(previous, TaskState::Active);
    release.store(true, Ordering::SeqCst);

    assert!(wait_for(|| runs.load(Ordering::SeqCst) == 2));
    assert!(wait_for(|| mgr.task_count() == 0));
    mgr.stop(true);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[test]
fn timed_transition_fires_no_earlier_than_deadline() {
    let mgr = TaskManager::new(Config::default());
    assert!(mgr.run(2).unwrap());

    let (tx, rx) = mpsc::channel();
    let id = mgr
        .register_task(
            move |resume| {
                tx.send((resume, Instant::now())).unwrap();
                TaskState::Terminated
            },
            "g",
            TaskState::Suspended,
            false,
        )
        .unwrap();

    let armed = Instant::now();
    mgr.set_state_after(
        Duration::from_millis(50),
        &id,
        TaskState::Pending,
        ResumeHint::WaitTimeout,
    )
    .unwrap();

    let (resume, fired) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(resume, ResumeHint::WaitTimeout);
    assert!(fired.duration_since(armed) >= Duration::from_millis(50));

    mgr.stop(true);
    assert_eq!(mgr.task_count(), 0);
}

#[test]
fn aborted_timed_transition_releases_target_with_wait_abort() {
    let mgr = TaskManager::new(Config::default());
    assert!(mgr.run(2).unwrap());

    let (tx, rx) = mpsc::channel();
    let id = mgr
        .register_task(
            move |resume| {
                tx.send(resume).unwrap();
                TaskState::Terminated
            },
            "waiter",
            TaskState::Suspended,
            false,
        )
        .unwrap();

    let wake = mgr
        .set_state_after(
            Duration::from_secs(30),
            &id,
            TaskState::Pending,
            ResumeHint::WaitTimeout,
        )
        .unwrap();

    // Waking the wake-timer task early aborts the wait: the target is
    // released with `WaitAbort` instead of the requested transition.
    mgr.set_state(&wake, TaskState::Pending, ResumeHint::WaitAbort)
        .unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), ResumeHint::WaitAbort);

    mgr.stop(true);
}

#[test]
fn cancelled_wake_timer_is_a_noop() {
    let mgr = TaskManager::new(Config::default());
    assert!(mgr.run(2).unwrap());

    let id = mgr
        .register_task(|_| TaskState::Terminated, "t", TaskState::Suspended, false)
        .unwrap();
    let wake = mgr
        .set_state_after(
            Duration::from_millis(200),
            &id,
            TaskState::Pending,
            ResumeHint::WaitTimeout,
        )
        .unwrap();

    mgr.set_state(&wake, TaskState::Terminated, ResumeHint::WaitAbort)
        .unwrap();

    // Give the timer ample time to fire into the terminated wake-timer task.
    thread::sleep(Duration::from_millis(500));
    assert_eq!(mgr.get_state(&id), TaskState::Suspended);

    // Release the target so shutdown can drain the table.
    mgr.set_state(&id, TaskState::Pending, ResumeHint::WaitSignaled)
        .unwrap();
    assert!(wait_for(|| mgr.task_count() == 0));
    mgr.stop(true);
}

#[test]
fn capped_admission_runs_all_submitted_work_exactly_once() {
    let config = Config {
        max_task_count: 4,
        min_add_count: 2,
        ..Config::default()
    };
    let mgr = TaskManager::new(config);

    let runs = Arc::new(AtomicUsize::new(0));
    for i in 0..10 {
        let runs = Arc::clone(&runs);
        mgr.register_work(
            move |_resume| {
                runs.fetch_add(1, Ordering::SeqCst);
                TaskState::Terminated
            },
            &format!("work-{i}"),
            TaskState::Pending,
            false,
        )
        .unwrap();
    }

    assert!(mgr.run(2).unwrap());
    assert!(wait_for(|| runs.load(Ordering::SeqCst) == 10));
    mgr.stop(true);

    assert_eq!(runs.load(Ordering::SeqCst), 10);
    assert_eq!(mgr.task_count(), 0);
    assert_eq!(mgr.get_queue_lengths(), 0);
}

#[test]
fn desperate_admission_breaks_the_suspended_table_deadlock() {
    let config = Config {
        max_task_count: 2,
        min_add_count: 2,
        ..Config::default()
    };
    let mgr = TaskManager::new(config);

    let woken = Arc::new(AtomicUsize::new(0));
    let mut residents = Vec::new();
    for i in 0..2 {
        let woken = Arc::clone(&woken);
        let id = mgr
            .register_task(
                move |_resume| {
                    woken.fetch_add(1, Ordering::SeqCst);
                    TaskState::Terminated
                },
                &format!("resident-{i}"),
                TaskState::Suspended,
                false,
            )
            .unwrap();
        residents.push(id);
    }

    // The table is full of suspended tasks and the ready queue is empty; only
    // the queued description below can produce the wake-ups they wait for.
    let mgr_in_task = Arc::clone(&mgr);
    let targets = residents.clone();
    mgr.register_work(
        move |_resume| {
            for id in &targets {
                mgr_in_task
                    .set_state(id, TaskState::Pending, ResumeHint::WaitSignaled)
                    .unwrap();
            }
            TaskState::Terminated
        },
        "releaser",
        TaskState::Pending,
        true,
    )
    .unwrap();

    assert!(mgr.run(2).unwrap());
    assert!(wait_for(|| woken.load(Ordering::SeqCst) == 2));
    assert!(wait_for(|| mgr.task_count() == 0));
    mgr.stop(true);
}

#[test]
fn a_task_never_runs_concurrently_with_itself() {
    let mgr = TaskManager::new(Config::default());
    assert!(mgr.run(4).unwrap());

    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));

    let in_flight_in_task = Arc::clone(&in_flight);
    let max_in_task = Arc::clone(&max_seen);
    let id = mgr
        .register_task(
            move |_resume| {
                let current = in_flight_in_task.fetch_add(1, Ordering::SeqCst) + 1;
                max_in_task.fetch_max(current, Ordering::SeqCst);
                thread::sleep(Duration::from_micros(200));
                in_flight_in_task.fetch_sub(1, Ordering::SeqCst);
                TaskState::Suspended
            },
            "flapper",
            TaskState::Suspended,
            false,
        )
        .unwrap();

    let wakers: Vec<_> = (0..3)
        .map(|_| {
            let mgr = Arc::clone(&mgr);
            let id = id.clone();
            thread::spawn(move || {
                for _ in 0..200 {
                    let _ = mgr.set_state(&id, TaskState::Pending, ResumeHint::WaitSignaled);
                    thread::yield_now();
                }
            })
        })
        .collect();
    for waker in wakers {
        waker.join().unwrap();
    }

    mgr.set_state(&id, TaskState::Terminated, ResumeHint::WaitAbort)
        .unwrap();
    assert!(wait_for(|| mgr.get_state(&id) == TaskState::Terminated));
    assert!(wait_for(|| mgr.task_count() == 0));
    mgr.stop(true);

    assert_eq!(max_seen.load(Ordering::SeqCst), 1);
}

#[test]
fn run_is_idempotent_and_restartable_after_stop() {
    let mgr = TaskManager::new(Config::default());
    assert!(mgr.run(2).unwrap());
    assert!(mgr.run(4).unwrap()); // already running: no-op

    mgr.stop(true);

    // A stopped scheduler can be started again and still runs work.
    assert!(mgr.run(1).unwrap());
    let (tx, rx) = mpsc::channel();
    mgr.register_work(
        move |_resume| {
            tx.send(()).unwrap();
            TaskState::Terminated
        },
        "after restart",
        TaskState::Pending,
        true,
    )
    .unwrap();
    rx.recv_timeout(WAIT).unwrap();
    mgr.stop(true);
}

#[test]
fn master_installs_and_uninstalls_queue_length_counters() {
    let registry = Arc::new(CounterRegistry::new());
    let mgr = TaskManager::with_collaborators(Config::default(), Arc::clone(&registry), None);

    assert!(mgr.run(1).unwrap());
    assert!(wait_for(|| registry.value("/queue/length").is_some()));
    assert!(registry
        .names()
        .contains(&"/queue(threadmanager)/length".to_owned()));
    assert_eq!(registry.value("/queue/length"), Some(0));

    mgr.stop(true);
    // The counters live only as long as the master worker.
    assert_eq!(registry.value("/queue/length"), None);
    assert_eq!(registry.value("/queue(threadmanager)/length"), None);
}

#[test]
fn worker_panic_is_reported_and_contained() {
    let reports: Arc<Mutex<Vec<(usize, String)>>> = Arc::new(Mutex::new(Vec::new()));
    let reports_in_callback = Arc::clone(&reports);
    let on_error: OnError = Box::new(move |panic: &WorkerPanic| {
        reports_in_callback
            .lock()
            .unwrap()
            .push((panic.worker_index, panic.message.clone()));
    });

    let mgr = TaskManager::with_collaborators(
        Config::default(),
        Arc::new(CounterRegistry::new()),
        Some(on_error),
    );
    assert!(mgr.run(2).unwrap());

    let bomb = mgr
        .register_task(
            |_resume| panic!("task exploded"),
            "bomb",
            TaskState::Pending,
            true,
        )
        .unwrap();

    assert!(wait_for(|| !reports.lock().unwrap().is_empty()));
    let (_, message) = reports.lock().unwrap()[0].clone();
    assert!(message.contains("task exploded"));

    // The failing task was abandoned in the state it last wrote; cancel it so
    // the table can drain.
    mgr.set_state(&bomb, TaskState::Terminated, ResumeHint::WaitAbort)
        .unwrap();

    // The surviving worker keeps executing work.
    let (tx, rx) = mpsc::channel();
    mgr.register_work(
        move |_resume| {
            tx.send(()).unwrap();
            TaskState::Terminated
        },
        "survivor",
        TaskState::Pending,
        true,
    )
    .unwrap();
    rx.recv_timeout(WAIT).unwrap();

    assert!(wait_for(|| mgr.task_count() == 0));
    mgr.stop(true);
}

#[test]
fn get_queue_lengths_tracks_both_queues() {
    let mgr = TaskManager::new(Config::default());

    // No workers yet: everything stays queued.
    mgr.register_task(|_| TaskState::Terminated, "ready", TaskState::Pending, false)
        .unwrap();
    mgr.register_work(|_| TaskState::Terminated, "submitted", TaskState::Pending, false)
        .unwrap();
    assert_eq!(mgr.get_queue_lengths(), 2);

    assert!(mgr.run(1).unwrap());
    assert!(wait_for(|| mgr.get_queue_lengths() == 0));
    mgr.stop(true);
}
