use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crossbeam_queue::SegQueue;

/// Unbounded MPMC FIFO with an atomically maintained element count and
/// advisory enqueue/dequeue totals.
///
/// `enqueue` and `try_dequeue` are linearizable; the counters trail the queue
/// by design and are only read for telemetry and the queue-length gauge.
// TODO: surface enqueue/dequeue spin counts if we ever swap in a queue
// implementation that exposes them.
pub(crate) struct ItemQueue<T> {
    description: &'static str,
    items: SegQueue<T>,
    count: AtomicI64,
    enqueued: AtomicU64,
    dequeued: AtomicU64,
}

impl<T> ItemQueue<T> {
    pub(crate) fn new(description: &'static str) -> Self {
        Self {
            description,
            items: SegQueue::new(),
            count: AtomicI64::new(0),
            enqueued: AtomicU64::new(0),
            dequeued: AtomicU64::new(0),
        }
    }

    pub(crate) fn enqueue(&self, item: T) {
        self.items.push(item);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn try_dequeue(&self) -> Option<T> {
        let item = self.items.pop()?;
        self.count.fetch_sub(1, Ordering::Relaxed);
        self.dequeued.fetch_add(1, Ordering::Relaxed);
        Some(item)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(crate) fn count(&self) -> i64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Logged once per queue when the last worker winds down.
    pub(crate) fn log_statistics(&self) {
        log::debug!(
            "queue {}: enqueued {}, dequeued {}, residual {}",
            self.description,
            self.enqueued.load(Ordering::Relaxed),
            self.dequeued.load(Ordering::Relaxed),
            self.count(),
        );
    }
}
