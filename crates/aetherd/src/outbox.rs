//! Bounded per-subscription delivery queue
//!
//! The dispatcher never blocks on a slow subscriber: when the queue is
//! full the oldest pending event is dropped to make room. Drop-oldest
//! bounds latency for real-time signals; holding stale state in front
//! of newer state would invert the replaceable-kind semantics.

use aether_core::Event;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Clone, Copy, Debug, Default)]
pub struct OutboxStats {
    pub delivered: u64,
    pub dropped: u64,
    pub queue_high_water: u64,
    pub depth: usize,
}

pub struct Outbox {
    queue: Mutex<VecDeque<Arc<Event>>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
    delivered: AtomicU64,
    dropped: AtomicU64,
    high_water: AtomicU64,
}

impl Outbox {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            capacity: capacity.max(1),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            high_water: AtomicU64::new(0),
        })
    }

    /// Enqueue for delivery; never blocks the dispatcher. When full, the
    /// oldest pending event is dropped to make room.
    pub fn push(&self, event: Arc<Event>) {
        {
            let mut queue = self.queue.lock();
            if self.closed.load(Ordering::Acquire) {
                return;
            }
            if queue.len() == self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(event);
            self.high_water
                .fetch_max(queue.len() as u64, Ordering::Relaxed);
        }
        self.notify.notify_one();
    }

    /// Dequeue the next event in FIFO order. Returns `None` once the
    /// outbox is closed and drained.
    pub async fn pop(&self) -> Option<Arc<Event>> {
        loop {
            let notified = self.notify.notified();
            {
                let mut queue = self.queue.lock();
                if let Some(event) = queue.pop_front() {
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                    return Some(event);
                }
                if self.closed.load(Ordering::Acquire) {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Close the outbox; pending events remain poppable, then `pop`
    /// yields `None`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> OutboxStats {
        OutboxStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            queue_high_water: self.high_water.load(Ordering::Relaxed),
            depth: self.queue.lock().len(),
        }
    }
}
