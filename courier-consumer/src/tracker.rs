use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use courier_broker::DeliveryTag;
use parking_lot::Mutex;

#[derive(Default)]
struct TrackerState {
    outstanding: Mutex<Vec<DeliveryTag>>,
    count: AtomicUsize,
}

/// Delivery tags that were dispatched and have not reached a terminal outcome.
///
/// Cloning is cheap and every clone observes the same set, so one tracker can be
/// shared by the pipeline tasks and the drain loop of a single consumer.
#[derive(Clone, Default)]
pub struct DeliveryTracker {
    state: Arc<TrackerState>,
}

impl DeliveryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `tag`. Returns `false` if it was already outstanding.
    pub fn record(&self, tag: DeliveryTag) -> bool {
        let mut outstanding = self.state.outstanding.lock();
        if outstanding.contains(&tag) {
            return false;
        }
        outstanding.push(tag);
        self.state.count.store(outstanding.len(), Ordering::Release);
        true
    }

    /// Remove exactly the entry for `tag`, wherever it sits.
    ///
    /// Unknown or already cleared tags are ignored; returns whether anything was removed.
    pub fn clear(&self, tag: DeliveryTag) -> bool {
        let mut outstanding = self.state.outstanding.lock();
        let Some(index) = outstanding.iter().position(|candidate| *candidate == tag) else {
            return false;
        };
        outstanding.remove(index);
        self.state.count.store(outstanding.len(), Ordering::Release);
        true
    }

    /// Number of outstanding deliveries. Never waits on the lock.
    pub fn outstanding_count(&self) -> usize {
        self.state.count.load(Ordering::Acquire)
    }

    pub fn is_idle(&self) -> bool {
        self.outstanding_count() == 0
    }

    pub fn contains(&self, tag: DeliveryTag) -> bool {
        self.state.outstanding.lock().contains(&tag)
    }

    /// Outstanding tags in registration order.
    pub fn snapshot(&self) -> Vec<DeliveryTag> {
        self.state.outstanding.lock().clone()
    }
}
