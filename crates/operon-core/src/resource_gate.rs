//! Resource Gate: admits an operation's [`ResourceLimits`] atomically
//! across all four dimensions, and releases them on completion.
//!
//! Memory, CPU, and duration budgets are tracked as simple counters under
//! a single mutex so a check-then-reserve across dimensions never races;
//! concurrency is additionally backed by a `tokio::sync::Semaphore` so a
//! waiter can be woken without polling. Waiters queue in strict priority
//! order (ties broken by arrival) -- see DESIGN.md for why priority alone,
//! rather than priority-aging, was chosen.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Mutex;

use dashmap::DashMap;
use operon_types::execution_context::{Priority, ResourceLimits};
use operon_types::ids::OperationId;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Semaphore};

use crate::error::ResourceGateError;

/// The pool's total budget across all four dimensions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GateCapacity {
    pub memory_mb: u64,
    pub cpu_millis: u64,
    pub duration_secs: u64,
    pub concurrency: u32,
}

#[derive(Debug, Default)]
struct Counters {
    memory_mb: u64,
    cpu_millis: u64,
    duration_secs: u64,
}

struct Waiter {
    priority: Priority,
    admission_order: u64,
    notify: oneshot::Sender<()>,
}

impl Waiter {
    /// Higher priority wins; among equal priorities, earlier arrival wins
    /// (lower `admission_order`). `BinaryHeap` is a max-heap, so we invert
    /// the tie-break comparison for arrival order.
    fn rank(&self) -> (Priority, std::cmp::Reverse<u64>) {
        (self.priority, std::cmp::Reverse(self.admission_order))
    }
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.rank() == other.rank()
    }
}
impl Eq for Waiter {}
impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Waiter {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

/// Tracks live per-operation allocations and the shared capacity pool.
pub struct ResourceGate {
    capacity: GateCapacity,
    used: Mutex<Counters>,
    concurrency: Semaphore,
    waiters: Mutex<BinaryHeap<Waiter>>,
    next_admission_order: std::sync::atomic::AtomicU64,
    allocations: DashMap<OperationId, ResourceLimits>,
}

impl ResourceGate {
    pub fn new(capacity: GateCapacity) -> Self {
        Self {
            capacity,
            used: Mutex::new(Counters::default()),
            concurrency: Semaphore::new(capacity.concurrency as usize),
            waiters: Mutex::new(BinaryHeap::new()),
            next_admission_order: std::sync::atomic::AtomicU64::new(0),
            allocations: DashMap::new(),
        }
    }

    /// Whether `limits` could be admitted right now, without reserving
    /// anything. Advisory only -- a caller must still call `allocate`.
    pub fn check_availability(&self, limits: &ResourceLimits) -> bool {
        let used = self.used.lock().expect("resource gate mutex poisoned");
        used.memory_mb + limits.max_memory_mb <= self.capacity.memory_mb
            && used.cpu_millis + limits.max_cpu_millis <= self.capacity.cpu_millis
            && used.duration_secs + limits.max_duration_secs <= self.capacity.duration_secs
            && self.concurrency.available_permits() > 0
    }

    /// Reserve `limits` for `operation_id`, waiting if necessary for the
    /// concurrency dimension. Memory/CPU/duration are checked atomically
    /// against the mutex-protected counters; if any is over budget this
    /// returns `Unavailable` immediately rather than queuing, since those
    /// dimensions have no natural release signal to wait on.
    pub async fn allocate(&self, operation_id: OperationId, limits: ResourceLimits, priority: Priority) -> Result<(), ResourceGateError> {
        {
            let mut used = self.used.lock().expect("resource gate mutex poisoned");
            if used.memory_mb + limits.max_memory_mb > self.capacity.memory_mb {
                return Err(ResourceGateError::Unavailable("memory".to_string()));
            }
            if used.cpu_millis + limits.max_cpu_millis > self.capacity.cpu_millis {
                return Err(ResourceGateError::Unavailable("cpu".to_string()));
            }
            if used.duration_secs + limits.max_duration_secs > self.capacity.duration_secs {
                return Err(ResourceGateError::Unavailable("duration".to_string()));
            }
            used.memory_mb += limits.max_memory_mb;
            used.cpu_millis += limits.max_cpu_millis;
            used.duration_secs += limits.max_duration_secs;
        }

        if let Err(e) = self.acquire_concurrency(priority).await {
            let mut used = self.used.lock().expect("resource gate mutex poisoned");
            used.memory_mb -= limits.max_memory_mb;
            used.cpu_millis -= limits.max_cpu_millis;
            used.duration_secs -= limits.max_duration_secs;
            return Err(e);
        }

        self.allocations.insert(operation_id, limits);
        Ok(())
    }

    async fn acquire_concurrency(&self, priority: Priority) -> Result<(), ResourceGateError> {
        if let Ok(permit) = self.concurrency.try_acquire() {
            permit.forget();
            return Ok(());
        }

        let (tx, rx) = oneshot::channel();
        let admission_order = self.next_admission_order.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        {
            let mut waiters = self.waiters.lock().expect("resource gate mutex poisoned");
            waiters.push(Waiter { priority, admission_order, notify: tx });
        }
        // A concurrent `release` may have already drained a permit to us
        // between the try_acquire above and pushing onto the queue; a
        // second attempt here closes that race.
        if let Ok(permit) = self.concurrency.try_acquire() {
            permit.forget();
            return Ok(());
        }
        rx.await.map_err(|_| ResourceGateError::Unavailable("concurrency waiter dropped".to_string()))
    }

    /// Release `operation_id`'s allocation. Idempotent: releasing an
    /// operation with no tracked allocation is a no-op, since the
    /// Orchestrator may call this during both normal completion and
    /// cancellation cleanup.
    pub fn release(&self, operation_id: OperationId) {
        let Some((_, limits)) = self.allocations.remove(&operation_id) else {
            return;
        };

        {
            let mut used = self.used.lock().expect("resource gate mutex poisoned");
            used.memory_mb = used.memory_mb.saturating_sub(limits.max_memory_mb);
            used.cpu_millis = used.cpu_millis.saturating_sub(limits.max_cpu_millis);
            used.duration_secs = used.duration_secs.saturating_sub(limits.max_duration_secs);
        }

        let mut waiters = self.waiters.lock().expect("resource gate mutex poisoned");
        match waiters.pop() {
            Some(waiter) => {
                // Hand the freed permit straight to the highest-priority
                // waiter rather than releasing it to the semaphore, so a
                // lower-priority `try_acquire` elsewhere cannot jump the queue.
                let _ = waiter.notify.send(());
            }
            None => self.concurrency.add_permits(1),
        }
    }

    pub fn has_allocation(&self, operation_id: OperationId) -> bool {
        self.allocations.contains_key(&operation_id)
    }
}
