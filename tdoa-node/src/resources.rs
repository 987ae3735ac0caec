//! resources.rs — resource accounting for the processing fabric
//!
//! Tracks per-kind totals, availability, reservations and peaks. Allocation is
//! all-or-nothing across the requested kinds; requests that do not fit are
//! queued by priority, or satisfied by preempting lower-priority allocations
//! when preemption is enabled (lowest priority first, then oldest).

use std::collections::HashMap;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};
use uuid::Uuid;

use tdoa_types::{ResourceKind, TaskPriority};

use crate::error::{PipelineError, Result};

// ── Records ───────────────────────────────────────────────────────────────────

/// Accounting state of one resource kind.
#[derive(Debug, Clone)]
pub struct ResourceUsage {
    pub total: f64,
    pub available: f64,
    pub reserved: f64,
    pub peak: f64,
    pub unit: String,
}

impl ResourceUsage {
    pub fn usage_percent(&self) -> f64 {
        if self.total > 0.0 {
            (self.total - self.available) / self.total * 100.0
        } else {
            0.0
        }
    }
}

/// An allocation request: all listed kinds must fit simultaneously.
#[derive(Debug, Clone)]
pub struct ResourceRequest {
    pub request_id: String,
    pub requirements: HashMap<ResourceKind, f64>,
    pub priority: TaskPriority,
    pub client_id: String,
    pub timestamp_ns: u64,
}

impl ResourceRequest {
    pub fn new(
        requirements: HashMap<ResourceKind, f64>,
        priority: TaskPriority,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            request_id: format!("req-{}", Uuid::new_v4().simple()),
            requirements,
            priority,
            client_id: client_id.into(),
            timestamp_ns: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos() as u64,
        }
    }
}

/// Result of an allocation attempt.
#[derive(Debug, Clone)]
pub struct ResourceAllocation {
    pub request_id: String,
    pub allocated: HashMap<ResourceKind, f64>,
    pub success: bool,
    pub client_id: String,
    pub timestamp_ns: u64,
    priority: TaskPriority,
}

// ── Pool ──────────────────────────────────────────────────────────────────────

struct PoolInner {
    usage: HashMap<ResourceKind, ResourceUsage>,
    active: Vec<ResourceAllocation>,
    pending: Vec<ResourceRequest>,
}

/// Shared resource pool. Constructed once per pipeline context and threaded
/// into the components that need accounting; `ResourcePool::process_default`
/// exists for applications that genuinely want one per process.
pub struct ResourcePool {
    inner: Mutex<PoolInner>,
    released: Condvar,
    preemption_enabled: Mutex<bool>,
}

impl ResourcePool {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                usage: HashMap::new(),
                active: Vec::new(),
                pending: Vec::new(),
            }),
            released: Condvar::new(),
            preemption_enabled: Mutex::new(false),
        }
    }

    /// A process-wide pool for applications that want singleton behavior.
    pub fn process_default() -> &'static ResourcePool {
        use std::sync::OnceLock;
        static POOL: OnceLock<ResourcePool> = OnceLock::new();
        POOL.get_or_init(ResourcePool::new)
    }

    /// Register (or resize) a resource kind. Availability scales with the new
    /// total, keeping existing reservations.
    pub fn register(&self, kind: ResourceKind, total: f64) -> Result<()> {
        if total < 0.0 {
            return Err(PipelineError::Configuration(format!(
                "total for {kind:?} must be non-negative, got {total}"
            )));
        }
        let unit = kind.unit().to_string();
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.usage.entry(kind).or_insert(ResourceUsage {
            total: 0.0,
            available: 0.0,
            reserved: 0.0,
            peak: 0.0,
            unit,
        });
        let delta = total - entry.total;
        entry.total = total;
        entry.available += delta;
        Ok(())
    }

    pub fn set_preemption(&self, enabled: bool) {
        *self.preemption_enabled.lock().unwrap() = enabled;
    }

    pub fn usage(&self, kind: &ResourceKind) -> Option<ResourceUsage> {
        self.inner.lock().unwrap().usage.get(kind).cloned()
    }

    pub fn usage_snapshot(&self) -> HashMap<ResourceKind, ResourceUsage> {
        self.inner.lock().unwrap().usage.clone()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }

    /// Try to allocate. On failure the request is queued (priority order) and
    /// `None` is returned; with preemption enabled, lower-priority active
    /// allocations are released first to make room.
    pub fn allocate(&self, request: &ResourceRequest) -> Option<ResourceAllocation> {
        let mut inner = self.inner.lock().unwrap();

        if Self::fits(&inner, &request.requirements) {
            let allocation = Self::take(&mut inner, request);
            return Some(allocation);
        }

        if *self.preemption_enabled.lock().unwrap()
            && self.preempt_for(&mut inner, request)
            && Self::fits(&inner, &request.requirements)
        {
            let allocation = Self::take(&mut inner, request);
            return Some(allocation);
        }

        debug!(
            "resource request {} from '{}' queued ({} pending)",
            request.request_id,
            request.client_id,
            inner.pending.len() + 1
        );
        inner.pending.push(request.clone());
        // Highest priority first; FIFO within a priority level.
        inner.pending.sort_by(|a, b| {
            b.priority.cmp(&a.priority).then(a.timestamp_ns.cmp(&b.timestamp_ns))
        });
        None
    }

    /// Release an allocation, restoring availability, then retry pending
    /// requests in queue order.
    pub fn release(&self, allocation: &ResourceAllocation) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let pos = inner
            .active
            .iter()
            .position(|a| a.request_id == allocation.request_id)
            .ok_or_else(|| {
                PipelineError::Precondition(format!(
                    "allocation {} is not active",
                    allocation.request_id
                ))
            })?;
        let active = inner.active.remove(pos);
        for (kind, amount) in &active.allocated {
            if let Some(usage) = inner.usage.get_mut(kind) {
                usage.available += amount;
                usage.reserved -= amount;
            }
        }
        Self::drain_pending(&mut inner);
        drop(inner);
        self.released.notify_all();
        Ok(())
    }

    /// Block until the requested amounts are available or `timeout` elapses.
    /// The request is not allocated, only awaited.
    pub fn wait_for_resources(&self, request: &ResourceRequest, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        loop {
            if Self::fits(&inner, &request.requirements) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, wait) =
                self.released.wait_timeout(inner, deadline - now).unwrap();
            inner = guard;
            if wait.timed_out() && !Self::fits(&inner, &request.requirements) {
                return false;
            }
        }
    }

    pub fn active_allocations(&self) -> Vec<ResourceAllocation> {
        self.inner.lock().unwrap().active.clone()
    }

    // ── Internals (callers hold the lock) ─────────────────────────────────────

    fn fits(inner: &PoolInner, requirements: &HashMap<ResourceKind, f64>) -> bool {
        requirements.iter().all(|(kind, amount)| {
            inner.usage.get(kind).map(|u| u.available >= *amount).unwrap_or(false)
        })
    }

    fn take(inner: &mut PoolInner, request: &ResourceRequest) -> ResourceAllocation {
        for (kind, amount) in &request.requirements {
            let usage = inner.usage.get_mut(kind).expect("fits() checked presence");
            usage.available -= amount;
            usage.reserved += amount;
            let in_use = usage.total - usage.available;
            if in_use > usage.peak {
                usage.peak = in_use;
            }
        }
        let allocation = ResourceAllocation {
            request_id: request.request_id.clone(),
            allocated: request.requirements.clone(),
            success: true,
            client_id: request.client_id.clone(),
            timestamp_ns: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos() as u64,
            priority: request.priority,
        };
        inner.active.push(allocation.clone());
        allocation
    }

    /// Release lower-priority allocations (lowest priority first, then oldest)
    /// until the request would fit. Returns true when anything was preempted.
    fn preempt_for(&self, inner: &mut PoolInner, request: &ResourceRequest) -> bool {
        let mut victims: Vec<(TaskPriority, u64, String)> = inner
            .active
            .iter()
            .filter(|a| a.priority < request.priority)
            .map(|a| (a.priority, a.timestamp_ns, a.request_id.clone()))
            .collect();
        victims.sort();

        let mut preempted_any = false;
        for (_, _, victim_id) in victims {
            if Self::fits(inner, &request.requirements) {
                break;
            }
            let pos = inner.active.iter().position(|a| a.request_id == victim_id);
            if let Some(pos) = pos {
                let victim = inner.active.remove(pos);
                for (kind, amount) in &victim.allocated {
                    if let Some(usage) = inner.usage.get_mut(kind) {
                        usage.available += amount;
                        usage.reserved -= amount;
                    }
                }
                info!(
                    "preempted allocation {} (client '{}') for request {}",
                    victim.request_id, victim.client_id, request.request_id
                );
                preempted_any = true;
            }
        }
        if !preempted_any {
            warn!("preemption found no victims for request {}", request.request_id);
        }
        preempted_any
    }

    fn drain_pending(inner: &mut PoolInner) {
        let mut i = 0;
        while i < inner.pending.len() {
            if Self::fits(inner, &inner.pending[i].requirements) {
                let request = inner.pending.remove(i);
                debug!("pending request {} now satisfied", request.request_id);
                Self::take(inner, &request);
            } else {
                i += 1;
            }
        }
    }
}

impl Default for ResourcePool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with(cpu: f64, memory: f64) -> ResourcePool {
        let pool = ResourcePool::new();
        pool.register(ResourceKind::Cpu, cpu).unwrap();
        pool.register(ResourceKind::Memory, memory).unwrap();
        pool
    }

    fn request(cpu: f64, memory: f64, priority: TaskPriority) -> ResourceRequest {
        let mut req = HashMap::new();
        if cpu > 0.0 {
            req.insert(ResourceKind::Cpu, cpu);
        }
        if memory > 0.0 {
            req.insert(ResourceKind::Memory, memory);
        }
        ResourceRequest::new(req, priority, "test")
    }

    fn invariant_holds(pool: &ResourcePool) {
        for (kind, usage) in pool.usage_snapshot() {
            assert!(
                (usage.available + usage.reserved - usage.total).abs() < 1e-9,
                "{kind:?}: available {} + reserved {} != total {}",
                usage.available,
                usage.reserved,
                usage.total
            );
        }
    }

    #[test]
    fn allocate_and_release_restores_invariant() {
        let pool = pool_with(8.0, 1024.0);
        let alloc = pool.allocate(&request(4.0, 512.0, TaskPriority::Normal)).unwrap();
        invariant_holds(&pool);
        let cpu = pool.usage(&ResourceKind::Cpu).unwrap();
        assert_eq!(cpu.available, 4.0);
        assert_eq!(cpu.reserved, 4.0);
        assert_eq!(cpu.peak, 4.0);

        pool.release(&alloc).unwrap();
        invariant_holds(&pool);
        let cpu = pool.usage(&ResourceKind::Cpu).unwrap();
        assert_eq!(cpu.available, 8.0);
        assert_eq!(cpu.reserved, 0.0);
        // Peak is sticky
        assert_eq!(cpu.peak, 4.0);
    }

    #[test]
    fn allocation_is_all_or_nothing() {
        let pool = pool_with(8.0, 100.0);
        // CPU fits, memory does not: nothing must be reserved
        assert!(pool.allocate(&request(2.0, 500.0, TaskPriority::Normal)).is_none());
        invariant_holds(&pool);
        assert_eq!(pool.usage(&ResourceKind::Cpu).unwrap().reserved, 0.0);
        assert_eq!(pool.pending_count(), 1);
    }

    #[test]
    fn unknown_kind_never_fits() {
        let pool = pool_with(8.0, 100.0);
        let mut req = HashMap::new();
        req.insert(ResourceKind::Gpu, 1.0);
        assert!(pool.allocate(&ResourceRequest::new(req, TaskPriority::High, "t")).is_none());
    }

    #[test]
    fn release_drains_pending_in_priority_order() {
        let pool = pool_with(4.0, 0.0);
        let first = pool.allocate(&request(4.0, 0.0, TaskPriority::Normal)).unwrap();
        // Queue two waiters; the high-priority one must win the freed capacity
        assert!(pool.allocate(&request(4.0, 0.0, TaskPriority::Low)).is_none());
        assert!(pool.allocate(&request(4.0, 0.0, TaskPriority::High)).is_none());
        assert_eq!(pool.pending_count(), 2);

        pool.release(&first).unwrap();
        invariant_holds(&pool);
        assert_eq!(pool.pending_count(), 1);
        let active = pool.active_allocations();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].priority, TaskPriority::High);
    }

    #[test]
    fn preemption_releases_lowest_priority_first() {
        let pool = pool_with(4.0, 0.0);
        pool.set_preemption(true);
        let low = pool.allocate(&request(2.0, 0.0, TaskPriority::Low)).unwrap();
        let _normal = pool.allocate(&request(2.0, 0.0, TaskPriority::Normal)).unwrap();

        // Critical request for 2 cores: only the Low allocation needs to go
        let crit = pool.allocate(&request(2.0, 0.0, TaskPriority::Critical));
        assert!(crit.is_some());
        invariant_holds(&pool);
        let ids: Vec<String> =
            pool.active_allocations().iter().map(|a| a.request_id.clone()).collect();
        assert!(!ids.contains(&low.request_id), "low-priority allocation preempted");
    }

    #[test]
    fn preemption_never_evicts_equal_or_higher_priority() {
        let pool = pool_with(2.0, 0.0);
        pool.set_preemption(true);
        let _existing = pool.allocate(&request(2.0, 0.0, TaskPriority::Critical)).unwrap();
        assert!(pool.allocate(&request(1.0, 0.0, TaskPriority::Critical)).is_none());
        assert_eq!(pool.active_allocations().len(), 1);
    }

    #[test]
    fn wait_for_resources_times_out_then_succeeds_after_release() {
        let pool = std::sync::Arc::new(pool_with(2.0, 0.0));
        let alloc = pool.allocate(&request(2.0, 0.0, TaskPriority::Normal)).unwrap();

        let req = request(1.0, 0.0, TaskPriority::Normal);
        assert!(!pool.wait_for_resources(&req, Duration::from_millis(50)));

        let pool2 = pool.clone();
        let waiter = std::thread::spawn(move || {
            pool2.wait_for_resources(&request(1.0, 0.0, TaskPriority::Normal), Duration::from_secs(5))
        });
        std::thread::sleep(Duration::from_millis(50));
        pool.release(&alloc).unwrap();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn register_resize_keeps_reservations() {
        let pool = pool_with(4.0, 0.0);
        let _a = pool.allocate(&request(3.0, 0.0, TaskPriority::Normal)).unwrap();
        pool.register(ResourceKind::Cpu, 8.0).unwrap();
        let cpu = pool.usage(&ResourceKind::Cpu).unwrap();
        assert_eq!(cpu.total, 8.0);
        assert_eq!(cpu.reserved, 3.0);
        assert_eq!(cpu.available, 5.0);
        invariant_holds(&pool);
    }
}
