//! GPU virtual address assignment, allocation lifetime and engine registry.
//!
//! The manager hands out [`OwnedAllocation`] tokens and keeps a per-root-device
//! map from GPU virtual address to allocation, which is how the submission
//! backend resolves the addresses it finds in command buffers. Engines (one
//! per command stream receiver) register here so allocations stamped on
//! their context can be checked for completion before a blocking free.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};
use xe_common::math::{PAGE_SIZE, align_up, align_up_u64};
use xe_common::{ContextId, Result, TaskCount, XeError};

use crate::allocation::{
    AllocationId, AllocationType, GraphicsAllocation, MAX_OS_CONTEXTS, OwnedAllocation,
};

/// First GPU virtual address handed out.
pub const GPU_VA_BASE: u64 = 0x0000_0001_0000_0000;

/// What the manager needs to know about an engine to wait on it.
pub trait EngineCompletion: Send + Sync {
    fn context_id(&self) -> ContextId;

    /// Latest task count the hardware has published for this engine.
    fn completed_task_count(&self) -> TaskCount;

    /// Block until `task_count` completes or `timeout` elapses; `false` on
    /// timeout.
    fn wait_for_completion(&self, task_count: TaskCount, timeout: Option<Duration>) -> bool;
}

/// Parameters for [`MemoryManager::allocate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationProperties {
    pub root_device_index: u32,
    pub size: usize,
    pub allocation_type: AllocationType,
    pub alignment: usize,
    /// Place the allocation at a fixed virtual address.
    pub gpu_address: Option<u64>,
    /// Visible in the GPU address space (CPU-only mirrors are not).
    pub gpu_mapped: bool,
    /// Host can address the memory directly.
    pub cpu_accessible: bool,
    pub compressed: bool,
}

impl AllocationProperties {
    #[must_use]
    pub fn new(root_device_index: u32, size: usize, allocation_type: AllocationType) -> Self {
        Self {
            root_device_index,
            size,
            allocation_type,
            alignment: PAGE_SIZE,
            gpu_address: None,
            gpu_mapped: true,
            cpu_accessible: true,
            compressed: false,
        }
    }

    #[must_use]
    pub fn with_alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment.max(1).next_power_of_two();
        self
    }

    #[must_use]
    pub fn at_address(mut self, gpu_address: u64) -> Self {
        self.gpu_address = Some(gpu_address);
        self
    }

    #[must_use]
    pub fn cpu_only(mut self) -> Self {
        self.gpu_mapped = false;
        self.cpu_accessible = true;
        self
    }

    #[must_use]
    pub fn device_local(mut self) -> Self {
        self.cpu_accessible = false;
        self
    }

    #[must_use]
    pub fn compressed(mut self, compressed: bool) -> Self {
        self.compressed = compressed;
        self
    }
}

/// Counters exposed for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    pub live_allocations: usize,
    pub live_bytes: u64,
    pub peak_bytes: u64,
    pub total_allocations: u64,
    pub total_frees: u64,
    pub failed_allocations: u64,
}

#[derive(Default)]
struct AddressSpace {
    mappings: BTreeMap<u64, Weak<GraphicsAllocation>>,
}

impl AddressSpace {
    fn overlaps(&self, start: u64, end: u64) -> bool {
        let below = self
            .mappings
            .range(..=start)
            .next_back()
            .and_then(|(_, weak)| weak.upgrade())
            .is_some_and(|alloc| alloc.gpu_end() > start);
        let inside = self
            .mappings
            .range((Bound::Excluded(start), Bound::Excluded(end)))
            .any(|(_, weak)| weak.strong_count() > 0);
        below || inside
    }

    fn resolve(&self, address: u64) -> Option<Arc<GraphicsAllocation>> {
        self.mappings
            .range(..=address)
            .next_back()
            .and_then(|(_, weak)| weak.upgrade())
            .filter(|alloc| alloc.contains_gpu_address(address))
    }
}

struct ManagerInner {
    next_gpu_va: u64,
    address_spaces: Vec<AddressSpace>,
    live: HashMap<AllocationId, usize>,
    stats: MemoryStats,
}

/// Owner of every [`GraphicsAllocation`] created for a device.
pub struct MemoryManager {
    root_device_count: u32,
    budget: u64,
    next_id: AtomicU64,
    next_context_id: AtomicU32,
    failure_countdown: AtomicU64,
    inner: Mutex<ManagerInner>,
    engines: Mutex<HashMap<ContextId, Weak<dyn EngineCompletion>>>,
}

impl std::fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryManager")
            .field("root_device_count", &self.root_device_count)
            .field("budget", &self.budget)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl MemoryManager {
    /// Create a manager for `root_device_count` devices with a byte budget
    /// (0 = unlimited).
    #[must_use]
    pub fn new(root_device_count: u32, budget: u64) -> Self {
        let root_device_count = root_device_count.max(1);
        Self {
            root_device_count,
            budget,
            next_id: AtomicU64::new(1),
            next_context_id: AtomicU32::new(0),
            failure_countdown: AtomicU64::new(u64::MAX),
            inner: Mutex::new(ManagerInner {
                next_gpu_va: GPU_VA_BASE,
                address_spaces: (0..root_device_count).map(|_| AddressSpace::default()).collect(),
                live: HashMap::new(),
                stats: MemoryStats::default(),
            }),
            engines: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub const fn root_device_count(&self) -> u32 {
        self.root_device_count
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, ManagerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the `n`-th next allocation fail with `OutOfResources`.
    ///
    /// Fault injection hook for exercising allocation-failure paths.
    pub fn fail_allocation_after(&self, n: u64) {
        self.failure_countdown.store(n, Ordering::SeqCst);
    }

    fn injected_failure(&self) -> bool {
        self.failure_countdown
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| match remaining {
                u64::MAX => None,
                0 => Some(u64::MAX),
                n => Some(n - 1),
            })
            .is_ok_and(|previous| previous == 0)
    }

    /// Create a new allocation.
    ///
    /// # Errors
    /// `InvalidArgument` for a zero size, unknown root device or overlapping
    /// fixed placement; `OutOfResources` when the budget is exhausted.
    pub fn allocate(&self, props: &AllocationProperties) -> Result<OwnedAllocation> {
        if props.size == 0 {
            return Err(XeError::invalid_argument(format!(
                "zero-sized {} allocation",
                props.allocation_type
            )));
        }
        if props.root_device_index >= self.root_device_count {
            return Err(XeError::invalid_argument(format!(
                "root device {} out of range ({} devices)",
                props.root_device_index, self.root_device_count
            )));
        }

        let mut inner = self.lock_inner();
        let reserved = align_up(props.size, PAGE_SIZE) as u64;
        if self.injected_failure()
            || (self.budget != 0 && inner.stats.live_bytes + reserved > self.budget)
        {
            inner.stats.failed_allocations += 1;
            warn!(
                allocation_type = %props.allocation_type,
                size = props.size,
                live_bytes = inner.stats.live_bytes,
                budget = self.budget,
                "graphics allocation failed"
            );
            return Err(XeError::out_of_resources(
                format!("{} allocation", props.allocation_type),
                props.size,
            ));
        }

        let gpu_address = match props.gpu_address {
            Some(fixed) => {
                if props.gpu_mapped
                    && inner.address_spaces[props.root_device_index as usize]
                        .overlaps(fixed, fixed + reserved)
                {
                    return Err(XeError::invalid_argument(format!(
                        "fixed placement at {fixed:#x} overlaps a live allocation"
                    )));
                }
                fixed
            }
            None => {
                let alignment = props.alignment.max(PAGE_SIZE) as u64;
                let base = align_up_u64(inner.next_gpu_va, alignment);
                // One unmapped guard page between neighbours.
                inner.next_gpu_va = base + reserved + PAGE_SIZE as u64;
                base
            }
        };

        let id = AllocationId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let cpu_address = props.cpu_accessible.then_some(gpu_address);
        let allocation = GraphicsAllocation::new(
            id,
            props.root_device_index,
            props.allocation_type,
            gpu_address,
            cpu_address,
            props.size,
            props.gpu_mapped,
        );
        allocation.set_compressed(props.compressed);
        let owned = OwnedAllocation::new(allocation);

        if props.gpu_mapped {
            inner.address_spaces[props.root_device_index as usize]
                .mappings
                .insert(gpu_address, Arc::downgrade(&owned.share()));
        }
        inner.live.insert(id, reserved as usize);
        inner.stats.live_allocations = inner.live.len();
        inner.stats.live_bytes += reserved;
        inner.stats.peak_bytes = inner.stats.peak_bytes.max(inner.stats.live_bytes);
        inner.stats.total_allocations += 1;

        debug!(
            %id,
            allocation_type = %props.allocation_type,
            gpu_address = format_args!("{gpu_address:#x}"),
            size = props.size,
            "graphics allocation created"
        );
        Ok(owned)
    }

    /// Release an allocation immediately.
    ///
    /// The caller guarantees the GPU is done with it; use
    /// [`check_gpu_usage_and_free`](Self::check_gpu_usage_and_free) otherwise.
    pub fn free(&self, allocation: OwnedAllocation) {
        if !self.is_allocation_completed(&allocation) {
            warn!(
                id = %allocation.id(),
                used = ?allocation.used_contexts(),
                "freeing allocation that is still referenced by in-flight work"
            );
        }
        let shared = allocation.into_shared();
        let mut inner = self.lock_inner();
        if shared.is_gpu_mapped()
            && let Some(space) = inner
                .address_spaces
                .get_mut(shared.root_device_index() as usize)
            && space
                .mappings
                .get(&shared.gpu_address())
                .is_some_and(|weak| std::ptr::eq(weak.as_ptr(), Arc::as_ptr(&shared)))
        {
            space.mappings.remove(&shared.gpu_address());
        }
        if let Some(reserved) = inner.live.remove(&shared.id()) {
            inner.stats.live_bytes -= reserved as u64;
            inner.stats.total_frees += 1;
        }
        inner.stats.live_allocations = inner.live.len();
        debug!(id = %shared.id(), allocation_type = %shared.allocation_type(), "graphics allocation freed");
    }

    /// Free after GPU usage ends.
    ///
    /// With `blocking`, waits for every registered engine that stamped the
    /// allocation to pass its stamp; otherwise frees immediately.
    pub fn check_gpu_usage_and_free(&self, allocation: OwnedAllocation, blocking: bool) {
        if blocking {
            for (context_id, task_count) in allocation.used_contexts() {
                let Some(engine) = self.engine(context_id) else {
                    continue;
                };
                if engine.completed_task_count() < task_count {
                    debug!(
                        id = %allocation.id(),
                        context_id,
                        task_count,
                        "waiting for engine before freeing allocation"
                    );
                    engine.wait_for_completion(task_count, None);
                }
            }
        }
        self.free(allocation);
    }

    /// Whether every engine that referenced the allocation has passed its stamp.
    #[must_use]
    pub fn is_allocation_completed(&self, allocation: &GraphicsAllocation) -> bool {
        allocation.used_contexts().into_iter().all(|(context_id, task_count)| {
            self.engine(context_id)
                .is_none_or(|engine| engine.completed_task_count() >= task_count)
        })
    }

    /// Translate a GPU virtual address to its allocation and byte offset.
    #[must_use]
    pub fn resolve_gpu_address(
        &self,
        root_device_index: u32,
        address: u64,
    ) -> Option<(Arc<GraphicsAllocation>, usize)> {
        let inner = self.lock_inner();
        let alloc = inner
            .address_spaces
            .get(root_device_index as usize)?
            .resolve(address)?;
        let offset = (address - alloc.gpu_address()) as usize;
        Some((alloc, offset))
    }

    /// Reserve a virtual address range usable with
    /// [`AllocationProperties::at_address`] on every root device.
    pub fn reserve_gpu_range(&self, size: usize, alignment: usize) -> u64 {
        let mut inner = self.lock_inner();
        let base = align_up_u64(inner.next_gpu_va, alignment.max(PAGE_SIZE) as u64);
        inner.next_gpu_va = base + align_up(size.max(1), PAGE_SIZE) as u64 + PAGE_SIZE as u64;
        base
    }

    #[must_use]
    pub fn stats(&self) -> MemoryStats {
        self.lock_inner().stats.clone()
    }

    // ── Engine registry ─────────────────────────────────────────────────

    /// Claim a context id for a new engine.
    pub fn reserve_context_id(&self) -> Result<ContextId> {
        let id = self
            .next_context_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |next| {
                ((next as usize) < MAX_OS_CONTEXTS).then_some(next + 1)
            })
            .map_err(|_| XeError::out_of_resources("engine context", MAX_OS_CONTEXTS))?;
        Ok(id)
    }

    pub fn register_engine(&self, context_id: ContextId, engine: Weak<dyn EngineCompletion>) {
        debug!(context_id, "engine registered");
        self.engines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(context_id, engine);
    }

    pub fn unregister_engine(&self, context_id: ContextId) {
        debug!(context_id, "engine unregistered");
        self.engines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&context_id);
    }

    #[must_use]
    pub fn engine(&self, context_id: ContextId) -> Option<Arc<dyn EngineCompletion>> {
        self.engines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&context_id)
            .and_then(Weak::upgrade)
    }

    #[must_use]
    pub fn registered_contexts(&self) -> Vec<ContextId> {
        let mut ids: Vec<_> = self
            .engines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    /// Engine whose tag is driven by the test.
    pub(crate) struct FakeEngine {
        pub id: ContextId,
        pub tag: AtomicU32,
        pub waits: AtomicU32,
    }

    impl EngineCompletion for FakeEngine {
        fn context_id(&self) -> ContextId {
            self.id
        }

        fn completed_task_count(&self) -> TaskCount {
            self.tag.load(Ordering::SeqCst)
        }

        fn wait_for_completion(&self, task_count: TaskCount, _timeout: Option<Duration>) -> bool {
            self.waits.fetch_add(1, Ordering::SeqCst);
            // The fake "GPU" catches up as soon as someone waits.
            self.tag.fetch_max(task_count, Ordering::SeqCst);
            true
        }
    }

    pub(crate) fn fake_engine(mm: &MemoryManager, tag: TaskCount) -> Arc<FakeEngine> {
        let id = mm.reserve_context_id().unwrap();
        let engine = Arc::new(FakeEngine {
            id,
            tag: AtomicU32::new(tag),
            waits: AtomicU32::new(0),
        });
        let weak: Weak<dyn EngineCompletion> = Arc::downgrade(&engine) as Weak<dyn EngineCompletion>;
        mm.register_engine(id, weak);
        engine
    }

    #[test]
    fn allocations_get_distinct_page_aligned_addresses() {
        let mm = MemoryManager::new(1, 0);
        let a = mm.allocate(&AllocationProperties::new(0, 100, AllocationType::Buffer)).unwrap();
        let b = mm.allocate(&AllocationProperties::new(0, 5000, AllocationType::Buffer)).unwrap();
        assert_eq!(a.gpu_address() % PAGE_SIZE as u64, 0);
        assert_eq!(b.gpu_address() % PAGE_SIZE as u64, 0);
        assert!(b.gpu_address() >= a.gpu_end());
        assert_ne!(a.id(), b.id());
        assert_eq!(a.cpu_address(), Some(a.gpu_address()));
    }

    #[test]
    fn zero_size_is_invalid_argument() {
        let mm = MemoryManager::new(1, 0);
        let err = mm
            .allocate(&AllocationProperties::new(0, 0, AllocationType::Buffer))
            .unwrap_err();
        assert!(matches!(err, XeError::InvalidArgument { .. }));
    }

    #[test]
    fn budget_exhaustion_is_out_of_resources() {
        let mm = MemoryManager::new(1, 8192);
        let a = mm.allocate(&AllocationProperties::new(0, 8192, AllocationType::Buffer)).unwrap();
        let err = mm
            .allocate(&AllocationProperties::new(0, 1, AllocationType::Buffer))
            .unwrap_err();
        assert!(matches!(err, XeError::OutOfResources { .. }));
        assert_eq!(mm.stats().failed_allocations, 1);
        mm.free(a);
        assert!(mm.allocate(&AllocationProperties::new(0, 1, AllocationType::Buffer)).is_ok());
    }

    #[test]
    fn injected_failure_hits_the_nth_allocation() {
        let mm = MemoryManager::new(1, 0);
        mm.fail_allocation_after(1);
        let props = AllocationProperties::new(0, 64, AllocationType::Buffer);
        assert!(mm.allocate(&props).is_ok());
        assert!(mm.allocate(&props).is_err());
        assert!(mm.allocate(&props).is_ok());
    }

    #[test]
    fn resolve_finds_owner_and_offset() {
        let mm = MemoryManager::new(1, 0);
        let a = mm.allocate(&AllocationProperties::new(0, 256, AllocationType::TagBuffer)).unwrap();
        let (found, offset) = mm.resolve_gpu_address(0, a.gpu_address() + 16).unwrap();
        assert_eq!(found.id(), a.id());
        assert_eq!(offset, 16);
        assert!(mm.resolve_gpu_address(0, a.gpu_address() + 256).is_none());
        let address = a.gpu_address();
        mm.free(a);
        assert!(mm.resolve_gpu_address(0, address).is_none());
    }

    #[test]
    fn cpu_only_mirror_is_not_mapped() {
        let mm = MemoryManager::new(1, 0);
        let gpu = mm.allocate(&AllocationProperties::new(0, 4096, AllocationType::SvmGpu)).unwrap();
        let mirror = mm
            .allocate(
                &AllocationProperties::new(0, 4096, AllocationType::SvmCpu)
                    .at_address(gpu.gpu_address())
                    .cpu_only(),
            )
            .unwrap();
        let (resolved, _) = mm.resolve_gpu_address(0, gpu.gpu_address()).unwrap();
        assert_eq!(resolved.id(), gpu.id());
        mm.free(mirror);
        assert!(mm.resolve_gpu_address(0, gpu.gpu_address()).is_some());
    }

    #[test]
    fn overlapping_fixed_placement_is_rejected() {
        let mm = MemoryManager::new(1, 0);
        let a = mm.allocate(&AllocationProperties::new(0, 8192, AllocationType::Buffer)).unwrap();
        let err = mm
            .allocate(
                &AllocationProperties::new(0, 64, AllocationType::Buffer)
                    .at_address(a.gpu_address() + 4096),
            )
            .unwrap_err();
        assert!(matches!(err, XeError::InvalidArgument { .. }));
    }

    #[test]
    fn stats_track_live_and_peak() {
        let mm = MemoryManager::new(1, 0);
        let a = mm.allocate(&AllocationProperties::new(0, 4096, AllocationType::Buffer)).unwrap();
        let b = mm.allocate(&AllocationProperties::new(0, 4096, AllocationType::Buffer)).unwrap();
        mm.free(a);
        let stats = mm.stats();
        assert_eq!(stats.live_allocations, 1);
        assert_eq!(stats.live_bytes, 4096);
        assert_eq!(stats.peak_bytes, 8192);
        mm.free(b);
        assert_eq!(mm.stats().total_frees, 2);
    }

    #[test]
    fn blocking_free_waits_for_every_engine_that_used_it() {
        let mm = MemoryManager::new(1, 0);
        let e0 = fake_engine(&mm, 0);
        let e1 = fake_engine(&mm, 0);
        let e2 = fake_engine(&mm, 10);
        let alloc = mm.allocate(&AllocationProperties::new(0, 64, AllocationType::SvmGpu)).unwrap();
        alloc.update_task_count(4, e0.id);
        alloc.update_task_count(2, e1.id);
        alloc.update_task_count(3, e2.id);
        assert!(!mm.is_allocation_completed(&alloc));

        mm.check_gpu_usage_and_free(alloc, true);

        assert_eq!(e0.waits.load(Ordering::SeqCst), 1);
        assert_eq!(e1.waits.load(Ordering::SeqCst), 1);
        // Already past its stamp: no wait.
        assert_eq!(e2.waits.load(Ordering::SeqCst), 0);
        assert!(e0.completed_task_count() >= 4);
        assert!(e1.completed_task_count() >= 2);
    }

    #[test]
    fn non_blocking_free_does_not_wait() {
        let mm = MemoryManager::new(1, 0);
        let engine = fake_engine(&mm, 0);
        let alloc = mm.allocate(&AllocationProperties::new(0, 64, AllocationType::SvmGpu)).unwrap();
        alloc.update_task_count(9, engine.id);
        mm.check_gpu_usage_and_free(alloc, false);
        assert_eq!(engine.waits.load(Ordering::SeqCst), 0);
        assert_eq!(mm.stats().live_allocations, 0);
    }

    #[test]
    fn context_ids_are_bounded() {
        let mm = MemoryManager::new(1, 0);
        for expected in 0..MAX_OS_CONTEXTS as ContextId {
            assert_eq!(mm.reserve_context_id().unwrap(), expected);
        }
        assert!(matches!(
            mm.reserve_context_id(),
            Err(XeError::OutOfResources { .. })
        ));
    }

    #[test]
    fn dropped_engine_disappears_from_registry() {
        let mm = MemoryManager::new(1, 0);
        let engine = fake_engine(&mm, 0);
        let id = engine.id;
        assert!(mm.engine(id).is_some());
        drop(engine);
        assert!(mm.engine(id).is_none());
        mm.unregister_engine(id);
        assert!(mm.registered_contexts().is_empty());
    }
}
