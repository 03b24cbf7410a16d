//! GPU-addressable memory regions and their per-context usage stamps.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use xe_common::{ContextId, Result, TaskCount, XeError};

/// Number of engine contexts a single allocation can be stamped on.
pub const MAX_OS_CONTEXTS: usize = 16;

const OBJECT_NOT_USED: TaskCount = TaskCount::MAX;

/// Stable identity of an allocation for logs and tracking maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct AllocationId(pub u64);

impl fmt::Display for AllocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "alloc#{}", self.0)
    }
}

/// What an allocation is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationType {
    CommandBuffer,
    KernelIsa,
    PrivateSurface,
    DynamicStateHeap,
    IndirectObjectHeap,
    SurfaceStateHeap,
    TagBuffer,
    TimestampPacketTagBuffer,
    PrintfSurface,
    PreemptionSurface,
    DebugSurface,
    ScratchSurface,
    GlobalSurface,
    ConstantSurface,
    SyncBuffer,
    FenceSurface,
    WorkPartitionSurface,
    PerDssBackedBuffer,
    ClearColorSurface,
    Buffer,
    Image,
    SvmCpu,
    SvmGpu,
    SvmZeroCopy,
}

impl AllocationType {
    /// Heaps addressed relative to a state base address.
    #[must_use]
    pub const fn is_indirect_heap(self) -> bool {
        matches!(
            self,
            Self::DynamicStateHeap | Self::IndirectObjectHeap | Self::SurfaceStateHeap
        )
    }

    /// Allocations owned by the driver rather than the application.
    #[must_use]
    pub const fn is_internal(self) -> bool {
        !matches!(
            self,
            Self::Buffer | Self::Image | Self::SvmCpu | Self::SvmGpu | Self::SvmZeroCopy
        )
    }

    #[must_use]
    pub const fn is_svm(self) -> bool {
        matches!(self, Self::SvmCpu | Self::SvmGpu | Self::SvmZeroCopy)
    }
}

impl fmt::Display for AllocationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A GPU-addressable memory region.
///
/// Contents live in a CPU-side backing store that stands in for mapped
/// memory; the submission backend reads and writes it through GPU addresses.
/// The store grows lazily, untouched bytes read as zero.
pub struct GraphicsAllocation {
    id: AllocationId,
    root_device_index: u32,
    allocation_type: AllocationType,
    gpu_address: u64,
    cpu_address: Option<u64>,
    size: usize,
    gpu_mapped: bool,
    compressed: AtomicBool,
    evictable: AtomicBool,
    requires_dc_flush: AtomicBool,
    task_counts: [AtomicU32; MAX_OS_CONTEXTS],
    residency_task_counts: [AtomicU32; MAX_OS_CONTEXTS],
    storage: Mutex<Vec<u8>>,
}

impl fmt::Debug for GraphicsAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphicsAllocation")
            .field("id", &self.id)
            .field("type", &self.allocation_type)
            .field("gpu_address", &format_args!("{:#x}", self.gpu_address))
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

impl GraphicsAllocation {
    pub(crate) fn new(
        id: AllocationId,
        root_device_index: u32,
        allocation_type: AllocationType,
        gpu_address: u64,
        cpu_address: Option<u64>,
        size: usize,
        gpu_mapped: bool,
    ) -> Self {
        Self {
            id,
            root_device_index,
            allocation_type,
            gpu_address,
            cpu_address,
            size,
            gpu_mapped,
            compressed: AtomicBool::new(false),
            evictable: AtomicBool::new(true),
            requires_dc_flush: AtomicBool::new(false),
            task_counts: std::array::from_fn(|_| AtomicU32::new(OBJECT_NOT_USED)),
            residency_task_counts: std::array::from_fn(|_| AtomicU32::new(OBJECT_NOT_USED)),
            storage: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub const fn id(&self) -> AllocationId {
        self.id
    }

    #[must_use]
    pub const fn root_device_index(&self) -> u32 {
        self.root_device_index
    }

    #[must_use]
    pub const fn allocation_type(&self) -> AllocationType {
        self.allocation_type
    }

    #[must_use]
    pub const fn gpu_address(&self) -> u64 {
        self.gpu_address
    }

    /// One past the last GPU address covered by the allocation.
    #[must_use]
    pub const fn gpu_end(&self) -> u64 {
        self.gpu_address + self.size as u64
    }

    #[must_use]
    pub const fn cpu_address(&self) -> Option<u64> {
        self.cpu_address
    }

    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Whether the allocation is visible in the GPU address space.
    #[must_use]
    pub const fn is_gpu_mapped(&self) -> bool {
        self.gpu_mapped
    }

    #[must_use]
    pub const fn contains_gpu_address(&self, address: u64) -> bool {
        address >= self.gpu_address && address < self.gpu_end()
    }

    // ── Attributes ──────────────────────────────────────────────────────

    #[must_use]
    pub fn is_compressed(&self) -> bool {
        self.compressed.load(Ordering::Acquire)
    }

    pub fn set_compressed(&self, compressed: bool) {
        self.compressed.store(compressed, Ordering::Release);
    }

    /// `false` for persistently resident allocations.
    #[must_use]
    pub fn is_evictable(&self) -> bool {
        self.evictable.load(Ordering::Acquire)
    }

    pub fn set_evictable(&self, evictable: bool) {
        self.evictable.store(evictable, Ordering::Release);
    }

    /// Whether a dispatch touching this allocation must flush the data cache.
    #[must_use]
    pub fn requires_dc_flush(&self) -> bool {
        self.requires_dc_flush.load(Ordering::Acquire)
    }

    pub fn set_requires_dc_flush(&self, required: bool) {
        self.requires_dc_flush.store(required, Ordering::Release);
    }

    // ── Usage stamps ────────────────────────────────────────────────────

    fn slot(stamps: &[AtomicU32; MAX_OS_CONTEXTS], context_id: ContextId) -> Option<&AtomicU32> {
        let slot = stamps.get(context_id as usize);
        debug_assert!(slot.is_some(), "context id {context_id} out of range");
        slot
    }

    /// Task count at which the allocation was last referenced on `context_id`.
    #[must_use]
    pub fn task_count(&self, context_id: ContextId) -> Option<TaskCount> {
        Self::slot(&self.task_counts, context_id)
            .map(|slot| slot.load(Ordering::Acquire))
            .filter(|tc| *tc != OBJECT_NOT_USED)
    }

    pub fn update_task_count(&self, task_count: TaskCount, context_id: ContextId) {
        if let Some(slot) = Self::slot(&self.task_counts, context_id) {
            slot.store(task_count, Ordering::Release);
        }
    }

    /// Forget usage on `context_id`.
    pub fn release_usage(&self, context_id: ContextId) {
        if let Some(slot) = Self::slot(&self.task_counts, context_id) {
            slot.store(OBJECT_NOT_USED, Ordering::Release);
        }
    }

    /// Task count up to which the allocation is intended to stay resident.
    #[must_use]
    pub fn residency_task_count(&self, context_id: ContextId) -> Option<TaskCount> {
        Self::slot(&self.residency_task_counts, context_id)
            .map(|slot| slot.load(Ordering::Acquire))
            .filter(|tc| *tc != OBJECT_NOT_USED)
    }

    pub fn update_residency_task_count(&self, task_count: TaskCount, context_id: ContextId) {
        if let Some(slot) = Self::slot(&self.residency_task_counts, context_id) {
            slot.store(task_count, Ordering::Release);
        }
    }

    pub fn release_residency(&self, context_id: ContextId) {
        if let Some(slot) = Self::slot(&self.residency_task_counts, context_id) {
            slot.store(OBJECT_NOT_USED, Ordering::Release);
        }
    }

    /// Resident on a context iff its last reference is at or past the
    /// context's last completed task count.
    #[must_use]
    pub fn is_resident(&self, context_id: ContextId, completed: TaskCount) -> bool {
        self.residency_task_count(context_id)
            .is_some_and(|tc| tc >= completed)
    }

    #[must_use]
    pub fn is_used_by_context(&self, context_id: ContextId) -> bool {
        self.task_count(context_id).is_some()
    }

    #[must_use]
    pub fn is_used(&self) -> bool {
        (0..MAX_OS_CONTEXTS as ContextId).any(|ctx| self.is_used_by_context(ctx))
    }

    /// `(context, task count)` for every context that referenced the allocation.
    #[must_use]
    pub fn used_contexts(&self) -> Vec<(ContextId, TaskCount)> {
        (0..MAX_OS_CONTEXTS as ContextId)
            .filter_map(|ctx| self.task_count(ctx).map(|tc| (ctx, tc)))
            .collect()
    }

    // ── Backing store ───────────────────────────────────────────────────

    fn check_range(&self, offset: usize, len: usize) -> Result<usize> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(end),
            _ => Err(XeError::invalid_argument(format!(
                "access [{offset}, +{len}) outside {} of {} bytes",
                self.id, self.size
            ))),
        }
    }

    pub fn write_at(&self, offset: usize, data: &[u8]) -> Result<()> {
        let end = self.check_range(offset, data.len())?;
        let mut storage = self.storage.lock().unwrap_or_else(PoisonError::into_inner);
        if storage.len() < end {
            storage.resize(end, 0);
        }
        storage[offset..end].copy_from_slice(data);
        Ok(())
    }

    pub fn read_into(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        let end = self.check_range(offset, out.len())?;
        let storage = self.storage.lock().unwrap_or_else(PoisonError::into_inner);
        let stored_end = end.min(storage.len());
        let copied = stored_end.saturating_sub(offset);
        if copied > 0 {
            out[..copied].copy_from_slice(&storage[offset..stored_end]);
        }
        out[copied..].fill(0);
        Ok(())
    }

    pub fn read_at(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        let mut out = vec![0; len];
        self.read_into(offset, &mut out)?;
        Ok(out)
    }

    pub fn write_u32(&self, offset: usize, value: u32) -> Result<()> {
        self.write_at(offset, &value.to_le_bytes())
    }

    pub fn write_u64(&self, offset: usize, value: u64) -> Result<()> {
        self.write_at(offset, &value.to_le_bytes())
    }

    pub fn read_u32(&self, offset: usize) -> Result<u32> {
        let mut raw = [0u8; 4];
        self.read_into(offset, &mut raw)?;
        Ok(u32::from_le_bytes(raw))
    }

    pub fn read_u64(&self, offset: usize) -> Result<u64> {
        let mut raw = [0u8; 8];
        self.read_into(offset, &mut raw)?;
        Ok(u64::from_le_bytes(raw))
    }

    /// Copy the whole contents of `source` into this allocation.
    pub fn copy_contents_from(&self, source: &GraphicsAllocation) -> Result<()> {
        let len = self.size.min(source.size);
        let data = source.read_at(0, len)?;
        self.write_at(0, &data)
    }
}

/// Exclusive ownership of a [`GraphicsAllocation`].
///
/// Not `Clone`: whoever holds the token is responsible for handing it to
/// [`MemoryManager::free`](crate::MemoryManager::free) or to an internal
/// allocation list. Everyone else holds `Arc<GraphicsAllocation>` views from
/// [`OwnedAllocation::share`].
#[derive(Debug)]
pub struct OwnedAllocation(Arc<GraphicsAllocation>);

impl OwnedAllocation {
    pub(crate) fn new(allocation: GraphicsAllocation) -> Self {
        Self(Arc::new(allocation))
    }

    /// Non-owning view for residency lists and argument slots.
    #[must_use]
    pub fn share(&self) -> Arc<GraphicsAllocation> {
        Arc::clone(&self.0)
    }

    pub(crate) fn into_shared(self) -> Arc<GraphicsAllocation> {
        self.0
    }
}

impl Deref for OwnedAllocation {
    type Target = GraphicsAllocation;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocation(size: usize) -> GraphicsAllocation {
        GraphicsAllocation::new(
            AllocationId(1),
            0,
            AllocationType::Buffer,
            0x1_0000,
            Some(0x1_0000),
            size,
            true,
        )
    }

    #[test]
    fn fresh_allocation_is_unused() {
        let alloc = allocation(4096);
        assert!(!alloc.is_used());
        assert_eq!(alloc.task_count(0), None);
        assert_eq!(alloc.residency_task_count(3), None);
        assert!(alloc.used_contexts().is_empty());
    }

    #[test]
    fn stamps_are_per_context() {
        let alloc = allocation(4096);
        alloc.update_task_count(7, 1);
        alloc.update_task_count(3, 4);
        assert_eq!(alloc.task_count(1), Some(7));
        assert_eq!(alloc.task_count(0), None);
        assert_eq!(alloc.used_contexts(), vec![(1, 7), (4, 3)]);
        alloc.release_usage(1);
        assert_eq!(alloc.used_contexts(), vec![(4, 3)]);
    }

    #[test]
    fn residency_follows_completed_tag() {
        let alloc = allocation(64);
        alloc.update_residency_task_count(5, 0);
        assert!(alloc.is_resident(0, 4));
        assert!(alloc.is_resident(0, 5));
        assert!(!alloc.is_resident(0, 6));
        alloc.release_residency(0);
        assert!(!alloc.is_resident(0, 0));
    }

    #[test]
    fn backing_store_reads_zero_until_written() {
        let alloc = allocation(64);
        assert_eq!(alloc.read_u64(56).unwrap(), 0);
        alloc.write_u32(8, 0xabcd).unwrap();
        assert_eq!(alloc.read_u32(8).unwrap(), 0xabcd);
        assert_eq!(alloc.read_at(6, 6).unwrap(), vec![0, 0, 0xcd, 0xab, 0, 0]);
    }

    #[test]
    fn backing_store_is_bounds_checked() {
        let alloc = allocation(16);
        assert!(alloc.write_u64(12, 1).is_err());
        assert!(alloc.read_at(0, 17).is_err());
        assert!(alloc.write_at(usize::MAX, &[1]).is_err());
    }

    #[test]
    fn address_range() {
        let alloc = allocation(0x100);
        assert!(alloc.contains_gpu_address(0x1_0000));
        assert!(alloc.contains_gpu_address(0x1_00ff));
        assert!(!alloc.contains_gpu_address(0x1_0100));
        assert_eq!(alloc.gpu_end(), 0x1_0100);
    }

    #[test]
    fn attribute_defaults() {
        let alloc = allocation(16);
        assert!(alloc.is_evictable());
        assert!(!alloc.is_compressed());
        assert!(!alloc.requires_dc_flush());
        assert!(AllocationType::SurfaceStateHeap.is_indirect_heap());
        assert!(!AllocationType::Buffer.is_internal());
        assert!(AllocationType::SvmZeroCopy.is_svm());
    }
}
