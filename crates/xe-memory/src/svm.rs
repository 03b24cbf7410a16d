//! Unified shared memory: host, device and shared allocations addressed by
//! a single pointer.
//!
//! The tracker is an ordered map keyed by allocation base address. A lookup
//! takes the greatest base at or below the pointer and then checks the
//! pointer falls inside that allocation, so interior pointers resolve to
//! their owning allocation. One coarse mutex guards the whole tracker.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info};
use xe_common::config::SvmModeOverride;
use xe_common::hw_info::FeatureTable;
use xe_common::math::{PAGE_SIZE, PAGE_SIZE_64K, align_up};
use xe_common::{Result, XeError};

use crate::allocation::{AllocationType, GraphicsAllocation, OwnedAllocation};
use crate::memory_manager::{AllocationProperties, MemoryManager};

/// Which side of the bus the application asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnifiedMemoryType {
    Host,
    Device,
    Shared,
    NotSpecified,
}

/// How a shared or host allocation is backed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SvmAllocationMode {
    /// One allocation visible to both host and device.
    ZeroCopy,
    /// Device-local allocation plus a CPU mirror; migration is explicit.
    DualStorage,
    /// One allocation the kernel-mode driver migrates on fault.
    KmdMigrated,
}

/// Where the current contents of a dual-storage allocation live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResidencySide {
    Cpu,
    Gpu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SvmAllocationProperties {
    pub read_only: bool,
    pub coherent: bool,
    pub locally_uncached: bool,
    /// Requested alignment in bytes; 0 selects the page size.
    pub alignment: usize,
}

/// Memory types selected by a kernel's indirect-access flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UnifiedMemoryMask {
    pub host: bool,
    pub device: bool,
    pub shared: bool,
}

impl UnifiedMemoryMask {
    #[must_use]
    pub const fn any(self) -> bool {
        self.host || self.device || self.shared
    }

    #[must_use]
    pub const fn contains(self, memory_type: UnifiedMemoryType) -> bool {
        match memory_type {
            UnifiedMemoryType::Host => self.host,
            UnifiedMemoryType::Device => self.device,
            UnifiedMemoryType::Shared => self.shared,
            UnifiedMemoryType::NotSpecified => false,
        }
    }
}

/// Metadata for one unified-memory allocation.
#[derive(Debug, Clone)]
pub struct SvmAllocationData {
    pub allocation_id: u64,
    pub size: usize,
    pub memory_type: UnifiedMemoryType,
    /// `None` for device allocations.
    pub mode: Option<SvmAllocationMode>,
    pub device: Option<u32>,
    pub page_size: usize,
    pub properties: SvmAllocationProperties,
    gpu_allocations: Vec<Option<Arc<GraphicsAllocation>>>,
    cpu_allocation: Option<Arc<GraphicsAllocation>>,
}

impl SvmAllocationData {
    /// Pointer handed to the application.
    #[must_use]
    pub fn base_address(&self) -> u64 {
        self.gpu_allocations
            .iter()
            .flatten()
            .next()
            .map_or(0, |alloc| alloc.gpu_address())
    }

    /// Allocation backing this pointer on `root_device_index`.
    #[must_use]
    pub fn gpu_allocation(&self, root_device_index: u32) -> Option<&Arc<GraphicsAllocation>> {
        self.gpu_allocations.get(root_device_index as usize)?.as_ref()
    }

    pub fn gpu_allocations(&self) -> impl Iterator<Item = &Arc<GraphicsAllocation>> {
        self.gpu_allocations.iter().flatten()
    }

    /// CPU mirror of a dual-storage allocation.
    #[must_use]
    pub const fn cpu_allocation(&self) -> Option<&Arc<GraphicsAllocation>> {
        self.cpu_allocation.as_ref()
    }

    #[must_use]
    pub fn contains(&self, ptr: u64) -> bool {
        let base = self.base_address();
        ptr >= base && ptr < base + self.size as u64
    }
}

/// Result of [`AllocationTracker::lookup`].
#[derive(Debug)]
pub enum SvmLookup<'a> {
    Found(&'a SvmAllocationData),
    /// A lower allocation exists but the pointer is past its end.
    OutOfRange { nearest: &'a SvmAllocationData },
    NotFound,
}

/// Ordered map of live unified-memory allocations.
#[derive(Debug, Default)]
pub struct AllocationTracker {
    allocations: BTreeMap<u64, SvmAllocationData>,
}

impl AllocationTracker {
    pub fn insert(&mut self, data: SvmAllocationData) {
        self.allocations.insert(data.base_address(), data);
    }

    pub fn remove(&mut self, data: &SvmAllocationData) -> Option<SvmAllocationData> {
        self.allocations.remove(&data.base_address())
    }

    /// Allocation containing `ptr`.
    #[must_use]
    pub fn get(&self, ptr: u64) -> Option<&SvmAllocationData> {
        match self.lookup(ptr) {
            SvmLookup::Found(data) => Some(data),
            SvmLookup::OutOfRange { .. } | SvmLookup::NotFound => None,
        }
    }

    /// Like [`get`](Self::get) but distinguishes a pointer past the end of an
    /// allocation from one below every allocation.
    #[must_use]
    pub fn lookup(&self, ptr: u64) -> SvmLookup<'_> {
        match self.allocations.range(..=ptr).next_back() {
            Some((_, data)) if data.contains(ptr) => SvmLookup::Found(data),
            Some((_, data)) => SvmLookup::OutOfRange { nearest: data },
            None => SvmLookup::NotFound,
        }
    }

    #[must_use]
    pub fn get_exact(&self, base: u64) -> Option<&SvmAllocationData> {
        self.allocations.get(&base)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.allocations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SvmAllocationData> {
        self.allocations.values()
    }
}

/// Owned result of [`SvmAllocsManager::lookup`].
#[derive(Debug, Clone)]
pub enum SvmLookupResult {
    Found(SvmAllocationData),
    OutOfRange { nearest_base: u64, nearest_size: usize },
    NotFound,
}

/// Device capabilities that steer placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SvmCapabilities {
    pub local_memory: bool,
    pub kmd_migration: bool,
}

impl From<&FeatureTable> for SvmCapabilities {
    fn from(features: &FeatureTable) -> Self {
        Self {
            local_memory: features.ftr_local_memory,
            kmd_migration: features.ftr_kmd_migration,
        }
    }
}

#[derive(Default)]
struct Ownership {
    gpu: Vec<OwnedAllocation>,
    cpu: Option<OwnedAllocation>,
}

#[derive(Default)]
struct SvmInner {
    tracker: AllocationTracker,
    owned: HashMap<u64, Ownership>,
    sides: HashMap<u64, ResidencySide>,
}

/// Creates, tracks and frees unified-memory allocations.
pub struct SvmAllocsManager {
    memory_manager: Arc<MemoryManager>,
    capabilities: SvmCapabilities,
    mode_override: SvmModeOverride,
    next_id: AtomicU64,
    inner: Mutex<SvmInner>,
}

impl std::fmt::Debug for SvmAllocsManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SvmAllocsManager")
            .field("capabilities", &self.capabilities)
            .field("mode_override", &self.mode_override)
            .field("num_allocs", &self.num_allocs())
            .finish_non_exhaustive()
    }
}

impl SvmAllocsManager {
    #[must_use]
    pub fn new(
        memory_manager: Arc<MemoryManager>,
        capabilities: SvmCapabilities,
        mode_override: SvmModeOverride,
    ) -> Self {
        Self {
            memory_manager,
            capabilities,
            mode_override,
            next_id: AtomicU64::new(1),
            inner: Mutex::new(SvmInner::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SvmInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Placement for a shared allocation on this device.
    #[must_use]
    pub const fn shared_allocation_mode(&self) -> SvmAllocationMode {
        match self.mode_override {
            SvmModeOverride::ZeroCopy => SvmAllocationMode::ZeroCopy,
            SvmModeOverride::DualStorage => SvmAllocationMode::DualStorage,
            SvmModeOverride::KmdMigrated => SvmAllocationMode::KmdMigrated,
            SvmModeOverride::Auto => {
                if self.capabilities.kmd_migration {
                    SvmAllocationMode::KmdMigrated
                } else if self.capabilities.local_memory {
                    SvmAllocationMode::DualStorage
                } else {
                    SvmAllocationMode::ZeroCopy
                }
            }
        }
    }

    fn check_request(size: usize, props: &SvmAllocationProperties) -> Result<()> {
        if size == 0 {
            return Err(XeError::invalid_argument("zero-sized unified memory allocation"));
        }
        if props.alignment != 0 && !props.alignment.is_power_of_two() {
            return Err(XeError::invalid_argument(format!(
                "alignment {} is not a power of two",
                props.alignment
            )));
        }
        Ok(())
    }

    fn check_device(&self, device: u32) -> Result<()> {
        if device >= self.memory_manager.root_device_count() {
            return Err(XeError::invalid_argument(format!("unknown device {device}")));
        }
        Ok(())
    }

    fn page_size_for(&self, memory_type: UnifiedMemoryType) -> usize {
        if self.capabilities.local_memory && memory_type != UnifiedMemoryType::Host {
            PAGE_SIZE_64K
        } else {
            PAGE_SIZE
        }
    }

    fn release(&self, owned: Vec<OwnedAllocation>) {
        for alloc in owned {
            self.memory_manager.free(alloc);
        }
    }

    /// Allocate `props_for(root)` on every root device at one reserved address.
    fn allocate_on_all_roots(
        &self,
        size: usize,
        alignment: usize,
        props_for: impl Fn(u32, u64) -> AllocationProperties,
    ) -> Result<Vec<OwnedAllocation>> {
        let base = self.memory_manager.reserve_gpu_range(size, alignment);
        let mut owned = Vec::new();
        for root in 0..self.memory_manager.root_device_count() {
            match self.memory_manager.allocate(&props_for(root, base)) {
                Ok(alloc) => owned.push(alloc),
                Err(err) => {
                    self.release(owned);
                    return Err(err);
                }
            }
        }
        Ok(owned)
    }

    fn track(
        &self,
        size: usize,
        memory_type: UnifiedMemoryType,
        mode: Option<SvmAllocationMode>,
        device: Option<u32>,
        properties: SvmAllocationProperties,
        gpu: Vec<(u32, OwnedAllocation)>,
        cpu: Option<OwnedAllocation>,
    ) -> u64 {
        let root_count = self.memory_manager.root_device_count() as usize;
        let mut gpu_allocations: Vec<Option<Arc<GraphicsAllocation>>> = vec![None; root_count];
        for (root, alloc) in &gpu {
            gpu_allocations[*root as usize] = Some(alloc.share());
        }
        let data = SvmAllocationData {
            allocation_id: self.next_id.fetch_add(1, Ordering::Relaxed),
            size,
            memory_type,
            mode,
            device,
            page_size: self.page_size_for(memory_type),
            properties,
            gpu_allocations,
            cpu_allocation: cpu.as_ref().map(OwnedAllocation::share),
        };
        let ptr = data.base_address();
        debug!(
            ptr = format_args!("{ptr:#x}"),
            size,
            ?memory_type,
            ?mode,
            allocation_id = data.allocation_id,
            "unified memory allocation created"
        );
        let mut inner = self.lock();
        if mode == Some(SvmAllocationMode::DualStorage) {
            inner.sides.insert(ptr, ResidencySide::Cpu);
        }
        inner.tracker.insert(data);
        inner.owned.insert(
            ptr,
            Ownership {
                gpu: gpu.into_iter().map(|(_, alloc)| alloc).collect(),
                cpu,
            },
        );
        ptr
    }

    /// Host allocation, zero-copy on every root device.
    pub fn create_host_alloc(&self, size: usize, props: &SvmAllocationProperties) -> Result<u64> {
        Self::check_request(size, props)?;
        let page = self.page_size_for(UnifiedMemoryType::Host);
        let reserved = align_up(size, page);
        let owned = self.allocate_on_all_roots(reserved, props.alignment.max(page), |root, base| {
            AllocationProperties::new(root, reserved, AllocationType::SvmZeroCopy).at_address(base)
        })?;
        let gpu = (0u32..).zip(owned).collect();
        Ok(self.track(
            size,
            UnifiedMemoryType::Host,
            Some(SvmAllocationMode::ZeroCopy),
            None,
            *props,
            gpu,
            None,
        ))
    }

    /// Device allocation on one root device.
    pub fn create_device_alloc(
        &self,
        size: usize,
        props: &SvmAllocationProperties,
        device: u32,
    ) -> Result<u64> {
        Self::check_request(size, props)?;
        self.check_device(device)?;
        let page = self.page_size_for(UnifiedMemoryType::Device);
        let mut alloc_props = AllocationProperties::new(device, align_up(size, page), AllocationType::SvmGpu)
            .with_alignment(props.alignment.max(page));
        if self.capabilities.local_memory {
            alloc_props = alloc_props.device_local();
        }
        let alloc = self.memory_manager.allocate(&alloc_props)?;
        Ok(self.track(
            size,
            UnifiedMemoryType::Device,
            None,
            Some(device),
            *props,
            vec![(device, alloc)],
            None,
        ))
    }

    /// Shared allocation; placement follows [`shared_allocation_mode`](Self::shared_allocation_mode).
    pub fn create_shared_alloc(
        &self,
        size: usize,
        props: &SvmAllocationProperties,
        device: Option<u32>,
    ) -> Result<u64> {
        Self::check_request(size, props)?;
        if let Some(device) = device {
            self.check_device(device)?;
        }
        let mode = self.shared_allocation_mode();
        let page = self.page_size_for(UnifiedMemoryType::Shared);
        let reserved = align_up(size, page);
        let alignment = props.alignment.max(page);

        let (gpu, cpu) = match mode {
            SvmAllocationMode::ZeroCopy => {
                let owned = self.allocate_on_all_roots(reserved, alignment, |root, base| {
                    AllocationProperties::new(root, reserved, AllocationType::SvmZeroCopy)
                        .at_address(base)
                })?;
                ((0u32..).zip(owned).collect::<Vec<_>>(), None)
            }
            SvmAllocationMode::KmdMigrated => {
                let owned = self.allocate_on_all_roots(reserved, alignment, |root, base| {
                    AllocationProperties::new(root, reserved, AllocationType::SvmGpu).at_address(base)
                })?;
                ((0u32..).zip(owned).collect::<Vec<_>>(), None)
            }
            SvmAllocationMode::DualStorage => {
                let root = device.unwrap_or(0);
                let gpu = self.memory_manager.allocate(
                    &AllocationProperties::new(root, reserved, AllocationType::SvmGpu)
                        .with_alignment(alignment)
                        .device_local(),
                )?;
                let mirror = self.memory_manager.allocate(
                    &AllocationProperties::new(root, reserved, AllocationType::SvmCpu)
                        .at_address(gpu.gpu_address())
                        .cpu_only(),
                );
                match mirror {
                    Ok(mirror) => (vec![(root, gpu)], Some(mirror)),
                    Err(err) => {
                        self.memory_manager.free(gpu);
                        return Err(err);
                    }
                }
            }
        };
        Ok(self.track(
            size,
            UnifiedMemoryType::Shared,
            Some(mode),
            device,
            *props,
            gpu,
            cpu,
        ))
    }

    /// Free the allocation whose base is `ptr`.
    ///
    /// With `blocking`, waits until every engine that referenced any backing
    /// allocation has completed that work.
    pub fn free(&self, ptr: u64, blocking: bool) -> Result<()> {
        let ownership = {
            let mut inner = self.lock();
            let Some(data) = inner.tracker.get_exact(ptr).cloned() else {
                return Err(XeError::invalid_argument(format!(
                    "{ptr:#x} is not the base of a unified memory allocation"
                )));
            };
            inner.tracker.remove(&data);
            inner.sides.remove(&ptr);
            inner.owned.remove(&ptr).unwrap_or_default()
        };
        debug!(ptr = format_args!("{ptr:#x}"), blocking, "unified memory allocation freed");
        for alloc in ownership.gpu.into_iter().chain(ownership.cpu) {
            self.memory_manager.check_gpu_usage_and_free(alloc, blocking);
        }
        Ok(())
    }

    /// Metadata for the allocation containing `ptr`.
    #[must_use]
    pub fn get_allocation_data(&self, ptr: u64) -> Option<SvmAllocationData> {
        self.lock().tracker.get(ptr).cloned()
    }

    #[must_use]
    pub fn lookup(&self, ptr: u64) -> SvmLookupResult {
        match self.lock().tracker.lookup(ptr) {
            SvmLookup::Found(data) => SvmLookupResult::Found(data.clone()),
            SvmLookup::OutOfRange { nearest } => SvmLookupResult::OutOfRange {
                nearest_base: nearest.base_address(),
                nearest_size: nearest.size,
            },
            SvmLookup::NotFound => SvmLookupResult::NotFound,
        }
    }

    #[must_use]
    pub fn num_allocs(&self) -> usize {
        self.lock().tracker.len()
    }

    /// Hand every allocation of the masked memory types on
    /// `root_device_index` to `make_resident`.
    ///
    /// Used for kernels that may dereference pointers not passed as
    /// arguments.
    pub fn make_internal_allocations_resident(
        &self,
        root_device_index: u32,
        mask: UnifiedMemoryMask,
        mut make_resident: impl FnMut(&Arc<GraphicsAllocation>),
    ) -> usize {
        if !mask.any() {
            return 0;
        }
        let selected: Vec<Arc<GraphicsAllocation>> = self
            .lock()
            .tracker
            .iter()
            .filter(|data| mask.contains(data.memory_type))
            .filter_map(|data| data.gpu_allocation(root_device_index).cloned())
            .collect();
        for alloc in &selected {
            make_resident(alloc);
        }
        selected.len()
    }

    fn dual_storage_pair(
        &self,
        ptr: u64,
    ) -> Result<Option<(Arc<GraphicsAllocation>, Arc<GraphicsAllocation>)>> {
        let inner = self.lock();
        let data = inner.tracker.get(ptr).ok_or_else(|| {
            XeError::invalid_argument(format!("{ptr:#x} is not a unified memory pointer"))
        })?;
        if data.mode != Some(SvmAllocationMode::DualStorage) {
            return Ok(None);
        }
        let gpu = data.gpu_allocations().next().cloned();
        match (gpu, data.cpu_allocation.clone()) {
            (Some(gpu), Some(cpu)) => Ok(Some((gpu, cpu))),
            _ => Err(XeError::fatal(format!(
                "dual-storage allocation {ptr:#x} is missing a backing allocation"
            ))),
        }
    }

    fn set_side(&self, ptr: u64, side: ResidencySide) {
        let mut inner = self.lock();
        if let Some(data) = inner.tracker.get(ptr) {
            let base = data.base_address();
            inner.sides.insert(base, side);
        }
    }

    /// Copy a dual-storage allocation's CPU contents to the device side.
    ///
    /// No-op for other placements.
    pub fn migrate_to_gpu(&self, ptr: u64) -> Result<()> {
        if let Some((gpu, cpu)) = self.dual_storage_pair(ptr)? {
            if self.residency_side(ptr) != Some(ResidencySide::Gpu) {
                gpu.copy_contents_from(&cpu)?;
                info!(ptr = format_args!("{ptr:#x}"), bytes = gpu.size(), "migrated to device");
            }
            self.set_side(ptr, ResidencySide::Gpu);
        }
        Ok(())
    }

    /// Copy a dual-storage allocation's device contents back to the CPU mirror.
    pub fn migrate_to_cpu(&self, ptr: u64) -> Result<()> {
        if let Some((gpu, cpu)) = self.dual_storage_pair(ptr)? {
            if self.residency_side(ptr) != Some(ResidencySide::Cpu) {
                cpu.copy_contents_from(&gpu)?;
                info!(ptr = format_args!("{ptr:#x}"), bytes = cpu.size(), "migrated to host");
            }
            self.set_side(ptr, ResidencySide::Cpu);
        }
        Ok(())
    }

    /// Current side of a dual-storage allocation.
    #[must_use]
    pub fn residency_side(&self, ptr: u64) -> Option<ResidencySide> {
        let inner = self.lock();
        let base = inner.tracker.get(ptr)?.base_address();
        inner.sides.get(&base).copied()
    }

    #[must_use]
    pub fn memory_manager(&self) -> &Arc<MemoryManager> {
        &self.memory_manager
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_manager::tests::fake_engine;
    use std::sync::atomic::Ordering as AtomicOrdering;

    fn manager(caps: SvmCapabilities, mode: SvmModeOverride) -> SvmAllocsManager {
        SvmAllocsManager::new(Arc::new(MemoryManager::new(1, 0)), caps, mode)
    }

    fn integrated() -> SvmAllocsManager {
        manager(SvmCapabilities::default(), SvmModeOverride::Auto)
    }

    #[test]
    fn interior_pointer_resolves_to_owner() {
        let svm = integrated();
        let ptr = svm.create_host_alloc(1000, &SvmAllocationProperties::default()).unwrap();
        let data = svm.get_allocation_data(ptr + 999).unwrap();
        assert_eq!(data.base_address(), ptr);
        assert_eq!(data.size, 1000);
        assert!(svm.get_allocation_data(ptr + 1000).is_none());
        assert!(svm.get_allocation_data(ptr - 1).is_none());
    }

    #[test]
    fn lookup_distinguishes_out_of_range_from_not_found() {
        let svm = integrated();
        let ptr = svm.create_device_alloc(64, &SvmAllocationProperties::default(), 0).unwrap();
        assert!(matches!(svm.lookup(ptr + 8), SvmLookupResult::Found(_)));
        match svm.lookup(ptr + 64) {
            SvmLookupResult::OutOfRange { nearest_base, nearest_size } => {
                assert_eq!(nearest_base, ptr);
                assert_eq!(nearest_size, 64);
            }
            other => panic!("expected OutOfRange, got {other:?}"),
        }
        assert!(matches!(svm.lookup(1), SvmLookupResult::NotFound));
    }

    #[test]
    fn zero_size_and_bad_alignment_are_rejected() {
        let svm = integrated();
        let props = SvmAllocationProperties::default();
        assert!(matches!(
            svm.create_shared_alloc(0, &props, None),
            Err(XeError::InvalidArgument { .. })
        ));
        let odd = SvmAllocationProperties { alignment: 3000, ..props };
        assert!(svm.create_host_alloc(64, &odd).is_err());
        assert!(svm.create_device_alloc(64, &props, 7).is_err());
        assert_eq!(svm.num_allocs(), 0);
    }

    #[test]
    fn shared_mode_follows_capabilities() {
        assert_eq!(integrated().shared_allocation_mode(), SvmAllocationMode::ZeroCopy);
        let discrete = manager(
            SvmCapabilities { local_memory: true, kmd_migration: false },
            SvmModeOverride::Auto,
        );
        assert_eq!(discrete.shared_allocation_mode(), SvmAllocationMode::DualStorage);
        let migrating = manager(
            SvmCapabilities { local_memory: true, kmd_migration: true },
            SvmModeOverride::Auto,
        );
        assert_eq!(migrating.shared_allocation_mode(), SvmAllocationMode::KmdMigrated);
        let forced = manager(
            SvmCapabilities { local_memory: true, kmd_migration: true },
            SvmModeOverride::ZeroCopy,
        );
        assert_eq!(forced.shared_allocation_mode(), SvmAllocationMode::ZeroCopy);
    }

    #[test]
    fn dual_storage_migration_copies_contents() {
        let svm = manager(
            SvmCapabilities { local_memory: true, kmd_migration: false },
            SvmModeOverride::Auto,
        );
        let ptr = svm.create_shared_alloc(256, &SvmAllocationProperties::default(), Some(0)).unwrap();
        let data = svm.get_allocation_data(ptr).unwrap();
        let gpu = Arc::clone(data.gpu_allocation(0).unwrap());
        let cpu = Arc::clone(data.cpu_allocation().unwrap());
        assert_eq!(gpu.gpu_address(), cpu.gpu_address());
        assert_eq!(gpu.cpu_address(), None);
        assert_eq!(svm.residency_side(ptr), Some(ResidencySide::Cpu));

        cpu.write_u32(16, 77).unwrap();
        svm.migrate_to_gpu(ptr).unwrap();
        assert_eq!(gpu.read_u32(16).unwrap(), 77);
        assert_eq!(svm.residency_side(ptr), Some(ResidencySide::Gpu));

        gpu.write_u32(16, 78).unwrap();
        svm.migrate_to_cpu(ptr + 8).unwrap();
        assert_eq!(cpu.read_u32(16).unwrap(), 78);
        assert_eq!(svm.residency_side(ptr), Some(ResidencySide::Cpu));

        svm.free(ptr, false).unwrap();
        assert_eq!(svm.memory_manager().stats().live_allocations, 0);
    }

    #[test]
    fn migration_is_noop_for_zero_copy() {
        let svm = integrated();
        let ptr = svm.create_shared_alloc(64, &SvmAllocationProperties::default(), None).unwrap();
        svm.migrate_to_gpu(ptr).unwrap();
        assert_eq!(svm.residency_side(ptr), None);
        assert!(svm.migrate_to_gpu(0x10).is_err());
    }

    #[test]
    fn free_requires_base_pointer() {
        let svm = integrated();
        let ptr = svm.create_host_alloc(128, &SvmAllocationProperties::default()).unwrap();
        assert!(svm.free(ptr + 4, false).is_err());
        assert_eq!(svm.num_allocs(), 1);
        svm.free(ptr, false).unwrap();
        assert_eq!(svm.num_allocs(), 0);
        assert!(svm.free(ptr, false).is_err());
    }

    #[test]
    fn blocking_free_waits_for_referencing_engines() {
        let svm = integrated();
        let mm = Arc::clone(svm.memory_manager());
        let e0 = fake_engine(&mm, 1);
        let e1 = fake_engine(&mm, 1);
        let ptr = svm.create_shared_alloc(64, &SvmAllocationProperties::default(), None).unwrap();
        let gpu = Arc::clone(svm.get_allocation_data(ptr).unwrap().gpu_allocation(0).unwrap());
        gpu.update_task_count(5, e0.id);
        gpu.update_task_count(3, e1.id);
        drop(gpu);

        svm.free(ptr, true).unwrap();

        assert_eq!(e0.waits.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(e1.waits.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(mm.stats().live_allocations, 0);
    }

    #[test]
    fn indirect_access_selects_memory_types() {
        let svm = integrated();
        let props = SvmAllocationProperties::default();
        let host = svm.create_host_alloc(64, &props).unwrap();
        let device = svm.create_device_alloc(64, &props, 0).unwrap();
        svm.create_shared_alloc(64, &props, None).unwrap();

        let mut seen = Vec::new();
        let count = svm.make_internal_allocations_resident(
            0,
            UnifiedMemoryMask { host: true, device: true, shared: false },
            |alloc| seen.push(alloc.gpu_address()),
        );
        seen.sort_unstable();
        let mut expected = vec![host, device];
        expected.sort_unstable();
        assert_eq!(count, 2);
        assert_eq!(seen, expected);
        assert_eq!(
            svm.make_internal_allocations_resident(0, UnifiedMemoryMask::default(), |_| {}),
            0
        );
    }

    #[test]
    fn allocation_failure_leaves_nothing_behind() {
        let svm = manager(
            SvmCapabilities { local_memory: true, kmd_migration: false },
            SvmModeOverride::Auto,
        );
        // First allocation (device side) succeeds, mirror fails.
        svm.memory_manager().fail_allocation_after(1);
        let err = svm
            .create_shared_alloc(64, &SvmAllocationProperties::default(), None)
            .unwrap_err();
        assert!(matches!(err, XeError::OutOfResources { .. }));
        assert_eq!(svm.num_allocs(), 0);
        assert_eq!(svm.memory_manager().stats().live_allocations, 0);
    }
}
