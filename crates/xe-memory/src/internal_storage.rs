//! Completion-gated lists of driver-internal allocations.
//!
//! An engine never frees an allocation the GPU may still read. Retired
//! command buffers and heaps go to the REUSABLE list, per-submission scratch
//! to the TEMPORARY list; both are stamped with the task count that last
//! referenced them and only released (or handed out again) once the engine's
//! tag has passed that stamp.

use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tracing::debug;
use xe_common::{ContextId, TaskCount};

use crate::allocation::{AllocationType, OwnedAllocation};
use crate::memory_manager::MemoryManager;

/// Which internal list an allocation is stored on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AllocationUsage {
    Reusable,
    Temporary,
}

/// Counters exposed for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StorageStats {
    pub stored: u64,
    pub reuse_hits: u64,
    pub reuse_misses: u64,
    pub released: u64,
}

#[derive(Default)]
struct StorageInner {
    reusable: Vec<OwnedAllocation>,
    temporary: Vec<OwnedAllocation>,
    stats: StorageStats,
}

impl StorageInner {
    fn list_mut(&mut self, usage: AllocationUsage) -> &mut Vec<OwnedAllocation> {
        match usage {
            AllocationUsage::Reusable => &mut self.reusable,
            AllocationUsage::Temporary => &mut self.temporary,
        }
    }
}

/// REUSABLE and TEMPORARY lists for one engine context.
pub struct InternalAllocationStorage {
    context_id: ContextId,
    memory_manager: Arc<MemoryManager>,
    inner: Mutex<StorageInner>,
}

impl std::fmt::Debug for InternalAllocationStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InternalAllocationStorage")
            .field("context_id", &self.context_id)
            .field("reusable", &self.len(AllocationUsage::Reusable))
            .field("temporary", &self.len(AllocationUsage::Temporary))
            .finish()
    }
}

impl InternalAllocationStorage {
    #[must_use]
    pub fn new(context_id: ContextId, memory_manager: Arc<MemoryManager>) -> Self {
        Self {
            context_id,
            memory_manager,
            inner: Mutex::new(StorageInner::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StorageInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Put `allocation` on a list, stamped with `task_count` on this context.
    ///
    /// An existing later stamp is kept.
    pub fn store(&self, allocation: OwnedAllocation, usage: AllocationUsage, task_count: TaskCount) {
        let stamp = allocation
            .task_count(self.context_id)
            .map_or(task_count, |current| current.max(task_count));
        allocation.update_task_count(stamp, self.context_id);
        debug!(
            id = %allocation.id(),
            ?usage,
            task_count = stamp,
            context_id = self.context_id,
            "allocation stored for deferred release"
        );
        let mut inner = self.lock();
        inner.stats.stored += 1;
        inner.list_mut(usage).push(allocation);
    }

    /// Detach the first REUSABLE allocation of `allocation_type` that is at
    /// least `min_size` bytes and whose stamp has retired.
    pub fn obtain_reusable(
        &self,
        min_size: usize,
        allocation_type: AllocationType,
        completed: TaskCount,
    ) -> Option<OwnedAllocation> {
        let mut inner = self.lock();
        let context_id = self.context_id;
        let position = inner.reusable.iter().position(|alloc| {
            alloc.allocation_type() == allocation_type
                && alloc.size() >= min_size
                && alloc.task_count(context_id).is_none_or(|tc| tc <= completed)
        });
        match position {
            Some(index) => {
                inner.stats.reuse_hits += 1;
                let alloc = inner.reusable.swap_remove(index);
                debug!(id = %alloc.id(), size = alloc.size(), %allocation_type, "reusing allocation");
                Some(alloc)
            }
            None => {
                inner.stats.reuse_misses += 1;
                None
            }
        }
    }

    /// Free every allocation on `usage` whose stamp is at or below `completed`.
    ///
    /// Returns the number of allocations released.
    pub fn clean_allocation_list(&self, completed: TaskCount, usage: AllocationUsage) -> usize {
        let context_id = self.context_id;
        let retired: Vec<OwnedAllocation> = {
            let mut inner = self.lock();
            let list = inner.list_mut(usage);
            let mut retired = Vec::new();
            let mut index = 0;
            while index < list.len() {
                if list[index].task_count(context_id).is_none_or(|tc| tc <= completed) {
                    retired.push(list.swap_remove(index));
                } else {
                    index += 1;
                }
            }
            inner.stats.released += retired.len() as u64;
            retired
        };
        let released = retired.len();
        for alloc in retired {
            alloc.release_usage(context_id);
            self.memory_manager.free(alloc);
        }
        if released > 0 {
            debug!(?usage, completed, released, context_id, "allocation list cleaned");
        }
        released
    }

    /// Detach everything on `usage` regardless of stamps.
    pub fn take_all(&self, usage: AllocationUsage) -> Vec<OwnedAllocation> {
        std::mem::take(self.lock().list_mut(usage))
    }

    #[must_use]
    pub fn len(&self, usage: AllocationUsage) -> usize {
        let mut inner = self.lock();
        inner.list_mut(usage).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len(AllocationUsage::Reusable) == 0 && self.len(AllocationUsage::Temporary) == 0
    }

    /// Highest stamp on `usage`, if any allocation is stored.
    #[must_use]
    pub fn max_task_count(&self, usage: AllocationUsage) -> Option<TaskCount> {
        let context_id = self.context_id;
        let mut inner = self.lock();
        inner
            .list_mut(usage)
            .iter()
            .filter_map(|alloc| alloc.task_count(context_id))
            .max()
    }

    #[must_use]
    pub fn stats(&self) -> StorageStats {
        self.lock().stats.clone()
    }

    #[must_use]
    pub const fn context_id(&self) -> ContextId {
        self.context_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_manager::AllocationProperties;

    fn setup() -> (Arc<MemoryManager>, InternalAllocationStorage) {
        let mm = Arc::new(MemoryManager::new(1, 0));
        let storage = InternalAllocationStorage::new(0, Arc::clone(&mm));
        (mm, storage)
    }

    fn command_buffer(mm: &MemoryManager, size: usize) -> OwnedAllocation {
        mm.allocate(&AllocationProperties::new(0, size, AllocationType::CommandBuffer))
            .unwrap()
    }

    #[test]
    fn reuse_requires_retired_stamp() {
        let (mm, storage) = setup();
        let cb = command_buffer(&mm, 4096);
        let id = cb.id();
        storage.store(cb, AllocationUsage::Reusable, 5);

        assert!(storage.obtain_reusable(4096, AllocationType::CommandBuffer, 4).is_none());
        let reused = storage
            .obtain_reusable(4096, AllocationType::CommandBuffer, 5)
            .unwrap();
        assert_eq!(reused.id(), id);
        assert!(storage.is_empty());
        let stats = storage.stats();
        assert_eq!((stats.reuse_hits, stats.reuse_misses), (1, 1));
    }

    #[test]
    fn reuse_matches_type_and_size() {
        let (mm, storage) = setup();
        storage.store(command_buffer(&mm, 4096), AllocationUsage::Reusable, 1);
        assert!(storage.obtain_reusable(8192, AllocationType::CommandBuffer, 10).is_none());
        assert!(storage.obtain_reusable(1024, AllocationType::SurfaceStateHeap, 10).is_none());
        assert!(storage.obtain_reusable(1024, AllocationType::CommandBuffer, 10).is_some());
    }

    #[test]
    fn store_keeps_later_stamp() {
        let (mm, storage) = setup();
        let cb = command_buffer(&mm, 4096);
        cb.update_task_count(9, 0);
        storage.store(cb, AllocationUsage::Temporary, 3);
        assert_eq!(storage.max_task_count(AllocationUsage::Temporary), Some(9));
    }

    #[test]
    fn clean_frees_only_completed() {
        let (mm, storage) = setup();
        storage.store(command_buffer(&mm, 4096), AllocationUsage::Temporary, 2);
        storage.store(command_buffer(&mm, 4096), AllocationUsage::Temporary, 4);
        storage.store(command_buffer(&mm, 4096), AllocationUsage::Temporary, 6);
        assert_eq!(mm.stats().live_allocations, 3);

        assert_eq!(storage.clean_allocation_list(4, AllocationUsage::Temporary), 2);
        assert_eq!(storage.len(AllocationUsage::Temporary), 1);
        assert_eq!(mm.stats().live_allocations, 1);

        assert_eq!(storage.clean_allocation_list(4, AllocationUsage::Reusable), 0);
        assert_eq!(storage.clean_allocation_list(6, AllocationUsage::Temporary), 1);
        assert_eq!(mm.stats().live_allocations, 0);
    }

    #[test]
    fn lists_are_independent() {
        let (mm, storage) = setup();
        storage.store(command_buffer(&mm, 4096), AllocationUsage::Reusable, 1);
        storage.store(command_buffer(&mm, 4096), AllocationUsage::Temporary, 1);
        assert_eq!(storage.clean_allocation_list(1, AllocationUsage::Temporary), 1);
        assert_eq!(storage.len(AllocationUsage::Reusable), 1);
        let taken = storage.take_all(AllocationUsage::Reusable);
        assert_eq!(taken.len(), 1);
        for alloc in taken {
            mm.free(alloc);
        }
        assert!(storage.is_empty());
    }
}
