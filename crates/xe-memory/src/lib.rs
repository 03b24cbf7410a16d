//! GPU memory for xe-runtime.
//!
//! [`GraphicsAllocation`]s are created by the [`MemoryManager`] and owned
//! through move-only [`OwnedAllocation`] tokens. Each allocation carries
//! per-engine-context task-count stamps; an engine may recycle or free an
//! allocation only after its hardware tag passes the stamp.

pub mod allocation;
pub mod internal_storage;
pub mod memory_manager;
pub mod svm;

pub use allocation::{
    AllocationId, AllocationType, GraphicsAllocation, MAX_OS_CONTEXTS, OwnedAllocation,
};
pub use internal_storage::{AllocationUsage, InternalAllocationStorage, StorageStats};
pub use memory_manager::{AllocationProperties, EngineCompletion, MemoryManager, MemoryStats};
pub use svm::{
    AllocationTracker, ResidencySide, SvmAllocationData, SvmAllocationMode,
    SvmAllocationProperties, SvmAllocsManager, SvmCapabilities, SvmLookup, SvmLookupResult,
    UnifiedMemoryMask, UnifiedMemoryType,
};
