//! Property-based tests for allocation tracking and completion-gated reuse.
//!
//! - **Tracker lookup** agrees with a brute-force scan for any pointer.
//! - **Internal storage** never hands out or frees an allocation whose
//!   stamp is above the completed tag.

use std::sync::Arc;

use proptest::prelude::*;
use xe_memory::{
    AllocationProperties, AllocationType, AllocationUsage, InternalAllocationStorage,
    MemoryManager, SvmAllocationProperties, SvmAllocsManager, SvmCapabilities,
};

// ── Tracker lookup ───────────────────────────────────────────────────

fn arb_sizes() -> impl Strategy<Value = Vec<usize>> {
    prop::collection::vec(1_usize..=20_000, 1..12)
}

proptest! {
    #[test]
    fn lookup_matches_linear_scan(sizes in arb_sizes(), offsets in prop::collection::vec(0_u64..400_000, 1..40)) {
        let svm = SvmAllocsManager::new(
            Arc::new(MemoryManager::new(1, 0)),
            SvmCapabilities::default(),
            Default::default(),
        );
        let props = SvmAllocationProperties::default();
        let ranges: Vec<(u64, usize)> = sizes
            .iter()
            .map(|size| (svm.create_device_alloc(*size, &props, 0).unwrap(), *size))
            .collect();
        let first = ranges[0].0;

        for offset in offsets {
            let ptr = first + offset;
            let expected = ranges
                .iter()
                .find(|(base, size)| ptr >= *base && ptr < base + *size as u64)
                .map(|(base, _)| *base);
            let actual = svm.get_allocation_data(ptr).map(|data| data.base_address());
            prop_assert_eq!(actual, expected);
        }
    }

    #[test]
    fn frees_keep_tracker_consistent(sizes in arb_sizes(), free_mask in prop::collection::vec(any::<bool>(), 12)) {
        let svm = SvmAllocsManager::new(
            Arc::new(MemoryManager::new(1, 0)),
            SvmCapabilities::default(),
            Default::default(),
        );
        let props = SvmAllocationProperties::default();
        let ptrs: Vec<u64> = sizes
            .iter()
            .map(|size| svm.create_shared_alloc(*size, &props, None).unwrap())
            .collect();
        let mut live = ptrs.len();
        for (ptr, free) in ptrs.iter().zip(&free_mask) {
            if *free {
                svm.free(*ptr, false).unwrap();
                live -= 1;
                prop_assert!(svm.get_allocation_data(*ptr).is_none());
            }
        }
        prop_assert_eq!(svm.num_allocs(), live);
        prop_assert_eq!(svm.memory_manager().stats().live_allocations, live);
    }
}

// ── Completion-gated reuse ───────────────────────────────────────────

proptest! {
    #[test]
    fn nothing_above_completed_tag_is_released(
        stamps in prop::collection::vec(1_u32..50, 1..20),
        completed in 0_u32..50,
    ) {
        let mm = Arc::new(MemoryManager::new(1, 0));
        let storage = InternalAllocationStorage::new(0, Arc::clone(&mm));
        for stamp in &stamps {
            let alloc = mm
                .allocate(&AllocationProperties::new(0, 4096, AllocationType::CommandBuffer))
                .unwrap();
            storage.store(alloc, AllocationUsage::Reusable, *stamp);
        }

        if let Some(reused) = storage.obtain_reusable(4096, AllocationType::CommandBuffer, completed) {
            prop_assert!(reused.task_count(0).unwrap() <= completed);
            mm.free(reused);
        }

        storage.clean_allocation_list(completed, AllocationUsage::Reusable);
        if let Some(max) = storage.max_task_count(AllocationUsage::Reusable) {
            prop_assert!(max > completed);
        }
        let pending = stamps.iter().filter(|s| **s > completed).count();
        prop_assert_eq!(storage.len(AllocationUsage::Reusable), pending);
    }
}
