//! Argument binding against real unified-memory allocations.
//!
//! - **Round trip**: the patched pointer equals the address handed in, and
//!   the owning allocation lands in the residency slot.
//! - **Null**: patches zero and clears the slot.
//! - **Untracked pointers** are rejected without disturbing earlier state.

use std::sync::Arc;

use proptest::prelude::*;
use xe_common::config::{KernelConfig, SvmModeOverride};
use xe_common::{HwInfo, XeError};
use xe_kernel::{ArgDescriptor, DeviceResources, Kernel, KernelDescriptor, Module};
use xe_memory::{MemoryManager, SvmAllocationProperties, SvmAllocsManager, SvmCapabilities};

fn resources() -> DeviceResources {
    let mm = Arc::new(MemoryManager::new(1, 0));
    let svm = Arc::new(SvmAllocsManager::new(
        Arc::clone(&mm),
        SvmCapabilities::default(),
        SvmModeOverride::Auto,
    ));
    DeviceResources::new(0, HwInfo::default(), KernelConfig::default(), mm, svm)
}

fn pointer_offset(kernel: &Kernel, index: usize) -> usize {
    match &kernel.descriptor().args[index] {
        ArgDescriptor::Pointer(ptr) => ptr.stateless.unwrap().offset,
        other => panic!("pointer expected, got {:?}", other.kind()),
    }
}

fn patched(kernel: &Kernel, index: usize) -> u64 {
    let offset = pointer_offset(kernel, index);
    u64::from_le_bytes(kernel.cross_thread_data()[offset..offset + 8].try_into().unwrap())
}

fn copy_module(res: &DeviceResources) -> Module {
    Module::new(
        res.clone(),
        vec![
            KernelDescriptor::builder("copy", 16)
                .bindful_pointer_arg()
                .pointer_arg()
                .value_arg(4)
                .dispatch_traits()
                .build(),
        ],
    )
    .unwrap()
}

// ── Buffers ──────────────────────────────────────────────────────────

#[test]
fn buffer_round_trip_patches_gpu_address() {
    let res = resources();
    let module = copy_module(&res);
    let mut kernel = module.create_kernel("copy").unwrap();
    let props = SvmAllocationProperties::default();
    let src = res.svm.create_device_alloc(4096, &props, 0).unwrap();
    let dst = res.svm.create_shared_alloc(4096, &props, Some(0)).unwrap();

    kernel.set_arg_buffer(0, Some(src)).unwrap();
    kernel.set_argument_value(1, 8, Some(&dst.to_le_bytes())).unwrap();

    assert_eq!(patched(&kernel, 0), src);
    assert_eq!(patched(&kernel, 1), dst);
    let src_alloc = res.svm.get_allocation_data(src).unwrap().gpu_allocation(0).cloned().unwrap();
    let info = kernel.arg_info(0).unwrap();
    assert!(info.is_set);
    assert_eq!(info.allocation.as_ref().map(|a| a.id()), Some(src_alloc.id()));
    assert_eq!(src_alloc.gpu_address(), src);
}

#[test]
fn bindful_buffer_gets_surface_state() {
    let res = resources();
    let module = copy_module(&res);
    let mut kernel = module.create_kernel("copy").unwrap();
    let ptr = res
        .svm
        .create_device_alloc(8192, &SvmAllocationProperties::default(), 0)
        .unwrap();

    kernel.set_arg_buffer(0, Some(ptr + 256)).unwrap();

    let ArgDescriptor::Pointer(desc) = &kernel.descriptor().args[0] else {
        panic!("pointer expected");
    };
    let state = desc.bindful.unwrap();
    let heap = kernel.surface_state_heap();
    let base = u64::from_le_bytes(heap[state..state + 8].try_into().unwrap());
    let size = u64::from_le_bytes(heap[state + 8..state + 16].try_into().unwrap());
    assert_eq!(base, ptr + 256);
    let alloc = kernel.arg_info(0).unwrap().allocation.clone().unwrap();
    assert_eq!(size, alloc.gpu_end() - (ptr + 256));
}

#[test]
fn null_pointer_clears_residency_slot() {
    let res = resources();
    let module = copy_module(&res);
    let mut kernel = module.create_kernel("copy").unwrap();
    let ptr = res
        .svm
        .create_host_alloc(4096, &SvmAllocationProperties::default())
        .unwrap();
    kernel.set_arg_buffer(1, Some(ptr)).unwrap();
    let with_arg = kernel.residency().len();

    kernel.set_argument_value(1, 8, None).unwrap();

    assert_eq!(patched(&kernel, 1), 0);
    assert!(kernel.arg_info(1).unwrap().allocation.is_none());
    assert!(kernel.arg_info(1).unwrap().is_set);
    assert_eq!(kernel.residency().len(), with_arg - 1);
}

#[test]
fn untracked_pointer_is_rejected_and_state_kept() {
    let res = resources();
    let module = copy_module(&res);
    let mut kernel = module.create_kernel("copy").unwrap();
    let ptr = res
        .svm
        .create_device_alloc(4096, &SvmAllocationProperties::default(), 0)
        .unwrap();
    kernel.set_arg_buffer(0, Some(ptr)).unwrap();

    let err = kernel.set_arg_buffer(0, Some(0xdead_0000)).unwrap_err();
    assert!(matches!(err, XeError::InvalidArgument { .. }));
    assert_eq!(patched(&kernel, 0), ptr);
    assert!(kernel.arg_info(0).unwrap().allocation.is_some());
}

#[test]
fn compressed_stateless_buffer_needs_aux_translation() {
    let res = resources();
    let module = copy_module(&res);
    let mut kernel = module.create_kernel("copy").unwrap();
    let ptr = res
        .svm
        .create_device_alloc(4096, &SvmAllocationProperties::default(), 0)
        .unwrap();
    kernel.set_arg_buffer(1, Some(ptr)).unwrap();
    assert!(!kernel.requires_aux_translation());

    kernel.arg_info(1).unwrap().allocation.as_ref().unwrap().set_compressed(true);
    assert_eq!(kernel.aux_translation_candidates().len(), 1);
    // The default device family supports aux translation.
    assert!(kernel.requires_aux_translation());
    assert_eq!(kernel.dispatch_state().aux_translation.len(), 1);
}

// ── Group size ───────────────────────────────────────────────────────

#[test]
fn group_size_errors_follow_error_taxonomy() {
    let res = resources();
    let module = copy_module(&res);
    let mut kernel = module.create_kernel("copy").unwrap();
    assert!(matches!(
        kernel.set_group_size([0, 4, 1]),
        Err(XeError::InvalidArgument { .. })
    ));
    assert!(matches!(
        kernel.set_group_size([1024, 1024, 1]),
        Err(XeError::InvalidGroupSizeDimension { .. })
    ));
}

proptest! {
    #[test]
    fn accepted_group_sizes_have_consistent_thread_counts(
        x in 1u32..=64,
        y in 1u32..=8,
        z in 1u32..=2,
    ) {
        let res = resources();
        let module = copy_module(&res);
        let mut kernel = module.create_kernel("copy").unwrap();
        let items = x * y * z;
        match kernel.set_group_size([x, y, z]) {
            Ok(()) => {
                prop_assert!(items <= kernel.get_max_group_size());
                prop_assert_eq!(kernel.threads_per_group(), items.div_ceil(16));
            }
            Err(err) => {
                prop_assert!(items > kernel.get_max_group_size());
                let is_group_error = matches!(err, XeError::InvalidGroupSizeDimension { .. });
                prop_assert!(is_group_error);
            }
        }
    }
}
