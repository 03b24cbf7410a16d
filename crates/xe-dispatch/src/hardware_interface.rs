//! Walker programming: copies each dispatch's heap templates into the
//! indirect heaps, builds its interface descriptor and returns the commands
//! that launch it.
//!
//! All heap space a task needs is reserved before the first dispatch is
//! programmed, so the heaps (and with them state base address) stay fixed for
//! the whole task.

use std::sync::Arc;

use xe_common::math::align_up;
use xe_common::{FamilyTraits, Result, WalkerKind, XeError};
use xe_csr::commands::{
    INTERFACE_DESCRIPTOR_SIZE, PostSyncOp, StateBaseAddress, TimestampKind,
};
use xe_csr::{CsrGuard, HeapType, HwCommand, IndirectHeap, InterfaceDescriptor, PipeControl, WalkerCommand};
use xe_kernel::{KernelDispatchState, TableInfo};
use xe_memory::{GraphicsAllocation, SvmAllocsManager};

use crate::dispatch_info::{DispatchInfo, DispatchKind, MultiDispatchInfo};

const SAMPLER_TABLE_ALIGNMENT: usize = 32;
const BINDING_TABLE_ENTRY_SIZE: usize = 4;

/// Where walkers get their heaps and residency from: an engine for queue
/// submissions, or a command list recording its own buffers.
pub trait DispatchTarget {
    fn indirect_heap(&mut self, heap_type: HeapType, min_size: usize) -> Result<&mut IndirectHeap>;

    fn make_resident(&mut self, allocation: &Arc<GraphicsAllocation>);
}

impl DispatchTarget for CsrGuard<'_> {
    fn indirect_heap(&mut self, heap_type: HeapType, min_size: usize) -> Result<&mut IndirectHeap> {
        self.get_indirect_heap(heap_type, min_size)
    }

    fn make_resident(&mut self, allocation: &Arc<GraphicsAllocation>) {
        CsrGuard::make_resident(self, allocation);
    }
}

/// Upper bound of heap bytes a set of dispatches consumes, alignment padding
/// included.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapRequirements {
    pub surface_state: usize,
    pub dynamic_state: usize,
    pub indirect_object: usize,
}

fn uses_table(table: Option<TableInfo>) -> bool {
    table.is_some_and(|t| t.count > 0)
}

impl HeapRequirements {
    #[must_use]
    pub fn for_state(state: &KernelDispatchState, traits: &FamilyTraits) -> Self {
        let surface_state = if uses_table(state.binding_table) {
            state.surface_state_heap.len() + traits.surface_state_alignment
        } else {
            0
        };
        let mut dynamic_state = 0;
        if uses_table(state.sampler_table) {
            dynamic_state += state.dynamic_state_heap.len() + SAMPLER_TABLE_ALIGNMENT;
        }
        if traits.walker == WalkerKind::GpgpuWalker {
            dynamic_state += INTERFACE_DESCRIPTOR_SIZE + traits.interface_descriptor_size;
        }
        let indirect_object = state.cross_thread_data.len()
            + state.per_thread_data.len()
            + traits.indirect_object_alignment;
        Self {
            surface_state,
            dynamic_state,
            indirect_object,
        }
    }

    #[must_use]
    pub fn for_dispatches(dispatches: &MultiDispatchInfo, traits: &FamilyTraits) -> Self {
        dispatches
            .iter()
            .map(|d| Self::for_state(&d.state, traits))
            .fold(Self::default(), |acc, r| Self {
                surface_state: acc.surface_state + r.surface_state,
                dynamic_state: acc.dynamic_state + r.dynamic_state,
                indirect_object: acc.indirect_object + r.indirect_object,
            })
    }

    /// Make every heap the dispatches touch large enough up front.
    pub fn reserve(&self, target: &mut impl DispatchTarget) -> Result<()> {
        for (heap_type, size) in [
            (HeapType::SurfaceState, self.surface_state),
            (HeapType::DynamicState, self.dynamic_state),
            (HeapType::IndirectObject, self.indirect_object),
        ] {
            if size > 0 {
                target.indirect_heap(heap_type, size)?;
            }
        }
        Ok(())
    }
}

/// State base address pointing at the given heaps.
#[must_use]
pub fn state_base_address(
    surface_state: Option<&IndirectHeap>,
    dynamic_state: Option<&IndirectHeap>,
    indirect_object: Option<&IndirectHeap>,
) -> StateBaseAddress {
    StateBaseAddress {
        general_state_base: 0,
        surface_state_base: surface_state.map_or(0, IndirectHeap::gpu_base),
        dynamic_state_base: dynamic_state.map_or(0, IndirectHeap::gpu_base),
        indirect_object_base: indirect_object.map_or(0, IndirectHeap::gpu_base),
        instruction_base: 0,
        dynamic_state_size: dynamic_state.map_or(0, IndirectHeap::size_in_pages),
        indirect_object_size: indirect_object.map_or(0, IndirectHeap::size_in_pages),
        instruction_size: u32::MAX,
    }
}

/// Reprogram state base address: flush, load, then invalidate the state
/// caches that hold pointers into the old heaps.
#[must_use]
pub fn state_base_address_commands(sba: StateBaseAddress) -> [HwCommand; 3] {
    [
        HwCommand::PipeControl(PipeControl::stall().with_dc_flush(true)),
        HwCommand::StateBaseAddress(sba),
        HwCommand::PipeControl(PipeControl {
            state_cache_invalidate: true,
            texture_cache_invalidate: true,
            constant_cache_invalidate: true,
            instruction_cache_invalidate: true,
            ..PipeControl::stall()
        }),
    ]
}

fn heap_offset(offset: usize) -> Result<u32> {
    u32::try_from(offset)
        .map_err(|_| XeError::fatal(format!("heap offset {offset:#x} does not fit a pointer field")))
}

/// Shift the binding table entries in `surface_state_heap` by `base`.
///
/// Entries are written relative to the template; once the template lands at
/// `base` in the surface state heap they must be relative to the heap.
pub fn rebase_binding_table(surface_state_heap: &mut [u8], table: TableInfo, base: u32) -> Result<()> {
    for index in 0..table.count as usize {
        let at = table.offset + index * BINDING_TABLE_ENTRY_SIZE;
        let entry = surface_state_heap
            .get_mut(at..at + BINDING_TABLE_ENTRY_SIZE)
            .ok_or_else(|| XeError::fatal(format!("binding table entry {index} outside surface state heap")))?;
        let relative = u32::from_le_bytes([entry[0], entry[1], entry[2], entry[3]]);
        let rebased = relative
            .checked_add(base)
            .ok_or_else(|| XeError::fatal("binding table entry overflows"))?;
        entry.copy_from_slice(&rebased.to_le_bytes());
    }
    Ok(())
}

fn program_surface_state(
    target: &mut impl DispatchTarget,
    state: &KernelDispatchState,
    traits: &FamilyTraits,
) -> Result<(u32, u32)> {
    let Some(table) = state.binding_table.filter(|t| t.count > 0) else {
        return Ok((0, 0));
    };
    let alignment = traits.surface_state_alignment;
    let heap = target.indirect_heap(
        HeapType::SurfaceState,
        state.surface_state_heap.len() + alignment,
    )?;
    let base = align_up(heap.used(), alignment);
    let mut surface_state = state.surface_state_heap.clone();
    rebase_binding_table(&mut surface_state, table, heap_offset(base)?)?;
    let offset = heap.push(&surface_state, alignment)?;
    Ok((heap_offset(offset + table.offset)?, table.count))
}

fn program_samplers(
    target: &mut impl DispatchTarget,
    state: &KernelDispatchState,
) -> Result<(u32, u32)> {
    let Some(table) = state.sampler_table.filter(|t| t.count > 0) else {
        return Ok((0, 0));
    };
    let heap = target.indirect_heap(
        HeapType::DynamicState,
        state.dynamic_state_heap.len() + SAMPLER_TABLE_ALIGNMENT,
    )?;
    let offset = heap.push(&state.dynamic_state_heap, SAMPLER_TABLE_ALIGNMENT)?;
    Ok((heap_offset(offset + table.offset)?, table.count))
}

fn timestamp_start(dispatch: &DispatchInfo) -> Vec<HwCommand> {
    dispatch
        .timestamp
        .as_ref()
        .map(|node| {
            vec![
                HwCommand::StoreTimestamp {
                    address: node.context_start_address(),
                    kind: TimestampKind::Context,
                },
                HwCommand::StoreTimestamp {
                    address: node.global_start_address(),
                    kind: TimestampKind::Global,
                },
            ]
        })
        .unwrap_or_default()
}

fn timestamp_end(dispatch: &DispatchInfo) -> Vec<HwCommand> {
    dispatch
        .timestamp
        .as_ref()
        .map(|node| {
            [node.global_end_address(), node.context_end_address()]
                .into_iter()
                .map(|address| {
                    HwCommand::PipeControl(
                        PipeControl::stall().with_post_sync(PostSyncOp::WriteTimestamp { address }),
                    )
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Program one walker: heaps, descriptor, timestamps and residency.
pub fn program_dispatch(
    target: &mut impl DispatchTarget,
    dispatch: &DispatchInfo,
    traits: &FamilyTraits,
) -> Result<Vec<HwCommand>> {
    let state = &dispatch.state;
    let (binding_table_pointer, binding_table_entry_count) =
        program_surface_state(target, state, traits)?;
    let (sampler_state_pointer, sampler_count) = program_samplers(target, state)?;

    let mut payload = Vec::with_capacity(state.cross_thread_data.len() + state.per_thread_data.len());
    payload.extend_from_slice(&state.cross_thread_data);
    payload.extend_from_slice(&state.per_thread_data);
    let indirect_heap = target.indirect_heap(
        HeapType::IndirectObject,
        payload.len() + traits.indirect_object_alignment,
    )?;
    let indirect_data_start = heap_offset(indirect_heap.push(&payload, traits.indirect_object_alignment)?)?;

    let threads = state.threads_per_group.max(1);
    let descriptor = InterfaceDescriptor {
        kernel_start_pointer: state.isa_address,
        binding_table_pointer,
        binding_table_entry_count,
        sampler_state_pointer,
        sampler_count,
        threads_in_group: state.threads_per_group,
        slm_size: state.slm_size,
        cross_thread_data_length: heap_offset(state.cross_thread_data.len())?,
        per_thread_data_length: heap_offset(state.per_thread_data.len() / threads as usize)?,
        barrier_enable: state.uses_barriers,
        large_grf: state.requires_large_grf && traits.supports_large_grf,
        denorm_mode: false,
    };

    let mut commands = timestamp_start(dispatch);
    let inline_descriptor = match traits.walker {
        WalkerKind::GpgpuWalker => {
            let heap = target.indirect_heap(
                HeapType::DynamicState,
                INTERFACE_DESCRIPTOR_SIZE + traits.interface_descriptor_size,
            )?;
            let offset = heap.push(&descriptor.to_bytes(), traits.interface_descriptor_size)?;
            commands.push(HwCommand::InterfaceDescriptorLoad {
                offset: heap_offset(offset)?,
                length: heap_offset(INTERFACE_DESCRIPTOR_SIZE)?,
            });
            None
        }
        WalkerKind::ComputeWalker => Some(descriptor),
    };
    commands.push(HwCommand::Walker(WalkerCommand {
        kind: traits.walker,
        indirect_data_start,
        indirect_data_length: heap_offset(payload.len())?,
        interface_descriptor_offset: 0,
        simd_size: state.simd_size,
        threads_per_group: state.threads_per_group,
        right_execution_mask: state.execution_mask,
        group_id_start: [0; 3],
        group_count: state.group_count,
        emit_local_ids: false,
        inline_descriptor,
    }));
    commands.extend(timestamp_end(dispatch));

    for allocation in &state.residency {
        target.make_resident(allocation);
    }
    if let Some(node) = &dispatch.timestamp {
        target.make_resident(node.allocation());
    }
    Ok(commands)
}

/// Program every walker of `dispatches` in order.
///
/// A cache-flushing stall separates translation passes from the kernel so the
/// kernel never reads a buffer mid-resolve.
pub fn program_dispatches(
    target: &mut impl DispatchTarget,
    dispatches: &MultiDispatchInfo,
    traits: &FamilyTraits,
    svm: &SvmAllocsManager,
    root_device_index: u32,
) -> Result<Vec<HwCommand>> {
    HeapRequirements::for_dispatches(dispatches, traits).reserve(target)?;
    let mut commands = Vec::new();
    let mut previous: Option<DispatchKind> = None;
    for dispatch in dispatches.iter() {
        if let Some(kind) = previous
            && kind != dispatch.kind
        {
            commands.push(HwCommand::PipeControl(PipeControl::stall().with_dc_flush(true)));
        }
        commands.extend(program_dispatch(target, dispatch, traits)?);
        svm.make_internal_allocations_resident(root_device_index, dispatch.state.indirect_access, |a| {
            target.make_resident(a);
        });
        previous = Some(dispatch.kind);
    }
    Ok(commands)
}

/// Encoded size of `commands`.
#[must_use]
pub fn encoded_size(commands: &[HwCommand]) -> usize {
    commands.iter().map(HwCommand::encoded_size).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_table_entries_move_with_the_template() {
        let table = TableInfo { offset: 128, count: 2 };
        let mut heap = vec![0u8; 136];
        heap[128..132].copy_from_slice(&0u32.to_le_bytes());
        heap[132..136].copy_from_slice(&64u32.to_le_bytes());

        rebase_binding_table(&mut heap, table, 192).unwrap();

        assert_eq!(u32::from_le_bytes(heap[128..132].try_into().unwrap()), 192);
        assert_eq!(u32::from_le_bytes(heap[132..136].try_into().unwrap()), 256);
    }

    #[test]
    fn truncated_binding_table_is_fatal() {
        let table = TableInfo { offset: 0, count: 3 };
        let mut heap = vec![0u8; 8];
        let err = rebase_binding_table(&mut heap, table, 64).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn descriptor_space_only_for_descriptor_loads() {
        let state = xe_kernel::KernelDispatchState {
            cross_thread_data: vec![0; 64],
            per_thread_data: vec![0; 128],
            ..test_state()
        };
        let gen12 = xe_common::family_traits(xe_common::HwFamily::Gen12Lp);
        let hpg = xe_common::family_traits(xe_common::HwFamily::XeHpg);
        let with_load = HeapRequirements::for_state(&state, gen12);
        let inline = HeapRequirements::for_state(&state, hpg);
        assert!(with_load.dynamic_state >= INTERFACE_DESCRIPTOR_SIZE);
        assert_eq!(inline.dynamic_state, 0);
        assert_eq!(inline.surface_state, 0);
        assert!(inline.indirect_object >= 192);
    }

    fn test_state() -> KernelDispatchState {
        KernelDispatchState {
            kernel_name: "k".into(),
            isa_address: 0,
            simd_size: 16,
            group_size: [16, 1, 1],
            group_count: [1, 1, 1],
            global_offset: [0; 3],
            threads_per_group: 1,
            execution_mask: 0xffff,
            slm_size: 0,
            per_thread_scratch_size: 0,
            uses_barriers: false,
            uses_printf: false,
            uses_device_side_enqueue: false,
            requires_large_grf: false,
            requires_dc_flush: false,
            binding_table: None,
            sampler_table: None,
            dispatch_traits: Default::default(),
            cross_thread_data: Vec::new(),
            per_thread_data: Vec::new(),
            surface_state_heap: Vec::new(),
            dynamic_state_heap: Vec::new(),
            residency: Vec::new(),
            indirect_access: Default::default(),
            aux_translation: Vec::new(),
            surfaces: None,
        }
    }
}
