//! Kernel instances: mutable copies of the templates in
//! [`KernelImmutableData`] plus the geometry and surfaces of the next
//! dispatch.
//!
//! Argument binding lives in [`crate::args`]; this module owns creation,
//! group geometry and the snapshot handed to the dispatcher.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, trace};
use xe_common::math::PAGE_SIZE;
use xe_common::{PayloadWriter, Result, XeError};
use xe_memory::{
    AllocationProperties, AllocationType, GraphicsAllocation, MemoryManager, OwnedAllocation,
    UnifiedMemoryMask,
};

use crate::args::{ArgBinder, KernelArgInfo};
use crate::descriptor::{DispatchTraitOffsets, KernelDescriptor, PointerSlot, TableInfo};
use crate::group_size::{right_execution_mask, suggest_group_size, threads_per_group};
use crate::local_ids::generate_local_ids;
use crate::module::{DeviceResources, KernelImmutableData};

/// Bytes the printf buffer header occupies; the first dword holds the
/// offset of the next free byte.
pub const PRINTF_HEADER_SIZE: u32 = 4;

fn write_triple(payload: &mut PayloadWriter, offset: Option<usize>, values: [u32; 3]) -> Result<()> {
    if let Some(offset) = offset {
        for (i, value) in values.into_iter().enumerate() {
            payload.write_u32_at(offset + i * 4, value)?;
        }
    }
    Ok(())
}

fn write_pointer(payload: &mut PayloadWriter, slot: Option<PointerSlot>, address: u64) -> Result<()> {
    match slot {
        Some(slot) => payload.write_pointer_at(slot.offset, slot.size, address),
        None => Ok(()),
    }
}

/// One instance of a kernel with its own argument state.
pub struct Kernel {
    pub(crate) immutable: Arc<KernelImmutableData>,
    pub(crate) resources: DeviceResources,
    pub(crate) cross_thread_data: PayloadWriter,
    pub(crate) surface_state_heap: PayloadWriter,
    pub(crate) dynamic_state_heap: PayloadWriter,
    pub(crate) binders: Vec<ArgBinder>,
    pub(crate) arg_infos: Vec<KernelArgInfo>,
    /// Bytes requested by each SLM argument, by argument index.
    pub(crate) slm_arg_sizes: Vec<u32>,
    pub(crate) slm_total_size: u32,
    group_size: [u32; 3],
    group_count: [u32; 3],
    global_offset: [u32; 3],
    threads_per_group: u32,
    execution_mask: u32,
    per_thread_data: Vec<u8>,
    indirect_access: UnifiedMemoryMask,
    surfaces: Arc<KernelSurfaces>,
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("name", &self.name())
            .field("group_size", &self.group_size)
            .field("group_count", &self.group_count)
            .field("slm_total_size", &self.slm_total_size)
            .finish_non_exhaustive()
    }
}

impl Kernel {
    pub(crate) fn new(immutable: Arc<KernelImmutableData>, resources: &DeviceResources) -> Result<Self> {
        let descriptor = immutable.descriptor();
        let binders = descriptor.args.iter().map(ArgBinder::for_descriptor).collect();
        let arg_infos = descriptor
            .args
            .iter()
            .map(|arg| KernelArgInfo::new(arg.kind()))
            .collect();
        let arg_count = descriptor.args.len();
        let initial_group = descriptor.attributes.required_group_size.unwrap_or([1, 1, 1]);
        let slm_inline_size = descriptor.attributes.slm_inline_size;
        let cross_thread_data = PayloadWriter::from_template(immutable.cross_thread_template());
        let surface_state_heap = PayloadWriter::from_template(immutable.surface_state_template());
        let dynamic_state_heap = PayloadWriter::from_template(immutable.dynamic_state_template());

        let mut kernel = Self {
            immutable,
            resources: resources.clone(),
            cross_thread_data,
            surface_state_heap,
            dynamic_state_heap,
            binders,
            arg_infos,
            slm_arg_sizes: vec![0; arg_count],
            slm_total_size: slm_inline_size,
            group_size: [0; 3],
            group_count: [1, 1, 1],
            global_offset: [0; 3],
            threads_per_group: 0,
            execution_mask: 0,
            per_thread_data: Vec::new(),
            indirect_access: UnifiedMemoryMask::default(),
            surfaces: Arc::new(KernelSurfaces::empty(Arc::clone(&resources.memory_manager))),
        };
        kernel.allocate_implicit_surfaces()?;
        kernel.set_group_size(initial_group)?;
        kernel.set_group_count([1, 1, 1])?;
        kernel.set_work_dim(3)?;
        debug!(kernel = %kernel.name(), args = arg_count, "kernel created");
        Ok(kernel)
    }

    fn allocate_surface(&self, size: usize, allocation_type: AllocationType) -> Result<OwnedAllocation> {
        self.resources.memory_manager.allocate(&AllocationProperties::new(
            self.resources.root_device_index,
            size,
            allocation_type,
        ))
    }

    fn allocate_implicit_surfaces(&mut self) -> Result<()> {
        let immutable = Arc::clone(&self.immutable);
        let descriptor = immutable.descriptor();
        let implicit = descriptor.implicit_args;
        let mut surfaces = KernelSurfaces::empty(Arc::clone(&self.resources.memory_manager));

        let per_thread = descriptor.attributes.per_thread_private_memory_size;
        if per_thread > 0 {
            let hw = &self.resources.hw_info;
            let size = u64::from(per_thread)
                * u64::from(descriptor.attributes.simd_size)
                * u64::from(hw.threads_per_eu)
                * u64::from(hw.eu_count);
            let size = usize::try_from(size).unwrap_or(usize::MAX);
            if size > self.resources.config.max_private_memory {
                return Err(XeError::out_of_resources(
                    format!("private memory for kernel {}", descriptor.name),
                    size,
                ));
            }
            let surface = self.allocate_surface(size, AllocationType::PrivateSurface)?;
            write_pointer(&mut self.cross_thread_data, implicit.private_memory, surface.gpu_address())?;
            surfaces.private_memory = Some(surface);
        }

        if descriptor.flags.uses_printf {
            let surface = self.allocate_surface(
                self.resources.config.printf_buffer_size,
                AllocationType::PrintfSurface,
            )?;
            surface.write_u32(0, PRINTF_HEADER_SIZE)?;
            write_pointer(&mut self.cross_thread_data, implicit.printf_surface, surface.gpu_address())?;
            surfaces.printf_buffer = Some(surface);
        }

        if descriptor.flags.uses_sync_buffer {
            let surface = self.allocate_surface(PAGE_SIZE, AllocationType::SyncBuffer)?;
            write_pointer(&mut self.cross_thread_data, implicit.sync_buffer, surface.gpu_address())?;
            surfaces.sync_buffer = Some(surface);
        }

        if let Some(constants) = immutable.global_constants() {
            write_pointer(&mut self.cross_thread_data, implicit.global_constants, constants.gpu_address())?;
        }
        if let Some(variables) = immutable.global_variables() {
            write_pointer(&mut self.cross_thread_data, implicit.global_variables, variables.gpu_address())?;
        }
        self.surfaces = Arc::new(surfaces);
        Ok(())
    }

    // ── Accessors ───────────────────────────────────────────────────────────

    #[must_use]
    pub fn name(&self) -> &str {
        self.immutable.name()
    }

    #[must_use]
    pub fn descriptor(&self) -> &KernelDescriptor {
        self.immutable.descriptor()
    }

    #[must_use]
    pub const fn immutable_data(&self) -> &Arc<KernelImmutableData> {
        &self.immutable
    }

    #[must_use]
    pub fn simd_size(&self) -> u32 {
        self.descriptor().attributes.simd_size
    }

    #[must_use]
    pub const fn group_size(&self) -> [u32; 3] {
        self.group_size
    }

    #[must_use]
    pub const fn group_count(&self) -> [u32; 3] {
        self.group_count
    }

    #[must_use]
    pub const fn global_offset(&self) -> [u32; 3] {
        self.global_offset
    }

    #[must_use]
    pub const fn threads_per_group(&self) -> u32 {
        self.threads_per_group
    }

    #[must_use]
    pub const fn execution_mask(&self) -> u32 {
        self.execution_mask
    }

    #[must_use]
    pub fn cross_thread_data(&self) -> &[u8] {
        self.cross_thread_data.as_bytes()
    }

    #[must_use]
    pub fn per_thread_data(&self) -> &[u8] {
        &self.per_thread_data
    }

    #[must_use]
    pub fn surface_state_heap(&self) -> &[u8] {
        self.surface_state_heap.as_bytes()
    }

    #[must_use]
    pub fn dynamic_state_heap(&self) -> &[u8] {
        self.dynamic_state_heap.as_bytes()
    }

    #[must_use]
    pub const fn slm_total_size(&self) -> u32 {
        self.slm_total_size
    }

    #[must_use]
    pub const fn indirect_access(&self) -> UnifiedMemoryMask {
        self.indirect_access
    }

    /// Memory types the kernel may reach without an argument referencing
    /// them; the dispatcher makes those allocations resident wholesale.
    pub fn set_indirect_access(&mut self, mask: UnifiedMemoryMask) {
        self.indirect_access = mask;
    }

    #[must_use]
    pub fn has_indirect_access(&self) -> bool {
        self.descriptor().flags.has_indirect_stateless_access || self.indirect_access.any()
    }

    #[must_use]
    pub fn printf_buffer(&self) -> Option<Arc<GraphicsAllocation>> {
        self.surfaces.printf_buffer()
    }

    #[must_use]
    pub fn private_memory(&self) -> Option<Arc<GraphicsAllocation>> {
        self.surfaces.private_memory()
    }

    #[must_use]
    pub fn sync_buffer(&self) -> Option<Arc<GraphicsAllocation>> {
        self.surfaces.sync_buffer()
    }

    /// Printf or any bound allocation needs caches flushed after the walker.
    #[must_use]
    pub fn requires_dc_flush(&self) -> bool {
        self.surfaces.printf_buffer.is_some()
            || self
                .arg_infos
                .iter()
                .filter_map(|info| info.allocation.as_ref())
                .any(|alloc| alloc.requires_dc_flush())
    }

    /// Every allocation a dispatch of this kernel touches.
    #[must_use]
    pub fn residency(&self) -> Vec<Arc<GraphicsAllocation>> {
        let mut residency = self.immutable.static_residency();
        residency.extend(self.arg_infos.iter().filter_map(|info| info.allocation.clone()));
        residency.extend(self.surfaces.views());
        residency
    }

    /// Bound buffers that are compressed and reached through stateless
    /// pointers.
    #[must_use]
    pub fn aux_translation_candidates(&self) -> Vec<Arc<GraphicsAllocation>> {
        self.arg_infos
            .iter()
            .filter(|info| info.accessed_statelessly)
            .filter_map(|info| info.allocation.as_ref())
            .filter(|alloc| alloc.is_compressed())
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn requires_aux_translation(&self) -> bool {
        self.resources.config.aux_translation
            && self.resources.traits().supports_aux_translation
            && !self.aux_translation_candidates().is_empty()
    }

    // ── Group geometry ──────────────────────────────────────────────────────

    /// Largest group this kernel can run: bounded by the device limit and
    /// by the hardware threads of one subslice.
    #[must_use]
    pub fn get_max_group_size(&self) -> u32 {
        let attrs = &self.descriptor().attributes;
        if let Some(required) = attrs.required_group_size {
            return required.iter().product();
        }
        let hw = &self.resources.hw_info;
        let eus_per_subslice = (hw.eu_count / hw.subslice_count.max(1)).max(1);
        let mut threads = hw.threads_per_eu * eus_per_subslice;
        if self.descriptor().flags.requires_large_grf {
            threads /= 2;
        }
        hw.max_work_group_size.min(attrs.simd_size * threads.max(1))
    }

    pub fn set_group_size(&mut self, size: [u32; 3]) -> Result<()> {
        if size.contains(&0) {
            return Err(XeError::invalid_argument(format!(
                "kernel {}: group size {size:?} has a zero dimension",
                self.name()
            )));
        }
        let immutable = Arc::clone(&self.immutable);
        let descriptor = immutable.descriptor();
        let attrs = &descriptor.attributes;
        if let Some(required) = attrs.required_group_size
            && required != size
        {
            return Err(XeError::invalid_group_size(format!(
                "kernel {} requires group size {required:?}, got {size:?}",
                descriptor.name
            )));
        }
        let items = size.iter().map(|&d| u64::from(d)).product::<u64>();
        let max = self.get_max_group_size();
        if items > u64::from(max) {
            return Err(XeError::invalid_group_size(format!(
                "kernel {}: group of {items} work items exceeds limit {max}",
                descriptor.name
            )));
        }
        let items = items as u32;
        let traits = descriptor.dispatch_traits;
        write_triple(&mut self.cross_thread_data, traits.local_work_size, size)?;
        write_triple(&mut self.cross_thread_data, traits.enqueued_local_work_size, size)?;

        let simd = attrs.simd_size;
        self.threads_per_group = threads_per_group(items, simd);
        self.execution_mask = right_execution_mask(items, simd);
        if descriptor.requires_local_ids() && size != self.group_size {
            generate_local_ids(
                &mut self.per_thread_data,
                size,
                simd,
                attrs.num_local_id_channels,
                attrs.walk_order,
                self.resources.traits().grf_size,
            );
        }
        self.group_size = size;
        self.patch_global_size(traits)?;
        trace!(
            kernel = %descriptor.name,
            ?size,
            threads = self.threads_per_group,
            mask = self.execution_mask,
            "group size set"
        );
        Ok(())
    }

    pub fn set_group_count(&mut self, count: [u32; 3]) -> Result<()> {
        let traits = self.descriptor().dispatch_traits;
        write_triple(&mut self.cross_thread_data, traits.num_work_groups, count)?;
        self.group_count = count;
        self.patch_global_size(traits)
    }

    pub fn set_global_offset(&mut self, offset: [u32; 3]) -> Result<()> {
        let traits = self.descriptor().dispatch_traits;
        write_triple(&mut self.cross_thread_data, traits.global_work_offset, offset)?;
        self.global_offset = offset;
        Ok(())
    }

    pub fn set_work_dim(&mut self, work_dim: u32) -> Result<()> {
        if !(1..=3).contains(&work_dim) {
            return Err(XeError::invalid_argument(format!("work dimension {work_dim}")));
        }
        if let Some(offset) = self.descriptor().dispatch_traits.work_dim {
            self.cross_thread_data.write_u32_at(offset, work_dim)?;
        }
        Ok(())
    }

    fn patch_global_size(&mut self, traits: DispatchTraitOffsets) -> Result<()> {
        let global = [0, 1, 2].map(|d| self.group_size[d].saturating_mul(self.group_count[d]));
        write_triple(&mut self.cross_thread_data, traits.global_work_size, global)
    }

    /// A group size for `global` work items; the required size when the
    /// kernel declares one.
    #[must_use]
    pub fn suggest_group_size(&self, global: [u32; 3], work_dim: usize) -> [u32; 3] {
        if let Some(required) = self.descriptor().attributes.required_group_size {
            return required;
        }
        suggest_group_size(
            self.resources.config.suggest_group_size,
            global,
            work_dim,
            self.get_max_group_size(),
        )
    }

    /// Freeze the current payload for one dispatch.
    #[must_use]
    pub fn dispatch_state(&self) -> KernelDispatchState {
        let descriptor = self.descriptor();
        let attrs = &descriptor.attributes;
        KernelDispatchState {
            kernel_name: descriptor.name.clone(),
            isa_address: self.immutable.isa_allocation().gpu_address(),
            simd_size: attrs.simd_size,
            group_size: self.group_size,
            group_count: self.group_count,
            global_offset: self.global_offset,
            threads_per_group: self.threads_per_group,
            execution_mask: self.execution_mask,
            slm_size: self.slm_total_size,
            per_thread_scratch_size: attrs.per_thread_scratch_size,
            uses_barriers: descriptor.flags.uses_barriers,
            uses_printf: descriptor.flags.uses_printf,
            uses_device_side_enqueue: descriptor.flags.uses_device_side_enqueue,
            requires_large_grf: descriptor.flags.requires_large_grf,
            requires_dc_flush: self.requires_dc_flush(),
            binding_table: attrs.binding_table,
            sampler_table: attrs.sampler_table,
            dispatch_traits: descriptor.dispatch_traits,
            cross_thread_data: self.cross_thread_data.as_bytes().to_vec(),
            per_thread_data: self.per_thread_data.clone(),
            surface_state_heap: self.surface_state_heap.as_bytes().to_vec(),
            dynamic_state_heap: self.dynamic_state_heap.as_bytes().to_vec(),
            residency: self.residency(),
            indirect_access: if self.descriptor().flags.has_indirect_stateless_access {
                UnifiedMemoryMask {
                    host: true,
                    device: true,
                    shared: true,
                }
            } else {
                self.indirect_access
            },
            aux_translation: if self.requires_aux_translation() {
                self.aux_translation_candidates()
            } else {
                Vec::new()
            },
            surfaces: (!self.surfaces.is_empty()).then(|| Arc::clone(&self.surfaces)),
        }
    }
}

/// Driver-created surfaces patched into a kernel's payload: private memory,
/// printf buffer and sync buffer.
///
/// Shared between the kernel and every [`KernelDispatchState`] frozen from
/// it, so a deferred dispatch keeps them alive after the kernel is dropped.
/// The last owner frees them once no engine still uses them.
pub struct KernelSurfaces {
    memory_manager: Arc<MemoryManager>,
    private_memory: Option<OwnedAllocation>,
    printf_buffer: Option<OwnedAllocation>,
    sync_buffer: Option<OwnedAllocation>,
}

impl KernelSurfaces {
    fn empty(memory_manager: Arc<MemoryManager>) -> Self {
        Self {
            memory_manager,
            private_memory: None,
            printf_buffer: None,
            sync_buffer: None,
        }
    }

    #[must_use]
    pub fn private_memory(&self) -> Option<Arc<GraphicsAllocation>> {
        self.private_memory.as_ref().map(OwnedAllocation::share)
    }

    #[must_use]
    pub fn printf_buffer(&self) -> Option<Arc<GraphicsAllocation>> {
        self.printf_buffer.as_ref().map(OwnedAllocation::share)
    }

    #[must_use]
    pub fn sync_buffer(&self) -> Option<Arc<GraphicsAllocation>> {
        self.sync_buffer.as_ref().map(OwnedAllocation::share)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.private_memory.is_none() && self.printf_buffer.is_none() && self.sync_buffer.is_none()
    }

    fn views(&self) -> impl Iterator<Item = Arc<GraphicsAllocation>> + '_ {
        [&self.private_memory, &self.printf_buffer, &self.sync_buffer]
            .into_iter()
            .flatten()
            .map(OwnedAllocation::share)
    }

    /// Release ownership to a caller that frees the surfaces itself,
    /// typically an engine's temporary list stamped with the last task.
    #[must_use]
    pub fn into_allocations(mut self) -> Vec<OwnedAllocation> {
        self.take_all()
    }

    fn take_all(&mut self) -> Vec<OwnedAllocation> {
        [
            self.private_memory.take(),
            self.printf_buffer.take(),
            self.sync_buffer.take(),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

impl std::fmt::Debug for KernelSurfaces {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelSurfaces")
            .field("private_memory", &self.private_memory.as_ref().map(|a| a.id()))
            .field("printf_buffer", &self.printf_buffer.as_ref().map(|a| a.id()))
            .field("sync_buffer", &self.sync_buffer.as_ref().map(|a| a.id()))
            .finish_non_exhaustive()
    }
}

impl Drop for KernelSurfaces {
    fn drop(&mut self) {
        for surface in self.take_all() {
            self.memory_manager.check_gpu_usage_and_free(surface, true);
        }
    }
}

/// A kernel's payload frozen at enqueue time. Blocked commands keep one of
/// these so later argument changes do not leak into the deferred dispatch.
#[derive(Debug, Clone, Serialize)]
pub struct KernelDispatchState {
    pub kernel_name: String,
    pub isa_address: u64,
    pub simd_size: u32,
    pub group_size: [u32; 3],
    pub group_count: [u32; 3],
    pub global_offset: [u32; 3],
    pub threads_per_group: u32,
    pub execution_mask: u32,
    pub slm_size: u32,
    pub per_thread_scratch_size: u32,
    pub uses_barriers: bool,
    pub uses_printf: bool,
    pub uses_device_side_enqueue: bool,
    pub requires_large_grf: bool,
    pub requires_dc_flush: bool,
    #[serde(skip)]
    pub binding_table: Option<TableInfo>,
    #[serde(skip)]
    pub sampler_table: Option<TableInfo>,
    #[serde(skip)]
    pub dispatch_traits: DispatchTraitOffsets,
    #[serde(skip)]
    pub cross_thread_data: Vec<u8>,
    #[serde(skip)]
    pub per_thread_data: Vec<u8>,
    #[serde(skip)]
    pub surface_state_heap: Vec<u8>,
    #[serde(skip)]
    pub dynamic_state_heap: Vec<u8>,
    #[serde(skip)]
    pub residency: Vec<Arc<GraphicsAllocation>>,
    #[serde(skip)]
    pub indirect_access: UnifiedMemoryMask,
    #[serde(skip)]
    pub aux_translation: Vec<Arc<GraphicsAllocation>>,
    /// Keeps the implicit surfaces alive until the dispatch is programmed.
    #[serde(skip)]
    pub surfaces: Option<Arc<KernelSurfaces>>,
}

impl KernelDispatchState {
    /// Total work items per group.
    #[must_use]
    pub fn group_items(&self) -> u32 {
        self.group_size.iter().product()
    }

    /// Re-patch group count and offset for one walker of a split dispatch.
    pub fn set_walker_geometry(&mut self, group_count: [u32; 3], global_offset: [u32; 3]) -> Result<()> {
        let mut payload = PayloadWriter::from_template(&self.cross_thread_data);
        write_triple(&mut payload, self.dispatch_traits.num_work_groups, group_count)?;
        write_triple(&mut payload, self.dispatch_traits.global_work_offset, global_offset)?;
        self.cross_thread_data = payload.into_bytes();
        self.group_count = group_count;
        self.global_offset = global_offset;
        Ok(())
    }

    #[must_use]
    pub fn total_groups(&self) -> u64 {
        self.group_count.iter().map(|&c| u64::from(c)).product()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::Module;
    use crate::test_support::resources;

    fn read_triple(kernel: &Kernel, offset: usize) -> [u32; 3] {
        [0, 1, 2].map(|i| {
            let at = offset + i * 4;
            u32::from_le_bytes(kernel.cross_thread_data()[at..at + 4].try_into().unwrap())
        })
    }

    fn module_with(desc: KernelDescriptor) -> Module {
        Module::new(resources(), vec![desc]).unwrap()
    }

    #[test]
    fn zero_dimension_is_invalid_argument() {
        let module = module_with(KernelDescriptor::builder("k", 16).dispatch_traits().build());
        let mut kernel = module.create_kernel("k").unwrap();
        assert!(matches!(
            kernel.set_group_size([0, 1, 1]),
            Err(XeError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn oversized_group_is_rejected() {
        let module = module_with(KernelDescriptor::builder("k", 16).build());
        let mut kernel = module.create_kernel("k").unwrap();
        let max = kernel.get_max_group_size();
        assert!(matches!(
            kernel.set_group_size([max + 1, 1, 1]),
            Err(XeError::InvalidGroupSizeDimension { .. })
        ));
        kernel.set_group_size([max, 1, 1]).unwrap();
    }

    #[test]
    fn group_size_patches_local_and_global_sizes() {
        let desc = KernelDescriptor::builder("k", 16).dispatch_traits().build();
        let traits = desc.dispatch_traits;
        let module = module_with(desc);
        let mut kernel = module.create_kernel("k").unwrap();
        kernel.set_group_size([20, 2, 1]).unwrap();
        kernel.set_group_count([3, 4, 1]).unwrap();
        assert_eq!(kernel.threads_per_group(), 3);
        assert_eq!(kernel.execution_mask(), 0xFF);
        assert_eq!(read_triple(&kernel, traits.local_work_size.unwrap()), [20, 2, 1]);
        assert_eq!(read_triple(&kernel, traits.num_work_groups.unwrap()), [3, 4, 1]);
        assert_eq!(read_triple(&kernel, traits.global_work_size.unwrap()), [60, 8, 1]);
    }

    #[test]
    fn required_group_size_is_enforced() {
        let module = module_with(
            KernelDescriptor::builder("k", 8)
                .required_group_size([8, 2, 1])
                .build(),
        );
        let mut kernel = module.create_kernel("k").unwrap();
        assert_eq!(kernel.group_size(), [8, 2, 1]);
        assert_eq!(kernel.suggest_group_size([1024, 1024, 1], 2), [8, 2, 1]);
        assert!(matches!(
            kernel.set_group_size([16, 1, 1]),
            Err(XeError::InvalidGroupSizeDimension { .. })
        ));
    }

    #[test]
    fn local_ids_generated_only_when_needed() {
        let module = Module::new(
            resources(),
            vec![
                KernelDescriptor::builder("ids", 8).local_ids(3).build(),
                KernelDescriptor::builder("plain", 8).build(),
            ],
        )
        .unwrap();
        let mut ids = module.create_kernel("ids").unwrap();
        ids.set_group_size([16, 1, 1]).unwrap();
        assert_eq!(ids.per_thread_data().len(), 2 * 64);
        let mut plain = module.create_kernel("plain").unwrap();
        plain.set_group_size([16, 1, 1]).unwrap();
        assert!(plain.per_thread_data().is_empty());
    }

    #[test]
    fn implicit_surfaces_are_patched_and_freed() {
        let res = resources();
        let mm = Arc::clone(&res.memory_manager);
        let desc = KernelDescriptor::builder("k", 16)
            .printf()
            .private_memory(1024)
            .sync_buffer()
            .build();
        let implicit = desc.implicit_args;
        let module = Module::new(res, vec![desc]).unwrap();
        let kernel = module.create_kernel("k").unwrap();

        let printf = kernel.printf_buffer().unwrap();
        assert_eq!(printf.read_u32(0).unwrap(), PRINTF_HEADER_SIZE);
        let ct = kernel.cross_thread_data();
        let read = |slot: PointerSlot| u64::from_le_bytes(ct[slot.offset..slot.end()].try_into().unwrap());
        assert_eq!(read(implicit.printf_surface.unwrap()), printf.gpu_address());
        assert_eq!(
            read(implicit.private_memory.unwrap()),
            kernel.private_memory().unwrap().gpu_address()
        );
        assert_eq!(
            read(implicit.sync_buffer.unwrap()),
            kernel.sync_buffer().unwrap().gpu_address()
        );
        assert!(kernel.requires_dc_flush());
        assert_eq!(kernel.residency().len(), 4);

        let before = mm.stats().live_allocations;
        drop(kernel);
        assert_eq!(mm.stats().live_allocations, before - 3);
    }

    #[test]
    fn frozen_state_keeps_surfaces_past_the_kernel() {
        let res = resources();
        let mm = Arc::clone(&res.memory_manager);
        let module = Module::new(res, vec![KernelDescriptor::builder("k", 16).printf().build()]).unwrap();
        let kernel = module.create_kernel("k").unwrap();
        let state = kernel.dispatch_state();
        let printf = state.surfaces.as_ref().and_then(|s| s.printf_buffer()).unwrap();
        assert_eq!(printf.gpu_address(), kernel.printf_buffer().unwrap().gpu_address());

        let before = mm.stats().live_allocations;
        drop(kernel);
        assert_eq!(mm.stats().live_allocations, before);
        drop(state);
        assert_eq!(mm.stats().live_allocations, before - 1);

        let bare = module_with(KernelDescriptor::builder("b", 16).build());
        assert!(bare.create_kernel("b").unwrap().dispatch_state().surfaces.is_none());
    }

    #[test]
    fn private_memory_over_cap_is_out_of_resources() {
        let mut res = resources();
        res.config.max_private_memory = 1024;
        let module = Module::new(
            res,
            vec![KernelDescriptor::builder("k", 16).private_memory(4096).build()],
        )
        .unwrap();
        assert!(matches!(
            module.create_kernel("k"),
            Err(XeError::OutOfResources { .. })
        ));
    }

    #[test]
    fn dispatch_state_is_a_snapshot() {
        let desc = KernelDescriptor::builder("k", 16).dispatch_traits().build();
        let traits = desc.dispatch_traits;
        let module = module_with(desc);
        let mut kernel = module.create_kernel("k").unwrap();
        kernel.set_group_size([16, 1, 1]).unwrap();
        let mut state = kernel.dispatch_state();
        kernel.set_group_size([32, 1, 1]).unwrap();
        assert_eq!(state.group_size, [16, 1, 1]);
        state.set_walker_geometry([5, 1, 1], [80, 0, 0]).unwrap();
        let offset = traits.num_work_groups.unwrap();
        assert_eq!(&state.cross_thread_data[offset..offset + 4], &5u32.to_le_bytes());
        assert_eq!(state.total_groups(), 5);
    }
}
