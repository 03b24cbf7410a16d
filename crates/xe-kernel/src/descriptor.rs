//! Kernel metadata as produced by the compiler backend.
//!
//! A [`KernelDescriptor`] is consumed, never produced, by the runtime: it
//! says where in cross-thread data and the state heaps each argument and
//! implicit value lives. Every offset is a byte offset into the named
//! buffer.

use serde::{Deserialize, Serialize};
use xe_common::math::align_up;
use xe_common::{Result, XeError};

/// Size of one surface state record in descriptor-built heap templates.
pub const SURFACE_STATE_SIZE: usize = 64;
/// Size of one sampler state record in descriptor-built heap templates.
pub const SAMPLER_STATE_SIZE: usize = 16;

const CROSS_THREAD_ALIGNMENT: usize = 32;

/// A pointer-sized slot: 4 or 8 bytes wide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointerSlot {
    pub offset: usize,
    pub size: usize,
}

impl PointerSlot {
    #[must_use]
    pub const fn u64(offset: usize) -> Self {
        Self { offset, size: 8 }
    }

    #[must_use]
    pub const fn end(&self) -> usize {
        self.offset + self.size
    }
}

/// Bindless surface: state lives at `heap_offset` in the surface-state heap
/// and the kernel reads that offset from `cross_thread_offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindlessSlot {
    pub cross_thread_offset: usize,
    pub heap_offset: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressSpace {
    #[default]
    Global,
    Constant,
    /// Shared local memory; the slot receives an SLM offset.
    Local,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ArgDescPointer {
    pub address_space: AddressSpace,
    pub stateless: Option<PointerSlot>,
    /// Offset of the buffer surface state in the surface-state heap.
    pub bindful: Option<usize>,
    pub bindless: Option<BindlessSlot>,
    pub required_slm_alignment: u32,
}

impl ArgDescPointer {
    #[must_use]
    pub const fn is_slm(&self) -> bool {
        matches!(self.address_space, AddressSpace::Local)
    }

    #[must_use]
    pub const fn accessed_statelessly(&self) -> bool {
        self.stateless.is_some()
    }
}

/// Cross-thread slots receiving image metadata; all values are `u32`
/// except `flat_base_offset`, a 64-bit GPU address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageMetadataOffsets {
    pub width: Option<usize>,
    pub height: Option<usize>,
    pub depth: Option<usize>,
    pub channel_data_type: Option<usize>,
    pub channel_order: Option<usize>,
    pub row_pitch: Option<usize>,
    pub slice_pitch: Option<usize>,
    pub num_mip_levels: Option<usize>,
    pub flat_base_offset: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ArgDescImage {
    pub bindful: Option<usize>,
    pub bindless: Option<BindlessSlot>,
    pub metadata: ImageMetadataOffsets,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerMetadataOffsets {
    pub addressing_mode: Option<usize>,
    pub normalized_coords: Option<usize>,
    pub snap_workaround: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ArgDescSampler {
    /// Offset of the sampler state in the dynamic-state heap.
    pub bindful: Option<usize>,
    pub metadata: SamplerMetadataOffsets,
}

/// One contiguous piece of a by-value argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueElement {
    /// Offset within the caller's value.
    pub source_offset: usize,
    pub size: usize,
    /// Offset within cross-thread data.
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ArgDescValue {
    pub elements: Vec<ValueElement>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArgDescriptor {
    Pointer(ArgDescPointer),
    Image(ArgDescImage),
    Sampler(ArgDescSampler),
    Value(ArgDescValue),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgKind {
    Pointer,
    Image,
    Sampler,
    Value,
}

impl ArgDescriptor {
    #[must_use]
    pub const fn kind(&self) -> ArgKind {
        match self {
            Self::Pointer(_) => ArgKind::Pointer,
            Self::Image(_) => ArgKind::Image,
            Self::Sampler(_) => ArgKind::Sampler,
            Self::Value(_) => ArgKind::Value,
        }
    }
}

/// Cross-thread slots for dispatch geometry. Triples are three consecutive
/// `u32`s; `work_dim` is a single `u32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchTraitOffsets {
    pub local_work_size: Option<usize>,
    pub enqueued_local_work_size: Option<usize>,
    pub global_work_size: Option<usize>,
    pub num_work_groups: Option<usize>,
    pub global_work_offset: Option<usize>,
    pub work_dim: Option<usize>,
}

/// Cross-thread slots for surfaces the runtime supplies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ImplicitArgOffsets {
    pub global_constants: Option<PointerSlot>,
    pub global_variables: Option<PointerSlot>,
    pub private_memory: Option<PointerSlot>,
    pub printf_surface: Option<PointerSlot>,
    pub sync_buffer: Option<PointerSlot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelFlags {
    pub uses_printf: bool,
    pub uses_barriers: bool,
    pub uses_sync_buffer: bool,
    pub uses_device_side_enqueue: bool,
    pub uses_global_atomics: bool,
    pub requires_large_grf: bool,
    /// The kernel may dereference pointers it was not given as arguments.
    pub has_indirect_stateless_access: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    pub offset: usize,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelAttributes {
    pub simd_size: u32,
    pub required_group_size: Option<[u32; 3]>,
    /// SLM declared inside the kernel body, placed before SLM arguments.
    pub slm_inline_size: u32,
    pub per_thread_private_memory_size: u32,
    pub per_thread_scratch_size: u32,
    pub cross_thread_data_size: usize,
    /// Local-ID channels the kernel reads (0 to 3).
    pub num_local_id_channels: u32,
    /// Dimension order in which local IDs are walked, fastest first.
    pub walk_order: [u8; 3],
    pub binding_table: Option<TableInfo>,
    pub sampler_table: Option<TableInfo>,
}

impl Default for KernelAttributes {
    fn default() -> Self {
        Self {
            simd_size: 16,
            required_group_size: None,
            slm_inline_size: 0,
            per_thread_private_memory_size: 0,
            per_thread_scratch_size: 0,
            cross_thread_data_size: 0,
            num_local_id_channels: 0,
            walk_order: [0, 1, 2],
            binding_table: None,
            sampler_table: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KernelDescriptor {
    pub name: String,
    #[serde(default)]
    pub attributes: KernelAttributes,
    #[serde(default)]
    pub flags: KernelFlags,
    #[serde(default)]
    pub args: Vec<ArgDescriptor>,
    #[serde(default)]
    pub dispatch_traits: DispatchTraitOffsets,
    #[serde(default)]
    pub implicit_args: ImplicitArgOffsets,
    #[serde(default)]
    pub isa: Vec<u8>,
    #[serde(default)]
    pub debug_data: Option<Vec<u8>>,
    #[serde(default)]
    pub cross_thread_data: Vec<u8>,
    #[serde(default)]
    pub surface_state_heap: Vec<u8>,
    #[serde(default)]
    pub dynamic_state_heap: Vec<u8>,
}

fn check_slot(name: &str, offset: usize, size: usize, limit: usize) -> Result<()> {
    if offset.checked_add(size).is_none_or(|end| end > limit) {
        return Err(XeError::invalid_argument(format!(
            "{name} slot [{offset}, +{size}) exceeds buffer of {limit} bytes"
        )));
    }
    Ok(())
}

fn check_pointer_slot(name: &str, slot: PointerSlot, limit: usize) -> Result<()> {
    if slot.size != 4 && slot.size != 8 {
        return Err(XeError::invalid_argument(format!(
            "{name} pointer slot has width {}",
            slot.size
        )));
    }
    check_slot(name, slot.offset, slot.size, limit)
}

impl KernelDescriptor {
    #[must_use]
    pub fn builder(name: impl Into<String>, simd_size: u32) -> KernelDescriptorBuilder {
        KernelDescriptorBuilder::new(name, simd_size)
    }

    #[must_use]
    pub const fn requires_local_ids(&self) -> bool {
        self.attributes.num_local_id_channels > 0
    }

    /// Reject descriptors whose offsets would write outside their buffers.
    pub fn validate(&self) -> Result<()> {
        let attrs = &self.attributes;
        if !matches!(attrs.simd_size, 1 | 8 | 16 | 32) {
            return Err(XeError::invalid_argument(format!(
                "kernel {}: unsupported SIMD width {}",
                self.name, attrs.simd_size
            )));
        }
        if attrs.num_local_id_channels > 3 {
            return Err(XeError::invalid_argument(format!(
                "kernel {}: {} local-id channels",
                self.name, attrs.num_local_id_channels
            )));
        }
        let mut order = attrs.walk_order;
        order.sort_unstable();
        if order != [0, 1, 2] {
            return Err(XeError::invalid_argument(format!(
                "kernel {}: walk order {:?} is not a permutation",
                self.name, attrs.walk_order
            )));
        }
        if attrs.required_group_size.is_some_and(|size| size.contains(&0)) {
            return Err(XeError::invalid_argument(format!(
                "kernel {}: zero required group size",
                self.name
            )));
        }

        let ct = attrs.cross_thread_data_size;
        let ssh = self.surface_state_heap.len();
        let dsh = self.dynamic_state_heap.len();
        if let Some(table) = attrs.binding_table {
            check_slot("binding table", table.offset, table.count as usize * 4, ssh)?;
        }
        if let Some(table) = attrs.sampler_table {
            check_slot(
                "sampler table",
                table.offset,
                table.count as usize * SAMPLER_STATE_SIZE,
                dsh,
            )?;
        }
        let traits = &self.dispatch_traits;
        for (name, slot) in [
            ("local_work_size", traits.local_work_size),
            ("enqueued_local_work_size", traits.enqueued_local_work_size),
            ("global_work_size", traits.global_work_size),
            ("num_work_groups", traits.num_work_groups),
            ("global_work_offset", traits.global_work_offset),
        ] {
            if let Some(offset) = slot {
                check_slot(name, offset, 12, ct)?;
            }
        }
        if let Some(offset) = traits.work_dim {
            check_slot("work_dim", offset, 4, ct)?;
        }
        let implicit = &self.implicit_args;
        for (name, slot) in [
            ("global_constants", implicit.global_constants),
            ("global_variables", implicit.global_variables),
            ("private_memory", implicit.private_memory),
            ("printf_surface", implicit.printf_surface),
            ("sync_buffer", implicit.sync_buffer),
        ] {
            if let Some(slot) = slot {
                check_pointer_slot(name, slot, ct)?;
            }
        }

        for (index, arg) in self.args.iter().enumerate() {
            let name = format!("{} arg {index}", self.name);
            match arg {
                ArgDescriptor::Pointer(ptr) => {
                    if let Some(slot) = ptr.stateless {
                        check_pointer_slot(&name, slot, ct)?;
                    }
                    if let Some(offset) = ptr.bindful {
                        check_slot(&name, offset, SURFACE_STATE_SIZE, ssh)?;
                    }
                    if let Some(slot) = ptr.bindless {
                        check_slot(&name, slot.cross_thread_offset, 4, ct)?;
                        check_slot(&name, slot.heap_offset, SURFACE_STATE_SIZE, ssh)?;
                    }
                    if ptr.required_slm_alignment != 0
                        && !ptr.required_slm_alignment.is_power_of_two()
                    {
                        return Err(XeError::invalid_argument(format!(
                            "{name}: SLM alignment {} is not a power of two",
                            ptr.required_slm_alignment
                        )));
                    }
                }
                ArgDescriptor::Image(image) => {
                    if let Some(offset) = image.bindful {
                        check_slot(&name, offset, SURFACE_STATE_SIZE, ssh)?;
                    }
                    if let Some(slot) = image.bindless {
                        check_slot(&name, slot.cross_thread_offset, 4, ct)?;
                        check_slot(&name, slot.heap_offset, SURFACE_STATE_SIZE, ssh)?;
                    }
                    let meta = &image.metadata;
                    for offset in [
                        meta.width,
                        meta.height,
                        meta.depth,
                        meta.channel_data_type,
                        meta.channel_order,
                        meta.row_pitch,
                        meta.slice_pitch,
                        meta.num_mip_levels,
                    ]
                    .into_iter()
                    .flatten()
                    {
                        check_slot(&name, offset, 4, ct)?;
                    }
                    if let Some(offset) = meta.flat_base_offset {
                        check_slot(&name, offset, 8, ct)?;
                    }
                }
                ArgDescriptor::Sampler(sampler) => {
                    if let Some(offset) = sampler.bindful {
                        check_slot(&name, offset, SAMPLER_STATE_SIZE, dsh)?;
                    }
                    let meta = &sampler.metadata;
                    for offset in [meta.addressing_mode, meta.normalized_coords, meta.snap_workaround]
                        .into_iter()
                        .flatten()
                    {
                        check_slot(&name, offset, 4, ct)?;
                    }
                }
                ArgDescriptor::Value(value) => {
                    for element in &value.elements {
                        check_slot(&name, element.offset, element.size, ct)?;
                    }
                }
            }
        }
        Ok(())
    }
}

// ── Builder ─────────────────────────────────────────────────────────────────

/// Lays out a descriptor slot by slot; used by tools and tests that need a
/// kernel without a compiler.
#[derive(Debug, Clone)]
pub struct KernelDescriptorBuilder {
    descriptor: KernelDescriptor,
    next_offset: usize,
}

impl KernelDescriptorBuilder {
    fn new(name: impl Into<String>, simd_size: u32) -> Self {
        Self {
            descriptor: KernelDescriptor {
                name: name.into(),
                attributes: KernelAttributes {
                    simd_size,
                    ..KernelAttributes::default()
                },
                ..KernelDescriptor::default()
            },
            next_offset: 0,
        }
    }

    fn reserve(&mut self, size: usize, alignment: usize) -> usize {
        let offset = align_up(self.next_offset, alignment);
        self.next_offset = offset + size;
        offset
    }

    fn reserve_surface_state(&mut self) -> usize {
        let offset = self.descriptor.surface_state_heap.len();
        self.descriptor
            .surface_state_heap
            .resize(offset + SURFACE_STATE_SIZE, 0);
        let table = self
            .descriptor
            .attributes
            .binding_table
            .get_or_insert(TableInfo { offset: 0, count: 0 });
        table.count += 1;
        offset
    }

    /// Global buffer passed as a 64-bit stateless pointer.
    #[must_use]
    pub fn pointer_arg(mut self) -> Self {
        let slot = PointerSlot::u64(self.reserve(8, 8));
        self.descriptor.args.push(ArgDescriptor::Pointer(ArgDescPointer {
            stateless: Some(slot),
            ..ArgDescPointer::default()
        }));
        self
    }

    /// Global buffer with both a stateless pointer and a bindful surface state.
    #[must_use]
    pub fn bindful_pointer_arg(mut self) -> Self {
        let slot = PointerSlot::u64(self.reserve(8, 8));
        let bindful = self.reserve_surface_state();
        self.descriptor.args.push(ArgDescriptor::Pointer(ArgDescPointer {
            stateless: Some(slot),
            bindful: Some(bindful),
            ..ArgDescPointer::default()
        }));
        self
    }

    /// `__local` pointer argument receiving an SLM offset.
    #[must_use]
    pub fn local_arg(mut self, alignment: u32) -> Self {
        let slot = PointerSlot {
            offset: self.reserve(4, 4),
            size: 4,
        };
        self.descriptor.args.push(ArgDescriptor::Pointer(ArgDescPointer {
            address_space: AddressSpace::Local,
            stateless: Some(slot),
            required_slm_alignment: alignment,
            ..ArgDescPointer::default()
        }));
        self
    }

    /// By-value argument of `size` bytes in one element.
    #[must_use]
    pub fn value_arg(mut self, size: usize) -> Self {
        let offset = self.reserve(size, size.clamp(1, 8).next_power_of_two());
        self.descriptor.args.push(ArgDescriptor::Value(ArgDescValue {
            elements: vec![ValueElement {
                source_offset: 0,
                size,
                offset,
            }],
        }));
        self
    }

    #[must_use]
    pub fn image_arg(mut self) -> Self {
        let bindful = self.reserve_surface_state();
        let mut metadata = ImageMetadataOffsets::default();
        for slot in [
            &mut metadata.width,
            &mut metadata.height,
            &mut metadata.depth,
            &mut metadata.channel_data_type,
            &mut metadata.channel_order,
            &mut metadata.row_pitch,
            &mut metadata.slice_pitch,
            &mut metadata.num_mip_levels,
        ] {
            *slot = Some(self.reserve(4, 4));
        }
        metadata.flat_base_offset = Some(self.reserve(8, 8));
        self.descriptor.args.push(ArgDescriptor::Image(ArgDescImage {
            bindful: Some(bindful),
            bindless: None,
            metadata,
        }));
        self
    }

    #[must_use]
    pub fn sampler_arg(mut self) -> Self {
        let offset = self.descriptor.dynamic_state_heap.len();
        self.descriptor
            .dynamic_state_heap
            .resize(offset + SAMPLER_STATE_SIZE, 0);
        let table = self
            .descriptor
            .attributes
            .sampler_table
            .get_or_insert(TableInfo { offset: 0, count: 0 });
        table.count += 1;
        let metadata = SamplerMetadataOffsets {
            addressing_mode: Some(self.reserve(4, 4)),
            normalized_coords: Some(self.reserve(4, 4)),
            snap_workaround: Some(self.reserve(4, 4)),
        };
        self.descriptor.args.push(ArgDescriptor::Sampler(ArgDescSampler {
            bindful: Some(offset),
            metadata,
        }));
        self
    }

    /// Slots for local/global sizes, group counts, offsets and work dim.
    #[must_use]
    pub fn dispatch_traits(mut self) -> Self {
        let traits = DispatchTraitOffsets {
            local_work_size: Some(self.reserve(12, 4)),
            enqueued_local_work_size: Some(self.reserve(12, 4)),
            global_work_size: Some(self.reserve(12, 4)),
            num_work_groups: Some(self.reserve(12, 4)),
            global_work_offset: Some(self.reserve(12, 4)),
            work_dim: Some(self.reserve(4, 4)),
        };
        self.descriptor.dispatch_traits = traits;
        self
    }

    #[must_use]
    pub fn local_ids(mut self, channels: u32) -> Self {
        self.descriptor.attributes.num_local_id_channels = channels;
        self
    }

    #[must_use]
    pub fn walk_order(mut self, order: [u8; 3]) -> Self {
        self.descriptor.attributes.walk_order = order;
        self
    }

    #[must_use]
    pub fn printf(mut self) -> Self {
        self.descriptor.flags.uses_printf = true;
        self.descriptor.implicit_args.printf_surface = Some(PointerSlot::u64(self.reserve(8, 8)));
        self
    }

    #[must_use]
    pub fn private_memory(mut self, per_thread: u32) -> Self {
        self.descriptor.attributes.per_thread_private_memory_size = per_thread;
        self.descriptor.implicit_args.private_memory = Some(PointerSlot::u64(self.reserve(8, 8)));
        self
    }

    #[must_use]
    pub fn sync_buffer(mut self) -> Self {
        self.descriptor.flags.uses_sync_buffer = true;
        self.descriptor.implicit_args.sync_buffer = Some(PointerSlot::u64(self.reserve(8, 8)));
        self
    }

    #[must_use]
    pub fn global_surfaces(mut self) -> Self {
        self.descriptor.implicit_args.global_constants = Some(PointerSlot::u64(self.reserve(8, 8)));
        self.descriptor.implicit_args.global_variables = Some(PointerSlot::u64(self.reserve(8, 8)));
        self
    }

    #[must_use]
    pub fn required_group_size(mut self, size: [u32; 3]) -> Self {
        self.descriptor.attributes.required_group_size = Some(size);
        self
    }

    #[must_use]
    pub fn slm_inline_size(mut self, bytes: u32) -> Self {
        self.descriptor.attributes.slm_inline_size = bytes;
        self
    }

    #[must_use]
    pub fn scratch(mut self, per_thread: u32) -> Self {
        self.descriptor.attributes.per_thread_scratch_size = per_thread;
        self
    }

    #[must_use]
    pub fn flags(mut self, flags: KernelFlags) -> Self {
        let uses_printf = self.descriptor.flags.uses_printf;
        let uses_sync_buffer = self.descriptor.flags.uses_sync_buffer;
        self.descriptor.flags = KernelFlags {
            uses_printf: uses_printf || flags.uses_printf,
            uses_sync_buffer: uses_sync_buffer || flags.uses_sync_buffer,
            ..flags
        };
        self
    }

    #[must_use]
    pub fn isa(mut self, isa: Vec<u8>) -> Self {
        self.descriptor.isa = isa;
        self
    }

    #[must_use]
    pub fn build(mut self) -> KernelDescriptor {
        if self.descriptor.isa.is_empty() {
            self.descriptor.isa = vec![0; 64];
        }
        if let Some(table) = self.descriptor.attributes.binding_table.as_mut() {
            // Entries hold heap-relative surface state offsets.
            let offset = align_up(self.descriptor.surface_state_heap.len(), SURFACE_STATE_SIZE);
            table.offset = offset;
            let heap = &mut self.descriptor.surface_state_heap;
            heap.resize(offset, 0);
            for index in 0..table.count as usize {
                heap.extend_from_slice(&((index * SURFACE_STATE_SIZE) as u32).to_le_bytes());
            }
        }
        let size = align_up(self.next_offset.max(1), CROSS_THREAD_ALIGNMENT);
        self.descriptor.attributes.cross_thread_data_size = size;
        self.descriptor.cross_thread_data.resize(size, 0);
        self.descriptor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_lays_out_non_overlapping_slots() {
        let desc = KernelDescriptor::builder("copy", 16)
            .pointer_arg()
            .value_arg(4)
            .pointer_arg()
            .dispatch_traits()
            .build();
        desc.validate().unwrap();
        let ArgDescriptor::Pointer(first) = &desc.args[0] else {
            panic!("pointer expected");
        };
        let ArgDescriptor::Value(value) = &desc.args[1] else {
            panic!("value expected");
        };
        let ArgDescriptor::Pointer(second) = &desc.args[2] else {
            panic!("pointer expected");
        };
        assert_eq!(first.stateless, Some(PointerSlot::u64(0)));
        assert_eq!(value.elements[0].offset, 8);
        assert_eq!(second.stateless, Some(PointerSlot::u64(16)));
        assert_eq!(desc.attributes.cross_thread_data_size % CROSS_THREAD_ALIGNMENT, 0);
        assert_eq!(desc.cross_thread_data.len(), desc.attributes.cross_thread_data_size);
    }

    #[test]
    fn bindful_args_grow_the_binding_table() {
        let desc = KernelDescriptor::builder("img", 8)
            .bindful_pointer_arg()
            .image_arg()
            .sampler_arg()
            .build();
        desc.validate().unwrap();
        let table = desc.attributes.binding_table.unwrap();
        assert_eq!(table.count, 2);
        assert_eq!(table.offset, 2 * SURFACE_STATE_SIZE);
        assert_eq!(desc.surface_state_heap.len(), 2 * SURFACE_STATE_SIZE + 8);
        assert_eq!(&desc.surface_state_heap[table.offset + 4..table.offset + 8], &64u32.to_le_bytes());
        assert_eq!(desc.attributes.sampler_table.map(|t| t.count), Some(1));
    }

    #[test]
    fn out_of_range_slot_is_rejected() {
        let mut desc = KernelDescriptor::builder("bad", 16).pointer_arg().build();
        desc.args.push(ArgDescriptor::Value(ArgDescValue {
            elements: vec![ValueElement {
                source_offset: 0,
                size: 8,
                offset: desc.attributes.cross_thread_data_size,
            }],
        }));
        assert!(matches!(desc.validate(), Err(XeError::InvalidArgument { .. })));
    }

    #[test]
    fn walk_order_must_be_a_permutation() {
        let desc = KernelDescriptor::builder("walk", 16)
            .walk_order([0, 0, 2])
            .build();
        assert!(desc.validate().is_err());
    }

    #[test]
    fn simd_width_is_checked() {
        let desc = KernelDescriptor::builder("simd", 12).build();
        assert!(desc.validate().is_err());
    }

    #[test]
    fn descriptor_deserializes_with_defaults() {
        let json = r#"{
            "name": "k",
            "attributes": { "simd_size": 32, "cross_thread_data_size": 32 },
            "args": [
                { "kind": "pointer", "stateless": { "offset": 0, "size": 8 } },
                { "kind": "value", "elements": [ { "source_offset": 0, "size": 4, "offset": 8 } ] }
            ]
        }"#;
        let desc: KernelDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(desc.attributes.walk_order, [0, 1, 2]);
        assert_eq!(desc.args[0].kind(), ArgKind::Pointer);
        assert_eq!(desc.args[1].kind(), ArgKind::Value);
        desc.validate().unwrap();
    }
}
