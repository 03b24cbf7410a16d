//! Argument binding.
//!
//! Each argument gets a binder from its descriptor when the kernel is
//! created; the setters below refuse arguments bound to a different binder.
//! Every setter resolves and validates its input before touching the
//! payload, so a rejected call leaves the kernel as it was.

use std::sync::Arc;

use tracing::trace;
use xe_common::math::align_up;
use xe_common::{Result, XeError};
use xe_memory::GraphicsAllocation;

use crate::descriptor::{
    ArgDescImage, ArgDescPointer, ArgDescSampler, ArgDescValue, ArgDescriptor, ArgKind,
};
use crate::image::{Image, encode_buffer_surface_state};
use crate::kernel::Kernel;
use crate::sampler::Sampler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ArgBinder {
    Buffer,
    /// `__local` pointer: receives an SLM offset, not an address.
    Slm,
    Image,
    Sampler,
    Immediate,
}

impl ArgBinder {
    pub(crate) fn for_descriptor(arg: &ArgDescriptor) -> Self {
        match arg {
            ArgDescriptor::Pointer(ptr) if ptr.is_slm() => Self::Slm,
            ArgDescriptor::Pointer(_) => Self::Buffer,
            ArgDescriptor::Image(_) => Self::Image,
            ArgDescriptor::Sampler(_) => Self::Sampler,
            ArgDescriptor::Value(_) => Self::Immediate,
        }
    }
}

/// What is currently bound to one argument slot.
#[derive(Debug, Clone)]
pub struct KernelArgInfo {
    pub kind: ArgKind,
    pub is_set: bool,
    /// Residency slot; `None` for values, samplers, SLM and null pointers.
    pub allocation: Option<Arc<GraphicsAllocation>>,
    /// Patched GPU address, or the SLM offset of a local argument.
    pub address: u64,
    pub accessed_statelessly: bool,
}

impl KernelArgInfo {
    pub(crate) const fn new(kind: ArgKind) -> Self {
        Self {
            kind,
            is_set: false,
            allocation: None,
            address: 0,
            accessed_statelessly: false,
        }
    }
}

impl Kernel {
    #[must_use]
    pub fn num_args(&self) -> usize {
        self.arg_infos.len()
    }

    #[must_use]
    pub fn arg_info(&self, index: usize) -> Option<&KernelArgInfo> {
        self.arg_infos.get(index)
    }

    #[must_use]
    pub fn arg_infos(&self) -> &[KernelArgInfo] {
        &self.arg_infos
    }

    /// True once every argument has been given a value.
    #[must_use]
    pub fn all_args_set(&self) -> bool {
        self.arg_infos.iter().all(|info| info.is_set)
    }

    fn expect_binder(&self, index: usize, expected: ArgBinder) -> Result<()> {
        let binder = self.binders.get(index).copied().ok_or_else(|| {
            XeError::invalid_argument(format!(
                "kernel {}: argument index {index} out of range ({} arguments)",
                self.name(),
                self.binders.len()
            ))
        })?;
        if binder != expected {
            return Err(XeError::invalid_argument(format!(
                "kernel {}: argument {index} is bound as {binder:?}, not {expected:?}",
                self.name()
            )));
        }
        Ok(())
    }

    /// Set an argument from raw bytes, the way the driver API passes them.
    /// Pointer arguments take the address in `value`; local arguments take
    /// only `size`.
    pub fn set_argument_value(&mut self, index: usize, size: usize, value: Option<&[u8]>) -> Result<()> {
        let binder = self.binders.get(index).copied().ok_or_else(|| {
            XeError::invalid_argument(format!("kernel {}: argument index {index} out of range", self.name()))
        })?;
        match binder {
            ArgBinder::Buffer => {
                let address = match value {
                    None => None,
                    Some(bytes) if bytes.len() == 4 || bytes.len() >= 8 => {
                        let mut raw = [0u8; 8];
                        let len = bytes.len().min(8);
                        raw[..len].copy_from_slice(&bytes[..len]);
                        Some(u64::from_le_bytes(raw)).filter(|&address| address != 0)
                    }
                    Some(bytes) => {
                        return Err(XeError::invalid_argument(format!(
                            "pointer argument {index} given {} bytes",
                            bytes.len()
                        )));
                    }
                };
                self.set_arg_buffer(index, address)
            }
            ArgBinder::Slm => self.set_arg_local(index, size),
            ArgBinder::Immediate => self.set_arg_immediate(index, size, value),
            ArgBinder::Image | ArgBinder::Sampler => Err(XeError::invalid_argument(format!(
                "kernel {}: argument {index} takes an image or sampler object",
                self.name()
            ))),
        }
    }

    // ── Buffers ─────────────────────────────────────────────────────────────

    /// Bind a unified-memory pointer. Interior pointers resolve to their
    /// owning allocation; `None` binds null and clears the residency slot.
    pub fn set_arg_buffer(&mut self, index: usize, address: Option<u64>) -> Result<()> {
        self.expect_binder(index, ArgBinder::Buffer)?;
        let Some(address) = address else {
            return self.bind_buffer(index, 0, None);
        };
        let root = self.resources.root_device_index;
        let allocation = self
            .resources
            .svm
            .get_allocation_data(address)
            .and_then(|data| data.gpu_allocation(root).cloned())
            .ok_or_else(|| {
                XeError::invalid_argument(format!(
                    "kernel {}: argument {index} address {address:#x} is not a tracked allocation",
                    self.name()
                ))
            })?;
        self.bind_buffer(index, address, Some(allocation))
    }

    /// Bind `address` inside an allocation the caller already holds.
    pub fn set_arg_buffer_with_alloc(
        &mut self,
        index: usize,
        address: u64,
        allocation: &Arc<GraphicsAllocation>,
    ) -> Result<()> {
        self.expect_binder(index, ArgBinder::Buffer)?;
        if !allocation.contains_gpu_address(address) {
            return Err(XeError::invalid_argument(format!(
                "address {address:#x} outside allocation {} [{:#x}, {:#x})",
                allocation.id(),
                allocation.gpu_address(),
                allocation.gpu_end()
            )));
        }
        self.bind_buffer(index, address, Some(Arc::clone(allocation)))
    }

    /// OpenCL name for [`set_arg_buffer`](Self::set_arg_buffer); 0 is null.
    pub fn set_kernel_arg_svm(&mut self, index: usize, address: u64) -> Result<()> {
        self.set_arg_buffer(index, Some(address).filter(|&a| a != 0))
    }

    fn bind_buffer(
        &mut self,
        index: usize,
        address: u64,
        allocation: Option<Arc<GraphicsAllocation>>,
    ) -> Result<()> {
        let immutable = Arc::clone(&self.immutable);
        let Some(ArgDescriptor::Pointer(desc)) = immutable.descriptor().args.get(index) else {
            return Err(XeError::fatal(format!("argument {index} lost its pointer descriptor")));
        };
        let ArgDescPointer {
            stateless,
            bindful,
            bindless,
            ..
        } = *desc;

        if let Some(slot) = stateless {
            self.cross_thread_data.write_pointer_at(slot.offset, slot.size, address)?;
        }
        if bindful.is_some() || bindless.is_some() {
            let size = allocation
                .as_ref()
                .map_or(0, |alloc| alloc.gpu_end().saturating_sub(address));
            let blob = encode_buffer_surface_state(
                address,
                size,
                self.resources.traits().surface_state_size,
            );
            if let Some(offset) = bindful {
                self.surface_state_heap.write_at(offset, &blob)?;
            }
            if let Some(slot) = bindless {
                self.surface_state_heap.write_at(slot.heap_offset, &blob)?;
                self.cross_thread_data
                    .write_u32_at(slot.cross_thread_offset, slot.heap_offset as u32)?;
            }
        }

        let info = &mut self.arg_infos[index];
        info.is_set = true;
        info.address = address;
        info.accessed_statelessly = desc.accessed_statelessly();
        info.allocation = allocation;
        trace!(kernel = %immutable.name(), index, address, "buffer bound");
        Ok(())
    }

    // ── Shared local memory ─────────────────────────────────────────────────

    /// Offsets of every SLM argument in declaration order, and the total
    /// footprint including the kernel's inline SLM.
    fn layout_slm(&self, sizes: &[u32]) -> (Vec<(usize, u32)>, u64) {
        let descriptor = self.immutable.descriptor();
        let mut offset = u64::from(descriptor.attributes.slm_inline_size);
        let mut offsets = Vec::new();
        for (index, arg) in descriptor.args.iter().enumerate() {
            let ArgDescriptor::Pointer(ptr) = arg else {
                continue;
            };
            if !ptr.is_slm() {
                continue;
            }
            let alignment = ptr.required_slm_alignment.max(1) as usize;
            offset = align_up(offset as usize, alignment) as u64;
            offsets.push((index, offset as u32));
            offset += u64::from(sizes[index]);
        }
        (offsets, offset)
    }

    /// Size a `__local` argument; offsets of later SLM arguments move to
    /// keep their alignment.
    pub fn set_arg_local(&mut self, index: usize, size: usize) -> Result<()> {
        self.expect_binder(index, ArgBinder::Slm)?;
        if size == 0 {
            return Err(XeError::invalid_argument(format!(
                "kernel {}: local argument {index} has size 0",
                self.name()
            )));
        }
        let mut sizes = self.slm_arg_sizes.clone();
        sizes[index] = u32::try_from(size).unwrap_or(u32::MAX);
        let (offsets, total) = self.layout_slm(&sizes);
        let limit = self.resources.hw_info.slm_size_bytes;
        if total > u64::from(limit) {
            return Err(XeError::out_of_resources(
                format!("shared local memory for kernel {} (limit {limit})", self.name()),
                usize::try_from(total).unwrap_or(usize::MAX),
            ));
        }

        let immutable = Arc::clone(&self.immutable);
        for (arg_index, offset) in offsets {
            if let Some(ArgDescriptor::Pointer(ptr)) = immutable.descriptor().args.get(arg_index)
                && let Some(slot) = ptr.stateless
            {
                self.cross_thread_data
                    .write_pointer_at(slot.offset, slot.size, u64::from(offset))?;
            }
            self.arg_infos[arg_index].address = u64::from(offset);
        }
        self.slm_arg_sizes = sizes;
        self.slm_total_size = total as u32;
        self.arg_infos[index].is_set = true;
        trace!(kernel = %immutable.name(), index, size, total, "local argument sized");
        Ok(())
    }

    // ── Values ──────────────────────────────────────────────────────────────

    /// Copy a by-value argument into its element slots. Bytes past `size`
    /// are ignored, slots the caller's bytes do not reach are zeroed, and
    /// `None` zeroes every slot.
    pub fn set_arg_immediate(&mut self, index: usize, size: usize, value: Option<&[u8]>) -> Result<()> {
        self.expect_binder(index, ArgBinder::Immediate)?;
        let immutable = Arc::clone(&self.immutable);
        let Some(ArgDescriptor::Value(ArgDescValue { elements })) = immutable.descriptor().args.get(index)
        else {
            return Err(XeError::fatal(format!("argument {index} lost its value descriptor")));
        };
        let value = value.map_or(&[][..], |bytes| &bytes[..size.min(bytes.len())]);
        for element in elements {
            let mut bytes = vec![0u8; element.size];
            if let Some(source) = value.get(element.source_offset..) {
                let len = source.len().min(element.size);
                bytes[..len].copy_from_slice(&source[..len]);
            }
            self.cross_thread_data.write_at(element.offset, &bytes)?;
        }
        self.arg_infos[index].is_set = true;
        Ok(())
    }

    // ── Images and samplers ─────────────────────────────────────────────────

    pub fn set_arg_image(&mut self, index: usize, image: &Image) -> Result<()> {
        self.expect_binder(index, ArgBinder::Image)?;
        let immutable = Arc::clone(&self.immutable);
        let Some(ArgDescriptor::Image(ArgDescImage {
            bindful,
            bindless,
            metadata,
        })) = immutable.descriptor().args.get(index)
        else {
            return Err(XeError::fatal(format!("argument {index} lost its image descriptor")));
        };

        let state_size = self.resources.traits().surface_state_size;
        let blob = self.resources.image_encoder.encode(image, state_size);
        if blob.len() != state_size {
            return Err(XeError::fatal(format!(
                "image encoder returned {} bytes, expected {state_size}",
                blob.len()
            )));
        }
        if let Some(offset) = *bindful {
            self.surface_state_heap.write_at(offset, &blob)?;
        }
        if let Some(slot) = *bindless {
            self.surface_state_heap.write_at(slot.heap_offset, &blob)?;
            self.cross_thread_data
                .write_u32_at(slot.cross_thread_offset, slot.heap_offset as u32)?;
        }

        let desc = image.descriptor();
        for (slot, value) in [
            (metadata.width, desc.width),
            (metadata.height, desc.height),
            (metadata.depth, desc.depth),
            (metadata.channel_data_type, desc.format.channel_type.code()),
            (metadata.channel_order, desc.format.channel_order.code()),
            (metadata.row_pitch, desc.row_pitch),
            (metadata.slice_pitch, desc.slice_pitch),
            (metadata.num_mip_levels, desc.mip_levels),
        ] {
            if let Some(offset) = slot {
                self.cross_thread_data.write_u32_at(offset, value)?;
            }
        }
        if let Some(offset) = metadata.flat_base_offset {
            self.cross_thread_data.write_u64_at(offset, image.gpu_address())?;
        }

        let info = &mut self.arg_infos[index];
        info.is_set = true;
        info.address = image.gpu_address();
        info.allocation = Some(Arc::clone(image.allocation()));
        Ok(())
    }

    pub fn set_arg_sampler(&mut self, index: usize, sampler: &Sampler) -> Result<()> {
        self.expect_binder(index, ArgBinder::Sampler)?;
        let immutable = Arc::clone(&self.immutable);
        let Some(ArgDescriptor::Sampler(ArgDescSampler { bindful, metadata })) =
            immutable.descriptor().args.get(index)
        else {
            return Err(XeError::fatal(format!("argument {index} lost its sampler descriptor")));
        };
        if let Some(offset) = *bindful {
            let blob = self
                .resources
                .sampler_encoder
                .encode(sampler, self.resources.traits().sampler_state_size);
            self.dynamic_state_heap.write_at(offset, &blob)?;
        }
        for (slot, value) in [
            (metadata.addressing_mode, sampler.addressing_mode.patch_value()),
            (metadata.normalized_coords, sampler.normalized_coords_value()),
            (metadata.snap_workaround, sampler.snap_workaround_value()),
        ] {
            if let Some(offset) = slot {
                self.cross_thread_data.write_u32_at(offset, value)?;
            }
        }
        self.arg_infos[index].is_set = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{KernelDescriptor, ValueElement};
    use crate::image::{ImageChannelOrder, ImageChannelType, ImageDescriptor, ImageFormat};
    use crate::module::Module;
    use crate::sampler::{AddressingMode, FilterMode};
    use crate::test_support::resources;

    fn u32_at(kernel: &Kernel, offset: usize) -> u32 {
        u32::from_le_bytes(kernel.cross_thread_data()[offset..offset + 4].try_into().unwrap())
    }

    #[test]
    fn bad_index_and_wrong_binder_are_rejected() {
        let module = Module::new(
            resources(),
            vec![KernelDescriptor::builder("k", 16).value_arg(4).build()],
        )
        .unwrap();
        let mut kernel = module.create_kernel("k").unwrap();
        assert!(matches!(
            kernel.set_arg_immediate(3, 4, Some(&[0; 4])),
            Err(XeError::InvalidArgument { .. })
        ));
        assert!(matches!(
            kernel.set_arg_buffer(0, None),
            Err(XeError::InvalidArgument { .. })
        ));
        assert!(!kernel.all_args_set());
    }

    #[test]
    fn immediate_is_clipped_and_zero_filled() {
        let mut desc = KernelDescriptor::builder("k", 16).value_arg(8).build();
        let ArgDescriptor::Value(value) = &mut desc.args[0] else {
            panic!("value expected");
        };
        // Split into two 4-byte elements, the second placed at offset 16.
        value.elements = vec![
            ValueElement {
                source_offset: 0,
                size: 4,
                offset: 0,
            },
            ValueElement {
                source_offset: 4,
                size: 4,
                offset: 16,
            },
        ];
        let module = Module::new(resources(), vec![desc]).unwrap();
        let mut kernel = module.create_kernel("k").unwrap();

        kernel.set_argument_value(0, 8, Some(&[1, 0, 0, 0, 2, 0, 0, 0])).unwrap();
        assert_eq!((u32_at(&kernel, 0), u32_at(&kernel, 16)), (1, 2));

        kernel.set_argument_value(0, 6, Some(&[3, 0, 0, 0, 4, 0, 9, 9])).unwrap();
        assert_eq!((u32_at(&kernel, 0), u32_at(&kernel, 16)), (3, 4));

        kernel.set_argument_value(0, 8, None).unwrap();
        assert_eq!((u32_at(&kernel, 0), u32_at(&kernel, 16)), (0, 0));
        assert!(kernel.all_args_set());
    }

    #[test]
    fn local_arguments_stack_with_alignment() {
        let desc = KernelDescriptor::builder("k", 16)
            .slm_inline_size(100)
            .local_arg(16)
            .local_arg(256)
            .build();
        let slots: Vec<_> = desc
            .args
            .iter()
            .map(|arg| match arg {
                ArgDescriptor::Pointer(ptr) => ptr.stateless.unwrap().offset,
                _ => panic!("pointer expected"),
            })
            .collect();
        let module = Module::new(resources(), vec![desc]).unwrap();
        let mut kernel = module.create_kernel("k").unwrap();

        kernel.set_arg_local(0, 10).unwrap();
        kernel.set_arg_local(1, 64).unwrap();
        assert_eq!(u32_at(&kernel, slots[0]), 112);
        assert_eq!(u32_at(&kernel, slots[1]), 256);
        assert_eq!(kernel.slm_total_size(), 320);

        // Growing the first argument pushes the second to the next boundary.
        kernel.set_arg_local(0, 200).unwrap();
        assert_eq!(u32_at(&kernel, slots[1]), 512);
        assert_eq!(kernel.slm_total_size(), 576);
    }

    #[test]
    fn local_argument_over_device_limit_leaves_state() {
        let module = Module::new(
            resources(),
            vec![KernelDescriptor::builder("k", 16).local_arg(4).build()],
        )
        .unwrap();
        let mut kernel = module.create_kernel("k").unwrap();
        kernel.set_arg_local(0, 1024).unwrap();
        assert!(matches!(
            kernel.set_arg_local(0, 1 << 20),
            Err(XeError::OutOfResources { .. })
        ));
        assert_eq!(kernel.slm_total_size(), 1024);
        assert!(matches!(
            kernel.set_arg_local(0, 0),
            Err(XeError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn sampler_patches_state_and_flags() {
        let desc = KernelDescriptor::builder("k", 16).sampler_arg().build();
        let ArgDescriptor::Sampler(sampler_desc) = desc.args[0].clone() else {
            panic!("sampler expected");
        };
        let module = Module::new(resources(), vec![desc]).unwrap();
        let mut kernel = module.create_kernel("k").unwrap();
        let sampler = Sampler {
            normalized_coords: true,
            addressing_mode: AddressingMode::Clamp,
            filter_mode: FilterMode::Nearest,
        };
        kernel.set_arg_sampler(0, &sampler).unwrap();
        let meta = sampler_desc.metadata;
        assert_eq!(u32_at(&kernel, meta.addressing_mode.unwrap()), 1);
        assert_eq!(u32_at(&kernel, meta.normalized_coords.unwrap()), 0x08);
        assert_eq!(u32_at(&kernel, meta.snap_workaround.unwrap()), u32::MAX);
        let state = sampler_desc.bindful.unwrap();
        assert_eq!(&kernel.dynamic_state_heap()[state..state + 4], &1u32.to_le_bytes());
    }

    #[test]
    fn image_patches_metadata_and_residency() {
        let res = resources();
        let mm = Arc::clone(&res.memory_manager);
        let desc = KernelDescriptor::builder("k", 16).image_arg().build();
        let ArgDescriptor::Image(image_desc) = desc.args[0].clone() else {
            panic!("image expected");
        };
        let module = Module::new(res, vec![desc]).unwrap();
        let mut kernel = module.create_kernel("k").unwrap();
        let format = ImageFormat::new(ImageChannelOrder::Rgba, ImageChannelType::Float);
        let image = Image::create(&mm, 0, ImageDescriptor::image_2d(format, 32, 8)).unwrap();

        kernel.set_arg_image(0, &image).unwrap();
        let meta = image_desc.metadata;
        assert_eq!(u32_at(&kernel, meta.width.unwrap()), 32);
        assert_eq!(u32_at(&kernel, meta.row_pitch.unwrap()), 32 * 16);
        assert_eq!(u32_at(&kernel, meta.channel_order.unwrap()), 0x10B5);
        let base = meta.flat_base_offset.unwrap();
        assert_eq!(
            &kernel.cross_thread_data()[base..base + 8],
            &image.gpu_address().to_le_bytes()
        );
        let state = image_desc.bindful.unwrap();
        assert_eq!(
            &kernel.surface_state_heap()[state..state + 8],
            &image.gpu_address().to_le_bytes()
        );
        assert!(
            kernel
                .residency()
                .iter()
                .any(|alloc| alloc.id() == image.allocation().id())
        );
    }
}
