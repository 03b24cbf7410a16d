//! Kernels for xe-runtime.
//!
//! A [`Module`] turns compiler-produced [`KernelDescriptor`]s into shared
//! [`KernelImmutableData`] (ISA upload, payload templates, static
//! residency). Each [`Kernel`] instance owns patched copies of those
//! templates; argument setters and group-size calls write straight into
//! them, and [`Kernel::dispatch_state`] freezes the result for one enqueue.

pub mod args;
pub mod descriptor;
pub mod group_size;
pub mod image;
pub mod kernel;
pub mod local_ids;
pub mod module;
pub mod sampler;

#[cfg(test)]
mod test_support;

pub use args::KernelArgInfo;
pub use descriptor::{
    AddressSpace, ArgDescImage, ArgDescPointer, ArgDescSampler, ArgDescValue, ArgDescriptor,
    ArgKind, BindlessSlot, DispatchTraitOffsets, ImageMetadataOffsets, ImplicitArgOffsets,
    KernelAttributes, KernelDescriptor, KernelDescriptorBuilder, KernelFlags, PointerSlot,
    SamplerMetadataOffsets, TableInfo, ValueElement,
};
pub use group_size::{right_execution_mask, suggest_group_size, threads_per_group};
pub use image::{
    Image, ImageChannelOrder, ImageChannelType, ImageDescriptor, ImageFormat, ImageSurfaceEncoder,
    ImageType, LinearImageSurfaceEncoder,
};
pub use kernel::{Kernel, KernelDispatchState, KernelSurfaces, PRINTF_HEADER_SIZE};
pub use module::{DeviceResources, KernelImmutableData, Module, ModuleGlobals};
pub use sampler::{AddressingMode, BasicSamplerStateEncoder, FilterMode, Sampler, SamplerStateEncoder};
