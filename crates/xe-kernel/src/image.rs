//! Images as kernel arguments.
//!
//! Surface-state encoding is owned by an external [`ImageSurfaceEncoder`];
//! the binder only copies the blob it returns and patches metadata.

use std::fmt;
use std::sync::Arc;

use tracing::debug;
use xe_common::math::align_up;
use xe_common::{Result, XeError};
use xe_memory::{
    AllocationProperties, AllocationType, GraphicsAllocation, MemoryManager, OwnedAllocation,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageChannelOrder {
    R,
    Rg,
    Rgba,
    Bgra,
}

impl ImageChannelOrder {
    /// API enumerant patched into cross-thread data.
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::R => 0x10B0,
            Self::Rg => 0x10B2,
            Self::Rgba => 0x10B5,
            Self::Bgra => 0x10B6,
        }
    }

    #[must_use]
    pub const fn channels(self) -> usize {
        match self {
            Self::R => 1,
            Self::Rg => 2,
            Self::Rgba | Self::Bgra => 4,
        }
    }
}

impl fmt::Display for ImageChannelOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::R => write!(f, "CL_R"),
            Self::Rg => write!(f, "CL_RG"),
            Self::Rgba => write!(f, "CL_RGBA"),
            Self::Bgra => write!(f, "CL_BGRA"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageChannelType {
    UnormInt8,
    UnsignedInt8,
    SignedInt32,
    HalfFloat,
    Float,
}

impl ImageChannelType {
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::UnormInt8 => 0x10D2,
            Self::UnsignedInt8 => 0x10DA,
            Self::SignedInt32 => 0x10DB,
            Self::HalfFloat => 0x10DD,
            Self::Float => 0x10DE,
        }
    }

    #[must_use]
    pub const fn bytes_per_channel(self) -> usize {
        match self {
            Self::UnormInt8 | Self::UnsignedInt8 => 1,
            Self::HalfFloat => 2,
            Self::SignedInt32 | Self::Float => 4,
        }
    }
}

impl fmt::Display for ImageChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnormInt8 => write!(f, "CL_UNORM_INT8"),
            Self::UnsignedInt8 => write!(f, "CL_UNSIGNED_INT8"),
            Self::SignedInt32 => write!(f, "CL_SIGNED_INT32"),
            Self::HalfFloat => write!(f, "CL_HALF_FLOAT"),
            Self::Float => write!(f, "CL_FLOAT"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageFormat {
    pub channel_order: ImageChannelOrder,
    pub channel_type: ImageChannelType,
}

impl ImageFormat {
    #[must_use]
    pub const fn new(channel_order: ImageChannelOrder, channel_type: ImageChannelType) -> Self {
        Self {
            channel_order,
            channel_type,
        }
    }

    #[must_use]
    pub const fn bytes_per_pixel(&self) -> usize {
        self.channel_order.channels() * self.channel_type.bytes_per_channel()
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} × {}", self.channel_order, self.channel_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageType {
    Image1D,
    Image2D,
    Image3D,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDescriptor {
    pub image_type: ImageType,
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    /// 0 selects the tightly packed pitch.
    pub row_pitch: u32,
    pub slice_pitch: u32,
    pub mip_levels: u32,
}

impl ImageDescriptor {
    #[must_use]
    pub const fn image_2d(format: ImageFormat, width: u32, height: u32) -> Self {
        Self {
            image_type: ImageType::Image2D,
            format,
            width,
            height,
            depth: 1,
            row_pitch: 0,
            slice_pitch: 0,
            mip_levels: 1,
        }
    }
}

/// An image and the allocation backing it.
pub struct Image {
    descriptor: ImageDescriptor,
    memory_manager: Arc<MemoryManager>,
    allocation: Option<OwnedAllocation>,
    view: Arc<GraphicsAllocation>,
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("descriptor", &self.descriptor)
            .field("allocation", &self.view.id())
            .finish()
    }
}

impl Image {
    /// Allocate an image, resolving zero pitches to packed ones.
    pub fn create(
        memory_manager: &Arc<MemoryManager>,
        root_device_index: u32,
        mut descriptor: ImageDescriptor,
    ) -> Result<Self> {
        if descriptor.width == 0 || descriptor.height == 0 || descriptor.depth == 0 {
            return Err(XeError::invalid_argument(format!(
                "image extent {}x{}x{} has a zero dimension",
                descriptor.width, descriptor.height, descriptor.depth
            )));
        }
        let packed_row = descriptor.width as usize * descriptor.format.bytes_per_pixel();
        if descriptor.row_pitch == 0 {
            descriptor.row_pitch = packed_row as u32;
        } else if (descriptor.row_pitch as usize) < packed_row {
            return Err(XeError::invalid_argument(format!(
                "row pitch {} below packed row of {packed_row} bytes",
                descriptor.row_pitch
            )));
        }
        let packed_slice = descriptor.row_pitch as usize * descriptor.height as usize;
        if descriptor.slice_pitch == 0 {
            descriptor.slice_pitch = packed_slice as u32;
        }
        descriptor.mip_levels = descriptor.mip_levels.max(1);
        let size = align_up(
            descriptor.slice_pitch as usize * descriptor.depth as usize,
            xe_common::math::PAGE_SIZE,
        );
        let allocation = memory_manager.allocate(&AllocationProperties::new(
            root_device_index,
            size,
            AllocationType::Image,
        ))?;
        debug!(
            id = %allocation.id(),
            format = %descriptor.format,
            width = descriptor.width,
            height = descriptor.height,
            "image created"
        );
        Ok(Self {
            descriptor,
            memory_manager: Arc::clone(memory_manager),
            view: allocation.share(),
            allocation: Some(allocation),
        })
    }

    #[must_use]
    pub const fn descriptor(&self) -> &ImageDescriptor {
        &self.descriptor
    }

    #[must_use]
    pub const fn allocation(&self) -> &Arc<GraphicsAllocation> {
        &self.view
    }

    #[must_use]
    pub fn gpu_address(&self) -> u64 {
        self.view.gpu_address()
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            self.memory_manager.check_gpu_usage_and_free(allocation, true);
        }
    }
}

/// Produces surface-state records for images.
pub trait ImageSurfaceEncoder: Send + Sync + fmt::Debug {
    /// A blob of exactly `surface_state_size` bytes describing `image`.
    fn encode(&self, image: &Image, surface_state_size: usize) -> Vec<u8>;
}

/// Packs address, extent, pitch and format codes into a linear record.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinearImageSurfaceEncoder;

impl ImageSurfaceEncoder for LinearImageSurfaceEncoder {
    fn encode(&self, image: &Image, surface_state_size: usize) -> Vec<u8> {
        let desc = image.descriptor();
        let mut blob = Vec::with_capacity(surface_state_size);
        blob.extend_from_slice(&image.gpu_address().to_le_bytes());
        for value in [
            desc.width,
            desc.height,
            desc.depth,
            desc.row_pitch,
            desc.slice_pitch,
            desc.mip_levels,
            desc.format.channel_order.code(),
            desc.format.channel_type.code(),
        ] {
            blob.extend_from_slice(&value.to_le_bytes());
        }
        blob.resize(surface_state_size, 0);
        blob
    }
}

/// Buffer surface state: base address then size, zero-padded.
#[must_use]
pub fn encode_buffer_surface_state(address: u64, size: u64, surface_state_size: usize) -> Vec<u8> {
    let mut blob = Vec::with_capacity(surface_state_size);
    blob.extend_from_slice(&address.to_le_bytes());
    blob.extend_from_slice(&size.to_le_bytes());
    blob.resize(surface_state_size, 0);
    blob
}
