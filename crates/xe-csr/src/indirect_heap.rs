//! Indirect state heaps referenced through state base address.

use std::sync::Arc;

use xe_common::math::align_up;
use xe_common::{Result, XeError};
use xe_memory::{AllocationType, GraphicsAllocation, OwnedAllocation};

use crate::linear_stream::LinearStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapType {
    /// Interface descriptors and sampler states.
    DynamicState,
    /// Cross-thread and per-thread payloads.
    IndirectObject,
    /// Binding tables and surface states.
    SurfaceState,
}

impl HeapType {
    pub const ALL: [Self; 3] = [Self::DynamicState, Self::IndirectObject, Self::SurfaceState];

    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::DynamicState => 0,
            Self::IndirectObject => 1,
            Self::SurfaceState => 2,
        }
    }

    #[must_use]
    pub const fn allocation_type(self) -> AllocationType {
        match self {
            Self::DynamicState => AllocationType::DynamicStateHeap,
            Self::IndirectObject => AllocationType::IndirectObjectHeap,
            Self::SurfaceState => AllocationType::SurfaceStateHeap,
        }
    }
}

impl std::fmt::Display for HeapType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DynamicState => write!(f, "dsh"),
            Self::IndirectObject => write!(f, "ioh"),
            Self::SurfaceState => write!(f, "ssh"),
        }
    }
}

/// A linear heap whose contents are addressed as offsets from its base.
#[derive(Debug)]
pub struct IndirectHeap {
    heap_type: HeapType,
    stream: LinearStream,
}

impl IndirectHeap {
    #[must_use]
    pub fn new(heap_type: HeapType, allocation: OwnedAllocation, reserved_tail: usize) -> Self {
        Self {
            heap_type,
            stream: LinearStream::with_allocation(allocation, reserved_tail),
        }
    }

    #[must_use]
    pub const fn heap_type(&self) -> HeapType {
        self.heap_type
    }

    #[must_use]
    pub const fn used(&self) -> usize {
        self.stream.used()
    }

    #[must_use]
    pub const fn available(&self) -> usize {
        self.stream.available()
    }

    #[must_use]
    pub const fn max_available(&self) -> usize {
        self.stream.max_available()
    }

    #[must_use]
    pub fn gpu_base(&self) -> u64 {
        self.stream.gpu_base()
    }

    #[must_use]
    pub fn shared_allocation(&self) -> Option<Arc<GraphicsAllocation>> {
        self.stream.shared_allocation()
    }

    /// Usable size in 4 KiB pages, as programmed into state base address.
    #[must_use]
    pub const fn size_in_pages(&self) -> u32 {
        (self.stream.max_available() / xe_common::math::PAGE_SIZE) as u32
    }

    /// Pad the write position up to `alignment`.
    pub fn align(&mut self, alignment: usize) -> Result<()> {
        let aligned = align_up(self.stream.used(), alignment);
        let padding = aligned - self.stream.used();
        if padding > 0 {
            self.stream.get_space(padding)?;
        }
        Ok(())
    }

    /// Whether `size` bytes fit after aligning to `alignment`.
    #[must_use]
    pub const fn fits(&self, size: usize, alignment: usize) -> bool {
        let aligned = align_up(self.stream.used(), alignment);
        aligned + size <= self.stream.max_available()
    }

    /// Reserve `size` bytes at `alignment` and return their heap offset.
    pub fn allocate(&mut self, size: usize, alignment: usize) -> Result<usize> {
        if !self.fits(size, alignment) {
            return Err(XeError::fatal(format!(
                "{} overflow: {size} bytes at alignment {alignment}, {} available",
                self.heap_type,
                self.available()
            )));
        }
        self.align(alignment)?;
        self.stream.get_space(size)
    }

    /// Reserve space for `bytes` and copy them in, returning the heap offset.
    pub fn push(&mut self, bytes: &[u8], alignment: usize) -> Result<usize> {
        let offset = self.allocate(bytes.len(), alignment)?;
        self.stream.write_at(offset, bytes)?;
        Ok(offset)
    }

    pub fn write_at(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        self.stream.write_at(offset, bytes)
    }

    pub fn read_at(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        match self.stream.allocation() {
            Some(allocation) => allocation.read_at(offset, len),
            None => Err(XeError::fatal("read from unbacked heap")),
        }
    }

    /// Detach the backing allocation.
    pub fn into_allocation(mut self) -> Option<OwnedAllocation> {
        self.stream.take_allocation()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xe_memory::{AllocationProperties, MemoryManager};

    fn heap(size: usize) -> IndirectHeap {
        let mm = MemoryManager::new(1, 0);
        let alloc = mm
            .allocate(&AllocationProperties::new(
                0,
                size,
                HeapType::SurfaceState.allocation_type(),
            ))
            .unwrap();
        IndirectHeap::new(HeapType::SurfaceState, alloc, 0)
    }

    #[test]
    fn allocations_are_aligned() {
        let mut heap = heap(4096);
        assert_eq!(heap.allocate(10, 1).unwrap(), 0);
        assert_eq!(heap.allocate(64, 64).unwrap(), 64);
        assert_eq!(heap.used(), 128);
    }

    #[test]
    fn push_copies_bytes() {
        let mut heap = heap(4096);
        heap.allocate(4, 1).unwrap();
        let offset = heap.push(&[1, 2, 3, 4], 16).unwrap();
        assert_eq!(offset, 16);
        assert_eq!(heap.read_at(16, 4).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn overflow_accounts_for_alignment_padding() {
        let mut heap = heap(4096);
        heap.allocate(4001, 1).unwrap();
        assert!(heap.fits(64, 16));
        assert!(!heap.fits(64, 128));
        assert!(heap.allocate(64, 128).unwrap_err().is_fatal());
    }

    #[test]
    fn heap_types_map_to_allocation_types() {
        for heap_type in HeapType::ALL {
            assert!(heap_type.allocation_type().is_indirect_heap());
        }
        assert_eq!(heap(8192).size_in_pages(), 2);
    }
}
