//! Append-only command buffer backed by a GPU allocation.

use std::sync::Arc;

use xe_common::{Result, XeError};
use xe_memory::{GraphicsAllocation, OwnedAllocation};

use crate::commands::HwCommand;

/// A command buffer that commands are appended to.
///
/// The backing allocation is larger than the usable region: the tail is
/// reserved for the terminating batch-buffer-end and the command-streamer
/// overfetch slack.
#[derive(Debug, Default)]
pub struct LinearStream {
    allocation: Option<OwnedAllocation>,
    used: usize,
    max_available: usize,
}

impl LinearStream {
    /// A stream with no backing storage yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap `allocation`, leaving `reserved_tail` bytes unusable at the end.
    #[must_use]
    pub fn with_allocation(allocation: OwnedAllocation, reserved_tail: usize) -> Self {
        let max_available = allocation.size().saturating_sub(reserved_tail);
        Self {
            allocation: Some(allocation),
            used: 0,
            max_available,
        }
    }

    #[must_use]
    pub const fn used(&self) -> usize {
        self.used
    }

    #[must_use]
    pub const fn max_available(&self) -> usize {
        self.max_available
    }

    #[must_use]
    pub const fn available(&self) -> usize {
        self.max_available.saturating_sub(self.used)
    }

    #[must_use]
    pub const fn has_allocation(&self) -> bool {
        self.allocation.is_some()
    }

    #[must_use]
    pub const fn allocation(&self) -> Option<&OwnedAllocation> {
        self.allocation.as_ref()
    }

    /// A non-owning view of the backing allocation.
    #[must_use]
    pub fn shared_allocation(&self) -> Option<Arc<GraphicsAllocation>> {
        self.allocation.as_ref().map(OwnedAllocation::share)
    }

    /// GPU address of the first byte, or zero when unbacked.
    #[must_use]
    pub fn gpu_base(&self) -> u64 {
        self.allocation.as_ref().map_or(0, |a| a.gpu_address())
    }

    #[must_use]
    pub fn gpu_address_at(&self, offset: usize) -> u64 {
        self.gpu_base() + offset as u64
    }

    /// Swap in a new backing allocation and return the previous one.
    pub fn replace_buffer(
        &mut self,
        allocation: OwnedAllocation,
        reserved_tail: usize,
    ) -> Option<OwnedAllocation> {
        self.max_available = allocation.size().saturating_sub(reserved_tail);
        self.used = 0;
        self.allocation.replace(allocation)
    }

    /// Detach the backing allocation, leaving the stream empty.
    pub fn take_allocation(&mut self) -> Option<OwnedAllocation> {
        self.used = 0;
        self.max_available = 0;
        self.allocation.take()
    }

    /// Reserve `size` bytes and return their offset.
    pub fn get_space(&mut self, size: usize) -> Result<usize> {
        if self.allocation.is_none() || size > self.available() {
            return Err(XeError::fatal(format!(
                "command stream overflow: {size} bytes requested, {} available",
                self.available()
            )));
        }
        let offset = self.used;
        self.used += size;
        Ok(offset)
    }

    /// Write `bytes` at an offset previously returned by [`get_space`](Self::get_space).
    pub fn write_at(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        match &self.allocation {
            Some(allocation) => allocation.write_at(offset, bytes),
            None => Err(XeError::fatal("write to unbacked command stream")),
        }
    }

    /// Append raw bytes, returning their offset.
    pub fn append_bytes(&mut self, bytes: &[u8]) -> Result<usize> {
        let offset = self.get_space(bytes.len())?;
        self.write_at(offset, bytes)?;
        Ok(offset)
    }

    /// Append one encoded command, returning its offset.
    pub fn emit(&mut self, command: &HwCommand) -> Result<usize> {
        self.append_bytes(&command.to_bytes())
    }

    /// Append several commands back to back, returning the offset of the first.
    pub fn emit_all(&mut self, commands: &[HwCommand]) -> Result<usize> {
        let mut bytes = Vec::with_capacity(commands.iter().map(HwCommand::encoded_size).sum());
        for command in commands {
            command.encode_into(&mut bytes);
        }
        self.append_bytes(&bytes)
    }

    /// Rewind to `used` bytes, discarding anything after it.
    pub fn set_used(&mut self, used: usize) -> Result<()> {
        if used > self.max_available {
            return Err(XeError::invalid_argument(format!(
                "rewind target {used} past usable size {}",
                self.max_available
            )));
        }
        self.used = used;
        Ok(())
    }

    /// Copy of the bytes in `[start, used)`.
    pub fn read_range(&self, start: usize) -> Result<Vec<u8>> {
        match &self.allocation {
            Some(allocation) if start <= self.used => {
                allocation.read_at(start, self.used - start)
            }
            Some(_) => Err(XeError::invalid_argument(format!(
                "read start {start} past used size {}",
                self.used
            ))),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{PipeControl, decode_all};
    use xe_memory::{AllocationProperties, AllocationType, MemoryManager};

    fn stream(mm: &MemoryManager, size: usize, tail: usize) -> LinearStream {
        let alloc = mm
            .allocate(&AllocationProperties::new(0, size, AllocationType::CommandBuffer))
            .unwrap();
        LinearStream::with_allocation(alloc, tail)
    }

    #[test]
    fn unbacked_stream_rejects_writes() {
        let mut stream = LinearStream::new();
        assert_eq!(stream.available(), 0);
        assert!(stream.emit(&HwCommand::BatchBufferEnd).unwrap_err().is_fatal());
    }

    #[test]
    fn emitted_commands_land_in_backing_memory() {
        let mm = MemoryManager::new(1, 0);
        let mut stream = stream(&mm, 4096, 64);
        assert_eq!(stream.max_available(), 4096 - 64);

        let pc = HwCommand::PipeControl(PipeControl::stall());
        assert_eq!(stream.emit(&pc).unwrap(), 0);
        let second = stream.emit(&HwCommand::BatchBufferEnd).unwrap();
        assert_eq!(second, pc.encoded_size());

        let bytes = stream.read_range(0).unwrap();
        assert_eq!(decode_all(&bytes).unwrap(), vec![pc, HwCommand::BatchBufferEnd]);
    }

    #[test]
    fn reserved_tail_is_never_handed_out() {
        let mm = MemoryManager::new(1, 0);
        let mut stream = stream(&mm, 4096, 96);
        stream.get_space(4000).unwrap();
        assert!(stream.get_space(1).is_err());
        assert_eq!(stream.used(), 4000);
    }

    #[test]
    fn replace_buffer_returns_previous_allocation() {
        let mm = MemoryManager::new(1, 0);
        let mut stream = stream(&mm, 4096, 0);
        stream.get_space(128).unwrap();
        let old_address = stream.gpu_base();

        let fresh = mm
            .allocate(&AllocationProperties::new(0, 8192, AllocationType::CommandBuffer))
            .unwrap();
        let old = stream.replace_buffer(fresh, 0).unwrap();
        assert_eq!(old.gpu_address(), old_address);
        assert_eq!(stream.used(), 0);
        assert_eq!(stream.available(), 8192);
        assert_ne!(stream.gpu_base(), old_address);
    }
}
