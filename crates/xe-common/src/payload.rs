//! Bounds-checked byte buffer used for cross-thread data and heap templates.
//!
//! Every patch the dispatch pipeline performs is "write N bytes of value V at
//! byte offset O". [`PayloadWriter`] makes the bounds check explicit so a
//! malformed descriptor surfaces as an error instead of corrupting a
//! neighbouring slot.

use crate::error::{Result, XeError};

/// Growable little-endian byte buffer with offset-addressed writes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PayloadWriter {
    bytes: Vec<u8>,
}

impl PayloadWriter {
    #[must_use]
    pub fn zeroed(len: usize) -> Self {
        Self {
            bytes: vec![0; len],
        }
    }

    #[must_use]
    pub fn from_template(template: &[u8]) -> Self {
        Self {
            bytes: template.to_vec(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Restore the buffer to a template, keeping the allocation.
    pub fn reset_to(&mut self, template: &[u8]) {
        self.bytes.clear();
        self.bytes.extend_from_slice(template);
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.bytes.len() => Ok(()),
            _ => Err(XeError::fatal(format!(
                "payload access [{offset}, +{len}) outside buffer of {} bytes",
                self.bytes.len()
            ))),
        }
    }

    /// Copy `data` to `offset`.
    pub fn write_at(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        self.check_range(offset, data.len())?;
        self.bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Fill `len` bytes at `offset` with `value`.
    pub fn fill_at(&mut self, offset: usize, len: usize, value: u8) -> Result<()> {
        self.check_range(offset, len)?;
        self.bytes[offset..offset + len].fill(value);
        Ok(())
    }

    pub fn write_u16_at(&mut self, offset: usize, value: u16) -> Result<()> {
        self.write_at(offset, &value.to_le_bytes())
    }

    pub fn write_u32_at(&mut self, offset: usize, value: u32) -> Result<()> {
        self.write_at(offset, &value.to_le_bytes())
    }

    pub fn write_u64_at(&mut self, offset: usize, value: u64) -> Result<()> {
        self.write_at(offset, &value.to_le_bytes())
    }

    /// Write a GPU pointer using the slot width declared by the descriptor
    /// (4 or 8 bytes). Four-byte slots receive the low half of the address.
    pub fn write_pointer_at(&mut self, offset: usize, slot_size: usize, address: u64) -> Result<()> {
        match slot_size {
            4 => self.write_u32_at(offset, address as u32),
            8 => self.write_u64_at(offset, address),
            other => Err(XeError::fatal(format!(
                "pointer slot at offset {offset} has unsupported width {other}"
            ))),
        }
    }

    pub fn read_at(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.check_range(offset, len)?;
        Ok(&self.bytes[offset..offset + len])
    }

    pub fn read_u16_at(&self, offset: usize) -> Result<u16> {
        let raw = self.read_at(offset, 2)?;
        Ok(u16::from_le_bytes([raw[0], raw[1]]))
    }

    pub fn read_u32_at(&self, offset: usize) -> Result<u32> {
        let raw = self.read_at(offset, 4)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    pub fn read_u64_at(&self, offset: usize) -> Result<u64> {
        let raw = self.read_at(offset, 8)?;
        let mut le = [0u8; 8];
        le.copy_from_slice(raw);
        Ok(u64::from_le_bytes(le))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_little_endian_at_offset() {
        let mut payload = PayloadWriter::zeroed(16);
        payload.write_u32_at(4, 0xdead_beef).unwrap();
        assert_eq!(&payload.as_bytes()[4..8], &[0xef, 0xbe, 0xad, 0xde]);
        assert_eq!(payload.read_u32_at(4).unwrap(), 0xdead_beef);
    }

    #[test]
    fn out_of_bounds_write_is_rejected_without_mutation() {
        let mut payload = PayloadWriter::zeroed(8);
        let err = payload.write_u64_at(4, u64::MAX).unwrap_err();
        assert!(err.is_fatal());
        assert!(payload.as_bytes().iter().all(|b| *b == 0));
    }

    #[test]
    fn offset_overflow_is_rejected() {
        let mut payload = PayloadWriter::zeroed(8);
        assert!(payload.write_at(usize::MAX, &[1]).is_err());
    }

    #[test]
    fn narrow_pointer_slot_keeps_low_half() {
        let mut payload = PayloadWriter::zeroed(12);
        payload
            .write_pointer_at(0, 4, 0x1_2345_6789)
            .unwrap();
        payload.write_pointer_at(4, 8, 0xffff_0000_1000).unwrap();
        assert_eq!(payload.read_u32_at(0).unwrap(), 0x2345_6789);
        assert_eq!(payload.read_u64_at(4).unwrap(), 0xffff_0000_1000);
        assert!(payload.write_pointer_at(0, 2, 1).is_err());
    }

    #[test]
    fn reset_restores_template() {
        let template = [1u8, 2, 3, 4];
        let mut payload = PayloadWriter::from_template(&template);
        payload.fill_at(0, 4, 0).unwrap();
        payload.reset_to(&template);
        assert_eq!(payload.as_bytes(), &template);
    }
}
