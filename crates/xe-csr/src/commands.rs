//! Abstract hardware command records.
//!
//! Every record is a header dword `opcode << 24 | payload_dwords` followed by
//! a fixed number of little-endian payload dwords for that opcode. A zeroed
//! dword decodes as [`HwCommand::Noop`], so padding and unused tails of a
//! command buffer are harmless to the command streamer.
//!
//! The layout is generation independent; it carries the fields the
//! dispatch pipeline programs, not any one family's bit packing.

use xe_common::{WalkerKind, XeError};

/// Size of the header dword that starts every record.
pub const HEADER_SIZE: usize = 4;

/// Encoded size of an [`InterfaceDescriptor`].
pub const INTERFACE_DESCRIPTOR_SIZE: usize = INTERFACE_DESCRIPTOR_DWORDS * 4;

const INTERFACE_DESCRIPTOR_DWORDS: usize = 11;

/// MMIO register holding the preemption granularity.
pub const PREEMPTION_CONTROL_REGISTER: u32 = 0x2580;

// ── Errors ──────────────────────────────────────────────────────────────────

/// Failure to decode a command record from raw bytes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("truncated record at offset {offset}: need {needed} bytes, {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("unknown opcode {opcode:#04x} at offset {offset}")]
    UnknownOpcode { opcode: u8, offset: usize },

    #[error("opcode {opcode:#04x} declares {found} payload dwords, expected {expected}")]
    LengthMismatch {
        opcode: u8,
        expected: usize,
        found: usize,
    },

    #[error("opcode {opcode:#04x} has invalid {field} value {value}")]
    InvalidField {
        opcode: u8,
        field: &'static str,
        value: u32,
    },
}

impl From<DecodeError> for XeError {
    fn from(err: DecodeError) -> Self {
        XeError::fatal(format!("command decode failed: {err}"))
    }
}

// ── Opcodes ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Noop = 0x00,
    PipelineSelect = 0x01,
    StateBaseAddress = 0x02,
    FrontEndState = 0x03,
    LoadRegisterImm = 0x04,
    InterfaceDescriptorLoad = 0x05,
    Walker = 0x06,
    PipeControl = 0x07,
    StoreDataImm = 0x08,
    SemaphoreWait = 0x09,
    StoreTimestamp = 0x0A,
    BatchBufferStart = 0x0B,
    BatchBufferEnd = 0x0C,
}

impl Opcode {
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x00 => Self::Noop,
            0x01 => Self::PipelineSelect,
            0x02 => Self::StateBaseAddress,
            0x03 => Self::FrontEndState,
            0x04 => Self::LoadRegisterImm,
            0x05 => Self::InterfaceDescriptorLoad,
            0x06 => Self::Walker,
            0x07 => Self::PipeControl,
            0x08 => Self::StoreDataImm,
            0x09 => Self::SemaphoreWait,
            0x0A => Self::StoreTimestamp,
            0x0B => Self::BatchBufferStart,
            0x0C => Self::BatchBufferEnd,
            _ => return None,
        })
    }

    /// Number of payload dwords following the header.
    #[must_use]
    pub const fn payload_dwords(self) -> usize {
        match self {
            Self::Noop | Self::BatchBufferEnd => 0,
            Self::PipelineSelect => 1,
            Self::LoadRegisterImm | Self::InterfaceDescriptorLoad => 2,
            Self::StoreTimestamp | Self::BatchBufferStart => 3,
            Self::SemaphoreWait => 4,
            Self::FrontEndState | Self::PipeControl | Self::StoreDataImm => 5,
            Self::StateBaseAddress => 13,
            Self::Walker => 13 + INTERFACE_DESCRIPTOR_DWORDS,
        }
    }

    /// Total encoded size including the header.
    #[must_use]
    pub const fn encoded_size(self) -> usize {
        HEADER_SIZE + self.payload_dwords() * 4
    }
}

// ── Command payloads ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PipelineSelect {
    pub gpgpu: bool,
    pub media_sampler_required: bool,
    pub systolic_mode: bool,
}

/// Base addresses that heap offsets in later commands are relative to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StateBaseAddress {
    pub general_state_base: u64,
    pub surface_state_base: u64,
    pub dynamic_state_base: u64,
    pub indirect_object_base: u64,
    pub instruction_base: u64,
    pub dynamic_state_size: u32,
    pub indirect_object_size: u32,
    pub instruction_size: u32,
}

/// Thread dispatch front end (VFE) programming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrontEndState {
    pub scratch_address: u64,
    pub per_thread_scratch_size: u32,
    pub max_threads: u32,
    pub large_grf: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PostSyncOp {
    #[default]
    None,
    /// Write a dword once all prior work has drained.
    WriteImmediate { address: u64, value: u32 },
    /// Write the engine timestamp once all prior work has drained.
    WriteTimestamp { address: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PipeControl {
    pub cs_stall: bool,
    pub dc_flush: bool,
    pub texture_cache_invalidate: bool,
    pub state_cache_invalidate: bool,
    pub constant_cache_invalidate: bool,
    pub instruction_cache_invalidate: bool,
    pub post_sync: PostSyncOp,
}

impl PipeControl {
    /// A command-streamer stall with no side effects.
    #[must_use]
    pub const fn stall() -> Self {
        Self {
            cs_stall: true,
            dc_flush: false,
            texture_cache_invalidate: false,
            state_cache_invalidate: false,
            constant_cache_invalidate: false,
            instruction_cache_invalidate: false,
            post_sync: PostSyncOp::None,
        }
    }

    #[must_use]
    pub const fn with_dc_flush(mut self, dc_flush: bool) -> Self {
        self.dc_flush = dc_flush;
        self
    }

    #[must_use]
    pub const fn with_post_sync(mut self, post_sync: PostSyncOp) -> Self {
        self.post_sync = post_sync;
        self
    }

    const fn flag_bits(&self) -> u32 {
        (self.cs_stall as u32)
            | (self.dc_flush as u32) << 1
            | (self.texture_cache_invalidate as u32) << 2
            | (self.state_cache_invalidate as u32) << 3
            | (self.constant_cache_invalidate as u32) << 4
            | (self.instruction_cache_invalidate as u32) << 5
    }
}

/// Comparison applied by a semaphore wait: `memory <op> data`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemaphoreCompare {
    GreaterThan,
    GreaterOrEqual,
    LessThan,
    LessOrEqual,
    Equal,
    NotEqual,
}

impl SemaphoreCompare {
    #[must_use]
    pub const fn is_satisfied(self, memory: u32, data: u32) -> bool {
        match self {
            Self::GreaterThan => memory > data,
            Self::GreaterOrEqual => memory >= data,
            Self::LessThan => memory < data,
            Self::LessOrEqual => memory <= data,
            Self::Equal => memory == data,
            Self::NotEqual => memory != data,
        }
    }

    const fn to_u32(self) -> u32 {
        match self {
            Self::GreaterThan => 0,
            Self::GreaterOrEqual => 1,
            Self::LessThan => 2,
            Self::LessOrEqual => 3,
            Self::Equal => 4,
            Self::NotEqual => 5,
        }
    }

    const fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            0 => Self::GreaterThan,
            1 => Self::GreaterOrEqual,
            2 => Self::LessThan,
            3 => Self::LessOrEqual,
            4 => Self::Equal,
            5 => Self::NotEqual,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampKind {
    Context,
    Global,
}

/// Per-dispatch kernel state: entry point, heap pointers and thread shape.
///
/// Pointers are offsets from the matching base in [`StateBaseAddress`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InterfaceDescriptor {
    pub kernel_start_pointer: u64,
    pub binding_table_pointer: u32,
    pub binding_table_entry_count: u32,
    pub sampler_state_pointer: u32,
    pub sampler_count: u32,
    pub threads_in_group: u32,
    pub slm_size: u32,
    pub cross_thread_data_length: u32,
    pub per_thread_data_length: u32,
    pub barrier_enable: bool,
    pub large_grf: bool,
    pub denorm_mode: bool,
}

impl InterfaceDescriptor {
    fn write(&self, out: &mut DwordWriter<'_>) {
        out.u64(self.kernel_start_pointer);
        out.u32(self.binding_table_pointer);
        out.u32(self.binding_table_entry_count);
        out.u32(self.sampler_state_pointer);
        out.u32(self.sampler_count);
        out.u32(self.threads_in_group);
        out.u32(self.slm_size);
        out.u32(self.cross_thread_data_length);
        out.u32(self.per_thread_data_length);
        out.u32(
            u32::from(self.barrier_enable)
                | u32::from(self.large_grf) << 1
                | u32::from(self.denorm_mode) << 2,
        );
    }

    fn read(input: &mut DwordReader<'_>) -> Self {
        let kernel_start_pointer = input.u64();
        let binding_table_pointer = input.u32();
        let binding_table_entry_count = input.u32();
        let sampler_state_pointer = input.u32();
        let sampler_count = input.u32();
        let threads_in_group = input.u32();
        let slm_size = input.u32();
        let cross_thread_data_length = input.u32();
        let per_thread_data_length = input.u32();
        let flags = input.u32();
        Self {
            kernel_start_pointer,
            binding_table_pointer,
            binding_table_entry_count,
            sampler_state_pointer,
            sampler_count,
            threads_in_group,
            slm_size,
            cross_thread_data_length,
            per_thread_data_length,
            barrier_enable: flags & 1 != 0,
            large_grf: flags & 2 != 0,
            denorm_mode: flags & 4 != 0,
        }
    }

    /// Standalone encoding, as stored in the dynamic state heap.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(INTERFACE_DESCRIPTOR_SIZE);
        self.write(&mut DwordWriter(&mut bytes));
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < INTERFACE_DESCRIPTOR_SIZE {
            return Err(DecodeError::Truncated {
                offset: 0,
                needed: INTERFACE_DESCRIPTOR_SIZE,
                available: bytes.len(),
            });
        }
        Ok(Self::read(&mut DwordReader {
            bytes: &bytes[..INTERFACE_DESCRIPTOR_SIZE],
            pos: 0,
        }))
    }
}

/// Launches a grid of thread groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkerCommand {
    pub kind: WalkerKind,
    /// Offset of this dispatch's payload from the indirect object base.
    pub indirect_data_start: u32,
    pub indirect_data_length: u32,
    /// Offset of the descriptor inside the loaded descriptor table
    /// (`GpgpuWalker` only).
    pub interface_descriptor_offset: u32,
    pub simd_size: u32,
    pub threads_per_group: u32,
    pub right_execution_mask: u32,
    pub group_id_start: [u32; 3],
    pub group_count: [u32; 3],
    pub emit_local_ids: bool,
    /// Carried by `ComputeWalker` instead of a separate descriptor load.
    pub inline_descriptor: Option<InterfaceDescriptor>,
}

// ── Command enum ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwCommand {
    Noop,
    PipelineSelect(PipelineSelect),
    StateBaseAddress(StateBaseAddress),
    FrontEndState(FrontEndState),
    LoadRegisterImm { register: u32, value: u32 },
    InterfaceDescriptorLoad { offset: u32, length: u32 },
    Walker(WalkerCommand),
    PipeControl(PipeControl),
    StoreDataImm { address: u64, value: u64, qword: bool },
    SemaphoreWait {
        address: u64,
        value: u32,
        compare: SemaphoreCompare,
    },
    StoreTimestamp { address: u64, kind: TimestampKind },
    BatchBufferStart { address: u64, second_level: bool },
    BatchBufferEnd,
}

impl HwCommand {
    #[must_use]
    pub const fn opcode(&self) -> Opcode {
        match self {
            Self::Noop => Opcode::Noop,
            Self::PipelineSelect(_) => Opcode::PipelineSelect,
            Self::StateBaseAddress(_) => Opcode::StateBaseAddress,
            Self::FrontEndState(_) => Opcode::FrontEndState,
            Self::LoadRegisterImm { .. } => Opcode::LoadRegisterImm,
            Self::InterfaceDescriptorLoad { .. } => Opcode::InterfaceDescriptorLoad,
            Self::Walker(_) => Opcode::Walker,
            Self::PipeControl(_) => Opcode::PipeControl,
            Self::StoreDataImm { .. } => Opcode::StoreDataImm,
            Self::SemaphoreWait { .. } => Opcode::SemaphoreWait,
            Self::StoreTimestamp { .. } => Opcode::StoreTimestamp,
            Self::BatchBufferStart { .. } => Opcode::BatchBufferStart,
            Self::BatchBufferEnd => Opcode::BatchBufferEnd,
        }
    }

    #[must_use]
    pub const fn encoded_size(&self) -> usize {
        self.opcode().encoded_size()
    }

    /// Append the encoded record to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        let opcode = self.opcode();
        let header = (opcode as u32) << 24 | opcode.payload_dwords() as u32;
        let mut w = DwordWriter(out);
        w.u32(header);
        match self {
            Self::Noop | Self::BatchBufferEnd => {}
            Self::PipelineSelect(ps) => w.u32(
                u32::from(ps.gpgpu)
                    | u32::from(ps.media_sampler_required) << 1
                    | u32::from(ps.systolic_mode) << 2,
            ),
            Self::StateBaseAddress(sba) => {
                w.u64(sba.general_state_base);
                w.u64(sba.surface_state_base);
                w.u64(sba.dynamic_state_base);
                w.u64(sba.indirect_object_base);
                w.u64(sba.instruction_base);
                w.u32(sba.dynamic_state_size);
                w.u32(sba.indirect_object_size);
                w.u32(sba.instruction_size);
            }
            Self::FrontEndState(fe) => {
                w.u64(fe.scratch_address);
                w.u32(fe.per_thread_scratch_size);
                w.u32(fe.max_threads);
                w.u32(u32::from(fe.large_grf));
            }
            Self::LoadRegisterImm { register, value } => {
                w.u32(*register);
                w.u32(*value);
            }
            Self::InterfaceDescriptorLoad { offset, length } => {
                w.u32(*offset);
                w.u32(*length);
            }
            Self::Walker(walker) => {
                w.u32(match walker.kind {
                    WalkerKind::GpgpuWalker => 0,
                    WalkerKind::ComputeWalker => 1,
                });
                w.u32(walker.indirect_data_start);
                w.u32(walker.indirect_data_length);
                w.u32(walker.interface_descriptor_offset);
                w.u32(walker.simd_size);
                w.u32(walker.threads_per_group);
                w.u32(walker.right_execution_mask);
                for v in walker.group_id_start {
                    w.u32(v);
                }
                for v in walker.group_count {
                    w.u32(v);
                }
                w.u32(
                    u32::from(walker.emit_local_ids)
                        | u32::from(walker.inline_descriptor.is_some()) << 1,
                );
                walker.inline_descriptor.unwrap_or_default().write(&mut w);
            }
            Self::PipeControl(pc) => {
                w.u32(pc.flag_bits());
                let (kind, address, data) = match pc.post_sync {
                    PostSyncOp::None => (0, 0, 0),
                    PostSyncOp::WriteImmediate { address, value } => (1, address, value),
                    PostSyncOp::WriteTimestamp { address } => (2, address, 0),
                };
                w.u32(kind);
                w.u64(address);
                w.u32(data);
            }
            Self::StoreDataImm {
                address,
                value,
                qword,
            } => {
                w.u64(*address);
                w.u64(*value);
                w.u32(u32::from(*qword));
            }
            Self::SemaphoreWait {
                address,
                value,
                compare,
            } => {
                w.u64(*address);
                w.u32(*value);
                w.u32(compare.to_u32());
            }
            Self::StoreTimestamp { address, kind } => {
                w.u64(*address);
                w.u32(match kind {
                    TimestampKind::Context => 0,
                    TimestampKind::Global => 1,
                });
            }
            Self::BatchBufferStart {
                address,
                second_level,
            } => {
                w.u64(*address);
                w.u32(u32::from(*second_level));
            }
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_size());
        self.encode_into(&mut out);
        out
    }
}

// ── Decoding ────────────────────────────────────────────────────────────────

/// Total record size announced by a header dword.
pub fn record_size(header: u32, offset: usize) -> Result<usize, DecodeError> {
    let opcode_byte = (header >> 24) as u8;
    let opcode = Opcode::from_u8(opcode_byte).ok_or(DecodeError::UnknownOpcode {
        opcode: opcode_byte,
        offset,
    })?;
    let declared = (header & 0xFFFF) as usize;
    if declared != opcode.payload_dwords() {
        return Err(DecodeError::LengthMismatch {
            opcode: opcode_byte,
            expected: opcode.payload_dwords(),
            found: declared,
        });
    }
    Ok(opcode.encoded_size())
}

/// Decode the record at the start of `bytes`, returning it and its size.
pub fn decode(bytes: &[u8]) -> Result<(HwCommand, usize), DecodeError> {
    decode_at(bytes, 0)
}

fn decode_at(bytes: &[u8], offset: usize) -> Result<(HwCommand, usize), DecodeError> {
    let available = bytes.len().saturating_sub(offset);
    if available < HEADER_SIZE {
        return Err(DecodeError::Truncated {
            offset,
            needed: HEADER_SIZE,
            available,
        });
    }
    let mut r = DwordReader {
        bytes: &bytes[offset..],
        pos: 0,
    };
    let header = r.u32();
    let size = record_size(header, offset)?;
    if available < size {
        return Err(DecodeError::Truncated {
            offset,
            needed: size,
            available,
        });
    }
    let opcode_byte = (header >> 24) as u8;
    let invalid = |field: &'static str, value: u32| DecodeError::InvalidField {
        opcode: opcode_byte,
        field,
        value,
    };

    let command = match Opcode::from_u8(opcode_byte) {
        None => {
            return Err(DecodeError::UnknownOpcode {
                opcode: opcode_byte,
                offset,
            });
        }
        Some(Opcode::Noop) => HwCommand::Noop,
        Some(Opcode::BatchBufferEnd) => HwCommand::BatchBufferEnd,
        Some(Opcode::PipelineSelect) => {
            let bits = r.u32();
            HwCommand::PipelineSelect(PipelineSelect {
                gpgpu: bits & 1 != 0,
                media_sampler_required: bits & 2 != 0,
                systolic_mode: bits & 4 != 0,
            })
        }
        Some(Opcode::StateBaseAddress) => HwCommand::StateBaseAddress(StateBaseAddress {
            general_state_base: r.u64(),
            surface_state_base: r.u64(),
            dynamic_state_base: r.u64(),
            indirect_object_base: r.u64(),
            instruction_base: r.u64(),
            dynamic_state_size: r.u32(),
            indirect_object_size: r.u32(),
            instruction_size: r.u32(),
        }),
        Some(Opcode::FrontEndState) => HwCommand::FrontEndState(FrontEndState {
            scratch_address: r.u64(),
            per_thread_scratch_size: r.u32(),
            max_threads: r.u32(),
            large_grf: r.u32() != 0,
        }),
        Some(Opcode::LoadRegisterImm) => HwCommand::LoadRegisterImm {
            register: r.u32(),
            value: r.u32(),
        },
        Some(Opcode::InterfaceDescriptorLoad) => HwCommand::InterfaceDescriptorLoad {
            offset: r.u32(),
            length: r.u32(),
        },
        Some(Opcode::Walker) => {
            let kind = match r.u32() {
                0 => WalkerKind::GpgpuWalker,
                1 => WalkerKind::ComputeWalker,
                other => return Err(invalid("walker kind", other)),
            };
            let indirect_data_start = r.u32();
            let indirect_data_length = r.u32();
            let interface_descriptor_offset = r.u32();
            let simd_size = r.u32();
            let threads_per_group = r.u32();
            let right_execution_mask = r.u32();
            let group_id_start = [r.u32(), r.u32(), r.u32()];
            let group_count = [r.u32(), r.u32(), r.u32()];
            let flags = r.u32();
            let descriptor = InterfaceDescriptor::read(&mut r);
            HwCommand::Walker(WalkerCommand {
                kind,
                indirect_data_start,
                indirect_data_length,
                interface_descriptor_offset,
                simd_size,
                threads_per_group,
                right_execution_mask,
                group_id_start,
                group_count,
                emit_local_ids: flags & 1 != 0,
                inline_descriptor: (flags & 2 != 0).then_some(descriptor),
            })
        }
        Some(Opcode::PipeControl) => {
            let bits = r.u32();
            let kind = r.u32();
            let address = r.u64();
            let data = r.u32();
            let post_sync = match kind {
                0 => PostSyncOp::None,
                1 => PostSyncOp::WriteImmediate {
                    address,
                    value: data,
                },
                2 => PostSyncOp::WriteTimestamp { address },
                other => return Err(invalid("post-sync operation", other)),
            };
            HwCommand::PipeControl(PipeControl {
                cs_stall: bits & 1 != 0,
                dc_flush: bits & 2 != 0,
                texture_cache_invalidate: bits & 4 != 0,
                state_cache_invalidate: bits & 8 != 0,
                constant_cache_invalidate: bits & 16 != 0,
                instruction_cache_invalidate: bits & 32 != 0,
                post_sync,
            })
        }
        Some(Opcode::StoreDataImm) => HwCommand::StoreDataImm {
            address: r.u64(),
            value: r.u64(),
            qword: r.u32() != 0,
        },
        Some(Opcode::SemaphoreWait) => {
            let address = r.u64();
            let value = r.u32();
            let raw = r.u32();
            let compare =
                SemaphoreCompare::from_u32(raw).ok_or_else(|| invalid("compare operation", raw))?;
            HwCommand::SemaphoreWait {
                address,
                value,
                compare,
            }
        }
        Some(Opcode::StoreTimestamp) => {
            let address = r.u64();
            let kind = match r.u32() {
                0 => TimestampKind::Context,
                1 => TimestampKind::Global,
                other => return Err(invalid("timestamp kind", other)),
            };
            HwCommand::StoreTimestamp { address, kind }
        }
        Some(Opcode::BatchBufferStart) => HwCommand::BatchBufferStart {
            address: r.u64(),
            second_level: r.u32() != 0,
        },
    };
    Ok((command, size))
}

/// Decode back-to-back records until `bytes` is exhausted.
pub fn decode_all(bytes: &[u8]) -> Result<Vec<HwCommand>, DecodeError> {
    let mut commands = Vec::new();
    let mut offset = 0;
    while offset < bytes.len() {
        let (command, size) = decode_at(bytes, offset)?;
        commands.push(command);
        offset += size;
    }
    Ok(commands)
}

// ── Dword helpers ───────────────────────────────────────────────────────────

struct DwordWriter<'a>(&'a mut Vec<u8>);

impl DwordWriter<'_> {
    fn u32(&mut self, value: u32) {
        self.0.extend_from_slice(&value.to_le_bytes());
    }

    fn u64(&mut self, value: u64) {
        self.u32(value as u32);
        self.u32((value >> 32) as u32);
    }
}

/// Reads dwords from a slice whose length was validated by the caller;
/// reads past the end yield zero.
struct DwordReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl DwordReader<'_> {
    fn u32(&mut self) -> u32 {
        let value = self
            .bytes
            .get(self.pos..self.pos + 4)
            .map_or(0, |b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]));
        self.pos += 4;
        value
    }

    fn u64(&mut self) -> u64 {
        let lo = u64::from(self.u32());
        let hi = u64::from(self.u32());
        hi << 32 | lo
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> InterfaceDescriptor {
        InterfaceDescriptor {
            kernel_start_pointer: 0x1_0000_4000,
            binding_table_pointer: 0x40,
            binding_table_entry_count: 3,
            sampler_state_pointer: 0x80,
            sampler_count: 1,
            threads_in_group: 2,
            slm_size: 1024,
            cross_thread_data_length: 96,
            per_thread_data_length: 64,
            barrier_enable: true,
            large_grf: false,
            denorm_mode: true,
        }
    }

    #[test]
    fn zeroed_memory_decodes_as_noops() {
        let commands = decode_all(&[0u8; 16]).unwrap();
        assert_eq!(commands, vec![HwCommand::Noop; 4]);
    }

    #[test]
    fn encoded_size_matches_bytes_written() {
        let commands = [
            HwCommand::PipeControl(PipeControl::stall()),
            HwCommand::StateBaseAddress(StateBaseAddress::default()),
            HwCommand::BatchBufferEnd,
            HwCommand::SemaphoreWait {
                address: 0x1000,
                value: 1,
                compare: SemaphoreCompare::NotEqual,
            },
        ];
        for command in commands {
            assert_eq!(command.to_bytes().len(), command.encoded_size(), "{command:?}");
        }
    }

    #[test]
    fn tag_write_pipe_control_survives_decode() {
        let pc = PipeControl::stall()
            .with_dc_flush(true)
            .with_post_sync(PostSyncOp::WriteImmediate {
                address: 0x1_0000_2000,
                value: 42,
            });
        let bytes = HwCommand::PipeControl(pc).to_bytes();
        let (decoded, size) = decode(&bytes).unwrap();
        assert_eq!(size, bytes.len());
        assert_eq!(decoded, HwCommand::PipeControl(pc));
    }

    #[test]
    fn compute_walker_carries_inline_descriptor() {
        let walker = WalkerCommand {
            kind: WalkerKind::ComputeWalker,
            indirect_data_start: 128,
            indirect_data_length: 160,
            interface_descriptor_offset: 0,
            simd_size: 32,
            threads_per_group: 2,
            right_execution_mask: u32::MAX,
            group_id_start: [0, 0, 0],
            group_count: [4, 2, 1],
            emit_local_ids: true,
            inline_descriptor: Some(descriptor()),
        };
        let (decoded, _) = decode(&HwCommand::Walker(walker).to_bytes()).unwrap();
        assert_eq!(decoded, HwCommand::Walker(walker));

        let gpgpu = WalkerCommand {
            kind: WalkerKind::GpgpuWalker,
            inline_descriptor: None,
            ..walker
        };
        let (decoded, _) = decode(&HwCommand::Walker(gpgpu).to_bytes()).unwrap();
        assert_eq!(decoded, HwCommand::Walker(gpgpu));
    }

    #[test]
    fn standalone_descriptor_has_fixed_size() {
        let bytes = descriptor().to_bytes();
        assert_eq!(bytes.len(), INTERFACE_DESCRIPTOR_SIZE);
        assert_eq!(InterfaceDescriptor::from_bytes(&bytes).unwrap(), descriptor());
        assert!(InterfaceDescriptor::from_bytes(&bytes[..8]).is_err());
        for family in xe_common::HwFamily::ALL {
            assert!(
                INTERFACE_DESCRIPTOR_SIZE
                    <= xe_common::family_traits(family).interface_descriptor_size
            );
        }
    }

    #[test]
    fn stream_of_mixed_records_decodes_in_order() {
        let mut bytes = Vec::new();
        let stream = [
            HwCommand::PipelineSelect(PipelineSelect {
                gpgpu: true,
                ..Default::default()
            }),
            HwCommand::LoadRegisterImm {
                register: PREEMPTION_CONTROL_REGISTER,
                value: 2,
            },
            HwCommand::BatchBufferStart {
                address: 0x2_0000_0000,
                second_level: true,
            },
            HwCommand::StoreTimestamp {
                address: 0x3000,
                kind: TimestampKind::Global,
            },
            HwCommand::BatchBufferEnd,
        ];
        for command in &stream {
            command.encode_into(&mut bytes);
        }
        assert_eq!(decode_all(&bytes).unwrap(), stream);
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        let header: u32 = 0x7F << 24;
        let err = decode(&header.to_le_bytes()).unwrap_err();
        assert_eq!(
            err,
            DecodeError::UnknownOpcode {
                opcode: 0x7F,
                offset: 0
            }
        );
    }

    #[test]
    fn truncated_and_mislabelled_records_are_rejected() {
        let bytes = HwCommand::PipeControl(PipeControl::stall()).to_bytes();
        assert!(matches!(
            decode(&bytes[..8]),
            Err(DecodeError::Truncated { needed: 24, .. })
        ));

        let bad_len: u32 = (Opcode::PipeControl as u32) << 24 | 2;
        assert!(matches!(
            decode(&bad_len.to_le_bytes()),
            Err(DecodeError::LengthMismatch { expected: 5, found: 2, .. })
        ));
    }

    #[test]
    fn semaphore_compare_semantics() {
        assert!(SemaphoreCompare::NotEqual.is_satisfied(7, 1));
        assert!(!SemaphoreCompare::NotEqual.is_satisfied(1, 1));
        assert!(SemaphoreCompare::GreaterOrEqual.is_satisfied(5, 5));
        assert!(!SemaphoreCompare::GreaterThan.is_satisfied(5, 5));
        assert!(SemaphoreCompare::LessOrEqual.is_satisfied(4, 5));
    }
}
