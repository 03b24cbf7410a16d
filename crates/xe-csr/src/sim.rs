//! In-process GPU model behind the submission boundary.
//!
//! [`SimulatedGpu`] decodes submitted command buffers and performs the
//! memory side effects a command streamer would: post-sync tag writes,
//! timestamp writes, semaphore waits and walker launches. Every address it
//! touches must belong to an allocation made resident on the submitting
//! context; anything else is recorded as a page fault and the batch is
//! dropped, so its tag write never lands.
//!
//! In [`CompletionMode::Immediate`] batches run as soon as they are
//! submitted (and again whenever a waiter polls). In
//! [`CompletionMode::Manual`] they stay queued until [`SimulatedGpu::run_pending`]
//! is called, which lets callers observe in-flight states.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tracing::{error, trace};
use xe_common::{ContextId, TaskCount};
use xe_memory::{AllocationId, GraphicsAllocation, MemoryManager};

use crate::commands::{
    self, HEADER_SIZE, HwCommand, INTERFACE_DESCRIPTOR_SIZE, InterfaceDescriptor, PostSyncOp,
    StateBaseAddress,
};
use crate::submission::{BatchBuffer, FlushStamp, SubmissionBackend, SubmissionError};

const MAX_COMMANDS_PER_RUN: usize = 1 << 20;
const CLOCK_START: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionMode {
    #[default]
    Immediate,
    Manual,
}

/// One walker as the hardware saw it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutedWalker {
    pub context_id: ContextId,
    pub kernel_start_address: u64,
    pub group_id_start: [u32; 3],
    pub group_count: [u32; 3],
    pub simd_size: u32,
    pub threads_per_group: u32,
    pub right_execution_mask: u32,
    pub slm_size: u32,
    pub binding_table_address: u64,
    pub sampler_state_address: u64,
    pub sampler_count: u32,
    /// Cross-thread and per-thread payload read from the indirect object heap.
    pub indirect_data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageFault {
    pub context_id: ContextId,
    pub address: u64,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SimStats {
    pub submissions: u64,
    pub batches_completed: u64,
    pub commands_executed: u64,
    pub walkers_executed: u64,
    pub semaphore_stalls: u64,
    pub page_faults: u64,
    pub evictions: u64,
}

struct RunningBatch {
    root_device_index: u32,
    pc: u64,
    return_stack: Vec<u64>,
    task_count: TaskCount,
}

#[derive(Default)]
struct EngineRegisters {
    sba: StateBaseAddress,
    descriptor_table_offset: u32,
}

#[derive(Default)]
struct EngineState {
    queue: VecDeque<RunningBatch>,
    resident: HashSet<AllocationId>,
    registers: EngineRegisters,
}

struct SimInner {
    engines: BTreeMap<ContextId, EngineState>,
    walkers: Vec<ExecutedWalker>,
    faults: Vec<PageFault>,
    stats: SimStats,
    clock: u64,
}

/// Software command streamer for every engine context.
pub struct SimulatedGpu {
    memory_manager: Arc<MemoryManager>,
    mode: Mutex<CompletionMode>,
    inner: Mutex<SimInner>,
    next_flush_stamp: AtomicU64,
}

impl std::fmt::Debug for SimulatedGpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedGpu")
            .field("mode", &self.completion_mode())
            .field("pending", &self.pending_batches())
            .finish()
    }
}

enum Outcome {
    Completed,
    Stalled { advanced: bool },
    Faulted,
}

/// Residency-checked view of GPU memory for one batch.
struct Memory<'a> {
    memory_manager: &'a MemoryManager,
    root_device_index: u32,
    resident: &'a HashSet<AllocationId>,
}

impl Memory<'_> {
    fn locate(&self, address: u64, len: usize) -> Result<(Arc<GraphicsAllocation>, usize), String> {
        let (allocation, offset) = self
            .memory_manager
            .resolve_gpu_address(self.root_device_index, address)
            .ok_or_else(|| "address is not mapped".to_string())?;
        if !self.resident.contains(&allocation.id()) {
            return Err(format!(
                "{} ({}) is not resident",
                allocation.id(),
                allocation.allocation_type()
            ));
        }
        if offset + len > allocation.size() {
            return Err(format!(
                "{len}-byte access runs past the end of {}",
                allocation.id()
            ));
        }
        Ok((allocation, offset))
    }

    fn read(&self, address: u64, len: usize) -> Result<Vec<u8>, String> {
        let (allocation, offset) = self.locate(address, len)?;
        allocation.read_at(offset, len).map_err(|e| e.to_string())
    }

    fn read_u32(&self, address: u64) -> Result<u32, String> {
        let (allocation, offset) = self.locate(address, 4)?;
        allocation.read_u32(offset).map_err(|e| e.to_string())
    }

    fn write_u32(&self, address: u64, value: u32) -> Result<(), String> {
        let (allocation, offset) = self.locate(address, 4)?;
        allocation.write_u32(offset, value).map_err(|e| e.to_string())
    }

    fn write_u64(&self, address: u64, value: u64) -> Result<(), String> {
        let (allocation, offset) = self.locate(address, 8)?;
        allocation.write_u64(offset, value).map_err(|e| e.to_string())
    }

    fn fetch(&self, pc: u64) -> Result<(HwCommand, usize), String> {
        let header = self.read_u32(pc)?;
        let size = commands::record_size(header, 0).map_err(|e| e.to_string())?;
        let bytes = if size == HEADER_SIZE {
            header.to_le_bytes().to_vec()
        } else {
            self.read(pc, size)?
        };
        commands::decode(&bytes).map_err(|e| e.to_string())
    }
}

struct Outputs<'a> {
    walkers: &'a mut Vec<ExecutedWalker>,
    faults: &'a mut Vec<PageFault>,
    stats: &'a mut SimStats,
    clock: &'a mut u64,
}

impl Outputs<'_> {
    fn fault(&mut self, context_id: ContextId, address: u64, reason: String) -> Outcome {
        error!(context_id, address = format_args!("{address:#x}"), %reason, "gpu page fault");
        self.stats.page_faults += 1;
        self.faults.push(PageFault {
            context_id,
            address,
            reason,
        });
        Outcome::Faulted
    }
}

fn launch_walker(
    memory: &Memory<'_>,
    context_id: ContextId,
    registers: &EngineRegisters,
    walker: &commands::WalkerCommand,
) -> Result<ExecutedWalker, String> {
    let sba = &registers.sba;
    let descriptor = match walker.inline_descriptor {
        Some(descriptor) => descriptor,
        None => {
            let address = sba.dynamic_state_base
                + u64::from(registers.descriptor_table_offset)
                + u64::from(walker.interface_descriptor_offset);
            let bytes = memory.read(address, INTERFACE_DESCRIPTOR_SIZE)?;
            InterfaceDescriptor::from_bytes(&bytes).map_err(|e| e.to_string())?
        }
    };

    let kernel_start_address = sba.instruction_base + descriptor.kernel_start_pointer;
    memory.read(kernel_start_address, 4)?;

    let binding_table_address =
        sba.surface_state_base + u64::from(descriptor.binding_table_pointer);
    if descriptor.binding_table_entry_count > 0 {
        memory.read(
            binding_table_address,
            descriptor.binding_table_entry_count as usize * 4,
        )?;
    }
    let sampler_state_address =
        sba.dynamic_state_base + u64::from(descriptor.sampler_state_pointer);
    if descriptor.sampler_count > 0 {
        memory.read(sampler_state_address, 4)?;
    }

    let indirect_data = if walker.indirect_data_length > 0 {
        memory.read(
            sba.indirect_object_base + u64::from(walker.indirect_data_start),
            walker.indirect_data_length as usize,
        )?
    } else {
        Vec::new()
    };

    Ok(ExecutedWalker {
        context_id,
        kernel_start_address,
        group_id_start: walker.group_id_start,
        group_count: walker.group_count,
        simd_size: walker.simd_size,
        threads_per_group: walker.threads_per_group,
        right_execution_mask: walker.right_execution_mask,
        slm_size: descriptor.slm_size,
        binding_table_address,
        sampler_state_address,
        sampler_count: descriptor.sampler_count,
        indirect_data,
    })
}

fn execute(
    memory: &Memory<'_>,
    context_id: ContextId,
    registers: &mut EngineRegisters,
    batch: &mut RunningBatch,
    out: &mut Outputs<'_>,
) -> Outcome {
    let mut advanced = false;
    for _ in 0..MAX_COMMANDS_PER_RUN {
        let pc = batch.pc;
        let (command, size) = match memory.fetch(pc) {
            Ok(decoded) => decoded,
            Err(reason) => return out.fault(context_id, pc, reason),
        };
        let next = pc + size as u64;
        *out.clock += 1;
        let now = *out.clock as u32;

        let result: Result<(), String> = match &command {
            HwCommand::Noop
            | HwCommand::PipelineSelect(_)
            | HwCommand::FrontEndState(_)
            | HwCommand::LoadRegisterImm { .. } => Ok(()),
            HwCommand::StateBaseAddress(sba) => {
                registers.sba = *sba;
                Ok(())
            }
            HwCommand::InterfaceDescriptorLoad { offset, .. } => {
                registers.descriptor_table_offset = *offset;
                Ok(())
            }
            HwCommand::Walker(walker) => {
                launch_walker(memory, context_id, registers, walker).map(|executed| {
                    out.stats.walkers_executed += 1;
                    out.walkers.push(executed);
                })
            }
            HwCommand::PipeControl(control) => match control.post_sync {
                PostSyncOp::None => Ok(()),
                PostSyncOp::WriteImmediate { address, value } => memory.write_u32(address, value),
                PostSyncOp::WriteTimestamp { address } => memory.write_u32(address, now),
            },
            HwCommand::StoreDataImm {
                address,
                value,
                qword,
            } => {
                if *qword {
                    memory.write_u64(*address, *value)
                } else {
                    memory.write_u32(*address, *value as u32)
                }
            }
            HwCommand::StoreTimestamp { address, .. } => memory.write_u32(*address, now),
            HwCommand::SemaphoreWait {
                address,
                value,
                compare,
            } => match memory.read_u32(*address) {
                Ok(current) if compare.is_satisfied(current, *value) => Ok(()),
                Ok(_) => {
                    out.stats.semaphore_stalls += 1;
                    return Outcome::Stalled { advanced };
                }
                Err(reason) => Err(reason),
            },
            HwCommand::BatchBufferStart {
                address,
                second_level,
            } => {
                if *second_level {
                    batch.return_stack.push(next);
                }
                batch.pc = *address;
                out.stats.commands_executed += 1;
                advanced = true;
                continue;
            }
            HwCommand::BatchBufferEnd => {
                out.stats.commands_executed += 1;
                match batch.return_stack.pop() {
                    Some(return_address) => {
                        batch.pc = return_address;
                        advanced = true;
                        continue;
                    }
                    None => return Outcome::Completed,
                }
            }
        };

        if let Err(reason) = result {
            return out.fault(context_id, pc, reason);
        }
        out.stats.commands_executed += 1;
        batch.pc = next;
        advanced = true;
    }
    out.fault(
        context_id,
        batch.pc,
        format!("batch did not terminate within {MAX_COMMANDS_PER_RUN} commands"),
    )
}

impl SimulatedGpu {
    #[must_use]
    pub fn new(memory_manager: Arc<MemoryManager>) -> Self {
        Self::with_mode(memory_manager, CompletionMode::Immediate)
    }

    #[must_use]
    pub fn with_mode(memory_manager: Arc<MemoryManager>, mode: CompletionMode) -> Self {
        Self {
            memory_manager,
            mode: Mutex::new(mode),
            inner: Mutex::new(SimInner {
                engines: BTreeMap::new(),
                walkers: Vec::new(),
                faults: Vec::new(),
                stats: SimStats::default(),
                clock: CLOCK_START,
            }),
            next_flush_stamp: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn completion_mode(&self) -> CompletionMode {
        *self.mode.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Switching to immediate mode drains anything already queued.
    pub fn set_completion_mode(&self, mode: CompletionMode) {
        *self.mode.lock().unwrap_or_else(PoisonError::into_inner) = mode;
        if mode == CompletionMode::Immediate {
            self.run_pending();
        }
    }

    /// Execute queued batches until every engine is idle or stalled on a
    /// semaphore. Returns the number of batches that completed.
    pub fn run_pending(&self) -> usize {
        let mut guard = self.lock();
        let SimInner {
            engines,
            walkers,
            faults,
            stats,
            clock,
        } = &mut *guard;

        let mut completed = 0;
        loop {
            let mut progress = false;
            for (context_id, engine) in engines.iter_mut() {
                while let Some(mut batch) = engine.queue.pop_front() {
                    let memory = Memory {
                        memory_manager: &self.memory_manager,
                        root_device_index: batch.root_device_index,
                        resident: &engine.resident,
                    };
                    let mut out = Outputs {
                        walkers: &mut *walkers,
                        faults: &mut *faults,
                        stats: &mut *stats,
                        clock: &mut *clock,
                    };
                    match execute(&memory, *context_id, &mut engine.registers, &mut batch, &mut out)
                    {
                        Outcome::Completed => {
                            stats.batches_completed += 1;
                            completed += 1;
                            progress = true;
                            trace!(context_id, task_count = batch.task_count, "batch completed");
                        }
                        Outcome::Faulted => progress = true,
                        Outcome::Stalled { advanced } => {
                            progress |= advanced;
                            engine.queue.push_front(batch);
                            break;
                        }
                    }
                }
            }
            if !progress {
                break;
            }
        }
        completed
    }

    #[must_use]
    pub fn pending_batches(&self) -> usize {
        self.lock().engines.values().map(|e| e.queue.len()).sum()
    }

    #[must_use]
    pub fn executed_walkers(&self) -> Vec<ExecutedWalker> {
        self.lock().walkers.clone()
    }

    pub fn take_executed_walkers(&self) -> Vec<ExecutedWalker> {
        std::mem::take(&mut self.lock().walkers)
    }

    #[must_use]
    pub fn page_faults(&self) -> Vec<PageFault> {
        self.lock().faults.clone()
    }

    #[must_use]
    pub fn stats(&self) -> SimStats {
        self.lock().stats.clone()
    }

    /// Whether `allocation` is currently resident on `context_id`.
    #[must_use]
    pub fn is_resident(&self, context_id: ContextId, allocation: AllocationId) -> bool {
        self.lock()
            .engines
            .get(&context_id)
            .is_some_and(|engine| engine.resident.contains(&allocation))
    }
}

impl SubmissionBackend for SimulatedGpu {
    fn name(&self) -> &str {
        "simulated-gpu"
    }

    fn submit(
        &self,
        batch: &BatchBuffer,
        residency: &[Arc<GraphicsAllocation>],
    ) -> Result<FlushStamp, SubmissionError> {
        if batch.used_size == 0 {
            return Err(SubmissionError::Rejected {
                reason: "empty batch".into(),
            });
        }
        let flush_stamp = self.next_flush_stamp.fetch_add(1, Ordering::Relaxed);
        {
            let mut inner = self.lock();
            inner.stats.submissions += 1;
            let engine = inner.engines.entry(batch.context_id).or_default();
            engine
                .resident
                .extend(residency.iter().map(|allocation| allocation.id()));
            engine.queue.push_back(RunningBatch {
                root_device_index: batch.command_buffer.root_device_index(),
                pc: batch.start_address(),
                return_stack: Vec::new(),
                task_count: batch.task_count,
            });
        }
        trace!(
            context_id = batch.context_id,
            task_count = batch.task_count,
            flush_stamp,
            residency = residency.len(),
            "batch submitted"
        );
        if self.completion_mode() == CompletionMode::Immediate {
            self.run_pending();
        }
        Ok(flush_stamp)
    }

    fn process_eviction(&self, context_id: ContextId, evicted: &[Arc<GraphicsAllocation>]) {
        let mut inner = self.lock();
        inner.stats.evictions += evicted.len() as u64;
        if let Some(engine) = inner.engines.get_mut(&context_id) {
            for allocation in evicted {
                engine.resident.remove(&allocation.id());
            }
        }
    }

    fn poll(&self) {
        if self.completion_mode() == CompletionMode::Immediate {
            self.run_pending();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{PipeControl, SemaphoreCompare, WalkerCommand};
    use crate::dispatch_flags::QueueThrottle;
    use crate::linear_stream::LinearStream;
    use xe_common::WalkerKind;
    use xe_memory::{AllocationProperties, AllocationType, OwnedAllocation};

    struct Fixture {
        mm: Arc<MemoryManager>,
        gpu: SimulatedGpu,
        tag: OwnedAllocation,
    }

    fn fixture(mode: CompletionMode) -> Fixture {
        let mm = Arc::new(MemoryManager::new(1, 0));
        let gpu = SimulatedGpu::with_mode(Arc::clone(&mm), mode);
        let tag = mm
            .allocate(&AllocationProperties::new(0, 4096, AllocationType::TagBuffer))
            .unwrap();
        Fixture { mm, gpu, tag }
    }

    fn buffer(mm: &MemoryManager, kind: AllocationType) -> OwnedAllocation {
        mm.allocate(&AllocationProperties::new(0, 4096, kind)).unwrap()
    }

    fn batch(stream: &LinearStream, task_count: TaskCount) -> BatchBuffer {
        BatchBuffer {
            command_buffer: stream.shared_allocation().unwrap(),
            start_offset: 0,
            used_size: stream.used(),
            context_id: 0,
            task_count,
            requires_coherency: false,
            low_priority: false,
            throttle: QueueThrottle::Medium,
        }
    }

    fn tag_write(tag: &GraphicsAllocation, value: u32) -> HwCommand {
        HwCommand::PipeControl(PipeControl::stall().with_post_sync(
            PostSyncOp::WriteImmediate {
                address: tag.gpu_address(),
                value,
            },
        ))
    }

    #[test]
    fn immediate_mode_writes_tag_on_submit() {
        let f = fixture(CompletionMode::Immediate);
        let mut stream = LinearStream::with_allocation(buffer(&f.mm, AllocationType::CommandBuffer), 0);
        stream
            .emit_all(&[tag_write(&f.tag, 7), HwCommand::BatchBufferEnd])
            .unwrap();
        let residency = [f.tag.share(), stream.shared_allocation().unwrap()];
        f.gpu.submit(&batch(&stream, 7), &residency).unwrap();

        assert_eq!(f.tag.read_u32(0).unwrap(), 7);
        assert_eq!(f.gpu.pending_batches(), 0);
        assert_eq!(f.gpu.stats().batches_completed, 1);
    }

    #[test]
    fn manual_mode_defers_until_run() {
        let f = fixture(CompletionMode::Manual);
        let mut stream = LinearStream::with_allocation(buffer(&f.mm, AllocationType::CommandBuffer), 0);
        stream
            .emit_all(&[tag_write(&f.tag, 1), HwCommand::BatchBufferEnd])
            .unwrap();
        let residency = [f.tag.share(), stream.shared_allocation().unwrap()];
        f.gpu.submit(&batch(&stream, 1), &residency).unwrap();

        assert_eq!(f.tag.read_u32(0).unwrap(), 0);
        assert_eq!(f.gpu.pending_batches(), 1);
        f.gpu.poll();
        assert_eq!(f.gpu.pending_batches(), 1);
        assert_eq!(f.gpu.run_pending(), 1);
        assert_eq!(f.tag.read_u32(0).unwrap(), 1);
    }

    #[test]
    fn non_resident_access_faults_and_drops_batch() {
        let f = fixture(CompletionMode::Immediate);
        let mut stream = LinearStream::with_allocation(buffer(&f.mm, AllocationType::CommandBuffer), 0);
        stream
            .emit_all(&[tag_write(&f.tag, 3), HwCommand::BatchBufferEnd])
            .unwrap();
        f.gpu
            .submit(&batch(&stream, 3), &[stream.shared_allocation().unwrap()])
            .unwrap();

        assert_eq!(f.tag.read_u32(0).unwrap(), 0);
        let faults = f.gpu.page_faults();
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].address, stream.gpu_base());
        assert_eq!(f.gpu.pending_batches(), 0);
    }

    #[test]
    fn semaphore_stalls_until_memory_changes() {
        let f = fixture(CompletionMode::Immediate);
        let flag = buffer(&f.mm, AllocationType::TimestampPacketTagBuffer);
        flag.write_u32(0, 1).unwrap();

        let mut stream = LinearStream::with_allocation(buffer(&f.mm, AllocationType::CommandBuffer), 0);
        stream
            .emit_all(&[
                HwCommand::SemaphoreWait {
                    address: flag.gpu_address(),
                    value: 1,
                    compare: SemaphoreCompare::NotEqual,
                },
                tag_write(&f.tag, 2),
                HwCommand::BatchBufferEnd,
            ])
            .unwrap();
        let residency = [f.tag.share(), flag.share(), stream.shared_allocation().unwrap()];
        f.gpu.submit(&batch(&stream, 2), &residency).unwrap();

        assert_eq!(f.gpu.pending_batches(), 1);
        assert_eq!(f.tag.read_u32(0).unwrap(), 0);
        assert!(f.gpu.stats().semaphore_stalls >= 1);

        flag.write_u32(0, 55).unwrap();
        f.gpu.poll();
        assert_eq!(f.tag.read_u32(0).unwrap(), 2);
    }

    #[test]
    fn second_level_batch_returns_to_caller() {
        let f = fixture(CompletionMode::Immediate);
        let mut task = LinearStream::with_allocation(buffer(&f.mm, AllocationType::CommandBuffer), 0);
        task.emit_all(&[
            HwCommand::StoreDataImm {
                address: f.tag.gpu_address() + 8,
                value: 0xABCD,
                qword: false,
            },
            HwCommand::BatchBufferEnd,
        ])
        .unwrap();

        let mut ring = LinearStream::with_allocation(buffer(&f.mm, AllocationType::CommandBuffer), 0);
        ring.emit_all(&[
            HwCommand::BatchBufferStart {
                address: task.gpu_base(),
                second_level: true,
            },
            tag_write(&f.tag, 9),
            HwCommand::BatchBufferEnd,
        ])
        .unwrap();

        let residency = [
            f.tag.share(),
            task.shared_allocation().unwrap(),
            ring.shared_allocation().unwrap(),
        ];
        f.gpu.submit(&batch(&ring, 9), &residency).unwrap();
        assert_eq!(f.tag.read_u32(8).unwrap(), 0xABCD);
        assert_eq!(f.tag.read_u32(0).unwrap(), 9);
    }

    #[test]
    fn gpgpu_walker_reads_descriptor_and_payload() {
        let f = fixture(CompletionMode::Immediate);
        let isa = buffer(&f.mm, AllocationType::KernelIsa);
        let dsh = buffer(&f.mm, AllocationType::DynamicStateHeap);
        let ioh = buffer(&f.mm, AllocationType::IndirectObjectHeap);
        let descriptor = InterfaceDescriptor {
            kernel_start_pointer: isa.gpu_address(),
            threads_in_group: 2,
            slm_size: 256,
            ..Default::default()
        };
        dsh.write_at(64, &descriptor.to_bytes()).unwrap();
        ioh.write_at(128, &[9, 8, 7, 6]).unwrap();

        let mut stream = LinearStream::with_allocation(buffer(&f.mm, AllocationType::CommandBuffer), 0);
        stream
            .emit_all(&[
                HwCommand::StateBaseAddress(StateBaseAddress {
                    dynamic_state_base: dsh.gpu_address(),
                    indirect_object_base: ioh.gpu_address(),
                    ..Default::default()
                }),
                HwCommand::InterfaceDescriptorLoad {
                    offset: 64,
                    length: INTERFACE_DESCRIPTOR_SIZE as u32,
                },
                HwCommand::Walker(WalkerCommand {
                    kind: WalkerKind::GpgpuWalker,
                    indirect_data_start: 128,
                    indirect_data_length: 4,
                    interface_descriptor_offset: 0,
                    simd_size: 32,
                    threads_per_group: 2,
                    right_execution_mask: u32::MAX,
                    group_id_start: [0; 3],
                    group_count: [3, 1, 1],
                    emit_local_ids: false,
                    inline_descriptor: None,
                }),
                HwCommand::BatchBufferEnd,
            ])
            .unwrap();
        let residency = [
            isa.share(),
            dsh.share(),
            ioh.share(),
            stream.shared_allocation().unwrap(),
        ];
        f.gpu.submit(&batch(&stream, 1), &residency).unwrap();

        assert!(f.gpu.page_faults().is_empty());
        let walkers = f.gpu.executed_walkers();
        assert_eq!(walkers.len(), 1);
        assert_eq!(walkers[0].kernel_start_address, isa.gpu_address());
        assert_eq!(walkers[0].group_count, [3, 1, 1]);
        assert_eq!(walkers[0].slm_size, 256);
        assert_eq!(walkers[0].indirect_data, vec![9, 8, 7, 6]);
    }

    #[test]
    fn eviction_removes_residency() {
        let f = fixture(CompletionMode::Immediate);
        let mut stream = LinearStream::with_allocation(buffer(&f.mm, AllocationType::CommandBuffer), 0);
        stream
            .emit_all(&[tag_write(&f.tag, 1), HwCommand::BatchBufferEnd])
            .unwrap();
        let residency = [f.tag.share(), stream.shared_allocation().unwrap()];
        f.gpu.submit(&batch(&stream, 1), &residency).unwrap();
        assert!(f.gpu.is_resident(0, f.tag.id()));

        f.gpu.process_eviction(0, &[f.tag.share()]);
        assert!(!f.gpu.is_resident(0, f.tag.id()));
        assert_eq!(f.gpu.stats().evictions, 1);
    }
}
