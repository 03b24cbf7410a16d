//! Command lists: walkers recorded once and replayed by queues.
//!
//! A regular list records into its own command buffers and heaps. It
//! programs state base address for its heaps itself; a queue calls the list
//! as a second-level batch and restores the engine's heaps afterwards. Full
//! buffers are chained with a first-level jump, so the list ends in exactly
//! one batch buffer end.
//!
//! An immediate list skips recording: every append is flushed to its engine
//! at once, using the engine's heaps.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, trace};
use xe_common::math::align_up;
use xe_common::{Result, TaskCount, XeError};
use xe_csr::commands::{PostSyncOp, SemaphoreCompare, StateBaseAddress, TimestampKind};
use xe_csr::{
    CommandStreamReceiver, CsrGuard, DispatchFlags, HeapType, HwCommand, IndirectHeap, LinearStream,
    Opcode, PipeControl, TASK_EPILOGUE_SIZE, TIMESTAMP_INITIAL_VALUE, TimestampPacketNode,
};
use xe_kernel::{Kernel, KernelSurfaces};
use xe_memory::{AllocationId, AllocationProperties, AllocationType, GraphicsAllocation, OwnedAllocation};

use crate::aux_translation;
use crate::device::Device;
use crate::dispatch_info::{DispatchInfo, MultiDispatchInfo};
use crate::hardware_interface::{self, DispatchTarget, encoded_size};

const PAGE_SIZE: usize = 4096;
/// Space kept free at the end of every buffer for the chaining jump.
const CHAIN_RESERVE: usize = Opcode::BatchBufferStart.encoded_size();

/// A completion flag usable inside command lists.
///
/// Wraps one timestamp node: appends signal it from the GPU, waits turn into
/// semaphores on it, and the host can poll, signal or reset it.
#[derive(Debug, Clone)]
pub struct SignalEvent {
    node: Arc<TimestampPacketNode>,
}

impl SignalEvent {
    pub fn new(device: &Device) -> Result<Self> {
        Ok(Self {
            node: device.default_engine().obtain_timestamp_node()?,
        })
    }

    #[must_use]
    pub fn is_signalled(&self) -> bool {
        self.node.is_completed()
    }

    pub fn host_signal(&self) -> Result<()> {
        self.node.host_signal(TIMESTAMP_INITIAL_VALUE + 1)
    }

    pub fn reset(&self) -> Result<()> {
        self.node.initialize()
    }

    #[must_use]
    pub fn node(&self) -> &Arc<TimestampPacketNode> {
        &self.node
    }
}

fn wait_commands(waits: &[&SignalEvent]) -> Vec<HwCommand> {
    waits
        .iter()
        .map(|event| HwCommand::SemaphoreWait {
            address: event.node.context_end_address(),
            value: TIMESTAMP_INITIAL_VALUE,
            compare: SemaphoreCompare::NotEqual,
        })
        .collect()
}

fn barrier_commands(signal: Option<&SignalEvent>) -> Vec<HwCommand> {
    let mut commands = Vec::with_capacity(5);
    if let Some(event) = signal {
        commands.extend([
            HwCommand::StoreTimestamp {
                address: event.node.context_start_address(),
                kind: TimestampKind::Context,
            },
            HwCommand::StoreTimestamp {
                address: event.node.global_start_address(),
                kind: TimestampKind::Global,
            },
        ]);
    }
    commands.push(HwCommand::PipeControl(PipeControl::stall().with_dc_flush(true)));
    if let Some(event) = signal {
        commands.extend([
            HwCommand::PipeControl(PipeControl::stall().with_post_sync(PostSyncOp::WriteTimestamp {
                address: event.node.global_end_address(),
            })),
            HwCommand::PipeControl(PipeControl::stall().with_post_sync(PostSyncOp::WriteTimestamp {
                address: event.node.context_end_address(),
            })),
        ]);
    }
    commands
}

/// Allocations a recorded list needs resident when it runs.
#[derive(Debug, Default)]
struct ResidencySet {
    ids: HashSet<AllocationId>,
    allocations: Vec<Arc<GraphicsAllocation>>,
}

impl ResidencySet {
    fn insert(&mut self, allocation: &Arc<GraphicsAllocation>) {
        if self.ids.insert(allocation.id()) {
            self.allocations.push(Arc::clone(allocation));
        }
    }

    fn clear(&mut self) {
        self.ids.clear();
        self.allocations.clear();
    }
}

/// Own buffers of a regular list.
struct Recording {
    heaps: [Option<IndirectHeap>; 3],
    /// Full buffers and heaps still referenced by recorded commands.
    retired: Vec<OwnedAllocation>,
    residency: ResidencySet,
    /// Implicit surfaces of recorded kernels, kept past the kernel's drop.
    kernel_surfaces: Vec<Arc<KernelSurfaces>>,
    last_sba: Option<StateBaseAddress>,
    first_buffer: Option<u64>,
    closed: bool,
}

impl Recording {
    fn new() -> Self {
        Self {
            heaps: [None, None, None],
            retired: Vec::new(),
            residency: ResidencySet::default(),
            kernel_surfaces: Vec::new(),
            last_sba: None,
            first_buffer: None,
            closed: false,
        }
    }

    fn heap(&self, heap_type: HeapType) -> Option<&IndirectHeap> {
        self.heaps[heap_type.index()].as_ref()
    }
}

/// [`DispatchTarget`] over a regular list's own heaps.
struct ListTarget<'a> {
    device: &'a Device,
    recording: &'a mut Recording,
}

impl DispatchTarget for ListTarget<'_> {
    fn indirect_heap(&mut self, heap_type: HeapType, min_size: usize) -> Result<&mut IndirectHeap> {
        let index = heap_type.index();
        let exhausted = self.recording.heaps[index]
            .as_ref()
            .is_none_or(|heap| heap.available() < min_size);
        if exhausted {
            let csr_config = &self.device.config().csr;
            let usable = align_up(min_size.max(csr_config.indirect_heap_size), PAGE_SIZE);
            let allocation = self.device.memory_manager().allocate(&AllocationProperties::new(
                self.device.root_device_index(),
                usable + csr_config.overfetch_bytes,
                heap_type.allocation_type(),
            ))?;
            let reserved_tail = allocation.size() - usable;
            self.recording.residency.insert(&allocation.share());
            let previous = self.recording.heaps[index].replace(IndirectHeap::new(heap_type, allocation, reserved_tail));
            if let Some(old) = previous.and_then(IndirectHeap::into_allocation) {
                self.recording.retired.push(old);
            }
            trace!(%heap_type, usable, "command list heap replaced");
        }
        self.recording.heaps[index]
            .as_mut()
            .ok_or_else(|| XeError::fatal(format!("{heap_type} missing after allocation")))
    }

    fn make_resident(&mut self, allocation: &Arc<GraphicsAllocation>) {
        self.recording.residency.insert(allocation);
    }
}

pub struct CommandList {
    device: Arc<Device>,
    /// Engine of an immediate list.
    immediate: Option<Arc<CommandStreamReceiver>>,
    stream: LinearStream,
    recording: Recording,
    /// Last task an immediate list flushed.
    task_count: TaskCount,
    appended: u64,
}

impl std::fmt::Debug for CommandList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandList")
            .field("immediate", &self.immediate.as_ref().map(|csr| csr.context_id()))
            .field("closed", &self.recording.closed)
            .field("appended", &self.appended)
            .field("used", &self.stream.used())
            .finish_non_exhaustive()
    }
}

impl CommandList {
    /// A list recorded now and executed later by a queue.
    #[must_use]
    pub fn new(device: &Arc<Device>) -> Self {
        Self {
            device: Arc::clone(device),
            immediate: None,
            stream: LinearStream::new(),
            recording: Recording::new(),
            task_count: 0,
            appended: 0,
        }
    }

    /// A list submitting every append straight to the device's default
    /// engine.
    #[must_use]
    pub fn new_immediate(device: &Arc<Device>) -> Self {
        Self {
            device: Arc::clone(device),
            immediate: Some(Arc::clone(device.default_engine())),
            stream: LinearStream::new(),
            recording: Recording::new(),
            task_count: 0,
            appended: 0,
        }
    }

    #[must_use]
    pub const fn is_immediate(&self) -> bool {
        self.immediate.is_some()
    }

    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.recording.closed
    }

    /// Commands appended since creation or the last reset.
    #[must_use]
    pub const fn appended(&self) -> u64 {
        self.appended
    }

    /// Last task count an immediate list flushed.
    #[must_use]
    pub const fn task_count(&self) -> TaskCount {
        self.task_count
    }

    /// GPU address of the first recorded command.
    pub fn start_address(&self) -> Result<u64> {
        self.recording
            .first_buffer
            .ok_or_else(|| XeError::invalid_operation("command list has no recorded commands"))
    }

    /// Make everything the recorded commands touch resident on `guard`.
    pub fn make_resident(&self, guard: &mut CsrGuard<'_>) {
        for allocation in &self.recording.residency.allocations {
            guard.make_resident(allocation);
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.recording.closed {
            return Err(XeError::invalid_operation("command list is closed"));
        }
        Ok(())
    }

    /// Launch `kernel` with its current group size over `group_count`
    /// groups, after `waits` are signalled. `signal` completes with the
    /// kernel.
    pub fn append_launch_kernel(
        &mut self,
        kernel: &mut Kernel,
        group_count: [u32; 3],
        signal: Option<&SignalEvent>,
        waits: &[&SignalEvent],
    ) -> Result<()> {
        self.check_open()?;
        if !kernel.all_args_set() {
            return Err(XeError::invalid_argument(format!(
                "kernel {} has unset arguments",
                kernel.name()
            )));
        }
        if group_count.contains(&0) {
            return Err(XeError::invalid_argument(format!("group count {group_count:?} is empty")));
        }
        kernel.set_group_count(group_count)?;
        let state = kernel.dispatch_state();
        let mut dispatch = DispatchInfo::kernel(state.clone());
        dispatch.timestamp = signal.map(|event| Arc::clone(&event.node));
        let dispatches = MultiDispatchInfo::new(aux_translation::surround_with_translation(
            &self.device,
            &state,
            vec![dispatch],
        )?);
        debug!(
            kernel = %state.kernel_name,
            walkers = dispatches.len(),
            immediate = self.is_immediate(),
            "command list kernel append"
        );
        match self.immediate.clone() {
            Some(csr) => self.flush_immediate(&csr, Some(&dispatches), waits, Vec::new(), None),
            None => {
                self.record(Some(&dispatches), waits, Vec::new(), None)?;
                self.recording.kernel_surfaces.extend(state.surfaces.clone());
                Ok(())
            }
        }
    }

    /// Order everything after the barrier behind everything before it.
    pub fn append_barrier(&mut self, signal: Option<&SignalEvent>, waits: &[&SignalEvent]) -> Result<()> {
        self.check_open()?;
        let commands = barrier_commands(signal);
        match self.immediate.clone() {
            Some(csr) => self.flush_immediate(&csr, None, waits, commands, signal),
            None => self.record(None, waits, commands, signal),
        }
    }

    /// Terminate the recording. Immediate lists have nothing to close.
    pub fn close(&mut self) -> Result<()> {
        if self.is_immediate() {
            return Err(XeError::invalid_operation("immediate command lists are not closed"));
        }
        self.check_open()?;
        self.ensure_space(Opcode::BatchBufferEnd.encoded_size())?;
        self.stream.emit(&HwCommand::BatchBufferEnd)?;
        self.recording.closed = true;
        debug!(appended = self.appended, used = self.stream.used(), "command list closed");
        Ok(())
    }

    /// Drop every recorded command, waiting for executions still using
    /// them.
    pub fn reset(&mut self) -> Result<()> {
        if let Some(csr) = &self.immediate
            && !csr.wait_for_task_count(self.task_count)
        {
            return Err(XeError::invalid_operation("immediate command list is still executing"));
        }
        self.release_buffers(true);
        self.appended = 0;
        Ok(())
    }

    /// Wait for everything an immediate list flushed.
    pub fn host_synchronize(&self) -> Result<bool> {
        let csr = self
            .immediate
            .as_ref()
            .ok_or_else(|| XeError::invalid_operation("only immediate command lists synchronize"))?;
        csr.flush()?;
        Ok(csr.wait_for_task_count(self.task_count))
    }

    fn record(
        &mut self,
        dispatches: Option<&MultiDispatchInfo>,
        waits: &[&SignalEvent],
        tail: Vec<HwCommand>,
        signal: Option<&SignalEvent>,
    ) -> Result<()> {
        let mut commands = wait_commands(waits);
        for event in waits.iter().copied().chain(signal) {
            self.recording.residency.insert(event.node.allocation());
        }
        if let Some(dispatches) = dispatches {
            let traits = self.device.hw_info().traits();
            let walkers = {
                let mut target = ListTarget {
                    device: &self.device,
                    recording: &mut self.recording,
                };
                hardware_interface::program_dispatches(
                    &mut target,
                    dispatches,
                    traits,
                    self.device.svm(),
                    self.device.root_device_index(),
                )?
            };
            let sba = hardware_interface::state_base_address(
                self.recording.heap(HeapType::SurfaceState),
                self.recording.heap(HeapType::DynamicState),
                self.recording.heap(HeapType::IndirectObject),
            );
            if self.recording.last_sba != Some(sba) {
                commands.extend(hardware_interface::state_base_address_commands(sba));
                self.recording.last_sba = Some(sba);
            }
            commands.extend(walkers);
        }
        commands.extend(tail);
        self.ensure_space(encoded_size(&commands))?;
        self.stream.emit_all(&commands)?;
        self.appended += 1;
        Ok(())
    }

    fn flush_immediate(
        &mut self,
        csr: &Arc<CommandStreamReceiver>,
        dispatches: Option<&MultiDispatchInfo>,
        waits: &[&SignalEvent],
        tail: Vec<HwCommand>,
        signal: Option<&SignalEvent>,
    ) -> Result<()> {
        let mut guard = csr.obtain_unique_ownership();
        let mut commands = wait_commands(waits);
        for event in waits.iter().copied().chain(signal) {
            guard.make_resident(event.node.allocation());
        }
        let mut flags = DispatchFlags::empty().with_dc_flush(true);
        if let Some(dispatches) = dispatches {
            commands.extend(hardware_interface::program_dispatches(
                &mut guard,
                dispatches,
                csr.family_traits(),
                self.device.svm(),
                self.device.root_device_index(),
            )?);
            flags.large_grf = dispatches.requires_large_grf();
            flags.slm_used = dispatches.slm_used();
            flags.per_thread_scratch_size = dispatches.per_thread_scratch_size();
        }
        commands.extend(tail);
        let size = encoded_size(&commands) + TASK_EPILOGUE_SIZE;
        guard.ensure_command_buffer_allocation(&mut self.stream, size, csr.config().overfetch_bytes)?;
        let start = self.stream.used();
        self.stream.emit_all(&commands)?;
        let task_level = csr.task_level() + 1;
        let stamp = match guard.flush_task(&mut self.stream, start, task_level, &flags) {
            Ok(stamp) => stamp,
            Err(err) => {
                self.stream.set_used(start)?;
                return Err(err);
            }
        };
        self.task_count = stamp.task_count;
        self.appended += 1;
        trace!(task_count = stamp.task_count, "immediate append flushed");
        Ok(())
    }

    /// Make room for `size` bytes plus a chaining jump, chaining to a new
    /// buffer when the current one is full.
    fn ensure_space(&mut self, size: usize) -> Result<()> {
        let needed = size + CHAIN_RESERVE;
        if self.stream.has_allocation() && self.stream.available() >= needed {
            return Ok(());
        }
        let csr_config = &self.device.config().csr;
        let usable = align_up(needed.max(csr_config.command_buffer_size), PAGE_SIZE);
        let allocation = self.device.memory_manager().allocate(&AllocationProperties::new(
            self.device.root_device_index(),
            usable + csr_config.overfetch_bytes,
            AllocationType::CommandBuffer,
        ))?;
        let reserved_tail = allocation.size() - usable;
        let address = allocation.gpu_address();
        self.recording.residency.insert(&allocation.share());
        if self.stream.has_allocation() {
            if self.stream.available() < CHAIN_RESERVE {
                return Err(XeError::fatal("command list buffer overran its chaining reserve"));
            }
            self.stream.emit(&HwCommand::BatchBufferStart {
                address,
                second_level: false,
            })?;
            trace!(to = format_args!("{address:#x}"), "command list buffer chained");
        } else if self.recording.first_buffer.is_none() {
            self.recording.first_buffer = Some(address);
        }
        if let Some(old) = self.stream.replace_buffer(allocation, reserved_tail) {
            self.recording.retired.push(old);
        }
        Ok(())
    }

    fn release_buffers(&mut self, blocking: bool) {
        let memory_manager = Arc::clone(self.device.memory_manager());
        let mut owned: Vec<OwnedAllocation> = std::mem::take(&mut self.recording.retired);
        owned.extend(self.stream.take_allocation());
        for heap in &mut self.recording.heaps {
            if let Some(allocation) = heap.take().and_then(IndirectHeap::into_allocation) {
                owned.push(allocation);
            }
        }
        for surfaces in self.recording.kernel_surfaces.drain(..) {
            if let Ok(surfaces) = Arc::try_unwrap(surfaces) {
                owned.extend(surfaces.into_allocations());
            }
        }
        for allocation in owned {
            memory_manager.check_gpu_usage_and_free(allocation, blocking);
        }
        self.recording.residency.clear();
        self.recording.last_sba = None;
        self.recording.first_buffer = None;
        self.recording.closed = false;
    }
}

impl Drop for CommandList {
    fn drop(&mut self) {
        match &self.immediate {
            Some(csr) => {
                if let Some(buffer) = self.stream.take_allocation() {
                    csr.obtain_unique_ownership().store_allocation_task_count(
                        buffer,
                        xe_memory::AllocationUsage::Temporary,
                        self.task_count,
                    );
                }
            }
            None => self.release_buffers(true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xe_common::{HwInfo, RuntimeConfig};
    use xe_csr::commands::decode_all;

    fn device() -> Arc<Device> {
        Device::simulated(HwInfo::default(), RuntimeConfig::default()).unwrap().0
    }

    #[test]
    fn closed_list_ends_in_batch_buffer_end() {
        let device = device();
        let mut list = CommandList::new(&device);
        list.append_barrier(None, &[]).unwrap();
        list.close().unwrap();
        let bytes = list.stream.read_range(0).unwrap();
        let commands = decode_all(&bytes).unwrap();
        assert_eq!(commands.last(), Some(&HwCommand::BatchBufferEnd));
        assert!(list.start_address().is_ok());
        assert!(matches!(
            list.append_barrier(None, &[]),
            Err(XeError::InvalidOperation { .. })
        ));
    }

    #[test]
    fn full_buffer_chains_to_the_next() {
        let mut config = RuntimeConfig::default();
        config.csr.command_buffer_size = PAGE_SIZE;
        let device = Device::simulated(HwInfo::default(), config).unwrap().0;
        let mut list = CommandList::new(&device);
        list.append_barrier(None, &[]).unwrap();
        let first = list.start_address().unwrap();
        let mut jump_at = list.stream.used();
        while list.recording.retired.is_empty() {
            jump_at = list.stream.used();
            list.append_barrier(None, &[]).unwrap();
        }
        let old = &list.recording.retired[0];
        assert_eq!(old.gpu_address(), first);
        let bytes = old.read_at(jump_at, CHAIN_RESERVE).unwrap();
        let (jump, _) = xe_csr::commands::decode(&bytes).unwrap();
        assert_eq!(
            jump,
            HwCommand::BatchBufferStart {
                address: list.stream.gpu_base(),
                second_level: false,
            }
        );
        assert_eq!(list.start_address().unwrap(), first);
    }

    #[test]
    fn signal_event_is_host_controllable() {
        let device = device();
        let event = SignalEvent::new(&device).unwrap();
        assert!(!event.is_signalled());
        event.host_signal().unwrap();
        assert!(event.is_signalled());
        event.reset().unwrap();
        assert!(!event.is_signalled());
    }

    #[test]
    fn immediate_lists_flush_each_append() {
        let device = device();
        let mut list = CommandList::new_immediate(&device);
        list.append_barrier(None, &[]).unwrap();
        list.append_barrier(None, &[]).unwrap();
        assert_eq!(list.task_count(), 2);
        assert!(list.host_synchronize().unwrap());
        assert!(matches!(list.close(), Err(XeError::InvalidOperation { .. })));
    }
}
