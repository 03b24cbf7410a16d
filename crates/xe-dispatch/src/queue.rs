//! Command queues.
//!
//! Every enqueue resolves its wait list first. With all predecessors ready
//! the work is programmed into the queue's task stream and flushed through
//! the engine at once; otherwise it is frozen into a blocked command that
//! replays when its last predecessor is released. In-order queues chain each
//! new command behind the last blocked one (the queue's *virtual event*), so
//! program order survives blocking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::{debug, error, info, trace, warn};
use xe_common::{Result, TaskCount, XeError};
use xe_csr::{
    CommandStreamReceiver, CompletionStamp, CsrGuard, DispatchFlags, EngineUsage, HeapType,
    HwCommand, LinearStream, TASK_EPILOGUE_SIZE, TaskLevel, TimestampPacketContainer,
};
use xe_kernel::Kernel;
use xe_memory::AllocationUsage;

use crate::aux_translation;
use crate::blocked::{BlockedCommand, BlockedWork};
use crate::command_list::CommandList;
use crate::device::Device;
use crate::dispatch_info::{DefaultWalkerBuilder, DispatchInfoBuilder, DispatchKind, MultiDispatchInfo};
use crate::event::{Event, EventKind, ExecutionStatus, ParentState, ProfilingClock, WaitStatus};
use crate::hardware_interface::{self, encoded_size};
use crate::trace::{DispatchRecord, DispatchTracer};

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueProperties {
    pub out_of_order: bool,
    pub profiling: bool,
    pub engine: EngineUsage,
}

impl Default for QueueProperties {
    fn default() -> Self {
        Self {
            out_of_order: false,
            profiling: false,
            engine: EngineUsage::Regular,
        }
    }
}

/// Index space of one kernel enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NdRange {
    pub work_dim: u32,
    pub global_offset: [u32; 3],
    pub global_size: [u32; 3],
    /// `None` lets the driver pick a group size.
    pub local_size: Option<[u32; 3]>,
}

impl NdRange {
    #[must_use]
    pub const fn new(work_dim: u32, global_size: [u32; 3]) -> Self {
        Self {
            work_dim,
            global_offset: [0; 3],
            global_size,
            local_size: None,
        }
    }

    #[must_use]
    pub const fn linear(global_size: u32) -> Self {
        Self::new(1, [global_size, 1, 1])
    }

    #[must_use]
    pub const fn with_local_size(mut self, local_size: [u32; 3]) -> Self {
        self.local_size = Some(local_size);
        self
    }

    #[must_use]
    pub const fn with_global_offset(mut self, global_offset: [u32; 3]) -> Self {
        self.global_offset = global_offset;
        self
    }

    /// Dimensions past `work_dim` collapse to size 1 and offset 0.
    fn normalized(&self) -> Result<Self> {
        if !(1..=3).contains(&self.work_dim) {
            return Err(XeError::invalid_argument(format!(
                "work_dim {} outside 1..=3",
                self.work_dim
            )));
        }
        let dims = self.work_dim as usize;
        let mut range = *self;
        for dim in dims..3 {
            range.global_size[dim] = 1;
            range.global_offset[dim] = 0;
            if let Some(local) = range.local_size.as_mut() {
                local[dim] = 1;
            }
        }
        if range.global_size[..dims].contains(&0) {
            return Err(XeError::invalid_argument(format!(
                "global size {:?} has an empty dimension",
                range.global_size
            )));
        }
        Ok(range)
    }
}

/// Per-enqueue knobs.
#[derive(Clone, Default)]
pub struct EnqueueOptions {
    pub wait_list: Vec<Arc<Event>>,
    /// Return only once the work completed (or the wait timed out).
    pub blocking: bool,
    /// Hand an event back to the caller.
    pub want_event: bool,
    /// Splits the kernel into walkers; one walker when unset.
    pub builder: Option<Arc<dyn DispatchInfoBuilder>>,
}

impl std::fmt::Debug for EnqueueOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnqueueOptions")
            .field("wait_list", &self.wait_list.len())
            .field("blocking", &self.blocking)
            .field("want_event", &self.want_event)
            .field("builder", &self.builder.as_ref().map(|b| b.name()))
            .finish()
    }
}

impl EnqueueOptions {
    #[must_use]
    pub fn new() -> Self {
        Self {
            want_event: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn wait_for(mut self, events: &[Arc<Event>]) -> Self {
        self.wait_list.extend(events.iter().cloned());
        self
    }

    #[must_use]
    pub const fn blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    #[must_use]
    pub const fn want_event(mut self, want_event: bool) -> Self {
        self.want_event = want_event;
        self
    }

    #[must_use]
    pub fn with_builder(mut self, builder: Arc<dyn DispatchInfoBuilder>) -> Self {
        self.builder = Some(builder);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub kernels: u64,
    pub markers: u64,
    pub barriers: u64,
    pub walkers: u64,
    pub aux_translation_passes: u64,
    pub blocked_commands: u64,
    pub replayed_commands: u64,
    pub aborted_commands: u64,
    pub command_lists_executed: u64,
    pub blocking_timeouts: u64,
}

struct QueueState {
    command_stream: LinearStream,
    task_level: TaskLevel,
    /// Highest level handed to any command; out-of-order barriers order
    /// behind it.
    max_task_level: TaskLevel,
    /// Last task count this queue flushed.
    task_count: TaskCount,
    /// In-order: the last blocked command. Out-of-order: the last blocked
    /// barrier.
    virtual_event: Option<Arc<Event>>,
    /// Out-of-order: every blocked command not yet released.
    blocked: Vec<Arc<Event>>,
    last_timestamps: TimestampPacketContainer,
    sequence: u64,
    stats: QueueStats,
}

fn blocks(event: &Event) -> bool {
    !event.is_ready_for_submission() && !event.execution_status().is_error()
}

fn check_wait_list(wait_list: &[Arc<Event>]) -> Result<()> {
    for event in wait_list {
        if let ExecutionStatus::Error(status) = event.execution_status() {
            return Err(XeError::ExecStatusError { status });
        }
    }
    Ok(())
}

pub(crate) struct QueueShared {
    id: u64,
    device: Arc<Device>,
    csr: Arc<CommandStreamReceiver>,
    properties: QueueProperties,
    clock: Option<ProfilingClock>,
    tracer: Option<DispatchTracer>,
    state: Mutex<QueueState>,
}

/// Submits kernels, markers, barriers and command lists to one engine.
pub struct CommandQueue {
    shared: Arc<QueueShared>,
}

impl std::fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandQueue")
            .field("id", &self.shared.id)
            .field("properties", &self.shared.properties)
            .field("context_id", &self.shared.csr.context_id())
            .finish_non_exhaustive()
    }
}

impl CommandQueue {
    pub fn new(device: &Arc<Device>, properties: QueueProperties) -> Result<Self> {
        let csr = Arc::clone(device.engine(properties.engine)?);
        let id = NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed);
        let tracer = device
            .config()
            .debug
            .dump_dispatch_dir
            .as_ref()
            .map(DispatchTracer::new);
        info!(
            queue = id,
            context_id = csr.context_id(),
            out_of_order = properties.out_of_order,
            profiling = properties.profiling,
            "command queue created"
        );
        Ok(Self {
            shared: Arc::new(QueueShared {
                id,
                device: Arc::clone(device),
                clock: properties.profiling.then(|| device.profiling_clock()),
                csr,
                properties,
                tracer,
                state: Mutex::new(QueueState {
                    command_stream: LinearStream::new(),
                    task_level: 0,
                    max_task_level: 0,
                    task_count: 0,
                    virtual_event: None,
                    blocked: Vec::new(),
                    last_timestamps: TimestampPacketContainer::new(),
                    sequence: 0,
                    stats: QueueStats::default(),
                }),
            }),
        })
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    #[must_use]
    pub fn properties(&self) -> QueueProperties {
        self.shared.properties
    }

    #[must_use]
    pub fn device(&self) -> &Arc<Device> {
        &self.shared.device
    }

    #[must_use]
    pub fn csr(&self) -> &Arc<CommandStreamReceiver> {
        &self.shared.csr
    }

    #[must_use]
    pub fn task_level(&self) -> TaskLevel {
        self.shared.lock().task_level
    }

    /// Last task count this queue flushed.
    #[must_use]
    pub fn task_count(&self) -> TaskCount {
        self.shared.lock().task_count
    }

    #[must_use]
    pub fn stats(&self) -> QueueStats {
        self.shared.lock().stats.clone()
    }

    /// Whether commands are still waiting on unresolved events.
    #[must_use]
    pub fn has_blocked_work(&self) -> bool {
        let mut state = self.shared.lock();
        QueueShared::prune_blocked(&mut state);
        state.virtual_event.is_some() || !state.blocked.is_empty()
    }

    /// Launch `kernel` over `range`.
    ///
    /// Group size and argument errors are returned before anything is
    /// queued. Returns the command's event when `options.want_event`.
    pub fn enqueue_kernel(
        &self,
        kernel: &mut Kernel,
        range: &NdRange,
        options: &EnqueueOptions,
    ) -> Result<Option<Arc<Event>>> {
        let range = range.normalized()?;
        if kernel.descriptor().flags.uses_device_side_enqueue {
            return Err(XeError::invalid_operation(format!(
                "kernel {} enqueues child kernels but no device queue is configured",
                kernel.name()
            )));
        }
        if !kernel.all_args_set() {
            return Err(XeError::invalid_argument(format!(
                "kernel {} has unset arguments",
                kernel.name()
            )));
        }
        let local = match range.local_size {
            Some(local) => local,
            None => kernel.suggest_group_size(range.global_size, range.work_dim as usize),
        };
        if local.contains(&0) {
            return Err(XeError::invalid_argument(format!("local size {local:?} has an empty dimension")));
        }
        let mut group_count = [1u32; 3];
        for dim in 0..3 {
            if range.global_size[dim] % local[dim] != 0 {
                return Err(XeError::invalid_group_size(format!(
                    "global size {:?} is not a multiple of local size {local:?}",
                    range.global_size
                )));
            }
            group_count[dim] = range.global_size[dim] / local[dim];
        }
        kernel.set_work_dim(range.work_dim)?;
        kernel.set_group_size(local)?;
        kernel.set_group_count(group_count)?;
        kernel.set_global_offset(range.global_offset)?;
        check_wait_list(&options.wait_list)?;

        let state = kernel.dispatch_state();
        let walkers = match &options.builder {
            Some(builder) => builder.build(&state)?,
            None => DefaultWalkerBuilder.build(&state)?,
        };
        let dispatches = MultiDispatchInfo::new(aux_translation::surround_with_translation(
            &self.shared.device,
            &state,
            walkers,
        )?);
        debug!(
            queue = self.shared.id,
            kernel = %state.kernel_name,
            walkers = dispatches.len(),
            group_size = ?local,
            group_count = ?group_count,
            "kernel enqueue"
        );
        self.shared.enqueue(
            EventKind::Kernel,
            BlockedWork::Kernel(dispatches),
            &options.wait_list,
            options.blocking,
            options.want_event,
        )
    }

    /// A marker completing when everything before it on the queue has.
    pub fn enqueue_marker(&self) -> Result<Arc<Event>> {
        self.enqueue_marker_with_wait_list(&[])
    }

    /// A marker completing with `wait_list`, or with all prior work when the
    /// list is empty. Never submits GPU work unless a predecessor lives on
    /// another engine.
    pub fn enqueue_marker_with_wait_list(&self, wait_list: &[Arc<Event>]) -> Result<Arc<Event>> {
        check_wait_list(wait_list)?;
        self.shared
            .enqueue(EventKind::Marker, BlockedWork::Marker, wait_list, false, true)?
            .ok_or_else(|| XeError::fatal("marker enqueue produced no event"))
    }

    /// A barrier: nothing after it starts before everything before it (and
    /// `wait_list`) completes.
    pub fn enqueue_barrier(&self, wait_list: &[Arc<Event>]) -> Result<Arc<Event>> {
        check_wait_list(wait_list)?;
        self.shared
            .enqueue(EventKind::Barrier, BlockedWork::Barrier, wait_list, false, true)?
            .ok_or_else(|| XeError::fatal("barrier enqueue produced no event"))
    }

    /// Hand batched work to the engine.
    pub fn flush(&self) -> Result<()> {
        self.shared.csr.flush()
    }

    /// Flush and wait for everything submitted so far. `NotReady` while
    /// commands are still blocked or the wait timed out.
    pub fn finish(&self) -> Result<WaitStatus> {
        self.flush()?;
        if self.has_blocked_work() {
            debug!(queue = self.shared.id, "finish with blocked commands outstanding");
            return Ok(WaitStatus::NotReady);
        }
        let task_count = self.task_count();
        if self
            .shared
            .csr
            .wait_for_task_count_and_clean_temporary_allocation_list(task_count)
        {
            Ok(WaitStatus::Ready)
        } else {
            Ok(WaitStatus::NotReady)
        }
    }

    /// Run closed command lists in order as one task.
    pub fn execute_command_lists(&self, lists: &[&CommandList]) -> Result<Arc<Event>> {
        for list in lists {
            if list.is_immediate() {
                return Err(XeError::invalid_argument("immediate command lists cannot be executed"));
            }
            if !list.is_closed() {
                return Err(XeError::invalid_argument("command list must be closed before execution"));
            }
        }
        if self.has_blocked_work() {
            return Err(XeError::invalid_operation(
                "command lists cannot be queued behind blocked commands",
            ));
        }
        let shared = &self.shared;
        let mut state = shared.lock();
        let task_level = state.task_level.max(state.max_task_level) + 1;
        let flags = DispatchFlags::empty().with_dc_flush(true);
        let stamp = {
            let mut guard = shared.csr.obtain_unique_ownership();
            let restore = hardware_interface::state_base_address(
                guard.heap(HeapType::SurfaceState),
                guard.heap(HeapType::DynamicState),
                guard.heap(HeapType::IndirectObject),
            );
            let mut commands = Vec::with_capacity(lists.len() + 3);
            for list in lists {
                commands.push(HwCommand::BatchBufferStart {
                    address: list.start_address()?,
                    second_level: true,
                });
                list.make_resident(&mut guard);
            }
            commands.extend(hardware_interface::state_base_address_commands(restore));
            shared.flush_commands(&mut guard, &mut state.command_stream, &commands, task_level, &flags)?
        };
        state.task_level = task_level;
        state.max_task_level = state.max_task_level.max(task_level);
        state.task_count = stamp.task_count;
        state.last_timestamps = TimestampPacketContainer::new();
        state.stats.command_lists_executed += lists.len() as u64;
        debug!(
            queue = shared.id,
            lists = lists.len(),
            task_count = stamp.task_count,
            "command lists executed"
        );
        Ok(Event::new_submitted(
            EventKind::Kernel,
            shared.clock,
            Arc::clone(&shared.csr),
            stamp,
            TimestampPacketContainer::new(),
        ))
    }
}

impl QueueShared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn prune_blocked(state: &mut QueueState) {
        state.blocked.retain(|event| blocks(event));
        if state.virtual_event.as_ref().is_some_and(|event| !blocks(event)) {
            state.virtual_event = None;
        }
    }

    /// Predecessors the command must wait for before it can be programmed.
    fn blockers(&self, state: &mut QueueState, work: &BlockedWork, wait_list: &[Arc<Event>]) -> Vec<Arc<Event>> {
        Self::prune_blocked(state);
        let mut blockers: Vec<Arc<Event>> =
            wait_list.iter().filter(|event| blocks(event)).cloned().collect();
        let mut chain = |event: &Arc<Event>| {
            if !blockers.iter().any(|b| Arc::ptr_eq(b, event)) {
                blockers.push(Arc::clone(event));
            }
        };
        if let Some(event) = &state.virtual_event {
            chain(event);
        }
        if self.properties.out_of_order {
            let orders_everything = match work {
                BlockedWork::Barrier => true,
                BlockedWork::Marker => wait_list.is_empty(),
                BlockedWork::Kernel(_) => false,
            };
            if orders_everything {
                for event in &state.blocked {
                    chain(event);
                }
            }
        }
        blockers
    }

    fn enqueue(
        self: &Arc<Self>,
        kind: EventKind,
        work: BlockedWork,
        wait_list: &[Arc<Event>],
        blocking: bool,
        want_event: bool,
    ) -> Result<Option<Arc<Event>>> {
        let mut state = self.lock();
        let blockers = self.blockers(&mut state, &work, wait_list);

        if blockers.is_empty() {
            let (stamp, timestamps) = self
                .submit_work(&mut state, work, wait_list)
                .inspect_err(|err| self.log_failure(err))?;
            drop(state);
            let event = Event::new_submitted(kind, self.clock, Arc::clone(&self.csr), stamp, timestamps);
            if blocking {
                self.wait_for_stamp(stamp.task_count);
            }
            return Ok(want_event.then_some(event));
        }

        let event_kind = if want_event { kind } else { EventKind::Virtual };
        let event = Event::new_blocked(event_kind, self.clock);
        let is_barrier = matches!(work, BlockedWork::Barrier);
        event.park(Box::new(BlockedCommand {
            queue: Arc::downgrade(self),
            work,
            wait_list: wait_list.to_vec(),
        }));
        let mut failed = false;
        for parent in &blockers {
            match parent.add_child(&event) {
                ParentState::Pending | ParentState::Satisfied => {}
                ParentState::Failed(status) => {
                    warn!(queue = self.id, event = event.id(), status, "predecessor failed during enqueue");
                    failed = true;
                    break;
                }
            }
        }
        state.stats.blocked_commands += 1;
        if self.properties.out_of_order {
            state.blocked.push(Arc::clone(&event));
            if is_barrier {
                state.virtual_event = Some(Arc::clone(&event));
            }
        } else {
            state.virtual_event = Some(Arc::clone(&event));
        }
        debug!(
            queue = self.id,
            event = event.id(),
            predecessors = blockers.len(),
            "command blocked"
        );
        drop(state);

        if failed {
            if event.abort_blocked() {
                Event::propagate(&event);
            }
        } else {
            event.finish_registration();
        }
        if blocking {
            let timeout = self.csr.config().wait_timeout();
            match Event::wait_for_events_with_timeout(&[&*event], timeout) {
                Ok(WaitStatus::Ready) => {}
                Ok(WaitStatus::NotReady) => {
                    self.note_blocking_timeout(event.task_count().unwrap_or_default());
                }
                Err(err) => {
                    warn!(queue = self.id, event = event.id(), %err, "blocked enqueue failed while waiting");
                    return Err(err);
                }
            }
        }
        Ok(want_event.then_some(event))
    }

    /// Program and flush a released blocked command, then mark its event.
    pub(crate) fn replay(&self, work: BlockedWork, wait_list: &[Arc<Event>], event: &Arc<Event>) -> Result<()> {
        let mut state = self.lock();
        let (stamp, timestamps) = self
            .submit_work(&mut state, work, wait_list)
            .inspect_err(|err| self.log_failure(err))?;
        state.stats.replayed_commands += 1;
        state.blocked.retain(|e| !Arc::ptr_eq(e, event));
        event.mark_submitted(Arc::clone(&self.csr), stamp, timestamps);
        trace!(queue = self.id, event = event.id(), task_count = stamp.task_count, "blocked command replayed");
        Ok(())
    }

    pub(crate) fn forget_blocked(&self, event: &Arc<Event>) {
        let mut state = self.lock();
        state.blocked.retain(|e| !Arc::ptr_eq(e, event));
        if state.virtual_event.as_ref().is_some_and(|e| Arc::ptr_eq(e, event)) {
            state.virtual_event = None;
        }
        state.stats.aborted_commands += 1;
    }

    fn log_failure(&self, err: &XeError) {
        if matches!(err, XeError::OutOfResources { .. } | XeError::Fatal { .. }) {
            error!(queue = self.id, context_id = self.csr.context_id(), %err, "enqueue failed");
        }
    }

    fn wait_for_stamp(&self, task_count: TaskCount) {
        if !self
            .csr
            .wait_for_task_count_and_clean_temporary_allocation_list(task_count)
        {
            self.note_blocking_timeout(task_count);
        }
    }

    fn note_blocking_timeout(&self, task_count: TaskCount) {
        warn!(
            queue = self.id,
            task_count,
            tag = self.csr.peek_tag(),
            "blocking enqueue timed out"
        );
        self.lock().stats.blocking_timeouts += 1;
    }

    fn submit_work(
        &self,
        state: &mut QueueState,
        work: BlockedWork,
        wait_list: &[Arc<Event>],
    ) -> Result<(CompletionStamp, TimestampPacketContainer)> {
        let wait_level = wait_list.iter().filter_map(|e| e.task_level()).max().unwrap_or(0);
        match work {
            BlockedWork::Kernel(dispatches) => self.submit_kernel(state, dispatches, wait_list, wait_level),
            BlockedWork::Marker => self.submit_marker(state, wait_list, wait_level),
            BlockedWork::Barrier => self.submit_barrier(state, wait_list, wait_level),
        }
    }

    /// Dependencies on other engines: their timestamp nodes as semaphores,
    /// or a host wait for work that carries none.
    fn resolve_dependencies(&self, wait_list: &[Arc<Event>]) -> Result<TimestampPacketContainer> {
        let mut dependencies = TimestampPacketContainer::new();
        for event in wait_list {
            let Some(csr) = event.csr() else {
                continue;
            };
            if csr.context_id() == self.csr.context_id()
                || event.update_execution_status() == ExecutionStatus::Complete
            {
                continue;
            }
            let nodes = event.timestamp_nodes();
            csr.flush()?;
            if nodes.is_empty() {
                let task_count = event.task_count().unwrap_or_default();
                if !csr.wait_for_task_count(task_count) {
                    warn!(
                        queue = self.id,
                        other_context = csr.context_id(),
                        task_count,
                        "cross-engine host wait timed out"
                    );
                }
            } else {
                dependencies.assign_and_increment_nodes_ref_count(&nodes);
            }
        }
        Ok(dependencies)
    }

    fn has_foreign_work(&self, wait_list: &[Arc<Event>]) -> bool {
        wait_list.iter().any(|event| {
            event
                .csr()
                .is_some_and(|csr| csr.context_id() != self.csr.context_id())
                && event.update_execution_status() != ExecutionStatus::Complete
        })
    }

    /// Emit `commands` into `stream` as one task and flush it. A failed
    /// flush leaves the stream where it was.
    fn flush_commands(
        &self,
        guard: &mut CsrGuard<'_>,
        stream: &mut LinearStream,
        commands: &[HwCommand],
        task_level: TaskLevel,
        flags: &DispatchFlags,
    ) -> Result<CompletionStamp> {
        let size = encoded_size(commands) + TASK_EPILOGUE_SIZE;
        guard.ensure_command_buffer_allocation(stream, size, self.csr.config().overfetch_bytes)?;
        let start = stream.used();
        stream.emit_all(commands)?;
        match guard.flush_task(stream, start, task_level, flags) {
            Ok(stamp) => Ok(stamp),
            Err(err) => {
                if let Err(reset) = stream.set_used(start) {
                    error!(queue = self.id, %reset, "task stream rollback failed");
                }
                Err(err)
            }
        }
    }

    fn submit_kernel(
        &self,
        state: &mut QueueState,
        mut dispatches: MultiDispatchInfo,
        wait_list: &[Arc<Event>],
        wait_level: TaskLevel,
    ) -> Result<(CompletionStamp, TimestampPacketContainer)> {
        let task_level = state.task_level.max(wait_level) + 1;
        let dependencies = self.resolve_dependencies(wait_list)?;
        let mut timestamps = TimestampPacketContainer::new();
        if self.csr.timestamp_packets_enabled() {
            for dispatch in dispatches.dispatches_mut() {
                let node = self.csr.obtain_timestamp_node()?;
                timestamps.add(Arc::clone(&node));
                dispatch.timestamp = Some(node);
            }
        }
        let flags = DispatchFlags {
            dc_flush: dispatches.requires_dc_flush(),
            large_grf: dispatches.requires_large_grf(),
            slm_used: dispatches.slm_used(),
            per_thread_scratch_size: dispatches.per_thread_scratch_size(),
            csr_dependencies: dependencies,
            ..DispatchFlags::empty()
        };

        let stamp = {
            let mut guard = self.csr.obtain_unique_ownership();
            let commands = hardware_interface::program_dispatches(
                &mut guard,
                &dispatches,
                self.csr.family_traits(),
                self.device.svm(),
                self.device.root_device_index(),
            )?;
            let stamp =
                self.flush_commands(&mut guard, &mut state.command_stream, &commands, task_level, &flags)?;
            retire_orphaned_surfaces(&guard, &mut dispatches, stamp.task_count);
            stamp
        };

        if !self.properties.out_of_order {
            state.task_level = task_level;
        }
        state.max_task_level = state.max_task_level.max(task_level);
        state.task_count = stamp.task_count;
        state.last_timestamps = timestamps.clone();
        state.stats.kernels += 1;
        state.stats.walkers += dispatches.len() as u64;
        state.stats.aux_translation_passes +=
            dispatches.iter().filter(|d| d.kind != DispatchKind::Kernel).count() as u64;

        if let Some(tracer) = &self.tracer {
            for dispatch in dispatches.iter() {
                tracer.record(&DispatchRecord::new(
                    self.id,
                    state.sequence,
                    dispatch,
                    stamp,
                    self.csr.context_id(),
                ));
                state.sequence += 1;
            }
        }
        trace!(
            queue = self.id,
            task_count = stamp.task_count,
            task_level,
            dc_flush = flags.dc_flush,
            "kernel flushed"
        );
        Ok((stamp, timestamps))
    }

    fn submit_marker(
        &self,
        state: &mut QueueState,
        wait_list: &[Arc<Event>],
        wait_level: TaskLevel,
    ) -> Result<(CompletionStamp, TimestampPacketContainer)> {
        state.stats.markers += 1;
        let task_level = if wait_list.is_empty() {
            state.task_level
        } else {
            state.task_level.max(wait_level)
        };

        if self.has_foreign_work(wait_list) {
            let flags = DispatchFlags {
                csr_dependencies: self.resolve_dependencies(wait_list)?,
                ..DispatchFlags::empty()
            };
            let stamp = {
                let mut guard = self.csr.obtain_unique_ownership();
                self.flush_commands(&mut guard, &mut state.command_stream, &[], task_level, &flags)?
            };
            state.task_count = stamp.task_count;
            if !self.properties.out_of_order {
                state.task_level = task_level;
            }
            return Ok((stamp, TimestampPacketContainer::new()));
        }

        let mut task_count = state.task_count;
        let mut timestamps = TimestampPacketContainer::new();
        if wait_list.is_empty() {
            timestamps.assign_and_increment_nodes_ref_count(&state.last_timestamps);
        } else {
            for event in wait_list {
                if event.csr().is_some() {
                    task_count = task_count.max(event.task_count().unwrap_or_default());
                    timestamps.assign_and_increment_nodes_ref_count(&event.timestamp_nodes());
                }
            }
        }
        if !self.properties.out_of_order {
            state.task_level = task_level;
        }
        let stamp = CompletionStamp {
            task_count,
            task_level,
            flush_stamp: self.csr.flush_stamp(),
        };
        Ok((stamp, timestamps))
    }

    fn submit_barrier(
        &self,
        state: &mut QueueState,
        wait_list: &[Arc<Event>],
        wait_level: TaskLevel,
    ) -> Result<(CompletionStamp, TimestampPacketContainer)> {
        let task_level = state.task_level.max(state.max_task_level).max(wait_level) + 1;
        let node = if self.csr.timestamp_packets_enabled() {
            Some(self.csr.obtain_timestamp_node()?)
        } else {
            None
        };
        let flags = DispatchFlags {
            barrier_timestamp_packet: node.clone(),
            guard_command_buffer_with_pipe_control: true,
            dc_flush: true,
            csr_dependencies: self.resolve_dependencies(wait_list)?,
            ..DispatchFlags::empty()
        };
        let stamp = {
            let mut guard = self.csr.obtain_unique_ownership();
            self.flush_commands(&mut guard, &mut state.command_stream, &[], task_level, &flags)?
        };
        let mut timestamps = TimestampPacketContainer::new();
        if let Some(node) = node {
            timestamps.add(node);
        }
        state.task_level = task_level;
        state.max_task_level = task_level;
        state.task_count = stamp.task_count;
        state.last_timestamps = timestamps.clone();
        state.stats.barriers += 1;
        Ok((stamp, timestamps))
    }
}

/// Implicit surfaces whose kernel was dropped while the dispatch waited go
/// to the engine's temporary list, freed once `task_count` completes.
fn retire_orphaned_surfaces(guard: &CsrGuard<'_>, dispatches: &mut MultiDispatchInfo, task_count: TaskCount) {
    let shared: Vec<_> = dispatches
        .dispatches_mut()
        .iter_mut()
        .filter_map(|dispatch| dispatch.state.surfaces.take())
        .collect();
    for surfaces in shared {
        let Ok(surfaces) = Arc::try_unwrap(surfaces) else {
            continue;
        };
        for allocation in surfaces.into_allocations() {
            trace!(allocation = %allocation.id(), task_count, "orphaned kernel surface retired");
            guard.store_allocation_task_count(allocation, AllocationUsage::Temporary, task_count);
        }
    }
}

impl Drop for QueueShared {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(buffer) = state.command_stream.take_allocation() {
            self.csr.obtain_unique_ownership().store_allocation_task_count(
                buffer,
                AllocationUsage::Temporary,
                state.task_count,
            );
        }
        debug!(queue = self.id, task_count = state.task_count, "command queue released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nd_range_collapses_unused_dimensions() {
        let range = NdRange {
            work_dim: 1,
            global_offset: [4, 5, 6],
            global_size: [64, 0, 0],
            local_size: Some([16, 0, 0]),
        }
        .normalized()
        .unwrap();
        assert_eq!(range.global_size, [64, 1, 1]);
        assert_eq!(range.global_offset, [4, 0, 0]);
        assert_eq!(range.local_size, Some([16, 1, 1]));
    }

    #[test]
    fn nd_range_rejects_bad_dimensions() {
        assert!(matches!(
            NdRange::new(0, [1, 1, 1]).normalized(),
            Err(XeError::InvalidArgument { .. })
        ));
        assert!(matches!(
            NdRange::new(2, [8, 0, 1]).normalized(),
            Err(XeError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn default_options_do_not_return_events() {
        assert!(!EnqueueOptions::default().want_event);
        assert!(EnqueueOptions::new().want_event);
    }

    proptest::proptest! {
        #[test]
        fn normalized_range_is_trivial_past_work_dim(
            work_dim in 1u32..=3,
            global in proptest::array::uniform3(1u32..4096),
            offset in proptest::array::uniform3(0u32..64),
        ) {
            let range = NdRange::new(work_dim, global)
                .with_global_offset(offset)
                .normalized()
                .unwrap();
            for dim in 0..3 {
                if dim < work_dim as usize {
                    proptest::prop_assert_eq!(range.global_size[dim], global[dim]);
                    proptest::prop_assert_eq!(range.global_offset[dim], offset[dim]);
                } else {
                    proptest::prop_assert_eq!(range.global_size[dim], 1);
                    proptest::prop_assert_eq!(range.global_offset[dim], 0);
                }
            }
        }
    }
}
