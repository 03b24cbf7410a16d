//! The command stream receiver: submission state for one hardware context.
//!
//! A receiver owns the ring command buffer, the three indirect heaps, the
//! tag allocation and the per-submission residency and eviction lists. Task
//! counts are strictly monotonic per receiver; the GPU publishes completion
//! by writing a task count into the tag, and anything stamped at or below
//! the tag may be recycled.
//!
//! Mutation goes through [`CommandStreamReceiver::obtain_unique_ownership`],
//! which hands out a [`CsrGuard`] over the receiver's mutex. Waiting never
//! holds the lock.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info, warn};
use xe_common::config::CsrConfig;
use xe_common::math::{KB, PAGE_SIZE, align_up};
use xe_common::{
    ContextId, DispatchMode, FamilyTraits, HwInfo, Result, RuntimeConfig, TaskCount, XeError,
};
use xe_memory::{
    AllocationId, AllocationProperties, AllocationType, AllocationUsage, EngineCompletion,
    GraphicsAllocation, InternalAllocationStorage, MemoryManager, OwnedAllocation,
};

use crate::commands::{
    FrontEndState, HwCommand, Opcode, PREEMPTION_CONTROL_REGISTER, PipeControl, PipelineSelect,
    PostSyncOp, SemaphoreCompare, StateBaseAddress, TimestampKind,
};
use crate::debug_pause::DebugPause;
use crate::dispatch_flags::{DispatchFlags, PreemptionMode};
use crate::indirect_heap::{HeapType, IndirectHeap};
use crate::linear_stream::LinearStream;
use crate::submission::{BatchBuffer, FlushStamp, SubmissionBackend};
use crate::timestamp_packet::{TIMESTAMP_INITIAL_VALUE, TimestampPacketAllocator, TimestampPacketNode};

/// Ordering level of a task within a queue.
pub type TaskLevel = u32;

/// Bytes a caller must leave free in its task stream for [`CsrGuard::flush_task`].
pub const TASK_EPILOGUE_SIZE: usize = Opcode::BatchBufferEnd.encoded_size();

const PREEMPTION_SURFACE_SIZE: usize = 64 * KB;
const TEARDOWN_WAIT: Duration = Duration::from_secs(5);

/// Result of a flush: what to wait on and where it sits in queue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CompletionStamp {
    pub task_count: TaskCount,
    pub task_level: TaskLevel,
    pub flush_stamp: FlushStamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EngineUsage {
    Regular,
    /// Driver-internal work such as builtin kernels.
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineDescriptor {
    pub root_device_index: u32,
    pub usage: EngineUsage,
}

impl EngineDescriptor {
    #[must_use]
    pub const fn regular(root_device_index: u32) -> Self {
        Self {
            root_device_index,
            usage: EngineUsage::Regular,
        }
    }

    #[must_use]
    pub const fn internal(root_device_index: u32) -> Self {
        Self {
            root_device_index,
            usage: EngineUsage::Internal,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CsrStats {
    pub flush_tasks: u64,
    pub tag_updates: u64,
    pub submissions: u64,
    pub failed_submissions: u64,
    pub batched_flushes: u64,
    pub command_buffer_reallocations: u64,
    pub heap_reallocations: u64,
    pub state_base_address_programmed: u64,
    pub semaphores_programmed: u64,
    pub residency_peak: usize,
}

#[derive(Default)]
struct DriverSurfaces {
    tag: Option<OwnedAllocation>,
    preemption: Option<OwnedAllocation>,
    debug: Option<OwnedAllocation>,
    scratch: Option<OwnedAllocation>,
    global_fence: Option<OwnedAllocation>,
}

impl DriverSurfaces {
    fn resident_views(&self) -> Vec<Arc<GraphicsAllocation>> {
        [&self.preemption, &self.debug, &self.scratch, &self.global_fence]
            .into_iter()
            .flatten()
            .map(OwnedAllocation::share)
            .collect()
    }

    fn drain(&mut self) -> Vec<OwnedAllocation> {
        [
            self.debug.take(),
            self.tag.take(),
            self.global_fence.take(),
            self.preemption.take(),
            self.scratch.take(),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

#[derive(Default)]
struct CsrState {
    command_stream: LinearStream,
    heaps: [Option<IndirectHeap>; 3],
    residency: Vec<Arc<GraphicsAllocation>>,
    residency_ids: HashSet<AllocationId>,
    eviction: Vec<Arc<GraphicsAllocation>>,
    surfaces: DriverSurfaces,
    pipeline_select: Option<PipelineSelect>,
    preemption: Option<PreemptionMode>,
    front_end: Option<FrontEndState>,
    last_sba: Option<StateBaseAddress>,
    per_thread_scratch_size: u32,
    /// Ring offset where work not yet handed to the backend begins.
    pending_start: Option<usize>,
    pending_coherency: bool,
    stats: CsrStats,
}

pub struct CommandStreamReceiver {
    memory_manager: Arc<MemoryManager>,
    backend: Arc<dyn SubmissionBackend>,
    hw_info: HwInfo,
    traits: &'static FamilyTraits,
    engine: EngineDescriptor,
    context_id: ContextId,
    config: CsrConfig,
    tag: Arc<GraphicsAllocation>,
    task_count: AtomicU32,
    latest_flushed_task_count: AtomicU32,
    latest_sent_task_count: AtomicU32,
    task_level: AtomicU32,
    flush_stamp: AtomicU64,
    storage: InternalAllocationStorage,
    timestamp_allocator: TimestampPacketAllocator,
    debug_pause: Option<DebugPause>,
    state: Mutex<CsrState>,
}

impl std::fmt::Debug for CommandStreamReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandStreamReceiver")
            .field("context_id", &self.context_id)
            .field("engine", &self.engine)
            .field("task_count", &self.task_count())
            .field("tag", &self.peek_tag())
            .field("backend", &self.backend.name())
            .finish()
    }
}

impl CommandStreamReceiver {
    /// Create a receiver and register it with the memory manager.
    ///
    /// With `debug.break_on_submission` set, every submission waits for a
    /// confirmation line on standard input.
    pub fn new(
        memory_manager: Arc<MemoryManager>,
        backend: Arc<dyn SubmissionBackend>,
        hw_info: HwInfo,
        engine: EngineDescriptor,
        config: &RuntimeConfig,
    ) -> Result<Arc<Self>> {
        let debug_pause = if config.debug.break_on_submission {
            Some(DebugPause::from_stdin().map_err(|e| {
                XeError::fatal(format!("failed to start debug pause worker: {e}"))
            })?)
        } else {
            None
        };
        Self::create(memory_manager, backend, hw_info, engine, config, debug_pause)
    }

    /// Like [`new`](Self::new) but pausing through `debug_pause`.
    pub fn with_debug_pause(
        memory_manager: Arc<MemoryManager>,
        backend: Arc<dyn SubmissionBackend>,
        hw_info: HwInfo,
        engine: EngineDescriptor,
        config: &RuntimeConfig,
        debug_pause: DebugPause,
    ) -> Result<Arc<Self>> {
        Self::create(memory_manager, backend, hw_info, engine, config, Some(debug_pause))
    }

    fn create(
        memory_manager: Arc<MemoryManager>,
        backend: Arc<dyn SubmissionBackend>,
        hw_info: HwInfo,
        engine: EngineDescriptor,
        config: &RuntimeConfig,
        debug_pause: Option<DebugPause>,
    ) -> Result<Arc<Self>> {
        let context_id = memory_manager.reserve_context_id()?;
        let root = engine.root_device_index;
        let tag = memory_manager.allocate(&AllocationProperties::new(
            root,
            PAGE_SIZE,
            AllocationType::TagBuffer,
        ))?;
        let preemption = match memory_manager.allocate(&AllocationProperties::new(
            root,
            PREEMPTION_SURFACE_SIZE,
            AllocationType::PreemptionSurface,
        )) {
            Ok(surface) => surface,
            Err(err) => {
                memory_manager.free(tag);
                return Err(err);
            }
        };

        let state = CsrState {
            surfaces: DriverSurfaces {
                tag: None,
                preemption: Some(preemption),
                ..DriverSurfaces::default()
            },
            ..CsrState::default()
        };
        let tag_view = tag.share();
        let traits = hw_info.traits();
        let csr = Arc::new(Self {
            storage: InternalAllocationStorage::new(context_id, Arc::clone(&memory_manager)),
            timestamp_allocator: TimestampPacketAllocator::new(
                Arc::clone(&memory_manager),
                root,
                context_id,
                config.csr.timestamp_nodes_per_page,
            ),
            memory_manager,
            backend,
            traits,
            hw_info,
            engine,
            context_id,
            config: config.csr.clone(),
            tag: tag_view,
            task_count: AtomicU32::new(0),
            latest_flushed_task_count: AtomicU32::new(0),
            latest_sent_task_count: AtomicU32::new(0),
            task_level: AtomicU32::new(0),
            flush_stamp: AtomicU64::new(0),
            debug_pause,
            state: Mutex::new(state),
        });
        csr.lock_state().surfaces.tag = Some(tag);

        let completion: Weak<dyn EngineCompletion> = Arc::downgrade(&csr) as Weak<dyn EngineCompletion>;
        csr.memory_manager.register_engine(context_id, completion);
        info!(
            context_id,
            family = %csr.hw_info.family,
            usage = ?engine.usage,
            dispatch_mode = %csr.config.dispatch_mode,
            backend = csr.backend.name(),
            "command stream receiver created"
        );
        Ok(csr)
    }

    fn lock_state(&self) -> MutexGuard<'_, CsrState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Exclusive access for building and flushing work.
    pub fn obtain_unique_ownership(&self) -> CsrGuard<'_> {
        CsrGuard {
            csr: self,
            state: self.lock_state(),
        }
    }

    // ── Accessors ───────────────────────────────────────────────────────

    #[must_use]
    pub const fn context_id(&self) -> ContextId {
        self.context_id
    }

    #[must_use]
    pub const fn engine(&self) -> EngineDescriptor {
        self.engine
    }

    #[must_use]
    pub const fn root_device_index(&self) -> u32 {
        self.engine.root_device_index
    }

    #[must_use]
    pub const fn hw_info(&self) -> &HwInfo {
        &self.hw_info
    }

    #[must_use]
    pub const fn family_traits(&self) -> &'static FamilyTraits {
        self.traits
    }

    #[must_use]
    pub const fn config(&self) -> &CsrConfig {
        &self.config
    }

    #[must_use]
    pub const fn dispatch_mode(&self) -> DispatchMode {
        self.config.dispatch_mode
    }

    #[must_use]
    pub fn memory_manager(&self) -> &Arc<MemoryManager> {
        &self.memory_manager
    }

    #[must_use]
    pub fn backend(&self) -> &Arc<dyn SubmissionBackend> {
        &self.backend
    }

    #[must_use]
    pub const fn internal_allocation_storage(&self) -> &InternalAllocationStorage {
        &self.storage
    }

    #[must_use]
    pub const fn timestamp_packet_allocator(&self) -> &TimestampPacketAllocator {
        &self.timestamp_allocator
    }

    /// Whether dispatches on this engine carry timestamp packets.
    #[must_use]
    pub const fn timestamp_packets_enabled(&self) -> bool {
        self.config.enable_timestamp_packets && self.traits.supports_timestamp_packets
    }

    /// A fresh node from this engine's pool.
    pub fn obtain_timestamp_node(&self) -> Result<Arc<TimestampPacketNode>> {
        self.timestamp_allocator.get_node(self.peek_tag())
    }

    #[must_use]
    pub fn task_count(&self) -> TaskCount {
        self.task_count.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn task_level(&self) -> TaskLevel {
        self.task_level.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn latest_flushed_task_count(&self) -> TaskCount {
        self.latest_flushed_task_count.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn latest_sent_task_count(&self) -> TaskCount {
        self.latest_sent_task_count.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn flush_stamp(&self) -> FlushStamp {
        self.flush_stamp.load(Ordering::SeqCst)
    }

    /// The task count the GPU last published.
    #[must_use]
    pub fn peek_tag(&self) -> TaskCount {
        self.tag.read_u32(0).unwrap_or(0)
    }

    #[must_use]
    pub fn tag_address(&self) -> u64 {
        self.tag.gpu_address()
    }

    #[must_use]
    pub const fn tag_allocation(&self) -> &Arc<GraphicsAllocation> {
        &self.tag
    }

    #[must_use]
    pub fn is_completed(&self, task_count: TaskCount) -> bool {
        self.peek_tag() >= task_count
    }

    #[must_use]
    pub fn stats(&self) -> CsrStats {
        self.lock_state().stats.clone()
    }

    /// Allocate the debug surface, made resident with every later flush.
    pub fn create_debug_surface(&self, size: usize) -> Result<Arc<GraphicsAllocation>> {
        let surface = self.memory_manager.allocate(&AllocationProperties::new(
            self.root_device_index(),
            size,
            AllocationType::DebugSurface,
        ))?;
        let view = surface.share();
        let previous = self.lock_state().surfaces.debug.replace(surface);
        if let Some(previous) = previous {
            self.storage
                .store(previous, AllocationUsage::Temporary, self.task_count());
        }
        Ok(view)
    }

    // ── Waiting ─────────────────────────────────────────────────────────

    /// Flush batched work, then spin on the tag until it reaches
    /// `task_count_to_wait` or `timeout` elapses. Returns whether the tag got
    /// there.
    pub fn wait_for_completion_with_timeout(
        &self,
        timeout: Option<Duration>,
        task_count_to_wait: TaskCount,
    ) -> bool {
        if self.peek_tag() >= task_count_to_wait {
            return true;
        }
        if self.latest_flushed_task_count() < task_count_to_wait
            && let Err(err) = self.obtain_unique_ownership().flush_batched_submissions()
        {
            error!(context_id = self.context_id, %err, "flush before wait failed");
            return false;
        }
        if task_count_to_wait > self.latest_sent_task_count() {
            warn!(
                context_id = self.context_id,
                task_count_to_wait,
                latest_sent = self.latest_sent_task_count(),
                "waiting for a task count that was never submitted"
            );
            return false;
        }

        let start = Instant::now();
        loop {
            if self.peek_tag() >= task_count_to_wait {
                return true;
            }
            self.backend.poll();
            if self.peek_tag() >= task_count_to_wait {
                return true;
            }
            if let Some(limit) = timeout
                && start.elapsed() >= limit
            {
                debug!(
                    context_id = self.context_id,
                    task_count_to_wait,
                    tag = self.peek_tag(),
                    "completion wait timed out"
                );
                return false;
            }
            std::thread::yield_now();
            std::hint::spin_loop();
        }
    }

    /// Wait bounded by the configured timeout.
    pub fn wait_for_task_count(&self, task_count: TaskCount) -> bool {
        self.wait_for_completion_with_timeout(self.config.wait_timeout(), task_count)
    }

    /// Wait for `task_count`, then release whatever on `usage` has retired.
    pub fn wait_for_task_count_and_clean_allocation_list(
        &self,
        task_count: TaskCount,
        usage: AllocationUsage,
    ) -> bool {
        let completed = self.wait_for_task_count(task_count);
        self.storage.clean_allocation_list(self.peek_tag(), usage);
        completed
    }

    pub fn wait_for_task_count_and_clean_temporary_allocation_list(
        &self,
        task_count: TaskCount,
    ) -> bool {
        self.wait_for_task_count_and_clean_allocation_list(task_count, AllocationUsage::Temporary)
    }

    /// Flush any batched work.
    pub fn flush(&self) -> Result<()> {
        self.obtain_unique_ownership().flush_batched_submissions()
    }
}

impl EngineCompletion for CommandStreamReceiver {
    fn context_id(&self) -> ContextId {
        self.context_id
    }

    fn completed_task_count(&self) -> TaskCount {
        self.peek_tag()
    }

    fn wait_for_completion(&self, task_count: TaskCount, timeout: Option<Duration>) -> bool {
        self.wait_for_completion_with_timeout(timeout, task_count)
    }
}

impl Drop for CommandStreamReceiver {
    fn drop(&mut self) {
        let context_id = self.context_id;
        if let Err(err) = self.obtain_unique_ownership().flush_batched_submissions() {
            error!(context_id, %err, "flush during teardown failed");
        }
        let target = self.latest_sent_task_count();
        let drained = self.wait_for_completion_with_timeout(Some(TEARDOWN_WAIT), target);
        let task_count = self.task_count();

        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for heap in state.heaps.iter_mut().filter_map(Option::take) {
            if let Some(allocation) = heap.into_allocation() {
                self.storage
                    .store(allocation, AllocationUsage::Reusable, task_count);
            }
        }
        if let Some(ring) = state.command_stream.take_allocation() {
            self.storage.store(ring, AllocationUsage::Reusable, task_count);
        }

        let mut surfaces = state.surfaces.drain();
        surfaces.extend(self.timestamp_allocator.release_pages());
        if drained {
            for surface in surfaces {
                self.memory_manager.free(surface);
            }
            for usage in [AllocationUsage::Reusable, AllocationUsage::Temporary] {
                self.storage.clean_allocation_list(TaskCount::MAX, usage);
            }
        } else {
            let leaked = surfaces.len()
                + self.storage.take_all(AllocationUsage::Reusable).len()
                + self.storage.take_all(AllocationUsage::Temporary).len();
            error!(
                context_id,
                target,
                leaked,
                "engine did not drain before teardown; leaking its allocations"
            );
        }

        self.memory_manager.unregister_engine(context_id);
        info!(context_id, drained, task_count, "command stream receiver destroyed");
    }
}

// ── Guarded operations ──────────────────────────────────────────────────────

/// Exclusive handle on a receiver's mutable state.
pub struct CsrGuard<'a> {
    csr: &'a CommandStreamReceiver,
    state: MutexGuard<'a, CsrState>,
}

impl CsrGuard<'_> {
    #[must_use]
    pub const fn csr(&self) -> &CommandStreamReceiver {
        self.csr
    }

    fn submission_task_count(&self) -> TaskCount {
        self.csr.task_count() + 1
    }

    // ── Residency ───────────────────────────────────────────────────────

    /// Add `allocation` to the next submission's residency list.
    ///
    /// Stamps the allocation with the upcoming task count on this context;
    /// an allocation already stamped for it is not listed twice.
    pub fn make_resident(&mut self, allocation: &Arc<GraphicsAllocation>) {
        let context_id = self.csr.context_id;
        let submission = self.submission_task_count();
        if self.state.residency_ids.insert(allocation.id()) {
            self.state.residency.push(Arc::clone(allocation));
        }
        if allocation
            .residency_task_count(context_id)
            .is_none_or(|tc| tc < submission)
        {
            allocation.update_residency_task_count(submission, context_id);
        }
        if allocation.task_count(context_id).is_none_or(|tc| tc < submission) {
            allocation.update_task_count(submission, context_id);
        }
    }

    /// Drop residency of `allocation`; evictable allocations are reported to
    /// the backend at the next submission.
    pub fn make_non_resident(&mut self, allocation: &Arc<GraphicsAllocation>) {
        let context_id = self.csr.context_id;
        if self.state.residency_ids.remove(&allocation.id()) {
            self.state.residency.retain(|a| a.id() != allocation.id());
        }
        if allocation.is_evictable()
            && allocation.residency_task_count(context_id).is_some()
            && !self.state.eviction.iter().any(|a| a.id() == allocation.id())
        {
            self.state.eviction.push(Arc::clone(allocation));
        }
        allocation.release_residency(context_id);
    }

    #[must_use]
    pub fn residency_len(&self) -> usize {
        self.state.residency.len()
    }

    #[must_use]
    pub fn is_in_residency_list(&self, id: AllocationId) -> bool {
        self.state.residency_ids.contains(&id)
    }

    #[must_use]
    pub fn eviction_len(&self) -> usize {
        self.state.eviction.len()
    }

    // ── Allocation recycling ────────────────────────────────────────────

    fn obtain_allocation(
        &self,
        size: usize,
        allocation_type: AllocationType,
    ) -> Result<OwnedAllocation> {
        if let Some(reused) =
            self.csr
                .storage
                .obtain_reusable(size, allocation_type, self.csr.peek_tag())
        {
            return Ok(reused);
        }
        self.csr.memory_manager.allocate(&AllocationProperties::new(
            self.csr.root_device_index(),
            size,
            allocation_type,
        ))
    }

    fn retire(&self, allocation: OwnedAllocation) {
        self.csr.storage.store(
            allocation,
            AllocationUsage::Reusable,
            self.submission_task_count(),
        );
    }

    /// Hand `allocation` to the receiver, released once the current task
    /// count retires.
    pub fn store_allocation(&self, allocation: OwnedAllocation, usage: AllocationUsage) {
        self.csr
            .storage
            .store(allocation, usage, self.csr.task_count());
    }

    pub fn store_allocation_task_count(
        &self,
        allocation: OwnedAllocation,
        usage: AllocationUsage,
        task_count: TaskCount,
    ) {
        self.csr.storage.store(allocation, usage, task_count);
    }

    /// Make sure `stream` has `min_size` bytes available.
    ///
    /// An insufficient buffer is retired to the REUSABLE list; the
    /// replacement is a retired buffer of sufficient size or a fresh
    /// page-aligned allocation with `additional` bytes of unusable tail.
    pub fn ensure_command_buffer_allocation(
        &mut self,
        stream: &mut LinearStream,
        min_size: usize,
        additional: usize,
    ) -> Result<()> {
        if stream.has_allocation() && stream.available() >= min_size {
            return Ok(());
        }
        let usable = align_up(min_size.max(self.csr.config.command_buffer_size), PAGE_SIZE);
        let allocation = self.obtain_allocation(usable + additional, AllocationType::CommandBuffer)?;
        let reserved_tail = allocation.size() - usable;
        debug!(
            context_id = self.csr.context_id,
            id = %allocation.id(),
            usable,
            "command buffer replaced"
        );
        if let Some(old) = stream.replace_buffer(allocation, reserved_tail) {
            self.retire(old);
        }
        self.state.stats.command_buffer_reallocations += 1;
        Ok(())
    }

    fn ring_tail(&self) -> usize {
        TASK_EPILOGUE_SIZE + self.csr.config.overfetch_bytes
    }

    fn ensure_ring_space(&mut self, min_size: usize) -> Result<()> {
        let ring = &self.state.command_stream;
        if ring.has_allocation() && ring.available() >= min_size {
            return Ok(());
        }
        if self.state.pending_start.is_some() {
            self.submit_pending(false)?;
        }
        let mut ring = std::mem::take(&mut self.state.command_stream);
        let tail = self.ring_tail();
        let result = self.ensure_command_buffer_allocation(&mut ring, min_size, tail);
        self.state.command_stream = ring;
        result
    }

    /// The heap of `heap_type` with at least `min_size` bytes free.
    ///
    /// Repeated calls with small sizes return the same heap; an exhausted
    /// heap is retired and state base address is reprogrammed at the next
    /// flush.
    pub fn get_indirect_heap(
        &mut self,
        heap_type: HeapType,
        min_size: usize,
    ) -> Result<&mut IndirectHeap> {
        let index = heap_type.index();
        let exhausted = self.state.heaps[index]
            .as_ref()
            .is_none_or(|heap| heap.available() < min_size);
        if exhausted {
            let usable = align_up(min_size.max(self.csr.config.indirect_heap_size), PAGE_SIZE);
            let allocation = self.obtain_allocation(
                usable + self.csr.config.overfetch_bytes,
                heap_type.allocation_type(),
            )?;
            let reserved_tail = allocation.size() - usable;
            debug!(
                context_id = self.csr.context_id,
                %heap_type,
                id = %allocation.id(),
                usable,
                "indirect heap replaced"
            );
            let previous = self.state.heaps[index].replace(IndirectHeap::new(
                heap_type,
                allocation,
                reserved_tail,
            ));
            if let Some(old) = previous.and_then(IndirectHeap::into_allocation) {
                self.retire(old);
            }
            self.state.stats.heap_reallocations += 1;
        }
        self.state.heaps[index]
            .as_mut()
            .ok_or_else(|| XeError::fatal(format!("{heap_type} missing after allocation")))
    }

    #[must_use]
    pub fn heap(&self, heap_type: HeapType) -> Option<&IndirectHeap> {
        self.state.heaps[heap_type.index()].as_ref()
    }

    /// Retire the current heap of `heap_type`.
    pub fn release_indirect_heap(&mut self, heap_type: HeapType) {
        if let Some(old) = self.state.heaps[heap_type.index()]
            .take()
            .and_then(IndirectHeap::into_allocation)
        {
            self.retire(old);
        }
    }

    // ── State programming ───────────────────────────────────────────────

    fn current_state_base_address(&self) -> StateBaseAddress {
        let heap = |heap_type: HeapType| self.state.heaps[heap_type.index()].as_ref();
        StateBaseAddress {
            general_state_base: 0,
            surface_state_base: heap(HeapType::SurfaceState).map_or(0, IndirectHeap::gpu_base),
            dynamic_state_base: heap(HeapType::DynamicState).map_or(0, IndirectHeap::gpu_base),
            indirect_object_base: heap(HeapType::IndirectObject)
                .map_or(0, IndirectHeap::gpu_base),
            instruction_base: 0,
            dynamic_state_size: heap(HeapType::DynamicState).map_or(0, IndirectHeap::size_in_pages),
            indirect_object_size: heap(HeapType::IndirectObject)
                .map_or(0, IndirectHeap::size_in_pages),
            instruction_size: u32::MAX,
        }
    }

    fn ensure_scratch(&mut self, per_thread: u32) -> Result<Option<u64>> {
        if per_thread == 0 {
            return Ok(self.state.surfaces.scratch.as_ref().map(|s| s.gpu_address()));
        }
        if per_thread > self.state.per_thread_scratch_size {
            let size = per_thread as usize * self.csr.hw_info.total_hw_threads() as usize;
            let scratch = self.csr.memory_manager.allocate(&AllocationProperties::new(
                self.csr.root_device_index(),
                size,
                AllocationType::ScratchSurface,
            ))?;
            debug!(context_id = self.csr.context_id, per_thread, size, "scratch surface grown");
            if let Some(old) = self.state.surfaces.scratch.replace(scratch) {
                self.csr.storage.store(
                    old,
                    AllocationUsage::Temporary,
                    self.submission_task_count(),
                );
            }
            self.state.per_thread_scratch_size = per_thread;
        }
        Ok(self.state.surfaces.scratch.as_ref().map(|s| s.gpu_address()))
    }

    fn ensure_global_fence(&mut self) -> Result<()> {
        if self.state.surfaces.global_fence.is_none() {
            let fence = self.csr.memory_manager.allocate(&AllocationProperties::new(
                self.csr.root_device_index(),
                PAGE_SIZE,
                AllocationType::FenceSurface,
            ))?;
            self.state.surfaces.global_fence = Some(fence);
        }
        Ok(())
    }

    /// State commands needed before the next task, updating the tracked
    /// state to match.
    fn program_state(&mut self, flags: &DispatchFlags) -> Result<Vec<HwCommand>> {
        let mut commands = Vec::new();

        let select = PipelineSelect {
            gpgpu: true,
            media_sampler_required: flags.pipeline_select.media_sampler_required,
            systolic_mode: flags.pipeline_select.systolic_mode,
        };
        if self.state.pipeline_select != Some(select) {
            commands.push(HwCommand::PipelineSelect(select));
            self.state.pipeline_select = Some(select);
        }

        if self.state.preemption != Some(flags.preemption_mode) {
            commands.push(HwCommand::LoadRegisterImm {
                register: PREEMPTION_CONTROL_REGISTER,
                value: flags.preemption_mode.register_value(),
            });
            self.state.preemption = Some(flags.preemption_mode);
        }

        let scratch_address = self.ensure_scratch(flags.per_thread_scratch_size)?;
        let front_end = FrontEndState {
            scratch_address: scratch_address.unwrap_or(0),
            per_thread_scratch_size: self.state.per_thread_scratch_size,
            max_threads: self.csr.hw_info.total_hw_threads(),
            large_grf: flags.large_grf && self.csr.traits.supports_large_grf,
        };
        if self.state.front_end != Some(front_end) {
            commands.push(HwCommand::FrontEndState(front_end));
            self.state.front_end = Some(front_end);
        }

        let sba = self.current_state_base_address();
        if self.state.last_sba != Some(sba) {
            commands.push(HwCommand::PipeControl(PipeControl::stall().with_dc_flush(true)));
            commands.push(HwCommand::StateBaseAddress(sba));
            commands.push(HwCommand::PipeControl(PipeControl {
                state_cache_invalidate: true,
                texture_cache_invalidate: true,
                constant_cache_invalidate: true,
                instruction_cache_invalidate: true,
                ..PipeControl::stall()
            }));
            self.state.last_sba = Some(sba);
            self.state.stats.state_base_address_programmed += 1;
        }

        if flags.use_global_atomics {
            self.ensure_global_fence()?;
        }

        for node in flags.csr_dependencies.nodes() {
            if !node.is_completed() {
                commands.push(HwCommand::SemaphoreWait {
                    address: node.context_end_address(),
                    value: TIMESTAMP_INITIAL_VALUE,
                    compare: SemaphoreCompare::NotEqual,
                });
                self.state.stats.semaphores_programmed += 1;
            }
        }
        Ok(commands)
    }

    fn tag_write(&self, task_count: TaskCount, dc_flush: bool) -> HwCommand {
        HwCommand::PipeControl(
            PipeControl::stall()
                .with_dc_flush(dc_flush)
                .with_post_sync(PostSyncOp::WriteImmediate {
                    address: self.csr.tag.gpu_address(),
                    value: task_count,
                }),
        )
    }

    fn make_engine_state_resident(&mut self) {
        let mut views: Vec<Arc<GraphicsAllocation>> = vec![Arc::clone(&self.csr.tag)];
        views.extend(self.state.command_stream.shared_allocation());
        views.extend(
            self.state
                .heaps
                .iter()
                .flatten()
                .filter_map(IndirectHeap::shared_allocation),
        );
        views.extend(self.state.surfaces.resident_views());
        for view in &views {
            self.make_resident(view);
        }
    }

    // ── Flushing ────────────────────────────────────────────────────────

    /// Append `ring_commands` to the ring, make engine state resident and
    /// either submit (immediate mode) or leave the work pending (batched).
    fn commit_to_ring(
        &mut self,
        ring_commands: &[HwCommand],
        requires_coherency: bool,
    ) -> Result<(TaskCount, FlushStamp)> {
        let needed: usize = ring_commands.iter().map(HwCommand::encoded_size).sum::<usize>()
            + TASK_EPILOGUE_SIZE;
        self.ensure_ring_space(needed)?;
        let ring_start = self.state.command_stream.emit_all(ring_commands)?;
        if self.state.pending_start.is_none() {
            self.state.pending_start = Some(ring_start);
        }
        self.state.pending_coherency |= requires_coherency;
        self.make_engine_state_resident();

        let task_count = self.submission_task_count();
        match self.csr.config.dispatch_mode {
            DispatchMode::Immediate => {
                let flush_stamp = self.submit_pending(true)?;
                Ok((task_count, flush_stamp))
            }
            DispatchMode::Batched => {
                self.csr
                    .latest_sent_task_count
                    .store(task_count, Ordering::SeqCst);
                self.csr.task_count.store(task_count, Ordering::SeqCst);
                Ok((task_count, self.csr.flush_stamp()))
            }
        }
    }

    /// Terminate pending ring work and hand it to the backend.
    ///
    /// In immediate mode the task count is published only once the backend
    /// accepts the batch; `latest_flushed`/`latest_sent` move first.
    fn submit_pending(&mut self, immediate: bool) -> Result<FlushStamp> {
        let Some(start) = self.state.pending_start.take() else {
            return Ok(self.csr.flush_stamp());
        };
        let csr = self.csr;
        self.state.command_stream.emit(&HwCommand::BatchBufferEnd)?;
        let command_buffer = self
            .state
            .command_stream
            .shared_allocation()
            .ok_or_else(|| XeError::fatal("ring has no backing allocation"))?;

        let previous_flushed = csr.latest_flushed_task_count();
        let previous_sent = csr.latest_sent_task_count();
        let task_count = if immediate {
            let next = csr.task_count() + 1;
            csr.latest_flushed_task_count.store(next, Ordering::SeqCst);
            csr.latest_sent_task_count.store(next, Ordering::SeqCst);
            next
        } else {
            previous_sent
        };

        let batch = BatchBuffer {
            command_buffer,
            start_offset: start,
            used_size: self.state.command_stream.used() - start,
            context_id: csr.context_id,
            task_count,
            requires_coherency: std::mem::take(&mut self.state.pending_coherency),
            low_priority: false,
            throttle: Default::default(),
        };

        if let Some(pause) = &csr.debug_pause {
            pause.wait_for_confirmation();
        }

        let residency = std::mem::take(&mut self.state.residency);
        self.state.residency_ids.clear();
        self.state.stats.residency_peak = self.state.stats.residency_peak.max(residency.len());
        let result = csr.backend.submit(&batch, &residency);

        let eviction = std::mem::take(&mut self.state.eviction);
        if !eviction.is_empty() {
            csr.backend.process_eviction(csr.context_id, &eviction);
        }

        match result {
            Ok(flush_stamp) => {
                csr.flush_stamp.store(flush_stamp, Ordering::SeqCst);
                if immediate {
                    csr.task_count.store(task_count, Ordering::SeqCst);
                } else {
                    csr.latest_flushed_task_count
                        .store(task_count, Ordering::SeqCst);
                }
                self.state.stats.submissions += 1;
                debug!(
                    context_id = csr.context_id,
                    task_count,
                    flush_stamp,
                    residency = residency.len(),
                    bytes = batch.used_size,
                    "batch submitted"
                );
                Ok(flush_stamp)
            }
            Err(err) => {
                self.state.stats.failed_submissions += 1;
                if immediate {
                    csr.latest_flushed_task_count
                        .store(previous_flushed, Ordering::SeqCst);
                    csr.latest_sent_task_count
                        .store(previous_sent, Ordering::SeqCst);
                }
                error!(context_id = csr.context_id, task_count, %err, "batch submission failed");
                Err(err.into())
            }
        }
    }

    /// Submit a task built in `stream` starting at `stream_start`.
    ///
    /// Programs dirty state into the ring, waits on `flags.csr_dependencies`,
    /// calls the task as a second-level batch, completes any barrier
    /// timestamp packet and writes the completion tag. The caller must leave
    /// [`TASK_EPILOGUE_SIZE`] bytes free in `stream`.
    pub fn flush_task(
        &mut self,
        stream: &mut LinearStream,
        stream_start: usize,
        task_level: TaskLevel,
        flags: &DispatchFlags,
    ) -> Result<CompletionStamp> {
        let task_stream = stream
            .shared_allocation()
            .ok_or_else(|| XeError::fatal("flush_task on a stream without storage"))?;
        stream.emit(&HwCommand::BatchBufferEnd)?;

        let mut ring = self.program_state(flags)?;
        ring.push(HwCommand::BatchBufferStart {
            address: stream.gpu_address_at(stream_start),
            second_level: true,
        });
        if let Some(node) = &flags.barrier_timestamp_packet {
            ring.extend([
                HwCommand::StoreTimestamp {
                    address: node.context_start_address(),
                    kind: TimestampKind::Context,
                },
                HwCommand::StoreTimestamp {
                    address: node.global_start_address(),
                    kind: TimestampKind::Global,
                },
                HwCommand::PipeControl(PipeControl::stall().with_post_sync(
                    PostSyncOp::WriteTimestamp {
                        address: node.global_end_address(),
                    },
                )),
                HwCommand::PipeControl(PipeControl::stall().with_post_sync(
                    PostSyncOp::WriteTimestamp {
                        address: node.context_end_address(),
                    },
                )),
            ]);
        }
        if flags.guard_command_buffer_with_pipe_control {
            ring.push(HwCommand::PipeControl(PipeControl::stall()));
        }
        let dc_flush = flags.dc_flush || flags.requires_coherency;
        ring.push(self.tag_write(self.submission_task_count(), dc_flush));

        self.make_resident(&task_stream);
        for page in flags.csr_dependencies.allocations() {
            self.make_resident(&page);
        }
        if let Some(node) = &flags.barrier_timestamp_packet {
            self.make_resident(node.allocation());
        }

        let (task_count, flush_stamp) = self.commit_to_ring(&ring, flags.requires_coherency)?;
        self.csr.task_level.fetch_max(task_level, Ordering::SeqCst);
        self.state.stats.flush_tasks += 1;
        debug!(
            context_id = self.csr.context_id,
            task_count,
            task_level,
            dc_flush,
            dependencies = flags.csr_dependencies.len(),
            "task flushed"
        );
        Ok(CompletionStamp {
            task_count,
            task_level,
            flush_stamp,
        })
    }

    /// Submit a bare tag write so the tag advances with no other work.
    pub fn flush_tag_update(&mut self) -> Result<CompletionStamp> {
        let ring = [self.tag_write(self.submission_task_count(), true)];
        let (task_count, flush_stamp) = self.commit_to_ring(&ring, false)?;
        self.state.stats.tag_updates += 1;
        Ok(CompletionStamp {
            task_count,
            task_level: self.csr.task_level(),
            flush_stamp,
        })
    }

    /// Submit everything batched so far.
    pub fn flush_batched_submissions(&mut self) -> Result<()> {
        if self.state.pending_start.is_some() {
            self.submit_pending(false)?;
            self.state.stats.batched_flushes += 1;
        }
        Ok(())
    }

    #[must_use]
    pub fn has_pending_work(&self) -> bool {
        self.state.pending_start.is_some()
    }
}
