//! Hardware-written start/end markers used for completion and dependencies.
//!
//! Each node holds four dwords (context start, global start, context end,
//! global end) that the GPU overwrites as the work it brackets executes.
//! A node is complete once its context end differs from
//! [`TIMESTAMP_INITIAL_VALUE`]; other engines depend on it by programming a
//! semaphore wait on that dword.
//!
//! Nodes are carved out of pooled pages. A released slot is handed out again
//! only after the owning engine's tag passes the page's last use, so the GPU
//! never writes into a node that was recycled under it.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use serde::Serialize;
use tracing::debug;
use xe_common::{ContextId, Result, TaskCount};
use xe_memory::{
    AllocationId, AllocationProperties, AllocationType, GraphicsAllocation, MemoryManager,
    OwnedAllocation,
};

/// Value every field holds until the GPU writes it.
pub const TIMESTAMP_INITIAL_VALUE: u32 = 1;

/// Distance between consecutive nodes in a page.
pub const TIMESTAMP_NODE_STRIDE: usize = 64;

pub const CONTEXT_START_OFFSET: usize = 0;
pub const GLOBAL_START_OFFSET: usize = 4;
pub const CONTEXT_END_OFFSET: usize = 8;
pub const GLOBAL_END_OFFSET: usize = 12;

/// Snapshot of a node's four markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimestampPacketData {
    pub context_start: u32,
    pub global_start: u32,
    pub context_end: u32,
    pub global_end: u32,
}

impl TimestampPacketData {
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        self.context_end != TIMESTAMP_INITIAL_VALUE
    }

    /// Elapsed context ticks, or zero while incomplete.
    #[must_use]
    pub const fn context_delta(&self) -> u32 {
        if self.is_completed() {
            self.context_end.wrapping_sub(self.context_start)
        } else {
            0
        }
    }
}

// ── Pool ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TimestampPoolStats {
    pub pages: usize,
    pub free_nodes: usize,
    pub nodes_handed_out: u64,
    pub nodes_recycled: u64,
}

#[derive(Default)]
struct PoolInner {
    pages: Vec<OwnedAllocation>,
    free: Vec<(usize, usize)>,
    handed_out: u64,
    recycled: u64,
}

/// One slot in a pooled timestamp page.
///
/// Dropping the last reference returns the slot to its allocator.
pub struct TimestampPacketNode {
    page: Arc<GraphicsAllocation>,
    page_index: usize,
    slot: usize,
    pool: Weak<Mutex<PoolInner>>,
}

impl std::fmt::Debug for TimestampPacketNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimestampPacketNode")
            .field("page", &self.page.id())
            .field("slot", &self.slot)
            .field("gpu_address", &format_args!("{:#x}", self.gpu_address()))
            .finish()
    }
}

impl Drop for TimestampPacketNode {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .free
                .push((self.page_index, self.slot));
        }
    }
}

impl TimestampPacketNode {
    const fn offset(&self) -> usize {
        self.slot * TIMESTAMP_NODE_STRIDE
    }

    #[must_use]
    pub fn gpu_address(&self) -> u64 {
        self.page.gpu_address() + self.offset() as u64
    }

    #[must_use]
    pub fn context_start_address(&self) -> u64 {
        self.gpu_address() + CONTEXT_START_OFFSET as u64
    }

    #[must_use]
    pub fn global_start_address(&self) -> u64 {
        self.gpu_address() + GLOBAL_START_OFFSET as u64
    }

    #[must_use]
    pub fn context_end_address(&self) -> u64 {
        self.gpu_address() + CONTEXT_END_OFFSET as u64
    }

    #[must_use]
    pub fn global_end_address(&self) -> u64 {
        self.gpu_address() + GLOBAL_END_OFFSET as u64
    }

    /// The page backing this node; it must be resident wherever the node is
    /// written or waited on.
    #[must_use]
    pub const fn allocation(&self) -> &Arc<GraphicsAllocation> {
        &self.page
    }

    /// Reset every marker to the initial value.
    pub fn initialize(&self) -> Result<()> {
        let initial = TIMESTAMP_INITIAL_VALUE.to_le_bytes();
        let mut bytes = [0u8; 16];
        for chunk in bytes.chunks_exact_mut(4) {
            chunk.copy_from_slice(&initial);
        }
        self.page.write_at(self.offset(), &bytes)
    }

    pub fn read(&self) -> Result<TimestampPacketData> {
        let base = self.offset();
        Ok(TimestampPacketData {
            context_start: self.page.read_u32(base + CONTEXT_START_OFFSET)?,
            global_start: self.page.read_u32(base + GLOBAL_START_OFFSET)?,
            context_end: self.page.read_u32(base + CONTEXT_END_OFFSET)?,
            global_end: self.page.read_u32(base + GLOBAL_END_OFFSET)?,
        })
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.page
            .read_u32(self.offset() + CONTEXT_END_OFFSET)
            .is_ok_and(|end| end != TIMESTAMP_INITIAL_VALUE)
    }

    /// Write start and end markers from the host, completing the node
    /// without GPU involvement.
    pub fn host_signal(&self, timestamp: u32) -> Result<()> {
        let timestamp = if timestamp == TIMESTAMP_INITIAL_VALUE {
            timestamp + 1
        } else {
            timestamp
        };
        let base = self.offset();
        for field in [
            CONTEXT_START_OFFSET,
            GLOBAL_START_OFFSET,
            CONTEXT_END_OFFSET,
            GLOBAL_END_OFFSET,
        ] {
            self.page.write_u32(base + field, timestamp)?;
        }
        Ok(())
    }
}

/// Hands out timestamp nodes from pages owned by one engine context.
pub struct TimestampPacketAllocator {
    memory_manager: Arc<MemoryManager>,
    root_device_index: u32,
    context_id: ContextId,
    nodes_per_page: usize,
    pool: Arc<Mutex<PoolInner>>,
}

impl std::fmt::Debug for TimestampPacketAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimestampPacketAllocator")
            .field("context_id", &self.context_id)
            .field("nodes_per_page", &self.nodes_per_page)
            .field("stats", &self.stats())
            .finish()
    }
}

impl TimestampPacketAllocator {
    #[must_use]
    pub fn new(
        memory_manager: Arc<MemoryManager>,
        root_device_index: u32,
        context_id: ContextId,
        nodes_per_page: usize,
    ) -> Self {
        Self {
            memory_manager,
            root_device_index,
            context_id,
            nodes_per_page: nodes_per_page.max(1),
            pool: Arc::new(Mutex::new(PoolInner::default())),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolInner> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A freshly initialised node.
    ///
    /// Reuses a released slot whose page has retired at `completed`, otherwise
    /// grows the pool by one page.
    pub fn get_node(&self, completed: TaskCount) -> Result<Arc<TimestampPacketNode>> {
        let context_id = self.context_id;
        let mut inner = self.lock();
        let reusable = inner.free.iter().position(|(page, _)| {
            inner.pages[*page]
                .task_count(context_id)
                .is_none_or(|tc| tc <= completed)
        });

        let (page_index, slot) = match reusable {
            Some(position) => {
                inner.recycled += 1;
                inner.free.swap_remove(position)
            }
            None => {
                let size = self.nodes_per_page * TIMESTAMP_NODE_STRIDE;
                let page = self.memory_manager.allocate(&AllocationProperties::new(
                    self.root_device_index,
                    size,
                    AllocationType::TimestampPacketTagBuffer,
                ))?;
                let page_index = inner.pages.len();
                debug!(
                    id = %page.id(),
                    page_index,
                    nodes = self.nodes_per_page,
                    context_id,
                    "timestamp packet page allocated"
                );
                inner.pages.push(page);
                inner
                    .free
                    .extend((1..self.nodes_per_page).map(|slot| (page_index, slot)));
                (page_index, 0)
            }
        };
        inner.handed_out += 1;

        let node = Arc::new(TimestampPacketNode {
            page: inner.pages[page_index].share(),
            page_index,
            slot,
            pool: Arc::downgrade(&self.pool),
        });
        drop(inner);
        node.initialize()?;
        Ok(node)
    }

    #[must_use]
    pub fn stats(&self) -> TimestampPoolStats {
        let inner = self.lock();
        TimestampPoolStats {
            pages: inner.pages.len(),
            free_nodes: inner.free.len(),
            nodes_handed_out: inner.handed_out,
            nodes_recycled: inner.recycled,
        }
    }

    /// Detach every page for teardown.
    pub fn release_pages(&self) -> Vec<OwnedAllocation> {
        let mut inner = self.lock();
        inner.free.clear();
        std::mem::take(&mut inner.pages)
    }
}

// ── Container ───────────────────────────────────────────────────────────────

/// A set of nodes that together describe one operation or dependency list.
#[derive(Debug, Clone, Default)]
pub struct TimestampPacketContainer {
    nodes: Vec<Arc<TimestampPacketNode>>,
}

impl TimestampPacketContainer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, node: Arc<TimestampPacketNode>) {
        self.nodes.push(node);
    }

    #[must_use]
    pub fn nodes(&self) -> &[Arc<TimestampPacketNode>] {
        &self.nodes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Drop this container's references.
    pub fn release_nodes(&mut self) {
        self.nodes.clear();
    }

    /// Append references to every node in `other`.
    pub fn assign_and_increment_nodes_ref_count(&mut self, other: &Self) {
        self.nodes.extend(other.nodes.iter().cloned());
    }

    /// Hand every node over to `target`, leaving this container empty.
    pub fn move_nodes_to_new_container(&mut self, target: &mut Self) {
        target.nodes.append(&mut self.nodes);
    }

    /// Whether every node has been written by the GPU.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.nodes.iter().all(|node| node.is_completed())
    }

    /// The distinct pages backing the nodes.
    #[must_use]
    pub fn allocations(&self) -> Vec<Arc<GraphicsAllocation>> {
        let mut seen: HashSet<AllocationId> = HashSet::new();
        self.nodes
            .iter()
            .filter(|node| seen.insert(node.allocation().id()))
            .map(|node| Arc::clone(node.allocation()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator(nodes_per_page: usize) -> (Arc<MemoryManager>, TimestampPacketAllocator) {
        let mm = Arc::new(MemoryManager::new(1, 0));
        let allocator = TimestampPacketAllocator::new(Arc::clone(&mm), 0, 0, nodes_per_page);
        (mm, allocator)
    }

    #[test]
    fn fresh_node_holds_initial_values() {
        let (_mm, allocator) = allocator(4);
        let node = allocator.get_node(0).unwrap();
        let data = node.read().unwrap();
        assert_eq!(data.context_start, TIMESTAMP_INITIAL_VALUE);
        assert_eq!(data.global_end, TIMESTAMP_INITIAL_VALUE);
        assert!(!node.is_completed());
        assert_eq!(data.context_delta(), 0);
    }

    #[test]
    fn gpu_write_of_context_end_completes_node() {
        let (_mm, allocator) = allocator(4);
        let node = allocator.get_node(0).unwrap();
        let page = node.allocation();
        let offset = (node.context_end_address() - page.gpu_address()) as usize;
        page.write_u32(offset, 900).unwrap();
        assert!(node.is_completed());
    }

    #[test]
    fn host_signal_never_writes_initial_value() {
        let (_mm, allocator) = allocator(4);
        let node = allocator.get_node(0).unwrap();
        node.host_signal(TIMESTAMP_INITIAL_VALUE).unwrap();
        assert!(node.is_completed());
    }

    #[test]
    fn nodes_in_a_page_are_distinct() {
        let (_mm, allocator) = allocator(4);
        let nodes: Vec<_> = (0..4).map(|_| allocator.get_node(0).unwrap()).collect();
        let addresses: HashSet<u64> = nodes.iter().map(|n| n.gpu_address()).collect();
        assert_eq!(addresses.len(), 4);
        assert_eq!(allocator.stats().pages, 1);

        let _fifth = allocator.get_node(0).unwrap();
        assert_eq!(allocator.stats().pages, 2);
    }

    #[test]
    fn released_slot_waits_for_page_completion() {
        let (_mm, allocator) = allocator(1);
        let node = allocator.get_node(0).unwrap();
        node.allocation().update_task_count(3, 0);
        let address = node.gpu_address();
        drop(node);

        let other = allocator.get_node(2).unwrap();
        assert_ne!(other.gpu_address(), address);
        assert_eq!(allocator.stats().pages, 2);
        drop(other);

        let recycled = allocator.get_node(3).unwrap();
        assert_eq!(recycled.gpu_address(), address);
        assert!(!recycled.is_completed());
        assert_eq!(allocator.stats().nodes_recycled, 1);
    }

    #[test]
    fn shared_node_returns_only_after_last_reference() {
        let (_mm, allocator) = allocator(2);
        let node = allocator.get_node(0).unwrap();
        let mut first = TimestampPacketContainer::new();
        first.add(Arc::clone(&node));
        drop(node);

        let mut second = TimestampPacketContainer::new();
        second.assign_and_increment_nodes_ref_count(&first);
        let free_before = allocator.stats().free_nodes;
        first.release_nodes();
        assert_eq!(allocator.stats().free_nodes, free_before);
        second.release_nodes();
        assert_eq!(allocator.stats().free_nodes, free_before + 1);
    }

    #[test]
    fn move_empties_the_source() {
        let (_mm, allocator) = allocator(4);
        let mut source = TimestampPacketContainer::new();
        source.add(allocator.get_node(0).unwrap());
        source.add(allocator.get_node(0).unwrap());
        let mut target = TimestampPacketContainer::new();
        target.add(allocator.get_node(0).unwrap());

        source.move_nodes_to_new_container(&mut target);
        assert!(source.is_empty());
        assert_eq!(target.len(), 3);
        assert_eq!(target.allocations().len(), 1);
        assert!(!target.is_completed());
        for node in target.nodes() {
            node.host_signal(500).unwrap();
        }
        assert!(target.is_completed());
    }

    #[test]
    fn release_pages_detaches_everything() {
        let (mm, allocator) = allocator(2);
        let node = allocator.get_node(0).unwrap();
        let pages = allocator.release_pages();
        assert_eq!(pages.len(), 1);
        for page in pages {
            mm.free(page);
        }
        assert_eq!(mm.stats().live_allocations, 0);
        assert!(!node.is_completed());
    }
}
