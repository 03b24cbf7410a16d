//! Boundary to the kernel-mode submission layer.
//!
//! A backend receives a finished batch plus every allocation it touches and
//! returns a flush stamp. Completion is never reported through this trait;
//! the engine observes it only through the tag allocation the batch writes.

use std::sync::Arc;

use xe_common::{ContextId, TaskCount, XeError};
use xe_memory::GraphicsAllocation;

use crate::dispatch_flags::QueueThrottle;

/// Opaque token returned by a backend for each submission.
pub type FlushStamp = u64;

/// A contiguous range of a command buffer handed to the backend.
#[derive(Debug, Clone)]
pub struct BatchBuffer {
    pub command_buffer: Arc<GraphicsAllocation>,
    pub start_offset: usize,
    pub used_size: usize,
    pub context_id: ContextId,
    /// Task count the batch's tag write publishes.
    pub task_count: TaskCount,
    pub requires_coherency: bool,
    pub low_priority: bool,
    pub throttle: QueueThrottle,
}

impl BatchBuffer {
    #[must_use]
    pub fn start_address(&self) -> u64 {
        self.command_buffer.gpu_address() + self.start_offset as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmissionError {
    #[error("submission rejected: {reason}")]
    Rejected { reason: String },

    #[error("device lost: {reason}")]
    DeviceLost { reason: String },

    #[error("out of memory making {bytes} bytes resident")]
    OutOfMemory { bytes: usize },
}

impl From<SubmissionError> for XeError {
    fn from(err: SubmissionError) -> Self {
        match err {
            SubmissionError::OutOfMemory { bytes } => {
                XeError::out_of_resources("residency for submission", bytes)
            }
            other => XeError::fatal(other.to_string()),
        }
    }
}

/// Executes batches on behalf of a command stream receiver.
pub trait SubmissionBackend: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    /// Queue `batch` for execution with `residency` made resident first.
    fn submit(
        &self,
        batch: &BatchBuffer,
        residency: &[Arc<GraphicsAllocation>],
    ) -> Result<FlushStamp, SubmissionError>;

    /// Drop residency of `evicted` allocations on `context_id`.
    fn process_eviction(&self, _context_id: ContextId, _evicted: &[Arc<GraphicsAllocation>]) {}

    /// Give the backend a chance to make progress while the host spins on
    /// a tag.
    fn poll(&self) {}
}
