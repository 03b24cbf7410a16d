//! Per-submission state requested from the command stream receiver.

use std::sync::Arc;

use crate::timestamp_packet::{TimestampPacketContainer, TimestampPacketNode};

/// Granularity at which the engine may be preempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PreemptionMode {
    Disabled,
    MidBatch,
    #[default]
    ThreadGroup,
    MidThread,
}

impl PreemptionMode {
    /// Value programmed into the preemption control register.
    #[must_use]
    pub const fn register_value(self) -> u32 {
        match self {
            Self::Disabled => 0,
            Self::MidBatch => 1,
            Self::ThreadGroup => 2,
            Self::MidThread => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueThrottle {
    Low,
    #[default]
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum L3CachingSettings {
    #[default]
    Default,
    /// Bypass L3 for host-pointer-backed surfaces.
    Uncached,
    NotApplicable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PipelineSelectArgs {
    pub media_sampler_required: bool,
    pub systolic_mode: bool,
}

/// What one `flush_task` must program around the caller's commands.
#[derive(Debug, Clone, Default)]
pub struct DispatchFlags {
    /// Host-visible coherency is required when the work completes.
    pub requires_coherency: bool,
    pub large_grf: bool,
    pub slm_used: bool,
    /// Flush the data cache with the completion tag write.
    pub dc_flush: bool,
    pub preemption_mode: PreemptionMode,
    pub l3_cache_settings: L3CachingSettings,
    pub throttle: QueueThrottle,
    pub pipeline_select: PipelineSelectArgs,
    /// Node to complete once all prior work on the engine has drained.
    pub barrier_timestamp_packet: Option<Arc<TimestampPacketNode>>,
    /// Nodes from other engines to wait on before running the task.
    pub csr_dependencies: TimestampPacketContainer,
    pub guard_command_buffer_with_pipe_control: bool,
    pub use_global_atomics: bool,
    pub blocking: bool,
    pub low_priority: bool,
    pub epilogue_required: bool,
    /// Per-thread scratch needed by the task, in bytes.
    pub per_thread_scratch_size: u32,
}

impl DispatchFlags {
    /// Flags for a standalone tag update or empty task.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_dc_flush(mut self, dc_flush: bool) -> Self {
        self.dc_flush = dc_flush;
        self
    }

    #[must_use]
    pub fn with_blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }
}
