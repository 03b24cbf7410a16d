//! Command submission for xe-runtime.
//!
//! Commands are encoded as dword records ([`commands`]) into linear streams
//! and indirect heaps, then handed to a [`CommandStreamReceiver`] which
//! chains them from its ring, tracks residency and publishes completion
//! through a tag allocation. [`sim::SimulatedGpu`] executes the encoded
//! stream in-process and stands in for a kernel-mode driver.

pub mod commands;
pub mod csr;
pub mod debug_pause;
pub mod dispatch_flags;
pub mod indirect_heap;
pub mod linear_stream;
pub mod sim;
pub mod submission;
pub mod timestamp_packet;

pub use commands::{HwCommand, InterfaceDescriptor, Opcode, PipeControl, WalkerCommand};
pub use csr::{
    CommandStreamReceiver, CompletionStamp, CsrGuard, CsrStats, EngineDescriptor, EngineUsage,
    TASK_EPILOGUE_SIZE, TaskLevel,
};
pub use debug_pause::{DebugPause, DebugPauseState};
pub use dispatch_flags::{DispatchFlags, L3CachingSettings, PreemptionMode, QueueThrottle};
pub use indirect_heap::{HeapType, IndirectHeap};
pub use linear_stream::LinearStream;
pub use sim::{CompletionMode, ExecutedWalker, PageFault, SimStats, SimulatedGpu};
pub use submission::{BatchBuffer, FlushStamp, SubmissionBackend, SubmissionError};
pub use timestamp_packet::{
    TIMESTAMP_INITIAL_VALUE, TimestampPacketAllocator, TimestampPacketContainer,
    TimestampPacketData, TimestampPacketNode,
};
