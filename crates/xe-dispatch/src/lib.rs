//! Devices, command queues, events and command lists for xe-runtime.
//!
//! A [`CommandQueue`] turns kernel enqueues into walkers
//! ([`dispatch_info`]), programs them into engine heaps
//! ([`hardware_interface`]) and flushes them through a
//! [`CommandStreamReceiver`](xe_csr::CommandStreamReceiver). Commands whose
//! wait list is not ready are parked on their [`Event`] and replayed when it
//! resolves.

pub mod aux_translation;
pub mod blocked;
pub mod command_list;
pub mod device;
pub mod dispatch_info;
pub mod event;
pub mod hardware_interface;
pub mod queue;
pub mod trace;

pub use aux_translation::AUX_TRANSLATION_KERNEL;
pub use blocked::DeferredCommand;
pub use command_list::{CommandList, SignalEvent};
pub use device::Device;
pub use dispatch_info::{
    DefaultWalkerBuilder, DispatchInfo, DispatchInfoBuilder, DispatchKind, MultiDispatchInfo,
    SplitWalkerBuilder,
};
pub use event::{
    EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST, Event, EventKind, ExecutionStatus, ParentState,
    ProfilingInfo, WaitStatus,
};
pub use hardware_interface::{DispatchTarget, HeapRequirements};
pub use queue::{CommandQueue, EnqueueOptions, NdRange, QueueProperties, QueueStats};
pub use trace::{DispatchRecord, DispatchTracer};
