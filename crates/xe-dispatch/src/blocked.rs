//! Commands parked until their wait list resolves.

use std::sync::{Arc, Weak};

use tracing::{debug, warn};
use xe_common::{Result, XeError};

use crate::dispatch_info::MultiDispatchInfo;
use crate::event::Event;
use crate::queue::QueueShared;

/// Work recorded at enqueue time and replayed once every predecessor of its
/// event has been released.
pub trait DeferredCommand: Send {
    /// Submit the recorded work and mark `event` submitted.
    fn submit(self: Box<Self>, event: &Arc<Event>) -> Result<()>;

    /// Drop the work because a predecessor failed with `status`.
    fn abort(self: Box<Self>, event: &Arc<Event>, status: i32);

    fn describe(&self) -> &'static str;
}

/// What a blocked queue command does once released.
#[derive(Debug)]
pub(crate) enum BlockedWork {
    /// Dispatches frozen at enqueue time; later argument changes on the
    /// kernel do not reach them.
    Kernel(MultiDispatchInfo),
    Marker,
    Barrier,
}

impl BlockedWork {
    pub(crate) const fn name(&self) -> &'static str {
        match self {
            Self::Kernel(_) => "kernel",
            Self::Marker => "marker",
            Self::Barrier => "barrier",
        }
    }
}

/// A queue command waiting on its event's predecessors.
pub(crate) struct BlockedCommand {
    pub(crate) queue: Weak<QueueShared>,
    pub(crate) work: BlockedWork,
    pub(crate) wait_list: Vec<Arc<Event>>,
}

impl DeferredCommand for BlockedCommand {
    fn submit(self: Box<Self>, event: &Arc<Event>) -> Result<()> {
        let queue = self.queue.upgrade().ok_or_else(|| {
            XeError::invalid_operation(format!(
                "queue released before blocked {} could run",
                self.work.name()
            ))
        })?;
        debug!(event = event.id(), command = self.work.name(), "replaying blocked command");
        queue.replay(self.work, &self.wait_list, event)
    }

    fn abort(self: Box<Self>, event: &Arc<Event>, status: i32) {
        warn!(
            event = event.id(),
            command = self.work.name(),
            status,
            "predecessor failed, blocked command dropped"
        );
        if let Some(queue) = self.queue.upgrade() {
            queue.forget_blocked(event);
        }
    }

    fn describe(&self) -> &'static str {
        self.work.name()
    }
}
