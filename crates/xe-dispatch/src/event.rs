//! Completion signals and the dependency graph between queued commands.
//!
//! An event is either *ready* (it has a task level: its command reached an
//! engine, or it is a completed user event) or *not ready*. A command whose
//! wait list holds a not-ready event is blocked: it is parked on its own
//! event together with a [`DeferredCommand`] and registered as a child of
//! every pending predecessor. When the last predecessor is released, the
//! command is submitted and its own children are released in turn, in the
//! order they were added.
//!
//! Children are released when a parent is submitted; same-engine ordering is
//! then carried by task counts, and cross-engine ordering by the dependency
//! resolution done at submission.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, trace, warn};
use xe_common::{Result, TaskCount, XeError};
use xe_csr::{CommandStreamReceiver, CompletionStamp, TaskLevel, TimestampPacketContainer};

use crate::blocked::DeferredCommand;

/// Status given to commands whose wait list holds a failed event.
pub const EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST: i32 = -14;

static NEXT_EVENT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Kernel,
    Marker,
    Barrier,
    /// Completed by the application.
    User,
    /// Queue-internal link for a blocked command nobody asked an event for.
    Virtual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExecutionStatus {
    Queued,
    Submitted,
    Running,
    Complete,
    /// Terminated with a negative status code.
    Error(i32),
}

impl ExecutionStatus {
    /// Numeric value in the OpenCL convention.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Complete => 0,
            Self::Running => 1,
            Self::Submitted => 2,
            Self::Queued => 3,
            Self::Error(code) => code,
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error(_))
    }

    #[must_use]
    pub const fn is_error(self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Whether commands waiting on an event in this state may proceed.
    const fn releases_children(self) -> bool {
        !matches!(self, Self::Queued)
    }
}

/// Outcome of a bounded wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WaitStatus {
    Ready,
    NotReady,
}

/// Host and device timestamps of one command, in nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ProfilingInfo {
    pub queued_ns: u64,
    pub submitted_ns: u64,
    pub start_ns: u64,
    pub end_ns: u64,
}

/// How a parent reacted to [`Event::add_child`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentState {
    /// The child now waits for this parent.
    Pending,
    /// The parent no longer blocks anything.
    Satisfied,
    Failed(i32),
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ProfilingClock {
    pub(crate) epoch: Instant,
    pub(crate) timestamp_period_ns: f64,
}

impl ProfilingClock {
    fn now_ns(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}

#[derive(Default)]
struct HostTimes {
    queued: u64,
    submitted: Option<u64>,
    completed: Option<u64>,
}

struct EventState {
    status: ExecutionStatus,
    task_level: Option<TaskLevel>,
    task_count: Option<TaskCount>,
    csr: Option<Arc<CommandStreamReceiver>>,
    timestamps: TimestampPacketContainer,
    children: VecDeque<Arc<Event>>,
    pending_parents: u32,
    command: Option<Box<dyn DeferredCommand>>,
    times: HostTimes,
}

/// A completion signal.
pub struct Event {
    id: u64,
    kind: EventKind,
    clock: Option<ProfilingClock>,
    state: Mutex<EventState>,
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("Event")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("status", &state.status)
            .field("task_level", &state.task_level)
            .field("task_count", &state.task_count)
            .field("pending_parents", &state.pending_parents)
            .finish()
    }
}

impl Event {
    fn create(kind: EventKind, clock: Option<ProfilingClock>, task_level: Option<TaskLevel>) -> Self {
        let queued = clock.map_or(0, |c| c.now_ns());
        Self {
            id: NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            clock,
            state: Mutex::new(EventState {
                status: ExecutionStatus::Queued,
                task_level,
                task_count: None,
                csr: None,
                timestamps: TimestampPacketContainer::new(),
                children: VecDeque::new(),
                pending_parents: 0,
                command: None,
                times: HostTimes {
                    queued,
                    ..HostTimes::default()
                },
            }),
        }
    }

    /// An event the application completes with
    /// [`set_user_event_status`](Self::set_user_event_status).
    #[must_use]
    pub fn new_user() -> Arc<Self> {
        Arc::new(Self::create(EventKind::User, None, None))
    }

    /// An event whose command has not reached an engine yet.
    pub(crate) fn new_blocked(kind: EventKind, clock: Option<ProfilingClock>) -> Arc<Self> {
        Arc::new(Self::create(kind, clock, None))
    }

    /// An event for work already flushed with `stamp`.
    pub(crate) fn new_submitted(
        kind: EventKind,
        clock: Option<ProfilingClock>,
        csr: Arc<CommandStreamReceiver>,
        stamp: CompletionStamp,
        timestamps: TimestampPacketContainer,
    ) -> Arc<Self> {
        let event = Arc::new(Self::create(kind, clock, None));
        event.mark_submitted(csr, stamp, timestamps);
        event
    }

    fn lock(&self) -> MutexGuard<'_, EventState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub const fn kind(&self) -> EventKind {
        self.kind
    }

    /// `None` while the event's command is blocked.
    #[must_use]
    pub fn task_level(&self) -> Option<TaskLevel> {
        self.lock().task_level
    }

    #[must_use]
    pub fn task_count(&self) -> Option<TaskCount> {
        self.lock().task_count
    }

    /// Engine the event's command was flushed to.
    #[must_use]
    pub fn csr(&self) -> Option<Arc<CommandStreamReceiver>> {
        self.lock().csr.clone()
    }

    /// Nodes the hardware writes when the event's command runs.
    #[must_use]
    pub fn timestamp_nodes(&self) -> TimestampPacketContainer {
        self.lock().timestamps.clone()
    }

    #[must_use]
    pub fn is_ready_for_submission(&self) -> bool {
        let state = self.lock();
        match self.kind {
            EventKind::User => state.status == ExecutionStatus::Complete,
            _ => state.task_level.is_some(),
        }
    }

    /// Number of predecessors the event's command still waits for.
    #[must_use]
    pub fn pending_parents(&self) -> u32 {
        self.lock().pending_parents
    }

    /// Refresh the status from the engine and return it.
    pub fn update_execution_status(&self) -> ExecutionStatus {
        let mut state = self.lock();
        if matches!(state.status, ExecutionStatus::Submitted | ExecutionStatus::Running) {
            let tag_passed = match (&state.csr, state.task_count) {
                (Some(csr), Some(task_count)) => csr.is_completed(task_count),
                _ => false,
            };
            let packets_done = !state.timestamps.is_empty() && state.timestamps.is_completed();
            if tag_passed || packets_done {
                state.status = ExecutionStatus::Complete;
                state.times.completed = self.clock.map(|c| c.now_ns());
                trace!(event = self.id, task_count = ?state.task_count, "event complete");
            } else if state
                .timestamps
                .nodes()
                .first()
                .is_some_and(|node| node.read().is_ok_and(|data| data.context_start != xe_csr::TIMESTAMP_INITIAL_VALUE))
            {
                state.status = ExecutionStatus::Running;
            }
        }
        state.status
    }

    /// Current status, refreshed.
    pub fn execution_status(&self) -> ExecutionStatus {
        self.update_execution_status()
    }

    /// Complete or fail a user event, releasing everything waiting on it.
    pub fn set_user_event_status(self: &Arc<Self>, status: ExecutionStatus) -> Result<()> {
        if self.kind != EventKind::User {
            return Err(XeError::invalid_operation(format!(
                "event {} is a {:?} event, not a user event",
                self.id, self.kind
            )));
        }
        if !status.is_terminal() || matches!(status, ExecutionStatus::Error(code) if code >= 0) {
            return Err(XeError::invalid_argument(format!(
                "user events can only be completed or failed, got {status:?}"
            )));
        }
        {
            let mut state = self.lock();
            if state.status.is_terminal() {
                return Err(XeError::invalid_operation(format!(
                    "user event {} already set to {:?}",
                    self.id, state.status
                )));
            }
            state.status = status;
            state.task_level = Some(0);
        }
        debug!(event = self.id, ?status, "user event set");
        Self::propagate(self);
        Ok(())
    }

    /// Make `child` wait for this event.
    pub fn add_child(&self, child: &Arc<Event>) -> ParentState {
        let mut state = self.lock();
        if let ExecutionStatus::Error(code) = state.status {
            return ParentState::Failed(code);
        }
        if state.status.releases_children() {
            return ParentState::Satisfied;
        }
        child.lock().pending_parents += 1;
        state.children.push_back(Arc::clone(child));
        ParentState::Pending
    }

    /// Park `command` until the event's predecessors are released.
    ///
    /// The caller holds one registration reference (see
    /// [`release_registration`](Self::release_registration)) while wiring
    /// parents so the command cannot start halfway through.
    pub(crate) fn park(&self, command: Box<dyn DeferredCommand>) {
        let mut state = self.lock();
        state.command = Some(command);
        state.pending_parents += 1;
    }

    /// Drop the registration reference taken by [`park`](Self::park);
    /// returns the command when nothing else blocks it.
    pub(crate) fn release_registration(&self) -> Option<Box<dyn DeferredCommand>> {
        let mut state = self.lock();
        state.pending_parents = state.pending_parents.saturating_sub(1);
        if state.pending_parents == 0 {
            state.command.take()
        } else {
            None
        }
    }

    pub(crate) fn mark_submitted(
        &self,
        csr: Arc<CommandStreamReceiver>,
        stamp: CompletionStamp,
        timestamps: TimestampPacketContainer,
    ) {
        let mut state = self.lock();
        state.status = ExecutionStatus::Submitted;
        state.task_level = Some(stamp.task_level);
        state.task_count = Some(stamp.task_count);
        state.csr = Some(csr);
        state.timestamps = timestamps;
        state.times.submitted = self.clock.map(|c| c.now_ns());
    }

    pub(crate) fn mark_failed(&self, code: i32) {
        let mut state = self.lock();
        state.status = ExecutionStatus::Error(code);
        state.command = None;
    }

    /// Release the children of `event` and, transitively, of every command
    /// that becomes runnable as a result.
    pub(crate) fn propagate(event: &Arc<Event>) {
        let mut worklist = VecDeque::from([Arc::clone(event)]);
        while let Some(parent) = worklist.pop_front() {
            let (status, children) = {
                let mut state = parent.lock();
                if !state.status.releases_children() {
                    continue;
                }
                (state.status, std::mem::take(&mut state.children))
            };
            for child in children {
                if child.on_parent_released(status) {
                    worklist.push_back(child);
                }
            }
        }
    }

    /// Returns whether the child changed state and must release its own
    /// children.
    fn on_parent_released(self: &Arc<Self>, parent_status: ExecutionStatus) -> bool {
        if parent_status.is_error() {
            return self.abort_blocked();
        }
        let ready = {
            let mut state = self.lock();
            if state.status.is_terminal() {
                return false;
            }
            state.pending_parents = state.pending_parents.saturating_sub(1);
            if state.pending_parents > 0 {
                return false;
            }
            state.command.take()
        };
        match ready {
            Some(command) => {
                self.run_command(command);
                true
            }
            None => false,
        }
    }

    /// Fail a blocked event because a predecessor failed, dropping its
    /// command. Returns whether the status changed; the caller releases the
    /// children.
    pub(crate) fn abort_blocked(self: &Arc<Self>) -> bool {
        let command = {
            let mut state = self.lock();
            if state.status.is_terminal() {
                return false;
            }
            state.status = ExecutionStatus::Error(EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST);
            state.pending_parents = 0;
            state.command.take()
        };
        if let Some(command) = command {
            warn!(event = self.id, command = command.describe(), "blocked command aborted");
            command.abort(self, EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST);
        }
        true
    }

    fn run_command(self: &Arc<Self>, command: Box<dyn DeferredCommand>) {
        let description = command.describe();
        if let Err(err) = command.submit(self) {
            error!(event = self.id, command = description, %err, "blocked command failed");
            self.mark_failed(err.status_code());
        }
    }

    /// Drop the registration reference and, if every parent already let go,
    /// run the command and release its children.
    ///
    /// Must not be called with the owning queue locked.
    pub(crate) fn finish_registration(self: &Arc<Self>) {
        if let Some(command) = self.release_registration() {
            self.run_command(command);
            Self::propagate(self);
        }
    }

    /// Wait for this event, bounded per engine by the configured timeout.
    pub fn wait(&self) -> Result<WaitStatus> {
        Self::wait_for_events(std::slice::from_ref(&self))
    }

    /// Wait until every event completes. A failed event yields
    /// [`XeError::ExecStatusError`]; an engine wait timing out yields
    /// [`WaitStatus::NotReady`].
    pub fn wait_for_events<E: AsRef<Event>>(events: &[E]) -> Result<WaitStatus> {
        Self::wait_for_events_with_timeout(events, None)
    }

    /// Like [`wait_for_events`](Self::wait_for_events), additionally giving up
    /// on blocked events after `timeout`.
    pub fn wait_for_events_with_timeout<E: AsRef<Event>>(
        events: &[E],
        timeout: Option<Duration>,
    ) -> Result<WaitStatus> {
        let start = Instant::now();
        for event in events {
            let event = event.as_ref();
            loop {
                match event.update_execution_status() {
                    ExecutionStatus::Complete => break,
                    ExecutionStatus::Error(status) => {
                        return Err(XeError::ExecStatusError { status });
                    }
                    ExecutionStatus::Submitted | ExecutionStatus::Running => {
                        let (csr, task_count) = {
                            let state = event.lock();
                            (state.csr.clone(), state.task_count)
                        };
                        if let (Some(csr), Some(task_count)) = (csr, task_count)
                            && !csr.wait_for_task_count(task_count)
                        {
                            return Ok(WaitStatus::NotReady);
                        }
                    }
                    ExecutionStatus::Queued => {
                        if timeout.is_some_and(|limit| start.elapsed() >= limit) {
                            return Ok(WaitStatus::NotReady);
                        }
                        std::thread::yield_now();
                        std::hint::spin_loop();
                    }
                }
            }
        }
        Ok(WaitStatus::Ready)
    }

    /// Timestamps of a completed command on a profiling queue.
    pub fn profiling_info(&self) -> Result<ProfilingInfo> {
        let Some(clock) = self.clock else {
            return Err(XeError::invalid_operation(format!(
                "event {} was not created on a profiling queue",
                self.id
            )));
        };
        if self.update_execution_status() != ExecutionStatus::Complete {
            return Err(XeError::invalid_operation(format!(
                "profiling info for event {} not available before completion",
                self.id
            )));
        }
        let state = self.lock();
        let submitted_ns = state.times.submitted.unwrap_or(state.times.queued);
        let to_ns = |ticks: u32| (f64::from(ticks) * clock.timestamp_period_ns) as u64;
        let nodes = state.timestamps.nodes();
        let (start_ns, end_ns) = match (nodes.first(), nodes.last()) {
            (Some(first), Some(last)) => {
                let first = first.read()?;
                let last = last.read()?;
                (to_ns(first.global_start), to_ns(last.global_end))
            }
            _ => {
                let completed = state.times.completed.unwrap_or(submitted_ns);
                (submitted_ns, completed)
            }
        };
        Ok(ProfilingInfo {
            queued_ns: state.times.queued,
            submitted_ns,
            start_ns,
            end_ns,
        })
    }
}

impl AsRef<Event> for Event {
    fn as_ref(&self) -> &Event {
        self
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(command) = state.command.take() {
            debug!(event = self.id, command = command.describe(), "dropping never-released command");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Recorder {
        log: Arc<Mutex<Vec<u64>>>,
        aborted: Arc<AtomicUsize>,
    }

    impl DeferredCommand for Recorder {
        fn submit(self: Box<Self>, event: &Arc<Event>) -> Result<()> {
            self.log.lock().unwrap().push(event.id());
            let mut state = event.lock();
            state.status = ExecutionStatus::Submitted;
            state.task_level = Some(1);
            Ok(())
        }

        fn abort(self: Box<Self>, _event: &Arc<Event>, _status: i32) {
            self.aborted.fetch_add(1, Ordering::SeqCst);
        }

        fn describe(&self) -> &'static str {
            "recorder"
        }
    }

    fn blocked_on(
        parents: &[&Arc<Event>],
        log: &Arc<Mutex<Vec<u64>>>,
        aborted: &Arc<AtomicUsize>,
    ) -> Arc<Event> {
        let event = Event::new_blocked(EventKind::Virtual, None);
        event.park(Box::new(Recorder {
            log: Arc::clone(log),
            aborted: Arc::clone(aborted),
        }));
        for parent in parents {
            assert_eq!(parent.add_child(&event), ParentState::Pending);
        }
        assert!(event.release_registration().is_none());
        event
    }

    #[test]
    fn user_event_releases_chain_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let aborted = Arc::new(AtomicUsize::new(0));
        let user = Event::new_user();
        let first = blocked_on(&[&user], &log, &aborted);
        let second = blocked_on(&[&first], &log, &aborted);
        let sibling = blocked_on(&[&user], &log, &aborted);
        assert!(!first.is_ready_for_submission());

        user.set_user_event_status(ExecutionStatus::Complete).unwrap();

        assert_eq!(*log.lock().unwrap(), vec![first.id(), sibling.id(), second.id()]);
        assert!(second.is_ready_for_submission());
        assert_eq!(aborted.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn command_waits_for_every_parent() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let aborted = Arc::new(AtomicUsize::new(0));
        let a = Event::new_user();
        let b = Event::new_user();
        let child = blocked_on(&[&a, &b], &log, &aborted);

        a.set_user_event_status(ExecutionStatus::Complete).unwrap();
        assert_eq!(child.pending_parents(), 1);
        assert!(log.lock().unwrap().is_empty());

        b.set_user_event_status(ExecutionStatus::Complete).unwrap();
        assert_eq!(*log.lock().unwrap(), vec![child.id()]);
    }

    #[test]
    fn failed_user_event_aborts_dependents() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let aborted = Arc::new(AtomicUsize::new(0));
        let user = Event::new_user();
        let first = blocked_on(&[&user], &log, &aborted);
        let second = blocked_on(&[&first], &log, &aborted);

        user.set_user_event_status(ExecutionStatus::Error(-5)).unwrap();

        assert!(log.lock().unwrap().is_empty());
        assert_eq!(aborted.load(Ordering::SeqCst), 2);
        assert_eq!(
            second.execution_status(),
            ExecutionStatus::Error(EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST)
        );
        let err = Event::wait_for_events(&[first]).unwrap_err();
        assert!(matches!(err, XeError::ExecStatusError { status: -14 }));
    }

    #[test]
    fn user_event_status_is_set_once() {
        let user = Event::new_user();
        assert!(matches!(
            user.set_user_event_status(ExecutionStatus::Submitted),
            Err(XeError::InvalidArgument { .. })
        ));
        user.set_user_event_status(ExecutionStatus::Complete).unwrap();
        assert!(matches!(
            user.set_user_event_status(ExecutionStatus::Complete),
            Err(XeError::InvalidOperation { .. })
        ));
        assert_eq!(user.add_child(&Event::new_user()), ParentState::Satisfied);
        assert_eq!(Event::wait_for_events(&[user]).unwrap(), WaitStatus::Ready);
    }

    #[test]
    fn blocked_wait_gives_up_after_timeout() {
        let user = Event::new_user();
        let status =
            Event::wait_for_events_with_timeout(&[&*user], Some(Duration::from_millis(5))).unwrap();
        assert_eq!(status, WaitStatus::NotReady);
    }

    #[test]
    fn profiling_requires_profiling_queue() {
        let user = Event::new_user();
        user.set_user_event_status(ExecutionStatus::Complete).unwrap();
        assert!(matches!(user.profiling_info(), Err(XeError::InvalidOperation { .. })));
    }
}
