//! Optional interactive pause before each submission.
//!
//! A background thread asks for confirmation while the submitting thread
//! spins on a shared state word. Declining (or a closed input) terminates
//! the worker and later submissions proceed without pausing.

use std::io::BufRead;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DebugPauseState {
    Idle = 0,
    WaitingForUserStartConfirmation = 1,
    HasUserStartConfirmation = 2,
    Terminate = 3,
}

impl DebugPauseState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::WaitingForUserStartConfirmation,
            2 => Self::HasUserStartConfirmation,
            _ => Self::Terminate,
        }
    }
}

/// Asks the user whether to proceed; `false` stops pausing.
pub type ConfirmFn = Box<dyn FnMut() -> bool + Send>;

pub struct DebugPause {
    state: Arc<AtomicU8>,
    worker: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for DebugPause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebugPause").field("state", &self.state()).finish()
    }
}

impl DebugPause {
    pub fn spawn(mut confirm: ConfirmFn) -> std::io::Result<Self> {
        let state = Arc::new(AtomicU8::new(DebugPauseState::Idle as u8));
        let worker_state = Arc::clone(&state);
        let worker = std::thread::Builder::new()
            .name("xe-debug-pause".into())
            .spawn(move || {
                loop {
                    match DebugPauseState::from_u8(worker_state.load(Ordering::Acquire)) {
                        DebugPauseState::WaitingForUserStartConfirmation => {
                            let next = if confirm() {
                                DebugPauseState::HasUserStartConfirmation
                            } else {
                                DebugPauseState::Terminate
                            };
                            let _ = worker_state.compare_exchange(
                                DebugPauseState::WaitingForUserStartConfirmation as u8,
                                next as u8,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            );
                        }
                        DebugPauseState::Terminate => break,
                        _ => std::thread::sleep(Duration::from_millis(1)),
                    }
                }
                debug!("debug pause worker exiting");
            })?;
        Ok(Self {
            state,
            worker: Some(worker),
        })
    }

    /// Confirm by reading a line from standard input.
    pub fn from_stdin() -> std::io::Result<Self> {
        Self::spawn(Box::new(|| {
            eprintln!("xe-runtime: press enter to submit the next batch (q to stop pausing)");
            let mut line = String::new();
            match std::io::stdin().lock().read_line(&mut line) {
                Ok(0) | Err(_) => false,
                Ok(_) => line.trim() != "q",
            }
        }))
    }

    #[must_use]
    pub fn state(&self) -> DebugPauseState {
        DebugPauseState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Block until the user confirms. Returns immediately once terminated.
    pub fn wait_for_confirmation(&self) {
        if self
            .state
            .compare_exchange(
                DebugPauseState::Idle as u8,
                DebugPauseState::WaitingForUserStartConfirmation as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }
        loop {
            match self.state() {
                DebugPauseState::HasUserStartConfirmation => {
                    self.state
                        .store(DebugPauseState::Idle as u8, Ordering::Release);
                    return;
                }
                DebugPauseState::Terminate => {
                    warn!("debug pause declined; later submissions will not pause");
                    return;
                }
                _ => {
                    std::thread::yield_now();
                    std::hint::spin_loop();
                }
            }
        }
    }
}

impl Drop for DebugPause {
    fn drop(&mut self) {
        self.state
            .store(DebugPauseState::Terminate as u8, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
