use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;

/// Lifecycle of a single monitored process as seen by its log watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessState {
    NotStarted,
    Waiting,
    Ready,
}

impl fmt::Display for ReadinessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReadinessState::NotStarted => "not-started",
            ReadinessState::Waiting => "waiting",
            ReadinessState::Ready => "ready",
        };
        write!(f, "{s}")
    }
}

/// Monotonic readiness flag shared between a log watcher and its pollers.
///
/// Clones share the same state. Transitions only move forward
/// (`NotStarted -> Waiting -> Ready`) and the `Ready` transition is reported
/// to exactly one caller of [`ReadinessSignal::mark_ready`].
#[derive(Debug, Clone)]
pub struct ReadinessSignal {
    state: Arc<watch::Sender<ReadinessState>>,
}

impl Default for ReadinessSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessSignal {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ReadinessState::NotStarted);
        Self {
            state: Arc::new(state),
        }
    }

    pub fn state(&self) -> ReadinessState {
        *self.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ReadinessState::Ready
    }

    /// Moves `NotStarted` to `Waiting`. Returns false if monitoring had
    /// already begun.
    pub fn begin_waiting(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == ReadinessState::NotStarted {
                *state = ReadinessState::Waiting;
                true
            } else {
                false
            }
        })
    }

    /// Moves to `Ready`. Returns true only for the call that performed the
    /// transition.
    pub fn mark_ready(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == ReadinessState::Ready {
                false
            } else {
                *state = ReadinessState::Ready;
                true
            }
        })
    }

    /// Resolves once the signal is `Ready`.
    pub async fn wait_ready(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|state| *state == ReadinessState::Ready).await;
    }
}
