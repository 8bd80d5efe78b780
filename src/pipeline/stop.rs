use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

const RUNNING: u8 = 0;
const STOPPING: u8 = 1;
const ABORTED: u8 = 2;

/// Escalation level of a [`StopSignal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StopLevel {
    Running,
    /// Finish the current iteration, then finalize.
    Stopping,
    /// Also give up on finalization retries.
    Aborted,
}

/// Externally settable stop flag shared with an acquisition loop.
///
/// Raising is sticky: once set, the level never goes back down, so a stop
/// raised while the loop sleeps is seen on its next check.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    state: Arc<AtomicU8>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a graceful stop.
    pub fn raise(&self) {
        self.state.fetch_max(STOPPING, Ordering::AcqRel);
    }

    pub fn abort(&self) {
        self.state.store(ABORTED, Ordering::Release);
    }

    /// Move one level up and return the new level (Ctrl-C semantics).
    pub fn escalate(&self) -> StopLevel {
        let previous = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                Some((s + 1).min(ABORTED))
            })
            .unwrap_or(ABORTED);
        Self::level_of((previous + 1).min(ABORTED))
    }

    pub fn level(&self) -> StopLevel {
        Self::level_of(self.state.load(Ordering::Acquire))
    }

    pub fn is_raised(&self) -> bool {
        self.state.load(Ordering::Acquire) >= STOPPING
    }

    pub fn is_aborted(&self) -> bool {
        self.state.load(Ordering::Acquire) >= ABORTED
    }

    fn level_of(state: u8) -> StopLevel {
        match state {
            RUNNING => StopLevel::Running,
            STOPPING => StopLevel::Stopping,
            _ => StopLevel::Aborted,
        }
    }
}
