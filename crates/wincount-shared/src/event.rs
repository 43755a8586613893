//! Named manual-reset change event shared by every process

use crate::error::{Result, SyncError};
use crate::sys;
use std::time::Duration;
use tracing::trace;

/// Outcome of a bounded wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The event was signalled
    Signaled,
    /// The timeout expired first
    TimedOut,
}

/// Handle to the named change event
///
/// The event is manual-reset: once signalled it releases every waiter in every
/// process until someone calls [`ChangeEvent::reset`].
pub struct ChangeEvent {
    name: String,
    raw: sys::Event,
}

impl ChangeEvent {
    /// Create the event if absent, otherwise open it (initially not signalled)
    pub fn open(name: &str) -> Result<Self> {
        let raw = sys::Event::open_or_create(name).map_err(|e| SyncError::unavailable(name, e))?;
        trace!(name, "change event opened");
        Ok(Self {
            name: name.to_string(),
            raw,
        })
    }

    /// OS-level name of the event
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Release all current and future waiters until reset
    pub fn signal(&self) -> Result<()> {
        self.raw.set().map_err(|e| SyncError::event(&self.name, e))
    }

    /// Return the event to the non-signalled state
    pub fn reset(&self) -> Result<()> {
        self.raw.reset().map_err(|e| SyncError::event(&self.name, e))
    }

    /// Block until signalled or until `timeout` expires
    pub fn wait(&self, timeout: Duration) -> Result<WaitOutcome> {
        match self.raw.wait(timeout) {
            Ok(true) => Ok(WaitOutcome::Signaled),
            Ok(false) => Ok(WaitOutcome::TimedOut),
            Err(e) => Err(SyncError::event(&self.name, e)),
        }
    }
}

impl std::fmt::Debug for ChangeEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeEvent").field("name", &self.name).finish()
    }
}
