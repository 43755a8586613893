//! Error types for the synchronization stack

use crate::bridge::MailboxHandle;
use std::io;
use thiserror::Error;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors raised by the region, the change event and the listener
#[derive(Debug, Error)]
pub enum SyncError {
    /// The OS refused to create or map a named object
    #[error("shared resource `{name}` is unavailable: {source}")]
    ResourceUnavailable {
        /// OS-level object name
        name: String,
        /// Underlying OS error
        #[source]
        source: io::Error,
    },

    /// A region with this name exists but was written by an incompatible layout
    #[error("shared region `{name}` has an incompatible layout (magic {found:#010x})")]
    IncompatibleLayout {
        /// OS-level object name
        name: String,
        /// Magic value found in the region
        found: u32,
    },

    /// The counter was used before it was successfully opened
    #[error("shared counter is not initialized")]
    NotInitialized,

    /// Decrement would take the counter below zero
    #[error("window count underflow: decrement at zero")]
    Underflow,

    /// Increment would overflow the counter
    #[error("window count overflow")]
    Overflow,

    /// Signalling, resetting or waiting on the change event failed
    #[error("change event `{name}` failed: {source}")]
    Event {
        /// OS-level object name
        name: String,
        /// Underlying OS error
        #[source]
        source: io::Error,
    },

    /// The listener could not be started
    #[error("change listener failed to start: {0}")]
    ListenerStart(#[source] Box<SyncError>),

    /// The listener thread could not be spawned
    #[error("failed to spawn listener thread: {0}")]
    Spawn(#[source] io::Error),
}

impl SyncError {
    pub(crate) fn unavailable(name: &str, source: io::Error) -> Self {
        SyncError::ResourceUnavailable {
            name: name.to_string(),
            source,
        }
    }

    pub(crate) fn event(name: &str, source: io::Error) -> Self {
        SyncError::Event {
            name: name.to_string(),
            source,
        }
    }
}

/// Failure to deliver one value to one mailbox
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// The handle can never identify a mailbox
    #[error("invalid mailbox handle {0}")]
    InvalidHandle(MailboxHandle),

    /// The poster does not know this mailbox
    #[error("unknown mailbox {0}")]
    UnknownMailbox(MailboxHandle),

    /// The receiving side has gone away
    #[error("mailbox {0} is closed")]
    Closed(MailboxHandle),

    /// The runtime refused the message
    #[error("mailbox {0} rejected the message")]
    Rejected(MailboxHandle),
}
