//! Shared window counter for multi-process applications
//!
//! Every window of the application runs in its own process. The processes share
//! one integer (the number of open windows) through a named shared memory region
//! and learn about changes through a named manual-reset event, without polling.
//!
//! # Architecture
//!
//! The synchronization stack has three layers:
//! - [`SharedCounter`] - named region holding an atomically mutated `i32`
//! - [`ChangeListener`] - per-process thread blocked on the [`ChangeEvent`]
//! - [`MailboxBridge`] - fans each new value out to registered mailboxes
//!
//! ```text
//! increment() ─► ChangeEvent::signal() ─► ChangeListener (every process)
//!                                           └─► read() ─► MailboxBridge::broadcast()
//! ```
//!
//! # Platforms
//!
//! On Windows the region is a paging-file backed file mapping and the event is a
//! kernel event object. On Unix both are POSIX shared memory segments; the event
//! is emulated in its own segment and woken through a process-shared futex on
//! Linux.
//!
//! Other Unix targets have no process-shared wait primitive that fits, so their
//! listeners poll the event segment in 1ms slices. Notifications still arrive,
//! up to one slice late and at the cost of periodic wake-ups.

#![deny(missing_docs)]

pub mod bridge;
pub mod config;
pub mod error;
pub mod event;
pub mod listener;
pub mod region;
mod sys;

pub use bridge::*;
pub use config::*;
pub use error::*;
pub use event::*;
pub use listener::*;
pub use region::*;

/// Default base name of the counter region
pub const REGION_NAME: &str = "MultiWindowCounter";

/// Default base name of the change event
pub const EVENT_NAME: &str = "WindowCountChanged";

/// Magic value stamped into a region by its creator
pub const MAGIC: u32 = 0xDEAD_BEEF;

/// Size of the shared region (one counter plus reserved words)
pub const REGION_SIZE: usize = 16;
