//! Window lifecycle glue for the shared window counter
//!
//! [`WindowHost`] is what a window process embeds: it counts the window on
//! creation, keeps a listener running while the window lives and uncounts it on
//! destruction. The [`ffi`] module exposes one process-global host to runtimes
//! that load this crate as a shared library.

mod host;
pub mod ffi;

pub use host::{HostStatus, WindowHost};
