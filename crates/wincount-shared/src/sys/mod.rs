//! Platform primitives: named shared mappings and named manual-reset events
//!
//! Each backend exposes the same surface:
//! - `Mapping::open_or_create(name, len) -> io::Result<(Mapping, bool)>`
//! - `Event::open_or_create(name)`, `set`, `reset`, `wait(timeout)`
//! - `object_name(base, scope)` and `release_name(name)`
//!
//! The handle count shared by every segment is managed here so that attaching
//! and releasing the last handle never interleave.

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod win;

#[cfg(unix)]
pub(crate) use unix::*;
#[cfg(windows)]
pub(crate) use win::*;

#[cfg(not(any(unix, windows)))]
compile_error!("wincount-shared supports Windows and Unix targets only");

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Handle count of a segment whose last handle is gone; it can never be
/// attached again, only replaced under the same name
pub(crate) const RELEASED: u32 = u32::MAX;

/// Attempts to attach while a dying segment still holds the name
pub(crate) const ATTACH_ATTEMPTS: usize = 200;

/// Pause between attach attempts, letting the releasing process drop the name
pub(crate) const ATTACH_RETRY_DELAY: Duration = Duration::from_millis(1);

/// Count one more handle, unless the segment was already released
pub(crate) fn try_attach(attached: &AtomicU32) -> bool {
    attached
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
            (n != RELEASED && n < RELEASED - 1).then(|| n + 1)
        })
        .is_ok()
}

/// Count one handle less; returns `true` for the last one, which must drop the
/// name. The segment is marked [`RELEASED`] in the same step.
pub(crate) fn detach(attached: &AtomicU32) -> bool {
    let previous = attached.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| match n {
        0 | RELEASED => None,
        1 => Some(RELEASED),
        n => Some(n - 1),
    });
    previous == Ok(1)
}

/// Live handles, reading a released segment as zero
pub(crate) fn handles(attached: &AtomicU32) -> u32 {
    match attached.load(Ordering::Acquire) {
        RELEASED => 0,
        n => n,
    }
}
