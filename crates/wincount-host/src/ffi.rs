//! C ABI for embedding runtimes
//!
//! The runtime hands over a post function once, then reports window creation
//! and destruction and registers its receive ports. All exports are safe to
//! call from any thread and never unwind into the caller.
//!
//! The post function runs on the listener thread and, for the initial count,
//! on the thread calling [`wincount_register_port`]. It must not call back into
//! these exports before returning.

use crate::host::WindowHost;
use parking_lot::{Mutex, RwLock};
use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, error};
use wincount_shared::{DeliveryError, MailboxHandle, MailboxPoster, SyncConfig};

/// Runtime function posting `value` to the port `port`; returns `false` if the
/// runtime refused the message
pub type PostFn = extern "C" fn(port: i64, value: i64) -> bool;

static POST_FN: RwLock<Option<PostFn>> = parking_lot::const_rwlock(None);

/// Process-global host, created on first use from `WINCOUNT_*` variables
static HOST: Mutex<Option<WindowHost<FfiPoster>>> = parking_lot::const_mutex(None);

/// Poster forwarding to the function installed by [`wincount_init`]
pub struct FfiPoster;

impl MailboxPoster for FfiPoster {
    fn post(&self, mailbox: MailboxHandle, value: i64) -> Result<(), DeliveryError> {
        if !mailbox.is_valid() {
            return Err(DeliveryError::InvalidHandle(mailbox));
        }
        let post = (*POST_FN.read()).ok_or(DeliveryError::Rejected(mailbox))?;
        if post(mailbox.0, value) {
            Ok(())
        } else {
            Err(DeliveryError::Rejected(mailbox))
        }
    }
}

fn with_host<R>(f: impl FnOnce(&mut WindowHost<FfiPoster>) -> R) -> R {
    let mut slot = HOST.lock();
    let host = slot.get_or_insert_with(|| WindowHost::new(SyncConfig::from_env(), FfiPoster));
    f(host)
}

/// Run `f`, turning a panic into `fallback`
fn guarded<R>(name: &str, fallback: R, f: impl FnOnce() -> R) -> R {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => value,
        Err(_) => {
            error!(export = name, "panic caught at the C ABI boundary");
            fallback
        }
    }
}

/// Install the runtime's post function; returns `false` for a null pointer
#[unsafe(no_mangle)]
pub extern "C" fn wincount_init(post_fn: Option<PostFn>) -> bool {
    guarded("wincount_init", false, || match post_fn {
        Some(post) => {
            *POST_FN.write() = Some(post);
            debug!("post function installed");
            true
        }
        None => false,
    })
}

/// Count this process's window; returns the resulting count
///
/// A window that could not join the shared counter still opens and reports
/// its local count. `-1` is only returned if the call panicked.
#[unsafe(no_mangle)]
pub extern "C" fn wincount_window_created() -> i32 {
    guarded("wincount_window_created", -1, || {
        with_host(|host| {
            host.on_create();
            host.current_count()
        })
    })
}

/// Uncount this process's window; returns the count left, or `-1` if no
/// window was created
#[unsafe(no_mangle)]
pub extern "C" fn wincount_window_destroyed() -> i32 {
    guarded("wincount_window_destroyed", -1, || {
        let Some((remaining, listener)) = with_host(|host| host.detach()) else {
            return -1;
        };
        // Joined outside the host lock: the thread may be waiting for it in a
        // callback
        if let Some(mut listener) = listener {
            listener.stop();
        }
        remaining
    })
}

/// Subscribe a receive port; it is immediately sent the current count
#[unsafe(no_mangle)]
pub extern "C" fn wincount_register_port(port: i64) -> bool {
    guarded("wincount_register_port", false, || {
        with_host(|host| host.register_mailbox(MailboxHandle(port)))
    })
}

/// Unsubscribe a receive port; returns whether it was subscribed
#[unsafe(no_mangle)]
pub extern "C" fn wincount_unregister_port(port: i64) -> bool {
    guarded("wincount_unregister_port", false, || {
        with_host(|host| host.unregister_mailbox(MailboxHandle(port)))
    })
}

/// Current window count, or `-1` before a window was created
#[unsafe(no_mangle)]
pub extern "C" fn wincount_current_count() -> i32 {
    guarded("wincount_current_count", -1, || {
        with_host(|host| {
            if host.is_created() {
                host.current_count()
            } else {
                -1
            }
        })
    })
}
