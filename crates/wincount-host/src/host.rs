//! Window lifecycle glue
//!
//! A window process calls into the synchronization stack at two points:
//! creation (attach to the counter, count itself, start listening) and
//! destruction (uncount itself, stop listening). Everything in between is
//! driven by the listener thread pushing counts into the mailbox bridge.

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use tracing::{debug, info, warn};
use wincount_shared::{
    ChangeListener, CountSource, MailboxBridge, MailboxHandle, MailboxPoster, Result,
    SharedCounter, SyncConfig, SyncError,
};

/// Whether the window takes part in cross-process synchronization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostStatus {
    /// Shared counter and listener are both running
    Synced,
    /// Something failed; the window runs with a local-only count
    Degraded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Pending,
    Created,
    Destroyed,
}

/// Per-process host tying one window's lifecycle to the shared counter
pub struct WindowHost<P: MailboxPoster + 'static> {
    config: SyncConfig,
    bridge: Arc<MailboxBridge<P>>,
    counter: Option<Arc<SharedCounter>>,
    listener: Option<ChangeListener>,
    local_count: Arc<AtomicI32>,
    /// Whether this window's own increment landed in the shared count
    counted: bool,
    lifecycle: Lifecycle,
}

impl<P: MailboxPoster + 'static> WindowHost<P> {
    /// Host that will deliver counts through `poster`
    pub fn new(config: SyncConfig, poster: P) -> Self {
        Self {
            config,
            bridge: Arc::new(MailboxBridge::new(poster)),
            counter: None,
            listener: None,
            local_count: Arc::new(AtomicI32::new(0)),
            counted: false,
            lifecycle: Lifecycle::Pending,
        }
    }

    /// Configuration used by this host
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// The bridge fanning counts out to mailboxes
    pub fn bridge(&self) -> &Arc<MailboxBridge<P>> {
        &self.bridge
    }

    /// Attach to the shared counter, count this window and start listening
    ///
    /// Never fails: if the shared layer is unavailable the window still opens
    /// with a local-only count and [`HostStatus::Degraded`] is returned.
    pub fn on_create(&mut self) -> HostStatus {
        if self.lifecycle == Lifecycle::Created {
            return self.status();
        }

        match SharedCounter::open(&self.config) {
            Ok(counter) => {
                match counter.increment() {
                    Ok(count) => {
                        self.counted = true;
                        info!(count, "window attached to shared counter");
                    }
                    Err(e) => warn!(error = %e, "failed to count this window"),
                }
                self.counter = Some(Arc::new(counter));
            }
            Err(e) => {
                warn!(error = %e, "shared counter unavailable, running with a local count");
                self.local_count.store(1, Ordering::Release);
            }
        }

        let source: Arc<dyn CountSource> = match &self.counter {
            Some(counter) => counter.clone(),
            None => self.local_count.clone(),
        };
        let mut listener = ChangeListener::new(&self.config, source);
        let bridge = Arc::clone(&self.bridge);
        listener.set_callback(move |count| {
            bridge.broadcast(count);
        });
        if let Err(e) = listener.start() {
            warn!(error = %e, "window count changes from other windows will not be seen");
        }
        self.listener = Some(listener);
        self.lifecycle = Lifecycle::Created;

        self.status()
    }

    /// Uncount this window and stop listening
    ///
    /// Returns the count left after this window, or `None` if the window was
    /// never created or is already destroyed.
    pub fn on_destroy(&mut self) -> Option<i32> {
        let (remaining, listener) = self.detach()?;
        if let Some(mut listener) = listener {
            listener.stop();
        }
        Some(remaining)
    }

    /// Uncount this window and hand back its listener, still running
    ///
    /// Stopping joins the listener thread, which may be inside a callback;
    /// callers holding a lock that callbacks can take stop it after releasing
    /// that lock.
    pub(crate) fn detach(&mut self) -> Option<(i32, Option<ChangeListener>)> {
        if self.lifecycle != Lifecycle::Created {
            return None;
        }

        let remaining = match &self.counter {
            Some(counter) if self.counted => match counter.decrement() {
                Ok(count) => count,
                Err(e) => {
                    warn!(error = %e, "failed to uncount this window");
                    counter.read()
                }
            },
            // Never counted, so there is nothing to take back
            Some(counter) => counter.read(),
            None => {
                let _ = self
                    .local_count
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                        (c > 0).then(|| c - 1)
                    });
                self.local_count.load(Ordering::Acquire)
            }
        };

        let listener = self.listener.take();
        self.counter = None;
        self.counted = false;
        self.lifecycle = Lifecycle::Destroyed;
        debug!(remaining, "window detached");
        Some((remaining, listener))
    }

    /// Current synchronization status
    pub fn status(&self) -> HostStatus {
        let listening = self.listener.as_ref().is_some_and(|l| l.is_running());
        if self.counter.is_some() && listening {
            HostStatus::Synced
        } else {
            HostStatus::Degraded
        }
    }

    /// `true` between `on_create()` and `on_destroy()`
    pub fn is_created(&self) -> bool {
        self.lifecycle == Lifecycle::Created
    }

    /// Shared count when synced, otherwise the local count
    pub fn current_count(&self) -> i32 {
        match &self.counter {
            Some(counter) => counter.read(),
            None => self.local_count.load(Ordering::Acquire),
        }
    }

    /// Add a window through the shared counter
    pub fn increment(&self) -> Result<i32> {
        self.counter
            .as_ref()
            .ok_or(SyncError::NotInitialized)?
            .increment()
    }

    /// Remove a window through the shared counter
    pub fn decrement(&self) -> Result<i32> {
        self.counter
            .as_ref()
            .ok_or(SyncError::NotInitialized)?
            .decrement()
    }

    /// Subscribe a mailbox; it immediately receives the current count
    pub fn register_mailbox(&self, mailbox: MailboxHandle) -> bool {
        self.bridge.register(mailbox, self.current_count())
    }

    /// Unsubscribe a mailbox; returns whether it was registered
    pub fn unregister_mailbox(&self, mailbox: MailboxHandle) -> bool {
        self.bridge.unregister(mailbox)
    }
}

impl<P: MailboxPoster + 'static> Drop for WindowHost<P> {
    fn drop(&mut self) {
        self.on_destroy();
    }
}
