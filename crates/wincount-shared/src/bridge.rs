//! Fan-out of count changes to registered mailboxes
//!
//! A mailbox is an opaque handle to an inbox owned by the embedding runtime
//! (an isolate port, an actor inbox, a channel). The bridge keeps the set of
//! registered handles and pushes each new count to all of them through a
//! runtime-specific [`MailboxPoster`].
//!
//! Architecture:
//! ```text
//! ChangeListener ─► MailboxBridge::broadcast(count)
//!                     └─► MailboxPoster::post(handle, count)  (every handle)
//!                           └─► runtime inbox ─► UI re-renders
//! ```

use crate::error::DeliveryError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tracing::{debug, trace, warn};

/// Opaque identifier of one mailbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MailboxHandle(pub i64);

impl MailboxHandle {
    /// The handle that never identifies a mailbox
    pub const ILLEGAL: MailboxHandle = MailboxHandle(0);

    /// `false` for [`MailboxHandle::ILLEGAL`]
    pub fn is_valid(self) -> bool {
        self != Self::ILLEGAL
    }
}

impl fmt::Display for MailboxHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Runtime-specific delivery of one value into one mailbox
///
/// Implementations must not block: `post` runs on the listener thread while the
/// bridge lock is held.
pub trait MailboxPoster: Send + Sync {
    /// Deliver `value` to `mailbox`
    fn post(&self, mailbox: MailboxHandle, value: i64) -> Result<(), DeliveryError>;
}

/// Per-destination outcome of a broadcast
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Mailboxes that accepted the value
    pub delivered: Vec<MailboxHandle>,
    /// Mailboxes that rejected it, with the reason
    pub failed: Vec<(MailboxHandle, DeliveryError)>,
}

impl BroadcastReport {
    /// `true` if every registered mailbox accepted the value
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Default)]
struct Registry {
    mailboxes: Vec<MailboxHandle>,
    last_value: Option<i32>,
}

/// Thread-safe registry of mailboxes receiving count updates
pub struct MailboxBridge<P> {
    poster: P,
    registry: Mutex<Registry>,
}

impl<P: MailboxPoster> MailboxBridge<P> {
    /// Empty bridge delivering through `poster`
    pub fn new(poster: P) -> Self {
        Self {
            poster,
            registry: Mutex::new(Registry::default()),
        }
    }

    /// The poster used for delivery
    pub fn poster(&self) -> &P {
        &self.poster
    }

    /// Register `mailbox` and immediately send it `current_value`
    ///
    /// Returns `false` only if the handle is invalid. A failed initial
    /// delivery is logged and does not undo the registration.
    pub fn register(&self, mailbox: MailboxHandle, current_value: i32) -> bool {
        if !mailbox.is_valid() {
            warn!(%mailbox, "refusing to register invalid mailbox");
            return false;
        }

        let mut registry = self.registry.lock();
        if registry.mailboxes.contains(&mailbox) {
            debug!(%mailbox, "mailbox already registered");
        } else {
            registry.mailboxes.push(mailbox);
            debug!(%mailbox, total = registry.mailboxes.len(), "mailbox registered");
        }

        match self.poster.post(mailbox, i64::from(current_value)) {
            Ok(()) => trace!(%mailbox, count = current_value, "sent initial count"),
            Err(e) => warn!(%mailbox, error = %e, "failed to send initial count"),
        }
        true
    }

    /// Register `mailbox`, sending it the last broadcast value if there is one
    pub fn register_with_last(&self, mailbox: MailboxHandle) -> bool {
        let last = self.registry.lock().last_value;
        match last {
            Some(value) => self.register(mailbox, value),
            None if mailbox.is_valid() => {
                let mut registry = self.registry.lock();
                if !registry.mailboxes.contains(&mailbox) {
                    registry.mailboxes.push(mailbox);
                }
                debug!(%mailbox, "mailbox registered without initial count");
                true
            }
            None => false,
        }
    }

    /// Remove `mailbox`; returns whether it was registered
    pub fn unregister(&self, mailbox: MailboxHandle) -> bool {
        let mut registry = self.registry.lock();
        let Some(index) = registry.mailboxes.iter().position(|m| *m == mailbox) else {
            return false;
        };
        registry.mailboxes.remove(index);
        debug!(%mailbox, total = registry.mailboxes.len(), "mailbox unregistered");
        true
    }

    /// Deliver `value` to every registered mailbox
    ///
    /// One failed delivery never stops delivery to the others.
    pub fn broadcast(&self, value: i32) -> BroadcastReport {
        let mut registry = self.registry.lock();
        registry.last_value = Some(value);

        let mut report = BroadcastReport::default();
        if registry.mailboxes.is_empty() {
            return report;
        }

        trace!(count = value, mailboxes = registry.mailboxes.len(), "broadcasting count");
        for &mailbox in &registry.mailboxes {
            match self.poster.post(mailbox, i64::from(value)) {
                Ok(()) => report.delivered.push(mailbox),
                Err(e) => {
                    warn!(%mailbox, error = %e, "failed to deliver count");
                    report.failed.push((mailbox, e));
                }
            }
        }
        report
    }

    /// Last value passed to [`MailboxBridge::broadcast`]
    pub fn last_value(&self) -> Option<i32> {
        self.registry.lock().last_value
    }

    /// Number of registered mailboxes
    pub fn len(&self) -> usize {
        self.registry.lock().mailboxes.len()
    }

    /// `true` if nothing is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `true` if `mailbox` is registered
    pub fn contains(&self, mailbox: MailboxHandle) -> bool {
        self.registry.lock().mailboxes.contains(&mailbox)
    }
}

/// Poster backed by in-process unbounded channels
///
/// Each mailbox is the sending half of a channel; the receiving half belongs
/// to the consumer (a UI task, a test). Sending never blocks.
#[derive(Default)]
pub struct ChannelPoster {
    senders: Mutex<HashMap<MailboxHandle, UnboundedSender<i64>>>,
    next_id: AtomicI64,
}

impl ChannelPoster {
    /// Poster with no mailboxes
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mailbox and return its handle and receiving half
    pub fn open_mailbox(&self) -> (MailboxHandle, UnboundedReceiver<i64>) {
        let handle = MailboxHandle(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (tx, rx) = unbounded_channel();
        self.senders.lock().insert(handle, tx);
        (handle, rx)
    }

    /// Forget a mailbox; later posts to it fail with `UnknownMailbox`
    pub fn close_mailbox(&self, mailbox: MailboxHandle) -> bool {
        self.senders.lock().remove(&mailbox).is_some()
    }
}

impl MailboxPoster for ChannelPoster {
    fn post(&self, mailbox: MailboxHandle, value: i64) -> Result<(), DeliveryError> {
        if !mailbox.is_valid() {
            return Err(DeliveryError::InvalidHandle(mailbox));
        }
        let senders = self.senders.lock();
        let sender = senders
            .get(&mailbox)
            .ok_or(DeliveryError::UnknownMailbox(mailbox))?;
        sender
            .send(value)
            .map_err(|_| DeliveryError::Closed(mailbox))
    }
}
