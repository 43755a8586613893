//! Named shared memory region holding the window counter
//!
//! Layout (16 bytes, identical in every process):
//! ```text
//! ┌────────────────┐
//! │ count: i32     │  <- window count, atomic only
//! │ magic: u32     │  <- 0xDEADBEEF once the creator has stamped it
//! │ attached: u32  │  <- live handles across all processes
//! │ reserved: u32  │
//! └────────────────┘
//! ```

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::event::ChangeEvent;
use crate::{MAGIC, REGION_SIZE, sys};
use std::io;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use tracing::{debug, info, warn};

/// Header at the start of the shared region
#[repr(C)]
pub struct CounterBlock {
    /// Number of open windows
    pub count: AtomicI32,
    /// Layout marker, see [`MAGIC`]
    pub magic: AtomicU32,
    /// Number of live handles to the region; `u32::MAX` once released
    pub attached: AtomicU32,
    /// Reserved for future use
    pub reserved: u32,
}

const _: () = assert!(size_of::<CounterBlock>() == REGION_SIZE);

/// How a handle came to be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// This handle created the region; the count started at zero
    Created,
    /// The region already existed; its count was left untouched
    Attached,
}

/// Handle to the shared window counter
///
/// Dropping the handle unmaps the region. The value survives as long as any
/// process keeps a handle open.
pub struct SharedCounter {
    mapping: sys::Mapping,
    name: String,
    opened: OpenMode,
    event: Option<ChangeEvent>,
}

impl SharedCounter {
    /// Open the region and change event named by `config`
    pub fn open(config: &SyncConfig) -> Result<Self> {
        Self::open_named(&config.region_object_name(), &config.event_object_name())
    }

    /// Open a region and event by their OS-level names
    pub fn open_named(region_name: &str, event_name: &str) -> Result<Self> {
        let (mapping, created) = Self::attach(region_name)?;

        let opened = if created {
            OpenMode::Created
        } else {
            OpenMode::Attached
        };

        // A region without an event still counts; it just cannot notify
        let event = match ChangeEvent::open(event_name) {
            Ok(event) => Some(event),
            Err(e) => {
                warn!(error = %e, "change event unavailable, counter changes will not be signalled");
                None
            }
        };

        // From here on the handle is counted, so drop balances it
        let counter = Self {
            mapping,
            name: region_name.to_string(),
            opened,
            event,
        };

        let block = counter.block();
        match opened {
            OpenMode::Created => {
                // Fresh mappings are zero-filled, so the count already starts
                // at zero; an early attacher may have incremented it since.
                let _ = block
                    .magic
                    .compare_exchange(0, MAGIC, Ordering::AcqRel, Ordering::Acquire);
                info!(name = region_name, "shared counter created");
            }
            OpenMode::Attached => {
                let found = block.magic.load(Ordering::Acquire);
                // Zero means the creator has not stamped the header yet
                if found != 0 && found != MAGIC {
                    return Err(SyncError::IncompatibleLayout {
                        name: region_name.to_string(),
                        found,
                    });
                }
                info!(
                    name = region_name,
                    count = block.count.load(Ordering::Relaxed),
                    "shared counter attached"
                );
            }
        }

        Ok(counter)
    }

    /// Map the region and count this handle in it
    ///
    /// A region whose last handle is being released still holds its name for a
    /// moment; it is never joined, the name is retried until it is replaced.
    fn attach(region_name: &str) -> Result<(sys::Mapping, bool)> {
        for _ in 0..sys::ATTACH_ATTEMPTS {
            let (mapping, created) = sys::Mapping::open_or_create(region_name, REGION_SIZE)
                .map_err(|e| SyncError::unavailable(region_name, e))?;
            if sys::try_attach(&Self::block_of(&mapping).attached) {
                return Ok((mapping, created));
            }
            drop(mapping);
            debug!(name = region_name, "region is being released, retrying");
            std::thread::sleep(sys::ATTACH_RETRY_DELAY);
        }
        Err(SyncError::unavailable(
            region_name,
            io::Error::new(
                io::ErrorKind::WouldBlock,
                "region stayed in release while attaching",
            ),
        ))
    }

    fn block_of(mapping: &sys::Mapping) -> &CounterBlock {
        unsafe { &*(mapping.as_ptr() as *const CounterBlock) }
    }

    /// Raw header of the region, as every process sees it
    pub fn block(&self) -> &CounterBlock {
        Self::block_of(&self.mapping)
    }

    /// OS-level name of the region
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this handle created the region or attached to it
    pub fn opened(&self) -> OpenMode {
        self.opened
    }

    /// `true` if this handle created the region
    pub fn is_creator(&self) -> bool {
        self.opened == OpenMode::Created
    }

    /// `true` if mutations will be signalled to listeners
    pub fn can_notify(&self) -> bool {
        self.event.is_some()
    }

    /// Number of live handles across all processes
    pub fn attached_handles(&self) -> u32 {
        sys::handles(&self.block().attached)
    }

    /// Atomically add one window and return the new count
    pub fn increment(&self) -> Result<i32> {
        let previous = self
            .block()
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_add(1))
            .map_err(|_| SyncError::Overflow)?;
        let count = previous + 1;
        debug!(count, "window count incremented");
        self.notify();
        Ok(count)
    }

    /// Atomically remove one window and return the new count
    ///
    /// Refuses to go below zero: a decrement at zero returns
    /// [`SyncError::Underflow`] and leaves the count unchanged.
    pub fn decrement(&self) -> Result<i32> {
        let previous = self
            .block()
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                if c > 0 { Some(c - 1) } else { None }
            })
            .map_err(|_| SyncError::Underflow)?;
        let count = previous - 1;
        debug!(count, "window count decremented");
        self.notify();
        Ok(count)
    }

    /// Snapshot of the count; may be stale as soon as it returns
    pub fn read(&self) -> i32 {
        self.block().count.load(Ordering::Relaxed)
    }

    /// Release this handle explicitly (same as dropping it)
    pub fn close(self) {
        drop(self);
    }

    fn notify(&self) {
        if let Some(event) = &self.event
            && let Err(e) = event.signal()
        {
            warn!(error = %e, "failed to signal change event");
        }
    }
}

impl Drop for SharedCounter {
    fn drop(&mut self) {
        if sys::detach(&self.block().attached) {
            debug!(name = %self.name, "last handle closed, releasing shared counter");
            sys::release_name(&self.name);
        }
    }
}

impl std::fmt::Debug for SharedCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedCounter")
            .field("name", &self.name)
            .field("opened", &self.opened)
            .field("count", &self.read())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::WaitOutcome;
    use std::sync::Arc;
    use std::time::Duration;

    /// Generate unique names for each test to avoid conflicts
    fn unique_config() -> SyncConfig {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let id = COUNTER.fetch_add(1, Ordering::SeqCst);
        let pid = std::process::id();
        SyncConfig::with_names(
            format!("wincount-region-{pid}-{id}"),
            format!("wincount-region-event-{pid}-{id}"),
        )
    }

    #[test]
    fn test_fresh_region_starts_at_zero() {
        let counter = SharedCounter::open(&unique_config()).expect("Failed to open counter");
        assert_eq!(counter.opened(), OpenMode::Created);
        assert!(counter.is_creator());
        assert!(counter.can_notify());
        assert_eq!(counter.read(), 0);
        assert_eq!(counter.attached_handles(), 1);
    }

    #[test]
    fn test_attach_does_not_reset_count() {
        let config = unique_config();
        let first = SharedCounter::open(&config).unwrap();
        assert_eq!(first.increment().unwrap(), 1);

        let second = SharedCounter::open(&config).unwrap();
        assert_eq!(second.opened(), OpenMode::Attached);
        assert_eq!(second.read(), 1);
        assert_eq!(first.attached_handles(), 2);
    }

    #[test]
    fn test_increment_and_decrement_return_new_value() {
        let counter = SharedCounter::open(&unique_config()).unwrap();
        assert_eq!(counter.increment().unwrap(), 1);
        assert_eq!(counter.increment().unwrap(), 2);
        assert_eq!(counter.increment().unwrap(), 3);
        assert_eq!(counter.decrement().unwrap(), 2);
        assert_eq!(counter.decrement().unwrap(), 1);
        assert_eq!(counter.decrement().unwrap(), 0);
        assert_eq!(counter.read(), 0);
    }

    #[test]
    fn test_decrement_at_zero_underflows() {
        let counter = SharedCounter::open(&unique_config()).unwrap();
        let err = counter.decrement().unwrap_err();
        assert!(matches!(err, SyncError::Underflow));
        assert_eq!(counter.read(), 0);
    }

    #[test]
    fn test_mutations_visible_across_handles() {
        let config = unique_config();
        let windows: Vec<_> = (0..3).map(|_| SharedCounter::open(&config).unwrap()).collect();

        for window in &windows {
            window.increment().unwrap();
        }
        for window in &windows {
            assert_eq!(window.read(), 3);
        }

        windows[0].decrement().unwrap();
        for window in &windows {
            assert_eq!(window.read(), 2);
        }
    }

    #[test]
    fn test_concurrent_mutations_are_not_lost() {
        let config = unique_config();
        let anchor = SharedCounter::open(&config).unwrap();

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let counter = SharedCounter::open(&config).unwrap();
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        counter.increment().unwrap();
                    }
                    for _ in 0..100 {
                        counter.decrement().unwrap();
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(anchor.read(), 4 * (250 - 100));
    }

    #[test]
    fn test_value_destroyed_with_last_handle() {
        let config = unique_config();
        let counter = SharedCounter::open(&config).unwrap();
        counter.increment().unwrap();
        counter.close();

        let reopened = SharedCounter::open(&config).unwrap();
        assert_eq!(reopened.opened(), OpenMode::Created);
        assert_eq!(reopened.read(), 0);
    }

    #[test]
    fn test_released_region_is_never_joined() {
        let config = unique_config();
        let dying = SharedCounter::open(&config).unwrap();
        dying.increment().unwrap();
        // Freeze the region in the state between the last release and the
        // name being dropped
        dying.block().attached.store(sys::RELEASED, Ordering::Release);

        let err = SharedCounter::open(&config).unwrap_err();
        assert!(matches!(err, SyncError::ResourceUnavailable { .. }));

        dying.block().attached.store(1, Ordering::Release);
        dying.close();
        let fresh = SharedCounter::open(&config).unwrap();
        assert_eq!(fresh.opened(), OpenMode::Created);
        assert_eq!(fresh.read(), 0);
    }

    #[test]
    fn test_open_racing_last_close_shares_one_count() {
        let config = unique_config();
        for _ in 0..200 {
            let last = SharedCounter::open(&config).unwrap();
            last.increment().unwrap();
            let closer = std::thread::spawn(move || last.close());
            let racer = SharedCounter::open(&config).unwrap();
            closer.join().unwrap();

            // Whatever the racer joined, a later opener must join the same one
            let later = SharedCounter::open(&config).unwrap();
            racer.increment().unwrap();
            assert_eq!(later.read(), racer.read());
            assert_eq!(racer.attached_handles(), 2);
        }
    }

    #[test]
    fn test_increment_signals_event() {
        let config = unique_config();
        let event = ChangeEvent::open(&config.event_object_name()).unwrap();
        let counter = SharedCounter::open(&config).unwrap();

        counter.increment().unwrap();
        assert_eq!(
            event.wait(Duration::from_millis(100)).unwrap(),
            WaitOutcome::Signaled
        );
    }

    #[test]
    fn test_decrement_signals_event() {
        let config = unique_config();
        let event = ChangeEvent::open(&config.event_object_name()).unwrap();
        let counter = SharedCounter::open(&config).unwrap();

        counter.increment().unwrap();
        event.reset().unwrap();

        counter.decrement().unwrap();
        assert_eq!(
            event.wait(Duration::from_millis(100)).unwrap(),
            WaitOutcome::Signaled
        );
    }

    #[test]
    fn test_underflow_does_not_signal() {
        let config = unique_config();
        let event = ChangeEvent::open(&config.event_object_name()).unwrap();
        let counter = SharedCounter::open(&config).unwrap();

        assert!(counter.decrement().is_err());
        assert_eq!(
            event.wait(Duration::from_millis(20)).unwrap(),
            WaitOutcome::TimedOut
        );
    }

    #[test]
    fn test_counter_shared_between_threads() {
        let counter = Arc::new(SharedCounter::open(&unique_config()).unwrap());
        let clone = Arc::clone(&counter);
        std::thread::spawn(move || clone.increment().unwrap())
            .join()
            .unwrap();
        assert_eq!(counter.read(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_name_with_nul_is_unavailable() {
        let err = SharedCounter::open_named("/bad\0name", "/bad-event").unwrap_err();
        assert!(matches!(err, SyncError::ResourceUnavailable { .. }));
    }
}
