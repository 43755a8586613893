//! Event-driven change listener
//!
//! One background thread per process blocks on the shared [`ChangeEvent`].
//! When any process mutates the counter the thread wakes, waits a short grace
//! period so listeners in other processes see the same signal, resets the
//! event, re-reads the counter and hands the value to the registered callback.
//!
//! ```text
//! Idle ─start()─► Starting ─► Waiting ⇄ Dispatching
//!                               │
//!                            stop() ─► Stopped ─start()─► Starting ...
//! ```

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::event::{ChangeEvent, WaitOutcome};
use crate::region::SharedCounter;
use parking_lot::RwLock;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, trace, warn};

/// Something the listener can read the current count from
pub trait CountSource: Send + Sync {
    /// Authoritative current count
    fn current_count(&self) -> i32;
}

impl CountSource for SharedCounter {
    fn current_count(&self) -> i32 {
        self.read()
    }
}

impl CountSource for AtomicI32 {
    fn current_count(&self) -> i32 {
        self.load(Ordering::Acquire)
    }
}

/// Callback invoked on the listener thread with the refreshed count
pub type CountCallback = Arc<dyn Fn(i32) + Send + Sync>;

/// Lifecycle state of a [`ChangeListener`]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// Constructed, never started
    Idle = 0,
    /// Opening the event and spawning the thread
    Starting = 1,
    /// Blocked on the change event
    Waiting = 2,
    /// Running the callback
    Dispatching = 3,
    /// Stopped; may be started again
    Stopped = 4,
}

impl From<u8> for ListenerState {
    fn from(v: u8) -> Self {
        match v {
            1 => ListenerState::Starting,
            2 => ListenerState::Waiting,
            3 => ListenerState::Dispatching,
            4 => ListenerState::Stopped,
            _ => ListenerState::Idle,
        }
    }
}

/// State shared with the listener thread
struct Shared {
    state: AtomicU8,
    stop: AtomicBool,
    wakeups: AtomicU64,
    callback: RwLock<Option<CountCallback>>,
}

impl Shared {
    fn set_state(&self, state: ListenerState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// Background listener for counter changes
pub struct ChangeListener {
    event_name: String,
    reset_grace: Duration,
    wait_timeout: Duration,
    source: Arc<dyn CountSource>,
    shared: Arc<Shared>,
    event: Option<Arc<ChangeEvent>>,
    thread: Option<JoinHandle<()>>,
}

impl ChangeListener {
    /// Listener on the event named by `config`, reading values from `source`
    pub fn new(config: &SyncConfig, source: Arc<dyn CountSource>) -> Self {
        Self {
            event_name: config.event_object_name(),
            reset_grace: config.reset_grace,
            wait_timeout: config.wait_timeout,
            source,
            shared: Arc::new(Shared {
                state: AtomicU8::new(ListenerState::Idle as u8),
                stop: AtomicBool::new(false),
                wakeups: AtomicU64::new(0),
                callback: RwLock::new(None),
            }),
            event: None,
            thread: None,
        }
    }

    /// Set the callback; takes effect from the next notification
    pub fn set_callback<F>(&self, callback: F)
    where
        F: Fn(i32) + Send + Sync + 'static,
    {
        *self.shared.callback.write() = Some(Arc::new(callback));
    }

    /// Remove the callback; notifications are still consumed
    pub fn clear_callback(&self) {
        *self.shared.callback.write() = None;
    }

    /// Current lifecycle state
    pub fn state(&self) -> ListenerState {
        ListenerState::from(self.shared.state.load(Ordering::Acquire))
    }

    /// `true` between a successful `start()` and the next `stop()`
    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }

    /// Number of notifications dispatched since construction
    pub fn wakeups(&self) -> u64 {
        self.shared.wakeups.load(Ordering::Relaxed)
    }

    /// Open the change event and spawn the listener thread
    ///
    /// Calling `start()` on a running listener is a no-op.
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }

        let previous = self.state();
        self.shared.set_state(ListenerState::Starting);

        let event = match ChangeEvent::open(&self.event_name) {
            Ok(event) => Arc::new(event),
            Err(e) => {
                self.shared.set_state(previous);
                return Err(SyncError::ListenerStart(Box::new(e)));
            }
        };

        self.shared.stop.store(false, Ordering::Release);
        // Set before spawning so the thread's own transitions are never overwritten
        self.shared.set_state(ListenerState::Waiting);

        let worker = Worker {
            event: Arc::clone(&event),
            source: Arc::clone(&self.source),
            shared: Arc::clone(&self.shared),
            reset_grace: self.reset_grace,
            wait_timeout: self.wait_timeout,
        };

        let thread = std::thread::Builder::new()
            .name("wincount-listener".to_string())
            .spawn(move || worker.run());

        match thread {
            Ok(thread) => {
                debug!(event = %self.event_name, "change listener started");
                self.event = Some(event);
                self.thread = Some(thread);
                Ok(())
            }
            Err(e) => {
                self.shared.set_state(previous);
                Err(SyncError::ListenerStart(Box::new(SyncError::Spawn(e))))
            }
        }
    }

    /// Stop the listener thread and wait for it to exit
    ///
    /// Calling `stop()` on a listener that is not running is a no-op.
    pub fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };

        self.shared.stop.store(true, Ordering::Release);
        if let Some(event) = &self.event
            && let Err(e) = event.signal()
        {
            // The thread still exits at its next wait timeout
            warn!(error = %e, "failed to wake listener thread");
        }

        if thread.join().is_err() {
            error!("change listener thread panicked");
        }

        self.event = None;
        self.shared.set_state(ListenerState::Stopped);
        debug!(event = %self.event_name, "change listener stopped");
    }
}

impl Drop for ChangeListener {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Everything the listener thread owns
struct Worker {
    event: Arc<ChangeEvent>,
    source: Arc<dyn CountSource>,
    shared: Arc<Shared>,
    reset_grace: Duration,
    wait_timeout: Duration,
}

impl Worker {
    fn run(self) {
        while !self.stopping() {
            self.shared.set_state(ListenerState::Waiting);

            match self.event.wait(self.wait_timeout) {
                Ok(WaitOutcome::Signaled) => {}
                Ok(WaitOutcome::TimedOut) => continue,
                Err(e) => {
                    warn!(error = %e, "waiting on change event failed");
                    std::thread::sleep(self.wait_timeout);
                    continue;
                }
            }

            // Give listeners in other processes time to observe the signal
            // before it is cleared
            std::thread::sleep(self.reset_grace);
            if let Err(e) = self.event.reset() {
                warn!(error = %e, "failed to reset change event");
            }

            if self.stopping() {
                break;
            }

            // Read after the reset: a mutation during the grace period is
            // either included here or signals the event again
            self.shared.set_state(ListenerState::Dispatching);
            let count = self.source.current_count();
            self.shared.wakeups.fetch_add(1, Ordering::Relaxed);
            self.dispatch(count);
        }
        trace!("change listener thread exiting");
    }

    fn stopping(&self) -> bool {
        self.shared.stop.load(Ordering::Acquire)
    }

    fn dispatch(&self, count: i32) {
        let Some(callback) = self.shared.callback.read().clone() else {
            trace!(count, "no callback registered");
            return;
        };

        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(count))) {
            let message = if let Some(s) = panic.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic.downcast_ref::<String>() {
                s.clone()
            } else {
                "<unknown panic>".to_string()
            };
            error!(count, %message, "change callback panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::mpsc;
    use std::time::Instant;

    fn unique_config() -> SyncConfig {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let id = COUNTER.fetch_add(1, Ordering::SeqCst);
        let pid = std::process::id();
        SyncConfig::with_names(
            format!("wincount-listener-{pid}-{id}"),
            format!("wincount-listener-event-{pid}-{id}"),
        )
        .with_wait_timeout(Duration::from_millis(100))
    }

    fn local_source(value: i32) -> Arc<AtomicI32> {
        Arc::new(AtomicI32::new(value))
    }

    /// Listener whose callback forwards every value to a channel
    fn channel_listener(
        config: &SyncConfig,
        source: Arc<dyn CountSource>,
    ) -> (ChangeListener, mpsc::Receiver<i32>) {
        let listener = ChangeListener::new(config, source);
        let (tx, rx) = mpsc::channel();
        listener.set_callback(move |count| {
            let _ = tx.send(count);
        });
        (listener, rx)
    }

    #[test]
    fn test_new_listener_is_idle() {
        let listener = ChangeListener::new(&unique_config(), local_source(0));
        assert_eq!(listener.state(), ListenerState::Idle);
        assert!(!listener.is_running());
    }

    #[test]
    fn test_start_and_stop() {
        let mut listener = ChangeListener::new(&unique_config(), local_source(0));
        listener.start().unwrap();
        assert!(listener.is_running());
        assert!(matches!(
            listener.state(),
            ListenerState::Waiting | ListenerState::Dispatching
        ));

        listener.stop();
        assert!(!listener.is_running());
        assert_eq!(listener.state(), ListenerState::Stopped);
    }

    #[test]
    fn test_start_is_idempotent() {
        let mut listener = ChangeListener::new(&unique_config(), local_source(0));
        listener.start().unwrap();
        listener.start().unwrap();
        assert!(listener.is_running());
        listener.stop();
    }

    #[test]
    fn test_stop_when_not_running_is_noop() {
        let mut listener = ChangeListener::new(&unique_config(), local_source(0));
        listener.stop();
        listener.stop();
        assert_eq!(listener.state(), ListenerState::Idle);
    }

    #[test]
    fn test_restart_after_stop() {
        let config = unique_config();
        let (mut listener, rx) = channel_listener(&config, local_source(7));
        let event = ChangeEvent::open(&config.event_object_name()).unwrap();

        listener.start().unwrap();
        listener.stop();
        // Drain the wake-up caused by our own stop()
        while rx.try_recv().is_ok() {}

        listener.start().unwrap();
        assert!(listener.is_running());
        event.signal().unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 7);
        listener.stop();
    }

    #[test]
    fn test_callback_not_called_when_not_started() {
        let config = unique_config();
        let (_listener, rx) = channel_listener(&config, local_source(1));
        let event = ChangeEvent::open(&config.event_object_name()).unwrap();
        event.signal().unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_callback_receives_value_on_signal() {
        let config = unique_config();
        let source = local_source(0);
        let (mut listener, rx) = channel_listener(&config, source.clone());
        listener.start().unwrap();

        let event = ChangeEvent::open(&config.event_object_name()).unwrap();
        source.store(2, Ordering::Release);
        event.signal().unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 2);
        assert!(listener.wakeups() >= 1);
    }

    #[test]
    fn test_callback_sees_shared_counter_value() {
        let config = unique_config();
        let counter = Arc::new(SharedCounter::open(&config).unwrap());
        let (mut listener, rx) = channel_listener(&config, counter.clone());
        listener.start().unwrap();

        let other_window = SharedCounter::open(&config).unwrap();
        other_window.increment().unwrap();
        other_window.increment().unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        let mut last = None;
        while Instant::now() < deadline {
            match rx.recv_timeout(Duration::from_millis(200)) {
                Ok(count) => last = Some(count),
                Err(_) if last.is_some() => break,
                Err(_) => {}
            }
        }
        // Rapid increments may coalesce, but the final callback is never stale
        assert_eq!(last, Some(2));
    }

    #[test]
    fn test_notification_latency_is_low() {
        let config = unique_config().with_reset_grace(Duration::from_millis(1));
        let (mut listener, rx) = channel_listener(&config, local_source(3));
        listener.start().unwrap();
        let event = ChangeEvent::open(&config.event_object_name()).unwrap();

        let started = Instant::now();
        event.signal().unwrap();
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn test_two_listeners_on_one_event_both_fire() {
        let config = unique_config();
        let (mut first, first_rx) = channel_listener(&config, local_source(1));
        let (mut second, second_rx) = channel_listener(&config, local_source(1));
        first.start().unwrap();
        second.start().unwrap();

        let event = ChangeEvent::open(&config.event_object_name()).unwrap();
        event.signal().unwrap();

        assert_eq!(first_rx.recv_timeout(Duration::from_secs(2)).unwrap(), 1);
        assert_eq!(second_rx.recv_timeout(Duration::from_secs(2)).unwrap(), 1);
    }

    #[test]
    fn test_panicking_callback_does_not_stop_listener() {
        let config = unique_config();
        let mut listener = ChangeListener::new(&config, local_source(5));
        let (tx, rx) = mpsc::channel();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);
        listener.set_callback(move |count| {
            if calls_clone.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("first callback fails");
            }
            let _ = tx.send(count);
        });
        listener.start().unwrap();

        let event = ChangeEvent::open(&config.event_object_name()).unwrap();
        event.signal().unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while calls.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        // Let the first dispatch finish before signalling again
        std::thread::sleep(Duration::from_millis(50));

        event.signal().unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 5);
        assert!(listener.is_running());
    }

    #[test]
    fn test_no_callback_does_not_crash() {
        let config = unique_config();
        let mut listener = ChangeListener::new(&config, local_source(0));
        listener.start().unwrap();

        let event = ChangeEvent::open(&config.event_object_name()).unwrap();
        event.signal().unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while listener.wakeups() == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(listener.wakeups() >= 1);
        listener.stop();
    }

    #[test]
    fn test_drop_stops_listener() {
        let config = unique_config();
        let (tx, rx) = mpsc::channel::<()>();
        {
            let mut listener = ChangeListener::new(&config, local_source(0));
            listener.set_callback(move |_| {
                let _ = tx.send(());
            });
            listener.start().unwrap();
        }
        // The callback (and its sender) went away with the thread
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            match rx.recv_timeout(Duration::from_millis(50)) {
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
                _ => assert!(Instant::now() < deadline, "listener kept running after drop"),
            }
        }
    }

    #[test]
    fn test_state_from_u8() {
        assert_eq!(ListenerState::from(0), ListenerState::Idle);
        assert_eq!(ListenerState::from(1), ListenerState::Starting);
        assert_eq!(ListenerState::from(2), ListenerState::Waiting);
        assert_eq!(ListenerState::from(3), ListenerState::Dispatching);
        assert_eq!(ListenerState::from(4), ListenerState::Stopped);
        assert_eq!(ListenerState::from(99), ListenerState::Idle);
    }
}
