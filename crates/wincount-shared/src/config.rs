//! Naming and timing configuration shared by every process of the application

use crate::{EVENT_NAME, REGION_NAME, sys};
use std::time::Duration;

/// Default delay between waking on the event and resetting it
pub const DEFAULT_RESET_GRACE: Duration = Duration::from_millis(10);

/// Default bound on a single wait, after which the stop flag is re-checked
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_millis(500);

/// Visibility of the named objects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scope {
    /// Visible to processes of the current user session
    #[default]
    Session,
    /// Visible machine-wide (may require elevation on Windows)
    Global,
}

/// Names and timings used to open the region and run listeners
///
/// Any two processes that should see the same counter must use the same
/// region name, event name and scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Base name of the counter region
    pub region_name: String,
    /// Base name of the change event
    pub event_name: String,
    /// Visibility of both objects
    pub scope: Scope,
    /// How long a woken listener waits before resetting the event, so that
    /// listeners in other processes observe the same signal
    pub reset_grace: Duration,
    /// Upper bound of one blocking wait; only used to re-check the stop flag
    pub wait_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            region_name: REGION_NAME.to_string(),
            event_name: EVENT_NAME.to_string(),
            scope: Scope::Session,
            reset_grace: DEFAULT_RESET_GRACE,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }
}

impl SyncConfig {
    /// Config with custom base names and default timings
    pub fn with_names(region_name: impl Into<String>, event_name: impl Into<String>) -> Self {
        Self {
            region_name: region_name.into(),
            event_name: event_name.into(),
            ..Self::default()
        }
    }

    /// Set the visibility scope
    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    /// Set the reset grace delay
    pub fn with_reset_grace(mut self, grace: Duration) -> Self {
        self.reset_grace = grace;
        self
    }

    /// Set the wait timeout
    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    /// Defaults overridden by `WINCOUNT_*` environment variables
    ///
    /// Used where no command line is available, e.g. inside an embedding
    /// runtime that loads the host library.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for:
    /// - `WINCOUNT_REGION`, `WINCOUNT_EVENT` - base names
    /// - `WINCOUNT_SCOPE` - `session` or `global`
    /// - `WINCOUNT_GRACE_MS`, `WINCOUNT_WAIT_MS` - timings in milliseconds
    ///
    /// Unparseable values are ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(name) = lookup("WINCOUNT_REGION").filter(|n| !n.is_empty()) {
            config.region_name = name;
        }
        if let Some(name) = lookup("WINCOUNT_EVENT").filter(|n| !n.is_empty()) {
            config.event_name = name;
        }
        if let Some(scope) = lookup("WINCOUNT_SCOPE") {
            match scope.to_ascii_lowercase().as_str() {
                "global" => config.scope = Scope::Global,
                "session" => config.scope = Scope::Session,
                _ => {}
            }
        }
        let millis = |key: &str| lookup(key).and_then(|v| v.parse::<u64>().ok());
        if let Some(ms) = millis("WINCOUNT_GRACE_MS") {
            config.reset_grace = Duration::from_millis(ms);
        }
        if let Some(ms) = millis("WINCOUNT_WAIT_MS").filter(|ms| *ms > 0) {
            config.wait_timeout = Duration::from_millis(ms);
        }
        config
    }

    /// OS-level name of the region
    pub fn region_object_name(&self) -> String {
        sys::object_name(&self.region_name, self.scope)
    }

    /// OS-level name of the change event
    pub fn event_object_name(&self) -> String {
        sys::object_name(&self.event_name, self.scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.region_name, REGION_NAME);
        assert_eq!(config.event_name, EVENT_NAME);
        assert_eq!(config.scope, Scope::Session);
        assert_eq!(config.reset_grace, Duration::from_millis(10));
    }

    #[test]
    fn test_object_names_are_distinct() {
        let config = SyncConfig::default();
        assert_ne!(config.region_object_name(), config.event_object_name());
    }

    #[test]
    fn test_scope_changes_object_name() {
        let session = SyncConfig::with_names("Counter", "Changed");
        let global = session.clone().with_scope(Scope::Global);
        assert_ne!(session.region_object_name(), global.region_object_name());
        assert!(session.region_object_name().contains("Counter"));
        assert!(global.region_object_name().contains("Counter"));
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = SyncConfig::from_lookup(|key| match key {
            "WINCOUNT_REGION" => Some("AppCounter".to_string()),
            "WINCOUNT_SCOPE" => Some("Global".to_string()),
            "WINCOUNT_GRACE_MS" => Some("25".to_string()),
            "WINCOUNT_WAIT_MS" => Some("not a number".to_string()),
            _ => None,
        });
        assert_eq!(config.region_name, "AppCounter");
        assert_eq!(config.event_name, EVENT_NAME);
        assert_eq!(config.scope, Scope::Global);
        assert_eq!(config.reset_grace, Duration::from_millis(25));
        assert_eq!(config.wait_timeout, DEFAULT_WAIT_TIMEOUT);
    }

    #[test]
    fn test_from_lookup_empty_is_default() {
        assert_eq!(SyncConfig::from_lookup(|_| None), SyncConfig::default());
    }

    #[cfg(windows)]
    #[test]
    fn test_windows_prefixes() {
        let config = SyncConfig::with_names("Counter", "Changed");
        assert_eq!(config.region_object_name(), "Local\\Counter");
        let config = config.with_scope(Scope::Global);
        assert_eq!(config.event_object_name(), "Global\\Changed");
    }

    #[cfg(unix)]
    #[test]
    fn test_unix_names_are_sanitized() {
        let config = SyncConfig::with_names("my/counter name", "Changed").with_scope(Scope::Global);
        assert_eq!(config.region_object_name(), "/my_counter_name");
        let session = SyncConfig::with_names("Counter", "Changed");
        let name = session.region_object_name();
        assert!(name.starts_with("/Counter."));
        assert_eq!(name.matches('/').count(), 1);
    }
}
