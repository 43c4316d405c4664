//! Configuration for a watch session.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::event::ChangeKind;

/// Configuration for watching a directory tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Whether subdirectories created after the watch starts are registered
    /// and watched as well.
    pub follow_new_directories: bool,

    /// Which change kinds are dispatched to the handler.
    pub kinds: EventFilter,

    /// Optional upper bound on a single blocking wait.
    ///
    /// When set, the dispatch loop wakes up at this interval even with no
    /// pending events (a no-op iteration). Unset by default.
    pub poll_timeout: Option<Duration>,

    /// How registration failures below the root are handled.
    pub registration_policy: RegistrationPolicy,
}

impl WatchConfig {
    /// Create a config with the default settings.
    pub fn new() -> Self {
        Self {
            follow_new_directories: true,
            kinds: EventFilter::all(),
            poll_timeout: None,
            registration_policy: RegistrationPolicy::SkipSubtree,
        }
    }

    /// Disable registration of subdirectories created after start.
    pub fn ignore_new_directories(mut self) -> Self {
        self.follow_new_directories = false;
        self
    }

    /// Restrict dispatch to the given change kinds.
    pub fn with_kinds(mut self, kinds: EventFilter) -> Self {
        self.kinds = kinds;
        self
    }

    /// Set a periodic wake-up interval for the blocking wait.
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = Some(timeout);
        self
    }

    /// Set the registration failure policy.
    pub fn with_registration_policy(mut self, policy: RegistrationPolicy) -> Self {
        self.registration_policy = policy;
        self
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Which change kinds a watch session dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFilter {
    /// Dispatch creation events.
    pub created: bool,

    /// Dispatch modification events.
    pub modified: bool,

    /// Dispatch deletion events.
    pub deleted: bool,
}

impl EventFilter {
    /// Admit all three change kinds.
    pub fn all() -> Self {
        Self {
            created: true,
            modified: true,
            deleted: true,
        }
    }

    /// Admit only creation events.
    pub fn created_only() -> Self {
        Self {
            created: true,
            modified: false,
            deleted: false,
        }
    }

    /// Whether `kind` passes this filter.
    pub fn allows(self, kind: ChangeKind) -> bool {
        match kind {
            ChangeKind::Created => self.created,
            ChangeKind::Modified => self.modified,
            ChangeKind::Deleted => self.deleted,
        }
    }
}

impl Default for EventFilter {
    fn default() -> Self {
        Self::all()
    }
}

/// How a failure to register one directory is handled.
///
/// One policy applies uniformly to the initial tree walk and to incremental
/// registration of directories created while watching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationPolicy {
    /// Leave the offending subtree unwatched and keep going. Directories
    /// registered before the failure stay registered.
    SkipSubtree,

    /// Fail the whole registration atomically, releasing every watch the
    /// call had already added.
    Abort,
}

impl Default for RegistrationPolicy {
    fn default() -> Self {
        Self::SkipSubtree
    }
}
