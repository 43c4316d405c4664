//! Change events produced by the dispatch loop.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A change observed in a watched directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// The kind of change.
    pub kind: ChangeKind,

    /// The registered directory the change was reported against.
    pub directory: PathBuf,

    /// Name of the affected entry within `directory`.
    ///
    /// `None` when the change concerns the directory itself, e.g. the
    /// deletion event delivered on the directory's own watch. Stored as
    /// UTF-8 for serialization; a name that is not valid UTF-8 is recorded
    /// lossily, so [`path`] may not match the on-disk path for such entries.
    ///
    /// [`path`]: ChangeEvent::path
    pub name: Option<String>,

    /// When the event was dispatched.
    pub timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    /// Create a new change event stamped with the current time.
    pub fn new(kind: ChangeKind, directory: impl Into<PathBuf>, name: Option<String>) -> Self {
        Self {
            kind,
            directory: directory.into(),
            name,
            timestamp: Utc::now(),
        }
    }

    /// Full path of the affected entry.
    ///
    /// Reconstructed from [`name`], so it inherits that field's lossy
    /// handling of non-UTF-8 entry names.
    ///
    /// [`name`]: ChangeEvent::name
    pub fn path(&self) -> PathBuf {
        match &self.name {
            Some(name) => self.directory.join(name),
            None => self.directory.clone(),
        }
    }
}

/// Kind of change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// An entry was created.
    Created,

    /// An entry's contents or metadata changed.
    Modified,

    /// An entry was deleted.
    Deleted,
}

impl ChangeKind {
    /// Classify a backend event kind.
    ///
    /// Returns `None` for kinds outside the watched set (access
    /// notifications, unclassified events); those are never dispatched.
    pub fn from_notify(kind: notify::EventKind) -> Option<Self> {
        match kind {
            notify::EventKind::Create(_) => Some(Self::Created),
            notify::EventKind::Modify(modify_kind) => match modify_kind {
                // A rename is reported as Modify(Name); the entry either
                // appeared or disappeared under this directory.
                notify::event::ModifyKind::Name(rename) => match rename {
                    notify::event::RenameMode::From => Some(Self::Deleted),
                    notify::event::RenameMode::To => Some(Self::Created),
                    _ => Some(Self::Modified),
                },
                _ => Some(Self::Modified),
            },
            notify::EventKind::Remove(_) => Some(Self::Deleted),
            _ => None,
        }
    }
}

/// Whether a backend event signals queue overflow rather than a change.
///
/// Overflow means the backend dropped event detail; there is no affected
/// entry to report, so such events never reach the change callback.
pub(crate) fn is_overflow(event: &notify::Event) -> bool {
    event.need_rescan()
}
