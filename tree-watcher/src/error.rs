//! Error types for the tree watcher.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for watcher operations.
pub type Result<T> = std::result::Result<T, WatcherError>;

/// Errors that can occur while registering or watching a directory tree.
#[derive(Error, Debug)]
pub enum WatcherError {
    /// Root directory not found.
    #[error("directory not found: {0}")]
    DirectoryNotFound(String),

    /// Root path exists but is not a directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// A directory could not be registered with the watch backend.
    ///
    /// Raised only under [`RegistrationPolicy::Abort`]; with the default
    /// skip policy the subtree is left unwatched instead.
    ///
    /// [`RegistrationPolicy::Abort`]: crate::config::RegistrationPolicy::Abort
    #[error("failed to register {path}: {source}")]
    Registration {
        /// The directory that could not be registered.
        path: PathBuf,
        /// The underlying registration failure.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The blocking wait for events failed; the dispatch loop cannot continue.
    #[error("event dispatch failed: {0}")]
    Dispatch(String),

    /// Notify error.
    #[error("notify error: {0}")]
    Notify(#[from] notify::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl WatcherError {
    /// Wrap a backend error as a registration failure for `path`.
    pub(crate) fn registration(
        path: impl Into<PathBuf>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Registration {
            path: path.into(),
            source: Box::new(source),
        }
    }
}
