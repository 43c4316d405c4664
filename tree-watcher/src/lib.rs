//! # Tree Watcher
//!
//! Recursive directory-tree change watching for the canopy reload system.
//! Given a root directory, it watches that directory and every subdirectory
//! (including ones created after watching starts) and invokes a
//! caller-supplied handler once per qualifying change.
//!
//! ## Features
//!
//! - **Recursive Registration**: every subdirectory gets its own watch
//! - **Live Extension**: directories created while watching are picked up
//! - **Overflow Signalling**: dropped-event-detail notices are surfaced
//!   separately, never as ordinary changes
//! - **Cooperative Cancellation**: a cancellation token ends the session
//!   cleanly and releases every watch
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Tree Watcher                              │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  registrar ──► WatchRegistry ──► dispatch loop                  │
//! │      │              │                 │                         │
//! │      ▼              ▼                 ▼                         │
//! │  WatchHandle    handle↔path      ChangeHandler                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The registrar walks the tree and registers each directory; the dispatch
//! loop owns the registry, resolves backend notifications against it, and
//! extends it when new subdirectories appear.

pub mod config;
pub mod error;
pub mod event;
pub mod registry;
pub mod watcher;

mod registrar;

pub use config::{EventFilter, RegistrationPolicy, WatchConfig};
pub use error::{Result, WatcherError};
pub use event::{ChangeEvent, ChangeKind};
pub use registry::{WatchHandle, WatchRegistry};
pub use watcher::{ChangeHandler, TreeWatcher, WatchSummary, watch};
