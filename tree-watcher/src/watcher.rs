//! Tree watcher and its event dispatch loop.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use notify::{RecommendedWatcher, Watcher};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::{RegistrationPolicy, WatchConfig};
use crate::error::{Result, WatcherError};
use crate::event::{self, ChangeEvent, ChangeKind};
use crate::registrar;
use crate::registry::WatchRegistry;

/// Capacity of the channel between the watch backend and the dispatch loop.
/// Notifications beyond it are dropped and surfaced as an overflow notice;
/// the backend thread must never block here, because the loop sends watch
/// commands back to it mid-drain and would deadlock against it.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Receives the notifications produced by a watch session.
///
/// Both methods run synchronously on the dispatch loop; a handler that
/// blocks indefinitely stalls delivery of every subsequent event.
pub trait ChangeHandler {
    /// Called exactly once per dispatched change, in the order the OS
    /// reported the changes for each directory.
    fn on_change(&mut self, event: &ChangeEvent);

    /// Called when the watch backend dropped event detail for queue
    /// pressure. `directory` is the affected registered directory when the
    /// backend attributes one. Overflow never reaches [`on_change`]; callers
    /// that need full fidelity should re-scan the subtree. Defaults to a
    /// no-op.
    ///
    /// [`on_change`]: ChangeHandler::on_change
    fn on_overflow(&mut self, directory: Option<&Path>) {
        let _ = directory;
    }
}

impl<F> ChangeHandler for F
where
    F: FnMut(&ChangeEvent),
{
    fn on_change(&mut self, event: &ChangeEvent) {
        self(event)
    }
}

/// Counters for one completed watch session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchSummary {
    /// Changes dispatched to the handler.
    pub events_dispatched: u64,

    /// Overflow notifications delivered.
    pub overflows: u64,

    /// Directories registered over the session, initial walk included.
    pub directories_registered: u64,

    /// Notifications skipped because no registered directory matched.
    pub stale_skipped: u64,
}

/// Watches a directory tree and dispatches change events.
pub struct TreeWatcher {
    config: WatchConfig,
}

impl TreeWatcher {
    /// Create a watcher with the given configuration.
    pub fn new(config: WatchConfig) -> Self {
        Self { config }
    }

    /// Watch the tree rooted at `root`, dispatching each change to
    /// `handler`, until `cancel` is triggered or a fatal error occurs.
    ///
    /// Registers `root` and every current subdirectory up front, then runs
    /// the dispatch loop on the calling task. Directories created while
    /// watching are registered before their events are drained further, so
    /// a create-then-populate burst inside a new subdirectory is not missed.
    /// All watches are released before the call returns, on cancellation and
    /// failure alike.
    pub async fn watch<H: ChangeHandler>(
        &self,
        root: &Path,
        mut handler: H,
        cancel: CancellationToken,
    ) -> Result<WatchSummary> {
        let (tx, mut rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let queue_overflow = Arc::new(AtomicBool::new(false));
        let overflow_flag = Arc::clone(&queue_overflow);
        let mut watcher =
            notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
                forward_notification(&tx, &overflow_flag, res);
            })?;

        let mut registry = WatchRegistry::new();
        let handles = registrar::register_tree(
            &mut watcher,
            &mut registry,
            root,
            self.config.registration_policy,
            &cancel,
        )?;
        info!(
            "watching {} directories under {}",
            registry.len(),
            root.display()
        );

        let mut summary = WatchSummary {
            directories_registered: handles.len() as u64,
            ..WatchSummary::default()
        };

        let result = self
            .dispatch(
                &mut watcher,
                &mut registry,
                &mut rx,
                &mut handler,
                &cancel,
                &mut summary,
                &queue_overflow,
            )
            .await;

        release_all(&mut watcher, &mut registry);
        debug!("watch session for {} ended: {summary:?}", root.display());

        result.map(|()| summary)
    }

    /// The event dispatch loop. Exits cleanly on cancellation; fails with
    /// [`WatcherError::Dispatch`] when the wait mechanism itself dies.
    #[allow(clippy::too_many_arguments)]
    async fn dispatch<H: ChangeHandler>(
        &self,
        watcher: &mut RecommendedWatcher,
        registry: &mut WatchRegistry,
        rx: &mut mpsc::Receiver<notify::Result<notify::Event>>,
        handler: &mut H,
        cancel: &CancellationToken,
        summary: &mut WatchSummary,
        queue_overflow: &AtomicBool,
    ) -> Result<()> {
        loop {
            if queue_overflow.swap(false, Ordering::Relaxed) {
                summary.overflows += 1;
                handler.on_overflow(None);
            }

            let wait = tokio::select! {
                () = cancel.cancelled() => break,
                wait = next_notification(rx, self.config.poll_timeout) => wait,
            };

            match wait {
                Wait::Idle => continue,
                Wait::Closed => {
                    return Err(WatcherError::Dispatch(
                        "event channel closed by watch backend".to_string(),
                    ));
                }
                // A backend error concerns a single path, typically one
                // that lost a race with deletion; it does not end the loop.
                Wait::Notification(Err(err)) => {
                    warn!("watch backend error: {err}");
                }
                Wait::Notification(Ok(event)) => {
                    self.process(watcher, registry, handler, cancel, summary, event)?;
                }
            }
        }

        Ok(())
    }

    /// Route one backend event: overflow to `on_overflow`, everything else
    /// through registry resolution, incremental registration, and the
    /// change filter to `on_change`.
    fn process<H: ChangeHandler>(
        &self,
        watcher: &mut RecommendedWatcher,
        registry: &mut WatchRegistry,
        handler: &mut H,
        cancel: &CancellationToken,
        summary: &mut WatchSummary,
        event: notify::Event,
    ) -> Result<()> {
        if event::is_overflow(&event) {
            summary.overflows += 1;
            // The attributed path is itself the registered directory when
            // present; fall back to parent resolution for backends that
            // report an entry inside it.
            let directory = event.paths.first().and_then(|path| {
                if registry.contains(path) {
                    Some(path.clone())
                } else {
                    resolve(registry, path).map(|(directory, _)| directory)
                }
            });
            handler.on_overflow(directory.as_deref());
            return Ok(());
        }

        let Some(kind) = ChangeKind::from_notify(event.kind) else {
            return Ok(());
        };

        for path in &event.paths {
            let Some((directory, name)) = resolve(registry, path) else {
                trace!("no registered directory for {}, skipping", path.display());
                summary.stale_skipped += 1;
                continue;
            };

            // Extend the registry before draining anything else so events
            // inside the new subtree resolve once they arrive.
            if kind == ChangeKind::Created
                && self.config.follow_new_directories
                && path.is_dir()
                && !registry.contains(path)
            {
                match registrar::register_tree(
                    watcher,
                    registry,
                    path,
                    self.config.registration_policy,
                    cancel,
                ) {
                    Ok(handles) => summary.directories_registered += handles.len() as u64,
                    Err(err) if self.config.registration_policy == RegistrationPolicy::Abort => {
                        return Err(err);
                    }
                    // The directory may already be gone again.
                    Err(err) => warn!("could not register {}: {err}", path.display()),
                }
            }

            if kind == ChangeKind::Deleted && registry.remove(path).is_some() {
                // The backend usually drops the watch on its own; this is
                // only a cleanup for backends that do not.
                if let Err(err) = watcher.unwatch(path) {
                    trace!("unwatch after deletion failed for {}: {err}", path.display());
                }
                debug!("released watch for deleted {}", path.display());
            }

            if !self.config.kinds.allows(kind) {
                continue;
            }

            let change = ChangeEvent::new(kind, directory, name);
            handler.on_change(&change);
            summary.events_dispatched += 1;
        }

        Ok(())
    }
}

impl Default for TreeWatcher {
    fn default() -> Self {
        Self::new(WatchConfig::default())
    }
}

/// Watch `root` with the default configuration.
///
/// Convenience over [`TreeWatcher::watch`]; blocks until `cancel` is
/// triggered or a fatal error occurs.
pub async fn watch<H: ChangeHandler>(
    root: &Path,
    handler: H,
    cancel: CancellationToken,
) -> Result<WatchSummary> {
    TreeWatcher::default().watch(root, handler, cancel).await
}

/// Forward one backend notification to the dispatch loop without blocking.
///
/// The dispatch loop sends watch commands that the backend thread must
/// service, so this path cannot wait for channel capacity. A full queue
/// drops the notification and records it as an overflow for the loop to
/// surface.
fn forward_notification(
    tx: &mpsc::Sender<notify::Result<notify::Event>>,
    queue_overflow: &AtomicBool,
    res: notify::Result<notify::Event>,
) {
    match tx.try_send(res) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => queue_overflow.store(true, Ordering::Relaxed),
        // The session is shutting down; the notification has nowhere to go.
        Err(TrySendError::Closed(_)) => {}
    }
}

/// Outcome of one blocking wait.
enum Wait {
    /// The backend delivered a notification.
    Notification(notify::Result<notify::Event>),
    /// The poll timeout elapsed with nothing pending.
    Idle,
    /// The backend hung up; the wait mechanism is gone.
    Closed,
}

async fn next_notification(
    rx: &mut mpsc::Receiver<notify::Result<notify::Event>>,
    poll_timeout: Option<Duration>,
) -> Wait {
    match poll_timeout {
        Some(limit) => match tokio::time::timeout(limit, rx.recv()).await {
            Ok(Some(res)) => Wait::Notification(res),
            Ok(None) => Wait::Closed,
            Err(_) => Wait::Idle,
        },
        None => match rx.recv().await {
            Some(res) => Wait::Notification(res),
            None => Wait::Closed,
        },
    }
}

/// Resolve an event path to the registered directory it belongs to.
///
/// The path's parent wins when registered (an entry changed inside it);
/// otherwise the path itself matches when it is a registered directory (an
/// event on the directory's own watch, reported with no entry name). A miss
/// on both is a stale notification.
fn resolve(registry: &WatchRegistry, path: &Path) -> Option<(PathBuf, Option<String>)> {
    if let Some(parent) = path.parent()
        && registry.contains(parent)
    {
        let name = path.file_name().map(|n| n.to_string_lossy().into_owned());
        return Some((parent.to_path_buf(), name));
    }

    if registry.contains(path) {
        return Some((path.to_path_buf(), None));
    }

    None
}

/// Release every live watch. Called on every session exit path.
fn release_all(watcher: &mut RecommendedWatcher, registry: &mut WatchRegistry) {
    let directories: Vec<PathBuf> = registry.directories().map(Path::to_path_buf).collect();
    for directory in directories {
        if let Err(err) = watcher.unwatch(&directory) {
            trace!("unwatch failed for {}: {err}", directory.display());
        }
        registry.remove(&directory);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EventFilter;
    use notify::event::{CreateKind, Flag, ModifyKind, RemoveKind};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recording {
        changes: Vec<ChangeEvent>,
        overflows: Vec<Option<PathBuf>>,
    }

    impl ChangeHandler for Recording {
        fn on_change(&mut self, event: &ChangeEvent) {
            self.changes.push(event.clone());
        }

        fn on_overflow(&mut self, directory: Option<&Path>) {
            self.overflows.push(directory.map(Path::to_path_buf));
        }
    }

    struct Fixture {
        tree: TreeWatcher,
        watcher: RecommendedWatcher,
        registry: WatchRegistry,
        cancel: CancellationToken,
        summary: WatchSummary,
        handler: Recording,
    }

    impl Fixture {
        fn new(config: WatchConfig) -> Self {
            Self {
                tree: TreeWatcher::new(config),
                watcher: notify::recommended_watcher(|_res| {}).unwrap(),
                registry: WatchRegistry::new(),
                cancel: CancellationToken::new(),
                summary: WatchSummary::default(),
                handler: Recording::default(),
            }
        }

        fn process(&mut self, event: notify::Event) {
            self.tree
                .process(
                    &mut self.watcher,
                    &mut self.registry,
                    &mut self.handler,
                    &self.cancel,
                    &mut self.summary,
                    event,
                )
                .unwrap();
        }
    }

    #[test]
    fn test_change_in_registered_directory_is_dispatched() {
        let mut fx = Fixture::new(WatchConfig::default());
        fx.registry.register("/proj/src");

        let event = notify::Event::new(notify::EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("/proj/src/File.txt"));
        fx.process(event);

        assert_eq!(fx.handler.changes.len(), 1);
        let change = &fx.handler.changes[0];
        assert_eq!(change.kind, ChangeKind::Created);
        assert_eq!(change.directory, PathBuf::from("/proj/src"));
        assert_eq!(change.name.as_deref(), Some("File.txt"));
        assert_eq!(fx.summary.events_dispatched, 1);
    }

    #[test]
    fn test_overflow_never_reaches_on_change() {
        let mut fx = Fixture::new(WatchConfig::default());
        fx.registry.register("/proj/src");

        let overflow = notify::Event::new(notify::EventKind::Other).set_flag(Flag::Rescan);
        fx.process(overflow);

        assert!(fx.handler.changes.is_empty());
        assert_eq!(fx.handler.overflows.len(), 1);
        assert_eq!(fx.summary.overflows, 1);
        assert_eq!(fx.summary.events_dispatched, 0);
    }

    #[test]
    fn test_overflow_carries_directory_when_attributed() {
        let mut fx = Fixture::new(WatchConfig::default());
        fx.registry.register("/proj/src");

        let overflow = notify::Event::new(notify::EventKind::Other)
            .add_path(PathBuf::from("/proj/src"))
            .set_flag(Flag::Rescan);
        fx.process(overflow);

        assert_eq!(
            fx.handler.overflows,
            vec![Some(PathBuf::from("/proj/src"))]
        );
    }

    #[test]
    fn test_overflow_attribution_prefers_the_named_directory() {
        let mut fx = Fixture::new(WatchConfig::default());
        fx.registry.register("/proj/src");
        fx.registry.register("/proj/src/a");

        // Both the directory and its parent are registered; the notice must
        // name the directory the backend attributed, not its parent.
        let overflow = notify::Event::new(notify::EventKind::Other)
            .add_path(PathBuf::from("/proj/src/a"))
            .set_flag(Flag::Rescan);
        fx.process(overflow);

        assert_eq!(
            fx.handler.overflows,
            vec![Some(PathBuf::from("/proj/src/a"))]
        );
    }

    #[test]
    fn test_full_queue_records_overflow_instead_of_blocking() {
        let (tx, mut rx) = mpsc::channel(1);
        let queue_overflow = AtomicBool::new(false);

        forward_notification(
            &tx,
            &queue_overflow,
            Ok(notify::Event::new(notify::EventKind::Any)),
        );
        assert!(!queue_overflow.load(Ordering::Relaxed));

        // Queue full: the call must return immediately and record the loss
        // instead of waiting for the consumer.
        forward_notification(
            &tx,
            &queue_overflow,
            Ok(notify::Event::new(notify::EventKind::Any)),
        );
        assert!(queue_overflow.load(Ordering::Relaxed));

        // The first notification is still queued; only the second was shed.
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_shed_notifications_surface_as_overflow() {
        let mut fx = Fixture::new(WatchConfig::default());
        let (_tx, mut rx) = mpsc::channel::<notify::Result<notify::Event>>(1);
        let queue_overflow = AtomicBool::new(true);
        fx.cancel.cancel();

        fx.tree
            .dispatch(
                &mut fx.watcher,
                &mut fx.registry,
                &mut rx,
                &mut fx.handler,
                &fx.cancel,
                &mut fx.summary,
                &queue_overflow,
            )
            .await
            .unwrap();

        assert_eq!(fx.summary.overflows, 1);
        assert_eq!(fx.handler.overflows, vec![None]);
        assert!(fx.handler.changes.is_empty());
        assert!(!queue_overflow.load(Ordering::Relaxed));
    }

    #[test]
    fn test_stale_notification_is_skipped() {
        let mut fx = Fixture::new(WatchConfig::default());
        fx.registry.register("/proj/src");

        let event = notify::Event::new(notify::EventKind::Remove(RemoveKind::File))
            .add_path(PathBuf::from("/elsewhere/File.txt"));
        fx.process(event);

        assert!(fx.handler.changes.is_empty());
        assert_eq!(fx.summary.stale_skipped, 1);
    }

    #[test]
    fn test_filter_excludes_kinds() {
        let mut fx = Fixture::new(WatchConfig::new().with_kinds(EventFilter::created_only()));
        fx.registry.register("/proj/src");

        let event = notify::Event::new(notify::EventKind::Modify(ModifyKind::Data(
            notify::event::DataChange::Content,
        )))
        .add_path(PathBuf::from("/proj/src/File.txt"));
        fx.process(event);

        assert!(fx.handler.changes.is_empty());
        assert_eq!(fx.summary.events_dispatched, 0);
    }

    #[test]
    fn test_deletion_of_registered_directory_releases_entry() {
        let mut fx = Fixture::new(WatchConfig::default());
        fx.registry.register("/proj/src");
        fx.registry.register("/proj/src/a");

        let event = notify::Event::new(notify::EventKind::Remove(RemoveKind::Folder))
            .add_path(PathBuf::from("/proj/src/a"));
        fx.process(event);

        assert_eq!(fx.handler.changes.len(), 1);
        assert_eq!(fx.handler.changes[0].kind, ChangeKind::Deleted);
        assert!(!fx.registry.contains(Path::new("/proj/src/a")));

        // A spurious follow-up for the same directory resolves against the
        // still-registered parent and must not panic the loop.
        let spurious = notify::Event::new(notify::EventKind::Remove(RemoveKind::Folder))
            .add_path(PathBuf::from("/proj/src/a"));
        fx.process(spurious);
    }

    #[test]
    fn test_created_directory_is_registered_before_dispatch() {
        let temp = TempDir::new().unwrap();
        let sub = temp.path().join("b");
        std::fs::create_dir(&sub).unwrap();

        let mut fx = Fixture::new(WatchConfig::default());
        fx.registry.register(temp.path());

        let event = notify::Event::new(notify::EventKind::Create(CreateKind::Folder))
            .add_path(sub.clone());
        fx.process(event);

        // The new directory is in the registry and its creation was
        // dispatched as a change of the parent.
        assert!(fx.registry.contains(&sub));
        assert_eq!(fx.summary.directories_registered, 1);
        assert_eq!(fx.handler.changes.len(), 1);
        assert_eq!(fx.handler.changes[0].directory, temp.path());
    }

    #[test]
    fn test_new_directories_ignored_when_configured_off() {
        let temp = TempDir::new().unwrap();
        let sub = temp.path().join("b");
        std::fs::create_dir(&sub).unwrap();

        let mut fx = Fixture::new(WatchConfig::new().ignore_new_directories());
        fx.registry.register(temp.path());

        let event = notify::Event::new(notify::EventKind::Create(CreateKind::Folder))
            .add_path(sub.clone());
        fx.process(event);

        assert!(!fx.registry.contains(&sub));
        // The creation event itself is still dispatched.
        assert_eq!(fx.handler.changes.len(), 1);
    }
}
