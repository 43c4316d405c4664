//! Tree registrar: discovers directories and registers a watch for each.

use std::path::{Path, PathBuf};

use notify::{RecursiveMode, Watcher};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::RegistrationPolicy;
use crate::error::{Result, WatcherError};
use crate::registry::{WatchHandle, WatchRegistry};

/// Register `root` and every descendant directory with the watch backend,
/// merging the new handles into `registry`.
///
/// Each directory gets its own non-recursive watch; symlinks are never
/// followed. Traversal is iterative, so tree depth does not grow the call
/// stack, and the cancellation token is checked between entries.
///
/// Failures below the root follow `policy`: with
/// [`RegistrationPolicy::SkipSubtree`] the offending subtree is logged,
/// left unwatched, and not descended into, while the handles registered so
/// far are kept; with [`RegistrationPolicy::Abort`] every handle this call
/// added is released again and the call fails as a whole.
pub(crate) fn register_tree<W: Watcher>(
    watcher: &mut W,
    registry: &mut WatchRegistry,
    root: &Path,
    policy: RegistrationPolicy,
    cancel: &CancellationToken,
) -> Result<Vec<WatchHandle>> {
    if !root.exists() {
        return Err(WatcherError::DirectoryNotFound(root.display().to_string()));
    }
    if !root.is_dir() {
        return Err(WatcherError::NotADirectory(root.display().to_string()));
    }

    let mut added: Vec<(WatchHandle, PathBuf)> = Vec::new();

    let mut walk = WalkDir::new(root).follow_links(false).into_iter();
    while let Some(entry) = walk.next() {
        if cancel.is_cancelled() {
            break;
        }

        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                let path = err
                    .path()
                    .map_or_else(|| root.to_path_buf(), Path::to_path_buf);
                match policy {
                    RegistrationPolicy::SkipSubtree => {
                        warn!("skipping unreadable subtree {}: {err}", path.display());
                        continue;
                    }
                    RegistrationPolicy::Abort => {
                        unwind(watcher, registry, &added);
                        return Err(WatcherError::registration(path, err));
                    }
                }
            }
        };

        if !entry.file_type().is_dir() {
            continue;
        }

        let dir = entry.path();
        if registry.contains(dir) {
            continue;
        }

        match watcher.watch(dir, RecursiveMode::NonRecursive) {
            Ok(()) => {
                let handle = registry.register(dir);
                added.push((handle, dir.to_path_buf()));
                debug!("watching {}", dir.display());
            }
            // The directory can vanish between enumeration and registration;
            // the same policy applies as for an unreadable subtree.
            Err(err) => match policy {
                RegistrationPolicy::SkipSubtree => {
                    warn!(
                        "could not watch {}, leaving its subtree unwatched: {err}",
                        dir.display()
                    );
                    walk.skip_current_dir();
                }
                RegistrationPolicy::Abort => {
                    let dir = dir.to_path_buf();
                    unwind(watcher, registry, &added);
                    return Err(WatcherError::registration(dir, err));
                }
            },
        }
    }

    Ok(added.into_iter().map(|(handle, _)| handle).collect())
}

/// Release every watch added by a failed atomic registration.
fn unwind<W: Watcher>(
    watcher: &mut W,
    registry: &mut WatchRegistry,
    added: &[(WatchHandle, PathBuf)],
) {
    for (_, dir) in added {
        if let Err(err) = watcher.unwatch(dir) {
            debug!("unwatch during unwind failed for {}: {err}", dir.display());
        }
        registry.remove(dir);
    }
}
