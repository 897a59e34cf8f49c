use crossbeam_channel::{Sender, TrySendError};
use notify::event::{AccessKind, AccessMode, ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};

use super::events::{FileEventKind, RawFileEvent};
use crate::Result;

#[derive(Debug)]
struct WatchedDirectory {
    refs: usize,
    active: bool,
}

/// Watches the parent directory of every tracked file, one subscription per directory,
/// plus package root directories recursively.
///
/// Watching the directory rather than the file keeps delete/recreate sequences visible.
/// The notify callback only forwards events into a bounded channel and never blocks.
pub struct DirectoryWatcher {
    watcher: RecommendedWatcher,
    directories: HashMap<PathBuf, WatchedDirectory>,
    roots: HashMap<PathBuf, WatchedDirectory>,
}

impl DirectoryWatcher {
    pub fn new(events: Sender<RawFileEvent>) -> Result<Self> {
        let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                let Some(kind) = classify(&event.kind) else {
                    return;
                };
                for path in event.paths {
                    let raw = RawFileEvent {
                        path: normalize_path(&path),
                        kind,
                    };
                    match events.try_send(raw) {
                        Ok(()) => {}
                        Err(TrySendError::Full(raw)) => {
                            warn!("file event channel full, dropping event for {:?}", raw.path);
                        }
                        Err(TrySendError::Disconnected(_)) => return,
                    }
                }
            }
            Err(e) => error!("watcher error: {:?}", e),
        })?;
        Ok(Self {
            watcher,
            directories: HashMap::new(),
            roots: HashMap::new(),
        })
    }

    /// Starts watching `file`. Returns true when a new directory subscription was created.
    pub fn track(&mut self, file: &Path) -> bool {
        let Some(directory) = file.parent().map(Path::to_path_buf) else {
            return false;
        };
        subscribe(
            &mut self.watcher,
            &mut self.directories,
            directory,
            RecursiveMode::NonRecursive,
        )
    }

    /// Drops one reference; the directory subscription ends with the last one.
    pub fn untrack(&mut self, file: &Path) {
        let Some(directory) = file.parent() else {
            return;
        };
        unsubscribe(&mut self.watcher, &mut self.directories, directory);
    }

    /// Watches a package root and everything below it.
    pub fn track_root(&mut self, root: &Path) -> bool {
        subscribe(
            &mut self.watcher,
            &mut self.roots,
            root.to_path_buf(),
            RecursiveMode::Recursive,
        )
    }

    pub fn untrack_root(&mut self, root: &Path) {
        unsubscribe(&mut self.watcher, &mut self.roots, root);
    }

    pub fn watched_directories(&self) -> usize {
        self.directories.len()
    }

    pub fn watched_roots(&self) -> usize {
        self.roots.len()
    }
}

fn subscribe(
    watcher: &mut RecommendedWatcher,
    entries: &mut HashMap<PathBuf, WatchedDirectory>,
    directory: PathBuf,
    mode: RecursiveMode,
) -> bool {
    if let Some(entry) = entries.get_mut(&directory) {
        entry.refs += 1;
        return false;
    }
    let active = match watcher.watch(&directory, mode) {
        Ok(()) => {
            debug!("watching directory {:?} ({:?})", directory, mode);
            true
        }
        Err(e) => {
            warn!("cannot watch {:?}: {}", directory, e);
            false
        }
    };
    entries.insert(directory, WatchedDirectory { refs: 1, active });
    active
}

fn unsubscribe(
    watcher: &mut RecommendedWatcher,
    entries: &mut HashMap<PathBuf, WatchedDirectory>,
    directory: &Path,
) {
    let Some(entry) = entries.get_mut(directory) else {
        return;
    };
    entry.refs -= 1;
    if entry.refs > 0 {
        return;
    }
    let active = entry.active;
    entries.remove(directory);
    if active {
        if let Err(e) = watcher.unwatch(directory) {
            debug!("unwatch {:?} failed: {}", directory, e);
        }
    }
}

/// Maps a notify event to a file event; `None` for access noise.
fn classify(kind: &EventKind) -> Option<FileEventKind> {
    match kind {
        EventKind::Create(_) => Some(FileEventKind::Created),
        EventKind::Remove(_) => Some(FileEventKind::Deleted),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => Some(FileEventKind::Deleted),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => Some(FileEventKind::Created),
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => Some(FileEventKind::Changed),
        EventKind::Access(_) => None,
        _ => Some(FileEventKind::Changed),
    }
}

/// Resolves the parent directory so that watcher paths and tracked paths compare equal.
pub fn normalize_path(path: &Path) -> PathBuf {
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) if !parent.as_os_str().is_empty() => parent
            .canonicalize()
            .map(|dir| dir.join(name))
            .unwrap_or_else(|_| path.to_path_buf()),
        _ => path.to_path_buf(),
    }
}
