use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::{AssetId, ContentHash, PackageId};

/// Raw filesystem change as reported by the watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileEventKind {
    Created,
    Deleted,
    Changed,
}

/// A filesystem notification forwarded from the watcher to the change loop.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RawFileEvent {
    pub path: PathBuf,
    pub kind: FileEventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssetFileChangeKind {
    /// An asset file appeared under a package root.
    Added,
    /// An asset file under a package root was removed.
    Deleted,
    /// An asset file under a package root was rewritten.
    Updated,
    /// A source file an asset was imported from has new content.
    SourceUpdated,
    /// A source file an asset was imported from is gone.
    SourceDeleted,
}

impl AssetFileChangeKind {
    pub fn from_source_hash(hash: &ContentHash) -> Self {
        if hash.is_empty() {
            AssetFileChangeKind::SourceDeleted
        } else {
            AssetFileChangeKind::SourceUpdated
        }
    }

    pub fn from_file_event(kind: FileEventKind) -> Self {
        match kind {
            FileEventKind::Created => AssetFileChangeKind::Added,
            FileEventKind::Deleted => AssetFileChangeKind::Deleted,
            FileEventKind::Changed => AssetFileChangeKind::Updated,
        }
    }

    pub fn is_source(self) -> bool {
        matches!(
            self,
            AssetFileChangeKind::SourceUpdated | AssetFileChangeKind::SourceDeleted
        )
    }
}

/// A detected change of an asset file or of a source file, reported against its asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetFileChangedEvent {
    /// Asset the change belongs to. `None` for an asset file that no asset of the package
    /// is known under, e.g. a file dropped into the package directory.
    pub asset_id: Option<AssetId>,
    pub package: PackageId,
    pub location: String,
    pub path: PathBuf,
    pub kind: AssetFileChangeKind,
    /// New hash of a source file; empty when the file is gone. Consumers compare it with the
    /// asset's recorded hash to skip changes they already handled. Always `None` for asset
    /// file events.
    pub hash: Option<ContentHash>,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum SquashKey {
    Asset(AssetId, bool),
    Location(PackageId, String),
}

impl AssetFileChangedEvent {
    fn squash_key(&self) -> SquashKey {
        match self.asset_id {
            Some(id) => SquashKey::Asset(id, self.kind.is_source()),
            None => SquashKey::Location(self.package, self.location.clone()),
        }
    }
}

/// Collapses events to one per asset and event family, in order of first occurrence.
///
/// Source events and asset file events of the same asset are kept apart. Within a family
/// the last event wins, so repeated updates keep the newest hash and update-then-delete
/// becomes a delete. Two asset file transitions merge instead: added-then-updated stays
/// added and deleted-then-added becomes updated.
pub fn squash_events(events: Vec<AssetFileChangedEvent>) -> Vec<AssetFileChangedEvent> {
    let mut slots: HashMap<SquashKey, usize> = HashMap::with_capacity(events.len());
    let mut squashed: Vec<AssetFileChangedEvent> = Vec::with_capacity(events.len());
    for mut event in events {
        match slots.get(&event.squash_key()) {
            Some(&index) => {
                let previous = squashed[index].kind;
                event.kind = match (previous, event.kind) {
                    (AssetFileChangeKind::Added, AssetFileChangeKind::Updated) => {
                        AssetFileChangeKind::Added
                    }
                    (AssetFileChangeKind::Deleted, AssetFileChangeKind::Added) => {
                        AssetFileChangeKind::Updated
                    }
                    (_, kind) => kind,
                };
                squashed[index] = event;
            }
            None => {
                slots.insert(event.squash_key(), squashed.len());
                squashed.push(event);
            }
        }
    }
    squashed
}
