use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use crate::hash::ContentHash;
use crate::traits::AssetContent;

pub type AssetId = Uuid;
pub type PackageId = Uuid;

/// A reference to another asset, by id, by location, or both.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentReference {
    pub id: Option<AssetId>,
    pub location: Option<String>,
}

impl ContentReference {
    pub fn new(id: AssetId, location: impl Into<String>) -> Self {
        Self {
            id: Some(id),
            location: Some(location.into()),
        }
    }

    pub fn by_id(id: AssetId) -> Self {
        Self {
            id: Some(id),
            location: None,
        }
    }

    pub fn by_location(location: impl Into<String>) -> Self {
        Self {
            id: None,
            location: Some(location.into()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.id.is_none() && self.location.as_deref().map_or(true, str::is_empty)
    }

    /// Key used to index the reference while it is unresolved. The id wins when both are set.
    pub fn key(&self) -> Option<ReferenceKey> {
        match (&self.id, &self.location) {
            (Some(id), _) => Some(ReferenceKey::Id(*id)),
            (None, Some(location)) if !location.is_empty() => {
                Some(ReferenceKey::Location(location.clone()))
            }
            _ => None,
        }
    }
}

impl fmt::Display for ContentReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.id, &self.location) {
            (Some(id), Some(location)) => write!(f, "{}:{}", id, location),
            (Some(id), None) => write!(f, "{}", id),
            (None, Some(location)) => write!(f, "{}", location),
            (None, None) => write!(f, "<empty>"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ReferenceKey {
    Id(AssetId),
    Location(String),
}

bitflags! {
    /// Kind of link between two assets. Several kinds can apply to the same pair.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
    pub struct LinkType: u32 {
        const REFERENCE = 0b001;
        const INHERITANCE = 0b010;
        const COMPOSITION_INHERITANCE = 0b100;
    }
}

impl Default for LinkType {
    fn default() -> Self {
        LinkType::REFERENCE
    }
}

bitflags! {
    /// How a build depends on another asset.
    ///
    /// `RUNTIME` only needs the dependency to be loadable at runtime and imposes no build order.
    /// `COMPILE_ASSET` needs the dependency's compiled output before building.
    /// `COMPILE_CONTENT` reads the dependency's raw content as a build input.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
    pub struct BuildDependencyType: u32 {
        const RUNTIME = 0b001;
        const COMPILE_ASSET = 0b010;
        const COMPILE_CONTENT = 0b100;
    }
}

/// A raw reference produced by walking an asset's content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedReference {
    /// Member path inside the content object graph, e.g. `materials[2].texture`.
    pub member_path: String,
    pub target: ContentReference,
    pub link_type: LinkType,
}

impl ExtractedReference {
    pub fn new(
        member_path: impl Into<String>,
        target: ContentReference,
        link_type: LinkType,
    ) -> Self {
        Self {
            member_path: member_path.into(),
            target,
            link_type,
        }
    }
}

/// An on-disk file an asset was imported from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFileMember {
    pub path: PathBuf,
    /// Whether a content change should trigger re-processing of the owning asset.
    pub notify_on_change: bool,
    /// Hash stored on the asset when it was last imported.
    pub recorded_hash: Option<ContentHash>,
}

impl SourceFileMember {
    pub fn new(path: impl Into<PathBuf>, notify_on_change: bool) -> Self {
        Self {
            path: path.into(),
            notify_on_change,
            recorded_hash: None,
        }
    }

    pub fn with_recorded_hash(mut self, hash: ContentHash) -> Self {
        self.recorded_hash = Some(hash);
        self
    }
}

/// An asset as seen by the engine: identity plus an immutable content snapshot.
///
/// Cloning a record never deep-copies the content; the `Arc` makes the snapshot shared and
/// read-only, so a record held by a graph node cannot be mutated by the session.
#[derive(Debug, Clone)]
pub struct AssetRecord {
    pub id: AssetId,
    pub location: String,
    pub file_path: Option<PathBuf>,
    pub package: PackageId,
    pub content: Arc<dyn AssetContent>,
    pub is_dirty: bool,
}

impl AssetRecord {
    pub fn new(
        id: AssetId,
        location: impl Into<String>,
        package: PackageId,
        content: Arc<dyn AssetContent>,
    ) -> Self {
        Self {
            id,
            location: location.into(),
            file_path: None,
            package,
            content,
            is_dirty: false,
        }
    }

    pub fn with_file_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.file_path = Some(path.into());
        self
    }

    pub fn type_name(&self) -> &str {
        self.content.type_name()
    }

    pub fn reference(&self) -> ContentReference {
        ContentReference::new(self.id, self.location.clone())
    }
}
