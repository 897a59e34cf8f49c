use assetgraph_core::{AssetId, AssetRecord, ContentReference, LinkType, ReferenceKey};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

bitflags! {
    /// Which directions a dependency query follows, and whether it recurses.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SearchOptions: u32 {
        const IN = 0b001;
        const OUT = 0b010;
        const RECURSIVE = 0b100;
    }
}

impl SearchOptions {
    pub const ALL: SearchOptions = SearchOptions::all();
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct InheritanceSearchOptions: u32 {
        const BASE = 0b01;
        const COMPOSITION = 0b10;
    }
}

impl InheritanceSearchOptions {
    pub const ALL: InheritanceSearchOptions = InheritanceSearchOptions::all();

    pub fn link_mask(self) -> LinkType {
        let mut mask = LinkType::empty();
        if self.contains(InheritanceSearchOptions::BASE) {
            mask |= LinkType::INHERITANCE;
        }
        if self.contains(InheritanceSearchOptions::COMPOSITION) {
            mask |= LinkType::COMPOSITION_INHERITANCE;
        }
        mask
    }
}

/// A resolved link to another asset.
#[derive(Debug, Clone)]
pub struct AssetLink {
    pub record: AssetRecord,
    pub link_type: LinkType,
}

impl AssetLink {
    pub fn id(&self) -> AssetId {
        self.record.id
    }
}

/// An outgoing reference whose target is not currently tracked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokenLink {
    pub target: ContentReference,
    pub link_type: LinkType,
}

/// Non-fatal resolution outcome surfaced to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionWarning {
    /// The reference had no id and was resolved by its location.
    ResolvedByLocation {
        referrer: AssetId,
        location: String,
        resolved: AssetId,
    },
    /// Id and location designate different assets; the id was kept.
    AmbiguousResolution {
        referrer: AssetId,
        reference: ContentReference,
        by_id: Option<AssetId>,
        by_location: AssetId,
    },
    /// The reference carried neither id nor location and was skipped.
    EmptyReference { referrer: AssetId, member_path: String },
}

/// Per-asset node owned by the dependency graph. Links only store ids; records are
/// materialized when a [`DependencySet`] is handed out.
#[derive(Debug, Clone)]
pub(crate) struct DependencyNode {
    pub record: AssetRecord,
    pub links_in: BTreeMap<AssetId, LinkType>,
    pub links_out: BTreeMap<AssetId, LinkType>,
    pub broken_out: BTreeMap<ReferenceKey, BrokenLink>,
    pub parts: BTreeSet<AssetId>,
    pub warnings: Vec<ResolutionWarning>,
}

impl DependencyNode {
    pub fn new(record: AssetRecord) -> Self {
        Self {
            record,
            links_in: BTreeMap::new(),
            links_out: BTreeMap::new(),
            broken_out: BTreeMap::new(),
            parts: BTreeSet::new(),
            warnings: Vec::new(),
        }
    }

    pub fn id(&self) -> AssetId {
        self.record.id
    }

    pub fn has_missing_dependencies(&self) -> bool {
        !self.broken_out.is_empty()
    }
}

/// Detached copy of the dependencies of one asset.
///
/// Nothing in a set aliases graph state; callers may keep or mutate it freely.
#[derive(Debug, Clone)]
pub struct DependencySet {
    pub record: AssetRecord,
    pub links_in: BTreeMap<AssetId, AssetLink>,
    pub links_out: BTreeMap<AssetId, AssetLink>,
    pub broken_links_out: BTreeMap<ReferenceKey, BrokenLink>,
    pub parts: BTreeSet<AssetId>,
    pub warnings: Vec<ResolutionWarning>,
}

impl DependencySet {
    pub fn new(record: AssetRecord) -> Self {
        Self {
            record,
            links_in: BTreeMap::new(),
            links_out: BTreeMap::new(),
            broken_links_out: BTreeMap::new(),
            parts: BTreeSet::new(),
            warnings: Vec::new(),
        }
    }

    pub fn id(&self) -> AssetId {
        self.record.id
    }

    /// Adds or merges a parent link.
    pub fn add_link_in(&mut self, record: AssetRecord, link_type: LinkType) {
        merge_link(&mut self.links_in, record, link_type);
    }

    /// Adds or merges a child link.
    pub fn add_link_out(&mut self, record: AssetRecord, link_type: LinkType) {
        merge_link(&mut self.links_out, record, link_type);
    }

    pub fn add_broken_link_out(&mut self, key: ReferenceKey, link: BrokenLink) {
        self.broken_links_out
            .entry(key)
            .and_modify(|existing| existing.link_type |= link.link_type)
            .or_insert(link);
    }

    pub fn has_missing_dependencies(&self) -> bool {
        !self.broken_links_out.is_empty()
    }

    pub fn in_ids(&self) -> Vec<AssetId> {
        self.links_in.keys().copied().collect()
    }

    pub fn out_ids(&self) -> Vec<AssetId> {
        self.links_out.keys().copied().collect()
    }

    pub fn broken_targets(&self) -> Vec<ContentReference> {
        self.broken_links_out
            .values()
            .map(|link| link.target.clone())
            .collect()
    }
}

fn merge_link(links: &mut BTreeMap<AssetId, AssetLink>, record: AssetRecord, link_type: LinkType) {
    links
        .entry(record.id)
        .and_modify(|existing| existing.link_type |= link_type)
        .or_insert(AssetLink { record, link_type });
}
