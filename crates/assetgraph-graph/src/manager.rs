use assetgraph_core::{
    AssetGraphError, AssetId, AssetRecord, AssetSession, ContentReference,
    ContentReferenceExtractor, LinkType, PackageId, ReferenceExtractor, ReferenceKey, Result,
};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::dependencies::{
    BrokenLink, DependencyNode, DependencySet, InheritanceSearchOptions, ResolutionWarning,
    SearchOptions,
};

/// Broadcast after a tracked asset has been recomputed following a dirty-flag change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetChangedEvent {
    pub asset_id: AssetId,
    pub old_value: bool,
    pub new_value: bool,
}

#[derive(Default)]
struct GraphState {
    initialized: bool,
    packages: BTreeSet<PackageId>,
    nodes: HashMap<AssetId, DependencyNode>,
    /// part id -> owning asset id
    part_owner: HashMap<AssetId, AssetId>,
    /// location -> asset id, for tracked assets
    locations: HashMap<String, AssetId>,
    assets_with_missing: BTreeSet<AssetId>,
    /// unresolved target -> assets referencing it
    missing: HashMap<ReferenceKey, BTreeSet<AssetId>>,
}

struct OutLinks {
    resolved: BTreeMap<AssetId, LinkType>,
    broken: BTreeMap<ReferenceKey, BrokenLink>,
    warnings: Vec<ResolutionWarning>,
}

/// Live bidirectional reference graph over every asset of a session.
///
/// All state sits behind one lock and every query returns a detached copy. The first call
/// into any operation tracks every package of the session. References to assets that are
/// not tracked are kept as broken links and indexed by target, so they are promoted to
/// resolved links as soon as the target appears.
pub struct DependencyGraph {
    session: Arc<dyn AssetSession>,
    extractor: Arc<dyn ReferenceExtractor>,
    state: Mutex<GraphState>,
    changes: broadcast::Sender<AssetChangedEvent>,
    disposed: AtomicBool,
    saving: AtomicBool,
}

impl DependencyGraph {
    pub fn new(session: Arc<dyn AssetSession>, extractor: Arc<dyn ReferenceExtractor>) -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            session,
            extractor,
            state: Mutex::new(GraphState::default()),
            changes,
            disposed: AtomicBool::new(false),
            saving: AtomicBool::new(false),
        }
    }

    pub fn with_session(session: Arc<dyn AssetSession>) -> Self {
        Self::new(session, Arc::new(ContentReferenceExtractor))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AssetChangedEvent> {
        self.changes.subscribe()
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().initialized
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Later calls become no-ops; queries return [`AssetGraphError::Disposed`].
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut state = self.state.lock();
        *state = GraphState::default();
        debug!("dependency graph disposed");
    }

    pub fn begin_saving_session(&self) {
        self.saving.store(true, Ordering::SeqCst);
    }

    pub fn end_saving_session(&self) {
        self.saving.store(false, Ordering::SeqCst);
    }

    pub fn is_tracked(&self, id: AssetId) -> bool {
        self.lock_initialized().nodes.contains_key(&id)
    }

    pub fn tracked_asset_count(&self) -> usize {
        self.lock_initialized().nodes.len()
    }

    /// Tracks an asset known to the session. Returns false if it was already tracked.
    pub fn track(&self, id: AssetId) -> Result<bool> {
        self.ensure_alive()?;
        let mut state = self.lock_initialized();
        if state.nodes.contains_key(&id) {
            return Ok(false);
        }
        let record = self
            .session
            .find_asset(id)
            .ok_or(AssetGraphError::AssetNotFound(id))?;
        self.track_record(&mut state, record);
        Ok(true)
    }

    /// Stops tracking an asset. Links pointing at it become broken on the referrers.
    pub fn untrack(&self, id: AssetId) -> bool {
        if self.is_disposed() {
            return false;
        }
        let mut state = self.lock_initialized();
        self.untrack_asset(&mut state, id)
    }

    pub fn on_package_added(&self, package: PackageId) {
        if self.is_disposed() {
            return;
        }
        let mut state = self.lock_initialized();
        self.track_package(&mut state, package);
    }

    pub fn on_package_removed(&self, package: PackageId) {
        if self.is_disposed() {
            return;
        }
        let mut state = self.lock_initialized();
        self.untrack_package(&mut state, package);
    }

    pub fn on_packages_replaced(&self) {
        if self.is_disposed() {
            return;
        }
        let mut state = self.lock_initialized();
        let current: BTreeSet<PackageId> = self.session.packages().into_iter().collect();
        let stale: Vec<PackageId> = state.packages.difference(&current).copied().collect();
        for package in stale {
            self.untrack_package(&mut state, package);
        }
        for package in current {
            self.track_package(&mut state, package);
        }
    }

    pub fn on_asset_added(&self, id: AssetId) {
        if self.is_disposed() {
            return;
        }
        let mut state = self.lock_initialized();
        if state.nodes.contains_key(&id) {
            return;
        }
        if let Some(record) = self.session.find_asset(id) {
            self.track_record(&mut state, record);
        }
    }

    pub fn on_asset_removed(&self, id: AssetId) {
        if self.is_disposed() {
            return;
        }
        let mut state = self.lock_initialized();
        self.untrack_asset(&mut state, id);
    }

    pub fn on_assets_reset(&self, package: PackageId) {
        if self.is_disposed() {
            return;
        }
        let mut state = self.lock_initialized();
        let previous: Vec<AssetId> = state
            .nodes
            .values()
            .filter(|node| node.record.package == package)
            .map(DependencyNode::id)
            .collect();
        for id in previous {
            self.untrack_asset(&mut state, id);
        }
        for record in self.session.assets_in_package(package) {
            if !state.nodes.contains_key(&record.id) {
                self.track_record(&mut state, record);
            }
        }
    }

    /// Recomputes the outgoing links of a tracked asset when it becomes dirty.
    ///
    /// Ignored while a session save is in progress.
    pub fn on_asset_dirty_changed(&self, id: AssetId, old_value: bool, new_value: bool) {
        if self.is_disposed() || !new_value || self.saving.load(Ordering::SeqCst) {
            return;
        }
        let mut state = self.lock_initialized();
        if !state.nodes.contains_key(&id) {
            return;
        }
        let Some(record) = self.session.find_asset(id) else {
            return;
        };
        self.replace_record(&mut state, record);
        let mut queue = VecDeque::new();
        self.update_node(&mut state, id, &mut queue);
        self.drain_queue(&mut state, queue);
        drop(state);

        // No receivers is fine.
        let _ = self.changes.send(AssetChangedEvent {
            asset_id: id,
            old_value,
            new_value,
        });
    }

    /// Computes the dependencies of an asset as a detached copy.
    ///
    /// Only links whose type intersects `link_mask` are reported and followed. With
    /// [`SearchOptions::RECURSIVE`], `visited` guards the traversal; a fresh set is used when
    /// none is given, and it is cleared between the in and out passes. Assets known to the
    /// session but not tracked get their direct out links computed on the fly.
    pub fn compute_dependencies(
        &self,
        id: AssetId,
        options: SearchOptions,
        link_mask: LinkType,
        visited: Option<&mut HashSet<AssetId>>,
    ) -> Result<DependencySet> {
        self.ensure_alive()?;
        let mut state = self.lock_initialized();

        let untracked = if state.nodes.contains_key(&id) {
            None
        } else {
            let record = self
                .session
                .find_asset(id)
                .ok_or(AssetGraphError::AssetNotFound(id))?;
            Some(self.compute_untracked(&mut state, record))
        };
        let root = match (&untracked, state.nodes.get(&id)) {
            (Some(node), _) => node.record.clone(),
            (None, Some(node)) => node.record.clone(),
            (None, None) => return Err(AssetGraphError::AssetNotFound(id)),
        };

        let recursive = options.contains(SearchOptions::RECURSIVE);
        let mut local = HashSet::new();
        let visited = visited.unwrap_or(&mut local);
        let mut result = DependencySet::new(root);

        if options.contains(SearchOptions::IN) {
            collect_in(&state, &mut result, id, visited, recursive, link_mask);
        }
        if options.contains(SearchOptions::OUT) {
            if options.contains(SearchOptions::IN) {
                visited.clear();
            }
            collect_out(
                &state,
                untracked.as_ref(),
                &mut result,
                id,
                visited,
                recursive,
                link_mask,
            );
        }
        Ok(result)
    }

    /// Direct dependencies of a tracked asset.
    pub fn find_dependency_set(&self, id: AssetId) -> Option<DependencySet> {
        if self.is_disposed() {
            return None;
        }
        let state = self.lock_initialized();
        let node = state.nodes.get(&id)?;
        let mut set = DependencySet::new(node.record.clone());
        for (parent, link_type) in &node.links_in {
            if let Some(parent) = state.nodes.get(parent) {
                set.add_link_in(parent.record.clone(), *link_type);
            }
        }
        for (child, link_type) in &node.links_out {
            if let Some(child) = state.nodes.get(child) {
                set.add_link_out(child.record.clone(), *link_type);
            }
        }
        set.broken_links_out = node.broken_out.clone();
        set.parts = node.parts.clone();
        set.warnings = node.warnings.clone();
        Some(set)
    }

    /// Assets directly inheriting from `id`, by base and/or composition inheritance.
    pub fn find_assets_inheriting_from(
        &self,
        id: AssetId,
        options: InheritanceSearchOptions,
    ) -> Vec<AssetRecord> {
        if self.is_disposed() {
            return Vec::new();
        }
        let mask = options.link_mask();
        let state = self.lock_initialized();
        let Some(node) = state.nodes.get(&id) else {
            return Vec::new();
        };
        node.links_in
            .iter()
            .filter(|(_, link_type)| link_type.intersects(mask))
            .filter_map(|(parent, _)| state.nodes.get(parent))
            .map(|parent| parent.record.clone())
            .collect()
    }

    pub fn has_missing_references(&self) -> bool {
        if self.is_disposed() {
            return false;
        }
        !self.lock_initialized().assets_with_missing.is_empty()
    }

    pub fn find_assets_with_missing_references(&self) -> Vec<AssetId> {
        if self.is_disposed() {
            return Vec::new();
        }
        self.lock_initialized()
            .assets_with_missing
            .iter()
            .copied()
            .collect()
    }

    pub fn find_missing_references(&self, id: AssetId) -> Vec<ContentReference> {
        if self.is_disposed() {
            return Vec::new();
        }
        let state = self.lock_initialized();
        state
            .nodes
            .get(&id)
            .map(|node| {
                node.broken_out
                    .values()
                    .map(|link| link.target.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Assets referencing `target` while it is unresolved.
    pub fn find_referrers_of_missing(&self, target: &ReferenceKey) -> Vec<AssetId> {
        if self.is_disposed() {
            return Vec::new();
        }
        self.lock_initialized()
            .missing
            .get(target)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(AssetGraphError::Disposed);
        }
        Ok(())
    }

    fn lock_initialized(&self) -> MutexGuard<'_, GraphState> {
        let mut state = self.state.lock();
        if !state.initialized && !self.is_disposed() {
            for package in self.session.packages() {
                self.track_package(&mut state, package);
            }
            state.initialized = true;
            debug!("dependency graph initialized with {} assets", state.nodes.len());
        }
        state
    }

    fn track_package(&self, state: &mut GraphState, package: PackageId) {
        if !state.packages.insert(package) {
            return;
        }
        for record in self.session.assets_in_package(package) {
            if self.is_disposed() {
                return;
            }
            if !state.nodes.contains_key(&record.id) {
                self.track_record(state, record);
            }
        }
    }

    fn untrack_package(&self, state: &mut GraphState, package: PackageId) {
        if !state.packages.remove(&package) {
            return;
        }
        let ids: Vec<AssetId> = state
            .nodes
            .values()
            .filter(|node| node.record.package == package)
            .map(DependencyNode::id)
            .collect();
        for id in ids {
            self.untrack_asset(state, id);
        }
    }

    fn track_record(&self, state: &mut GraphState, record: AssetRecord) {
        let id = record.id;
        insert_node(state, record);
        let mut queue = VecDeque::new();
        self.update_node(state, id, &mut queue);
        self.drain_queue(state, queue);
    }

    /// Processes assets that were tracked lazily while resolving references.
    fn drain_queue(&self, state: &mut GraphState, mut queue: VecDeque<AssetId>) {
        while let Some(next) = queue.pop_front() {
            self.update_node(state, next, &mut queue);
        }
    }

    fn replace_record(&self, state: &mut GraphState, record: AssetRecord) {
        let Some(node) = state.nodes.get_mut(&record.id) else {
            return;
        };
        let old_location = std::mem::replace(&mut node.record, record.clone()).location;
        if old_location != record.location {
            if state.locations.get(&old_location) == Some(&record.id) {
                state.locations.remove(&old_location);
            }
            state.locations.insert(record.location, record.id);
        }
    }

    /// Fully recomputes the outgoing side of one node, keeping its incoming links.
    fn update_node(&self, state: &mut GraphState, id: AssetId, queue: &mut VecDeque<AssetId>) {
        let Some(node) = state.nodes.get_mut(&id) else {
            return;
        };
        let record = node.record.clone();
        let old_parts = std::mem::take(&mut node.parts);
        let old_out = std::mem::take(&mut node.links_out);
        for part in &old_parts {
            if state.part_owner.get(part) == Some(&id) {
                state.part_owner.remove(part);
            }
        }

        remove_missing(state, id);

        for child in old_out.keys() {
            if let Some(child) = state.nodes.get_mut(child) {
                child.links_in.remove(&id);
            }
        }

        let parts: BTreeSet<AssetId> = record
            .content
            .parts()
            .into_iter()
            .filter(|part| *part != id)
            .collect();
        let out = self.collect_out_links(state, &record, &parts, queue);

        for part in &parts {
            state.part_owner.insert(*part, id);
        }
        for (child, link_type) in &out.resolved {
            if let Some(child) = state.nodes.get_mut(child) {
                *child.links_in.entry(id).or_insert(LinkType::empty()) |= *link_type;
            }
        }
        if let Some(node) = state.nodes.get_mut(&id) {
            node.links_out = out.resolved;
            node.broken_out = out.broken;
            node.warnings = out.warnings;
            node.parts = parts;
        }

        register_missing(state, id);
        heal_references_to(state, id);
    }

    /// First-level out links of an untracked asset, without inserting it.
    fn compute_untracked(&self, state: &mut GraphState, record: AssetRecord) -> DependencyNode {
        let mut queue = VecDeque::new();
        let parts: BTreeSet<AssetId> = record.content.parts().into_iter().collect();
        let out = self.collect_out_links(state, &record, &parts, &mut queue);
        self.drain_queue(state, queue);

        let mut node = DependencyNode::new(record);
        node.links_out = out.resolved;
        node.broken_out = out.broken;
        node.warnings = out.warnings;
        node.parts = parts;
        node
    }

    fn collect_out_links(
        &self,
        state: &mut GraphState,
        record: &AssetRecord,
        own_parts: &BTreeSet<AssetId>,
        queue: &mut VecDeque<AssetId>,
    ) -> OutLinks {
        let mut out = OutLinks {
            resolved: BTreeMap::new(),
            broken: BTreeMap::new(),
            warnings: Vec::new(),
        };
        for reference in self.extractor.extract_references(record) {
            let target = &reference.target;
            let self_location =
                target.id.is_none() && target.location.as_deref() == Some(record.location.as_str());
            if self_location
                || target.id == Some(record.id)
                || target.id.is_some_and(|id| own_parts.contains(&id))
            {
                continue;
            }
            let Some(key) = target.key() else {
                warn!(
                    "asset {} has an empty reference at {}",
                    record.id, reference.member_path
                );
                out.warnings.push(ResolutionWarning::EmptyReference {
                    referrer: record.id,
                    member_path: reference.member_path.clone(),
                });
                continue;
            };
            match self.resolve(state, record.id, target, queue, &mut out.warnings) {
                Some(resolved) if resolved == record.id => {}
                Some(resolved) => {
                    *out.resolved.entry(resolved).or_insert(LinkType::empty()) |=
                        reference.link_type;
                }
                None => {
                    out.broken
                        .entry(key)
                        .and_modify(|link| link.link_type |= reference.link_type)
                        .or_insert(BrokenLink {
                            target: target.clone(),
                            link_type: reference.link_type,
                        });
                }
            }
        }
        out
    }

    /// Resolves a reference to a tracked asset, tracking it lazily if only the session knows it.
    ///
    /// The id is authoritative: an id that does not resolve leaves the link broken even if
    /// the location matches something.
    fn resolve(
        &self,
        state: &mut GraphState,
        referrer: AssetId,
        target: &ContentReference,
        queue: &mut VecDeque<AssetId>,
        warnings: &mut Vec<ResolutionWarning>,
    ) -> Option<AssetId> {
        let location = target.location.as_deref().filter(|l| !l.is_empty());
        match target.id {
            Some(id) => {
                let resolved = self.resolve_id(state, id, queue);
                if let Some(location) = location {
                    let by_location = state
                        .locations
                        .get(location)
                        .copied()
                        .or_else(|| self.session.find_asset_by_location(location).map(|r| r.id));
                    if let Some(by_location) = by_location {
                        if Some(by_location) != resolved {
                            warn!(
                                "reference {} from {} is ambiguous, keeping id match {:?} over location match {}",
                                target, referrer, resolved, by_location
                            );
                            warnings.push(ResolutionWarning::AmbiguousResolution {
                                referrer,
                                reference: target.clone(),
                                by_id: resolved,
                                by_location,
                            });
                        }
                    }
                }
                resolved
            }
            None => {
                let location = location?;
                let resolved = self.resolve_location(state, location, queue)?;
                warn!(
                    "reference from {} has no id, resolved by location {} to {}",
                    referrer, location, resolved
                );
                warnings.push(ResolutionWarning::ResolvedByLocation {
                    referrer,
                    location: location.to_string(),
                    resolved,
                });
                Some(resolved)
            }
        }
    }

    fn resolve_id(
        &self,
        state: &mut GraphState,
        id: AssetId,
        queue: &mut VecDeque<AssetId>,
    ) -> Option<AssetId> {
        if state.nodes.contains_key(&id) {
            return Some(id);
        }
        if let Some(owner) = state.part_owner.get(&id) {
            return Some(*owner);
        }
        let record = self.session.find_asset(id)?;
        Some(track_lazily(state, record, queue))
    }

    fn resolve_location(
        &self,
        state: &mut GraphState,
        location: &str,
        queue: &mut VecDeque<AssetId>,
    ) -> Option<AssetId> {
        if let Some(id) = state.locations.get(location) {
            return Some(*id);
        }
        let record = self.session.find_asset_by_location(location)?;
        if state.nodes.contains_key(&record.id) {
            return Some(record.id);
        }
        Some(track_lazily(state, record, queue))
    }

    fn untrack_asset(&self, state: &mut GraphState, id: AssetId) -> bool {
        remove_missing(state, id);
        let Some(node) = state.nodes.remove(&id) else {
            return false;
        };
        if state.locations.get(&node.record.location) == Some(&id) {
            state.locations.remove(&node.record.location);
        }
        for part in &node.parts {
            if state.part_owner.get(part) == Some(&id) {
                state.part_owner.remove(part);
            }
        }

        for child in node.links_out.keys() {
            if let Some(child) = state.nodes.get_mut(child) {
                child.links_in.remove(&id);
            }
        }

        let target = node.record.reference();
        for parent in node.links_in.keys() {
            let Some(parent_node) = state.nodes.get_mut(parent) else {
                continue;
            };
            let Some(link_type) = parent_node.links_out.remove(&id) else {
                continue;
            };
            parent_node
                .broken_out
                .entry(ReferenceKey::Id(id))
                .and_modify(|link| link.link_type |= link_type)
                .or_insert(BrokenLink {
                    target: target.clone(),
                    link_type,
                });
            register_missing(state, *parent);
        }
        debug!("untracked asset {}", id);
        true
    }
}

fn insert_node(state: &mut GraphState, record: AssetRecord) {
    state.locations.insert(record.location.clone(), record.id);
    state.nodes.insert(record.id, DependencyNode::new(record));
}

fn track_lazily(
    state: &mut GraphState,
    record: AssetRecord,
    queue: &mut VecDeque<AssetId>,
) -> AssetId {
    let id = record.id;
    insert_node(state, record);
    queue.push_back(id);
    id
}

fn remove_missing(state: &mut GraphState, id: AssetId) {
    if !state.assets_with_missing.remove(&id) {
        return;
    }
    let Some(node) = state.nodes.get(&id) else {
        return;
    };
    for key in node.broken_out.keys() {
        if let Some(referrers) = state.missing.get_mut(key) {
            referrers.remove(&id);
            if referrers.is_empty() {
                state.missing.remove(key);
            }
        }
    }
}

fn register_missing(state: &mut GraphState, id: AssetId) {
    let Some(node) = state.nodes.get(&id) else {
        return;
    };
    if !node.has_missing_dependencies() {
        state.assets_with_missing.remove(&id);
        return;
    }
    for key in node.broken_out.keys() {
        state.missing.entry(key.clone()).or_default().insert(id);
    }
    state.assets_with_missing.insert(id);
}

/// Promotes broken links pointing at `id`, its location, or one of its parts to resolved links.
fn heal_references_to(state: &mut GraphState, id: AssetId) {
    let Some(node) = state.nodes.get(&id) else {
        return;
    };
    let mut keys = vec![
        ReferenceKey::Id(id),
        ReferenceKey::Location(node.record.location.clone()),
    ];
    keys.extend(node.parts.iter().map(|part| ReferenceKey::Id(*part)));

    for key in keys {
        let Some(referrers) = state.missing.remove(&key) else {
            continue;
        };
        for parent in referrers {
            if parent == id {
                continue;
            }
            let Some(parent_node) = state.nodes.get_mut(&parent) else {
                continue;
            };
            let Some(broken) = parent_node.broken_out.remove(&key) else {
                continue;
            };
            *parent_node.links_out.entry(id).or_insert(LinkType::empty()) |= broken.link_type;
            if let ReferenceKey::Location(location) = &key {
                parent_node.warnings.push(ResolutionWarning::ResolvedByLocation {
                    referrer: parent,
                    location: location.clone(),
                    resolved: id,
                });
            }
            if !parent_node.has_missing_dependencies() {
                state.assets_with_missing.remove(&parent);
            }
            if let Some(node) = state.nodes.get_mut(&id) {
                *node.links_in.entry(parent).or_insert(LinkType::empty()) |= broken.link_type;
            }
            debug!("resolved missing reference from {} to {}", parent, id);
        }
    }
}

fn collect_in(
    state: &GraphState,
    result: &mut DependencySet,
    root: AssetId,
    visited: &mut HashSet<AssetId>,
    recursive: bool,
    mask: LinkType,
) {
    let mut stack = vec![root];
    while let Some(current) = stack.pop() {
        if recursive && !visited.insert(current) {
            continue;
        }
        let Some(node) = state.nodes.get(&current) else {
            continue;
        };
        for (parent, link_type) in &node.links_in {
            if !link_type.intersects(mask) {
                continue;
            }
            if let Some(parent_node) = state.nodes.get(parent) {
                result.add_link_in(parent_node.record.clone(), *link_type);
                if recursive {
                    stack.push(*parent);
                }
            }
        }
        if !recursive {
            break;
        }
    }
}

fn collect_out(
    state: &GraphState,
    untracked: Option<&DependencyNode>,
    result: &mut DependencySet,
    root: AssetId,
    visited: &mut HashSet<AssetId>,
    recursive: bool,
    mask: LinkType,
) {
    let mut stack = vec![root];
    while let Some(current) = stack.pop() {
        if recursive && !visited.insert(current) {
            continue;
        }
        let node = match untracked {
            Some(node) if node.id() == current => Some(node),
            _ => state.nodes.get(&current),
        };
        let Some(node) = node else {
            continue;
        };
        for (key, broken) in &node.broken_out {
            if broken.link_type.intersects(mask) {
                result.add_broken_link_out(key.clone(), broken.clone());
            }
        }
        result.warnings.extend(node.warnings.iter().cloned());
        if current == root {
            result.parts = node.parts.clone();
        }
        for (child, link_type) in &node.links_out {
            if !link_type.intersects(mask) {
                continue;
            }
            if let Some(child_node) = state.nodes.get(child) {
                result.add_link_out(child_node.record.clone(), *link_type);
                if recursive {
                    stack.push(*child);
                }
            }
        }
        if !recursive {
            break;
        }
    }
}
