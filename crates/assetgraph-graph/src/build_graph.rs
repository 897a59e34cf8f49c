use assetgraph_core::{
    AssetGraphError, AssetId, AssetRecord, AssetSession, BuildDependencyType, CompilerRegistry, InputUrlKind,
    LinkType, Result,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::dependencies::SearchOptions;
use crate::manager::DependencyGraph;

/// Identity of a build node: one asset compiled for one kind of dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BuildNodeKey {
    pub asset_id: AssetId,
    pub dependency_type: BuildDependencyType,
}

impl BuildNodeKey {
    pub fn new(asset_id: AssetId, dependency_type: BuildDependencyType) -> Self {
        Self {
            asset_id,
            dependency_type,
        }
    }
}

/// Last build scheduled for a node and the node version it was scheduled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildTaskHandle {
    pub task_id: Uuid,
    pub built_version: u64,
}

#[derive(Debug)]
pub struct BuildNode {
    key: BuildNodeKey,
    /// Asset as of the last analysis.
    record: Mutex<AssetRecord>,
    version: AtomicU64,
    build_task: Mutex<Option<BuildTaskHandle>>,
    dependencies: Mutex<BTreeSet<BuildNodeKey>>,
}

impl BuildNode {
    fn new(key: BuildNodeKey, record: AssetRecord) -> Self {
        Self {
            key,
            record: Mutex::new(record),
            version: AtomicU64::new(0),
            build_task: Mutex::new(None),
            dependencies: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn key(&self) -> BuildNodeKey {
        self.key
    }

    pub fn record(&self) -> AssetRecord {
        self.record.lock().clone()
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    pub fn dependencies(&self) -> BTreeSet<BuildNodeKey> {
        self.dependencies.lock().clone()
    }

    pub fn build_task(&self) -> Option<BuildTaskHandle> {
        *self.build_task.lock()
    }

    /// Records a scheduled build for the current version.
    pub fn set_build_task(&self, task_id: Uuid) -> BuildTaskHandle {
        let handle = BuildTaskHandle {
            task_id,
            built_version: self.version(),
        };
        *self.build_task.lock() = Some(handle);
        handle
    }

    /// True when no build was scheduled yet or the node changed since the last one.
    pub fn needs_build(&self) -> bool {
        match self.build_task() {
            Some(task) => task.built_version != self.version(),
            None => true,
        }
    }

    fn bump_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Memoized per-(asset, dependency type) build nodes derived from the dependency graph.
pub struct BuildGraph {
    dependency_graph: Arc<DependencyGraph>,
    session: Arc<dyn AssetSession>,
    compilers: Arc<dyn CompilerRegistry>,
    nodes: DashMap<BuildNodeKey, Arc<BuildNode>>,
}

impl BuildGraph {
    pub fn new(
        dependency_graph: Arc<DependencyGraph>,
        session: Arc<dyn AssetSession>,
        compilers: Arc<dyn CompilerRegistry>,
    ) -> Self {
        Self {
            dependency_graph,
            session,
            compilers,
            nodes: DashMap::new(),
        }
    }

    /// Returns the node for `(record, dependency_type)`, creating it once.
    ///
    /// Concurrent callers with the same key always get the same node.
    pub fn find_or_create_node(
        &self,
        record: &AssetRecord,
        dependency_type: BuildDependencyType,
    ) -> Arc<BuildNode> {
        let key = BuildNodeKey::new(record.id, dependency_type);
        self.nodes
            .entry(key)
            .or_insert_with(|| {
                trace!("creating build node {:?}", key);
                Arc::new(BuildNode::new(key, record.clone()))
            })
            .value()
            .clone()
    }

    pub fn find_node(&self, key: &BuildNodeKey) -> Option<Arc<BuildNode>> {
        self.nodes.get(key).map(|entry| entry.value().clone())
    }

    pub fn remove_node(&self, key: &BuildNodeKey) -> Option<Arc<BuildNode>> {
        self.nodes.remove(key).map(|(_, node)| node)
    }

    /// Drops every node of an asset, whatever its dependency type.
    pub fn remove_asset(&self, asset_id: AssetId) -> usize {
        let before = self.nodes.len();
        self.nodes.retain(|key, _| key.asset_id != asset_id);
        before - self.nodes.len()
    }

    /// Bumps the version of every node of an asset so that its next build is not skipped.
    pub fn invalidate_asset(&self, asset_id: AssetId) -> usize {
        let mut invalidated = 0;
        for entry in self.nodes.iter() {
            if entry.key().asset_id == asset_id {
                entry.value().bump_version();
                invalidated += 1;
            }
        }
        invalidated
    }

    pub fn dependencies_of(&self, key: &BuildNodeKey) -> BTreeSet<BuildNodeKey> {
        self.find_node(key)
            .map(|node| node.dependencies())
            .unwrap_or_default()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Derives the build dependencies of a node from its compiler.
    ///
    /// Every asset reachable through reference links whose type the compiler declares as an
    /// input becomes a dependency with the declared flags, as do assets named by the
    /// compiler's content input files. The result replaces the node's stored dependencies.
    ///
    /// The asset is read again from the session, so a node created before the asset changed
    /// is analyzed against its current type and content.
    pub fn analyze(&self, node: &BuildNode) -> Result<BTreeSet<BuildNodeKey>> {
        let asset_id = node.key().asset_id;
        let current = self
            .session
            .find_asset(asset_id)
            .ok_or(AssetGraphError::AssetNotFound(asset_id))?;
        *node.record.lock() = current.clone();
        let record = &current;
        let Some(compiler) = self.compilers.compiler_for(record.type_name()) else {
            debug!("no compiler for {} ({})", record.location, record.type_name());
            return Ok(BTreeSet::new());
        };

        let mut found = BTreeSet::new();
        let input_types = compiler.input_types(record);
        if !input_types.is_empty() {
            let references = self.dependency_graph.compute_dependencies(
                record.id,
                SearchOptions::OUT | SearchOptions::RECURSIVE,
                LinkType::REFERENCE,
                None,
            )?;
            for link in references.links_out.values() {
                if link.id() == record.id {
                    continue;
                }
                for (type_name, dependency_type) in &input_types {
                    if type_name == link.record.type_name() {
                        let child = self.find_or_create_node(&link.record, *dependency_type);
                        found.insert(child.key());
                    }
                }
            }
        }

        for input in compiler.input_files(record) {
            let dependency_type = match input.kind {
                InputUrlKind::Content => BuildDependencyType::COMPILE_CONTENT,
                InputUrlKind::ContentLink => BuildDependencyType::COMPILE_ASSET,
                InputUrlKind::File => continue,
            };
            match self.session.find_asset_by_location(&input.path) {
                Some(asset) if asset.id != record.id => {
                    let child = self.find_or_create_node(&asset, dependency_type);
                    found.insert(child.key());
                }
                Some(_) => {}
                None => debug!("input {} of {} is not an asset", input.path, record.location),
            }
        }

        *node.dependencies.lock() = found.clone();
        Ok(found)
    }
}
