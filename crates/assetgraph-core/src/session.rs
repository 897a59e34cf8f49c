use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::{
    AssetContent, AssetGraphError, AssetId, AssetRecord, AssetSession, ExtractedReference,
    PackageId, Result, SourceFileMember,
};

/// Content whose references and source files are plain data.
#[derive(Debug, Clone, Default)]
pub struct StaticContent {
    pub type_name: String,
    pub references: Vec<ExtractedReference>,
    pub source_files: Vec<SourceFileMember>,
    pub parts: Vec<AssetId>,
}

impl StaticContent {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            ..Default::default()
        }
    }

    pub fn with_reference(mut self, reference: ExtractedReference) -> Self {
        self.references.push(reference);
        self
    }

    pub fn with_source_file(mut self, member: SourceFileMember) -> Self {
        self.source_files.push(member);
        self
    }

    pub fn with_part(mut self, part: AssetId) -> Self {
        self.parts.push(part);
        self
    }

    pub fn into_arc(self) -> Arc<dyn AssetContent> {
        Arc::new(self)
    }
}

impl AssetContent for StaticContent {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn enumerate_references(&self) -> Vec<ExtractedReference> {
        self.references.clone()
    }

    fn enumerate_source_files(&self) -> Vec<SourceFileMember> {
        self.source_files.clone()
    }

    fn parts(&self) -> Vec<AssetId> {
        self.parts.clone()
    }
}

#[derive(Default)]
struct SessionState {
    packages: BTreeMap<PackageId, BTreeMap<AssetId, AssetRecord>>,
    owners: HashMap<AssetId, PackageId>,
    roots: HashMap<PackageId, PathBuf>,
    /// Lowercase extensions recognized as asset files; empty accepts every file.
    asset_extensions: BTreeSet<String>,
}

/// Thread-safe in-memory asset session.
///
/// Mutators only change the session; callers forward the matching notification
/// (`on_asset_added`, `on_asset_dirty_changed`, ...) to the managers themselves.
#[derive(Default)]
pub struct InMemorySession {
    state: RwLock<SessionState>,
}

impl InMemorySession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the package already existed.
    pub fn add_package(&self, package: PackageId) -> bool {
        let mut state = self.state.write();
        if state.packages.contains_key(&package) {
            return false;
        }
        state.packages.insert(package, BTreeMap::new());
        true
    }

    /// Removes a package with all of its assets and returns them.
    pub fn remove_package(&self, package: PackageId) -> Vec<AssetRecord> {
        let mut state = self.state.write();
        let removed: Vec<AssetRecord> = state
            .packages
            .remove(&package)
            .map(|assets| assets.into_values().collect())
            .unwrap_or_default();
        for record in &removed {
            state.owners.remove(&record.id);
        }
        state.roots.remove(&package);
        removed
    }

    /// Places a package on disk. Asset file locations are relative to `root`.
    pub fn set_package_root(&self, package: PackageId, root: impl Into<PathBuf>) -> Result<()> {
        let mut state = self.state.write();
        if !state.packages.contains_key(&package) {
            return Err(AssetGraphError::InvalidArgument(format!(
                "unknown package {}",
                package
            )));
        }
        state.roots.insert(package, root.into());
        Ok(())
    }

    /// Restricts asset files to the given extensions, e.g. `"asset"`.
    pub fn add_asset_extension(&self, extension: &str) {
        self.state
            .write()
            .asset_extensions
            .insert(extension.trim_start_matches('.').to_ascii_lowercase());
    }

    pub fn add_asset(&self, record: AssetRecord) -> Result<()> {
        let mut state = self.state.write();
        if state.owners.contains_key(&record.id) {
            return Err(AssetGraphError::InvalidArgument(format!(
                "asset {} is already part of the session",
                record.id
            )));
        }
        let (id, package) = (record.id, record.package);
        let assets = state.packages.get_mut(&package).ok_or_else(|| {
            AssetGraphError::InvalidArgument(format!("unknown package {}", package))
        })?;
        assets.insert(id, record);
        state.owners.insert(id, package);
        Ok(())
    }

    pub fn remove_asset(&self, id: AssetId) -> Option<AssetRecord> {
        let mut state = self.state.write();
        let package = state.owners.remove(&id)?;
        state.packages.get_mut(&package)?.remove(&id)
    }

    /// Swaps the content of an asset and marks it dirty. Returns the previous dirty flag.
    pub fn replace_content(&self, id: AssetId, content: Arc<dyn AssetContent>) -> Result<bool> {
        self.update(id, |record| {
            let was_dirty = record.is_dirty;
            record.content = content;
            record.is_dirty = true;
            was_dirty
        })
    }

    /// Returns the previous dirty flag.
    pub fn set_dirty(&self, id: AssetId, dirty: bool) -> Result<bool> {
        self.update(id, |record| std::mem::replace(&mut record.is_dirty, dirty))
    }

    pub fn asset_count(&self) -> usize {
        self.state.read().owners.len()
    }

    fn update<T>(&self, id: AssetId, f: impl FnOnce(&mut AssetRecord) -> T) -> Result<T> {
        let mut state = self.state.write();
        let package = *state
            .owners
            .get(&id)
            .ok_or(AssetGraphError::AssetNotFound(id))?;
        let record = state
            .packages
            .get_mut(&package)
            .and_then(|assets| assets.get_mut(&id))
            .ok_or(AssetGraphError::AssetNotFound(id))?;
        Ok(f(record))
    }
}

impl AssetSession for InMemorySession {
    fn packages(&self) -> Vec<PackageId> {
        self.state.read().packages.keys().copied().collect()
    }

    fn assets_in_package(&self, package: PackageId) -> Vec<AssetRecord> {
        self.state
            .read()
            .packages
            .get(&package)
            .map(|assets| assets.values().cloned().collect())
            .unwrap_or_default()
    }

    fn find_asset(&self, id: AssetId) -> Option<AssetRecord> {
        let state = self.state.read();
        let package = state.owners.get(&id)?;
        state.packages.get(package)?.get(&id).cloned()
    }

    fn find_asset_by_location(&self, location: &str) -> Option<AssetRecord> {
        let state = self.state.read();
        state
            .packages
            .values()
            .flat_map(|assets| assets.values())
            .find(|record| record.location == location)
            .cloned()
    }

    fn package_root(&self, package: PackageId) -> Option<PathBuf> {
        self.state.read().roots.get(&package).cloned()
    }

    fn is_asset_file(&self, path: &Path) -> bool {
        let state = self.state.read();
        if state.asset_extensions.is_empty() {
            return true;
        }
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| state.asset_extensions.contains(&ext.to_ascii_lowercase()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn record(package: PackageId, location: &str) -> AssetRecord {
        AssetRecord::new(
            Uuid::new_v4(),
            location,
            package,
            StaticContent::new("Texture").into_arc(),
        )
    }

    #[test]
    fn test_add_and_find() {
        let session = InMemorySession::new();
        let package = Uuid::new_v4();
        assert!(session.add_package(package));
        assert!(!session.add_package(package));

        let item = record(package, "textures/stone");
        let id = item.id;
        session.add_asset(item).unwrap();

        assert_eq!(session.find_asset(id).unwrap().location, "textures/stone");
        assert_eq!(session.find_asset_by_location("textures/stone").unwrap().id, id);
        assert_eq!(session.assets_in_package(package).len(), 1);
    }

    #[test]
    fn test_add_to_unknown_package_fails() {
        let session = InMemorySession::new();
        let err = session.add_asset(record(Uuid::new_v4(), "a")).unwrap_err();
        assert!(matches!(err, AssetGraphError::InvalidArgument(_)));
    }

    #[test]
    fn test_duplicate_asset_rejected() {
        let session = InMemorySession::new();
        let package = Uuid::new_v4();
        session.add_package(package);
        let item = record(package, "a");
        session.add_asset(item.clone()).unwrap();
        assert!(session.add_asset(item).is_err());
        assert_eq!(session.asset_count(), 1);
    }

    #[test]
    fn test_replace_content_marks_dirty() {
        let session = InMemorySession::new();
        let package = Uuid::new_v4();
        session.add_package(package);
        let item = record(package, "a");
        let id = item.id;
        session.add_asset(item).unwrap();

        let was_dirty = session
            .replace_content(id, StaticContent::new("Material").into_arc())
            .unwrap();
        assert!(!was_dirty);
        let current = session.find_asset(id).unwrap();
        assert!(current.is_dirty);
        assert_eq!(current.type_name(), "Material");
        assert!(session.set_dirty(id, false).unwrap());
    }

    #[test]
    fn test_remove_package_drops_assets() {
        let session = InMemorySession::new();
        let package = Uuid::new_v4();
        session.add_package(package);
        let item = record(package, "a");
        let id = item.id;
        session.add_asset(item).unwrap();

        let removed = session.remove_package(package);
        assert_eq!(removed.len(), 1);
        assert!(session.find_asset(id).is_none());
        assert!(session.packages().is_empty());
    }

    #[test]
    fn test_package_root_and_asset_extensions() {
        let session = InMemorySession::new();
        let package = Uuid::new_v4();
        assert!(session.set_package_root(package, "/pkg").is_err());
        session.add_package(package);
        session.set_package_root(package, "/pkg").unwrap();
        assert_eq!(session.package_root(package), Some(PathBuf::from("/pkg")));

        assert!(session.is_asset_file(Path::new("/pkg/readme.txt")));
        session.add_asset_extension(".Asset");
        assert!(session.is_asset_file(Path::new("/pkg/a/b.ASSET")));
        assert!(!session.is_asset_file(Path::new("/pkg/readme.txt")));

        session.remove_package(package);
        assert!(session.package_root(package).is_none());
    }
}
