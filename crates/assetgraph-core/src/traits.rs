use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::{
    AssetId, AssetRecord, BuildDependencyType, ExtractedReference, PackageId, SourceFileMember,
};

/// Immutable content of an asset.
///
/// Implementors expose what the engine needs explicitly instead of being walked reflectively.
pub trait AssetContent: Send + Sync + fmt::Debug {
    /// Runtime type name, used to pick a compiler and to match compiler input tables.
    fn type_name(&self) -> &str;

    /// References to other assets in member order.
    fn enumerate_references(&self) -> Vec<ExtractedReference>;

    /// External files this asset was imported from.
    fn enumerate_source_files(&self) -> Vec<SourceFileMember> {
        Vec::new()
    }

    /// Ids of sub-objects that can be referenced directly but live inside this asset.
    fn parts(&self) -> Vec<AssetId> {
        Vec::new()
    }
}

pub trait ReferenceExtractor: Send + Sync {
    fn extract_references(&self, record: &AssetRecord) -> Vec<ExtractedReference>;
    fn extract_source_files(&self, record: &AssetRecord) -> Vec<SourceFileMember>;
}

/// Extractor that asks the content itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct ContentReferenceExtractor;

impl ReferenceExtractor for ContentReferenceExtractor {
    fn extract_references(&self, record: &AssetRecord) -> Vec<ExtractedReference> {
        record.content.enumerate_references()
    }

    fn extract_source_files(&self, record: &AssetRecord) -> Vec<SourceFileMember> {
        record.content.enumerate_source_files()
    }
}

/// Read access to the asset/package model that owns the assets.
pub trait AssetSession: Send + Sync {
    fn packages(&self) -> Vec<PackageId>;
    fn assets_in_package(&self, package: PackageId) -> Vec<AssetRecord>;
    fn find_asset(&self, id: AssetId) -> Option<AssetRecord>;
    fn find_asset_by_location(&self, location: &str) -> Option<AssetRecord>;

    /// Directory holding the package's asset files, if the package lives on disk.
    fn package_root(&self, package: PackageId) -> Option<PathBuf> {
        let _ = package;
        None
    }

    /// Whether a file found under a package root is an asset file.
    fn is_asset_file(&self, path: &Path) -> bool {
        let _ = path;
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputUrlKind {
    /// Arbitrary file on disk; does not create a graph dependency.
    File,
    /// Raw content of another asset.
    Content,
    /// Compiled output of another asset.
    ContentLink,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InputUrl {
    pub kind: InputUrlKind,
    pub path: String,
}

impl InputUrl {
    pub fn new(kind: InputUrlKind, path: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
        }
    }
}

pub trait AssetCompiler: Send + Sync {
    /// Maps a referenced asset type name to the dependency it requires for this compiler.
    fn input_types(&self, record: &AssetRecord) -> Vec<(String, BuildDependencyType)>;

    fn input_files(&self, record: &AssetRecord) -> Vec<InputUrl> {
        let _ = record;
        Vec::new()
    }
}

pub trait CompilerRegistry: Send + Sync {
    fn compiler_for(&self, type_name: &str) -> Option<Arc<dyn AssetCompiler>>;
}

impl CompilerRegistry for HashMap<String, Arc<dyn AssetCompiler>> {
    fn compiler_for(&self, type_name: &str) -> Option<Arc<dyn AssetCompiler>> {
        self.get(type_name).cloned()
    }
}
