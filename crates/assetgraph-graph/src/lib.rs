pub mod build_graph;
pub mod dependencies;
pub mod manager;

pub use build_graph::{BuildGraph, BuildNode, BuildNodeKey, BuildTaskHandle};
pub use dependencies::{
    AssetLink, BrokenLink, DependencySet, InheritanceSearchOptions, ResolutionWarning,
    SearchOptions,
};
pub use manager::{AssetChangedEvent, DependencyGraph};
