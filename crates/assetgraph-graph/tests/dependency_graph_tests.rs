use assetgraph_core::{
    AssetId, AssetRecord, ContentReference, ExtractedReference, InMemorySession, LinkType,
    PackageId, ReferenceKey, StaticContent,
};
use assetgraph_graph::{DependencyGraph, InheritanceSearchOptions, SearchOptions};
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use uuid::Uuid;

struct Fixture {
    session: Arc<InMemorySession>,
    package: PackageId,
    graph: DependencyGraph,
}

impl Fixture {
    fn new() -> Self {
        let session = Arc::new(InMemorySession::new());
        let package = Uuid::new_v4();
        session.add_package(package);
        let graph = DependencyGraph::with_session(session.clone());
        Self {
            session,
            package,
            graph,
        }
    }

    fn add_with_id(&self, id: AssetId, location: &str, content: StaticContent) -> AssetId {
        self.session
            .add_asset(AssetRecord::new(id, location, self.package, content.into_arc()))
            .unwrap();
        self.graph.on_asset_added(id);
        id
    }

    fn add(&self, location: &str, content: StaticContent) -> AssetId {
        self.add_with_id(Uuid::new_v4(), location, content)
    }
}

fn refers(id: AssetId, link_type: LinkType) -> ExtractedReference {
    ExtractedReference::new("Member", ContentReference::by_id(id), link_type)
}

fn material(targets: &[AssetId]) -> StaticContent {
    targets.iter().fold(StaticContent::new("Material"), |content, id| {
        content.with_reference(refers(*id, LinkType::REFERENCE))
    })
}

#[test]
fn test_broken_link_resolves_when_target_appears() {
    let fx = Fixture::new();
    let y = Uuid::new_v4();
    let x = fx.add("x", material(&[y]));

    let set = fx.graph.find_dependency_set(x).unwrap();
    assert!(set.links_out.is_empty());
    assert!(set.broken_links_out.contains_key(&ReferenceKey::Id(y)));
    assert_eq!(fx.graph.find_assets_with_missing_references(), vec![x]);

    fx.add_with_id(y, "y", StaticContent::new("Texture"));

    let set = fx.graph.find_dependency_set(x).unwrap();
    assert_eq!(set.out_ids(), vec![y]);
    assert!(!set.has_missing_dependencies());
    assert!(!fx.graph.has_missing_references());

    let target = fx.graph.find_dependency_set(y).unwrap();
    assert_eq!(target.in_ids(), vec![x]);
}

#[test]
fn test_links_are_symmetric() {
    let fx = Fixture::new();
    let a = fx.add("a", StaticContent::new("Texture"));
    let b = fx.add("b", StaticContent::new("Texture"));
    let c = fx.add("c", material(&[a, b]));
    let d = fx.add("d", material(&[a, c]));

    for id in [a, b, c, d] {
        let set = fx.graph.find_dependency_set(id).unwrap();
        for child in set.out_ids() {
            let child_set = fx.graph.find_dependency_set(child).unwrap();
            assert!(child_set.links_in.contains_key(&id));
        }
        for parent in set.in_ids() {
            let parent_set = fx.graph.find_dependency_set(parent).unwrap();
            assert!(parent_set.links_out.contains_key(&id));
        }
    }
}

#[test]
fn test_link_types_are_merged() {
    let fx = Fixture::new();
    let base = fx.add("base", StaticContent::new("Prefab"));
    let derived = fx.add(
        "derived",
        StaticContent::new("Prefab")
            .with_reference(refers(base, LinkType::REFERENCE))
            .with_reference(refers(base, LinkType::INHERITANCE)),
    );

    let set = fx.graph.find_dependency_set(derived).unwrap();
    assert_eq!(set.links_out.len(), 1);
    assert_eq!(
        set.links_out[&base].link_type,
        LinkType::REFERENCE | LinkType::INHERITANCE
    );
    assert_eq!(
        fx.graph.find_dependency_set(base).unwrap().links_in[&derived].link_type,
        LinkType::REFERENCE | LinkType::INHERITANCE
    );
}

#[test]
fn test_recursive_query_terminates_on_cycle() {
    let fx = Fixture::new();
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    let c = Uuid::new_v4();
    fx.add_with_id(a, "a", material(&[b]));
    fx.add_with_id(b, "b", material(&[c]));
    fx.add_with_id(c, "c", material(&[a]));

    let set = fx
        .graph
        .compute_dependencies(a, SearchOptions::ALL, LinkType::all(), None)
        .unwrap();
    let expected: HashSet<AssetId> = [a, b, c].into_iter().collect();
    assert_eq!(set.out_ids().into_iter().collect::<HashSet<_>>(), expected);
    assert_eq!(set.in_ids().into_iter().collect::<HashSet<_>>(), expected);
}

#[test]
fn test_non_recursive_query_is_direct_only() {
    let fx = Fixture::new();
    let leaf = fx.add("leaf", StaticContent::new("Texture"));
    let mid = fx.add("mid", material(&[leaf]));
    let root = fx.add("root", material(&[mid]));

    let set = fx
        .graph
        .compute_dependencies(root, SearchOptions::OUT, LinkType::all(), None)
        .unwrap();
    assert_eq!(set.out_ids(), vec![mid]);
    assert!(set.links_in.is_empty());

    let set = fx
        .graph
        .compute_dependencies(
            root,
            SearchOptions::OUT | SearchOptions::RECURSIVE,
            LinkType::all(),
            None,
        )
        .unwrap();
    assert_eq!(set.links_out.len(), 2);
    assert!(set.links_out.contains_key(&leaf));
}

#[test]
fn test_link_mask_filters_traversal() {
    let fx = Fixture::new();
    let texture = fx.add("texture", StaticContent::new("Texture"));
    let base = fx.add("base", material(&[texture]));
    let derived = fx.add(
        "derived",
        StaticContent::new("Material").with_reference(refers(base, LinkType::INHERITANCE)),
    );

    let set = fx
        .graph
        .compute_dependencies(
            derived,
            SearchOptions::OUT | SearchOptions::RECURSIVE,
            LinkType::REFERENCE,
            None,
        )
        .unwrap();
    assert!(set.links_out.is_empty());

    let set = fx
        .graph
        .compute_dependencies(
            derived,
            SearchOptions::OUT | SearchOptions::RECURSIVE,
            LinkType::all(),
            None,
        )
        .unwrap();
    assert_eq!(set.links_out.len(), 2);
}

#[test]
fn test_caller_visited_set_is_shared() {
    let fx = Fixture::new();
    let leaf = fx.add("leaf", StaticContent::new("Texture"));
    let root = fx.add("root", material(&[leaf]));

    let mut visited = HashSet::new();
    let options = SearchOptions::OUT | SearchOptions::RECURSIVE;
    fx.graph
        .compute_dependencies(root, options, LinkType::all(), Some(&mut visited))
        .unwrap();
    assert!(visited.contains(&root));
    assert!(visited.contains(&leaf));

    let again = fx
        .graph
        .compute_dependencies(root, options, LinkType::all(), Some(&mut visited))
        .unwrap();
    assert!(again.links_out.is_empty());
}

#[test]
fn test_unknown_asset_is_an_error() {
    let fx = Fixture::new();
    let result = fx
        .graph
        .compute_dependencies(Uuid::new_v4(), SearchOptions::ALL, LinkType::all(), None);
    assert!(result.is_err());
}

#[test]
fn test_untracked_asset_is_computed_on_the_fly() {
    let fx = Fixture::new();
    let texture = fx.add("texture", StaticContent::new("Texture"));
    let mat = fx.add("material", material(&[texture]));
    let user = fx.add("user", material(&[mat]));

    assert!(fx.graph.untrack(mat));
    assert!(!fx.graph.is_tracked(mat));

    let set = fx
        .graph
        .compute_dependencies(mat, SearchOptions::ALL, LinkType::all(), None)
        .unwrap();
    assert_eq!(set.out_ids(), vec![texture]);
    assert!(set.links_in.is_empty());
    assert!(!fx.graph.is_tracked(mat));

    let user_set = fx.graph.find_dependency_set(user).unwrap();
    assert!(user_set.broken_links_out.contains_key(&ReferenceKey::Id(mat)));
    let texture_set = fx.graph.find_dependency_set(texture).unwrap();
    assert!(texture_set.links_in.is_empty());
}

#[test]
fn test_dirty_recompute_replaces_out_links() {
    let fx = Fixture::new();
    let old_target = fx.add("old", StaticContent::new("Texture"));
    let new_target = fx.add("new", StaticContent::new("Texture"));
    let x = fx.add("x", material(&[old_target]));
    let mut events = fx.graph.subscribe();

    let was_dirty = fx
        .session
        .replace_content(x, material(&[new_target]).into_arc())
        .unwrap();
    fx.graph.on_asset_dirty_changed(x, was_dirty, true);

    let set = fx.graph.find_dependency_set(x).unwrap();
    assert_eq!(set.out_ids(), vec![new_target]);
    assert!(fx
        .graph
        .find_dependency_set(old_target)
        .unwrap()
        .links_in
        .is_empty());
    assert_eq!(
        fx.graph.find_dependency_set(new_target).unwrap().in_ids(),
        vec![x]
    );

    let event = tokio_test::block_on(events.recv()).unwrap();
    assert_eq!(event.asset_id, x);
    assert!(!event.old_value);
    assert!(event.new_value);
}

#[test]
fn test_recompute_without_change_is_stable() {
    let fx = Fixture::new();
    let a = fx.add("a", StaticContent::new("Texture"));
    let missing = Uuid::new_v4();
    let x = fx.add("x", material(&[a, missing]));

    let before = fx.graph.find_dependency_set(x).unwrap();
    fx.session.set_dirty(x, true).unwrap();
    fx.graph.on_asset_dirty_changed(x, false, true);
    let after = fx.graph.find_dependency_set(x).unwrap();

    let link_types = |set: &assetgraph_graph::DependencySet| -> Vec<(AssetId, LinkType)> {
        set.links_out
            .values()
            .map(|link| (link.id(), link.link_type))
            .collect()
    };
    assert_eq!(link_types(&before), link_types(&after));
    assert_eq!(link_types(&after), vec![(a, LinkType::REFERENCE)]);
    assert_eq!(before.broken_links_out, after.broken_links_out);
    assert_eq!(fx.graph.find_dependency_set(a).unwrap().in_ids(), vec![x]);
    assert_eq!(fx.graph.find_assets_with_missing_references(), vec![x]);
}

#[test]
fn test_dirty_changes_ignored_while_saving() {
    let fx = Fixture::new();
    let a = fx.add("a", StaticContent::new("Texture"));
    let x = fx.add("x", material(&[]));

    fx.graph.begin_saving_session();
    fx.session
        .replace_content(x, material(&[a]).into_arc())
        .unwrap();
    fx.graph.on_asset_dirty_changed(x, false, true);
    assert!(fx.graph.find_dependency_set(x).unwrap().links_out.is_empty());
    fx.graph.end_saving_session();

    fx.graph.on_asset_dirty_changed(x, false, true);
    assert_eq!(fx.graph.find_dependency_set(x).unwrap().out_ids(), vec![a]);
}

#[test]
fn test_inheritance_query() {
    let fx = Fixture::new();
    let base = fx.add("base", StaticContent::new("Prefab"));
    let derived = fx.add(
        "derived",
        StaticContent::new("Prefab").with_reference(refers(base, LinkType::INHERITANCE)),
    );
    let composed = fx.add(
        "composed",
        StaticContent::new("Prefab")
            .with_reference(refers(base, LinkType::COMPOSITION_INHERITANCE)),
    );
    fx.add("user", StaticContent::new("Prefab").with_reference(refers(base, LinkType::REFERENCE)));

    let ids = |options: InheritanceSearchOptions| -> HashSet<AssetId> {
        fx.graph
            .find_assets_inheriting_from(base, options)
            .into_iter()
            .map(|record| record.id)
            .collect()
    };
    assert_eq!(ids(InheritanceSearchOptions::BASE), [derived].into());
    assert_eq!(ids(InheritanceSearchOptions::COMPOSITION), [composed].into());
    assert_eq!(ids(InheritanceSearchOptions::ALL), [derived, composed].into());
}

#[test]
fn test_reference_to_part_links_owner() {
    let fx = Fixture::new();
    let part = Uuid::new_v4();
    let owner = fx.add("owner", StaticContent::new("Prefab").with_part(part));
    let user = fx.add("user", material(&[part]));

    assert_eq!(fx.graph.find_dependency_set(user).unwrap().out_ids(), vec![owner]);
    assert_eq!(fx.graph.find_dependency_set(owner).unwrap().in_ids(), vec![user]);
}

#[test]
fn test_part_reference_heals_when_owner_appears() {
    let fx = Fixture::new();
    let part = Uuid::new_v4();
    let user = fx.add("user", material(&[part]));
    assert!(fx.graph.has_missing_references());

    let owner = fx.add("owner", StaticContent::new("Prefab").with_part(part));
    assert_eq!(fx.graph.find_dependency_set(user).unwrap().out_ids(), vec![owner]);
    assert!(!fx.graph.has_missing_references());
}

#[test]
fn test_package_removal_breaks_cross_package_links() {
    let fx = Fixture::new();
    let library = Uuid::new_v4();
    fx.session.add_package(library);
    let shared = Uuid::new_v4();
    fx.session
        .add_asset(AssetRecord::new(
            shared,
            "lib/texture",
            library,
            StaticContent::new("Texture").into_arc(),
        ))
        .unwrap();
    let user = fx.add("user", material(&[shared]));
    fx.graph.on_package_added(library);
    assert_eq!(fx.graph.find_dependency_set(user).unwrap().out_ids(), vec![shared]);

    fx.session.remove_package(library);
    fx.graph.on_package_removed(library);

    assert!(!fx.graph.is_tracked(shared));
    let missing = fx.graph.find_missing_references(user);
    assert_eq!(missing, vec![ContentReference::new(shared, "lib/texture")]);
}

#[test]
fn test_assets_reset_retracks_package() {
    let fx = Fixture::new();
    let a = fx.add("a", StaticContent::new("Texture"));
    let x = fx.add("x", material(&[a]));

    fx.session.remove_asset(a);
    let b = Uuid::new_v4();
    fx.session
        .add_asset(AssetRecord::new(
            b,
            "b",
            fx.package,
            StaticContent::new("Texture").into_arc(),
        ))
        .unwrap();
    fx.graph.on_assets_reset(fx.package);

    assert!(!fx.graph.is_tracked(a));
    assert!(fx.graph.is_tracked(b));
    assert!(fx.graph.is_tracked(x));
    assert!(fx
        .graph
        .find_dependency_set(x)
        .unwrap()
        .broken_links_out
        .contains_key(&ReferenceKey::Id(a)));
}

#[test]
fn test_packages_replaced_syncs_with_session() {
    let fx = Fixture::new();
    let a = fx.add("a", StaticContent::new("Texture"));
    assert_eq!(fx.graph.tracked_asset_count(), 1);

    let other = Uuid::new_v4();
    fx.session.remove_package(fx.package);
    fx.session.add_package(other);
    let b = Uuid::new_v4();
    fx.session
        .add_asset(AssetRecord::new(
            b,
            "b",
            other,
            StaticContent::new("Texture").into_arc(),
        ))
        .unwrap();
    fx.graph.on_packages_replaced();

    assert!(!fx.graph.is_tracked(a));
    assert!(fx.graph.is_tracked(b));
    assert_eq!(fx.graph.tracked_asset_count(), 1);
}

#[test]
fn test_tracking_late_asset_resolves_broken_link() {
    let fx = Fixture::new();
    let y = Uuid::new_v4();
    let x = fx.add("x", material(&[y]));
    let set = fx
        .graph
        .compute_dependencies(x, SearchOptions::OUT, LinkType::all(), None)
        .unwrap();
    assert!(set.links_out.is_empty());

    // The session learns about y without notifying the graph.
    fx.session
        .add_asset(AssetRecord::new(
            y,
            "y",
            fx.package,
            StaticContent::new("Texture").into_arc(),
        ))
        .unwrap();
    let set = fx
        .graph
        .compute_dependencies(x, SearchOptions::OUT, LinkType::all(), None)
        .unwrap();
    assert!(set.links_out.is_empty());
    assert!(set.broken_links_out.contains_key(&ReferenceKey::Id(y)));

    assert!(fx.graph.track(y).unwrap());
    assert!(!fx.graph.track(y).unwrap());
    let set = fx
        .graph
        .compute_dependencies(x, SearchOptions::OUT, LinkType::all(), None)
        .unwrap();
    assert_eq!(set.out_ids(), vec![y]);
    assert!(set.broken_links_out.is_empty());
    assert!(!fx.graph.has_missing_references());
}

#[test]
fn test_queries_during_concurrent_recompute() {
    let session = Arc::new(InMemorySession::new());
    let package = Uuid::new_v4();
    session.add_package(package);
    let graph = Arc::new(DependencyGraph::with_session(session.clone()));
    let add = |location: &str, content: StaticContent| {
        let id = Uuid::new_v4();
        session
            .add_asset(AssetRecord::new(id, location, package, content.into_arc()))
            .unwrap();
        graph.on_asset_added(id);
        id
    };
    let a = add("a", StaticContent::new("Texture"));
    let b = add("b", StaticContent::new("Texture"));
    let x = add("x", material(&[a]));

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let graph = graph.clone();
            thread::spawn(move || {
                for _ in 0..200 {
                    let set = graph
                        .compute_dependencies(x, SearchOptions::OUT, LinkType::all(), None)
                        .unwrap();
                    let out = set.out_ids();
                    assert!(out == vec![a] || out == vec![b], "unexpected out links {:?}", out);
                    assert!(set.broken_links_out.is_empty());
                }
            })
        })
        .collect();

    for round in 0..100 {
        let target = if round % 2 == 0 { b } else { a };
        let was_dirty = session
            .replace_content(x, material(&[target]).into_arc())
            .unwrap();
        graph.on_asset_dirty_changed(x, was_dirty, true);
    }
    for reader in readers {
        reader.join().unwrap();
    }

    let set = graph.find_dependency_set(x).unwrap();
    assert_eq!(set.out_ids(), vec![a]);
    assert_eq!(graph.find_dependency_set(a).unwrap().in_ids(), vec![x]);
    assert!(graph.find_dependency_set(b).unwrap().in_ids().is_empty());
}
