use assetgraph_core::{
    AssetId, AssetRecord, ContentHash, ContentReferenceExtractor, InMemorySession,
    AssetFileChangeKind, AssetFileChangedEvent, SourceChangeTracker, SourceFileMember,
    StaticContent, TrackerConfig,
};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use uuid::Uuid;

const TIMEOUT: Duration = Duration::from_secs(10);

fn live_config() -> TrackerConfig {
    TrackerConfig {
        tracking_interval_ms: 20,
        enable_tracking: true,
        ..TrackerConfig::default()
    }
}

fn track_model(session: &Arc<InMemorySession>, source: &Path) -> (SourceChangeTracker, AssetId) {
    let package = Uuid::new_v4();
    session.add_package(package);
    let id = Uuid::new_v4();
    let content = StaticContent::new("Model").with_source_file(SourceFileMember::new(source, true));
    session
        .add_asset(AssetRecord::new(id, "models/crate", package, content.into_arc()))
        .unwrap();
    let tracker = SourceChangeTracker::new(
        session.clone(),
        Arc::new(ContentReferenceExtractor),
        &live_config(),
    )
    .unwrap();
    assert_eq!(tracker.tracked_asset_count(), 1);
    assert!(tracker.wait_for_idle(TIMEOUT));
    (tracker, id)
}

/// Polls until `predicate` holds for the events collected so far.
fn collect_until(
    tracker: &SourceChangeTracker,
    predicate: impl Fn(&[AssetFileChangedEvent]) -> bool,
) -> Vec<AssetFileChangedEvent> {
    let deadline = Instant::now() + TIMEOUT;
    let mut events = Vec::new();
    while Instant::now() < deadline {
        events.extend(tracker.drain_events());
        if predicate(&events) {
            break;
        }
        thread::sleep(Duration::from_millis(25));
    }
    events
}

#[test]
fn test_live_update_is_reported() {
    let tmp = TempDir::new().unwrap();
    let source = tmp.path().join("crate.fbx");
    fs::write(&source, b"v1").unwrap();
    let session = Arc::new(InMemorySession::new());
    let (tracker, id) = track_model(&session, &source);
    assert!(tracker.is_tracking_enabled());

    fs::write(&source, b"v2").unwrap();
    let expected = ContentHash::of_bytes(b"v2");
    let events = collect_until(&tracker, |events| events.iter().any(|e| e.hash == Some(expected)));

    let event = events
        .iter()
        .find(|e| e.hash == Some(expected))
        .expect("update event");
    assert_eq!(event.asset_id, Some(id));
    assert_eq!(event.kind, AssetFileChangeKind::SourceUpdated);
    assert_eq!(event.location, "models/crate");
    tracker.dispose();
}

#[test]
fn test_live_delete_is_reported() {
    let tmp = TempDir::new().unwrap();
    let source = tmp.path().join("crate.fbx");
    fs::write(&source, b"v1").unwrap();
    let session = Arc::new(InMemorySession::new());
    let (tracker, id) = track_model(&session, &source);

    fs::remove_file(&source).unwrap();
    let events = collect_until(&tracker, |events| {
        events.iter().any(|e| e.kind == AssetFileChangeKind::SourceDeleted)
    });

    let event = events
        .iter()
        .find(|e| e.kind == AssetFileChangeKind::SourceDeleted)
        .expect("delete event");
    assert_eq!(event.asset_id, Some(id));
    assert_eq!(event.hash, Some(ContentHash::EMPTY));
    tracker.dispose();
}

#[test]
fn test_disable_tracking_stops_reporting() {
    let tmp = TempDir::new().unwrap();
    let source = tmp.path().join("crate.fbx");
    fs::write(&source, b"v1").unwrap();
    let session = Arc::new(InMemorySession::new());
    let (tracker, _) = track_model(&session, &source);

    tracker.disable_tracking();
    assert!(!tracker.is_tracking_enabled());
    fs::write(&source, b"v2").unwrap();
    thread::sleep(Duration::from_millis(300));
    assert!(tracker.drain_events().is_empty());
    tracker.dispose();
}

#[test]
fn test_live_asset_file_edit_is_reported() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().canonicalize().unwrap();
    fs::create_dir_all(root.join("props")).unwrap();
    let file = root.join("props").join("barrel.asset");
    fs::write(&file, b"v1").unwrap();

    let session = Arc::new(InMemorySession::new());
    let package = Uuid::new_v4();
    session.add_package(package);
    session.set_package_root(package, &root).unwrap();
    session.add_asset_extension(".asset");
    let id = Uuid::new_v4();
    session
        .add_asset(AssetRecord::new(
            id,
            "props/barrel",
            package,
            StaticContent::new("Prop").into_arc(),
        ))
        .unwrap();
    let tracker = SourceChangeTracker::new(
        session.clone(),
        Arc::new(ContentReferenceExtractor),
        &live_config(),
    )
    .unwrap();
    assert_eq!(tracker.tracked_package_roots(), vec![root.clone()]);
    thread::sleep(Duration::from_millis(100));

    fs::write(&file, b"v2").unwrap();
    let events = collect_until(&tracker, |events| {
        events.iter().any(|e| e.asset_id == Some(id))
    });
    let event = events
        .iter()
        .find(|e| e.asset_id == Some(id))
        .expect("asset file event");
    assert_eq!(event.location, "props/barrel");
    assert!(!event.kind.is_source());
    assert_eq!(event.hash, None);
    tracker.dispose();
}
