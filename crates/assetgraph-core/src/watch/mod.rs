mod directory_watcher;
mod events;

pub use directory_watcher::{normalize_path, DirectoryWatcher};
pub use events::{
    squash_events, AssetFileChangeKind, AssetFileChangedEvent, FileEventKind, RawFileEvent,
};

use chrono::Utc;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    AssetGraphError, AssetId, AssetRecord, AssetSession, ContentHash, ContentReferenceExtractor,
    PackageId, ReferenceExtractor, Result, TrackerConfig,
};

/// Tracking state of one source file for one asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFileRecord {
    pub path: PathBuf,
    pub notify_on_change: bool,
    /// Last hash known for this asset; `None` until the first observation.
    pub last_hash: Option<ContentHash>,
}

#[derive(Debug)]
struct TrackedAsset {
    package: PackageId,
    location: String,
    sources: BTreeMap<PathBuf, SourceFileRecord>,
}

#[derive(Default)]
struct TrackerState {
    initialized: bool,
    saving: bool,
    packages: BTreeSet<PackageId>,
    assets: HashMap<AssetId, TrackedAsset>,
    path_to_assets: HashMap<PathBuf, BTreeSet<AssetId>>,
    current_hashes: HashMap<PathBuf, ContentHash>,
    /// Latest hash job scheduled per path; older results are discarded.
    hash_generations: HashMap<PathBuf, u64>,
    package_roots: HashMap<PackageId, PathBuf>,
    pending: Vec<AssetFileChangedEvent>,
    files_being_saved: HashSet<PathBuf>,
    watcher: Option<DirectoryWatcher>,
}

struct TrackerShared {
    session: Arc<dyn AssetSession>,
    extractor: Arc<dyn ReferenceExtractor>,
    state: Mutex<TrackerState>,
    paused: AtomicBool,
    disposed: AtomicBool,
    interval_ms: AtomicU64,
    cancel: CancellationToken,
    hash_pool: rayon::ThreadPool,
    in_flight: Mutex<usize>,
    idle: Condvar,
    raw_tx: Sender<RawFileEvent>,
    raw_rx: Receiver<RawFileEvent>,
}

struct ChangeLoop {
    shutdown: Sender<()>,
    thread: JoinHandle<()>,
}

/// Tracks the files behind the assets of a session and reports changes to them.
///
/// Two kinds of files are watched: the asset files under each package root, and the
/// on-disk source files assets were imported from. Filesystem notifications are queued
/// and drained by a background loop every tracking interval. Asset file notifications
/// become events directly. Each touched source file is hashed on a worker pool, and an
/// event is queued only when the hash differs from the last one known for an asset.
/// Events wait until [`SourceChangeTracker::drain_events`] collects them.
pub struct SourceChangeTracker {
    shared: Arc<TrackerShared>,
    change_loop: Mutex<Option<ChangeLoop>>,
}

impl SourceChangeTracker {
    pub fn new(
        session: Arc<dyn AssetSession>,
        extractor: Arc<dyn ReferenceExtractor>,
        config: &TrackerConfig,
    ) -> Result<Self> {
        if config.tracking_interval_ms == 0 {
            return Err(AssetGraphError::InvalidArgument(
                "tracking interval must be > 0".to_string(),
            ));
        }
        let hash_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.hash_threads.max(1))
            .thread_name(|i| format!("assetgraph-hash-{}", i))
            .build()
            .map_err(|e| AssetGraphError::Threading(e.to_string()))?;
        let (raw_tx, raw_rx) = bounded(config.event_channel_capacity.max(1));

        let tracker = Self {
            shared: Arc::new(TrackerShared {
                session,
                extractor,
                state: Mutex::new(TrackerState::default()),
                paused: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
                interval_ms: AtomicU64::new(config.tracking_interval_ms),
                cancel: CancellationToken::new(),
                hash_pool,
                in_flight: Mutex::new(0),
                idle: Condvar::new(),
                raw_tx,
                raw_rx,
            }),
            change_loop: Mutex::new(None),
        };
        if config.enable_tracking {
            tracker.enable_tracking()?;
        }
        Ok(tracker)
    }

    pub fn with_defaults(session: Arc<dyn AssetSession>) -> Result<Self> {
        Self::new(
            session,
            Arc::new(ContentReferenceExtractor),
            &TrackerConfig::default(),
        )
    }

    /// Starts the filesystem watcher and the change loop.
    ///
    /// Every known source is watched again and rehashed.
    pub fn enable_tracking(&self) -> Result<()> {
        if self.shared.is_disposed() {
            return Err(AssetGraphError::Disposed);
        }
        let mut change_loop = self.change_loop.lock();
        {
            let mut state = self.shared.lock_initialized();
            if state.watcher.is_none() {
                let mut watcher = DirectoryWatcher::new(self.shared.raw_tx.clone())?;
                for root in state.package_roots.values() {
                    watcher.track_root(root);
                }
                let paths: Vec<PathBuf> = state.path_to_assets.keys().cloned().collect();
                for path in &paths {
                    watcher.track(path);
                }
                state.watcher = Some(watcher);
                for path in paths {
                    let generation = next_generation(&mut state, &path);
                    self.shared.schedule_hash(path, generation);
                }
            }
        }
        if change_loop.is_none() {
            let (shutdown, shutdown_rx) = bounded::<()>(1);
            let weak = Arc::downgrade(&self.shared);
            let thread = std::thread::Builder::new()
                .name("assetgraph-change-loop".to_string())
                .spawn(move || run_change_loop(weak, shutdown_rx))
                .map_err(|e| AssetGraphError::Threading(e.to_string()))?;
            *change_loop = Some(ChangeLoop { shutdown, thread });
            info!("source change tracking enabled");
        }
        Ok(())
    }

    /// Stops watching the filesystem and joins the change loop.
    pub fn disable_tracking(&self) {
        let mut change_loop = self.change_loop.lock();
        let watcher = self.shared.state.lock().watcher.take();
        drop(watcher);
        if let Some(running) = change_loop.take() {
            let _ = running.shutdown.send(());
            if running.thread.join().is_err() {
                warn!("change loop thread panicked");
            }
            info!("source change tracking disabled");
        }
    }

    pub fn is_tracking_enabled(&self) -> bool {
        self.change_loop.lock().is_some()
    }

    /// While paused, detected changes are absorbed into the known hashes without queuing events.
    pub fn set_tracking_paused(&self, paused: bool) {
        self.shared.paused.store(paused, Ordering::SeqCst);
    }

    pub fn is_tracking_paused(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }

    pub fn tracking_interval(&self) -> Duration {
        Duration::from_millis(self.shared.interval_ms.load(Ordering::Relaxed))
    }

    pub fn set_tracking_interval(&self, interval: Duration) -> Result<()> {
        let ms = interval.as_millis() as u64;
        if ms == 0 {
            return Err(AssetGraphError::InvalidArgument(
                "tracking interval must be > 0".to_string(),
            ));
        }
        self.shared.interval_ms.store(ms, Ordering::Relaxed);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.state.lock().initialized
    }

    pub fn on_package_added(&self, package: PackageId) {
        if self.shared.is_disposed() {
            return;
        }
        let mut state = self.shared.lock_initialized();
        self.shared.track_package(&mut state, package);
    }

    pub fn on_package_removed(&self, package: PackageId) {
        if self.shared.is_disposed() {
            return;
        }
        let mut state = self.shared.lock_initialized();
        self.shared.untrack_package(&mut state, package);
    }

    /// Reconciles tracked packages with the session after a bulk replacement.
    pub fn on_packages_replaced(&self) {
        if self.shared.is_disposed() {
            return;
        }
        let mut state = self.shared.lock_initialized();
        let current: BTreeSet<PackageId> = self.shared.session.packages().into_iter().collect();
        let stale: Vec<PackageId> = state.packages.difference(&current).copied().collect();
        for package in stale {
            self.shared.untrack_package(&mut state, package);
        }
        for package in current {
            self.shared.track_package(&mut state, package);
        }
    }

    pub fn on_asset_added(&self, id: AssetId) {
        if self.shared.is_disposed() {
            return;
        }
        let mut state = self.shared.lock_initialized();
        if let Some(record) = self.shared.session.find_asset(id) {
            self.shared.track_asset(&mut state, &record);
        }
    }

    pub fn on_asset_removed(&self, id: AssetId) {
        if self.shared.is_disposed() {
            return;
        }
        let mut state = self.shared.lock_initialized();
        self.shared.untrack_asset(&mut state, id);
    }

    /// Re-synchronizes every asset of `package` with the session.
    pub fn on_assets_reset(&self, package: PackageId) {
        if self.shared.is_disposed() {
            return;
        }
        let mut state = self.shared.lock_initialized();
        let previous: Vec<AssetId> = state
            .assets
            .iter()
            .filter(|(_, asset)| asset.package == package)
            .map(|(id, _)| *id)
            .collect();
        for id in previous {
            self.shared.untrack_asset(&mut state, id);
        }
        for record in self.shared.session.assets_in_package(package) {
            self.shared.track_asset(&mut state, &record);
        }
    }

    /// Refreshes the source files of an asset when it becomes dirty.
    pub fn on_asset_dirty_changed(&self, id: AssetId, old_value: bool, new_value: bool) {
        if self.shared.is_disposed() || !new_value {
            return;
        }
        let mut state = self.shared.lock_initialized();
        if state.saving || !state.assets.contains_key(&id) {
            return;
        }
        debug!("asset {} dirty ({} -> {}), refreshing sources", id, old_value, new_value);
        if let Some(record) = self.shared.session.find_asset(id) {
            self.shared.track_asset(&mut state, &record);
        }
    }

    pub fn begin_saving_session(&self) {
        self.shared.state.lock().saving = true;
    }

    /// Registers a file written by the session save so its next filesystem event is ignored.
    pub fn add_file_being_saved(&self, path: &Path) -> Result<()> {
        let mut state = self.shared.state.lock();
        if !state.saving {
            return Err(AssetGraphError::InvalidArgument(
                "files can only be registered between begin_saving_session and end_saving_session"
                    .to_string(),
            ));
        }
        state.files_being_saved.insert(normalize_path(path));
        Ok(())
    }

    pub fn end_saving_session(&self) {
        self.shared.state.lock().saving = false;
    }

    /// Queues a raw filesystem notification as if the watcher had reported it.
    pub fn notify_file_event(&self, path: &Path, kind: FileEventKind) {
        if self.shared.is_disposed() {
            return;
        }
        let raw = RawFileEvent {
            path: normalize_path(path),
            kind,
        };
        if let Err(TrySendError::Full(raw)) = self.shared.raw_tx.try_send(raw) {
            warn!("file event channel full, dropping event for {:?}", raw.path);
        }
    }

    /// Runs one iteration of the change loop on the calling thread.
    pub fn process_file_events(&self) {
        self.shared.process_raw_events();
    }

    /// Returns and clears the pending events, squashed per asset.
    pub fn drain_events(&self) -> Vec<AssetFileChangedEvent> {
        if self.shared.is_disposed() {
            return Vec::new();
        }
        let pending = std::mem::take(&mut self.shared.lock_initialized().pending);
        squash_events(pending)
    }

    pub fn has_pending_events(&self) -> bool {
        !self.shared.lock_initialized().pending.is_empty()
    }

    /// Package root directories currently watched for asset file changes.
    pub fn tracked_package_roots(&self) -> Vec<PathBuf> {
        let state = self.shared.lock_initialized();
        let mut roots: Vec<PathBuf> = state.package_roots.values().cloned().collect();
        roots.sort();
        roots
    }

    pub fn find_asset_ids_by_source(&self, path: &Path) -> Vec<AssetId> {
        let state = self.shared.lock_initialized();
        state
            .path_to_assets
            .get(&normalize_path(path))
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn current_hash(&self, path: &Path) -> Option<ContentHash> {
        let state = self.shared.lock_initialized();
        state.current_hashes.get(&normalize_path(path)).copied()
    }

    pub fn tracked_source_files(&self, id: AssetId) -> Vec<SourceFileRecord> {
        let state = self.shared.lock_initialized();
        state
            .assets
            .get(&id)
            .map(|asset| asset.sources.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn tracked_asset_count(&self) -> usize {
        self.shared.lock_initialized().assets.len()
    }

    /// Blocks until no hash computation is in flight. Returns false on timeout.
    pub fn wait_for_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut in_flight = self.shared.in_flight.lock();
        while *in_flight > 0 {
            if self.shared.idle.wait_until(&mut in_flight, deadline).timed_out() {
                return *in_flight == 0;
            }
        }
        true
    }

    /// Cancels in-flight hashing and stops tracking. Later calls become no-ops.
    pub fn dispose(&self) {
        if self.shared.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.cancel.cancel();
        self.disable_tracking();
        debug!("source change tracker disposed");
    }
}

impl Drop for SourceChangeTracker {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl TrackerShared {
    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn lock_initialized(self: &Arc<Self>) -> MutexGuard<'_, TrackerState> {
        let mut state = self.state.lock();
        if !state.initialized && !self.is_disposed() {
            for package in self.session.packages() {
                self.track_package(&mut state, package);
            }
            state.initialized = true;
            debug!("source tracker initialized with {} assets", state.assets.len());
        }
        state
    }

    fn track_package(self: &Arc<Self>, state: &mut TrackerState, package: PackageId) {
        if !state.packages.insert(package) {
            return;
        }
        if let Some(root) = self.session.package_root(package) {
            let root = root.canonicalize().unwrap_or(root);
            if let Some(watcher) = state.watcher.as_mut() {
                watcher.track_root(&root);
            }
            state.package_roots.insert(package, root);
        }
        for record in self.session.assets_in_package(package) {
            if self.is_disposed() {
                return;
            }
            self.track_asset(state, &record);
        }
    }

    fn untrack_package(&self, state: &mut TrackerState, package: PackageId) {
        if !state.packages.remove(&package) {
            return;
        }
        if let Some(root) = state.package_roots.remove(&package) {
            if let Some(watcher) = state.watcher.as_mut() {
                watcher.untrack_root(&root);
            }
        }
        let ids: Vec<AssetId> = state
            .assets
            .iter()
            .filter(|(_, asset)| asset.package == package)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            self.untrack_asset(state, id);
        }
    }

    /// Diffs the asset's source files against the previous set and schedules hashes for
    /// new, newly notifying, or re-recorded paths.
    fn track_asset(self: &Arc<Self>, state: &mut TrackerState, record: &AssetRecord) {
        let mut members: BTreeMap<PathBuf, SourceFileRecord> = BTreeMap::new();
        let mut recorded: HashMap<PathBuf, ContentHash> = HashMap::new();
        for member in self.extractor.extract_source_files(record) {
            let path = normalize_path(&member.path);
            if let Some(hash) = member.recorded_hash {
                recorded.insert(path.clone(), hash);
            }
            members
                .entry(path.clone())
                .and_modify(|existing| existing.notify_on_change |= member.notify_on_change)
                .or_insert(SourceFileRecord {
                    path,
                    notify_on_change: member.notify_on_change,
                    last_hash: None,
                });
        }

        let previous = state
            .assets
            .remove(&record.id)
            .map(|asset| asset.sources)
            .unwrap_or_default();

        for path in previous.keys() {
            if !members.contains_key(path) {
                Self::unlink_path(state, record.id, path);
            }
        }

        let mut to_hash = Vec::new();
        for (path, source) in members.iter_mut() {
            let new_hash = recorded.get(path).copied();
            match previous.get(path) {
                Some(old) => {
                    source.last_hash = new_hash.or(old.last_hash);
                    let activated = source.notify_on_change && !old.notify_on_change;
                    let rerecorded = new_hash.is_some() && new_hash != old.last_hash;
                    if activated || rerecorded {
                        to_hash.push(path.clone());
                    }
                }
                None => {
                    source.last_hash = new_hash;
                    Self::link_path(state, record.id, path);
                    to_hash.push(path.clone());
                }
            }
        }

        state.assets.insert(
            record.id,
            TrackedAsset {
                package: record.package,
                location: record.location.clone(),
                sources: members,
            },
        );
        for path in to_hash {
            let generation = next_generation(state, &path);
            self.schedule_hash(path, generation);
        }
    }

    fn untrack_asset(&self, state: &mut TrackerState, id: AssetId) {
        let Some(asset) = state.assets.remove(&id) else {
            return;
        };
        for path in asset.sources.keys() {
            Self::unlink_path(state, id, path);
        }
    }

    fn link_path(state: &mut TrackerState, id: AssetId, path: &Path) {
        let ids = state.path_to_assets.entry(path.to_path_buf()).or_default();
        let first = ids.is_empty();
        ids.insert(id);
        if first {
            if let Some(watcher) = state.watcher.as_mut() {
                watcher.track(path);
            }
        }
    }

    fn unlink_path(state: &mut TrackerState, id: AssetId, path: &Path) {
        let Some(ids) = state.path_to_assets.get_mut(path) else {
            return;
        };
        ids.remove(&id);
        if !ids.is_empty() {
            return;
        }
        state.path_to_assets.remove(path);
        state.current_hashes.remove(path);
        state.hash_generations.remove(path);
        if let Some(watcher) = state.watcher.as_mut() {
            watcher.untrack(path);
        }
    }

    fn schedule_hash(self: &Arc<Self>, path: PathBuf, generation: u64) {
        if self.cancel.is_cancelled() {
            return;
        }
        *self.in_flight.lock() += 1;
        let absorb = self.paused.load(Ordering::SeqCst);
        let weak = Arc::downgrade(self);
        let token = self.cancel.clone();
        self.hash_pool.spawn(move || {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            if !token.is_cancelled() {
                let hash = ContentHash::of_file_or_empty(&path);
                if !token.is_cancelled() {
                    shared.apply_hash(&path, hash, absorb, generation);
                }
            }
            shared.hash_finished();
        });
    }

    fn hash_finished(&self) {
        let mut in_flight = self.in_flight.lock();
        *in_flight = in_flight.saturating_sub(1);
        if *in_flight == 0 {
            self.idle.notify_all();
        }
    }

    /// Compares a fresh hash with the last one known by each asset importing `path`.
    ///
    /// Hashes scheduled or completed while paused update the baseline without queuing events.
    /// A result is dropped when a newer hash of the same path has been scheduled since.
    fn apply_hash(&self, path: &Path, hash: ContentHash, absorb: bool, generation: u64) {
        if self.is_disposed() {
            return;
        }
        let paused = absorb || self.paused.load(Ordering::SeqCst);
        let mut state = self.state.lock();
        if state.hash_generations.get(path) != Some(&generation) {
            debug!("dropping stale hash of {:?}", path);
            return;
        }
        let Some(ids) = state.path_to_assets.get(path).cloned() else {
            return;
        };
        state.current_hashes.insert(path.to_path_buf(), hash);

        let mut events = Vec::new();
        for id in ids {
            let Some(asset) = state.assets.get_mut(&id) else {
                continue;
            };
            let Some(source) = asset.sources.get_mut(path) else {
                continue;
            };
            let previous = source.last_hash.replace(hash);
            match previous {
                // First observation only sets the baseline.
                None => continue,
                Some(previous) if previous == hash => continue,
                Some(_) => {}
            }
            if !source.notify_on_change || paused {
                continue;
            }
            events.push(AssetFileChangedEvent {
                asset_id: Some(id),
                package: asset.package,
                location: asset.location.clone(),
                path: path.to_path_buf(),
                kind: AssetFileChangeKind::from_source_hash(&hash),
                hash: Some(hash),
                detected_at: Utc::now(),
            });
        }
        if !events.is_empty() {
            debug!("{} source change(s) detected for {:?}", events.len(), path);
            state.pending.extend(events);
        }
    }

    /// Drains queued raw notifications.
    ///
    /// Tracked source files are scheduled for hashing. Asset files under a package root
    /// become events right away, unless tracking is paused. Files registered as being
    /// saved are skipped for the batch that reports them.
    fn process_raw_events(self: &Arc<Self>) {
        let raw: Vec<RawFileEvent> = self.raw_rx.try_iter().collect();
        if raw.is_empty() || self.is_disposed() {
            return;
        }
        let paused = self.paused.load(Ordering::SeqCst);

        let mut to_hash = Vec::new();
        {
            let mut state = self.state.lock();
            let mut hashed = HashSet::new();
            let mut events = Vec::new();
            for event in &raw {
                if state.files_being_saved.contains(&event.path) {
                    continue;
                }
                if state.path_to_assets.contains_key(&event.path) {
                    if hashed.insert(event.path.clone()) {
                        let generation = next_generation(&mut state, &event.path);
                        to_hash.push((event.path.clone(), generation));
                    }
                    continue;
                }
                if paused {
                    continue;
                }
                if let Some(change) = self.asset_file_event(&state, event) {
                    events.push(change);
                }
            }
            for event in &raw {
                state.files_being_saved.remove(&event.path);
            }
            if !events.is_empty() {
                debug!("{} asset file change(s) detected", events.len());
                state.pending.extend(events);
            }
        }
        for (path, generation) in to_hash {
            self.schedule_hash(path, generation);
        }
    }

    /// Maps a notification under a package root to an asset file event.
    ///
    /// The deepest root containing the file decides the package. The location is the
    /// path relative to that root, without extension, with `/` separators.
    fn asset_file_event(
        &self,
        state: &TrackerState,
        event: &RawFileEvent,
    ) -> Option<AssetFileChangedEvent> {
        if event.path.is_dir() || !self.session.is_asset_file(&event.path) {
            return None;
        }
        let (package, root) = state
            .package_roots
            .iter()
            .filter(|(_, root)| event.path.starts_with(root))
            .max_by_key(|(_, root)| root.components().count())?;
        let relative = event.path.strip_prefix(root).ok()?.with_extension("");
        let location = relative
            .components()
            .map(|component| component.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if location.is_empty() {
            return None;
        }
        let asset_id = self
            .session
            .assets_in_package(*package)
            .into_iter()
            .find(|record| record.location == location)
            .map(|record| record.id);
        Some(AssetFileChangedEvent {
            asset_id,
            package: *package,
            location,
            path: event.path.clone(),
            kind: AssetFileChangeKind::from_file_event(event.kind),
            hash: None,
            detected_at: Utc::now(),
        })
    }
}

fn next_generation(state: &mut TrackerState, path: &Path) -> u64 {
    let generation = state.hash_generations.entry(path.to_path_buf()).or_insert(0);
    *generation += 1;
    *generation
}

fn run_change_loop(shared: Weak<TrackerShared>, shutdown: Receiver<()>) {
    loop {
        let interval = match shared.upgrade() {
            Some(shared) => Duration::from_millis(shared.interval_ms.load(Ordering::Relaxed)),
            None => break,
        };
        match shutdown.recv_timeout(interval) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
        match shared.upgrade() {
            Some(shared) => shared.process_raw_events(),
            None => break,
        }
    }
    debug!("change loop stopped");
}
