//! Orchestration of visibility, loading and eviction
//!
//! The streamer owns the culler, the record table and the tile loader,
//! and ties them together on a single control thread: visibility
//! snapshots become load/unload decisions, completed loads are pumped
//! back in and applied to the external scene, and evicted geometry is
//! removed. Workers never touch the record table; everything they
//! produce funnels through channels drained here.

pub mod config;

pub use config::StreamerConfig;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;

use crate::cache::GeometryCache;
use crate::core::error::Error;
use crate::core::types::Result;
use crate::culler::{ColorCode, GeometryCuller, IdPassRenderer, VisibilitySnapshot};
use crate::loader::{CancelFlag, LoadOutcome, TileDecoder, TileFetcher, TileLoader};
use crate::math::{Aabb, Frustum};
use crate::model::{
    DecodedFragment, GeometryKey, GeometryRecord, GeometryState, StreamedAsset, StreamedGeometry,
};
use crate::store::TileStore;

/// External rendering/scene boundary
pub trait Scene {
    /// Attach a decoded fragment's meshes
    fn add_to_scene(&mut self, key: GeometryKey, fragment: &Arc<DecodedFragment>);
    /// Detach and drop the meshes of evicted geometries
    fn remove_from_scene(&mut self, keys: &[GeometryKey]);
    /// Toggle resident meshes without dropping them
    fn set_fragment_visibility(&mut self, keys: &[GeometryKey], visible: bool);
    /// Projected size of a world-space box in pixels
    fn projected_size(&self, bounds: &Aabb) -> f32;
    fn current_frustum(&self) -> Frustum;
}

/// Events exposed to consumers of the streamer
#[derive(Debug)]
pub enum StreamerEvent {
    /// One batch of decoded fragments entered the scene
    Loaded(Vec<(GeometryKey, Arc<DecodedFragment>)>),
    /// Geometries evicted or unregistered and removed from the scene
    Unloaded(Vec<GeometryKey>),
    /// One visibility cycle finished
    VisibilityComputed {
        seen: Vec<GeometryKey>,
        unseen: Vec<GeometryKey>,
    },
}

struct LoadCompletion {
    batch: u64,
    key: GeometryKey,
    outcome: LoadOutcome,
}

struct LoadBatch {
    remaining: usize,
    fragments: Vec<(GeometryKey, Arc<DecodedFragment>)>,
}

/// Visibility-driven geometry streaming for tiled models
pub struct GeometryStreamer<R: IdPassRenderer> {
    config: StreamerConfig,
    culler: GeometryCuller<R>,
    cache: GeometryCache,
    loader: TileLoader,
    store: Option<Arc<dyn TileStore>>,
    registered: HashSet<String>,
    /// Keys to pin as `Static` once their pending load applies
    static_pending: HashSet<GeometryKey>,
    completed_tx: mpsc::UnboundedSender<LoadCompletion>,
    completed_rx: mpsc::UnboundedReceiver<LoadCompletion>,
    batches: HashMap<u64, LoadBatch>,
    next_batch: u64,
    events_tx: mpsc::UnboundedSender<StreamerEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<StreamerEvent>>,
    shutdown: CancelFlag,
}

impl<R: IdPassRenderer> GeometryStreamer<R> {
    /// Must be created inside a tokio runtime (spawns worker tasks).
    pub fn new(
        renderer: R,
        config: StreamerConfig,
        fetcher: Arc<dyn TileFetcher>,
        decoder: Arc<dyn TileDecoder>,
        store: Option<Arc<dyn TileStore>>,
    ) -> Self {
        let store = if config.use_cache { store } else { None };
        let loader = TileLoader::new(fetcher, decoder, store.clone(), config.max_ram_time());
        let culler = GeometryCuller::new(renderer, config.threshold, config.bbox_threshold);
        let cache = GeometryCache::new(config.policy());
        let (completed_tx, completed_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            config,
            culler,
            cache,
            loader,
            store,
            registered: HashSet::new(),
            static_pending: HashSet::new(),
            completed_tx,
            completed_rx,
            batches: HashMap::new(),
            next_batch: 0,
            events_tx,
            events_rx: Some(events_rx),
            shutdown: CancelFlag::new(),
        }
    }

    /// Take the event receiver. Single consumer; returns `None` after
    /// the first call.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<StreamerEvent>> {
        self.events_rx.take()
    }

    pub fn config(&self) -> &StreamerConfig {
        &self.config
    }

    /// Register a model's manifest: one record and one color code per
    /// geometry. No tile is fetched until a geometry is actually seen.
    pub fn register_model(
        &mut self,
        model_id: &str,
        assets: &[StreamedAsset],
        geometries: &[StreamedGeometry],
    ) -> Result<()> {
        if self.registered.contains(model_id) {
            log::warn!("model {model_id} already registered, skipping");
            return Ok(());
        }

        let model = self.culler.add_model(model_id);

        // Collect instance placements per geometry across all assets
        let mut placements: HashMap<u32, Vec<glam::Mat4>> = HashMap::new();
        for asset in assets {
            for geometry_ref in &asset.geometries {
                placements
                    .entry(geometry_ref.geometry_id)
                    .or_default()
                    .push(geometry_ref.transform());
            }
        }

        for geometry in geometries {
            let key = GeometryKey::new(model, geometry.id);
            let bounds = geometry.bounds();
            let geometry_placements = placements.remove(&geometry.id).unwrap_or_default();

            let boxes: Vec<Aabb> = if geometry_placements.is_empty() {
                vec![bounds]
            } else {
                geometry_placements
                    .iter()
                    .map(|transform| bounds.transformed(transform))
                    .collect()
            };

            let mut record = GeometryRecord::new(
                key,
                bounds,
                geometry_placements,
                geometry.has_holes,
                geometry.geometry_file.clone(),
            );
            // Embedded geometries live in the global data file and are
            // resident from the start; they only toggle shown/hidden.
            if !record.streams() {
                record.state = GeometryState::Static;
                record.visible = true;
            }

            if let Err(error) = self.culler.track(key, boxes) {
                // Roll back the partial registration
                self.culler.remove_model(model_id);
                self.cache.remove_model(model);
                return Err(error);
            }
            self.cache.insert(record);
        }

        self.registered.insert(model_id.to_string());
        log::info!(
            "registered model {model_id}: {} assets, {} geometries",
            assets.len(),
            geometries.len()
        );
        Ok(())
    }

    /// Unregister a model: destroys its records (not just evicts),
    /// releases its color codes and removes resident meshes.
    pub fn unregister_model<S: Scene>(&mut self, scene: &mut S, model_id: &str) -> Result<()> {
        if !self.registered.remove(model_id) {
            return Err(Error::UnknownModel(model_id.to_string()));
        }
        let model = self
            .culler
            .model_index(model_id)
            .expect("registered model has an index");
        self.culler.remove_model(model_id);
        let resident = self.cache.remove_model(model);
        self.static_pending.retain(|key| key.model != model);
        if !resident.is_empty() {
            scene.remove_from_scene(&resident);
            self.emit(StreamerEvent::Unloaded(resident));
        }
        log::info!("unregistered model {model_id}");
        Ok(())
    }

    pub fn is_registered(&self, model_id: &str) -> bool {
        self.registered.contains(model_id)
    }

    /// The color code currently bound to a geometry
    pub fn code_of(&self, key: GeometryKey) -> Option<ColorCode> {
        self.culler.code_of(key)
    }

    pub fn record(&self, key: GeometryKey) -> Option<&GeometryRecord> {
        self.cache.get(key)
    }

    pub fn resident_bytes(&self) -> usize {
        self.cache.resident_bytes()
    }

    /// Run one full update cycle: visibility pass, cache decisions,
    /// load dispatch and scene application. Returns without doing
    /// anything when a cycle is already in flight (with `force`, one
    /// extra cycle runs right after it).
    pub async fn update<S: Scene>(&mut self, scene: &mut S, force: bool) -> Result<()> {
        self.pump(scene);
        let mut force = force;
        loop {
            if !self.culler.request_update(force, |bounds| scene.projected_size(bounds)) {
                return Ok(());
            }
            let Some(snapshot) = self.culler.wait().await else {
                return Ok(());
            };
            self.apply_snapshot(scene, &snapshot);
            if !self.culler.take_rerun() {
                break;
            }
            force = true;
        }
        self.pump(scene);
        Ok(())
    }

    /// Poll-style alternative to [`update`] for render loops: trigger a
    /// cycle without awaiting it.
    ///
    /// [`update`]: GeometryStreamer::update
    pub fn request_update<S: Scene>(&mut self, scene: &S, force: bool) -> bool {
        self.culler.request_update(force, |bounds| scene.projected_size(bounds))
    }

    /// Drain completed loads and, if the in-flight visibility cycle
    /// finished, apply it. Returns `true` when a snapshot was applied.
    pub fn poll_update<S: Scene>(&mut self, scene: &mut S) -> bool {
        self.pump(scene);
        let Some(snapshot) = self.culler.poll() else {
            return false;
        };
        self.apply_snapshot(scene, &snapshot);
        if self.culler.take_rerun() {
            self.culler.request_update(true, |bounds| scene.projected_size(bounds));
        }
        true
    }

    /// Apply load results that arrived since the last call. Runs on the
    /// control thread; this is the only writer of the record table.
    pub fn pump<S: Scene>(&mut self, scene: &mut S) {
        let now = Instant::now();
        while let Ok(completion) = self.completed_rx.try_recv() {
            let LoadCompletion { batch, key, outcome } = completion;
            match outcome {
                LoadOutcome::Done(fragment) => {
                    let pinned = self.static_pending.remove(&key);
                    if self.cache.mark_loaded(key, fragment.byte_size(), now) {
                        if pinned {
                            self.cache.set_static(key, true);
                        }
                        scene.add_to_scene(key, &fragment);
                        if let Some(open) = self.batches.get_mut(&batch) {
                            open.fragments.push((key, fragment));
                        }
                    } else {
                        log::debug!("late load result for {key:?} dropped");
                    }
                }
                LoadOutcome::Cancelled => {
                    self.static_pending.remove(&key);
                    self.cache.revert_loading(key);
                }
                LoadOutcome::Failed(error) => {
                    self.static_pending.remove(&key);
                    self.cache.revert_loading(key);
                    log::error!("load failed for {key:?}: {error}");
                }
            }

            if let Some(open) = self.batches.get_mut(&batch) {
                open.remaining -= 1;
                if open.remaining == 0 {
                    let finished = self.batches.remove(&batch).expect("batch is open");
                    if !finished.fragments.is_empty() {
                        self.emit(StreamerEvent::Loaded(finished.fragments));
                    }
                }
            }
        }
    }

    /// Pin geometries as `Static` (streamed once, then immune to
    /// eviction) or unpin them back to normal cache management.
    pub fn set_static(&mut self, keys: &[GeometryKey], active: bool) {
        let mut to_dispatch = Vec::new();
        for &key in keys {
            if self.cache.set_static(key, active) {
                continue;
            }
            if !active {
                self.static_pending.remove(&key);
                continue;
            }
            let Some(record) = self.cache.get_mut(key) else {
                log::warn!("set_static on unknown geometry {key:?}");
                continue;
            };
            match record.state {
                GeometryState::Unloaded if record.streams() => {
                    record.state = GeometryState::Loading;
                    let file = record.geometry_file.clone().expect("streaming record");
                    let has_holes = record.has_holes;
                    self.static_pending.insert(key);
                    to_dispatch.push((key, file, has_holes));
                }
                GeometryState::Loading => {
                    self.static_pending.insert(key);
                }
                _ => {}
            }
        }
        self.dispatch_loads(to_dispatch);
    }

    /// Raise the global cancel flag: every in-flight load is discarded
    /// at its completion boundary and reverts to `Unloaded`.
    pub fn cancel_loads(&self) {
        self.loader.cancel_flag().set();
    }

    /// Clear the cancel flag so new loads run normally again
    pub fn resume_loads(&self) {
        self.loader.cancel_flag().clear();
    }

    /// Clear the persistent tile store
    pub async fn clear_cache(&self) -> Result<()> {
        match &self.store {
            Some(store) => store.clear().await,
            None => Ok(()),
        }
    }

    /// Handle to stop a running [`run`] loop from elsewhere
    ///
    /// [`run`]: GeometryStreamer::run
    pub fn shutdown_handle(&self) -> CancelFlag {
        self.shutdown.clone()
    }

    /// Drive update cycles on the configured interval until the
    /// shutdown handle is raised. No-op when `auto_update` is off.
    pub async fn run<S: Scene>(&mut self, scene: &mut S) {
        if !self.config.auto_update {
            return;
        }
        let mut ticker = tokio::time::interval(self.config.update_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        while !self.shutdown.is_set() {
            ticker.tick().await;
            if let Err(error) = self.update(scene, false).await {
                log::error!("update cycle failed: {error}");
            }
        }
    }

    fn apply_snapshot<S: Scene>(&mut self, scene: &mut S, snapshot: &VisibilitySnapshot) {
        let now = Instant::now();
        let frustum = scene.current_frustum();
        let delta = self.cache.on_visibility_update(snapshot, Some(&frustum), now);

        self.emit(StreamerEvent::VisibilityComputed {
            seen: snapshot.seen.iter().copied().collect(),
            unseen: snapshot.newly_hidden.iter().copied().collect(),
        });

        if !delta.to_show.is_empty() {
            scene.set_fragment_visibility(&delta.to_show, true);
        }
        if !delta.to_hide.is_empty() {
            scene.set_fragment_visibility(&delta.to_hide, false);
        }
        if !delta.to_unload.is_empty() {
            scene.remove_from_scene(&delta.to_unload);
            self.emit(StreamerEvent::Unloaded(delta.to_unload.clone()));
        }

        let items: Vec<(GeometryKey, String, bool)> = delta
            .to_load
            .iter()
            .filter_map(|&key| {
                let record = self.cache.get(key)?;
                let file = record.geometry_file.clone()?;
                Some((key, file, record.has_holes))
            })
            .collect();
        self.dispatch_loads(items);
    }

    /// Fan one batch of loads out to the loader. Every key gets its own
    /// completion; keys sharing a tile file share its single fetch.
    fn dispatch_loads(&mut self, items: Vec<(GeometryKey, String, bool)>) {
        if items.is_empty() {
            return;
        }
        let batch = self.next_batch;
        self.next_batch += 1;
        self.batches.insert(
            batch,
            LoadBatch {
                remaining: items.len(),
                fragments: Vec::new(),
            },
        );

        let mut by_file: HashMap<String, Vec<(GeometryKey, bool)>> = HashMap::new();
        for (key, file, has_holes) in items {
            by_file.entry(file).or_default().push((key, has_holes));
        }

        for (file, keys) in by_file {
            let loader = self.loader.clone();
            let completed_tx = self.completed_tx.clone();
            let has_holes = keys[0].1;
            tokio::spawn(async move {
                let outcome = loader.load(&file, has_holes).await;
                for (key, _) in keys {
                    let _ = completed_tx.send(LoadCompletion {
                        batch,
                        key,
                        outcome: outcome.clone(),
                    });
                }
            });
        }
    }

    fn emit(&self, event: StreamerEvent) {
        // Dropped receiver just means nobody is listening
        let _ = self.events_tx.send(event);
    }
}
