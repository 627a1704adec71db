use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use itertools::Itertools;
use log::{debug, info, warn};

use crate::asset::types::{Decomposition, MeshId, SkinInfo, Volume};
use crate::error::RepoError;
use crate::io::http::{Transport, UreqTransport};
use crate::physics::decomp::PhysicsDecomp;
use crate::repo::metrics::RepoMetrics;
use crate::repo::request::{
    calculate_score, HeaderRequest, LodRequest, PendingKind, PendingRequest, SectionRequest,
};
use crate::repo::worker::{MeshCaps, RepoShared, RequestQueues};
use crate::repo::MeshObject;
use crate::settings::RepoConfig;
use crate::upload::{
    MeshUploadJob, ModelUploadParams, UploadEvent, UploadQueues, WholeModelFeeObserver,
    WholeModelUploadObserver,
};
use crate::NUM_LODS;

const SKIN_CULL_INTERVAL: Duration = Duration::from_secs(10);

/// What the embedding client knows about the current region, polled once
/// per frame. Capability updates only happen after the region reports
/// its capabilities as received.
#[derive(Debug, Clone, Default)]
pub struct RegionContext {
    pub name: String,
    pub capabilities_received: bool,
    /// Modern asset capability.
    pub viewer_asset: Option<String>,
    /// Legacy GetMesh2 capability.
    pub get_mesh2: Option<String>,
    /// Legacy GetMesh capability.
    pub get_mesh: Option<String>,
}

struct LoadingEntry {
    objects: Vec<Weak<dyn MeshObject>>,
}

impl LoadingEntry {
    fn new(object: &Arc<dyn MeshObject>) -> Self {
        Self {
            objects: vec![Arc::downgrade(object)],
        }
    }

    fn add(&mut self, object: &Arc<dyn MeshObject>) {
        let weak = Arc::downgrade(object);
        if !self.objects.iter().any(|o| o.ptr_eq(&weak)) {
            self.objects.push(weak);
        }
    }

    fn remove(&mut self, object: &Weak<dyn MeshObject>) {
        self.objects.retain(|o| !o.ptr_eq(object));
    }
}

/// Main-thread front end of the mesh pipeline. Owns the loading tables,
/// the parsed result maps and the pending request queue, and drives the
/// repo worker, the parse pool, the physics decomposer and the upload
/// workers. All methods must be called from the render thread.
pub struct MeshRepository {
    shared: Arc<RepoShared>,
    worker: Option<JoinHandle<()>>,
    metrics: Arc<RepoMetrics>,

    loading_meshes: [HashMap<MeshId, LoadingEntry>; NUM_LODS],
    loading_skins: HashMap<MeshId, LoadingEntry>,
    pending_requests: Vec<PendingRequest>,
    next_seq: u64,

    /// Parsed LODs delivered so far, consulted for the best available
    /// substitute while a request is in flight.
    volumes: HashMap<MeshId, [Option<Arc<Volume>>; NUM_LODS]>,
    skin_map: HashMap<MeshId, Arc<SkinInfo>>,
    decomposition_map: HashMap<MeshId, Decomposition>,
    loading_decompositions: HashSet<MeshId>,
    loading_physics_shapes: HashSet<MeshId>,
    pending_decomposition_requests: VecDeque<MeshId>,
    pending_physics_shape_requests: VecDeque<MeshId>,

    decomp: PhysicsDecomp,

    upload_queues: Arc<Mutex<UploadQueues>>,
    upload_wait_list: Vec<MeshUploadJob>,
    uploads: Vec<MeshUploadJob>,

    current_region_name: String,
    legacy_version: i32,
    skin_cull_deadline: Instant,
    lock_holdoffs: u32,
}

impl MeshRepository {
    pub fn new(config: RepoConfig) -> Result<Self, RepoError> {
        let transport = Arc::new(UreqTransport::new(&config));
        Self::with_transport(config, transport)
    }

    pub fn with_transport(
        config: RepoConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, RepoError> {
        let metrics = Arc::new(RepoMetrics::default());
        let shared = RepoShared::new(config, transport, metrics.clone())?;
        let worker = RepoShared::spawn(&shared);
        Ok(Self::assemble(shared, Some(worker), metrics))
    }

    fn assemble(
        shared: Arc<RepoShared>,
        worker: Option<JoinHandle<()>>,
        metrics: Arc<RepoMetrics>,
    ) -> Self {
        Self {
            shared,
            worker,
            metrics,
            loading_meshes: Default::default(),
            loading_skins: HashMap::new(),
            pending_requests: Vec::new(),
            next_seq: 0,
            volumes: HashMap::new(),
            skin_map: HashMap::new(),
            decomposition_map: HashMap::new(),
            loading_decompositions: HashSet::new(),
            loading_physics_shapes: HashSet::new(),
            pending_decomposition_requests: VecDeque::new(),
            pending_physics_shape_requests: VecDeque::new(),
            decomp: PhysicsDecomp::start(),
            upload_queues: Arc::new(Mutex::new(UploadQueues::default())),
            upload_wait_list: Vec::new(),
            uploads: Vec::new(),
            current_region_name: String::new(),
            legacy_version: 0,
            skin_cull_deadline: Instant::now() + SKIN_CULL_INTERVAL,
            lock_holdoffs: 0,
        }
    }

    pub fn metrics(&self) -> &Arc<RepoMetrics> {
        &self.metrics
    }

    /// Current (high, low) water marks of the in-flight handle set.
    pub fn concurrency_bounds(&self) -> (usize, usize) {
        (
            self.shared.high_water.load(Ordering::Relaxed),
            self.shared.low_water.load(Ordering::Relaxed),
        )
    }

    /// True once a moderate allocation failed inside the pipeline. The
    /// embedding client should begin an orderly shutdown.
    pub fn wants_soft_quit(&self) -> bool {
        self.shared.soft_quit.load(Ordering::Relaxed)
    }

    /// Records a LOD request for a scene object and returns the best LOD
    /// that is already parsed and usable so the renderer has something
    /// to draw meanwhile. `last_lod` is checked first to avoid popping
    /// down, then the lower LODs, then the higher ones.
    pub fn load_mesh(
        &mut self,
        object: &Arc<dyn MeshObject>,
        mesh_id: MeshId,
        new_lod: i32,
        last_lod: i32,
    ) -> i32 {
        if !(0..NUM_LODS as i32).contains(&new_lod) {
            return new_lod;
        }

        match self.loading_meshes[new_lod as usize].entry(mesh_id) {
            std::collections::hash_map::Entry::Occupied(mut entry) => {
                entry.get_mut().add(object);
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(LoadingEntry::new(object));
                self.pending_requests.push(PendingRequest::new(
                    PendingKind::Lod {
                        mesh_id,
                        lod: new_lod,
                    },
                    self.next_seq,
                ));
                self.next_seq += 1;
                self.metrics.lod_pending.fetch_add(1, Ordering::Relaxed);
            }
        }

        if let Some(slots) = self.volumes.get(&mesh_id) {
            let usable = |lod: i32| {
                slots[lod as usize]
                    .as_ref()
                    .map(|volume| !volume.faces.is_empty())
                    .unwrap_or(false)
            };
            if last_lod >= 0 && last_lod < NUM_LODS as i32 && usable(last_lod) {
                return last_lod;
            }
            for lod in (0..new_lod).rev() {
                if usable(lod) {
                    return lod;
                }
            }
            for lod in new_lod + 1..NUM_LODS as i32 {
                if usable(lod) {
                    return lod;
                }
            }
        }
        new_lod
    }

    /// Drops a scene object from every loading entry, called when the
    /// object leaves the scene.
    pub fn unregister_mesh(&mut self, object: &Arc<dyn MeshObject>) {
        let weak = Arc::downgrade(object);
        for lod_map in self.loading_meshes.iter_mut() {
            for entry in lod_map.values_mut() {
                entry.remove(&weak);
            }
        }
        for entry in self.loading_skins.values_mut() {
            entry.remove(&weak);
        }
    }

    /// Cached skin descriptor, or triggers a fetch when a requesting
    /// object is supplied.
    pub fn get_skin_info(
        &mut self,
        mesh_id: &MeshId,
        requesting_object: Option<&Arc<dyn MeshObject>>,
    ) -> Option<Arc<SkinInfo>> {
        if mesh_id.is_nil() {
            return None;
        }
        if let Some(skin) = self.skin_map.get(mesh_id) {
            return Some(skin.clone());
        }

        if let Some(object) = requesting_object {
            match self.loading_skins.entry(*mesh_id) {
                std::collections::hash_map::Entry::Occupied(mut entry) => {
                    entry.get_mut().add(object);
                }
                std::collections::hash_map::Entry::Vacant(entry) => {
                    entry.insert(LoadingEntry::new(object));
                    self.pending_requests.push(PendingRequest::new(
                        PendingKind::Skin { mesh_id: *mesh_id },
                        self.next_seq,
                    ));
                    self.next_seq += 1;
                }
            }
        }
        None
    }

    pub fn has_header(&self, mesh_id: &MeshId) -> bool {
        !mesh_id.is_nil() && self.shared.has_header(mesh_id)
    }

    pub fn has_skin_info(&self, mesh_id: &MeshId) -> bool {
        if mesh_id.is_nil() {
            return false;
        }
        self.shared.has_skin_in_header(mesh_id) || self.skin_map.contains_key(mesh_id)
    }

    pub fn has_physics_shape(&mut self, mesh_id: &MeshId) -> bool {
        if mesh_id.is_nil() {
            return false;
        }
        if self.shared.has_physics_shape_in_header(mesh_id) {
            return true;
        }
        self.get_decomposition(mesh_id)
            .map(|decomposition| !decomposition.hulls.is_empty())
            .unwrap_or(false)
    }

    pub fn creator_from_header(&self, mesh_id: &MeshId) -> Option<MeshId> {
        self.shared.creator_from_header(mesh_id)
    }

    pub fn mesh_size(&self, mesh_id: &MeshId, lod: i32) -> i64 {
        self.shared.mesh_size(mesh_id, lod)
    }

    pub fn actual_mesh_lod(&self, mesh_id: &MeshId, lod: i32) -> i32 {
        self.shared.actual_lod(mesh_id, lod)
    }

    /// Enqueues a physics shape fetch unless the shape is already known.
    pub fn fetch_physics_shape(&mut self, mesh_id: &MeshId) {
        if mesh_id.is_nil() {
            return;
        }
        let unknown = self
            .decomposition_map
            .get(mesh_id)
            .map(|decomposition| decomposition.physics_shape_mesh.is_none())
            .unwrap_or(true);
        if unknown && self.loading_physics_shapes.insert(*mesh_id) {
            self.pending_physics_shape_requests.push_back(*mesh_id);
        }
    }

    /// Cached decomposition, triggering a fetch of the physics_convex
    /// block when the hulls are still missing.
    pub fn get_decomposition(&mut self, mesh_id: &MeshId) -> Option<&Decomposition> {
        if mesh_id.is_nil() {
            return None;
        }
        let missing = self
            .decomposition_map
            .get(mesh_id)
            .map(|decomposition| {
                decomposition.hulls.is_empty() && decomposition.base_hull.is_empty()
            })
            .unwrap_or(true);
        if missing && self.loading_decompositions.insert(*mesh_id) {
            self.pending_decomposition_requests.push_back(*mesh_id);
        }
        self.decomposition_map.get(mesh_id)
    }

    /// Schedules a whole-model upload. The worker starts on the next
    /// `notify_loaded_meshes` call and reports back through the
    /// observers on the render thread.
    pub fn upload_model(
        &mut self,
        params: ModelUploadParams,
        fee_observer: Option<Arc<dyn WholeModelFeeObserver>>,
        upload_observer: Option<Arc<dyn WholeModelUploadObserver>>,
    ) {
        let job = MeshUploadJob::new(
            params,
            self.shared.clone(),
            self.decomp.queue(),
            self.upload_queues.clone(),
            fee_observer,
            upload_observer,
        );
        self.upload_wait_list.push(job);
    }

    /// Per-frame pump. Recomputes the concurrency budget, drives upload
    /// workers and the decomposer, evicts idle skin entries, feeds the
    /// worker queues by score and delivers completions to the waiting
    /// scene objects.
    pub fn notify_loaded_meshes(&mut self, region: Option<&RegionContext>) {
        let shared = self.shared.clone();
        let upload_queues = self.upload_queues.clone();

        let (high, low) = shared.config.water_marks(self.legacy_version == 1);
        shared.high_water.store(high, Ordering::Relaxed);
        shared.low_water.store(low, Ordering::Relaxed);

        self.start_pending_uploads();
        self.reap_uploads();

        for decomposition in self.decomp.take_completed() {
            self.notify_decomposition_received(decomposition);
        }

        if Instant::now() >= self.skin_cull_deadline {
            self.skin_cull_deadline = Instant::now() + SKIN_CULL_INTERVAL;
            self.cull_skin_map();
        }

        // For the queue handover, try to take the shared locks without
        // blocking and punt to the next frame if any is contended, the
        // render loop must not stall on the worker.
        let mut upload_events = Vec::new();
        {
            let Ok(mut upload_guard) = upload_queues.try_lock() else {
                self.note_holdoff();
                return;
            };
            let Ok(mut queues) = shared.queues.try_lock() else {
                self.note_holdoff();
                return;
            };
            let Ok(headers) = shared.headers.try_lock() else {
                self.note_holdoff();
                return;
            };
            let Ok(mut pending_lods) = shared.pending_lods.try_lock() else {
                self.note_holdoff();
                return;
            };
            self.lock_holdoffs = 0;

            upload_events.append(&mut upload_guard.events);
            drop(upload_guard);

            if let Some(region) = region {
                self.update_capabilities(region, &mut queues);
            }

            // keep the worker queues at least somewhat populated so the
            // transition into HTTP stays fast
            let active = shared.active_header_requests.load(Ordering::Relaxed)
                + shared.active_lod_requests.load(Ordering::Relaxed)
                + shared.active_skin_requests.load(Ordering::Relaxed)
                + (queues.lod.len() + queues.header.len() + queues.skin.len()) as i64;
            let mut push_count = (high as i64 - active).max(0) as usize;

            if push_count > 0 && !self.pending_requests.is_empty() {
                if self.pending_requests.len() > push_count {
                    let loading_meshes = &self.loading_meshes;
                    let loading_skins = &self.loading_skins;
                    for request in self.pending_requests.iter_mut() {
                        request.score =
                            score_for(loading_meshes, loading_skins, &request.kind);
                    }
                    // partial sort, only the dispatch budget needs order
                    self.pending_requests.select_nth_unstable_by(
                        push_count - 1,
                        PendingRequest::compare_score_greater,
                    );
                    self.pending_requests[..push_count]
                        .sort_unstable_by(PendingRequest::compare_score_greater);
                }

                push_count = push_count.min(self.pending_requests.len());
                for request in self.pending_requests.drain(..push_count) {
                    match request.kind {
                        PendingKind::Lod { mesh_id, lod } => {
                            queue_lod_request(
                                &mut queues,
                                &headers,
                                &mut pending_lods,
                                &self.metrics,
                                mesh_id,
                                lod,
                            );
                            self.metrics.lod_pending.fetch_sub(1, Ordering::Relaxed);
                        }
                        PendingKind::Skin { mesh_id } => {
                            queues.skin.push_back(SectionRequest::new(mesh_id));
                        }
                    }
                }
            }

            while let Some(mesh_id) = self.pending_decomposition_requests.pop_front() {
                queues.decomposition.push_back(SectionRequest::new(mesh_id));
            }
            while let Some(mesh_id) = self.pending_physics_shape_requests.pop_front() {
                queues.physics_shape.push_back(SectionRequest::new(mesh_id));
            }
        }

        for event in upload_events {
            self.dispatch_upload_event(event);
        }

        self.deliver_completions();
        shared.signal();
    }

    fn note_holdoff(&mut self) {
        self.lock_holdoffs += 1;
        let max = self.metrics.max_lock_holdoffs.load(Ordering::Relaxed);
        if self.lock_holdoffs > max {
            self.metrics
                .max_lock_holdoffs
                .store(self.lock_holdoffs, Ordering::Relaxed);
        }
        if self.lock_holdoffs > 4 {
            warn!("High mesh thread holdoff");
        }
    }

    fn update_capabilities(&mut self, region: &RegionContext, queues: &mut RequestQueues) {
        if region.name == self.current_region_name || !region.capabilities_received {
            return;
        }
        self.current_region_name = region.name.clone();

        let use_v1 = self.shared.config.use_legacy_v1;
        let modern_missing =
            region.viewer_asset.is_none() && region.get_mesh2.is_none();
        self.legacy_version = if modern_missing || use_v1 {
            1
        } else if region.viewer_asset.is_some() {
            0
        } else {
            2
        };

        queues.caps = MeshCaps {
            viewer_asset: region.viewer_asset.clone(),
            legacy_v2: region.get_mesh2.clone(),
            legacy_v1: region.get_mesh.clone(),
            preferred_version: self.legacy_version,
        };
        debug!(
            "Retrieved caps for region '{}', using version {}",
            region.name, self.legacy_version
        );
    }

    /// Every ten seconds, drop skin entries nothing outside the cache
    /// holds anymore. The worker's private copy is erased through a
    /// posted closure so the map stays render-thread-only here.
    fn cull_skin_map(&mut self) {
        let expired = self
            .skin_map
            .iter()
            .filter(|(_, skin)| Arc::strong_count(skin) == 1)
            .map(|(mesh_id, _)| *mesh_id)
            .collect_vec();
        for mesh_id in expired {
            self.skin_map.remove(&mesh_id);
            self.shared.post_work(Box::new(move |shared| {
                shared.skin_map.remove(&mesh_id);
            }));
        }
    }

    /// Drains the completion queues and notifies every waiting scene
    /// object exactly once per entry.
    fn deliver_completions(&mut self) {
        let (loaded, unavailable, skins, skin_unavailable, decompositions) = {
            let mut guard = self.shared.loaded.lock().expect("poisoned lock");
            (
                std::mem::take(&mut guard.loaded),
                std::mem::take(&mut guard.unavailable),
                std::mem::take(&mut guard.skins),
                std::mem::take(&mut guard.skin_unavailable),
                std::mem::take(&mut guard.decompositions),
            )
        };

        for volume in loaded {
            self.notify_mesh_loaded(volume);
        }
        for (mesh_id, lod) in unavailable {
            self.notify_mesh_unavailable(&mesh_id, lod);
        }
        for skin in skins {
            self.notify_skin_received(skin);
        }
        for mesh_id in skin_unavailable {
            self.notify_skin_unavailable(&mesh_id);
        }
        for decomposition in decompositions {
            self.notify_decomposition_received(decomposition);
        }
    }

    fn notify_mesh_loaded(&mut self, volume: Arc<Volume>) {
        if volume.faces.is_empty() {
            warn!("Mesh loading returned empty volume. ID: {}", volume.mesh_id);
        }
        let lod = volume.lod as usize;
        if lod >= NUM_LODS {
            return;
        }

        self.volumes.entry(volume.mesh_id).or_default()[lod] = Some(volume.clone());

        if let Some(entry) = self.loading_meshes[lod].remove(&volume.mesh_id) {
            for weak in entry.objects {
                if let Some(object) = weak.upgrade() {
                    object.notify_mesh_loaded(&volume);
                }
            }
        }
    }

    fn notify_mesh_unavailable(&mut self, mesh_id: &MeshId, request_lod: i32) {
        if !(0..NUM_LODS as i32).contains(&request_lod) {
            return;
        }
        if let Some(entry) = self.loading_meshes[request_lod as usize].remove(mesh_id) {
            // hand the waiters the best substitute the header still offers
            let fallback = self.shared.actual_lod(mesh_id, request_lod);
            for weak in entry.objects {
                if let Some(object) = weak.upgrade() {
                    object.notify_mesh_unavailable(mesh_id, request_lod, fallback);
                }
            }
        }
    }

    fn notify_skin_received(&mut self, skin: Arc<SkinInfo>) {
        let mesh_id = skin.mesh_id;
        self.skin_map.insert(mesh_id, skin.clone());

        if let Some(entry) = self.loading_skins.remove(&mesh_id) {
            for weak in entry.objects {
                if let Some(object) = weak.upgrade() {
                    object.notify_skin_loaded(&skin);
                }
            }
        }
    }

    fn notify_skin_unavailable(&mut self, mesh_id: &MeshId) {
        if let Some(entry) = self.loading_skins.remove(mesh_id) {
            for weak in entry.objects {
                if let Some(object) = weak.upgrade() {
                    object.notify_skin_unavailable(mesh_id);
                }
            }
        }
    }

    fn notify_decomposition_received(&mut self, decomposition: Decomposition) {
        let mesh_id = decomposition.mesh_id;
        if decomposition.physics_shape_mesh.is_some() {
            self.loading_physics_shapes.remove(&mesh_id);
        } else {
            self.loading_decompositions.remove(&mesh_id);
        }
        match self.decomposition_map.entry(mesh_id) {
            std::collections::hash_map::Entry::Occupied(mut entry) => {
                entry.get_mut().merge(decomposition);
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(decomposition);
            }
        }
    }

    fn start_pending_uploads(&mut self) {
        for mut job in self.upload_wait_list.drain(..) {
            job.start();
            self.uploads.push(job);
        }
    }

    fn reap_uploads(&mut self) {
        let mut index = 0;
        while index < self.uploads.len() {
            if self.uploads[index].is_finished() {
                let mut job = self.uploads.swap_remove(index);
                job.join();
            } else {
                index += 1;
            }
        }
    }

    fn dispatch_upload_event(&mut self, event: UploadEvent) {
        match event {
            UploadEvent::FeeReceived {
                observer,
                fee_data,
                uploader_url,
            } => {
                if let Some(observer) = observer {
                    observer.on_model_physics_fee_received(&fee_data, &uploader_url);
                }
            }
            UploadEvent::FeeFailed {
                observer,
                status,
                reason,
                error,
            } => {
                warn!("Fee request failed. Reason: {} ({})", reason, status.0);
                if let Some(observer) = observer {
                    observer.on_model_physics_fee_error(status.0, &reason, &error);
                }
            }
            UploadEvent::UploadSucceeded { observer } => {
                if let Some(observer) = observer {
                    observer.on_model_upload_success();
                }
            }
            UploadEvent::UploadFailed {
                observer,
                status,
                reason,
            } => {
                warn!("Upload failed. Reason: {} ({})", reason, status.0);
                if let Some(observer) = observer {
                    observer.on_model_upload_failure();
                }
            }
            UploadEvent::InventoryReady(data) => {
                info!("Mesh upload complete, new inventory item '{}'", data.name);
                self.dispatch_inventory(data);
            }
        }
    }

    fn dispatch_inventory(&mut self, data: crate::upload::InventoryData) {
        // inventory bookkeeping lives outside this subsystem, the record
        // is kept for the embedding client to drain
        self.upload_queues
            .lock()
            .expect("poisoned lock")
            .inventory
            .push(data);
    }

    /// Finished inventory records for the embedding client.
    pub fn take_inventory_updates(&mut self) -> Vec<crate::upload::InventoryData> {
        std::mem::take(
            &mut self
                .upload_queues
                .lock()
                .expect("poisoned lock")
                .inventory,
        )
    }

    /// Stops every worker. Upload jobs are discarded, in-flight buffers
    /// drop when the threads observe the flag.
    pub fn shutdown(&mut self) {
        info!("Shutting down mesh repository");
        for job in self.upload_wait_list.iter_mut().chain(self.uploads.iter_mut()) {
            job.discard();
        }

        self.shared.begin_shutdown();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        self.shared.pool.shutdown();

        for mut job in self.upload_wait_list.drain(..).chain(self.uploads.drain(..)) {
            job.join();
        }

        self.decomp.shutdown();
    }

    /// Test-only variant without the worker thread, the tests drive the
    /// worker passes themselves for determinism. The parse pool is shut
    /// down up front so every parse runs inline.
    #[cfg(test)]
    pub(crate) fn new_for_tests(
        config: RepoConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, RepoError> {
        let metrics = Arc::new(RepoMetrics::default());
        let shared = RepoShared::new(config, transport, metrics.clone())?;
        shared.pool.shutdown();
        Ok(Self::assemble(shared, None, metrics))
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<RepoShared> {
        &self.shared
    }

    #[cfg(test)]
    pub(crate) fn pending_request_count(&self) -> usize {
        self.pending_requests.len()
    }

    #[cfg(test)]
    pub(crate) fn decomposition_for(&self, mesh_id: &MeshId) -> Option<&Decomposition> {
        self.decomposition_map.get(mesh_id)
    }
}

impl Drop for MeshRepository {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.shutdown();
        }
    }
}

fn score_for(
    loading_meshes: &[HashMap<MeshId, LoadingEntry>; NUM_LODS],
    loading_skins: &HashMap<MeshId, LoadingEntry>,
    kind: &PendingKind,
) -> f32 {
    let entry = match kind {
        PendingKind::Lod { mesh_id, lod } => loading_meshes[*lod as usize].get(mesh_id),
        PendingKind::Skin { mesh_id } => loading_skins.get(mesh_id),
    };
    let Some(entry) = entry else { return 0.0 };

    let mut score = 0.0f32;
    for weak in &entry.objects {
        if let Some(object) = weak.upgrade() {
            let object_score = calculate_score(object.as_ref());
            if object_score > 0.0 {
                score = score.max(object_score);
            }
        }
    }
    score
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::Ordering as AtomicOrdering;

    use crate::asset::header::{FLAG_LOD_IN_CACHE, FLAG_SKIN_IN_CACHE};
    use crate::io::cache::MeshCache;
    use crate::io::http::Lane;
    use crate::repo::tests::{
        build_asset, build_asset_with_sizes, lod_section, skin_section, test_mesh_id,
        MockTransport, Notification, TestObject,
    };
    use crate::repo::worker::DiskBuffer;
    use crate::{CACHE_PREAMBLE_SIZE, CACHE_PREAMBLE_VERSION, MESH_HEADER_SIZE};

    fn test_config(dir: &PathBuf) -> RepoConfig {
        let mut config = RepoConfig::default();
        config.cache_dir = dir.clone();
        config.retry_base_delay = Duration::from_millis(1);
        config
    }

    fn test_region() -> RegionContext {
        RegionContext {
            name: "Ahern".into(),
            capabilities_received: true,
            viewer_asset: Some("http://mock.local/assets".into()),
            get_mesh2: None,
            get_mesh: None,
        }
    }

    fn make_repo(dir: &PathBuf, transport: &Arc<MockTransport>) -> MeshRepository {
        let transport: Arc<dyn Transport> = transport.clone();
        MeshRepository::new_for_tests(test_config(dir), transport).expect("repository")
    }

    /// One frame plus a few worker passes. The mock transport completes
    /// synchronously, every pass flushes the previous pass's handlers.
    fn spin(repo: &mut MeshRepository, passes: usize) {
        let region = test_region();
        repo.notify_loaded_meshes(Some(&region));
        let shared = repo.shared().clone();
        let mut scratch = DiskBuffer::default();
        for _ in 0..passes {
            crate::repo::worker::process(&shared, &mut scratch);
        }
        repo.notify_loaded_meshes(Some(&region));
    }

    /// An asset whose skin sits past every LOD so neither it nor the
    /// LODs fit inside the initial 4 KiB header window.
    fn fat_asset(mesh_id: &MeshId) -> Vec<u8> {
        build_asset(&[
            ("lowest_lod", lod_section(300)),
            ("low_lod", lod_section(300)),
            ("medium_lod", lod_section(300)),
            ("high_lod", lod_section(300)),
            ("skin", skin_section(mesh_id)),
        ])
    }

    #[test]
    fn cold_fetch_of_a_small_mesh() {
        let dir = tempfile::tempdir().expect("temp dir");
        let cache_dir = dir.path().join("mesh");
        let transport = Arc::new(MockTransport::default());
        let mesh_id = test_mesh_id();
        transport
            .assets
            .lock()
            .expect("poisoned lock")
            .insert(mesh_id, fat_asset(&mesh_id));

        let mut repo = make_repo(&cache_dir, &transport);
        let object = Arc::new(TestObject::plain(2.0, 4.0));
        let dyn_object: Arc<dyn MeshObject> = object.clone();

        assert_eq!(repo.load_mesh(&dyn_object, mesh_id, 2, -1), 2);
        spin(&mut repo, 3);

        let requests = transport.requests.lock().expect("poisoned lock").clone();
        assert_eq!(requests.len(), 3, "header, skin and one LOD");
        assert_eq!(requests[0].offset, 0);
        assert_eq!(requests[0].len, MESH_HEADER_SIZE as u64);
        assert_eq!(requests[0].lane, Lane::Small);

        let header = repo
            .shared()
            .headers
            .lock()
            .expect("poisoned lock")
            .get(&mesh_id)
            .cloned()
            .expect("header parsed");
        let expected_skin = (
            header.header_size as u64 + header.skin.offset as u64,
            header.skin.size as u64,
        );
        let expected_lod = (
            header.header_size as u64 + header.lods[2].offset as u64,
            header.lods[2].size as u64,
        );
        assert!(requests[1..]
            .iter()
            .any(|r| (r.offset, r.len) == expected_skin));
        assert!(requests[1..]
            .iter()
            .any(|r| (r.offset, r.len) == expected_lod));

        // one more frame in case the skin landed after the LOD pass
        spin(&mut repo, 1);

        assert!(object
            .take_notifications()
            .contains(&Notification::Loaded(mesh_id, 2)));
        assert!(repo.has_skin_info(&mesh_id));
        let preamble = MeshCache::new(cache_dir.clone())
            .expect("cache")
            .read_preamble(&mesh_id)
            .expect("readable")
            .expect("present");
        assert_eq!(preamble.version, CACHE_PREAMBLE_VERSION);
        assert_eq!(preamble.header_size, header.header_size);
        assert!(preamble.flags & FLAG_LOD_IN_CACHE[2] != 0);
        assert!(preamble.flags & FLAG_SKIN_IN_CACHE != 0);
    }

    #[test]
    fn warm_cache_hit_issues_no_http() {
        let dir = tempfile::tempdir().expect("temp dir");
        let cache_dir = dir.path().join("mesh");
        let transport = Arc::new(MockTransport::default());
        let mesh_id = test_mesh_id();
        transport
            .assets
            .lock()
            .expect("poisoned lock")
            .insert(mesh_id, fat_asset(&mesh_id));

        // warm the cache
        {
            let mut repo = make_repo(&cache_dir, &transport);
            let object: Arc<dyn MeshObject> = Arc::new(TestObject::plain(2.0, 4.0));
            repo.load_mesh(&object, mesh_id, 2, -1);
            spin(&mut repo, 4);
        }

        let cold_requests = transport.requests.lock().expect("poisoned lock").len();

        let object = Arc::new(TestObject::plain(2.0, 4.0));
        let dyn_object: Arc<dyn MeshObject> = object.clone();
        let mut repo = make_repo(&cache_dir, &transport);
        repo.load_mesh(&dyn_object, mesh_id, 2, -1);
        spin(&mut repo, 3);

        assert_eq!(
            transport.requests.lock().expect("poisoned lock").len(),
            cold_requests,
            "everything came from the cache"
        );
        let notifications = object.take_notifications();
        assert!(notifications.contains(&Notification::Loaded(mesh_id, 2)));
    }

    #[test]
    fn zeroed_cache_region_invalidates_and_refetches() {
        let dir = tempfile::tempdir().expect("temp dir");
        let cache_dir = dir.path().join("mesh");
        let transport = Arc::new(MockTransport::default());
        let mesh_id = test_mesh_id();
        transport
            .assets
            .lock()
            .expect("poisoned lock")
            .insert(mesh_id, fat_asset(&mesh_id));

        let header = {
            let mut repo = make_repo(&cache_dir, &transport);
            let object: Arc<dyn MeshObject> = Arc::new(TestObject::plain(2.0, 4.0));
            repo.load_mesh(&object, mesh_id, 2, -1);
            spin(&mut repo, 4);
            let parsed_header = repo
                .shared()
                .headers
                .lock()
                .expect("poisoned lock")
                .get(&mesh_id)
                .cloned()
                .expect("header parsed");
            parsed_header
        };

        // stomp the cached LOD region with zeros, presence bits intact
        let cache = MeshCache::new(cache_dir.clone()).expect("cache");
        let lod_offset =
            CACHE_PREAMBLE_SIZE + header.header_size as u64 + header.lods[2].offset as u64;
        cache
            .write_range(&mesh_id, lod_offset, &vec![0u8; header.lods[2].size as usize])
            .expect("writes");

        let baseline = transport.requests.lock().expect("poisoned lock").len();
        let object = Arc::new(TestObject::plain(2.0, 4.0));
        let dyn_object: Arc<dyn MeshObject> = object.clone();
        let mut repo = make_repo(&cache_dir, &transport);
        repo.load_mesh(&dyn_object, mesh_id, 2, -1);
        spin(&mut repo, 4);

        let requests = transport.requests.lock().expect("poisoned lock");
        let fresh: Vec<_> = requests[baseline..].iter().collect();
        assert_eq!(fresh.len(), 1, "exactly the LOD refetch");
        assert_eq!(fresh[0].offset, header.header_size as u64 + header.lods[2].offset as u64);
        drop(requests);

        assert!(object
            .take_notifications()
            .contains(&Notification::Loaded(mesh_id, 2)));

        // conservative invalidation dropped every bit, the refetch
        // brought only the LOD back
        let preamble = cache
            .read_preamble(&mesh_id)
            .expect("readable")
            .expect("present");
        assert_eq!(preamble.flags & FLAG_SKIN_IN_CACHE, 0);
        assert!(preamble.flags & FLAG_LOD_IN_CACHE[2] != 0);
    }

    #[test]
    fn missing_asset_notifies_every_waiter_without_retry() {
        let dir = tempfile::tempdir().expect("temp dir");
        let cache_dir = dir.path().join("mesh");
        let transport = Arc::new(MockTransport::default());
        let mesh_id = test_mesh_id();
        transport
            .statuses
            .lock()
            .expect("poisoned lock")
            .insert(mesh_id, 404);

        let object = Arc::new(TestObject::plain(2.0, 4.0));
        let dyn_object: Arc<dyn MeshObject> = object.clone();
        let mut repo = make_repo(&cache_dir, &transport);
        repo.load_mesh(&dyn_object, mesh_id, 2, -1);
        spin(&mut repo, 3);

        assert_eq!(transport.requests.lock().expect("poisoned lock").len(), 1);
        let notifications = object.take_notifications();
        assert!(notifications.contains(&Notification::Unavailable(mesh_id, 2, -1)));
        assert!(repo.has_header(&mesh_id));

        // a later request must not touch the network again
        repo.load_mesh(&dyn_object, mesh_id, 1, -1);
        spin(&mut repo, 3);
        assert_eq!(transport.requests.lock().expect("poisoned lock").len(), 1);
        assert!(object
            .take_notifications()
            .contains(&Notification::Unavailable(mesh_id, 1, -1)));
    }

    #[test]
    fn transient_errors_retry_with_backoff_up_to_the_limit() {
        let dir = tempfile::tempdir().expect("temp dir");
        let cache_dir = dir.path().join("mesh");
        let transport = Arc::new(MockTransport::default());
        let mesh_id = test_mesh_id();
        transport
            .statuses
            .lock()
            .expect("poisoned lock")
            .insert(mesh_id, 503);

        let object = Arc::new(TestObject::plain(2.0, 4.0));
        let dyn_object: Arc<dyn MeshObject> = object.clone();
        let mut repo = make_repo(&cache_dir, &transport);
        repo.load_mesh(&dyn_object, mesh_id, 2, -1);

        let region = test_region();
        repo.notify_loaded_meshes(Some(&region));
        let shared = repo.shared().clone();
        let mut scratch = DiskBuffer::default();
        // base delay is one millisecond, the whole backoff ladder fits
        // in well under a second
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            crate::repo::worker::process(&shared, &mut scratch);
            if transport.requests.lock().expect("poisoned lock").len()
                >= crate::DOWNLOAD_RETRY_LIMIT as usize
            {
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        crate::repo::worker::process(&shared, &mut scratch);
        repo.notify_loaded_meshes(Some(&region));

        assert_eq!(
            transport.requests.lock().expect("poisoned lock").len(),
            crate::DOWNLOAD_RETRY_LIMIT as usize,
            "the initial attempt plus seven retries"
        );
        assert!(object
            .take_notifications()
            .contains(&Notification::Unavailable(mesh_id, 2, -1)));
    }

    #[test]
    fn large_sections_ride_the_large_lane() {
        let dir = tempfile::tempdir().expect("temp dir");
        let cache_dir = dir.path().join("mesh");
        let transport = Arc::new(MockTransport::default());
        let mesh_id = test_mesh_id();
        // zero padding past the encoded face stream, the parser stops at
        // the declared face count
        let mut section = lod_section(10);
        section.resize(3 << 20, 0);
        transport
            .assets
            .lock()
            .expect("poisoned lock")
            .insert(mesh_id, build_asset(&[("high_lod", section)]));

        let object = Arc::new(TestObject::plain(2.0, 4.0));
        let dyn_object: Arc<dyn MeshObject> = object.clone();
        let mut repo = make_repo(&cache_dir, &transport);
        repo.load_mesh(&dyn_object, mesh_id, 3, -1);
        spin(&mut repo, 3);

        let requests = transport.requests.lock().expect("poisoned lock");
        let lod_request = requests
            .iter()
            .find(|r| r.len == (3 << 20) as u64)
            .expect("LOD request issued");
        assert_eq!(lod_request.lane, Lane::Large);
        assert_eq!(
            repo.metrics()
                .http_large_request_count
                .load(AtomicOrdering::Relaxed),
            1
        );
    }

    #[test]
    fn header_with_sections_past_the_asset_is_rejected() {
        let dir = tempfile::tempdir().expect("temp dir");
        let cache_dir = dir.path().join("mesh");
        let transport = Arc::new(MockTransport::default());
        let mesh_id = test_mesh_id();
        // the header promises far more LOD bytes than the asset holds
        transport.assets.lock().expect("poisoned lock").insert(
            mesh_id,
            build_asset_with_sizes(&[("medium_lod", lod_section(4), 100_000)]),
        );

        let object = Arc::new(TestObject::plain(2.0, 4.0));
        let dyn_object: Arc<dyn MeshObject> = object.clone();
        let mut repo = make_repo(&cache_dir, &transport);
        repo.load_mesh(&dyn_object, mesh_id, 2, -1);
        spin(&mut repo, 3);

        // only the header fetch went out, the bogus LOD was never chased
        assert_eq!(transport.requests.lock().expect("poisoned lock").len(), 1);
        assert!(object
            .take_notifications()
            .contains(&Notification::Unavailable(mesh_id, 2, -1)));

        // nothing was cached for the unusable asset
        let cache = MeshCache::new(cache_dir.clone()).expect("cache");
        assert!(cache
            .read_preamble(&mesh_id)
            .expect("readable")
            .is_none());
    }

    #[test]
    fn dispatch_takes_the_highest_scores_first() {
        let dir = tempfile::tempdir().expect("temp dir");
        let cache_dir = dir.path().join("mesh");
        let transport = Arc::new(MockTransport::default());
        let mut repo = make_repo(&cache_dir, &transport);

        // the default config resolves to a high water of 40
        let (high, _) = repo.shared().config.water_marks(false);
        assert_eq!(high, 40);

        let mut objects = Vec::new();
        let mut ids = Vec::new();
        for i in 0..100u32 {
            let object: Arc<dyn MeshObject> =
                Arc::new(TestObject::plain(1.0 + i as f32, 2.0));
            let mesh_id = test_mesh_id();
            repo.load_mesh(&object, mesh_id, 2, -1);
            objects.push(object);
            ids.push(mesh_id);
        }

        let region = test_region();
        repo.notify_loaded_meshes(Some(&region));

        // the sixty lowest scores stay pending
        assert_eq!(repo.pending_request_count(), 60);

        let queued: std::collections::HashSet<MeshId> = repo
            .shared()
            .queues
            .lock()
            .expect("poisoned lock")
            .header
            .iter()
            .map(|request| request.mesh_id)
            .collect();
        let expected: std::collections::HashSet<MeshId> =
            ids[60..].iter().copied().collect();
        assert_eq!(queued, expected, "exactly the forty highest scores");
    }

    #[test]
    fn partial_response_without_range_header_is_accepted() {
        let dir = tempfile::tempdir().expect("temp dir");
        let cache_dir = dir.path().join("mesh");
        let transport = Arc::new(MockTransport::default());
        transport
            .strip_content_range
            .store(true, AtomicOrdering::SeqCst);
        let mesh_id = test_mesh_id();
        // small enough that the whole asset sits in the header window
        transport.assets.lock().expect("poisoned lock").insert(
            mesh_id,
            build_asset(&[("medium_lod", lod_section(4))]),
        );

        let object = Arc::new(TestObject::plain(2.0, 4.0));
        let dyn_object: Arc<dyn MeshObject> = object.clone();
        let mut repo = make_repo(&cache_dir, &transport);
        repo.load_mesh(&dyn_object, mesh_id, 2, -1);
        spin(&mut repo, 3);

        assert_eq!(transport.requests.lock().expect("poisoned lock").len(), 1);
        assert!(object
            .take_notifications()
            .contains(&Notification::Loaded(mesh_id, 2)));
    }

    #[test]
    fn absent_physics_mesh_delivers_a_null_shape_without_http() {
        let dir = tempfile::tempdir().expect("temp dir");
        let cache_dir = dir.path().join("mesh");
        let transport = Arc::new(MockTransport::default());
        let mesh_id = test_mesh_id();
        transport.assets.lock().expect("poisoned lock").insert(
            mesh_id,
            build_asset(&[("medium_lod", lod_section(4))]),
        );

        let object = Arc::new(TestObject::plain(2.0, 4.0));
        let dyn_object: Arc<dyn MeshObject> = object.clone();
        let mut repo = make_repo(&cache_dir, &transport);
        repo.load_mesh(&dyn_object, mesh_id, 2, -1);
        spin(&mut repo, 3);
        let baseline = transport.requests.lock().expect("poisoned lock").len();

        repo.fetch_physics_shape(&mesh_id);
        spin(&mut repo, 2);

        assert_eq!(
            transport.requests.lock().expect("poisoned lock").len(),
            baseline,
            "no HTTP for an absent physics shape"
        );
        let decomposition = repo
            .decomposition_for(&mesh_id)
            .expect("null result delivered");
        let shape = decomposition
            .physics_shape_mesh
            .as_ref()
            .expect("shape state known");
        assert!(shape.is_empty());
        assert!(!repo.has_physics_shape(&mesh_id));
    }

    #[test]
    fn lod_requests_coalesce_behind_one_header_fetch() {
        let dir = tempfile::tempdir().expect("temp dir");
        let cache_dir = dir.path().join("mesh");
        let transport = Arc::new(MockTransport::default());
        let mesh_id = test_mesh_id();
        // both LODs fit inside the header window
        transport.assets.lock().expect("poisoned lock").insert(
            mesh_id,
            build_asset(&[
                ("low_lod", lod_section(4)),
                ("high_lod", lod_section(5)),
            ]),
        );

        let first = Arc::new(TestObject::plain(2.0, 4.0));
        let second = Arc::new(TestObject::plain(3.0, 4.0));
        let dyn_first: Arc<dyn MeshObject> = first.clone();
        let dyn_second: Arc<dyn MeshObject> = second.clone();

        let mut repo = make_repo(&cache_dir, &transport);
        repo.load_mesh(&dyn_first, mesh_id, 1, -1);
        repo.load_mesh(&dyn_second, mesh_id, 3, -1);
        spin(&mut repo, 3);

        // one header fetch, both LODs satisfied from its 4 KiB window
        let requests = transport.requests.lock().expect("poisoned lock");
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].offset, 0);
        drop(requests);

        assert!(first
            .take_notifications()
            .contains(&Notification::Loaded(mesh_id, 1)));
        assert!(second
            .take_notifications()
            .contains(&Notification::Loaded(mesh_id, 3)));
    }

    #[test]
    fn load_mesh_returns_the_best_available_substitute() {
        let dir = tempfile::tempdir().expect("temp dir");
        let cache_dir = dir.path().join("mesh");
        let transport = Arc::new(MockTransport::default());
        let mesh_id = test_mesh_id();
        transport.assets.lock().expect("poisoned lock").insert(
            mesh_id,
            build_asset(&[("low_lod", lod_section(4))]),
        );

        let object = Arc::new(TestObject::plain(2.0, 4.0));
        let dyn_object: Arc<dyn MeshObject> = object.clone();
        let mut repo = make_repo(&cache_dir, &transport);
        repo.load_mesh(&dyn_object, mesh_id, 1, -1);
        spin(&mut repo, 3);
        assert!(object
            .take_notifications()
            .contains(&Notification::Loaded(mesh_id, 1)));

        // LOD 3 is not parsed yet, LOD 1 is the best usable stand-in
        assert_eq!(repo.load_mesh(&dyn_object, mesh_id, 3, -1), 1);
        // an explicit last LOD wins over the downward search
        assert_eq!(repo.load_mesh(&dyn_object, mesh_id, 2, 1), 1);
    }
}

/// Routes a LOD request: straight to the LOD queue when the header is
/// known, otherwise coalesced into the pending table behind at most one
/// header fetch per identifier.
fn queue_lod_request(
    queues: &mut RequestQueues,
    headers: &HashMap<MeshId, crate::asset::header::MeshHeader>,
    pending_lods: &mut HashMap<MeshId, [u32; NUM_LODS]>,
    metrics: &RepoMetrics,
    mesh_id: MeshId,
    lod: i32,
) {
    if headers.contains_key(&mesh_id) {
        queues.lod.push_back(LodRequest::new(mesh_id, lod));
        metrics.lod_processing.fetch_add(1, Ordering::Relaxed);
    } else if let Some(counts) = pending_lods.get_mut(&mesh_id) {
        // a header fetch is already on its way, piggyback on it
        counts[lod as usize] += 1;
    } else {
        let mut counts = [0u32; NUM_LODS];
        counts[lod as usize] = 1;
        pending_lods.insert(mesh_id, counts);
        queues.header.push_back(HeaderRequest::new(mesh_id));
    }
}
