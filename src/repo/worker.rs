use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{channel, sync_channel, Receiver, Sender, SyncSender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use itertools::Itertools;
use log::{debug, info, trace, warn};

use dashmap::DashMap;

use crate::asset::header::MeshHeader;
use crate::asset::parse::{
    parse_decomposition, parse_physics_mesh, parse_skin_info, parse_volume_faces, try_alloc_vec,
    update_rigging_info,
};
use crate::asset::types::{
    Decomposition, MeshId, MeshProcessResult, SectionKind, SkinInfo, Volume,
};
use crate::error::RepoError;
use crate::io::cache::{leading_kilobyte_is_zero, MeshCache};
use crate::io::http::{ByteRangeRequest, HandleId, HttpCompletion, Lane, Transport};
use crate::repo::handlers::{has_outstanding_section, FetchHandler, HandlerKind};
use crate::repo::metrics::RepoMetrics;
use crate::repo::pool::ParsePool;
use crate::repo::request::{HeaderRequest, LodRequest, SectionRequest};
use crate::settings::RepoConfig;
use crate::{
    CACHE_PREAMBLE_SIZE, LARGE_MESH_FETCH_THRESHOLD, MAX_ALLOC_SOFT_QUIT, MAX_MESH_VERSION,
    MESH_HEADER_SIZE, NUM_LODS, REQUEST2_HIGH_WATER_MIN, REQUEST2_LOW_WATER_MIN,
};

/// Budget for draining the cross-thread work queue per loop iteration.
const WORK_QUEUE_BUDGET: Duration = Duration::from_millis(8);
const WORK_QUEUE_DEPTH: usize = 1024;

/// Closure executed on the repo worker thread, used for cross-thread
/// state edits such as skin map evictions.
pub(crate) type WorkItem = Box<dyn FnOnce(&Arc<RepoShared>) + Send>;

/// Capability URLs of the current region, in the order they are tried:
/// the modern asset capability, then legacy v2, then legacy v1.
#[derive(Debug, Clone, Default)]
pub struct MeshCaps {
    pub viewer_asset: Option<String>,
    pub legacy_v2: Option<String>,
    pub legacy_v1: Option<String>,
    /// 0 = modern, 2 = legacy v2, 1 = legacy v1.
    pub preferred_version: i32,
}

impl MeshCaps {
    /// Builds the fetch URL for a mesh, preferring the newest transport
    /// the region advertises.
    pub fn construct_url(&self, mesh_id: &MeshId) -> Option<(String, i32)> {
        let (base, version) = if self.viewer_asset.is_some() && self.preferred_version == 0 {
            (self.viewer_asset.as_ref(), 0)
        } else if self.legacy_v2.is_some() && self.preferred_version > 1 {
            (self.legacy_v2.as_ref(), 2)
        } else {
            (self.legacy_v1.as_ref(), 1)
        };
        base.map(|base| (format!("{}/?mesh_id={}", base, mesh_id), version))
    }
}

pub(crate) struct RequestQueues {
    pub skin: VecDeque<SectionRequest>,
    pub lod: VecDeque<LodRequest>,
    pub header: VecDeque<HeaderRequest>,
    pub decomposition: VecDeque<SectionRequest>,
    pub physics_shape: VecDeque<SectionRequest>,
    pub caps: MeshCaps,
}

impl RequestQueues {
    fn new() -> Self {
        Self {
            skin: VecDeque::new(),
            lod: VecDeque::new(),
            header: VecDeque::new(),
            decomposition: VecDeque::new(),
            physics_shape: VecDeque::new(),
            caps: MeshCaps::default(),
        }
    }
}

/// Completion queues drained by the render thread. FIFO per queue, the
/// results become visible across a `notify_loaded_meshes` call.
#[derive(Default)]
pub(crate) struct LoadedQueues {
    pub loaded: VecDeque<Arc<Volume>>,
    pub unavailable: VecDeque<(MeshId, i32)>,
    pub skins: VecDeque<Arc<SkinInfo>>,
    pub skin_unavailable: VecDeque<MeshId>,
    pub decompositions: VecDeque<Decomposition>,
}

/// State shared between the registry, the repo worker thread, the parse
/// pool and the HTTP handlers. Lock order is worker (queues), then
/// headers, then pending, the completion queues are leaf locks.
pub(crate) struct RepoShared {
    pub config: RepoConfig,
    pub cache: MeshCache,
    pub metrics: Arc<RepoMetrics>,
    pub transport: Arc<dyn Transport>,

    pub queues: Mutex<RequestQueues>,
    pub headers: Mutex<HashMap<MeshId, MeshHeader>>,
    pub pending_lods: Mutex<HashMap<MeshId, [u32; NUM_LODS]>>,
    pub loaded: Mutex<LoadedQueues>,

    /// Worker side copy of the skin descriptors, read by the parse pool
    /// when a LOD needs its rigging data. The registry owns a separate
    /// main-thread map and evicts both through the work queue.
    pub skin_map: DashMap<MeshId, Arc<SkinInfo>>,

    pub outstanding: Mutex<HashMap<HandleId, FetchHandler>>,
    next_handle: AtomicU64,

    work_sender: SyncSender<WorkItem>,
    work_receiver: Mutex<Receiver<WorkItem>>,
    completion_sender: Sender<HttpCompletion>,
    completion_receiver: Mutex<Receiver<HttpCompletion>>,

    signal: Condvar,
    signal_state: Mutex<bool>,

    quitting: AtomicBool,
    /// Raised when a moderately sized allocation failed, the embedding
    /// client is expected to begin an orderly shutdown.
    pub soft_quit: AtomicBool,

    pub pool: ParsePool,

    pub high_water: AtomicUsize,
    pub low_water: AtomicUsize,

    pub active_header_requests: AtomicI64,
    pub active_lod_requests: AtomicI64,
    pub active_skin_requests: AtomicI64,
}

impl RepoShared {
    pub fn new(
        config: RepoConfig,
        transport: Arc<dyn Transport>,
        metrics: Arc<RepoMetrics>,
    ) -> Result<Arc<Self>, RepoError> {
        let cache = MeshCache::new(config.cache_dir.clone())?;
        let (work_sender, work_receiver) = sync_channel(WORK_QUEUE_DEPTH);
        let (completion_sender, completion_receiver) = channel();
        let (high, low) = config.water_marks(false);
        let pool = ParsePool::new(config.parse_pool_size);

        Ok(Arc::new(Self {
            config,
            cache,
            metrics,
            transport,
            queues: Mutex::new(RequestQueues::new()),
            headers: Mutex::new(HashMap::new()),
            pending_lods: Mutex::new(HashMap::new()),
            loaded: Mutex::new(LoadedQueues::default()),
            skin_map: DashMap::new(),
            outstanding: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            work_sender,
            work_receiver: Mutex::new(work_receiver),
            completion_sender,
            completion_receiver: Mutex::new(completion_receiver),
            signal: Condvar::new(),
            signal_state: Mutex::new(false),
            quitting: AtomicBool::new(false),
            soft_quit: AtomicBool::new(false),
            pool,
            high_water: AtomicUsize::new(high.max(REQUEST2_HIGH_WATER_MIN as usize)),
            low_water: AtomicUsize::new(low.max(REQUEST2_LOW_WATER_MIN as usize)),
            active_header_requests: AtomicI64::new(0),
            active_lod_requests: AtomicI64::new(0),
            active_skin_requests: AtomicI64::new(0),
        }))
    }

    pub fn spawn(shared: &Arc<RepoShared>) -> JoinHandle<()> {
        let shared = shared.clone();
        std::thread::Builder::new()
            .name("mesh-repo".into())
            .spawn(move || worker_loop(shared))
            .expect("spawning mesh repo worker")
    }

    pub fn is_quitting(&self) -> bool {
        self.quitting.load(Ordering::SeqCst)
    }

    pub fn begin_shutdown(&self) {
        self.quitting.store(true, Ordering::SeqCst);
        self.signal();
    }

    /// Wakes the worker. Called by the registry once per frame and by
    /// anything that enqueued new work.
    pub fn signal(&self) {
        let mut flagged = self.signal_state.lock().expect("poisoned lock");
        *flagged = true;
        self.signal.notify_all();
    }

    /// Queues a closure for the worker thread. The queue is bounded, a
    /// dropped item is only ever a deferred eviction so losing one under
    /// pressure is harmless.
    pub fn post_work(&self, item: WorkItem) {
        if self.work_sender.try_send(item).is_err() {
            debug!("Mesh repo work queue saturated, dropping item");
        }
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding.lock().expect("poisoned lock").len()
    }

    // ------------------------------------------------------------------
    // queries used by the registry, all take the header mutex briefly

    pub fn has_header(&self, mesh_id: &MeshId) -> bool {
        self.headers
            .lock()
            .expect("poisoned lock")
            .contains_key(mesh_id)
    }

    pub fn has_skin_in_header(&self, mesh_id: &MeshId) -> bool {
        let headers = self.headers.lock().expect("poisoned lock");
        headers
            .get(mesh_id)
            .map(|header| header.header_size > 0 && header.skin.is_present())
            .unwrap_or(false)
    }

    pub fn has_physics_shape_in_header(&self, mesh_id: &MeshId) -> bool {
        let headers = self.headers.lock().expect("poisoned lock");
        headers
            .get(mesh_id)
            .map(|header| header.header_size > 0 && header.physics_mesh.is_present())
            .unwrap_or(false)
    }

    pub fn creator_from_header(&self, mesh_id: &MeshId) -> Option<MeshId> {
        let headers = self.headers.lock().expect("poisoned lock");
        headers.get(mesh_id).and_then(|header| header.creator)
    }

    /// LOD byte size from the header, -1 while unknown or for missing
    /// assets.
    pub fn mesh_size(&self, mesh_id: &MeshId, lod: i32) -> i64 {
        if !(0..NUM_LODS as i32).contains(&lod) {
            return -1;
        }
        let headers = self.headers.lock().expect("poisoned lock");
        match headers.get(mesh_id) {
            Some(header) if header.header_size > 0 && !header.not_found => {
                header.lods[lod as usize].size as i64
            }
            _ => -1,
        }
    }

    /// Nearest LOD with data for the desired detail level, or the
    /// desired one while the header is unknown.
    pub fn actual_lod(&self, mesh_id: &MeshId, lod: i32) -> i32 {
        let mut headers = self.headers.lock().expect("poisoned lock");
        match headers.get_mut(mesh_id) {
            Some(header) if header.header_size > 0 => header.actual_lod(lod),
            Some(header) if header.not_found => -1,
            _ => lod,
        }
    }

    // ------------------------------------------------------------------
    // queue plumbing shared with the handlers

    pub fn enqueue_lod(&self, request: LodRequest) {
        let mut queues = self.queues.lock().expect("poisoned lock");
        queues.lod.push_back(request);
        self.metrics.lod_processing.fetch_add(1, Ordering::Relaxed);
    }

    pub fn push_lod_unavailable(&self, mesh_id: &MeshId, lod: i32) {
        let mut loaded = self.loaded.lock().expect("poisoned lock");
        loaded.unavailable.push_back((*mesh_id, lod));
    }

    pub fn push_all_lods_unavailable(&self, mesh_id: &MeshId) {
        let mut loaded = self.loaded.lock().expect("poisoned lock");
        for lod in 0..NUM_LODS as i32 {
            loaded.unavailable.push_back((*mesh_id, lod));
        }
    }

    pub fn push_skin_unavailable(&self, mesh_id: &MeshId) {
        let mut loaded = self.loaded.lock().expect("poisoned lock");
        loaded.skin_unavailable.push_back(*mesh_id);
    }

    /// Terminal failure of a header fetch: remember the asset as missing
    /// and fail every waiter.
    pub fn mark_header_not_found(&self, mesh_id: &MeshId) {
        {
            let mut headers = self.headers.lock().expect("poisoned lock");
            headers.entry(*mesh_id).or_default().not_found = true;
        }
        self.pending_lods
            .lock()
            .expect("poisoned lock")
            .remove(mesh_id);
        self.push_all_lods_unavailable(mesh_id);
        self.push_skin_unavailable(mesh_id);
    }

    /// A cached sub-section turned out to be zeros or unparsable. The
    /// policy is conservative: every presence bit is dropped and the
    /// preamble rewritten, later fetches go back to HTTP.
    pub fn invalidate_cached_sections(&self, mesh_id: &MeshId) {
        debug!("Mesh header for ID {} cache mismatch", mesh_id);
        let rewrite = {
            let mut headers = self.headers.lock().expect("poisoned lock");
            match headers.get_mut(mesh_id) {
                Some(header) => {
                    header.clear_cache_flags();
                    (header.header_size > 0).then(|| (header.header_size, header.flags()))
                }
                None => None,
            }
        };
        if let Some((header_size, flags)) = rewrite {
            if let Err(e) = self.cache.write_preamble(mesh_id, header_size, flags) {
                warn!("Failed to rewrite cache preamble for {}: {}", mesh_id, e);
            }
        }
    }

    /// Persists freshly fetched sub-section bytes and flips its presence
    /// bit. The bit only transitions once the write went through.
    pub fn write_section_to_cache(
        &self,
        mesh_id: &MeshId,
        kind: SectionKind,
        blob_offset: u64,
        data: &[u8],
    ) {
        let blob_len = self.cache.blob_len(mesh_id).unwrap_or(0);
        if blob_len < blob_offset + data.len() as u64 {
            // the blob was never reserved for this asset, skip caching
            return;
        }

        if let Err(e) = self.cache.write_range(mesh_id, blob_offset, data) {
            warn!("Failed to cache mesh sub-section for {}: {}", mesh_id, e);
            return;
        }
        self.metrics.cache_writes.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .cache_bytes_written
            .fetch_add(data.len() as u64, Ordering::Relaxed);

        let newly_cached = {
            let mut headers = self.headers.lock().expect("poisoned lock");
            match headers.get_mut(mesh_id) {
                Some(header) if !header.section_in_cache(kind) => {
                    header.set_section_in_cache(kind, true);
                    Some((header.header_size, header.flags()))
                }
                _ => None,
            }
        };
        if let Some((header_size, flags)) = newly_cached {
            if let Err(e) = self.cache.write_preamble(mesh_id, header_size, flags) {
                warn!("Failed to update cache preamble for {}: {}", mesh_id, e);
            }
        }
    }

    // ------------------------------------------------------------------
    // received paths, shared by the cache probes and the HTTP handlers

    /// Header processing state machine. Also satisfies waiting skin and
    /// LOD requests opportunistically out of the bytes already in hand.
    pub fn header_received(
        &self,
        mesh_id: &MeshId,
        data: &[u8],
        cache_flags: u32,
    ) -> MeshProcessResult {
        let header = match MeshHeader::from_asset_bytes(mesh_id, data, cache_flags) {
            Ok(header) => header,
            Err(result) => return result,
        };

        {
            let mut headers = self.headers.lock().expect("poisoned lock");
            headers.insert(*mesh_id, header.clone());
        }
        self.metrics
            .cache_bytes_headers
            .fetch_add(header.header_size as u64, Ordering::Relaxed);

        // request the skin right away, it gates rigged rendering of
        // every LOD
        if !header.not_found && header.skin.is_present() {
            let mut request_skin = true;
            if header.section_in_window(&header.skin, data.len()) {
                let offset = header.header_size as usize + header.skin.offset as usize;
                let size = header.skin.size as usize;
                request_skin = !self.skin_received(mesh_id, &data[offset..offset + size]);
            }
            if request_skin {
                let mut queues = self.queues.lock().expect("poisoned lock");
                queues.skin.push_back(SectionRequest::new(*mesh_id));
            }
        }

        let pending = self
            .pending_lods
            .lock()
            .expect("poisoned lock")
            .remove(mesh_id);

        if let Some(counts) = pending {
            for (lod, count) in counts.iter().enumerate() {
                if *count == 0 {
                    continue;
                }
                if *count > 1 {
                    info!(
                        "Multiple duplicate requests for mesh ID: {} LOD: {}",
                        mesh_id, lod
                    );
                }
                let section = header.lods[lod];
                if header.not_found || !section.is_present() {
                    self.push_lod_unavailable(mesh_id, lod as i32);
                    continue;
                }

                // the initial 4 KiB window may already contain this LOD
                let mut request_lod = true;
                if header.section_in_window(&section, data.len()) {
                    let offset = header.header_size as usize + section.offset as usize;
                    let size = section.size as usize;
                    request_lod = self.lod_received(mesh_id, lod as i32, &data[offset..offset + size])
                        != MeshProcessResult::Ok;
                }
                if request_lod {
                    self.enqueue_lod(LodRequest::new(*mesh_id, lod as i32));
                }
            }
        }

        MeshProcessResult::Ok
    }

    pub fn lod_received(&self, mesh_id: &MeshId, lod: i32, data: &[u8]) -> MeshProcessResult {
        if data.is_empty() {
            return MeshProcessResult::NoData;
        }

        let mut faces = match parse_volume_faces(data) {
            Ok(faces) => faces,
            Err(RepoError::BufferExhausted { size }) => {
                warn!("Out of memory for mesh ID {} of size: {}", mesh_id, size);
                self.note_allocation_failure(size);
                return MeshProcessResult::Unknown;
            }
            Err(_) => return MeshProcessResult::Unknown,
        };
        if faces.is_empty() {
            return MeshProcessResult::Unknown;
        }

        if let Some(skin) = self.skin_map.get(mesh_id) {
            // cache per face rigging data while the bytes are hot
            update_rigging_info(&mut faces, skin.value());
        }

        let volume = Arc::new(Volume {
            mesh_id: *mesh_id,
            lod,
            faces,
        });
        let mut loaded = self.loaded.lock().expect("poisoned lock");
        loaded.loaded.push_back(volume);
        MeshProcessResult::Ok
    }

    pub fn skin_received(&self, mesh_id: &MeshId, data: &[u8]) -> bool {
        let skin = match parse_skin_info(mesh_id, data) {
            Ok(skin) => Arc::new(skin),
            Err(RepoError::BufferExhausted { size }) => {
                warn!("Out of memory for mesh ID {} of size: {}", mesh_id, size);
                self.note_allocation_failure(size);
                return false;
            }
            Err(e) => {
                warn!(
                    "Mesh skin info parse error, not a valid mesh asset. ID: {} ({})",
                    mesh_id, e
                );
                return false;
            }
        };

        self.metrics
            .cache_bytes_skins
            .fetch_add(skin.size_bytes() as u64, Ordering::Relaxed);
        // the worker keeps its own copy so the registry's reference
        // count only reflects holders outside the cache
        self.skin_map.insert(*mesh_id, Arc::new((*skin).clone()));

        let mut loaded = self.loaded.lock().expect("poisoned lock");
        loaded.skins.push_back(skin);
        true
    }

    pub fn decomposition_received(&self, mesh_id: &MeshId, data: &[u8]) -> bool {
        let decomposition = match parse_decomposition(mesh_id, data) {
            Ok(decomposition) => decomposition,
            Err(RepoError::BufferExhausted { size }) => {
                warn!("Out of memory for mesh ID {} of size: {}", mesh_id, size);
                self.note_allocation_failure(size);
                return false;
            }
            Err(e) => {
                warn!(
                    "Mesh decomposition parse error, not a valid mesh asset. ID: {} ({})",
                    mesh_id, e
                );
                return false;
            }
        };

        self.metrics
            .cache_bytes_decomps
            .fetch_add(decomposition.size_bytes() as u64, Ordering::Relaxed);
        let mut loaded = self.loaded.lock().expect("poisoned lock");
        loaded.decompositions.push_back(decomposition);
        true
    }

    pub fn physics_shape_received(&self, mesh_id: &MeshId, data: Option<&[u8]>) -> MeshProcessResult {
        let decomposition = match parse_physics_mesh(mesh_id, data) {
            Ok(decomposition) => decomposition,
            Err(_) => {
                // deliver an empty shape, the asset has nothing usable
                let mut fallback = Decomposition::new(*mesh_id);
                fallback.physics_shape_mesh = Some(Default::default());
                fallback
            }
        };
        let mut loaded = self.loaded.lock().expect("poisoned lock");
        loaded.decompositions.push_back(decomposition);
        MeshProcessResult::Ok
    }

    fn note_allocation_failure(&self, size: usize) {
        if size < MAX_ALLOC_SOFT_QUIT {
            // a moderate allocation failing means memory is truly gone
            self.soft_quit.store(true, Ordering::SeqCst);
        }
    }

    fn alloc_read_buffer(&self, size: usize) -> Option<Vec<u8>> {
        match try_alloc_vec::<u8>(size) {
            Ok(mut buffer) => {
                buffer.resize(size, 0);
                Some(buffer)
            }
            Err(_) => {
                warn!("Failed to allocate memory for cached mesh data, size: {}", size);
                self.note_allocation_failure(size);
                None
            }
        }
    }

    fn construct_url(&self, mesh_id: &MeshId) -> Option<(String, i32)> {
        let queues = self.queues.lock().expect("poisoned lock");
        let url = queues.caps.construct_url(mesh_id);
        if url.is_none() {
            warn!("No region capability known, cannot fetch mesh {}", mesh_id);
        }
        url
    }

    /// Issues a ranged GET on the policy lane the size and transport
    /// generation call for, and tracks the handler until its completion
    /// is flushed.
    fn submit_byte_range(
        &self,
        kind: HandlerKind,
        url: String,
        cap_version: i32,
        offset: u64,
        len: u64,
    ) {
        let lane = if len >= LARGE_MESH_FETCH_THRESHOLD {
            self.metrics
                .http_large_request_count
                .fetch_add(1, Ordering::Relaxed);
            Lane::Large
        } else {
            self.metrics.http_request_count.fetch_add(1, Ordering::Relaxed);
            if cap_version == 1 {
                Lane::Legacy
            } else {
                Lane::Small
            }
        };
        let timeout = match lane {
            Lane::Large => self.config.large_timeout(),
            _ => self.config.small_timeout(),
        };

        match &kind {
            HandlerKind::Header { .. } => {
                self.active_header_requests.fetch_add(1, Ordering::Relaxed);
            }
            HandlerKind::Lod { .. } => {
                self.active_lod_requests.fetch_add(1, Ordering::Relaxed);
            }
            HandlerKind::Skin { .. } => {
                self.active_skin_requests.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }

        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let handler = FetchHandler {
            offset,
            requested: len,
            handle,
            processed: false,
            kind,
        };
        self.outstanding
            .lock()
            .expect("poisoned lock")
            .insert(handle, handler);

        self.transport.submit_byte_range(
            ByteRangeRequest {
                handle,
                url,
                lane,
                offset,
                len,
            },
            timeout,
            self.completion_sender.clone(),
        );
    }

    // ------------------------------------------------------------------
    // fetch attempts, cache first then HTTP

    /// Returns false when the attempt should be retried by the caller.
    fn fetch_mesh_header(&self, request: &HeaderRequest) -> bool {
        let mesh_id = request.mesh_id;
        self.metrics.mesh_request_count.fetch_add(1, Ordering::Relaxed);

        match self.cache.read_header_block(&mesh_id) {
            Ok(Some((preamble, bytes))) => {
                self.metrics.cache_reads.fetch_add(1, Ordering::Relaxed);
                self.metrics
                    .cache_bytes_read
                    .fetch_add(bytes.len() as u64, Ordering::Relaxed);
                if self.header_received(&mesh_id, &bytes, preamble.flags) == MeshProcessResult::Ok {
                    debug!("Mesh header for ID {} was retrieved from the cache", mesh_id);
                    return true;
                }
            }
            Ok(None) => {}
            Err(e) => debug!("Cache probe for mesh header {} failed: {}", mesh_id, e),
        }

        {
            let outstanding = self.outstanding.lock().expect("poisoned lock");
            if has_outstanding_section(&outstanding, &mesh_id, None) {
                return true;
            }
        }

        let Some((url, cap_version)) = self.construct_url(&mesh_id) else {
            // without a capability nothing can be fetched at all,
            // keep the request out of the retry loop
            return true;
        };

        debug!("Mesh header for ID {} will be retrieved from the server", mesh_id);
        self.submit_byte_range(
            HandlerKind::Header {
                mesh_id,
                stats: request.stats.clone(),
            },
            url,
            cap_version,
            0,
            MESH_HEADER_SIZE as u64,
        );
        true
    }

    fn fetch_mesh_decomposition(&self, request: &SectionRequest, scratch: &mut DiskBuffer) -> bool {
        let mesh_id = request.mesh_id;
        let header = {
            let headers = self.headers.lock().expect("poisoned lock");
            match headers.get(&mesh_id) {
                Some(header) => header.clone(),
                None => return false,
            }
        };
        self.metrics.mesh_request_count.fetch_add(1, Ordering::Relaxed);

        if header.header_size == 0 || header.not_found {
            return true;
        }

        let section = header.physics_convex;
        let offset = header.header_size as u64 + section.offset as u64;
        if header.version > MAX_MESH_VERSION || !section.is_present() {
            // decomposition data is optional, nothing to report back
            debug!("Mesh {} has no decomposition block", mesh_id);
            return true;
        }

        let size = section.size as usize;
        let blob_offset = offset + CACHE_PREAMBLE_SIZE;
        if header.physics_convex_in_cache
            && self.cache.blob_len(&mesh_id).unwrap_or(0) >= blob_offset + size as u64
        {
            if let Some(buffer) = scratch.get(self, size) {
                match self.cache.read_range_into(&mesh_id, blob_offset, buffer) {
                    Ok(Some(())) => {
                        self.metrics.cache_reads.fetch_add(1, Ordering::Relaxed);
                        self.metrics
                            .cache_bytes_read
                            .fetch_add(size as u64, Ordering::Relaxed);
                        if !leading_kilobyte_is_zero(buffer) {
                            if self.decomposition_received(&mesh_id, buffer) {
                                return true;
                            }
                        } else {
                            self.invalidate_cached_sections(&mesh_id);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        debug!("Cache read for mesh {} decomposition failed: {}", mesh_id, e)
                    }
                }
            }
        }

        {
            let outstanding = self.outstanding.lock().expect("poisoned lock");
            if has_outstanding_section(&outstanding, &mesh_id, Some(SectionKind::PhysicsConvex)) {
                return true;
            }
        }

        let Some((url, cap_version)) = self.construct_url(&mesh_id) else {
            return true;
        };
        self.submit_byte_range(
            HandlerKind::Decomposition { mesh_id },
            url,
            cap_version,
            offset,
            size as u64,
        );
        true
    }

    fn fetch_mesh_physics_shape(&self, request: &SectionRequest, scratch: &mut DiskBuffer) -> bool {
        let mesh_id = request.mesh_id;
        let header = {
            let headers = self.headers.lock().expect("poisoned lock");
            match headers.get(&mesh_id) {
                Some(header) => header.clone(),
                None => return false,
            }
        };
        self.metrics.mesh_request_count.fetch_add(1, Ordering::Relaxed);

        if header.header_size == 0 || header.not_found {
            return true;
        }

        let section = header.physics_mesh;
        if !section.is_present() {
            // no physics shape exists, deliver the null result without
            // touching the network
            self.physics_shape_received(&mesh_id, None);
            return true;
        }

        let offset = header.header_size as u64 + section.offset as u64;
        if header.version > MAX_MESH_VERSION {
            return true;
        }

        let size = section.size as usize;
        let blob_offset = offset + CACHE_PREAMBLE_SIZE;
        if header.physics_mesh_in_cache
            && self.cache.blob_len(&mesh_id).unwrap_or(0) >= blob_offset + size as u64
        {
            if let Some(buffer) = scratch.get(self, size) {
                match self.cache.read_range_into(&mesh_id, blob_offset, buffer) {
                    Ok(Some(())) => {
                        self.metrics.cache_reads.fetch_add(1, Ordering::Relaxed);
                        self.metrics
                            .cache_bytes_read
                            .fetch_add(size as u64, Ordering::Relaxed);
                        if !leading_kilobyte_is_zero(buffer) {
                            if self.physics_shape_received(&mesh_id, Some(buffer))
                                == MeshProcessResult::Ok
                            {
                                return true;
                            }
                        } else {
                            self.invalidate_cached_sections(&mesh_id);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        debug!("Cache read for mesh {} physics shape failed: {}", mesh_id, e)
                    }
                }
            }
        }

        {
            let outstanding = self.outstanding.lock().expect("poisoned lock");
            if has_outstanding_section(&outstanding, &mesh_id, Some(SectionKind::PhysicsMesh)) {
                return true;
            }
        }

        let Some((url, cap_version)) = self.construct_url(&mesh_id) else {
            return true;
        };
        self.submit_byte_range(
            HandlerKind::PhysicsShape { mesh_id },
            url,
            cap_version,
            offset,
            size as u64,
        );
        true
    }
}

/// The fetch attempts that hand buffers to the parse pool need the
/// shared state by `Arc` so their tasks can own a reference, which is
/// why these live outside the impl.
fn fetch_mesh_lod(shared: &Arc<RepoShared>, request: &LodRequest) -> bool {
    let mesh_id = request.mesh_id;
    let lod = request.lod;
    let header = {
        let headers = shared.headers.lock().expect("poisoned lock");
        match headers.get(&mesh_id) {
            Some(header) => header.clone(),
            None => return false, // no header info yet, do nothing
        }
    };
    shared
        .metrics
        .mesh_request_count
        .fetch_add(1, Ordering::Relaxed);

    if header.header_size == 0 || header.not_found {
        // missing assets fail their waiters straight away
        shared.push_lod_unavailable(&mesh_id, lod);
        return true;
    }

    let section = header.lods[lod as usize];
    let offset = header.header_size as u64 + section.offset as u64;
    if header.version > MAX_MESH_VERSION || !section.is_present() {
        shared.push_lod_unavailable(&mesh_id, lod);
        return true;
    }

    let size = section.size as usize;
    let blob_offset = offset + CACHE_PREAMBLE_SIZE;
    if header.lod_in_cache[lod as usize]
        && shared.cache.blob_len(&mesh_id).unwrap_or(0) >= blob_offset + size as u64
    {
        let Some(mut buffer) = shared.alloc_read_buffer(size) else {
            shared.push_lod_unavailable(&mesh_id, lod);
            return true;
        };
        match shared.cache.read_range_into(&mesh_id, blob_offset, &mut buffer) {
            Ok(Some(())) => {
                shared.metrics.cache_reads.fetch_add(1, Ordering::Relaxed);
                shared
                    .metrics
                    .cache_bytes_read
                    .fetch_add(size as u64, Ordering::Relaxed);

                if !leading_kilobyte_is_zero(&buffer) {
                    let pool_shared = shared.clone();
                    let retry = request.clone();
                    let posted = shared.pool.post(Box::new(move || {
                        if pool_shared.is_quitting() {
                            return;
                        }
                        let result = pool_shared.lod_received(&retry.mesh_id, retry.lod, &buffer);
                        if result == MeshProcessResult::Ok {
                            debug!(
                                "Mesh body for ID {} was retrieved from the cache",
                                retry.mesh_id
                            );
                        } else {
                            // the header lied or something stomped the blob
                            pool_shared.invalidate_cached_sections(&retry.mesh_id);
                            pool_shared.enqueue_lod(retry);
                        }
                    }));
                    match posted {
                        Ok(()) => return true,
                        Err(task) => {
                            // pool is gone or saturated, parse inline
                            info!("Failed to post work into the mesh parse pool");
                            task();
                            return true;
                        }
                    }
                }

                // reserved but unwritten region, drop every presence
                // bit and go back to the network
                shared.invalidate_cached_sections(&mesh_id);
            }
            Ok(None) => {}
            Err(e) => debug!("Cache read for mesh {} LOD {} failed: {}", mesh_id, lod, e),
        }
    }

    {
        let outstanding = shared.outstanding.lock().expect("poisoned lock");
        if has_outstanding_section(&outstanding, &mesh_id, Some(SectionKind::Lod(lod as usize))) {
            return true;
        }
    }

    let Some((url, cap_version)) = shared.construct_url(&mesh_id) else {
        shared.push_lod_unavailable(&mesh_id, lod);
        return true;
    };
    debug!("Mesh body for ID {} will be retrieved from the server", mesh_id);
    shared.submit_byte_range(
        HandlerKind::Lod {
            mesh_id,
            lod,
            stats: request.stats.clone(),
        },
        url,
        cap_version,
        offset,
        size as u64,
    );
    true
}

fn fetch_mesh_skin(shared: &Arc<RepoShared>, request: &SectionRequest) -> bool {
    let mesh_id = request.mesh_id;

    if let Some(skin) = shared.skin_map.get(&mesh_id) {
        // already parsed for another waiter, deliver a fresh copy so
        // the registry's reference counting stays meaningful
        let skin = Arc::new(skin.value().as_ref().clone());
        let mut loaded = shared.loaded.lock().expect("poisoned lock");
        loaded.skins.push_back(skin);
        return true;
    }

    let header = {
        let headers = shared.headers.lock().expect("poisoned lock");
        match headers.get(&mesh_id) {
            Some(header) => header.clone(),
            None => return false,
        }
    };
    shared
        .metrics
        .mesh_request_count
        .fetch_add(1, Ordering::Relaxed);

    if header.header_size == 0 || header.not_found {
        shared.push_skin_unavailable(&mesh_id);
        return true;
    }

    let section = header.skin;
    let offset = header.header_size as u64 + section.offset as u64;
    if header.version > MAX_MESH_VERSION || !section.is_present() {
        shared.push_skin_unavailable(&mesh_id);
        return true;
    }

    let size = section.size as usize;
    let blob_offset = offset + CACHE_PREAMBLE_SIZE;
    if header.skin_in_cache
        && shared.cache.blob_len(&mesh_id).unwrap_or(0) >= blob_offset + size as u64
    {
        let Some(mut buffer) = shared.alloc_read_buffer(size) else {
            shared.push_skin_unavailable(&mesh_id);
            return true;
        };
        match shared.cache.read_range_into(&mesh_id, blob_offset, &mut buffer) {
            Ok(Some(())) => {
                shared.metrics.cache_reads.fetch_add(1, Ordering::Relaxed);
                shared
                    .metrics
                    .cache_bytes_read
                    .fetch_add(size as u64, Ordering::Relaxed);

                if !leading_kilobyte_is_zero(&buffer) {
                    let pool_shared = shared.clone();
                    let retry = request.clone();
                    let posted = shared.pool.post(Box::new(move || {
                        if pool_shared.is_quitting() {
                            return;
                        }
                        if !pool_shared.skin_received(&retry.mesh_id, &buffer) {
                            pool_shared.invalidate_cached_sections(&retry.mesh_id);
                            let mut queues = pool_shared.queues.lock().expect("poisoned lock");
                            queues.skin.push_back(retry);
                        }
                    }));
                    match posted {
                        Ok(()) => return true,
                        Err(task) => {
                            info!("Failed to post work into the mesh parse pool");
                            task();
                            return true;
                        }
                    }
                }

                shared.invalidate_cached_sections(&mesh_id);
            }
            Ok(None) => {}
            Err(e) => debug!("Cache read for mesh {} skin failed: {}", mesh_id, e),
        }
    }

    {
        let outstanding = shared.outstanding.lock().expect("poisoned lock");
        if has_outstanding_section(&outstanding, &mesh_id, Some(SectionKind::Skin)) {
            return true;
        }
    }

    let Some((url, cap_version)) = shared.construct_url(&mesh_id) else {
        shared.push_skin_unavailable(&mesh_id);
        return true;
    };
    shared.submit_byte_range(
        HandlerKind::Skin {
            mesh_id,
            stats: request.stats.clone(),
        },
        url,
        cap_version,
        offset,
        size as u64,
    );
    true
}

/// One pass of the worker: drain the work queue for its budget, flush
/// HTTP completions, then walk the five request sources in priority
/// order while the handle set stays below high water.
pub(crate) fn process(shared: &Arc<RepoShared>, scratch: &mut DiskBuffer) {
    let start = Instant::now();
    loop {
        let item = {
            let receiver = shared.work_receiver.lock().expect("poisoned lock");
            receiver.try_recv()
        };
        match item {
            Ok(item) => item(shared),
            Err(_) => break,
        }
        if start.elapsed() >= WORK_QUEUE_BUDGET {
            break;
        }
    }

    // dispatch queued handler notifications on this thread
    loop {
        let completion = {
            let receiver = shared.completion_receiver.lock().expect("poisoned lock");
            receiver.try_recv()
        };
        let Ok(completion) = completion else { break };
        let handler = shared
            .outstanding
            .lock()
            .expect("poisoned lock")
            .remove(&completion.handle);
        match handler {
            Some(handler) => handler.on_completed(shared, completion),
            None => trace!("Completion for an unknown mesh fetch handle, ignoring"),
        }
    }

    shared
        .metrics
        .request_water_level
        .store(shared.outstanding_count() as i64, Ordering::Relaxed);

    let now = Instant::now();
    // queue order intentionally favors skin and LOD work over new
    // headers, decomposition data is diagnostic and goes last
    process_skin_queue(shared, now);
    process_lod_queue(shared, now);
    process_header_queue(shared, now);
    process_decomposition_queue(shared, now, scratch);
    process_physics_queue(shared, now, scratch);
}

fn process_skin_queue(shared: &Arc<RepoShared>, now: Instant) {
    let high_water = shared.high_water.load(Ordering::Relaxed);
    let mut incomplete = Vec::new();
    while shared.outstanding_count() < high_water {
        let request = {
            let mut queues = shared.queues.lock().expect("poisoned lock");
            queues.skin.pop_front()
        };
        let Some(mut request) = request else { break };

        if request.stats.is_delayed(now) {
            incomplete.push(request);
        } else if !fetch_mesh_skin(shared, &request) {
            if request.stats.can_retry(shared.config.retry_limit) {
                request.stats.update_time(shared.config.retry_base_delay, now);
                incomplete.push(request);
            } else {
                debug!("Skin request for {} failed, giving up", request.mesh_id);
                shared.push_skin_unavailable(&request.mesh_id);
            }
        }
    }
    if !incomplete.is_empty() {
        let mut queues = shared.queues.lock().expect("poisoned lock");
        queues.skin.extend(incomplete);
    }
}

fn process_lod_queue(shared: &Arc<RepoShared>, now: Instant) {
    let high_water = shared.high_water.load(Ordering::Relaxed);
    let mut incomplete = Vec::new();
    while shared.outstanding_count() < high_water {
        let request = {
            let mut queues = shared.queues.lock().expect("poisoned lock");
            queues.lod.pop_front()
        };
        let Some(mut request) = request else { break };
        shared.metrics.lod_processing.fetch_sub(1, Ordering::Relaxed);

        if request.stats.is_delayed(now) {
            // failed before, wait out the backoff
            incomplete.push(request);
        } else if !fetch_mesh_lod(shared, &request) {
            if request.stats.can_retry(shared.config.retry_limit) {
                request.stats.update_time(shared.config.retry_base_delay, now);
                incomplete.push(request);
            } else {
                warn!(
                    "Failed to load mesh {} LOD {}, skip",
                    request.mesh_id, request.lod
                );
                shared.push_lod_unavailable(&request.mesh_id, request.lod);
            }
        }
    }
    if !incomplete.is_empty() {
        let mut queues = shared.queues.lock().expect("poisoned lock");
        for request in incomplete {
            queues.lod.push_back(request);
            shared.metrics.lod_processing.fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn process_header_queue(shared: &Arc<RepoShared>, now: Instant) {
    let high_water = shared.high_water.load(Ordering::Relaxed);
    let mut incomplete = Vec::new();
    while shared.outstanding_count() < high_water {
        let request = {
            let mut queues = shared.queues.lock().expect("poisoned lock");
            queues.header.pop_front()
        };
        let Some(mut request) = request else { break };

        if request.stats.is_delayed(now) {
            incomplete.push(request);
        } else if !shared.fetch_mesh_header(&request) {
            if request.stats.can_retry(shared.config.retry_limit) {
                request.stats.update_time(shared.config.retry_base_delay, now);
                incomplete.push(request);
            } else {
                debug!("Header request for {} failed, giving up", request.mesh_id);
                shared.mark_header_not_found(&request.mesh_id);
            }
        }
    }
    if !incomplete.is_empty() {
        let mut queues = shared.queues.lock().expect("poisoned lock");
        queues.header.extend(incomplete);
    }
}

fn process_decomposition_queue(shared: &Arc<RepoShared>, now: Instant, scratch: &mut DiskBuffer) {
    let high_water = shared.high_water.load(Ordering::Relaxed);
    let mut incomplete = Vec::new();
    while shared.outstanding_count() < high_water {
        let request = {
            let mut queues = shared.queues.lock().expect("poisoned lock");
            queues.decomposition.pop_front()
        };
        let Some(mut request) = request else { break };

        if request.stats.is_delayed(now) {
            incomplete.push(request);
        } else if !shared.fetch_mesh_decomposition(&request, scratch) {
            if request.stats.can_retry(shared.config.retry_limit) {
                request.stats.update_time(shared.config.retry_base_delay, now);
                incomplete.push(request);
            } else {
                debug!(
                    "Decomposition request for {} failed, giving up",
                    request.mesh_id
                );
            }
        }
    }
    if !incomplete.is_empty() {
        let mut queues = shared.queues.lock().expect("poisoned lock");
        queues.decomposition.extend(incomplete);
    }
}

fn process_physics_queue(shared: &Arc<RepoShared>, now: Instant, scratch: &mut DiskBuffer) {
    let high_water = shared.high_water.load(Ordering::Relaxed);
    let mut incomplete = Vec::new();
    while shared.outstanding_count() < high_water {
        let request = {
            let mut queues = shared.queues.lock().expect("poisoned lock");
            queues.physics_shape.pop_front()
        };
        let Some(mut request) = request else { break };

        if request.stats.is_delayed(now) {
            incomplete.push(request);
        } else if !shared.fetch_mesh_physics_shape(&request, scratch) {
            if request.stats.can_retry(shared.config.retry_limit) {
                request.stats.update_time(shared.config.retry_base_delay, now);
                incomplete.push(request);
            } else {
                debug!(
                    "Physics shape request for {} failed, giving up",
                    request.mesh_id
                );
            }
        }
    }
    if !incomplete.is_empty() {
        let mut queues = shared.queues.lock().expect("poisoned lock");
        queues.physics_shape.extend(incomplete);
    }
}

/// Grow-only scratch buffer for cache reads the worker parses inline.
/// Its leading bytes are reset between uses so stale content never
/// parses by accident.
pub(crate) struct DiskBuffer {
    buf: Vec<u8>,
}

const MINIMUM_BUFFER_SIZE: usize = 8192;

impl Default for DiskBuffer {
    fn default() -> Self {
        Self { buf: Vec::new() }
    }
}

impl DiskBuffer {
    pub fn get(&mut self, shared: &RepoShared, size: usize) -> Option<&mut [u8]> {
        if self.buf.len() < size {
            let want = size.max(MINIMUM_BUFFER_SIZE);
            match try_alloc_vec::<u8>(want) {
                Ok(mut fresh) => {
                    fresh.resize(want, 0);
                    self.buf = fresh;
                }
                Err(_) => {
                    warn!("Failed to allocate memory for mesh thread's buffer, size: {}", want);
                    self.buf = Vec::new();
                    shared.note_allocation_failure(size);
                    return None;
                }
            }
        } else {
            // reusing the old buffer, scrub the heading bytes so stale
            // content won't be parsable if the read comes up short
            let scrub = self.buf.len().min(16);
            self.buf[..scrub].fill(0);
        }
        Some(&mut self.buf[..size])
    }
}

pub(crate) fn worker_loop(shared: Arc<RepoShared>) {
    let mut scratch = DiskBuffer::default();

    while !shared.is_quitting() {
        {
            let mut flagged = shared.signal_state.lock().expect("poisoned lock");
            while !*flagged && !shared.is_quitting() {
                let (guard, timeout) = shared
                    .signal
                    .wait_timeout(flagged, Duration::from_secs(1))
                    .expect("poisoned lock");
                flagged = guard;
                if timeout.timed_out() {
                    // periodic wake so retry deadlines fire while idle
                    break;
                }
            }
            *flagged = false;
        }

        if shared.is_quitting() {
            break;
        }
        process(&shared, &mut scratch);
    }

    // cancellation safety net: handlers that never saw their completion
    let handlers = {
        let mut outstanding = shared.outstanding.lock().expect("poisoned lock");
        outstanding.drain().map(|(_, handler)| handler).collect_vec()
    };
    for handler in handlers {
        handler.abandon(&shared);
    }
    info!("Mesh repo worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn capability_preference_order() {
        let mesh_id = Uuid::new_v4();
        let mut caps = MeshCaps {
            viewer_asset: Some("http://modern".into()),
            legacy_v2: Some("http://v2".into()),
            legacy_v1: Some("http://v1".into()),
            preferred_version: 0,
        };

        let (url, version) = caps.construct_url(&mesh_id).expect("modern cap");
        assert_eq!(version, 0);
        assert_eq!(url, format!("http://modern/?mesh_id={}", mesh_id));

        caps.viewer_asset = None;
        caps.preferred_version = 2;
        let (url, version) = caps.construct_url(&mesh_id).expect("legacy v2 cap");
        assert_eq!(version, 2);
        assert!(url.starts_with("http://v2/"));

        caps.preferred_version = 1;
        let (url, version) = caps.construct_url(&mesh_id).expect("legacy v1 cap");
        assert_eq!(version, 1);
        assert!(url.starts_with("http://v1/"));

        caps.legacy_v1 = None;
        assert!(caps.construct_url(&mesh_id).is_none());
    }

    #[test]
    fn disk_buffer_grows_and_scrubs_its_head() {
        let dir = tempfile::tempdir().expect("temp dir");
        let config = crate::settings::RepoConfig {
            cache_dir: dir.path().join("mesh"),
            ..Default::default()
        };
        let shared = RepoShared::new(
            config,
            Arc::new(crate::repo::tests::MockTransport::default()),
            Arc::new(crate::repo::metrics::RepoMetrics::default()),
        )
        .expect("shared state");
        shared.pool.shutdown();

        let mut scratch = DiskBuffer::default();
        {
            let buffer = scratch.get(&shared, 32).expect("allocates");
            assert_eq!(buffer.len(), 32);
            buffer.fill(0xEE);
        }
        {
            // smaller request reuses the grown buffer but scrubs the head
            let buffer = scratch.get(&shared, 20).expect("reuses");
            assert_eq!(buffer.len(), 20);
            assert!(buffer[..16].iter().all(|&b| b == 0));
            assert_eq!(buffer[16], 0xEE);
        }
    }
}
