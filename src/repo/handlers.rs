use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info, warn};

use crate::asset::types::{MeshId, MeshProcessResult, SectionKind};
use crate::io::http::{HandleId, HttpCompletion, HttpStatus};
use crate::repo::request::{HeaderRequest, LodRequest, RequestStats, SectionRequest};
use crate::repo::worker::RepoShared;
use crate::CACHE_PREAMBLE_SIZE;

/// One in-flight byte range GET. The five variants differ in what the
/// received bytes mean and where failures are routed.
pub(crate) struct FetchHandler {
    pub offset: u64,
    pub requested: u64,
    pub handle: HandleId,
    pub processed: bool,
    pub kind: HandlerKind,
}

pub(crate) enum HandlerKind {
    Header {
        mesh_id: MeshId,
        stats: RequestStats,
    },
    Lod {
        mesh_id: MeshId,
        lod: i32,
        stats: RequestStats,
    },
    Skin {
        mesh_id: MeshId,
        stats: RequestStats,
    },
    Decomposition {
        mesh_id: MeshId,
    },
    PhysicsShape {
        mesh_id: MeshId,
    },
}

impl HandlerKind {
    pub fn mesh_id(&self) -> &MeshId {
        match self {
            HandlerKind::Header { mesh_id, .. }
            | HandlerKind::Lod { mesh_id, .. }
            | HandlerKind::Skin { mesh_id, .. }
            | HandlerKind::Decomposition { mesh_id }
            | HandlerKind::PhysicsShape { mesh_id } => mesh_id,
        }
    }

    pub fn section(&self) -> Option<SectionKind> {
        match self {
            HandlerKind::Header { .. } => None,
            HandlerKind::Lod { lod, .. } => Some(SectionKind::Lod(*lod as usize)),
            HandlerKind::Skin { .. } => Some(SectionKind::Skin),
            HandlerKind::Decomposition { .. } => Some(SectionKind::PhysicsConvex),
            HandlerKind::PhysicsShape { .. } => Some(SectionKind::PhysicsMesh),
        }
    }
}

impl FetchHandler {
    /// Runs on the repo worker thread when it flushes the completion
    /// queue. Exactly one completion arrives per handler.
    pub fn on_completed(mut self, shared: &Arc<RepoShared>, completion: HttpCompletion) {
        self.processed = true;
        self.dec_active(shared);

        shared
            .metrics
            .http_retry_count
            .fetch_add(completion.retries, Ordering::Relaxed);

        if !completion.status.is_success() {
            shared.metrics.http_error_count.fetch_add(1, Ordering::Relaxed);
            self.process_failure(shared, completion.status, &completion.reason);
            return;
        }

        let body = completion.body;
        if body.is_empty() {
            self.process_data(shared, Vec::new(), None);
            return;
        }

        // Some services return a 206 without a Content-Range header. We
        // have to assume those responses cover exactly what was asked for.
        let response_offset = if completion.status.is_partial_content() {
            match completion.content_range {
                Some(range) => range.start,
                None => {
                    debug!("206 response without a Content-Range header, assuming the requested range");
                    self.offset
                }
            }
        } else {
            // 200 case, the body is the whole asset
            0
        };

        // The first byte we asked for has to lie inside the response.
        if response_offset > self.offset
            || response_offset + body.len() as u64 <= self.offset
        {
            warn!(
                "Mesh response (bytes [{}..{}]) didn't overlap with request's origin (bytes [{}..{}])",
                response_offset,
                response_offset + body.len() as u64 - 1,
                self.offset,
                self.offset + self.requested - 1
            );
            shared.metrics.http_error_count.fetch_add(1, Ordering::Relaxed);
            self.process_failure(shared, HttpStatus::TRANSPORT_FAILURE, "content range mismatch");
            return;
        }

        shared
            .metrics
            .bytes_received
            .fetch_add(body.len() as u64, Ordering::Relaxed);

        // the asset's total length, when this response reveals it
        let total_len = if completion.status.is_partial_content() {
            completion.content_range.and_then(|range| range.total)
        } else {
            Some(body.len() as u64)
        };

        let body_offset = (self.offset - response_offset) as usize;
        let end = body.len().min(body_offset + self.requested as usize);
        let slice = body[body_offset..end].to_vec();
        self.process_data(shared, slice, total_len);
    }

    /// Safety net for handlers that never saw their completion, for
    /// example because the transport went away. On shutdown nothing is
    /// re-enqueued, the buffers just drop.
    pub fn abandon(self, shared: &Arc<RepoShared>) {
        debug_assert!(!self.processed, "abandoning a handler that already ran");
        self.dec_active(shared);
        if shared.is_quitting() {
            debug!(
                "Dropping unprocessed mesh request handle {} on shutdown",
                self.handle
            );
            return;
        }
        match self.kind {
            HandlerKind::Header { mesh_id, stats } => {
                warn!("Mesh header fetch canceled unexpectedly, retrying");
                let mut queues = shared.queues.lock().expect("poisoned lock");
                queues.header.push_back(HeaderRequest { mesh_id, stats });
            }
            HandlerKind::Lod { mesh_id, lod, stats } => {
                warn!("Mesh LOD fetch canceled unexpectedly, retrying");
                shared.enqueue_lod(LodRequest { mesh_id, lod, stats });
            }
            _ => {
                warn!("Deleting unprocessed mesh request handler");
            }
        }
    }

    fn dec_active(&self, shared: &Arc<RepoShared>) {
        match &self.kind {
            HandlerKind::Header { .. } => {
                shared.active_header_requests.fetch_sub(1, Ordering::Relaxed);
            }
            HandlerKind::Lod { .. } => {
                shared.active_lod_requests.fetch_sub(1, Ordering::Relaxed);
            }
            HandlerKind::Skin { .. } => {
                shared.active_skin_requests.fetch_sub(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    fn process_failure(self, shared: &Arc<RepoShared>, status: HttpStatus, reason: &str) {
        let retry_limit = shared.config.retry_limit;
        let now = Instant::now();
        match self.kind {
            HandlerKind::Header { mesh_id, mut stats } => {
                if status.is_not_found() || !stats.can_retry(retry_limit) {
                    warn!(
                        "Error during mesh header handling. ID: {}, Reason: {} ({}). Not retrying",
                        mesh_id, reason, status.0
                    );
                    shared.mark_header_not_found(&mesh_id);
                } else {
                    stats.update_time(shared.config.retry_base_delay, now);
                    let mut queues = shared.queues.lock().expect("poisoned lock");
                    queues.header.push_back(HeaderRequest { mesh_id, stats });
                }
            }
            HandlerKind::Lod { mesh_id, lod, mut stats } => {
                if status.is_not_found() || !stats.can_retry(retry_limit) {
                    warn!(
                        "Error during mesh LOD handling. ID: {}, Reason: {} ({}). Not retrying",
                        mesh_id, reason, status.0
                    );
                    shared.push_lod_unavailable(&mesh_id, lod);
                } else {
                    stats.update_time(shared.config.retry_base_delay, now);
                    shared.enqueue_lod(LodRequest { mesh_id, lod, stats });
                }
            }
            HandlerKind::Skin { mesh_id, mut stats } => {
                if status.is_not_found() || !stats.can_retry(retry_limit) {
                    warn!(
                        "Error during mesh skin info handling. ID: {}, Reason: {} ({}). Not retrying",
                        mesh_id, reason, status.0
                    );
                    shared.push_skin_unavailable(&mesh_id);
                } else {
                    stats.update_time(shared.config.retry_base_delay, now);
                    let mut queues = shared.queues.lock().expect("poisoned lock");
                    queues.skin.push_back(SectionRequest { mesh_id, stats });
                }
            }
            HandlerKind::Decomposition { mesh_id } => {
                // diagnostic data only, leave the request unfulfilled
                warn!(
                    "Error during mesh decomposition handling. ID: {}, Reason: {} ({}). Not retrying",
                    mesh_id, reason, status.0
                );
            }
            HandlerKind::PhysicsShape { mesh_id } => {
                warn!(
                    "Error during mesh physics shape handling. ID: {}, Reason: {} ({}). Not retrying",
                    mesh_id, reason, status.0
                );
            }
        }
    }

    fn process_data(self, shared: &Arc<RepoShared>, data: Vec<u8>, total_len: Option<u64>) {
        let section_offset = self.offset + CACHE_PREAMBLE_SIZE;
        let requested = self.requested;
        match self.kind {
            HandlerKind::Header { mesh_id, .. } => {
                process_header_data(shared, &mesh_id, &data, total_len);
            }
            HandlerKind::Lod { mesh_id, lod, .. } => {
                if data.is_empty() {
                    warn!(
                        "Empty response body for mesh LOD. ID: {} LOD: {}. Not retrying",
                        mesh_id, lod
                    );
                    shared.push_lod_unavailable(&mesh_id, lod);
                    return;
                }
                let pool_shared = shared.clone();
                let task_data = data;
                let posted = shared.pool.post(Box::new(move || {
                    if pool_shared.is_quitting() {
                        return;
                    }
                    process_lod_body(&pool_shared, &mesh_id, lod, section_offset, requested, &task_data);
                }));
                if let Err(task) = posted {
                    // the parse pool dies earlier than the worker, inline is fine
                    info!("Failed to post work into the mesh parse pool");
                    task();
                }
            }
            HandlerKind::Skin { mesh_id, .. } => {
                if data.is_empty() {
                    warn!("Empty response body for mesh skin info. ID: {}", mesh_id);
                    shared.push_skin_unavailable(&mesh_id);
                    return;
                }
                let pool_shared = shared.clone();
                let task_data = data;
                let posted = shared.pool.post(Box::new(move || {
                    if pool_shared.is_quitting() {
                        return;
                    }
                    process_skin_body(&pool_shared, &mesh_id, section_offset, requested, &task_data);
                }));
                if let Err(task) = posted {
                    info!("Failed to post work into the mesh parse pool");
                    task();
                }
            }
            HandlerKind::Decomposition { mesh_id } => {
                if !data.is_empty() && shared.decomposition_received(&mesh_id, &data) {
                    shared.write_section_to_cache(
                        &mesh_id,
                        SectionKind::PhysicsConvex,
                        section_offset,
                        &data[..(requested as usize).min(data.len())],
                    );
                } else {
                    warn!(
                        "Error during mesh decomposition processing. ID: {}, Unknown reason. Not retrying",
                        mesh_id
                    );
                }
            }
            HandlerKind::PhysicsShape { mesh_id } => {
                if !data.is_empty()
                    && shared.physics_shape_received(&mesh_id, Some(&data)) == MeshProcessResult::Ok
                {
                    shared.write_section_to_cache(
                        &mesh_id,
                        SectionKind::PhysicsMesh,
                        section_offset,
                        &data[..(requested as usize).min(data.len())],
                    );
                } else {
                    warn!(
                        "Error during mesh physics shape processing. ID: {}, Unknown reason. Not retrying",
                        mesh_id
                    );
                }
            }
        }
    }
}

fn process_header_data(
    shared: &Arc<RepoShared>,
    mesh_id: &MeshId,
    data: &[u8],
    total_len: Option<u64>,
) {
    let result = shared.header_received(mesh_id, data, 0);
    if result != MeshProcessResult::Ok {
        warn!(
            "Unable to parse mesh header. ID: {}, Size: {}, Reason: {:?}. Not retrying",
            mesh_id,
            data.len(),
            result
        );
        // none of the LODs will become available
        shared.push_all_lods_unavailable(mesh_id);
        return;
    }

    if data.is_empty() {
        return; // stored as a missing asset, nothing to cache
    }

    let header = {
        let headers = shared.headers.lock().expect("poisoned lock");
        headers.get(mesh_id).cloned()
    };
    let Some(header) = header else { return };

    if header.header_size > 0 && !header.not_found {
        // knowing the asset's total length lets us check the declared
        // sub-section extents before reserving cache space for them
        if let Some(asset_len) = total_len {
            if !header.extents_valid(asset_len) {
                warn!(
                    "Mesh header for {} declares sub-sections past the asset's end, marking as unusable",
                    mesh_id
                );
                shared.mark_header_not_found(mesh_id);
                return;
            }
        }

        // reserve space for the header and every declared sub-section so
        // later section writes land inside the blob
        let total = CACHE_PREAMBLE_SIZE + header.cache_payload_size();
        let write_len = data.len().min((total - CACHE_PREAMBLE_SIZE) as usize);

        let flags = header.flags();
        let ok = shared
            .cache
            .write_preamble(mesh_id, header.header_size, flags)
            .and_then(|_| shared.cache.write_range(mesh_id, CACHE_PREAMBLE_SIZE, &data[..write_len]))
            .and_then(|_| shared.cache.reserve(mesh_id, total));
        match ok {
            Ok(()) => {
                shared.metrics.cache_writes.fetch_add(1, Ordering::Relaxed);
                shared
                    .metrics
                    .cache_bytes_written
                    .fetch_add(write_len as u64, Ordering::Relaxed);
            }
            Err(e) => warn!("Failed to cache mesh header for {}: {}", mesh_id, e),
        }
    } else {
        warn!("Trying to cache nonexistent mesh, mesh id: {}", mesh_id);
        shared.push_all_lods_unavailable(mesh_id);
    }
}

pub(crate) fn process_lod_body(
    shared: &Arc<RepoShared>,
    mesh_id: &MeshId,
    lod: i32,
    section_offset: u64,
    requested: u64,
    data: &[u8],
) {
    let result = shared.lod_received(mesh_id, lod, data);
    if result == MeshProcessResult::Ok {
        shared.write_section_to_cache(
            mesh_id,
            SectionKind::Lod(lod as usize),
            section_offset,
            &data[..(requested as usize).min(data.len())],
        );
    } else {
        warn!(
            "Error during mesh LOD processing. ID: {}, Reason: {:?} LOD: {} Data size: {}. Not retrying",
            mesh_id,
            result,
            lod,
            data.len()
        );
        shared.push_lod_unavailable(mesh_id, lod);
    }
}

pub(crate) fn process_skin_body(
    shared: &Arc<RepoShared>,
    mesh_id: &MeshId,
    section_offset: u64,
    requested: u64,
    data: &[u8],
) {
    if shared.skin_received(mesh_id, data) {
        shared.write_section_to_cache(
            mesh_id,
            SectionKind::Skin,
            section_offset,
            &data[..(requested as usize).min(data.len())],
        );
    } else {
        warn!(
            "Error during mesh skin info processing. ID: {}, Unknown reason. Not retrying",
            mesh_id
        );
        shared.push_skin_unavailable(mesh_id);
    }
}

/// At most one header fetch may be outstanding per identifier, and one
/// body fetch per (identifier, sub-section).
pub(crate) fn has_outstanding_section(
    outstanding: &std::collections::HashMap<HandleId, FetchHandler>,
    mesh_id: &MeshId,
    section: Option<SectionKind>,
) -> bool {
    outstanding
        .values()
        .any(|handler| handler.kind.mesh_id() == mesh_id && handler.kind.section() == section)
}
