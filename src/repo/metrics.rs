use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64};

/// Process-wide fetch statistics. The registry owns the record, workers
/// and handlers hold a shared reference and bump the counters with
/// relaxed ordering, nothing synchronizes through them.
#[derive(Debug, Default)]
pub struct RepoMetrics {
    pub bytes_received: AtomicU64,
    pub mesh_request_count: AtomicU32,
    pub http_request_count: AtomicU32,
    pub http_large_request_count: AtomicU32,
    pub http_retry_count: AtomicU32,
    pub http_error_count: AtomicU32,

    /// LOD requests sitting in the worker's queue.
    pub lod_processing: AtomicI64,
    /// LOD requests still pending in the registry.
    pub lod_pending: AtomicI64,
    /// In-flight handle count observed after the last queue pass.
    pub request_water_level: AtomicI64,

    pub cache_reads: AtomicU32,
    pub cache_writes: AtomicU32,
    pub cache_bytes_read: AtomicU64,
    pub cache_bytes_written: AtomicU64,
    pub cache_bytes_headers: AtomicU64,
    pub cache_bytes_skins: AtomicU64,
    pub cache_bytes_decomps: AtomicU64,

    /// Longest run of frames the render thread had to skip dispatch
    /// because a worker mutex was contended.
    pub max_lock_holdoffs: AtomicU32,
}
