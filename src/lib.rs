//! Mesh asset fetch, cache and decomposition pipeline of a virtual
//! world client.
//!
//! Scene objects reference meshes by an opaque identifier at one of four
//! levels of detail. The repository streams the minimum necessary bytes
//! of each asset from the region's servers with ranged requests, parses
//! the packed sub-sections out of the single asset blob, caches them on
//! disk and delivers parsed results back to the render loop without ever
//! blocking it. The upload companion path assembles whole-model payloads
//! and runs the two-phase fee-then-upload protocol against the region.

pub mod asset;
pub mod error;
pub mod io;
pub mod physics;
pub mod repo;
pub mod settings;
pub mod upload;

pub use asset::header::MeshHeader;
pub use asset::types::{
    Decomposition, FaceRigging, MeshId, MeshProcessResult, PhysicsMesh, SectionKind, SkinInfo,
    Volume, VolumeFace,
};
pub use error::RepoError;
pub use io::http::{ContentRange, HttpCompletion, HttpStatus, Lane, Transport, UreqTransport};
pub use physics::decomp::{DecompQueue, DecompRequest, DecompStage, DecompTicket, PhysicsDecomp};
pub use repo::metrics::RepoMetrics;
pub use repo::registry::{MeshRepository, RegionContext};
pub use repo::MeshObject;
pub use settings::RepoConfig;
pub use upload::{
    InventoryData, MaterialBinding, Model, ModelInstance, ModelUploadParams, UploadTexture,
    WholeModelFeeObserver, WholeModelUploadObserver,
};

/// Levels of detail per mesh, indexed 0 (lowest) through 3 (highest).
pub const NUM_LODS: usize = 4;

/// Version tag of the local cache blob preamble.
pub const CACHE_PREAMBLE_VERSION: u32 = 1;
/// Version tag, header size and flags word.
pub const CACHE_PREAMBLE_SIZE: u64 = 3 * std::mem::size_of::<u32>() as u64;

/// Headers are assumed to fit in this space, the initial fetch grabs
/// exactly this many bytes.
pub const MESH_HEADER_SIZE: usize = 4096;

// Handle set limits for regions on the legacy transport.
pub const REQUEST_HIGH_WATER_MIN: i64 = 32;
pub const REQUEST_HIGH_WATER_MAX: i64 = 150;
pub const REQUEST_LOW_WATER_MIN: i64 = 16;
pub const REQUEST_LOW_WATER_MAX: i64 = 75;

// Handle set limits for regions on the modern transport.
pub const REQUEST2_HIGH_WATER_MIN: i64 = 32;
pub const REQUEST2_HIGH_WATER_MAX: i64 = 100;
pub const REQUEST2_LOW_WATER_MIN: i64 = 16;
pub const REQUEST2_LOW_WATER_MAX: i64 = 50;

/// Size at which a fetch moves to the narrow large-transfer lane.
pub const LARGE_MESH_FETCH_THRESHOLD: u64 = 1 << 21;
/// Seconds to complete a transfer on the small lane.
pub const SMALL_MESH_XFER_TIMEOUT_SECS: u64 = 120;
/// Seconds to complete a transfer on the large lane.
pub const LARGE_MESH_XFER_TIMEOUT_SECS: u64 = 600;

/// Attempts per request, the initial one included.
pub const DOWNLOAD_RETRY_LIMIT: u32 = 8;
/// Base backoff delay, doubled per retry.
pub const DOWNLOAD_RETRY_DELAY_SECS: f32 = 0.5;
/// Backoff ceiling per attempt.
pub const MAX_RETRY_DELAY_SECS: u64 = 32;

/// Maximum mesh format version to accept. The three least significant
/// digits carry the minor version, a larger major version means a format
/// this parser must not touch.
pub const MAX_MESH_VERSION: u32 = 999;

/// Concurrent request ceilings per transport generation.
pub const MODERN_CONCURRENT_REQUEST_LIMIT: u32 = 32;
pub const LEGACY_CONCURRENT_REQUEST_LIMIT: u32 = 64;

pub const MESH_CONTENT_TYPE: &str = "application/vnd.ll.mesh";

/// An allocation below this size failing is treated as the process
/// running out of memory and raises the soft-quit flag, larger ones
/// just fail their request.
pub const MAX_ALLOC_SOFT_QUIT: usize = 30 * 1024 * 1024;
