use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::{
    LEGACY_CONCURRENT_REQUEST_LIMIT, MODERN_CONCURRENT_REQUEST_LIMIT, REQUEST2_HIGH_WATER_MAX,
    REQUEST2_HIGH_WATER_MIN, REQUEST2_LOW_WATER_MAX, REQUEST2_LOW_WATER_MIN,
    REQUEST_HIGH_WATER_MAX, REQUEST_HIGH_WATER_MIN, REQUEST_LOW_WATER_MAX, REQUEST_LOW_WATER_MIN,
};

/// Tunables of the fetch pipeline. The defaults mirror what the asset
/// servers have been tuned against, deployments override them through
/// whatever settings storage the embedding client uses.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RepoConfig {
    /// Directory the per-asset cache blobs live in.
    pub cache_dir: PathBuf,

    /// Concurrent request target per transport generation. Clamped to 32
    /// on the modern transport and 64 on the legacy one.
    pub max_concurrent_requests: u32,

    /// Transfer timeout for the small request lane, in seconds.
    pub small_transfer_timeout_secs: u64,

    /// Transfer timeout for the large request lane, in seconds.
    pub large_transfer_timeout_secs: u64,

    /// Attempts before a request is routed to the unavailable queue.
    pub retry_limit: u32,

    /// Base delay of the exponential backoff, doubled per attempt.
    pub retry_base_delay: Duration,

    /// Whether the legacy v1 capability may be selected at all. The
    /// three lane abstraction stays compiled in either way.
    pub use_legacy_v1: bool,

    /// Worker count of the parse pool.
    pub parse_pool_size: usize,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("mesh_cache"),
            max_concurrent_requests: 8,
            small_transfer_timeout_secs: crate::SMALL_MESH_XFER_TIMEOUT_SECS,
            large_transfer_timeout_secs: crate::LARGE_MESH_XFER_TIMEOUT_SECS,
            retry_limit: crate::DOWNLOAD_RETRY_LIMIT,
            retry_base_delay: Duration::from_secs_f32(crate::DOWNLOAD_RETRY_DELAY_SECS),
            use_legacy_v1: false,
            parse_pool_size: 2,
        }
    }
}

impl RepoConfig {
    pub fn small_timeout(&self) -> Duration {
        Duration::from_secs(self.small_transfer_timeout_secs)
    }

    pub fn large_timeout(&self) -> Duration {
        Duration::from_secs(self.large_transfer_timeout_secs)
    }

    /// High/low water marks for the in-flight handle set, derived per
    /// frame from the configured concurrency and the transport that is
    /// currently preferred.
    pub fn water_marks(&self, legacy_v1: bool) -> (usize, usize) {
        let high;
        let low;
        if legacy_v1 {
            let concurrent = self
                .max_concurrent_requests
                .min(LEGACY_CONCURRENT_REQUEST_LIMIT) as i64;
            high = (2 * concurrent).clamp(REQUEST_HIGH_WATER_MIN, REQUEST_HIGH_WATER_MAX);
            low = (high / 2).clamp(REQUEST_LOW_WATER_MIN, REQUEST_LOW_WATER_MAX);
        } else {
            let concurrent = self
                .max_concurrent_requests
                .min(MODERN_CONCURRENT_REQUEST_LIMIT) as i64;
            // connection scale of the non-pipelined modern transport
            high = (5 * concurrent).clamp(REQUEST2_HIGH_WATER_MIN, REQUEST2_HIGH_WATER_MAX);
            low = (high / 2).clamp(REQUEST2_LOW_WATER_MIN, REQUEST2_LOW_WATER_MAX);
        }
        (high as usize, low as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn water_marks_clamp_to_transport_limits() {
        let mut config = RepoConfig::default();
        config.max_concurrent_requests = 1000;

        let (high, low) = config.water_marks(false);
        assert_eq!(high, REQUEST2_HIGH_WATER_MAX as usize);
        assert_eq!(low, REQUEST2_LOW_WATER_MAX as usize);

        let (high, low) = config.water_marks(true);
        assert_eq!(high, 128); // 2 x 64, still below the legacy ceiling of 150
        assert_eq!(low, 64);
    }

    #[test]
    fn water_marks_respect_minimums() {
        let mut config = RepoConfig::default();
        config.max_concurrent_requests = 1;

        let (high, low) = config.water_marks(false);
        assert_eq!(high, REQUEST2_HIGH_WATER_MIN as usize);
        assert_eq!(low, REQUEST2_LOW_WATER_MIN as usize);
    }
}
