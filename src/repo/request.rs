use std::time::{Duration, Instant};

use crate::asset::types::MeshId;
use crate::repo::MeshObject;
use crate::MAX_RETRY_DELAY_SECS;

/// Retry bookkeeping shared by every request record. Instead of a timer
/// object the request stores the absolute deadline of its next attempt,
/// it is eligible again once `now` passes it.
#[derive(Debug, Clone)]
pub(crate) struct RequestStats {
    retries: u32,
    deadline: Option<Instant>,
}

impl RequestStats {
    pub fn new() -> Self {
        Self {
            retries: 0,
            deadline: None,
        }
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn can_retry(&self, limit: u32) -> bool {
        // the initial attempt counts against the limit as well
        self.retries + 1 < limit
    }

    pub fn is_delayed(&self, now: Instant) -> bool {
        self.deadline.map(|deadline| now < deadline).unwrap_or(false)
    }

    /// Schedules the next attempt, doubling the delay per retry.
    pub fn update_time(&mut self, base_delay: Duration, now: Instant) {
        let modifier = 1u32 << self.retries.min(16);
        self.retries += 1;
        let delay = (base_delay * modifier).min(Duration::from_secs(MAX_RETRY_DELAY_SECS));
        self.deadline = Some(now + delay);
    }
}

#[derive(Debug, Clone)]
pub(crate) struct HeaderRequest {
    pub mesh_id: MeshId,
    pub stats: RequestStats,
}

impl HeaderRequest {
    pub fn new(mesh_id: MeshId) -> Self {
        Self {
            mesh_id,
            stats: RequestStats::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct LodRequest {
    pub mesh_id: MeshId,
    pub lod: i32,
    pub stats: RequestStats,
}

impl LodRequest {
    pub fn new(mesh_id: MeshId, lod: i32) -> Self {
        Self {
            mesh_id,
            lod,
            stats: RequestStats::new(),
        }
    }
}

/// Identifier-based request, used for skin, decomposition and physics
/// shape fetches.
#[derive(Debug, Clone)]
pub(crate) struct SectionRequest {
    pub mesh_id: MeshId,
    pub stats: RequestStats,
}

impl SectionRequest {
    pub fn new(mesh_id: MeshId) -> Self {
        Self {
            mesh_id,
            stats: RequestStats::new(),
        }
    }
}

/// What a registry-side pending request is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PendingKind {
    Lod { mesh_id: MeshId, lod: i32 },
    Skin { mesh_id: MeshId },
}

/// A request the registry has not yet fed to the worker. Scores are only
/// recomputed when the pending queue exceeds the dispatch budget, `seq`
/// preserves insertion order as the tie break.
#[derive(Debug, Clone)]
pub(crate) struct PendingRequest {
    pub kind: PendingKind,
    pub score: f32,
    pub seq: u64,
}

impl PendingRequest {
    pub fn new(kind: PendingKind, seq: u64) -> Self {
        Self {
            kind,
            score: 0.0,
            seq,
        }
    }

    /// Descending by score, insertion order on ties.
    pub fn compare_score_greater(a: &PendingRequest, b: &PendingRequest) -> std::cmp::Ordering {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.seq.cmp(&b.seq))
    }
}

/// On-screen relevance of one tracked scene object.
pub(crate) fn calculate_score(object: &dyn MeshObject) -> f32 {
    if object.is_rigged_or_attached() {
        if let (Some(mut radius), Some(distance)) = (
            object.avatar_bounding_radius(),
            object.avatar_distance_to_camera(),
        ) {
            if !object.is_own_avatar() && !object.has_first_full_attachment_data() {
                // slightly deprioritize avatars that are still receiving data
                radius *= 0.9;
            }
            return radius / distance.max(1.0);
        }
    }
    object.drawable_radius() / object.distance_to_camera().max(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::tests::TestObject;
    use crate::DOWNLOAD_RETRY_LIMIT;

    #[test]
    fn retry_delays_double_from_the_base() {
        let base = Duration::from_secs_f32(0.5);
        let mut stats = RequestStats::new();
        let start = Instant::now();

        let mut expected = Vec::new();
        let mut attempts = 1; // the initial attempt
        while stats.can_retry(DOWNLOAD_RETRY_LIMIT) {
            let retries_before = stats.retries();
            stats.update_time(base, start);
            expected.push(0.5 * 2f32.powi(retries_before as i32));
            let deadline = start + Duration::from_secs_f32(*expected.last().unwrap());
            assert!(stats.is_delayed(start));
            assert!(!stats.is_delayed(deadline));
            attempts += 1;
        }

        assert_eq!(attempts, DOWNLOAD_RETRY_LIMIT);
        assert_eq!(expected, vec![0.5, 1.0, 2.0, 4.0, 8.0, 16.0, 32.0]);
    }

    #[test]
    fn fresh_requests_are_not_delayed() {
        let stats = RequestStats::new();
        assert!(!stats.is_delayed(Instant::now()));
        assert!(stats.can_retry(DOWNLOAD_RETRY_LIMIT));
    }

    #[test]
    fn score_prefers_close_and_large_objects() {
        let near = TestObject::plain(2.0, 4.0);
        let far = TestObject::plain(2.0, 40.0);
        assert!(calculate_score(&near) > calculate_score(&far));

        // distances below one meter do not inflate the score
        let touching = TestObject::plain(2.0, 0.1);
        assert_eq!(calculate_score(&touching), 2.0);
    }

    #[test]
    fn rigged_score_uses_the_avatar_and_penalizes_incomplete_ones() {
        let own = TestObject::rigged(3.0, 10.0, true, true);
        assert_eq!(calculate_score(&own), 0.3);

        let other_complete = TestObject::rigged(3.0, 10.0, false, true);
        assert_eq!(calculate_score(&other_complete), 0.3);

        let other_loading = TestObject::rigged(3.0, 10.0, false, false);
        assert!((calculate_score(&other_loading) - 0.27).abs() < 1e-6);
    }

    #[test]
    fn pending_order_breaks_ties_by_insertion() {
        let mut a = PendingRequest::new(
            PendingKind::Skin {
                mesh_id: uuid::Uuid::new_v4(),
            },
            1,
        );
        let mut b = PendingRequest::new(
            PendingKind::Skin {
                mesh_id: uuid::Uuid::new_v4(),
            },
            2,
        );
        a.score = 1.0;
        b.score = 1.0;
        assert_eq!(
            PendingRequest::compare_score_greater(&a, &b),
            std::cmp::Ordering::Less
        );

        b.score = 2.0;
        assert_eq!(
            PendingRequest::compare_score_greater(&a, &b),
            std::cmp::Ordering::Greater
        );
    }
}
