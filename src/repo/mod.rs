use std::sync::Arc;

use crate::asset::types::{MeshId, SkinInfo, Volume};

pub mod handlers;
pub mod metrics;
pub mod pool;
pub mod registry;
pub mod request;
pub mod worker;

/// Contract between the repository and the scene objects that request
/// meshes. Implemented by the client's drawable layer, all calls happen
/// on the render thread.
pub trait MeshObject {
    fn drawable_radius(&self) -> f32;
    fn distance_to_camera(&self) -> f32;

    fn is_rigged_or_attached(&self) -> bool {
        false
    }
    /// Bounding radius of the avatar the mesh is attached to, when there
    /// is one with a usable drawable.
    fn avatar_bounding_radius(&self) -> Option<f32> {
        None
    }
    fn avatar_distance_to_camera(&self) -> Option<f32> {
        None
    }
    fn is_own_avatar(&self) -> bool {
        false
    }
    fn has_first_full_attachment_data(&self) -> bool {
        true
    }

    fn notify_mesh_loaded(&self, volume: &Arc<Volume>);
    /// The requested LOD cannot be delivered. `fallback_lod` is the best
    /// substitute the header still offers, -1 when there is none.
    fn notify_mesh_unavailable(&self, mesh_id: &MeshId, request_lod: i32, fallback_lod: i32);

    fn notify_skin_loaded(&self, _skin: &Arc<SkinInfo>) {}
    fn notify_skin_unavailable(&self, _mesh_id: &MeshId) {}
}
