use std::fmt::{Debug, Formatter};

use glam::{Mat4, Vec3};
use uuid::Uuid;

use crate::NUM_LODS;

/// Opaque 128 bit identifier scene objects reference meshes by.
pub type MeshId = Uuid;

/// The four detail tiers of a mesh, index 0 (lowest) through 3 (highest),
/// as they are keyed in the asset header.
pub const LOD_NAMES: [&str; NUM_LODS] = ["lowest_lod", "low_lod", "medium_lod", "high_lod"];

/// One independently addressable byte range within the packed asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SectionKind {
    Skin,
    PhysicsConvex,
    PhysicsMesh,
    Lod(usize),
}

/// A parsed level of detail, the unit delivered back to waiting scene
/// objects.
#[derive(Clone)]
pub struct Volume {
    pub mesh_id: MeshId,
    pub lod: i32,
    pub faces: Vec<VolumeFace>,
}

impl Volume {
    pub fn num_faces(&self) -> usize {
        self.faces.len()
    }
}

impl Debug for Volume {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Volume {{ mesh_id: {}, lod: {}, faces: [{}] }}",
            self.mesh_id,
            self.lod,
            self.faces.len()
        )
    }
}

#[derive(Clone)]
pub struct VolumeFace {
    pub positions: Vec<Vec3>,
    pub normals: Vec<Vec3>,
    pub indices: Vec<u16>,
    /// Filled at parse time when a skin descriptor is already cached for
    /// the mesh, so rigged rendering never waits on it.
    pub rigging: Option<FaceRigging>,
}

impl Debug for VolumeFace {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "VolumeFace {{ positions: [{}], normals: [{}], indices: [{}], rigged: {} }}",
            self.positions.len(),
            self.normals.len(),
            self.indices.len(),
            self.rigging.is_some()
        )
    }
}

/// Precomputed rigging data of one face.
#[derive(Clone, Debug)]
pub struct FaceRigging {
    pub joint_count: usize,
    pub bounds_min: Vec3,
    pub bounds_max: Vec3,
}

/// Parsed skin descriptor of a rigged mesh.
#[derive(Clone, Debug)]
pub struct SkinInfo {
    pub mesh_id: MeshId,
    pub joint_names: Vec<String>,
    pub bind_shape_matrix: Mat4,
    pub inverse_bind_matrices: Vec<Mat4>,
    pub pelvis_offset: f32,
}

impl SkinInfo {
    /// Rough resident size, used for the cache byte metrics only.
    pub fn size_bytes(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.joint_names.iter().map(|n| n.len()).sum::<usize>()
            + self.inverse_bind_matrices.len() * std::mem::size_of::<Mat4>()
    }
}

/// Flat triangle soup of a physics shape, one position/normal pair per
/// corner of every triangle.
#[derive(Clone, Debug, Default)]
pub struct PhysicsMesh {
    pub positions: Vec<Vec3>,
    pub normals: Vec<Vec3>,
}

impl PhysicsMesh {
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

/// Convex decomposition of a mesh, either fetched from the asset's
/// physics_convex sub-section or produced by the local decomposer.
#[derive(Clone, Debug, Default)]
pub struct Decomposition {
    pub mesh_id: MeshId,
    pub hulls: Vec<Vec<Vec3>>,
    pub hull_meshes: Vec<PhysicsMesh>,
    pub base_hull: Vec<Vec3>,
    pub base_hull_mesh: PhysicsMesh,
    /// None while the physics_mesh sub-section has not been fetched. An
    /// empty mesh means the asset has no physics shape.
    pub physics_shape_mesh: Option<PhysicsMesh>,
}

impl Decomposition {
    pub fn new(mesh_id: MeshId) -> Self {
        Self {
            mesh_id,
            ..Default::default()
        }
    }

    /// Rough resident size, used for the cache byte metrics only.
    pub fn size_bytes(&self) -> usize {
        let hull_points: usize = self.hulls.iter().map(|h| h.len()).sum();
        let mesh_points: usize = self
            .hull_meshes
            .iter()
            .chain(self.physics_shape_mesh.iter())
            .map(|m| m.positions.len() + m.normals.len())
            .sum();
        std::mem::size_of::<Self>()
            + (hull_points + self.base_hull.len() + mesh_points) * std::mem::size_of::<Vec3>()
    }

    /// Folds a newly received block into an existing entry without
    /// discarding data the other fetch path already provided.
    pub fn merge(&mut self, other: Decomposition) {
        if !other.hulls.is_empty() {
            self.hulls = other.hulls;
            self.hull_meshes = other.hull_meshes;
        }
        if !other.base_hull.is_empty() {
            self.base_hull = other.base_hull;
            self.base_hull_mesh = other.base_hull_mesh;
        }
        if other.physics_shape_mesh.is_some() {
            self.physics_shape_mesh = other.physics_shape_mesh;
        }
    }
}

/// Outcome of feeding received bytes through one of the asset parsers,
/// reported back to the handler so it can decide between retry and
/// abandon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshProcessResult {
    Ok,
    NoData,
    ParseFailure,
    Invalid,
    Unknown,
}
