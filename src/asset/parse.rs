use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use glam::{Mat4, Vec3};
use serde::{Deserialize, Serialize};

use crate::asset::types::{
    Decomposition, FaceRigging, MeshId, PhysicsMesh, SkinInfo, Volume, VolumeFace,
};
use crate::error::RepoError;

/// Ceiling for decompressed structured payloads. Anything larger than
/// this is not a plausible skin or decomposition block.
const MAX_DECOMPRESSED_SIZE: u64 = 64 * 1024 * 1024;

pub(crate) trait Parseable<T> {
    fn parse<R: Read>(rdr: &mut R) -> Result<T, RepoError>;
}

impl Parseable<Vec3> for Vec3 {
    fn parse<R: Read>(rdr: &mut R) -> Result<Vec3, RepoError> {
        Ok(Vec3::new(
            rdr.read_f32::<LittleEndian>()?,
            rdr.read_f32::<LittleEndian>()?,
            rdr.read_f32::<LittleEndian>()?,
        ))
    }
}

impl Parseable<VolumeFace> for VolumeFace {
    fn parse<R: Read>(rdr: &mut R) -> Result<VolumeFace, RepoError> {
        let vertex_count = rdr.read_u32::<LittleEndian>()? as usize;
        let index_count = rdr.read_u32::<LittleEndian>()? as usize;

        if vertex_count > u16::MAX as usize {
            return Err(RepoError::FormatError {
                reason: "face vertex count exceeds index range",
            });
        }

        let mut positions = try_alloc_vec::<Vec3>(vertex_count)?;
        for _ in 0..vertex_count {
            positions.push(Vec3::parse(rdr)?);
        }

        let mut normals = try_alloc_vec::<Vec3>(vertex_count)?;
        for _ in 0..vertex_count {
            normals.push(Vec3::parse(rdr)?);
        }

        let mut indices = try_alloc_vec::<u16>(index_count)?;
        for _ in 0..index_count {
            let index = rdr.read_u16::<LittleEndian>()?;
            if index as usize >= vertex_count {
                return Err(RepoError::FormatError {
                    reason: "face index points past the vertex buffer",
                });
            }
            indices.push(index);
        }

        Ok(VolumeFace {
            positions,
            normals,
            indices,
            rigging: None,
        })
    }
}

/// Turns a LOD sub-section byte range into the faces of a volume. The
/// per-face rigging pass happens afterwards, once the caller knows
/// whether a skin descriptor is available.
pub fn parse_volume_faces(data: &[u8]) -> Result<Vec<VolumeFace>, RepoError> {
    if data.is_empty() {
        return Err(RepoError::EmptySource);
    }

    let mut rdr = std::io::Cursor::new(data);
    let face_count = rdr.read_u32::<LittleEndian>()? as usize;
    let mut faces = try_alloc_vec::<VolumeFace>(face_count)?;
    for _ in 0..face_count {
        faces.push(VolumeFace::parse(&mut rdr)?);
    }
    Ok(faces)
}

/// Counterpart of `parse_volume_faces`, used by the upload payload
/// builder and the test fixtures.
pub fn encode_volume_faces<W: Write>(faces: &[VolumeFace], w: &mut W) -> Result<(), RepoError> {
    w.write_u32::<LittleEndian>(faces.len() as u32)?;
    for face in faces {
        w.write_u32::<LittleEndian>(face.positions.len() as u32)?;
        w.write_u32::<LittleEndian>(face.indices.len() as u32)?;
        for pos in &face.positions {
            w.write_f32::<LittleEndian>(pos.x)?;
            w.write_f32::<LittleEndian>(pos.y)?;
            w.write_f32::<LittleEndian>(pos.z)?;
        }
        for normal in &face.normals {
            w.write_f32::<LittleEndian>(normal.x)?;
            w.write_f32::<LittleEndian>(normal.y)?;
            w.write_f32::<LittleEndian>(normal.z)?;
        }
        for index in &face.indices {
            w.write_u16::<LittleEndian>(*index)?;
        }
    }
    Ok(())
}

/// Precomputes the rigging data of every face once both the volume and
/// its skin descriptor are in hand.
pub fn update_rigging_info(faces: &mut [VolumeFace], skin: &SkinInfo) {
    for face in faces.iter_mut() {
        let mut min = Vec3::splat(f32::MAX);
        let mut max = Vec3::splat(f32::MIN);
        for pos in &face.positions {
            min = min.min(*pos);
            max = max.max(*pos);
        }
        face.rigging = Some(FaceRigging {
            joint_count: skin.joint_names.len(),
            bounds_min: min,
            bounds_max: max,
        });
    }
}

#[derive(Serialize, Deserialize)]
struct WireSkin {
    joint_names: Vec<String>,
    bind_shape_matrix: [f32; 16],
    inverse_bind_matrix: Vec<[f32; 16]>,
    #[serde(default)]
    pelvis_offset: f32,
}

#[derive(Serialize, Deserialize, Default)]
struct WireDecomposition {
    #[serde(default)]
    hull_points: Vec<Vec<[f32; 3]>>,
    #[serde(default)]
    base_hull: Vec<[f32; 3]>,
}

fn inflate(data: &[u8]) -> Result<Vec<u8>, RepoError> {
    let mut decoded = Vec::new();
    ZlibDecoder::new(data)
        .take(MAX_DECOMPRESSED_SIZE)
        .read_to_end(&mut decoded)?;
    if decoded.len() as u64 >= MAX_DECOMPRESSED_SIZE {
        return Err(RepoError::FormatError {
            reason: "decompressed payload exceeds the sanity ceiling",
        });
    }
    Ok(decoded)
}

fn deflate(data: &[u8]) -> Result<Vec<u8>, RepoError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Decodes a skin sub-section, which arrives as a zlib compressed
/// structured map.
pub fn parse_skin_info(mesh_id: &MeshId, data: &[u8]) -> Result<SkinInfo, RepoError> {
    if data.is_empty() {
        return Err(RepoError::EmptySource);
    }

    let decoded = inflate(data)?;
    let wire: WireSkin = serde_json::from_slice(&decoded)?;

    if wire.inverse_bind_matrix.len() != wire.joint_names.len() {
        return Err(RepoError::FormatError {
            reason: "inverse bind matrix count does not match joint count",
        });
    }

    Ok(SkinInfo {
        mesh_id: *mesh_id,
        joint_names: wire.joint_names,
        bind_shape_matrix: Mat4::from_cols_array(&wire.bind_shape_matrix),
        inverse_bind_matrices: wire
            .inverse_bind_matrix
            .iter()
            .map(Mat4::from_cols_array)
            .collect(),
        pelvis_offset: wire.pelvis_offset,
    })
}

/// Decodes a physics_convex sub-section into a decomposition record.
pub fn parse_decomposition(mesh_id: &MeshId, data: &[u8]) -> Result<Decomposition, RepoError> {
    if data.is_empty() {
        return Err(RepoError::EmptySource);
    }

    let decoded = inflate(data)?;
    let wire: WireDecomposition = serde_json::from_slice(&decoded)?;

    let mut decomposition = Decomposition::new(*mesh_id);
    decomposition.hulls = wire
        .hull_points
        .into_iter()
        .map(|hull| hull.into_iter().map(Vec3::from_array).collect())
        .collect();
    decomposition.base_hull = wire.base_hull.into_iter().map(Vec3::from_array).collect();
    Ok(decomposition)
}

/// Turns a physics_mesh sub-section into flat position/normal arrays.
/// `None` input is the no-shape case and yields an empty mesh.
pub fn parse_physics_mesh(mesh_id: &MeshId, data: Option<&[u8]>) -> Result<Decomposition, RepoError> {
    let mut decomposition = Decomposition::new(*mesh_id);

    let Some(data) = data else {
        decomposition.physics_shape_mesh = Some(PhysicsMesh::default());
        return Ok(decomposition);
    };

    let faces = parse_volume_faces(data)?;
    let mut mesh = PhysicsMesh::default();
    for face in &faces {
        for tri in face.indices.chunks_exact(3) {
            let v0 = face.positions[tri[0] as usize];
            let v1 = face.positions[tri[1] as usize];
            let v2 = face.positions[tri[2] as usize];
            let normal = (v1 - v0).cross(v2 - v0).normalize_or_zero();
            mesh.positions.extend([v0, v1, v2]);
            mesh.normals.extend([normal, normal, normal]);
        }
    }
    decomposition.physics_shape_mesh = Some(mesh);
    Ok(decomposition)
}

/// Test and upload helpers for the compressed structured payloads.
pub fn encode_skin_info(skin: &SkinInfo) -> Result<Vec<u8>, RepoError> {
    let wire = WireSkin {
        joint_names: skin.joint_names.clone(),
        bind_shape_matrix: skin.bind_shape_matrix.to_cols_array(),
        inverse_bind_matrix: skin
            .inverse_bind_matrices
            .iter()
            .map(|m| m.to_cols_array())
            .collect(),
        pelvis_offset: skin.pelvis_offset,
    };
    deflate(&serde_json::to_vec(&wire)?)
}

pub fn encode_decomposition(decomposition: &Decomposition) -> Result<Vec<u8>, RepoError> {
    let wire = WireDecomposition {
        hull_points: decomposition
            .hulls
            .iter()
            .map(|hull| hull.iter().map(|p| p.to_array()).collect())
            .collect(),
        base_hull: decomposition.base_hull.iter().map(|p| p.to_array()).collect(),
    };
    deflate(&serde_json::to_vec(&wire)?)
}

/// Serializes a whole volume the way the upload payload carries meshes,
/// compressed face stream per LOD.
pub fn encode_volume(volume: &Volume) -> Result<Vec<u8>, RepoError> {
    let mut raw = Vec::new();
    encode_volume_faces(&volume.faces, &mut raw)?;
    deflate(&raw)
}

/// Fallible allocation so an anomalously large sub-section fails its
/// request instead of aborting the process.
pub(crate) fn try_alloc_vec<T>(len: usize) -> Result<Vec<T>, RepoError> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| RepoError::BufferExhausted {
            size: len * std::mem::size_of::<T>(),
        })?;
    Ok(buf)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use uuid::Uuid;

    pub(crate) fn quad_face() -> VolumeFace {
        VolumeFace {
            positions: vec![
                Vec3::new(0.0, 0.0, 0.0),
                Vec3::new(1.0, 0.0, 0.0),
                Vec3::new(1.0, 1.0, 0.0),
                Vec3::new(0.0, 1.0, 0.0),
            ],
            normals: vec![Vec3::Z; 4],
            indices: vec![0, 1, 2, 0, 2, 3],
            rigging: None,
        }
    }

    #[test]
    fn face_stream_roundtrips() {
        let faces = vec![quad_face(), quad_face()];
        let mut bytes = Vec::new();
        encode_volume_faces(&faces, &mut bytes).expect("encodes");

        let parsed = parse_volume_faces(&bytes).expect("parses");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].positions, faces[0].positions);
        assert_eq!(parsed[1].indices, faces[1].indices);
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let mut face = quad_face();
        face.indices[3] = 9;
        let mut bytes = Vec::new();
        encode_volume_faces(&[face], &mut bytes).expect("encodes");

        assert!(parse_volume_faces(&bytes).is_err());
    }

    #[test]
    fn skin_roundtrips_through_compressed_map() {
        let skin = SkinInfo {
            mesh_id: Uuid::new_v4(),
            joint_names: vec!["mPelvis".into(), "mChest".into()],
            bind_shape_matrix: Mat4::IDENTITY,
            inverse_bind_matrices: vec![Mat4::IDENTITY, Mat4::IDENTITY],
            pelvis_offset: -0.5,
        };
        let bytes = encode_skin_info(&skin).expect("encodes");
        let parsed = parse_skin_info(&skin.mesh_id, &bytes).expect("parses");

        assert_eq!(parsed.joint_names, skin.joint_names);
        assert_eq!(parsed.pelvis_offset, skin.pelvis_offset);
        assert_eq!(parsed.inverse_bind_matrices.len(), 2);
    }

    #[test]
    fn skin_with_mismatched_joints_fails() {
        let skin = SkinInfo {
            mesh_id: Uuid::new_v4(),
            joint_names: vec!["mPelvis".into()],
            bind_shape_matrix: Mat4::IDENTITY,
            inverse_bind_matrices: vec![],
            pelvis_offset: 0.0,
        };
        // encode side does not validate, the parser must
        let bytes = encode_skin_info(&skin).expect("encodes");
        assert!(parse_skin_info(&skin.mesh_id, &bytes).is_err());
    }

    #[test]
    fn physics_mesh_of_absent_section_is_empty_but_present() {
        let id = Uuid::new_v4();
        let decomposition = parse_physics_mesh(&id, None).expect("null result");
        let mesh = decomposition.physics_shape_mesh.expect("delivered");
        assert!(mesh.is_empty());
    }

    #[test]
    fn physics_mesh_triangulates_faces() {
        let mut bytes = Vec::new();
        encode_volume_faces(&[quad_face()], &mut bytes).expect("encodes");

        let id = Uuid::new_v4();
        let decomposition = parse_physics_mesh(&id, Some(&bytes)).expect("parses");
        let mesh = decomposition.physics_shape_mesh.expect("delivered");
        // two triangles, three corners each
        assert_eq!(mesh.positions.len(), 6);
        assert_eq!(mesh.normals.len(), 6);
        assert_eq!(mesh.normals[0], Vec3::Z);
    }

    #[test]
    fn rigging_is_attached_per_face() {
        let skin = SkinInfo {
            mesh_id: Uuid::new_v4(),
            joint_names: vec!["mPelvis".into(), "mChest".into(), "mHead".into()],
            bind_shape_matrix: Mat4::IDENTITY,
            inverse_bind_matrices: vec![Mat4::IDENTITY; 3],
            pelvis_offset: 0.0,
        };
        let mut faces = vec![quad_face()];
        update_rigging_info(&mut faces, &skin);

        let rigging = faces[0].rigging.as_ref().expect("rigged");
        assert_eq!(rigging.joint_count, 3);
        assert_eq!(rigging.bounds_min, Vec3::ZERO);
        assert_eq!(rigging.bounds_max, Vec3::new(1.0, 1.0, 0.0));
    }

    #[test]
    fn decomposition_roundtrips() {
        let mut decomposition = Decomposition::new(Uuid::new_v4());
        decomposition.hulls = vec![vec![Vec3::ZERO, Vec3::X, Vec3::Y, Vec3::Z]];
        decomposition.base_hull = vec![Vec3::ZERO, Vec3::ONE];

        let bytes = encode_decomposition(&decomposition).expect("encodes");
        let parsed = parse_decomposition(&decomposition.mesh_id, &bytes).expect("parses");
        assert_eq!(parsed.hulls.len(), 1);
        assert_eq!(parsed.hulls[0].len(), 4);
        assert_eq!(parsed.base_hull.len(), 2);
    }
}
