use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use glam::Vec3;
use log::{debug, info, warn};
use nalgebra::Point3;
use rapier3d::geometry::SharedShape;

use crate::asset::types::{Decomposition, MeshId, PhysicsMesh, VolumeFace};

/// Which pass the decomposer runs for a request. `SingleHull` is the
/// fast path used during uploads, a full decomposition produces one
/// convex hull per extracted part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecompStage {
    Decompose,
    SingleHull,
}

/// Geometry handed to the decomposition worker.
pub struct DecompRequest {
    pub mesh_id: MeshId,
    pub stage: DecompStage,
    pub positions: Vec<Vec3>,
    pub indices: Vec<[u32; 3]>,
    /// When set, the result is delivered through the ticket instead of
    /// the registry's completion queue. Upload workers poll it.
    pub ticket: Option<Arc<DecompTicket>>,
}

impl DecompRequest {
    /// Flattens volume faces into one position/index soup, dropping
    /// triangles whose area falls below a threshold derived from the
    /// bounding box. Degenerate slivers make the decomposition library
    /// produce garbage hulls.
    pub fn from_faces(mesh_id: MeshId, stage: DecompStage, faces: &[VolumeFace]) -> Self {
        let mut positions: Vec<Vec3> = Vec::new();
        let mut indices: Vec<[u32; 3]> = Vec::new();

        let mut bbox_min = Vec3::splat(f32::MAX);
        let mut bbox_max = Vec3::splat(f32::MIN);
        for face in faces {
            for position in &face.positions {
                bbox_min = bbox_min.min(*position);
                bbox_max = bbox_max.max(*position);
            }
        }
        let extent = bbox_max - bbox_min;
        let range = extent.x.min(extent.y).min(extent.z);
        let area_threshold = (0.0002f32).min(range * 0.000002);

        let mut index_offset = 0u32;
        for face in faces {
            positions.extend_from_slice(&face.positions);

            for tri in face.indices.chunks_exact(3) {
                let tri = [
                    tri[0] as u32 + index_offset,
                    tri[1] as u32 + index_offset,
                    tri[2] as u32 + index_offset,
                ];
                if Self::is_valid_triangle(&positions, tri, area_threshold) {
                    indices.push(tri);
                }
            }
            index_offset += face.positions.len() as u32;
        }

        Self {
            mesh_id,
            stage,
            positions,
            indices,
            ticket: None,
        }
    }

    pub fn with_ticket(mut self, ticket: Arc<DecompTicket>) -> Self {
        self.ticket = Some(ticket);
        self
    }

    pub fn is_valid(&self) -> bool {
        !self.positions.is_empty()
    }

    fn is_valid_triangle(positions: &[Vec3], tri: [u32; 3], threshold: f32) -> bool {
        let a = positions[tri[1] as usize] - positions[tri[0] as usize];
        let b = positions[tri[2] as usize] - positions[tri[0] as usize];
        let c = a.dot(b);
        a.dot(a) * b.dot(b) - c * c > threshold
    }
}

/// Poll handle for callers that block on a decomposition, fulfilled by
/// the worker itself so waiting does not depend on render frames.
#[derive(Default)]
pub struct DecompTicket {
    done: AtomicBool,
    result: Mutex<Option<Decomposition>>,
}

impl DecompTicket {
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    pub fn take_result(&self) -> Option<Decomposition> {
        self.result.lock().expect("poisoned lock").take()
    }

    fn fulfill(&self, decomposition: Decomposition) {
        *self.result.lock().expect("poisoned lock") = Some(decomposition);
        self.done.store(true, Ordering::SeqCst);
    }
}

struct DecompShared {
    queue: Mutex<VecDeque<DecompRequest>>,
    completed: Mutex<Vec<Decomposition>>,
    signal: Condvar,
    signal_state: Mutex<bool>,
    quitting: AtomicBool,
}

/// Cloneable submission handle, held by the registry and by upload
/// workers.
#[derive(Clone)]
pub struct DecompQueue {
    shared: Arc<DecompShared>,
}

impl DecompQueue {
    pub fn submit(&self, request: DecompRequest) {
        if !request.is_valid() {
            debug!("Dropping decomposition request without geometry");
            if let Some(ticket) = request.ticket {
                ticket.fulfill(Decomposition::new(request.mesh_id));
            }
            return;
        }
        self.shared
            .queue
            .lock()
            .expect("poisoned lock")
            .push_back(request);
        let mut flagged = self.shared.signal_state.lock().expect("poisoned lock");
        *flagged = true;
        self.shared.signal.notify_all();
    }
}

/// The convex decomposition worker. Consumes geometry requests and emits
/// hull sets, drained by the registry's per-frame callback.
pub struct PhysicsDecomp {
    shared: Arc<DecompShared>,
    worker: Option<JoinHandle<()>>,
}

impl PhysicsDecomp {
    pub fn start() -> Self {
        let shared = Arc::new(DecompShared {
            queue: Mutex::new(VecDeque::new()),
            completed: Mutex::new(Vec::new()),
            signal: Condvar::new(),
            signal_state: Mutex::new(false),
            quitting: AtomicBool::new(false),
        });
        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name("mesh-decomp".into())
            .spawn(move || run(worker_shared))
            .expect("spawning decomposition worker");
        Self {
            shared,
            worker: Some(worker),
        }
    }

    pub fn queue(&self) -> DecompQueue {
        DecompQueue {
            shared: self.shared.clone(),
        }
    }

    /// Finished hull sets since the last call.
    pub fn take_completed(&self) -> Vec<Decomposition> {
        std::mem::take(&mut self.shared.completed.lock().expect("poisoned lock"))
    }

    pub fn shutdown(&mut self) {
        self.shared.quitting.store(true, Ordering::SeqCst);
        {
            let mut flagged = self.shared.signal_state.lock().expect("poisoned lock");
            *flagged = true;
            self.shared.signal.notify_all();
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for PhysicsDecomp {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.shutdown();
        }
    }
}

fn run(shared: Arc<DecompShared>) {
    while !shared.quitting.load(Ordering::SeqCst) {
        {
            let mut flagged = shared.signal_state.lock().expect("poisoned lock");
            while !*flagged && !shared.quitting.load(Ordering::SeqCst) {
                let (guard, timeout) = shared
                    .signal
                    .wait_timeout(flagged, Duration::from_millis(500))
                    .expect("poisoned lock");
                flagged = guard;
                if timeout.timed_out() {
                    break;
                }
            }
            *flagged = false;
        }

        loop {
            if shared.quitting.load(Ordering::SeqCst) {
                break;
            }
            let request = {
                let mut queue = shared.queue.lock().expect("poisoned lock");
                queue.pop_front()
            };
            let Some(request) = request else { break };

            let result = match request.stage {
                DecompStage::SingleHull => do_single_hull(&request),
                DecompStage::Decompose => do_decomposition(&request),
            };

            match request.ticket {
                Some(ticket) => ticket.fulfill(result),
                None => shared
                    .completed
                    .lock()
                    .expect("poisoned lock")
                    .push(result),
            }
        }
    }
    info!("Mesh decomposition worker exiting");
}

fn to_points(positions: &[Vec3]) -> Vec<Point3<f32>> {
    positions
        .iter()
        .map(|v| Point3::new(v.x, v.y, v.z))
        .collect()
}

fn hull_to_vecs(points: &[Point3<f32>]) -> Vec<Vec3> {
    points.iter().map(|p| Vec3::new(p.x, p.y, p.z)).collect()
}

/// Triangle soup of a hull for the physics display path, flat normals
/// per triangle.
fn mesh_from_trimesh(points: &[Point3<f32>], indices: &[[u32; 3]]) -> PhysicsMesh {
    let mut mesh = PhysicsMesh::default();
    let as_vec = |p: &Point3<f32>| Vec3::new(p.x, p.y, p.z);
    for tri in indices {
        let v0 = as_vec(&points[tri[0] as usize]);
        let v1 = as_vec(&points[tri[1] as usize]);
        let v2 = as_vec(&points[tri[2] as usize]);
        let normal = (v1 - v0).cross(v2 - v0).normalize_or_zero();
        mesh.positions.extend([v0, v1, v2]);
        mesh.normals.extend([normal, normal, normal]);
    }
    mesh
}

/// Axis aligned box fallback when hull building fails outright.
fn make_box(positions: &[Vec3]) -> Vec<Vec3> {
    let mut min = positions.first().copied().unwrap_or(Vec3::ZERO);
    let mut max = min;
    for position in positions {
        min = min.min(*position);
        max = max.max(*position);
    }
    vec![
        Vec3::new(min.x, min.y, min.z),
        Vec3::new(max.x, min.y, min.z),
        Vec3::new(min.x, max.y, min.z),
        Vec3::new(max.x, max.y, min.z),
        Vec3::new(min.x, min.y, max.z),
        Vec3::new(max.x, min.y, max.z),
        Vec3::new(min.x, max.y, max.z),
        Vec3::new(max.x, max.y, max.z),
    ]
}

fn do_single_hull(request: &DecompRequest) -> Decomposition {
    let mut decomposition = Decomposition::new(request.mesh_id);
    let points = to_points(&request.positions);

    let hull = if points.len() >= 4 {
        rapier3d::parry::transformation::try_convex_hull(&points).ok()
    } else {
        None
    };

    match hull {
        Some((hull_points, hull_indices)) => {
            decomposition.base_hull = hull_to_vecs(&hull_points);
            decomposition.base_hull_mesh = mesh_from_trimesh(&hull_points, &hull_indices);
            decomposition.hulls = vec![decomposition.base_hull.clone()];
            decomposition.hull_meshes = vec![decomposition.base_hull_mesh.clone()];
        }
        None => {
            warn!(
                "Could not build a single hull for {}, substituting its bounding box",
                request.mesh_id
            );
            let box_hull = make_box(&request.positions);
            decomposition.base_hull = box_hull.clone();
            decomposition.hulls = vec![box_hull];
        }
    }
    decomposition
}

fn do_decomposition(request: &DecompRequest) -> Decomposition {
    let mut decomposition = Decomposition::new(request.mesh_id);
    if request.positions.len() < 4 || request.indices.is_empty() {
        decomposition.hulls = vec![make_box(&request.positions)];
        return decomposition;
    }

    let points = to_points(&request.positions);
    let shape = SharedShape::convex_decomposition(&points, &request.indices);

    if let Some(compound) = shape.as_compound() {
        for (_, part) in compound.shapes() {
            if let Some(polyhedron) = part.as_convex_polyhedron() {
                let (hull_points, hull_indices) = polyhedron.to_trimesh();
                decomposition.hulls.push(hull_to_vecs(&hull_points));
                decomposition
                    .hull_meshes
                    .push(mesh_from_trimesh(&hull_points, &hull_indices));
            }
        }
    } else if let Some(polyhedron) = shape.as_convex_polyhedron() {
        let (hull_points, hull_indices) = polyhedron.to_trimesh();
        decomposition.hulls.push(hull_to_vecs(&hull_points));
        decomposition
            .hull_meshes
            .push(mesh_from_trimesh(&hull_points, &hull_indices));
    }

    if decomposition.hulls.is_empty() {
        warn!(
            "Convex decomposition produced no hulls for {}, substituting its bounding box",
            request.mesh_id
        );
        decomposition.hulls = vec![make_box(&request.positions)];
    }
    decomposition
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn cube_faces() -> Vec<VolumeFace> {
        let positions = vec![
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(1.0, 1.0, 0.0),
            Vec3::new(0.0, 1.0, 0.0),
            Vec3::new(0.0, 0.0, 1.0),
            Vec3::new(1.0, 0.0, 1.0),
            Vec3::new(1.0, 1.0, 1.0),
            Vec3::new(0.0, 1.0, 1.0),
        ];
        let indices: Vec<u16> = vec![
            0, 2, 1, 0, 3, 2, // bottom
            4, 5, 6, 4, 6, 7, // top
            0, 1, 5, 0, 5, 4, // front
            2, 3, 7, 2, 7, 6, // back
            1, 2, 6, 1, 6, 5, // right
            3, 0, 4, 3, 4, 7, // left
        ];
        vec![VolumeFace {
            normals: vec![Vec3::Z; positions.len()],
            positions,
            indices,
            rigging: None,
        }]
    }

    #[test]
    fn degenerate_triangles_are_filtered() {
        let mut faces = cube_faces();
        // a sliver triangle reusing one vertex twice
        faces[0].indices.extend([0, 0, 1]);

        let request =
            DecompRequest::from_faces(Uuid::new_v4(), DecompStage::Decompose, &faces);
        assert_eq!(request.positions.len(), 8);
        assert_eq!(request.indices.len(), 12);
    }

    #[test]
    fn single_hull_of_a_cube_covers_its_corners() {
        let request = DecompRequest::from_faces(
            Uuid::new_v4(),
            DecompStage::SingleHull,
            &cube_faces(),
        );
        let decomposition = do_single_hull(&request);
        assert_eq!(decomposition.hulls.len(), 1);
        assert_eq!(decomposition.base_hull.len(), 8);
        assert!(!decomposition.base_hull_mesh.is_empty());
    }

    #[test]
    fn degenerate_geometry_falls_back_to_a_box() {
        let line = vec![VolumeFace {
            positions: vec![Vec3::ZERO, Vec3::X],
            normals: vec![Vec3::Z; 2],
            indices: vec![],
            rigging: None,
        }];
        let request = DecompRequest::from_faces(Uuid::new_v4(), DecompStage::SingleHull, &line);
        let decomposition = do_single_hull(&request);
        assert_eq!(decomposition.hulls.len(), 1);
        assert_eq!(decomposition.hulls[0].len(), 8); // the AABB corners
    }

    #[test]
    fn worker_round_trips_a_request_through_the_completed_queue() {
        let mut decomp = PhysicsDecomp::start();
        let request = DecompRequest::from_faces(
            Uuid::new_v4(),
            DecompStage::SingleHull,
            &cube_faces(),
        );
        decomp.queue().submit(request);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let mut completed = Vec::new();
        while completed.is_empty() && std::time::Instant::now() < deadline {
            completed = decomp.take_completed();
            std::thread::sleep(Duration::from_millis(5));
        }
        decomp.shutdown();
        assert_eq!(completed.len(), 1);
    }

    #[test]
    fn tickets_are_fulfilled_by_the_worker() {
        let mut decomp = PhysicsDecomp::start();
        let ticket = Arc::new(DecompTicket::default());
        let request = DecompRequest::from_faces(
            Uuid::new_v4(),
            DecompStage::SingleHull,
            &cube_faces(),
        )
        .with_ticket(ticket.clone());
        decomp.queue().submit(request);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !ticket.is_done() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        decomp.shutdown();

        assert!(ticket.is_done());
        let result = ticket.take_result().expect("result delivered");
        assert!(!result.hulls.is_empty());
        // nothing must land on the registry path for ticketed requests
        assert!(decomp.take_completed().is_empty());
    }
}
