use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use glam::{Mat4, Vec3};
use log::{debug, info, warn};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::asset::parse::{encode_decomposition, encode_volume_faces};
use crate::asset::types::{Decomposition, Volume};
use crate::asset::types::LOD_NAMES;
use crate::error::RepoError;
use crate::io::http::HttpStatus;
use crate::physics::decomp::{DecompQueue, DecompRequest, DecompStage, DecompTicket};
use crate::repo::worker::RepoShared;
use crate::NUM_LODS;

/// Metric tag the service expects on whole model uploads.
const MODEL_METRIC: &str = "MUT_Unspecified";

/// Four render LODs plus the optional explicit physics mesh.
pub const NUM_MODEL_SLOTS: usize = NUM_LODS + 1;
pub const PHYSICS_SLOT: usize = NUM_LODS;

/// A model to be uploaded, one volume per LOD slot.
pub struct Model {
    pub name: String,
    pub slots: [Option<Arc<Volume>>; NUM_MODEL_SLOTS],
}

impl Model {
    /// Geometry the hull generation runs on: the explicit physics mesh
    /// when the creator supplied one, otherwise the lowest LOD present.
    pub fn physics_source(&self) -> Option<&Arc<Volume>> {
        self.slots[PHYSICS_SLOT]
            .as_ref()
            .or_else(|| self.slots[..PHYSICS_SLOT].iter().flatten().next())
    }
}

/// Material state of one face of an uploaded instance.
pub struct MaterialBinding {
    pub diffuse_color: [f32; 4],
    pub fullbright: bool,
    /// Index into the upload's texture list.
    pub texture_index: Option<usize>,
}

pub struct ModelInstance {
    pub model: Arc<Model>,
    pub transform: Mat4,
    pub materials: Vec<MaterialBinding>,
}

/// Pre-encoded J2C texture payload.
pub struct UploadTexture {
    pub j2c_bytes: Vec<u8>,
}

pub struct ModelUploadParams {
    pub name: String,
    pub instances: Vec<ModelInstance>,
    pub textures: Vec<UploadTexture>,
    pub scale: Vec3,
    pub upload_textures: bool,
    pub upload_skin: bool,
    pub upload_joints: bool,
    pub lock_scale_if_joint_position: bool,
    pub folder_id: Uuid,
    pub texture_folder_id: Uuid,
    pub next_owner_mask: u32,
    pub group_mask: u32,
    pub everyone_mask: u32,
    /// Fee query capability of the current region.
    pub fee_cap_url: String,
    /// One-shot uploader URL from a previous fee response. Required for
    /// the upload pass.
    pub upload_url: Option<String>,
    /// False runs the fee query, true performs the actual upload.
    pub do_upload: bool,
}

pub trait WholeModelFeeObserver: Send + Sync {
    fn on_model_physics_fee_received(&self, fee_data: &Value, upload_url: &str);
    fn on_model_physics_fee_error(&self, status: u16, reason: &str, error: &Value);
}

pub trait WholeModelUploadObserver: Send + Sync {
    fn on_model_upload_success(&self);
    fn on_model_upload_failure(&self);
}

/// Outcome of a finished upload, handed to the embedding client's
/// inventory layer.
pub struct InventoryData {
    pub name: String,
    pub post_data: Value,
    pub response: Value,
}

/// Results the upload workers queue for the render thread.
pub(crate) enum UploadEvent {
    FeeReceived {
        observer: Option<Arc<dyn WholeModelFeeObserver>>,
        fee_data: Value,
        uploader_url: String,
    },
    FeeFailed {
        observer: Option<Arc<dyn WholeModelFeeObserver>>,
        status: HttpStatus,
        reason: String,
        error: Value,
    },
    UploadSucceeded {
        observer: Option<Arc<dyn WholeModelUploadObserver>>,
    },
    UploadFailed {
        observer: Option<Arc<dyn WholeModelUploadObserver>>,
        status: HttpStatus,
        reason: String,
    },
    InventoryReady(InventoryData),
}

#[derive(Default)]
pub(crate) struct UploadQueues {
    pub events: Vec<UploadEvent>,
    pub inventory: Vec<InventoryData>,
}

struct JobContext {
    params: ModelUploadParams,
    shared: Arc<RepoShared>,
    decomp: DecompQueue,
    queues: Arc<Mutex<UploadQueues>>,
    fee_observer: Option<Arc<dyn WholeModelFeeObserver>>,
    upload_observer: Option<Arc<dyn WholeModelUploadObserver>>,
}

struct JobState {
    discarded: AtomicBool,
    finished: AtomicBool,
}

/// One transient upload worker, spawned per fee query or upload.
pub(crate) struct MeshUploadJob {
    state: Arc<JobState>,
    context: Option<JobContext>,
    thread: Option<JoinHandle<()>>,
}

impl MeshUploadJob {
    pub fn new(
        params: ModelUploadParams,
        shared: Arc<RepoShared>,
        decomp: DecompQueue,
        queues: Arc<Mutex<UploadQueues>>,
        fee_observer: Option<Arc<dyn WholeModelFeeObserver>>,
        upload_observer: Option<Arc<dyn WholeModelUploadObserver>>,
    ) -> Self {
        Self {
            state: Arc::new(JobState {
                discarded: AtomicBool::new(false),
                finished: AtomicBool::new(false),
            }),
            context: Some(JobContext {
                params,
                shared,
                decomp,
                queues,
                fee_observer,
                upload_observer,
            }),
            thread: None,
        }
    }

    pub fn start(&mut self) {
        let Some(context) = self.context.take() else { return };
        let state = self.state.clone();
        let thread = std::thread::Builder::new()
            .name("mesh-upload".into())
            .spawn(move || {
                run(context, &state);
                state.finished.store(true, Ordering::SeqCst);
            })
            .expect("spawning mesh upload worker");
        self.thread = Some(thread);
    }

    /// Aborts the hull generation wait promptly, the HTTP exchange is
    /// left to finish on its own.
    pub fn discard(&self) {
        self.state.discarded.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_none() || self.state.finished.load(Ordering::SeqCst)
    }

    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn run(context: JobContext, state: &JobState) {
    let hulls = match generate_hulls(&context, state) {
        Some(hulls) => hulls,
        None => {
            debug!("Mesh upload operation discarded during hull generation");
            return;
        }
    };

    if context.params.do_upload {
        do_whole_model_upload(&context, &hulls);
    } else {
        request_whole_model_fee(&context, &hulls);
    }
}

/// Blocks until the decomposer produced a convex hull per model,
/// polling with short sleeps so a discard aborts promptly.
fn generate_hulls(context: &JobContext, state: &JobState) -> Option<Vec<Decomposition>> {
    let mut tickets: Vec<Arc<DecompTicket>> = Vec::new();
    let mut seen: Vec<*const Model> = Vec::new();

    for instance in &context.params.instances {
        let model_ptr = Arc::as_ptr(&instance.model);
        if seen.contains(&model_ptr) {
            continue;
        }
        seen.push(model_ptr);

        let Some(physics) = instance.model.physics_source() else {
            warn!("Model '{}' has no geometry to build hulls from", instance.model.name);
            continue;
        };

        let ticket = Arc::new(DecompTicket::default());
        let request = DecompRequest::from_faces(
            physics.mesh_id,
            DecompStage::SingleHull,
            &physics.faces,
        )
        .with_ticket(ticket.clone());
        context.decomp.submit(request);
        tickets.push(ticket);
    }

    while !tickets.iter().all(|ticket| ticket.is_done()) {
        if state.discarded.load(Ordering::SeqCst) || context.shared.is_quitting() {
            return None;
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    Some(tickets.iter().filter_map(|ticket| ticket.take_result()).collect())
}

fn request_whole_model_fee(context: &JobContext, hulls: &[Decomposition]) {
    let payload = match whole_model_payload(&context.params, hulls, false) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("Couldn't build model fee payload: {}", e);
            push_event(
                context,
                UploadEvent::FeeFailed {
                    observer: context.fee_observer.clone(),
                    status: HttpStatus::TRANSPORT_FAILURE,
                    reason: e.to_string(),
                    error: network_error_body(&e.to_string()),
                },
            );
            return;
        }
    };

    let body = serde_json::to_vec(&payload).unwrap_or_default();
    let response = context.shared.transport.post(
        &context.params.fee_cap_url,
        body,
        context.shared.config.small_timeout(),
    );

    if !response.status.is_success() {
        warn!(
            "Fee request failed. Reason: {} ({})",
            response.reason, response.status.0
        );
        push_event(
            context,
            UploadEvent::FeeFailed {
                observer: context.fee_observer.clone(),
                status: response.status,
                reason: response.reason.clone(),
                error: network_error_body(&response.reason),
            },
        );
        return;
    }

    let reply: Value = serde_json::from_slice(&response.body).unwrap_or(Value::Null);
    if reply["state"].as_str() == Some("upload") {
        let uploader = reply["uploader"].as_str().unwrap_or_default().to_string();
        let mut fee_data = reply["data"].clone();
        if fee_data.is_null() {
            fee_data = json!({});
        }
        fee_data["upload_price"] = reply["upload_price"].clone();
        push_event(
            context,
            UploadEvent::FeeReceived {
                observer: context.fee_observer.clone(),
                fee_data,
                uploader_url: uploader,
            },
        );
    } else {
        warn!("Fee request failed. Not in expected 'upload' state");
        push_event(
            context,
            UploadEvent::FeeFailed {
                observer: context.fee_observer.clone(),
                status: response.status,
                reason: response.reason,
                error: reply["error"].clone(),
            },
        );
    }
}

fn do_whole_model_upload(context: &JobContext, hulls: &[Decomposition]) {
    let Some(upload_url) = context.params.upload_url.clone() else {
        warn!("Missing mesh upload capability, unable to upload, fee request failed");
        push_event(
            context,
            UploadEvent::UploadFailed {
                observer: context.upload_observer.clone(),
                status: HttpStatus::TRANSPORT_FAILURE,
                reason: "missing upload capability".into(),
            },
        );
        return;
    };

    let mut payload = match whole_model_payload(&context.params, hulls, true) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("Couldn't build model upload payload: {}", e);
            push_event(
                context,
                UploadEvent::UploadFailed {
                    observer: context.upload_observer.clone(),
                    status: HttpStatus::TRANSPORT_FAILURE,
                    reason: e.to_string(),
                },
            );
            return;
        }
    };

    // the uploader URL is single use and the service reports permanent
    // failures with retryable statuses, so no retries here
    let body = serde_json::to_vec(&payload["asset_resources"]).unwrap_or_default();
    let response = context.shared.transport.post(
        &upload_url,
        body,
        context.shared.config.small_timeout(),
    );

    if !response.status.is_success() {
        warn!(
            "Upload failed. Reason: {} ({})",
            response.reason, response.status.0
        );
        push_event(
            context,
            UploadEvent::UploadFailed {
                observer: context.upload_observer.clone(),
                status: response.status,
                reason: response.reason,
            },
        );
        return;
    }

    let reply: Value = serde_json::from_slice(&response.body).unwrap_or(Value::Null);
    if reply["state"].as_str() == Some("complete") {
        info!("Model upload completed. Instances: {}", context.params.instances.len());
        // the requested "mesh" asset type isn't the type of the
        // resulting object, fix it up for the inventory record
        payload["asset_type"] = json!("object");
        push_event(
            context,
            UploadEvent::InventoryReady(InventoryData {
                name: context.params.name.clone(),
                post_data: payload,
                response: reply,
            }),
        );
        push_event(
            context,
            UploadEvent::UploadSucceeded {
                observer: context.upload_observer.clone(),
            },
        );
    } else {
        warn!("Upload failed. Not in expected 'complete' state");
        push_event(
            context,
            UploadEvent::UploadFailed {
                observer: context.upload_observer.clone(),
                status: response.status,
                reason: reply["error"]["message"]
                    .as_str()
                    .unwrap_or("unexpected upload state")
                    .to_string(),
            },
        );
    }
}

fn push_event(context: &JobContext, event: UploadEvent) {
    context
        .queues
        .lock()
        .expect("poisoned lock")
        .events
        .push(event);
}

fn network_error_body(message: &str) -> Value {
    json!({
        "error": {
            "message": message,
            "identifier": "NetworkError",
            "errors": [],
        }
    })
}

/// Assembles the whole-model payload: parallel mesh, texture and
/// instance lists plus the inventory attributes of the resulting object.
fn whole_model_payload(
    params: &ModelUploadParams,
    hulls: &[Decomposition],
    include_textures: bool,
) -> Result<Value, anyhow::Error> {
    let mut mesh_list: Vec<Value> = Vec::new();
    let mut instance_list: Vec<Value> = Vec::new();
    let mut mesh_index: Vec<(*const Model, usize)> = Vec::new();

    let mut texture_list: Vec<Value> = Vec::new();
    if include_textures && params.upload_textures {
        for texture in &params.textures {
            texture_list.push(json!(texture.j2c_bytes.clone()));
        }
    }

    for instance in &params.instances {
        let model_ptr = Arc::as_ptr(&instance.model);
        let mesh_num = match mesh_index.iter().find(|(ptr, _)| *ptr == model_ptr) {
            Some((_, index)) => *index,
            None => {
                let base_hull = instance
                    .model
                    .physics_source()
                    .and_then(|physics| {
                        hulls
                            .iter()
                            .find(|decomposition| decomposition.mesh_id == physics.mesh_id)
                    })
                    .map(|decomposition| decomposition.base_hull.as_slice());
                let bytes = serialize_model_asset(&instance.model, base_hull)?;
                mesh_list.push(json!(bytes));
                let index = mesh_list.len() - 1;
                mesh_index.push((model_ptr, index));
                index
            }
        };

        let (scale, rotation, position) = instance.transform.to_scale_rotation_translation();
        let face_list: Vec<Value> = instance
            .materials
            .iter()
            .map(|material| {
                let mut face = json!({
                    "diffuse_color": material.diffuse_color,
                    "fullbright": material.fullbright,
                });
                if include_textures {
                    if let Some(index) = material.texture_index {
                        face["image"] = json!(index);
                    }
                }
                face
            })
            .collect();

        instance_list.push(json!({
            "mesh": mesh_num,
            "position": [position.x, position.y, position.z],
            "rotation": [rotation.x, rotation.y, rotation.z, rotation.w],
            "scale": [
                scale.x * params.scale.x,
                scale.y * params.scale.y,
                scale.z * params.scale.z,
            ],
            "face_list": face_list,
        }));
    }

    Ok(json!({
        "name": params.name,
        "folder_id": params.folder_id,
        "texture_folder_id": params.texture_folder_id,
        "asset_type": "mesh",
        "inventory_type": "object",
        "description": "(No Description)",
        "next_owner_mask": params.next_owner_mask,
        "group_mask": params.group_mask,
        "everyone_mask": params.everyone_mask,
        "metric": MODEL_METRIC,
        "asset_resources": {
            "mesh_list": mesh_list,
            "texture_list": texture_list,
            "instance_list": instance_list,
        },
    }))
}

/// Serializes a model in the packed asset layout the fetch path reads:
/// a leading structured map keyed by sub-section name, followed by the
/// sub-section payloads at their declared offsets.
pub fn serialize_model_asset(
    model: &Model,
    base_hull: Option<&[Vec3]>,
) -> Result<Vec<u8>, RepoError> {
    let mut sections: Vec<(&str, Vec<u8>)> = Vec::new();

    for (lod, slot) in model.slots[..NUM_LODS].iter().enumerate() {
        if let Some(volume) = slot {
            let mut bytes = Vec::new();
            encode_volume_faces(&volume.faces, &mut bytes)?;
            sections.push((LOD_NAMES[lod], bytes));
        }
    }

    if let Some(base_hull) = base_hull {
        if !base_hull.is_empty() {
            let mesh_id = model
                .physics_source()
                .map(|volume| volume.mesh_id)
                .unwrap_or_else(Uuid::nil);
            let mut decomposition = Decomposition::new(mesh_id);
            decomposition.base_hull = base_hull.to_vec();
            sections.push(("physics_convex", encode_decomposition(&decomposition)?));
        }
    }

    let mut header = serde_json::Map::new();
    header.insert("version".into(), json!(1));
    let mut offset = 0usize;
    for (name, bytes) in &sections {
        header.insert(
            (*name).into(),
            json!({ "offset": offset, "size": bytes.len() }),
        );
        offset += bytes.len();
    }

    let mut asset = serde_json::to_vec(&Value::Object(header))?;
    for (_, bytes) in &sections {
        asset.extend_from_slice(bytes);
    }
    Ok(asset)
}
