use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use base64::Engine;
use glam::{Quat, Vec3};
use gltf::mesh::Mode;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::scene::{AvatarScene, MeshMorphTargets, SceneCalibration, SceneNode};

/// An error that occurs when extracting an avatar from a glTF file.
#[derive(Error, Debug)]
pub enum SceneError {
    #[error("invalid glTF file: {0}")]
    Gltf(#[from] gltf::Error),
    #[error("binary blob is missing")]
    MissingBlob,
    #[error("failed to decode base64 buffer data")]
    Base64Decode(#[from] base64::DecodeError),
    #[error("unsupported buffer format")]
    BufferFormatUnsupported,
    #[error("buffer uri is not valid utf-8")]
    InvalidUri,
    #[error("external buffer {0} cannot be resolved without a base directory")]
    ExternalBuffer(String),
    #[error("failed to read buffer {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("buffer {index} holds {actual} bytes, {expected} declared")]
    TruncatedBuffer {
        index: usize,
        expected: usize,
        actual: usize,
    },
    #[error("unsupported primitive mode")]
    UnsupportedPrimitive { mode: Mode },
    #[error("mesh {mesh} has a primitive without positions")]
    MissingPositions { mesh: String },
    #[error("mesh {mesh} has inconsistent morph targets")]
    MorphTargetMismatch { mesh: String },
    #[error("file has no nodes")]
    EmptyScene,
}

/// Parses a glTF or GLB payload. External buffers are read relative to
/// `base_dir`; without one only embedded data is accepted.
pub fn load_scene(bytes: &[u8], base_dir: Option<&Path>) -> Result<AvatarScene, SceneError> {
    let gltf = gltf::Gltf::from_slice(bytes)?;
    let buffer_data = load_buffers(&gltf, base_dir)?;

    let mut meshes = Vec::new();
    let mut used_ids = HashSet::new();
    for gltf_mesh in gltf.meshes() {
        let mut id = mesh_id(&gltf_mesh);
        if !used_ids.insert(id.clone()) {
            id = mesh_label(&gltf_mesh);
            used_ids.insert(id.clone());
        }
        meshes.push(load_mesh(&gltf_mesh, id, &buffer_data)?);
    }

    let mut nodes: Vec<SceneNode> = gltf.nodes()
        .map(|node| {
            let (translation, rotation, scale) = node.transform().decomposed();
            SceneNode {
                name: node_name(&node),
                parent: None,
                children: node.children().map(|c| c.index()).collect(),
                translation: Vec3::from_array(translation),
                rotation: Quat::from_array(rotation),
                scale: Vec3::from_array(scale),
                mesh: node.mesh().map(|m| m.index()),
            }
        })
        .collect();
    if nodes.is_empty() {
        return Err(SceneError::EmptyScene);
    }
    for index in 0..nodes.len() {
        for child in nodes[index].children.clone() {
            if let Some(child) = nodes.get_mut(child) {
                child.parent = Some(index);
            }
        }
    }

    let scene = gltf.default_scene().or_else(|| gltf.scenes().next());
    let roots = match &scene {
        Some(scene) => scene.nodes().map(|n| n.index()).collect(),
        None => nodes.iter()
            .enumerate()
            .filter(|(_, n)| n.parent.is_none())
            .map(|(i, _)| i)
            .collect(),
    };
    let calibration = scene.as_ref()
        .and_then(|s| s.extras().as_ref())
        .and_then(|extras| serde_json::from_str::<SceneExtras>(extras.get()).ok())
        .and_then(|extras| extras.facemask);

    Ok(AvatarScene {
        nodes,
        roots,
        meshes,
        calibration,
    })
}

fn load_mesh(
    gltf_mesh: &gltf::Mesh,
    id: String,
    buffer_data: &[Vec<u8>],
) -> Result<MeshMorphTargets, SceneError> {
    let mut vertex_count = 0;
    let mut target_count = None;

    for primitive in gltf_mesh.primitives() {
        check_primitive_mode(primitive.mode())?;

        let reader = primitive.reader(|buffer| buffer_data.get(buffer.index()).map(|b| b.as_slice()));
        let Some(positions) = reader.read_positions() else {
            return Err(SceneError::MissingPositions { mesh: id });
        };
        let primitive_vertices = positions.count();
        vertex_count += primitive_vertices;

        let mut primitive_targets = 0;
        for (positions, normals, tangents) in reader.read_morph_targets() {
            let counts = [
                positions.map(|p| p.count()),
                normals.map(|n| n.count()),
                tangents.map(|t| t.count()),
            ];
            if counts.iter().flatten().any(|&c| c != primitive_vertices) {
                return Err(SceneError::MorphTargetMismatch { mesh: id });
            }
            primitive_targets += 1;
        }

        match target_count {
            None => target_count = Some(primitive_targets),
            Some(expected) if expected != primitive_targets => {
                return Err(SceneError::MorphTargetMismatch { mesh: id });
            }
            Some(_) => {}
        }
    }

    let target_count = target_count.unwrap_or(0);
    let default_weights = match gltf_mesh.weights() {
        Some(weights) if weights.len() == target_count => weights.to_vec(),
        Some(_) => return Err(SceneError::MorphTargetMismatch { mesh: id }),
        None => vec![0.0; target_count],
    };

    let names = gltf_mesh.extras()
        .as_ref()
        .and_then(|extras| serde_json::from_str::<MorphTargetNames>(extras.get()).ok())
        .map(|names| names.target_names)
        .unwrap_or_default();
    if target_count > 0 && names.is_empty() {
        debug!("mesh {} has {} unnamed morph targets", id, target_count);
    }
    if names.len() > target_count {
        warn!("mesh {} names {} morph targets but only has {}", id, names.len(), target_count);
    }
    let target_names: HashMap<String, usize> = names.into_iter()
        .enumerate()
        .filter(|(index, _)| *index < target_count)
        .map(|(index, name)| (name, index))
        .collect();

    Ok(MeshMorphTargets {
        id,
        target_count,
        vertex_count,
        target_names,
        default_weights,
    })
}

fn check_primitive_mode(mode: Mode) -> Result<(), SceneError> {
    match mode {
        Mode::Points | Mode::Lines | Mode::LineStrip | Mode::Triangles | Mode::TriangleStrip => Ok(()),
        mode => Err(SceneError::UnsupportedPrimitive { mode }),
    }
}

fn mesh_id(mesh: &gltf::Mesh) -> String {
    mesh.name()
        .map(|s| s.to_string())
        .unwrap_or_else(|| mesh_label(mesh))
}

fn mesh_label(mesh: &gltf::Mesh) -> String {
    format!("Mesh{}", mesh.index())
}

fn node_name(node: &gltf::Node) -> String {
    node.name()
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("Node{}", node.index()))
}

/// Loads the raw glTF buffer data.
fn load_buffers(gltf: &gltf::Gltf, base_dir: Option<&Path>) -> Result<Vec<Vec<u8>>, SceneError> {
    const VALID_MIME_TYPES: &[&str] = &["application/octet-stream", "application/gltf-buffer"];

    let mut buffer_data = Vec::new();
    for buffer in gltf.buffers() {
        let bytes = match buffer.source() {
            gltf::buffer::Source::Uri(uri) => {
                let uri = percent_encoding::percent_decode_str(uri)
                    .decode_utf8()
                    .map_err(|_| SceneError::InvalidUri)?;
                let uri = uri.as_ref();
                match DataUri::parse(uri) {
                    Some(data_uri) if VALID_MIME_TYPES.contains(&data_uri.mime_type) => {
                        data_uri.decode()?
                    }
                    Some(_) => return Err(SceneError::BufferFormatUnsupported),
                    None => {
                        let Some(base_dir) = base_dir else {
                            return Err(SceneError::ExternalBuffer(uri.to_string()));
                        };
                        let path = base_dir.join(uri);
                        std::fs::read(&path).map_err(|source| SceneError::Io { path, source })?
                    }
                }
            }
            gltf::buffer::Source::Bin => {
                match gltf.blob.as_deref() {
                    Some(blob) => blob.to_vec(),
                    None => return Err(SceneError::MissingBlob),
                }
            }
        };

        if bytes.len() < buffer.length() {
            return Err(SceneError::TruncatedBuffer {
                index: buffer.index(),
                expected: buffer.length(),
                actual: bytes.len(),
            });
        }
        buffer_data.push(bytes);
    }

    Ok(buffer_data)
}

struct DataUri<'a> {
    mime_type: &'a str,
    base64: bool,
    data: &'a str,
}

impl<'a> DataUri<'a> {
    fn parse(uri: &'a str) -> Option<DataUri<'a>> {
        let uri = uri.strip_prefix("data:")?;
        let (mime_type, data) = uri.split_once(',')?;

        let (mime_type, base64) = match mime_type.strip_suffix(";base64") {
            Some(mime_type) => (mime_type, true),
            None => (mime_type, false),
        };

        Some(DataUri {
            mime_type,
            base64,
            data,
        })
    }

    fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        if self.base64 {
            base64::engine::general_purpose::STANDARD.decode(self.data)
        } else {
            Ok(self.data.as_bytes().to_owned())
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MorphTargetNames {
    target_names: Vec<String>,
}

#[derive(Deserialize)]
struct SceneExtras {
    facemask: Option<SceneCalibration>,
}
