use std::collections::HashMap;

use glam::{Mat4, Quat, Vec3};
use serde::Deserialize;

/// A parsed avatar. Only ever produced whole: if any mesh or buffer fails to
/// parse, no scene is returned.
#[derive(Debug, Clone)]
pub struct AvatarScene {
    pub nodes: Vec<SceneNode>,
    pub roots: Vec<usize>,
    pub meshes: Vec<MeshMorphTargets>,
    pub calibration: Option<SceneCalibration>,
}

#[derive(Debug, Clone)]
pub struct SceneNode {
    pub name: String,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    pub translation: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
    pub mesh: Option<usize>,
}

impl SceneNode {
    pub fn local_matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.translation)
    }
}

/// The morph targets of one glTF mesh. Every primitive of a mesh shares the
/// same target list, so the table is kept per mesh.
#[derive(Debug, Clone)]
pub struct MeshMorphTargets {
    pub id: String,
    pub target_count: usize,
    pub vertex_count: usize,
    /// Target name to influence index. Only indices below `target_count`.
    pub target_names: HashMap<String, usize>,
    pub default_weights: Vec<f32>,
}

impl MeshMorphTargets {
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.target_names.get(name).copied()
    }
}

/// Per-asset anchor calibration, read from the `facemask` key of the scene
/// extras.
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneCalibration {
    pub base_scale: Option<f32>,
    pub offset: Option<[f32; 3]>,
}

impl AvatarScene {
    pub fn mesh(&self, id: &str) -> Option<&MeshMorphTargets> {
        self.meshes.iter().find(|m| m.id == id)
    }

    pub fn morph_target_count(&self) -> usize {
        self.meshes.iter().map(|m| m.target_count).sum()
    }

    /// World matrix of a node, walking up through its parents.
    pub fn world_matrix(&self, node: usize) -> Mat4 {
        let mut matrix = Mat4::IDENTITY;
        let mut current = Some(node);
        while let Some(index) = current {
            let Some(n) = self.nodes.get(index) else {
                break;
            };
            matrix = n.local_matrix() * matrix;
            current = n.parent;
        }
        matrix
    }
}
