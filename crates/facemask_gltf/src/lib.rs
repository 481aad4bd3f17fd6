//! Reads the parts of a glTF avatar that the overlay engine drives: the node
//! hierarchy, and for every mesh the table of morph-target names.

pub use loader::{load_scene, SceneError};
pub use scene::{AvatarScene, MeshMorphTargets, SceneCalibration, SceneNode};

mod loader;
mod scene;
