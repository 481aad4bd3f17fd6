use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use glam::Mat4;
use parking_lot::Mutex;
use tracing::debug;

use crate::asset::AvatarAsset;
use crate::pose::Pose;
use crate::render::{RenderSurface, SurfaceError};
use crate::state::RenderState;

/// What the headless surface last drew.
#[derive(Debug, Clone, Default)]
pub struct SurfaceProbe {
    pub draws: u64,
    pub applies: u64,
    pub visible: bool,
    pub asset: Option<String>,
    pub root: Mat4,
    /// World matrix of every mesh-bearing node, by mesh id.
    pub mesh_nodes: Vec<(String, Mat4)>,
    pub weights: HashMap<String, Vec<f32>>,
    pub released: bool,
    pub releases: u32,
    fail_draws: bool,
}

impl fmt::Display for SurfaceProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} draws, {} applies, asset {}, {} meshes, {} weighted, visible {}, at {}, {} releases",
            self.draws,
            self.applies,
            self.asset.as_deref().unwrap_or("none"),
            self.mesh_nodes.len(),
            self.weights.len(),
            self.visible,
            self.root.w_axis.truncate(),
            self.releases,
        )
    }
}

/// A surface that keeps the placed scene in memory instead of rasterizing
/// it. Clones share the same probe.
#[derive(Debug, Clone, Default)]
pub struct HeadlessSurface {
    probe: Arc<Mutex<SurfaceProbe>>,
}

impl HeadlessSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn probe(&self) -> SurfaceProbe {
        self.probe.lock().clone()
    }

    #[cfg(test)]
    pub fn fail_draws(&self, fail: bool) {
        self.probe.lock().fail_draws = fail;
    }
}

impl RenderSurface for HeadlessSurface {
    fn apply(&mut self, asset: &AvatarAsset, state: &RenderState) {
        let mut probe = self.probe.lock();
        if probe.asset.as_deref() != Some(asset.uri()) {
            debug!("instancing {}", asset.uri());
            probe.asset = Some(asset.uri().to_string());
        }

        let root = Pose {
            position: state.position,
            rotation: state.rotation,
            scale: state.scale,
        }.to_matrix();
        let scene = asset.scene();
        probe.mesh_nodes = scene.nodes.iter()
            .enumerate()
            .filter_map(|(i, node)| {
                let mesh = scene.meshes.get(node.mesh?)?;
                Some((mesh.id.clone(), root * scene.world_matrix(i)))
            })
            .collect();
        probe.root = root;
        probe.weights = state.influences.iter()
            .map(|(mesh, weights)| (mesh.to_string(), weights.to_vec()))
            .collect();
        probe.visible = true;
        probe.applies += 1;
    }

    fn hide(&mut self) {
        self.probe.lock().visible = false;
    }

    fn draw(&mut self) -> Result<(), SurfaceError> {
        let mut probe = self.probe.lock();
        if probe.released {
            return Err(SurfaceError::Lost);
        }
        if probe.fail_draws {
            return Err(SurfaceError::Draw("injected failure".to_string()));
        }
        probe.draws += 1;
        Ok(())
    }

    fn release(&mut self) {
        let mut probe = self.probe.lock();
        probe.released = true;
        probe.releases += 1;
        probe.visible = false;
    }
}
