use std::sync::Arc;
use std::time::SystemTime;

use arc_swap::ArcSwap;
use glam::{Quat, Vec3};

use crate::asset::AvatarAsset;
use crate::expression::MorphInfluences;
use crate::registry::RegistryReport;

/// What the renderer draws on a given tick. Replaced whole on every commit.
#[derive(Debug, Clone)]
pub struct RenderState {
    pub asset: Option<Arc<AvatarAsset>>,
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
    pub influences: MorphInfluences,
    pub frames_since_detection: u32,
    pub pose_captured_at: Option<SystemTime>,
    pub visible: bool,
    pub generation: u64,
}

impl RenderState {
    pub fn active_uri(&self) -> Option<&str> {
        self.asset.as_deref().map(AvatarAsset::uri)
    }
}

impl Default for RenderState {
    fn default() -> Self {
        Self {
            asset: None,
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
            influences: MorphInfluences::default(),
            frames_since_detection: 0,
            pose_captured_at: None,
            visible: false,
            generation: 0,
        }
    }
}

/// Single-writer snapshot cell. The tick publishes, anything else may load a
/// coherent copy at any time without blocking it.
pub struct StateCell {
    state: ArcSwap<RenderState>,
    registry: ArcSwap<RegistryReport>,
}

impl StateCell {
    pub fn new() -> Self {
        Self {
            state: ArcSwap::from_pointee(RenderState::default()),
            registry: ArcSwap::from_pointee(RegistryReport::default()),
        }
    }

    /// Stores `state` as the current one, stamping the next generation.
    pub fn publish(&self, mut state: RenderState) -> u64 {
        let previous = self.state.load();
        state.generation = previous.generation + 1;
        let generation = state.generation;
        self.state.store(Arc::new(state));
        generation
    }

    pub fn load(&self) -> Arc<RenderState> {
        self.state.load_full()
    }

    pub fn publish_registry(&self, report: RegistryReport) {
        self.registry.store(Arc::new(report));
    }

    pub fn registry(&self) -> Arc<RegistryReport> {
        self.registry.load_full()
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}
