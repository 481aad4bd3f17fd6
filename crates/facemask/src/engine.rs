use std::sync::Arc;
use std::time::SystemTime;

use tracing::{debug, info, warn};

use facemask_api::ConnectionState;

use crate::asset::AvatarAsset;
use crate::config::EngineConfig;
use crate::events::InboundEvent;
use crate::expression::{map_expressions, MorphInfluences};
use crate::pose::{DetectionTracker, Pose, PoseDecoder};
use crate::registry::{Completion, ModelRegistry};
use crate::state::{RenderState, StateCell};
use crate::tracking::{ControlCommand, PoseFrame};

/// Owns everything the render tick mutates. Events are applied in drain
/// order and one `RenderState` is committed per tick.
pub struct Engine {
    decoder: PoseDecoder,
    detection: DetectionTracker,
    registry: ModelRegistry,
    cell: Arc<StateCell>,
    pose: Option<Pose>,
    pose_captured_at: Option<SystemTime>,
    influences: MorphInfluences,
    // Influences are only valid for the asset they were computed against.
    influences_for: Option<String>,
}

impl Engine {
    pub fn new(config: &EngineConfig, registry: ModelRegistry, cell: Arc<StateCell>) -> Self {
        Self {
            decoder: PoseDecoder::new(config.axis_correction, config.offset()),
            detection: DetectionTracker::new(config.hide_after_ticks),
            registry,
            cell,
            pose: None,
            pose_captured_at: None,
            influences: MorphInfluences::default(),
            influences_for: None,
        }
    }

    #[cfg(test)]
    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn handle(&mut self, event: InboundEvent) {
        match event {
            InboundEvent::PoseUpdate(frame) => self.apply_pose(&frame),
            InboundEvent::AssetSelect(command) => self.select(command),
            InboundEvent::ConnectionStateChange(channel, state) => match state {
                ConnectionState::Connected => info!("{:?} channel connected", channel),
                ConnectionState::Disconnected => info!("{:?} channel disconnected", channel),
            },
            InboundEvent::AssetLoaded(outcome) => {
                let uri = outcome.uri.clone();
                match self.registry.complete(outcome) {
                    Completion::Activated(asset) => self.switch_to(&asset),
                    Completion::Cached => debug!("cached {}", uri),
                    Completion::Discarded => debug!("discarded stale load of {}", uri),
                    Completion::Failed(err) => warn!("{}", err),
                }
            }
        }
    }

    fn apply_pose(&mut self, frame: &PoseFrame) {
        if let Some(transform) = frame.transform() {
            match self.decoder.decode(transform) {
                Ok(pose) => {
                    self.pose = Some(pose);
                    self.pose_captured_at = Some(frame.captured_at());
                    self.detection.detected();
                }
                Err(err) => debug!("holding last pose: {}", err),
            }
        } else if !frame.landmarks().is_empty() {
            debug!("{} landmarks without a transform", frame.landmarks().len());
        }

        if frame.blend_shapes().is_empty() {
            return;
        }
        let Some(asset) = self.registry.active().cloned() else {
            return;
        };
        self.ensure_influences(&asset);
        self.influences = map_expressions(frame.blend_shapes(), asset.morph_tables(), &self.influences);
    }

    fn select(&mut self, command: ControlCommand) {
        let queued = command.received_at.elapsed().unwrap_or_default();
        let handle = self.registry.request_load(&command.uri);
        info!("selecting {} (generation {}, queued {:?})", handle.uri, handle.generation, queued);
        if let Some(asset) = self.registry.set_active(&command.uri) {
            // Reselecting the shown asset keeps its expression.
            self.ensure_influences(&asset);
        }
    }

    fn switch_to(&mut self, asset: &Arc<AvatarAsset>) {
        self.influences = MorphInfluences::defaults(asset.morph_tables());
        self.influences_for = Some(asset.uri().to_string());
    }

    fn ensure_influences(&mut self, asset: &Arc<AvatarAsset>) {
        if self.influences_for.as_deref() != Some(asset.uri()) {
            self.switch_to(asset);
        }
    }

    /// Advances detection by one tick and commits the resulting state.
    pub fn tick(&mut self) -> u64 {
        let frames_since_detection = self.detection.tick();
        let asset = self.registry.active().cloned();

        let mut state = RenderState {
            frames_since_detection,
            pose_captured_at: self.pose_captured_at,
            ..RenderState::default()
        };
        if let Some(asset) = &asset {
            self.ensure_influences(asset);
            let calibration = asset.calibration();
            let pose = self.pose.unwrap_or(Pose::IDENTITY);
            state.position = pose.position + calibration.offset;
            state.rotation = pose.rotation;
            state.scale = pose.scale * calibration.base_scale;
            state.influences = self.influences.clone();
            state.visible = asset.visible() && self.pose.is_some() && self.detection.visible();
        }
        state.asset = asset;

        let generation = self.cell.publish(state);
        self.cell.publish_registry(self.registry.report());
        generation
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::SystemTime;

    use glam::{Mat4, Quat, Vec3};

    use crate::asset::testing::ReadyLoader;
    use crate::events::{self, EventSource};

    use super::*;

    fn row_major(matrix: Mat4) -> Vec<f32> {
        matrix.transpose().to_cols_array().to_vec()
    }

    fn frame(transform: Option<Vec<f32>>, scores: &[(&str, f32)]) -> InboundEvent {
        let scores: HashMap<String, f32> = scores.iter().map(|(k, v)| (k.to_string(), *v)).collect();
        InboundEvent::PoseUpdate(PoseFrame::new(Vec::new(), scores, transform, SystemTime::now()))
    }

    fn engine(config: EngineConfig) -> (Engine, EventSource, Arc<StateCell>) {
        let (tx, rx) = events::channel();
        let registry = ModelRegistry::new(Arc::new(ReadyLoader), tx, config.cache_capacity);
        let cell = Arc::new(StateCell::new());
        (Engine::new(&config, registry, cell.clone()), rx, cell)
    }

    /// Feeds background load results back until `uri` is shown.
    async fn show(engine: &mut Engine, rx: &mut EventSource, uri: &str) {
        engine.handle(InboundEvent::AssetSelect(ControlCommand::new(uri)));
        for _ in 0..100 {
            if engine.registry().active().map(|a| a.uri()) == Some(uri) {
                return;
            }
            tokio::task::yield_now().await;
            for event in rx.drain() {
                engine.handle(event);
            }
        }
        panic!("{uri} never became active");
    }

    #[tokio::test]
    async fn identity_pose_with_expression_is_committed() {
        let config = EngineConfig::default();
        let (mut engine, mut rx, cell) = engine(config.clone());
        show(&mut engine, &mut rx, "a.glb").await;

        engine.handle(frame(Some(row_major(Mat4::IDENTITY)), &[("jawOpen", 0.8), ("unknownCategory", 0.5)]));
        let generation = engine.tick();

        let state = cell.load();
        assert_eq!(state.generation, generation);
        assert!(state.visible);
        assert_eq!(state.active_uri(), Some("a.glb"));
        assert_eq!(state.position, config.offset());
        assert!(state.rotation.abs_diff_eq(Quat::IDENTITY, 0.0));
        assert_eq!(state.scale, Vec3::ONE);
        assert_eq!(state.influences.get("Face"), Some(&[0.8, 0.0][..]));
        assert_eq!(cell.registry().active.as_deref(), Some("a.glb"));
    }

    #[tokio::test]
    async fn hides_after_k_ticks_without_a_face() {
        let config = EngineConfig { hide_after_ticks: 3, ..Default::default() };
        let (mut engine, mut rx, cell) = engine(config);
        show(&mut engine, &mut rx, "a.glb").await;

        engine.tick();
        assert!(!cell.load().visible, "visible before any face");

        engine.handle(frame(Some(row_major(Mat4::IDENTITY)), &[]));
        engine.tick();
        assert!(cell.load().visible);

        // An empty frame is not a detection.
        engine.handle(frame(None, &[]));
        engine.tick();
        engine.tick();
        assert!(cell.load().visible);
        assert_eq!(cell.load().frames_since_detection, 2);

        engine.tick();
        assert!(!cell.load().visible);
    }

    #[tokio::test]
    async fn undecodable_transform_holds_last_pose() {
        let (mut engine, mut rx, cell) = engine(EngineConfig::default());
        show(&mut engine, &mut rx, "a.glb").await;

        let moved = Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0));
        engine.handle(frame(Some(row_major(moved)), &[]));
        engine.tick();
        let held = cell.load().position;

        engine.handle(frame(Some(vec![1.0; 15]), &[]));
        engine.tick();
        let state = cell.load();
        assert_eq!(state.position, held);
        assert_eq!(state.frames_since_detection, 1);
        assert!(state.visible);
    }

    #[tokio::test]
    async fn swapping_assets_resets_influences() {
        let (mut engine, mut rx, cell) = engine(EngineConfig::default());
        show(&mut engine, &mut rx, "a.glb").await;
        engine.handle(frame(Some(row_major(Mat4::IDENTITY)), &[("jawOpen", 1.0)]));
        engine.tick();
        assert_eq!(cell.load().influences.get("Face"), Some(&[1.0, 0.0][..]));

        show(&mut engine, &mut rx, "b.glb").await;
        engine.tick();
        let state = cell.load();
        assert_eq!(state.active_uri(), Some("b.glb"));
        assert_eq!(state.influences.get("Face"), Some(&[0.0, 0.0][..]));
    }

    #[tokio::test]
    async fn reselecting_the_shown_asset_keeps_influences() {
        let (mut engine, mut rx, cell) = engine(EngineConfig::default());
        show(&mut engine, &mut rx, "a.glb").await;
        engine.handle(frame(Some(row_major(Mat4::IDENTITY)), &[("jawOpen", 0.7)]));
        engine.tick();

        engine.handle(InboundEvent::AssetSelect(ControlCommand::new("a.glb")));
        engine.tick();

        let state = cell.load();
        assert_eq!(state.active_uri(), Some("a.glb"));
        assert_eq!(state.influences.get("Face"), Some(&[0.7, 0.0][..]));
    }

    #[tokio::test]
    async fn capture_time_of_decoded_pose_is_committed() {
        let (mut engine, mut rx, cell) = engine(EngineConfig::default());
        show(&mut engine, &mut rx, "a.glb").await;
        let captured_at = SystemTime::UNIX_EPOCH + std::time::Duration::from_millis(1_234);
        engine.handle(InboundEvent::PoseUpdate(PoseFrame::new(
            Vec::new(),
            HashMap::new(),
            Some(row_major(Mat4::IDENTITY)),
            captured_at,
        )));
        engine.tick();

        assert_eq!(cell.load().pose_captured_at, Some(captured_at));
    }

    #[tokio::test]
    async fn nothing_is_visible_without_an_asset() {
        let (mut engine, _rx, cell) = engine(EngineConfig::default());
        engine.handle(frame(Some(row_major(Mat4::IDENTITY)), &[("jawOpen", 1.0)]));
        engine.tick();

        let state = cell.load();
        assert!(state.asset.is_none());
        assert!(!state.visible);
        assert!(state.influences.is_empty());
    }
}
