use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::asset::AssetCalibration;
use crate::pose::AxisCorrection;

/// Asset shown at startup when none is given.
pub const DEFAULT_MODEL: &str = "models/raccoon_head.glb";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    pub refresh_hz: u32,
    /// Ticks without a decoded face before the avatar is hidden.
    pub hide_after_ticks: u32,
    /// Loaded assets kept around, the active one included.
    pub cache_capacity: usize,
    /// Anchor bias added to every decoded position.
    pub calibration_offset: [f32; 3],
    /// Uniform scale for assets that do not carry their own.
    pub base_scale: f32,
    pub axis_correction: AxisCorrection,
    pub default_model: Option<String>,
    /// Upper bound on fetching one asset over http.
    pub load_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            refresh_hz: 60,
            hide_after_ticks: 5,
            cache_capacity: 4,
            calibration_offset: [0.0, 0.1, 0.05],
            base_scale: 0.6,
            axis_correction: AxisCorrection::MIRROR,
            default_model: Some(DEFAULT_MODEL.to_string()),
            load_timeout_secs: 30,
        }
    }
}

impl EngineConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(config)
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.refresh_hz.max(1) as f64)
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_secs(self.load_timeout_secs.max(1))
    }

    pub fn offset(&self) -> Vec3 {
        Vec3::from_array(self.calibration_offset)
    }

    pub fn asset_calibration(&self) -> AssetCalibration {
        AssetCalibration {
            base_scale: Vec3::splat(self.base_scale),
            offset: Vec3::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{
            "refreshHz": 30,
            "axisCorrection": {"flipX": false, "flipY": true, "flipZ": false}
        }"#).unwrap();

        assert_eq!(config.refresh_hz, 30);
        assert!(config.axis_correction.flip_y);
        assert!(!config.axis_correction.flip_x);
        assert_eq!(config.hide_after_ticks, 5);
        assert_eq!(config.load_timeout(), Duration::from_secs(30));
        assert_eq!(config.offset(), Vec3::new(0.0, 0.1, 0.05));
    }

    #[test]
    fn frame_interval_follows_refresh_rate() {
        let config = EngineConfig { refresh_hz: 50, ..Default::default() };
        assert_eq!(config.frame_interval(), Duration::from_millis(20));

        let stalled = EngineConfig { refresh_hz: 0, ..Default::default() };
        assert_eq!(stalled.frame_interval(), Duration::from_secs(1));
    }
}
