use glam::{Mat3, Mat4, Quat, Vec3, Vec4Swizzles};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const TRANSFORM_LEN: usize = 16;

/// Below this the 3x3 block is treated as singular.
const DEGENERATE_DETERMINANT: f32 = 1e-6;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("expected {TRANSFORM_LEN} transform elements, got {0}")]
    WrongLength(usize),
    #[error("transform contains non-finite values")]
    NonFinite,
    #[error("transform rotation block is degenerate (determinant {0})")]
    Degenerate(f32),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Pose {
    pub const IDENTITY: Pose = Pose {
        position: Vec3::ZERO,
        rotation: Quat::IDENTITY,
        scale: Vec3::ONE,
    };

    pub fn to_matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.position)
    }
}

/// Splits a row-major homogeneous transform into translation, rotation and
/// scale. A negative determinant is carried by the x scale.
pub fn decompose(values: &[f32]) -> Result<Pose, DecodeError> {
    let values: &[f32; TRANSFORM_LEN] = values.try_into()
        .map_err(|_| DecodeError::WrongLength(values.len()))?;
    if values.iter().any(|v| !v.is_finite()) {
        return Err(DecodeError::NonFinite);
    }

    // glam is column-major, the tracker sends rows.
    let matrix = Mat4::from_cols_array(values).transpose();
    let c0 = matrix.x_axis.xyz();
    let c1 = matrix.y_axis.xyz();
    let c2 = matrix.z_axis.xyz();

    let det = Mat3::from_cols(c0, c1, c2).determinant();
    if !det.is_finite() || det.abs() < DEGENERATE_DETERMINANT {
        return Err(DecodeError::Degenerate(det));
    }

    let mut scale = Vec3::new(c0.length(), c1.length(), c2.length());
    if det < 0.0 {
        scale.x = -scale.x;
    }

    // Gram-Schmidt so that shear or noise still yields a proper rotation.
    let x = c0 / scale.x;
    let y = (c1 - x * x.dot(c1)).normalize();
    let z = x.cross(y);
    let rotation = Quat::from_mat3(&Mat3::from_cols(x, y, z)).normalize();

    Ok(Pose {
        position: matrix.w_axis.xyz(),
        rotation,
        scale,
    })
}

/// Axis sign flips from capture space into render space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AxisCorrection {
    pub flip_x: bool,
    pub flip_y: bool,
    pub flip_z: bool,
}

impl AxisCorrection {
    /// Mirror horizontally, matching a mirrored selfie feed.
    pub const MIRROR: AxisCorrection = AxisCorrection {
        flip_x: true,
        flip_y: false,
        flip_z: false,
    };

    pub fn translation(&self, v: Vec3) -> Vec3 {
        Vec3::new(
            if self.flip_x { -v.x } else { v.x },
            if self.flip_y { -v.y } else { v.y },
            if self.flip_z { -v.z } else { v.z },
        )
    }

    /// Conjugates the rotation by the reflection: each vector component
    /// picks up its own axis sign times the reflection's determinant.
    pub fn rotation(&self, q: Quat) -> Quat {
        let flips = [self.flip_x, self.flip_y, self.flip_z];
        let odd = flips.iter().filter(|f| **f).count() % 2 == 1;
        let sign = |flipped: bool| if flipped != odd { -1.0 } else { 1.0 };
        Quat::from_xyzw(
            q.x * sign(self.flip_x),
            q.y * sign(self.flip_y),
            q.z * sign(self.flip_z),
            q.w,
        )
    }
}

#[derive(Debug, Clone)]
pub struct PoseDecoder {
    correction: AxisCorrection,
    offset: Vec3,
}

impl PoseDecoder {
    pub fn new(correction: AxisCorrection, offset: Vec3) -> Self {
        Self {
            correction,
            offset,
        }
    }

    pub fn decode(&self, values: &[f32]) -> Result<Pose, DecodeError> {
        let raw = decompose(values)?;
        Ok(Pose {
            position: self.correction.translation(raw.position) + self.offset,
            rotation: self.correction.rotation(raw.rotation),
            scale: raw.scale,
        })
    }
}

/// Counts render ticks since the last decoded face. The avatar stays
/// visible, holding its last pose, for `hide_after - 1` missed ticks.
#[derive(Debug, Clone)]
pub struct DetectionTracker {
    hide_after: u32,
    frames_since_detection: u32,
    detected_this_tick: bool,
}

impl DetectionTracker {
    pub fn new(hide_after: u32) -> Self {
        let hide_after = hide_after.max(1);
        Self {
            hide_after,
            // Nothing has been seen yet, start hidden.
            frames_since_detection: hide_after,
            detected_this_tick: false,
        }
    }

    pub fn detected(&mut self) {
        self.detected_this_tick = true;
    }

    pub fn tick(&mut self) -> u32 {
        if std::mem::take(&mut self.detected_this_tick) {
            self.frames_since_detection = 0;
        } else {
            self.frames_since_detection = self.frames_since_detection.saturating_add(1);
        }
        self.frames_since_detection
    }

    pub fn visible(&self) -> bool {
        self.frames_since_detection < self.hide_after
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn row_major(matrix: Mat4) -> Vec<f32> {
        matrix.transpose().to_cols_array().to_vec()
    }

    #[test]
    fn identity_decomposes_to_neutral_pose() {
        let pose = decompose(&row_major(Mat4::IDENTITY)).unwrap();
        assert_eq!(pose.position, Vec3::ZERO);
        assert_eq!(pose.rotation, Quat::IDENTITY);
        assert_eq!(pose.scale, Vec3::ONE);
    }

    #[test]
    fn identity_lands_exactly_on_calibration_offset() {
        let offset = Vec3::new(0.0, 0.1, 0.05);
        let decoder = PoseDecoder::new(AxisCorrection::MIRROR, offset);
        let pose = decoder.decode(&row_major(Mat4::IDENTITY)).unwrap();
        assert_eq!(pose.position, offset);
        assert_eq!(pose.scale, Vec3::ONE);
        assert!(pose.rotation.abs_diff_eq(Quat::IDENTITY, 0.0));
    }

    #[test]
    fn translation_is_read_from_last_column_of_rows() {
        let values = [
            1.0, 0.0, 0.0, 2.0,
            0.0, 1.0, 0.0, 3.0,
            0.0, 0.0, 1.0, -40.0,
            0.0, 0.0, 0.0, 1.0,
        ];
        let pose = decompose(&values).unwrap();
        assert_eq!(pose.position, Vec3::new(2.0, 3.0, -40.0));
    }

    #[test]
    fn wrong_length_is_rejected() {
        assert_eq!(decompose(&[1.0; 15]), Err(DecodeError::WrongLength(15)));
        assert_eq!(decompose(&[]), Err(DecodeError::WrongLength(0)));
    }

    #[test]
    fn degenerate_rotation_is_rejected() {
        let mut values = row_major(Mat4::IDENTITY);
        values[5] = 0.0;
        assert!(matches!(decompose(&values), Err(DecodeError::Degenerate(_))));
        assert!(matches!(decompose(&[0.0; 16]), Err(DecodeError::Degenerate(_))));
    }

    #[test]
    fn non_finite_is_rejected() {
        let mut values = row_major(Mat4::IDENTITY);
        values[3] = f32::NAN;
        assert_eq!(decompose(&values), Err(DecodeError::NonFinite));
    }

    #[test]
    fn mirror_flips_x_translation_and_yaw() {
        let decoder = PoseDecoder::new(AxisCorrection::MIRROR, Vec3::ZERO);
        let yaw = Quat::from_rotation_y(0.5);
        let matrix = Mat4::from_rotation_translation(yaw, Vec3::new(1.0, 2.0, 3.0));
        let pose = decoder.decode(&row_major(matrix)).unwrap();

        assert!(pose.position.abs_diff_eq(Vec3::new(-1.0, 2.0, 3.0), 1e-5));
        assert!(pose.rotation.abs_diff_eq(Quat::from_rotation_y(-0.5), 1e-5));
    }

    #[test]
    fn correction_rotation_matches_reflection() {
        let correction = AxisCorrection { flip_x: true, flip_y: true, flip_z: false };
        let reflect = Mat3::from_diagonal(Vec3::new(-1.0, -1.0, 1.0));
        let q = Quat::from_euler(glam::EulerRot::XYZ, 0.3, -0.7, 1.1);
        let expected = Quat::from_mat3(&(reflect * Mat3::from_quat(q) * reflect));
        let actual = correction.rotation(q);
        assert!(actual.abs_diff_eq(expected, 1e-5) || actual.abs_diff_eq(-expected, 1e-5));
    }

    #[test]
    fn hides_exactly_on_tick_k() {
        let mut tracker = DetectionTracker::new(5);
        assert!(!tracker.visible());

        tracker.detected();
        assert_eq!(tracker.tick(), 0);
        assert!(tracker.visible());

        for tick in 1..5 {
            assert_eq!(tracker.tick(), tick);
            assert!(tracker.visible(), "hidden early on tick {tick}");
        }
        assert_eq!(tracker.tick(), 5);
        assert!(!tracker.visible());

        tracker.detected();
        tracker.tick();
        assert!(tracker.visible());
    }

    proptest! {
        #[test]
        fn decompose_then_recompose_roundtrips(
            tx in -100.0f32..100.0, ty in -100.0f32..100.0, tz in -100.0f32..100.0,
            ax in -1.0f32..1.0, ay in -1.0f32..1.0, az in -1.0f32..1.0,
            angle in -3.1f32..3.1,
            sx in 0.1f32..10.0, sy in 0.1f32..10.0, sz in 0.1f32..10.0,
            mirrored in any::<bool>(),
        ) {
            let axis = Vec3::new(ax, ay, az);
            prop_assume!(axis.length() > 0.1);
            let scale = Vec3::new(if mirrored { -sx } else { sx }, sy, sz);
            let original = Mat4::from_scale_rotation_translation(
                scale,
                Quat::from_axis_angle(axis.normalize(), angle),
                Vec3::new(tx, ty, tz),
            );

            let pose = decompose(&row_major(original)).unwrap();
            let rebuilt = pose.to_matrix();
            prop_assert!(rebuilt.abs_diff_eq(original, 1e-3), "{rebuilt} != {original}");
        }
    }
}
