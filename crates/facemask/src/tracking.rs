use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use glam::Vec3;

use facemask_api::Face;

/// One frame of tracker output. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct PoseFrame {
    landmarks: Vec<Vec3>,
    blend_shapes: HashMap<String, f32>,
    transform: Option<Vec<f32>>,
    captured_at: SystemTime,
}

impl PoseFrame {
    pub fn new(
        landmarks: Vec<Vec3>,
        blend_shapes: HashMap<String, f32>,
        transform: Option<Vec<f32>>,
        captured_at: SystemTime,
    ) -> Self {
        Self {
            landmarks,
            blend_shapes,
            transform,
            captured_at,
        }
    }

    /// A frame in which the tracker found no face.
    pub fn empty(captured_at: SystemTime) -> Self {
        Self::new(Vec::new(), HashMap::new(), None, captured_at)
    }

    pub fn landmarks(&self) -> &[Vec3] {
        &self.landmarks
    }

    pub fn blend_shapes(&self) -> &HashMap<String, f32> {
        &self.blend_shapes
    }

    /// Row-major 4x4 transform, `None` if no face was detected.
    pub fn transform(&self) -> Option<&[f32]> {
        self.transform.as_deref()
    }

    pub fn captured_at(&self) -> SystemTime {
        self.captured_at
    }
}

impl From<Face> for PoseFrame {
    fn from(face: Face) -> Self {
        let captured_at = face.timestamp
            .map(|ms| UNIX_EPOCH + Duration::from_millis(ms))
            .unwrap_or_else(SystemTime::now);
        PoseFrame::new(
            face.landmarks.iter().map(|l| l.position()).collect(),
            face.blend_shapes,
            face.matrix.and_then(|m| m.to_row_major()),
            captured_at,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlCommand {
    pub uri: String,
    pub received_at: SystemTime,
}

impl ControlCommand {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            received_at: SystemTime::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use facemask_api::{FaceLandmark, TransformMatrix};

    use super::*;

    #[test]
    fn converts_wire_face() {
        let face = Face {
            landmarks: vec![FaceLandmark { x: 0.1, y: 0.2, z: 0.3, presence: None, visibility: None }],
            blend_shapes: HashMap::from([("jawOpen".to_string(), 0.5)]),
            matrix: Some(TransformMatrix::Rows(vec![vec![1.0, 0.0, 0.0, 0.0]; 4])),
            timestamp: Some(1_500),
        };
        let frame = PoseFrame::from(face);

        assert_eq!(frame.landmarks(), &[Vec3::new(0.1, 0.2, 0.3)]);
        assert_eq!(frame.blend_shapes()["jawOpen"], 0.5);
        assert_eq!(frame.transform().map(|t| t.len()), Some(16));
        assert_eq!(frame.captured_at(), UNIX_EPOCH + Duration::from_millis(1_500));
    }

    #[test]
    fn face_without_matrix_has_no_transform() {
        let frame = PoseFrame::from(Face::default());
        assert!(frame.transform().is_none());
        assert!(frame.landmarks().is_empty());
    }
}
