use std::borrow::Cow;
use std::collections::HashMap;

use axum::http::StatusCode;
use axum::Json;
use axum::response::{IntoResponse, Response};
use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};

/// Topic on which the control channel publishes the URI of the avatar to show.
pub const MODEL_SELECT_TOPIC: &str = "model/select";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorCategory {
    Cancelled,
    InvalidArgument,
    NotFound,
}

impl ErrorCategory {
    pub fn to_status_code(self) -> StatusCode {
        match self {
            ErrorCategory::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCategory::InvalidArgument => StatusCode::BAD_REQUEST,
            ErrorCategory::NotFound => StatusCode::NOT_FOUND,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    pub category: ErrorCategory,
    pub error_code: Cow<'static, str>,
    pub instance_id: String,
    pub message: Cow<'static, str>,
}

impl ApiError {
    pub fn with_message(
        category: ErrorCategory,
        code: impl Into<Cow<'static, str>>,
        message: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            category,
            error_code: code.into(),
            instance_id: nanoid::nanoid!(),
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<Cow<'static, str>>) -> Self {
        Self::with_message(ErrorCategory::InvalidArgument, "invalidArgument", message)
    }

    pub fn unknown_topic(topic: &str) -> Self {
        Self::with_message(ErrorCategory::NotFound, "unknownTopic", format!("no such topic: {topic}"))
    }

    /// The engine has shut down and is no longer accepting events.
    pub fn unavailable() -> Self {
        Self::with_message(ErrorCategory::Cancelled, "unavailable", "engine unavailable")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status_code = self.category.to_status_code();
        (status_code, Json(self)).into_response()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceLandmark {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility: Option<f32>,
}

impl FaceLandmark {
    pub fn position(&self) -> Vec3 {
        Vec3::new(self.x, self.y, self.z)
    }
}

/// A face transform as sent by the tracker, either as 16 row-major values or
/// as four rows of four.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TransformMatrix {
    Flat(Vec<f32>),
    Rows(Vec<Vec<f32>>),
}

impl TransformMatrix {
    /// Flattens to row-major order. An empty matrix means no face was
    /// detected and yields `None`. Element counts are not validated here.
    pub fn to_row_major(&self) -> Option<Vec<f32>> {
        let flat: Vec<f32> = match self {
            TransformMatrix::Flat(values) => values.clone(),
            TransformMatrix::Rows(rows) => rows.iter().flatten().copied().collect(),
        };
        if flat.is_empty() {
            None
        } else {
            Some(flat)
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Face {
    #[serde(default)]
    pub landmarks: Vec<FaceLandmark>,
    #[serde(default, alias = "blendshapes")]
    pub blend_shapes: HashMap<String, f32>,
    #[serde(default, alias = "transform")]
    pub matrix: Option<TransformMatrix>,
    /// Capture time in milliseconds, as stamped by the tracker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetFacesRequest {
    pub faces: Vec<Face>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectModelRequest {
    pub uri: String,
}

/// A control message as carried over the control websocket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishMessage {
    pub topic: String,
    pub payload: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Channel {
    Pose,
    Control,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AssetLoadState {
    Loading,
    Ready,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetStatus {
    pub uri: String,
    pub state: AssetLoadState,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub channel: Channel,
    pub state: ConnectionState,
    pub connections: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub active: Option<String>,
    pub desired: Option<String>,
    pub visible: bool,
    pub frames_since_detection: u32,
    pub generation: u64,
    /// Capture time of the last decoded pose, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_pose_at: Option<u64>,
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
    pub assets: Vec<AssetStatus>,
    pub connections: Vec<ConnectionStatus>,
}
