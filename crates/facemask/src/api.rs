use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::{Json, Router};
use axum::extract::{Path, State};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::{get, post, put};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tracing::{debug, info};

use facemask_api::{
    ApiError, Channel, ConnectionState, ConnectionStatus, Face, MODEL_SELECT_TOPIC, PublishMessage,
    SelectModelRequest, SetFacesRequest, StatusResponse,
};

use crate::events::EventSender;
use crate::state::StateCell;
use crate::tracking::PoseFrame;

/// Shared by every handler. Handlers only enqueue events; they never touch
/// the engine directly.
pub struct ApiState {
    events: EventSender,
    cell: Arc<StateCell>,
    connections: Mutex<HashMap<Channel, usize>>,
}

impl ApiState {
    pub fn new(events: EventSender, cell: Arc<StateCell>) -> Arc<Self> {
        Arc::new(Self {
            events,
            cell,
            connections: Mutex::new(HashMap::new()),
        })
    }

    /// Counts a transport connection on `channel` until the guard drops. The
    /// engine hears about the first connection and the last disconnection.
    fn connect(self: &Arc<Self>, channel: Channel) -> ConnectionGuard {
        let first = {
            let mut connections = self.connections.lock();
            let count = connections.entry(channel).or_default();
            *count += 1;
            *count == 1
        };
        if first {
            self.notify(channel, ConnectionState::Connected);
        }
        ConnectionGuard {
            state: self.clone(),
            channel,
        }
    }

    fn disconnect(&self, channel: Channel) {
        let last = {
            let mut connections = self.connections.lock();
            let count = connections.entry(channel).or_default();
            *count = count.saturating_sub(1);
            *count == 0
        };
        if last {
            self.notify(channel, ConnectionState::Disconnected);
        }
    }

    fn notify(&self, channel: Channel, state: ConnectionState) {
        if let Err(err) = self.events.connection(channel, state) {
            debug!("dropping {:?} {:?}: {}", channel, state, err);
        }
    }

    fn connection_statuses(&self) -> Vec<ConnectionStatus> {
        let connections = self.connections.lock();
        [Channel::Pose, Channel::Control].into_iter()
            .map(|channel| {
                let count = connections.get(&channel).copied().unwrap_or(0);
                ConnectionStatus {
                    channel,
                    state: if count > 0 { ConnectionState::Connected } else { ConnectionState::Disconnected },
                    connections: count,
                }
            })
            .collect()
    }
}

struct ConnectionGuard {
    state: Arc<ApiState>,
    channel: Channel,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.state.disconnect(self.channel);
    }
}

fn handle_publish(state: &ApiState, topic: &str, payload: &str) -> Result<(), ApiError> {
    match topic {
        MODEL_SELECT_TOPIC => {
            let uri = payload.trim();
            if uri.is_empty() {
                return Err(ApiError::invalid_argument("empty model uri"));
            }
            state.events.select(uri).map_err(|_| ApiError::unavailable())
        }
        _ => Err(ApiError::unknown_topic(topic)),
    }
}

async fn put_faces(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<SetFacesRequest>,
) -> Result<StatusCode, ApiError> {
    let frame = request.faces.into_iter()
        .next()
        .map(PoseFrame::from)
        .unwrap_or_else(|| PoseFrame::empty(SystemTime::now()));
    state.events.pose(frame).map_err(|_| ApiError::unavailable())?;
    Ok(StatusCode::OK)
}

async fn put_model(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<SelectModelRequest>,
) -> Result<StatusCode, ApiError> {
    handle_publish(&state, MODEL_SELECT_TOPIC, &request.uri)?;
    Ok(StatusCode::ACCEPTED)
}

async fn post_publish(
    State(state): State<Arc<ApiState>>,
    Path(topic): Path<String>,
    payload: String,
) -> Result<StatusCode, ApiError> {
    handle_publish(&state, &topic, &payload)?;
    Ok(StatusCode::ACCEPTED)
}

async fn get_status(State(state): State<Arc<ApiState>>) -> Json<StatusResponse> {
    let render = state.cell.load();
    let registry = state.cell.registry();
    Json(StatusResponse {
        active: render.active_uri().map(str::to_string),
        desired: registry.desired.clone(),
        visible: render.visible,
        frames_since_detection: render.frames_since_detection,
        generation: render.generation,
        last_pose_at: render.pose_captured_at
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64),
        position: render.position,
        rotation: render.rotation,
        scale: render.scale,
        assets: registry.asset_statuses(),
        connections: state.connection_statuses(),
    })
}

async fn pose_socket(ws: WebSocketUpgrade, State(state): State<Arc<ApiState>>) -> Response {
    ws.on_upgrade(move |socket| run_pose_socket(socket, state))
}

async fn run_pose_socket(mut socket: WebSocket, state: Arc<ApiState>) {
    let _guard = state.connect(Channel::Pose);
    while let Some(message) = socket.recv().await {
        let face: Face = match message {
            Ok(Message::Text(text)) => match serde_json::from_str(&text) {
                Ok(face) => face,
                Err(err) => {
                    debug!("ignoring pose message: {}", err);
                    continue;
                }
            },
            Ok(Message::Binary(data)) => match serde_json::from_slice(&data) {
                Ok(face) => face,
                Err(err) => {
                    debug!("ignoring pose message: {}", err);
                    continue;
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                debug!("pose socket error: {}", err);
                break;
            }
        };
        if state.events.pose(face.into()).is_err() {
            break;
        }
    }
}

async fn control_socket(ws: WebSocketUpgrade, State(state): State<Arc<ApiState>>) -> Response {
    ws.on_upgrade(move |socket| run_control_socket(socket, state))
}

async fn run_control_socket(mut socket: WebSocket, state: Arc<ApiState>) {
    let _guard = state.connect(Channel::Control);
    while let Some(message) = socket.recv().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                debug!("control socket error: {}", err);
                break;
            }
        };

        let result = serde_json::from_str::<PublishMessage>(&text)
            .map_err(|err| ApiError::invalid_argument(err.to_string()))
            .and_then(|message| handle_publish(&state, &message.topic, &message.payload));
        if let Err(err) = result {
            let Ok(reply) = serde_json::to_string(&err) else {
                continue;
            };
            if socket.send(Message::Text(reply)).await.is_err() {
                break;
            }
        }
    }
}

pub fn new_api() -> Router<Arc<ApiState>> {
    Router::new()
        .route("/v1/faces", put(put_faces))
        .route("/v1/pose", get(pose_socket))
        .route("/v1/control", get(control_socket))
        .route("/v1/model", put(put_model))
        .route("/v1/publish/*topic", post(post_publish))
        .route("/v1/status", get(get_status))
}

pub async fn serve(addr: SocketAddr, state: Arc<ApiState>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("API listening on {}", listener.local_addr()?);
    axum::serve(listener, new_api().with_state(state)).await?;
    Ok(())
}
