use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use glam::Vec3;
use thiserror::Error;
use tracing::debug;

use facemask_api::AssetLoadState;
use facemask_gltf::{load_scene, AvatarScene, MeshMorphTargets};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Loading,
    Ready,
    Failed,
}

impl From<LoadState> for AssetLoadState {
    fn from(value: LoadState) -> Self {
        match value {
            LoadState::Loading => AssetLoadState::Loading,
            LoadState::Ready => AssetLoadState::Ready,
            LoadState::Failed => AssetLoadState::Failed,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LoadError {
    #[error("failed to fetch {uri}: {message}")]
    Fetch { uri: String, message: String },
    #[error("failed to parse {uri}: {message}")]
    Parse { uri: String, message: String },
}

/// How the asset anchor sits relative to the decoded face pose.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AssetCalibration {
    pub base_scale: Vec3,
    pub offset: Vec3,
}

impl Default for AssetCalibration {
    fn default() -> Self {
        Self {
            base_scale: Vec3::ONE,
            offset: Vec3::ZERO,
        }
    }
}

/// A fully parsed avatar. Only Ready assets exist as values; the Loading and
/// Failed states live in the registry.
#[derive(Debug)]
pub struct AvatarAsset {
    uri: String,
    scene: Arc<AvatarScene>,
    calibration: AssetCalibration,
    visible: bool,
}

impl AvatarAsset {
    /// Builds the asset, letting calibration carried by the scene override
    /// the configured default.
    pub fn new(uri: impl Into<String>, scene: AvatarScene, default_calibration: AssetCalibration) -> Self {
        let mut calibration = default_calibration;
        if let Some(scene_calibration) = &scene.calibration {
            if let Some(scale) = scene_calibration.base_scale {
                calibration.base_scale = Vec3::splat(scale);
            }
            if let Some(offset) = scene_calibration.offset {
                calibration.offset = Vec3::from_array(offset);
            }
        }
        Self {
            uri: uri.into(),
            scene: Arc::new(scene),
            calibration,
            visible: true,
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn scene(&self) -> &Arc<AvatarScene> {
        &self.scene
    }

    pub fn morph_tables(&self) -> &[MeshMorphTargets] {
        &self.scene.meshes
    }

    pub fn calibration(&self) -> AssetCalibration {
        self.calibration
    }

    /// Whether the asset is shown at all while a face is tracked.
    pub fn visible(&self) -> bool {
        self.visible
    }
}

pub type LoadFuture = Pin<Box<dyn Future<Output = Result<AvatarAsset, LoadError>> + Send>>;

/// Fetches and parses assets off the render tick.
pub trait AssetLoader: Send + Sync {
    fn load(&self, uri: &str) -> LoadFuture;
}

/// Loads from local paths, `file://` URIs and `http(s)://` URLs.
pub struct UriLoader {
    client: reqwest::Client,
    calibration: AssetCalibration,
}

impl UriLoader {
    /// `timeout` bounds a whole http fetch, from connect to the last byte.
    pub fn new(calibration: AssetCalibration, timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            calibration,
        })
    }
}

impl AssetLoader for UriLoader {
    fn load(&self, uri: &str) -> LoadFuture {
        let client = self.client.clone();
        let calibration = self.calibration;
        let uri = uri.to_string();
        Box::pin(async move {
            let (bytes, base_dir) = fetch(&client, &uri).await?;
            debug!("fetched {} ({} bytes)", uri, bytes.len());

            let parse_uri = uri.clone();
            let scene = tokio::task::spawn_blocking(move || load_scene(&bytes, base_dir.as_deref()))
                .await
                .map_err(|err| LoadError::Parse { uri: parse_uri.clone(), message: err.to_string() })?
                .map_err(|err| LoadError::Parse { uri: parse_uri, message: err.to_string() })?;

            Ok(AvatarAsset::new(uri, scene, calibration))
        })
    }
}

async fn fetch(client: &reqwest::Client, uri: &str) -> Result<(Bytes, Option<PathBuf>), LoadError> {
    let fetch_error = |message: String| LoadError::Fetch { uri: uri.to_string(), message };

    if uri.starts_with("http://") || uri.starts_with("https://") {
        let response = client.get(uri)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|err| fetch_error(err.to_string()))?;
        let bytes = response.bytes()
            .await
            .map_err(|err| fetch_error(err.to_string()))?;
        return Ok((bytes, None));
    }

    let path = Path::new(uri.strip_prefix("file://").unwrap_or(uri));
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|err| fetch_error(err.to_string()))?;
    Ok((Bytes::from(bytes), path.parent().map(Path::to_path_buf)))
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;

    use facemask_gltf::{AvatarScene, MeshMorphTargets, SceneNode};
    use glam::{Quat, Vec3};

    use super::*;

    /// An asset with one node per mesh; each mesh lists its target names in
    /// index order.
    pub fn asset(uri: &str, meshes: &[(&str, &[&str])]) -> AvatarAsset {
        let meshes: Vec<MeshMorphTargets> = meshes.iter()
            .map(|(id, names)| MeshMorphTargets {
                id: id.to_string(),
                target_count: names.len(),
                vertex_count: 3,
                target_names: names.iter()
                    .enumerate()
                    .map(|(i, n)| (n.to_string(), i))
                    .collect::<HashMap<_, _>>(),
                default_weights: vec![0.0; names.len()],
            })
            .collect();
        let nodes = (0..meshes.len())
            .map(|i| SceneNode {
                name: format!("Node{i}"),
                parent: None,
                children: Vec::new(),
                translation: Vec3::ZERO,
                rotation: Quat::IDENTITY,
                scale: Vec3::ONE,
                mesh: Some(i),
            })
            .collect();
        let scene = AvatarScene {
            nodes,
            roots: (0..meshes.len()).collect(),
            meshes,
            calibration: None,
        };
        AvatarAsset::new(uri, scene, AssetCalibration::default())
    }

    /// Never finishes; completions are fed to the registry by hand.
    pub struct PendingLoader;

    impl AssetLoader for PendingLoader {
        fn load(&self, _uri: &str) -> LoadFuture {
            Box::pin(std::future::pending())
        }
    }

    /// Finishes immediately with a single `Face` mesh.
    pub struct ReadyLoader;

    impl AssetLoader for ReadyLoader {
        fn load(&self, uri: &str) -> LoadFuture {
            let asset = asset(uri, &[("Face", &["jawOpen", "eyeBlinkLeft"])]);
            Box::pin(async move { Ok(asset) })
        }
    }
}
