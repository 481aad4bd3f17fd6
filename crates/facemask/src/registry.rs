use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use facemask_api::AssetStatus;

use crate::asset::{AssetLoader, AvatarAsset, LoadError, LoadState};
use crate::events::EventSender;

/// The result of one background load, delivered back through the event
/// queue.
#[derive(Debug)]
pub struct LoadOutcome {
    pub uri: String,
    pub generation: u64,
    pub result: Result<Arc<AvatarAsset>, LoadError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadHandle {
    pub uri: String,
    pub generation: u64,
}

#[derive(Debug)]
pub enum Completion {
    /// The load finished for the asset that is wanted on screen.
    Activated(Arc<AvatarAsset>),
    /// The load finished but something else is wanted; kept for later.
    Cached,
    /// The load was cancelled or superseded and its result thrown away.
    Discarded,
    Failed(LoadError),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistryReport {
    pub active: Option<String>,
    pub desired: Option<String>,
    pub assets: Vec<(String, LoadState)>,
}

impl RegistryReport {
    pub fn asset_statuses(&self) -> Vec<AssetStatus> {
        self.assets.iter()
            .map(|(uri, state)| AssetStatus {
                uri: uri.clone(),
                state: (*state).into(),
                active: self.active.as_deref() == Some(uri.as_str()),
            })
            .collect()
    }
}

struct AssetEntry {
    state: LoadState,
    generation: u64,
    asset: Option<Arc<AvatarAsset>>,
    // Clock value when last shown or hidden, 0 if never shown.
    last_activated: u64,
    task: Option<JoinHandle<()>>,
}

/// Tracks every asset the engine has asked for and which one is shown.
///
/// At most one asset is active. Switching to an asset that is still loading
/// leaves the previous one on screen until the load completes, and a failed
/// load never replaces it.
pub struct ModelRegistry {
    loader: Arc<dyn AssetLoader>,
    events: EventSender,
    entries: HashMap<String, AssetEntry>,
    active: Option<Arc<AvatarAsset>>,
    desired: Option<String>,
    capacity: usize,
    next_generation: u64,
    clock: u64,
}

impl ModelRegistry {
    pub fn new(loader: Arc<dyn AssetLoader>, events: EventSender, capacity: usize) -> Self {
        Self {
            loader,
            events,
            entries: HashMap::new(),
            active: None,
            desired: None,
            capacity: capacity.max(1),
            next_generation: 0,
            clock: 0,
        }
    }

    pub fn active(&self) -> Option<&Arc<AvatarAsset>> {
        self.active.as_ref()
    }

    #[cfg(test)]
    pub fn desired(&self) -> Option<&str> {
        self.desired.as_deref()
    }

    #[cfg(test)]
    pub fn state(&self, uri: &str) -> Option<LoadState> {
        self.entries.get(uri).map(|e| e.state)
    }

    /// Starts loading `uri` in the background unless it is already loading
    /// or loaded. Failed assets are retried.
    pub fn request_load(&mut self, uri: &str) -> LoadHandle {
        if let Some(entry) = self.entries.get(uri) {
            if entry.state != LoadState::Failed {
                return LoadHandle {
                    uri: uri.to_string(),
                    generation: entry.generation,
                };
            }
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        debug!("loading {} (generation {})", uri, generation);

        let load = self.loader.load(uri);
        let events = self.events.clone();
        let task_uri = uri.to_string();
        let task = tokio::spawn(async move {
            let result = load.await.map(Arc::new);
            // The queue only closes on shutdown.
            let _ = events.asset_loaded(LoadOutcome {
                uri: task_uri,
                generation,
                result,
            });
        });

        self.entries.insert(uri.to_string(), AssetEntry {
            state: LoadState::Loading,
            generation,
            asset: None,
            last_activated: 0,
            task: Some(task),
        });
        LoadHandle {
            uri: uri.to_string(),
            generation,
        }
    }

    /// Marks `uri` as the asset to show. Returns it if it can be shown right
    /// away. Loads of any other asset still in flight are cancelled.
    pub fn set_active(&mut self, uri: &str) -> Option<Arc<AvatarAsset>> {
        self.entries.retain(|key, entry| {
            if key == uri || entry.state != LoadState::Loading {
                return true;
            }
            debug!("cancelling load of {}", key);
            if let Some(task) = entry.task.take() {
                task.abort();
            }
            false
        });

        let ready = self.entries.get(uri)
            .filter(|e| e.state == LoadState::Ready)
            .and_then(|e| e.asset.clone());
        match ready {
            Some(asset) => {
                self.activate(asset.clone());
                Some(asset)
            }
            None => {
                self.desired = Some(uri.to_string());
                None
            }
        }
    }

    /// Applies a finished load. Results for entries that were cancelled or
    /// superseded by a newer request are discarded.
    pub fn complete(&mut self, outcome: LoadOutcome) -> Completion {
        let Some(entry) = self.entries.get_mut(&outcome.uri) else {
            return Completion::Discarded;
        };
        if entry.generation != outcome.generation || entry.state != LoadState::Loading {
            return Completion::Discarded;
        }

        entry.task = None;

        let completion = match outcome.result {
            Err(err) => {
                entry.state = LoadState::Failed;
                if self.desired.as_deref() == Some(outcome.uri.as_str()) {
                    self.desired = None;
                }
                Completion::Failed(err)
            }
            Ok(asset) => {
                entry.state = LoadState::Ready;
                entry.asset = Some(asset.clone());
                if self.desired.as_deref() == Some(outcome.uri.as_str()) {
                    self.activate(asset.clone());
                    Completion::Activated(asset)
                } else {
                    Completion::Cached
                }
            }
        };

        self.evict();
        completion
    }

    pub fn report(&self) -> RegistryReport {
        let mut assets: Vec<_> = self.entries.iter()
            .map(|(uri, entry)| (uri.clone(), entry.state))
            .collect();
        assets.sort_by(|a, b| a.0.cmp(&b.0));
        RegistryReport {
            active: self.active.as_ref().map(|a| a.uri().to_string()),
            desired: self.desired.clone(),
            assets,
        }
    }

    fn activate(&mut self, asset: Arc<AvatarAsset>) {
        self.clock += 1;
        if let Some(previous) = self.active.take() {
            if let Some(entry) = self.entries.get_mut(previous.uri()) {
                entry.last_activated = self.clock;
            }
        }
        if let Some(entry) = self.entries.get_mut(asset.uri()) {
            entry.last_activated = self.clock;
        }
        info!("showing {}", asset.uri());
        self.desired = None;
        self.active = Some(asset);
    }

    /// Keeps at most `capacity` Ready assets, dropping the least recently
    /// activated first, and as many Failed records, oldest first. The active
    /// and desired assets are never dropped.
    fn evict(&mut self) {
        self.evict_over_capacity(LoadState::Ready);
        self.evict_over_capacity(LoadState::Failed);
    }

    fn evict_over_capacity(&mut self, state: LoadState) {
        loop {
            let count = self.entries.values()
                .filter(|e| e.state == state)
                .count();
            if count <= self.capacity {
                return;
            }

            let active = self.active.as_ref().map(|a| a.uri());
            let victim = self.entries.iter()
                .filter(|(uri, e)| {
                    e.state == state
                        && Some(uri.as_str()) != active
                        && Some(uri.as_str()) != self.desired.as_deref()
                })
                .min_by_key(|(_, e)| (e.last_activated, e.generation))
                .map(|(uri, _)| uri.clone());
            let Some(victim) = victim else {
                return;
            };
            debug!("evicting {}", victim);
            self.entries.remove(&victim);
        }
    }
}

impl Drop for ModelRegistry {
    fn drop(&mut self) {
        for entry in self.entries.values_mut() {
            if let Some(task) = entry.task.take() {
                task.abort();
            }
        }
    }
}
