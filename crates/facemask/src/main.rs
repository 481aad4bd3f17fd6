use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use crate::asset::UriLoader;
use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::headless::HeadlessSurface;
use crate::registry::ModelRegistry;
use crate::render::{RenderLoop, StopSignal};
use crate::state::StateCell;

mod api;
mod asset;
mod config;
mod engine;
mod events;
mod expression;
mod headless;
mod pose;
mod registry;
mod render;
mod state;
mod tracking;

#[derive(Parser)]
struct Options {
    #[arg(long, default_value = "127.0.0.1:8888")]
    pub api_bind: String,
    /// JSON engine configuration; flags below override it.
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Asset shown at startup.
    #[arg(long, short = 'm')]
    pub model: Option<String>,
    #[arg(long)]
    pub refresh_hz: Option<u32>,
    #[arg(long)]
    pub cache_capacity: Option<usize>,
    /// Ticks without a face before the avatar is hidden.
    #[arg(long)]
    pub hide_after: Option<u32>,
    /// Anchor offset as `x,y,z`.
    #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
    pub offset: Option<Vec<f32>>,
    #[arg(long)]
    pub base_scale: Option<f32>,
    /// Don't mirror the pose horizontally.
    #[arg(long)]
    pub no_mirror: bool,
}

impl Options {
    fn engine_config(&self) -> anyhow::Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::from_file(path)?,
            None => EngineConfig::default(),
        };
        if let Some(model) = &self.model {
            config.default_model = Some(model.clone());
        }
        if let Some(refresh_hz) = self.refresh_hz {
            config.refresh_hz = refresh_hz;
        }
        if let Some(cache_capacity) = self.cache_capacity {
            config.cache_capacity = cache_capacity;
        }
        if let Some(hide_after) = self.hide_after {
            config.hide_after_ticks = hide_after;
        }
        if let Some(offset) = &self.offset {
            config.calibration_offset = offset.as_slice()
                .try_into()
                .context("offset takes exactly three values")?;
        }
        if let Some(base_scale) = self.base_scale {
            config.base_scale = base_scale;
        }
        if self.no_mirror {
            config.axis_correction.flip_x = false;
        }
        Ok(config)
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().init();
    let options = Options::parse();
    let config = options.engine_config()?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let api_addr: SocketAddr = options.api_bind.parse()
        .with_context(|| format!("invalid API address {}", options.api_bind))?;
    let (events, source) = events::channel();
    let cell = Arc::new(StateCell::new());

    let api_state = api::ApiState::new(events.clone(), cell.clone());
    runtime.spawn(async move {
        if let Err(err) = api::serve(api_addr, api_state).await {
            error!("failed to serve API: {}", err);
        }
    });

    let stop = StopSignal::default();
    let ctrl_c_stop = stop.clone();
    runtime.spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("stopping");
        }
        ctrl_c_stop.stop();
    });

    if let Some(model) = &config.default_model {
        events.select(model.clone())?;
    }

    let loader = Arc::new(UriLoader::new(config.asset_calibration(), config.load_timeout())?);
    runtime.block_on(async move {
        let registry = ModelRegistry::new(loader, events, config.cache_capacity);
        let engine = Engine::new(&config, registry, cell.clone());
        let surface = HeadlessSurface::new();
        let probe = surface.clone();
        let render = RenderLoop::new(surface, engine, source, cell, config.frame_interval());
        render.run(stop).await;
        info!("{}", probe.probe());
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_defaults() {
        let options = Options::parse_from([
            "facemask", "--offset", "-0.1,0.2,0", "--no-mirror", "--hide-after", "8",
        ]);
        let config = options.engine_config().unwrap();

        assert_eq!(config.calibration_offset, [-0.1, 0.2, 0.0]);
        assert!(!config.axis_correction.flip_x);
        assert_eq!(config.hide_after_ticks, 8);
        assert_eq!(config.refresh_hz, 60);
        assert_eq!(config.default_model.as_deref(), Some(config::DEFAULT_MODEL));
    }
}
