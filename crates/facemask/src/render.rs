use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::asset::AvatarAsset;
use crate::engine::Engine;
use crate::events::EventSource;
use crate::state::{RenderState, StateCell};

#[derive(Error, Debug)]
pub enum SurfaceError {
    #[error("render surface has been lost")]
    Lost,
    #[error("draw failed: {0}")]
    Draw(String),
}

/// The drawing backend. Only ever used from the render tick.
pub trait RenderSurface {
    /// Places the asset and sets its morph influences.
    fn apply(&mut self, asset: &AvatarAsset, state: &RenderState);
    fn hide(&mut self);
    fn draw(&mut self) -> Result<(), SurfaceError>;
    fn release(&mut self);
}

/// Owns the surface and releases it exactly once, on stop or on drop.
pub struct RenderContext<S: RenderSurface> {
    surface: S,
    released: bool,
}

impl<S: RenderSurface> RenderContext<S> {
    pub fn new(surface: S) -> Self {
        Self {
            surface,
            released: false,
        }
    }

    pub fn surface_mut(&mut self) -> &mut S {
        &mut self.surface
    }

    pub fn release(&mut self) {
        if !std::mem::replace(&mut self.released, true) {
            debug!("releasing render surface");
            self.surface.release();
        }
    }
}

impl<S: RenderSurface> Drop for RenderContext<S> {
    fn drop(&mut self) {
        self.release();
    }
}

#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

pub struct RenderLoop<S: RenderSurface> {
    context: RenderContext<S>,
    engine: Engine,
    events: EventSource,
    cell: Arc<StateCell>,
    frame_interval: Duration,
}

impl<S: RenderSurface> RenderLoop<S> {
    pub fn new(
        surface: S,
        engine: Engine,
        events: EventSource,
        cell: Arc<StateCell>,
        frame_interval: Duration,
    ) -> Self {
        Self {
            context: RenderContext::new(surface),
            engine,
            events,
            cell,
            frame_interval,
        }
    }

    /// One frame: apply queued events, commit, then draw whatever is
    /// committed. Draws even when nothing new arrived.
    pub fn tick(&mut self) {
        for event in self.events.drain() {
            self.engine.handle(event);
        }
        self.engine.tick();

        let state = self.cell.load();
        let surface = self.context.surface_mut();
        match state.asset.as_deref() {
            Some(asset) if state.visible => surface.apply(asset, &state),
            _ => surface.hide(),
        }
        if let Err(err) = surface.draw() {
            warn!("{}", err);
        }
    }

    /// Ticks at the frame interval until `stop` is set, then releases the
    /// surface.
    pub async fn run(mut self, stop: StopSignal) {
        let mut interval = tokio::time::interval(self.frame_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("render loop running every {:?}", self.frame_interval);

        loop {
            interval.tick().await;
            if stop.is_stopped() {
                break;
            }
            self.tick();
        }

        info!("render loop stopped");
        self.context.release();
    }
}
