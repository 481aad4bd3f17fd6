use thiserror::Error;
use tokio::sync::mpsc;

use facemask_api::{Channel, ConnectionState};

use crate::registry::LoadOutcome;
use crate::tracking::{ControlCommand, PoseFrame};

/// Everything the render tick consumes. Producers only ever enqueue these;
/// the renderer state is mutated solely on the tick that drains them.
#[derive(Debug)]
pub enum InboundEvent {
    PoseUpdate(PoseFrame),
    AssetSelect(ControlCommand),
    ConnectionStateChange(Channel, ConnectionState),
    AssetLoaded(LoadOutcome),
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("event queue is closed")]
pub struct ChannelError;

#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<InboundEvent>,
}

impl EventSender {
    pub fn send(&self, event: InboundEvent) -> Result<(), ChannelError> {
        self.tx.send(event).map_err(|_| ChannelError)
    }

    pub fn pose(&self, frame: PoseFrame) -> Result<(), ChannelError> {
        self.send(InboundEvent::PoseUpdate(frame))
    }

    pub fn select(&self, uri: impl Into<String>) -> Result<(), ChannelError> {
        self.send(InboundEvent::AssetSelect(ControlCommand::new(uri)))
    }

    pub fn connection(&self, channel: Channel, state: ConnectionState) -> Result<(), ChannelError> {
        self.send(InboundEvent::ConnectionStateChange(channel, state))
    }

    pub fn asset_loaded(&self, outcome: LoadOutcome) -> Result<(), ChannelError> {
        self.send(InboundEvent::AssetLoaded(outcome))
    }
}

pub struct EventSource {
    rx: mpsc::UnboundedReceiver<InboundEvent>,
}

impl EventSource {
    /// Takes everything queued so far without waiting. Only the newest pose
    /// survives, at the position it arrived in; other events keep their
    /// order.
    pub fn drain(&mut self) -> Vec<InboundEvent> {
        let mut events = Vec::new();
        let mut last_pose = None;
        while let Ok(event) = self.rx.try_recv() {
            if let InboundEvent::PoseUpdate(_) = event {
                if let Some(previous) = last_pose.replace(events.len()) {
                    events.remove(previous);
                    last_pose = Some(events.len());
                }
            }
            events.push(event);
        }
        events
    }
}

pub fn channel() -> (EventSender, EventSource) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx }, EventSource { rx })
}
