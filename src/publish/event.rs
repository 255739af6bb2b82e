use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::info;

pub const WITHIN_TOLERANCE_TOPIC: &str = "CameraApplicationPlatform/ColorChecker/WithinTolerance";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateEvent {
    pub topic: &'static str,
    pub active: bool,
    #[serde(skip)]
    pub emitted_at: SystemTime,
}

/// Stateful event with a single boolean `active` attribute.
///
/// Late subscribers can read the current state through [`active`](Self::active).
pub struct EventEmitter {
    topic: &'static str,
    tx: broadcast::Sender<StateEvent>,
    active: AtomicBool,
}

impl EventEmitter {
    /// Declare the event with `active = false`.
    pub fn declare() -> Self {
        let (tx, _) = broadcast::channel(64);
        info!("Declared stateful event {}", WITHIN_TOLERANCE_TOPIC);
        Self {
            topic: WITHIN_TOLERANCE_TOPIC,
            tx,
            active: AtomicBool::new(false),
        }
    }

    pub fn topic(&self) -> &'static str {
        self.topic
    }

    pub fn active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.tx.subscribe()
    }

    pub fn send(&self, active: bool) {
        self.active.store(active, Ordering::Release);
        info!("Sending event {}: active = {}", self.topic, active);
        // No subscribers is fine
        let _ = self.tx.send(StateEvent {
            topic: self.topic,
            active,
            emitted_at: SystemTime::now(),
        });
    }
}
