use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::trace;

/// Last written value with its source timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    pub value: bool,
    /// Milliseconds since the Unix epoch.
    pub source_timestamp_ms: u64,
    pub writes: u64,
}

/// Receives every write of a [`PolledVariable`], e.g. a server-side node.
pub trait VariableSink: Send + Sync {
    fn write(&self, sample: &Sample);
}

struct Slot {
    sample: Sample,
    written_at: Instant,
    sink: Option<Arc<dyn VariableSink>>,
}

/// A read-only boolean exposed to polling clients.
///
/// Writes are rate limited: a value is only written when it differs from the
/// last one or when the refresh interval has passed, so an unchanged value
/// still gets a fresh timestamp at a bounded rate.
pub struct PolledVariable {
    slot: Mutex<Slot>,
    refresh_interval: Duration,
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

impl PolledVariable {
    pub fn new(initial: bool, refresh_interval: Duration) -> Self {
        Self {
            slot: Mutex::new(Slot {
                sample: Sample {
                    value: initial,
                    source_timestamp_ms: epoch_millis(),
                    writes: 1,
                },
                written_at: Instant::now(),
                sink: None,
            }),
            refresh_interval,
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    /// Route writes to `sink`, starting with the current sample.
    pub fn attach(&self, sink: Arc<dyn VariableSink>) {
        let mut slot = self.lock();
        sink.write(&slot.sample);
        slot.sink = Some(sink);
    }

    pub fn detach(&self) {
        self.lock().sink = None;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn update(&self, value: bool) -> bool {
        self.update_at(value, Instant::now())
    }

    /// Returns whether a write happened.
    pub fn update_at(&self, value: bool, now: Instant) -> bool {
        let mut slot = self.lock();
        let stale = now.saturating_duration_since(slot.written_at) > self.refresh_interval;
        if value == slot.sample.value && !stale {
            return false;
        }
        slot.sample = Sample {
            value,
            source_timestamp_ms: epoch_millis(),
            writes: slot.sample.writes + 1,
        };
        slot.written_at = now;
        if let Some(sink) = &slot.sink {
            sink.write(&slot.sample);
        }
        metrics::counter!("opcua_writes").increment(1);
        trace!("Wrote {} to polled variable", value);
        true
    }

    pub fn read(&self) -> bool {
        self.snapshot().value
    }

    pub fn snapshot(&self) -> Sample {
        self.lock().sample
    }
}
