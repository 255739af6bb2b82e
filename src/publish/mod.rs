pub mod event;
pub mod server;
pub mod variable;

use std::sync::Arc;
use std::time::Instant;

pub use event::{EventEmitter, StateEvent, WITHIN_TOLERANCE_TOPIC};
pub use server::{ServerError, ServerState, VariableServer};
pub use variable::{PolledVariable, Sample, VariableSink};

/// Fans the derived state out to the polled variable and the event channel.
///
/// The variable sees every state; the event is sent only on transitions.
pub struct StateReporter {
    variable: Arc<PolledVariable>,
    events: Arc<EventEmitter>,
    last_event: bool,
}

impl StateReporter {
    /// Starts from the declared `active = false` of the event.
    pub fn new(variable: Arc<PolledVariable>, events: Arc<EventEmitter>) -> Self {
        Self {
            variable,
            events,
            last_event: false,
        }
    }

    /// Returns whether an event was sent.
    pub fn report(&mut self, state: bool, now: Instant) -> bool {
        self.variable.update_at(state, now);
        if state == self.last_event {
            return false;
        }
        self.last_event = state;
        metrics::counter!("analysis_state_changes").increment(1);
        self.events.send(state);
        true
    }

    pub fn last_event(&self) -> bool {
        self.last_event
    }
}
