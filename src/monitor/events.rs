//! Event-subscription monitor loop.

use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{MonitorError, MonitorExit, MonitorLoop};
use crate::hypervisor::{
    Console, EventKind, EventSource, GuestProperty, HypervisorError, ListenerId, MachineState,
    MachineView, Result,
};
use crate::observer::ObserverRegistry;

/// Event kinds the listener subscribes to.
pub const INTERESTING_EVENTS: [EventKind; 5] = [
    EventKind::MachineStateChanged,
    EventKind::StateChanged,
    EventKind::MachineEvent,
    EventKind::SessionStateChanged,
    EventKind::GuestPropertyChanged,
];

/// Passive listener on the console's event source.
#[derive(Debug, Clone)]
pub struct EventLoop {
    wait: Duration,
}

impl EventLoop {
    pub fn new(wait: Duration) -> Self {
        Self { wait }
    }

    /// Hook for state-changed events. Termination is decided by the caller
    /// from the freshly queried state.
    fn on_state_changed(&self, machine: &str, state: MachineState) {
        debug!(machine, ?state, "Machine state changed");
    }
}

/// Unregisters the listener when the loop exits, whichever way it exits.
struct Registration<'a> {
    source: &'a dyn EventSource,
    listener: ListenerId,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.source.unregister_listener(self.listener) {
            warn!(listener = self.listener.0, error = %e, "Failed to unregister event listener");
        }
    }
}

fn decode_field(field: &'static str, result: Result<String>) -> String {
    result.unwrap_or_else(|e| {
        debug!(field, error = %e, "Guest property field not decodable");
        String::new()
    })
}

impl MonitorLoop for EventLoop {
    fn run<M: MachineView + ?Sized>(
        &self,
        machine: &M,
        console: &dyn Console,
        observers: &ObserverRegistry,
        cancel: &CancellationToken,
    ) -> std::result::Result<MonitorExit, MonitorError> {
        let source = console.event_source().map_err(MonitorError::EventSource)?;
        let listener = source.create_listener().map_err(MonitorError::Listener)?;
        source
            .register_listener(listener, &INTERESTING_EVENTS, false)
            .map_err(MonitorError::Listener)?;
        let _registration = Registration {
            source: source.as_ref(),
            listener,
        };

        loop {
            if cancel.is_cancelled() {
                info!(machine = machine.name(), "Monitor cancelled");
                return Ok(MonitorExit::Cancelled);
            }

            let Some(event) = source
                .get_event(listener, self.wait)
                .map_err(MonitorError::Receive)?
            else {
                continue;
            };

            let kind = event.kind().map_err(MonitorError::Decode)?;
            let state = machine.state().map_err(MonitorError::StateQuery)?;

            match kind {
                EventKind::StateChanged => self.on_state_changed(machine.name(), state),
                EventKind::GuestPropertyChanged => {
                    let change = event.as_guest_property().ok_or(MonitorError::Decode(
                        HypervisorError::Payload("guest property fields"),
                    ))?;
                    // The event carries no timestamp of its own.
                    let property = GuestProperty::new(
                        decode_field("name", change.name()),
                        decode_field("value", change.value()),
                        Utc::now().timestamp_nanos_opt().unwrap_or_default(),
                        decode_field("flags", change.flags()),
                    );
                    observers.notify(&property);
                }
                _ => {}
            }

            if kind == EventKind::StateChanged && state == MachineState::PoweredOff {
                info!(machine = machine.name(), "Machine powered off");
                return Ok(MonitorExit::PoweredOff);
            }

            source
                .event_processed(listener, event.as_ref())
                .map_err(MonitorError::Acknowledge)?;
        }
    }
}
