//! Polling monitor loop and the guest-property diff it is built on.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{MonitorError, MonitorExit, MonitorLoop};
use crate::hypervisor::{Console, GuestProperty, MachineState, MachineView};
use crate::observer::ObserverRegistry;

/// Guest properties keyed by name.
pub type PropertySnapshot = BTreeMap<String, GuestProperty>;

/// Index `properties` by name; a repeated name keeps the last entry.
pub fn snapshot_from(properties: Vec<GuestProperty>) -> PropertySnapshot {
    properties
        .into_iter()
        .map(|property| (property.name.clone(), property))
        .collect()
}

/// Notifications implied by moving from `previous` to `current`.
///
/// New keys and keys whose value changed yield the current property as is.
/// Keys missing from `current` yield [`GuestProperty::deleted`]. Only values
/// are compared; a timestamp or flags change alone is not reported.
pub fn diff_snapshots(previous: &PropertySnapshot, current: &PropertySnapshot) -> Vec<GuestProperty> {
    let changed = current
        .iter()
        .filter(|(name, property)| {
            previous
                .get(*name)
                .is_none_or(|before| before.value != property.value)
        })
        .map(|(_, property)| property.clone());

    let removed = previous
        .keys()
        .filter(|name| !current.contains_key(*name))
        .map(|name| GuestProperty::deleted(name.clone()));

    changed.chain(removed).collect()
}

/// Periodic state query plus guest-property snapshot diff.
#[derive(Debug, Clone)]
pub struct PollingLoop {
    interval: Duration,
    strict: bool,
}

impl PollingLoop {
    pub fn new(interval: Duration, strict: bool) -> Self {
        Self { interval, strict }
    }

    fn take_snapshot<M: MachineView + ?Sized>(
        machine: &M,
    ) -> Result<PropertySnapshot, MonitorError> {
        machine
            .enumerate_guest_properties("")
            .map(snapshot_from)
            .map_err(MonitorError::Enumerate)
    }
}

impl MonitorLoop for PollingLoop {
    fn run<M: MachineView + ?Sized>(
        &self,
        machine: &M,
        _console: &dyn Console,
        observers: &ObserverRegistry,
        cancel: &CancellationToken,
    ) -> Result<MonitorExit, MonitorError> {
        let mut previous_properties = Self::take_snapshot(machine)?;
        let mut previous_state = machine.state().map_err(MonitorError::StateQuery)?;

        loop {
            if cancel.is_cancelled() {
                info!(machine = machine.name(), "Monitor cancelled");
                return Ok(MonitorExit::Cancelled);
            }

            let state = match machine.state() {
                Ok(state) => state,
                Err(e) if self.strict => return Err(MonitorError::StateQuery(e)),
                Err(e) => {
                    warn!(machine = machine.name(), error = %e, "State query failed, assuming machine is gone");
                    return Ok(MonitorExit::MachineUnreachable(e));
                }
            };
            if state == MachineState::PoweredOff && state != previous_state {
                info!(machine = machine.name(), "Machine powered off");
                return Ok(MonitorExit::PoweredOff);
            }
            previous_state = state;

            let properties = Self::take_snapshot(machine)?;
            for change in diff_snapshots(&previous_properties, &properties) {
                observers.notify(&change);
            }
            previous_properties = properties;

            std::thread::sleep(self.interval);
        }
    }
}
