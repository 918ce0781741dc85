//! Machine lifecycle monitor.
//!
//! Watches a running machine until it powers off, forwarding guest-property
//! changes to the [`ObserverRegistry`] on the way. Two strategies share the
//! [`MonitorLoop`] contract:
//!
//! - [`EventLoop`]: passive listener on the console's event source.
//! - [`PollingLoop`]: periodic state query plus guest-property snapshot diff.
//!
//! Which one runs is decided once, up front, by [`MonitorMode::select`].

use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::hypervisor::{Console, HypervisorError, MachineView};
use crate::observer::ObserverRegistry;

mod events;
mod polling;

pub use events::{EventLoop, INTERESTING_EVENTS};
pub use polling::{PollingLoop, PropertySnapshot, diff_snapshots, snapshot_from};

/// Upper bound on a single wait for the next event.
pub const EVENT_WAIT: Duration = Duration::from_millis(250);

/// Pause between two polling iterations.
pub const POLL_INTERVAL: Duration = Duration::from_millis(250);

// ---------------------------------------------------------------------------
// Outcome types
// ---------------------------------------------------------------------------

/// How a monitor run ended without error.
#[derive(Debug)]
pub enum MonitorExit {
    /// The machine transitioned to powered-off.
    PoweredOff,
    /// Polling could no longer query the machine state. Treated as "machine
    /// gone", but the underlying failure is kept so callers can tell a clean
    /// shutdown from a lost hypervisor.
    MachineUnreachable(HypervisorError),
    /// The cancellation token fired.
    Cancelled,
}

/// Failure that ended a monitor run.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("failed to acquire the console event source: {0}")]
    EventSource(#[source] HypervisorError),

    #[error("failed to set up the event listener: {0}")]
    Listener(#[source] HypervisorError),

    #[error("failed to receive event: {0}")]
    Receive(#[source] HypervisorError),

    #[error("failed to decode event: {0}")]
    Decode(#[source] HypervisorError),

    #[error("machine state query failed: {0}")]
    StateQuery(#[source] HypervisorError),

    #[error("guest property enumeration failed: {0}")]
    Enumerate(#[source] HypervisorError),

    #[error("failed to acknowledge event: {0}")]
    Acknowledge(#[source] HypervisorError),

    #[error("no running machine to monitor")]
    NotStarted,

    #[error("failed to spawn the monitor thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("monitor thread panicked")]
    Panicked,
}

// ---------------------------------------------------------------------------
// Strategy
// ---------------------------------------------------------------------------

/// Contract shared by both monitor strategies.
pub trait MonitorLoop {
    /// Block until the machine powers off, the token is cancelled, or a
    /// hypervisor call fails.
    fn run<M: MachineView + ?Sized>(
        &self,
        machine: &M,
        console: &dyn Console,
        observers: &ObserverRegistry,
        cancel: &CancellationToken,
    ) -> Result<MonitorExit, MonitorError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorMode {
    Events,
    Polling,
}

impl MonitorMode {
    pub fn select(passive_listener_supported: bool) -> Self {
        if passive_listener_supported {
            Self::Events
        } else {
            Self::Polling
        }
    }
}

#[derive(Debug, Clone)]
pub struct MonitorOptions {
    pub event_wait: Duration,
    pub poll_interval: Duration,
    /// Report a failed state query during polling as an error instead of
    /// [`MonitorExit::MachineUnreachable`].
    pub strict_state_query: bool,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            event_wait: EVENT_WAIT,
            poll_interval: POLL_INTERVAL,
            strict_state_query: false,
        }
    }
}

/// The monitor configured for one process lifetime.
#[derive(Debug, Clone)]
pub struct LifecycleMonitor {
    mode: MonitorMode,
    options: MonitorOptions,
}

impl LifecycleMonitor {
    pub fn new(mode: MonitorMode, options: MonitorOptions) -> Self {
        Self { mode, options }
    }

    pub fn mode(&self) -> MonitorMode {
        self.mode
    }

    pub fn run<M: MachineView + ?Sized>(
        &self,
        machine: &M,
        console: &dyn Console,
        observers: &ObserverRegistry,
        cancel: &CancellationToken,
    ) -> Result<MonitorExit, MonitorError> {
        let result = match self.mode {
            MonitorMode::Events => {
                info!(machine = machine.name(), "Using event subscription loop");
                EventLoop::new(self.options.event_wait).run(machine, console, observers, cancel)
            }
            MonitorMode::Polling => {
                info!(machine = machine.name(), "Using polling loop");
                PollingLoop::new(self.options.poll_interval, self.options.strict_state_query)
                    .run(machine, console, observers, cancel)
            }
        };

        info!(machine = machine.name(), outcome = ?result, "Exited monitor loop");
        result
    }
}
