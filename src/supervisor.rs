//! Single-machine supervisor.
//!
//! Owns every hypervisor handle for one machine and drives it through
//! provision → start → run → stop → release. One machine per process.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::LaunchConfig;
use crate::disk::{DiskImageBuilder, RawVmdkBuilder};
use crate::host::HostBackend;
use crate::hypervisor::{self, CleanupMode, Console, Hypervisor, LaunchFrontend, Machine};
use crate::monitor::{LifecycleMonitor, MonitorError, MonitorExit, MonitorMode, MonitorOptions};
use crate::observer::{Observer, ObserverRegistry};
use crate::provision::{ProvisionedMachine, Provisioner};

/// Name of the thread the lifecycle monitor runs on.
pub const MONITOR_THREAD: &str = "vm-monitor";

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub monitor: MonitorOptions,
    pub frontend: LaunchFrontend,
    /// Upper bound on waiting for the launch to complete.
    pub launch_timeout: Duration,
    /// Pause between unlocking the session and tearing the machine down.
    pub unlock_grace: Duration,
    /// Upper bound on waiting for a forced power-off during teardown.
    pub power_off_timeout: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            monitor: MonitorOptions::default(),
            frontend: LaunchFrontend::Gui,
            launch_timeout: Duration::from_secs(50),
            unlock_grace: Duration::from_secs(1),
            power_off_timeout: Duration::from_secs(30),
        }
    }
}

pub struct Supervisor {
    hypervisor: Arc<dyn Hypervisor>,
    host: Arc<dyn HostBackend>,
    disk_builder: Box<dyn DiskImageBuilder>,
    monitor: LifecycleMonitor,
    options: SupervisorOptions,
    observers: ObserverRegistry,
    cancel: CancellationToken,
    provisioned: Option<ProvisionedMachine>,
    launched: bool,
    console: Option<Box<dyn Console>>,
}

impl Supervisor {
    /// The monitor mode is fixed here, from the host and hypervisor
    /// capabilities, for the lifetime of the supervisor.
    pub fn new(
        hypervisor: Arc<dyn Hypervisor>,
        host: Arc<dyn HostBackend>,
        options: SupervisorOptions,
    ) -> Self {
        let mode = MonitorMode::select(
            host.supports_passive_listener() && hypervisor.supports_event_subscription(),
        );
        debug!(?mode, "Monitor mode selected");

        Self {
            hypervisor,
            host,
            disk_builder: Box::new(RawVmdkBuilder),
            monitor: LifecycleMonitor::new(mode, options.monitor.clone()),
            options,
            observers: ObserverRegistry::new(),
            cancel: CancellationToken::new(),
            provisioned: None,
            launched: false,
            console: None,
        }
    }

    /// Replace the builder used for raw disk descriptors.
    pub fn with_disk_builder(mut self, disk_builder: Box<dyn DiskImageBuilder>) -> Self {
        self.disk_builder = disk_builder;
        self
    }

    pub fn mode(&self) -> MonitorMode {
        self.monitor.mode()
    }

    pub fn register_observer(&self, observer: Arc<dyn Observer>) {
        self.observers.register(observer);
    }

    /// Whether a machine went through every provisioning step.
    pub fn is_provisioned(&self) -> bool {
        self.provisioned.as_ref().is_some_and(|p| p.complete)
    }

    /// Whether `release` has anything to tear down.
    pub fn holds_machine(&self) -> bool {
        self.provisioned.is_some()
    }

    /// Create the machine. On failure whatever was already created is kept
    /// for `release`.
    pub fn provision(&mut self, config: &LaunchConfig) -> Result<()> {
        if self.provisioned.is_some() {
            bail!("a machine is already provisioned; release it first");
        }
        Provisioner::create(
            self.hypervisor.as_ref(),
            self.host.as_ref(),
            self.disk_builder.as_ref(),
            config,
            &mut self.provisioned,
        )
        .context("Failed to provision machine")
    }

    /// Launch the provisioned machine and keep its console for monitoring.
    pub fn start(&mut self) -> Result<()> {
        let provisioned = self
            .provisioned
            .as_ref()
            .filter(|p| p.complete)
            .context("no machine has been provisioned")?;
        let session = provisioned
            .session
            .as_deref()
            .context("provisioned machine has no session")?;

        let progress = provisioned
            .machine
            .launch(session, self.options.frontend)
            .context("Failed to launch machine")?;
        self.launched = true;
        progress
            .wait_for_completion(Some(self.options.launch_timeout))
            .context("Machine launch did not complete")?;

        let console = session
            .console()
            .context("Failed to get machine console")?;
        self.console = Some(console);

        info!(machine = provisioned.machine.name(), "Machine started");
        Ok(())
    }

    /// Block until the monitor loop exits. The console is dropped afterwards.
    pub fn run(&mut self) -> std::result::Result<MonitorExit, MonitorError> {
        let result = {
            let provisioned = self.provisioned.as_ref().ok_or(MonitorError::NotStarted)?;
            let console = self.console.as_deref().ok_or(MonitorError::NotStarted)?;
            let machine = provisioned.machine.as_ref();
            let monitor = &self.monitor;
            let observers = &self.observers;
            let cancel = &self.cancel;

            std::thread::scope(|scope| {
                let handle = std::thread::Builder::new()
                    .name(MONITOR_THREAD.to_string())
                    .spawn_scoped(scope, move || monitor.run(machine, console, observers, cancel))
                    .map_err(MonitorError::Spawn)?;
                handle.join().map_err(|_| MonitorError::Panicked)?
            })
        };

        self.console = None;
        result
    }

    /// Ask a running monitor loop to return.
    pub fn stop(&self) {
        if !self.cancel.is_cancelled() {
            info!("Stopping monitor");
        }
        self.cancel.cancel();
    }

    /// Token that stops the monitor when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Tear down the machine and everything created for it.
    ///
    /// A launched machine that is still running is powered off first. Then:
    /// unlock the session, wait, release the storage controller, unregister
    /// with full cleanup, delete settings and returned media, release the
    /// machine. A partly provisioned machine gets the steps that apply to
    /// what was created, and failures there are logged rather than returned.
    /// Does nothing when nothing was provisioned.
    pub fn release(&mut self) -> Result<()> {
        self.console = None;
        let launched = std::mem::take(&mut self.launched);
        let Some(provisioned) = self.provisioned.take() else {
            debug!("Nothing to release");
            return Ok(());
        };
        let ProvisionedMachine {
            machine,
            medium,
            controller,
            session,
            complete,
        } = provisioned;
        if !complete {
            warn!(machine = machine.name(), "Releasing a partly provisioned machine");
        }

        if launched {
            self.power_off_if_running(machine.as_ref())?;
        }

        if let Some(session) = &session {
            teardown_step(complete, "Failed to unlock session", session.unlock_machine())?;
            std::thread::sleep(self.options.unlock_grace);
        }

        if let Some(controller) = controller {
            teardown_step(
                complete,
                "Failed to release storage controller",
                controller.release(),
            )?;
        }

        let media = teardown_step(
            complete,
            "Failed to unregister machine",
            machine.unregister(CleanupMode::Full),
        )?
        .unwrap_or_default();
        debug!(count = media.len(), "Media returned by unregister");

        let progress = teardown_step(
            complete,
            "Failed to delete machine configuration",
            machine.delete_config(media),
        )?;
        if let Some(progress) = progress {
            teardown_step(
                complete,
                "Machine configuration deletion did not complete",
                progress.wait_for_completion(None),
            )?;
        }

        let name = machine.name().to_string();
        teardown_step(complete, "Failed to release machine", machine.release())?;
        drop(medium);
        drop(session);

        info!(machine = %name, "Machine released");
        Ok(())
    }

    fn power_off_if_running(&self, machine: &dyn Machine) -> Result<()> {
        let state = match machine.state() {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, "Failed to query machine state before teardown");
                return Ok(());
            }
        };
        if state.is_stopped() {
            return Ok(());
        }

        info!(machine = machine.name(), ?state, "Powering off machine");
        let progress = machine.power_off().context("Failed to power off machine")?;
        progress
            .wait_for_completion(Some(self.options.power_off_timeout))
            .context("Machine power-off did not complete")
    }
}

/// Run one teardown step. A full teardown stops at the first failure; a
/// partial one logs it and moves on.
fn teardown_step<T>(
    strict: bool,
    what: &'static str,
    result: hypervisor::Result<T>,
) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if strict => Err(anyhow::Error::new(e).context(what)),
        Err(e) => {
            warn!(error = %e, step = what, "Teardown step failed");
            Ok(None)
        }
    }
}
