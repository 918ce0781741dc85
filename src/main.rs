//! vmkeeper: single virtual machine launcher
//!
//! Provisions a VirtualBox machine from the layered TOML configuration,
//! launches it, watches it until it powers off, then removes it again.

use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use vmkeeper::config::LaunchConfig;
use vmkeeper::host::{HostBackend, PlatformHost};
use vmkeeper::hypervisor::vboxmanage::VBoxManage;
use vmkeeper::logging;
use vmkeeper::monitor::{MonitorExit, MonitorOptions};
use vmkeeper::observer::LoggingObserver;
use vmkeeper::paths::AppPaths;
use vmkeeper::supervisor::{Supervisor, SupervisorOptions};

/// Launch and supervise a virtual machine
#[derive(Parser, Debug)]
#[command(name = "vmkeeper", version, about = "Launch and supervise a virtual machine")]
struct Args {
    /// Configuration file; repeat to layer several, later files win
    #[arg(short, long = "config", value_name = "PATH")]
    config: Vec<PathBuf>,

    /// Do not destroy the machine when exiting
    #[arg(short, long)]
    keep: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let paths = AppPaths::resolve();
    let default_config = paths.as_ref().and_then(AppPaths::default_config_file);
    let config = LaunchConfig::load(&args.config, default_config.as_deref())?;

    let log = logging::init(&config.data_path, paths.as_ref().map(|p| p.logs.as_path()));
    info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = %log.path().display(),
        "vmkeeper starting"
    );
    if let Some(paths) = &paths {
        if let Err(e) = paths.ensure() {
            warn!(error = %e, "Failed to create application directories");
        }
    }

    let host = Arc::new(PlatformHost);
    if !host.is_privileged() {
        info!("Elevating privileges");
        let executable = std::env::current_exe().context("Failed to determine executable")?;
        let relaunch_args: Vec<OsString> = std::env::args_os().skip(1).collect();
        return host
            .elevate_and_relaunch(&executable, &relaunch_args)
            .context("Failed to run as administrator");
    }

    // Only the Ctrl-C handler runs here; supervision itself is blocking.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .context("Failed to create Tokio runtime")?;

    let result = launch(&runtime, host, &config, args.keep);
    if let Err(e) = &result {
        error!(error = format!("{e:#}"), "vmkeeper failed");
    }

    runtime.shutdown_timeout(Duration::from_secs(1));
    result
}

fn launch(
    runtime: &tokio::runtime::Runtime,
    host: Arc<PlatformHost>,
    config: &LaunchConfig,
    keep: bool,
) -> Result<()> {
    let hypervisor = Arc::new(VBoxManage::locate().context("VirtualBox is not installed")?);
    info!(program = %hypervisor.program().display(), "Using VBoxManage");

    let options = SupervisorOptions {
        monitor: MonitorOptions {
            strict_state_query: config.strict_monitor,
            ..MonitorOptions::default()
        },
        ..SupervisorOptions::default()
    };
    let mut supervisor = Supervisor::new(hypervisor, host, options);
    supervisor.register_observer(Arc::new(LoggingObserver));

    let token = supervisor.cancellation_token();
    runtime.spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received");
            token.cancel();
        }
    });

    let outcome = supervise(&mut supervisor, config);

    if keep {
        info!("Keeping machine (--keep)");
        return outcome;
    }
    match (outcome, supervisor.release()) {
        (Ok(()), released) => released,
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(release_error)) => {
            warn!(error = format!("{release_error:#}"), "Failed to release machine");
            Err(e)
        }
    }
}

fn supervise(supervisor: &mut Supervisor, config: &LaunchConfig) -> Result<()> {
    supervisor.provision(config)?;
    supervisor.start()?;

    let exit = supervisor.run().context("Error during machine execution")?;
    supervisor.stop();

    match exit {
        MonitorExit::PoweredOff => info!("Machine powered off"),
        MonitorExit::Cancelled => info!("Monitoring cancelled"),
        MonitorExit::MachineUnreachable(e) => {
            warn!(error = %e, "Lost contact with the machine")
        }
    }
    Ok(())
}
