//! Machine provisioning.
//!
//! Turns a [`LaunchConfig`] plus host facts into a [`MachineSpec`], then runs
//! the one-shot creation sequence against a [`Hypervisor`]:
//!
//! 1. Resolve the hard disk (raw device descriptor or existing image)
//! 2. Define the machine and apply its hardware settings
//! 3. Add the IDE controller, save, register
//! 4. Write-lock a session, attach the disk through the mutable machine, unlock
//!
//! Nothing is rolled back on failure. Once the machine exists, the handles
//! created so far are left with the caller so teardown can remove them.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::{DiskType, LaunchConfig};
use crate::disk::DiskImageBuilder;
use crate::host::HostBackend;
use crate::hypervisor::{
    AccessMode, BiosSettings, BootMenuMode, DeviceType, Hypervisor, LockType, Machine, Medium,
    NetworkAdapterType, Session, SharedFolder, StorageBus, StorageController,
    StorageControllerType, TransferMode,
};

/// Name given to the machine definition.
pub const MACHINE_NAME: &str = "vmkeeper";

/// Name of the IDE storage controller the disk is attached to.
pub const CONTROLLER_NAME: &str = "IDE";

/// File name of the raw disk descriptor inside `data_path`.
pub const RAW_DISK_FILE: &str = "raw.vmdk";

const VRAM_MIB: u32 = 32;
const MIB: u64 = 1024 * 1024;

const SUPPRESSED_MESSAGES: &str = ",remindAboutAutoCapture,confirmInputCapture,\
remindAboutMouseIntegrationOn,remindAboutMouseIntegrationOff,\
remindAboutInaccessibleMedia,remindAboutWrongColorDepth,confirmGoingFullscreen,\
showRuntimeError.warning.HostAudioNotResponding,\
showRuntimeError.warning.3DSupportIncompatibleAdditions";

// ---------------------------------------------------------------------------
// Machine settings
// ---------------------------------------------------------------------------

/// Everything that gets applied to a freshly created machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineSpec {
    pub name: String,
    pub os_type: String,
    pub cpus: u32,
    pub memory_mib: u32,
    pub vram_mib: u32,
    pub bios: BiosSettings,
    pub nic: NetworkAdapterType,
    pub accelerate_3d: bool,
    pub drag_and_drop: TransferMode,
    pub clipboard: TransferMode,
    /// Hypervisor-wide extra data, applied in order.
    pub global_extra_data: Vec<(String, String)>,
    /// Per-machine extra data, applied in order.
    pub machine_extra_data: Vec<(String, String)>,
    pub shared_folders: Vec<SharedFolder>,
}

impl MachineSpec {
    /// Resolve the automatic values in `config` against the host.
    ///
    /// `host_cpus` is the number of logical CPUs on the host.
    pub fn resolve(config: &LaunchConfig, host: &dyn HostBackend, host_cpus: usize) -> Self {
        let cpus = if config.cpus > 0 {
            config.cpus
        } else {
            let n = host_cpus.max(1) as i64;
            if n > 1 { n / 2 } else { n }
        };

        let memory = if config.ram > 0 {
            config.ram
        } else {
            let from_free = match host.free_memory_bytes() {
                Ok(bytes) => (bytes.saturating_mul(2) / 3 / MIB) as i64,
                Err(e) => {
                    warn!(error = %e, "Failed to query free memory");
                    0
                }
            };
            from_free.max(config.min_ram)
        };

        let mut global_extra_data = vec![
            extra("GUI/MaxGuestResolution", "any"),
            extra("GUI/Input/AutoCapture", "true"),
            extra("GUI/TrayIcon/Enabled", "false"),
            extra("GUI/UpdateCheckCount", "2"),
            extra("GUI/UpdateDate", "never"),
            extra("GUI/RegistrationData", "triesLeft=0"),
            extra("GUI/SUNOnlineData", "0"),
            extra("GUI/SuppressMessages", SUPPRESSED_MESSAGES),
        ];
        if !config.menubar {
            global_extra_data.push(extra("GUI/Customizations", "noMenuBar"));
            global_extra_data.push(extra("GUI/ShowMiniToolBar", "no"));
        }

        let mut machine_extra_data = vec![
            extra("GUI/SaveMountedAtRuntime", "false"),
            extra("GUI/Seamless", "off"),
            extra("GUI/LastCloseAction", "shutdown"),
            extra("GUI/AutoresizeGuest", "on"),
        ];
        if !config.host_key.is_empty() {
            machine_extra_data.push(extra("GUI/Input/HostKey", &config.host_key));
        }

        let shared_folders = config
            .shared_folders
            .iter()
            .map(|(name, folder)| SharedFolder {
                name: name.clone(),
                host_path: folder.path.clone(),
                persistent: folder.persistent,
                automount: folder.automount,
            })
            .collect();

        Self {
            name: MACHINE_NAME.to_string(),
            os_type: config.distro_type.clone(),
            cpus: to_u32(cpus),
            memory_mib: to_u32(memory),
            vram_mib: VRAM_MIB,
            bios: BiosSettings {
                acpi: true,
                io_apic: true,
                boot_menu: BootMenuMode::Disabled,
            },
            nic: NetworkAdapterType::I82540Em,
            accelerate_3d: true,
            drag_and_drop: TransferMode::Bidirectional,
            clipboard: TransferMode::Bidirectional,
            global_extra_data,
            machine_extra_data,
            shared_folders,
        }
    }

    /// Apply these settings to `machine`, and the global extra data to `hypervisor`.
    pub fn apply(&self, hypervisor: &dyn Hypervisor, machine: &dyn Machine) -> Result<()> {
        machine.set_cpu_count(self.cpus).context("set CPU count")?;
        info!(mib = self.memory_mib, "Setting RAM");
        machine.set_memory_size(self.memory_mib).context("set memory size")?;
        machine.set_vram_size(self.vram_mib).context("set VRAM size")?;
        machine.set_bios_settings(&self.bios).context("configure BIOS")?;
        machine
            .set_network_adapter_type(0, self.nic)
            .context("set network adapter type")?;

        for (key, value) in &self.global_extra_data {
            hypervisor
                .set_extra_data(key, value)
                .with_context(|| format!("set global extra data {key}"))?;
        }
        for (key, value) in &self.machine_extra_data {
            machine
                .set_extra_data(key, value)
                .with_context(|| format!("set machine extra data {key}"))?;
        }

        machine.set_accelerate_3d(self.accelerate_3d).context("enable 3D acceleration")?;
        machine
            .set_drag_and_drop_mode(self.drag_and_drop)
            .context("set drag and drop mode")?;
        machine.set_clipboard_mode(self.clipboard).context("set clipboard mode")?;

        for folder in &self.shared_folders {
            if let Err(e) = machine.create_shared_folder(folder) {
                warn!(name = %folder.name, path = %folder.host_path.display(), error = %e, "Failed to create shared folder");
            }
        }
        Ok(())
    }
}

fn extra(key: &str, value: &str) -> (String, String) {
    (key.to_string(), value.to_string())
}

fn to_u32(value: i64) -> u32 {
    value.clamp(0, i64::from(u32::MAX)) as u32
}

// ---------------------------------------------------------------------------
// Provisioner
// ---------------------------------------------------------------------------

/// Handles created for the machine. Filled in step by step during
/// provisioning and owned by the supervisor until teardown.
pub struct ProvisionedMachine {
    pub machine: Box<dyn Machine>,
    pub medium: Box<dyn Medium>,
    pub controller: Option<Box<dyn StorageController>>,
    pub session: Option<Box<dyn Session>>,
    /// Every creation step succeeded.
    pub complete: bool,
}

impl std::fmt::Debug for ProvisionedMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisionedMachine")
            .field("machine", &self.machine.name())
            .field("medium", &self.medium.location())
            .field("controller", &self.controller.as_ref().map(|c| c.name()))
            .field("session", &self.session.is_some())
            .field("complete", &self.complete)
            .finish()
    }
}

pub struct Provisioner;

impl Provisioner {
    /// Create, configure and register the machine described by `config`.
    ///
    /// The handles land in `slot` as soon as the machine exists. When a later
    /// step fails they stay there, incomplete, for the caller to tear down.
    pub fn create(
        hypervisor: &dyn Hypervisor,
        host: &dyn HostBackend,
        disk_builder: &dyn DiskImageBuilder,
        config: &LaunchConfig,
        slot: &mut Option<ProvisionedMachine>,
    ) -> Result<()> {
        let settings_path = config.data_path.as_path();
        let disk_location = resolve_disk(host, disk_builder, config)?;

        let medium = hypervisor
            .open_medium(&disk_location, DeviceType::HardDisk, AccessMode::ReadWrite)
            .with_context(|| format!("open disk {}", disk_location.display()))?;

        let host_cpus = std::thread::available_parallelism().map_or(1, |n| n.get());
        let spec = MachineSpec::resolve(config, host, host_cpus);

        let machine = hypervisor
            .create_machine(settings_path, &spec.name, &spec.os_type)
            .with_context(|| format!("create machine {}", spec.name))?;
        let provisioned = slot.insert(ProvisionedMachine {
            machine,
            medium,
            controller: None,
            session: None,
            complete: false,
        });
        let machine = provisioned.machine.as_ref();

        spec.apply(hypervisor, machine)?;

        let controller = provisioned.controller.insert(
            machine
                .add_storage_controller(CONTROLLER_NAME, StorageBus::Ide)
                .context("add storage controller")?,
        );
        controller
            .set_controller_type(StorageControllerType::Ich6)
            .context("set storage controller type")?;

        machine.save_settings().context("save machine settings")?;
        machine.register().context("register machine")?;

        let session = provisioned
            .session
            .insert(hypervisor.new_session().context("create session")?);
        session
            .lock_machine(machine, LockType::Write)
            .context("lock machine")?;

        // Device attachment needs the session's mutable machine.
        let mutable = session.machine().context("get mutable machine")?;
        mutable
            .attach_device(
                CONTROLLER_NAME,
                0,
                0,
                DeviceType::HardDisk,
                provisioned.medium.as_ref(),
            )
            .context("attach disk")?;
        mutable.save_settings().context("save attached disk")?;
        drop(mutable);

        session.unlock_machine().context("unlock machine")?;
        provisioned.complete = true;

        info!(
            machine = %spec.name,
            cpus = spec.cpus,
            memory_mib = spec.memory_mib,
            disk = %disk_location.display(),
            "Machine provisioned"
        );
        Ok(())
    }
}

fn resolve_disk(
    host: &dyn HostBackend,
    disk_builder: &dyn DiskImageBuilder,
    config: &LaunchConfig,
) -> Result<PathBuf> {
    match config.disk_type {
        DiskType::Raw => {
            let device = host.find_block_device().context("find boot device")?;
            info!(device = %device.display(), "Creating raw VMDK");
            let dest = config.data_path.join(RAW_DISK_FILE);
            disk_builder
                .create_raw_image(&dest, &device, true, host.relative_raw_image())
                .context("create raw disk image")?;
            Ok(dest)
        }
        DiskType::Vdi => config
            .disk_location
            .as_deref()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .context("disk_type \"vdi\" requires disk_location"),
    }
}
