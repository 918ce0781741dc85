//! VirtualBox backend driven through the `VBoxManage` command-line tool.
//!
//! Every trait call maps to one or two `VBoxManage` invocations:
//!
//! | call                          | command                                   |
//! |-------------------------------|-------------------------------------------|
//! | `create_machine`              | `createvm --register`                     |
//! | `set_*`                       | `modifyvm`                                |
//! | `set_extra_data`              | `setextradata global|<vm>`                |
//! | `add_storage_controller`      | `storagectl --add`                        |
//! | `attach_device`               | `storageattach`                           |
//! | `launch`                      | `startvm --type gui|headless`             |
//! | `power_off`                   | `controlvm poweroff`                      |
//! | `state`, `unregister`         | `showvminfo --machinereadable`            |
//! | `enumerate_guest_properties`  | `guestproperty enumerate`                 |
//! | `unregister`                  | `unregistervm`                            |
//! | `delete_config`               | `closemedium disk --delete`               |
//!
//! `VBoxManage` applies changes immediately, so machines are registered at
//! creation time and `save_settings`/`register` only record intent. The tool
//! has no passive event listener, so consoles from this backend refuse to
//! hand out an event source and the monitor runs in polling mode.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use chrono::DateTime;
use tracing::{debug, info};

use super::{
    AccessMode, BiosSettings, BootMenuMode, CleanupMode, CompletedProgress, Console, DeviceType,
    EventSource, GuestProperty, Hypervisor, HypervisorError, LaunchFrontend, LockType, Machine,
    MachineState, MachineView, Medium, NetworkAdapterType, Progress, Result, Session,
    SharedFolder, StorageBus, StorageController, StorageControllerType, TransferMode,
};

const PROGRAM_NAME: &str = "VBoxManage";

/// Shared runner for `VBoxManage` invocations.
#[derive(Debug)]
struct Cli {
    program: PathBuf,
}

impl Cli {
    fn run(&self, args: &[&str]) -> Result<String> {
        let command = format!("{PROGRAM_NAME} {}", args.join(" "));
        debug!(command = %command, "running");

        let output = Command::new(&self.program)
            .args(args)
            .output()
            .map_err(|source| HypervisorError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(HypervisorError::CommandFailed {
                command,
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

// ---------------------------------------------------------------------------
// Hypervisor
// ---------------------------------------------------------------------------

/// [`Hypervisor`] implementation backed by `VBoxManage`.
#[derive(Debug, Clone)]
pub struct VBoxManage {
    cli: Arc<Cli>,
}

impl VBoxManage {
    /// Use the `VBoxManage` binary at `program`.
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            cli: Arc::new(Cli {
                program: program.into(),
            }),
        }
    }

    /// Find `VBoxManage` on `PATH`, in `VBOX_INSTALL_PATH`, or in the
    /// standard install locations.
    pub fn locate() -> Result<Self> {
        let mut dirs: Vec<PathBuf> = Vec::new();
        if let Some(path_var) = std::env::var_os("PATH") {
            dirs.extend(std::env::split_paths(&path_var));
        }
        for var in ["VBOX_INSTALL_PATH", "VBOX_MSI_INSTALL_PATH"] {
            if let Some(dir) = std::env::var_os(var) {
                dirs.push(PathBuf::from(dir));
            }
        }
        dirs.extend(
            [
                "/usr/bin",
                "/usr/local/bin",
                "/usr/lib/virtualbox",
                "/Applications/VirtualBox.app/Contents/MacOS",
            ]
            .into_iter()
            .map(PathBuf::from),
        );

        dirs.into_iter()
            .map(|dir| dir.join(PROGRAM_NAME))
            .find(|candidate| candidate.is_file())
            .map(|program| {
                info!(path = %program.display(), "Found VBoxManage binary");
                Self::with_program(program)
            })
            .ok_or_else(|| {
                HypervisorError::Other(
                    "VBoxManage not found. Install VirtualBox or add its directory to PATH"
                        .to_string(),
                )
            })
    }

    pub fn program(&self) -> &Path {
        &self.cli.program
    }
}

impl Hypervisor for VBoxManage {
    fn supports_event_subscription(&self) -> bool {
        false
    }

    fn open_medium(
        &self,
        location: &Path,
        device: DeviceType,
        access: AccessMode,
    ) -> Result<Box<dyn Medium>> {
        if !location.exists() {
            return Err(HypervisorError::MediumNotFound(location.to_path_buf()));
        }
        let location = location.canonicalize()?;
        debug!(location = %location.display(), ?device, ?access, "Opened medium");
        Ok(Box::new(VBoxMedium { location }))
    }

    fn create_machine(
        &self,
        settings_dir: &Path,
        name: &str,
        os_type: &str,
    ) -> Result<Box<dyn Machine>> {
        let base = settings_dir.display().to_string();
        self.cli.run(&[
            "createvm",
            "--name",
            name,
            "--ostype",
            os_type,
            "--basefolder",
            &base,
            "--register",
        ])?;
        info!(machine = name, basefolder = %base, "Machine created");

        Ok(Box::new(VBoxMachine {
            cli: Arc::clone(&self.cli),
            name: name.to_string(),
            settings_dir: Some(settings_dir.join(name)),
            mutable: false,
        }))
    }

    fn new_session(&self) -> Result<Box<dyn Session>> {
        Ok(Box::new(VBoxSession {
            cli: Arc::clone(&self.cli),
            state: Mutex::new(SessionState::default()),
        }))
    }

    fn set_extra_data(&self, key: &str, value: &str) -> Result<()> {
        self.cli.run(&["setextradata", "global", key, value])?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Machine
// ---------------------------------------------------------------------------

struct VBoxMachine {
    cli: Arc<Cli>,
    name: String,
    /// Folder created by `createvm`; unknown for session-derived handles.
    settings_dir: Option<PathBuf>,
    /// Obtained through a write-locked session.
    mutable: bool,
}

impl VBoxMachine {
    fn modify(&self, args: &[&str]) -> Result<()> {
        let mut full = vec!["modifyvm", self.name.as_str()];
        full.extend_from_slice(args);
        self.cli.run(&full)?;
        Ok(())
    }

    fn info(&self) -> Result<BTreeMap<String, String>> {
        let output = self
            .cli
            .run(&["showvminfo", self.name.as_str(), "--machinereadable"])?;
        Ok(parse_machine_readable(&output))
    }
}

impl MachineView for VBoxMachine {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> Result<MachineState> {
        let info = self.info()?;
        info.get("VMState")
            .map(|state| MachineState::from_vbox_name(state))
            .ok_or_else(|| HypervisorError::Parse {
                command: format!("{PROGRAM_NAME} showvminfo {}", self.name),
                detail: "no VMState field".to_string(),
            })
    }

    fn enumerate_guest_properties(&self, patterns: &str) -> Result<Vec<GuestProperty>> {
        let mut args = vec!["guestproperty", "enumerate", self.name.as_str()];
        if !patterns.is_empty() {
            args.push(patterns);
        }
        let output = self.cli.run(&args)?;
        parse_guest_properties(&output)
    }
}

impl Machine for VBoxMachine {
    fn set_cpu_count(&self, cpus: u32) -> Result<()> {
        self.modify(&["--cpus", &cpus.to_string()])
    }

    fn set_memory_size(&self, mib: u32) -> Result<()> {
        self.modify(&["--memory", &mib.to_string()])
    }

    fn set_vram_size(&self, mib: u32) -> Result<()> {
        self.modify(&["--vram", &mib.to_string()])
    }

    fn set_bios_settings(&self, bios: &BiosSettings) -> Result<()> {
        let boot_menu = match bios.boot_menu {
            BootMenuMode::Disabled => "disabled",
            BootMenuMode::MenuOnly => "menuonly",
            BootMenuMode::MessageAndMenu => "messageandmenu",
        };
        self.modify(&[
            "--acpi",
            on_off(bios.acpi),
            "--ioapic",
            on_off(bios.io_apic),
            "--biosbootmenu",
            boot_menu,
        ])
    }

    fn set_network_adapter_type(&self, slot: u32, kind: NetworkAdapterType) -> Result<()> {
        let kind = match kind {
            NetworkAdapterType::Am79C973 => "Am79C973",
            NetworkAdapterType::I82540Em => "82540EM",
            NetworkAdapterType::I82545Em => "82545EM",
            NetworkAdapterType::Virtio => "virtio",
        };
        // VBoxManage numbers NICs from 1.
        self.modify(&[&format!("--nictype{}", slot + 1), kind])
    }

    fn set_accelerate_3d(&self, enabled: bool) -> Result<()> {
        self.modify(&["--accelerate3d", on_off(enabled)])
    }

    fn set_drag_and_drop_mode(&self, mode: TransferMode) -> Result<()> {
        self.modify(&["--draganddrop", transfer_mode(mode)])
    }

    fn set_clipboard_mode(&self, mode: TransferMode) -> Result<()> {
        self.modify(&["--clipboard-mode", transfer_mode(mode)])
    }

    fn set_extra_data(&self, key: &str, value: &str) -> Result<()> {
        self.cli
            .run(&["setextradata", self.name.as_str(), key, value])?;
        Ok(())
    }

    fn create_shared_folder(&self, folder: &SharedFolder) -> Result<()> {
        let host_path = folder.host_path.display().to_string();
        let mut args = vec![
            "sharedfolder",
            "add",
            self.name.as_str(),
            "--name",
            folder.name.as_str(),
            "--hostpath",
            host_path.as_str(),
        ];
        if !folder.persistent {
            args.push("--transient");
        }
        if folder.automount {
            args.push("--automount");
        }
        self.cli.run(&args)?;
        Ok(())
    }

    fn add_storage_controller(
        &self,
        name: &str,
        bus: StorageBus,
    ) -> Result<Box<dyn StorageController>> {
        let bus = match bus {
            StorageBus::Ide => "ide",
            StorageBus::Sata => "sata",
        };
        self.cli
            .run(&["storagectl", self.name.as_str(), "--name", name, "--add", bus])?;
        Ok(Box::new(VBoxStorageController {
            cli: Arc::clone(&self.cli),
            machine: self.name.clone(),
            name: name.to_string(),
        }))
    }

    fn attach_device(
        &self,
        controller: &str,
        port: u32,
        device: u32,
        kind: DeviceType,
        medium: &dyn Medium,
    ) -> Result<()> {
        if !self.mutable {
            return Err(HypervisorError::NotLocked(self.name.clone()));
        }
        let kind = match kind {
            DeviceType::HardDisk => "hdd",
            DeviceType::Dvd => "dvddrive",
        };
        let location = medium.location().display().to_string();
        self.cli.run(&[
            "storageattach",
            self.name.as_str(),
            "--storagectl",
            controller,
            "--port",
            &port.to_string(),
            "--device",
            &device.to_string(),
            "--type",
            kind,
            "--medium",
            &location,
        ])?;
        Ok(())
    }

    fn save_settings(&self) -> Result<()> {
        debug!(machine = %self.name, "settings are persisted by each VBoxManage call");
        Ok(())
    }

    fn register(&self) -> Result<()> {
        debug!(machine = %self.name, "registered at creation");
        Ok(())
    }

    fn launch(&self, _session: &dyn Session, frontend: LaunchFrontend) -> Result<Box<dyn Progress>> {
        let frontend = match frontend {
            LaunchFrontend::Gui => "gui",
            LaunchFrontend::Headless => "headless",
        };
        // startvm returns once the VM process is up.
        self.cli
            .run(&["startvm", self.name.as_str(), "--type", frontend])?;
        Ok(Box::new(CompletedProgress))
    }

    fn power_off(&self) -> Result<Box<dyn Progress>> {
        // controlvm returns once the VM process has exited.
        self.cli.run(&["controlvm", self.name.as_str(), "poweroff"])?;
        info!(machine = %self.name, "Machine powered off");
        Ok(Box::new(CompletedProgress))
    }

    fn unregister(&self, mode: CleanupMode) -> Result<Vec<Box<dyn Medium>>> {
        let media = match mode {
            CleanupMode::UnregisterOnly | CleanupMode::DetachAllReturnNone => Vec::new(),
            CleanupMode::DetachAllReturnHardDisksOnly | CleanupMode::Full => {
                attached_media(&self.info()?)
            }
        };
        self.cli.run(&["unregistervm", self.name.as_str()])?;
        info!(machine = %self.name, media = media.len(), "Machine unregistered");

        Ok(media
            .into_iter()
            .map(|location| Box::new(VBoxMedium { location }) as Box<dyn Medium>)
            .collect())
    }

    fn delete_config(&self, media: Vec<Box<dyn Medium>>) -> Result<Box<dyn Progress>> {
        for medium in &media {
            let location = medium.location().display().to_string();
            self.cli
                .run(&["closemedium", "disk", location.as_str(), "--delete"])?;
            debug!(medium = %location, "Medium deleted");
        }
        if let Some(dir) = self.settings_dir.as_deref().filter(|dir| dir.exists()) {
            std::fs::remove_dir_all(dir)?;
            debug!(dir = %dir.display(), "Settings folder removed");
        }
        Ok(Box::new(CompletedProgress))
    }

    fn release(self: Box<Self>) -> Result<()> {
        debug!(machine = %self.name, "Machine handle released");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Session / console
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SessionState {
    /// Machine currently write-locked by this session.
    locked: Option<String>,
    /// Last machine this session was attached to.
    last_machine: Option<String>,
}

struct VBoxSession {
    cli: Arc<Cli>,
    state: Mutex<SessionState>,
}

impl VBoxSession {
    fn state(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Session for VBoxSession {
    fn lock_machine(&self, machine: &dyn Machine, lock: LockType) -> Result<()> {
        let name = machine.name().to_string();
        let mut state = self.state();
        state.last_machine = Some(name.clone());
        if lock == LockType::Write {
            state.locked = Some(name);
        }
        Ok(())
    }

    fn machine(&self) -> Result<Box<dyn Machine>> {
        let state = self.state();
        let locked = state.locked.as_ref().ok_or_else(|| {
            HypervisorError::NotLocked(state.last_machine.clone().unwrap_or_default())
        })?;
        Ok(Box::new(VBoxMachine {
            cli: Arc::clone(&self.cli),
            name: locked.clone(),
            settings_dir: None,
            mutable: true,
        }))
    }

    fn unlock_machine(&self) -> Result<()> {
        self.state().locked = None;
        Ok(())
    }

    fn console(&self) -> Result<Box<dyn Console>> {
        let state = self.state();
        let name = state
            .last_machine
            .clone()
            .ok_or_else(|| HypervisorError::NotLocked(String::new()))?;
        Ok(Box::new(VBoxConsole { machine: name }))
    }
}

struct VBoxConsole {
    machine: String,
}

impl Console for VBoxConsole {
    fn event_source(&self) -> Result<Box<dyn EventSource>> {
        debug!(machine = %self.machine, "event source requested from VBoxManage console");
        Err(HypervisorError::Unsupported("event subscription"))
    }
}

// ---------------------------------------------------------------------------
// Storage controller / medium
// ---------------------------------------------------------------------------

struct VBoxStorageController {
    cli: Arc<Cli>,
    machine: String,
    name: String,
}

impl StorageController for VBoxStorageController {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_controller_type(&self, kind: StorageControllerType) -> Result<()> {
        let kind = match kind {
            StorageControllerType::Piix4 => "PIIX4",
            StorageControllerType::Ich6 => "ICH6",
            StorageControllerType::IntelAhci => "IntelAhci",
        };
        self.cli.run(&[
            "storagectl",
            self.machine.as_str(),
            "--name",
            self.name.as_str(),
            "--controller",
            kind,
        ])?;
        Ok(())
    }

    fn release(self: Box<Self>) -> Result<()> {
        debug!(machine = %self.machine, controller = %self.name, "Storage controller released");
        Ok(())
    }
}

#[derive(Debug)]
struct VBoxMedium {
    location: PathBuf,
}

impl Medium for VBoxMedium {
    fn location(&self) -> &Path {
        &self.location
    }
}

// ---------------------------------------------------------------------------
// Output parsing
// ---------------------------------------------------------------------------

fn on_off(enabled: bool) -> &'static str {
    if enabled { "on" } else { "off" }
}

fn transfer_mode(mode: TransferMode) -> &'static str {
    match mode {
        TransferMode::Disabled => "disabled",
        TransferMode::HostToGuest => "hosttoguest",
        TransferMode::GuestToHost => "guesttohost",
        TransferMode::Bidirectional => "bidirectional",
    }
}

fn unquote(s: &str) -> &str {
    let s = s.trim();
    s.strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .unwrap_or(s)
}

/// Parse `showvminfo --machinereadable` output into key/value pairs.
fn parse_machine_readable(output: &str) -> BTreeMap<String, String> {
    output
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (unquote(key).to_string(), unquote(value).to_string()))
        .collect()
}

/// Media attached to storage slots (`"<controller>-<port>-<device>"="<path>"`).
fn attached_media(info: &BTreeMap<String, String>) -> Vec<PathBuf> {
    info.iter()
        .filter(|(key, _)| is_slot_key(key))
        .filter(|(_, value)| value.contains('/') || value.contains('\\'))
        .map(|(_, value)| PathBuf::from(value))
        .collect()
}

fn is_slot_key(key: &str) -> bool {
    let mut parts = key.rsplitn(3, '-');
    let device = parts.next().unwrap_or_default();
    let port = parts.next().unwrap_or_default();
    let controller = parts.next().unwrap_or_default();
    !controller.is_empty()
        && !controller.ends_with("-ImageUUID")
        && !port.is_empty()
        && port.chars().all(|c| c.is_ascii_digit())
        && !device.is_empty()
        && device.chars().all(|c| c.is_ascii_digit())
}

/// Parse `guestproperty enumerate` output.
///
/// Accepts the classic form
/// `Name: <name>, value: <value>, timestamp: <ns>, flags: <flags>` and the
/// VirtualBox 7 form `<name> = '<value>' @ <rfc3339> [<flags>]`.
fn parse_guest_properties(output: &str) -> Result<Vec<GuestProperty>> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| line.starts_with("Name: ") || line.contains(" = '"))
        .map(|line| {
            let parsed = if line.starts_with("Name: ") {
                parse_classic_property(line)
            } else {
                parse_modern_property(line)
            };
            parsed.ok_or_else(|| HypervisorError::Parse {
                command: format!("{PROGRAM_NAME} guestproperty enumerate"),
                detail: format!("unrecognised line: {line}"),
            })
        })
        .collect()
}

fn parse_classic_property(line: &str) -> Option<GuestProperty> {
    let rest = line.strip_prefix("Name: ")?;
    let (name, rest) = rest.split_once(", value: ")?;
    let (value, rest) = rest.rsplit_once(", timestamp: ")?;
    let (timestamp, flags) = rest.split_once(", flags: ")?;
    Some(GuestProperty::new(
        name,
        value,
        timestamp.trim().parse().ok()?,
        flags.trim(),
    ))
}

fn parse_modern_property(line: &str) -> Option<GuestProperty> {
    let (name, rest) = line.split_once(" = '")?;
    let end = rest.rfind('\'')?;
    let value = &rest[..end];
    let mut tail = rest[end + 1..].trim();

    let mut flags = "";
    if let Some(open) = tail.rfind(" [").or_else(|| tail.starts_with('[').then_some(0)) {
        if tail.ends_with(']') {
            flags = tail[open..].trim().trim_start_matches('[').trim_end_matches(']');
            tail = tail[..open].trim();
        }
    }

    let timestamp = match tail.strip_prefix('@') {
        Some(ts) => DateTime::parse_from_rfc3339(ts.trim())
            .ok()?
            .timestamp_nanos_opt()
            .unwrap_or_default(),
        None => 0,
    };

    Some(GuestProperty::new(name.trim(), value, timestamp, flags))
}
