//! Hypervisor control API façade.
//!
//! The supervisor, provisioner and lifecycle monitor only ever talk to the
//! hypervisor through the traits in this module. A backend implements them
//! for a concrete platform; [`vboxmanage`] drives VirtualBox through its
//! `VBoxManage` command-line tool.
//!
//! ```text
//! Hypervisor ──► Machine ──► StorageController
//!     │             ▲
//!     └──► Session ─┴──► Console ──► EventSource ──► Event
//! ```
//!
//! Handles are plain owned values. Releasing a handle is either explicit
//! (`release(self: Box<Self>)`, where the hypervisor can report an error) or
//! happens on drop.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

pub mod vboxmanage;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failure reported by a hypervisor backend call.
#[derive(Debug, Error)]
pub enum HypervisorError {
    /// The backend tool could not be started at all.
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The backend tool ran but reported failure.
    #[error("`{command}` failed (exit {code}): {stderr}")]
    CommandFailed {
        command: String,
        code: i32,
        stderr: String,
    },

    /// The backend answered with something we could not interpret.
    #[error("unexpected output from `{command}`: {detail}")]
    Parse { command: String, detail: String },

    /// The operation is not available on this backend.
    #[error("{0} is not supported by this hypervisor backend")]
    Unsupported(&'static str),

    /// A mutation was attempted without holding the machine's session lock.
    #[error("machine `{0}` is not locked by this session")]
    NotLocked(String),

    /// An asynchronous hypervisor operation did not complete in time.
    #[error("operation did not complete within {0:?}")]
    Timeout(Duration),

    /// The requested disk image does not exist.
    #[error("medium not found: {}", .0.display())]
    MediumNotFound(PathBuf),

    /// An event did not carry the payload its kind promises.
    #[error("event payload is missing {0}")]
    Payload(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, HypervisorError>;

// ---------------------------------------------------------------------------
// Value types
// ---------------------------------------------------------------------------

/// Hypervisor-level execution state of a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MachineState {
    PoweredOff,
    Saved,
    Aborted,
    Starting,
    Running,
    Paused,
    Stopping,
    Saving,
    Restoring,
    Stuck,
    /// A state the backend reported that we do not model.
    Other,
}

impl MachineState {
    /// Map VirtualBox's machine-readable state names (`VMState="…"`).
    pub fn from_vbox_name(name: &str) -> Self {
        match name {
            "poweroff" | "poweredoff" => Self::PoweredOff,
            "saved" => Self::Saved,
            "aborted" | "aborted-saved" => Self::Aborted,
            "starting" => Self::Starting,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "stopping" => Self::Stopping,
            "saving" => Self::Saving,
            "restoring" => Self::Restoring,
            "gurumeditation" | "stuck" => Self::Stuck,
            _ => Self::Other,
        }
    }

    /// No VM process is running for the machine.
    pub fn is_stopped(self) -> bool {
        matches!(self, Self::PoweredOff | Self::Saved | Self::Aborted)
    }
}

/// Kinds of notification an [`EventSource`] can deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    MachineStateChanged,
    StateChanged,
    MachineEvent,
    SessionStateChanged,
    GuestPropertyChanged,
    Other,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::MachineStateChanged => "machine-state-changed",
            Self::StateChanged => "state-changed",
            Self::MachineEvent => "machine-event",
            Self::SessionStateChanged => "session-state-changed",
            Self::GuestPropertyChanged => "guest-property-changed",
            Self::Other => "other",
        };
        f.write_str(name)
    }
}

/// A key/value datum published by the guest.
///
/// `timestamp` is in nanoseconds since the Unix epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestProperty {
    pub name: String,
    pub value: String,
    pub timestamp: i64,
    pub flags: String,
}

impl GuestProperty {
    pub fn new(
        name: impl Into<String>,
        value: impl Into<String>,
        timestamp: i64,
        flags: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            timestamp,
            flags: flags.into(),
        }
    }

    /// The notification sent when `name` disappears from the guest.
    pub fn deleted(name: impl Into<String>) -> Self {
        Self::new(name, "", 0, "")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockType {
    Shared,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupMode {
    UnregisterOnly,
    DetachAllReturnNone,
    DetachAllReturnHardDisksOnly,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBus {
    Ide,
    Sata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageControllerType {
    Piix4,
    Ich6,
    IntelAhci,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    HardDisk,
    Dvd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkAdapterType {
    Am79C973,
    I82540Em,
    I82545Em,
    Virtio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootMenuMode {
    Disabled,
    MenuOnly,
    MessageAndMenu,
}

/// Direction for clipboard sharing and drag and drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Disabled,
    HostToGuest,
    GuestToHost,
    Bidirectional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BiosSettings {
    pub acpi: bool,
    pub io_apic: bool,
    pub boot_menu: BootMenuMode,
}

/// How the launched machine is presented on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchFrontend {
    Gui,
    Headless,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedFolder {
    pub name: String,
    pub host_path: PathBuf,
    pub persistent: bool,
    pub automount: bool,
}

/// Opaque identifier of a registered listener on an [`EventSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

// ---------------------------------------------------------------------------
// Handle traits
// ---------------------------------------------------------------------------

/// Entry point into a hypervisor backend.
pub trait Hypervisor: Send + Sync {
    /// Whether consoles from this backend can hand out an [`EventSource`].
    fn supports_event_subscription(&self) -> bool;

    fn open_medium(
        &self,
        location: &Path,
        device: DeviceType,
        access: AccessMode,
    ) -> Result<Box<dyn Medium>>;

    /// Define a new, not yet registered machine whose settings live under
    /// `settings_dir`.
    fn create_machine(
        &self,
        settings_dir: &Path,
        name: &str,
        os_type: &str,
    ) -> Result<Box<dyn Machine>>;

    fn new_session(&self) -> Result<Box<dyn Session>>;

    /// Global (not per-machine) extra data.
    fn set_extra_data(&self, key: &str, value: &str) -> Result<()>;
}

/// The read-only view of a live machine the lifecycle monitor needs.
pub trait MachineView: Send + Sync {
    fn name(&self) -> &str;

    fn state(&self) -> Result<MachineState>;

    /// All guest properties whose names match `patterns` (empty = all).
    fn enumerate_guest_properties(&self, patterns: &str) -> Result<Vec<GuestProperty>>;
}

/// A machine definition that can be configured, launched and destroyed.
pub trait Machine: MachineView {
    fn set_cpu_count(&self, cpus: u32) -> Result<()>;
    fn set_memory_size(&self, mib: u32) -> Result<()>;
    fn set_vram_size(&self, mib: u32) -> Result<()>;
    fn set_bios_settings(&self, bios: &BiosSettings) -> Result<()>;
    fn set_network_adapter_type(&self, slot: u32, kind: NetworkAdapterType) -> Result<()>;
    fn set_accelerate_3d(&self, enabled: bool) -> Result<()>;
    fn set_drag_and_drop_mode(&self, mode: TransferMode) -> Result<()>;
    fn set_clipboard_mode(&self, mode: TransferMode) -> Result<()>;
    fn set_extra_data(&self, key: &str, value: &str) -> Result<()>;
    fn create_shared_folder(&self, folder: &SharedFolder) -> Result<()>;

    fn add_storage_controller(
        &self,
        name: &str,
        bus: StorageBus,
    ) -> Result<Box<dyn StorageController>>;

    /// Attach `medium` to `controller` at `port`/`device`. Only valid on the
    /// mutable machine obtained from a write-locked [`Session`].
    fn attach_device(
        &self,
        controller: &str,
        port: u32,
        device: u32,
        kind: DeviceType,
        medium: &dyn Medium,
    ) -> Result<()>;

    fn save_settings(&self) -> Result<()>;
    fn register(&self) -> Result<()>;

    /// Launch the machine through `session`; completion is reported by the
    /// returned progress.
    fn launch(&self, session: &dyn Session, frontend: LaunchFrontend) -> Result<Box<dyn Progress>>;

    /// Pull the plug on a running machine.
    fn power_off(&self) -> Result<Box<dyn Progress>>;

    /// Unregister the machine, returning the media `mode` detaches.
    fn unregister(&self, mode: CleanupMode) -> Result<Vec<Box<dyn Medium>>>;

    /// Delete the machine's settings files and the given media.
    fn delete_config(&self, media: Vec<Box<dyn Medium>>) -> Result<Box<dyn Progress>>;

    fn release(self: Box<Self>) -> Result<()>;
}

/// Exclusive access to a machine for mutation and launch.
pub trait Session: Send + Sync {
    fn lock_machine(&self, machine: &dyn Machine, lock: LockType) -> Result<()>;

    /// The mutable machine behind the current lock.
    fn machine(&self) -> Result<Box<dyn Machine>>;

    fn unlock_machine(&self) -> Result<()>;

    /// Console of the machine launched through this session.
    fn console(&self) -> Result<Box<dyn Console>>;
}

/// Live control channel of a running machine.
pub trait Console: Send + Sync {
    fn event_source(&self) -> Result<Box<dyn EventSource>>;
}

/// Push-notification channel of a running machine.
pub trait EventSource: Send {
    fn create_listener(&self) -> Result<ListenerId>;

    /// Subscribe `listener` to `kinds`. A passive listener (`active = false`)
    /// has to pull events with [`EventSource::get_event`].
    fn register_listener(&self, listener: ListenerId, kinds: &[EventKind], active: bool)
    -> Result<()>;

    /// Wait up to `timeout` for the next event. `Ok(None)` means the wait
    /// timed out.
    fn get_event(&self, listener: ListenerId, timeout: Duration) -> Result<Option<Box<dyn Event>>>;

    /// Acknowledge an event delivered to a passive listener.
    fn event_processed(&self, listener: ListenerId, event: &dyn Event) -> Result<()>;

    fn unregister_listener(&self, listener: ListenerId) -> Result<()>;
}

/// A single notification; its resources are released on drop.
pub trait Event: Send {
    fn kind(&self) -> Result<EventKind>;

    /// The guest-property payload, when this is a guest-property event.
    fn as_guest_property(&self) -> Option<&dyn GuestPropertyChange>;
}

/// Payload of a guest-property-changed event. Each field decodes
/// independently.
pub trait GuestPropertyChange {
    fn name(&self) -> Result<String>;
    fn value(&self) -> Result<String>;
    fn flags(&self) -> Result<String>;
}

pub trait StorageController: Send + Sync {
    fn name(&self) -> &str;
    fn set_controller_type(&self, kind: StorageControllerType) -> Result<()>;
    fn release(self: Box<Self>) -> Result<()>;
}

pub trait Medium: Send + Sync {
    fn location(&self) -> &Path;
}

/// Handle on an asynchronous hypervisor operation.
pub trait Progress: Send {
    /// Block until the operation finishes; `None` waits forever.
    fn wait_for_completion(&self, timeout: Option<Duration>) -> Result<()>;
}

/// A progress for operations the backend performs synchronously.
#[derive(Debug, Default)]
pub struct CompletedProgress;

impl Progress for CompletedProgress {
    fn wait_for_completion(&self, _timeout: Option<Duration>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vbox_state_names_map_to_machine_state() {
        assert_eq!(MachineState::from_vbox_name("poweroff"), MachineState::PoweredOff);
        assert_eq!(MachineState::from_vbox_name("running"), MachineState::Running);
        assert_eq!(MachineState::from_vbox_name("gurumeditation"), MachineState::Stuck);
        assert_eq!(MachineState::from_vbox_name("teleporting"), MachineState::Other);
    }

    #[test]
    fn only_off_states_are_stopped() {
        assert!(MachineState::PoweredOff.is_stopped());
        assert!(MachineState::Aborted.is_stopped());
        assert!(MachineState::Saved.is_stopped());
        assert!(!MachineState::Running.is_stopped());
        assert!(!MachineState::Paused.is_stopped());
        assert!(!MachineState::Stuck.is_stopped());
    }

    #[test]
    fn deleted_property_is_empty_with_zero_timestamp() {
        let prop = GuestProperty::deleted("/VirtualBox/GuestInfo/Net/Count");
        assert_eq!(prop.name, "/VirtualBox/GuestInfo/Net/Count");
        assert_eq!(prop.value, "");
        assert_eq!(prop.timestamp, 0);
        assert_eq!(prop.flags, "");
    }

    #[test]
    fn event_kind_display_is_kebab_case() {
        assert_eq!(EventKind::GuestPropertyChanged.to_string(), "guest-property-changed");
        assert_eq!(EventKind::StateChanged.to_string(), "state-changed");
    }
}
