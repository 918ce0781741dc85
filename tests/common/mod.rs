//! Scripted in-memory hypervisor and host for integration tests.
//!
//! Every fake writes what it was asked to do into a shared [`Journal`], so
//! tests can assert on call order. Machine states, guest-property snapshots
//! and delivered events are scripted up front; the last scripted state or
//! snapshot repeats once the script runs out.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use vmkeeper::host::HostBackend;
use vmkeeper::hypervisor::{
    AccessMode, BiosSettings, CleanupMode, Console, DeviceType, Event, EventKind, EventSource,
    GuestProperty, GuestPropertyChange, Hypervisor, HypervisorError, LaunchFrontend, ListenerId,
    LockType, Machine, MachineState, MachineView, Medium, NetworkAdapterType, Progress, Result,
    Session, SharedFolder, StorageBus, StorageController, StorageControllerType, TransferMode,
};
use vmkeeper::observer::Observer;

// ---------------------------------------------------------------------------
// Journal
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    /// Index of the first entry starting with `prefix`.
    pub fn position(&self, prefix: &str) -> Option<usize> {
        self.entries().iter().position(|e| e.starts_with(prefix))
    }

    pub fn contains(&self, prefix: &str) -> bool {
        self.position(prefix).is_some()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.entries().iter().filter(|e| e.starts_with(prefix)).count()
    }

    /// Assert that entries starting with each of `prefixes` appear in order.
    pub fn assert_order(&self, prefixes: &[&str]) {
        let entries = self.entries();
        let mut from = 0;
        for prefix in prefixes {
            match entries[from..].iter().position(|e| e.starts_with(prefix)) {
                Some(offset) => from += offset + 1,
                None => panic!("`{prefix}` missing or out of order in {entries:#?}"),
            }
        }
    }
}

fn next_step<T: Clone>(queue: &Mutex<VecDeque<T>>) -> Option<T> {
    let mut queue = queue.lock().unwrap();
    if queue.len() > 1 {
        queue.pop_front()
    } else {
        queue.front().cloned()
    }
}

fn scripted_failure(what: &str) -> HypervisorError {
    HypervisorError::Other(format!("scripted {what} failure"))
}

pub fn prop(name: &str, value: &str, timestamp: i64, flags: &str) -> GuestProperty {
    GuestProperty::new(name, value, timestamp, flags)
}

// ---------------------------------------------------------------------------
// Machine
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MachineScript {
    /// `None` entries fail the query.
    states: Mutex<VecDeque<Option<MachineState>>>,
    properties: Mutex<VecDeque<Option<Vec<GuestProperty>>>>,
    state_queries: AtomicUsize,
    fail_shared_folders: AtomicBool,
    fail_storage_controller: AtomicBool,
}

#[derive(Debug, Clone)]
pub struct ScriptedMachine {
    name: String,
    label: &'static str,
    journal: Journal,
    script: Arc<MachineScript>,
}

impl ScriptedMachine {
    pub fn new(journal: &Journal) -> Self {
        Self {
            name: "vmkeeper".to_string(),
            label: "machine",
            journal: journal.clone(),
            script: Arc::default(),
        }
    }

    pub fn script_states(&self, states: impl IntoIterator<Item = Option<MachineState>>) {
        *self.script.states.lock().unwrap() = states.into_iter().collect();
    }

    pub fn script_properties(&self, snapshots: impl IntoIterator<Item = Option<Vec<GuestProperty>>>) {
        *self.script.properties.lock().unwrap() = snapshots.into_iter().collect();
    }

    pub fn fail_shared_folders(&self) {
        self.script.fail_shared_folders.store(true, Ordering::SeqCst);
    }

    pub fn fail_storage_controller(&self) {
        self.script.fail_storage_controller.store(true, Ordering::SeqCst);
    }

    pub fn state_queries(&self) -> usize {
        self.script.state_queries.load(Ordering::SeqCst)
    }

    fn with_label(&self, label: &'static str) -> Self {
        Self {
            label,
            ..self.clone()
        }
    }

    fn record(&self, entry: String) {
        self.journal.record(format!("{}.{entry}", self.label));
    }
}

impl MachineView for ScriptedMachine {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> Result<MachineState> {
        self.script.state_queries.fetch_add(1, Ordering::SeqCst);
        match next_step(&self.script.states) {
            Some(Some(state)) => Ok(state),
            Some(None) => Err(scripted_failure("state")),
            None => Ok(MachineState::Running),
        }
    }

    fn enumerate_guest_properties(&self, _patterns: &str) -> Result<Vec<GuestProperty>> {
        match next_step(&self.script.properties) {
            Some(Some(properties)) => Ok(properties),
            Some(None) => Err(scripted_failure("enumerate")),
            None => Ok(Vec::new()),
        }
    }
}

impl Machine for ScriptedMachine {
    fn set_cpu_count(&self, cpus: u32) -> Result<()> {
        self.record(format!("set_cpu_count {cpus}"));
        Ok(())
    }

    fn set_memory_size(&self, mib: u32) -> Result<()> {
        self.record(format!("set_memory_size {mib}"));
        Ok(())
    }

    fn set_vram_size(&self, mib: u32) -> Result<()> {
        self.record(format!("set_vram_size {mib}"));
        Ok(())
    }

    fn set_bios_settings(&self, bios: &BiosSettings) -> Result<()> {
        self.record(format!("set_bios_settings {bios:?}"));
        Ok(())
    }

    fn set_network_adapter_type(&self, slot: u32, kind: NetworkAdapterType) -> Result<()> {
        self.record(format!("set_network_adapter_type {slot} {kind:?}"));
        Ok(())
    }

    fn set_accelerate_3d(&self, enabled: bool) -> Result<()> {
        self.record(format!("set_accelerate_3d {enabled}"));
        Ok(())
    }

    fn set_drag_and_drop_mode(&self, mode: TransferMode) -> Result<()> {
        self.record(format!("set_drag_and_drop_mode {mode:?}"));
        Ok(())
    }

    fn set_clipboard_mode(&self, mode: TransferMode) -> Result<()> {
        self.record(format!("set_clipboard_mode {mode:?}"));
        Ok(())
    }

    fn set_extra_data(&self, key: &str, value: &str) -> Result<()> {
        self.record(format!("set_extra_data {key}={value}"));
        Ok(())
    }

    fn create_shared_folder(&self, folder: &SharedFolder) -> Result<()> {
        if self.script.fail_shared_folders.load(Ordering::SeqCst) {
            return Err(scripted_failure("shared folder"));
        }
        self.record(format!("create_shared_folder {}", folder.name));
        Ok(())
    }

    fn add_storage_controller(
        &self,
        name: &str,
        bus: StorageBus,
    ) -> Result<Box<dyn StorageController>> {
        self.record(format!("add_storage_controller {name} {bus:?}"));
        if self.script.fail_storage_controller.load(Ordering::SeqCst) {
            return Err(scripted_failure("storage controller"));
        }
        Ok(Box::new(FakeController {
            name: name.to_string(),
            journal: self.journal.clone(),
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
        self.record(format!(
            "attach_device {controller} {port} {device} {kind:?} {}",
            medium.location().display()
        ));
        Ok(())
    }

    fn save_settings(&self) -> Result<()> {
        self.record("save_settings".to_string());
        Ok(())
    }

    fn register(&self) -> Result<()> {
        self.record("register".to_string());
        Ok(())
    }

    fn launch(&self, _session: &dyn Session, frontend: LaunchFrontend) -> Result<Box<dyn Progress>> {
        self.record(format!("launch {frontend:?}"));
        Ok(Box::new(FakeProgress {
            label: "launch",
            journal: self.journal.clone(),
        }))
    }

    fn power_off(&self) -> Result<Box<dyn Progress>> {
        self.record("power_off".to_string());
        Ok(Box::new(FakeProgress {
            label: "power_off",
            journal: self.journal.clone(),
        }))
    }

    fn unregister(&self, mode: CleanupMode) -> Result<Vec<Box<dyn Medium>>> {
        self.record(format!("unregister {mode:?}"));
        Ok(vec![Box::new(FakeMedium(PathBuf::from("/fake/disk.vdi")))])
    }

    fn delete_config(&self, media: Vec<Box<dyn Medium>>) -> Result<Box<dyn Progress>> {
        self.record(format!("delete_config {}", media.len()));
        Ok(Box::new(FakeProgress {
            label: "delete_config",
            journal: self.journal.clone(),
        }))
    }

    fn release(self: Box<Self>) -> Result<()> {
        self.record("release".to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Small handles
// ---------------------------------------------------------------------------

pub struct FakeController {
    name: String,
    journal: Journal,
}

impl StorageController for FakeController {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_controller_type(&self, kind: StorageControllerType) -> Result<()> {
        self.journal.record(format!("controller.set_controller_type {kind:?}"));
        Ok(())
    }

    fn release(self: Box<Self>) -> Result<()> {
        self.journal.record("controller.release");
        Ok(())
    }
}

pub struct FakeMedium(pub PathBuf);

impl Medium for FakeMedium {
    fn location(&self) -> &Path {
        &self.0
    }
}

pub struct FakeProgress {
    label: &'static str,
    journal: Journal,
}

impl Progress for FakeProgress {
    fn wait_for_completion(&self, timeout: Option<Duration>) -> Result<()> {
        self.journal.record(format!("{}.wait {timeout:?}", self.label));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Session and console
// ---------------------------------------------------------------------------

pub struct FakeSession {
    journal: Journal,
    machine: ScriptedMachine,
    source: Option<ScriptedEventSource>,
}

impl Session for FakeSession {
    fn lock_machine(&self, machine: &dyn Machine, lock: LockType) -> Result<()> {
        self.journal
            .record(format!("session.lock {} {lock:?}", machine.name()));
        Ok(())
    }

    fn machine(&self) -> Result<Box<dyn Machine>> {
        Ok(Box::new(self.machine.with_label("session.machine")))
    }

    fn unlock_machine(&self) -> Result<()> {
        self.journal.record("session.unlock");
        Ok(())
    }

    fn console(&self) -> Result<Box<dyn Console>> {
        self.journal.record("session.console");
        Ok(Box::new(FakeConsole::new(self.source.clone())))
    }
}

pub struct FakeConsole {
    source: Option<ScriptedEventSource>,
}

impl FakeConsole {
    pub fn new(source: Option<ScriptedEventSource>) -> Self {
        Self { source }
    }

    /// A console whose event source cannot be acquired.
    pub fn without_events() -> Self {
        Self { source: None }
    }
}

impl Console for FakeConsole {
    fn event_source(&self) -> Result<Box<dyn EventSource>> {
        match &self.source {
            Some(source) => Ok(Box::new(source.clone())),
            None => Err(HypervisorError::Unsupported("event subscription")),
        }
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

pub const LISTENER: ListenerId = ListenerId(7);

#[derive(Debug, Clone, Default)]
pub struct Payload {
    pub name: Option<String>,
    pub value: Option<String>,
    pub flags: Option<String>,
}

impl GuestPropertyChange for Payload {
    fn name(&self) -> Result<String> {
        self.name.clone().ok_or(HypervisorError::Payload("name"))
    }

    fn value(&self) -> Result<String> {
        self.value.clone().ok_or(HypervisorError::Payload("value"))
    }

    fn flags(&self) -> Result<String> {
        self.flags.clone().ok_or(HypervisorError::Payload("flags"))
    }
}

#[derive(Debug, Clone)]
pub struct ScriptedEvent {
    /// `None` makes reading the kind fail.
    pub kind: Option<EventKind>,
    pub payload: Option<Payload>,
}

impl ScriptedEvent {
    pub fn of_kind(kind: EventKind) -> Self {
        Self {
            kind: Some(kind),
            payload: None,
        }
    }

    pub fn state_changed() -> Self {
        Self::of_kind(EventKind::StateChanged)
    }

    pub fn guest_property(name: &str, value: &str, flags: &str) -> Self {
        Self {
            kind: Some(EventKind::GuestPropertyChanged),
            payload: Some(Payload {
                name: Some(name.to_string()),
                value: Some(value.to_string()),
                flags: Some(flags.to_string()),
            }),
        }
    }

    pub fn undecodable_kind() -> Self {
        Self {
            kind: None,
            payload: None,
        }
    }
}

impl Event for ScriptedEvent {
    fn kind(&self) -> Result<EventKind> {
        self.kind.ok_or_else(|| scripted_failure("event kind"))
    }

    fn as_guest_property(&self) -> Option<&dyn GuestPropertyChange> {
        self.payload.as_ref().map(|p| p as &dyn GuestPropertyChange)
    }
}

#[derive(Debug, Clone)]
pub enum EventStep {
    Deliver(ScriptedEvent),
    Timeout,
    Fail,
}

#[derive(Debug, Default)]
struct SourceScript {
    steps: Mutex<VecDeque<EventStep>>,
    fail_ack: AtomicBool,
}

/// Event source replaying a fixed list of steps, then timing out forever.
#[derive(Debug, Clone)]
pub struct ScriptedEventSource {
    journal: Journal,
    script: Arc<SourceScript>,
}

impl ScriptedEventSource {
    pub fn new(journal: &Journal, steps: impl IntoIterator<Item = EventStep>) -> Self {
        let source = Self {
            journal: journal.clone(),
            script: Arc::default(),
        };
        *source.script.steps.lock().unwrap() = steps.into_iter().collect();
        source
    }

    pub fn fail_acknowledgements(&self) {
        self.script.fail_ack.store(true, Ordering::SeqCst);
    }
}

impl EventSource for ScriptedEventSource {
    fn create_listener(&self) -> Result<ListenerId> {
        self.journal.record("source.create_listener");
        Ok(LISTENER)
    }

    fn register_listener(&self, listener: ListenerId, kinds: &[EventKind], active: bool) -> Result<()> {
        let kinds: Vec<String> = kinds.iter().map(ToString::to_string).collect();
        self.journal.record(format!(
            "source.register {} [{}] active={active}",
            listener.0,
            kinds.join(",")
        ));
        Ok(())
    }

    fn get_event(&self, _listener: ListenerId, timeout: Duration) -> Result<Option<Box<dyn Event>>> {
        let step = self.script.steps.lock().unwrap().pop_front();
        match step {
            Some(EventStep::Deliver(event)) => Ok(Some(Box::new(event))),
            Some(EventStep::Fail) => Err(scripted_failure("receive")),
            Some(EventStep::Timeout) | None => {
                std::thread::sleep(timeout);
                Ok(None)
            }
        }
    }

    fn event_processed(&self, _listener: ListenerId, event: &dyn Event) -> Result<()> {
        if self.script.fail_ack.load(Ordering::SeqCst) {
            return Err(scripted_failure("acknowledge"));
        }
        let kind = event
            .kind()
            .map(|k| k.to_string())
            .unwrap_or_else(|_| "?".to_string());
        let name = event
            .as_guest_property()
            .and_then(|p| p.name().ok())
            .unwrap_or_default();
        self.journal.record(format!("source.ack {kind} {name}").trim_end().to_string());
        Ok(())
    }

    fn unregister_listener(&self, listener: ListenerId) -> Result<()> {
        self.journal.record(format!("source.unregister {}", listener.0));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Hypervisor and host
// ---------------------------------------------------------------------------

pub struct FakeHypervisor {
    pub journal: Journal,
    pub machine: ScriptedMachine,
    pub source: Option<ScriptedEventSource>,
    pub events: bool,
    pub fail_open_medium: bool,
}

impl FakeHypervisor {
    pub fn new(journal: &Journal) -> Self {
        Self {
            journal: journal.clone(),
            machine: ScriptedMachine::new(journal),
            source: None,
            events: false,
            fail_open_medium: false,
        }
    }

    pub fn with_events(mut self, source: ScriptedEventSource) -> Self {
        self.events = true;
        self.source = Some(source);
        self
    }
}

impl Hypervisor for FakeHypervisor {
    fn supports_event_subscription(&self) -> bool {
        self.events
    }

    fn open_medium(
        &self,
        location: &Path,
        device: DeviceType,
        access: AccessMode,
    ) -> Result<Box<dyn Medium>> {
        self.journal.record(format!(
            "hypervisor.open_medium {} {device:?} {access:?}",
            location.display()
        ));
        if self.fail_open_medium {
            return Err(HypervisorError::MediumNotFound(location.to_path_buf()));
        }
        Ok(Box::new(FakeMedium(location.to_path_buf())))
    }

    fn create_machine(
        &self,
        settings_dir: &Path,
        name: &str,
        os_type: &str,
    ) -> Result<Box<dyn Machine>> {
        self.journal.record(format!(
            "hypervisor.create_machine {} {name} {os_type}",
            settings_dir.display()
        ));
        Ok(Box::new(self.machine.clone()))
    }

    fn new_session(&self) -> Result<Box<dyn Session>> {
        self.journal.record("hypervisor.new_session");
        Ok(Box::new(FakeSession {
            journal: self.journal.clone(),
            machine: self.machine.clone(),
            source: self.source.clone(),
        }))
    }

    fn set_extra_data(&self, key: &str, value: &str) -> Result<()> {
        self.journal
            .record(format!("hypervisor.set_extra_data {key}={value}"));
        Ok(())
    }
}

pub struct FakeHost {
    pub passive: bool,
    pub relative_raw_image: bool,
    pub device: PathBuf,
    pub free_bytes: u64,
}

impl FakeHost {
    pub fn new(passive: bool) -> Self {
        Self {
            passive,
            relative_raw_image: false,
            device: PathBuf::from("/dev/fake"),
            free_bytes: 6 * 1024 * 1024 * 1024,
        }
    }
}

impl HostBackend for FakeHost {
    fn supports_passive_listener(&self) -> bool {
        self.passive
    }

    fn relative_raw_image(&self) -> bool {
        self.relative_raw_image
    }

    fn find_block_device(&self) -> anyhow::Result<PathBuf> {
        Ok(self.device.clone())
    }

    fn free_memory_bytes(&self) -> anyhow::Result<u64> {
        Ok(self.free_bytes)
    }

    fn is_privileged(&self) -> bool {
        true
    }

    fn elevate_and_relaunch(&self, _executable: &Path, _args: &[OsString]) -> anyhow::Result<()> {
        anyhow::bail!("tests never elevate")
    }
}

// ---------------------------------------------------------------------------
// Observers
// ---------------------------------------------------------------------------

/// Keeps every property it sees and logs `"<tag> <name>=<value>"`.
pub struct RecordingObserver {
    tag: &'static str,
    journal: Journal,
    seen: Mutex<Vec<GuestProperty>>,
}

impl RecordingObserver {
    pub fn new(tag: &'static str, journal: &Journal) -> Arc<Self> {
        Arc::new(Self {
            tag,
            journal: journal.clone(),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn seen(&self) -> Vec<GuestProperty> {
        self.seen.lock().unwrap().clone()
    }
}

impl Observer for RecordingObserver {
    fn on_guest_property_changed(&self, property: &GuestProperty) {
        self.journal
            .record(format!("{} {}={}", self.tag, property.name, property.value));
        self.seen.lock().unwrap().push(property.clone());
    }
}
