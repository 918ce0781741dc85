//! Guest-property observers.
//!
//! The lifecycle monitor is the only source; every registered [`Observer`]
//! is a sink and sees every change, in registration order, on the monitor
//! thread. Observers must return promptly: a slow observer delays shutdown
//! detection.

use std::sync::{Arc, RwLock};

use tracing::info;

use crate::hypervisor::GuestProperty;

/// A party interested in guest-property changes.
///
/// Deletions arrive as a property with an empty value, zero timestamp and
/// empty flags (see [`GuestProperty::deleted`]).
pub trait Observer: Send + Sync {
    fn on_guest_property_changed(&self, property: &GuestProperty);
}

/// Append-only, ordered list of observers.
#[derive(Default)]
pub struct ObserverRegistry {
    observers: RwLock<Vec<Arc<dyn Observer>>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `observer`. No uniqueness check: registering twice means being
    /// notified twice.
    pub fn register(&self, observer: Arc<dyn Observer>) {
        self.observers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(observer);
    }

    /// Deliver `property` to every observer in registration order.
    ///
    /// Works on a snapshot of the list, so an observer may register further
    /// observers; those see the next notification.
    pub fn notify(&self, property: &GuestProperty) {
        let snapshot: Vec<Arc<dyn Observer>> = self
            .observers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        for observer in &snapshot {
            observer.on_guest_property_changed(property);
        }
    }

    pub fn len(&self) -> usize {
        self.observers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Logs every guest-property change at info level.
#[derive(Debug, Default)]
pub struct LoggingObserver;

impl Observer for LoggingObserver {
    fn on_guest_property_changed(&self, property: &GuestProperty) {
        if property.timestamp == 0 && property.value.is_empty() && property.flags.is_empty() {
            info!(name = %property.name, "Guest property removed");
        } else {
            info!(
                name = %property.name,
                value = %property.value,
                timestamp = property.timestamp,
                flags = %property.flags,
                "Guest property changed"
            );
        }
    }
}
