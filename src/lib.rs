//! vmkeeper: provision, launch and supervise a single virtual machine.
//!
//! The [`supervisor::Supervisor`] drives one machine through its whole life on
//! top of the [`hypervisor`] traits. While the machine runs, the
//! [`monitor`] watches for shutdown and streams guest-property changes to
//! every registered [`observer::Observer`].

pub mod config;
pub mod disk;
pub mod host;
pub mod hypervisor;
pub mod logging;
pub mod monitor;
pub mod observer;
pub mod paths;
pub mod provision;
pub mod supervisor;
