//! Launch configuration.
//!
//! Configuration is read from one or more TOML files. Files are layered in
//! the order given: a key in a later file replaces the same key from an
//! earlier one, and tables (such as `shared_folders`) merge recursively.
//! Every key is optional.
//!
//! ```toml
//! data_path = "/var/lib/vmkeeper"
//! disk_type = "raw"          # or "vdi"
//! disk_location = ""         # required for "vdi"
//! distro_type = "Ubuntu_64"
//! cpus = 0                   # 0 = half of the host CPUs
//! ram = 0                    # MiB, 0 = two thirds of free memory
//! min_ram = 1024
//! host_key = ""
//! menubar = false
//! strict_monitor = false
//!
//! [shared_folders.home]
//! path = "/home/user"
//! persistent = true
//! automount = true
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::paths::{AppPaths, fallback_data_dir};

/// Where the machine's hard disk comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskType {
    /// Boot the host block device the launcher itself lives on.
    Raw,
    /// Use an existing disk image at `disk_location`.
    Vdi,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SharedFolderConfig {
    pub path: PathBuf,
    pub persistent: bool,
    pub automount: bool,
}

/// Root configuration. Every visual and hardware knob lives here.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct LaunchConfig {
    pub data_path: PathBuf,
    pub disk_type: DiskType,
    pub disk_location: Option<PathBuf>,
    pub distro_type: String,
    pub cpus: i64,
    pub ram: i64,
    pub min_ram: i64,
    pub host_key: String,
    pub menubar: bool,
    pub strict_monitor: bool,
    pub shared_folders: BTreeMap<String, SharedFolderConfig>,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            data_path: AppPaths::resolve()
                .map(|paths| paths.data)
                .unwrap_or_else(fallback_data_dir),
            disk_type: DiskType::Raw,
            disk_location: None,
            distro_type: "Ubuntu_64".to_string(),
            cpus: 0,
            ram: 0,
            min_ram: 1024,
            host_key: String::new(),
            menubar: false,
            strict_monitor: false,
            shared_folders: BTreeMap::new(),
        }
    }
}

impl LaunchConfig {
    /// Layer `files` in order. With no files, `default_file` is used when
    /// given; with neither, the built-in defaults apply.
    pub fn load(files: &[PathBuf], default_file: Option<&Path>) -> Result<Self> {
        let files: Vec<&Path> = if files.is_empty() {
            default_file.into_iter().collect()
        } else {
            files.iter().map(PathBuf::as_path).collect()
        };

        let mut merged = toml::Table::new();
        for file in &files {
            let text = std::fs::read_to_string(file)
                .with_context(|| format!("read config file {}", file.display()))?;
            let table: toml::Table = text
                .parse()
                .with_context(|| format!("parse config file {}", file.display()))?;
            debug!(file = %file.display(), keys = table.len(), "Loaded config layer");
            merge_tables(&mut merged, table);
        }

        let config: Self = toml::Value::Table(merged)
            .try_into()
            .context("invalid configuration")?;
        config.validate()?;

        info!(
            files = files.len(),
            data_path = %config.data_path.display(),
            disk_type = ?config.disk_type,
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Parse a single TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).context("invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.disk_type == DiskType::Vdi
            && self
                .disk_location
                .as_deref()
                .is_none_or(|p| p.as_os_str().is_empty())
        {
            bail!("disk_type \"vdi\" requires disk_location");
        }
        if self.min_ram < 0 {
            bail!("min_ram must not be negative (got {})", self.min_ram);
        }
        Ok(())
    }
}

/// Recursively merge `overlay` into `base`; overlay wins on conflicts.
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}
