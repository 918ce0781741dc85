//! Host capability probing.
//!
//! [`HostBackend`] answers the questions the supervisor and provisioner have
//! about the machine they run on. [`PlatformHost`] is the implementation for
//! the current OS; tests substitute their own.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, info};

pub trait HostBackend: Send + Sync {
    /// Whether the hypervisor's passive event listeners work on this host.
    fn supports_passive_listener(&self) -> bool;

    /// Whether raw disk descriptors should reference the device by a path
    /// relative to the descriptor.
    fn relative_raw_image(&self) -> bool {
        false
    }

    /// Whole-disk block device to boot from.
    fn find_block_device(&self) -> Result<PathBuf>;

    fn free_memory_bytes(&self) -> Result<u64>;

    fn is_privileged(&self) -> bool;

    /// Start `executable` again with elevated privileges and wait for it.
    fn elevate_and_relaunch(&self, executable: &Path, args: &[OsString]) -> Result<()>;
}

/// [`HostBackend`] for the OS this binary was built for.
#[derive(Debug, Default, Clone)]
pub struct PlatformHost;

impl HostBackend for PlatformHost {
    fn supports_passive_listener(&self) -> bool {
        cfg!(any(target_os = "linux", target_os = "macos"))
    }

    /// Extents are written relative to the descriptor on macOS only.
    fn relative_raw_image(&self) -> bool {
        cfg!(target_os = "macos")
    }

    fn find_block_device(&self) -> Result<PathBuf> {
        let exe = std::env::current_exe()
            .and_then(|p| p.canonicalize())
            .context("Failed to determine executable path")?;
        let partition = partition_for(&exe)?;
        let disk = whole_disk(&partition);
        info!(executable = %exe.display(), partition = %partition, disk = %disk, "Found boot device");
        Ok(PathBuf::from(disk))
    }

    fn free_memory_bytes(&self) -> Result<u64> {
        let mut sys = sysinfo::System::new();
        sys.refresh_memory();
        match sys.available_memory() {
            0 => Err(anyhow!("host reported no available memory")),
            bytes => {
                debug!(bytes, "Available host memory");
                Ok(bytes)
            }
        }
    }

    fn is_privileged(&self) -> bool {
        #[cfg(unix)]
        {
            nix::unistd::geteuid().is_root()
        }
        #[cfg(not(unix))]
        {
            false
        }
    }

    fn elevate_and_relaunch(&self, executable: &Path, args: &[OsString]) -> Result<()> {
        elevate(executable, args)
    }
}

// ---------------------------------------------------------------------------
// Block device discovery
// ---------------------------------------------------------------------------

#[cfg(target_os = "linux")]
fn partition_for(path: &Path) -> Result<String> {
    let mounts = std::fs::read_to_string("/proc/mounts").context("Failed to read /proc/mounts")?;
    device_for_path(&mounts, path)
        .ok_or_else(|| anyhow!("no block device backs {}", path.display()))
}

#[cfg(target_os = "macos")]
fn partition_for(path: &Path) -> Result<String> {
    let output = Command::new("df")
        .arg(path)
        .output()
        .context("Failed to spawn `df`")?;
    if !output.status.success() {
        bail!(
            "df failed (exit {}): {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .nth(1)
        .and_then(|line| line.split_whitespace().next())
        .filter(|dev| dev.starts_with("/dev/"))
        .map(str::to_string)
        .ok_or_else(|| anyhow!("no block device backs {}", path.display()))
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn partition_for(_path: &Path) -> Result<String> {
    bail!("block device discovery is only supported on Linux and macOS")
}

/// Device of the `/proc/mounts` entry with the longest mount point that
/// contains `path`.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn device_for_path(mounts: &str, path: &Path) -> Option<String> {
    mounts
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let mount_point = unescape_mount(fields.next()?);
            Some((device, mount_point))
        })
        .filter(|(device, _)| device.starts_with("/dev/"))
        .filter(|(_, mount_point)| path.starts_with(mount_point))
        .max_by_key(|(_, mount_point)| mount_point.as_os_str().len())
        .map(|(device, _)| device.to_string())
}

/// Undo the octal escapes `/proc/mounts` uses for whitespace.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn unescape_mount(field: &str) -> PathBuf {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let code = std::str::from_utf8(&bytes[i + 1..i + 4])
                .ok()
                .and_then(|digits| u8::from_str_radix(digits, 8).ok());
            if let Some(code) = code {
                out.push(code);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    PathBuf::from(String::from_utf8_lossy(&out).into_owned())
}

/// Strip the partition suffix from a partition device path.
///
/// `/dev/sdb1` → `/dev/sdb`, `/dev/nvme0n1p2` → `/dev/nvme0n1`,
/// `/dev/mmcblk0p1` → `/dev/mmcblk0`, `/dev/disk2s1` → `/dev/disk2`.
pub fn whole_disk(partition: &str) -> String {
    let (dir, name) = partition.rsplit_once('/').unwrap_or(("", partition));

    let stripped = if let Some(rest) = name.strip_prefix("disk") {
        // macOS: disk<N>[s<M>]
        match rest.find('s') {
            Some(idx) => &name[..4 + idx],
            None => name,
        }
    } else if name.starts_with("nvme") || name.starts_with("mmcblk") || name.starts_with("loop") {
        // <base><N>p<M>
        match name.rfind('p') {
            Some(idx)
                if idx + 1 < name.len()
                    && name[idx + 1..].chars().all(|c| c.is_ascii_digit())
                    && name[..idx].ends_with(|c: char| c.is_ascii_digit()) =>
            {
                &name[..idx]
            }
            _ => name,
        }
    } else {
        name.trim_end_matches(|c: char| c.is_ascii_digit())
    };

    if dir.is_empty() && !partition.contains('/') {
        stripped.to_string()
    } else {
        format!("{dir}/{stripped}")
    }
}

// ---------------------------------------------------------------------------
// Privilege elevation
// ---------------------------------------------------------------------------

#[cfg(target_os = "linux")]
fn elevate(executable: &Path, args: &[OsString]) -> Result<()> {
    for tool in ["pkexec", "sudo"] {
        debug!(tool, "Trying privilege elevation");
        match Command::new(tool).arg(executable).args(args).status() {
            Ok(status) if status.success() => return Ok(()),
            Ok(status) => bail!("`{tool}` failed (exit {})", status.code().unwrap_or(-1)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e).with_context(|| format!("Failed to spawn `{tool}`")),
        }
    }
    bail!("neither pkexec nor sudo is available")
}

#[cfg(target_os = "macos")]
fn elevate(executable: &Path, args: &[OsString]) -> Result<()> {
    let mut command_line = shell_quote(&executable.to_string_lossy());
    for arg in args {
        command_line.push(' ');
        command_line.push_str(&shell_quote(&arg.to_string_lossy()));
    }
    let script = format!(
        "do shell script \"{}\" with administrator privileges",
        command_line.replace('\\', "\\\\").replace('"', "\\\"")
    );
    let status = Command::new("osascript")
        .args(["-e", &script])
        .status()
        .context("Failed to spawn `osascript`")?;
    if !status.success() {
        bail!("`osascript` failed (exit {})", status.code().unwrap_or(-1));
    }
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn elevate(_executable: &Path, _args: &[OsString]) -> Result<()> {
    bail!("privilege elevation is only supported on Linux and macOS")
}

#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_disk_strips_partition_suffixes() {
        assert_eq!(whole_disk("/dev/sdb1"), "/dev/sdb");
        assert_eq!(whole_disk("/dev/sda"), "/dev/sda");
        assert_eq!(whole_disk("/dev/nvme0n1p2"), "/dev/nvme0n1");
        assert_eq!(whole_disk("/dev/nvme0n1"), "/dev/nvme0n1");
        assert_eq!(whole_disk("/dev/mmcblk0p1"), "/dev/mmcblk0");
        assert_eq!(whole_disk("/dev/disk2s1"), "/dev/disk2");
        assert_eq!(whole_disk("/dev/disk2"), "/dev/disk2");
    }

    #[test]
    fn longest_mount_point_wins() {
        let mounts = "\
/dev/sda2 / ext4 rw,relatime 0 0
proc /proc proc rw 0 0
/dev/sdb1 /media/usb vfat rw 0 0
tmpfs /media/usb/tmp tmpfs rw 0 0
";
        let dev = device_for_path(mounts, Path::new("/media/usb/bin/vmkeeper"));
        assert_eq!(dev.as_deref(), Some("/dev/sdb1"));

        let dev = device_for_path(mounts, Path::new("/usr/bin/vmkeeper"));
        assert_eq!(dev.as_deref(), Some("/dev/sda2"));
    }

    #[test]
    fn mount_points_with_spaces_are_unescaped() {
        let mounts = "/dev/sdc1 /media/My\\040Stick vfat rw 0 0\n";
        let dev = device_for_path(mounts, Path::new("/media/My Stick/vmkeeper"));
        assert_eq!(dev.as_deref(), Some("/dev/sdc1"));
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }

    #[test]
    fn relative_raw_image_only_on_macos() {
        assert_eq!(PlatformHost.relative_raw_image(), cfg!(target_os = "macos"));
    }

    #[test]
    fn platform_host_reports_some_free_memory() {
        let host = PlatformHost;
        // Containers sometimes hide meminfo; only check the happy path.
        if let Ok(bytes) = host.free_memory_bytes() {
            assert!(bytes > 0);
        }
    }
}
