//! Raw-device disk images.
//!
//! A raw VMDK is a small text descriptor whose single extent points at a
//! host block device, letting the hypervisor boot straight from a physical
//! disk:
//!
//! ```text
//! # Disk DescriptorFile
//! version=1
//! CID=…
//! createType="fullDevice"
//! RW 62521344 FLAT "/dev/sdb" 0
//! ```
//!
//! Creating the descriptor needs read access to the device (to size it),
//! which is why the launcher runs privileged.

use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::info;
use uuid::Uuid;

const SECTOR_SIZE: u64 = 512;
const HEADS: u64 = 16;
const SECTORS_PER_TRACK: u64 = 63;
const MAX_CYLINDERS: u64 = 16383;

/// Builds disk images wrapping a raw block device.
pub trait DiskImageBuilder: Send + Sync {
    fn create_raw_image(
        &self,
        dest: &Path,
        device: &Path,
        read_only: bool,
        relative_path: bool,
    ) -> Result<()>;
}

/// Writes monolithic flat VMDK descriptors.
#[derive(Debug, Default, Clone)]
pub struct RawVmdkBuilder;

impl DiskImageBuilder for RawVmdkBuilder {
    fn create_raw_image(
        &self,
        dest: &Path,
        device: &Path,
        read_only: bool,
        relative_path: bool,
    ) -> Result<()> {
        let size = device_size(device)?;
        if size < SECTOR_SIZE {
            bail!("device {} is smaller than one sector", device.display());
        }
        let sectors = size / SECTOR_SIZE;

        let extent = if relative_path {
            relative_to(device, dest.parent().unwrap_or_else(|| Path::new(".")))
        } else {
            device.to_path_buf()
        };

        let descriptor = render_descriptor(&extent, sectors, read_only, Uuid::new_v4());

        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create parent directory {}", parent.display()))?;
        }
        std::fs::write(dest, descriptor)
            .with_context(|| format!("write disk descriptor {}", dest.display()))?;

        info!(
            descriptor = %dest.display(),
            device = %device.display(),
            sectors,
            read_only,
            "Raw disk descriptor written"
        );
        Ok(())
    }
}

/// Size in bytes of a block device or regular file.
fn device_size(device: &Path) -> Result<u64> {
    let mut file =
        File::open(device).with_context(|| format!("open device {}", device.display()))?;
    file.seek(SeekFrom::End(0))
        .with_context(|| format!("determine size of {}", device.display()))
}

/// `target` expressed relative to `base`, falling back to `target` itself
/// when the two share no prefix.
fn relative_to(target: &Path, base: &Path) -> PathBuf {
    let target: Vec<Component<'_>> = target.components().collect();
    let base: Vec<Component<'_>> = base.components().collect();

    let common = target
        .iter()
        .zip(&base)
        .take_while(|(a, b)| a == b)
        .count();
    if common == 0 {
        return target.iter().collect();
    }

    let mut relative = PathBuf::new();
    for _ in common..base.len() {
        relative.push("..");
    }
    for component in &target[common..] {
        relative.push(component);
    }
    relative
}

fn render_descriptor(extent: &Path, sectors: u64, read_only: bool, image_id: Uuid) -> String {
    let access = if read_only { "RDONLY" } else { "RW" };
    let cid = u32::from_be_bytes([
        image_id.as_bytes()[0],
        image_id.as_bytes()[1],
        image_id.as_bytes()[2],
        image_id.as_bytes()[3],
    ]);
    let cylinders = (sectors / (HEADS * SECTORS_PER_TRACK)).clamp(1, MAX_CYLINDERS);

    format!(
        "# Disk DescriptorFile\n\
         version=1\n\
         CID={cid:08x}\n\
         parentCID=ffffffff\n\
         createType=\"fullDevice\"\n\
         \n\
         # Extent description\n\
         {access} {sectors} FLAT \"{extent}\" 0\n\
         \n\
         # The disk Data Base\n\
         #DDB\n\
         \n\
         ddb.virtualHWVersion = \"4\"\n\
         ddb.adapterType=\"ide\"\n\
         ddb.geometry.cylinders=\"{cylinders}\"\n\
         ddb.geometry.heads=\"{HEADS}\"\n\
         ddb.geometry.sectors=\"{SECTORS_PER_TRACK}\"\n\
         ddb.uuid.image=\"{image_id}\"\n\
         ddb.uuid.parent=\"00000000-0000-0000-0000-000000000000\"\n",
        extent = extent.display(),
    )
}
