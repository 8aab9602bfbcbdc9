//! What occupies the data area of a device.
//!
//! The graph engine only relies on a small capability contract of a
//! [`Format`]: its type, whether it exists, its size bounds and whether it
//! can be resized or migrated. The lifecycle methods run through the
//! [`BlockLayer`] against the device node the format lives on.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Error};
use log::debug;
use serde::{Deserialize, Serialize};

use devgraph_api::{descriptor::DiskLabelType, Size};

use crate::system::BlockLayer;

/// Largest ext3/ext4 filesystem.
const EXT_MAX_SIZE: Size = Size::from_gib(16 * 1024);

/// Largest vfat filesystem.
const VFAT_MAX_SIZE: Size = Size::from_gib(2 * 1024);

/// BIOS boot partitions never need more than this.
const BIOSBOOT_MAX_SIZE: Size = Size::from_mib(2);

const PREPBOOT_MAX_SIZE: Size = Size::from_mib(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum FormatKind {
    /// Nothing recognizable.
    None,
    DiskLabel {
        label_type: DiskLabelType,
    },
    Filesystem {
        fs_type: String,
    },
    Swap,
    Luks {
        map_name: Option<String>,
        #[serde(skip)]
        passphrase: Option<String>,
    },
    LvmPv {
        vg_name: Option<String>,
        vg_uuid: Option<String>,
        pe_start: Size,
    },
    MdMember {
        array_uuid: Option<String>,
    },
    DmRaidMember {
        sets: Vec<String>,
    },
    MultipathMember {
        alias: Option<String>,
    },
    BiosBoot,
    PrepBoot,
    Efi,
    AppleBoot,
    Unknown {
        name: String,
    },
}

/// A partition table flag implied by a format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
pub enum PartitionFlag {
    Lvm,
    Raid,
    Swap,
    BiosGrub,
    Prep,
    Esp,
    Boot,
}

impl PartitionFlag {
    /// The `sfdisk` type shortcut for this flag, if it has one.
    pub fn type_id(self) -> Option<&'static str> {
        match self {
            PartitionFlag::Lvm => Some("V"),
            PartitionFlag::Raid => Some("R"),
            PartitionFlag::Swap => Some("S"),
            PartitionFlag::Esp => Some("U"),
            PartitionFlag::BiosGrub | PartitionFlag::Prep | PartitionFlag::Boot => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Format {
    #[serde(flatten)]
    pub kind: FormatKind,
    pub exists: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mountpoint: Option<PathBuf>,
    #[serde(default)]
    pub target_size: Size,
    #[serde(default)]
    pub current_size: Size,
    /// The filesystem is to be migrated to its successor type.
    #[serde(default)]
    pub migrate: bool,
    /// Extra arguments passed to the format's creation tool.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

impl Default for Format {
    fn default() -> Self {
        Self::new(FormatKind::None)
    }
}

impl Format {
    pub fn new(kind: FormatKind) -> Self {
        Self {
            kind,
            exists: false,
            uuid: None,
            label: None,
            mountpoint: None,
            target_size: Size::ZERO,
            current_size: Size::ZERO,
            migrate: false,
            options: Vec::new(),
        }
    }

    pub fn filesystem(fs_type: &str) -> Self {
        Self::new(FormatKind::Filesystem {
            fs_type: fs_type.to_string(),
        })
    }

    pub fn disklabel(label_type: DiskLabelType) -> Self {
        Self::new(FormatKind::DiskLabel { label_type })
    }

    pub fn lvmpv() -> Self {
        Self::new(FormatKind::LvmPv {
            vg_name: None,
            vg_uuid: None,
            pe_start: Size::ZERO,
        })
    }

    pub fn mdmember() -> Self {
        Self::new(FormatKind::MdMember { array_uuid: None })
    }

    pub fn luks(passphrase: Option<String>) -> Self {
        Self::new(FormatKind::Luks {
            map_name: None,
            passphrase,
        })
    }

    pub fn with_mountpoint(mut self, mountpoint: impl Into<PathBuf>) -> Self {
        self.mountpoint = Some(mountpoint.into());
        self
    }

    pub fn existing(mut self) -> Self {
        self.exists = true;
        self
    }

    /// The type name, None for an empty format.
    pub fn type_name(&self) -> Option<&str> {
        Some(match self.kind {
            FormatKind::None => return None,
            FormatKind::DiskLabel { .. } => "disklabel",
            FormatKind::Filesystem { ref fs_type } => fs_type,
            FormatKind::Swap => "swap",
            FormatKind::Luks { .. } => "luks",
            FormatKind::LvmPv { .. } => "lvmpv",
            FormatKind::MdMember { .. } => "mdmember",
            FormatKind::DmRaidMember { .. } => "dmraidmember",
            FormatKind::MultipathMember { .. } => "multipath_member",
            FormatKind::BiosBoot => "biosboot",
            FormatKind::PrepBoot => "prepboot",
            FormatKind::Efi => "efi",
            FormatKind::AppleBoot => "appleboot",
            FormatKind::Unknown { ref name } => name,
        })
    }

    /// Like [`Format::type_name`], with `"none"` for an empty format.
    pub fn display_name(&self) -> &str {
        self.type_name().unwrap_or("none")
    }

    pub fn is_filesystem(&self) -> bool {
        matches!(
            self.kind,
            FormatKind::Filesystem { .. } | FormatKind::Efi | FormatKind::AppleBoot
        )
    }

    pub fn is_disklabel(&self) -> bool {
        matches!(self.kind, FormatKind::DiskLabel { .. })
    }

    pub fn is_luks(&self) -> bool {
        matches!(self.kind, FormatKind::Luks { .. })
    }

    pub fn is_lvmpv(&self) -> bool {
        matches!(self.kind, FormatKind::LvmPv { .. })
    }

    pub fn is_swap(&self) -> bool {
        self.kind == FormatKind::Swap
    }

    fn fs_type(&self) -> Option<&str> {
        match self.kind {
            FormatKind::Filesystem { ref fs_type } => Some(fs_type),
            FormatKind::Efi => Some("vfat"),
            FormatKind::AppleBoot => Some("hfs"),
            _ => None,
        }
    }

    pub fn mountable(&self) -> bool {
        self.fs_type().is_some()
    }

    pub fn resizable(&self) -> bool {
        self.exists && matches!(self.fs_type(), Some("ext2" | "ext3" | "ext4"))
    }

    /// The filesystem type this one migrates to.
    pub fn migration_target(&self) -> Option<&'static str> {
        match self.fs_type() {
            Some("ext2") => Some("ext3"),
            Some("ext3") => Some("ext4"),
            _ => None,
        }
    }

    pub fn migratable(&self) -> bool {
        self.exists && self.migration_target().is_some()
    }

    /// Hidden formats make their device an implementation detail of another
    /// device.
    pub fn hidden(&self) -> bool {
        matches!(
            self.kind,
            FormatKind::MultipathMember { .. } | FormatKind::DmRaidMember { .. }
        )
    }

    pub fn min_size(&self) -> Size {
        match self.kind {
            FormatKind::Efi => devgraph_api::constants::EFI_MIN_SIZE,
            _ => Size::ZERO,
        }
    }

    /// Upper bound on the size of a device carrying this format, None when
    /// unbounded.
    pub fn max_size(&self) -> Option<Size> {
        match self.kind {
            FormatKind::Efi => Some(devgraph_api::constants::EFI_MAX_SIZE),
            FormatKind::BiosBoot => Some(BIOSBOOT_MAX_SIZE),
            FormatKind::PrepBoot => Some(PREPBOOT_MAX_SIZE),
            FormatKind::Filesystem { ref fs_type } => match fs_type.as_str() {
                "ext3" | "ext4" => Some(EXT_MAX_SIZE),
                "vfat" => Some(VFAT_MAX_SIZE),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn packages(&self) -> Vec<&'static str> {
        match self.kind {
            FormatKind::Filesystem { ref fs_type } => match fs_type.as_str() {
                "ext2" | "ext3" | "ext4" => vec!["e2fsprogs"],
                "xfs" => vec!["xfsprogs"],
                "btrfs" => vec!["btrfs-progs"],
                "vfat" => vec!["dosfstools"],
                _ => vec![],
            },
            FormatKind::Efi => vec!["dosfstools"],
            FormatKind::AppleBoot => vec!["hfsplus-tools"],
            FormatKind::Luks { .. } => vec!["cryptsetup"],
            FormatKind::LvmPv { .. } => vec!["lvm2"],
            FormatKind::MdMember { .. } => vec!["mdadm"],
            FormatKind::DmRaidMember { .. } => vec!["dmraid"],
            FormatKind::MultipathMember { .. } => vec!["device-mapper-multipath"],
            _ => vec![],
        }
    }

    pub fn partition_flag(&self) -> Option<PartitionFlag> {
        match self.kind {
            FormatKind::LvmPv { .. } => Some(PartitionFlag::Lvm),
            FormatKind::MdMember { .. } => Some(PartitionFlag::Raid),
            FormatKind::Swap => Some(PartitionFlag::Swap),
            FormatKind::BiosBoot => Some(PartitionFlag::BiosGrub),
            FormatKind::PrepBoot => Some(PartitionFlag::Prep),
            FormatKind::Efi => Some(PartitionFlag::Esp),
            FormatKind::AppleBoot => Some(PartitionFlag::Boot),
            _ => None,
        }
    }

    /// The name of the mapping a LUKS format opens, once known.
    pub fn map_name(&self) -> Option<&str> {
        match self.kind {
            FormatKind::Luks { ref map_name, .. } => map_name.as_deref(),
            _ => None,
        }
    }

    pub fn status(&self, system: &dyn BlockLayer, device: &Path) -> bool {
        if !self.exists {
            return false;
        }
        match self.kind {
            FormatKind::Swap => system.swap_active(device),
            FormatKind::Luks { ref map_name, .. } => map_name
                .as_deref()
                .and_then(|name| system.dm_state(name))
                .is_some_and(|state| state.live),
            _ if self.mountable() => system.is_mounted(device),
            _ => false,
        }
    }

    pub fn setup(&self, system: &mut dyn BlockLayer, device: &Path) -> Result<(), Error> {
        if !self.exists {
            bail!("Format '{}' has not been created", self.display_name());
        }
        if self.status(system, device) {
            return Ok(());
        }
        match self.kind {
            FormatKind::Swap => system.swapon(device),
            FormatKind::Luks {
                ref map_name,
                ref passphrase,
            } => {
                let map_name = map_name.as_deref().context("LUKS format has no map name")?;
                let passphrase = passphrase
                    .as_deref()
                    .context("No passphrase available for LUKS format")?;
                system.luks_open(device, map_name, passphrase)
            }
            _ => match (self.fs_type(), self.mountpoint.as_deref()) {
                (Some(fs_type), Some(mountpoint)) => system.mount(device, mountpoint, fs_type),
                _ => Ok(()),
            },
        }
    }

    pub fn teardown(&self, system: &mut dyn BlockLayer, device: &Path) -> Result<(), Error> {
        if !self.status(system, device) {
            return Ok(());
        }
        match self.kind {
            FormatKind::Swap => system.swapoff(device),
            FormatKind::Luks {
                map_name: Some(ref map_name),
                ..
            } => system.luks_close(map_name),
            _ if self.mountable() => system.umount(device),
            _ => Ok(()),
        }
    }

    pub fn create(&mut self, system: &mut dyn BlockLayer, device: &Path) -> Result<(), Error> {
        if self.exists {
            bail!("Format '{}' already exists", self.display_name());
        }
        debug!(
            "Creating format '{}' on '{}'",
            self.display_name(),
            device.display()
        );
        match self.kind {
            FormatKind::DiskLabel { label_type } => system.create_disklabel(device, label_type)?,
            FormatKind::Swap => system.mkswap(device, self.label.as_deref())?,
            FormatKind::Luks { ref passphrase, .. } => {
                let passphrase = passphrase
                    .as_deref()
                    .context("Cannot create LUKS format without a passphrase")?;
                system.luks_format(device, passphrase)?;
            }
            FormatKind::LvmPv { .. } => system.pv_create(device)?,
            _ => {
                if let Some(fs_type) = self.fs_type() {
                    system.mkfs(device, fs_type, self.label.as_deref(), &self.options)?;
                }
            }
        }
        self.exists = true;
        Ok(())
    }

    pub fn destroy(&mut self, system: &mut dyn BlockLayer, device: &Path) -> Result<(), Error> {
        if !self.exists {
            bail!("Format '{}' has not been created", self.display_name());
        }
        if self.status(system, device) {
            bail!(
                "Format '{}' on '{}' is active",
                self.display_name(),
                device.display()
            );
        }
        match self.kind {
            FormatKind::LvmPv { .. } => system.pv_remove(device)?,
            FormatKind::MdMember { .. } => system.md_zero_superblock(device)?,
            _ => (),
        }
        system.wipe(device)?;
        self.exists = false;
        Ok(())
    }

    /// Resizes the filesystem to `target_size`.
    pub fn do_resize(&mut self, system: &mut dyn BlockLayer, device: &Path) -> Result<(), Error> {
        if !self.resizable() {
            bail!("Format '{}' is not resizable", self.display_name());
        }
        if self.target_size == self.current_size {
            return Ok(());
        }
        let fs_type = self.fs_type().unwrap_or_default().to_string();
        system.fs_resize(device, &fs_type, self.target_size)?;
        self.current_size = self.target_size;
        Ok(())
    }

    pub fn do_migrate(&mut self, system: &mut dyn BlockLayer, device: &Path) -> Result<(), Error> {
        if !self.migrate {
            return Ok(());
        }
        let (Some(from), Some(to)) = (self.fs_type(), self.migration_target()) else {
            bail!("Format '{}' cannot be migrated", self.display_name());
        };
        let from = from.to_string();
        system.fs_migrate(device, &from)?;
        self.kind = FormatKind::Filesystem {
            fs_type: to.to_string(),
        };
        self.migrate = false;
        Ok(())
    }

    /// Kickstart-style description of this format on `device`.
    pub fn ks_line(&self, device: &str) -> Option<String> {
        let target = match (self.is_swap(), self.mountpoint.as_deref()) {
            (true, _) => "swap".to_string(),
            (false, Some(mountpoint)) => mountpoint.display().to_string(),
            (false, None) => return None,
        };
        let mut line = format!(
            "part {target} --fstype={} --onpart={device}",
            self.display_name()
        );
        if let Some(ref label) = self.label {
            line.push_str(&format!(" --label={label}"));
        }
        if self.exists {
            line.push_str(" --noformat");
        }
        Some(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::system::simulated::SimulatedSystem;

    #[test]
    fn test_capabilities() {
        let ext2 = Format::filesystem("ext2").existing();
        assert!(ext2.resizable());
        assert!(ext2.migratable());
        assert_eq!(ext2.migration_target(), Some("ext3"));
        assert_eq!(ext2.max_size(), None);

        let xfs = Format::filesystem("xfs").existing();
        assert!(!xfs.resizable());
        assert!(!xfs.migratable());
        assert!(xfs.mountable());

        let pv = Format::lvmpv();
        assert_eq!(pv.type_name(), Some("lvmpv"));
        assert_eq!(pv.partition_flag(), Some(PartitionFlag::Lvm));
        assert!(!pv.mountable());

        let efi = Format::new(FormatKind::Efi);
        assert_eq!(efi.max_size(), Some(Size::from_mib(256)));
        assert_eq!(efi.min_size(), Size::from_mib(50));
        assert_eq!(efi.packages(), vec!["dosfstools"]);

        assert_eq!(Format::default().type_name(), None);
        assert_eq!(Format::default().display_name(), "none");
    }

    #[test]
    fn test_lifecycle() {
        let mut system = SimulatedSystem::default();
        let device = Path::new("/dev/sda1");

        let mut format = Format::filesystem("ext4").with_mountpoint("/data");
        assert!(format.setup(&mut system, device).is_err());
        format.create(&mut system, device).unwrap();
        assert!(format.exists);
        assert!(format.create(&mut system, device).is_err());

        format.setup(&mut system, device).unwrap();
        assert!(format.status(&system, device));
        assert!(format.destroy(&mut system, device).is_err());
        format.teardown(&mut system, device).unwrap();
        format.destroy(&mut system, device).unwrap();
        assert!(!format.exists);

        assert_eq!(
            system.calls(),
            &[
                "mkfs /dev/sda1 ext4",
                "mount /dev/sda1 /data ext4",
                "umount /dev/sda1",
                "wipe /dev/sda1",
            ]
        );
    }

    #[test]
    fn test_migrate() {
        let mut system = SimulatedSystem::default();
        let device = Path::new("/dev/sda2");

        let mut format = Format::filesystem("ext3").existing();
        format.do_migrate(&mut system, device).unwrap();
        assert_eq!(format.type_name(), Some("ext3"));

        format.migrate = true;
        format.do_migrate(&mut system, device).unwrap();
        assert_eq!(format.type_name(), Some("ext4"));
        assert!(!format.migrate);
        assert_eq!(system.calls(), &["fs_migrate /dev/sda2 ext3"]);
    }

    #[test]
    fn test_ks_line() {
        let format = Format::filesystem("ext4").with_mountpoint("/home");
        assert_eq!(
            format.ks_line("sda3").unwrap(),
            "part /home --fstype=ext4 --onpart=sda3"
        );
        assert_eq!(
            Format::new(FormatKind::Swap).existing().ks_line("sda2").unwrap(),
            "part swap --fstype=swap --onpart=sda2 --noformat"
        );
        assert_eq!(Format::lvmpv().ks_line("sda4"), None);
    }
}
