//! Enumerated block-device records consumed by device tree population.
//!
//! A descriptor is a snapshot of what the block layer reports about one
//! device node: identity, structural relations and the probed content of its
//! data area. Population never talks to the kernel directly; it only sees
//! these records.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::{
    constants::{
        DEV_DIRECTORY, DEV_MAPPER_DIRECTORY, DMRAID_MEMBER_TYPES, DM_INTERNAL_UUID_PREFIX,
        LIVE_DM_NAMES,
    },
    primitives::size::Size,
};

/// Format type strings as reported by the probe.
pub mod format_types {
    pub const LUKS: &str = "crypto_LUKS";
    pub const MD_MEMBER: &str = "linux_raid_member";
    pub const LVM_PV: &str = "LVM2_member";
    pub const MULTIPATH_MEMBER: &str = "multipath_member";
    pub const SWAP: &str = "swap";
    pub const VFAT: &str = "vfat";
    pub const HFS: &str = "hfs";
    pub const ISW_MEMBER: &str = "isw_raid_member";
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum DescriptorKind {
    /// Whole-disk block device.
    #[default]
    Disk,
    Partition,
    /// Device-mapper node.
    Dm,
    /// MD array or container.
    Md,
    Loop,
    Cdrom,
    Ram,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum DmTarget {
    #[default]
    Linear,
    Crypt,
    Multipath,
    Raid,
    Lvm,
    /// A partition mapped on top of another device-mapper device.
    Partition,
    Other,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DmInfo {
    /// Map name under `/dev/mapper`.
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,

    #[serde(default)]
    pub target: DmTarget,

    #[serde(default)]
    pub suspended: bool,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MdInfo {
    /// RAID level, e.g. `raid1` or `container`.
    pub level: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,

    /// Array name as recorded in its metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default)]
    pub devices: u32,

    /// Name of the container this array lives in, for firmware RAID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PartitionInfo {
    /// Name of the disk holding this partition.
    pub disk: String,

    pub number: u32,

    #[serde(default)]
    pub bootable: bool,

    /// Container for logical partitions on an msdos label.
    #[serde(default)]
    pub extended: bool,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LoopInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backing_file: Option<PathBuf>,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IscsiInfo {
    /// Target IQN.
    pub node: String,
    pub address: String,
    #[serde(default = "default_iscsi_port")]
    pub port: u16,
    #[serde(default)]
    pub initiator: String,
    /// Configured by firmware (iBFT).
    #[serde(default)]
    pub ibft: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reverse_username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reverse_password: Option<String>,
}

fn default_iscsi_port() -> u16 {
    3260
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FcoeInfo {
    pub nic: String,
    #[serde(default)]
    pub identifier: String,
    #[serde(default)]
    pub dcb: bool,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ZfcpInfo {
    pub hba_id: String,
    pub wwpn: String,
    pub fcp_lun: String,
}

/// DASD driver options that may be set per device.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DasdOption {
    Readonly,
    UseDiag,
    Erplog,
    Failfast,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DasdInfo {
    pub bus_id: String,
    /// Options that are switched on.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub opts: Vec<DasdOption>,
}

/// How a disk is attached.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Transport {
    #[default]
    Direct,
    Iscsi(IscsiInfo),
    Fcoe(FcoeInfo),
    Zfcp(ZfcpInfo),
    Dasd(DasdInfo),
}

#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Default,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DiskLabelType {
    #[default]
    Gpt,
    Msdos,
    Dasd,
    Mac,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LvInfo {
    /// Logical volume name, possibly bracketed for internal volumes.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default)]
    pub size: Size,
    /// `lv_attr` string as reported by `lvs`.
    #[serde(default)]
    pub attr: String,
    /// Origin volume of a snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

/// LVM metadata read from a physical volume.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LvmPvProbe {
    pub vg_name: String,
    pub vg_uuid: String,
    #[serde(default)]
    pub vg_size: Size,
    #[serde(default)]
    pub vg_free: Size,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pe_size: Option<Size>,
    #[serde(default)]
    pub pe_count: u64,
    #[serde(default)]
    pub pe_free: u64,
    #[serde(default)]
    pub pv_count: u32,
    #[serde(default)]
    pub pe_start: Size,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub lvs: Vec<LvInfo>,
}

/// MD superblock data read from an array member.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MdMemberProbe {
    /// UUID of the array this member belongs to.
    pub uuid: String,
    pub level: String,
    #[serde(default)]
    pub devices: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Device node recorded in the superblock, `/dev/md/N` or `mdN`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(default)]
    pub spare: bool,
}

/// What occupies the data area of a device.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FormatProbe {
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub fs_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lvm: Option<LvmPvProbe>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md: Option<MdMemberProbe>,
    /// Firmware RAID sets this member belongs to.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub raid_sets: Vec<String>,
    /// multipath alias of the map this member belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multipath_alias: Option<String>,
}

/// A block device as reported by enumeration.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DeviceDescriptor {
    /// Kernel name, e.g. `sda1` or `dm-3`.
    pub name: String,

    #[serde(default)]
    pub kind: DescriptorKind,

    /// Location under `/sys`. Devices without one are skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sysfs_path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub major: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minor: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<Size>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bus: Option<String>,

    /// `/dev/disk/by-*` links pointing at this device.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub symlinks: Vec<String>,

    /// Names of the devices this one is built from.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub slaves: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dm: Option<DmInfo>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md: Option<MdInfo>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<PartitionInfo>,

    #[serde(default, rename = "loop", skip_serializing_if = "Option::is_none")]
    pub loop_device: Option<LoopInfo>,

    #[serde(default)]
    pub transport: Transport,

    /// Partition table found on the device, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_table: Option<DiskLabelType>,

    #[serde(default = "default_true")]
    pub media_present: bool,

    #[serde(default)]
    pub read_only: bool,

    #[serde(default)]
    pub format: FormatProbe,
}

fn default_true() -> bool {
    true
}

impl DeviceDescriptor {
    /// Name used for the device in the tree: the map name for device-mapper
    /// nodes, the kernel name otherwise.
    pub fn device_name(&self) -> &str {
        match self.dm {
            Some(ref dm) if self.kind == DescriptorKind::Dm => &dm.name,
            _ => &self.name,
        }
    }

    pub fn path(&self) -> PathBuf {
        match self.dm {
            Some(ref dm) if self.kind == DescriptorKind::Dm => {
                PathBuf::from(DEV_MAPPER_DIRECTORY).join(&dm.name)
            }
            _ => PathBuf::from(DEV_DIRECTORY).join(&self.name),
        }
    }

    pub fn fs_type(&self) -> Option<&str> {
        self.format.fs_type.as_deref()
    }

    /// Whole-disk style node: plain disks, device-mapper and MD devices.
    pub fn is_disk(&self) -> bool {
        matches!(
            self.kind,
            DescriptorKind::Disk | DescriptorKind::Dm | DescriptorKind::Md
        )
    }

    pub fn is_partition(&self) -> bool {
        self.kind == DescriptorKind::Partition
    }

    pub fn is_cdrom(&self) -> bool {
        self.kind == DescriptorKind::Cdrom
    }

    pub fn is_loop(&self) -> bool {
        self.kind == DescriptorKind::Loop
    }

    pub fn is_ram(&self) -> bool {
        self.kind == DescriptorKind::Ram || self.name.starts_with("ram")
    }

    pub fn is_dm(&self) -> bool {
        self.kind == DescriptorKind::Dm
    }

    fn dm_target(&self) -> Option<DmTarget> {
        self.dm
            .as_ref()
            .filter(|_| self.is_dm())
            .map(|dm| dm.target)
    }

    pub fn is_dm_partition(&self) -> bool {
        self.dm_target() == Some(DmTarget::Partition)
    }

    pub fn is_dm_lvm(&self) -> bool {
        self.dm_target() == Some(DmTarget::Lvm)
    }

    pub fn is_dm_crypt(&self) -> bool {
        self.dm_target() == Some(DmTarget::Crypt)
    }

    pub fn is_dm_raid(&self) -> bool {
        self.dm_target() == Some(DmTarget::Raid)
    }

    pub fn is_dm_multipath(&self) -> bool {
        self.dm_target() == Some(DmTarget::Multipath)
    }

    /// Maps created by this tool for disk images.
    pub fn is_dm_internal(&self) -> bool {
        self.dm
            .as_ref()
            .and_then(|dm| dm.uuid.as_deref())
            .is_some_and(|uuid| uuid.starts_with(DM_INTERNAL_UUID_PREFIX))
    }

    pub fn is_dm_livecd(&self) -> bool {
        self.dm
            .as_ref()
            .is_some_and(|dm| LIVE_DM_NAMES.contains(&dm.name.as_str()))
    }

    pub fn is_md(&self) -> bool {
        self.kind == DescriptorKind::Md
    }

    pub fn is_md_container(&self) -> bool {
        self.md.as_ref().is_some_and(|md| md.level == "container")
    }

    pub fn is_multipath_member(&self) -> bool {
        self.fs_type() == Some(format_types::MULTIPATH_MEMBER)
    }

    pub fn is_lvm_pv(&self) -> bool {
        self.fs_type() == Some(format_types::LVM_PV)
    }

    pub fn is_luks(&self) -> bool {
        self.fs_type() == Some(format_types::LUKS)
    }

    pub fn is_md_member(&self) -> bool {
        match self.fs_type() {
            Some(format_types::MD_MEMBER) => true,
            Some(format_types::ISW_MEMBER) => self.format.md.is_some(),
            _ => false,
        }
    }

    pub fn is_dmraid_member(&self) -> bool {
        !self.is_md_member()
            && self
                .fs_type()
                .is_some_and(|t| DMRAID_MEMBER_TYPES.contains(&t))
    }

    /// Member of a firmware RAID set, whether driven by dmraid or mdadm.
    pub fn is_biosraid_member(&self) -> bool {
        self.fs_type()
            .is_some_and(|t| DMRAID_MEMBER_TYPES.contains(&t))
    }

    pub fn is_iscsi(&self) -> bool {
        matches!(self.transport, Transport::Iscsi(_))
    }

    pub fn is_fcoe(&self) -> bool {
        matches!(self.transport, Transport::Fcoe(_))
    }

    pub fn is_zfcp(&self) -> bool {
        matches!(self.transport, Transport::Zfcp(_))
    }

    pub fn is_dasd(&self) -> bool {
        matches!(self.transport, Transport::Dasd(_))
    }

    /// True when `spec` is one of this device's `/dev/disk/by-*` links.
    pub fn has_symlink(&self, spec: &str) -> bool {
        self.symlinks.iter().any(|l| l == spec)
    }

    /// The `/dev/disk/by-path` link, used as a user-facing hint.
    pub fn by_path(&self) -> Option<&str> {
        self.symlinks
            .iter()
            .find(|l| l.starts_with("/dev/disk/by-path/"))
            .map(String::as_str)
    }
}
