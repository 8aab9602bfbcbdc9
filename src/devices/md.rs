//! Linux software RAID arrays, firmware RAID containers and the sets
//! inside them.

use std::{path::PathBuf, str::FromStr};

use anyhow::{bail, Error};
use log::{debug, trace};

use devgraph_api::{
    constants::{
        BOOT_MOUNT_POINT, EFI_MOUNT_POINT, MD_BITMAP_MIN_SIZE, MD_BOOT_METADATA, MD_CHUNK_SIZE,
        MD_DEFAULT_METADATA, MD_SUPERBLOCK_SIZE,
    },
    error::{DeviceError, DeviceTreeError, StorageError},
    Size,
};

use crate::{
    formats::FormatKind,
    system::{BlockLayer, MdCreateRequest},
};

use super::{DeviceId, DeviceKind, Devices};

/// Array states in which the array is usable.
const RUNNING_STATES: &[&str] = &["clean", "active", "active-idle", "readonly", "read-auto"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum MdLevel {
    #[strum(serialize = "raid0")]
    Raid0,
    #[strum(serialize = "raid1")]
    Raid1,
    #[strum(serialize = "raid4")]
    Raid4,
    #[strum(serialize = "raid5")]
    Raid5,
    #[strum(serialize = "raid6")]
    Raid6,
    #[strum(serialize = "raid10")]
    Raid10,
    #[strum(serialize = "container")]
    Container,
}

impl FromStr for MdLevel {
    type Err = Error;

    /// Accepts `raid5`, `5` and the common aliases mdadm reports.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let level = s.trim().to_lowercase();
        Ok(match level.strip_prefix("raid").unwrap_or(&level) {
            "0" | "stripe" => MdLevel::Raid0,
            "1" | "mirror" => MdLevel::Raid1,
            "4" => MdLevel::Raid4,
            "5" => MdLevel::Raid5,
            "6" => MdLevel::Raid6,
            "10" => MdLevel::Raid10,
            "container" => MdLevel::Container,
            _ => bail!("Unknown RAID level '{s}'"),
        })
    }
}

impl MdLevel {
    /// Smallest number of active members the level can be built from.
    pub fn min_members(self) -> usize {
        match self {
            MdLevel::Raid0 | MdLevel::Raid1 => 2,
            MdLevel::Raid4 | MdLevel::Raid5 => 3,
            MdLevel::Raid6 | MdLevel::Raid10 => 4,
            MdLevel::Container => 1,
        }
    }

    fn number(self) -> Option<u32> {
        match self {
            MdLevel::Raid0 => Some(0),
            MdLevel::Raid1 => Some(1),
            MdLevel::Raid4 => Some(4),
            MdLevel::Raid5 => Some(5),
            MdLevel::Raid6 => Some(6),
            MdLevel::Raid10 => Some(10),
            MdLevel::Container => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MdInfo {
    pub level: MdLevel,
    /// Active members, excluding spares.
    pub member_devices: usize,
    /// Members including spares, as requested for a new array.
    pub total_devices: usize,
    /// Superblock version to create the array with.
    pub metadata: String,
    pub chunk: Size,
    pub bitmap: bool,
    /// A set inside a firmware RAID container.
    pub biosraid: bool,
}

impl MdInfo {
    pub fn new(level: MdLevel, member_devices: usize, total_devices: usize) -> Self {
        Self {
            level,
            member_devices,
            total_devices,
            metadata: MD_DEFAULT_METADATA.to_string(),
            chunk: MD_CHUNK_SIZE,
            // Bitmaps are meaningless without redundancy.
            bitmap: level != MdLevel::Raid0,
            biosraid: false,
        }
    }

    pub fn type_name(&self) -> &'static str {
        if self.level == MdLevel::Container {
            "mdcontainer"
        } else if self.biosraid {
            "mdbiosraidarray"
        } else {
            "mdarray"
        }
    }

    pub fn description(&self) -> String {
        let level = match self.level {
            MdLevel::Raid0 => "stripe".to_string(),
            MdLevel::Raid1 => "mirror".to_string(),
            level => level.to_string(),
        };
        match self.type_name() {
            "mdcontainer" => "BIOS RAID container".to_string(),
            "mdbiosraidarray" => format!("BIOS RAID set ({level})"),
            _ => format!("MDRAID set ({level})"),
        }
    }
}

/// Allocates an array over `members`. New arrays need enough members for
/// their level. A set whose first member is a container is a firmware
/// RAID set and keeps the size it was probed with.
pub fn new_array(
    devices: &mut Devices,
    name: &str,
    mut info: MdInfo,
    members: Vec<DeviceId>,
    exists: bool,
) -> Result<DeviceId, StorageError> {
    if !exists && !members.is_empty() && members.len() < info.level.min_members() {
        return Err(StorageError::new(DeviceError::InvalidConfiguration {
            name: name.to_string(),
            reason: format!(
                "a {} set requires at least {} members",
                info.level,
                info.level.min_members()
            ),
        }));
    }
    if members
        .first()
        .and_then(|first| devices[*first].as_md())
        .is_some_and(|parent| parent.level == MdLevel::Container)
    {
        info.biosraid = true;
    }

    let id = devices.add_with_parents(name, DeviceKind::MdArray(info), members);
    devices[id].exists = exists;
    devices[id].sysfs_path = Some(format!("/devices/virtual/block/{name}"));
    Ok(id)
}

fn info(devices: &Devices, id: DeviceId) -> Option<&MdInfo> {
    devices[id].as_md()
}

pub fn total_devices(devices: &Devices, id: DeviceId) -> usize {
    match info(devices, id) {
        Some(_) if devices[id].exists => devices[id].parents.len(),
        Some(info) => info.total_devices,
        None => 0,
    }
}

pub fn spares(devices: &Devices, id: DeviceId) -> usize {
    info(devices, id).map_or(0, |info| {
        total_devices(devices, id).saturating_sub(info.member_devices)
    })
}

/// Running with fewer members than it was built with.
pub fn degraded(devices: &Devices, id: DeviceId) -> bool {
    info(devices, id)
        .is_some_and(|info| devices[id].exists && devices[id].parents.len() < info.member_devices)
}

pub(super) fn array_size(devices: &Devices, id: DeviceId) -> Size {
    let device = &devices[id];
    let Some(info) = device.as_md() else {
        return Size::ZERO;
    };
    if device.parents.is_empty() {
        return Size::ZERO;
    }
    if info.biosraid || (device.exists && !device.current_size.is_zero()) {
        return device.current_size;
    }

    let smallest = device
        .parents
        .iter()
        .map(|member| devices.size(*member))
        .min()
        .unwrap_or_default()
        .saturating_sub(MD_SUPERBLOCK_SIZE);
    let n = info.member_devices as u64;
    let size = match info.level {
        MdLevel::Raid0 => (smallest * n).align_down(info.chunk),
        MdLevel::Raid1 => smallest,
        MdLevel::Raid4 | MdLevel::Raid5 => (smallest * n.saturating_sub(1)).align_down(info.chunk),
        MdLevel::Raid6 => (smallest * n.saturating_sub(2)).align_down(info.chunk),
        MdLevel::Raid10 => Size(smallest.bytes() * n / 2).align_down(info.chunk),
        MdLevel::Container => Size::ZERO,
    };
    trace!("Computed size of new {} '{}': {size}", info.level, device.name);
    size
}

pub(super) fn array_status(devices: &Devices, id: DeviceId, system: &dyn BlockLayer) -> bool {
    let Some(state) = system.md_array_state(&devices[id].name) else {
        return false;
    };
    let container = info(devices, id).is_some_and(|info| info.level == MdLevel::Container);
    // Containers stay inactive while started.
    RUNNING_STATES.contains(&state.as_str()) || (container && state == "inactive")
}

fn member_paths(devices: &Devices, id: DeviceId) -> Vec<PathBuf> {
    devices[id]
        .parents
        .iter()
        .map(|member| devices.path(*member))
        .collect()
}

pub(super) fn setup(devices: &mut Devices, id: DeviceId, system: &mut dyn BlockLayer) -> Result<(), Error> {
    let uuid = devices[id].uuid.clone().unwrap_or_default();
    system.md_assemble(&devices.path(id), &uuid, &member_paths(devices, id))
}

pub(super) fn teardown(
    devices: &mut Devices,
    id: DeviceId,
    system: &mut dyn BlockLayer,
) -> Result<(), Error> {
    // Firmware RAID never changes, so its sets are left running.
    if info(devices, id).is_some_and(|info| info.level == MdLevel::Container || info.biosraid) {
        return Ok(());
    }
    let path = devices.path(id);
    if system.node_exists(&path) {
        system.md_stop(&path)?;
    }
    Ok(())
}

pub(super) fn create(devices: &mut Devices, id: DeviceId, system: &mut dyn BlockLayer) -> Result<(), Error> {
    let Some(info) = info(devices, id).cloned() else {
        bail!("Device '{}' is not an MD array", devices[id].name);
    };
    let members = member_paths(devices, id);
    let request = MdCreateRequest {
        level: info.level.to_string(),
        spares: members.len().saturating_sub(info.member_devices),
        members,
        metadata: info.metadata,
        bitmap: info.bitmap,
    };
    system.md_create(&devices.path(id), &request)
}

pub(super) fn destroy(devices: &mut Devices, id: DeviceId, system: &mut dyn BlockLayer) -> Result<(), Error> {
    for member in devices[id].parents.clone() {
        devices.setup(member, system, true)?;
        system.md_zero_superblock(&devices.path(member))?;
    }
    Ok(())
}

/// Picks superblock and bitmap settings for a new array based on what it
/// will hold.
pub(super) fn pre_commit_fixup(devices: &mut Devices, id: DeviceId, mountpoints: &[PathBuf]) {
    let boot = if mountpoints.iter().any(|mp| mp.as_os_str() == BOOT_MOUNT_POINT) {
        BOOT_MOUNT_POINT
    } else {
        "/"
    };
    let size = devices.size(id);
    let format = &devices[id].format;
    let boot_device = format
        .mountpoint
        .as_ref()
        .is_some_and(|mp| mp.as_os_str() == boot || mp.as_os_str() == EFI_MOUNT_POINT)
        || format.kind == FormatKind::PrepBoot;
    let small = size < MD_BITMAP_MIN_SIZE || format.is_swap();

    let name = devices[id].name.clone();
    if let DeviceKind::MdArray(ref mut info) = devices[id].kind {
        // Boot loaders only read superblocks stored at the end.
        if boot_device {
            debug!("Using metadata {MD_BOOT_METADATA} for '{name}'");
            info.metadata = MD_BOOT_METADATA.to_string();
        }
        if small {
            info.bitmap = false;
        }
    }
}

/// The `mdadm.conf` line describing the array.
pub fn mdadm_conf_entry(devices: &Devices, id: DeviceId) -> Result<String, StorageError> {
    let device = &devices[id];
    let (Some(info), Some(uuid)) = (device.as_md(), device.uuid.as_deref()) else {
        return Err(StorageError::new(DeviceError::InvalidConfiguration {
            name: device.name.clone(),
            reason: "array is not fully defined".into(),
        }));
    };
    let path = devices.path(id);
    // Containers and the sets within only carry a UUID.
    match info.level.number() {
        Some(level) if !info.biosraid => Ok(format!(
            "ARRAY {} level=raid{level} num-devices={} UUID={uuid}\n",
            path.display(),
            info.member_devices
        )),
        _ => Ok(format!("ARRAY {} UUID={uuid}\n", path.display())),
    }
}

/// Extra filesystem creation arguments tuned to the stripe layout.
pub fn format_args(devices: &Devices, id: DeviceId) -> Vec<String> {
    let Some(info) = info(devices, id) else {
        return Vec::new();
    };
    let is_ext2 = matches!(
        devices[id].format.kind,
        FormatKind::Filesystem { ref fs_type } if fs_type == "ext2"
    );
    if !is_ext2 {
        return Vec::new();
    }
    let n = info.member_devices;
    let stride = match info.level {
        MdLevel::Raid4 | MdLevel::Raid5 => n.saturating_sub(1) * 16,
        MdLevel::Raid0 => n * 16,
        _ => return Vec::new(),
    };
    vec!["-R".to_string(), format!("stride={stride}")]
}

/// Adds a probed member to an existing array.
pub fn add_existing_member(devices: &mut Devices, id: DeviceId, member: DeviceId) -> Result<(), StorageError> {
    if !devices[id].exists {
        return Err(StorageError::new(DeviceError::NotCreated {
            name: devices[id].name.clone(),
        }));
    }
    let FormatKind::MdMember { ref array_uuid } = devices[member].format.kind else {
        return Err(StorageError::new(DeviceError::InvalidConfiguration {
            name: devices[member].name.clone(),
            reason: "not an MD member".into(),
        }));
    };
    if devices[id].uuid.is_some() && *array_uuid != devices[id].uuid {
        return Err(StorageError::new(DeviceError::InvalidConfiguration {
            name: devices[id].name.clone(),
            reason: format!("member '{}' has a different array UUID", devices[member].name),
        }));
    }
    if devices[id].parents.contains(&member) {
        return Err(StorageError::new(DeviceTreeError::DuplicateMember {
            name: devices[id].name.clone(),
            member: devices[member].name.clone(),
        }));
    }
    devices[id].parents.push(member);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use devgraph_api::error::ErrorKind;

    use crate::{
        devices::{DiskInfo, PartitionInfo},
        formats::Format,
        system::simulated::SimulatedSystem,
    };

    fn members(devices: &mut Devices, count: u32, mib: u64) -> Vec<DeviceId> {
        let disk = devices.add("sda", DeviceKind::Disk(DiskInfo::default()));
        devices[disk].exists = true;
        devices[disk].target_size = Size::from_gib(16);
        (1..=count)
            .map(|n| {
                let part = devices.add_with_parents(
                    format!("sda{n}"),
                    DeviceKind::Partition(PartitionInfo::primary(n)),
                    vec![disk],
                );
                devices[part].target_size = Size::from_mib(mib);
                devices[part].format = Format::mdmember();
                part
            })
            .collect()
    }

    #[test]
    fn test_levels() {
        assert_eq!("raid5".parse::<MdLevel>().unwrap(), MdLevel::Raid5);
        assert_eq!("1".parse::<MdLevel>().unwrap(), MdLevel::Raid1);
        assert_eq!("container".parse::<MdLevel>().unwrap(), MdLevel::Container);
        assert!("raid7".parse::<MdLevel>().is_err());
        assert_eq!(MdLevel::Raid10.to_string(), "raid10");
        assert_eq!(
            MdInfo::new(MdLevel::Raid1, 2, 2).description(),
            "MDRAID set (mirror)"
        );
    }

    #[test]
    fn test_sizes() {
        let mut devices = Devices::new();
        let parts = members(&mut devices, 4, 1000);

        let raid5 = new_array(
            &mut devices,
            "md0",
            MdInfo::new(MdLevel::Raid5, 4, 4),
            parts.clone(),
            false,
        )
        .unwrap();
        assert_eq!(devices.size(raid5), Size::from_mib(2994));
        assert_eq!(devices[raid5].type_name(), "mdarray");

        let raid1 = new_array(
            &mut devices,
            "md1",
            MdInfo::new(MdLevel::Raid1, 2, 2),
            parts[..2].to_vec(),
            false,
        )
        .unwrap();
        assert_eq!(devices.size(raid1), Size::from_mib(998));

        let raid10 = new_array(
            &mut devices,
            "md2",
            MdInfo::new(MdLevel::Raid10, 4, 4),
            parts.clone(),
            false,
        )
        .unwrap();
        assert_eq!(devices.size(raid10), Size::from_mib(1996));

        let raid6 = new_array(
            &mut devices,
            "md3",
            MdInfo::new(MdLevel::Raid6, 4, 4),
            parts.clone(),
            false,
        )
        .unwrap();
        assert_eq!(devices.size(raid6), Size::from_mib(1996));

        let e = new_array(
            &mut devices,
            "md4",
            MdInfo::new(MdLevel::Raid5, 2, 2),
            parts[..2].to_vec(),
            false,
        )
        .unwrap_err();
        assert!(matches!(
            e.kind(),
            ErrorKind::Device(DeviceError::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn test_biosraid_set() {
        let mut devices = Devices::new();
        let parts = members(&mut devices, 2, 1000);
        let container = new_array(
            &mut devices,
            "imsm0",
            MdInfo::new(MdLevel::Container, 2, 2),
            parts,
            true,
        )
        .unwrap();
        let set = new_array(
            &mut devices,
            "md126",
            MdInfo::new(MdLevel::Raid1, 2, 2),
            vec![container],
            true,
        )
        .unwrap();
        devices[set].current_size = Size::from_mib(990);
        devices[set].uuid = Some("abcd".into());

        assert_eq!(devices[container].type_name(), "mdcontainer");
        assert_eq!(devices[set].type_name(), "mdbiosraidarray");
        assert!(devices[set].is_disk());
        assert_eq!(devices.size(set), Size::from_mib(990));
        assert_eq!(
            mdadm_conf_entry(&devices, set).unwrap(),
            "ARRAY /dev/md126 UUID=abcd\n"
        );

        // Sets in a container are never stopped.
        let mut system = SimulatedSystem::default();
        teardown(&mut devices, set, &mut system).unwrap();
        assert!(system.calls().is_empty());
    }

    #[test]
    fn test_conf_entry_and_spares() {
        let mut devices = Devices::new();
        let parts = members(&mut devices, 3, 1000);
        let array = new_array(
            &mut devices,
            "md0",
            MdInfo::new(MdLevel::Raid1, 2, 3),
            parts.clone(),
            false,
        )
        .unwrap();
        assert_eq!(spares(&devices, array), 1);
        assert!(mdadm_conf_entry(&devices, array).is_err());

        devices[array].uuid = Some("1234".into());
        assert_eq!(
            mdadm_conf_entry(&devices, array).unwrap(),
            "ARRAY /dev/md0 level=raid1 num-devices=2 UUID=1234\n"
        );

        devices[array].exists = true;
        devices[array].parents.pop();
        devices[array].parents.pop();
        assert_eq!(total_devices(&devices, array), 1);
        assert!(degraded(&devices, array));
    }

    #[test]
    fn test_pre_commit_fixup() {
        let mut devices = Devices::new();
        let parts = members(&mut devices, 2, 2000);
        let boot = new_array(
            &mut devices,
            "md0",
            MdInfo::new(MdLevel::Raid1, 2, 2),
            parts.clone(),
            false,
        )
        .unwrap();
        devices[boot].format = Format::filesystem("ext4").with_mountpoint("/");
        let swap = new_array(
            &mut devices,
            "md1",
            MdInfo::new(MdLevel::Raid1, 2, 2),
            parts,
            false,
        )
        .unwrap();
        devices[swap].format = Format::new(FormatKind::Swap);

        let mountpoints = vec![PathBuf::from("/")];
        devices.pre_commit_fixup(boot, &mountpoints);
        devices.pre_commit_fixup(swap, &mountpoints);
        let info = devices[boot].as_md().unwrap();
        assert_eq!(info.metadata, "1.0");
        assert!(info.bitmap);
        let info = devices[swap].as_md().unwrap();
        assert_eq!(info.metadata, "1.1");
        assert!(!info.bitmap);

        // With a separate /boot the root array keeps the default metadata.
        devices[boot].kind = DeviceKind::MdArray(MdInfo::new(MdLevel::Raid1, 2, 2));
        devices.pre_commit_fixup(boot, &[PathBuf::from("/"), PathBuf::from("/boot")]);
        assert_eq!(devices[boot].as_md().unwrap().metadata, "1.1");
    }

    #[test]
    fn test_lifecycle() {
        let mut system = SimulatedSystem::default();
        let mut devices = Devices::new();
        let parts = members(&mut devices, 3, 1000);
        for part in &parts {
            devices[*part].exists = true;
        }
        let array = new_array(
            &mut devices,
            "md0",
            MdInfo::new(MdLevel::Raid5, 3, 3),
            parts,
            false,
        )
        .unwrap();
        devices.create(array, &mut system, None).unwrap();
        assert_eq!(
            system.calls(),
            &["md_create /dev/md0 raid5 3 metadata=1.1 bitmap=true"]
        );
        assert!(devices.status(array, &system));

        system.clear_calls();
        devices.teardown(array, &mut system, false).unwrap();
        assert_eq!(system.calls(), &["md_stop /dev/md0"]);
        assert!(!devices.status(array, &system));
    }

    #[test]
    fn test_format_args() {
        let mut devices = Devices::new();
        let parts = members(&mut devices, 3, 1000);
        let array = new_array(
            &mut devices,
            "md0",
            MdInfo::new(MdLevel::Raid5, 3, 3),
            parts,
            false,
        )
        .unwrap();
        assert!(format_args(&devices, array).is_empty());
        devices[array].format = Format::filesystem("ext2");
        assert_eq!(format_args(&devices, array), vec!["-R", "stride=32"]);
    }
}
