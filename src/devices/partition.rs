//! Partitions of a disklabel. The disk is always the first parent.

use anyhow::{bail, Context, Error};
use log::{debug, warn};

use devgraph_api::{error::DiskLabelCommitError, Size};

use crate::system::{BlockLayer, PartitionRequest, PartitionType};

use super::{DeviceId, DeviceKind, Devices};

/// Logical partitions are numbered after the four primary slots.
const FIRST_LOGICAL: u32 = 5;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionInfo {
    /// Zero until the partition has been placed on its disk.
    pub number: u32,
    pub partition_type: PartitionType,
    pub bootable: bool,
}

impl PartitionInfo {
    pub fn primary(number: u32) -> Self {
        Self {
            number,
            ..Default::default()
        }
    }

    pub fn extended(number: u32) -> Self {
        Self {
            number,
            partition_type: PartitionType::Extended,
            bootable: false,
        }
    }

    pub fn logical(number: u32) -> Self {
        Self {
            number,
            partition_type: PartitionType::Logical,
            bootable: false,
        }
    }

    pub fn is_extended(&self) -> bool {
        self.partition_type == PartitionType::Extended
    }

    pub fn is_logical(&self) -> bool {
        self.partition_type == PartitionType::Logical
    }
}

/// Kernel name of partition `number` of `disk`.
pub fn partition_name(disk: &str, number: u32) -> String {
    if disk.ends_with(|c: char| c.is_ascii_digit()) {
        format!("{disk}p{number}")
    } else {
        format!("{disk}{number}")
    }
}

fn info(devices: &Devices, id: DeviceId) -> Result<(DeviceId, PartitionInfo), Error> {
    let device = &devices[id];
    let disk = *device
        .parents
        .first()
        .with_context(|| format!("Partition '{}' has no disk", device.name))?;
    let info = device
        .as_partition()
        .cloned()
        .with_context(|| format!("Device '{}' is not a partition", device.name))?;
    Ok((disk, info))
}

/// Whether the partition lives on a DASD, whose labels cannot be resized.
pub fn on_dasd(devices: &Devices, id: DeviceId) -> bool {
    devices[id]
        .parents
        .first()
        .and_then(|disk| devices[*disk].as_disk())
        .is_some_and(|disk| disk.dasd().is_some())
}

/// Persistent by-path spec of a DASD partition.
pub fn dasd_by_path(devices: &Devices, id: DeviceId) -> Option<String> {
    let number = devices[id].as_partition()?.number;
    let disk = devices[id].parents.first()?;
    let dasd = devices[*disk].as_disk()?.dasd()?;
    Some(format!(
        "/dev/disk/by-path/ccw-{}-part{number}",
        dasd.bus_id
    ))
}

/// Picks a number for a new partition of `partition_type` on `disk`, given
/// the numbers already in use there.
pub fn next_number(used: &[u32], partition_type: PartitionType) -> u32 {
    match partition_type {
        PartitionType::Logical => used
            .iter()
            .copied()
            .max()
            .map_or(FIRST_LOGICAL, |highest| highest.max(FIRST_LOGICAL - 1) + 1),
        _ => (1..).find(|n| !used.contains(n)).unwrap_or(1),
    }
}

/// Size of an existing partition as the geometry of its disk reports it.
pub fn geometry_size(devices: &Devices, id: DeviceId, system: &dyn BlockLayer) -> Option<Size> {
    let device = &devices[id];
    let number = device.as_partition().filter(|_| device.exists)?.number;
    let disk = device.parents.first()?;
    match system.partition_size(&devices.path(*disk), number) {
        Ok(size) => size,
        Err(e) => {
            debug!("Could not read the geometry of {device}: {e:?}");
            None
        }
    }
}

/// Renumbers the logical partitions of `disk` that followed `removed`, as
/// the kernel does when a logical partition goes away.
pub fn renumber_logicals(devices: &mut Devices, members: &[DeviceId], disk: DeviceId, removed: u32) {
    let disk_name = devices[disk].name.clone();
    for member in members {
        let device = &mut devices[*member];
        if device.parents.first() != Some(&disk) {
            continue;
        }
        let DeviceKind::Partition(ref mut part) = device.kind else {
            continue;
        };
        if part.is_logical() && part.number > removed {
            part.number -= 1;
            let name = partition_name(&disk_name, part.number);
            debug!("Renaming partition '{}' to '{name}'", device.name);
            device.name = name;
        }
    }
}

/// Undoes [`renumber_logicals`]: the logical partitions of `disk` numbered
/// `restored` or higher move up one slot to make room for it again.
pub fn restore_logicals(devices: &mut Devices, members: &[DeviceId], disk: DeviceId, restored: u32) {
    let disk_name = devices[disk].name.clone();
    for member in members.iter().rev() {
        let device = &mut devices[*member];
        if device.parents.first() != Some(&disk) {
            continue;
        }
        let DeviceKind::Partition(ref mut part) = device.kind else {
            continue;
        };
        if part.is_logical() && part.number >= restored {
            part.number += 1;
            let name = partition_name(&disk_name, part.number);
            debug!("Renaming partition '{}' to '{name}'", device.name);
            device.name = name;
        }
    }
}

pub(super) fn create(
    devices: &mut Devices,
    id: DeviceId,
    system: &mut dyn BlockLayer,
) -> Result<(), Error> {
    let (disk, info) = info(devices, id)?;
    if !devices[disk].format.is_disklabel() {
        bail!(
            "Cannot create partition '{}': disk '{}' has no disklabel",
            devices[id].name,
            devices[disk].name
        );
    }
    let size = devices[id].target_size;
    let disk_size = devices.size(disk);
    if size > disk_size {
        bail!(
            "Partition '{}' of {size} does not fit on disk '{}' of {disk_size}",
            devices[id].name,
            devices[disk].name
        );
    }

    let disk_path = devices.path(disk);
    let request = PartitionRequest {
        number: info.number,
        size,
        partition_type: info.partition_type,
        bootable: info.bootable,
        type_id: devices[id]
            .format
            .partition_flag()
            .and_then(|flag| flag.type_id())
            .map(String::from),
    };
    if let Err(e) = system.add_partition(&disk_path, &request) {
        if e.downcast_ref::<DiskLabelCommitError>().is_some() {
            warn!(
                "Partition table of '{}' was not committed, rolling back partition {}",
                devices[disk].name, info.number
            );
        }
        return Err(e);
    }

    if let Some(size) = system.partition_size(&disk_path, info.number)? {
        devices[id].current_size = size;
    }
    Ok(())
}

pub(super) fn post_create(
    devices: &mut Devices,
    id: DeviceId,
    system: &mut dyn BlockLayer,
) -> Result<(), Error> {
    if devices[id].current_size.is_zero() {
        devices[id].current_size = devices[id].target_size;
    }
    if devices[id].is_extended() {
        return Ok(());
    }
    // Clear leftover signatures from whatever used to occupy this range.
    system.wipe(&devices.path(id))
}

pub(super) fn destroy(
    devices: &mut Devices,
    id: DeviceId,
    system: &mut dyn BlockLayer,
) -> Result<(), Error> {
    let (disk, info) = info(devices, id)?;
    system.remove_partition(&devices.path(disk), info.number)
}

pub(super) fn resize(
    devices: &mut Devices,
    id: DeviceId,
    system: &mut dyn BlockLayer,
) -> Result<(), Error> {
    let (disk, info) = info(devices, id)?;
    let disk_path = devices.path(disk);
    let target = devices[id].target_size;
    system.resize_partition(&disk_path, info.number, target)?;
    devices[id].current_size = system
        .partition_size(&disk_path, info.number)?
        .unwrap_or(target);
    Ok(())
}
