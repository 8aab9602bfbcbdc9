//! LVM volume groups and logical volumes.
//!
//! A volume group's parents are its physical volumes; a logical volume has
//! exactly one parent, its volume group. The group also tracks its logical
//! volumes by id so free space can be computed before anything is created.

use anyhow::{Context, Error};
use log::{debug, trace};

use devgraph_api::{
    constants::LVM_PE_SIZE,
    error::{DeviceError, StorageError},
    Size,
};

use crate::{formats::FormatKind, system::BlockLayer};

use super::{dm, DeviceId, DeviceKind, Devices};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeGroupInfo {
    pub pe_size: Size,
    /// Number of physical volumes the group is made of, as recorded in its
    /// metadata.
    pub pv_count: usize,
    /// Another group with the same name but a different UUID was seen.
    pub has_duplicate: bool,
    pub lvs: Vec<DeviceId>,
    /// Space held by snapshots with a virtual origin, by snapshot name.
    pub vorigin_snapshots: Vec<(String, Size)>,
}

impl Default for VolumeGroupInfo {
    fn default() -> Self {
        Self {
            pe_size: LVM_PE_SIZE,
            pv_count: 0,
            has_duplicate: false,
            lvs: Vec::new(),
            vorigin_snapshots: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalVolumeInfo {
    /// Name within the group.
    pub lv_name: String,
    pub stripes: u64,
    pub log_size: Size,
    pub snapshot_space: Size,
    /// Allocate the whole volume from one physical volume.
    pub single_pv: bool,
}

impl LogicalVolumeInfo {
    pub fn new(lv_name: impl Into<String>) -> Self {
        Self {
            lv_name: lv_name.into(),
            stripes: 1,
            log_size: Size::ZERO,
            snapshot_space: Size::ZERO,
            single_pv: false,
        }
    }
}

/// Device-mapper name of a volume group. LVM doubles dashes in map names.
pub fn vg_map_name(vg: &str) -> String {
    vg.replace('-', "--")
}

pub fn lv_map_name(vg: &str, lv: &str) -> String {
    format!("{}-{}", vg_map_name(vg), lv.replace('-', "--"))
}

fn vg_info(devices: &Devices, vg: DeviceId) -> Option<&VolumeGroupInfo> {
    devices[vg].as_volume_group()
}

fn vg_info_mut(devices: &mut Devices, vg: DeviceId) -> Result<&mut VolumeGroupInfo, StorageError> {
    match devices[vg].kind {
        DeviceKind::VolumeGroup(ref mut info) => Ok(info),
        _ => Err(StorageError::internal("Device is not a volume group")),
    }
}

fn pe_size(devices: &Devices, vg: DeviceId) -> Size {
    vg_info(devices, vg).map_or(LVM_PE_SIZE, |info| info.pe_size)
}

fn pe_start(devices: &Devices, pv: DeviceId) -> Size {
    match devices[pv].format.kind {
        FormatKind::LvmPv { pe_start, .. } => pe_start,
        _ => Size::ZERO,
    }
}

/// Usable size of a volume group: each physical volume past its metadata
/// area, in whole extents.
pub(super) fn vg_size(devices: &Devices, vg: DeviceId) -> Size {
    let pe = pe_size(devices, vg);
    devices[vg]
        .parents
        .iter()
        .map(|pv| {
            devices
                .size(*pv)
                .saturating_sub(pe_start(devices, *pv))
                .align_down(pe)
        })
        .sum()
}

/// Space taken by snapshots, each rounded up to whole extents.
pub fn vg_snapshot_space(devices: &Devices, vg: DeviceId) -> Size {
    let Some(info) = vg_info(devices, vg) else {
        return Size::ZERO;
    };
    let pe = info.pe_size;
    let lv_snapshots: Size = info
        .lvs
        .iter()
        .filter_map(|lv| devices[*lv].as_logical_volume())
        .map(|lv| lv.snapshot_space.align_up(pe))
        .sum();
    let vorigin: Size = info
        .vorigin_snapshots
        .iter()
        .map(|(_, size)| size.align_up(pe))
        .sum();
    lv_snapshots + vorigin
}

/// Free extents of the group. Mirror images and logs count against it.
pub fn vg_free_space(devices: &Devices, vg: DeviceId) -> Size {
    let size = devices.size(vg);
    let used: Size = vg_info(devices, vg)
        .map(|info| info.lvs.iter().map(|lv| lv_allocated(devices, *lv)).sum())
        .unwrap_or_default();
    let free = size.saturating_sub(used + vg_snapshot_space(devices, vg));
    trace!("Volume group '{}' of {size} has {free} free", devices[vg].name);
    free
}

/// Space a logical volume takes from its group, including mirrors, log and
/// snapshots.
pub fn lv_space_used(devices: &Devices, lv: DeviceId) -> Size {
    match devices[lv].as_logical_volume() {
        Some(info) => lv_allocated(devices, lv) + info.snapshot_space,
        None => Size::ZERO,
    }
}

/// Extents held by the volume itself: every mirror image plus the log.
/// Snapshots are accounted for by the group.
fn lv_allocated(devices: &Devices, lv: DeviceId) -> Size {
    devices[lv]
        .as_logical_volume()
        .map_or(Size::ZERO, |info| allocation(info, devices.size(lv)))
}

fn allocation(info: &LogicalVolumeInfo, size: Size) -> Size {
    size * info.stripes + info.log_size
}

/// Largest size the volume can take in its group.
pub(super) fn lv_max_size(devices: &Devices, lv: DeviceId) -> Option<Size> {
    let vg = devices[lv].parents.first()?;
    let info = devices[lv].as_logical_volume()?;
    let room = (vg_free_space(devices, *vg) + lv_allocated(devices, lv)).saturating_sub(info.log_size);
    Some(Size(room.bytes() / info.stripes.max(1)))
}

/// All of the group's physical volumes are present and no other group
/// claims its name.
pub fn vg_complete(devices: &Devices, vg: DeviceId) -> bool {
    let Some(info) = vg_info(devices, vg) else {
        return false;
    };
    if info.has_duplicate {
        return false;
    }
    devices[vg].parents.len() == info.pv_count || !devices[vg].exists
}

pub(super) fn vg_status(devices: &Devices, vg: DeviceId, system: &dyn BlockLayer) -> bool {
    if let Some(info) = vg_info(devices, vg) {
        if info.lvs.iter().any(|lv| devices.status(*lv, system)) {
            return true;
        }
    }
    if devices[vg]
        .parents
        .iter()
        .any(|pv| !devices.status(*pv, system))
    {
        return false;
    }
    vg_complete(devices, vg)
}

pub(super) fn pre_setup(devices: &Devices, vg: DeviceId) -> Result<(), StorageError> {
    if devices[vg].exists && !vg_complete(devices, vg) {
        return Err(StorageError::new(DeviceError::MissingPhysicalVolumes {
            name: devices[vg].name.clone(),
        }));
    }
    Ok(())
}

/// Adds a probed physical volume to an existing group. Returns whether the
/// group is complete afterwards.
pub fn vg_add_existing_pv(
    devices: &mut Devices,
    vg: DeviceId,
    pv: DeviceId,
) -> Result<bool, StorageError> {
    if !devices[vg].exists {
        return Err(StorageError::new(DeviceError::NotCreated {
            name: devices[vg].name.clone(),
        }));
    }
    let FormatKind::LvmPv { ref vg_uuid, .. } = devices[pv].format.kind else {
        return Err(StorageError::new(DeviceError::InvalidConfiguration {
            name: devices[pv].name.clone(),
            reason: "not a physical volume".into(),
        }));
    };
    let mismatch = devices[vg].uuid.is_some() && *vg_uuid != devices[vg].uuid;
    if devices[vg].parents.contains(&pv) {
        return Err(StorageError::new(
            devgraph_api::error::DeviceTreeError::DuplicateMember {
                name: devices[vg].name.clone(),
                member: devices[pv].name.clone(),
            },
        ));
    }
    if mismatch {
        // Keep the member so the duplicate can be resolved later.
        debug!(
            "Physical volume '{}' belongs to another group named '{}'",
            devices[pv].name, devices[vg].name
        );
        vg_info_mut(devices, vg)?.has_duplicate = true;
    }
    devices[vg].parents.push(pv);
    Ok(vg_complete(devices, vg))
}

/// Adds a physical volume to a group that has not been created yet.
pub fn vg_add_pv(devices: &mut Devices, vg: DeviceId, pv: DeviceId) -> Result<(), StorageError> {
    if devices[vg].exists {
        return Err(StorageError::new(DeviceError::InvalidConfiguration {
            name: devices[vg].name.clone(),
            reason: "cannot add a physical volume to an existing volume group".into(),
        }));
    }
    if devices[vg].parents.contains(&pv) {
        return Err(StorageError::new(
            devgraph_api::error::DeviceTreeError::DuplicateMember {
                name: devices[vg].name.clone(),
                member: devices[pv].name.clone(),
            },
        ));
    }
    devices[vg].parents.push(pv);
    let count = devices[vg].parents.len();
    vg_info_mut(devices, vg)?.pv_count = count;
    Ok(())
}

/// Removes a physical volume from a group that has not been created yet.
pub fn vg_remove_pv(devices: &mut Devices, vg: DeviceId, pv: DeviceId) -> Result<(), StorageError> {
    if devices[vg].exists {
        return Err(StorageError::new(DeviceError::InvalidConfiguration {
            name: devices[vg].name.clone(),
            reason: "cannot remove a physical volume from an existing volume group".into(),
        }));
    }
    let Some(position) = devices[vg].parents.iter().position(|p| *p == pv) else {
        return Err(StorageError::new(DeviceError::InvalidConfiguration {
            name: devices[vg].name.clone(),
            reason: format!("'{}' is not a member", devices[pv].name),
        }));
    };
    devices[vg].parents.remove(position);
    let count = devices[vg].parents.len();
    vg_info_mut(devices, vg)?.pv_count = count;
    Ok(())
}

/// Allocates a logical volume in `vg`. A new volume must fit in the
/// group's free space unless the group can still grow.
pub fn add_logical_volume(
    devices: &mut Devices,
    vg: DeviceId,
    info: LogicalVolumeInfo,
    size: Size,
    exists: bool,
) -> Result<DeviceId, StorageError> {
    if vg_info(devices, vg).is_none() {
        return Err(StorageError::internal("Logical volume parent is not a volume group"));
    }
    let free = vg_free_space(devices, vg);
    let needed = allocation(&info, size);
    if !exists && !devices.growable(vg) && needed > free {
        return Err(StorageError::new(DeviceError::InsufficientSpace {
            name: devices[vg].name.clone(),
            requested: needed,
            available: free,
        }));
    }

    let name = format!("{}-{}", devices[vg].name, info.lv_name);
    debug!("Adding '{name}' of {size} to '{}'", devices[vg].name);
    let lv = devices.add_with_parents(name, DeviceKind::LogicalVolume(info), vec![vg]);
    devices[lv].exists = exists;
    devices[lv].target_size = size;
    if exists {
        devices[lv].current_size = size;
    }
    vg_info_mut(devices, vg)?.lvs.push(lv);
    Ok(lv)
}

pub fn remove_logical_volume(devices: &mut Devices, vg: DeviceId, lv: DeviceId) -> Result<(), StorageError> {
    let info = vg_info_mut(devices, vg)?;
    info.lvs.retain(|id| *id != lv);
    Ok(())
}

/// Aligns a requested size down to whole extents and checks it fits.
pub(super) fn check_lv_size(devices: &Devices, lv: DeviceId, size: Size) -> Result<Size, StorageError> {
    let Some(vg) = devices[lv].parents.first().copied() else {
        return Err(StorageError::internal("Logical volume has no volume group"));
    };
    let size = size.align_down(pe_size(devices, vg));
    let needed = devices[lv]
        .as_logical_volume()
        .map_or(size, |info| allocation(info, size));
    let available = vg_free_space(devices, vg) + lv_allocated(devices, lv);
    if needed > available {
        debug!(
            "Cannot set size of '{}': {} short",
            devices[lv].name,
            needed.saturating_sub(available)
        );
        return Err(StorageError::new(DeviceError::InsufficientSpace {
            name: devices[vg].name.clone(),
            requested: needed,
            available,
        }));
    }
    Ok(size)
}

fn lv_names(devices: &Devices, lv: DeviceId) -> Result<(String, String), Error> {
    let vg = devices[lv]
        .parents
        .first()
        .with_context(|| format!("Logical volume '{}' has no volume group", devices[lv].name))?;
    let info = devices[lv]
        .as_logical_volume()
        .with_context(|| format!("Device '{}' is not a logical volume", devices[lv].name))?;
    Ok((devices[*vg].name.clone(), info.lv_name.clone()))
}

pub(super) fn vg_create(
    devices: &mut Devices,
    vg: DeviceId,
    system: &mut dyn BlockLayer,
) -> Result<(), Error> {
    let pvs: Vec<_> = devices[vg].parents.iter().map(|pv| devices.path(*pv)).collect();
    system.vg_create(&devices[vg].name, pe_size(devices, vg), &pvs)
}

pub(super) fn vg_destroy(
    devices: &mut Devices,
    vg: DeviceId,
    system: &mut dyn BlockLayer,
) -> Result<(), Error> {
    let name = devices[vg].name.clone();
    system.vg_reduce_missing(&name)?;
    system.vg_remove(&name)
}

pub(super) fn lv_setup(
    devices: &mut Devices,
    lv: DeviceId,
    system: &mut dyn BlockLayer,
) -> Result<(), Error> {
    let (vg, name) = lv_names(devices, lv)?;
    system.lv_activate(&vg, &name, true)
}

pub(super) fn lv_teardown(
    devices: &mut Devices,
    lv: DeviceId,
    system: &mut dyn BlockLayer,
) -> Result<(), Error> {
    let (vg, name) = lv_names(devices, lv)?;
    system.lv_activate(&vg, &name, false)
}

pub(super) fn lv_create(
    devices: &mut Devices,
    lv: DeviceId,
    system: &mut dyn BlockLayer,
) -> Result<(), Error> {
    let (vg, name) = lv_names(devices, lv)?;
    let size = devices.size(lv);
    let single_pv = devices[lv]
        .as_logical_volume()
        .is_some_and(|info| info.single_pv);

    let pvs = if single_pv {
        let pv = system
            .pv_free(&vg)?
            .into_iter()
            .find(|(_, free)| *free >= size)
            .map(|(pv, _)| pv);
        match pv {
            Some(pv) => vec![pv],
            None => {
                return Err(StorageError::new(DeviceError::SinglePhysicalVolume {
                    name: vg,
                    requested: size,
                })
                .into())
            }
        }
    } else {
        Vec::new()
    };
    system.lv_create(&vg, &name, size, &pvs)
}

pub(super) fn lv_destroy(
    devices: &mut Devices,
    lv: DeviceId,
    system: &mut dyn BlockLayer,
) -> Result<(), Error> {
    let (vg, name) = lv_names(devices, lv)?;
    system.lv_remove(&vg, &name)
}

pub(super) fn lv_resize(
    devices: &mut Devices,
    lv: DeviceId,
    system: &mut dyn BlockLayer,
) -> Result<(), Error> {
    let (vg, name) = lv_names(devices, lv)?;
    system.lv_resize(&vg, &name, devices[lv].target_size)
}

/// Whether the volume's map is loaded.
pub fn lv_active(devices: &Devices, lv: DeviceId, system: &dyn BlockLayer) -> bool {
    dm::map_active(devices, lv, system)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::PathBuf;

    use devgraph_api::error::ErrorKind;

    use crate::{
        devices::{DiskInfo, PartitionInfo},
        formats::Format,
        system::simulated::SimulatedSystem,
    };

    /// Three 1000M physical volumes with a 1M metadata area each.
    fn volume_group(devices: &mut Devices) -> (DeviceId, Vec<DeviceId>) {
        let disk = devices.add("sda", DeviceKind::Disk(DiskInfo::default()));
        devices[disk].exists = true;
        devices[disk].target_size = Size::from_gib(4);
        let pvs: Vec<DeviceId> = (1..=3)
            .map(|n| {
                let pv = devices.add_with_parents(
                    format!("sda{n}"),
                    DeviceKind::Partition(PartitionInfo::primary(n)),
                    vec![disk],
                );
                devices[pv].target_size = Size::from_mib(1000);
                devices[pv].format = Format::new(FormatKind::LvmPv {
                    vg_name: None,
                    vg_uuid: None,
                    pe_start: Size::from_mib(1),
                });
                pv
            })
            .collect();
        let vg = devices.add("vg-data", DeviceKind::VolumeGroup(VolumeGroupInfo::default()));
        for pv in &pvs {
            vg_add_pv(devices, vg, *pv).unwrap();
        }
        (vg, pvs)
    }

    #[test]
    fn test_names() {
        assert_eq!(vg_map_name("vg-data"), "vg--data");
        assert_eq!(lv_map_name("vg-data", "my-root"), "vg--data-my--root");

        let mut devices = Devices::new();
        let (vg, _) = volume_group(&mut devices);
        let lv = add_logical_volume(
            &mut devices,
            vg,
            LogicalVolumeInfo::new("root"),
            Size::from_mib(100),
            false,
        )
        .unwrap();
        assert_eq!(devices[lv].name, "vg-data-root");
        assert_eq!(
            devices.path(lv),
            PathBuf::from("/dev/mapper/vg--data-root")
        );
        assert_eq!(devices.path(vg), PathBuf::from("/dev/mapper/vg--data"));
    }

    #[test]
    fn test_space_accounting() {
        let mut devices = Devices::new();
        let (vg, _) = volume_group(&mut devices);
        assert_eq!(devices.size(vg), Size::from_mib(2976));
        assert_eq!(vg_free_space(&devices, vg), Size::from_mib(2976));

        let e = add_logical_volume(
            &mut devices,
            vg,
            LogicalVolumeInfo::new("big"),
            Size::from_mib(3000),
            false,
        )
        .unwrap_err();
        assert!(matches!(
            e.kind(),
            ErrorKind::Device(DeviceError::InsufficientSpace { .. })
        ));

        let lv = add_logical_volume(
            &mut devices,
            vg,
            LogicalVolumeInfo::new("root"),
            Size::from_mib(2000),
            false,
        )
        .unwrap();
        assert_eq!(vg_free_space(&devices, vg), Size::from_mib(976));

        // Sizes are aligned down to whole extents.
        devices.set_size(lv, Size::from_mib(2010)).unwrap();
        assert_eq!(devices.size(lv), Size::from_mib(1984));
        assert_eq!(vg_free_space(&devices, vg), Size::from_mib(992));

        let e = devices.set_size(lv, Size::from_mib(3008)).unwrap_err();
        assert!(matches!(
            e.kind(),
            ErrorKind::Device(DeviceError::InsufficientSpace { .. })
        ));
        devices.set_size(lv, Size::from_mib(2976)).unwrap();
        assert_eq!(vg_free_space(&devices, vg), Size::ZERO);
    }

    #[test]
    fn test_mirrored_volume_space() {
        let mut devices = Devices::new();
        let (vg, _) = volume_group(&mut devices);
        let mut mirror = LogicalVolumeInfo::new("mirror");
        mirror.stripes = 2;
        mirror.log_size = Size::from_mib(32);

        // Two images of 1504M and the log need 3040M of 2976M.
        let e = add_logical_volume(&mut devices, vg, mirror.clone(), Size::from_mib(1504), false)
            .unwrap_err();
        assert!(matches!(
            e.kind(),
            ErrorKind::Device(DeviceError::InsufficientSpace { .. })
        ));

        let lv = add_logical_volume(&mut devices, vg, mirror, Size::from_mib(1024), false).unwrap();
        assert_eq!(vg_free_space(&devices, vg), Size::from_mib(2976 - 2048 - 32));
        assert_eq!(lv_space_used(&devices, lv), Size::from_mib(2080));
        assert_eq!(devices.max_size(lv), Some(Size::from_mib(1472)));

        let e = add_logical_volume(
            &mut devices,
            vg,
            LogicalVolumeInfo::new("root"),
            Size::from_mib(1024),
            false,
        )
        .unwrap_err();
        assert!(matches!(
            e.kind(),
            ErrorKind::Device(DeviceError::InsufficientSpace { .. })
        ));
        assert!(devices.set_size(lv, Size::from_mib(1504)).is_err());
        devices.set_size(lv, Size::from_mib(1472)).unwrap();
        assert_eq!(vg_free_space(&devices, vg), Size::ZERO);
    }

    #[test]
    fn test_snapshot_space() {
        let mut devices = Devices::new();
        let (vg, _) = volume_group(&mut devices);
        let mut info = LogicalVolumeInfo::new("root");
        info.snapshot_space = Size::from_mib(10);
        add_logical_volume(&mut devices, vg, info, Size::from_mib(64), false).unwrap();
        if let DeviceKind::VolumeGroup(ref mut info) = devices[vg].kind {
            info.vorigin_snapshots.push(("snap".into(), Size::from_mib(40)));
        }
        assert_eq!(vg_snapshot_space(&devices, vg), Size::from_mib(96));
        assert_eq!(vg_free_space(&devices, vg), Size::from_mib(2976 - 64 - 96));
    }

    #[test]
    fn test_membership() {
        let mut devices = Devices::new();
        let (vg, pvs) = volume_group(&mut devices);
        assert!(vg_add_pv(&mut devices, vg, pvs[0]).is_err());
        vg_remove_pv(&mut devices, vg, pvs[2]).unwrap();
        assert_eq!(devices[vg].as_volume_group().unwrap().pv_count, 2);

        devices[vg].exists = true;
        assert!(vg_add_pv(&mut devices, vg, pvs[2]).is_err());
        assert!(vg_remove_pv(&mut devices, vg, pvs[1]).is_err());
    }

    #[test]
    fn test_completeness_and_duplicates() {
        let mut devices = Devices::new();
        let vg = devices.add("vg0", DeviceKind::VolumeGroup(VolumeGroupInfo {
            pv_count: 2,
            ..Default::default()
        }));
        devices[vg].exists = true;
        devices[vg].uuid = Some("vg-uuid".into());
        let pvs: Vec<DeviceId> = ["sda", "sdb", "sdc"]
            .iter()
            .map(|name| {
                let pv = devices.add(*name, DeviceKind::Disk(DiskInfo::default()));
                devices[pv].exists = true;
                devices[pv].format = Format::new(FormatKind::LvmPv {
                    vg_name: Some("vg0".into()),
                    vg_uuid: Some("vg-uuid".into()),
                    pe_start: Size::from_mib(1),
                })
                .existing();
                pv
            })
            .collect();

        assert!(!vg_add_existing_pv(&mut devices, vg, pvs[0]).unwrap());
        let e = pre_setup(&devices, vg).unwrap_err();
        assert!(matches!(
            e.kind(),
            ErrorKind::Device(DeviceError::MissingPhysicalVolumes { .. })
        ));
        assert!(vg_add_existing_pv(&mut devices, vg, pvs[0]).is_err());
        assert!(vg_add_existing_pv(&mut devices, vg, pvs[1]).unwrap());

        if let FormatKind::LvmPv { ref mut vg_uuid, .. } = devices[pvs[2]].format.kind {
            *vg_uuid = Some("other-uuid".into());
        }
        assert!(!vg_add_existing_pv(&mut devices, vg, pvs[2]).unwrap());
        assert!(devices[vg].as_volume_group().unwrap().has_duplicate);
        assert_eq!(devices[vg].parents.len(), 3);
    }

    #[test]
    fn test_lifecycle() {
        let mut system = SimulatedSystem::default();
        let mut devices = Devices::new();
        let (vg, pvs) = volume_group(&mut devices);
        for pv in &pvs {
            devices[*pv].exists = true;
        }
        devices[vg].exists = true;
        let mut info = LogicalVolumeInfo::new("root");
        info.single_pv = true;
        let lv = add_logical_volume(&mut devices, vg, info, Size::from_mib(500), false).unwrap();

        let e = devices.create(lv, &mut system, None).unwrap_err();
        assert!(matches!(
            e.kind(),
            ErrorKind::Device(DeviceError::SinglePhysicalVolume { .. })
        ));

        system.set_pv_free(
            "vg-data",
            vec![
                (PathBuf::from("/dev/sda1"), Size::from_mib(100)),
                (PathBuf::from("/dev/sda2"), Size::from_mib(900)),
            ],
        );
        system.clear_calls();
        devices.create(lv, &mut system, None).unwrap();
        assert_eq!(
            system.calls(),
            &[
                "lv_create vg-data root 524288000",
                "lv_activate vg-data root true",
            ]
        );
        assert!(devices.status(lv, &system));
        assert!(devices.status(vg, &system));

        system.clear_calls();
        devices.teardown(lv, &mut system, false).unwrap();
        assert_eq!(system.calls(), &["lv_activate vg-data root false"]);
    }
}
