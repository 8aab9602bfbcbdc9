//! Device-mapper based devices: plain maps, linear maps, LUKS mappings,
//! firmware RAID sets and multipath maps.

use std::path::PathBuf;

use anyhow::{Context, Error};
use log::debug;

use devgraph_api::error::StorageError;

use crate::system::BlockLayer;

use super::{DeviceId, DeviceKind, Devices};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DmRaidInfo {
    /// Name of the firmware RAID set.
    pub raid_set: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultipathInfo {
    /// Identity of the LUN the paths lead to, without separators.
    pub identity: String,
}

impl MultipathInfo {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
        }
    }

    /// The identity as colon-separated byte pairs.
    pub fn wwid(&self) -> String {
        self.identity
            .as_bytes()
            .chunks(2)
            .map(|pair| String::from_utf8_lossy(pair).into_owned())
            .collect::<Vec<_>>()
            .join(":")
    }
}

/// One `multipaths` entry of `multipath.conf`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipathConfig {
    pub wwid: String,
    pub alias: String,
    pub mode: &'static str,
    pub uid: u32,
    pub gid: u32,
}

impl MultipathConfig {
    pub fn render(&self) -> String {
        format!(
            "    multipath {{\n        wwid {}\n        alias {}\n        mode {}\n        uid {}\n        gid {}\n    }}\n",
            self.wwid, self.alias, self.mode, self.uid, self.gid
        )
    }
}

fn map_name(devices: &Devices, id: DeviceId) -> Result<String, Error> {
    devices
        .path(id)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .with_context(|| format!("Device '{}' has no map name", devices[id].name))
}

fn first_parent_path(devices: &Devices, id: DeviceId) -> Result<PathBuf, Error> {
    let parent = devices[id]
        .parents
        .first()
        .with_context(|| format!("Device '{}' has no backing device", devices[id].name))?;
    Ok(devices.path(*parent))
}

/// Whether the map behind `id` is loaded and not suspended.
pub(super) fn map_active(devices: &Devices, id: DeviceId, system: &dyn BlockLayer) -> bool {
    map_name(devices, id)
        .ok()
        .and_then(|name| system.dm_state(&name))
        .is_some_and(|state| state.live && !state.suspended)
}

pub(super) fn linear_setup(
    devices: &mut Devices,
    id: DeviceId,
    system: &mut dyn BlockLayer,
) -> Result<(), Error> {
    let backing = first_parent_path(devices, id)?;
    let size = match devices[id].target_size {
        size if size.is_zero() => devices[id]
            .parents
            .first()
            .map(|parent| devices.size(*parent))
            .unwrap_or_default(),
        size => size,
    };
    let name = map_name(devices, id)?;
    system.dm_create_linear(&name, &backing, size, devices[id].uuid.as_deref())?;
    system.kpartx_add(&devices.path(id))
}

pub(super) fn linear_create(
    devices: &mut Devices,
    id: DeviceId,
    system: &mut dyn BlockLayer,
) -> Result<(), Error> {
    linear_setup(devices, id, system)
}

pub(super) fn linear_destroy(
    devices: &mut Devices,
    id: DeviceId,
    system: &mut dyn BlockLayer,
) -> Result<(), Error> {
    if map_active(devices, id, system) {
        system.dm_remove(&map_name(devices, id)?)?;
    }
    Ok(())
}

pub(super) fn generic_teardown(
    devices: &mut Devices,
    id: DeviceId,
    system: &mut dyn BlockLayer,
) -> Result<(), Error> {
    system.dm_remove(&map_name(devices, id)?)
}

/// Removes a linear map and the partition maps on top of it. Unlike
/// teardown, this always acts.
pub fn deactivate(
    devices: &mut Devices,
    id: DeviceId,
    system: &mut dyn BlockLayer,
) -> Result<(), Error> {
    if !map_active(devices, id, system) {
        return Ok(());
    }
    system.kpartx_delete(&devices.path(id))?;
    system.dm_remove(&map_name(devices, id)?)
}

/// Closes the mapping by tearing down the LUKS format of the backing device.
pub(super) fn luks_teardown(
    devices: &mut Devices,
    id: DeviceId,
    system: &mut dyn BlockLayer,
) -> Result<(), Error> {
    let Some(slave) = devices[id].parents.first().copied() else {
        return Ok(());
    };
    let path = devices.path(slave);
    let device = &devices[slave];
    for format in [&device.format, &device.original_format] {
        if format.is_luks() && format.exists {
            format.teardown(system, &path)?;
        }
    }
    Ok(())
}

/// A new mapping takes the name its LUKS format opens it under.
pub(super) fn luks_post_create(devices: &mut Devices, id: DeviceId) {
    let map_name = devices[id]
        .parents
        .first()
        .and_then(|slave| devices[*slave].format.map_name())
        .map(String::from);
    if let Some(map_name) = map_name {
        debug!("Renaming '{}' to '{map_name}'", devices[id].name);
        devices[id].name = map_name;
    }
}

pub(super) fn multipath_setup(
    devices: &mut Devices,
    id: DeviceId,
    system: &mut dyn BlockLayer,
) -> Result<(), Error> {
    system.multipath_activate(&devices[id].name)?;
    system.kpartx_add(&devices.path(id))
}

pub(super) fn multipath_teardown(
    devices: &mut Devices,
    id: DeviceId,
    system: &mut dyn BlockLayer,
) -> Result<(), Error> {
    system.kpartx_delete(&devices.path(id))?;
    system.multipath_flush(&devices[id].name)
}

pub(super) fn dmraid_setup(
    devices: &mut Devices,
    id: DeviceId,
    system: &mut dyn BlockLayer,
) -> Result<(), Error> {
    let DeviceKind::DmRaid(ref info) = devices[id].kind else {
        return Ok(());
    };
    system.dmraid_activate(&info.raid_set)
}

/// Deactivates a firmware RAID set.
pub fn dmraid_deactivate(
    devices: &Devices,
    id: DeviceId,
    system: &mut dyn BlockLayer,
) -> Result<(), Error> {
    let DeviceKind::DmRaid(ref info) = devices[id].kind else {
        return Ok(());
    };
    system.dmraid_deactivate(&info.raid_set)
}

/// The `multipath.conf` entry for a multipath map.
pub fn multipath_config(devices: &Devices, id: DeviceId) -> Option<MultipathConfig> {
    let DeviceKind::Multipath(ref info) = devices[id].kind else {
        return None;
    };
    Some(MultipathConfig {
        wwid: info.identity.clone(),
        alias: devices[id].name.clone(),
        mode: "0600",
        uid: 0,
        gid: 0,
    })
}

/// Adds another path to a multipath map. An active map is reloaded so the
/// new path is picked up.
pub fn multipath_add_parent(
    devices: &mut Devices,
    id: DeviceId,
    parent: DeviceId,
    system: &mut dyn BlockLayer,
) -> Result<(), StorageError> {
    if devices[id].parents.contains(&parent) {
        return Ok(());
    }
    let active = devices.status(id, system);
    if active {
        devices.teardown(id, system, false)?;
    }
    devices[id].parents.push(parent);
    if active {
        devices.setup(id, system, false)?;
    }
    Ok(())
}
