//! Loop devices over regular files.
//!
//! An inactive loop device has no kernel name, so it is called
//! `tmploop<id>` until it is attached.

use anyhow::{Context, Error};
use log::debug;

use crate::system::BlockLayer;

use super::{DeviceId, DeviceKind, Devices};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopInfo {
    /// Backs a configured disk image.
    pub disk_image: bool,
}

pub fn placeholder_name(id: DeviceId) -> String {
    format!("tmploop{id}")
}

fn backing_file(devices: &Devices, id: DeviceId) -> Result<std::path::PathBuf, Error> {
    let file = devices[id]
        .parents
        .first()
        .with_context(|| format!("Loop device '{}' has no backing file", devices[id].name))?;
    Ok(devices.path(*file))
}

pub(super) fn status(devices: &Devices, id: DeviceId, system: &dyn BlockLayer) -> bool {
    backing_file(devices, id)
        .ok()
        .and_then(|file| system.loop_for_file(&file))
        .is_some()
}

pub(super) fn setup(devices: &mut Devices, id: DeviceId, system: &mut dyn BlockLayer) -> Result<(), Error> {
    let file = backing_file(devices, id)?;
    let name = system.loop_attach(&file)?;
    debug!("Attached '{}' as '{name}'", file.display());
    devices[id].name = name;
    Ok(())
}

pub(super) fn teardown(
    devices: &mut Devices,
    id: DeviceId,
    system: &mut dyn BlockLayer,
) -> Result<(), Error> {
    let file = backing_file(devices, id)?;
    let name = system
        .loop_for_file(&file)
        .unwrap_or_else(|| devices[id].name.clone());
    system.loop_detach(&name)
}

pub(super) fn post_teardown(devices: &mut Devices, id: DeviceId) {
    if let DeviceKind::Loop(_) = devices[id].kind {
        devices[id].name = placeholder_name(id);
    }
}
