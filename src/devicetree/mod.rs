//! The device tree.
//!
//! Devices live in the [`Devices`] arena; the tree is the subset of them
//! that describes the system as it will be once every queued action has run.
//! Population fills it with what enumeration reports, registering actions
//! keeps it up to date with what is planned.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
};

use log::{debug, info, trace};
use osutils::multipath::ConfigWriter;

use devgraph_api::{
    config::ScanConfig,
    constants::DEV_DIRECTORY,
    descriptor::{DeviceDescriptor, LvInfo},
    error::{DeviceTreeError, ReportError, StorageError},
    Size,
};

use crate::{
    actions::Action,
    devices::{lvm, partition, DeviceId, DeviceKind, Devices},
    interface::{Policy, ProgressInterface},
    system::BlockLayer,
};

mod handlers;
mod populate;

pub struct DeviceTree<S: BlockLayer> {
    pub(crate) devices: Devices,
    /// Devices currently in the tree, in insertion order.
    pub(crate) members: Vec<DeviceId>,
    pub(crate) actions: Vec<Action>,
    pub(crate) next_action_id: u32,
    pub(crate) system: S,
    pub(crate) ui: Option<Box<dyn ProgressInterface>>,

    config: ScanConfig,
    policy: Box<dyn Policy>,

    ignored_disks: Vec<String>,
    exclusive_disks: Vec<String>,
    /// Names of devices matched by the protected specs.
    protected_names: Vec<String>,
    /// Firmware RAID members that belong to no usable set.
    unused_raid_members: Vec<String>,

    /// Result of the last enumeration.
    descriptors: Vec<DeviceDescriptor>,
    /// Logical volumes read from physical volume metadata, per group.
    lv_infos: BTreeMap<DeviceId, Vec<LvInfo>>,
    /// Paths to the same LUN, by multipath alias.
    multipath_members: BTreeMap<String, Vec<DeviceId>>,
    /// The `multipath.conf` written by the last population.
    multipath_config: ConfigWriter,
    /// Names of the descriptors already scanned.
    scanned: BTreeSet<String>,

    populated: bool,
    cleanup: bool,
}

impl<S: BlockLayer> DeviceTree<S> {
    pub fn new(system: S, config: ScanConfig, policy: Box<dyn Policy>) -> Self {
        // Disk images replace the set of disks to look at.
        let exclusive_disks = if config.disk_images.is_empty() {
            config.exclusive_disks.clone()
        } else {
            config.disk_images.keys().cloned().collect()
        };
        let ignored = config.ignored_disks.clone();

        let mut tree = Self {
            devices: Devices::new(),
            members: Vec::new(),
            actions: Vec::new(),
            next_action_id: 0,
            system,
            ui: None,
            config,
            policy,
            ignored_disks: Vec::new(),
            exclusive_disks,
            protected_names: Vec::new(),
            unused_raid_members: Vec::new(),
            descriptors: Vec::new(),
            lv_infos: BTreeMap::new(),
            multipath_members: BTreeMap::new(),
            multipath_config: ConfigWriter::default(),
            scanned: BTreeSet::new(),
            populated: false,
            cleanup: false,
        };
        for disk in ignored {
            tree.add_ignored_disk(&disk);
        }
        tree
    }

    /// Reports create and resize progress to `ui`.
    pub fn with_ui(mut self, ui: Box<dyn ProgressInterface>) -> Self {
        self.ui = Some(ui);
        self
    }

    pub fn devices(&self) -> &Devices {
        &self.devices
    }

    pub fn devices_mut(&mut self) -> &mut Devices {
        &mut self.devices
    }

    pub fn system(&self) -> &S {
        &self.system
    }

    pub fn system_mut(&mut self) -> &mut S {
        &mut self.system
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Size of `id`. Existing partitions are measured on their disk.
    pub fn size(&self, id: DeviceId) -> Size {
        partition::geometry_size(&self.devices, id, &self.system)
            .unwrap_or_else(|| self.devices.size(id))
    }

    /// Devices in the tree, in the order they were added.
    pub fn members(&self) -> &[DeviceId] {
        &self.members
    }

    pub fn contains(&self, id: DeviceId) -> bool {
        self.members.contains(&id)
    }

    pub fn ignored_disks(&self) -> &[String] {
        &self.ignored_disks
    }

    pub fn exclusive_disks(&self) -> &[String] {
        &self.exclusive_disks
    }

    pub fn protected_names(&self) -> &[String] {
        &self.protected_names
    }

    pub fn unused_raid_members(&self) -> &[String] {
        &self.unused_raid_members
    }

    pub fn populated(&self) -> bool {
        self.populated
    }

    pub fn multipath_config(&self) -> &ConfigWriter {
        &self.multipath_config
    }

    /// Inserts a device. Its parents must already be in the tree and no
    /// other member may share its path.
    pub fn add_device(&mut self, id: DeviceId) -> Result<(), StorageError> {
        let device = &self.devices[id];
        if !matches!(device.kind, DeviceKind::NoDevice | DeviceKind::Nfs(_)) {
            let path = self.devices.path(id);
            if let Some(existing) = self
                .members
                .iter()
                .find(|member| self.devices.path(**member) == path)
            {
                return Err(StorageError::new(DeviceTreeError::DuplicatePath {
                    name: device.name.clone(),
                    existing: self.devices[*existing].name.clone(),
                    path: path.display().to_string(),
                }));
            }
        }
        if let Some(parent) = device
            .parents
            .iter()
            .find(|parent| !self.members.contains(parent))
        {
            return Err(StorageError::new(DeviceTreeError::ParentNotInTree {
                name: device.name.clone(),
                parent: self.devices[*parent].name.clone(),
            }));
        }

        self.members.push(id);
        for parent in self.devices[id].parents.clone() {
            self.devices[parent].kids += 1;
        }

        // A logical volume coming back into the tree is allocated again.
        if let (DeviceKind::LogicalVolume(_), Some(&vg)) =
            (&self.devices[id].kind, self.devices[id].parents.first())
        {
            if let DeviceKind::VolumeGroup(ref mut info) = self.devices[vg].kind {
                if !info.lvs.contains(&id) {
                    info.lvs.push(id);
                }
            }
        }

        info!("Added {} to device tree", self.devices[id]);
        Ok(())
    }

    /// Removes a device. Unless `force` is set the device must be a leaf.
    /// With `moddisk`, removing a logical partition renumbers the logical
    /// partitions that follow it.
    pub fn remove_device(
        &mut self,
        id: DeviceId,
        force: bool,
        moddisk: bool,
    ) -> Result<(), StorageError> {
        let Some(position) = self.members.iter().position(|member| *member == id) else {
            return Err(StorageError::new(DeviceTreeError::NotInTree {
                name: self.devices[id].name.clone(),
            }));
        };
        let device = &self.devices[id];
        if !force && !device.is_leaf() {
            debug!("{device} has {} kids", device.kids);
            return Err(StorageError::new(DeviceTreeError::NotLeaf {
                name: device.name.clone(),
            }));
        }

        let disk = device.parents.first().copied();
        let mut renumber = None;
        if let (true, Some(part), Some(disk)) = (moddisk, device.as_partition(), disk) {
            if part.is_extended() && self.logicals(disk).next().is_some() {
                return Err(StorageError::new(DeviceTreeError::ExtendedPartitionInUse {
                    name: device.name.clone(),
                }));
            }
            if part.is_logical() {
                renumber = Some((disk, part.number));
            }
        }

        self.members.remove(position);
        if let Some((disk, number)) = renumber {
            partition::renumber_logicals(&mut self.devices, &self.members, disk, number);
        }
        if let (DeviceKind::LogicalVolume(_), Some(vg)) = (&self.devices[id].kind, disk) {
            lvm::remove_logical_volume(&mut self.devices, vg, id)?;
        }
        for parent in self.devices[id].parents.clone() {
            let parent = &mut self.devices[parent];
            parent.kids = parent.kids.saturating_sub(1);
        }

        info!("Removed {} from device tree", self.devices[id]);
        Ok(())
    }

    /// Logical partitions of `disk` in the tree.
    fn logicals(&self, disk: DeviceId) -> impl Iterator<Item = DeviceId> + '_ {
        self.members.iter().copied().filter(move |member| {
            let device = &self.devices[*member];
            device.is_logical() && device.parents.first() == Some(&disk)
        })
    }

    /// Excludes `name` from this run and hides it from LVM.
    pub fn add_ignored_disk(&mut self, name: &str) {
        if !self.ignored_disks.iter().any(|disk| disk == name) {
            self.ignored_disks.push(name.to_string());
        }
        self.system.lvm_reject(name);
    }

    fn lvm_alias(&self, id: DeviceId) -> bool {
        matches!(
            self.devices[id].kind,
            DeviceKind::VolumeGroup(_) | DeviceKind::LogicalVolume(_)
        )
    }

    pub fn by_name(&self, name: &str) -> Option<DeviceId> {
        let unescaped = name.replace("--", "-");
        let found = self.members.iter().copied().find(|id| {
            let device = &self.devices[*id];
            device.name == name || (self.lvm_alias(*id) && device.name == unescaped)
        });
        trace!("Looking up device named '{name}': {found:?}");
        found
    }

    pub fn by_path(&self, path: impl AsRef<Path>) -> Option<DeviceId> {
        let path = path.as_ref();
        let unescaped = PathBuf::from(path.to_string_lossy().replace("--", "-"));
        let found = self.members.iter().copied().find(|id| {
            let own = self.devices.path(*id);
            own == path || (self.lvm_alias(*id) && own == unescaped)
        });
        trace!("Looking up device at '{}': {found:?}", path.display());
        found
    }

    pub fn by_sysfs_path(&self, sysfs_path: &str) -> Option<DeviceId> {
        self.members
            .iter()
            .copied()
            .find(|id| self.devices[*id].sysfs_path.as_deref() == Some(sysfs_path))
    }

    /// Finds a device by its own UUID or the UUID of its format.
    pub fn by_uuid(&self, uuid: &str) -> Option<DeviceId> {
        self.members.iter().copied().find(|id| {
            let device = &self.devices[*id];
            device.uuid.as_deref() == Some(uuid) || device.format.uuid.as_deref() == Some(uuid)
        })
    }

    /// Every device with `serial`. Multipath members share one.
    pub fn by_serial(&self, serial: &str) -> Vec<DeviceId> {
        self.members
            .iter()
            .copied()
            .filter(|id| self.devices[*id].serial.as_deref() == Some(serial))
            .collect()
    }

    pub fn by_label(&self, label: &str) -> Option<DeviceId> {
        self.members
            .iter()
            .copied()
            .find(|id| self.devices[*id].format.label.as_deref() == Some(label))
    }

    pub fn by_type(&self, type_name: &str) -> Vec<DeviceId> {
        self.members
            .iter()
            .copied()
            .filter(|id| self.devices[*id].type_name() == type_name)
            .collect()
    }

    pub fn leaves(&self) -> Vec<DeviceId> {
        self.members
            .iter()
            .copied()
            .filter(|id| self.devices[*id].is_leaf())
            .collect()
    }

    /// Devices that list `id` as a parent.
    pub fn children(&self, id: DeviceId) -> Vec<DeviceId> {
        self.members
            .iter()
            .copied()
            .filter(|member| self.devices[*member].parents.contains(&id))
            .collect()
    }

    /// Leaves whose format has a mount point.
    pub fn filesystems(&self) -> Vec<DeviceId> {
        self.leaves()
            .into_iter()
            .filter(|id| self.devices[*id].format.mountpoint.is_some())
            .collect()
    }

    /// Mount points of every member's format.
    pub fn mountpoints(&self) -> Vec<PathBuf> {
        self.members
            .iter()
            .filter_map(|id| self.devices[*id].format.mountpoint.clone())
            .collect()
    }

    /// Device and format UUIDs mapped to the device carrying them.
    pub fn uuid_map(&self) -> BTreeMap<String, DeviceId> {
        let mut map = BTreeMap::new();
        for id in &self.members {
            let device = &self.devices[*id];
            for uuid in [&device.uuid, &device.format.uuid].into_iter().flatten() {
                map.insert(uuid.clone(), *id);
            }
        }
        map
    }

    pub fn label_map(&self) -> BTreeMap<String, DeviceId> {
        self.members
            .iter()
            .filter_map(|id| {
                self.devices[*id]
                    .format
                    .label
                    .as_ref()
                    .map(|label| (label.clone(), *id))
            })
            .collect()
    }

    /// Members that depend on `id`, directly or indirectly. Devices on the
    /// logical partitions of an extended partition depend on it too.
    pub fn dependent_devices(&self, id: DeviceId) -> Vec<DeviceId> {
        let logicals: Vec<DeviceId> = match self.devices[id].parents.first() {
            Some(disk) if self.devices[id].is_extended() => self.logicals(*disk).collect(),
            _ => Vec::new(),
        };
        self.members
            .iter()
            .copied()
            .filter(|member| *member != id)
            .filter(|member| {
                self.devices.depends_on(*member, id)
                    || logicals
                        .iter()
                        .any(|logical| *logical == *member || self.devices.depends_on(*member, *logical))
            })
            .collect()
    }

    /// Resolves a user-supplied device spec: `UUID=`, `LABEL=`, a name, a
    /// `/dev` path, a `/dev/disk/by-*` link or `/dev/<vg>/<lv>`.
    pub fn resolve_device(&self, spec: &str) -> Result<DeviceId, StorageError> {
        let found = if let Some(uuid) = spec.strip_prefix("UUID=") {
            self.by_uuid(uuid.trim_matches('"'))
        } else if let Some(label) = spec.strip_prefix("LABEL=") {
            self.by_label(label.trim_matches('"'))
        } else {
            let (by_name, path) = if spec.starts_with("/dev/") {
                (None, spec.to_string())
            } else {
                (self.by_name(spec), format!("{DEV_DIRECTORY}/{spec}"))
            };
            by_name
                .or_else(|| {
                    if !path.starts_with("/dev/disk/") {
                        return None;
                    }
                    self.members
                        .iter()
                        .copied()
                        .find(|id| self.devices[*id].symlinks.contains(&path))
                })
                .or_else(|| self.by_path(&path))
                .or_else(|| {
                    let rest = path.strip_prefix("/dev/")?;
                    let (vg, lv) = rest.split_once('/')?;
                    if lv.is_empty() || lv.contains('/') {
                        return None;
                    }
                    self.by_name(&format!("{vg}-{lv}"))
                })
        };
        debug!(
            "Resolved '{spec}' to {}",
            found.map_or_else(|| "nothing".to_string(), |id| self.devices[id].to_string())
        );
        found.structured(DeviceTreeError::DeviceNotFound {
            spec: spec.to_string(),
        })
    }

    /// Deactivates every leaf and what is below it. Failures are logged.
    pub fn teardown_all(&mut self) {
        for leaf in self.leaves() {
            if let Err(e) = self.devices.teardown(leaf, &mut self.system, true) {
                info!("Teardown of {} failed: {e:?}", self.devices[leaf]);
            }
        }
    }

    /// Activates every existing leaf and what is below it.
    pub fn setup_all(&mut self) {
        for leaf in self.leaves() {
            if !self.devices[leaf].exists {
                continue;
            }
            if let Err(e) = self.devices.setup(leaf, &mut self.system, false) {
                debug!("Setup of {} failed: {e:?}", self.devices[leaf]);
            }
        }
    }
}
