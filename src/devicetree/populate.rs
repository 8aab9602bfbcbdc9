//! Building the tree from enumerated descriptors.

use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use log::{debug, error, info, warn};
use regex::Regex;

use devgraph_api::{
    constants::{DM_INTERNAL_UUID_PREFIX, SYSFS_VIRTUAL_BLOCK},
    descriptor::{DeviceDescriptor, DiskLabelType},
    error::{DeviceTreeError, ReportError, StorageError},
};
use osutils::multipath::{BlacklistEntry, ConfigWriter, MultipathEntry};

use crate::{
    devices::{
        dm, loopback, md, DeviceId, DeviceKind, DiskInfo, LoopInfo, MdInfo, MdLevel,
        MultipathInfo, PartitionInfo,
    },
    formats::FormatKind,
    system::BlockLayer,
};

use super::DeviceTree;

lazy_static! {
    /// Suffix mdadm appends to an array name when the hostname changed.
    static ref SET_INDEX: Regex = Regex::new(r"_\d+$").unwrap();
}

impl<S: BlockLayer> DeviceTree<S> {
    /// Fills the tree with every usable device on the system. With
    /// `cleanup_only` nothing is asked and only what is needed to tear
    /// devices down is opened.
    #[tracing::instrument(skip_all)]
    pub fn populate(&mut self, cleanup_only: bool) -> Result<(), StorageError> {
        if cleanup_only {
            self.cleanup = true;
        }
        let backups = self.backup_configs();
        let result = self.populate_inner();
        self.restore_configs(backups);
        result
    }

    fn config_paths(&self) -> [PathBuf; 3] {
        [
            self.config.mdadm_conf_path.clone(),
            self.config.multipath_conf_path.clone(),
            self.config.multipath_bindings_path.clone(),
        ]
    }

    fn backup_configs(&mut self) -> Vec<(PathBuf, bool)> {
        self.config_paths()
            .into_iter()
            .filter_map(|path| match self.system.backup_config(&path) {
                Ok(backed_up) => {
                    if !backed_up {
                        info!("Not backing up non-existent '{}'", path.display());
                    }
                    Some((path, backed_up))
                }
                Err(e) => {
                    error!("Failed to back up '{}': {e:?}", path.display());
                    None
                }
            })
            .collect()
    }

    fn restore_configs(&mut self, backups: Vec<(PathBuf, bool)>) {
        for (path, backed_up) in backups {
            if let Err(e) = self.system.restore_config(&path, backed_up) {
                error!("Failed to restore '{}': {e:?}", path.display());
            }
        }
    }

    fn enumerate(&mut self) -> Result<(), StorageError> {
        self.descriptors = self
            .system
            .enumerate()
            .structured(DeviceTreeError::Enumerate)?;
        Ok(())
    }

    fn populate_inner(&mut self) -> Result<(), StorageError> {
        debug!(
            "Populating device tree: ignored disks are {:?}, exclusive disks are {:?}",
            self.ignored_disks, self.exclusive_disks
        );
        self.setup_disk_images();
        self.populated = false;

        self.enumerate()?;
        self.resolve_protected();

        self.multipath_config = ConfigWriter::default();
        self.write_multipath_config()?;

        let descriptors: Vec<DeviceDescriptor> = self
            .descriptors
            .iter()
            .filter(|desc| !desc.is_dm_multipath())
            .cloned()
            .collect();
        info!("Devices to scan: {:?}", names(&descriptors));
        for desc in &descriptors {
            self.add_descriptor(desc);
        }

        self.add_multipaths()?;

        // Scan whatever appeared since, until nothing changes.
        loop {
            self.enumerate()?;
            let new: Vec<DeviceDescriptor> = self
                .descriptors
                .iter()
                .filter(|desc| !self.scanned.contains(&desc.name))
                .cloned()
                .collect();

            if new.is_empty() {
                // Logical volumes wait until every physical volume was seen.
                if self.setup_lvs() {
                    let lvs: Vec<String> = self
                        .descriptors
                        .iter()
                        .filter(|desc| desc.is_dm_lvm())
                        .map(|desc| desc.name.clone())
                        .collect();
                    for name in lvs {
                        self.scanned.remove(&name);
                    }
                    continue;
                }
                break;
            }

            info!("Devices to scan: {:?}", names(&new));
            for desc in &new {
                self.add_descriptor(desc);
            }
        }

        self.populated = true;
        self.handle_inconsistencies();
        self.teardown_all();
        Ok(())
    }

    fn write_multipath_config(&mut self) -> Result<(), StorageError> {
        let path = self.config.multipath_conf_path.clone();
        self.system
            .write_config(&path, &self.multipath_config.render())
            .structured(DeviceTreeError::WriteConfig {
                path: path.display().to_string(),
            })
    }

    /// Turns the protected specs into device names.
    fn resolve_protected(&mut self) {
        for spec in self.config.protected_dev_specs.clone() {
            let found = self.descriptors.iter().find(|desc| {
                if let Some(uuid) = spec.strip_prefix("UUID=") {
                    let uuid = Some(uuid.trim_matches('"'));
                    desc.uuid.as_deref() == uuid || desc.format.uuid.as_deref() == uuid
                } else if let Some(label) = spec.strip_prefix("LABEL=") {
                    desc.format.label.as_deref() == Some(label.trim_matches('"'))
                } else if spec.starts_with("/dev/") {
                    desc.path() == Path::new(&spec) || desc.has_symlink(&spec)
                } else {
                    desc.name == spec || desc.device_name() == spec
                }
            });
            match found {
                Some(desc) => {
                    let name = desc.device_name().to_string();
                    debug!("Protected spec '{spec}' resolved to '{name}'");
                    if !self.protected_names.contains(&name) {
                        self.protected_names.push(name);
                    }
                }
                None => warn!("Protected device spec '{spec}' matches no device"),
            }
        }
    }

    /// The descriptor of the last enumeration with kernel or map name `name`.
    pub(super) fn descriptor(&self, name: &str) -> Option<DeviceDescriptor> {
        self.descriptors
            .iter()
            .find(|desc| desc.name == name || desc.device_name() == name)
            .cloned()
    }

    pub(super) fn is_ignored(&mut self, desc: &DeviceDescriptor) -> bool {
        let name = desc.device_name().to_string();
        if self.ignored_disks.contains(&name) {
            debug!("Device '{name}' is in the ignored disks");
            return true;
        }

        // Containers never show up in the exclusive disks themselves.
        if desc.is_md_container() {
            return false;
        }

        // Firmware RAID sets are listed by their dmraid name, which has to be
        // mapped to the md name.
        if let Some(md_name) = desc
            .md
            .as_ref()
            .filter(|md| desc.is_md() && md.container.is_some())
            .and_then(|md| md.name.clone())
        {
            let alt_name = SET_INDEX.replace(&md_name, "").into_owned();
            let patterns: Vec<Regex> = [&md_name, &alt_name]
                .iter()
                .filter_map(|n| Regex::new(&format!("^isw_[a-z]*_{}", regex::escape(n))).ok())
                .collect();
            if let Some(slot) = self
                .exclusive_disks
                .iter_mut()
                .find(|disk| patterns.iter().any(|pattern| pattern.is_match(disk)))
            {
                debug!("Firmware RAID set '{slot}' is '{name}'");
                *slot = name;
                return false;
            }
        }

        if desc.is_dm_internal() || desc.is_dm_livecd() {
            return false;
        }

        if desc.is_ram() {
            return true;
        }

        if desc.is_loop() {
            return desc
                .loop_device
                .as_ref()
                .and_then(|l| l.backing_file.as_ref())
                .is_none();
        }

        let plain_disk = desc.is_disk()
            && !desc.is_dm_partition()
            && !desc.is_dm_lvm()
            && !desc.is_dm_crypt()
            && !(desc.is_md() && desc.md.as_ref().and_then(|md| md.container.as_ref()).is_none())
            && !desc.is_multipath_member()
            && !desc.is_biosraid_member();
        if plain_disk && !self.exclusive_disks.is_empty() && !self.exclusive_disks.contains(&name) {
            debug!("Device '{name}' is not in the exclusive disks");
            self.add_ignored_disk(&name);
            return true;
        }
        false
    }

    /// Adds the device `desc` describes, scanning its slaves first, then
    /// handles its format. Returns the device when it is in the tree.
    pub(super) fn add_descriptor(&mut self, desc: &DeviceDescriptor) -> Option<DeviceId> {
        let name = desc.device_name().to_string();
        if !self.scanned.insert(desc.name.clone()) {
            return self.by_name(&name);
        }
        let Some(ref sysfs_path) = desc.sysfs_path else {
            debug!("Skipping '{name}': no sysfs path");
            return None;
        };

        if self.is_ignored(desc) {
            debug!("Ignoring '{name}' ({sysfs_path})");
            self.add_ignored_disk(&name);
            if desc.is_multipath_member() {
                // Hide the partitions too, LVM would otherwise see duplicate
                // volume groups through the member paths.
                let partitions: Vec<String> = self
                    .descriptors
                    .iter()
                    .filter(|d| d.partition.as_ref().is_some_and(|p| p.disk == desc.name))
                    .map(|d| d.name.clone())
                    .collect();
                debug!("Adding partitions of '{name}' to the LVM reject list: {partitions:?}");
                for partition in partitions {
                    self.system.lvm_reject(&partition);
                }
            }
            return None;
        }

        debug!("Scanning '{name}' ({sysfs_path})");
        let id = match self.by_name(&name) {
            Some(id) => Some(id),
            None if desc.is_loop() => self.add_loop_device(desc),
            None if desc.is_multipath_member() => self.add_disk_device(desc),
            None if desc.is_dm_lvm() => self.add_lv_device(desc),
            None if desc.is_dm() => self.add_dm_device(desc),
            None if desc.is_md() => match desc.md.as_ref().and_then(|md| md.container.clone()) {
                Some(container) => self.add_md_set_device(desc, &container),
                None => self.add_md_device(desc),
            },
            None if desc.is_cdrom() => self.add_optical_device(desc),
            None if desc.is_disk() => self.add_disk_device(desc),
            None if desc.is_partition() => self.add_partition_device(desc),
            None => {
                error!("Unknown block device type for '{name}'");
                return None;
            }
        }?;

        if self.protected_names.contains(&self.devices[id].name) {
            self.devices[id].protected = true;
        }

        if !self.devices[id].media_present {
            debug!("No media in {}, skipping format handling", self.devices[id]);
            return Some(id);
        }

        self.handle_device_format(desc, id);
        if !self.contains(id) {
            return None;
        }
        debug!("Got device: {}", self.devices[id]);
        if let Some(format) = self.devices[id].format.type_name() {
            debug!("Got format: {format}");
        }
        self.devices[id].original_format = self.devices[id].format.clone();
        Some(id)
    }

    /// Allocates an existing device with the identity `desc` reports.
    fn new_device(
        &mut self,
        desc: &DeviceDescriptor,
        kind: DeviceKind,
        parents: Vec<DeviceId>,
    ) -> DeviceId {
        let id = self
            .devices
            .add_with_parents(desc.device_name(), kind, parents);
        let device = &mut self.devices[id];
        device.exists = true;
        device.uuid = desc.dm.as_ref().and_then(|dm| dm.uuid.clone()).or_else(|| desc.uuid.clone());
        device.serial = desc.serial.clone();
        device.vendor = desc.vendor.clone();
        device.model = desc.model.clone();
        device.bus = desc.bus.clone();
        device.sysfs_path = desc.sysfs_path.clone();
        device.symlinks = desc.symlinks.clone();
        device.media_present = desc.media_present;
        device.read_only = desc.read_only;
        if let Some(size) = desc.size {
            device.current_size = size;
            device.target_size = size;
        }
        id
    }

    /// Adds `id` to the tree, logging instead of failing.
    pub(super) fn insert(&mut self, id: DeviceId) -> Option<DeviceId> {
        match self.add_device(id) {
            Ok(()) => Some(id),
            Err(e) => {
                error!("Failed to add {} to the device tree: {e:?}", self.devices[id]);
                None
            }
        }
    }

    /// Resolves the slaves of `desc`, scanning those not seen yet.
    fn scan_slaves(&mut self, desc: &DeviceDescriptor) -> Option<Vec<DeviceId>> {
        let mut slaves = Vec::new();
        for slave in &desc.slaves {
            let found = match self.descriptor(slave) {
                Some(slave_desc) => {
                    let slave_name = slave_desc.device_name().to_string();
                    self.by_name(&slave_name)
                        .or_else(|| self.add_descriptor(&slave_desc))
                        .or_else(|| self.by_name(&slave_name))
                }
                None => self.by_name(slave),
            };
            match found {
                Some(id) => slaves.push(id),
                None => {
                    error!(
                        "Failure scanning device: {}",
                        DeviceTreeError::UnresolvedSlave {
                            name: desc.device_name().to_string(),
                            slave: slave.clone(),
                        }
                    );
                    return None;
                }
            }
        }
        Some(slaves)
    }

    fn add_lv_device(&mut self, desc: &DeviceDescriptor) -> Option<DeviceId> {
        // Scanning the physical volumes builds the group.
        self.scan_slaves(desc)?;
        let found = self.by_name(desc.device_name());
        if found.is_none() {
            debug!(
                "Logical volume '{}' is added once its volume group is set up",
                desc.device_name()
            );
        }
        found
    }

    fn add_dm_device(&mut self, desc: &DeviceDescriptor) -> Option<DeviceId> {
        let name = desc.device_name().to_string();
        let cleanup_luks = desc.is_dm_crypt() && self.cleanup;
        let slaves = self.scan_slaves(desc)?;

        if let Some(id) = self.by_name(&name) {
            return Some(id);
        }

        if desc.is_dm_partition() {
            return self.add_partition_device(desc);
        }

        // A mapping opened under another name than the one expected.
        if let (true, Some(&slave)) = (cleanup_luks, slaves.first()) {
            if let FormatKind::Luks { ref mut map_name, .. } = self.devices[slave].format.kind {
                *map_name = Some(name.clone());
                self.handle_luks(slave);
                if let Some(id) = self.by_name(&name) {
                    return Some(id);
                }
            }
        }

        if desc.is_dm_livecd() {
            let target = desc.dm.as_ref().map(|dm| dm.target).unwrap_or_default();
            let id = self.new_device(
                desc,
                DeviceKind::DeviceMapper { target },
                slaves.into_iter().take(1).collect(),
            );
            self.devices[id].protected = true;
            self.devices[id].controllable = false;
            return self.insert(id);
        }

        // Every slave is in the tree, so the map should have been found.
        self.system.lvm_reject(&name);
        warn!("Ignoring device-mapper device '{name}'");
        None
    }

    fn add_md_device(&mut self, desc: &DeviceDescriptor) -> Option<DeviceId> {
        let name = desc.device_name().to_string();
        let uuid = desc.md.as_ref().and_then(|md| md.uuid.clone());
        if let Some(id) = uuid.as_deref().and_then(|uuid| self.by_uuid(uuid)) {
            return Some(id);
        }

        self.scan_slaves(desc)?;
        if let Some(id) = self.by_name(&name) {
            return Some(id);
        }
        match uuid.as_deref().and_then(|uuid| self.by_uuid(uuid)) {
            Some(id) => error!(
                "MD array '{name}' is already in the device tree as {}",
                self.devices[id]
            ),
            None => error!("MD array '{name}' is not in the device tree after scanning all slaves"),
        }
        None
    }

    /// A firmware RAID set that lives in an MD container.
    fn add_md_set_device(&mut self, desc: &DeviceDescriptor, container: &str) -> Option<DeviceId> {
        let container_name = container.trim_start_matches("/dev/").replace("md/", "md");
        let parent = match self.by_name(&container_name) {
            Some(id) => id,
            None => {
                let Some(container_desc) = self.descriptor(&container_name) else {
                    error!("Failed to find MD container '{container_name}'");
                    return None;
                };
                let Some(id) = self.add_descriptor(&container_desc) else {
                    error!("Failed to scan MD container '{container_name}'");
                    return None;
                };
                id
            }
        };

        let md_desc = desc.md.clone().unwrap_or_default();
        let level = match md_desc.level.parse::<MdLevel>() {
            Ok(level) => level,
            Err(e) => {
                warn!("Invalid data for '{}': {e}", desc.name);
                return None;
            }
        };
        let devices = md_desc.devices as usize;
        let name = desc.device_name();
        let id = match md::new_array(
            &mut self.devices,
            name,
            MdInfo::new(level, devices, devices),
            vec![parent],
            true,
        ) {
            Ok(id) => id,
            Err(e) => {
                error!("Failed to add firmware RAID set '{name}': {e:?}");
                return None;
            }
        };
        let device = &mut self.devices[id];
        device.uuid = md_desc.uuid;
        device.sysfs_path = desc.sysfs_path.clone();
        if let Some(size) = desc.size {
            device.current_size = size;
        }
        self.insert(id)
    }

    fn add_partition_device(&mut self, desc: &DeviceDescriptor) -> Option<DeviceId> {
        let name = desc.device_name().to_string();
        let Some(ref info) = desc.partition else {
            error!("Partition '{name}' does not name its disk");
            return None;
        };

        let disk = self.by_name(&info.disk).or_else(|| {
            let disk_desc = self.descriptor(&info.disk)?;
            self.add_descriptor(&disk_desc)
        });
        let Some(disk) = disk else {
            error!("Failure scanning disk '{}' of '{name}'", info.disk);
            self.system.lvm_reject(&name);
            return None;
        };

        // No disklabel means it was reinitialized, or the disk is not
        // something we partition.
        let (partitioned, partitionable) = {
            let disk = &self.devices[disk];
            (disk.partitioned(), disk.partitionable())
        };
        if !partitioned {
            if !self.devices[disk].format.is_disklabel() || !partitionable {
                self.system.lvm_reject(&name);
            }
            debug!("Ignoring partition '{name}'");
            return None;
        }

        let msdos = matches!(
            self.devices[disk].format.kind,
            FormatKind::DiskLabel {
                label_type: DiskLabelType::Msdos
            }
        );
        let mut part = if info.extended {
            PartitionInfo::extended(info.number)
        } else if msdos && info.number > 4 {
            PartitionInfo::logical(info.number)
        } else {
            PartitionInfo::primary(info.number)
        };
        part.bootable = info.bootable;

        let id = self.new_device(desc, DeviceKind::Partition(part), vec![disk]);
        self.insert(id)
    }

    fn add_disk_device(&mut self, desc: &DeviceDescriptor) -> Option<DeviceId> {
        let info = DiskInfo::new(desc.transport.clone());
        debug!("'{}' is a {}", desc.device_name(), info.type_name());
        let id = self.new_device(desc, DeviceKind::Disk(info), Vec::new());
        self.insert(id)
    }

    fn add_optical_device(&mut self, desc: &DeviceDescriptor) -> Option<DeviceId> {
        let id = self.new_device(desc, DeviceKind::Optical, Vec::new());
        self.insert(id)
    }

    fn add_loop_device(&mut self, desc: &DeviceDescriptor) -> Option<DeviceId> {
        let Some(backing_file) = desc
            .loop_device
            .as_ref()
            .and_then(|l| l.backing_file.clone())
        else {
            return None;
        };
        let file_name = backing_file.to_string_lossy().into_owned();
        let file = match self.by_name(&file_name) {
            Some(file) => file,
            None => {
                let file = self.devices.add(file_name, DeviceKind::File);
                self.devices[file].exists = true;
                self.insert(file)?
            }
        };

        let id = self.new_device(desc, DeviceKind::Loop(LoopInfo::default()), vec![file]);
        // Only disk image loops may be manipulated, and only during cleanup.
        if !self.cleanup || !self.config.disk_images.values().any(|image| *image == backing_file) {
            self.devices[file].controllable = false;
            self.devices[id].controllable = false;
        }
        self.insert(id)
    }

    /// Creates one multipath device per alias collected from the member
    /// disks, and rewrites the multipath configuration.
    fn add_multipaths(&mut self) -> Result<(), StorageError> {
        let mut whitelist: Vec<String> = Vec::new();
        let aliases: Vec<(String, Vec<DeviceId>)> = self
            .multipath_members
            .iter()
            .map(|(alias, members)| (alias.clone(), members.clone()))
            .collect();

        for (alias, members) in aliases {
            if self.by_name(&alias).is_some() {
                continue;
            }
            info!("Adding multipath device '{alias}'");
            let identity = members
                .first()
                .and_then(|member| self.devices[*member].serial.clone())
                .unwrap_or_default();
            let mpath = self.devices.add_with_parents(
                &alias,
                DeviceKind::Multipath(MultipathInfo::new(identity)),
                members.clone(),
            );
            self.devices[mpath].exists = true;
            if let Err(e) = self.devices.setup(mpath, &mut self.system, false) {
                warn!("Setup of multipath device '{alias}' failed: {e:?}");
            }
            self.enumerate()?;

            let desc = self
                .descriptors
                .iter()
                .find(|desc| desc.is_dm() && desc.device_name() == alias)
                .cloned();
            let desc = match desc {
                Some(desc) if !self.is_ignored(&desc) => desc,
                _ => {
                    debug!("Multipath device '{alias}' is not used");
                    if let Err(e) = self.devices.teardown(mpath, &mut self.system, false) {
                        debug!("Teardown of '{alias}' failed: {e:?}");
                    }
                    continue;
                }
            };

            whitelist.push(alias.clone());
            whitelist.extend(members.iter().map(|member| self.devices[*member].name.clone()));
            if let Some(config) = dm::multipath_config(&self.devices, mpath) {
                self.multipath_config
                    .add_multipath(MultipathEntry::new(config.wwid, config.alias));
            }
            if let Some(size) = desc.size {
                self.devices[mpath].current_size = size;
                self.devices[mpath].target_size = size;
            }
            self.devices[mpath].sysfs_path = desc.sysfs_path.clone();
            if self.insert(mpath).is_some() {
                self.add_descriptor(&desc);
            }
        }

        for id in self.members.clone() {
            let device = &self.devices[id];
            if whitelist.contains(&device.name) {
                continue;
            }
            if let Some(ref serial) = device.serial {
                self.multipath_config
                    .blacklist(BlacklistEntry::Wwid(serial.clone()));
            } else if let (Some(vendor), Some(model)) = (&device.vendor, &device.model) {
                self.multipath_config.blacklist(BlacklistEntry::Device {
                    vendor: vendor.clone(),
                    model: model.clone(),
                });
            }
        }

        self.write_multipath_config()?;
        let bindings = self.config.multipath_bindings_path.clone();
        self.system
            .write_config(&bindings, &self.multipath_config.render_bindings())
            .structured(DeviceTreeError::WriteConfig {
                path: bindings.display().to_string(),
            })
    }

    /// Exposes each configured disk image as a linear device-mapper disk
    /// on a loop device over the image file.
    #[tracing::instrument(skip_all)]
    pub fn setup_disk_images(&mut self) {
        for (name, path) in self.config.disk_images.clone() {
            info!("Setting up disk image file '{}' as '{name}'", path.display());
            if let Err(e) = self.setup_disk_image(&name, &path) {
                error!("Failed to set up disk image '{name}': {e:?}");
            }
        }
    }

    fn setup_disk_image(&mut self, name: &str, path: &Path) -> Result<(), StorageError> {
        let file = self
            .devices
            .add(path.to_string_lossy(), DeviceKind::File);
        self.devices[file].exists = true;
        match self.system.device_size(path) {
            Ok(size) => {
                self.devices[file].current_size = size;
                self.devices[file].target_size = size;
            }
            Err(e) => debug!("Could not size disk image '{}': {e}", path.display()),
        }
        self.devices.setup(file, &mut self.system, false)?;

        let image_loop = self.devices.add_with_parents(
            "",
            DeviceKind::Loop(LoopInfo { disk_image: true }),
            vec![file],
        );
        self.devices[image_loop].name = loopback::placeholder_name(image_loop);
        self.devices[image_loop].exists = true;
        self.devices.setup(image_loop, &mut self.system, false)?;
        self.devices[image_loop].sysfs_path = Some(format!(
            "{SYSFS_VIRTUAL_BLOCK}/{}",
            self.devices[image_loop].name
        ));
        debug!("{}", self.devices[image_loop]);

        let disk = self
            .devices
            .add_with_parents(name, DeviceKind::DmLinear, vec![image_loop]);
        self.devices[disk].exists = true;
        self.devices[disk].uuid = Some(format!("{DM_INTERNAL_UUID_PREFIX}{name}"));
        self.devices.setup(disk, &mut self.system, false)?;
        debug!("{}", self.devices[disk]);

        self.add_device(file)?;
        self.add_device(image_loop)?;
        self.add_device(disk)
    }
}

fn names(descriptors: &[DeviceDescriptor]) -> Vec<&str> {
    descriptors.iter().map(|desc| desc.name.as_str()).collect()
}
