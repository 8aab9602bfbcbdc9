//! Handling of what population finds on a device's data area.

use std::collections::BTreeMap;

use lazy_static::lazy_static;
use log::{debug, error, info, warn};
use regex::Regex;

use devgraph_api::{
    constants::{
        CLEANUP_LUKS_PASSPHRASE, EFI_MAX_SIZE, EFI_MIN_SIZE, LUKS_MAP_PREFIX,
        LVM_INTERNAL_LV_ATTRS, LVM_PE_SIZE,
    },
    descriptor::{format_types, DeviceDescriptor, DiskLabelType, MdMemberProbe},
    error::{DeviceTreeError, ErrorKind, StorageError},
    Size,
};

use crate::{
    actions::ActionSpec,
    devices::{dm, lvm, md, DeviceId, DeviceKind, DmRaidInfo, LogicalVolumeInfo, MdInfo, MdLevel, VolumeGroupInfo},
    formats::{Format, FormatKind},
    system::BlockLayer,
};

use super::DeviceTree;

lazy_static! {
    /// Partition suffix of a device name, e.g. `1` of `sda1` or `p2` of
    /// `nvme0n1p2`.
    static ref PARTITION_SUFFIX: Regex = Regex::new(r"p?\d+$").unwrap();
}

/// Filesystems recognized by type name.
const FILESYSTEMS: [&str; 14] = [
    "ext2", "ext3", "ext4", "xfs", "btrfs", "vfat", "hfs", "hfsplus", "iso9660", "ntfs", "jfs",
    "reiserfs", "gfs2", "udf",
];

/// Highest `mdN` minor handed out to arrays population names itself.
const MD_MAX_MINOR: u32 = 256;

const INCONSISTENT_PV: &str = "This partition is part of an inconsistent LVM Volume Group.";

fn is_duplicate_member(e: &StorageError) -> bool {
    matches!(
        e.kind(),
        ErrorKind::DeviceTree(DeviceTreeError::DuplicateMember { .. })
    )
}

impl<S: BlockLayer> DeviceTree<S> {
    /// Probes the disklabel of `id`, then the format `desc` reports, and
    /// hands the device to the handler of that format.
    pub(super) fn handle_device_format(&mut self, desc: &DeviceDescriptor, id: DeviceId) {
        if !desc.is_biosraid_member() && !desc.is_multipath_member() {
            self.handle_disklabel(desc, id);
            if !self.contains(id) {
                return;
            }
            let device = &self.devices[id];
            if device.partitioned() || (!device.partitionable() && device.format.is_disklabel()) {
                return;
            }
            if self.is_ignored(desc) {
                return;
            }
        }

        if desc.fs_type().is_none() {
            debug!("No format found on {}", self.devices[id]);
            return;
        }
        if let Some(existing) = self.devices[id].format.type_name() {
            debug!("{} already has format '{existing}'", self.devices[id]);
            return;
        }

        let format = self.probe_format(desc, id);
        debug!(
            "Found format '{}' on {}",
            format.display_name(),
            self.devices[id]
        );
        self.devices[id].format = format;

        match self.devices[id].format.kind {
            FormatKind::Luks { .. } => self.handle_luks(id),
            FormatKind::MdMember { .. } => self.handle_md_member(desc, id),
            FormatKind::DmRaidMember { .. } => self.handle_dmraid_member(desc, id),
            FormatKind::LvmPv { .. } => self.handle_lvm_pv(desc, id),
            FormatKind::MultipathMember { .. } => self.handle_multipath_member(id),
            _ => (),
        }
    }

    /// The existing format `desc` describes.
    fn probe_format(&self, desc: &DeviceDescriptor, id: DeviceId) -> Format {
        let probe = &desc.format;
        let kind = if desc.is_multipath_member() {
            FormatKind::MultipathMember {
                alias: probe.multipath_alias.clone(),
            }
        } else if desc.is_luks() {
            FormatKind::Luks {
                map_name: probe.uuid.as_ref().map(|uuid| format!("{LUKS_MAP_PREFIX}{uuid}")),
                passphrase: None,
            }
        } else if desc.is_md_member() {
            FormatKind::MdMember {
                array_uuid: probe.md.as_ref().map(|md| md.uuid.clone()),
            }
        } else if desc.is_dmraid_member() {
            FormatKind::DmRaidMember {
                sets: probe.raid_sets.clone(),
            }
        } else if desc.is_lvm_pv() {
            let lvm = probe.lvm.as_ref();
            FormatKind::LvmPv {
                vg_name: lvm.map(|lvm| lvm.vg_name.clone()),
                vg_uuid: lvm.map(|lvm| lvm.vg_uuid.clone()),
                pe_start: lvm.map(|lvm| lvm.pe_start).unwrap_or_default(),
            }
        } else {
            match desc.fs_type().unwrap_or_default() {
                format_types::SWAP => FormatKind::Swap,
                format_types::VFAT if self.is_efi_candidate(id) => FormatKind::Efi,
                format_types::HFS if self.is_apple_boot_candidate(id) => FormatKind::AppleBoot,
                fs_type if FILESYSTEMS.contains(&fs_type) => FormatKind::Filesystem {
                    fs_type: fs_type.to_string(),
                },
                other => FormatKind::Unknown {
                    name: other.to_string(),
                },
            }
        };

        let mut format = Format::new(kind).existing();
        format.uuid = probe.uuid.clone();
        format.label = probe.label.clone();
        format.current_size = self.devices.size(id);
        format.target_size = format.current_size;
        format
    }

    fn is_bootable_partition(&self, id: DeviceId) -> bool {
        self.devices[id].as_partition().is_some_and(|part| part.bootable)
    }

    fn is_efi_candidate(&self, id: DeviceId) -> bool {
        let size = self.devices.size(id);
        self.is_bootable_partition(id) && size >= EFI_MIN_SIZE && size <= EFI_MAX_SIZE
    }

    fn is_apple_boot_candidate(&self, id: DeviceId) -> bool {
        let on_mac_label = self.devices[id].parents.first().is_some_and(|disk| {
            self.devices[*disk].format.kind
                == FormatKind::DiskLabel {
                    label_type: DiskLabelType::Mac,
                }
        });
        self.is_bootable_partition(id) && on_mac_label
    }

    /// Whether `desc` is a disk holding one of the protected devices.
    fn holds_protected(&self, desc: &DeviceDescriptor) -> bool {
        let name = desc.device_name();
        self.protected_names.iter().any(|protected| {
            let is_partition = self.descriptors.iter().any(|d| {
                d.device_name() == protected
                    && d.partition.as_ref().is_some_and(|part| part.disk == desc.name)
            });
            is_partition || PARTITION_SUFFIX.replace(protected, "") == name
        })
    }

    /// Reads the partition table of a disk, or queues a new one.
    pub(super) fn handle_disklabel(&mut self, desc: &DeviceDescriptor, id: DeviceId) {
        if desc.fs_type().is_some() || self.devices[id].partitioned() {
            return;
        }

        if let Err(e) = self.devices.setup(id, &mut self.system, false) {
            debug!("Setup of {} failed: {e:?}", self.devices[id]);
            warn!(
                "Aborting disklabel handling for {}: setup failed",
                self.devices[id]
            );
            return;
        }

        let name = self.devices[id].name.clone();
        if !self.devices[id].partitionable() {
            // Partitions of such a device are ignored, the label is only
            // recorded.
            let has_partitions = self
                .descriptors
                .iter()
                .any(|d| d.partition.as_ref().is_some_and(|part| part.disk == desc.name));
            if let (Some(label_type), true) = (desc.partition_table, has_partitions) {
                debug!("Found {label_type} disklabel on non-partitionable '{name}'");
                self.devices[id].format = Format::disklabel(label_type).existing();
            }
            return;
        }

        let clear_part = self.config.clear_part_disks.is_empty()
            || self.config.clear_part_disks.contains(&name);
        let mut initlabel = self.config.reinitialize_disks && clear_part;
        if initlabel && self.holds_protected(desc) {
            debug!("Not reinitializing '{name}': it holds a protected device");
            initlabel = false;
        }

        let label_type = if desc.is_dasd() {
            DiskLabelType::Dasd
        } else {
            desc.partition_table.unwrap_or_default()
        };

        if !initlabel {
            if let Some(existing) = desc.partition_table {
                let mut label = Format::disklabel(existing).existing();
                label.current_size = self.devices.size(id);
                self.devices[id].format = label;
                return;
            }

            let initialize = if self.cleanup {
                false
            } else if self.config.zero_mbr {
                true
            } else {
                let hint = desc
                    .by_path()
                    .and_then(|link| link.rsplit('/').next())
                    .unwrap_or(name.as_str())
                    .to_string();
                let device = &self.devices[id];
                let description = match (&device.vendor, &device.model) {
                    (Some(vendor), Some(model)) => format!("{vendor} {model}"),
                    (_, Some(model)) => model.clone(),
                    (Some(vendor), None) => vendor.clone(),
                    (None, None) => device.type_name().to_string(),
                };
                let size = self.devices.size(id);
                self.policy.initialize_disk(&hint, &description, size)
            };

            if !initialize {
                info!("Not initializing '{name}', ignoring it");
                if let Err(e) = self.remove_device(id, false, false) {
                    warn!("Failed to remove declined disk '{name}': {e:?}");
                }
                self.add_ignored_disk(&name);
                return;
            }
        }

        info!("Queueing a new {label_type} disklabel on '{name}'");
        let queued = self
            .schedule(id, ActionSpec::DestroyFormat)
            .and_then(|_| self.schedule(id, ActionSpec::CreateFormat(Format::disklabel(label_type))));
        if let Err(e) = queued {
            error!("Failed to queue a new disklabel on '{name}': {e:?}");
        }
    }

    /// Opens the mapping of a LUKS format and adds it to the tree.
    pub(super) fn handle_luks(&mut self, id: DeviceId) {
        let device = &self.devices[id];
        let Some(uuid) = device.format.uuid.clone() else {
            info!("LUKS format on {device} has no UUID");
            return;
        };
        let map_name = device
            .format
            .map_name()
            .map(str::to_string)
            .unwrap_or_else(|| format!("{LUKS_MAP_PREFIX}{uuid}"));
        if let Some(existing) = self.by_name(&map_name) {
            warn!(
                "LUKS mapping '{map_name}' of {} is already in the tree as {}",
                self.devices[id], self.devices[existing]
            );
            return;
        }

        let name = self.devices[id].name.clone();
        let path = self.devices.path(id);
        let passphrase = match self.config.luks_passphrases.get(&uuid) {
            Some(passphrase) => Some(passphrase.clone()),
            // Only mappings that are already open can be used while cleaning up.
            None if self.cleanup => self.devices[id]
                .format
                .status(&self.system, &path)
                .then(|| CLEANUP_LUKS_PASSPHRASE.to_string()),
            None => self.policy.luks_passphrase(&name, Some(&uuid)),
        };
        let Some(passphrase) = passphrase else {
            info!("No passphrase for LUKS device '{name}', leaving it closed");
            return;
        };

        set_luks(&mut self.devices[id].format, Some(map_name.clone()), Some(passphrase));
        let luks = self
            .devices
            .add_with_parents(&map_name, DeviceKind::Luks, vec![id]);
        self.devices[luks].exists = true;
        if let Err(e) = self.devices.setup(luks, &mut self.system, false) {
            info!("Failed to open LUKS device '{name}': {e:?}");
            set_luks(&mut self.devices[id].format, Some(map_name), None);
            return;
        }
        self.insert(luks);
    }

    /// Adds a physical volume to its volume group, creating the group on
    /// its first member, and records the logical volumes it describes.
    pub(super) fn handle_lvm_pv(&mut self, desc: &DeviceDescriptor, id: DeviceId) {
        let Some(ref probe) = desc.format.lvm else {
            info!("Physical volume {} has no volume group", self.devices[id]);
            return;
        };

        let existing = self.members.iter().copied().find(|member| {
            let device = &self.devices[*member];
            device.as_volume_group().is_some() && device.name == probe.vg_name
        });
        let vg = match existing {
            Some(vg) => {
                match lvm::vg_add_existing_pv(&mut self.devices, vg, id) {
                    Ok(_) => self.devices[id].kids += 1,
                    Err(e) if is_duplicate_member(&e) => {
                        debug!("{} is already a member of '{}'", self.devices[id], probe.vg_name);
                    }
                    Err(e) => {
                        warn!("Failed to add {} to '{}': {e:?}", self.devices[id], probe.vg_name);
                        return;
                    }
                }
                vg
            }
            None => {
                let info = VolumeGroupInfo {
                    pe_size: probe.pe_size.unwrap_or(LVM_PE_SIZE),
                    pv_count: probe.pv_count as usize,
                    ..Default::default()
                };
                let vg = self.devices.add_with_parents(
                    &probe.vg_name,
                    DeviceKind::VolumeGroup(info),
                    vec![id],
                );
                let device = &mut self.devices[vg];
                device.exists = true;
                device.uuid = Some(probe.vg_uuid.clone());
                device.current_size = probe.vg_size;
                device.target_size = probe.vg_size;
                match self.insert(vg) {
                    Some(vg) => vg,
                    None => return,
                }
            }
        };

        let infos = self.lv_infos.entry(vg).or_default();
        for lv in &probe.lvs {
            if !infos.iter().any(|known| known.name == lv.name) {
                infos.push(lv.clone());
            }
        }
    }

    /// Materializes the logical volumes of every complete volume group.
    /// Returns whether any new volume was added.
    pub(super) fn setup_lvs(&mut self) -> bool {
        let vgs: Vec<DeviceId> = self
            .members
            .iter()
            .copied()
            .filter(|member| self.devices[*member].as_volume_group().is_some())
            .collect();
        let mut progress = false;
        for vg in vgs {
            progress |= self.handle_vg_lvs(vg);
        }
        progress
    }

    fn handle_vg_lvs(&mut self, vg: DeviceId) -> bool {
        let vg_name = self.devices[vg].name.clone();
        if !lvm::vg_complete(&self.devices, vg) {
            warn!("Skipping logical volumes of incomplete volume group '{vg_name}'");
            return false;
        }
        let Some(infos) = self.lv_infos.get(&vg).cloned() else {
            debug!("No logical volumes known for '{vg_name}'");
            return false;
        };

        let (snapshots, volumes): (Vec<_>, Vec<_>) = infos
            .iter()
            .partition(|lv| lv.attr.starts_with(['S', 's']));

        let mut progress = false;
        for lv in volumes {
            let attr = lv.attr.chars().next().unwrap_or('-');
            if LVM_INTERNAL_LV_ATTRS.contains(&attr) {
                debug!("Skipping internal logical volume '{}'", lv.name);
                continue;
            }
            if self.by_name(&format!("{vg_name}-{}", lv.name)).is_some() {
                continue;
            }

            let mut info = LogicalVolumeInfo::new(&lv.name);
            if matches!(attr, 'M' | 'm') {
                let image = format!("[{}_mimage_", lv.name);
                let log = format!("[{}_mlog]", lv.name);
                info.stripes = infos
                    .iter()
                    .filter(|other| other.name.starts_with(&image))
                    .count()
                    .max(1) as u64;
                if let Some(log) = infos.iter().find(|other| other.name == log) {
                    info.log_size = log.size;
                }
            }

            let id = match lvm::add_logical_volume(&mut self.devices, vg, info, lv.size, true) {
                Ok(id) => id,
                Err(e) => {
                    error!("Failed to add logical volume '{}' to '{vg_name}': {e:?}", lv.name);
                    continue;
                }
            };
            self.devices[id].uuid = lv.uuid.clone();
            if self.insert(id).is_none() {
                if let Err(e) = lvm::remove_logical_volume(&mut self.devices, vg, id) {
                    debug!("Failed to drop '{}' from '{vg_name}': {e:?}", lv.name);
                }
                continue;
            }
            if let Err(e) = self.devices.setup(id, &mut self.system, false) {
                warn!("Failed to activate {}: {e:?}", self.devices[id]);
            }
            progress = true;
        }

        // Snapshots are accounted to their origin, not represented.
        let mut snapshot_space: BTreeMap<&str, Size> = BTreeMap::new();
        let mut vorigin = Vec::new();
        for snapshot in snapshots {
            let Some(ref origin) = snapshot.origin else {
                continue;
            };
            if origin.ends_with("_vorigin]") {
                vorigin.push((snapshot.name.clone(), snapshot.size));
            } else {
                *snapshot_space.entry(origin.as_str()).or_default() += snapshot.size;
            }
        }
        for (origin, space) in snapshot_space {
            let origin_lv = self.by_name(&format!("{vg_name}-{origin}"));
            match origin_lv.map(|lv| &mut self.devices[lv].kind) {
                Some(DeviceKind::LogicalVolume(ref mut info)) => info.snapshot_space = space,
                _ => warn!("Snapshot origin '{origin}' not found in '{vg_name}'"),
            }
        }
        if let DeviceKind::VolumeGroup(ref mut info) = self.devices[vg].kind {
            vorigin.dedup();
            info.vorigin_snapshots = vorigin;
        }

        progress
    }

    /// Adds an MD member to its array, creating the array on its first
    /// member.
    pub(super) fn handle_md_member(&mut self, desc: &DeviceDescriptor, id: DeviceId) {
        let Some(ref probe) = desc.format.md else {
            warn!("MD member {} has no array data", self.devices[id]);
            return;
        };

        let existing = self.members.iter().copied().find(|member| {
            let device = &self.devices[*member];
            device.as_md().is_some() && device.uuid.as_deref() == Some(probe.uuid.as_str())
        });
        if let Some(array) = existing {
            match md::add_existing_member(&mut self.devices, array, id) {
                Ok(()) => self.devices[id].kids += 1,
                Err(e) if is_duplicate_member(&e) => {
                    debug!("{} is already a member of {}", self.devices[id], self.devices[array]);
                }
                Err(e) => warn!(
                    "Failed to add {} to {}: {e:?}",
                    self.devices[id], self.devices[array]
                ),
            }
            return;
        }

        let level = match probe.level.parse::<MdLevel>() {
            Ok(level) => level,
            Err(e) => {
                warn!("Invalid RAID level on {}: {e}", self.devices[id]);
                return;
            }
        };
        let Some(name) = self.md_array_name(probe) else {
            error!("No free MD device name for array {}", probe.uuid);
            return;
        };
        let count = match probe.devices {
            0 => self
                .system
                .md_examine(&self.devices.path(id))
                .ok()
                .and_then(|examine| examine.devices)
                .unwrap_or(1),
            count => count,
        };
        let count = count as usize;

        let array = match md::new_array(
            &mut self.devices,
            &name,
            MdInfo::new(level, count, count),
            Vec::new(),
            true,
        ) {
            Ok(array) => array,
            Err(e) => {
                error!("Failed to add MD array '{name}': {e:?}");
                return;
            }
        };
        self.devices[array].uuid = Some(probe.uuid.clone());
        if let Err(e) = md::add_existing_member(&mut self.devices, array, id) {
            error!("Failed to add {} to '{name}': {e:?}", self.devices[id]);
            return;
        }
        if self.insert(array).is_none() {
            return;
        }

        // Pins the name of the array when it is assembled.
        let hint = format!(
            "ARRAY {} UUID={}\n",
            self.devices.path(array).display(),
            probe.uuid
        );
        let conf = self.config.mdadm_conf_path.clone();
        if let Err(e) = self.system.append_config(&conf, &hint) {
            warn!("Failed to write '{}': {e:?}", conf.display());
        }
    }

    /// The name of a new array: the one the kernel uses, the one the member
    /// metadata prefers, or the first unused `mdN`.
    fn md_array_name(&self, probe: &MdMemberProbe) -> Option<String> {
        let enumerated = self.descriptors.iter().find(|d| {
            d.is_md()
                && d.md.as_ref().is_some_and(|md| {
                    md.uuid.as_deref() == Some(probe.uuid.as_str()) && md.level == probe.level
                })
        });
        if let Some(desc) = enumerated {
            return Some(desc.device_name().to_string());
        }

        let preferred = probe
            .device
            .as_deref()
            .map(|device| device.trim_start_matches("/dev/").replacen("md/", "md", 1))
            .filter(|name| {
                self.by_name(name)
                    .map_or(true, |taken| self.devices[taken].uuid.as_deref() == Some(probe.uuid.as_str()))
            });
        if preferred.is_some() {
            return preferred;
        }

        (0..MD_MAX_MINOR)
            .map(|minor| format!("md{minor}"))
            .find(|name| self.by_name(name).is_none() && self.descriptor(name).is_none())
    }

    /// Adds a firmware RAID member to its sets, activating each new set.
    pub(super) fn handle_dmraid_member(&mut self, desc: &DeviceDescriptor, id: DeviceId) {
        let name = self.devices[id].name.clone();
        let sets = desc.format.raid_sets.clone();
        if sets.is_empty() {
            info!("No RAID set found for member '{name}'");
            if !self.unused_raid_members.contains(&name) {
                self.unused_raid_members.push(name.clone());
            }
            self.add_ignored_disk(&name);
            return;
        }
        if sets.iter().all(|set| self.ignored_disks.contains(set)) {
            info!("Every RAID set of '{name}' is ignored");
            self.add_ignored_disk(&name);
            return;
        }

        for set in sets {
            if self.ignored_disks.contains(&set) {
                continue;
            }
            if let Some(array) = self.by_name(&set) {
                if !self.devices[array].parents.contains(&id) {
                    self.devices[array].parents.push(id);
                    self.devices[id].kids += 1;
                }
                continue;
            }

            let array = self.devices.add_with_parents(
                &set,
                DeviceKind::DmRaid(DmRaidInfo {
                    raid_set: set.clone(),
                }),
                vec![id],
            );
            self.devices[array].exists = true;
            if let Err(e) = self.devices.setup(array, &mut self.system, false) {
                warn!("Failed to activate RAID set '{set}': {e:?}");
                continue;
            }
            if self.insert(array).is_none() {
                continue;
            }
            if let Err(e) = self.system.settle() {
                debug!("Failed to settle after activating '{set}': {e:?}");
            }

            let set_desc = match self.descriptor(&set) {
                Some(set_desc) => Some(set_desc),
                None => match self.system.enumerate() {
                    Ok(descriptors) => {
                        self.descriptors = descriptors;
                        self.descriptor(&set)
                    }
                    Err(e) => {
                        warn!("Failed to enumerate after activating '{set}': {e:?}");
                        None
                    }
                },
            };
            match set_desc {
                Some(set_desc) => {
                    if let Some(ref sysfs_path) = set_desc.sysfs_path {
                        self.devices[array].sysfs_path = Some(sysfs_path.clone());
                    }
                    self.handle_disklabel(&set_desc, array);
                }
                None => warn!("RAID set '{set}' did not show up after activation"),
            }
        }
    }

    /// Records a multipath path under its alias. A path found after the
    /// multipath device was built is added to it.
    pub(super) fn handle_multipath_member(&mut self, id: DeviceId) {
        let FormatKind::MultipathMember {
            alias: Some(ref alias),
        } = self.devices[id].format.kind
        else {
            warn!("Multipath member {} has no alias", self.devices[id]);
            return;
        };
        let alias = alias.clone();

        let members = self.multipath_members.entry(alias.clone()).or_default();
        if !members.contains(&id) {
            members.push(id);
        }

        let Some(mpath) = self.by_name(&alias) else {
            return;
        };
        if self.devices[mpath].parents.contains(&id) {
            return;
        }
        match dm::multipath_add_parent(&mut self.devices, mpath, id, &mut self.system) {
            Ok(()) => self.devices[id].kids += 1,
            Err(e) => warn!("Failed to add {} to '{alias}': {e:?}", self.devices[id]),
        }
    }

    /// Resolves volume groups with missing physical volumes: they are
    /// either wiped or hidden together with their members.
    #[tracing::instrument(skip_all)]
    pub fn handle_inconsistencies(&mut self) {
        let incomplete: Vec<DeviceId> = self
            .members
            .iter()
            .copied()
            .filter(|member| {
                self.devices[*member].as_volume_group().is_some()
                    && !lvm::vg_complete(&self.devices, *member)
            })
            .collect();

        for vg in incomplete {
            let vg_name = self.devices[vg].name.clone();
            let pvs = self.devices[vg].parents.clone();
            let pv_paths: Vec<String> = pvs
                .iter()
                .map(|pv| self.devices.path(*pv).display().to_string())
                .collect();
            let reinitialize = !self.cleanup
                && (self.config.zero_mbr
                    || self
                        .policy
                        .reinitialize_inconsistent_lvm(&pv_paths, &vg_name));

            if reinitialize {
                info!("Reinitializing inconsistent volume group '{vg_name}'");
                if let Err(e) = self.devices.destroy(vg, &mut self.system) {
                    warn!("Failed to remove volume group '{vg_name}': {e:?}");
                }
                if let Err(e) = self.remove_device(vg, false, false) {
                    warn!("Failed to drop volume group '{vg_name}' from the tree: {e:?}");
                }
                for pv in pvs {
                    let path = self.devices.path(pv);
                    let mut format = self.devices[pv].format.clone();
                    if let Err(e) = format.destroy(&mut self.system, &path) {
                        warn!("Failed to wipe {}: {e:?}", self.devices[pv]);
                    }
                    self.devices[pv].format = Format::default();
                }
                continue;
            }

            info!("Ignoring inconsistent volume group '{vg_name}'");
            if let Err(e) = self.remove_device(vg, false, false) {
                warn!("Failed to drop volume group '{vg_name}' from the tree: {e:?}");
            }
            self.system.lvm_reject(&vg_name);
            for pv in pvs {
                let pv_name = self.devices[pv].name.clone();
                if self.devices[pv].is_partition() {
                    self.devices[pv].immutable = Some(INCONSISTENT_PV.to_string());
                } else {
                    if let Err(e) = self.remove_device(pv, false, false) {
                        warn!("Failed to drop '{pv_name}' from the tree: {e:?}");
                    }
                    self.add_ignored_disk(&pv_name);
                }
                self.system.lvm_reject(&pv_name);
            }
        }

        let unused: Vec<String> = self
            .members
            .iter()
            .filter(|member| {
                let device = &self.devices[**member];
                device.is_leaf() && device.as_md().is_some_and(|md| md.level == MdLevel::Container)
            })
            .flat_map(|container| self.devices[*container].parents.iter())
            .map(|member| self.devices[*member].name.clone())
            .collect();
        for name in unused {
            if !self.unused_raid_members.contains(&name) {
                self.unused_raid_members.push(name);
            }
        }
    }
}

fn set_luks(format: &mut Format, name: Option<String>, secret: Option<String>) {
    if let FormatKind::Luks {
        ref mut map_name,
        ref mut passphrase,
    } = format.kind
    {
        *map_name = name;
        *passphrase = secret;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use devgraph_api::{
        config::ScanConfig,
        descriptor::{DescriptorKind, DmTarget, LvInfo},
    };

    use crate::{
        interface::BatchPolicy,
        system::simulated::SimulatedSystem,
        testutils::{disk, dm, formatted, lv, lvm_pv, partition, populated_tree, tree_with},
    };

    fn gpt_disk(name: &str) -> DeviceDescriptor {
        let mut desc = disk(name, Size::from_gib(10));
        desc.partition_table = Some(DiskLabelType::Gpt);
        desc
    }

    #[test]
    fn test_volume_group_and_logical_volumes() {
        let lvs = vec![
            lv("root", Size::from_gib(4), "-wi-a-----"),
            lv("home", Size::from_gib(2), "owi-a-s---"),
            LvInfo {
                origin: Some("home".into()),
                ..lv("home_snap", Size::from_mib(512), "swi-a-s---")
            },
            lv("[lvol0_mlog]", Size::from_mib(4), "lwi-------"),
        ];
        let descriptors = vec![
            gpt_disk("sda"),
            lvm_pv(partition("sda", 1, Size::from_gib(9)), "data", "vg-uuid", 1, lvs),
            dm("dm-0", "data-root", DmTarget::Lvm, &["sda1"]),
        ];
        let tree = populated_tree(descriptors);

        let vg = tree.by_name("data").unwrap();
        assert_eq!(tree.devices()[vg].type_name(), "lvmvg");
        assert!(lvm::vg_complete(tree.devices(), vg));
        let root = tree.by_name("data-root").unwrap();
        let home = tree.by_name("data-home").unwrap();
        assert_eq!(tree.devices()[root].current_size, Size::from_gib(4));
        assert_eq!(
            tree.devices()[home].as_logical_volume().unwrap().snapshot_space,
            Size::from_mib(512)
        );
        assert!(tree.by_name("data-home_snap").is_none());
        assert_eq!(tree.devices()[vg].kids, 2);
        // Only the volume without an active mapping needed activation.
        let calls = tree.system().calls();
        assert!(calls.contains(&"lv_activate data home true".to_string()));
        assert!(!calls.contains(&"lv_activate data root true".to_string()));
    }

    #[test]
    fn test_mirror_stripes_and_log() {
        let lvs = vec![
            lv("mirror", Size::from_gib(1), "mwi-a-m---"),
            lv("[mirror_mimage_0]", Size::from_gib(1), "iwi-aom---"),
            lv("[mirror_mimage_1]", Size::from_gib(1), "iwi-aom---"),
            lv("[mirror_mlog]", Size::from_mib(4), "lwi-aom---"),
        ];
        let tree = populated_tree(vec![
            gpt_disk("sda"),
            lvm_pv(partition("sda", 1, Size::from_gib(9)), "data", "vg-uuid", 1, lvs),
        ]);

        let mirror = tree.by_name("data-mirror").unwrap();
        let info = tree.devices()[mirror].as_logical_volume().unwrap();
        assert_eq!(info.stripes, 2);
        assert_eq!(info.log_size, Size::from_mib(4));
        assert!(tree.by_name("data-[mirror_mimage_0]").is_none());
        assert_eq!(tree.by_type("lvmlv").len(), 1);
    }

    #[test]
    fn test_duplicate_volume_group_names() {
        let lvs = vec![lv("root", Size::from_gib(1), "-wi-a-----")];
        let tree = populated_tree(vec![
            gpt_disk("sda"),
            lvm_pv(partition("sda", 1, Size::from_gib(5)), "data", "uuid-a", 1, lvs.clone()),
            gpt_disk("sdb"),
            lvm_pv(partition("sdb", 1, Size::from_gib(5)), "data", "uuid-b", 1, lvs),
        ]);

        // Both groups are inconsistent as one, and nobody agreed to wipe them.
        assert!(tree.by_name("data").is_none());
        let sda1 = tree.by_name("sda1").unwrap();
        let sdb1 = tree.by_name("sdb1").unwrap();
        assert_eq!(tree.devices()[sda1].immutable.as_deref(), Some(INCONSISTENT_PV));
        assert_eq!(tree.devices()[sdb1].immutable.as_deref(), Some(INCONSISTENT_PV));
        assert!(tree.devices()[sda1].is_leaf());
        let rejected = tree.system().rejected();
        assert!(rejected.contains(&"data".to_string()));
        assert!(rejected.contains(&"sdb1".to_string()));
    }

    #[test]
    fn test_duplicate_marks_group() {
        let mut tree = tree_with(Vec::new(), ScanConfig::default(), Box::new(BatchPolicy::cleanup()));
        let first = lvm_pv(disk("sdc", Size::from_gib(1)), "data", "uuid-a", 2, Vec::new());
        let second = lvm_pv(disk("sdd", Size::from_gib(1)), "data", "uuid-b", 2, Vec::new());
        for desc in [&first, &second] {
            let id = tree.devices.add(desc.name.clone(), DeviceKind::Disk(Default::default()));
            tree.devices[id].exists = true;
            tree.add_device(id).unwrap();
            tree.devices[id].format = tree.probe_format(desc, id);
            tree.handle_lvm_pv(desc, id);
        }

        let vg = tree.by_name("data").unwrap();
        let info = tree.devices()[vg].as_volume_group().unwrap();
        assert!(info.has_duplicate);
        assert_eq!(tree.devices()[vg].parents.len(), 2);
        assert!(!lvm::vg_complete(tree.devices(), vg));
    }

    #[test]
    fn test_inconsistent_group_reinitialized() {
        let lvs = vec![lv("root", Size::from_gib(1), "-wi-a-----")];
        let config = ScanConfig {
            zero_mbr: true,
            ..Default::default()
        };
        let mut tree = tree_with(
            vec![
                gpt_disk("sda"),
                lvm_pv(partition("sda", 1, Size::from_gib(5)), "data", "vg-uuid", 2, lvs),
            ],
            config,
            Box::new(BatchPolicy::cleanup()),
        );
        tree.populate(false).unwrap();

        assert!(tree.by_name("data").is_none());
        let sda1 = tree.by_name("sda1").unwrap();
        assert_eq!(tree.devices()[sda1].format.type_name(), None);
        assert!(tree.devices()[sda1].immutable.is_none());
        let calls = tree.system().calls();
        assert!(calls.contains(&"pv_remove /dev/sda1".to_string()));
        assert!(calls.contains(&"wipe /dev/sda1".to_string()));
    }

    #[test]
    fn test_cleanup_never_reinitializes() {
        let lvs = vec![lv("root", Size::from_gib(1), "-wi-a-----")];
        let mut tree = tree_with(
            vec![lvm_pv(disk("sdb", Size::from_gib(5)), "data", "vg-uuid", 2, lvs)],
            ScanConfig {
                zero_mbr: true,
                ..Default::default()
            },
            Box::new(BatchPolicy::cleanup()),
        );
        tree.populate(true).unwrap();

        assert!(tree.by_name("data").is_none());
        assert!(tree.by_name("sdb").is_none());
        assert_eq!(tree.ignored_disks(), &["sdb"]);
        assert!(!tree.system().calls().iter().any(|call| call.starts_with("pv_remove")));
    }

    #[test]
    fn test_dmraid_members() {
        let members: Vec<DeviceDescriptor> = ["sda", "sdb"]
            .iter()
            .map(|name| {
                let mut member = formatted(disk(name, Size::from_gib(10)), "isw_raid_member");
                member.format.raid_sets = vec!["isw_abc_Volume0".into()];
                member
            })
            .collect();
        let mut set = dm("dm-0", "isw_abc_Volume0", DmTarget::Raid, &["sda", "sdb"]);
        set.partition_table = Some(DiskLabelType::Msdos);
        let orphan = formatted(disk("sdc", Size::from_gib(10)), "isw_raid_member");

        let mut system = SimulatedSystem::new(members);
        system.add_descriptor(orphan);
        system.add_descriptor_when_active(set, "/dev/mapper/isw_abc_Volume0");
        let mut tree = DeviceTree::new(system, ScanConfig::default(), Box::new(BatchPolicy::cleanup()));
        tree.populate(false).unwrap();

        let array = tree.by_name("isw_abc_Volume0").unwrap();
        assert_eq!(tree.devices()[array].type_name(), "dm-raid array");
        assert_eq!(tree.devices()[array].parents.len(), 2);
        assert!(tree.devices()[array].partitioned());
        assert_eq!(tree.unused_raid_members(), &["sdc"]);
        assert!(tree.ignored_disks().contains(&"sdc".to_string()));
    }

    #[test]
    fn test_md_naming() {
        let mut tree = tree_with(
            vec![disk("md0", Size::from_gib(1))],
            ScanConfig::default(),
            Box::new(BatchPolicy::cleanup()),
        );
        tree.populate(false).unwrap();

        let probe = MdMemberProbe {
            uuid: "abcd".into(),
            level: "raid1".into(),
            devices: 2,
            device: Some("/dev/md/home".into()),
            ..Default::default()
        };
        assert_eq!(tree.md_array_name(&probe).as_deref(), Some("mdhome"));

        let probe = MdMemberProbe {
            device: None,
            ..probe
        };
        assert_eq!(tree.md_array_name(&probe).as_deref(), Some("md1"));
    }

    #[test]
    fn test_efi_partition_detected() {
        let sda = gpt_disk("sda");
        let mut esp = formatted(partition("sda", 1, Size::from_mib(200)), "vfat");
        esp.partition.as_mut().unwrap().bootable = true;
        let data = formatted(partition("sda", 2, Size::from_mib(200)), "vfat");
        let unknown = formatted(partition("sda", 3, Size::from_mib(200)), "zfs_member");
        let tree = populated_tree(vec![sda, esp, data, unknown]);

        let efi = tree.by_name("sda1").unwrap();
        assert_eq!(tree.devices()[efi].format.kind, FormatKind::Efi);
        let data = tree.by_name("sda2").unwrap();
        assert_eq!(tree.devices()[data].format.type_name(), Some("vfat"));
        let unknown = tree.by_name("sda3").unwrap();
        assert_eq!(tree.devices()[unknown].format.type_name(), Some("zfs_member"));
    }

    #[test]
    fn test_cleanup_uses_open_luks_mapping() {
        let mut sda1 = formatted(partition("sda", 1, Size::from_mib(500)), "crypto_LUKS");
        sda1.format.uuid = Some("1234".into());
        // Opened under a name that differs from the default one.
        let mapping = dm("dm-0", "luks-sda1", DmTarget::Crypt, &["sda1"]);
        let mut tree = tree_with(
            vec![gpt_disk("sda"), sda1, mapping],
            ScanConfig::default(),
            Box::new(BatchPolicy::cleanup()),
        );
        tree.populate(true).unwrap();

        let luks = tree.by_name("luks-sda1").unwrap();
        assert_eq!(tree.devices()[luks].type_name(), "luks/dm-crypt");
        let sda1 = tree.by_name("sda1").unwrap();
        assert_eq!(tree.devices()[sda1].format.map_name(), Some("luks-sda1"));
        assert!(!tree
            .system()
            .calls()
            .iter()
            .any(|call| call.starts_with("luks_open")));
    }

    #[test]
    fn test_md_container_members_unused() {
        let mut container = disk("md127", Size::from_gib(1));
        container.kind = DescriptorKind::Md;
        container.md = Some(devgraph_api::descriptor::MdInfo {
            level: "container".into(),
            uuid: Some("c-uuid".into()),
            ..Default::default()
        });
        let mut member = formatted(disk("sda", Size::from_gib(1)), "isw_raid_member");
        member.format.md = Some(MdMemberProbe {
            uuid: "c-uuid".into(),
            level: "container".into(),
            devices: 1,
            ..Default::default()
        });
        container.slaves = vec!["sda".into()];
        let tree = populated_tree(vec![member, container]);

        let container = tree.by_name("md127").unwrap();
        assert_eq!(tree.devices()[container].type_name(), "mdcontainer");
        assert_eq!(tree.unused_raid_members(), &["sda"]);
    }

    #[test]
    fn test_pv_without_group_metadata() {
        let pv = DeviceDescriptor {
            format: devgraph_api::descriptor::FormatProbe {
                fs_type: Some("LVM2_member".into()),
                lvm: None,
                ..Default::default()
            },
            ..disk("sdb", Size::from_gib(1))
        };
        let tree = populated_tree(vec![pv]);
        let sdb = tree.by_name("sdb").unwrap();
        assert!(tree.devices()[sdb].format.is_lvmpv());
        assert!(tree.by_type("lvmvg").is_empty());
    }
}
