use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Error};
use log::trace;

use devgraph_api::{
    constants::{DEV_DIRECTORY, DEV_MAPPER_DIRECTORY, LUKS_METADATA_SIZE},
    descriptor::{DescriptorKind, DeviceDescriptor, DiskLabelType},
    error::DiskLabelCommitError,
    Size,
};

use super::{BlockLayer, MapState, MdCreateRequest, MemberInfo, PartitionRequest};

/// When a descriptor shows up in enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Visibility {
    Always,
    /// Only once the given node is active.
    WhenActive(PathBuf),
}

/// A failure to raise the next time a matching call is made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    /// The command exits with an error.
    Command,
    /// The kernel refuses the new partition table of `disk`.
    DiskLabelCommit { disk: String },
}

/// In-memory block layer. Every call is appended to [`SimulatedSystem::calls`]
/// so tests can assert on the exact sequence of operations.
#[derive(Debug, Default)]
pub struct SimulatedSystem {
    descriptors: Vec<(DeviceDescriptor, Visibility)>,
    calls: Vec<String>,
    failures: Vec<(String, Failure)>,

    nodes: BTreeSet<PathBuf>,
    sizes: BTreeMap<PathBuf, Size>,
    labels: BTreeMap<PathBuf, DiskLabelType>,
    partitions: BTreeMap<PathBuf, BTreeMap<u32, Size>>,
    maps: BTreeMap<String, MapState>,
    arrays: BTreeMap<String, String>,
    examine: BTreeMap<PathBuf, MemberInfo>,
    loops: BTreeMap<String, PathBuf>,
    files: BTreeSet<PathBuf>,
    mounted: BTreeSet<PathBuf>,
    swaps: BTreeSet<PathBuf>,
    pv_free: BTreeMap<String, Vec<(PathBuf, Size)>>,
    configs: BTreeMap<PathBuf, String>,
    backups: BTreeMap<PathBuf, String>,
    rejected: Vec<String>,
}

impl SimulatedSystem {
    pub fn new(descriptors: impl IntoIterator<Item = DeviceDescriptor>) -> Self {
        let mut system = Self::default();
        for descriptor in descriptors {
            system.add_descriptor(descriptor);
        }
        system
    }

    /// Adds a device that is present from the start.
    pub fn add_descriptor(&mut self, descriptor: DeviceDescriptor) {
        self.materialize(&descriptor);
        self.descriptors.push((descriptor, Visibility::Always));
    }

    /// Adds a device that only appears once `trigger` is active, e.g. a
    /// partition inside a LUKS mapping.
    pub fn add_descriptor_when_active(
        &mut self,
        descriptor: DeviceDescriptor,
        trigger: impl Into<PathBuf>,
    ) {
        self.descriptors
            .push((descriptor, Visibility::WhenActive(trigger.into())));
    }

    /// Arms a one-shot failure for the next call starting with `prefix`.
    pub fn fail_next(&mut self, prefix: impl Into<String>, failure: Failure) {
        self.failures.push((prefix.into(), failure));
    }

    pub fn set_member_info(&mut self, path: impl Into<PathBuf>, info: MemberInfo) {
        self.examine.insert(path.into(), info);
    }

    pub fn set_pv_free(&mut self, vg: &str, free: Vec<(PathBuf, Size)>) {
        self.pv_free.insert(vg.to_string(), free);
    }

    pub fn calls(&self) -> &[String] {
        &self.calls
    }

    pub fn clear_calls(&mut self) {
        self.calls.clear();
    }

    pub fn config(&self, path: impl AsRef<Path>) -> Option<&str> {
        self.configs.get(path.as_ref()).map(String::as_str)
    }

    pub fn rejected(&self) -> &[String] {
        &self.rejected
    }

    pub fn is_active(&self, path: impl AsRef<Path>) -> bool {
        self.nodes.contains(path.as_ref())
    }

    pub fn partition_numbers(&self, disk: impl AsRef<Path>) -> Vec<u32> {
        self.partitions
            .get(disk.as_ref())
            .map(|parts| parts.keys().copied().collect())
            .unwrap_or_default()
    }

    fn materialize(&mut self, descriptor: &DeviceDescriptor) {
        let path = descriptor.path();
        if let Some(size) = descriptor.size {
            self.sizes.insert(path.clone(), size);
        }
        match descriptor.kind {
            DescriptorKind::Dm => {
                let suspended = descriptor.dm.as_ref().is_some_and(|dm| dm.suspended);
                self.maps.insert(
                    descriptor.device_name().to_string(),
                    MapState {
                        live: true,
                        suspended,
                    },
                );
            }
            DescriptorKind::Md => {
                self.arrays
                    .insert(descriptor.name.clone(), "clean".to_string());
            }
            DescriptorKind::Partition => {
                if let Some(ref info) = descriptor.partition {
                    self.partitions
                        .entry(PathBuf::from(DEV_DIRECTORY).join(&info.disk))
                        .or_default()
                        .insert(info.number, descriptor.size.unwrap_or_default());
                }
            }
            DescriptorKind::Loop => {
                if let Some(file) = descriptor
                    .loop_device
                    .as_ref()
                    .and_then(|l| l.backing_file.clone())
                {
                    self.files.insert(file.clone());
                    self.loops.insert(descriptor.name.clone(), file);
                }
            }
            _ => (),
        }
        if let Some(label) = descriptor.partition_table {
            self.labels.insert(path.clone(), label);
        }
        self.nodes.insert(path);
    }

    fn record(&mut self, call: String) -> Result<(), Error> {
        trace!("Simulated call: {call}");
        self.calls.push(call);
        let Some(call) = self.calls.last() else {
            return Ok(());
        };
        let Some(index) = self
            .failures
            .iter()
            .position(|(prefix, _)| call.starts_with(prefix.as_str()))
        else {
            return Ok(());
        };
        let (prefix, failure) = self.failures.remove(index);
        match failure {
            Failure::Command => bail!("Injected failure of '{prefix}'"),
            Failure::DiskLabelCommit { disk } => Err(Error::new(DiskLabelCommitError { disk })),
        }
    }

    fn mapper_path(name: &str) -> PathBuf {
        PathBuf::from(DEV_MAPPER_DIRECTORY).join(name)
    }

    fn lv_map_name(vg: &str, lv: &str) -> String {
        format!("{}-{}", vg.replace('-', "--"), lv.replace('-', "--"))
    }

    fn activate_map(&mut self, name: &str, size: Option<Size>) {
        let path = Self::mapper_path(name);
        self.maps.insert(
            name.to_string(),
            MapState {
                live: true,
                suspended: false,
            },
        );
        if let Some(size) = size {
            self.sizes.insert(path.clone(), size);
        }
        self.nodes.insert(path);
    }

    fn deactivate_map(&mut self, name: &str) {
        self.maps.remove(name);
        self.nodes.remove(&Self::mapper_path(name));
    }

    fn partition_path(disk: &Path, number: u32) -> PathBuf {
        let disk = disk.to_string_lossy();
        if disk.ends_with(|c: char| c.is_ascii_digit()) {
            PathBuf::from(format!("{disk}p{number}"))
        } else {
            PathBuf::from(format!("{disk}{number}"))
        }
    }
}

impl BlockLayer for SimulatedSystem {
    fn enumerate(&mut self) -> Result<Vec<DeviceDescriptor>, Error> {
        self.calls.push("enumerate".into());
        let visible: Vec<DeviceDescriptor> = self
            .descriptors
            .iter()
            .filter(|(_, visibility)| match visibility {
                Visibility::Always => true,
                Visibility::WhenActive(trigger) => self.nodes.contains(trigger),
            })
            .map(|(descriptor, _)| descriptor.clone())
            .collect();
        for descriptor in &visible {
            if !self.nodes.contains(&descriptor.path()) {
                self.materialize(descriptor);
            }
        }
        Ok(visible)
    }

    fn settle(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn node_exists(&self, path: &Path) -> bool {
        self.nodes.contains(path)
    }

    fn device_size(&self, path: &Path) -> Result<Size, Error> {
        self.sizes
            .get(path)
            .copied()
            .with_context(|| format!("No size known for '{}'", path.display()))
    }

    fn partition_size(&self, disk: &Path, number: u32) -> Result<Option<Size>, Error> {
        Ok(self
            .partitions
            .get(disk)
            .and_then(|parts| parts.get(&number))
            .copied())
    }

    fn eject(&mut self, path: &Path) -> Result<(), Error> {
        self.record(format!("eject {}", path.display()))
    }

    fn create_disklabel(&mut self, disk: &Path, label: DiskLabelType) -> Result<(), Error> {
        self.record(format!("create_disklabel {} {label}", disk.display()))?;
        self.labels.insert(disk.to_path_buf(), label);
        if let Some(parts) = self.partitions.remove(disk) {
            for number in parts.keys() {
                self.nodes.remove(&Self::partition_path(disk, *number));
            }
        }
        Ok(())
    }

    fn add_partition(&mut self, disk: &Path, request: &PartitionRequest) -> Result<(), Error> {
        self.record(format!(
            "add_partition {} {} {}",
            disk.display(),
            request.number,
            request.partition_type
        ))?;
        if !self.labels.contains_key(disk) {
            bail!("No disklabel on '{}'", disk.display());
        }
        self.partitions
            .entry(disk.to_path_buf())
            .or_default()
            .insert(request.number, request.size);
        let path = Self::partition_path(disk, request.number);
        self.sizes.insert(path.clone(), request.size);
        self.nodes.insert(path);
        Ok(())
    }

    fn remove_partition(&mut self, disk: &Path, number: u32) -> Result<(), Error> {
        self.record(format!("remove_partition {} {number}", disk.display()))?;
        if let Some(parts) = self.partitions.get_mut(disk) {
            parts.remove(&number);
        }
        self.nodes.remove(&Self::partition_path(disk, number));
        Ok(())
    }

    fn resize_partition(&mut self, disk: &Path, number: u32, size: Size) -> Result<(), Error> {
        self.record(format!(
            "resize_partition {} {number} {}",
            disk.display(),
            size.bytes()
        ))?;
        let part = self
            .partitions
            .get_mut(disk)
            .and_then(|parts| parts.get_mut(&number))
            .with_context(|| format!("No partition {number} on '{}'", disk.display()))?;
        *part = size;
        self.sizes.insert(Self::partition_path(disk, number), size);
        Ok(())
    }

    fn dm_state(&self, name: &str) -> Option<MapState> {
        self.maps.get(name).copied()
    }

    fn dm_create_linear(
        &mut self,
        name: &str,
        backing: &Path,
        size: Size,
        _uuid: Option<&str>,
    ) -> Result<(), Error> {
        self.record(format!("dm_create_linear {name} {}", backing.display()))?;
        self.activate_map(name, Some(size));
        Ok(())
    }

    fn dm_remove(&mut self, name: &str) -> Result<(), Error> {
        self.record(format!("dm_remove {name}"))?;
        self.deactivate_map(name);
        Ok(())
    }

    fn kpartx_add(&mut self, path: &Path) -> Result<(), Error> {
        self.record(format!("kpartx_add {}", path.display()))
    }

    fn kpartx_delete(&mut self, path: &Path) -> Result<(), Error> {
        self.record(format!("kpartx_delete {}", path.display()))
    }

    fn luks_format(&mut self, path: &Path, _passphrase: &str) -> Result<(), Error> {
        self.record(format!("luks_format {}", path.display()))
    }

    fn luks_open(&mut self, path: &Path, map_name: &str, passphrase: &str) -> Result<(), Error> {
        self.record(format!("luks_open {} {map_name}", path.display()))?;
        if passphrase.is_empty() {
            bail!("No passphrase for '{}'", path.display());
        }
        let size = self
            .sizes
            .get(path)
            .map(|size| size.saturating_sub(LUKS_METADATA_SIZE));
        self.activate_map(map_name, size);
        Ok(())
    }

    fn luks_close(&mut self, map_name: &str) -> Result<(), Error> {
        self.record(format!("luks_close {map_name}"))?;
        self.deactivate_map(map_name);
        Ok(())
    }

    fn lvm_reject(&mut self, device_name: &str) {
        if !self.rejected.iter().any(|name| name == device_name) {
            self.rejected.push(device_name.to_string());
        }
    }

    fn pv_create(&mut self, path: &Path) -> Result<(), Error> {
        self.record(format!("pv_create {}", path.display()))
    }

    fn pv_remove(&mut self, path: &Path) -> Result<(), Error> {
        self.record(format!("pv_remove {}", path.display()))
    }

    fn pv_free(&self, vg: &str) -> Result<Vec<(PathBuf, Size)>, Error> {
        Ok(self.pv_free.get(vg).cloned().unwrap_or_default())
    }

    fn vg_create(&mut self, name: &str, pe_size: Size, pvs: &[PathBuf]) -> Result<(), Error> {
        let pvs: Vec<String> = pvs.iter().map(|p| p.display().to_string()).collect();
        self.record(format!(
            "vg_create {name} {} {}",
            pe_size.bytes(),
            pvs.join(",")
        ))
    }

    fn vg_remove(&mut self, name: &str) -> Result<(), Error> {
        self.record(format!("vg_remove {name}"))
    }

    fn vg_reduce_missing(&mut self, name: &str) -> Result<(), Error> {
        self.record(format!("vg_reduce_missing {name}"))
    }

    fn vg_activate(&mut self, name: &str, active: bool) -> Result<(), Error> {
        self.record(format!("vg_activate {name} {active}"))?;
        if !active {
            let prefix = format!("{}-", name.replace('-', "--"));
            let lvs: Vec<String> = self
                .maps
                .keys()
                .filter(|map| map.starts_with(&prefix))
                .cloned()
                .collect();
            for lv in lvs {
                self.deactivate_map(&lv);
            }
        }
        Ok(())
    }

    fn lv_create(&mut self, vg: &str, lv: &str, size: Size, _pvs: &[PathBuf]) -> Result<(), Error> {
        self.record(format!("lv_create {vg} {lv} {}", size.bytes()))?;
        let path = Self::mapper_path(&Self::lv_map_name(vg, lv));
        self.sizes.insert(path, size);
        Ok(())
    }

    fn lv_remove(&mut self, vg: &str, lv: &str) -> Result<(), Error> {
        self.record(format!("lv_remove {vg} {lv}"))?;
        let map = Self::lv_map_name(vg, lv);
        self.deactivate_map(&map);
        self.sizes.remove(&Self::mapper_path(&map));
        Ok(())
    }

    fn lv_resize(&mut self, vg: &str, lv: &str, size: Size) -> Result<(), Error> {
        self.record(format!("lv_resize {vg} {lv} {}", size.bytes()))?;
        self.sizes
            .insert(Self::mapper_path(&Self::lv_map_name(vg, lv)), size);
        Ok(())
    }

    fn lv_activate(&mut self, vg: &str, lv: &str, active: bool) -> Result<(), Error> {
        self.record(format!("lv_activate {vg} {lv} {active}"))?;
        let map = Self::lv_map_name(vg, lv);
        if active {
            self.activate_map(&map, None);
        } else {
            self.deactivate_map(&map);
        }
        Ok(())
    }

    fn md_create(&mut self, path: &Path, request: &MdCreateRequest) -> Result<(), Error> {
        self.record(format!(
            "md_create {} {} {} metadata={} bitmap={}",
            path.display(),
            request.level,
            request.members.len(),
            request.metadata,
            request.bitmap
        ))?;
        self.md_started(path);
        Ok(())
    }

    fn md_assemble(&mut self, path: &Path, uuid: &str, _members: &[PathBuf]) -> Result<(), Error> {
        self.record(format!("md_assemble {} {uuid}", path.display()))?;
        self.md_started(path);
        Ok(())
    }

    fn md_stop(&mut self, path: &Path) -> Result<(), Error> {
        self.record(format!("md_stop {}", path.display()))?;
        if let Some(name) = path.file_name() {
            self.arrays.remove(name.to_string_lossy().as_ref());
        }
        self.nodes.remove(path);
        Ok(())
    }

    fn md_zero_superblock(&mut self, path: &Path) -> Result<(), Error> {
        self.record(format!("md_zero_superblock {}", path.display()))
    }

    fn md_array_state(&self, name: &str) -> Option<String> {
        self.arrays.get(name).cloned()
    }

    fn md_examine(&self, path: &Path) -> Result<MemberInfo, Error> {
        Ok(self.examine.get(path).cloned().unwrap_or_default())
    }

    fn loop_attach(&mut self, file: &Path) -> Result<String, Error> {
        self.record(format!("loop_attach {}", file.display()))?;
        if !self.files.contains(file) {
            bail!("Backing file '{}' does not exist", file.display());
        }
        let name = (0..)
            .map(|n| format!("loop{n}"))
            .find(|name| !self.loops.contains_key(name))
            .context("No free loop device")?;
        self.loops.insert(name.clone(), file.to_path_buf());
        self.nodes.insert(PathBuf::from(DEV_DIRECTORY).join(&name));
        Ok(name)
    }

    fn loop_detach(&mut self, name: &str) -> Result<(), Error> {
        self.record(format!("loop_detach {name}"))?;
        self.loops.remove(name);
        self.nodes.remove(&PathBuf::from(DEV_DIRECTORY).join(name));
        Ok(())
    }

    fn loop_for_file(&self, file: &Path) -> Option<String> {
        self.loops
            .iter()
            .find(|(_, backing)| backing.as_path() == file)
            .map(|(name, _)| name.clone())
    }

    fn dmraid_activate(&mut self, set: &str) -> Result<(), Error> {
        self.record(format!("dmraid_activate {set}"))?;
        self.activate_map(set, None);
        Ok(())
    }

    fn dmraid_deactivate(&mut self, set: &str) -> Result<(), Error> {
        self.record(format!("dmraid_deactivate {set}"))?;
        self.deactivate_map(set);
        Ok(())
    }

    fn multipath_activate(&mut self, name: &str) -> Result<(), Error> {
        self.record(format!("multipath_activate {name}"))?;
        self.activate_map(name, None);
        Ok(())
    }

    fn multipath_flush(&mut self, name: &str) -> Result<(), Error> {
        self.record(format!("multipath_flush {name}"))?;
        self.deactivate_map(name);
        Ok(())
    }

    fn create_file(&mut self, path: &Path, size: Size) -> Result<(), Error> {
        self.record(format!("create_file {} {}", path.display(), size.bytes()))?;
        self.files.insert(path.to_path_buf());
        self.sizes.insert(path.to_path_buf(), size);
        Ok(())
    }

    fn remove_file(&mut self, path: &Path) -> Result<(), Error> {
        self.record(format!("remove_file {}", path.display()))?;
        self.files.remove(path);
        Ok(())
    }

    fn create_directory(&mut self, path: &Path) -> Result<(), Error> {
        self.record(format!("create_directory {}", path.display()))?;
        self.files.insert(path.to_path_buf());
        Ok(())
    }

    fn file_exists(&self, path: &Path) -> bool {
        self.files.contains(path)
    }

    fn mkfs(
        &mut self,
        path: &Path,
        fs_type: &str,
        _label: Option<&str>,
        _options: &[String],
    ) -> Result<(), Error> {
        self.record(format!("mkfs {} {fs_type}", path.display()))
    }

    fn mkswap(&mut self, path: &Path, _label: Option<&str>) -> Result<(), Error> {
        self.record(format!("mkswap {}", path.display()))
    }

    fn wipe(&mut self, path: &Path) -> Result<(), Error> {
        self.record(format!("wipe {}", path.display()))
    }

    fn fs_resize(&mut self, path: &Path, fs_type: &str, size: Size) -> Result<(), Error> {
        self.record(format!(
            "fs_resize {} {fs_type} {}",
            path.display(),
            size.bytes()
        ))
    }

    fn fs_migrate(&mut self, path: &Path, from: &str) -> Result<(), Error> {
        self.record(format!("fs_migrate {} {from}", path.display()))
    }

    fn mount(&mut self, path: &Path, mountpoint: &Path, fs_type: &str) -> Result<(), Error> {
        self.record(format!(
            "mount {} {} {fs_type}",
            path.display(),
            mountpoint.display()
        ))?;
        self.mounted.insert(path.to_path_buf());
        Ok(())
    }

    fn umount(&mut self, path: &Path) -> Result<(), Error> {
        self.record(format!("umount {}", path.display()))?;
        self.mounted.remove(path);
        Ok(())
    }

    fn is_mounted(&self, path: &Path) -> bool {
        self.mounted.contains(path)
    }

    fn swapon(&mut self, path: &Path) -> Result<(), Error> {
        self.record(format!("swapon {}", path.display()))?;
        self.swaps.insert(path.to_path_buf());
        Ok(())
    }

    fn swapoff(&mut self, path: &Path) -> Result<(), Error> {
        self.record(format!("swapoff {}", path.display()))?;
        self.swaps.remove(path);
        Ok(())
    }

    fn swap_active(&self, path: &Path) -> bool {
        self.swaps.contains(path)
    }

    fn write_config(&mut self, path: &Path, contents: &str) -> Result<(), Error> {
        self.record(format!("write_config {}", path.display()))?;
        self.configs.insert(path.to_path_buf(), contents.to_string());
        Ok(())
    }

    fn append_config(&mut self, path: &Path, contents: &str) -> Result<(), Error> {
        self.record(format!("append_config {}", path.display()))?;
        self.configs
            .entry(path.to_path_buf())
            .or_default()
            .push_str(contents);
        Ok(())
    }

    fn backup_config(&mut self, path: &Path) -> Result<bool, Error> {
        self.record(format!("backup_config {}", path.display()))?;
        match self.configs.get(path) {
            Some(contents) => {
                self.backups.insert(path.to_path_buf(), contents.clone());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn restore_config(&mut self, path: &Path, backed_up: bool) -> Result<(), Error> {
        self.record(format!("restore_config {}", path.display()))?;
        match self.backups.remove(path) {
            Some(contents) if backed_up => {
                self.configs.insert(path.to_path_buf(), contents);
            }
            _ => {
                self.configs.remove(path);
            }
        }
        Ok(())
    }
}

impl SimulatedSystem {
    fn md_started(&mut self, path: &Path) {
        if let Some(name) = path.file_name() {
            self.arrays
                .insert(name.to_string_lossy().into_owned(), "clean".to_string());
        }
        self.nodes.insert(path.to_path_buf());
    }
}
