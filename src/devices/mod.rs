//! The device arena.
//!
//! Every device ever created during a run lives in [`Devices`] and is
//! addressed by its [`DeviceId`]. Devices refer to their parents by id, so
//! the graph has no back-references: children are found by scanning, and
//! the number of dependents is kept in [`Device::kids`] by the device tree.
//!
//! Lifecycle operations take the arena and a [`BlockLayer`]. The generic
//! contract (preconditions, parent setup, format teardown, size refresh) is
//! implemented here; each variant module only supplies its activation,
//! deactivation, creation, removal and resize steps.

use std::{
    fmt::Display,
    ops::{Index, IndexMut},
    path::{Path, PathBuf},
};

use anyhow::Error;
use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};

use devgraph_api::{
    constants::{DEV_DIRECTORY, DEV_MAPPER_DIRECTORY, LUKS_METADATA_SIZE},
    descriptor::DmTarget,
    error::{DeviceError, ReportError, StorageError},
    Size,
};

use crate::{formats::Format, interface::ProgressInterface, system::BlockLayer};

pub mod disk;
pub mod dm;
pub mod loopback;
pub mod lvm;
pub mod md;
pub mod nodev;
pub mod partition;

pub use disk::DiskInfo;
pub use dm::{DmRaidInfo, MultipathInfo};
pub use loopback::LoopInfo;
pub use lvm::{LogicalVolumeInfo, VolumeGroupInfo};
pub use md::{MdInfo, MdLevel};
pub use nodev::NfsInfo;
pub use partition::PartitionInfo;

/// Process-unique device identifier, allocated in creation order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct DeviceId(pub u32);

impl Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceKind {
    Disk(DiskInfo),
    Optical,
    Partition(PartitionInfo),
    /// A device-mapper map this engine does not manage further.
    DeviceMapper { target: DmTarget },
    DmLinear,
    Luks,
    DmRaid(DmRaidInfo),
    Multipath(MultipathInfo),
    VolumeGroup(VolumeGroupInfo),
    LogicalVolume(LogicalVolumeInfo),
    MdArray(MdInfo),
    Loop(LoopInfo),
    File,
    Directory,
    NoDevice,
    Nfs(NfsInfo),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    pub kind: DeviceKind,
    pub parents: Vec<DeviceId>,
    /// Number of devices in the tree that list this one as a parent.
    pub kids: usize,
    pub exists: bool,
    pub format: Format,
    /// The format found on the device at population time.
    pub original_format: Format,
    pub uuid: Option<String>,
    pub serial: Option<String>,
    pub vendor: Option<String>,
    pub model: Option<String>,
    pub bus: Option<String>,
    pub sysfs_path: Option<String>,
    /// `/dev/disk/by-*` links of the device node.
    pub symlinks: Vec<String>,
    /// Size as last probed on the system.
    pub current_size: Size,
    /// Requested size: the creation size of a new device, or the size a
    /// pending resize will apply.
    pub target_size: Size,
    pub grow: bool,
    pub media_present: bool,
    pub read_only: bool,
    /// Excluded from destructive operations.
    pub protected: bool,
    /// Whether this engine may activate or deactivate the device.
    pub controllable: bool,
    /// Reason the device must not be modified, if any.
    pub immutable: Option<String>,
}

impl Device {
    fn new(id: DeviceId, name: String, kind: DeviceKind) -> Self {
        Self {
            id,
            name,
            kind,
            parents: Vec::new(),
            kids: 0,
            exists: false,
            format: Format::default(),
            original_format: Format::default(),
            uuid: None,
            serial: None,
            vendor: None,
            model: None,
            bus: None,
            sysfs_path: None,
            symlinks: Vec::new(),
            current_size: Size::ZERO,
            target_size: Size::ZERO,
            grow: false,
            media_present: true,
            read_only: false,
            protected: false,
            controllable: true,
            immutable: None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self.kind {
            DeviceKind::Disk(ref disk) => disk.type_name(),
            DeviceKind::Optical => "cdrom",
            DeviceKind::Partition(_) => "partition",
            DeviceKind::DeviceMapper { .. } => "dm",
            DeviceKind::DmLinear => "dm-linear",
            DeviceKind::Luks => "luks/dm-crypt",
            DeviceKind::DmRaid(_) => "dm-raid array",
            DeviceKind::Multipath(_) => "dm-multipath",
            DeviceKind::VolumeGroup(_) => "lvmvg",
            DeviceKind::LogicalVolume(_) => "lvmlv",
            DeviceKind::MdArray(ref md) => md.type_name(),
            DeviceKind::Loop(_) => "loop",
            DeviceKind::File => "file",
            DeviceKind::Directory => "directory",
            DeviceKind::NoDevice => "nodev",
            DeviceKind::Nfs(_) => "nfs",
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.kids == 0
    }

    /// Whole-disk devices: the things disklabels and disk filters apply to.
    pub fn is_disk(&self) -> bool {
        match self.kind {
            DeviceKind::Disk(_)
            | DeviceKind::DmLinear
            | DeviceKind::DmRaid(_)
            | DeviceKind::Multipath(_) => true,
            DeviceKind::MdArray(ref md) => md.biosraid,
            _ => false,
        }
    }

    pub fn partitionable(&self) -> bool {
        self.is_disk()
    }

    pub fn partitioned(&self) -> bool {
        self.partitionable() && self.format.is_disklabel()
    }

    /// Whether the variant supports resizing at all.
    fn variant_resizable(&self) -> bool {
        matches!(
            self.kind,
            DeviceKind::Partition(_) | DeviceKind::LogicalVolume(_)
        )
    }

    /// Name of the device-mapper map backing this device.
    pub fn map_name(&self) -> Option<String> {
        match self.kind {
            DeviceKind::DeviceMapper { .. }
            | DeviceKind::DmLinear
            | DeviceKind::Luks
            | DeviceKind::DmRaid(_)
            | DeviceKind::Multipath(_) => Some(self.name.clone()),
            DeviceKind::VolumeGroup(_) => Some(lvm::vg_map_name(&self.name)),
            _ => None,
        }
    }

    pub fn as_partition(&self) -> Option<&PartitionInfo> {
        match self.kind {
            DeviceKind::Partition(ref part) => Some(part),
            _ => None,
        }
    }

    pub fn as_volume_group(&self) -> Option<&VolumeGroupInfo> {
        match self.kind {
            DeviceKind::VolumeGroup(ref vg) => Some(vg),
            _ => None,
        }
    }

    pub fn as_logical_volume(&self) -> Option<&LogicalVolumeInfo> {
        match self.kind {
            DeviceKind::LogicalVolume(ref lv) => Some(lv),
            _ => None,
        }
    }

    pub fn as_md(&self) -> Option<&MdInfo> {
        match self.kind {
            DeviceKind::MdArray(ref md) => Some(md),
            _ => None,
        }
    }

    pub fn as_disk(&self) -> Option<&DiskInfo> {
        match self.kind {
            DeviceKind::Disk(ref disk) => Some(disk),
            _ => None,
        }
    }

    pub fn is_partition(&self) -> bool {
        self.as_partition().is_some()
    }

    pub fn is_extended(&self) -> bool {
        self.as_partition().is_some_and(PartitionInfo::is_extended)
    }

    pub fn is_logical(&self) -> bool {
        self.as_partition().is_some_and(PartitionInfo::is_logical)
    }
}

impl Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} (id {})", self.type_name(), self.name, self.id)
    }
}

/// Converts the result of a variant step into a structured error. Errors
/// that already are structured pass through untouched.
trait StepResult<T> {
    fn step(self, kind: DeviceError) -> Result<T, StorageError>;
}

impl<T> StepResult<T> for Result<T, Error> {
    #[track_caller]
    fn step(self, kind: DeviceError) -> Result<T, StorageError> {
        match self {
            Ok(value) => Ok(value),
            Err(e) => match e.downcast::<StorageError>() {
                Ok(structured) => Err(structured),
                Err(e) => Err(e).structured(kind),
            },
        }
    }
}

/// Arena of every device known to a run.
#[derive(Debug, Default, Clone)]
pub struct Devices {
    devices: Vec<Device>,
}

impl Index<DeviceId> for Devices {
    type Output = Device;

    fn index(&self, id: DeviceId) -> &Device {
        &self.devices[id.0 as usize]
    }
}

impl IndexMut<DeviceId> for Devices {
    fn index_mut(&mut self, id: DeviceId) -> &mut Device {
        &mut self.devices[id.0 as usize]
    }
}

impl Devices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a new device and returns its id.
    pub fn add(&mut self, name: impl Into<String>, kind: DeviceKind) -> DeviceId {
        let id = DeviceId(self.devices.len() as u32);
        self.devices.push(Device::new(id, name.into(), kind));
        id
    }

    /// Allocates a new device on top of `parents`.
    pub fn add_with_parents(
        &mut self,
        name: impl Into<String>,
        kind: DeviceKind,
        parents: Vec<DeviceId>,
    ) -> DeviceId {
        let id = self.add(name, kind);
        self[id].parents = parents;
        id
    }

    pub fn get(&self, id: DeviceId) -> Option<&Device> {
        self.devices.get(id.0 as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Device node of `id`.
    pub fn path(&self, id: DeviceId) -> PathBuf {
        let device = &self[id];
        match device.kind {
            DeviceKind::File | DeviceKind::Directory | DeviceKind::NoDevice | DeviceKind::Nfs(_) => {
                PathBuf::from(&device.name)
            }
            DeviceKind::LogicalVolume(ref lv) => {
                let vg = device
                    .parents
                    .first()
                    .map(|vg| self[*vg].name.as_str())
                    .unwrap_or_default();
                PathBuf::from(DEV_MAPPER_DIRECTORY).join(lvm::lv_map_name(vg, &lv.lv_name))
            }
            _ => match device.map_name() {
                Some(map) => PathBuf::from(DEV_MAPPER_DIRECTORY).join(map),
                None => PathBuf::from(DEV_DIRECTORY).join(&device.name),
            },
        }
    }

    /// True when `id` depends on `other`, directly or through any ancestor.
    /// Logical partitions also depend on their disk's extended partition.
    pub fn depends_on(&self, id: DeviceId, other: DeviceId) -> bool {
        let device = &self[id];
        if device.is_logical() && self[other].is_extended() {
            let disk = device.parents.first();
            if disk.is_some() && disk == self[other].parents.first() {
                return true;
            }
        }
        device
            .parents
            .iter()
            .any(|parent| *parent == other || self.depends_on(*parent, other))
    }

    /// Every ancestor of `id`, nearest first, without duplicates.
    pub fn ancestors(&self, id: DeviceId) -> Vec<DeviceId> {
        let mut ancestors = Vec::new();
        let mut queue: Vec<DeviceId> = self[id].parents.clone();
        while !queue.is_empty() {
            let parent = queue.remove(0);
            if ancestors.contains(&parent) {
                continue;
            }
            ancestors.push(parent);
            queue.extend(self[parent].parents.iter().copied());
        }
        ancestors
    }

    pub fn size(&self, id: DeviceId) -> Size {
        let device = &self[id];
        match device.kind {
            DeviceKind::Disk(_) | DeviceKind::Optical if !device.media_present => Size::ZERO,
            DeviceKind::Partition(_) if device.exists => device.current_size,
            DeviceKind::VolumeGroup(_) => lvm::vg_size(self, id),
            DeviceKind::MdArray(_) => md::array_size(self, id),
            DeviceKind::Luks if !device.exists || device.current_size.is_zero() => device
                .parents
                .first()
                .map(|slave| self.size(*slave).saturating_sub(LUKS_METADATA_SIZE))
                .unwrap_or_default(),
            DeviceKind::Luks => device.current_size,
            DeviceKind::Loop(_) => device
                .parents
                .first()
                .map(|file| self.size(*file))
                .unwrap_or_default(),
            _ => device.target_size,
        }
    }

    pub fn min_size(&self, id: DeviceId) -> Size {
        self[id].format.min_size()
    }

    /// Largest size `id` may be set to, None when unbounded.
    pub fn max_size(&self, id: DeviceId) -> Option<Size> {
        let device = &self[id];
        let backing = match device.kind {
            DeviceKind::Partition(_) => device.parents.first().map(|disk| self.size(*disk)),
            DeviceKind::LogicalVolume(_) => lvm::lv_max_size(self, id),
            _ => None,
        };
        match (device.format.max_size(), backing) {
            (Some(format), Some(backing)) => Some(format.min(backing)),
            (format, backing) => format.or(backing),
        }
    }

    pub fn resizable(&self, id: DeviceId) -> bool {
        let device = &self[id];
        let capable = match device.kind {
            DeviceKind::Partition(_) => !partition::on_dasd(self, id),
            _ => device.variant_resizable(),
        };
        capable
            && device.exists
            && (device.format.resizable() || device.format.type_name().is_none())
    }

    /// Growable when growth was requested or any parent is growable.
    pub fn growable(&self, id: DeviceId) -> bool {
        let device = &self[id];
        device.grow || device.parents.iter().any(|parent| self.growable(*parent))
    }

    /// Sets the requested size of `id`.
    pub fn set_size(&mut self, id: DeviceId, size: Size) -> Result<(), StorageError> {
        let device = &self[id];
        if device.exists && !device.variant_resizable() {
            return Err(StorageError::new(DeviceError::NotResizable {
                name: device.name.clone(),
            }));
        }

        let size = match device.kind {
            DeviceKind::LogicalVolume(_) => lvm::check_lv_size(self, id, size)?,
            _ => size,
        };

        if let Some(maximum) = self.max_size(id) {
            if size > maximum {
                return Err(StorageError::new(DeviceError::SizeConstraint {
                    name: self[id].name.clone(),
                    requested: size,
                    maximum,
                }));
            }
        }

        trace!("Setting size of '{}' to {size}", self[id].name);
        self[id].target_size = size;
        Ok(())
    }

    /// Replaces the format of `id`. The current format must not be active.
    pub fn set_format(
        &mut self,
        id: DeviceId,
        format: Format,
        system: &dyn BlockLayer,
    ) -> Result<(), StorageError> {
        let path = self.path(id);
        let device = &mut self[id];
        if device.format.exists && device.format.status(system, &path) {
            return Err(StorageError::new(DeviceError::ActiveFormat {
                name: device.name.clone(),
            }));
        }
        debug!(
            "Setting format of {device} to '{}'",
            format.display_name()
        );
        device.format = format;
        Ok(())
    }

    /// Whether `id` is currently active on the system.
    pub fn status(&self, id: DeviceId, system: &dyn BlockLayer) -> bool {
        let device = &self[id];
        if !device.exists {
            return false;
        }
        match device.kind {
            DeviceKind::Disk(_) | DeviceKind::Optical => {
                device.media_present && system.node_exists(&self.path(id))
            }
            DeviceKind::Partition(_) => system.node_exists(&self.path(id)),
            DeviceKind::DeviceMapper { .. }
            | DeviceKind::DmLinear
            | DeviceKind::Luks
            | DeviceKind::DmRaid(_)
            | DeviceKind::Multipath(_)
            | DeviceKind::LogicalVolume(_) => dm::map_active(self, id, system),
            DeviceKind::VolumeGroup(_) => lvm::vg_status(self, id, system),
            DeviceKind::MdArray(_) => md::array_status(self, id, system),
            DeviceKind::Loop(_) => loopback::status(self, id, system),
            DeviceKind::File | DeviceKind::Directory => system.file_exists(&self.path(id)),
            DeviceKind::NoDevice | DeviceKind::Nfs(_) => false,
        }
    }

    /// Activates `id` and everything below it. Idempotent.
    pub fn setup(
        &mut self,
        id: DeviceId,
        system: &mut dyn BlockLayer,
        orig: bool,
    ) -> Result<(), StorageError> {
        let device = &self[id];
        if !device.exists {
            return Err(StorageError::new(DeviceError::NotCreated {
                name: device.name.clone(),
            }));
        }
        if self.status(id, system) || !self[id].controllable {
            trace!("Not setting up {}: active or not controllable", self[id]);
            return Ok(());
        }

        if let DeviceKind::VolumeGroup(_) = self[id].kind {
            lvm::pre_setup(self, id)?;
        }

        self.setup_parents(id, system, orig)?;

        debug!("Setting up {}", self[id]);
        let name = self[id].name.clone();
        let result = match self[id].kind {
            DeviceKind::DmLinear => dm::linear_setup(self, id, system),
            DeviceKind::Multipath(_) => dm::multipath_setup(self, id, system),
            DeviceKind::DmRaid(_) => dm::dmraid_setup(self, id, system),
            DeviceKind::LogicalVolume(_) => lvm::lv_setup(self, id, system),
            DeviceKind::MdArray(_) => md::setup(self, id, system),
            DeviceKind::Loop(_) => loopback::setup(self, id, system),
            _ => Ok(()),
        };
        result.step(DeviceError::Setup { name })?;

        self.post_setup(id, system);
        Ok(())
    }

    fn post_setup(&mut self, id: DeviceId, system: &mut dyn BlockLayer) {
        if let Err(e) = system.settle() {
            warn!("Failed to settle after setting up {}: {e:?}", self[id]);
        }
        let path = self.path(id);
        match system.device_size(&path) {
            Ok(size) => self[id].current_size = size,
            Err(e) => debug!("Could not refresh size of {}: {e}", self[id]),
        }
    }

    /// Sets up every parent of `id`, and each parent's format when it
    /// exists. With `orig` the formats found at population are used.
    pub fn setup_parents(
        &mut self,
        id: DeviceId,
        system: &mut dyn BlockLayer,
        orig: bool,
    ) -> Result<(), StorageError> {
        for parent in self[id].parents.clone() {
            self.setup(parent, system, orig)?;

            let path = self.path(parent);
            let device = &self[parent];
            let format = if orig {
                &device.original_format
            } else {
                &device.format
            };
            if format.type_name().is_some() && format.exists {
                format
                    .setup(system, &path)
                    .structured(DeviceError::Format {
                        name: device.name.clone(),
                        format: format.display_name().to_string(),
                        operation: "set up".into(),
                    })?;
            }
        }
        Ok(())
    }

    /// Deactivates `id`, and with `recursive` its parents afterwards.
    pub fn teardown(
        &mut self,
        id: DeviceId,
        system: &mut dyn BlockLayer,
        recursive: bool,
    ) -> Result<(), StorageError> {
        if !self.pre_teardown(id, system, recursive)? {
            return Ok(());
        }

        debug!("Tearing down {}", self[id]);
        let name = self[id].name.clone();
        let result = match self[id].kind {
            DeviceKind::DeviceMapper { .. } => dm::generic_teardown(self, id, system),
            DeviceKind::DmLinear => {
                debug!("Not tearing down dm-linear device '{name}'");
                return Ok(());
            }
            DeviceKind::Luks => dm::luks_teardown(self, id, system),
            DeviceKind::Multipath(_) => dm::multipath_teardown(self, id, system),
            DeviceKind::DmRaid(_) => Ok(()),
            DeviceKind::VolumeGroup(_) => system.vg_activate(&name, false),
            DeviceKind::LogicalVolume(_) => lvm::lv_teardown(self, id, system),
            DeviceKind::MdArray(_) => md::teardown(self, id, system),
            DeviceKind::Loop(_) => loopback::teardown(self, id, system),
            _ => Ok(()),
        };
        result.step(DeviceError::Teardown { name })?;

        self.post_teardown(id, system, recursive)
    }

    /// Tears down the formats of `id`. Returns false when there is nothing
    /// left to do for the device itself.
    fn pre_teardown(
        &mut self,
        id: DeviceId,
        system: &mut dyn BlockLayer,
        recursive: bool,
    ) -> Result<bool, StorageError> {
        let device = &self[id];
        if !device.exists && !recursive {
            return Err(StorageError::new(DeviceError::NotCreated {
                name: device.name.clone(),
            }));
        }
        if !self.status(id, system) || !self[id].controllable {
            return Ok(false);
        }

        self.teardown_formats(id, system)?;
        if let Err(e) = system.settle() {
            warn!("Failed to settle before tearing down {}: {e:?}", self[id]);
        }
        Ok(true)
    }

    /// Tears down the original and the current format of `id`.
    pub(crate) fn teardown_formats(
        &mut self,
        id: DeviceId,
        system: &mut dyn BlockLayer,
    ) -> Result<(), StorageError> {
        let path = self.path(id);
        let device = &self[id];
        for format in [&device.original_format, &device.format] {
            if format.exists {
                format
                    .teardown(system, &path)
                    .structured(DeviceError::Format {
                        name: device.name.clone(),
                        format: format.display_name().to_string(),
                        operation: "tear down".into(),
                    })?;
            }
        }
        Ok(())
    }

    fn post_teardown(
        &mut self,
        id: DeviceId,
        system: &mut dyn BlockLayer,
        recursive: bool,
    ) -> Result<(), StorageError> {
        match self[id].kind {
            DeviceKind::Loop(_) => loopback::post_teardown(self, id),
            // Closing the mapping leaves the backing device addressable.
            DeviceKind::Luks if !recursive => self.teardown_parents(id, system, false)?,
            // Other volumes of the group may still be in use.
            DeviceKind::LogicalVolume(_) if recursive => {
                if let Err(e) = self.teardown_parents(id, system, recursive) {
                    debug!("Volume group of {} not torn down, continuing: {e}", self[id]);
                }
                return Ok(());
            }
            _ => (),
        }
        if recursive {
            self.teardown_parents(id, system, recursive)?;
        }
        Ok(())
    }

    pub fn teardown_parents(
        &mut self,
        id: DeviceId,
        system: &mut dyn BlockLayer,
        recursive: bool,
    ) -> Result<(), StorageError> {
        for parent in self[id].parents.clone() {
            self.teardown(parent, system, recursive)?;
        }
        Ok(())
    }

    /// Creates `id` on the system, then activates it.
    pub fn create(
        &mut self,
        id: DeviceId,
        system: &mut dyn BlockLayer,
        ui: Option<&dyn ProgressInterface>,
    ) -> Result<(), StorageError> {
        let device = &self[id];
        if device.exists {
            return Err(StorageError::new(DeviceError::AlreadyExists {
                name: device.name.clone(),
            }));
        }

        self.setup_parents(id, system, false)?;

        let name = self[id].name.clone();
        let window = ui.map(|ui| {
            ui.wait_window(
                "Creating",
                &format!("Creating device {} {name}", self[id].type_name()),
            )
        });
        debug!("Creating {}", self[id]);
        let result = match self[id].kind {
            DeviceKind::Partition(_) => partition::create(self, id, system),
            DeviceKind::DmLinear => dm::linear_create(self, id, system),
            DeviceKind::Luks | DeviceKind::Loop(_) | DeviceKind::NoDevice | DeviceKind::Nfs(_) => {
                Ok(())
            }
            DeviceKind::VolumeGroup(_) => lvm::vg_create(self, id, system),
            DeviceKind::LogicalVolume(_) => lvm::lv_create(self, id, system),
            DeviceKind::MdArray(_) => md::create(self, id, system),
            DeviceKind::File => {
                let size = self[id].target_size;
                system.create_file(Path::new(&name), size)
            }
            DeviceKind::Directory => system.create_directory(Path::new(&name)),
            _ => Err(anyhow::anyhow!(
                "Devices of type '{}' cannot be created",
                self[id].type_name()
            )),
        };
        if let Some(window) = window {
            window.pop();
        }
        result.step(DeviceError::Create { name })?;

        self.post_create(id, system)
    }

    fn post_create(&mut self, id: DeviceId, system: &mut dyn BlockLayer) -> Result<(), StorageError> {
        self[id].exists = true;
        match self[id].kind {
            DeviceKind::Luks => dm::luks_post_create(self, id),
            DeviceKind::Partition(_) => {
                let name = self[id].name.clone();
                partition::post_create(self, id, system).step(DeviceError::Create { name })?;
            }
            _ => (),
        }
        if let DeviceKind::NoDevice | DeviceKind::Nfs(_) = self[id].kind {
            return Ok(());
        }
        self.setup(id, system, false)?;
        if let Err(e) = system.settle() {
            warn!("Failed to settle after creating {}: {e:?}", self[id]);
        }
        Ok(())
    }

    /// Removes `id` from the system. Only leaves can be destroyed.
    pub fn destroy(&mut self, id: DeviceId, system: &mut dyn BlockLayer) -> Result<(), StorageError> {
        let device = &self[id];
        if !device.exists {
            return Err(StorageError::new(DeviceError::NotCreated {
                name: device.name.clone(),
            }));
        }
        if !device.is_leaf() {
            return Err(StorageError::new(DeviceError::NotLeaf {
                name: device.name.clone(),
            }));
        }

        self.teardown(id, system, false)?;

        debug!("Destroying {}", self[id]);
        let name = self[id].name.clone();
        match self[id].kind {
            DeviceKind::Disk(_) | DeviceKind::DmRaid(_) | DeviceKind::Multipath(_) => {
                return Err(StorageError::new(DeviceError::InvalidConfiguration {
                    name,
                    reason: format!("a {} cannot be destroyed", self[id].type_name()),
                }));
            }
            DeviceKind::Partition(_) | DeviceKind::VolumeGroup(_) | DeviceKind::LogicalVolume(_) => {
                // The tools need the underlying devices in their original state.
                self.setup_parents(id, system, true)?;
            }
            _ => (),
        }
        let result = match self[id].kind {
            DeviceKind::Partition(_) => partition::destroy(self, id, system),
            DeviceKind::DeviceMapper { .. } | DeviceKind::DmLinear => {
                dm::linear_destroy(self, id, system)
            }
            DeviceKind::VolumeGroup(_) => lvm::vg_destroy(self, id, system),
            DeviceKind::LogicalVolume(_) => lvm::lv_destroy(self, id, system),
            DeviceKind::MdArray(_) => md::destroy(self, id, system),
            DeviceKind::File => system.remove_file(Path::new(&name)),
            _ => Ok(()),
        };
        result.step(DeviceError::Destroy { name })?;

        self[id].exists = false;
        Ok(())
    }

    /// Resizes `id` to its target size.
    pub fn resize(
        &mut self,
        id: DeviceId,
        system: &mut dyn BlockLayer,
        ui: Option<&dyn ProgressInterface>,
    ) -> Result<(), StorageError> {
        let device = &self[id];
        if !device.exists {
            return Err(StorageError::new(DeviceError::NotCreated {
                name: device.name.clone(),
            }));
        }
        if !self.resizable(id) {
            return Err(StorageError::new(DeviceError::NotResizable {
                name: self[id].name.clone(),
            }));
        }
        let target = self[id].target_size;
        if let Some(maximum) = self.max_size(id) {
            if target > maximum {
                return Err(StorageError::new(DeviceError::SizeConstraint {
                    name: self[id].name.clone(),
                    requested: target,
                    maximum,
                }));
            }
        }

        let name = self[id].name.clone();
        let window = ui.map(|ui| ui.wait_window("Resizing", &format!("Resizing device {name}")));
        debug!("Resizing {} to {target}", self[id]);
        let result = match self[id].kind {
            DeviceKind::Partition(_) => match self.setup_parents(id, system, true) {
                Ok(()) => partition::resize(self, id, system),
                Err(e) => Err(e.into()),
            },
            DeviceKind::LogicalVolume(_) => match self.teardown_formats(id, system) {
                Ok(()) => lvm::lv_resize(self, id, system),
                Err(e) => Err(e.into()),
            },
            _ => Ok(()),
        };
        if let Some(window) = window {
            window.pop();
        }
        result.step(DeviceError::Resize { name })?;

        // Partitions took their size from the disk geometry.
        if !matches!(self[id].kind, DeviceKind::Partition(_)) {
            self[id].current_size = target;
        }
        Ok(())
    }

    /// Prepares `id` for commit given every mount point in the tree.
    pub fn pre_commit_fixup(&mut self, id: DeviceId, mountpoints: &[PathBuf]) {
        if let DeviceKind::MdArray(_) = self[id].kind {
            md::pre_commit_fixup(self, id, mountpoints);
        }
    }

    /// Software the device, its format and all its parents need.
    pub fn packages(&self, id: DeviceId) -> Vec<String> {
        let device = &self[id];
        let mut packages: Vec<String> = Vec::new();
        let own = match device.kind {
            DeviceKind::Disk(ref disk) => disk.packages(),
            DeviceKind::Luks => vec!["cryptsetup-luks"],
            DeviceKind::VolumeGroup(_) | DeviceKind::LogicalVolume(_) => vec!["lvm2"],
            DeviceKind::MdArray(_) => vec!["mdadm"],
            DeviceKind::DmRaid(_) => vec!["dmraid"],
            DeviceKind::Multipath(_) => vec!["device-mapper-multipath"],
            DeviceKind::Nfs(_) => vec!["dracut-network"],
            _ => vec![],
        };
        let inherited = device
            .parents
            .iter()
            .flat_map(|parent| self.packages(*parent));
        for package in own
            .into_iter()
            .chain(device.format.packages())
            .map(String::from)
            .chain(inherited)
        {
            if !packages.contains(&package) {
                packages.push(package);
            }
        }
        packages
    }

    /// Services the device and all its parents need.
    pub fn services(&self, id: DeviceId) -> Vec<String> {
        let device = &self[id];
        let mut services: Vec<String> = Vec::new();
        let own = match device.kind {
            DeviceKind::Multipath(_) => vec!["multipathd".to_string()],
            _ => vec![],
        };
        let inherited = device
            .parents
            .iter()
            .flat_map(|parent| self.services(*parent));
        for service in own.into_iter().chain(inherited) {
            if !services.contains(&service) {
                services.push(service);
            }
        }
        services
    }

    /// Kernel command line arguments needed to bring `id` up at boot.
    pub fn dracut_setup_args(&self, id: DeviceId) -> Vec<String> {
        let device = &self[id];
        match device.kind {
            DeviceKind::Disk(ref disk) => disk.dracut_setup_args(),
            DeviceKind::Luks => device
                .parents
                .first()
                .and_then(|slave| self[*slave].format.uuid.as_deref())
                .map(|uuid| vec![format!("rd_LUKS_UUID=luks-{uuid}")])
                .unwrap_or_default(),
            DeviceKind::LogicalVolume(ref lv) => device
                .parents
                .first()
                .map(|vg| vec![format!("rd_LVM_LV={}/{}", self[*vg].name, lv.lv_name)])
                .unwrap_or_default(),
            DeviceKind::MdArray(_) => device
                .uuid
                .as_deref()
                .map(|uuid| vec![format!("rd_MD_UUID={uuid}")])
                .unwrap_or_default(),
            DeviceKind::DmRaid(_) => vec![format!("rd_DM_UUID={}", device.name)],
            _ => vec![],
        }
    }

    /// The spec identifying `id` in fstab.
    pub fn fstab_spec(&self, id: DeviceId) -> String {
        if let Some(spec) = partition::dasd_by_path(self, id) {
            return spec;
        }
        match self[id].format.uuid {
            Some(ref uuid) => format!("UUID={uuid}"),
            None => self.path(id).display().to_string(),
        }
    }

    /// Ejects the media of an optical drive.
    pub fn eject(&mut self, id: DeviceId, system: &mut dyn BlockLayer) -> Result<(), StorageError> {
        if !self[id].exists {
            return Err(StorageError::new(DeviceError::NotCreated {
                name: self[id].name.clone(),
            }));
        }
        self.teardown(id, system, false)?;
        let path = self.path(id);
        system.eject(&path).structured(DeviceError::Teardown {
            name: self[id].name.clone(),
        })
    }

    /// One-line summary of `id` for listings.
    pub fn describe(&self, id: DeviceId) -> String {
        let device = &self[id];
        let parents: Vec<&str> = device
            .parents
            .iter()
            .map(|parent| self[*parent].name.as_str())
            .collect();
        format!(
            "{device} size {} format {}{} exists {} parents [{}]",
            self.size(id),
            device.format.display_name(),
            device
                .format
                .mountpoint
                .as_ref()
                .map(|mp| format!(" on {}", mp.display()))
                .unwrap_or_default(),
            device.exists,
            parents.join(", ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use devgraph_api::descriptor::{DasdInfo, Transport};

    use crate::{formats::Format, system::simulated::SimulatedSystem};

    fn existing_disk(devices: &mut Devices, name: &str, mib: u64) -> DeviceId {
        let id = devices.add(name, DeviceKind::Disk(DiskInfo::default()));
        devices[id].exists = true;
        devices[id].target_size = Size::from_mib(mib);
        devices[id].current_size = Size::from_mib(mib);
        id
    }

    #[test]
    fn test_ids_are_monotonic() {
        let mut devices = Devices::new();
        let a = devices.add("sda", DeviceKind::Disk(DiskInfo::default()));
        let b = devices.add("sdb", DeviceKind::Disk(DiskInfo::default()));
        assert!(a < b);
        assert_eq!(devices[b].to_string(), "disk sdb (id 1)");
        assert_eq!(devices.path(a), PathBuf::from("/dev/sda"));
    }

    #[test]
    fn test_destroy_preconditions() {
        let mut system = SimulatedSystem::default();
        let mut devices = Devices::new();
        let disk = existing_disk(&mut devices, "sda", 1000);
        let file = devices.add("/var/tmp/image", DeviceKind::File);

        let e = devices.destroy(file, &mut system).unwrap_err();
        assert!(matches!(e.kind(), devgraph_api::error::ErrorKind::Device(DeviceError::NotCreated { .. })));

        devices[disk].kids = 1;
        let e = devices.destroy(disk, &mut system).unwrap_err();
        assert!(matches!(e.kind(), devgraph_api::error::ErrorKind::Device(DeviceError::NotLeaf { .. })));

        devices[disk].kids = 0;
        let e = devices.destroy(disk, &mut system).unwrap_err();
        assert!(matches!(
            e.kind(),
            devgraph_api::error::ErrorKind::Device(DeviceError::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn test_create_preconditions() {
        let mut system = SimulatedSystem::default();
        let mut devices = Devices::new();
        let disk = existing_disk(&mut devices, "sda", 1000);
        let e = devices.create(disk, &mut system, None).unwrap_err();
        assert!(matches!(
            e.kind(),
            devgraph_api::error::ErrorKind::Device(DeviceError::AlreadyExists { .. })
        ));

        let file = devices.add("/var/tmp/image", DeviceKind::File);
        devices[file].target_size = Size::from_mib(10);
        assert!(devices.teardown(file, &mut system, false).is_err());
        devices.teardown(file, &mut system, true).unwrap();

        devices.create(file, &mut system, None).unwrap();
        assert!(devices[file].exists);
        assert!(devices.status(file, &system));
        assert_eq!(system.calls(), &["create_file /var/tmp/image 10485760"]);
    }

    #[test]
    fn test_setup_is_idempotent() {
        let mut system = SimulatedSystem::default();
        let mut devices = Devices::new();
        let file = devices.add("/var/tmp/disk.img", DeviceKind::File);
        devices[file].target_size = Size::from_mib(100);
        devices.create(file, &mut system, None).unwrap();

        let lo = devices.add_with_parents("tmploop1", DeviceKind::Loop(LoopInfo::default()), vec![file]);
        devices[lo].exists = true;
        devices.setup(lo, &mut system, false).unwrap();
        let status = devices.status(lo, &system);
        assert!(status);
        assert_eq!(devices[lo].name, "loop0");

        devices.setup(lo, &mut system, false).unwrap();
        assert_eq!(devices.status(lo, &system), status);
        assert_eq!(
            system
                .calls()
                .iter()
                .filter(|call| call.starts_with("loop_attach"))
                .count(),
            1
        );

        devices.teardown(lo, &mut system, false).unwrap();
        assert_eq!(devices[lo].name, format!("tmploop{}", lo));
        assert!(!devices.status(lo, &system));
    }

    #[test]
    fn test_depends_on() {
        let mut devices = Devices::new();
        let disk = existing_disk(&mut devices, "sda", 1000);
        let extended = devices.add_with_parents(
            "sda4",
            DeviceKind::Partition(PartitionInfo::extended(4)),
            vec![disk],
        );
        let logical = devices.add_with_parents(
            "sda5",
            DeviceKind::Partition(PartitionInfo::logical(5)),
            vec![disk],
        );
        let luks = devices.add_with_parents("luks-sda5", DeviceKind::Luks, vec![logical]);

        assert!(devices.depends_on(logical, disk));
        assert!(devices.depends_on(logical, extended));
        assert!(devices.depends_on(luks, extended));
        assert!(!devices.depends_on(extended, logical));
        assert!(!devices.depends_on(disk, luks));
        assert_eq!(devices.ancestors(luks), vec![logical, disk]);
    }

    #[test]
    fn test_luks_size_reservation() {
        let mut devices = Devices::new();
        let disk = existing_disk(&mut devices, "sda", 1000);
        let part = devices.add_with_parents(
            "sda1",
            DeviceKind::Partition(PartitionInfo::primary(1)),
            vec![disk],
        );
        devices[part].target_size = Size::from_mib(500);
        let luks = devices.add_with_parents("luks-sda1", DeviceKind::Luks, vec![part]);
        assert_eq!(devices.size(luks), Size::from_mib(498));
    }

    #[test]
    fn test_size_constraints() {
        let mut devices = Devices::new();
        let disk = existing_disk(&mut devices, "sda", 1000);
        let part = devices.add_with_parents(
            "sda1",
            DeviceKind::Partition(PartitionInfo::primary(1)),
            vec![disk],
        );
        devices[part].format = Format::new(crate::formats::FormatKind::Efi);
        devices.set_size(part, Size::from_mib(200)).unwrap();
        assert_eq!(devices.size(part), Size::from_mib(200));

        let e = devices.set_size(part, Size::from_mib(300)).unwrap_err();
        assert!(matches!(
            e.kind(),
            devgraph_api::error::ErrorKind::Device(DeviceError::SizeConstraint { .. })
        ));

        devices[part].format = Format::default();
        assert!(devices.set_size(part, Size::from_mib(1001)).is_err());

        let e = devices.set_size(disk, Size::from_mib(10)).unwrap_err();
        assert!(matches!(
            e.kind(),
            devgraph_api::error::ErrorKind::Device(DeviceError::NotResizable { .. })
        ));
    }

    #[test]
    fn test_resizable() {
        let mut devices = Devices::new();
        let disk = existing_disk(&mut devices, "sda", 1000);
        let part = devices.add_with_parents(
            "sda1",
            DeviceKind::Partition(PartitionInfo::primary(1)),
            vec![disk],
        );
        assert!(!devices.resizable(part));
        devices[part].exists = true;
        assert!(devices.resizable(part));
        devices[part].format = Format::filesystem("xfs").existing();
        assert!(!devices.resizable(part));
        devices[part].format = Format::filesystem("ext4").existing();
        assert!(devices.resizable(part));

        devices[disk].kind = DeviceKind::Disk(DiskInfo {
            transport: Transport::Dasd(DasdInfo {
                bus_id: "0.0.0201".into(),
                opts: vec![],
            }),
        });
        assert!(!devices.resizable(part));
        assert!(!devices.resizable(disk));
    }

    #[test]
    fn test_packages_and_services() {
        let mut devices = Devices::new();
        let a = existing_disk(&mut devices, "sda", 1000);
        let b = existing_disk(&mut devices, "sdb", 1000);
        let mpath = devices.add_with_parents(
            "mpatha",
            DeviceKind::Multipath(MultipathInfo::new("3600a0b80000")),
            vec![a, b],
        );
        devices[a].format = Format::new(crate::formats::FormatKind::MultipathMember {
            alias: Some("mpatha".into()),
        });
        devices[b].format = devices[a].format.clone();
        devices[mpath].format = Format::lvmpv();

        assert_eq!(
            devices.packages(mpath),
            vec!["device-mapper-multipath", "lvm2"]
        );
        assert_eq!(devices.services(mpath), vec!["multipathd"]);
    }

    #[test]
    fn test_fstab_spec() {
        let mut devices = Devices::new();
        let disk = existing_disk(&mut devices, "sda", 1000);
        assert_eq!(devices.fstab_spec(disk), "/dev/sda");
        devices[disk].format = Format::filesystem("ext4").existing();
        devices[disk].format.uuid = Some("1234".into());
        assert_eq!(devices.fstab_spec(disk), "UUID=1234");
    }
}
