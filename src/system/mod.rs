//! The block layer: everything the engine asks of the running system.
//!
//! Devices and formats never run commands themselves. They go through a
//! [`BlockLayer`], which is implemented on top of the system tools by
//! [`host::HostSystem`] and in memory by [`simulated::SimulatedSystem`].

use std::path::{Path, PathBuf};

use anyhow::Error;

use devgraph_api::{
    descriptor::{DeviceDescriptor, DiskLabelType},
    Size,
};

pub mod host;
pub mod simulated;

pub use osutils::dmsetup::MapState;
pub use osutils::mdadm::MemberInfo;

/// How a partition sits in its disklabel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
pub enum PartitionType {
    #[default]
    Normal,
    Extended,
    Logical,
}

/// A partition to be added to a disklabel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionRequest {
    pub number: u32,
    pub size: Size,
    pub partition_type: PartitionType,
    pub bootable: bool,
    /// Partition type id understood by the label, e.g. `8e` for LVM.
    pub type_id: Option<String>,
}

/// Parameters of a new MD array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MdCreateRequest {
    pub level: String,
    pub members: Vec<PathBuf>,
    pub spares: usize,
    pub metadata: String,
    pub bitmap: bool,
}

pub trait BlockLayer {
    /// Lists the descriptors of every block device currently visible.
    fn enumerate(&mut self) -> Result<Vec<DeviceDescriptor>, Error>;

    /// Waits for device events to quiesce.
    fn settle(&mut self) -> Result<(), Error>;

    /// True when the device node exists and is writable.
    fn node_exists(&self, path: &Path) -> bool;

    fn device_size(&self, path: &Path) -> Result<Size, Error>;

    /// Size of partition `number` as recorded in the disklabel of `disk`.
    fn partition_size(&self, disk: &Path, number: u32) -> Result<Option<Size>, Error>;

    fn eject(&mut self, path: &Path) -> Result<(), Error>;

    // Disklabels
    fn create_disklabel(&mut self, disk: &Path, label: DiskLabelType) -> Result<(), Error>;
    fn add_partition(&mut self, disk: &Path, request: &PartitionRequest) -> Result<(), Error>;
    fn remove_partition(&mut self, disk: &Path, number: u32) -> Result<(), Error>;
    fn resize_partition(&mut self, disk: &Path, number: u32, size: Size) -> Result<(), Error>;

    // Device-mapper
    fn dm_state(&self, name: &str) -> Option<MapState>;
    fn dm_create_linear(
        &mut self,
        name: &str,
        backing: &Path,
        size: Size,
        uuid: Option<&str>,
    ) -> Result<(), Error>;
    fn dm_remove(&mut self, name: &str) -> Result<(), Error>;
    fn kpartx_add(&mut self, path: &Path) -> Result<(), Error>;
    fn kpartx_delete(&mut self, path: &Path) -> Result<(), Error>;

    // LUKS
    fn luks_format(&mut self, path: &Path, passphrase: &str) -> Result<(), Error>;
    fn luks_open(&mut self, path: &Path, map_name: &str, passphrase: &str) -> Result<(), Error>;
    fn luks_close(&mut self, map_name: &str) -> Result<(), Error>;

    // LVM
    /// Hides a device from every later LVM command.
    fn lvm_reject(&mut self, device_name: &str);
    fn pv_create(&mut self, path: &Path) -> Result<(), Error>;
    fn pv_remove(&mut self, path: &Path) -> Result<(), Error>;
    fn pv_free(&self, vg: &str) -> Result<Vec<(PathBuf, Size)>, Error>;
    fn vg_create(&mut self, name: &str, pe_size: Size, pvs: &[PathBuf]) -> Result<(), Error>;
    fn vg_remove(&mut self, name: &str) -> Result<(), Error>;
    fn vg_reduce_missing(&mut self, name: &str) -> Result<(), Error>;
    fn vg_activate(&mut self, name: &str, active: bool) -> Result<(), Error>;
    fn lv_create(&mut self, vg: &str, lv: &str, size: Size, pvs: &[PathBuf]) -> Result<(), Error>;
    fn lv_remove(&mut self, vg: &str, lv: &str) -> Result<(), Error>;
    fn lv_resize(&mut self, vg: &str, lv: &str, size: Size) -> Result<(), Error>;
    fn lv_activate(&mut self, vg: &str, lv: &str, active: bool) -> Result<(), Error>;

    // MD
    fn md_create(&mut self, path: &Path, request: &MdCreateRequest) -> Result<(), Error>;
    fn md_assemble(&mut self, path: &Path, uuid: &str, members: &[PathBuf]) -> Result<(), Error>;
    fn md_stop(&mut self, path: &Path) -> Result<(), Error>;
    fn md_zero_superblock(&mut self, path: &Path) -> Result<(), Error>;
    /// The `array_state` sysfs attribute, None when the array is not
    /// assembled.
    fn md_array_state(&self, name: &str) -> Option<String>;
    fn md_examine(&self, path: &Path) -> Result<MemberInfo, Error>;

    // Loop
    /// Returns the kernel name of the new loop device.
    fn loop_attach(&mut self, file: &Path) -> Result<String, Error>;
    fn loop_detach(&mut self, name: &str) -> Result<(), Error>;
    fn loop_for_file(&self, file: &Path) -> Option<String>;

    // Firmware RAID and multipath
    fn dmraid_activate(&mut self, set: &str) -> Result<(), Error>;
    fn dmraid_deactivate(&mut self, set: &str) -> Result<(), Error>;
    fn multipath_activate(&mut self, name: &str) -> Result<(), Error>;
    fn multipath_flush(&mut self, name: &str) -> Result<(), Error>;

    // Files
    fn create_file(&mut self, path: &Path, size: Size) -> Result<(), Error>;
    fn remove_file(&mut self, path: &Path) -> Result<(), Error>;
    fn create_directory(&mut self, path: &Path) -> Result<(), Error>;
    fn file_exists(&self, path: &Path) -> bool;

    // Formats
    fn mkfs(
        &mut self,
        path: &Path,
        fs_type: &str,
        label: Option<&str>,
        options: &[String],
    ) -> Result<(), Error>;
    fn mkswap(&mut self, path: &Path, label: Option<&str>) -> Result<(), Error>;
    fn wipe(&mut self, path: &Path) -> Result<(), Error>;
    fn fs_resize(&mut self, path: &Path, fs_type: &str, size: Size) -> Result<(), Error>;
    fn fs_migrate(&mut self, path: &Path, from: &str) -> Result<(), Error>;
    fn mount(&mut self, path: &Path, mountpoint: &Path, fs_type: &str) -> Result<(), Error>;
    fn umount(&mut self, path: &Path) -> Result<(), Error>;
    fn is_mounted(&self, path: &Path) -> bool;
    fn swapon(&mut self, path: &Path) -> Result<(), Error>;
    fn swapoff(&mut self, path: &Path) -> Result<(), Error>;
    fn swap_active(&self, path: &Path) -> bool;

    // Configuration files
    fn write_config(&mut self, path: &Path, contents: &str) -> Result<(), Error>;
    fn append_config(&mut self, path: &Path, contents: &str) -> Result<(), Error>;
    /// Returns whether a backup was taken.
    fn backup_config(&mut self, path: &Path) -> Result<bool, Error>;
    fn restore_config(&mut self, path: &Path, backed_up: bool) -> Result<(), Error>;
}
