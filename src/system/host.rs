use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Error};
use log::{debug, trace, warn};

use devgraph_api::{
    constants::CONFIG_BACKUP_SUFFIX,
    descriptor::{
        format_types, DescriptorKind, DeviceDescriptor, DiskLabelType, DmInfo, DmTarget,
        FormatProbe, LoopInfo, LvInfo, LvmPvProbe, MdInfo, MdMemberProbe, PartitionInfo,
    },
    Size,
};
use osutils::{
    blockdev, cryptsetup, dmraid, dmsetup, files, losetup,
    lsblk::{self, BlockDevice},
    lvm::Lvm,
    mdadm, mkfs, mount, multipath, resize2fs,
    sfdisk::{self, NewPartition, SfDisk},
    swap, tune2fs, udevadm, wipefs,
};

use super::{BlockLayer, MapState, MdCreateRequest, MemberInfo, PartitionRequest, PartitionType};

const SYS_CLASS_BLOCK: &str = "/sys/class/block";
const DISK_LINK_DIRECTORIES: [&str; 4] = [
    "/dev/disk/by-id",
    "/dev/disk/by-path",
    "/dev/disk/by-uuid",
    "/dev/disk/by-label",
];
const SECTOR_SIZE: u64 = 512;

/// The running system, driven through the osutils wrappers.
#[derive(Debug, Default)]
pub struct HostSystem {
    lvm: Lvm,
}

impl HostSystem {
    pub fn new() -> Self {
        Self::default()
    }

    fn read_sysfs(kname: &str, attribute: &str) -> Option<String> {
        std::fs::read_to_string(Path::new(SYS_CLASS_BLOCK).join(kname).join(attribute))
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn sysfs_path(kname: &str) -> Option<String> {
        std::fs::canonicalize(Path::new(SYS_CLASS_BLOCK).join(kname))
            .ok()
            .and_then(|path| {
                path.strip_prefix("/sys")
                    .ok()
                    .map(|p| format!("/{}", p.display()))
            })
    }

    /// Maps kernel names to their `/dev/disk/by-*` links.
    fn disk_links() -> BTreeMap<String, Vec<String>> {
        let mut links: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for directory in DISK_LINK_DIRECTORIES {
            let Ok(entries) = std::fs::read_dir(directory) else {
                continue;
            };
            for entry in entries.flatten() {
                let link = entry.path();
                if let Some(kname) = std::fs::canonicalize(&link)
                    .ok()
                    .and_then(|target| target.file_name().map(|n| n.to_string_lossy().into_owned()))
                {
                    links
                        .entry(kname)
                        .or_default()
                        .push(link.to_string_lossy().into_owned());
                }
            }
        }
        links
    }

    fn lvm_probe(&self, path: &Path) -> Option<LvmPvProbe> {
        let info = match self.lvm.pv_info(path) {
            Ok(Some(info)) => info,
            Ok(None) => return None,
            Err(e) => {
                warn!("Failed to read PV metadata of '{}': {e:?}", path.display());
                return None;
            }
        };
        let lvs = self
            .lvm
            .lvs(&info.vg_name)
            .unwrap_or_else(|e| {
                warn!("Failed to list logical volumes of '{}': {e:?}", info.vg_name);
                Vec::new()
            })
            .into_iter()
            .map(|lv| LvInfo {
                name: lv.name,
                uuid: Some(lv.uuid),
                size: Size(lv.size),
                attr: lv.attr,
                origin: lv.origin,
            })
            .collect();

        Some(LvmPvProbe {
            vg_name: info.vg_name,
            vg_uuid: info.vg_uuid,
            vg_size: Size(info.vg_size),
            vg_free: Size(info.vg_free),
            pe_size: Some(Size(info.extent_size)),
            pe_count: info.extent_count,
            pe_free: info.free_extents,
            pv_count: info.pv_count,
            pe_start: Size(info.pe_start),
            lvs,
        })
    }

    fn md_probe(path: &Path) -> Option<MdMemberProbe> {
        match mdadm::examine(path) {
            Ok(MemberInfo {
                uuid: Some(uuid),
                level,
                devices,
                name,
            }) => Some(MdMemberProbe {
                uuid,
                level: level.unwrap_or_default(),
                devices: devices.unwrap_or_default(),
                name,
                device: None,
                spare: false,
            }),
            Ok(_) => None,
            Err(e) => {
                warn!("Failed to examine RAID member '{}': {e:?}", path.display());
                None
            }
        }
    }

    fn describe(
        &self,
        device: &BlockDevice,
        slaves: Vec<String>,
        context: &EnumerationContext,
    ) -> DeviceDescriptor {
        let kname = device.kname.as_str();
        let is_dm = kname.starts_with("dm-");
        let kind = match device.device_type.as_str() {
            _ if is_dm => DescriptorKind::Dm,
            "disk" => DescriptorKind::Disk,
            "part" => DescriptorKind::Partition,
            "loop" => DescriptorKind::Loop,
            "rom" => DescriptorKind::Cdrom,
            t if t.starts_with("raid") || t == "md" => DescriptorKind::Md,
            _ => DescriptorKind::Disk,
        };

        let dm = is_dm.then(|| {
            let target = match device.device_type.as_str() {
                "lvm" => DmTarget::Lvm,
                "crypt" => DmTarget::Crypt,
                "mpath" => DmTarget::Multipath,
                "dmraid" => DmTarget::Raid,
                "part" => DmTarget::Partition,
                "dm" => DmTarget::Linear,
                _ => DmTarget::Other,
            };
            DmInfo {
                name: device.name.clone(),
                uuid: Self::read_sysfs(kname, "dm/uuid"),
                target,
                suspended: Self::read_sysfs(kname, "dm/suspended").as_deref() == Some("1"),
            }
        });

        let md = (kind == DescriptorKind::Md).then(|| MdInfo {
            level: Self::read_sysfs(kname, "md/level").unwrap_or_default(),
            uuid: context.md_uuids.get(&format!("/dev/{kname}")).cloned(),
            name: None,
            devices: Self::read_sysfs(kname, "md/raid_disks")
                .and_then(|n| n.parse().ok())
                .unwrap_or_default(),
            container: None,
        });

        let partition = match (kind, &device.parent_kernel_name, device.partition_number) {
            (DescriptorKind::Partition, Some(disk), Some(number)) => Some(PartitionInfo {
                disk: disk.clone(),
                number,
                bootable: false,
                extended: false,
            }),
            _ => None,
        };

        let loop_device = (kind == DescriptorKind::Loop).then(|| LoopInfo {
            backing_file: Self::read_sysfs(kname, "loop/backing_file").map(PathBuf::from),
        });

        let path = PathBuf::from("/dev").join(kname);
        let mut format = FormatProbe {
            fs_type: device.fstype.clone(),
            uuid: device.uuid.clone(),
            label: device.label.clone(),
            version: device.fsver.clone(),
            ..Default::default()
        };
        if let Some(alias) = context.multipath_alias.get(kname) {
            format.fs_type = Some(format_types::MULTIPATH_MEMBER.into());
            format.multipath_alias = Some(alias.clone());
        }
        match format.fs_type.as_deref() {
            Some(format_types::LVM_PV) => format.lvm = self.lvm_probe(&path),
            Some(format_types::MD_MEMBER) | Some(format_types::ISW_MEMBER) => {
                format.md = Self::md_probe(&path)
            }
            _ => (),
        }
        format.raid_sets = context.raid_sets.get(&path).cloned().unwrap_or_default();

        let partition_table = match device.pttype.as_deref() {
            _ if kind == DescriptorKind::Partition => None,
            Some("gpt") => Some(DiskLabelType::Gpt),
            Some("dos") => Some(DiskLabelType::Msdos),
            Some("dasd") => Some(DiskLabelType::Dasd),
            Some("mac") => Some(DiskLabelType::Mac),
            _ => None,
        };

        let (major, minor) = device.numbers().unzip();
        DeviceDescriptor {
            name: kname.to_string(),
            kind,
            sysfs_path: Self::sysfs_path(kname),
            major,
            minor,
            size: Some(Size(device.size)),
            uuid: dm.as_ref().and_then(|dm| dm.uuid.clone()),
            serial: device.serial.clone(),
            vendor: device.vendor.as_ref().map(|v| v.trim().to_string()),
            model: device.model.as_ref().map(|m| m.trim().to_string()),
            bus: device.transport.clone(),
            symlinks: context.links.get(kname).cloned().unwrap_or_default(),
            slaves,
            dm,
            md,
            partition,
            loop_device,
            transport: Default::default(),
            partition_table,
            media_present: !(device.removable && device.size == 0),
            read_only: device.read_only,
            format,
        }
    }
}

/// System-wide facts gathered once per enumeration.
struct EnumerationContext {
    links: BTreeMap<String, Vec<String>>,
    multipath_alias: BTreeMap<String, String>,
    raid_sets: BTreeMap<PathBuf, Vec<String>>,
    md_uuids: BTreeMap<String, String>,
}

impl EnumerationContext {
    fn gather() -> Self {
        let multipath_alias = multipath::topology()
            .unwrap_or_else(|e| {
                warn!("Failed to read multipath topology: {e:?}");
                BTreeMap::new()
            })
            .into_iter()
            .flat_map(|(alias, members)| members.into_iter().map(move |m| (m, alias.clone())))
            .collect();

        let mut raid_sets: BTreeMap<PathBuf, Vec<String>> = BTreeMap::new();
        for member in dmraid::members().unwrap_or_else(|e| {
            warn!("Failed to list firmware RAID members: {e:?}");
            Vec::new()
        }) {
            raid_sets.entry(member.device).or_default().push(member.set);
        }

        let md_uuids = mdadm::details()
            .unwrap_or_default()
            .into_iter()
            .map(|detail| (detail.raid_path.to_string_lossy().into_owned(), detail.uuid))
            .collect();

        Self {
            links: HostSystem::disk_links(),
            multipath_alias,
            raid_sets,
            md_uuids,
        }
    }
}

impl BlockLayer for HostSystem {
    fn enumerate(&mut self) -> Result<Vec<DeviceDescriptor>, Error> {
        let context = EnumerationContext::gather();

        // lsblk lists a device once per parent
        let mut order: Vec<String> = Vec::new();
        let mut seen: BTreeMap<String, (BlockDevice, Vec<String>)> = BTreeMap::new();
        for device in lsblk::list().context("Failed to list block devices")? {
            let entry = seen.entry(device.kname.clone()).or_insert_with(|| {
                order.push(device.kname.clone());
                (device.clone(), Vec::new())
            });
            if let Some(parent) = device.parent_kernel_name.as_ref() {
                if !entry.1.contains(parent) && entry.0.device_type != "part" {
                    entry.1.push(parent.clone());
                }
            }
        }

        Ok(order
            .iter()
            .filter_map(|kname| seen.remove(kname))
            .map(|(device, slaves)| self.describe(&device, slaves, &context))
            .collect())
    }

    fn settle(&mut self) -> Result<(), Error> {
        udevadm::settle()
    }

    fn node_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn device_size(&self, path: &Path) -> Result<Size, Error> {
        blockdev::size(path).map(Size)
    }

    fn partition_size(&self, disk: &Path, number: u32) -> Result<Option<Size>, Error> {
        let disk_info = SfDisk::get_info(disk)?;
        Ok(disk_info
            .partition(number)
            .map(|p| Size(p.size_sectors * disk_info.sectorsize)))
    }

    fn eject(&mut self, path: &Path) -> Result<(), Error> {
        blockdev::eject(path)
    }

    fn create_disklabel(&mut self, disk: &Path, label: DiskLabelType) -> Result<(), Error> {
        let label = match label {
            DiskLabelType::Gpt => "gpt",
            DiskLabelType::Msdos => "dos",
            other => bail!("Cannot write {other} disklabel to '{}'", disk.display()),
        };
        sfdisk::create_label(disk, label)
    }

    fn add_partition(&mut self, disk: &Path, request: &PartitionRequest) -> Result<(), Error> {
        let partition_type = match (request.partition_type, request.type_id.as_deref()) {
            (PartitionType::Extended, _) => "E",
            (_, Some(type_id)) => type_id,
            _ => "L",
        };
        sfdisk::add_partition(
            disk,
            &NewPartition {
                number: request.number,
                start: None,
                size_sectors: request.size.bytes() / SECTOR_SIZE,
                partition_type,
                bootable: request.bootable,
            },
        )
    }

    fn remove_partition(&mut self, disk: &Path, number: u32) -> Result<(), Error> {
        sfdisk::delete_partition(disk, number)
    }

    fn resize_partition(&mut self, disk: &Path, number: u32, size: Size) -> Result<(), Error> {
        sfdisk::resize_partition(disk, number, size.bytes() / SECTOR_SIZE)
    }

    fn dm_state(&self, name: &str) -> Option<MapState> {
        dmsetup::state(name).unwrap_or_else(|e| {
            trace!("Failed to query map '{name}': {e:?}");
            None
        })
    }

    fn dm_create_linear(
        &mut self,
        name: &str,
        backing: &Path,
        size: Size,
        uuid: Option<&str>,
    ) -> Result<(), Error> {
        dmsetup::create_linear(name, backing, size.bytes() / SECTOR_SIZE, uuid)
    }

    fn dm_remove(&mut self, name: &str) -> Result<(), Error> {
        dmsetup::remove(name)
    }

    fn kpartx_add(&mut self, path: &Path) -> Result<(), Error> {
        dmsetup::kpartx_add(path)
    }

    fn kpartx_delete(&mut self, path: &Path) -> Result<(), Error> {
        dmsetup::kpartx_delete(path)
    }

    fn luks_format(&mut self, path: &Path, passphrase: &str) -> Result<(), Error> {
        cryptsetup::luks_format(path, passphrase)
    }

    fn luks_open(&mut self, path: &Path, map_name: &str, passphrase: &str) -> Result<(), Error> {
        cryptsetup::luks_open(path, map_name, passphrase)
    }

    fn luks_close(&mut self, map_name: &str) -> Result<(), Error> {
        cryptsetup::luks_close(map_name)
    }

    fn lvm_reject(&mut self, device_name: &str) {
        self.lvm.reject(device_name);
    }

    fn pv_create(&mut self, path: &Path) -> Result<(), Error> {
        self.lvm.pvcreate(path)
    }

    fn pv_remove(&mut self, path: &Path) -> Result<(), Error> {
        self.lvm.pvremove(path)
    }

    fn pv_free(&self, vg: &str) -> Result<Vec<(PathBuf, Size)>, Error> {
        Ok(self
            .lvm
            .pv_free(vg)?
            .into_iter()
            .map(|(pv, free)| (pv, Size(free)))
            .collect())
    }

    fn vg_create(&mut self, name: &str, pe_size: Size, pvs: &[PathBuf]) -> Result<(), Error> {
        self.lvm.vgcreate(name, pe_size.bytes() / 1024, pvs)
    }

    fn vg_remove(&mut self, name: &str) -> Result<(), Error> {
        self.lvm.vgremove(name)
    }

    fn vg_reduce_missing(&mut self, name: &str) -> Result<(), Error> {
        self.lvm.vgreduce_missing(name)
    }

    fn vg_activate(&mut self, name: &str, active: bool) -> Result<(), Error> {
        self.lvm.vgchange(name, active)
    }

    fn lv_create(&mut self, vg: &str, lv: &str, size: Size, pvs: &[PathBuf]) -> Result<(), Error> {
        self.lvm.lvcreate(vg, lv, size.bytes() / 1024, pvs)
    }

    fn lv_remove(&mut self, vg: &str, lv: &str) -> Result<(), Error> {
        self.lvm.lvremove(vg, lv)
    }

    fn lv_resize(&mut self, vg: &str, lv: &str, size: Size) -> Result<(), Error> {
        self.lvm.lvresize(vg, lv, size.bytes() / 1024)
    }

    fn lv_activate(&mut self, vg: &str, lv: &str, active: bool) -> Result<(), Error> {
        self.lvm.lvchange(vg, lv, active)
    }

    fn md_create(&mut self, path: &Path, request: &MdCreateRequest) -> Result<(), Error> {
        mdadm::create(
            path,
            &mdadm::CreateOptions {
                level: &request.level,
                members: &request.members,
                spares: request.spares,
                metadata: &request.metadata,
                bitmap: request.bitmap,
            },
        )
    }

    fn md_assemble(&mut self, path: &Path, uuid: &str, members: &[PathBuf]) -> Result<(), Error> {
        mdadm::assemble(path, uuid, members)
    }

    fn md_stop(&mut self, path: &Path) -> Result<(), Error> {
        mdadm::stop(path)
    }

    fn md_zero_superblock(&mut self, path: &Path) -> Result<(), Error> {
        mdadm::zero_superblock(path)
    }

    fn md_array_state(&self, name: &str) -> Option<String> {
        Self::read_sysfs(name, "md/array_state")
    }

    fn md_examine(&self, path: &Path) -> Result<MemberInfo, Error> {
        mdadm::examine(path)
    }

    fn loop_attach(&mut self, file: &Path) -> Result<String, Error> {
        losetup::attach(file)
    }

    fn loop_detach(&mut self, name: &str) -> Result<(), Error> {
        losetup::detach(name)
    }

    fn loop_for_file(&self, file: &Path) -> Option<String> {
        losetup::find(file).unwrap_or_else(|e| {
            debug!("Failed to look up loop device of '{}': {e:?}", file.display());
            None
        })
    }

    fn dmraid_activate(&mut self, set: &str) -> Result<(), Error> {
        dmraid::activate(set)
    }

    fn dmraid_deactivate(&mut self, set: &str) -> Result<(), Error> {
        dmraid::deactivate(set)
    }

    fn multipath_activate(&mut self, name: &str) -> Result<(), Error> {
        multipath::activate(name)
    }

    fn multipath_flush(&mut self, name: &str) -> Result<(), Error> {
        multipath::flush(name)
    }

    fn create_file(&mut self, path: &Path, size: Size) -> Result<(), Error> {
        files::create_zero_file(path, size.bytes())
    }

    fn remove_file(&mut self, path: &Path) -> Result<(), Error> {
        files::remove_file(path)
    }

    fn create_directory(&mut self, path: &Path) -> Result<(), Error> {
        files::create_dirs(path)
    }

    fn file_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn mkfs(
        &mut self,
        path: &Path,
        fs_type: &str,
        label: Option<&str>,
        options: &[String],
    ) -> Result<(), Error> {
        mkfs::run(path, fs_type, label, options)
    }

    fn mkswap(&mut self, path: &Path, label: Option<&str>) -> Result<(), Error> {
        swap::mkswap(path, label)
    }

    fn wipe(&mut self, path: &Path) -> Result<(), Error> {
        wipefs::all(path)
    }

    fn fs_resize(&mut self, path: &Path, fs_type: &str, size: Size) -> Result<(), Error> {
        match fs_type {
            "ext2" | "ext3" | "ext4" => resize2fs::run(path, size.bytes() / 1024),
            _ => bail!("Cannot resize {fs_type} filesystem on '{}'", path.display()),
        }
    }

    fn fs_migrate(&mut self, path: &Path, from: &str) -> Result<(), Error> {
        tune2fs::migrate(path, from)
    }

    fn mount(&mut self, path: &Path, mountpoint: &Path, fs_type: &str) -> Result<(), Error> {
        files::create_dirs(mountpoint)?;
        mount::mount(path, mountpoint, fs_type, &[])
    }

    fn umount(&mut self, path: &Path) -> Result<(), Error> {
        mount::umount(path)
    }

    fn is_mounted(&self, path: &Path) -> bool {
        mount::mount_points(path).is_ok_and(|points| !points.is_empty())
    }

    fn swapon(&mut self, path: &Path) -> Result<(), Error> {
        swap::swapon(path)
    }

    fn swapoff(&mut self, path: &Path) -> Result<(), Error> {
        swap::swapoff(path)
    }

    fn swap_active(&self, path: &Path) -> bool {
        swap::active().is_ok_and(|active| active.iter().any(|p| p == path))
    }

    fn write_config(&mut self, path: &Path, contents: &str) -> Result<(), Error> {
        files::write_file(path, 0o644, contents.as_bytes())
    }

    fn append_config(&mut self, path: &Path, contents: &str) -> Result<(), Error> {
        files::append_file(path, contents.as_bytes())
    }

    fn backup_config(&mut self, path: &Path) -> Result<bool, Error> {
        files::backup_file(path, CONFIG_BACKUP_SUFFIX)
    }

    fn restore_config(&mut self, path: &Path, backed_up: bool) -> Result<(), Error> {
        files::restore_file(path, CONFIG_BACKUP_SUFFIX, backed_up)
    }
}
