//! Descriptor builders and tree constructors shared by unit tests.

use devgraph_api::{
    config::ScanConfig,
    constants::LVM_PE_SIZE,
    descriptor::{
        DescriptorKind, DeviceDescriptor, DmInfo, DmTarget, LvInfo, LvmPvProbe, PartitionInfo,
    },
    Size,
};

use crate::{
    devices::partition::partition_name,
    devicetree::DeviceTree,
    interface::{BatchPolicy, Policy},
    system::simulated::SimulatedSystem,
};

pub(crate) fn disk(name: &str, size: Size) -> DeviceDescriptor {
    DeviceDescriptor {
        name: name.into(),
        kind: DescriptorKind::Disk,
        sysfs_path: Some(format!("/devices/pci0000:00/block/{name}")),
        size: Some(size),
        media_present: true,
        ..Default::default()
    }
}

pub(crate) fn partition(disk: &str, number: u32, size: Size) -> DeviceDescriptor {
    let name = partition_name(disk, number);
    DeviceDescriptor {
        sysfs_path: Some(format!("/devices/pci0000:00/block/{disk}/{name}")),
        kind: DescriptorKind::Partition,
        partition: Some(PartitionInfo {
            disk: disk.into(),
            number,
            bootable: false,
            extended: false,
        }),
        ..self::disk(&name, size)
    }
}

/// A device-mapper node `name` mapped as `map` on top of `slaves`.
pub(crate) fn dm(name: &str, map: &str, target: DmTarget, slaves: &[&str]) -> DeviceDescriptor {
    DeviceDescriptor {
        name: name.into(),
        kind: DescriptorKind::Dm,
        sysfs_path: Some(format!("/devices/virtual/block/{name}")),
        slaves: slaves.iter().map(|slave| slave.to_string()).collect(),
        dm: Some(DmInfo {
            name: map.into(),
            target,
            ..Default::default()
        }),
        media_present: true,
        ..Default::default()
    }
}

pub(crate) fn formatted(mut desc: DeviceDescriptor, fs_type: &str) -> DeviceDescriptor {
    desc.format.fs_type = Some(fs_type.into());
    desc
}

pub(crate) fn lv(name: &str, size: Size, attr: &str) -> LvInfo {
    LvInfo {
        name: name.into(),
        uuid: Some(format!("{name}-uuid")),
        size,
        attr: attr.into(),
        origin: None,
    }
}

/// Turns `desc` into a physical volume of a group made of `pv_count`
/// volumes.
pub(crate) fn lvm_pv(
    desc: DeviceDescriptor,
    vg_name: &str,
    vg_uuid: &str,
    pv_count: u32,
    lvs: Vec<LvInfo>,
) -> DeviceDescriptor {
    let size = desc.size.unwrap_or_default();
    let mut desc = formatted(desc, "LVM2_member");
    desc.format.lvm = Some(LvmPvProbe {
        vg_name: vg_name.into(),
        vg_uuid: vg_uuid.into(),
        vg_size: size,
        pe_size: Some(LVM_PE_SIZE),
        pv_count,
        pe_start: Size::from_mib(1),
        lvs,
        ..Default::default()
    });
    desc
}

pub(crate) fn tree_with(
    descriptors: Vec<DeviceDescriptor>,
    config: ScanConfig,
    policy: Box<dyn Policy>,
) -> DeviceTree<SimulatedSystem> {
    DeviceTree::new(SimulatedSystem::new(descriptors), config, policy)
}

/// Populates a tree that answers no to every question.
pub(crate) fn populated_tree(descriptors: Vec<DeviceDescriptor>) -> DeviceTree<SimulatedSystem> {
    let mut tree = tree_with(
        descriptors,
        ScanConfig::default(),
        Box::new(BatchPolicy::cleanup()),
    );
    tree.populate(false).unwrap();
    tree
}
